// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection string parsing.
//!
//! A connection string is a `;`-separated list of `key=value` pairs. Keys are case-insensitive
//! and the last occurrence of a key wins:
//!
//! ```text
//! Endpoint=tcp://localhost:33500;Account=myaccount;Namespace=myns;TimeoutMilliseconds=5000
//! ```
//!
//! Parsing only validates the shape of the string. Values that are derived from it (protocol,
//! host, port, timeout, ...) are validated when they are read, so a string with an unknown
//! endpoint scheme still parses and only fails once the protocol is requested.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::ConfigError;

pub const KEY_ENDPOINT: &str = "Endpoint";
pub const KEY_ETW_SESSION: &str = "EtwSession";
pub const KEY_USER_EVENTS_TRACEPOINT: &str = "UserEventsTracepoint";
pub const KEY_ACCOUNT: &str = "Account";
pub const KEY_NAMESPACE: &str = "Namespace";
pub const KEY_TIMEOUT_MILLISECONDS: &str = "TimeoutMilliseconds";

/// Preview flag that enables writing the correlation id carried by log records.
pub const PREVIEW_CORRELATION_ID_ENRICHMENT: &str = "PrivatePreviewEnableAFDCorrelationIdEnrichment";

const PREVIEW_PREFIX: &str = "privatepreview";

pub const DEFAULT_TIMEOUT_MILLISECONDS: u64 = 60_000;

/// Transport protocol selected by a connection string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Protocol {
    #[display("tcp")]
    Tcp,
    #[display("udp")]
    Udp,
    #[display("unix domain socket")]
    UnixDomainSocket,
    #[display("etw")]
    Etw,
    #[display("user_events")]
    UserEvents,
    /// No transport key was given; only valid for the metrics path where the transport is
    /// picked per platform.
    #[display("unspecified")]
    Unspecified,
}

#[allow(clippy::expect_used)]
fn key_pattern() -> &'static Regex {
    static KEY: OnceLock<Regex> = OnceLock::new();
    KEY.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("valid key regex"))
}

#[allow(clippy::expect_used)]
fn socket_endpoint_pattern() -> &'static Regex {
    static ENDPOINT: OnceLock<Regex> = OnceLock::new();
    ENDPOINT.get_or_init(|| {
        Regex::new(r"^(?i:tcp|udp)://(?P<host>\[[^\]]*\]|[^:/\[\]]*)(?::(?P<port>[^/]*))?/?$")
            .expect("valid endpoint regex")
    })
}

/// Parsed connection string.
///
/// The only mutable part is the timeout, which can be overridden after parsing with
/// [`ConnectionConfig::set_timeout_milliseconds`].
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Values keyed by lowercased key.
    values: HashMap<String, String>,
    timeout_override: Option<u64>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("ConnectionConfig")
            .field("keys", &keys)
            .field("timeout_override", &self.timeout_override)
            .finish()
    }
}

impl ConnectionConfig {
    /// Parses a connection string.
    ///
    /// # Errors
    ///
    /// Fails when the string is empty, a pair has no `=`, a key is empty or malformed, or more
    /// than one transport key (`Endpoint`, `EtwSession`, `UserEventsTracepoint`) is present.
    pub fn parse(connection_string: &str) -> Result<Self, ConfigError> {
        if connection_string.trim().is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut values = HashMap::new();
        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let Some((key, value)) = pair.split_once('=') else {
                return Err(ConfigError::MissingSeparator(pair.to_string()));
            };

            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::EmptyKey);
            }
            if !key_pattern().is_match(key) {
                return Err(ConfigError::MalformedKey(key.to_string()));
            }

            values.insert(key.to_ascii_lowercase(), value.trim().to_string());
        }

        let config = Self {
            values,
            timeout_override: None,
        };

        let transports: Vec<&str> = [KEY_ENDPOINT, KEY_ETW_SESSION, KEY_USER_EVENTS_TRACEPOINT]
            .into_iter()
            .filter(|key| config.get(key).is_some())
            .collect();
        if transports.len() > 1 {
            return Err(ConfigError::ConflictingTransports(transports.join(", ")));
        }

        Ok(config)
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn require(&self, key: &'static str) -> Result<&str, ConfigError> {
        self.get(key)
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingKey(key))
    }

    /// Raw `Endpoint` value, if present.
    pub fn endpoint(&self) -> Option<&str> {
        self.get(KEY_ENDPOINT)
    }

    pub fn etw_session(&self) -> Option<&str> {
        self.get(KEY_ETW_SESSION)
    }

    pub fn user_events_tracepoint(&self) -> Option<&str> {
        self.get(KEY_USER_EVENTS_TRACEPOINT)
    }

    /// Transport protocol derived from the transport keys.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint uses a scheme other than `tcp://`, `udp://`, or `unix:`.
    pub fn protocol(&self) -> Result<Protocol, ConfigError> {
        if let Some(endpoint) = self.endpoint() {
            let lower = endpoint.to_ascii_lowercase();
            return if lower.starts_with("tcp://") {
                Ok(Protocol::Tcp)
            } else if lower.starts_with("udp://") {
                Ok(Protocol::Udp)
            } else if lower.starts_with("unix:") {
                Ok(Protocol::UnixDomainSocket)
            } else {
                Err(ConfigError::UnsupportedScheme(endpoint.to_string()))
            };
        }

        if self.etw_session().is_some() {
            Ok(Protocol::Etw)
        } else if self.user_events_tracepoint().is_some() {
            Ok(Protocol::UserEvents)
        } else {
            Ok(Protocol::Unspecified)
        }
    }

    fn socket_endpoint(&self) -> Result<(&str, Option<&str>), ConfigError> {
        let protocol = self.protocol()?;
        if !matches!(protocol, Protocol::Tcp | Protocol::Udp) {
            return Err(ConfigError::NotApplicable(protocol, "host and port"));
        }

        // protocol() only returns Tcp/Udp when an endpoint is present
        let endpoint = self.endpoint().unwrap_or_default();
        let captures = socket_endpoint_pattern()
            .captures(endpoint)
            .ok_or_else(|| ConfigError::MissingHost(endpoint.to_string()))?;

        let host = captures
            .name("host")
            .map(|m| m.as_str().trim_start_matches('[').trim_end_matches(']'))
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::MissingHost(endpoint.to_string()))?;
        let port = captures.name("port").map(|m| m.as_str());

        Ok((host, port))
    }

    /// Host of a `tcp://` or `udp://` endpoint.
    ///
    /// # Errors
    ///
    /// Fails when the endpoint has no host or the protocol has no host.
    pub fn host(&self) -> Result<&str, ConfigError> {
        self.socket_endpoint().map(|(host, _)| host)
    }

    /// Port of a `tcp://` or `udp://` endpoint.
    ///
    /// # Errors
    ///
    /// Fails when the port is missing, zero, or not a number, or the protocol has no port.
    pub fn port(&self) -> Result<u16, ConfigError> {
        let (_, port) = self.socket_endpoint()?;
        port.and_then(|port| port.parse::<u16>().ok())
            .filter(|port| *port != 0)
            .ok_or_else(|| ConfigError::InvalidPort(self.endpoint().unwrap_or_default().into()))
    }

    /// Filesystem path of a `unix:` endpoint, with the `unix://` or `unix:` prefix removed.
    ///
    /// # Errors
    ///
    /// Fails when the protocol is not a Unix domain socket or the path is empty.
    pub fn unix_path(&self) -> Result<&str, ConfigError> {
        let protocol = self.protocol()?;
        if protocol != Protocol::UnixDomainSocket {
            return Err(ConfigError::NotApplicable(protocol, "unix socket path"));
        }

        let endpoint = self.endpoint().unwrap_or_default();
        // "unix:" and "unix://" are both accepted, the scheme check above is case-insensitive
        let rest = &endpoint["unix:".len()..];
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if path.is_empty() {
            return Err(ConfigError::EmptyUnixPath);
        }
        Ok(path)
    }

    /// Metrics account.
    ///
    /// # Errors
    ///
    /// Fails when `Account` is absent or empty.
    pub fn account(&self) -> Result<&str, ConfigError> {
        self.require(KEY_ACCOUNT)
    }

    /// Metrics namespace.
    ///
    /// # Errors
    ///
    /// Fails when `Namespace` is absent or empty.
    pub fn namespace(&self) -> Result<&str, ConfigError> {
        self.require(KEY_NAMESPACE)
    }

    /// Timeout in milliseconds, defaulting to 60 seconds.
    ///
    /// # Errors
    ///
    /// Fails when `TimeoutMilliseconds` is not a positive integer.
    pub fn timeout_milliseconds(&self) -> Result<u64, ConfigError> {
        if let Some(timeout) = self.timeout_override {
            return Ok(timeout);
        }

        match self.get(KEY_TIMEOUT_MILLISECONDS) {
            None => Ok(DEFAULT_TIMEOUT_MILLISECONDS),
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|timeout| *timeout > 0)
                .ok_or_else(|| ConfigError::InvalidTimeout(raw.to_string())),
        }
    }

    /// Timeout as a [`Duration`].
    ///
    /// # Errors
    ///
    /// See [`ConnectionConfig::timeout_milliseconds`].
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        self.timeout_milliseconds().map(Duration::from_millis)
    }

    /// Overrides the timeout.
    ///
    /// # Errors
    ///
    /// Fails when `milliseconds` is zero.
    pub fn set_timeout_milliseconds(&mut self, milliseconds: u64) -> Result<(), ConfigError> {
        if milliseconds == 0 {
            return Err(ConfigError::InvalidTimeout(milliseconds.to_string()));
        }
        self.timeout_override = Some(milliseconds);
        Ok(())
    }

    /// Reads a `PrivatePreview*` flag. Anything other than a case-insensitive `true` is false.
    pub fn preview_flag(&self, name: &str) -> bool {
        if !name.to_ascii_lowercase().starts_with(PREVIEW_PREFIX) {
            return false;
        }
        self.get(name)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }
}

impl FromStr for ConnectionConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
