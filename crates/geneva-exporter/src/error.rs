// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for configuration, transport, and serialization.

use std::io;

/// Errors produced while parsing or reading a connection string.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Connection string must not be empty")]
    Empty,

    #[error("Connection string pair '{0}' is missing '='")]
    MissingSeparator(String),

    #[error("Connection string contains an empty key")]
    EmptyKey,

    #[error("Connection string key '{0}' is malformed")]
    MalformedKey(String),

    #[error("Connection string specifies conflicting transports: {0}")]
    ConflictingTransports(String),

    #[error("Endpoint '{0}' uses an unsupported scheme")]
    UnsupportedScheme(String),

    #[error("Endpoint '{0}' has no host")]
    MissingHost(String),

    #[error("Endpoint '{0}' has no valid port")]
    InvalidPort(String),

    #[error("Protocol {0} does not carry a {1}")]
    NotApplicable(crate::config::Protocol, &'static str),

    #[error("Connection string is missing '{0}'")]
    MissingKey(&'static str),

    #[error("TimeoutMilliseconds must be a positive integer, got '{0}'")]
    InvalidTimeout(String),

    #[error("Unix domain socket path must not be empty")]
    EmptyUnixPath,

    #[error("Invalid options: {0}")]
    InvalidOptions(String),
}

/// Errors produced by a transport while delivering a payload.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write to {target}: {source}")]
    Write {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Payload of {size} bytes exceeds transport limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Transport is not supported on this platform: {0}")]
    Unsupported(String),

    #[error("Event emission failed: {0}")]
    Emit(String),
}

impl TransportError {
    /// Returns true when the failure came from socket I/O and the session was reset.
    #[must_use]
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Write { .. })
    }
}

/// Errors produced while encoding a record.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("MessagePack encoding failed: {0}")]
    Encode(#[from] rmp::encode::ValueWriteError),

    #[error("I/O error while encoding: {0}")]
    Io(#[from] io::Error),

    #[error("Hex encoding failed: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope has {0} top-level fields, more than a map16 header can carry")]
    TooManyFields(usize),

    #[error("Serialized payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Metric has {0} dimensions, more than the supported maximum")]
    TooManyDimensions(usize),

    #[error("Field '{0}' is longer than a u16 length prefix allows")]
    FieldTooLong(&'static str),
}

/// Umbrella error returned by exporters.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::MissingKey("Account");
        assert_eq!(error.to_string(), "Connection string is missing 'Account'");

        let error = ConfigError::InvalidTimeout("abc".to_string());
        assert_eq!(
            error.to_string(),
            "TimeoutMilliseconds must be a positive integer, got 'abc'"
        );
    }

    #[test]
    fn test_transport_error_source_is_preserved() {
        use std::error::Error;

        let error = TransportError::Write {
            target: "tcp://127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(error.is_io());
        assert!(error.source().is_some());
        assert!(!TransportError::Unsupported("etw".into()).is_io());
    }

    #[test]
    fn test_export_error_wraps_variants() {
        let error: ExportError = ConfigError::EmptyKey.into();
        assert!(matches!(error, ExportError::Config(ConfigError::EmptyKey)));

        let error: ExportError = SerializeError::TooManyDimensions(200).into();
        assert_eq!(
            error.to_string(),
            "Metric has 200 dimensions, more than the supported maximum"
        );
    }
}
