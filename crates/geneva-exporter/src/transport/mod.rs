// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Byte transports to the local agent.
//!
//! Every transport implements [`Transport`]; [`open`] picks one from a parsed connection
//! string. Stream transports (TCP, Unix domain sockets) connect on demand and reconnect on the
//! next send after a failure. The OS-native transports (ETW, user_events) have no connection
//! and fail at construction on platforms that lack them.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ConnectionConfig, Protocol, KEY_ENDPOINT};
use crate::error::{ConfigError, ExportError, TransportError};

pub mod datagram;
pub mod etw;
pub mod stream;
pub mod user_events;

pub use datagram::DatagramTransport;
pub use etw::EtwTransport;
pub use stream::{SessionState, StreamTransport};
pub use user_events::UserEventsTransport;

/// Unix socket the metrics agent listens on when the connection string names no transport.
pub const DEFAULT_METRICS_SOCKET_PATH: &str = "/var/etw/mdm_ifx.socket";

/// ETW provider receiving metrics when the connection string names no transport.
pub const DEFAULT_METRICS_ETW_PROVIDER: &str = "Microsoft.Geneva.Metrics";

/// Delivers serialized payloads.
///
/// Implementations are shared between producer threads and serialize access internally.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends one complete payload.
    ///
    /// # Errors
    ///
    /// Fails when the payload could not be delivered. Stream transports drop their connection
    /// on failure and reconnect on the next call.
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;
}

/// Telemetry signal a transport is opened for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum Signal {
    #[display("logs")]
    Logs,
    #[display("traces")]
    Traces,
    #[display("metrics")]
    Metrics,
}

/// Opens the transport selected by the connection string.
///
/// No connection is made here; stream transports connect on the first send.
///
/// # Errors
///
/// Fails when the connection string is invalid for the selected protocol, the protocol is not
/// available on this platform, or logs/traces are exported without a transport key.
pub fn open(config: &ConnectionConfig, signal: Signal) -> Result<Arc<dyn Transport>, ExportError> {
    let timeout = config.timeout()?;
    let protocol = config.protocol()?;
    debug!("Opening {} transport for {}", protocol, signal);

    let transport: Arc<dyn Transport> = match protocol {
        Protocol::Tcp => Arc::new(StreamTransport::tcp(
            config.host()?,
            config.port()?,
            timeout,
        )),
        Protocol::UnixDomainSocket => {
            Arc::new(StreamTransport::unix(config.unix_path()?, timeout)?)
        }
        Protocol::Udp => Arc::new(DatagramTransport::new(
            config.host()?,
            config.port()?,
            timeout,
        )),
        Protocol::Etw => {
            let provider = config.etw_session().unwrap_or_default();
            Arc::new(EtwTransport::new(provider)?)
        }
        Protocol::UserEvents => {
            let tracepoint = config.user_events_tracepoint().unwrap_or_default();
            Arc::new(UserEventsTransport::new(tracepoint)?)
        }
        Protocol::Unspecified => match signal {
            Signal::Metrics => default_metrics_transport(timeout)?,
            Signal::Logs | Signal::Traces => {
                return Err(ConfigError::MissingKey(KEY_ENDPOINT).into());
            }
        },
    };

    Ok(transport)
}

#[cfg(windows)]
fn default_metrics_transport(
    _timeout: std::time::Duration,
) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(Arc::new(EtwTransport::new(DEFAULT_METRICS_ETW_PROVIDER)?))
}

#[cfg(not(windows))]
fn default_metrics_transport(
    timeout: std::time::Duration,
) -> Result<Arc<dyn Transport>, TransportError> {
    Ok(Arc::new(StreamTransport::unix(
        DEFAULT_METRICS_SOCKET_PATH,
        timeout,
    )?))
}
