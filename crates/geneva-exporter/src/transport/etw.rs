// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event Tracing for Windows transport.
//!
//! Each payload is written as one ETW event with a single binary field. On other platforms
//! construction fails with [`TransportError::Unsupported`].
//!
//! [`TransportError::Unsupported`]: crate::error::TransportError::Unsupported

#[cfg(windows)]
pub use windows::EtwTransport;

#[cfg(not(windows))]
pub use unsupported::EtwTransport;

/// Name of the event carrying the payload.
pub const EVENT_NAME: &str = "Payload";

/// Name of the binary field inside the event.
pub const PAYLOAD_FIELD: &str = "payload";

#[cfg(windows)]
mod windows {
    use std::fmt;
    use std::pin::Pin;
    use std::sync::{Mutex, PoisonError};

    use tracelogging_dynamic as tld;
    use tracing::{debug, trace};

    use super::{EVENT_NAME, PAYLOAD_FIELD};
    use crate::error::TransportError;
    use crate::transport::Transport;

    const KEYWORD: u64 = 1;

    pub struct EtwTransport {
        provider_name: String,
        provider: Pin<Box<tld::Provider>>,
        builder: Mutex<tld::EventBuilder>,
    }

    impl fmt::Debug for EtwTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("EtwTransport")
                .field("provider", &self.provider_name)
                .finish_non_exhaustive()
        }
    }

    impl EtwTransport {
        /// Registers an ETW provider named `provider_name`.
        ///
        /// # Errors
        ///
        /// Fails when the provider name is empty or registration fails.
        pub fn new(provider_name: &str) -> Result<Self, TransportError> {
            if provider_name.trim().is_empty() {
                return Err(TransportError::Unsupported(
                    "ETW provider name is empty".to_string(),
                ));
            }

            let provider = Box::pin(tld::Provider::new(
                provider_name,
                &tld::Provider::options(),
            ));
            // the provider is pinned and unregisters itself on drop
            let status = unsafe { provider.as_ref().register() };
            if status != 0 {
                return Err(TransportError::Emit(format!(
                    "registering ETW provider {provider_name} failed with status {status}"
                )));
            }
            debug!("Registered ETW provider {}", provider_name);

            Ok(Self {
                provider_name: provider_name.to_string(),
                provider,
                builder: Mutex::new(tld::EventBuilder::new()),
            })
        }
    }

    impl Transport for EtwTransport {
        fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
            if !self.provider.enabled(tld::Level::Informational, KEYWORD) {
                trace!("No ETW session listening on {}", self.provider_name);
                return Ok(());
            }

            let mut builder = self.builder.lock().unwrap_or_else(PoisonError::into_inner);
            let status = builder
                .reset(EVENT_NAME, tld::Level::Informational, KEYWORD, 0)
                .add_u8_sequence(PAYLOAD_FIELD, payload, tld::OutType::Default, 0)
                .write(&self.provider, None, None);
            if status != 0 {
                return Err(TransportError::Emit(format!(
                    "ETW write to {} failed with status {status}",
                    self.provider_name
                )));
            }
            Ok(())
        }
    }
}

#[cfg(not(windows))]
mod unsupported {
    use tracing::warn;

    use crate::error::TransportError;
    use crate::transport::Transport;

    #[derive(Debug)]
    pub struct EtwTransport {
        _private: (),
    }

    impl EtwTransport {
        /// ETW exists only on Windows.
        ///
        /// # Errors
        ///
        /// Always fails with [`TransportError::Unsupported`].
        pub fn new(provider_name: &str) -> Result<Self, TransportError> {
            warn!(
                "ETW provider {} requested on a non-Windows platform",
                provider_name
            );
            Err(TransportError::Unsupported(format!(
                "ETW provider {provider_name} requires Windows"
            )))
        }
    }

    impl Transport for EtwTransport {
        fn send(&self, _payload: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Unsupported("ETW requires Windows".to_string()))
        }
    }
}

#[cfg(all(test, not(windows)))]
mod tests {
    use super::*;
    use crate::error::TransportError;

    #[test]
    fn test_unsupported_outside_windows() {
        assert!(matches!(
            EtwTransport::new("OpenTelemetry"),
            Err(TransportError::Unsupported(_))
        ));
    }
}
