// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP transport. One payload per datagram.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use super::Transport;
use crate::error::TransportError;

/// Largest payload that fits in a single IPv4 UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

pub struct DatagramTransport {
    host: String,
    port: u16,
    timeout: Duration,
    socket: Mutex<Option<UdpSocket>>,
}

impl fmt::Debug for DatagramTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl DatagramTransport {
    /// The socket is bound on the first send.
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            timeout,
            socket: Mutex::new(None),
        }
    }

    fn target(&self) -> String {
        format!("udp://{}:{}", self.host, self.port)
    }

    fn bind(&self) -> io::Result<UdpSocket> {
        let address = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        let local = if address.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(local)?;
        socket.connect(address)?;
        socket.set_write_timeout(Some(self.timeout))?;
        Ok(socket)
    }
}

impl Transport for DatagramTransport {
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                limit: MAX_DATAGRAM_SIZE,
            });
        }

        let mut slot = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        let socket = match slot.take() {
            Some(socket) => socket,
            None => {
                let socket = self.bind().map_err(|e| {
                    warn!("Failed to bind UDP socket for {}: {}", self.target(), e);
                    TransportError::Connect {
                        target: self.target(),
                        source: e,
                    }
                })?;
                debug!("Bound UDP socket for {}", self.target());
                socket
            }
        };

        if let Err(e) = socket.send(payload) {
            warn!("Send to {} failed, dropping socket: {}", self.target(), e);
            return Err(TransportError::Write {
                target: self.target(),
                source: e,
            });
        }

        *slot = Some(socket);
        Ok(())
    }
}
