// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Persistent stream transport over TCP or a Unix domain socket.
//!
//! The connection is opened by the first send and kept for subsequent sends. A failed write
//! drops it, and the next send connects again exactly once. There is no background
//! reconnection: an idle transport never touches the network.

use std::fmt;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::net::UnixStream;
#[cfg(unix)]
use std::path::Path;

use tracing::{debug, warn};

use super::Transport;
use crate::error::TransportError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum SessionState {
    Disconnected,
    Connected,
}

#[derive(Clone, Debug)]
enum Target {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Connection {
    fn write_all(&mut self, payload: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => {
                stream.write_all(payload)?;
                stream.flush()
            }
            #[cfg(unix)]
            Self::Unix(stream) => {
                stream.write_all(payload)?;
                stream.flush()
            }
        }
    }
}

#[derive(Default)]
struct Session {
    connection: Option<Connection>,
    last_error: Option<String>,
}

/// Stream transport shared by all producer threads.
///
/// Sends are serialized by a single mutex held across "connect if needed" and the write, so
/// payloads from different threads never interleave on the wire.
pub struct StreamTransport {
    target: Target,
    timeout: Duration,
    session: Mutex<Session>,
    connect_attempts: AtomicU64,
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamTransport")
            .field("target", &self.target.to_string())
            .field("timeout", &self.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl StreamTransport {
    /// TCP transport. The host is resolved on every connect.
    pub fn tcp(host: &str, port: u16, timeout: Duration) -> Self {
        Self::with_target(
            Target::Tcp {
                host: host.to_string(),
                port,
            },
            timeout,
        )
    }

    /// Unix domain socket transport.
    ///
    /// # Errors
    ///
    /// Fails on platforms without Unix domain sockets.
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self::with_target(Target::Unix(path.into()), timeout))
    }

    /// Unix domain socket transport.
    ///
    /// # Errors
    ///
    /// Always fails: this platform has no Unix domain sockets.
    #[cfg(not(unix))]
    pub fn unix(path: impl Into<PathBuf>, _timeout: Duration) -> Result<Self, TransportError> {
        let path = path.into();
        warn!(
            "Unix domain socket {} requested on a platform without them",
            path.display()
        );
        Err(TransportError::Unsupported(format!(
            "unix domain socket {}",
            path.display()
        )))
    }

    fn with_target(target: Target, timeout: Duration) -> Self {
        Self {
            target,
            timeout,
            session: Mutex::new(Session::default()),
            connect_attempts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.connection.is_some() {
            SessionState::Connected
        } else {
            SessionState::Disconnected
        }
    }

    /// Message of the most recent connect or write failure.
    pub fn last_error(&self) -> Option<String> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_error
            .clone()
    }

    /// Number of connects attempted since construction.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Opens a connection. The configured timeout bounds the whole attempt, name resolution
    /// included.
    fn connect(&self) -> io::Result<Connection> {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.timeout;
        match &self.target {
            Target::Tcp { host, port } => {
                let mut last_error = None;
                for address in resolve(host, *port, deadline)? {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match TcpStream::connect_timeout(&address, remaining) {
                        Ok(stream) => {
                            stream.set_write_timeout(Some(self.timeout))?;
                            stream.set_nodelay(true)?;
                            return Ok(Connection::Tcp(stream));
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(last_error.unwrap_or_else(|| timed_out(&self.target)))
            }
            #[cfg(unix)]
            Target::Unix(path) => {
                let stream = connect_unix(path, deadline)
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::TimedOut => timed_out(&self.target),
                        _ => e,
                    })?;
                stream.set_write_timeout(Some(self.timeout))?;
                Ok(Connection::Unix(stream))
            }
            #[cfg(not(unix))]
            Target::Unix(_) => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }
}

fn timed_out(target: &Target) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connecting to {target} timed out"),
    )
}

/// Resolves `host` before `deadline`. IP literals skip the resolver.
///
/// The system resolver cannot be cancelled, so it runs on a helper thread that is abandoned
/// when the deadline passes.
fn resolve(host: &str, port: u16, deadline: Instant) -> io::Result<Vec<SocketAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let (sender, receiver) = mpsc::channel();
    let name = host.to_string();
    thread::Builder::new()
        .name("geneva-resolve".to_string())
        .spawn(move || {
            let result = (name.as_str(), port)
                .to_socket_addrs()
                .map(|addresses| addresses.collect::<Vec<_>>());
            let _ = sender.send(result);
        })?;

    let remaining = deadline.saturating_duration_since(Instant::now());
    let addresses = match receiver.recv_timeout(remaining) {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("resolving {host} timed out"),
            ))
        }
    };
    if addresses.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host} did not resolve to any address"),
        ));
    }
    Ok(addresses)
}

/// Interval between connect retries while the listener's backlog is full.
#[cfg(unix)]
const BACKLOG_RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Connects a Unix stream socket without blocking past `deadline`.
///
/// A nonblocking connect to a listener whose backlog is full fails with `EAGAIN` instead of
/// waiting, so it is retried until the deadline.
#[cfg(unix)]
fn connect_unix(path: &Path, deadline: Instant) -> io::Result<UnixStream> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    // SAFETY: sockaddr_un is plain old data; all zeroes is a valid value.
    let mut address: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= address.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket path {} is too long", path.display()),
        ));
    }
    address.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in address.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }

    // SAFETY: plain socket(2) call; the result is checked before use.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a freshly created descriptor owned by nothing else.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let stream = UnixStream::from(fd);
    stream.set_nonblocking(true)?;

    loop {
        // SAFETY: `address` is a valid sockaddr_un and the length matches its size.
        let result = unsafe {
            libc::connect(
                stream.as_raw_fd(),
                std::ptr::addr_of!(address).cast::<libc::sockaddr>(),
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        };
        if result == 0 {
            break;
        }

        let error = io::Error::last_os_error();
        match error.raw_os_error() {
            Some(libc::EINTR) => {}
            Some(libc::EAGAIN) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(io::Error::from(io::ErrorKind::TimedOut));
                }
                thread::sleep(remaining.min(BACKLOG_RETRY_INTERVAL));
            }
            Some(libc::EINPROGRESS) => {
                wait_writable(&stream, deadline)?;
                break;
            }
            _ => return Err(error),
        }
    }

    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Waits for an in-progress connect to finish and returns its outcome.
#[cfg(unix)]
fn wait_writable(stream: &UnixStream, deadline: Instant) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        let mut poll_fd = libc::pollfd {
            fd: stream.as_raw_fd(),
            events: libc::POLLOUT,
            revents: 0,
        };
        let millis = remaining.as_millis().clamp(1, i32::MAX as u128) as libc::c_int;
        // SAFETY: `poll_fd` is a single valid pollfd.
        let ready = unsafe { libc::poll(&mut poll_fd, 1, millis) };
        if ready > 0 {
            break;
        }
        if ready < 0 {
            let error = io::Error::last_os_error();
            if error.kind() != io::ErrorKind::Interrupted {
                return Err(error);
            }
        }
    }

    match stream.take_error()? {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

impl Transport for StreamTransport {
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        let mut connection = match session.connection.take() {
            Some(connection) => connection,
            None => match self.connect() {
                Ok(connection) => {
                    debug!("Connected to {}", self.target);
                    connection
                }
                Err(e) => {
                    warn!("Failed to connect to {}: {}", self.target, e);
                    session.last_error = Some(e.to_string());
                    return Err(TransportError::Connect {
                        target: self.target.to_string(),
                        source: e,
                    });
                }
            },
        };

        if let Err(e) = connection.write_all(payload) {
            warn!(
                "Write of {} bytes to {} failed, disconnecting: {}",
                payload.len(),
                self.target,
                e
            );
            session.last_error = Some(e.to_string());
            return Err(TransportError::Write {
                target: self.target.to_string(),
                source: e,
            });
        }

        session.connection = Some(connection);
        Ok(())
    }
}
