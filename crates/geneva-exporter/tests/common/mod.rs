// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers for integration tests: local listeners that capture everything written to them and
//! decoders for the captured bytes.

#![allow(dead_code)]

use std::io::{self, Cursor, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
#[cfg(unix)]
use std::path::{Path, PathBuf};

use geneva_exporter::transport::Transport;
use geneva_exporter::TransportError;
use rmpv::Value;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Nonblocking listener that can be polled from the capture thread.
trait Accept: Send + 'static {
    type Stream: Read + Send;

    fn try_accept(&self) -> io::Result<Self::Stream>;
}

impl Accept for TcpListener {
    type Stream = TcpStream;

    fn try_accept(&self) -> io::Result<TcpStream> {
        let (stream, _) = self.accept()?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    }
}

#[cfg(unix)]
impl Accept for UnixListener {
    type Stream = UnixStream;

    fn try_accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.accept()?;
        stream.set_nonblocking(true)?;
        Ok(stream)
    }
}

/// Accepts connections on a background thread and appends every byte read to one buffer.
///
/// Dropping or stopping the capture closes the listener and every accepted connection.
pub struct Capture {
    received: Arc<Mutex<Vec<u8>>>,
    connections: Arc<Mutex<usize>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<L: Accept>(listener: L) -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let received = Arc::clone(&received);
            let connections = Arc::clone(&connections);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut streams = Vec::new();
                let mut chunk = [0u8; 8192];
                while !stop.load(Ordering::SeqCst) {
                    match listener.try_accept() {
                        Ok(stream) => {
                            *connections.lock().unwrap() += 1;
                            streams.push(stream);
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(_) => break,
                    }

                    streams.retain_mut(|stream| loop {
                        match stream.read(&mut chunk) {
                            Ok(0) => return false,
                            Ok(n) => received.lock().unwrap().extend_from_slice(&chunk[..n]),
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                            Err(_) => return false,
                        }
                    });
                    thread::sleep(POLL_INTERVAL);
                }
            })
        };

        Self {
            received,
            connections,
            stop,
            handle: Some(handle),
        }
    }

    /// Waits until at least `len` bytes have arrived and returns everything received so far.
    pub fn wait_for_bytes(&self, len: usize) -> Vec<u8> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let received = self.received.lock().unwrap().clone();
            if received.len() >= len || Instant::now() > deadline {
                return received;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Waits until `count` complete envelopes have arrived and decodes them.
    pub fn wait_for_envelopes(&self, count: usize) -> Vec<Value> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let received = self.received.lock().unwrap().clone();
            let envelopes = decode_envelopes(&received);
            if envelopes.len() >= count || Instant::now() > deadline {
                return envelopes;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn connections(&self) -> usize {
        *self.connections.lock().unwrap()
    }

    pub fn received_len(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Closes the listener and all accepted connections.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().expect("capture thread panicked");
        }
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// TCP capture on a loopback port.
pub struct TcpCapture {
    pub addr: SocketAddr,
    pub capture: Capture,
}

impl TcpCapture {
    pub fn start() -> Self {
        Self::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    /// Binds to `addr`, which may be the address of a capture that was stopped.
    pub fn bind(addr: SocketAddr) -> Self {
        let listener = TcpListener::bind(addr).expect("unable to bind TCP listener");
        listener
            .set_nonblocking(true)
            .expect("unable to make listener nonblocking");
        let addr = listener.local_addr().expect("listener has no address");
        Self {
            addr,
            capture: Capture::spawn(listener),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("Endpoint=tcp://127.0.0.1:{}", self.addr.port())
    }
}

/// Unix domain socket capture at a path inside a temporary directory.
#[cfg(unix)]
pub struct UnixCapture {
    pub path: PathBuf,
    pub capture: Capture,
    _dir: tempfile::TempDir,
}

#[cfg(unix)]
impl UnixCapture {
    pub fn start() -> Self {
        let dir = tempfile::tempdir().expect("unable to create temp dir");
        let path = dir.path().join("agent.socket");
        let capture = Self::listen(&path);
        Self {
            path,
            capture,
            _dir: dir,
        }
    }

    fn listen(path: &Path) -> Capture {
        let listener = UnixListener::bind(path).expect("unable to bind Unix listener");
        listener
            .set_nonblocking(true)
            .expect("unable to make listener nonblocking");
        Capture::spawn(listener)
    }

    pub fn endpoint(&self) -> String {
        format!("Endpoint=unix://{}", self.path.display())
    }
}

/// Transport that keeps every payload in memory.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub payloads: Mutex<Vec<Vec<u8>>>,
}

impl Transport for RecordingTransport {
    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.payloads.lock().unwrap().push(payload.to_vec());
        Ok(())
    }
}

/// Decodes every complete MessagePack value in `bytes`, ignoring a trailing partial one.
pub fn decode_envelopes(bytes: &[u8]) -> Vec<Value> {
    let mut cursor = Cursor::new(bytes);
    let mut envelopes = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => envelopes.push(value),
            Err(_) => break,
        }
    }
    envelopes
}

/// Decodes a buffer that must hold exactly one envelope.
pub fn decode_single(bytes: &[u8]) -> Value {
    let mut cursor = Cursor::new(bytes);
    let value = rmpv::decode::read_value(&mut cursor).expect("invalid envelope");
    assert_eq!(cursor.position() as usize, bytes.len(), "trailing bytes");
    value
}

pub fn table_name(envelope: &Value) -> &str {
    envelope.as_array().expect("envelope is an array")[0]
        .as_str()
        .expect("table name is a string")
}

/// Field map of the single entry of an envelope.
pub fn field_map(envelope: &Value) -> &[(Value, Value)] {
    let entries = envelope.as_array().expect("envelope is an array")[1]
        .as_array()
        .expect("entries are an array");
    assert_eq!(entries.len(), 1);
    entries[0].as_array().expect("entry is an array")[1]
        .as_map()
        .expect("fields are a map")
}

pub fn get<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
}

/// Splits a buffer of metric records into `(event_id, body)` pairs.
pub fn split_metric_records(mut bytes: &[u8]) -> Vec<(u16, Vec<u8>)> {
    let mut records = Vec::new();
    while bytes.len() >= 4 {
        let event_id = u16::from_le_bytes([bytes[0], bytes[1]]);
        let len = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() < 4 + len {
            break;
        }
        records.push((event_id, bytes[4..4 + len].to_vec()));
        bytes = &bytes[4 + len..];
    }
    records
}
