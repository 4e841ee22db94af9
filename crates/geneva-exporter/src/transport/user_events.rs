// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Linux user_events transport.
//!
//! Registers one tracepoint with a single dynamic `u8[]` field and writes each payload as one
//! event. Writes are skipped while no tracing session has the tracepoint enabled. On other
//! platforms construction fails with `TransportError::Unsupported`.

#[cfg(target_os = "linux")]
pub use linux::UserEventsTransport;

#[cfg(not(target_os = "linux"))]
pub use unsupported::UserEventsTransport;

/// Largest payload a `__rel_loc` field can describe.
pub const MAX_EVENT_PAYLOAD: usize = u16::MAX as usize;

/// Tracepoint names are limited to what the tracefs event parser accepts.
pub fn is_valid_tracepoint_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 256
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(target_os = "linux")]
mod linux {
    use std::ffi::CString;
    use std::fmt;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tracing::{debug, trace, warn};

    use super::{is_valid_tracepoint_name, MAX_EVENT_PAYLOAD};
    use crate::error::TransportError;
    use crate::transport::Transport;

    const USER_EVENTS_DATA_PATHS: [&str; 2] = [
        "/sys/kernel/tracing/user_events_data",
        "/sys/kernel/debug/tracing/user_events_data",
    ];

    /// `_IOWR('*', 0, struct user_reg *)`
    const DIAG_IOCSREG: u64 = 0xC008_2A00;

    /// `_IOW('*', 2, struct user_unreg *)`
    const DIAG_IOCSUNREG: u64 = 0x4008_2A02;

    const ENABLE_BIT: u8 = 0;

    #[allow(dead_code)]
    #[repr(C, packed)]
    struct UserReg {
        size: u32,
        enable_bit: u8,
        enable_size: u8,
        flags: u16,
        enable_addr: u64,
        name_args: u64,
        write_index: u32,
    }

    #[allow(dead_code)]
    #[repr(C, packed)]
    struct UserUnreg {
        size: u32,
        disable_bit: u8,
        reserved: u8,
        reserved2: u16,
        disable_addr: u64,
    }

    pub struct UserEventsTransport {
        tracepoint: String,
        file: File,
        write_index: u32,
        /// The kernel sets `ENABLE_BIT` here while a session listens to the tracepoint.
        enabled: Box<AtomicU32>,
    }

    impl fmt::Debug for UserEventsTransport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("UserEventsTransport")
                .field("tracepoint", &self.tracepoint)
                .field("write_index", &self.write_index)
                .field("enabled", &self.is_enabled())
                .finish()
        }
    }

    impl UserEventsTransport {
        /// Registers the tracepoint `tracepoint`.
        ///
        /// # Errors
        ///
        /// Fails when the tracepoint name is invalid, tracefs is not available, or the kernel
        /// rejects the registration.
        pub fn new(tracepoint: &str) -> Result<Self, TransportError> {
            if !is_valid_tracepoint_name(tracepoint) {
                return Err(TransportError::Unsupported(format!(
                    "'{tracepoint}' is not a valid user_events tracepoint name"
                )));
            }

            let file = open_data_file().map_err(|e| {
                warn!("user_events is not available: {}", e);
                TransportError::Unsupported(format!("user_events is not available: {e}"))
            })?;

            let enabled = Box::new(AtomicU32::new(0));
            let write_index = register(&file, tracepoint, &enabled).map_err(|e| {
                TransportError::Emit(format!("registering tracepoint {tracepoint} failed: {e}"))
            })?;
            debug!(
                "Registered user_events tracepoint {} with write index {}",
                tracepoint, write_index
            );

            Ok(Self {
                tracepoint: tracepoint.to_string(),
                file,
                write_index,
                enabled,
            })
        }

        pub fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::Relaxed) & (1 << ENABLE_BIT) != 0
        }
    }

    fn open_data_file() -> io::Result<File> {
        let mut last_error = io::Error::from(io::ErrorKind::NotFound);
        for path in USER_EVENTS_DATA_PATHS {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => return Ok(file),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }

    fn register(file: &File, tracepoint: &str, enabled: &AtomicU32) -> io::Result<u32> {
        let name_args = CString::new(format!("{tracepoint} __rel_loc u8[] payload"))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let mut reg = UserReg {
            size: std::mem::size_of::<UserReg>() as u32,
            enable_bit: ENABLE_BIT,
            enable_size: std::mem::size_of::<AtomicU32>() as u8,
            flags: 0,
            enable_addr: enabled.as_ptr() as u64,
            name_args: name_args.as_ptr() as u64,
            write_index: 0,
        };

        // the kernel reads name_args and fills write_index before returning
        let result = unsafe {
            libc::ioctl(
                file.as_raw_fd(),
                DIAG_IOCSREG as _,
                std::ptr::addr_of_mut!(reg),
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(reg.write_index)
    }

    impl Transport for UserEventsTransport {
        fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
            if payload.len() > MAX_EVENT_PAYLOAD {
                return Err(TransportError::PayloadTooLarge {
                    size: payload.len(),
                    limit: MAX_EVENT_PAYLOAD,
                });
            }
            if !self.is_enabled() {
                trace!("Tracepoint {} is not enabled", self.tracepoint);
                return Ok(());
            }

            let write_index = self.write_index.to_ne_bytes();
            // __rel_loc: data length in the high 16 bits, offset from the end of this field
            // in the low 16 bits
            let rel_loc = ((payload.len() as u32) << 16).to_ne_bytes();
            let iov = [
                libc::iovec {
                    iov_base: write_index.as_ptr() as *mut libc::c_void,
                    iov_len: write_index.len(),
                },
                libc::iovec {
                    iov_base: rel_loc.as_ptr() as *mut libc::c_void,
                    iov_len: rel_loc.len(),
                },
                libc::iovec {
                    iov_base: payload.as_ptr() as *mut libc::c_void,
                    iov_len: payload.len(),
                },
            ];

            // the kernel only reads from the buffers
            let written = unsafe {
                libc::writev(self.file.as_raw_fd(), iov.as_ptr(), iov.len() as libc::c_int)
            };
            if written < 0 {
                let error = io::Error::last_os_error();
                // EBADF: the session disabled the event between the check and the write
                if error.raw_os_error() == Some(libc::EBADF) {
                    return Ok(());
                }
                return Err(TransportError::Write {
                    target: format!("user_events:{}", self.tracepoint),
                    source: error,
                });
            }
            Ok(())
        }
    }

    impl Drop for UserEventsTransport {
        fn drop(&mut self) {
            let mut unreg = UserUnreg {
                size: std::mem::size_of::<UserUnreg>() as u32,
                disable_bit: ENABLE_BIT,
                reserved: 0,
                reserved2: 0,
                disable_addr: self.enabled.as_ptr() as u64,
            };
            // stops the kernel from writing to `enabled` before it is freed
            let result = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    DIAG_IOCSUNREG as _,
                    std::ptr::addr_of_mut!(unreg),
                )
            };
            if result < 0 {
                debug!(
                    "Unregistering tracepoint {} failed: {}",
                    self.tracepoint,
                    io::Error::last_os_error()
                );
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use tracing::warn;

    use crate::error::TransportError;
    use crate::transport::Transport;

    #[derive(Debug)]
    pub struct UserEventsTransport {
        _private: (),
    }

    impl UserEventsTransport {
        /// user_events exists only on Linux.
        ///
        /// # Errors
        ///
        /// Always fails with [`TransportError::Unsupported`].
        pub fn new(tracepoint: &str) -> Result<Self, TransportError> {
            warn!(
                "user_events tracepoint {} requested on a non-Linux platform",
                tracepoint
            );
            Err(TransportError::Unsupported(format!(
                "user_events tracepoint {tracepoint} requires Linux"
            )))
        }
    }

    impl Transport for UserEventsTransport {
        fn send(&self, _payload: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::Unsupported(
                "user_events requires Linux".to_string(),
            ))
        }
    }
}
