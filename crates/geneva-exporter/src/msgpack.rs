// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! MessagePack primitives used by the envelope serializer.
//!
//! Thin layer over `rmp::encode` adding the agent's string rules (ASCII fast path, truncation
//! with an ellipsis), the 12-byte timestamp extension, and a fixed-width map header that is
//! patched once the number of fields is known.

use std::time::SystemTime;

use rmp::encode;
use rmp::Marker;

use crate::error::SerializeError;
use crate::util::unix_seconds_and_nanos;

/// Longest string, in characters, written without truncation.
pub const MAX_STRING_CHARS: usize = 16_383;

const ELLIPSIS: &str = "...";

/// MessagePack timestamp extension type.
const TIMESTAMP_EXT_TYPE: i8 = -1;

/// Writes a string that is expected to be ASCII (keys, table names, identifiers).
///
/// Non-ASCII characters are replaced with `?`.
pub fn write_ascii_str(buf: &mut Vec<u8>, value: &str) -> Result<(), SerializeError> {
    if value.is_ascii() && value.len() <= MAX_STRING_CHARS {
        encode::write_str(buf, value)?;
        return Ok(());
    }

    let char_count = value.chars().count();
    let (kept, truncated) = if char_count > MAX_STRING_CHARS {
        (MAX_STRING_CHARS - ELLIPSIS.len(), true)
    } else {
        (char_count, false)
    };
    let total = kept + if truncated { ELLIPSIS.len() } else { 0 };

    write_str_header(buf, total)?;
    buf.extend(
        value
            .chars()
            .take(kept)
            .map(|ch| if ch.is_ascii() { ch as u8 } else { b'?' }),
    );
    if truncated {
        buf.extend_from_slice(ELLIPSIS.as_bytes());
    }
    Ok(())
}

/// Writes an arbitrary UTF-8 string, truncating it past [`MAX_STRING_CHARS`] characters.
pub fn write_str(buf: &mut Vec<u8>, value: &str) -> Result<(), SerializeError> {
    // a string of at most MAX_STRING_CHARS bytes cannot have more characters than that
    if value.len() <= MAX_STRING_CHARS {
        encode::write_str(buf, value)?;
        return Ok(());
    }

    match value.char_indices().nth(MAX_STRING_CHARS) {
        None => {
            encode::write_str(buf, value)?;
        }
        Some(_) => {
            let cut = value
                .char_indices()
                .nth(MAX_STRING_CHARS - ELLIPSIS.len())
                .map_or(value.len(), |(index, _)| index);
            write_str_header(buf, cut + ELLIPSIS.len())?;
            buf.extend_from_slice(&value.as_bytes()[..cut]);
            buf.extend_from_slice(ELLIPSIS.as_bytes());
        }
    }
    Ok(())
}

fn write_str_header(buf: &mut Vec<u8>, len: usize) -> Result<(), SerializeError> {
    let len = u32::try_from(len).map_err(|_| SerializeError::FieldTooLong("string"))?;
    encode::write_str_len(buf, len)?;
    Ok(())
}

/// Writes a timestamp as the 12-byte MessagePack timestamp extension.
pub fn write_timestamp(buf: &mut Vec<u8>, time: SystemTime) -> Result<(), SerializeError> {
    let (seconds, nanos) = unix_seconds_and_nanos(time);
    encode::write_ext_meta(buf, 12, TIMESTAMP_EXT_TYPE)?;
    buf.extend_from_slice(&nanos.to_be_bytes());
    buf.extend_from_slice(&seconds.to_be_bytes());
    Ok(())
}

/// Writes bytes as a lowercase hex string (trace and span ids).
pub fn write_hex(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), SerializeError> {
    let len = bytes.len() * 2;
    write_str_header(buf, len)?;
    let start = buf.len();
    buf.resize(start + len, 0);
    hex::encode_to_slice(bytes, &mut buf[start..])?;
    Ok(())
}

pub fn write_bool(buf: &mut Vec<u8>, value: bool) -> Result<(), SerializeError> {
    encode::write_bool(buf, value)?;
    Ok(())
}

pub fn write_i64(buf: &mut Vec<u8>, value: i64) -> Result<(), SerializeError> {
    encode::write_sint(buf, value)?;
    Ok(())
}

pub fn write_f64(buf: &mut Vec<u8>, value: f64) -> Result<(), SerializeError> {
    encode::write_f64(buf, value)?;
    Ok(())
}

pub fn write_bin(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), SerializeError> {
    encode::write_bin(buf, value)?;
    Ok(())
}

pub fn write_array_len(buf: &mut Vec<u8>, len: usize) -> Result<(), SerializeError> {
    let len = u32::try_from(len).map_err(|_| SerializeError::FieldTooLong("array"))?;
    encode::write_array_len(buf, len)?;
    Ok(())
}

pub fn write_map_len(buf: &mut Vec<u8>, len: usize) -> Result<(), SerializeError> {
    let len = u32::try_from(len).map_err(|_| SerializeError::FieldTooLong("map"))?;
    encode::write_map_len(buf, len)?;
    Ok(())
}

/// A map16 header whose entry count is filled in after the entries are written.
///
/// Only ever lives inside the buffer of the thread that created it.
#[derive(Debug)]
#[must_use = "the map header must be patched with the final field count"]
pub struct MapPlaceholder {
    position: usize,
    count: usize,
}

impl MapPlaceholder {
    /// Writes a map16 marker with a zero count and returns the handle used to patch it.
    pub fn reserve(buf: &mut Vec<u8>) -> Self {
        let position = buf.len();
        buf.push(Marker::Map16.to_u8());
        buf.extend_from_slice(&[0, 0]);
        Self { position, count: 0 }
    }

    /// Records that one more key/value pair was written.
    pub fn add(&mut self) {
        self.count += 1;
    }

    /// Records several key/value pairs written from precomputed bytes.
    pub fn add_many(&mut self, count: usize) {
        self.count += count;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Writes the final count into the header. Consumes the placeholder so it is patched once.
    pub fn patch(self, buf: &mut [u8]) -> Result<usize, SerializeError> {
        let count =
            u16::try_from(self.count).map_err(|_| SerializeError::TooManyFields(self.count))?;
        buf[self.position + 1..self.position + 3].copy_from_slice(&count.to_be_bytes());
        Ok(self.count)
    }
}
