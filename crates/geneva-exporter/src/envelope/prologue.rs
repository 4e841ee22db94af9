// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bytes shared by every envelope an exporter writes, encoded once at construction.

use std::collections::HashMap;

use crate::error::SerializeError;
use crate::msgpack::{write_ascii_str, write_map_len};
use crate::record::AnyValue;

use super::{write_any_value, ENV_VER, SCHEMA_VERSION};

/// Precomputed envelope fragments.
///
/// Read-only after construction and shared by all producer threads; the field count lives in
/// each thread's own buffer, never here.
#[derive(Debug)]
pub struct Prologue {
    env_ver: Box<[u8]>,
    prepopulated: Box<[u8]>,
    prepopulated_keys: Box<[String]>,
    trailer: Box<[u8]>,
}

impl Prologue {
    /// Encodes `env_ver`, the prepopulated fields (sorted by key), and the `TimeFormat` options
    /// map closing the envelope.
    ///
    /// # Errors
    ///
    /// Fails when a prepopulated value cannot be encoded.
    pub fn new(prepopulated_fields: &HashMap<String, AnyValue>) -> Result<Self, SerializeError> {
        let mut env_ver = Vec::new();
        write_ascii_str(&mut env_ver, ENV_VER)?;
        write_ascii_str(&mut env_ver, SCHEMA_VERSION)?;

        let mut fields: Vec<(&String, &AnyValue)> = prepopulated_fields.iter().collect();
        fields.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut prepopulated = Vec::new();
        for (key, value) in &fields {
            write_ascii_str(&mut prepopulated, key)?;
            write_any_value(&mut prepopulated, value)?;
        }

        let mut trailer = Vec::new();
        write_map_len(&mut trailer, 1)?;
        write_ascii_str(&mut trailer, "TimeFormat")?;
        write_ascii_str(&mut trailer, "DateTime")?;

        Ok(Self {
            env_ver: env_ver.into_boxed_slice(),
            prepopulated: prepopulated.into_boxed_slice(),
            prepopulated_keys: fields.iter().map(|(key, _)| (*key).clone()).collect(),
            trailer: trailer.into_boxed_slice(),
        })
    }

    /// `env_ver` key/value pair.
    pub fn env_ver(&self) -> &[u8] {
        &self.env_ver
    }

    /// Prepopulated key/value pairs, without a map header.
    pub fn prepopulated(&self) -> &[u8] {
        &self.prepopulated
    }

    pub fn prepopulated_count(&self) -> usize {
        self.prepopulated_keys.len()
    }

    pub fn is_prepopulated(&self, key: &str) -> bool {
        self.prepopulated_keys.iter().any(|k| k == key)
    }

    /// Options map ending every envelope.
    pub fn trailer(&self) -> &[u8] {
        &self.trailer
    }
}
