// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! MessagePack "Forward" envelopes for logs and spans.
//!
//! Every record becomes one self-contained envelope:
//!
//! ```text
//! [ tableName, [ [ timestamp, { field: value, ... } ] ], { "TimeFormat": "DateTime" } ]
//! ```
//!
//! The field map is written in a fixed order (Part A envelope fields, Part B signal fields,
//! Part C attributes) behind a map16 header whose count is patched once all fields are
//! written.

use std::collections::HashSet;
use std::time::SystemTime;

use crate::error::SerializeError;
use crate::msgpack::{
    write_array_len, write_ascii_str, write_bin, write_bool, write_f64, write_hex, write_i64,
    write_map_len, write_str, write_timestamp, MapPlaceholder,
};
use crate::record::AnyValue;

pub mod log;
pub mod prologue;
pub mod span;

pub use log::LogExporter;
pub use prologue::Prologue;
pub use span::TraceExporter;

pub const ENV_NAME: &str = "env_name";
pub const ENV_VER: &str = "env_ver";
pub const ENV_TIME: &str = "env_time";
pub const ENV_TRACE_ID: &str = "env_dt_traceId";
pub const ENV_SPAN_ID: &str = "env_dt_spanId";
pub const ENV_EXCEPTION_TYPE: &str = "env_ex_type";
pub const ENV_EXCEPTION_MESSAGE: &str = "env_ex_msg";
pub const ENV_EXCEPTION_STACK: &str = "env_ex_stack";
pub const ENV_PROPERTIES: &str = "env_properties";
pub const CORRELATION_ID: &str = "AFDCorrelationId";

pub const SCHEMA_VERSION: &str = "4.0";

const PART_A_KEYS: [&str; 10] = [
    ENV_NAME,
    ENV_VER,
    ENV_TIME,
    ENV_TRACE_ID,
    ENV_SPAN_ID,
    ENV_EXCEPTION_TYPE,
    ENV_EXCEPTION_MESSAGE,
    ENV_EXCEPTION_STACK,
    ENV_PROPERTIES,
    CORRELATION_ID,
];

/// Result of exporting a single record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportOutcome {
    Exported,
    /// The record's category did not resolve to a table; nothing was written or sent.
    Dropped,
}

/// Attributes promoted to top-level keys.
#[derive(Clone, Debug)]
pub enum DedicatedFields {
    /// Every attribute is a top-level key.
    All,
    /// Listed attributes are top-level keys, the rest go to `env_properties`.
    Only(HashSet<String>),
}

impl DedicatedFields {
    pub fn from_custom_fields(custom_fields: Option<&[String]>) -> Self {
        match custom_fields {
            None => Self::All,
            Some(fields) => Self::Only(fields.iter().map(|f| f.trim().to_string()).collect()),
        }
    }

    fn contains(&self, key: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(fields) => fields.contains(key),
        }
    }
}

/// Writes an attribute value. Arrays become JSON strings.
pub fn write_any_value(buf: &mut Vec<u8>, value: &AnyValue) -> Result<(), SerializeError> {
    match value {
        AnyValue::Bool(value) => write_bool(buf, *value),
        AnyValue::Int(value) => write_i64(buf, *value),
        AnyValue::Double(value) => write_f64(buf, *value),
        AnyValue::String(value) => write_str(buf, value),
        AnyValue::Bytes(value) => write_bin(buf, value),
        AnyValue::Array(_) => write_str(buf, &serde_json::to_string(value)?),
    }
}

/// Field map under construction in a thread's own buffer.
pub(crate) struct Fields<'a> {
    buf: &'a mut Vec<u8>,
    map: MapPlaceholder,
}

impl<'a> Fields<'a> {
    /// Writes the envelope up to the field map header and the `env_name`, `env_ver`,
    /// `env_time`, and prepopulated fields.
    pub(crate) fn begin(
        buf: &'a mut Vec<u8>,
        prologue: &Prologue,
        table_name: &str,
        time: SystemTime,
    ) -> Result<Self, SerializeError> {
        write_array_len(buf, 3)?;
        write_ascii_str(buf, table_name)?;
        write_array_len(buf, 1)?;
        write_array_len(buf, 2)?;
        write_timestamp(buf, time)?;

        let map = MapPlaceholder::reserve(buf);
        let mut fields = Self { buf, map };
        fields.ascii(ENV_NAME, table_name)?;
        fields.raw(prologue.env_ver(), 1);
        fields.time(ENV_TIME, time)?;
        fields.raw(prologue.prepopulated(), prologue.prepopulated_count());
        Ok(fields)
    }

    fn key(&mut self, key: &str) -> Result<(), SerializeError> {
        self.map.add();
        write_ascii_str(self.buf, key)
    }

    fn raw(&mut self, pairs: &[u8], count: usize) {
        self.buf.extend_from_slice(pairs);
        self.map.add_many(count);
    }

    pub(crate) fn ascii(&mut self, key: &str, value: &str) -> Result<(), SerializeError> {
        self.key(key)?;
        write_ascii_str(self.buf, value)
    }

    pub(crate) fn str(&mut self, key: &str, value: &str) -> Result<(), SerializeError> {
        self.key(key)?;
        write_str(self.buf, value)
    }

    pub(crate) fn int(&mut self, key: &str, value: i64) -> Result<(), SerializeError> {
        self.key(key)?;
        write_i64(self.buf, value)
    }

    pub(crate) fn bool(&mut self, key: &str, value: bool) -> Result<(), SerializeError> {
        self.key(key)?;
        write_bool(self.buf, value)
    }

    pub(crate) fn time(&mut self, key: &str, value: SystemTime) -> Result<(), SerializeError> {
        self.key(key)?;
        write_timestamp(self.buf, value)
    }

    pub(crate) fn hex(&mut self, key: &str, value: &[u8]) -> Result<(), SerializeError> {
        self.key(key)?;
        write_hex(self.buf, value)
    }

    pub(crate) fn any(&mut self, key: &str, value: &AnyValue) -> Result<(), SerializeError> {
        self.key(key)?;
        write_any_value(self.buf, value)
    }

    /// Writes Part C: dedicated attributes as top-level keys, the others nested under
    /// `env_properties`.
    ///
    /// `reserved` keys were written earlier in the envelope; attributes using them are moved
    /// to `env_properties`. `skip` keys are never written. A repeated attribute key keeps its
    /// first value.
    pub(crate) fn attributes(
        &mut self,
        attributes: &[(String, AnyValue)],
        dedicated: &DedicatedFields,
        reserved: impl Fn(&str) -> bool,
        skip: &[&str],
    ) -> Result<(), SerializeError> {
        let mut seen = HashSet::with_capacity(attributes.len());
        let placements: Vec<Placement> = attributes
            .iter()
            .map(|(key, _)| {
                if skip.contains(&key.as_str()) || !seen.insert(key.as_str()) {
                    Placement::Skip
                } else if !reserved(key) && dedicated.contains(key) {
                    Placement::Dedicated
                } else {
                    Placement::Property
                }
            })
            .collect();

        for ((key, value), placement) in attributes.iter().zip(&placements) {
            if *placement == Placement::Dedicated {
                self.any(key, value)?;
            }
        }

        let properties = placements
            .iter()
            .filter(|placement| **placement == Placement::Property)
            .count();
        if properties > 0 {
            self.key(ENV_PROPERTIES)?;
            write_map_len(self.buf, properties)?;
            for ((key, value), placement) in attributes.iter().zip(&placements) {
                if *placement == Placement::Property {
                    write_ascii_str(self.buf, key)?;
                    write_any_value(self.buf, value)?;
                }
            }
        }
        Ok(())
    }

    /// Patches the field count and closes the envelope. Returns the number of fields.
    pub(crate) fn finish(self, prologue: &Prologue) -> Result<usize, SerializeError> {
        let count = self.map.patch(self.buf)?;
        self.buf.extend_from_slice(prologue.trailer());
        Ok(count)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    Dedicated,
    Property,
    Skip,
}

/// Returns true for keys written in Part A of every envelope.
pub fn is_part_a_key(key: &str) -> bool {
    PART_A_KEYS.contains(&key)
}

/// Returns true for keys the log or span envelope writes itself, ahead of prepopulated fields
/// and attributes.
pub fn is_reserved_key(key: &str) -> bool {
    is_part_a_key(key) || log::PART_B_KEYS.contains(&key) || span::PART_B_KEYS.contains(&key)
}


#[cfg(test)]
mod tests {
    use super::test_util::{decode, field_map, get, keys};
    use super::*;
    use rmpv::Value;
    use std::collections::HashMap;
    use std::time::UNIX_EPOCH;

    fn envelope(attributes: &[(String, AnyValue)], dedicated: &DedicatedFields) -> Value {
        let prologue = Prologue::new(&HashMap::new()).unwrap();
        let mut buf = Vec::new();
        let mut fields = Fields::begin(&mut buf, &prologue, "Log", UNIX_EPOCH).unwrap();
        fields
            .attributes(attributes, dedicated, is_part_a_key, &["skipped"])
            .unwrap();
        fields.finish(&prologue).unwrap();
        decode(&buf)
    }

    fn attrs(pairs: &[(&str, AnyValue)]) -> Vec<(String, AnyValue)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_envelope_shape() {
        let decoded = envelope(&[], &DedicatedFields::All);
        let outer = decoded.as_array().unwrap();
        assert_eq!(outer[0], Value::from("Log"));
        assert_eq!(
            outer[2],
            Value::Map(vec![(Value::from("TimeFormat"), Value::from("DateTime"))])
        );

        let map = field_map(&decoded);
        assert_eq!(keys(map), vec![ENV_NAME, ENV_VER, ENV_TIME]);
        assert_eq!(get(map, ENV_VER), Some(&Value::from("4.0")));
    }

    #[test]
    fn test_all_attributes_dedicated() {
        let attributes = attrs(&[
            ("user_id", AnyValue::Int(7)),
            ("tags", AnyValue::Array(vec!["a".into(), 1i64.into()])),
            ("raw", AnyValue::Bytes(vec![1, 2])),
        ]);
        let decoded = envelope(&attributes, &DedicatedFields::All);
        let map = field_map(&decoded);

        assert_eq!(map.len(), 6);
        assert_eq!(get(map, "user_id"), Some(&Value::from(7)));
        assert_eq!(get(map, "tags"), Some(&Value::from(r#"["a",1]"#)));
        assert_eq!(get(map, "raw"), Some(&Value::Binary(vec![1, 2])));
        assert!(get(map, ENV_PROPERTIES).is_none());
    }

    #[test]
    fn test_undedicated_attributes_go_to_properties() {
        let attributes = attrs(&[
            ("user_id", AnyValue::Int(7)),
            ("path", AnyValue::from("/home")),
            ("env_name", AnyValue::from("spoofed")),
            ("skipped", AnyValue::Bool(true)),
            ("user_id", AnyValue::Int(8)),
        ]);
        let dedicated = DedicatedFields::from_custom_fields(Some(&["user_id".to_string()][..]));
        let decoded = envelope(&attributes, &dedicated);
        let map = field_map(&decoded);

        assert_eq!(map.len(), 5);
        assert_eq!(get(map, "user_id"), Some(&Value::from(7)));
        assert_eq!(get(map, ENV_NAME), Some(&Value::from("Log")));

        let properties = get(map, ENV_PROPERTIES).unwrap().as_map().unwrap();
        assert_eq!(properties.len(), 2);
        assert_eq!(get(properties, "path"), Some(&Value::from("/home")));
        assert_eq!(get(properties, "env_name"), Some(&Value::from("spoofed")));
    }

    #[test]
    fn test_properties_omitted_when_everything_is_dedicated() {
        let attributes = attrs(&[("user_id", AnyValue::Int(7))]);
        let dedicated = DedicatedFields::from_custom_fields(Some(&["user_id".to_string()][..]));
        let decoded = envelope(&attributes, &dedicated);
        assert!(get(field_map(&decoded), ENV_PROPERTIES).is_none());
    }
}
