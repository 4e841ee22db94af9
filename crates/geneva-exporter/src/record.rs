// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log and span records handed to the exporters.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::SerializeError;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TraceId(pub [u8; 16]);

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SpanId(pub [u8; 8]);

macro_rules! hex_id {
    ($name:ident, $len:literal) => {
        impl $name {
            pub const INVALID: Self = Self([0; $len]);

            /// Parses a lowercase or uppercase hex id.
            ///
            /// # Errors
            ///
            /// Fails when `value` is not exactly the expected number of hex digits.
            pub fn from_hex(value: &str) -> Result<Self, SerializeError> {
                let mut bytes = [0; $len];
                hex::decode_to_slice(value, &mut bytes)?;
                Ok(Self(bytes))
            }

            /// An all-zero id marks an absent id.
            pub fn is_valid(&self) -> bool {
                *self != Self::INVALID
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }
    };
}

hex_id!(TraceId, 16);
hex_id!(SpanId, 8);

/// Attribute, body, and prepopulated field value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    /// Written as a JSON string since the agent has no array column type.
    Array(Vec<AnyValue>),
    #[serde(skip_deserializing)]
    Bytes(Vec<u8>),
}

impl From<bool> for AnyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AnyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AnyValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

pub type Attributes = Vec<(String, AnyValue)>;

/// Exception captured on a log record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub timestamp: SystemTime,
    /// Logger name, used to pick the table.
    pub category_name: String,
    pub event_name: Option<String>,
    pub event_id: i32,
    /// Severity on the 1..=24 scale.
    pub severity_number: i32,
    /// Falls back to the name of the severity range when unset.
    pub severity_text: Option<String>,
    pub body: Option<AnyValue>,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
    pub exception: Option<ExceptionInfo>,
    pub correlation_id: Option<String>,
    pub attributes: Attributes,
}

impl LogRecord {
    pub fn new(
        category_name: impl Into<String>,
        severity_number: i32,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            timestamp,
            category_name: category_name.into(),
            event_name: None,
            event_id: 0,
            severity_number,
            severity_text: None,
            body: None,
            trace_id: None,
            span_id: None,
            exception: None,
            correlation_id: None,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<AnyValue>) -> Self {
        self.body = Some(body.into());
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AnyValue>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn severity_text(&self) -> &str {
        match &self.severity_text {
            Some(text) => text,
            None => severity_name(self.severity_number),
        }
    }
}

fn severity_name(severity_number: i32) -> &'static str {
    match severity_number {
        1..=4 => "TRACE",
        5..=8 => "DEBUG",
        9..=12 => "INFO",
        13..=16 => "WARN",
        17..=20 => "ERROR",
        21..=24 => "FATAL",
        _ => "UNSPECIFIED",
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::Display)]
pub enum SpanKind {
    #[default]
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Internal => 0,
            Self::Server => 1,
            Self::Client => 2,
            Self::Producer => 3,
            Self::Consumer => 4,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Unset,
    Ok,
    Error {
        description: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SpanRecord {
    pub name: String,
    pub kind: SpanKind,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub trace_state: Option<String>,
    pub status: Status,
    pub links: Vec<SpanLink>,
    pub attributes: Attributes,
}

impl SpanRecord {
    pub fn new(
        name: impl Into<String>,
        trace_id: TraceId,
        span_id: SpanId,
        start_time: SystemTime,
        end_time: SystemTime,
    ) -> Self {
        Self {
            name: name.into(),
            kind: SpanKind::Internal,
            start_time,
            end_time,
            trace_id,
            span_id,
            parent_span_id: None,
            trace_state: None,
            status: Status::Unset,
            links: Vec::new(),
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AnyValue>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }
}
