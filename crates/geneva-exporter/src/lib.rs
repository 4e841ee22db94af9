// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Geneva Exporter
//!
//! Serializes logs, spans, and metric data points into the formats the Geneva agent accepts
//! and delivers them over a local transport.
//!
//! ## Overview
//!
//! - **Logs and spans** are written as MessagePack Forward envelopes: a table name, one
//!   `[timestamp, fields]` entry, and an options map. Log categories map to table names through
//!   [`table_name::TableNameResolver`]; spans always go to the `Span` table.
//! - **Metrics** are written as binary records, either type-length-value ([`metrics::tlv`]) or
//!   the older fixed layouts ([`metrics::legacy`]).
//!
//! The destination comes from a connection string such as
//! `Endpoint=tcp://localhost:33333;TimeoutMilliseconds=5000` (see [`config`]). Supported
//! transports are TCP and Unix domain sockets with reconnect on demand, UDP, ETW on Windows,
//! and Linux `user_events`.
//!
//! Exporters are synchronous and safe to share between threads. Each thread serializes into
//! its own scratch buffer ([`buffer`]).

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod buffer;
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod msgpack;
pub mod options;
pub mod record;
pub mod table_name;
pub mod transport;
pub mod util;

pub use config::{ConnectionConfig, Protocol};
pub use envelope::{ExportOutcome, LogExporter, TraceExporter};
pub use error::{ConfigError, ExportError, SerializeError, TransportError};
pub use metrics::{
    Exemplar, HistogramBucket, HistogramValue, MetricExporter, MetricRecord, MetricValue,
};
pub use options::{ExporterOptions, MetricExporterOptions, MetricWireFormat};
pub use record::{
    AnyValue, Attributes, ExceptionInfo, LogRecord, SpanId, SpanKind, SpanLink, SpanRecord,
    Status, TraceId,
};
pub use transport::Transport;
