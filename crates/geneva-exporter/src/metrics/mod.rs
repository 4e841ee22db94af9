// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metric data points in the agent's binary metric layouts.
//!
//! Data points arrive already aggregated. Each one is written as a single record: a 4-byte
//! header (`event_id`, `body_len`, both little-endian `u16`) followed by the body, either as
//! type-length-value fields ([`tlv`]) or in the older fixed layouts ([`legacy`]).

use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, trace};

use crate::buffer::with_scratch;
use crate::error::{ExportError, SerializeError};
use crate::options::{MetricExporterOptions, MetricWireFormat};
use crate::record::{SpanId, TraceId};
use crate::transport::{self, Signal, Transport};

pub mod legacy;
pub mod tlv;

/// Most dimensions a single data point may carry, prepopulated ones included.
pub const MAX_DIMENSIONS: usize = 128;

/// Dimension overriding the configured account for one data point. Never emitted.
pub const ACCOUNT_OVERRIDE_DIMENSION: &str = "_microsoft_metrics_account";

/// Dimension overriding the configured namespace for one data point. Never emitted.
pub const NAMESPACE_OVERRIDE_DIMENSION: &str = "_microsoft_metrics_namespace";

/// Header size: `event_id` and `body_len`.
pub const HEADER_LEN: usize = 4;

pub const MAX_BODY_LEN: usize = u16::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
pub enum MetricKind {
    ULong,
    Double,
    Histogram,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistogramBucket {
    /// Inclusive upper bound. The last bucket of a histogram is unbounded (`f64::INFINITY`).
    pub upper_bound: f64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistogramValue {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub buckets: Vec<HistogramBucket>,
}

impl HistogramValue {
    /// Builds a histogram from explicit bounds and one count per bucket, the last count being
    /// the overflow bucket above the final bound.
    pub fn from_explicit_bounds(
        bounds: &[f64],
        counts: &[u64],
        sum: f64,
        min: f64,
        max: f64,
    ) -> Self {
        let buckets = bounds
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY))
            .zip(counts.iter().copied())
            .map(|(upper_bound, count)| HistogramBucket { upper_bound, count })
            .collect();
        Self {
            count: counts.iter().fold(0u64, |total, &c| total.saturating_add(c)),
            sum,
            min,
            max,
            buckets,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MetricValue {
    /// Monotonic or non-negative integer sum.
    ULong(u64),
    /// Gauge or floating point sum.
    Double(f64),
    Histogram(HistogramValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Exemplar {
    pub value: f64,
    pub timestamp: SystemTime,
    pub trace_id: Option<TraceId>,
    pub span_id: Option<SpanId>,
    /// Attributes dropped by aggregation for this measurement.
    pub filtered_attributes: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub timestamp: SystemTime,
    pub dimensions: Vec<(String, String)>,
    pub value: MetricValue,
    pub exemplars: Vec<Exemplar>,
}

impl MetricRecord {
    pub fn new(name: impl Into<String>, timestamp: SystemTime, value: MetricValue) -> Self {
        Self {
            name: name.into(),
            timestamp,
            dimensions: Vec::new(),
            value,
            exemplars: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.push((name.into(), value.into()));
        self
    }

    pub fn kind(&self) -> MetricKind {
        match self.value {
            MetricValue::ULong(_) => MetricKind::ULong,
            MetricValue::Double(_) => MetricKind::Double,
            MetricValue::Histogram(_) => MetricKind::Histogram,
        }
    }
}

/// Account, namespace, and dimensions of one data point after overrides and prepopulated
/// dimensions are applied.
#[derive(Debug)]
pub(crate) struct Resolved<'a> {
    pub account: &'a str,
    pub namespace: &'a str,
    pub dimensions: Vec<(&'a str, &'a str)>,
}

/// Saturating conversion of a non-negative float to an unsigned wire field.
pub(crate) fn saturating_u64(value: f64) -> u64 {
    // `as` saturates at the bounds and maps NaN to 0
    value as u64
}

pub(crate) fn saturating_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

/// Writes a `u16` length followed by the UTF-8 bytes.
pub(crate) fn write_prefixed_str(
    buf: &mut Vec<u8>,
    value: &str,
    field: &'static str,
) -> Result<(), SerializeError> {
    let len = u16::try_from(value.len()).map_err(|_| SerializeError::FieldTooLong(field))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

/// Reserves the 4-byte header and returns its position.
pub(crate) fn begin_record(buf: &mut Vec<u8>, event_id: u16) -> usize {
    let start = buf.len();
    buf.extend_from_slice(&event_id.to_le_bytes());
    buf.extend_from_slice(&[0, 0]);
    start
}

/// Patches `body_len` into the header written at `start`.
pub(crate) fn finish_record(buf: &mut [u8], start: usize) -> Result<usize, SerializeError> {
    let body_len = buf.len() - start - HEADER_LEN;
    let len = u16::try_from(body_len).map_err(|_| SerializeError::PayloadTooLarge {
        size: body_len,
        limit: MAX_BODY_LEN,
    })?;
    buf[start + 2..start + HEADER_LEN].copy_from_slice(&len.to_le_bytes());
    Ok(body_len)
}

/// Serializes metric data points and sends them to the agent.
#[derive(Debug)]
pub struct MetricExporter {
    transport: Arc<dyn Transport>,
    account: String,
    namespace: String,
    /// Sorted by name.
    prepopulated_dimensions: Vec<(String, String)>,
    wire_format: MetricWireFormat,
}

impl MetricExporter {
    /// Builds an exporter from validated options and opens its transport.
    ///
    /// # Errors
    ///
    /// Fails when the options are invalid (including a missing account or namespace) or the
    /// selected transport is not available here.
    pub fn new(options: &MetricExporterOptions) -> Result<Self, ExportError> {
        let config = options.validate()?;
        let transport = transport::open(&config, Signal::Metrics)?;
        Self::build(options, transport)
    }

    /// Builds an exporter that sends through a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// Fails when the options are invalid.
    pub fn with_transport(
        options: &MetricExporterOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ExportError> {
        Self::build(options, transport)
    }

    fn build(
        options: &MetricExporterOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ExportError> {
        let config = options.validate()?;
        let mut prepopulated_dimensions: Vec<(String, String)> = options
            .prepopulated_metric_dimensions
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        prepopulated_dimensions.sort();

        debug!(
            "Metric exporter ready with {} wire format and {} prepopulated dimensions",
            options.wire_format,
            prepopulated_dimensions.len()
        );

        Ok(Self {
            transport,
            account: config.account()?.to_string(),
            namespace: config.namespace()?.to_string(),
            prepopulated_dimensions,
            wire_format: options.wire_format,
        })
    }

    /// Serializes `record` and sends it.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be encoded or the transport rejects it.
    pub fn export(&self, record: &MetricRecord) -> Result<(), ExportError> {
        with_scratch(|buf| {
            self.serialize(record, buf)?;
            self.transport.send(buf)?;
            trace!("Sent metric {} of {} bytes", record.name, buf.len());
            Ok(())
        })
    }

    /// Appends the binary record for `record` to `buf` and returns its length.
    ///
    /// # Errors
    ///
    /// Fails when the record has too many dimensions, a string does not fit its length
    /// prefix, or the body exceeds 65,535 bytes. On error `buf` is left as it was before the
    /// call.
    pub fn serialize(
        &self,
        record: &MetricRecord,
        buf: &mut Vec<u8>,
    ) -> Result<usize, SerializeError> {
        let resolved = self.resolve(record)?;
        let start = buf.len();
        let result = match self.wire_format {
            MetricWireFormat::Tlv => tlv::encode(buf, &resolved, record),
            MetricWireFormat::Legacy => legacy::encode(buf, &resolved, record),
        };
        match result {
            Ok(()) => Ok(buf.len() - start),
            Err(e) => {
                buf.truncate(start);
                Err(e)
            }
        }
    }

    fn resolve<'a>(&'a self, record: &'a MetricRecord) -> Result<Resolved<'a>, SerializeError> {
        let mut account = self.account.as_str();
        let mut namespace = self.namespace.as_str();
        let mut dimensions: Vec<(&str, &str)> =
            Vec::with_capacity(record.dimensions.len() + self.prepopulated_dimensions.len());

        for (name, value) in &record.dimensions {
            match name.as_str() {
                ACCOUNT_OVERRIDE_DIMENSION => account = value.as_str(),
                NAMESPACE_OVERRIDE_DIMENSION => namespace = value.as_str(),
                name if dimensions.iter().any(|(existing, _)| *existing == name) => {}
                name => dimensions.push((name, value.as_str())),
            }
        }

        let own = dimensions.len();
        for (name, value) in &self.prepopulated_dimensions {
            if !dimensions[..own]
                .iter()
                .any(|(existing, _)| *existing == name.as_str())
            {
                dimensions.push((name.as_str(), value.as_str()));
            }
        }

        if dimensions.len() > MAX_DIMENSIONS {
            return Err(SerializeError::TooManyDimensions(dimensions.len()));
        }

        Ok(Resolved {
            account,
            namespace,
            dimensions,
        })
    }
}
