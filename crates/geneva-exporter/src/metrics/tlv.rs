// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Type-length-value metric layout (event id 70).
//!
//! Body fields, in order, each as `type: u8`, `len: u16 LE`, then `len` bytes:
//!
//! | type | field | value |
//! |---|---|---|
//! | 1 | metric name | UTF-8 |
//! | 2 | account | UTF-8 |
//! | 3 | namespace | UTF-8 |
//! | 4 | dimensions | `count: u16`, `count` prefixed names, `count` prefixed values |
//! | 5 | unsigned value | `timestamp: u64`, `value: u64` |
//! | 6 | double value | `timestamp: u64`, `value: f64` |
//! | 7 | aggregated value | `count: u32`, `timestamp: u64`, `sum`, `min`, `max: u64` |
//! | 8 | histogram buckets | `count: u16`, then `bound: u64`, `count: u32` per bucket |
//! | 9 | exemplars | `version: u8`, `count: u16`, then one exemplar each |
//!
//! Timestamps are FILETIME ticks, prefixed strings are `len: u16 LE` then UTF-8, and all
//! integers are little-endian. Only one of the value fields is present; buckets and exemplars
//! are omitted when empty.

use crate::error::SerializeError;
use crate::util::to_file_time;

use super::{
    begin_record, finish_record, saturating_u32, saturating_u64, write_prefixed_str, Exemplar,
    HistogramBucket, MetricRecord, MetricValue, Resolved,
};

pub const EVENT_ID: u16 = 70;

pub const FIELD_METRIC_NAME: u8 = 1;
pub const FIELD_ACCOUNT: u8 = 2;
pub const FIELD_NAMESPACE: u8 = 3;
pub const FIELD_DIMENSIONS: u8 = 4;
pub const FIELD_ULONG_VALUE: u8 = 5;
pub const FIELD_DOUBLE_VALUE: u8 = 6;
pub const FIELD_AGGREGATED_VALUE: u8 = 7;
pub const FIELD_HISTOGRAM_BUCKETS: u8 = 8;
pub const FIELD_EXEMPLARS: u8 = 9;

pub const EXEMPLARS_VERSION: u8 = 0;

/// Exemplar flag: trace and span ids follow the timestamp.
pub const EXEMPLAR_HAS_SPAN_CONTEXT: u8 = 0x01;

pub(crate) fn encode(
    buf: &mut Vec<u8>,
    resolved: &Resolved<'_>,
    record: &MetricRecord,
) -> Result<(), SerializeError> {
    let start = begin_record(buf, EVENT_ID);
    let timestamp = to_file_time(record.timestamp);

    write_field(buf, FIELD_METRIC_NAME, "metric name", |buf| {
        buf.extend_from_slice(record.name.as_bytes());
        Ok(())
    })?;
    write_field(buf, FIELD_ACCOUNT, "account", |buf| {
        buf.extend_from_slice(resolved.account.as_bytes());
        Ok(())
    })?;
    write_field(buf, FIELD_NAMESPACE, "namespace", |buf| {
        buf.extend_from_slice(resolved.namespace.as_bytes());
        Ok(())
    })?;
    write_field(buf, FIELD_DIMENSIONS, "dimensions", |buf| {
        write_dimensions(buf, &resolved.dimensions)
    })?;

    match &record.value {
        MetricValue::ULong(value) => write_field(buf, FIELD_ULONG_VALUE, "value", |buf| {
            buf.extend_from_slice(&timestamp.to_le_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
            Ok(())
        })?,
        MetricValue::Double(value) => write_field(buf, FIELD_DOUBLE_VALUE, "value", |buf| {
            buf.extend_from_slice(&timestamp.to_le_bytes());
            buf.extend_from_slice(&value.to_le_bytes());
            Ok(())
        })?,
        MetricValue::Histogram(histogram) => {
            write_field(buf, FIELD_AGGREGATED_VALUE, "value", |buf| {
                buf.extend_from_slice(&saturating_u32(histogram.count).to_le_bytes());
                buf.extend_from_slice(&timestamp.to_le_bytes());
                buf.extend_from_slice(&saturating_u64(histogram.sum).to_le_bytes());
                buf.extend_from_slice(&saturating_u64(histogram.min).to_le_bytes());
                buf.extend_from_slice(&saturating_u64(histogram.max).to_le_bytes());
                Ok(())
            })?;

            let pairs = bucket_pairs(&histogram.buckets);
            if !pairs.is_empty() {
                write_field(buf, FIELD_HISTOGRAM_BUCKETS, "histogram buckets", |buf| {
                    let count = u16::try_from(pairs.len())
                        .map_err(|_| SerializeError::FieldTooLong("histogram buckets"))?;
                    buf.extend_from_slice(&count.to_le_bytes());
                    for (bound, count) in &pairs {
                        buf.extend_from_slice(&bound.to_le_bytes());
                        buf.extend_from_slice(&count.to_le_bytes());
                    }
                    Ok(())
                })?;
            }
        }
    }

    if !record.exemplars.is_empty() {
        write_field(buf, FIELD_EXEMPLARS, "exemplars", |buf| {
            write_exemplars(buf, &record.exemplars)
        })?;
    }

    finish_record(buf, start)?;
    Ok(())
}

/// Writes one TLV field whose value is produced by `value`.
fn write_field(
    buf: &mut Vec<u8>,
    field_type: u8,
    name: &'static str,
    value: impl FnOnce(&mut Vec<u8>) -> Result<(), SerializeError>,
) -> Result<(), SerializeError> {
    buf.push(field_type);
    let len_position = buf.len();
    buf.extend_from_slice(&[0, 0]);

    value(buf)?;

    let len = buf.len() - len_position - 2;
    let len = u16::try_from(len).map_err(|_| SerializeError::FieldTooLong(name))?;
    buf[len_position..len_position + 2].copy_from_slice(&len.to_le_bytes());
    Ok(())
}

fn write_dimensions(buf: &mut Vec<u8>, dimensions: &[(&str, &str)]) -> Result<(), SerializeError> {
    let count =
        u16::try_from(dimensions.len()).map_err(|_| SerializeError::FieldTooLong("dimensions"))?;
    buf.extend_from_slice(&count.to_le_bytes());
    for (name, _) in dimensions {
        write_prefixed_str(buf, name, "dimension name")?;
    }
    for (_, value) in dimensions {
        write_prefixed_str(buf, value, "dimension value")?;
    }
    Ok(())
}

/// Bucket bounds and counts as written on the wire.
///
/// Empty buckets are skipped. The unbounded last bucket is written with the previous bucket's
/// bound plus one, so `[100, 250, 500, 1000, +inf]` reports overflow values under `1001`.
pub(crate) fn bucket_pairs(buckets: &[HistogramBucket]) -> Vec<(u64, u32)> {
    let mut pairs = Vec::new();
    let mut last_bound = 0u64;
    for bucket in buckets {
        let bound = if bucket.upper_bound.is_finite() {
            saturating_u64(bucket.upper_bound)
        } else {
            last_bound.saturating_add(1)
        };
        if bucket.count > 0 {
            pairs.push((bound, saturating_u32(bucket.count)));
        }
        last_bound = bound;
    }
    pairs
}

fn write_exemplars(buf: &mut Vec<u8>, exemplars: &[Exemplar]) -> Result<(), SerializeError> {
    let count =
        u16::try_from(exemplars.len()).map_err(|_| SerializeError::FieldTooLong("exemplars"))?;
    buf.push(EXEMPLARS_VERSION);
    buf.extend_from_slice(&count.to_le_bytes());

    for exemplar in exemplars {
        let span_context = exemplar
            .trace_id
            .zip(exemplar.span_id)
            .filter(|(trace_id, span_id)| trace_id.is_valid() && span_id.is_valid());

        let flags = if span_context.is_some() {
            EXEMPLAR_HAS_SPAN_CONTEXT
        } else {
            0
        };
        buf.push(flags);
        buf.extend_from_slice(&exemplar.value.to_le_bytes());
        buf.extend_from_slice(&to_file_time(exemplar.timestamp).to_le_bytes());
        if let Some((trace_id, span_id)) = span_context {
            buf.extend_from_slice(&trace_id.0);
            buf.extend_from_slice(&span_id.0);
        }

        let attribute_count = u8::try_from(exemplar.filtered_attributes.len())
            .map_err(|_| SerializeError::FieldTooLong("exemplar attributes"))?;
        buf.push(attribute_count);
        for (name, value) in &exemplar.filtered_attributes {
            write_prefixed_str(buf, name, "exemplar attribute name")?;
            write_prefixed_str(buf, value, "exemplar attribute value")?;
        }
    }
    Ok(())
}
