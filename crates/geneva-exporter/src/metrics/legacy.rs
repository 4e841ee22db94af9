// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed metric layouts understood by older agents.
//!
//! The body starts with the value section, which depends on the event id:
//!
//! - `50` unsigned: `count: u32` (always 1), `timestamp: u64`, `value: u64`
//! - `55` double: `count: u32` (always 1), `timestamp: u64`, `value: f64`
//! - `56` aggregated: `count: u32`, `timestamp: u64`, `sum`, `min`, `max: u64`
//!
//! followed by the prefixed account, namespace and metric name, `dimension_count: u16`, the
//! prefixed dimension names and then the prefixed dimension values. Histogram buckets and
//! exemplars have no place in these layouts and are not written.

use tracing::trace;

use crate::error::SerializeError;
use crate::util::to_file_time;

use super::{
    begin_record, finish_record, saturating_u32, saturating_u64, write_prefixed_str,
    MetricRecord, MetricValue, Resolved,
};

pub const ULONG_EVENT_ID: u16 = 50;
pub const DOUBLE_EVENT_ID: u16 = 55;
pub const AGGREGATED_EVENT_ID: u16 = 56;

pub(crate) fn encode(
    buf: &mut Vec<u8>,
    resolved: &Resolved<'_>,
    record: &MetricRecord,
) -> Result<(), SerializeError> {
    let timestamp = to_file_time(record.timestamp).to_le_bytes();

    let start = match &record.value {
        MetricValue::ULong(value) => {
            let start = begin_record(buf, ULONG_EVENT_ID);
            buf.extend_from_slice(&1u32.to_le_bytes());
            buf.extend_from_slice(&timestamp);
            buf.extend_from_slice(&value.to_le_bytes());
            start
        }
        MetricValue::Double(value) => {
            let start = begin_record(buf, DOUBLE_EVENT_ID);
            buf.extend_from_slice(&1u32.to_le_bytes());
            buf.extend_from_slice(&timestamp);
            buf.extend_from_slice(&value.to_le_bytes());
            start
        }
        MetricValue::Histogram(histogram) => {
            let start = begin_record(buf, AGGREGATED_EVENT_ID);
            buf.extend_from_slice(&saturating_u32(histogram.count).to_le_bytes());
            buf.extend_from_slice(&timestamp);
            buf.extend_from_slice(&saturating_u64(histogram.sum).to_le_bytes());
            buf.extend_from_slice(&saturating_u64(histogram.min).to_le_bytes());
            buf.extend_from_slice(&saturating_u64(histogram.max).to_le_bytes());
            if !histogram.buckets.is_empty() {
                trace!("Legacy layout drops histogram buckets of {}", record.name);
            }
            start
        }
    };

    write_prefixed_str(buf, resolved.account, "account")?;
    write_prefixed_str(buf, resolved.namespace, "namespace")?;
    write_prefixed_str(buf, &record.name, "metric name")?;

    let count = u16::try_from(resolved.dimensions.len())
        .map_err(|_| SerializeError::FieldTooLong("dimensions"))?;
    buf.extend_from_slice(&count.to_le_bytes());
    for (name, _) in &resolved.dimensions {
        write_prefixed_str(buf, name, "dimension name")?;
    }
    for (_, value) in &resolved.dimensions {
        write_prefixed_str(buf, value, "dimension value")?;
    }

    finish_record(buf, start)?;
    Ok(())
}
