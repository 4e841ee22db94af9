// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Span envelopes. Every span goes to the `Span` table.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use crate::buffer::with_scratch;
use crate::error::{ExportError, SerializeError};
use crate::options::ExporterOptions;
use crate::record::{SpanLink, SpanRecord, Status};
use crate::transport::{self, Signal, Transport};

use super::{
    is_part_a_key, DedicatedFields, ExportOutcome, Fields, Prologue, ENV_SPAN_ID, ENV_TRACE_ID,
};

pub const SPAN_TABLE_NAME: &str = "Span";

pub const NAME: &str = "name";
pub const KIND: &str = "kind";
pub const START_TIME: &str = "startTime";
pub const SUCCESS: &str = "success";
pub const STATUS_MESSAGE: &str = "statusMessage";
pub const PARENT_ID: &str = "parentId";
pub const TRACE_STATE: &str = "traceState";
pub const LINKS: &str = "links";

pub(super) const PART_B_KEYS: [&str; 8] = [
    NAME,
    KIND,
    START_TIME,
    SUCCESS,
    STATUS_MESSAGE,
    PARENT_ID,
    TRACE_STATE,
    LINKS,
];

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LinkJson {
    to_trace_id: String,
    to_span_id: String,
}

impl From<&SpanLink> for LinkJson {
    fn from(link: &SpanLink) -> Self {
        Self {
            to_trace_id: link.trace_id.to_hex(),
            to_span_id: link.span_id.to_hex(),
        }
    }
}

/// Serializes spans into envelopes and sends them to the agent.
#[derive(Debug)]
pub struct TraceExporter {
    transport: Arc<dyn Transport>,
    prologue: Prologue,
    dedicated: DedicatedFields,
}

impl TraceExporter {
    /// Builds an exporter from validated options and opens its transport.
    ///
    /// Table name mappings do not apply to spans.
    ///
    /// # Errors
    ///
    /// Fails when the options are invalid or the selected transport is not available here.
    pub fn new(options: &ExporterOptions) -> Result<Self, ExportError> {
        let config = options.validate()?;
        let transport = transport::open(&config, Signal::Traces)?;
        Self::build(options, transport)
    }

    /// Builds an exporter that sends through a caller-supplied transport.
    ///
    /// # Errors
    ///
    /// Fails when the options are invalid.
    pub fn with_transport(
        options: &ExporterOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ExportError> {
        options.validate()?;
        Self::build(options, transport)
    }

    fn build(
        options: &ExporterOptions,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ExportError> {
        let prologue = Prologue::new(&options.prepopulated_fields)?;
        debug!(
            "Trace exporter ready with {} prepopulated fields",
            prologue.prepopulated_count()
        );
        Ok(Self {
            transport,
            prologue,
            dedicated: DedicatedFields::from_custom_fields(options.custom_fields.as_deref()),
        })
    }

    /// Serializes `span` and sends it.
    ///
    /// # Errors
    ///
    /// Fails when the span cannot be encoded or the transport rejects it.
    pub fn export(&self, span: &SpanRecord) -> Result<ExportOutcome, ExportError> {
        with_scratch(|buf| {
            self.serialize(span, buf)?;
            self.transport.send(buf)?;
            trace!("Sent span envelope of {} bytes", buf.len());
            Ok(ExportOutcome::Exported)
        })
    }

    /// Appends the envelope for `span` to `buf`.
    ///
    /// # Errors
    ///
    /// Fails when the span cannot be encoded. On error `buf` is left as it was before the
    /// call.
    pub fn serialize(
        &self,
        span: &SpanRecord,
        buf: &mut Vec<u8>,
    ) -> Result<ExportOutcome, SerializeError> {
        let start = buf.len();
        let result = self.write_envelope(span, buf);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn write_envelope(
        &self,
        span: &SpanRecord,
        buf: &mut Vec<u8>,
    ) -> Result<ExportOutcome, SerializeError> {
        let mut fields = Fields::begin(buf, &self.prologue, SPAN_TABLE_NAME, span.end_time)?;

        if span.trace_id.is_valid() {
            fields.hex(ENV_TRACE_ID, &span.trace_id.0)?;
        }
        if span.span_id.is_valid() {
            fields.hex(ENV_SPAN_ID, &span.span_id.0)?;
        }

        fields.str(NAME, &span.name)?;
        fields.int(KIND, span.kind.as_i64())?;
        fields.time(START_TIME, span.start_time)?;
        match &span.status {
            Status::Error { description } => {
                fields.bool(SUCCESS, false)?;
                if let Some(description) = description.as_deref().filter(|d| !d.is_empty()) {
                    fields.str(STATUS_MESSAGE, description)?;
                }
            }
            Status::Unset | Status::Ok => fields.bool(SUCCESS, true)?,
        }
        if let Some(parent_id) = span.parent_span_id.filter(|id| id.is_valid()) {
            fields.hex(PARENT_ID, &parent_id.0)?;
        }
        if let Some(trace_state) = span.trace_state.as_deref().filter(|s| !s.is_empty()) {
            fields.str(TRACE_STATE, trace_state)?;
        }
        if !span.links.is_empty() {
            let links: Vec<LinkJson> = span.links.iter().map(LinkJson::from).collect();
            fields.str(LINKS, &serde_json::to_string(&links)?)?;
        }

        fields.attributes(
            &span.attributes,
            &self.dedicated,
            |key| self.is_reserved(key),
            &[],
        )?;

        fields.finish(&self.prologue)?;
        Ok(ExportOutcome::Exported)
    }

    fn is_reserved(&self, key: &str) -> bool {
        is_part_a_key(key) || PART_B_KEYS.contains(&key) || self.prologue.is_prepopulated(key)
    }
}
