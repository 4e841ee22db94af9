// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log record envelopes.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::buffer::with_scratch;
use crate::config::PREVIEW_CORRELATION_ID_ENRICHMENT;
use crate::error::{ExportError, SerializeError};
use crate::options::ExporterOptions;
use crate::record::{AnyValue, LogRecord};
use crate::table_name::{Resolution, TableNameResolver};
use crate::transport::{self, Signal, Transport};

use super::{
    is_part_a_key, DedicatedFields, ExportOutcome, Fields, Prologue, CORRELATION_ID,
    ENV_EXCEPTION_MESSAGE, ENV_EXCEPTION_STACK, ENV_EXCEPTION_TYPE, ENV_SPAN_ID, ENV_TRACE_ID,
};

pub const NAME: &str = "name";
pub const SEVERITY_TEXT: &str = "severityText";
pub const SEVERITY_NUMBER: &str = "severityNumber";
pub const BODY: &str = "body";
pub const EVENT_ID: &str = "eventId";

/// Message template attribute, written as the body when the record has none.
pub const ORIGINAL_FORMAT: &str = "{OriginalFormat}";

pub(super) const PART_B_KEYS: [&str; 5] = [NAME, SEVERITY_TEXT, SEVERITY_NUMBER, BODY, EVENT_ID];

/// Serializes log records into envelopes and sends them to the agent.
#[derive(Debug)]
pub struct LogExporter {
    transport: Arc<dyn Transport>,
    resolver: TableNameResolver,
    prologue: Prologue,
    dedicated: DedicatedFields,
    exclude_stack_trace: bool,
    correlation_id_enrichment: bool,
}

impl LogExporter {
    /// Builds an exporter from validated options and opens its transport.
    ///
    /// # Errors
    ///
    /// Fails when the options are invalid or the selected transport is not available here.
    /// An unreachable endpoint is not an error until the first export.
    pub fn new(options: &ExporterOptions) -> Result<Self, ExportError> {
        let config = options.validate()?;
        let transport = transport::open(&config, Signal::Logs)?;
        let enrichment = config.preview_flag(PREVIEW_CORRELATION_ID_ENRICHMENT);
        Self::build(options, transport, enrichment)
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
        let config = options.validate()?;
        let enrichment = config.preview_flag(PREVIEW_CORRELATION_ID_ENRICHMENT);
        Self::build(options, transport, enrichment)
    }

    fn build(
        options: &ExporterOptions,
        transport: Arc<dyn Transport>,
        correlation_id_enrichment: bool,
    ) -> Result<Self, ExportError> {
        let resolver = TableNameResolver::new(&options.table_name_mappings)?;
        let prologue = Prologue::new(&options.prepopulated_fields)?;
        debug!(
            "Log exporter ready with {} table name mappings and {} prepopulated fields",
            options.table_name_mappings.len(),
            prologue.prepopulated_count()
        );

        Ok(Self {
            transport,
            resolver,
            prologue,
            dedicated: DedicatedFields::from_custom_fields(options.custom_fields.as_deref()),
            exclude_stack_trace: options.exclude_exception_stack_trace,
            correlation_id_enrichment,
        })
    }

    /// Serializes `record` and sends it.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be encoded or the transport rejects it.
    pub fn export(&self, record: &LogRecord) -> Result<ExportOutcome, ExportError> {
        with_scratch(|buf| match self.serialize(record, buf)? {
            ExportOutcome::Dropped => Ok(ExportOutcome::Dropped),
            ExportOutcome::Exported => {
                self.transport.send(buf)?;
                trace!("Sent log envelope of {} bytes", buf.len());
                Ok(ExportOutcome::Exported)
            }
        })
    }

    /// Appends the envelope for `record` to `buf`.
    ///
    /// Returns [`ExportOutcome::Dropped`] without writing anything when the record's category
    /// has no usable table name.
    ///
    /// # Errors
    ///
    /// Fails when the record cannot be encoded.
    /// On error `buf` is left as it was before the call.
    pub fn serialize(
        &self,
        record: &LogRecord,
        buf: &mut Vec<u8>,
    ) -> Result<ExportOutcome, SerializeError> {
        let start = buf.len();
        let result = self.write_envelope(record, buf);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn write_envelope(
        &self,
        record: &LogRecord,
        buf: &mut Vec<u8>,
    ) -> Result<ExportOutcome, SerializeError> {
        let table_name = match self.resolver.resolve(&record.category_name) {
            Resolution::Table(name) => name,
            Resolution::Dropped => return Ok(ExportOutcome::Dropped),
        };

        let mut fields = Fields::begin(buf, &self.prologue, &table_name, record.timestamp)?;

        if let Some(trace_id) = record.trace_id.filter(|id| id.is_valid()) {
            fields.hex(ENV_TRACE_ID, &trace_id.0)?;
        }
        if let Some(span_id) = record.span_id.filter(|id| id.is_valid()) {
            fields.hex(ENV_SPAN_ID, &span_id.0)?;
        }

        if let Some(exception) = &record.exception {
            fields.str(ENV_EXCEPTION_TYPE, &exception.type_name)?;
            fields.str(ENV_EXCEPTION_MESSAGE, &exception.message)?;
            if let Some(stack_trace) = exception
                .stack_trace
                .as_deref()
                .filter(|_| !self.exclude_stack_trace)
            {
                fields.str(ENV_EXCEPTION_STACK, stack_trace)?;
            }
        }

        if self.correlation_id_enrichment {
            if let Some(correlation_id) = &record.correlation_id {
                fields.str(CORRELATION_ID, correlation_id)?;
            }
        }

        let name = record
            .event_name
            .as_deref()
            .unwrap_or(&record.category_name);
        fields.str(NAME, name)?;
        fields.str(SEVERITY_TEXT, record.severity_text())?;
        fields.int(SEVERITY_NUMBER, i64::from(record.severity_number))?;

        let original_format = record
            .attributes
            .iter()
            .find(|(key, _)| key == ORIGINAL_FORMAT)
            .map(|(_, value)| value);
        if let Some(body) = record.body.as_ref().or(original_format) {
            match body {
                AnyValue::String(body) => fields.str(BODY, body)?,
                other => fields.any(BODY, other)?,
            }
        }
        if record.event_id != 0 {
            fields.int(EVENT_ID, i64::from(record.event_id))?;
        }

        fields.attributes(
            &record.attributes,
            &self.dedicated,
            |key| self.is_reserved(key),
            &[ORIGINAL_FORMAT],
        )?;

        fields.finish(&self.prologue)?;
        Ok(ExportOutcome::Exported)
    }

    fn is_reserved(&self, key: &str) -> bool {
        is_part_a_key(key) || PART_B_KEYS.contains(&key) || self.prologue.is_prepopulated(key)
    }
}
