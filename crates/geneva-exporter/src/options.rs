// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exporter options.
//!
//! Options can be built in code or deserialized from JSON, and are validated once when an
//! exporter is constructed.

use std::collections::HashMap;

use serde::Deserialize;

use crate::config::ConnectionConfig;
use crate::envelope::is_reserved_key;
use crate::error::ConfigError;
use crate::metrics::MAX_DIMENSIONS;
use crate::record::AnyValue;

/// Options shared by the log and trace exporters.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExporterOptions {
    pub connection_string: String,
    /// Category name (or `Prefix.*`, or `*`) to table name.
    pub table_name_mappings: HashMap<String, String>,
    /// Attributes written as top-level columns. `None` promotes every attribute.
    pub custom_fields: Option<Vec<String>>,
    /// Fields written on every envelope right after `env_time`.
    pub prepopulated_fields: HashMap<String, AnyValue>,
    pub exclude_exception_stack_trace: bool,
}

impl ExporterOptions {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Parses options from JSON.
    ///
    /// # Errors
    ///
    /// Fails when the JSON does not describe valid options.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Validates the options and returns the parsed connection string.
    ///
    /// # Errors
    ///
    /// Fails when the connection string does not parse, a custom field or prepopulated field
    /// name is empty, a prepopulated field uses a key the envelope writes itself, or a
    /// prepopulated value is not a scalar.
    pub fn validate(&self) -> Result<ConnectionConfig, ConfigError> {
        let config = ConnectionConfig::parse(&self.connection_string)?;

        if let Some(custom_fields) = &self.custom_fields {
            if custom_fields.iter().any(|field| field.trim().is_empty()) {
                return Err(ConfigError::InvalidOptions(
                    "custom field names cannot be empty".to_string(),
                ));
            }
        }

        for (key, value) in &self.prepopulated_fields {
            if key.trim().is_empty() {
                return Err(ConfigError::InvalidOptions(
                    "prepopulated field names cannot be empty".to_string(),
                ));
            }
            if is_reserved_key(key) {
                return Err(ConfigError::InvalidOptions(format!(
                    "prepopulated field '{key}' is a reserved envelope key"
                )));
            }
            if matches!(value, AnyValue::Array(_) | AnyValue::Bytes(_)) {
                return Err(ConfigError::InvalidOptions(format!(
                    "prepopulated field '{key}' must be a bool, number, or string"
                )));
            }
        }

        Ok(config)
    }
}

/// Binary layout used for metric records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum MetricWireFormat {
    #[default]
    #[display("tlv")]
    Tlv,
    /// Fixed layouts without histogram buckets or exemplars.
    #[display("legacy")]
    Legacy,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MetricExporterOptions {
    pub connection_string: String,
    /// Dimensions added to every metric unless the metric sets them itself.
    pub prepopulated_metric_dimensions: HashMap<String, String>,
    pub wire_format: MetricWireFormat,
}

impl MetricExporterOptions {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Parses options from JSON.
    ///
    /// # Errors
    ///
    /// Fails when the JSON does not describe valid options.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Validates the options and returns the parsed connection string.
    ///
    /// # Errors
    ///
    /// Fails when the connection string does not parse, has no account or namespace, or the
    /// prepopulated dimensions are empty-named or too many.
    pub fn validate(&self) -> Result<ConnectionConfig, ConfigError> {
        let config = ConnectionConfig::parse(&self.connection_string)?;
        config.account()?;
        config.namespace()?;

        if self
            .prepopulated_metric_dimensions
            .keys()
            .any(|name| name.trim().is_empty())
        {
            return Err(ConfigError::InvalidOptions(
                "prepopulated dimension names cannot be empty".to_string(),
            ));
        }
        if self.prepopulated_metric_dimensions.len() > MAX_DIMENSIONS {
            return Err(ConfigError::InvalidOptions(format!(
                "at most {MAX_DIMENSIONS} prepopulated dimensions are supported"
            )));
        }

        Ok(config)
    }
}
