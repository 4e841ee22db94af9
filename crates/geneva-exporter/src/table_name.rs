// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Category name to table name resolution.
//!
//! Log records carry a category name (usually the logger name, e.g. `MyCompany.Billing.Api`).
//! The agent routes records by table name, so every category is mapped to one:
//!
//! 1. An exact mapping for the category name.
//! 2. The longest dotted prefix mapping (`MyCompany.Billing` or `MyCompany.*`). When both
//!    are mapped, `MyCompany.*` decides for `MyCompany.<anything>`.
//! 3. The wildcard `*` mapping.
//! 4. The default table name.
//!
//! A mapping whose value is `*` passes the category name through, sanitized with
//! [`sanitize_table_name`]. Categories that sanitize to nothing are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use fnv::FnvBuildHasher;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::util::{is_valid_table_name, sanitize_table_name};

pub const DEFAULT_TABLE_NAME: &str = "Log";
pub const WILDCARD: &str = "*";

/// Maximum number of resolved categories kept in the cache.
pub const MAX_CACHED_CATEGORIES: usize = 1000;

#[derive(Clone, Debug)]
enum Target {
    Table(Arc<str>),
    PassThrough,
}

impl Target {
    fn parse(key: &str, value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        if value == WILDCARD {
            return Ok(Self::PassThrough);
        }
        if !is_valid_table_name(value) {
            return Err(ConfigError::InvalidOptions(format!(
                "table name mapping '{key}' -> '{value}' is not a valid table name"
            )));
        }
        Ok(Self::Table(Arc::from(value)))
    }
}

/// Outcome of resolving a category name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Table(Arc<str>),
    /// The category did not yield a usable table name; the record is not exported.
    Dropped,
}

impl Resolution {
    pub fn table_name(&self) -> Option<&str> {
        match self {
            Self::Table(name) => Some(name),
            Self::Dropped => None,
        }
    }
}

/// Mapping rules in precedence order.
#[derive(Debug)]
struct Rules {
    exact: HashMap<String, Target>,
    /// Sorted longest prefix first.
    prefixes: Vec<(String, Target)>,
    wildcard: Option<Target>,
    default: Target,
}

impl Rules {
    fn new(mappings: &HashMap<String, String>, default: Target) -> Result<Self, ConfigError> {
        let mut exact = HashMap::with_capacity(mappings.len());
        // Prefix to (target, declared with a trailing `*`).
        let mut by_prefix: HashMap<String, (Target, bool)> = HashMap::new();
        let mut wildcard = None;

        for (key, value) in mappings {
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidOptions(
                    "table name mapping has an empty category".to_string(),
                ));
            }
            let target = Target::parse(key, value)?;

            if key == WILDCARD {
                wildcard = Some(target);
            } else if let Some(prefix) = key.strip_suffix(WILDCARD) {
                // "Company.*" matches "Company.<anything>", "Company*" matches "Company<anything>"
                by_prefix.insert(prefix.to_string(), (target, true));
            } else {
                // "Company" also covers "Company.<anything>" unless "Company.*" is mapped too.
                by_prefix
                    .entry(format!("{key}."))
                    .or_insert_with(|| (target.clone(), false));
                exact.insert(key.to_string(), target);
            }
        }

        let mut prefixes: Vec<(String, Target)> = by_prefix
            .into_iter()
            .map(|(prefix, (target, _))| (prefix, target))
            .collect();
        prefixes.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        Ok(Self {
            exact,
            prefixes,
            wildcard,
            default,
        })
    }

    fn select(&self, category_name: &str) -> &Target {
        if let Some(target) = self.exact.get(category_name) {
            return target;
        }
        if let Some((_, target)) = self
            .prefixes
            .iter()
            .find(|(prefix, _)| category_name.starts_with(prefix.as_str()))
        {
            return target;
        }
        self.wildcard.as_ref().unwrap_or(&self.default)
    }
}

/// Resolves category names to table names, caching up to a fixed number of categories.
///
/// Once the cache is full new categories are still resolved correctly, they are just computed
/// on every call.
#[derive(Debug)]
pub struct TableNameResolver {
    rules: Rules,
    cache: RwLock<hashbrown::HashMap<Box<str>, Resolution, FnvBuildHasher>>,
    capacity: usize,
    cache_full_reported: AtomicBool,
}

impl TableNameResolver {
    /// Builds a resolver that falls back to the `Log` table.
    ///
    /// # Errors
    ///
    /// Fails when a mapped table name is not a valid table name.
    pub fn new(mappings: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::with_default_table(mappings, DEFAULT_TABLE_NAME)
    }

    /// Builds a resolver with a caller-supplied fallback table name (`*` passes categories
    /// through).
    ///
    /// # Errors
    ///
    /// Fails when the default or a mapped table name is not a valid table name.
    pub fn with_default_table(
        mappings: &HashMap<String, String>,
        default_table: &str,
    ) -> Result<Self, ConfigError> {
        let default = Target::parse("<default>", default_table)?;
        Ok(Self {
            rules: Rules::new(mappings, default)?,
            cache: RwLock::new(hashbrown::HashMap::with_hasher(FnvBuildHasher::default())),
            capacity: MAX_CACHED_CATEGORIES,
            cache_full_reported: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Resolves a category name.
    pub fn resolve(&self, category_name: &str) -> Resolution {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(resolution) = cache.get(category_name) {
                return resolution.clone();
            }
        }

        let resolution = self.resolve_uncached(category_name);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() < self.capacity {
            cache
                .entry(Box::from(category_name))
                .or_insert_with(|| resolution.clone());
        } else if !cache.contains_key(category_name)
            && !self.cache_full_reported.swap(true, Ordering::Relaxed)
        {
            warn!(
                "Table name cache reached {} entries, further categories will not be cached",
                self.capacity
            );
        }

        resolution
    }

    fn resolve_uncached(&self, category_name: &str) -> Resolution {
        match self.rules.select(category_name) {
            Target::Table(name) => Resolution::Table(Arc::clone(name)),
            Target::PassThrough => match sanitize_table_name(category_name) {
                Some(name) => Resolution::Table(Arc::from(name)),
                None => {
                    debug!("Dropping records for category '{}'", category_name);
                    Resolution::Dropped
                }
            },
        }
    }

    /// Number of categories currently cached.
    pub fn cached_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
