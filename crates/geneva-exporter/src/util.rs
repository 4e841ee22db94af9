// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions shared by the serializers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum length of a table name accepted by the agent.
pub const MAX_TABLE_NAME_LENGTH: usize = 50;

/// Ticks (100ns) between 1601-01-01 and 1970-01-01.
const FILE_TIME_UNIX_EPOCH_TICKS: u64 = 116_444_736_000_000_000;

/// Sanitizes a category name into a table name.
///
/// A valid table name must:
/// - Contain only ASCII alphanumerics
/// - Start with an ASCII letter
/// - Be at most 50 characters long
///
/// Every other character is removed, a leading lowercase letter is upper-cased, and the result
/// is truncated to 50 characters.
///
/// # Returns
///
/// * `Some(String)` - The sanitized table name
/// * `None` - If nothing usable is left, in which case the record is dropped
///
/// # Examples
///
/// ```
/// use geneva_exporter::util::sanitize_table_name;
///
/// assert_eq!(sanitize_table_name("Company.Customer"), Some("CompanyCustomer".to_string()));
/// assert_eq!(sanitize_table_name("my-app"), Some("Myapp".to_string()));
/// assert_eq!(sanitize_table_name("$&-.$~!!"), None);
/// assert_eq!(sanitize_table_name("1invalid"), None);
/// ```
pub fn sanitize_table_name(category_name: &str) -> Option<String> {
    let mut sanitized: String = category_name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_TABLE_NAME_LENGTH)
        .collect();

    match sanitized.as_bytes().first() {
        None => {
            tracing::debug!(
                "Category name '{}' has no usable characters for a table name",
                category_name
            );
            return None;
        }
        Some(first) if first.is_ascii_digit() => {
            tracing::debug!(
                "Category name '{}' sanitizes to '{}' which starts with a digit",
                category_name,
                sanitized
            );
            return None;
        }
        Some(_) => {}
    }

    sanitized[..1].make_ascii_uppercase();
    Some(sanitized)
}

/// Checks that an explicitly configured table name is usable as-is.
pub fn is_valid_table_name(table_name: &str) -> bool {
    let mut chars = table_name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    table_name.len() <= MAX_TABLE_NAME_LENGTH && chars.all(|ch| ch.is_ascii_alphanumeric())
}

/// Converts a timestamp to Windows FILETIME ticks (100ns since 1601-01-01 UTC).
///
/// Timestamps before the Unix epoch clamp to the epoch.
pub fn to_file_time(time: SystemTime) -> u64 {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let ticks = since_epoch.as_secs().saturating_mul(10_000_000)
        + u64::from(since_epoch.subsec_nanos() / 100);
    FILE_TIME_UNIX_EPOCH_TICKS.saturating_add(ticks)
}

/// Splits a timestamp into whole seconds and nanoseconds since the Unix epoch.
///
/// Timestamps before the Unix epoch clamp to the epoch.
pub fn unix_seconds_and_nanos(time: SystemTime) -> (i64, u32) {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = i64::try_from(since_epoch.as_secs()).unwrap_or(i64::MAX);
    (seconds, since_epoch.subsec_nanos())
}
