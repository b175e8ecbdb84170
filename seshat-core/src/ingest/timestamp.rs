//! Timestamp parsing shared by all source parsers.
//!
//! Logs carry timestamps in several shapes: RFC 3339 with or without
//! fractional seconds, naive ISO-8601 without an offset, and numeric
//! epochs in either seconds or milliseconds. Parsing tries each stage in
//! order and returns `None` rather than failing the row.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

/// Epoch values above this are interpreted as milliseconds
const EPOCH_MS_THRESHOLD: i64 = 10_000_000_000;

/// Parse a timestamp from a raw JSON value (string or number).
pub fn parse_timestamp_value(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => parse_timestamp(s),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                from_epoch(i)
            } else {
                n.as_f64().and_then(|f| from_epoch(f as i64))
            }
        }
        _ => None,
    }
}

/// Parse a timestamp string, trying fractional ISO-8601, plain ISO-8601,
/// then numeric epoch.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    // Naive forms without a UTC offset are treated as UTC
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Ok(i) = raw.parse::<i64>() {
        return from_epoch(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return from_epoch(f as i64);
    }

    None
}

/// Convert a numeric epoch to a timestamp.
///
/// Magnitudes above ten billion are milliseconds, anything smaller is
/// seconds.
pub fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}
