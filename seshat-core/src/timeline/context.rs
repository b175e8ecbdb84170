//! Extraction of environment context embedded in session rows: rate-limit
//! windows and token-usage snapshots.
//!
//! Structured payloads are preferred; a flattened key search over raw
//! payloads is the fallback when no structured window decodes.

use crate::types::{
    RateLimitSnapshot, RateLimitWindow, RowPayload, SessionRow, TokenBreakdown, TOKEN_COUNT_KIND,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::BTreeMap;

/// Extract the most recent rate-limit snapshot from a row stream.
///
/// Scans newest-first for an event payload with a `rate_limits` object;
/// only when no row yields a structured window does the raw flattened
/// fallback run.
pub fn extract_rate_limits(rows: &[SessionRow]) -> Option<RateLimitSnapshot> {
    for row in rows.iter().rev() {
        let Some(payload) = event_payload(row) else {
            continue;
        };
        if let Some(limits) = payload.get("rate_limits") {
            let snapshot = decode_snapshot(limits, row.timestamp);
            if !snapshot.is_empty() {
                return Some(snapshot);
            }
        }
    }

    // Fallback: hunt flattened keys through every payload
    for row in rows.iter().rev() {
        let Some(payload) = event_payload_or_raw(row) else {
            continue;
        };
        let flat = flatten_json(payload);
        if let Some(window) = window_from_flat(&flat, row.timestamp) {
            return Some(RateLimitSnapshot {
                primary: Some(window),
                secondary: None,
            });
        }
    }

    None
}

fn event_payload(row: &SessionRow) -> Option<&Value> {
    match &row.payload {
        RowPayload::EventMessage(event) => Some(&event.payload),
        _ => None,
    }
}

fn event_payload_or_raw(row: &SessionRow) -> Option<&Value> {
    match &row.payload {
        RowPayload::EventMessage(event) => Some(&event.payload),
        RowPayload::Unknown { raw } => Some(raw),
        _ => None,
    }
}

fn decode_snapshot(limits: &Value, observed_at: Option<DateTime<Utc>>) -> RateLimitSnapshot {
    RateLimitSnapshot {
        primary: limits.get("primary").and_then(|w| decode_window(w, observed_at)),
        secondary: limits
            .get("secondary")
            .and_then(|w| decode_window(w, observed_at)),
    }
}

fn decode_window(window: &Value, observed_at: Option<DateTime<Utc>>) -> Option<RateLimitWindow> {
    let used_percent = window.get("used_percent")?.as_f64()?;
    let window_minutes = window.get("window_minutes").and_then(|v| v.as_i64());

    let resets_at = window
        .get("resets_at")
        .and_then(|v| v.as_str())
        .and_then(crate::ingest::timestamp::parse_timestamp)
        .or_else(|| {
            // Relative form: seconds from the observation time
            let seconds = window.get("resets_in_seconds").and_then(|v| v.as_i64())?;
            Some(observed_at? + Duration::seconds(seconds))
        });

    Some(RateLimitWindow {
        used_percent,
        window_minutes,
        resets_at,
    })
}

/// Build a primary window from flattened dotted keys, matching any key
/// path ending in `used_percent`.
fn window_from_flat(
    flat: &BTreeMap<String, Value>,
    observed_at: Option<DateTime<Utc>>,
) -> Option<RateLimitWindow> {
    let (key, value) = flat
        .iter()
        .find(|(k, _)| k.ends_with("used_percent"))?;
    let used_percent = value.as_f64()?;

    let prefix = key.trim_end_matches("used_percent");
    let sibling = |name: &str| flat.get(&format!("{}{}", prefix, name));

    let window_minutes = sibling("window_minutes").and_then(|v| v.as_i64());
    let resets_at = sibling("resets_at")
        .and_then(|v| v.as_str())
        .and_then(crate::ingest::timestamp::parse_timestamp)
        .or_else(|| {
            let seconds = sibling("resets_in_seconds").and_then(|v| v.as_i64())?;
            Some(observed_at? + Duration::seconds(seconds))
        });

    Some(RateLimitWindow {
        used_percent,
        window_minutes,
        resets_at,
    })
}

/// Flatten nested objects into dotted keys; arrays flatten by index.
/// Scalars at the leaves keep their JSON value.
pub fn flatten_json(value: &Value) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    flatten_into(value, String::new(), &mut out);
    out
}

fn flatten_into(value: &Value, prefix: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_into(child, child_key, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let child_key = if prefix.is_empty() {
                    i.to_string()
                } else {
                    format!("{}.{}", prefix, i)
                };
                flatten_into(child, child_key, out);
            }
        }
        leaf => {
            out.insert(prefix, leaf.clone());
        }
    }
}

/// The latest token-usage snapshot in the row stream: the newest
/// token-count event's cumulative totals, or the last per-response usage
/// when no snapshot event exists.
pub fn extract_latest_token_usage(rows: &[SessionRow]) -> Option<TokenBreakdown> {
    for row in rows.iter().rev() {
        if let RowPayload::EventMessage(event) = &row.payload {
            if event.kind == TOKEN_COUNT_KIND {
                let totals = event
                    .payload
                    .get("info")
                    .and_then(|info| info.get("total_token_usage"))
                    .or_else(|| event.payload.get("total_token_usage"))?;
                return decode_usage(totals);
            }
        }
    }

    rows.iter().rev().find_map(|row| match &row.payload {
        RowPayload::ResponseItem(item) => item.usage,
        _ => None,
    })
}

fn decode_usage(value: &Value) -> Option<TokenBreakdown> {
    let field = |name: &str| value.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    let usage = TokenBreakdown {
        input: field("input_tokens"),
        cached_input: field("cached_input_tokens"),
        output: field("output_tokens"),
        reasoning: field("reasoning_output_tokens"),
        total: field("total_tokens"),
    };
    if usage.is_empty() {
        None
    } else {
        Some(usage)
    }
}
