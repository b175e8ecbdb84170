//! Derived metrics over raw log files.
//!
//! Some facts are cheaper to pull straight out of the log text with an
//! external scanner than to recover through a full parse: which days a
//! month had activity, how often each tool was invoked, the latest
//! token snapshot. [`DerivedMetricsCache`] computes these per file and
//! caches the reductions in two tiers keyed by file fingerprint.

mod cache;
mod scanner;

pub use cache::DerivedMetricsCache;
pub use scanner::{LineScanner, RgScanner, ScanMatch};

use crate::types::TokenBreakdown;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;

// Batch sizing for the external scanner: larger files get smaller
// batches so a single invocation stays bounded.
const SMALL_FILE_BYTES: u64 = 100 * 1024;
const MEDIUM_FILE_BYTES: u64 = 500 * 1024;
const SMALL_BATCH: usize = 50;
const MEDIUM_BATCH: usize = 30;
const LARGE_BATCH: usize = 15;

/// Pick a batch size from the average size of the files to scan.
pub(crate) fn batch_size_for(sizes: impl Iterator<Item = u64>) -> usize {
    let (count, total) = sizes.fold((0u64, 0u64), |(n, sum), s| (n + 1, sum + s));
    if count == 0 {
        return SMALL_BATCH;
    }
    match total / count {
        avg if avg < SMALL_FILE_BYTES => SMALL_BATCH,
        avg if avg < MEDIUM_FILE_BYTES => MEDIUM_BATCH,
        _ => LARGE_BATCH,
    }
}

/// Cooperative cancellation flag checked between scan batches.
///
/// Cancelling never discards batches already persisted; the next
/// computation resumes from the cache.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A derivable metric.
///
/// Each kind defines the scan pattern that finds its evidence lines and
/// the per-file reduction of those lines into a cacheable JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Which UTC days inside a month group had activity
    DayCoverage,
    /// Tool invocation counts by tool name
    ToolInvocations,
    /// The latest cumulative token-usage snapshot
    TokenSnapshot,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::DayCoverage => "day_coverage",
            MetricKind::ToolInvocations => "tool_invocations",
            MetricKind::TokenSnapshot => "token_snapshot",
        }
    }

    /// Scan pattern for this metric. `group_key` narrows grouped metrics
    /// (a `YYYY-MM` month for day coverage); ungrouped metrics ignore it.
    pub fn pattern(&self, group_key: &str) -> String {
        match self {
            MetricKind::DayCoverage => {
                format!(r#""timestamp":"{}-\d{{2}}"#, regex::escape(group_key))
            }
            MetricKind::ToolInvocations => {
                r#""type":"(tool_use|function_call|local_shell_call|custom_tool_call)""#.to_string()
            }
            MetricKind::TokenSnapshot => {
                r#""total_token_usage""#.to_string()
            }
        }
    }

    /// Reduce one file's matched lines to this metric's value.
    pub fn reduce(&self, group_key: &str, lines: &[String]) -> Value {
        match self {
            MetricKind::DayCoverage => reduce_day_coverage(group_key, lines),
            MetricKind::ToolInvocations => reduce_tool_invocations(lines),
            MetricKind::TokenSnapshot => reduce_token_snapshot(lines),
        }
    }
}

fn day_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r#""timestamp":"(\d{4}-\d{2}-\d{2})"#).unwrap_or_else(|_| unreachable!())
    })
}

fn tool_name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r#""name":"([^"]+)""#).unwrap_or_else(|_| unreachable!())
    })
}

/// Sorted, deduplicated `YYYY-MM-DD` days within the month group
fn reduce_day_coverage(group_key: &str, lines: &[String]) -> Value {
    let prefix = format!("{}-", group_key);
    let mut days: Vec<String> = lines
        .iter()
        .filter_map(|line| day_pattern().captures(line))
        .map(|c| c[1].to_string())
        .filter(|day| day.starts_with(&prefix))
        .collect();
    days.sort();
    days.dedup();
    Value::from(days)
}

/// `{tool name: count}` over the matched invocation lines
fn reduce_tool_invocations(lines: &[String]) -> Value {
    let mut counts = serde_json::Map::new();
    for line in lines {
        if let Some(captures) = tool_name_pattern().captures(line) {
            let name = captures[1].to_string();
            let entry = counts.entry(name).or_insert(Value::from(0));
            if let Some(n) = entry.as_i64() {
                *entry = Value::from(n + 1);
            }
        }
    }
    Value::Object(counts)
}

/// Cumulative token totals from the newest snapshot line
fn reduce_token_snapshot(lines: &[String]) -> Value {
    for line in lines.iter().rev() {
        let Ok(parsed) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(totals) = find_key(&parsed, "total_token_usage") else {
            continue;
        };
        let field = |name: &str| totals.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
        let usage = TokenBreakdown {
            input: field("input_tokens"),
            cached_input: field("cached_input_tokens"),
            output: field("output_tokens"),
            reasoning: field("reasoning_output_tokens"),
            total: field("total_tokens"),
        };
        if !usage.is_empty() {
            if let Ok(value) = serde_json::to_value(usage) {
                return value;
            }
        }
    }
    Value::Null
}

/// Depth-first search for the first object value under `key`.
fn find_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map
            .get(key)
            .or_else(|| map.values().find_map(|v| find_key(v, key))),
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_size_thresholds() {
        assert_eq!(batch_size_for([10_000u64, 20_000].into_iter()), SMALL_BATCH);
        assert_eq!(batch_size_for([200_000u64].into_iter()), MEDIUM_BATCH);
        assert_eq!(batch_size_for([900_000u64, 700_000].into_iter()), LARGE_BATCH);
        assert_eq!(batch_size_for(std::iter::empty()), SMALL_BATCH);
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_reduce_day_coverage() {
        let lines = vec![
            r#"{"timestamp":"2025-06-01T12:00:00Z","type":"x"}"#.to_string(),
            r#"{"timestamp":"2025-06-01T15:00:00Z","type":"x"}"#.to_string(),
            r#"{"timestamp":"2025-06-03T09:00:00Z","type":"x"}"#.to_string(),
            r#"{"timestamp":"2025-07-01T09:00:00Z","type":"x"}"#.to_string(),
        ];
        let value = MetricKind::DayCoverage.reduce("2025-06", &lines);
        assert_eq!(value, serde_json::json!(["2025-06-01", "2025-06-03"]));
    }

    #[test]
    fn test_reduce_tool_invocations() {
        let lines = vec![
            r#"{"type":"tool_use","name":"Bash","input":{}}"#.to_string(),
            r#"{"type":"function_call","name":"shell","arguments":"{}"}"#.to_string(),
            r#"{"type":"tool_use","name":"Bash","input":{}}"#.to_string(),
        ];
        let value = MetricKind::ToolInvocations.reduce("", &lines);
        assert_eq!(value["Bash"], 2);
        assert_eq!(value["shell"], 1);
    }

    #[test]
    fn test_reduce_token_snapshot_takes_newest() {
        let lines = vec![
            r#"{"payload":{"info":{"total_token_usage":{"input_tokens":100,"total_tokens":120}}}}"#
                .to_string(),
            r#"{"payload":{"info":{"total_token_usage":{"input_tokens":900,"total_tokens":1000}}}}"#
                .to_string(),
        ];
        let value = MetricKind::TokenSnapshot.reduce("", &lines);
        assert_eq!(value["input"], 900);
        assert_eq!(value["total"], 1000);
    }
}
