//! Two-tier derived-metric cache.
//!
//! Tier 1 is an in-process map, tier 2 a SQLite table; both key on
//! `(file path, metric, group key)` and validate entries against the
//! file's mtime. Only files whose entries are stale reach the external
//! scanner, in size-tuned batches with a breather between them.

use crate::error::Result;
use crate::metrics::{batch_size_for, CancelToken, LineScanner, MetricKind};
use crate::types::{FileFingerprint, TokenBreakdown};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS metric_values (
        file_path TEXT NOT NULL,
        metric    TEXT NOT NULL,
        group_key TEXT NOT NULL,
        mtime_ms  INTEGER NOT NULL,
        value     TEXT NOT NULL,
        PRIMARY KEY (file_path, metric, group_key)
    );
";

type MemoryKey = (PathBuf, &'static str, String);

struct CachedValue {
    mtime_ms: i64,
    value: Value,
}

pub struct DerivedMetricsCache<S: LineScanner> {
    scanner: S,
    conn: Mutex<Connection>,
    memory: Mutex<HashMap<MemoryKey, CachedValue>>,
    batch_delay: Duration,
}

impl<S: LineScanner> DerivedMetricsCache<S> {
    /// Open (creating if needed) the cache database at `path`.
    pub fn open(path: &Path, scanner: S, batch_delay_ms: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            scanner,
            conn: Mutex::new(conn),
            memory: Mutex::new(HashMap::new()),
            batch_delay: Duration::from_millis(batch_delay_ms),
        })
    }

    /// In-memory-database cache for tests
    pub fn open_in_memory(scanner: S) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            scanner,
            conn: Mutex::new(conn),
            memory: Mutex::new(HashMap::new()),
            batch_delay: Duration::ZERO,
        })
    }

    // ============================================
    // Core computation
    // ============================================

    /// Compute a metric over `files`, scanning only stale entries.
    ///
    /// Returns the per-file reductions. When `cancel` fires mid-run the
    /// loop stops between batches: batches already persisted stay valid
    /// and the unfinished files are simply absent from the result.
    pub async fn compute(
        &self,
        kind: MetricKind,
        group_key: &str,
        files: &[FileFingerprint],
        cancel: &CancelToken,
    ) -> Result<HashMap<PathBuf, Value>> {
        let mut results = HashMap::new();
        let mut stale: Vec<&FileFingerprint> = Vec::new();

        for file in files {
            match self.lookup(kind, group_key, file)? {
                Some(value) => {
                    results.insert(file.path.clone(), value);
                }
                None => stale.push(file),
            }
        }

        if stale.is_empty() {
            return Ok(results);
        }

        let pattern = kind.pattern(group_key);
        let batch_size = batch_size_for(stale.iter().filter_map(|f| f.size));
        tracing::debug!(
            metric = kind.as_str(),
            group = group_key,
            stale = stale.len(),
            batch_size,
            "Scanning stale files"
        );

        let mut first_batch = true;
        for batch in stale.chunks(batch_size) {
            if cancel.is_cancelled() {
                tracing::info!(metric = kind.as_str(), "Metric computation cancelled");
                break;
            }
            if !first_batch && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            first_batch = false;

            let paths: Vec<PathBuf> = batch.iter().map(|f| f.path.clone()).collect();
            let matches = match self.scanner.scan(&pattern, &paths).await {
                Ok(matches) => matches,
                Err(e) => {
                    // One failed batch never fails the computation
                    tracing::warn!(metric = kind.as_str(), error = %e, "Scan batch failed, skipping");
                    continue;
                }
            };

            let mut by_path: HashMap<&Path, Vec<String>> = HashMap::new();
            for m in &matches {
                by_path
                    .entry(m.path.as_path())
                    .or_default()
                    .push(m.line.clone());
            }

            // Every file in the batch gets a value, matched or not;
            // empty reductions are cached so clean files are not
            // rescanned every call.
            for file in batch {
                let lines = by_path.remove(file.path.as_path()).unwrap_or_default();
                let value = kind.reduce(group_key, &lines);
                self.store(kind, group_key, file, &value)?;
                results.insert(file.path.clone(), value);
            }
        }

        Ok(results)
    }

    // ============================================
    // Typed views
    // ============================================

    /// Union of active days across `files` for one `YYYY-MM` month.
    pub async fn day_coverage(
        &self,
        month: &str,
        files: &[FileFingerprint],
        cancel: &CancelToken,
    ) -> Result<BTreeSet<String>> {
        let per_file = self
            .compute(MetricKind::DayCoverage, month, files, cancel)
            .await?;

        let mut days = BTreeSet::new();
        for value in per_file.values() {
            if let Some(list) = value.as_array() {
                days.extend(list.iter().filter_map(|d| d.as_str().map(String::from)));
            }
        }
        Ok(days)
    }

    /// Total tool invocation counts by name across `files`.
    pub async fn tool_invocation_counts(
        &self,
        files: &[FileFingerprint],
        cancel: &CancelToken,
    ) -> Result<BTreeMap<String, i64>> {
        let per_file = self
            .compute(MetricKind::ToolInvocations, "", files, cancel)
            .await?;

        let mut totals: BTreeMap<String, i64> = BTreeMap::new();
        for value in per_file.values() {
            if let Some(map) = value.as_object() {
                for (name, count) in map {
                    *totals.entry(name.clone()).or_default() += count.as_i64().unwrap_or(0);
                }
            }
        }
        Ok(totals)
    }

    /// Latest cumulative token snapshot per file, for files that have one.
    pub async fn latest_token_snapshots(
        &self,
        files: &[FileFingerprint],
        cancel: &CancelToken,
    ) -> Result<HashMap<PathBuf, TokenBreakdown>> {
        let per_file = self
            .compute(MetricKind::TokenSnapshot, "", files, cancel)
            .await?;

        Ok(per_file
            .into_iter()
            .filter_map(|(path, value)| {
                serde_json::from_value::<TokenBreakdown>(value)
                    .ok()
                    .filter(|usage| !usage.is_empty())
                    .map(|usage| (path, usage))
            })
            .collect())
    }

    // ============================================
    // Invalidation
    // ============================================

    /// Drop every cached metric for the given files, in both tiers.
    pub fn invalidate_paths(&self, paths: &[PathBuf]) -> Result<()> {
        {
            let mut memory = self.memory.lock().unwrap();
            memory.retain(|(path, _, _), _| !paths.contains(path));
        }
        let conn = self.conn.lock().unwrap();
        for path in paths {
            conn.execute(
                "DELETE FROM metric_values WHERE file_path = ?",
                params![path.to_string_lossy()],
            )?;
        }
        Ok(())
    }

    /// Drop one metric group across all files (e.g. one month of day
    /// coverage), in both tiers.
    pub fn invalidate_group(&self, kind: MetricKind, group_key: &str) -> Result<()> {
        {
            let mut memory = self.memory.lock().unwrap();
            memory.retain(|(_, metric, group), _| {
                !(*metric == kind.as_str() && group == group_key)
            });
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM metric_values WHERE metric = ? AND group_key = ?",
            params![kind.as_str(), group_key],
        )?;
        Ok(())
    }

    // ============================================
    // Tier plumbing
    // ============================================

    /// Look up one entry, memory first, then disk; stale entries miss.
    fn lookup(
        &self,
        kind: MetricKind,
        group_key: &str,
        file: &FileFingerprint,
    ) -> Result<Option<Value>> {
        let key = (file.path.clone(), kind.as_str(), group_key.to_string());

        {
            let memory = self.memory.lock().unwrap();
            if let Some(cached) = memory.get(&key) {
                if cached.mtime_ms == file.mtime_ms {
                    return Ok(Some(cached.value.clone()));
                }
            }
        }

        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT mtime_ms, value FROM metric_values \
                 WHERE file_path = ? AND metric = ? AND group_key = ?",
                params![file.path.to_string_lossy(), kind.as_str(), group_key],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?
        };

        let Some((mtime_ms, raw)) = row else {
            return Ok(None);
        };
        if mtime_ms != file.mtime_ms {
            return Ok(None);
        }

        let value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    path = %file.path.display(),
                    metric = kind.as_str(),
                    error = %e,
                    "Dropping undecodable cached metric"
                );
                return Ok(None);
            }
        };

        // Promote to tier 1
        let mut memory = self.memory.lock().unwrap();
        memory.insert(
            key,
            CachedValue {
                mtime_ms,
                value: value.clone(),
            },
        );
        Ok(Some(value))
    }

    /// Persist one entry to both tiers.
    fn store(
        &self,
        kind: MetricKind,
        group_key: &str,
        file: &FileFingerprint,
        value: &Value,
    ) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO metric_values (file_path, metric, group_key, mtime_ms, value) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(file_path, metric, group_key) DO UPDATE SET \
                     mtime_ms = excluded.mtime_ms, value = excluded.value",
                params![
                    file.path.to_string_lossy(),
                    kind.as_str(),
                    group_key,
                    file.mtime_ms,
                    raw
                ],
            )?;
        }

        let mut memory = self.memory.lock().unwrap();
        memory.insert(
            (file.path.clone(), kind.as_str(), group_key.to_string()),
            CachedValue {
                mtime_ms: file.mtime_ms,
                value: value.clone(),
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::metrics::ScanMatch;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scanner serving canned lines, recording how it was called.
    struct FakeScanner {
        lines: HashMap<PathBuf, Vec<String>>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FakeScanner {
        fn new(lines: HashMap<PathBuf, Vec<String>>) -> Self {
            Self {
                lines,
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }
    }

    impl LineScanner for FakeScanner {
        async fn scan(&self, pattern: &str, files: &[PathBuf]) -> Result<Vec<ScanMatch>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Scanner("boom".to_string()));
            }
            let re = regex::Regex::new(pattern)
                .map_err(|e| Error::Scanner(e.to_string()))?;
            Ok(files
                .iter()
                .flat_map(|path| {
                    self.lines
                        .get(path)
                        .into_iter()
                        .flatten()
                        .filter(|line| re.is_match(line))
                        .map(|line| ScanMatch {
                            path: path.clone(),
                            line: line.clone(),
                        })
                })
                .collect())
        }
    }

    fn fingerprint(path: &str, mtime_ms: i64) -> FileFingerprint {
        FileFingerprint::new(path, mtime_ms, Some(1024))
    }

    fn tool_lines(names: &[&str]) -> Vec<String> {
        names
            .iter()
            .map(|n| format!(r#"{{"type":"tool_use","name":"{}","input":{{}}}}"#, n))
            .collect()
    }

    #[tokio::test]
    async fn test_compute_caches_by_fingerprint() {
        let path = PathBuf::from("/tmp/a.jsonl");
        let mut lines = HashMap::new();
        lines.insert(path.clone(), tool_lines(&["Bash", "Bash", "Edit"]));
        let scanner = FakeScanner::new(lines);
        let calls = scanner.calls.clone();
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();

        let files = vec![fingerprint("/tmp/a.jsonl", 1000)];
        let cancel = CancelToken::new();

        let counts = cache.tool_invocation_counts(&files, &cancel).await.unwrap();
        assert_eq!(counts.get("Bash"), Some(&2));
        assert_eq!(counts.get("Edit"), Some(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Unchanged fingerprint: served from cache, scanner not called
        let counts = cache.tool_invocation_counts(&files, &cancel).await.unwrap();
        assert_eq!(counts.get("Bash"), Some(&2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Touched file: rescanned
        let files = vec![fingerprint("/tmp/a.jsonl", 2000)];
        cache.tool_invocation_counts(&files, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_reductions_are_cached() {
        let path = PathBuf::from("/tmp/quiet.jsonl");
        let mut lines = HashMap::new();
        lines.insert(path.clone(), vec![r#"{"type":"message"}"#.to_string()]);
        let scanner = FakeScanner::new(lines);
        let calls = scanner.calls.clone();
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();

        let files = vec![fingerprint("/tmp/quiet.jsonl", 1000)];
        let cancel = CancelToken::new();

        let counts = cache.tool_invocation_counts(&files, &cancel).await.unwrap();
        assert!(counts.is_empty());
        cache.tool_invocation_counts(&files, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batching_matches_single_batch_result() {
        // Large files force the small batch size, so 40 files take
        // several scanner calls; the merged result must be identical to
        // a small-file single-batch run.
        let mut lines = HashMap::new();
        let mut large_files = Vec::new();
        let mut small_files = Vec::new();
        for i in 0..40 {
            let path = PathBuf::from(format!("/tmp/f{}.jsonl", i));
            lines.insert(path.clone(), tool_lines(&["Bash"]));
            large_files.push(FileFingerprint::new(&path, 1000, Some(2_000_000)));
            small_files.push(FileFingerprint::new(&path, 1000, Some(10)));
        }
        let cancel = CancelToken::new();

        let scanner = FakeScanner::new(lines.clone());
        let batched_calls = scanner.calls.clone();
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();
        let batched = cache
            .tool_invocation_counts(&large_files, &cancel)
            .await
            .unwrap();
        assert!(batched_calls.load(Ordering::SeqCst) > 1);

        let scanner = FakeScanner::new(lines);
        let single_calls = scanner.calls.clone();
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();
        let single = cache
            .tool_invocation_counts(&small_files, &cancel)
            .await
            .unwrap();
        assert_eq!(single_calls.load(Ordering::SeqCst), 1);

        assert_eq!(batched, single);
        assert_eq!(batched.get("Bash"), Some(&40));
    }

    #[tokio::test]
    async fn test_cancellation_stops_between_batches() {
        let mut lines = HashMap::new();
        let mut files = Vec::new();
        for i in 0..40 {
            let path = PathBuf::from(format!("/tmp/f{}.jsonl", i));
            lines.insert(path.clone(), tool_lines(&["Bash"]));
            files.push(FileFingerprint::new(&path, 1000, Some(2_000_000)));
        }
        let scanner = FakeScanner::new(lines);
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let result = cache
            .compute(MetricKind::ToolInvocations, "", &files, &cancel)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_skipped_not_fatal() {
        let path = PathBuf::from("/tmp/a.jsonl");
        let mut scanner = FakeScanner::new(HashMap::new());
        scanner.fail = true;
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();

        let files = vec![fingerprint("/tmp/a.jsonl", 1000)];
        let result = cache
            .compute(MetricKind::ToolInvocations, "", &files, &CancelToken::new())
            .await
            .unwrap();
        assert!(!result.contains_key(&path));
    }

    #[tokio::test]
    async fn test_invalidate_paths() {
        let path = PathBuf::from("/tmp/a.jsonl");
        let mut lines = HashMap::new();
        lines.insert(path.clone(), tool_lines(&["Bash"]));
        let scanner = FakeScanner::new(lines);
        let calls = scanner.calls.clone();
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();

        let files = vec![fingerprint("/tmp/a.jsonl", 1000)];
        let cancel = CancelToken::new();
        cache.tool_invocation_counts(&files, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate_paths(&[path]).unwrap();
        cache.tool_invocation_counts(&files, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_group_leaves_other_groups() {
        let path = PathBuf::from("/tmp/a.jsonl");
        let mut lines = HashMap::new();
        lines.insert(
            path.clone(),
            vec![
                r#"{"timestamp":"2025-06-02T10:00:00Z"}"#.to_string(),
                r#"{"timestamp":"2025-07-04T10:00:00Z"}"#.to_string(),
            ],
        );
        let scanner = FakeScanner::new(lines);
        let calls = scanner.calls.clone();
        let cache = DerivedMetricsCache::open_in_memory(scanner).unwrap();

        let files = vec![fingerprint("/tmp/a.jsonl", 1000)];
        let cancel = CancelToken::new();
        let june = cache.day_coverage("2025-06", &files, &cancel).await.unwrap();
        assert!(june.contains("2025-06-02"));
        let july = cache.day_coverage("2025-07", &files, &cancel).await.unwrap();
        assert!(july.contains("2025-07-04"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cache
            .invalidate_group(MetricKind::DayCoverage, "2025-06")
            .unwrap();

        // July still cached, June recomputed
        cache.day_coverage("2025-07", &files, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        cache.day_coverage("2025-06", &files, &cancel).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
