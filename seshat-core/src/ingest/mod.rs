//! Log discovery, parsing, and index synchronization.
//!
//! [`ScanCoordinator`] drives the incremental pipeline:
//!
//! 1. Discover candidate files across all installed sources
//! 2. Serve unchanged files from the index by fingerprint
//! 3. Parse changed files in parallel (bounded by `scan.parse_workers`)
//! 4. Deduplicate candidates mapping to the same session id
//! 5. Prune records whose files are gone, then upsert the batch

pub mod parser;
pub mod parsers;
pub mod text;
pub mod timestamp;

use crate::config::Config;
use crate::error::Result;
use crate::index::IndexStore;
use crate::timeline::{self, TimelineOptions};
use crate::types::{ConversationTurn, FileFingerprint, ParseLevel, SessionIndexRecord};
use parser::{DiscoveredFile, ParseContext, SourceParser};
use parsers::create_all_parsers;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Counters reported by a scan pass
#[derive(Debug, Default, Clone)]
pub struct ScanOutcome {
    /// Files matched by discovery
    pub files_seen: usize,
    /// Files served from the index without reparsing
    pub cache_hits: usize,
    /// Files parsed this pass
    pub parsed: usize,
    /// Files that failed to parse (still indexed with a parse_error)
    pub failed: usize,
    /// Records written to the index
    pub indexed: usize,
    /// Stale records pruned
    pub removed: usize,
}

/// A fully loaded session: its index record plus the reconstructed
/// timeline.
#[derive(Debug)]
pub struct LoadedSession {
    pub record: SessionIndexRecord,
    pub turns: Vec<ConversationTurn>,
}

pub struct ScanCoordinator {
    store: Arc<IndexStore>,
    parsers: Vec<Arc<dyn SourceParser>>,
    parse_workers: usize,
    enabled_hosts: Vec<String>,
    project_ids: Vec<String>,
    timeline_options: TimelineOptions,
}

impl ScanCoordinator {
    pub fn new(store: Arc<IndexStore>, config: &Config) -> Self {
        Self {
            store,
            parsers: create_all_parsers(&config.sources),
            parse_workers: config.scan.parse_workers.max(1),
            enabled_hosts: config.sources.enabled_hosts.clone(),
            project_ids: config.scan.project_ids.clone(),
            timeline_options: TimelineOptions::default(),
        }
    }

    /// Coordinator with an explicit parser set, for tests
    pub fn with_parsers(
        store: Arc<IndexStore>,
        parsers: Vec<Arc<dyn SourceParser>>,
        parse_workers: usize,
    ) -> Self {
        Self {
            store,
            parsers,
            parse_workers: parse_workers.max(1),
            enabled_hosts: vec![],
            project_ids: vec![],
            timeline_options: TimelineOptions::default(),
        }
    }

    /// Discover candidate files across all installed sources.
    ///
    /// A source whose discovery fails is logged and skipped; the scan
    /// continues with the rest.
    pub fn discover_files(&self) -> Vec<DiscoveredFile> {
        let mut files = Vec::new();
        for parser in &self.parsers {
            if !parser.is_installed() {
                tracing::debug!(source = %parser.source_kind(), "Source not installed, skipping");
                continue;
            }
            match parser.discover_files() {
                Ok(found) => {
                    tracing::debug!(
                        source = %parser.source_kind(),
                        count = found.len(),
                        "Discovered source files"
                    );
                    files.extend(found);
                }
                Err(e) => {
                    tracing::warn!(source = %parser.source_kind(), error = %e, "Discovery failed");
                }
            }
        }
        files
    }

    /// Run one incremental scan pass over every source.
    pub async fn scan_all(&self) -> Result<ScanOutcome> {
        let files = self.discover_files();
        let mut outcome = ScanOutcome {
            files_seen: files.len(),
            ..Default::default()
        };

        let present: HashSet<PathBuf> = files.iter().map(|f| f.path.clone()).collect();

        // Fingerprint check against the index
        let mut misses = Vec::new();
        for file in files {
            match self.store.fetch_cached(&file.fingerprint)? {
                Some(_) => outcome.cache_hits += 1,
                None => misses.push(file),
            }
        }

        // Parse misses in parallel
        let semaphore = Arc::new(Semaphore::new(self.parse_workers));
        let mut join_set = JoinSet::new();

        for file in misses {
            let Some(parser) = self.parser_for(&file) else {
                continue;
            };
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            join_set.spawn(async move {
                let _permit = permit;
                tokio::task::spawn_blocking(move || summarize_file(parser, file))
                    .await
                    .ok()
                    .flatten()
            });
        }

        let mut candidates: Vec<SessionIndexRecord> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok(Some(record)) = joined else { continue };
            outcome.parsed += 1;
            if record.parse_error.is_some() {
                outcome.failed += 1;
            }
            if self.in_scope(&record) {
                candidates.push(record);
            }
        }

        // Several files can claim the same session id; keep the
        // preferred candidate per id.
        let mut by_id: HashMap<String, SessionIndexRecord> = HashMap::new();
        for record in candidates {
            match by_id.get(&record.summary.id) {
                Some(existing) if !record.summary.is_preferred_over(&existing.summary) => {}
                _ => {
                    by_id.insert(record.summary.id.clone(), record);
                }
            }
        }

        let records: Vec<SessionIndexRecord> = by_id.into_values().collect();
        // Prune first: a stored record whose file is gone must not block
        // a surviving file's write for the same session id
        outcome.removed = self.store.remove_missing(&present)?;
        outcome.indexed = self.store.upsert_batch(&records)?;
        self.store.record_full_index(chrono::Utc::now())?;

        tracing::info!(
            files = outcome.files_seen,
            cache_hits = outcome.cache_hits,
            parsed = outcome.parsed,
            failed = outcome.failed,
            indexed = outcome.indexed,
            removed = outcome.removed,
            "Scan complete"
        );

        Ok(outcome)
    }

    /// Fully parse one session file and reconstruct its timeline.
    ///
    /// The resulting record is written back at full parse level, so list
    /// views benefit from the richer counts.
    pub async fn load_session(&self, path: &Path) -> Result<Option<LoadedSession>> {
        let Some(parser) = self.parser_for_path(path) else {
            return Ok(None);
        };

        let path = path.to_path_buf();
        let options = self.timeline_options.clone();
        let loaded = tokio::task::spawn_blocking(move || {
            let ctx = ParseContext::for_path(&path).ok()?;
            let parsed = parser.parse(&ctx)?;
            let turns = timeline::reconstruct(&parsed.rows, &options);

            let mut summary = parsed.summary;
            summary.active_duration_ms = timeline::active_duration_ms(&turns);
            summary.turn_count = turns.len() as i64;

            let fingerprint = FileFingerprint::new(&path, ctx.modified_at.timestamp_millis(), Some(ctx.file_size));
            let record = SessionIndexRecord::new(summary, fingerprint, ParseLevel::Full);
            Some(LoadedSession { record, turns })
        })
        .await
        .map_err(|e| crate::error::Error::Config(format!("parse task panicked: {}", e)))?;

        if let Some(loaded) = &loaded {
            self.store.upsert(&loaded.record)?;
        }

        Ok(loaded)
    }

    fn parser_for(&self, file: &DiscoveredFile) -> Option<Arc<dyn SourceParser>> {
        self.parsers
            .iter()
            .find(|p| p.source_kind() == file.source)
            .cloned()
    }

    /// Match a path to a parser by checking which source root contains it.
    fn parser_for_path(&self, path: &Path) -> Option<Arc<dyn SourceParser>> {
        self.parsers
            .iter()
            .find(|p| {
                p.root_path()
                    .map(|root| path.starts_with(&root))
                    .unwrap_or(false)
            })
            .cloned()
    }

    /// Apply configured host and project filters.
    fn in_scope(&self, record: &SessionIndexRecord) -> bool {
        if !self.enabled_hosts.is_empty() {
            if let Some(host) = &record.summary.source_host {
                if !self.enabled_hosts.contains(host) {
                    return false;
                }
            }
        }
        if !self.project_ids.is_empty() {
            match &record.summary.project {
                Some(project) if self.project_ids.contains(project) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Summary-parse one file into an index record.
///
/// Sources whose records must be at least full-level are parsed in full
/// (with turn-derived durations); the rest get the cheap summary pass.
/// Files the parser rejects still get a minimal record carrying a
/// parse_error, so the session shows up in listings; files with no
/// usable id hint are dropped with a warning.
fn summarize_file(
    parser: Arc<dyn SourceParser>,
    file: DiscoveredFile,
) -> Option<SessionIndexRecord> {
    let ctx = match ParseContext::for_path(&file.path) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!(path = %file.path.display(), error = %e, "Cannot stat file");
            return None;
        }
    };

    let required = parser.source_kind().required_parse_level();
    let parsed = if required >= ParseLevel::Full {
        parser.parse(&ctx).map(|parsed| {
            let turns = timeline::reconstruct(&parsed.rows, &TimelineOptions::default());
            let mut summary = parsed.summary;
            summary.active_duration_ms = timeline::active_duration_ms(&turns);
            summary.turn_count = turns.len() as i64;
            (summary, ParseLevel::Full)
        })
    } else {
        parser
            .parse_summary(&ctx)
            .map(|summary| (summary, ParseLevel::Metadata))
    };

    match parsed {
        Some((summary, level)) => Some(SessionIndexRecord::new(summary, file.fingerprint, level)),
        None => {
            let id = parser.session_id_hint(&file.path)?;
            let mut summary =
                crate::types::SessionSummary::new(id, &file.path, parser.source_kind());
            summary.file_size = ctx.file_size;
            let mut record =
                SessionIndexRecord::new(summary, file.fingerprint, ParseLevel::Metadata);
            record.parse_error = Some("unreadable or structurally invalid log".to_string());
            Some(record)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::parsers::CodexParser;
    use std::io::Write;

    fn write_rollout(root: &Path, name: &str, lines: &[&str]) -> PathBuf {
        let dir = root.join("sessions/2025/06/01");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        path
    }

    fn coordinator(root: &Path) -> (ScanCoordinator, Arc<IndexStore>) {
        let store = Arc::new(IndexStore::open_in_memory().unwrap());
        let parser: Arc<dyn SourceParser> =
            Arc::new(CodexParser::with_root(root.to_path_buf()));
        (
            ScanCoordinator::with_parsers(store.clone(), vec![parser], 2),
            store,
        )
    }

    #[tokio::test]
    async fn test_scan_then_rescan_hits_cache() {
        let tmp = tempfile::tempdir().unwrap();
        write_rollout(
            tmp.path(),
            "rollout-a.jsonl",
            &[
                r#"{"timestamp":"2025-06-01T12:00:00Z","type":"session_meta","payload":{"id":"a","cwd":"/tmp"}}"#,
                r#"{"timestamp":"2025-06-01T12:00:01Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"hi"}]}}"#,
            ],
        );

        let (coordinator, store) = coordinator(tmp.path());

        let first = coordinator.scan_all().await.unwrap();
        assert_eq!(first.files_seen, 1);
        assert_eq!(first.parsed, 1);
        assert_eq!(first.indexed, 1);
        assert_eq!(store.session_count().unwrap(), 1);

        // Unchanged file: second pass is all cache hits
        let second = coordinator.scan_all().await.unwrap();
        assert_eq!(second.cache_hits, 1);
        assert_eq!(second.parsed, 0);
        assert_eq!(store.session_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_prunes_deleted_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_rollout(
            tmp.path(),
            "rollout-a.jsonl",
            &[r#"{"timestamp":"2025-06-01T12:00:00Z","type":"session_meta","payload":{"id":"a","cwd":"/tmp"}}"#],
        );

        let (coordinator, store) = coordinator(tmp.path());
        coordinator.scan_all().await.unwrap();
        assert_eq!(store.session_count().unwrap(), 1);

        std::fs::remove_file(&path).unwrap();
        let outcome = coordinator.scan_all().await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(store.session_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_summarize_falls_back_to_filename_id() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_rollout(tmp.path(), "rollout-broken.jsonl", &["{}"]);
        let parser: Arc<dyn SourceParser> =
            Arc::new(CodexParser::with_root(tmp.path().to_path_buf()));
        let metadata = std::fs::metadata(&path).unwrap();
        let file = DiscoveredFile {
            path: path.clone(),
            source: crate::types::SourceKind::Codex,
            fingerprint: FileFingerprint::from_metadata(&path, &metadata),
        };

        let record = summarize_file(parser, file).unwrap();
        assert_eq!(record.summary.id, "rollout-broken");
        assert!(record.parse_error.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_session_ids_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let meta =
            r#"{"timestamp":"2025-06-01T12:00:00Z","type":"session_meta","payload":{"id":"dup","cwd":"/tmp"}}"#;
        let extra =
            r#"{"timestamp":"2025-06-01T12:05:00Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"hi"}]}}"#;
        write_rollout(tmp.path(), "latest.jsonl", &[meta]);
        write_rollout(tmp.path(), "rollout-real.jsonl", &[meta, extra]);

        let (coordinator, store) = coordinator(tmp.path());
        let outcome = coordinator.scan_all().await.unwrap();
        assert_eq!(outcome.parsed, 2);
        assert_eq!(outcome.indexed, 1);

        // The non-placeholder filename wins
        let record = store.get("dup").unwrap().unwrap();
        assert!(record
            .fingerprint
            .path
            .ends_with("rollout-real.jsonl"));
    }

    #[tokio::test]
    async fn test_rewritten_placeholder_does_not_displace_canonical() {
        let tmp = tempfile::tempdir().unwrap();
        let meta =
            r#"{"timestamp":"2025-06-01T12:00:00Z","type":"session_meta","payload":{"id":"dup","cwd":"/tmp"}}"#;
        let extra =
            r#"{"timestamp":"2025-06-01T12:05:00Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"hi"}]}}"#;
        write_rollout(tmp.path(), "latest.jsonl", &[meta]);
        write_rollout(tmp.path(), "rollout-real.jsonl", &[meta, extra]);

        let (coordinator, store) = coordinator(tmp.path());
        coordinator.scan_all().await.unwrap();
        let first = store.get("dup").unwrap().unwrap();
        assert!(first.fingerprint.path.ends_with("rollout-real.jsonl"));

        // Only the placeholder changes; the canonical file is a cache
        // hit and never re-enters the candidate set
        let newer =
            r#"{"timestamp":"2025-06-01T12:30:00Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"again"}]}}"#;
        write_rollout(tmp.path(), "latest.jsonl", &[meta, newer]);
        coordinator.scan_all().await.unwrap();

        let stored = store.get("dup").unwrap().unwrap();
        assert!(stored.fingerprint.path.ends_with("rollout-real.jsonl"));

        // Once the canonical file is gone the placeholder takes over
        std::fs::remove_file(tmp.path().join("sessions/2025/06/01/rollout-real.jsonl")).unwrap();
        coordinator.scan_all().await.unwrap();
        let stored = store.get("dup").unwrap().unwrap();
        assert!(stored.fingerprint.path.ends_with("latest.jsonl"));
    }

    #[tokio::test]
    async fn test_load_session_reconstructs_timeline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_rollout(
            tmp.path(),
            "rollout-a.jsonl",
            &[
                r#"{"timestamp":"2025-06-01T12:00:00Z","type":"session_meta","payload":{"id":"a","cwd":"/tmp"}}"#,
                r#"{"timestamp":"2025-06-01T12:00:01Z","type":"response_item","payload":{"type":"message","role":"user","content":[{"type":"input_text","text":"hi"}]}}"#,
                r#"{"timestamp":"2025-06-01T12:00:04Z","type":"response_item","payload":{"type":"message","role":"assistant","content":[{"type":"output_text","text":"hello"}]}}"#,
            ],
        );

        let (coordinator, store) = coordinator(tmp.path());
        let loaded = coordinator.load_session(&path).await.unwrap().unwrap();

        assert_eq!(loaded.turns.len(), 1);
        assert_eq!(loaded.record.summary.active_duration_ms, 3000);
        assert_eq!(loaded.record.parse_level, ParseLevel::Full);

        // The full-level record landed in the store
        let stored = store.get("a").unwrap().unwrap();
        assert_eq!(stored.parse_level, ParseLevel::Full);
    }
}
