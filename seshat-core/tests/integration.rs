//! End-to-end tests over the fixture logs in `tests/fixtures/`.

use seshat_core::ingest::parser::SourceParser;
use seshat_core::ingest::parsers::{ClaudeParser, CodexParser, GeminiParser};
use seshat_core::ingest::ScanCoordinator;
use seshat_core::metrics::{CancelToken, DerivedMetricsCache, LineScanner, ScanMatch};
use seshat_core::timeline::context::extract_rate_limits;
use seshat_core::{
    FileFingerprint, IndexStore, ParseLevel, QueryScope, SourceKind,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn fixture_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(relative)
}

fn fixture_parsers() -> Vec<Arc<dyn SourceParser>> {
    vec![
        Arc::new(ClaudeParser::with_root(fixture_path("claude"))),
        Arc::new(CodexParser::with_root(fixture_path("codex"))),
        Arc::new(GeminiParser::with_root(fixture_path("gemini"))),
    ]
}

fn fingerprint_for(path: &Path) -> FileFingerprint {
    let metadata = std::fs::metadata(path).unwrap();
    FileFingerprint::from_metadata(path, &metadata)
}

const CLAUDE_SESSION: &str = "6b1f0c9a-4e21-4b7a-9c3d-8f5e2a7d1b42";
const CODEX_SESSION: &str = "0e8a3c5e-9a41-47d2-b3c1-5d2f8e6a7b90";
const GEMINI_SESSION: &str = "4c7d9e21-66aa-4f0b-8d35-1a2b3c4d5e6f";

/// Scanner that mimics `rg --json` by reading the files directly, so
/// metric tests do not depend on a ripgrep binary.
struct FileReadScanner;

impl LineScanner for FileReadScanner {
    async fn scan(&self, pattern: &str, files: &[PathBuf]) -> seshat_core::Result<Vec<ScanMatch>> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| seshat_core::Error::Scanner(e.to_string()))?;
        let mut matches = Vec::new();
        for path in files {
            let content = std::fs::read_to_string(path)?;
            for line in content.lines().filter(|l| re.is_match(l)) {
                matches.push(ScanMatch {
                    path: path.clone(),
                    line: line.to_string(),
                });
            }
        }
        Ok(matches)
    }
}

#[tokio::test]
async fn scan_indexes_all_sources() {
    let store = Arc::new(IndexStore::open_in_memory().unwrap());
    let coordinator = ScanCoordinator::with_parsers(store.clone(), fixture_parsers(), 4);

    let outcome = coordinator.scan_all().await.unwrap();
    assert_eq!(outcome.files_seen, 3);
    assert_eq!(outcome.parsed, 3);
    assert_eq!(outcome.failed, 0);
    assert_eq!(outcome.indexed, 3);
    assert_eq!(store.session_count().unwrap(), 3);

    let claude = store.get(CLAUDE_SESSION).unwrap().unwrap();
    assert_eq!(claude.summary.source, SourceKind::Claude);
    assert_eq!(claude.summary.cwd.as_deref(), Some("/home/dev/watcher"));
    assert_eq!(claude.summary.model.as_deref(), Some("claude-sonnet-4"));
    assert_eq!(
        claude.summary.user_title.as_deref(),
        Some("Fix flaky watcher test")
    );
    // The slash command is filtered out
    assert_eq!(claude.summary.user_message_count, 2);
    assert_eq!(claude.summary.tool_message_count, 4);
    assert_eq!(claude.summary.tokens.input, 1530);
    assert_eq!(claude.summary.tokens.cached_input, 3900);
    // Claude records are written at full level
    assert_eq!(claude.parse_level, ParseLevel::Full);
    assert_eq!(claude.summary.turn_count, 2);
    assert_eq!(claude.summary.active_duration_ms, 51_000);

    let codex = store.get(CODEX_SESSION).unwrap().unwrap();
    assert_eq!(codex.parse_level, ParseLevel::Metadata);
    assert_eq!(codex.summary.user_message_count, 2);
    assert_eq!(codex.summary.turn_count, 2);
    assert_eq!(codex.summary.model.as_deref(), Some("gpt-5"));
    // Per-turn usage summed, cumulative snapshots ignored
    assert_eq!(codex.summary.tokens.input, 1400);
    assert_eq!(codex.summary.tokens.total, 1700);
    assert_eq!(codex.summary.active_duration_ms, 20_000);

    let gemini = store.get(GEMINI_SESSION).unwrap().unwrap();
    assert_eq!(gemini.summary.source, SourceKind::Gemini);
    assert_eq!(gemini.summary.user_message_count, 2);
    assert_eq!(gemini.summary.tokens.input, 4400);
    assert_eq!(gemini.summary.tokens.reasoning, 80);
}

#[tokio::test]
async fn rescan_is_idempotent_and_served_from_cache() {
    let store = Arc::new(IndexStore::open_in_memory().unwrap());
    let coordinator = ScanCoordinator::with_parsers(store.clone(), fixture_parsers(), 4);

    coordinator.scan_all().await.unwrap();
    let first = store.get(CODEX_SESSION).unwrap().unwrap();

    let outcome = coordinator.scan_all().await.unwrap();
    assert_eq!(outcome.cache_hits, 3);
    assert_eq!(outcome.parsed, 0);
    assert_eq!(store.session_count().unwrap(), 3);

    let second = store.get(CODEX_SESSION).unwrap().unwrap();
    assert_eq!(first.summary, second.summary);
}

#[tokio::test]
async fn load_session_builds_timeline_and_upgrades_record() {
    let store = Arc::new(IndexStore::open_in_memory().unwrap());
    let coordinator = ScanCoordinator::with_parsers(store.clone(), fixture_parsers(), 4);
    coordinator.scan_all().await.unwrap();

    let record = store.get(CODEX_SESSION).unwrap().unwrap();
    let loaded = coordinator
        .load_session(&record.fingerprint.path)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(loaded.turns.len(), 2);
    let first_turn = &loaded.turns[0];
    assert_eq!(
        first_turn.user.as_ref().unwrap().text.as_deref(),
        Some("add a benchmark for the tokenizer")
    );
    // shell call, its output, and the assistant reply
    assert_eq!(first_turn.outputs.len(), 3);
    assert_eq!(loaded.record.summary.active_duration_ms, 20_000);

    // The reparse was persisted at full level
    let stored = store.get(CODEX_SESSION).unwrap().unwrap();
    assert_eq!(stored.parse_level, ParseLevel::Full);
}

#[tokio::test]
async fn downgrade_protection_survives_full_then_metadata_scan() {
    let store = Arc::new(IndexStore::open_in_memory().unwrap());
    let coordinator = ScanCoordinator::with_parsers(store.clone(), fixture_parsers(), 4);
    coordinator.scan_all().await.unwrap();

    // Upgrade the codex record to full level via a session load
    let record = store.get(CODEX_SESSION).unwrap().unwrap();
    coordinator
        .load_session(&record.fingerprint.path)
        .await
        .unwrap()
        .unwrap();

    // A fresh store-level metadata write for the unchanged file is
    // silently skipped
    let full = store.get(CODEX_SESSION).unwrap().unwrap();
    let mut downgraded = full.clone();
    downgraded.parse_level = ParseLevel::Metadata;
    downgraded.summary.user_message_count = 0;
    assert!(!store.upsert(&downgraded).unwrap());
    assert_eq!(
        store.get(CODEX_SESSION).unwrap().unwrap().parse_level,
        ParseLevel::Full
    );
}

#[tokio::test]
async fn rate_limits_extracted_from_codex_rows() {
    let parser = CodexParser::with_root(fixture_path("codex"));
    let files = parser.discover_files().unwrap();
    assert_eq!(files.len(), 1);

    let ctx = seshat_core::ingest::parser::ParseContext::for_path(&files[0].path).unwrap();
    let parsed = parser.parse(&ctx).unwrap();

    let snapshot = extract_rate_limits(&parsed.rows).unwrap();
    let primary = snapshot.primary.unwrap();
    assert_eq!(primary.used_percent, 12.5);
    assert_eq!(primary.window_minutes, Some(300));
    assert!(primary.resets_at.is_some());
    assert_eq!(snapshot.secondary.unwrap().used_percent, 4.0);
}

#[tokio::test]
async fn derived_metrics_over_fixture_logs() {
    let claude = fingerprint_for(&fixture_path(
        "claude/projects/demo-project/6b1f0c9a-4e21-4b7a-9c3d-8f5e2a7d1b42.jsonl",
    ));
    let codex = fingerprint_for(&fixture_path(
        "codex/sessions/2025/06/01/rollout-2025-06-01T10-00-00-0e8a3c5e-9a41-47d2-b3c1-5d2f8e6a7b90.jsonl",
    ));
    let files = vec![claude, codex];

    let cache = DerivedMetricsCache::open_in_memory(FileReadScanner).unwrap();
    let cancel = CancelToken::new();

    let counts = cache.tool_invocation_counts(&files, &cancel).await.unwrap();
    assert_eq!(counts.get("Bash"), Some(&1));
    assert_eq!(counts.get("Edit"), Some(&1));
    assert_eq!(counts.get("shell"), Some(&1));

    let days = cache.day_coverage("2025-06", &files, &cancel).await.unwrap();
    assert!(days.contains("2025-06-01"));
    assert!(days.contains("2025-06-02"));
    assert_eq!(days.len(), 2);

    let snapshots = cache.latest_token_snapshots(&files, &cancel).await.unwrap();
    let codex_usage = snapshots.get(&files[1].path).unwrap();
    assert_eq!(codex_usage.input, 1400);
    assert_eq!(codex_usage.total, 1700);
}

#[tokio::test]
async fn aggregates_over_scanned_store() {
    let store = Arc::new(IndexStore::open_in_memory().unwrap());
    let coordinator = ScanCoordinator::with_parsers(store.clone(), fixture_parsers(), 4);
    coordinator.scan_all().await.unwrap();

    let totals = store.totals(&QueryScope::default()).unwrap();
    assert_eq!(totals.sessions, 3);
    assert_eq!(totals.user_messages, 6);
    assert!(totals.active_duration_ms >= 51_000 + 20_000);

    let by_source = store.totals_by_source(&QueryScope::default()).unwrap();
    assert_eq!(by_source.len(), 3);

    let by_day = store.totals_by_day(&QueryScope::default()).unwrap();
    // Updated dimension: claude 06-01, codex 06-02, gemini 06-03
    let days: Vec<&str> = by_day.iter().map(|(day, _)| day.as_str()).collect();
    assert_eq!(days, vec!["2025-06-01", "2025-06-02", "2025-06-03"]);
}
