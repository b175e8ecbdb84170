//! Core domain types for seshat
//!
//! These types form the canonical data model that normalizes transcript
//! logs from all supported AI CLI tools.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | One continuous transcript between a user and an AI CLI tool, backed by one log file |
//! | **Turn** | One user prompt plus every subsequent non-user event up to the next user prompt |
//! | **Fingerprint** | (path, modification time, size) tuple used to validate cache freshness |
//! | **Parse level** | Completeness of a cached parse: metadata < full < enriched |
//! | **Canonical file** | The single authoritative log file chosen for a session id among candidates |
//!
//! [`SessionRow`] is transient: rows are produced during a parse and
//! discarded once a [`SessionSummary`] and timeline have been derived.
//! Only summaries (wrapped in [`SessionIndexRecord`]) are persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================
// Source kinds
// ============================================

/// Supported AI CLI transcript sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Claude,
    Codex,
    Gemini,
}

impl SourceKind {
    /// Returns the display name for this source
    pub fn display_name(&self) -> &'static str {
        match self {
            SourceKind::Claude => "Claude Code",
            SourceKind::Codex => "Codex",
            SourceKind::Gemini => "Gemini CLI",
        }
    }

    /// Returns the identifier used in database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Claude => "claude",
            SourceKind::Codex => "codex",
            SourceKind::Gemini => "gemini",
        }
    }

    /// Returns the default path where this source stores logs
    pub fn default_log_path(&self) -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(match self {
            SourceKind::Claude => home.join(".claude"),
            SourceKind::Codex => home.join(".codex"),
            SourceKind::Gemini => home.join(".gemini"),
        })
    }

    /// Minimum parse level an index record of this kind must carry to be
    /// served from cache.
    ///
    /// Claude records indexed before tool-message counting landed were
    /// written at metadata level; serving them would return zero tool
    /// counts forever, so they are forced through one reparse.
    pub fn required_parse_level(&self) -> ParseLevel {
        match self {
            SourceKind::Claude => ParseLevel::Full,
            SourceKind::Codex | SourceKind::Gemini => ParseLevel::Metadata,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" | "Claude" => Ok(SourceKind::Claude),
            "codex" | "Codex" => Ok(SourceKind::Codex),
            "gemini" | "Gemini" => Ok(SourceKind::Gemini),
            _ => Err(format!("unknown source kind: {}", s)),
        }
    }
}

// ============================================
// Parse levels
// ============================================

/// Completeness of a cached parse, strictly ordered.
///
/// The derived `Ord` follows declaration order: `Metadata < Full < Enriched`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseLevel {
    /// Cheap summary-only pass (list views)
    Metadata,
    /// Full row materialization with timeline reconstruction
    Full,
    /// Full parse plus derived-metric enrichment
    Enriched,
}

impl ParseLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseLevel::Metadata => "metadata",
            ParseLevel::Full => "full",
            ParseLevel::Enriched => "enriched",
        }
    }
}

impl std::str::FromStr for ParseLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metadata" => Ok(ParseLevel::Metadata),
            "full" => Ok(ParseLevel::Full),
            "enriched" => Ok(ParseLevel::Enriched),
            _ => Err(format!("unknown parse level: {}", s)),
        }
    }
}

// ============================================
// File fingerprints
// ============================================

/// Freshness fingerprint for a log file.
///
/// Modification time is carried as integer milliseconds; float mtimes drift
/// across platforms and break exact-equality cache checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    /// Path to the log file
    pub path: PathBuf,
    /// Modification time in Unix milliseconds
    pub mtime_ms: i64,
    /// File size in bytes, when known
    pub size: Option<u64>,
}

impl FileFingerprint {
    pub fn new(path: impl Into<PathBuf>, mtime_ms: i64, size: Option<u64>) -> Self {
        Self {
            path: path.into(),
            mtime_ms,
            size,
        }
    }

    /// Build a fingerprint from filesystem metadata
    pub fn from_metadata(path: &Path, metadata: &std::fs::Metadata) -> Self {
        let mtime_ms = metadata
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            mtime_ms,
            size: Some(metadata.len()),
        }
    }

    /// A cache hit requires exact mtime equality and, when both sides
    /// provide a size, size equality. Any mismatch is a miss.
    pub fn matches(&self, mtime_ms: i64, size: Option<u64>) -> bool {
        if self.mtime_ms != mtime_ms {
            return false;
        }
        match (self.size, size) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

// ============================================
// Token accounting
// ============================================

/// Token usage breakdown for a session or a single response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBreakdown {
    pub input: i64,
    pub cached_input: i64,
    pub output: i64,
    pub reasoning: i64,
    pub total: i64,
}

impl TokenBreakdown {
    /// Accumulate reported counts.
    ///
    /// Zero and negative reported values mean "not reported" and are
    /// ignored rather than treated as subtractive.
    pub fn accumulate(&mut self, reported: &TokenBreakdown) {
        fn add(total: &mut i64, reported: i64) {
            if reported > 0 {
                *total += reported;
            }
        }
        add(&mut self.input, reported.input);
        add(&mut self.cached_input, reported.cached_input);
        add(&mut self.output, reported.output);
        add(&mut self.reasoning, reported.reasoning);
        add(&mut self.total, reported.total);
    }

    /// True when no field carries a positive count
    pub fn is_empty(&self) -> bool {
        self.input <= 0
            && self.cached_input <= 0
            && self.output <= 0
            && self.reasoning <= 0
            && self.total <= 0
    }

    /// Best-effort grand total: the reported total when present,
    /// otherwise the sum of the component fields.
    pub fn effective_total(&self) -> i64 {
        if self.total > 0 {
            self.total
        } else {
            self.input.max(0) + self.cached_input.max(0) + self.output.max(0)
                + self.reasoning.max(0)
        }
    }
}

// ============================================
// Session rows (transient parse output)
// ============================================

/// Role of the author of a response item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowRole {
    User,
    Assistant,
    Tool,
    System,
}

/// Session metadata payload, typically the first record in a log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetaRow {
    pub id: Option<String>,
    pub cwd: Option<String>,
    pub originator: Option<String>,
    pub cli_version: Option<String>,
    pub instructions: Option<String>,
    pub source_host: Option<String>,
    pub remote_path: Option<String>,
    pub user_title: Option<String>,
    pub user_comment: Option<String>,
    pub task_id: Option<String>,
}

/// Per-turn context payload (model, policy, cwd changes)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnContextRow {
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    pub cwd: Option<String>,
}

/// Loosely-typed event payload (status lines, notifications, boundaries)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessageRow {
    /// Source-specific event kind (e.g. "agent_reasoning", "token_count")
    pub kind: String,
    /// Renderable text, when the event carries any
    pub text: Option<String>,
    /// Structured payload for context/token extraction
    pub payload: serde_json::Value,
}

/// Synthetic event kind marking the end of an assistant turn.
///
/// Parsers emit these so downstream grouping stays source-agnostic.
pub const TURN_BOUNDARY_KIND: &str = "turn_boundary";

/// Event kind carrying environment context (rate limits, sandbox info)
pub const ENVIRONMENT_CONTEXT_KIND: &str = "environment_context";

/// Event kind carrying a cumulative token-usage snapshot
pub const TOKEN_COUNT_KIND: &str = "token_count";

/// A conversational message or tool interaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseItemRow {
    pub role: RowRole,
    pub text: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<serde_json::Value>,
    pub usage: Option<TokenBreakdown>,
}

impl Default for RowRole {
    fn default() -> Self {
        RowRole::System
    }
}

/// Payload of one normalized log event.
///
/// The `Unknown` variant preserves records from future log schemas
/// rather than treating them as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RowPayload {
    SessionMeta(SessionMetaRow),
    TurnContext(TurnContextRow),
    EventMessage(EventMessageRow),
    ResponseItem(ResponseItemRow),
    Unknown { raw: serde_json::Value },
}

/// One normalized log event. Produced transiently during parsing and
/// never persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRow {
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: RowPayload,
}

impl SessionRow {
    pub fn new(timestamp: Option<DateTime<Utc>>, payload: RowPayload) -> Self {
        Self { timestamp, payload }
    }

    /// Synthetic turn-boundary marker row
    pub fn turn_boundary(timestamp: Option<DateTime<Utc>>) -> Self {
        Self::new(
            timestamp,
            RowPayload::EventMessage(EventMessageRow {
                kind: TURN_BOUNDARY_KIND.to_string(),
                text: None,
                payload: serde_json::Value::Null,
            }),
        )
    }
}

// ============================================
// Session summaries
// ============================================

/// Canonical per-session record. Exactly one logical summary exists per
/// session id; candidate files mapping to the same id are deduplicated
/// by [`SessionSummary::is_preferred_over`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Unique session identifier
    pub id: String,
    /// Backing log file
    pub file_path: PathBuf,
    /// Size of the backing file in bytes
    pub file_size: u64,
    /// Which tool produced this log
    pub source: SourceKind,
    /// Host the session ran on, when the log records one
    pub source_host: Option<String>,

    // Timestamps
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_updated_at: Option<DateTime<Utc>>,
    /// Sum of per-turn active durations in milliseconds
    pub active_duration_ms: i64,

    // Provenance
    pub cli_version: Option<String>,
    pub originator: Option<String>,
    pub cwd: Option<String>,
    pub instructions: Option<String>,
    pub model: Option<String>,
    pub approval_policy: Option<String>,
    /// Deterministic project id derived from cwd
    pub project: Option<String>,

    // Counts
    pub user_message_count: i64,
    pub assistant_message_count: i64,
    pub tool_message_count: i64,
    pub turn_count: i64,
    pub event_count: i64,
    pub line_count: i64,

    // Token accounting
    pub tokens: TokenBreakdown,

    // Optional user-facing annotations
    pub remote_path: Option<String>,
    pub user_title: Option<String>,
    pub user_comment: Option<String>,
    pub task_id: Option<String>,
}

/// File stems that tools write before a session gets its real name
const PLACEHOLDER_STEMS: &[&str] = &["latest", "current", "session", "new-session"];

impl SessionSummary {
    /// Create an empty summary for a session id and backing file
    pub fn new(id: impl Into<String>, file_path: impl Into<PathBuf>, source: SourceKind) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            file_size: 0,
            source,
            source_host: None,
            started_at: None,
            ended_at: None,
            last_updated_at: None,
            active_duration_ms: 0,
            cli_version: None,
            originator: None,
            cwd: None,
            instructions: None,
            model: None,
            approval_policy: None,
            project: None,
            user_message_count: 0,
            assistant_message_count: 0,
            tool_message_count: 0,
            turn_count: 0,
            event_count: 0,
            line_count: 0,
            tokens: TokenBreakdown::default(),
            remote_path: None,
            user_title: None,
            user_comment: None,
            task_id: None,
        }
    }

    /// True when the backing file still carries a placeholder name
    pub fn has_placeholder_filename(&self) -> bool {
        self.file_path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| PLACEHOLDER_STEMS.contains(&stem))
            .unwrap_or(true)
    }

    /// Deterministic preference between two candidate files for the same
    /// session id: prefer non-placeholder filename, else newer
    /// last-updated, else larger size, else lexically smaller filename.
    pub fn is_preferred_over(&self, other: &SessionSummary) -> bool {
        let self_placeholder = self.has_placeholder_filename();
        let other_placeholder = other.has_placeholder_filename();
        if self_placeholder != other_placeholder {
            return !self_placeholder;
        }

        match (self.last_updated_at, other.last_updated_at) {
            (Some(a), Some(b)) if a != b => return a > b,
            (Some(_), None) => return true,
            (None, Some(_)) => return false,
            _ => {}
        }

        if self.file_size != other.file_size {
            return self.file_size > other.file_size;
        }

        self.file_path.file_name() < other.file_path.file_name()
    }
}

// ============================================
// Timeline events and turns
// ============================================

/// Who a timeline event is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Assistant,
    Info,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::User => "user",
            Actor::Assistant => "assistant",
            Actor::Info => "info",
        }
    }
}

/// A classified, display-ready event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub actor: Actor,
    pub title: Option<String>,
    pub text: Option<String>,
    /// Flat string-keyed metadata (tool names, event kinds)
    pub metadata: Option<BTreeMap<String, String>>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Number of consecutive identical events this one stands for (≥ 1)
    pub repeat_count: u32,
}

impl TimelineEvent {
    pub fn new(actor: Actor, timestamp: Option<DateTime<Utc>>) -> Self {
        Self {
            actor,
            title: None,
            text: None,
            metadata: None,
            timestamp,
            repeat_count: 1,
        }
    }

    /// Content equality used by duplicate collapsing; timestamps and
    /// repeat counts are deliberately excluded.
    pub fn same_content(&self, other: &TimelineEvent) -> bool {
        self.actor == other.actor
            && self.title == other.title
            && self.text == other.text
            && self.metadata == other.metadata
    }

    /// True for events carrying environment context rather than conversation
    pub fn is_environment_context(&self) -> bool {
        self.title.as_deref() == Some(ENVIRONMENT_CONTEXT_KIND)
    }
}

/// One user message (optional) plus the ordered outputs that follow it
/// until the next user message.
///
/// Invariant: a turn has a non-null user message or at least one output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user: Option<TimelineEvent>,
    pub outputs: Vec<TimelineEvent>,
}

impl ConversationTurn {
    /// The user event's timestamp, or the first output's when no user
    /// event anchors the turn.
    pub fn anchor_timestamp(&self) -> Option<DateTime<Utc>> {
        self.user
            .as_ref()
            .and_then(|e| e.timestamp)
            .or_else(|| self.outputs.first().and_then(|e| e.timestamp))
    }

    /// Timestamp of the last output, when any output carries one
    pub fn last_output_timestamp(&self) -> Option<DateTime<Utc>> {
        self.outputs.iter().rev().find_map(|e| e.timestamp)
    }

    /// A turn made up purely of environment-context events contributes
    /// nothing to active duration.
    pub fn is_environment_context(&self) -> bool {
        self.user.is_none()
            && !self.outputs.is_empty()
            && self.outputs.iter().all(|e| e.is_environment_context())
    }
}

// ============================================
// Index records
// ============================================

/// Persisted unit of the index store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndexRecord {
    pub summary: SessionSummary,
    pub fingerprint: FileFingerprint,
    pub parse_level: ParseLevel,
    /// Recorded per file; never aborts a directory-wide scan
    pub parse_error: Option<String>,
    pub parsed_at: DateTime<Utc>,
}

impl SessionIndexRecord {
    pub fn new(
        summary: SessionSummary,
        fingerprint: FileFingerprint,
        parse_level: ParseLevel,
    ) -> Self {
        Self {
            summary,
            fingerprint,
            parse_level,
            parse_error: None,
            parsed_at: Utc::now(),
        }
    }
}

// ============================================
// Rate limits (environment context)
// ============================================

/// One rate-limit window reduced from embedded structured payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub used_percent: f64,
    pub window_minutes: Option<i64>,
    pub resets_at: Option<DateTime<Utc>>,
}

/// Primary/secondary rate-limit windows extracted from a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub primary: Option<RateLimitWindow>,
    pub secondary: Option<RateLimitWindow>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.primary.is_none() && self.secondary.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_level_ordering() {
        assert!(ParseLevel::Metadata < ParseLevel::Full);
        assert!(ParseLevel::Full < ParseLevel::Enriched);
    }

    #[test]
    fn test_fingerprint_matches_requires_exact_mtime() {
        let fp = FileFingerprint::new("/tmp/a.jsonl", 1000, Some(42));
        assert!(fp.matches(1000, Some(42)));
        assert!(!fp.matches(1001, Some(42)));
    }

    #[test]
    fn test_fingerprint_size_checked_only_when_both_present() {
        let fp = FileFingerprint::new("/tmp/a.jsonl", 1000, Some(42));
        assert!(fp.matches(1000, None));
        assert!(!fp.matches(1000, Some(43)));

        let no_size = FileFingerprint::new("/tmp/a.jsonl", 1000, None);
        assert!(no_size.matches(1000, Some(99)));
    }

    #[test]
    fn test_token_accumulate_ignores_non_positive() {
        let mut total = TokenBreakdown::default();
        total.accumulate(&TokenBreakdown {
            input: 10,
            cached_input: 0,
            output: -5,
            reasoning: 3,
            total: 13,
        });
        total.accumulate(&TokenBreakdown {
            input: 2,
            ..Default::default()
        });
        assert_eq!(total.input, 12);
        assert_eq!(total.cached_input, 0);
        assert_eq!(total.output, 0);
        assert_eq!(total.reasoning, 3);
        assert_eq!(total.total, 13);
    }

    #[test]
    fn test_effective_total_falls_back_to_component_sum() {
        let tokens = TokenBreakdown {
            input: 10,
            output: 5,
            ..Default::default()
        };
        assert_eq!(tokens.effective_total(), 15);

        let reported = TokenBreakdown {
            input: 10,
            output: 5,
            total: 20,
            ..Default::default()
        };
        assert_eq!(reported.effective_total(), 20);
    }

    #[test]
    fn test_preference_non_placeholder_wins() {
        let mut named = SessionSummary::new("s1", "/logs/abc-123.jsonl", SourceKind::Codex);
        let mut placeholder = SessionSummary::new("s1", "/logs/latest.jsonl", SourceKind::Codex);
        placeholder.file_size = 9999;
        named.file_size = 1;
        assert!(named.is_preferred_over(&placeholder));
        assert!(!placeholder.is_preferred_over(&named));
    }

    #[test]
    fn test_preference_newer_then_larger_then_lexical() {
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();

        let mut a = SessionSummary::new("s1", "/logs/a.jsonl", SourceKind::Codex);
        let mut b = SessionSummary::new("s1", "/logs/b.jsonl", SourceKind::Codex);

        a.last_updated_at = Some(t1);
        b.last_updated_at = Some(t2);
        assert!(b.is_preferred_over(&a));

        b.last_updated_at = Some(t1);
        a.file_size = 100;
        b.file_size = 50;
        assert!(a.is_preferred_over(&b));

        b.file_size = 100;
        assert!(a.is_preferred_over(&b));
        assert!(!b.is_preferred_over(&a));
    }

    #[test]
    fn test_turn_anchor_falls_back_to_first_output() {
        let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let turn = ConversationTurn {
            user: None,
            outputs: vec![TimelineEvent::new(Actor::Info, Some(t1))],
        };
        assert_eq!(turn.anchor_timestamp(), Some(t1));
    }

    #[test]
    fn test_unknown_row_round_trips_raw_payload() {
        let row = SessionRow::new(
            None,
            RowPayload::Unknown {
                raw: serde_json::json!({"type": "future_thing", "x": 1}),
            },
        );
        let encoded = serde_json::to_string(&row).unwrap();
        let decoded: SessionRow = serde_json::from_str(&encoded).unwrap();
        match decoded.payload {
            RowPayload::Unknown { raw } => assert_eq!(raw["x"], 1),
            _ => panic!("expected unknown payload"),
        }
    }
}
