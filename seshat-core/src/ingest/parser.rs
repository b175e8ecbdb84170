//! Parser trait abstraction
//!
//! All source parsers implement the [`SourceParser`] trait to provide a
//! unified interface for discovering and parsing transcript logs.
//!
//! ## Design Principles
//!
//! 1. **Soft failure**: unreadable or structurally invalid files return
//!    `None`; a malformed line is skipped, never fatal
//! 2. **Two-speed parsing**: `parse_summary` aggregates only enough state
//!    to build a [`SessionSummary`] without materializing the row list
//! 3. **Extensible**: new sources only require implementing this trait

use crate::error::Result;
use crate::types::{
    EventMessageRow, FileFingerprint, RowPayload, RowRole, SessionRow, SessionSummary, SourceKind,
    TokenBreakdown, TOKEN_COUNT_KIND, TURN_BOUNDARY_KIND,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Glob pattern for discovering source files, relative to the parser root.
#[derive(Debug, Clone)]
pub struct SourcePattern {
    /// Glob pattern relative to source root (e.g., "projects/*/*.jsonl")
    pub pattern: String,
    /// Human-readable description for logging
    pub description: String,
}

/// Result of a full parse: the summary plus the canonical row stream.
#[derive(Debug)]
pub struct ParsedLog {
    pub summary: SessionSummary,
    pub rows: Vec<SessionRow>,
}

/// Context passed to parsers with file metadata.
pub struct ParseContext<'a> {
    /// Path to the source file
    pub path: &'a Path,
    /// File size in bytes
    pub file_size: u64,
    /// Last modified time
    pub modified_at: DateTime<Utc>,
}

impl<'a> ParseContext<'a> {
    /// Build a context by reading filesystem metadata.
    pub fn for_path(path: &'a Path) -> std::io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            path,
            file_size: metadata.len(),
            modified_at: metadata
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

/// A candidate log file found during discovery.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub source: SourceKind,
    pub fingerprint: FileFingerprint,
}

/// Trait implemented by all source parsers.
pub trait SourceParser: Send + Sync {
    /// Which source this parser handles
    fn source_kind(&self) -> SourceKind;

    /// Root directory for this source's logs (e.g., ~/.claude).
    ///
    /// Returns `None` if the path cannot be determined (e.g., $HOME not set).
    fn root_path(&self) -> Option<PathBuf>;

    /// Check if this source is installed (root path exists)
    fn is_installed(&self) -> bool {
        self.root_path().map(|p| p.exists()).unwrap_or(false)
    }

    /// Patterns for discovering source files, relative to [`Self::root_path`].
    fn source_patterns(&self) -> Vec<SourcePattern>;

    /// Full parse: summary plus the complete row stream.
    ///
    /// Returns `None` for unreadable or structurally invalid input.
    /// Individual malformed lines are skipped, not fatal.
    fn parse(&self, ctx: &ParseContext) -> Option<ParsedLog>;

    /// Cheap summary-only parse for list views.
    ///
    /// Aggregates counters without materializing the row list.
    fn parse_summary(&self, ctx: &ParseContext) -> Option<SessionSummary>;

    /// Extract a session id from the file path alone (usually the stem).
    fn session_id_hint(&self, file_path: &Path) -> Option<String> {
        let stem = file_path.file_stem()?.to_str()?;
        Some(stem.to_string())
    }

    /// Discover all source files matching this parser's patterns.
    fn discover_files(&self) -> Result<Vec<DiscoveredFile>> {
        let root = match self.root_path() {
            Some(r) => r,
            None => return Ok(vec![]),
        };

        let mut files = Vec::new();

        for pattern in self.source_patterns() {
            let full_pattern = root.join(&pattern.pattern);
            let pattern_str = full_pattern.to_string_lossy();

            let entries = glob::glob(&pattern_str).map_err(|e| crate::error::Error::Parse {
                source_kind: self.source_kind().to_string(),
                message: format!("Invalid glob pattern: {}", e),
            })?;

            for entry in entries.flatten() {
                let Ok(metadata) = std::fs::metadata(&entry) else {
                    continue;
                };
                let fingerprint = FileFingerprint::from_metadata(&entry, &metadata);
                files.push(DiscoveredFile {
                    path: entry,
                    source: self.source_kind(),
                    fingerprint,
                });
            }
        }

        Ok(files)
    }
}

/// Generate a deterministic project id from a working directory path.
pub fn project_id_for_cwd(cwd: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cwd.as_bytes());
    let hash = hasher.finalize();
    format!("{:x}", hash)[..16].to_string()
}

/// Streaming accumulator that folds [`SessionRow`]s into a
/// [`SessionSummary`].
///
/// Used by both `parse` and `parse_summary`: the full parse collects rows
/// alongside, the summary pass feeds each row through and drops it.
pub struct SummaryAccumulator {
    summary: SessionSummary,
    /// Text samples for working-directory inference
    cwd_samples: Vec<String>,
    turn_boundaries: i64,
    /// Active-duration state machine
    turn_anchor: Option<DateTime<Utc>>,
    last_output: Option<DateTime<Utc>>,
}

/// Cap on text samples retained for cwd inference
const CWD_SAMPLE_LIMIT: usize = 64;

impl SummaryAccumulator {
    pub fn new(id: impl Into<String>, path: &Path, source: SourceKind) -> Self {
        Self {
            summary: SessionSummary::new(id, path, source),
            cwd_samples: Vec::new(),
            turn_boundaries: 0,
            turn_anchor: None,
            last_output: None,
        }
    }

    /// Count a physical line (parsed or skipped)
    pub fn observe_line(&mut self) {
        self.summary.line_count += 1;
    }

    /// Fold one row into the summary counters.
    pub fn observe(&mut self, row: &SessionRow) {
        if let Some(ts) = row.timestamp {
            if self.summary.started_at.map(|t| ts < t).unwrap_or(true) {
                self.summary.started_at = Some(ts);
            }
            if self.summary.last_updated_at.map(|t| ts > t).unwrap_or(true) {
                self.summary.last_updated_at = Some(ts);
            }
            self.summary.ended_at = Some(ts);
        }

        match &row.payload {
            RowPayload::SessionMeta(meta) => {
                if let Some(id) = &meta.id {
                    self.summary.id = id.clone();
                }
                merge_opt(&mut self.summary.cwd, &meta.cwd);
                merge_opt(&mut self.summary.originator, &meta.originator);
                merge_opt(&mut self.summary.cli_version, &meta.cli_version);
                merge_opt(&mut self.summary.instructions, &meta.instructions);
                merge_opt(&mut self.summary.source_host, &meta.source_host);
                merge_opt(&mut self.summary.remote_path, &meta.remote_path);
                merge_opt(&mut self.summary.user_title, &meta.user_title);
                merge_opt(&mut self.summary.user_comment, &meta.user_comment);
                merge_opt(&mut self.summary.task_id, &meta.task_id);
            }
            RowPayload::TurnContext(ctx) => {
                merge_opt(&mut self.summary.model, &ctx.model);
                merge_opt(&mut self.summary.approval_policy, &ctx.approval_policy);
                merge_opt(&mut self.summary.cwd, &ctx.cwd);
            }
            RowPayload::EventMessage(event) => {
                self.observe_event(event, row.timestamp);
            }
            RowPayload::ResponseItem(item) => {
                self.observe_response(item, row.timestamp);
            }
            RowPayload::Unknown { .. } => {
                self.summary.event_count += 1;
            }
        }
    }

    fn observe_event(&mut self, event: &EventMessageRow, ts: Option<DateTime<Utc>>) {
        if event.kind == TURN_BOUNDARY_KIND {
            self.turn_boundaries += 1;
            self.flush_turn_duration();
            return;
        }
        self.summary.event_count += 1;

        if event.kind == TOKEN_COUNT_KIND {
            if let Some(usage) = per_turn_usage(&event.payload) {
                self.summary.tokens.accumulate(&usage);
            }
        } else if event.text.is_some() {
            if let Some(ts) = ts {
                self.last_output = Some(ts);
            }
        }
    }

    fn observe_response(&mut self, item: &crate::types::ResponseItemRow, ts: Option<DateTime<Utc>>) {
        match item.role {
            RowRole::User => {
                self.summary.user_message_count += 1;
                self.flush_turn_duration();
                self.turn_anchor = ts;
                self.last_output = None;
            }
            RowRole::Assistant => {
                self.summary.assistant_message_count += 1;
                if let Some(ts) = ts {
                    self.last_output = Some(ts);
                }
            }
            RowRole::Tool => {
                self.summary.tool_message_count += 1;
                if let Some(ts) = ts {
                    self.last_output = Some(ts);
                }
            }
            RowRole::System => {
                self.summary.event_count += 1;
            }
        }

        if let Some(usage) = &item.usage {
            self.summary.tokens.accumulate(usage);
        }

        if self.summary.cwd.is_none() && self.cwd_samples.len() < CWD_SAMPLE_LIMIT {
            if let Some(text) = &item.text {
                self.cwd_samples.push(text.clone());
            }
            if let Some(input) = &item.tool_input {
                self.cwd_samples.push(input.to_string());
            }
        }
    }

    /// Close the open turn and add `max(0, last_output - anchor)`.
    ///
    /// Negative deltas (clock skew, out-of-order writes) contribute zero.
    fn flush_turn_duration(&mut self) {
        if let (Some(anchor), Some(last)) = (self.turn_anchor, self.last_output) {
            let delta_ms = (last - anchor).num_milliseconds();
            if delta_ms > 0 {
                self.summary.active_duration_ms += delta_ms;
            }
        }
        self.turn_anchor = None;
        self.last_output = None;
    }

    /// Finalize the summary.
    pub fn finish(mut self, file_size: u64) -> SessionSummary {
        self.flush_turn_duration();
        self.summary.file_size = file_size;

        self.summary.turn_count = self.summary.user_message_count.max(self.turn_boundaries);
        if self.summary.turn_count == 0
            && (self.summary.assistant_message_count
                + self.summary.tool_message_count
                + self.summary.event_count)
                > 0
        {
            self.summary.turn_count = 1;
        }

        if self.summary.cwd.is_none() {
            self.summary.cwd =
                super::text::infer_working_dir(self.cwd_samples.iter().map(|s| s.as_str()));
        }
        if let Some(cwd) = &self.summary.cwd {
            self.summary.project = Some(project_id_for_cwd(cwd));
        }

        self.summary
    }
}

fn merge_opt(target: &mut Option<String>, incoming: &Option<String>) {
    if target.is_none() {
        if let Some(value) = incoming {
            if !value.is_empty() {
                *target = Some(value.clone());
            }
        }
    }
}

/// Extract the per-turn token usage from a token-count event payload.
///
/// Snapshots carry both cumulative totals and the last turn's usage; only
/// the latter is safe to sum across events.
fn per_turn_usage(payload: &serde_json::Value) -> Option<TokenBreakdown> {
    let usage = payload
        .get("info")
        .and_then(|info| info.get("last_token_usage"))
        .or_else(|| payload.get("last_token_usage"))?;

    let field = |name: &str| usage.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    let breakdown = TokenBreakdown {
        input: field("input_tokens"),
        cached_input: field("cached_input_tokens"),
        output: field("output_tokens"),
        reasoning: field("reasoning_output_tokens"),
        total: field("total_tokens"),
    };
    if breakdown.is_empty() {
        None
    } else {
        Some(breakdown)
    }
}
