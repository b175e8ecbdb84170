//! Claude Code session log parser.
//!
//! Logs live under `~/.claude/projects/<project-dir>/<session-id>.jsonl`,
//! one JSON record per line. Records carry a `type` discriminator
//! ("user", "assistant", "summary", ...) and a nested `message` whose
//! `content` is either a plain string or an array of typed blocks
//! (`text`, `thinking`, `tool_use`, `tool_result`).

use crate::ingest::parser::{
    ParseContext, ParsedLog, SourceParser, SourcePattern, SummaryAccumulator,
};
use crate::ingest::parsers::{content_text, environment_context_event, is_injected_context};
use crate::ingest::{text, timestamp};
use crate::types::{
    ResponseItemRow, RowPayload, RowRole, SessionMetaRow, SessionRow, SessionSummary, SourceKind,
    TokenBreakdown, TurnContextRow,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

pub struct ClaudeParser {
    root: Option<PathBuf>,
}

/// One JSONL record, with every field optional so schema drift never
/// fails the line.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawRecord {
    #[serde(rename = "type")]
    record_type: String,
    timestamp: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    cwd: Option<String>,
    version: Option<String>,
    #[serde(rename = "isSidechain")]
    is_sidechain: bool,
    message: Option<serde_json::Value>,
    /// Conversation title written by `type: "summary"` records
    summary: Option<String>,
}

impl ClaudeParser {
    pub fn new() -> Self {
        Self {
            root: dirs::home_dir().map(|h| h.join(".claude")),
        }
    }

    /// Parser rooted at a specific directory, for tests and overrides
    pub fn with_root(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }

    /// Shared walk used by both parse modes; `collect` controls whether
    /// rows are materialized.
    fn scan(&self, ctx: &ParseContext, collect: bool) -> Option<(SessionSummary, Vec<SessionRow>)> {
        let file = match File::open(ctx.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %ctx.path.display(), error = %e, "Cannot open claude log");
                return None;
            }
        };
        let reader = BufReader::new(file);

        let fallback_id = self
            .session_id_hint(ctx.path)
            .unwrap_or_else(|| "unknown".to_string());
        let mut acc = SummaryAccumulator::new(fallback_id, ctx.path, SourceKind::Claude);
        let mut rows = Vec::new();
        let mut state = RecordState::default();

        for line in reader.lines() {
            let Ok(line) = line else { continue };
            acc.observe_line();
            if line.trim().is_empty() {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(path = %ctx.path.display(), error = %e, "Skipping malformed line");
                    continue;
                }
            };
            let raw = match RawRecord::deserialize(&value) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(path = %ctx.path.display(), error = %e, "Skipping malformed line");
                    continue;
                }
            };

            for row in rows_for_record(raw, &value, &mut state) {
                acc.observe(&row);
                if collect {
                    rows.push(row);
                }
            }
        }

        Some((acc.finish(ctx.file_size), rows))
    }
}

impl Default for ClaudeParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-record parse state: what has already been synthesized.
#[derive(Default)]
struct RecordState {
    meta_emitted: bool,
    model_emitted: bool,
}

/// Expand one record into normalized rows.
///
/// A single assistant record can yield several rows: one per text block
/// plus one per tool invocation.
fn rows_for_record(
    raw: RawRecord,
    value: &serde_json::Value,
    state: &mut RecordState,
) -> Vec<SessionRow> {
    if raw.is_sidechain {
        return vec![];
    }

    let ts = raw
        .timestamp
        .as_deref()
        .and_then(timestamp::parse_timestamp);
    let mut rows = Vec::new();

    // The log has no dedicated meta record; synthesize one from the
    // envelope fields of the first record that carries them.
    if !state.meta_emitted && (raw.session_id.is_some() || raw.cwd.is_some()) {
        state.meta_emitted = true;
        rows.push(SessionRow::new(
            ts,
            RowPayload::SessionMeta(SessionMetaRow {
                id: raw.session_id.clone(),
                cwd: raw.cwd.clone(),
                cli_version: raw.version.clone(),
                ..Default::default()
            }),
        ));
    }

    match raw.record_type.as_str() {
        "summary" => {
            if let Some(title) = raw.summary {
                rows.push(SessionRow::new(
                    ts,
                    RowPayload::SessionMeta(SessionMetaRow {
                        user_title: Some(title),
                        ..Default::default()
                    }),
                ));
            }
        }
        "user" => {
            if let Some(message) = &raw.message {
                rows.extend(user_rows(message, ts));
            }
        }
        "assistant" => {
            if let Some(message) = &raw.message {
                rows.extend(assistant_rows(message, ts, state));
            }
        }
        // Forward compatibility: unrecognized record types keep their
        // whole document so raw-fallback extraction can still see them
        _ => {
            rows.push(SessionRow::new(
                ts,
                RowPayload::Unknown { raw: value.clone() },
            ));
        }
    }

    rows
}

fn user_rows(
    message: &serde_json::Value,
    ts: Option<chrono::DateTime<chrono::Utc>>,
) -> Vec<SessionRow> {
    let mut rows = Vec::new();

    if let Some(body) = content_text(&message["content"], &["text"]) {
        if text::is_control_command(&body) {
            // Slash commands are UI input, not conversation
        } else if is_injected_context(&body) {
            rows.push(SessionRow::new(
                ts,
                RowPayload::EventMessage(environment_context_event(body)),
            ));
        } else {
            rows.push(SessionRow::new(
                ts,
                RowPayload::ResponseItem(ResponseItemRow {
                    role: RowRole::User,
                    text: Some(body),
                    ..Default::default()
                }),
            ));
        }
    }

    // Tool results arrive wrapped in user records
    if let Some(blocks) = message["content"].as_array() {
        for block in blocks {
            if block["type"].as_str() == Some("tool_result") {
                let result_text = content_text(&block["content"], &["text"])
                    .or_else(|| block["content"].as_str().map(str::to_string));
                if let Some(result_text) = result_text {
                    rows.push(SessionRow::new(
                        ts,
                        RowPayload::ResponseItem(ResponseItemRow {
                            role: RowRole::Tool,
                            text: Some(result_text),
                            ..Default::default()
                        }),
                    ));
                }
            }
        }
    }

    rows
}

fn assistant_rows(
    message: &serde_json::Value,
    ts: Option<chrono::DateTime<chrono::Utc>>,
    state: &mut RecordState,
) -> Vec<SessionRow> {
    let mut rows = Vec::new();

    if !state.model_emitted {
        if let Some(model) = message["model"].as_str() {
            state.model_emitted = true;
            rows.push(SessionRow::new(
                ts,
                RowPayload::TurnContext(TurnContextRow {
                    model: Some(model.to_string()),
                    ..Default::default()
                }),
            ));
        }
    }

    let mut usage = parse_usage(&message["usage"]);

    if let Some(blocks) = message["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(body) = block["text"].as_str().filter(|t| !t.is_empty()) {
                        rows.push(SessionRow::new(
                            ts,
                            RowPayload::ResponseItem(ResponseItemRow {
                                role: RowRole::Assistant,
                                text: Some(body.to_string()),
                                usage: usage.take(),
                                ..Default::default()
                            }),
                        ));
                    }
                }
                Some("thinking") => {
                    if let Some(body) = block["thinking"].as_str().filter(|t| !t.is_empty()) {
                        rows.push(SessionRow::new(
                            ts,
                            RowPayload::EventMessage(crate::types::EventMessageRow {
                                kind: "agent_reasoning".to_string(),
                                text: Some(body.to_string()),
                                payload: serde_json::Value::Null,
                            }),
                        ));
                    }
                }
                Some("tool_use") => {
                    rows.push(SessionRow::new(
                        ts,
                        RowPayload::ResponseItem(ResponseItemRow {
                            role: RowRole::Tool,
                            tool_name: block["name"].as_str().map(str::to_string),
                            tool_input: Some(block["input"].clone()),
                            usage: usage.take(),
                            ..Default::default()
                        }),
                    ));
                }
                _ => {}
            }
        }
    } else if let Some(body) = message["content"].as_str().filter(|t| !t.is_empty()) {
        rows.push(SessionRow::new(
            ts,
            RowPayload::ResponseItem(ResponseItemRow {
                role: RowRole::Assistant,
                text: Some(body.to_string()),
                usage: usage.take(),
                ..Default::default()
            }),
        ));
    }

    rows
}

/// Map the per-message usage object onto a token breakdown.
fn parse_usage(usage: &serde_json::Value) -> Option<TokenBreakdown> {
    if !usage.is_object() {
        return None;
    }
    let field = |name: &str| usage.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    let input = field("input_tokens");
    let cached = field("cache_read_input_tokens");
    let output = field("output_tokens");
    let breakdown = TokenBreakdown {
        input,
        cached_input: cached,
        output,
        reasoning: 0,
        total: input + cached + field("cache_creation_input_tokens") + output,
    };
    if breakdown.is_empty() {
        None
    } else {
        Some(breakdown)
    }
}

impl SourceParser for ClaudeParser {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Claude
    }

    fn root_path(&self) -> Option<PathBuf> {
        self.root.clone()
    }

    fn source_patterns(&self) -> Vec<SourcePattern> {
        vec![SourcePattern {
            pattern: "projects/*/*.jsonl".to_string(),
            description: "Claude Code project session logs".to_string(),
        }]
    }

    fn parse(&self, ctx: &ParseContext) -> Option<ParsedLog> {
        let (summary, rows) = self.scan(ctx, true)?;
        Some(ParsedLog { summary, rows })
    }

    fn parse_summary(&self, ctx: &ParseContext) -> Option<SessionSummary> {
        self.scan(ctx, false).map(|(summary, _)| summary)
    }
}
