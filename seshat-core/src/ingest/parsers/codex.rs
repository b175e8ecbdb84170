//! Codex CLI rollout log parser.
//!
//! Logs live under `~/.codex/sessions/YYYY/MM/DD/rollout-<ts>-<uuid>.jsonl`.
//! Every line is an envelope `{timestamp, type, payload}` where `type` is
//! one of `session_meta`, `turn_context`, `event_msg`, or `response_item`.
//!
//! The format has explicit turn-end events (`task_complete`); the parser
//! rewrites them into synthetic boundary rows so downstream grouping does
//! not need to know the source.

use crate::ingest::parser::{
    ParseContext, ParsedLog, SourceParser, SourcePattern, SummaryAccumulator,
};
use crate::ingest::parsers::{content_text, environment_context_event, is_injected_context};
use crate::ingest::{text, timestamp};
use crate::types::{
    EventMessageRow, ResponseItemRow, RowPayload, RowRole, SessionMetaRow, SessionRow,
    SessionSummary, SourceKind, TurnContextRow,
};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub struct CodexParser {
    root: Option<PathBuf>,
}

/// Envelope shared by every rollout line
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawLine {
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    payload: serde_json::Value,
}

/// Event kinds that end an assistant turn
const TURN_END_KINDS: &[&str] = &["task_complete", "turn_aborted"];

impl CodexParser {
    pub fn new() -> Self {
        Self {
            root: dirs::home_dir().map(|h| h.join(".codex")),
        }
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }

    fn scan(&self, ctx: &ParseContext, collect: bool) -> Option<(SessionSummary, Vec<SessionRow>)> {
        let file = match File::open(ctx.path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %ctx.path.display(), error = %e, "Cannot open codex log");
                return None;
            }
        };
        let reader = BufReader::new(file);

        let fallback_id = self
            .session_id_hint(ctx.path)
            .unwrap_or_else(|| "unknown".to_string());
        let mut acc = SummaryAccumulator::new(fallback_id, ctx.path, SourceKind::Codex);
        let mut rows = Vec::new();

        for line in reader.lines() {
            let Ok(line) = line else { continue };
            acc.observe_line();
            if line.trim().is_empty() {
                continue;
            }

            let raw: RawLine = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(path = %ctx.path.display(), error = %e, "Skipping malformed line");
                    continue;
                }
            };

            for row in rows_for_line(raw) {
                acc.observe(&row);
                if collect {
                    rows.push(row);
                }
            }
        }

        Some((acc.finish(ctx.file_size), rows))
    }
}

impl Default for CodexParser {
    fn default() -> Self {
        Self::new()
    }
}

fn rows_for_line(raw: RawLine) -> Vec<SessionRow> {
    let ts = raw
        .timestamp
        .as_deref()
        .and_then(timestamp::parse_timestamp);
    let payload = raw.payload;

    match raw.kind.as_deref() {
        Some("session_meta") => vec![SessionRow::new(ts, meta_payload(&payload))],
        Some("turn_context") => vec![SessionRow::new(
            ts,
            RowPayload::TurnContext(TurnContextRow {
                model: json_str(&payload, "model"),
                approval_policy: json_str(&payload, "approval_policy"),
                cwd: json_str(&payload, "cwd"),
            }),
        )],
        Some("event_msg") => event_rows(&payload, ts),
        Some("response_item") => response_rows(&payload, ts),
        _ => vec![SessionRow::new(ts, RowPayload::Unknown { raw: payload })],
    }
}

fn meta_payload(payload: &serde_json::Value) -> RowPayload {
    RowPayload::SessionMeta(SessionMetaRow {
        id: json_str(payload, "id"),
        cwd: json_str(payload, "cwd"),
        originator: json_str(payload, "originator"),
        cli_version: json_str(payload, "cli_version"),
        instructions: json_str(payload, "instructions"),
        source_host: json_str(payload, "source_host")
            .or_else(|| json_str(payload, "host")),
        ..Default::default()
    })
}

fn event_rows(
    payload: &serde_json::Value,
    ts: Option<chrono::DateTime<chrono::Utc>>,
) -> Vec<SessionRow> {
    let Some(kind) = json_str(payload, "type") else {
        return vec![SessionRow::new(
            ts,
            RowPayload::Unknown {
                raw: payload.clone(),
            },
        )];
    };

    let event_text = json_str(payload, "message").or_else(|| json_str(payload, "text"));
    let mut rows = vec![SessionRow::new(
        ts,
        RowPayload::EventMessage(EventMessageRow {
            kind: kind.clone(),
            text: event_text,
            payload: payload.clone(),
        }),
    )];

    // Terminal events close the current turn
    if TURN_END_KINDS.contains(&kind.as_str()) {
        rows.push(SessionRow::turn_boundary(ts));
    }

    rows
}

fn response_rows(
    payload: &serde_json::Value,
    ts: Option<chrono::DateTime<chrono::Utc>>,
) -> Vec<SessionRow> {
    match json_str(payload, "type").as_deref() {
        Some("message") => {
            let role = match json_str(payload, "role").as_deref() {
                Some("user") => RowRole::User,
                Some("assistant") => RowRole::Assistant,
                Some("system") => RowRole::System,
                _ => RowRole::System,
            };
            let body = content_text(&payload["content"], &["input_text", "output_text", "text"]);
            let Some(body) = body else { return vec![] };

            if role == RowRole::User {
                if text::is_control_command(&body) {
                    return vec![];
                }
                if is_injected_context(&body) {
                    return vec![SessionRow::new(
                        ts,
                        RowPayload::EventMessage(environment_context_event(body)),
                    )];
                }
            }

            vec![SessionRow::new(
                ts,
                RowPayload::ResponseItem(ResponseItemRow {
                    role,
                    text: Some(body),
                    ..Default::default()
                }),
            )]
        }
        Some("function_call") | Some("local_shell_call") | Some("custom_tool_call") => {
            let tool_input = json_str(payload, "arguments")
                .and_then(|args| serde_json::from_str(&args).ok())
                .or_else(|| payload.get("arguments").cloned())
                .or_else(|| payload.get("action").cloned());
            vec![SessionRow::new(
                ts,
                RowPayload::ResponseItem(ResponseItemRow {
                    role: RowRole::Tool,
                    tool_name: json_str(payload, "name"),
                    tool_input,
                    ..Default::default()
                }),
            )]
        }
        Some("function_call_output") | Some("custom_tool_call_output") => {
            let output = json_str(payload, "output").or_else(|| {
                payload
                    .get("output")
                    .and_then(|o| o.get("content"))
                    .and_then(|c| c.as_str())
                    .map(str::to_string)
            });
            let Some(output) = output else { return vec![] };
            vec![SessionRow::new(
                ts,
                RowPayload::ResponseItem(ResponseItemRow {
                    role: RowRole::Tool,
                    text: Some(output),
                    ..Default::default()
                }),
            )]
        }
        Some("reasoning") => {
            let body = payload
                .get("summary")
                .map(|s| content_text(s, &["summary_text", "text"]))
                .unwrap_or(None);
            match body {
                Some(body) => vec![SessionRow::new(
                    ts,
                    RowPayload::EventMessage(EventMessageRow {
                        kind: "agent_reasoning".to_string(),
                        text: Some(body),
                        payload: serde_json::Value::Null,
                    }),
                )],
                None => vec![],
            }
        }
        _ => vec![SessionRow::new(
            ts,
            RowPayload::Unknown {
                raw: payload.clone(),
            },
        )],
    }
}

fn json_str(value: &serde_json::Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl SourceParser for CodexParser {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Codex
    }

    fn root_path(&self) -> Option<PathBuf> {
        self.root.clone()
    }

    fn source_patterns(&self) -> Vec<SourcePattern> {
        vec![SourcePattern {
            pattern: "sessions/**/*.jsonl".to_string(),
            description: "Codex CLI rollout logs".to_string(),
        }]
    }

    /// Rollout stems look like `rollout-2025-06-01T12-00-00-<uuid>`; the
    /// uuid suffix is the session id.
    fn session_id_hint(&self, file_path: &Path) -> Option<String> {
        let stem = file_path.file_stem()?.to_str()?;
        let candidate = stem.rsplit('-').take(5).collect::<Vec<_>>();
        if candidate.len() == 5 {
            let joined = candidate.into_iter().rev().collect::<Vec<_>>().join("-");
            if uuid::Uuid::parse_str(&joined).is_ok() {
                return Some(joined);
            }
        }
        Some(stem.to_string())
    }

    fn parse(&self, ctx: &ParseContext) -> Option<ParsedLog> {
        let (summary, rows) = self.scan(ctx, true)?;
        Some(ParsedLog { summary, rows })
    }

    fn parse_summary(&self, ctx: &ParseContext) -> Option<SessionSummary> {
        self.scan(ctx, false).map(|(summary, _)| summary)
    }
}
