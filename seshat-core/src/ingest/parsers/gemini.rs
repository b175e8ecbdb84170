//! Gemini CLI chat log parser.
//!
//! Unlike the JSONL sources, Gemini persists each session as a single
//! JSON document under `~/.gemini/tmp/<project-hash>/chats/`, rewritten
//! in full on every update. The document carries session metadata plus an
//! ordered `messages` array; the parser flattens that array into the same
//! row stream the line-oriented sources produce.

use crate::ingest::parser::{
    ParseContext, ParsedLog, SourceParser, SourcePattern, SummaryAccumulator,
};
use crate::ingest::parsers::{environment_context_event, is_injected_context};
use crate::ingest::{text, timestamp};
use crate::types::{
    EventMessageRow, ResponseItemRow, RowPayload, RowRole, SessionMetaRow, SessionRow,
    SessionSummary, SourceKind, TokenBreakdown, TurnContextRow,
};
use serde::Deserialize;
use std::path::PathBuf;

pub struct GeminiParser {
    root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawSession {
    session_id: Option<String>,
    project_hash: Option<String>,
    start_time: Option<String>,
    last_updated: Option<String>,
    messages: Vec<RawMessage>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawMessage {
    timestamp: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    content: Option<String>,
    model: Option<String>,
    thoughts: Vec<RawThought>,
    tokens: Option<RawTokens>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawThought {
    subject: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawTokens {
    input: i64,
    output: i64,
    cached: i64,
    thoughts: i64,
    total: i64,
}

impl GeminiParser {
    pub fn new() -> Self {
        Self {
            root: dirs::home_dir().map(|h| h.join(".gemini")),
        }
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root: Some(root) }
    }

    /// Whole-document formats cannot stream; both parse modes read the
    /// full file and differ only in whether rows are kept.
    fn scan(&self, ctx: &ParseContext, collect: bool) -> Option<(SessionSummary, Vec<SessionRow>)> {
        let content = match std::fs::read_to_string(ctx.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %ctx.path.display(), error = %e, "Cannot open gemini log");
                return None;
            }
        };

        let raw: RawSession = match serde_json::from_str(&content) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %ctx.path.display(), error = %e, "Invalid gemini session document");
                return None;
            }
        };

        let fallback_id = self
            .session_id_hint(ctx.path)
            .unwrap_or_else(|| "unknown".to_string());
        let mut acc = SummaryAccumulator::new(fallback_id, ctx.path, SourceKind::Gemini);
        let mut rows = Vec::new();
        let mut model_emitted = false;

        let meta_ts = raw.start_time.as_deref().and_then(timestamp::parse_timestamp);
        let meta = SessionRow::new(
            meta_ts,
            RowPayload::SessionMeta(SessionMetaRow {
                id: raw.session_id.clone(),
                task_id: raw.project_hash.clone(),
                ..Default::default()
            }),
        );
        acc.observe(&meta);
        if collect {
            rows.push(meta);
        }

        for message in &raw.messages {
            acc.observe_line();
            for row in message_rows(message, &mut model_emitted) {
                acc.observe(&row);
                if collect {
                    rows.push(row);
                }
            }
        }

        let mut summary = acc.finish(ctx.file_size);
        if summary.last_updated_at.is_none() {
            summary.last_updated_at = raw
                .last_updated
                .as_deref()
                .and_then(timestamp::parse_timestamp);
        }

        Some((summary, rows))
    }
}

impl Default for GeminiParser {
    fn default() -> Self {
        Self::new()
    }
}

fn message_rows(message: &RawMessage, model_emitted: &mut bool) -> Vec<SessionRow> {
    let ts = message
        .timestamp
        .as_deref()
        .and_then(timestamp::parse_timestamp);
    let mut rows = Vec::new();

    match message.kind.as_deref() {
        Some("user") => {
            if let Some(body) = message.content.as_deref().filter(|c| !c.is_empty()) {
                if text::is_control_command(body) {
                    return rows;
                }
                if is_injected_context(body) {
                    rows.push(SessionRow::new(
                        ts,
                        RowPayload::EventMessage(environment_context_event(body.to_string())),
                    ));
                    return rows;
                }
                rows.push(SessionRow::new(
                    ts,
                    RowPayload::ResponseItem(ResponseItemRow {
                        role: RowRole::User,
                        text: Some(body.to_string()),
                        ..Default::default()
                    }),
                ));
            }
        }
        Some("gemini") => {
            if !*model_emitted {
                if let Some(model) = &message.model {
                    *model_emitted = true;
                    rows.push(SessionRow::new(
                        ts,
                        RowPayload::TurnContext(TurnContextRow {
                            model: Some(model.clone()),
                            ..Default::default()
                        }),
                    ));
                }
            }

            for thought in &message.thoughts {
                let body = match (&thought.subject, &thought.description) {
                    (Some(s), Some(d)) => Some(format!("{}: {}", s, d)),
                    (Some(s), None) => Some(s.clone()),
                    (None, Some(d)) => Some(d.clone()),
                    (None, None) => None,
                };
                if let Some(body) = body {
                    rows.push(SessionRow::new(
                        ts,
                        RowPayload::EventMessage(EventMessageRow {
                            kind: "agent_reasoning".to_string(),
                            text: Some(body),
                            payload: serde_json::Value::Null,
                        }),
                    ));
                }
            }

            if let Some(body) = message.content.as_deref().filter(|c| !c.is_empty()) {
                rows.push(SessionRow::new(
                    ts,
                    RowPayload::ResponseItem(ResponseItemRow {
                        role: RowRole::Assistant,
                        text: Some(body.to_string()),
                        usage: message.tokens.as_ref().map(token_breakdown),
                        ..Default::default()
                    }),
                ));
            }
        }
        Some(other) => {
            rows.push(SessionRow::new(
                ts,
                RowPayload::EventMessage(EventMessageRow {
                    kind: other.to_string(),
                    text: message.content.clone().filter(|c| !c.is_empty()),
                    payload: serde_json::Value::Null,
                }),
            ));
        }
        None => {}
    }

    rows
}

fn token_breakdown(tokens: &RawTokens) -> TokenBreakdown {
    TokenBreakdown {
        input: tokens.input,
        cached_input: tokens.cached,
        output: tokens.output,
        reasoning: tokens.thoughts,
        total: tokens.total,
    }
}

impl SourceParser for GeminiParser {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Gemini
    }

    fn root_path(&self) -> Option<PathBuf> {
        self.root.clone()
    }

    fn source_patterns(&self) -> Vec<SourcePattern> {
        vec![SourcePattern {
            pattern: "tmp/*/chats/*.json".to_string(),
            description: "Gemini CLI chat documents".to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_doc(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        let chats = dir.join("tmp/abc123/chats");
        std::fs::create_dir_all(&chats).unwrap();
        let path = chats.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn ctx(path: &std::path::Path) -> ParseContext<'_> {
        ParseContext::for_path(path).unwrap()
    }

    #[test]
    fn test_parse_session_document() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_doc(
            tmp.path(),
            "session-1.json",
            r#"{
                "sessionId": "g-123",
                "projectHash": "abc123",
                "startTime": "2025-06-01T12:00:00.000Z",
                "lastUpdated": "2025-06-01T12:10:00.000Z",
                "messages": [
                    {"timestamp": "2025-06-01T12:00:00.000Z", "type": "user", "content": "hello"},
                    {"timestamp": "2025-06-01T12:00:04.000Z", "type": "gemini", "content": "hi",
                     "model": "gemini-2.5-pro",
                     "thoughts": [{"subject": "Plan", "description": "greet back"}],
                     "tokens": {"input": 12, "output": 3, "cached": 0, "thoughts": 5, "total": 20}}
                ]
            }"#,
        );

        let parser = GeminiParser::with_root(tmp.path().to_path_buf());
        let parsed = parser.parse(&ctx(&path)).unwrap();

        assert_eq!(parsed.summary.id, "g-123");
        assert_eq!(parsed.summary.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(parsed.summary.user_message_count, 1);
        assert_eq!(parsed.summary.assistant_message_count, 1);
        assert_eq!(parsed.summary.tokens.input, 12);
        assert_eq!(parsed.summary.tokens.reasoning, 5);
        assert_eq!(parsed.summary.active_duration_ms, 4000);
        // meta, user, context, reasoning, assistant
        assert_eq!(parsed.rows.len(), 5);
    }

    #[test]
    fn test_invalid_document_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_doc(tmp.path(), "session-2.json", "{ not json");
        let parser = GeminiParser::with_root(tmp.path().to_path_buf());
        assert!(parser.parse(&ctx(&path)).is_none());
    }

    #[test]
    fn test_filename_fallback_id() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_doc(
            tmp.path(),
            "session-77.json",
            r#"{"messages": [{"timestamp": "2025-06-01T12:00:00Z", "type": "user", "content": "hi"}]}"#,
        );
        let parser = GeminiParser::with_root(tmp.path().to_path_buf());
        let summary = parser.parse_summary(&ctx(&path)).unwrap();
        assert_eq!(summary.id, "session-77");
    }
}
