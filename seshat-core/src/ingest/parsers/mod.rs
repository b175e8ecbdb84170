//! Source-specific log parsers.
//!
//! | Parser | Format | Layout |
//! |--------|--------|--------|
//! | [`claude::ClaudeParser`] | JSONL, nested content blocks | `~/.claude/projects/*/*.jsonl` |
//! | [`codex::CodexParser`] | JSONL, typed envelope records | `~/.codex/sessions/**/*.jsonl` |
//! | [`gemini::GeminiParser`] | whole-document JSON | `~/.gemini/tmp/*/chats/*.json` |

pub mod claude;
pub mod codex;
pub mod gemini;

use crate::config::SourceOverrides;
use crate::ingest::parser::SourceParser;
use crate::types::{EventMessageRow, ENVIRONMENT_CONTEXT_KIND};
use std::sync::Arc;

pub use claude::ClaudeParser;
pub use codex::CodexParser;
pub use gemini::GeminiParser;

/// Build the full parser set, applying configured root overrides.
pub fn create_all_parsers(overrides: &SourceOverrides) -> Vec<Arc<dyn SourceParser>> {
    let claude = match &overrides.claude_path {
        Some(path) => ClaudeParser::with_root(path.clone()),
        None => ClaudeParser::new(),
    };
    let codex = match &overrides.codex_path {
        Some(path) => CodexParser::with_root(path.clone()),
        None => CodexParser::new(),
    };
    let gemini = match &overrides.gemini_path {
        Some(path) => GeminiParser::with_root(path.clone()),
        None => GeminiParser::new(),
    };

    vec![Arc::new(claude), Arc::new(codex), Arc::new(gemini)]
}

/// Tag prefixes that mark a "user" record as injected context rather
/// than something the user typed.
const INJECTED_PREFIXES: &[&str] = &[
    "<environment_context",
    "<system-reminder",
    "<command-name",
    "<local-command-stdout",
    "<user_instructions",
    "<user-memory",
];

/// True when a user-role message body is injected environment context.
pub(crate) fn is_injected_context(text: &str) -> bool {
    let trimmed = text.trim_start();
    INJECTED_PREFIXES.iter().any(|p| trimmed.starts_with(p))
}

/// Wrap injected context into an environment-context event row.
pub(crate) fn environment_context_event(text: String) -> EventMessageRow {
    EventMessageRow {
        kind: ENVIRONMENT_CONTEXT_KIND.to_string(),
        text: Some(text),
        payload: serde_json::Value::Null,
    }
}

/// Join the renderable text out of a content-block array.
///
/// Accepts both plain strings and arrays of `{type, text}` blocks; block
/// types listed in `text_types` contribute their text, everything else is
/// skipped.
pub(crate) fn content_text(content: &serde_json::Value, text_types: &[&str]) -> Option<String> {
    match content {
        serde_json::Value::String(s) => {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        serde_json::Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter(|b| {
                    b.get("type")
                        .and_then(|t| t.as_str())
                        .map(|t| text_types.contains(&t))
                        .unwrap_or(false)
                })
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .filter(|t| !t.is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        _ => None,
    }
}
