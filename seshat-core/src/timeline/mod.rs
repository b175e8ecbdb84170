//! Timeline reconstruction: normalized rows to display-ready turns.
//!
//! The pipeline has three stages, each pure over its input:
//!
//! 1. [`classify`] maps rows to [`TimelineEvent`]s (or drops them)
//! 2. [`collapse_repeats`] merges runs of identical events
//! 3. [`group_turns`] splits the event stream into [`ConversationTurn`]s
//!
//! [`reconstruct`] runs all three. Active duration is derived from the
//! grouped turns, never from raw rows.

pub mod context;

use crate::types::{
    Actor, ConversationTurn, RowPayload, RowRole, SessionRow, TimelineEvent,
    ENVIRONMENT_CONTEXT_KIND, TOKEN_COUNT_KIND, TURN_BOUNDARY_KIND,
};
use std::collections::{BTreeMap, HashSet};

/// Tuning for classification
#[derive(Debug, Clone)]
pub struct TimelineOptions {
    /// Event kinds dropped outright (noisy streaming artifacts)
    pub skip_event_kinds: HashSet<String>,
}

impl Default for TimelineOptions {
    fn default() -> Self {
        let skip_event_kinds = [
            "agent_reasoning_delta",
            "agent_message_delta",
            "raw_reasoning",
            "exec_command_output_delta",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        Self { skip_event_kinds }
    }
}

/// Run the full pipeline: classify, collapse, group.
pub fn reconstruct(rows: &[SessionRow], options: &TimelineOptions) -> Vec<ConversationTurn> {
    group_turns(collapse_repeats(classify(rows, options)))
}

/// Map each row to at most one timeline event.
///
/// Dropped outright: metadata rows (session meta, turn context), turn
/// boundaries, token-count snapshots, configured skip kinds, unknown
/// rows, and anything with no renderable text.
pub fn classify(rows: &[SessionRow], options: &TimelineOptions) -> Vec<TimelineEvent> {
    rows.iter()
        .filter_map(|row| classify_row(row, options))
        .collect()
}

fn classify_row(row: &SessionRow, options: &TimelineOptions) -> Option<TimelineEvent> {
    match &row.payload {
        RowPayload::SessionMeta(_) | RowPayload::TurnContext(_) | RowPayload::Unknown { .. } => {
            None
        }
        RowPayload::EventMessage(event) => {
            if event.kind == TURN_BOUNDARY_KIND
                || event.kind == TOKEN_COUNT_KIND
                || options.skip_event_kinds.contains(&event.kind)
            {
                return None;
            }
            let text = event.text.clone()?;
            let mut out = TimelineEvent::new(Actor::Info, row.timestamp);
            out.title = Some(event.kind.clone());
            out.text = Some(text);
            if event.kind != ENVIRONMENT_CONTEXT_KIND {
                out.metadata = Some(BTreeMap::from([("kind".to_string(), event.kind.clone())]));
            }
            Some(out)
        }
        RowPayload::ResponseItem(item) => {
            match item.role {
                RowRole::User => {
                    let text = item.text.clone()?;
                    let mut out = TimelineEvent::new(Actor::User, row.timestamp);
                    out.text = Some(text);
                    Some(out)
                }
                RowRole::Assistant => {
                    let text = item.text.clone()?;
                    let mut out = TimelineEvent::new(Actor::Assistant, row.timestamp);
                    out.text = Some(text);
                    Some(out)
                }
                RowRole::Tool => {
                    let mut out = TimelineEvent::new(Actor::Info, row.timestamp);
                    match (&item.tool_name, &item.text) {
                        // Tool invocation: title is the tool, text its input
                        (Some(name), _) => {
                            out.title = Some(name.clone());
                            out.text = item
                                .text
                                .clone()
                                .or_else(|| item.tool_input.as_ref().map(render_tool_input));
                            out.metadata =
                                Some(BTreeMap::from([("tool".to_string(), name.clone())]));
                        }
                        // Tool result: just the output text
                        (None, Some(text)) => {
                            out.text = Some(text.clone());
                            out.metadata = Some(BTreeMap::from([(
                                "kind".to_string(),
                                "tool_result".to_string(),
                            )]));
                        }
                        (None, None) => return None,
                    }
                    Some(out)
                }
                RowRole::System => {
                    let text = item.text.clone()?;
                    let mut out = TimelineEvent::new(Actor::Info, row.timestamp);
                    out.title = Some("system".to_string());
                    out.text = Some(text);
                    Some(out)
                }
            }
        }
    }
}

/// Render a tool input value as a single display line.
fn render_tool_input(input: &serde_json::Value) -> String {
    match input {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Merge consecutive content-identical events into one, bumping its
/// repeat count. The survivor keeps the first occurrence's timestamp.
pub fn collapse_repeats(events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    let mut out: Vec<TimelineEvent> = Vec::with_capacity(events.len());
    for event in events {
        match out.last_mut() {
            Some(last) if last.same_content(&event) => {
                last.repeat_count += event.repeat_count;
            }
            _ => out.push(event),
        }
    }
    out
}

/// Split events into turns: each user event starts a new turn, and every
/// following non-user event belongs to it. Events before the first user
/// event form a leading turn with no user message.
pub fn group_turns(events: Vec<TimelineEvent>) -> Vec<ConversationTurn> {
    let mut turns = Vec::new();
    let mut current: Option<ConversationTurn> = None;

    for event in events {
        if event.actor == Actor::User {
            if let Some(turn) = current.take() {
                turns.push(turn);
            }
            current = Some(ConversationTurn {
                user: Some(event),
                outputs: Vec::new(),
            });
        } else {
            current
                .get_or_insert_with(|| ConversationTurn {
                    user: None,
                    outputs: Vec::new(),
                })
                .outputs
                .push(event);
        }
    }

    if let Some(turn) = current {
        turns.push(turn);
    }

    turns
}

/// Sum of per-turn active spans in milliseconds.
///
/// Each turn contributes the distance from its anchor to its last output;
/// turns with a negative span (out-of-order timestamps) contribute zero,
/// as do environment-context-only turns.
pub fn active_duration_ms(turns: &[ConversationTurn]) -> i64 {
    turns
        .iter()
        .filter(|turn| !turn.is_environment_context())
        .filter_map(|turn| {
            let anchor = turn.anchor_timestamp()?;
            let last = turn.last_output_timestamp()?;
            Some((last - anchor).num_milliseconds().max(0))
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventMessageRow, ResponseItemRow};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(seconds: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
            + chrono::Duration::seconds(i64::from(seconds))
    }

    fn user(seconds: u32, text: &str) -> SessionRow {
        SessionRow::new(
            Some(at(seconds)),
            RowPayload::ResponseItem(ResponseItemRow {
                role: RowRole::User,
                text: Some(text.to_string()),
                ..Default::default()
            }),
        )
    }

    fn assistant(seconds: u32, text: &str) -> SessionRow {
        SessionRow::new(
            Some(at(seconds)),
            RowPayload::ResponseItem(ResponseItemRow {
                role: RowRole::Assistant,
                text: Some(text.to_string()),
                ..Default::default()
            }),
        )
    }

    fn event(seconds: u32, kind: &str, text: Option<&str>) -> SessionRow {
        SessionRow::new(
            Some(at(seconds)),
            RowPayload::EventMessage(EventMessageRow {
                kind: kind.to_string(),
                text: text.map(String::from),
                payload: serde_json::Value::Null,
            }),
        )
    }

    #[test]
    fn test_classify_drops_metadata_and_textless_rows() {
        let rows = vec![
            SessionRow::new(
                Some(at(0)),
                RowPayload::SessionMeta(Default::default()),
            ),
            SessionRow::turn_boundary(Some(at(1))),
            event(2, "token_count", None),
            event(3, "status", None),
            user(4, "hello"),
        ];
        let events = classify(&rows, &TimelineOptions::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, Actor::User);
    }

    #[test]
    fn test_classify_skip_kinds() {
        let rows = vec![
            event(0, "agent_reasoning_delta", Some("chunk")),
            event(1, "agent_reasoning", Some("full thought")),
        ];
        let events = classify(&rows, &TimelineOptions::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title.as_deref(), Some("agent_reasoning"));
    }

    #[test]
    fn test_classify_tool_rows() {
        let call = SessionRow::new(
            Some(at(0)),
            RowPayload::ResponseItem(ResponseItemRow {
                role: RowRole::Tool,
                tool_name: Some("shell".to_string()),
                tool_input: Some(serde_json::json!({"command": "ls"})),
                ..Default::default()
            }),
        );
        let events = classify(&[call], &TimelineOptions::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, Actor::Info);
        assert_eq!(events[0].title.as_deref(), Some("shell"));
        assert_eq!(
            events[0].metadata.as_ref().unwrap().get("tool").unwrap(),
            "shell"
        );
    }

    #[test]
    fn test_collapse_repeats_merges_identical_runs() {
        let rows = vec![
            event(0, "notice", Some("retrying")),
            event(1, "notice", Some("retrying")),
            event(2, "notice", Some("retrying")),
            event(3, "notice", Some("done")),
        ];
        let events = collapse_repeats(classify(&rows, &TimelineOptions::default()));
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].repeat_count, 3);
        // Survivor keeps the first occurrence's timestamp
        assert_eq!(events[0].timestamp, Some(at(0)));
        assert_eq!(events[1].repeat_count, 1);
    }

    #[test]
    fn test_collapse_does_not_merge_nonadjacent() {
        let rows = vec![
            event(0, "notice", Some("a")),
            event(1, "notice", Some("b")),
            event(2, "notice", Some("a")),
        ];
        let events = collapse_repeats(classify(&rows, &TimelineOptions::default()));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_group_turns_two_turns() {
        let rows = vec![
            user(0, "first question"),
            assistant(3, "first answer"),
            user(10, "second question"),
            assistant(14, "second answer"),
            event(15, "status", Some("finishing")),
        ];
        let turns = reconstruct(&rows, &TimelineOptions::default());
        assert_eq!(turns.len(), 2);
        assert_eq!(
            turns[0].user.as_ref().unwrap().text.as_deref(),
            Some("first question")
        );
        assert_eq!(turns[0].outputs.len(), 1);
        assert_eq!(turns[1].outputs.len(), 2);
    }

    #[test]
    fn test_group_turns_leading_outputs_have_no_user() {
        let rows = vec![assistant(0, "resuming where we left off"), user(5, "ok go")];
        let turns = reconstruct(&rows, &TimelineOptions::default());
        assert_eq!(turns.len(), 2);
        assert!(turns[0].user.is_none());
        assert_eq!(turns[0].outputs.len(), 1);
        assert!(turns[1].user.is_some());
    }

    #[test]
    fn test_active_duration_sums_turn_spans() {
        let rows = vec![
            user(0, "q1"),
            assistant(3, "a1"),
            user(10, "q2"),
            assistant(14, "a2"),
        ];
        let turns = reconstruct(&rows, &TimelineOptions::default());
        assert_eq!(active_duration_ms(&turns), 7000);
    }

    #[test]
    fn test_active_duration_negative_span_is_zero() {
        let rows = vec![user(10, "q1"), assistant(3, "a1")];
        let turns = reconstruct(&rows, &TimelineOptions::default());
        assert_eq!(active_duration_ms(&turns), 0);
    }

    #[test]
    fn test_active_duration_excludes_environment_context_turns() {
        let rows = vec![
            event(0, ENVIRONMENT_CONTEXT_KIND, Some("<environment_context>...")),
            event(30, ENVIRONMENT_CONTEXT_KIND, Some("<environment_context>more")),
            user(60, "q1"),
            assistant(65, "a1"),
        ];
        let turns = reconstruct(&rows, &TimelineOptions::default());
        assert_eq!(turns.len(), 2);
        assert!(turns[0].is_environment_context());
        assert_eq!(active_duration_ms(&turns), 5000);
    }

    #[test]
    fn test_turn_without_outputs_contributes_zero() {
        let rows = vec![user(0, "unanswered")];
        let turns = reconstruct(&rows, &TimelineOptions::default());
        assert_eq!(turns.len(), 1);
        assert_eq!(active_duration_ms(&turns), 0);
    }
}
