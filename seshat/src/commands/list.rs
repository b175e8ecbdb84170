//! `seshat list`: tabular or JSON session listing.

use crate::output::{format_duration_ms, format_timestamp, truncate};
use seshat_core::Config;

pub fn run(
    _config: &Config,
    source: Option<String>,
    project: Option<String>,
    days: Option<i64>,
    json: bool,
) -> anyhow::Result<()> {
    let store = super::open_store()?;
    let scope = super::build_scope(source.as_deref(), project.as_deref(), days)?;
    let records = store.list(&scope)?;

    if json {
        let summaries: Vec<_> = records.iter().map(|r| &r.summary).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No sessions indexed. Run `seshat scan` first.");
        return Ok(());
    }

    println!(
        "{:<38} {:<8} {:<17} {:>8} {:>6} {:>10}  {}",
        "SESSION", "SOURCE", "UPDATED", "ACTIVE", "TURNS", "TOKENS", "TITLE"
    );
    for record in &records {
        let s = &record.summary;
        let title = s
            .user_title
            .as_deref()
            .or(s.cwd.as_deref())
            .unwrap_or("-");
        println!(
            "{:<38} {:<8} {:<17} {:>8} {:>6} {:>10}  {}",
            truncate(&s.id, 38),
            s.source,
            format_timestamp(s.last_updated_at),
            format_duration_ms(s.active_duration_ms),
            s.turn_count,
            s.tokens.effective_total(),
            truncate(title, 40),
        );
    }
    println!("\n{} session(s)", records.len());

    Ok(())
}
