//! `seshat show`: full parse and timeline for one session.

use crate::output::{format_duration_ms, format_timestamp, truncate};
use seshat_core::types::Actor;
use seshat_core::Config;

pub async fn run(config: &Config, session_id: &str, json: bool) -> anyhow::Result<()> {
    let store = super::open_store()?;
    let Some(record) = store.get(session_id)? else {
        anyhow::bail!("no indexed session with id {}", session_id);
    };

    let coordinator = seshat_core::ScanCoordinator::new(store, config);
    let Some(loaded) = coordinator.load_session(&record.fingerprint.path).await? else {
        anyhow::bail!(
            "log file {} is gone or no longer parses; try `seshat scan`",
            record.fingerprint.path.display()
        );
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&loaded.turns)?);
        return Ok(());
    }

    let summary = &loaded.record.summary;
    println!("Session {} ({})", summary.id, summary.source.display_name());
    if let Some(cwd) = &summary.cwd {
        println!("  cwd:     {}", cwd);
    }
    if let Some(model) = &summary.model {
        println!("  model:   {}", model);
    }
    println!("  started: {}", format_timestamp(summary.started_at));
    println!(
        "  active:  {} across {} turn(s)",
        format_duration_ms(summary.active_duration_ms),
        loaded.turns.len()
    );
    println!();

    for (i, turn) in loaded.turns.iter().enumerate() {
        println!("--- turn {} ---", i + 1);
        if let Some(user) = &turn.user {
            print_event("user", user.text.as_deref().unwrap_or(""), 1);
        }
        for event in &turn.outputs {
            let label = match event.actor {
                Actor::Assistant => "assistant",
                Actor::Info => event.title.as_deref().unwrap_or("info"),
                Actor::User => "user",
            };
            print_event(label, event.text.as_deref().unwrap_or(""), event.repeat_count);
        }
    }

    Ok(())
}

fn print_event(label: &str, text: &str, repeat_count: u32) {
    let repeat = if repeat_count > 1 {
        format!(" (x{})", repeat_count)
    } else {
        String::new()
    };
    println!("  [{}]{} {}", label, repeat, truncate(text, 120));
}
