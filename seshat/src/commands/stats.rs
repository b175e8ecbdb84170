//! `seshat stats`: aggregates over the index, plus optional scan-derived
//! metrics (tool counts, day coverage).

use crate::output::format_duration_ms;
use seshat_core::{CancelToken, Config, DerivedMetricsCache, FileFingerprint, RgScanner};

pub async fn run(
    config: &Config,
    days: Option<i64>,
    by_day: bool,
    tools: bool,
    month: Option<String>,
) -> anyhow::Result<()> {
    let store = super::open_store()?;
    let scope = super::build_scope(None, None, days)?;

    let totals = store.totals(&scope)?;
    println!("Sessions:        {}", totals.sessions);
    println!(
        "Active time:     {}",
        format_duration_ms(totals.active_duration_ms)
    );
    println!(
        "Messages:        {} user / {} assistant / {} tool",
        totals.user_messages, totals.assistant_messages, totals.tool_messages
    );
    println!("Turns:           {}", totals.turns);
    println!(
        "Tokens:          {} in ({} cached) / {} out",
        totals.tokens.input, totals.tokens.cached_input, totals.tokens.output
    );

    let by_source = store.totals_by_source(&scope)?;
    if by_source.len() > 1 {
        println!("\nBy source:");
        for (source, totals) in by_source {
            println!(
                "  {:<8} {:>5} session(s), {}",
                source.as_str(),
                totals.sessions,
                format_duration_ms(totals.active_duration_ms)
            );
        }
    }

    if by_day {
        println!("\nBy day:");
        for (day, totals) in store.totals_by_day(&scope)? {
            println!(
                "  {} {:>4} session(s), {}",
                day,
                totals.sessions,
                format_duration_ms(totals.active_duration_ms)
            );
        }
    }

    if !tools && month.is_none() {
        return Ok(());
    }

    // Scanner-backed metrics: cancel cleanly on Ctrl-C
    let cache = DerivedMetricsCache::open(
        &Config::metric_cache_path(),
        RgScanner::new(config.scanner.program.clone()),
        config.scanner.batch_delay_ms,
    )?;
    let cancel = CancelToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_on_signal.cancel();
        }
    });

    let files: Vec<FileFingerprint> = store
        .list(&scope)?
        .into_iter()
        .map(|record| record.fingerprint)
        .collect();

    if tools {
        let counts = cache.tool_invocation_counts(&files, &cancel).await?;
        println!("\nTool invocations:");
        if counts.is_empty() {
            println!("  none recorded");
        }
        for (name, count) in counts {
            println!("  {:<24} {}", name, count);
        }
    }

    if let Some(month) = month {
        let covered = cache.day_coverage(&month, &files, &cancel).await?;
        println!("\nActive days in {}: {}", month, covered.len());
        for day in covered {
            println!("  {}", day);
        }
    }

    if cancel.is_cancelled() {
        println!("\n(interrupted; partial results)");
    }

    Ok(())
}
