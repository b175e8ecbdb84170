//! `seshat scan`: refresh the session index from all sources.

use seshat_core::Config;
use std::collections::BTreeMap;

pub async fn run(config: &Config, dry_run: bool) -> anyhow::Result<()> {
    let coordinator = super::coordinator(config)?;

    if dry_run {
        let files = coordinator.discover_files();
        let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
        for file in &files {
            *by_source.entry(file.source.to_string()).or_default() += 1;
        }

        println!("Discovered {} file(s):", files.len());
        for (source, count) in by_source {
            println!("  {:<8} {}", source, count);
        }
        println!("Dry run; index not modified.");
        return Ok(());
    }

    let started = std::time::Instant::now();
    tracing::info!("Starting full scan");
    let outcome = coordinator.scan_all().await?;

    println!(
        "Scanned {} file(s) in {:.1}s: {} cached, {} parsed ({} failed), {} indexed, {} pruned",
        outcome.files_seen,
        started.elapsed().as_secs_f64(),
        outcome.cache_hits,
        outcome.parsed,
        outcome.failed,
        outcome.indexed,
        outcome.removed,
    );

    Ok(())
}
