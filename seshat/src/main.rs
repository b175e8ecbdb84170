//! seshat command-line interface.

mod commands;
mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "seshat",
    version,
    about = "Index and analyze AI CLI session transcripts"
)]
struct Cli {
    /// Path to a config file (default: ~/.config/seshat/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan all sources and refresh the session index
    Scan {
        /// Discover and report files without writing the index
        #[arg(long)]
        dry_run: bool,
    },
    /// List indexed sessions
    List {
        /// Filter by source (claude, codex, gemini)
        #[arg(long)]
        source: Option<String>,
        /// Filter by project id
        #[arg(long)]
        project: Option<String>,
        /// Only sessions updated in the last N days
        #[arg(long)]
        days: Option<i64>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show one session's reconstructed timeline
    Show {
        /// Session id (as printed by `seshat list`)
        session_id: String,
        /// Emit JSON instead of formatted turns
        #[arg(long)]
        json: bool,
    },
    /// Aggregate statistics over indexed sessions
    Stats {
        /// Only sessions updated in the last N days
        #[arg(long)]
        days: Option<i64>,
        /// Break totals down per day
        #[arg(long)]
        by_day: bool,
        /// Include tool invocation counts (runs the external scanner)
        #[arg(long)]
        tools: bool,
        /// Day-coverage month, YYYY-MM (runs the external scanner)
        #[arg(long)]
        month: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => seshat_core::Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => seshat_core::Config::load().context("loading config")?,
    };

    let _log_guard = seshat_core::logging::init(&config.logging).context("initializing logging")?;

    match cli.command {
        Command::Scan { dry_run } => commands::scan::run(&config, dry_run).await,
        Command::List {
            source,
            project,
            days,
            json,
        } => commands::list::run(&config, source, project, days, json),
        Command::Show { session_id, json } => commands::show::run(&config, &session_id, json).await,
        Command::Stats {
            days,
            by_day,
            tools,
            month,
        } => commands::stats::run(&config, days, by_day, tools, month).await,
    }
}
