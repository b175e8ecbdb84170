//! # seshat-core
//!
//! Library for indexing and analyzing AI CLI session transcripts.
//!
//! Supported sources: Claude Code, Codex CLI, Gemini CLI. Their
//! append-only logs are normalized into one session/turn model, indexed
//! incrementally into SQLite, and enriched with scan-derived metrics.
//!
//! ## Architecture
//!
//! ```text
//! log files -> ingest (parsers) -> rows -> timeline (turns)
//!                    |                         |
//!                    v                         v
//!              index (SQLite)           summaries, durations
//!                    ^
//!                    |
//!              metrics (rg scans, two-tier cache)
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Canonical data model (sessions, rows, turns, fingerprints)
//! - [`ingest`] - Source parsers, discovery, and the scan coordinator
//! - [`timeline`] - Classification, duplicate collapsing, turn grouping
//! - [`index`] - Persistent session index with aggregates
//! - [`metrics`] - Derived-metric cache over an external line scanner
//! - [`config`] - TOML configuration and XDG paths
//! - [`logging`] - tracing setup with file rotation

pub mod config;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod timeline;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use index::{AggregateTotals, DateDimension, IndexStore, QueryScope};
pub use ingest::{LoadedSession, ScanCoordinator, ScanOutcome};
pub use metrics::{CancelToken, DerivedMetricsCache, MetricKind, RgScanner};
pub use types::{
    ConversationTurn, FileFingerprint, ParseLevel, SessionIndexRecord, SessionSummary, SourceKind,
    TimelineEvent, TokenBreakdown,
};
