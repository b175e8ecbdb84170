//! Persistent session index.
//!
//! The index keeps one record per session id, keyed for freshness by the
//! backing file's fingerprint. It is the source of truth for list views
//! and aggregates; log files are only re-read when their fingerprint
//! changes.

mod schema;
mod store;

pub use schema::MIGRATIONS;
pub use store::{AggregateTotals, DateDimension, IndexStore, QueryScope};
