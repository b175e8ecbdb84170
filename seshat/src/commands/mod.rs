pub mod list;
pub mod scan;
pub mod show;
pub mod stats;

use anyhow::Context;
use chrono::{Duration, Utc};
use seshat_core::{Config, IndexStore, QueryScope, SourceKind};
use std::str::FromStr;
use std::sync::Arc;

/// Open the index at the configured default path.
pub fn open_store() -> anyhow::Result<Arc<IndexStore>> {
    Ok(Arc::new(
        IndexStore::open_default().context("opening session index")?,
    ))
}

/// Build a query scope from the common CLI filters.
pub fn build_scope(
    source: Option<&str>,
    project: Option<&str>,
    days: Option<i64>,
) -> anyhow::Result<QueryScope> {
    let mut scope = QueryScope::default();
    if let Some(source) = source {
        let kind = SourceKind::from_str(source)
            .map_err(|e| anyhow::anyhow!("{} (expected claude, codex, or gemini)", e))?;
        scope.sources.push(kind);
    }
    if let Some(project) = project {
        scope.projects.push(project.to_string());
    }
    if let Some(days) = days {
        scope.since = Some(Utc::now() - Duration::days(days));
    }
    Ok(scope)
}

/// Coordinator wired to the default store and the loaded config.
pub fn coordinator(config: &Config) -> anyhow::Result<seshat_core::ScanCoordinator> {
    let store = open_store()?;
    Ok(seshat_core::ScanCoordinator::new(store, config))
}
