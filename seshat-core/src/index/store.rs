//! Persistent session index backed by SQLite.
//!
//! All access goes through [`IndexStore`], which serializes writes behind
//! a mutex: the process is the single logical writer, so freshness checks
//! and downgrade protection can read-then-write without races.

use crate::error::{Error, Result};
use crate::index::schema;
use crate::types::{
    FileFingerprint, ParseLevel, SessionIndexRecord, SessionSummary, SourceKind, TokenBreakdown,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

const META_LAST_FULL_INDEX: &str = "last_full_index_at";
const META_SESSION_COUNT: &str = "session_count";

/// Version of the serialized summary payload written to each row
const SESSION_SCHEMA_VERSION: i64 = 1;

/// Which timestamp column a date-scoped query filters and groups on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateDimension {
    /// Session start time
    Created,
    /// Last log update time
    #[default]
    Updated,
}

impl DateDimension {
    fn column(&self) -> &'static str {
        match self {
            DateDimension::Created => "started_at",
            DateDimension::Updated => "last_updated_at",
        }
    }
}

/// Filter applied to list and aggregate queries.
#[derive(Debug, Clone, Default)]
pub struct QueryScope {
    pub dimension: DateDimension,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Restrict to these project ids (empty = all)
    pub projects: Vec<String>,
    /// Restrict to these sources (empty = all)
    pub sources: Vec<SourceKind>,
}

impl QueryScope {
    /// Build the WHERE clause and its bound values.
    fn where_clause(&self) -> (String, Vec<rusqlite::types::Value>) {
        let mut conditions: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        let column = self.dimension.column();

        if let Some(since) = self.since {
            conditions.push(format!("{} >= ?", column));
            values.push(since.timestamp_millis().into());
        }
        if let Some(until) = self.until {
            conditions.push(format!("{} < ?", column));
            values.push(until.timestamp_millis().into());
        }
        if !self.projects.is_empty() {
            let placeholders = vec!["?"; self.projects.len()].join(", ");
            conditions.push(format!("project IN ({})", placeholders));
            for project in &self.projects {
                values.push(project.clone().into());
            }
        }
        if !self.sources.is_empty() {
            let placeholders = vec!["?"; self.sources.len()].join(", ");
            conditions.push(format!("source IN ({})", placeholders));
            for source in &self.sources {
                values.push(source.as_str().to_string().into());
            }
        }

        if conditions.is_empty() {
            (String::from("1 = 1"), values)
        } else {
            (conditions.join(" AND "), values)
        }
    }
}

/// Aggregate totals over a scope of sessions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateTotals {
    pub sessions: i64,
    pub active_duration_ms: i64,
    pub user_messages: i64,
    pub assistant_messages: i64,
    pub tool_messages: i64,
    pub turns: i64,
    pub tokens: TokenBreakdown,
}

/// SQLite-backed session index
pub struct IndexStore {
    conn: Mutex<Connection>,
}

impl IndexStore {
    /// Open (creating if needed) the index at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the index at the default XDG data path
    pub fn open_default() -> Result<Self> {
        Self::open(&crate::config::Config::index_path())
    }

    /// In-memory index for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ============================================
    // Upserts
    // ============================================

    /// Insert or update one record.
    ///
    /// Returns `false` when the write was skipped by downgrade
    /// protection: the backing file is unchanged and the stored record
    /// was parsed at a higher level, so a cheaper reparse must not
    /// overwrite it.
    pub fn upsert(&self, record: &SessionIndexRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        upsert_one(&conn, record)
    }

    /// Upsert a batch atomically: either every record lands or none do.
    ///
    /// Returns the number of records written (downgrade-skipped records
    /// are not counted and do not fail the batch).
    pub fn upsert_batch(&self, records: &[SessionIndexRecord]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut written = 0;
        for record in records {
            if upsert_one(&tx, record)? {
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    // ============================================
    // Reads
    // ============================================

    /// Look up a cached record by file fingerprint.
    ///
    /// Misses when the stored mtime differs, when both sizes are known
    /// and differ, or when the stored parse level is below what the
    /// source currently requires.
    pub fn fetch_cached(&self, fingerprint: &FileFingerprint) -> Result<Option<SessionIndexRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions WHERE file_path = ?",
                    RECORD_COLUMNS
                ),
                params![fingerprint.path.to_string_lossy()],
                row_to_raw_record,
            )
            .optional()?;

        let Some(raw) = record else { return Ok(None) };
        let Some(record) = decode_record(raw) else {
            return Ok(None);
        };

        if !record.fingerprint.matches(fingerprint.mtime_ms, fingerprint.size) {
            return Ok(None);
        }
        if record.parse_level < record.summary.source.required_parse_level() {
            tracing::debug!(
                path = %fingerprint.path.display(),
                level = record.parse_level.as_str(),
                "Cached record below required parse level, forcing reparse"
            );
            return Ok(None);
        }

        Ok(Some(record))
    }

    /// Fetch a record by session id.
    ///
    /// A record whose stored payload no longer decodes is treated as
    /// missing rather than an error; the next scan rewrites it.
    pub fn get(&self, session_id: &str) -> Result<Option<SessionIndexRecord>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {} FROM sessions WHERE session_id = ?",
                    RECORD_COLUMNS
                ),
                params![session_id],
                row_to_raw_record,
            )
            .optional()?;

        Ok(raw.and_then(decode_record))
    }

    /// List records matching a scope, most recently updated first.
    pub fn list(&self, scope: &QueryScope) -> Result<Vec<SessionIndexRecord>> {
        let (where_clause, values) = scope.where_clause();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE {} ORDER BY last_updated_at DESC",
            RECORD_COLUMNS, where_clause
        ))?;

        let raws = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), row_to_raw_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(raws.into_iter().filter_map(decode_record).collect())
    }

    /// All (session_id, file_path) pairs currently indexed
    pub fn indexed_paths(&self) -> Result<Vec<(String, PathBuf)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT session_id, file_path FROM sessions")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn session_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .map_err(Error::from)
    }

    // ============================================
    // Pruning
    // ============================================

    /// Remove records whose backing file is no longer present on disk.
    ///
    /// `present` is the set of file paths seen by the current scan.
    pub fn remove_missing(&self, present: &HashSet<PathBuf>) -> Result<usize> {
        let stale: Vec<String> = self
            .indexed_paths()?
            .into_iter()
            .filter(|(_, path)| !present.contains(path))
            .map(|(id, _)| id)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for id in &stale {
            tx.execute("DELETE FROM sessions WHERE session_id = ?", params![id])?;
        }
        tx.commit()?;

        tracing::info!(removed = stale.len(), "Pruned sessions with missing files");
        Ok(stale.len())
    }

    // ============================================
    // Aggregates
    // ============================================

    /// Scope-wide totals
    pub fn totals(&self, scope: &QueryScope) -> Result<AggregateTotals> {
        let (where_clause, values) = scope.where_clause();
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!(
                "SELECT {} FROM sessions WHERE {}",
                TOTALS_COLUMNS, where_clause
            ),
            rusqlite::params_from_iter(values.iter()),
            row_to_totals,
        )
        .map_err(Error::from)
    }

    /// Totals grouped by UTC day of the scope's date dimension.
    ///
    /// Sessions without that timestamp are excluded; days come back in
    /// ascending order.
    pub fn totals_by_day(&self, scope: &QueryScope) -> Result<Vec<(String, AggregateTotals)>> {
        let (where_clause, values) = scope.where_clause();
        let column = scope.dimension.column();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT date({col} / 1000, 'unixepoch') AS day, {totals} \
             FROM sessions WHERE {col} IS NOT NULL AND {filter} \
             GROUP BY day ORDER BY day",
            col = column,
            totals = TOTALS_COLUMNS,
            filter = where_clause,
        ))?;

        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row_to_totals_offset(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Totals grouped by source
    pub fn totals_by_source(&self, scope: &QueryScope) -> Result<Vec<(SourceKind, AggregateTotals)>> {
        let (where_clause, values) = scope.where_clause();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT source, {} FROM sessions WHERE {} GROUP BY source ORDER BY source",
            TOTALS_COLUMNS, where_clause
        ))?;

        let rows = stmt
            .query_map(rusqlite::params_from_iter(values.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row_to_totals_offset(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(source, totals)| {
                SourceKind::from_str(&source).ok().map(|kind| (kind, totals))
            })
            .collect())
    }

    // ============================================
    // Store metadata
    // ============================================

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Record the completion of a full index pass.
    pub fn record_full_index(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(META_LAST_FULL_INDEX, &at.to_rfc3339())?;
        let count = self.session_count()?;
        self.set_meta(META_SESSION_COUNT, &count.to_string())
    }

    pub fn last_full_index(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_meta(META_LAST_FULL_INDEX)?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

// ============================================
// Row mapping
// ============================================

const RECORD_COLUMNS: &str =
    "payload, file_path, file_mtime_ms, file_size, parse_level, parse_error, parsed_at";

/// COUNT plus summed denormalized columns. Session duration falls back
/// from explicit active duration to wall-clock span to update span.
const TOTALS_COLUMNS: &str = "COUNT(*), \
     COALESCE(SUM(CASE \
         WHEN active_duration_ms > 0 THEN active_duration_ms \
         WHEN started_at IS NOT NULL AND ended_at IS NOT NULL AND ended_at > started_at \
             THEN ended_at - started_at \
         WHEN started_at IS NOT NULL AND last_updated_at IS NOT NULL AND last_updated_at > started_at \
             THEN last_updated_at - started_at \
         ELSE 0 END), 0), \
     COALESCE(SUM(user_messages), 0), \
     COALESCE(SUM(assistant_messages), 0), \
     COALESCE(SUM(tool_messages), 0), \
     COALESCE(SUM(turns), 0), \
     COALESCE(SUM(tokens_input), 0), \
     COALESCE(SUM(tokens_cached_input), 0), \
     COALESCE(SUM(tokens_output), 0), \
     COALESCE(SUM(tokens_reasoning), 0), \
     COALESCE(SUM(tokens_total), 0)";

/// Raw columns before payload decoding
struct RawRecord {
    payload: String,
    file_path: String,
    file_mtime_ms: i64,
    file_size: Option<i64>,
    parse_level: String,
    parse_error: Option<String>,
    parsed_at: i64,
}

fn row_to_raw_record(row: &Row) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        payload: row.get(0)?,
        file_path: row.get(1)?,
        file_mtime_ms: row.get(2)?,
        file_size: row.get(3)?,
        parse_level: row.get(4)?,
        parse_error: row.get(5)?,
        parsed_at: row.get(6)?,
    })
}

/// Decode a stored row; undecodable payloads are logged and dropped.
fn decode_record(raw: RawRecord) -> Option<SessionIndexRecord> {
    let summary: SessionSummary = match serde_json::from_str(&raw.payload) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(
                file_path = %raw.file_path,
                error = %e,
                "Dropping index record with undecodable payload"
            );
            return None;
        }
    };

    let parse_level = ParseLevel::from_str(&raw.parse_level).unwrap_or(ParseLevel::Metadata);
    let parsed_at = Utc
        .timestamp_millis_opt(raw.parsed_at)
        .single()
        .unwrap_or_else(Utc::now);

    Some(SessionIndexRecord {
        summary,
        fingerprint: FileFingerprint::new(
            PathBuf::from(raw.file_path),
            raw.file_mtime_ms,
            raw.file_size.map(|s| s as u64),
        ),
        parse_level,
        parse_error: raw.parse_error,
        parsed_at,
    })
}

fn row_to_totals(row: &Row) -> rusqlite::Result<AggregateTotals> {
    row_to_totals_offset(row, 0)
}

fn row_to_totals_offset(row: &Row, offset: usize) -> rusqlite::Result<AggregateTotals> {
    Ok(AggregateTotals {
        sessions: row.get(offset)?,
        active_duration_ms: row.get(offset + 1)?,
        user_messages: row.get(offset + 2)?,
        assistant_messages: row.get(offset + 3)?,
        tool_messages: row.get(offset + 4)?,
        turns: row.get(offset + 5)?,
        tokens: TokenBreakdown {
            input: row.get(offset + 6)?,
            cached_input: row.get(offset + 7)?,
            output: row.get(offset + 8)?,
            reasoning: row.get(offset + 9)?,
            total: row.get(offset + 10)?,
        },
    })
}

/// Shared upsert body; `conn` may be a transaction.
fn upsert_one(conn: &Connection, record: &SessionIndexRecord) -> Result<bool> {
    let existing = conn
        .query_row(
            "SELECT file_path, file_mtime_ms, file_size, parse_level, payload \
             FROM sessions WHERE session_id = ?",
            params![record.summary.id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    if let Some((path, mtime_ms, size, level, payload)) = existing {
        let stored = FileFingerprint::new(
            PathBuf::from(path),
            mtime_ms,
            size.map(|s| s as u64),
        );
        let stored_level = ParseLevel::from_str(&level).unwrap_or(ParseLevel::Metadata);

        if stored.path == record.fingerprint.path {
            // Unchanged file and a richer stored parse: keep what we have
            if stored.matches(record.fingerprint.mtime_ms, record.fingerprint.size)
                && stored_level > record.parse_level
            {
                tracing::debug!(
                    session_id = %record.summary.id,
                    stored = stored_level.as_str(),
                    incoming = record.parse_level.as_str(),
                    "Skipping downgrade write"
                );
                return Ok(false);
            }
        } else if let Ok(stored_summary) = serde_json::from_str::<SessionSummary>(&payload) {
            // A different file claims this session id. The record follows
            // the preferred candidate, not whichever file changed last;
            // otherwise a rewritten placeholder (e.g. latest.jsonl) would
            // displace the canonical file on every incremental scan.
            if stored_summary.is_preferred_over(&record.summary) {
                tracing::debug!(
                    session_id = %record.summary.id,
                    stored = %stored.path.display(),
                    incoming = %record.fingerprint.path.display(),
                    "Keeping preferred backing file"
                );
                return Ok(false);
            }
        }
    }

    let summary = &record.summary;
    let payload = serde_json::to_string(summary)?;
    let ts = |value: Option<DateTime<Utc>>| value.map(|v| v.timestamp_millis());

    conn.execute(
        "INSERT INTO sessions (
            session_id, source, source_host,
            file_path, file_size, file_mtime_ms,
            started_at, ended_at, last_updated_at, active_duration_ms,
            cli_version, originator, cwd, model, approval_policy, project,
            user_messages, assistant_messages, tool_messages, turns, events, lines,
            tokens_input, tokens_cached_input, tokens_output, tokens_reasoning, tokens_total,
            payload, parse_level, parse_error, parsed_at,
            schema_version, instructions, remote_path, user_title, user_comment, task_id
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
            ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
            ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31,
            ?32, ?33, ?34, ?35, ?36, ?37
        )
        ON CONFLICT(session_id) DO UPDATE SET
            source = excluded.source,
            source_host = excluded.source_host,
            file_path = excluded.file_path,
            file_size = excluded.file_size,
            file_mtime_ms = excluded.file_mtime_ms,
            started_at = excluded.started_at,
            ended_at = excluded.ended_at,
            last_updated_at = excluded.last_updated_at,
            active_duration_ms = excluded.active_duration_ms,
            cli_version = excluded.cli_version,
            originator = excluded.originator,
            cwd = excluded.cwd,
            model = excluded.model,
            approval_policy = excluded.approval_policy,
            project = excluded.project,
            user_messages = excluded.user_messages,
            assistant_messages = excluded.assistant_messages,
            tool_messages = excluded.tool_messages,
            turns = excluded.turns,
            events = excluded.events,
            lines = excluded.lines,
            tokens_input = excluded.tokens_input,
            tokens_cached_input = excluded.tokens_cached_input,
            tokens_output = excluded.tokens_output,
            tokens_reasoning = excluded.tokens_reasoning,
            tokens_total = excluded.tokens_total,
            payload = excluded.payload,
            parse_level = excluded.parse_level,
            parse_error = excluded.parse_error,
            parsed_at = excluded.parsed_at,
            schema_version = excluded.schema_version,
            instructions = excluded.instructions,
            remote_path = excluded.remote_path,
            user_title = excluded.user_title,
            user_comment = excluded.user_comment,
            task_id = excluded.task_id",
        params![
            summary.id,
            summary.source.as_str(),
            summary.source_host,
            record.fingerprint.path.to_string_lossy(),
            record.fingerprint.size.map(|s| s as i64),
            record.fingerprint.mtime_ms,
            ts(summary.started_at),
            ts(summary.ended_at),
            ts(summary.last_updated_at),
            summary.active_duration_ms,
            summary.cli_version,
            summary.originator,
            summary.cwd,
            summary.model,
            summary.approval_policy,
            summary.project,
            summary.user_message_count,
            summary.assistant_message_count,
            summary.tool_message_count,
            summary.turn_count,
            summary.event_count,
            summary.line_count,
            summary.tokens.input,
            summary.tokens.cached_input,
            summary.tokens.output,
            summary.tokens.reasoning,
            summary.tokens.total,
            payload,
            record.parse_level.as_str(),
            record.parse_error,
            record.parsed_at.timestamp_millis(),
            SESSION_SCHEMA_VERSION,
            summary.instructions,
            summary.remote_path,
            summary.user_title,
            summary.user_comment,
            summary.task_id,
        ],
    )?;

    Ok(true)
}
