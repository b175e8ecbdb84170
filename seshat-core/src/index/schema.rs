//! Index store schema and migrations.
//!
//! Schema version is tracked with `PRAGMA user_version`. Each entry in
//! [`MIGRATIONS`] moves the database up one version; migrations run in a
//! transaction so a failed upgrade leaves the previous version intact.

use crate::error::Result;
use rusqlite::Connection;

pub const MIGRATIONS: &[&str] = &[
    // v1: sessions table plus store metadata
    r#"
    CREATE TABLE sessions (
        session_id          TEXT PRIMARY KEY,
        source              TEXT NOT NULL,
        source_host         TEXT,

        -- fingerprint of the canonical backing file; size is NULL when
        -- the filesystem did not report one
        file_path           TEXT NOT NULL,
        file_size           INTEGER,
        file_mtime_ms       INTEGER NOT NULL DEFAULT 0,

        -- timestamps, epoch milliseconds
        started_at          INTEGER,
        ended_at            INTEGER,
        last_updated_at     INTEGER,
        active_duration_ms  INTEGER NOT NULL DEFAULT 0,

        -- provenance
        cli_version         TEXT,
        originator          TEXT,
        cwd                 TEXT,
        model               TEXT,
        approval_policy     TEXT,
        project             TEXT,

        -- counts
        user_messages       INTEGER NOT NULL DEFAULT 0,
        assistant_messages  INTEGER NOT NULL DEFAULT 0,
        tool_messages       INTEGER NOT NULL DEFAULT 0,
        turns               INTEGER NOT NULL DEFAULT 0,
        events              INTEGER NOT NULL DEFAULT 0,
        lines               INTEGER NOT NULL DEFAULT 0,

        -- token accounting
        tokens_input        INTEGER NOT NULL DEFAULT 0,
        tokens_cached_input INTEGER NOT NULL DEFAULT 0,
        tokens_output       INTEGER NOT NULL DEFAULT 0,
        tokens_reasoning    INTEGER NOT NULL DEFAULT 0,
        tokens_total        INTEGER NOT NULL DEFAULT 0,

        -- full summary document; denormalized columns above exist for SQL
        payload             TEXT NOT NULL,

        parse_level         TEXT NOT NULL,
        parse_error         TEXT,
        parsed_at           INTEGER NOT NULL
    );

    CREATE INDEX idx_sessions_file_path ON sessions(file_path);
    CREATE INDEX idx_sessions_project ON sessions(project);
    CREATE INDEX idx_sessions_source ON sessions(source);
    CREATE INDEX idx_sessions_last_updated ON sessions(last_updated_at);

    CREATE TABLE meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    "#,
    // v2: remaining denormalized summary columns so scoped SQL can
    // filter and select without decoding the payload
    r#"
    ALTER TABLE sessions ADD COLUMN schema_version INTEGER NOT NULL DEFAULT 1;
    ALTER TABLE sessions ADD COLUMN instructions TEXT;
    ALTER TABLE sessions ADD COLUMN remote_path TEXT;
    ALTER TABLE sessions ADD COLUMN user_title TEXT;
    ALTER TABLE sessions ADD COLUMN user_comment TEXT;
    ALTER TABLE sessions ADD COLUMN task_id TEXT;
    "#,
];

/// Run pending migrations, bringing the schema to the latest version.
pub fn migrate(conn: &Connection) -> Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let target = MIGRATIONS.len() as i64;

    if current >= target {
        return Ok(());
    }

    for (i, migration) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = i as i64 + 1;
        tracing::info!(version, "Applying index store migration");

        conn.execute_batch("BEGIN")?;
        match conn
            .execute_batch(migration)
            .and_then(|_| conn.execute_batch(&format!("PRAGMA user_version = {}", version)))
        {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
        }
    }

    Ok(())
}
