//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! All timestamps are unix epoch milliseconds; all entity ids are the host
//! runtime's opaque strings and are never regenerated locally.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: Initial schema
    r#"
    -- ============================================
    -- Reconciled ledger entities
    -- ============================================

    CREATE TABLE IF NOT EXISTS sessions (
        id            TEXT PRIMARY KEY,
        title         TEXT,
        parent_id     TEXT,                  -- non-null marks a subagent session
        project_path  TEXT,
        worktree      TEXT,
        created_at    INTEGER NOT NULL,
        updated_at    INTEGER,
        ended_at      INTEGER
    );

    CREATE TABLE IF NOT EXISTS turns (
        id             TEXT PRIMARY KEY,     -- id of the opening user message
        session_id     TEXT NOT NULL,
        parent_turn_id TEXT,
        user_message   TEXT,
        started_at     INTEGER NOT NULL,
        ended_at       INTEGER
    );

    CREATE TABLE IF NOT EXISTS messages (
        id                 TEXT PRIMARY KEY,
        session_id         TEXT NOT NULL,
        turn_id            TEXT,
        role               TEXT NOT NULL,
        content            TEXT,             -- derived rendering, parts are authoritative
        agent              TEXT,
        is_subagent_prompt INTEGER NOT NULL DEFAULT 0,
        model_id           TEXT,
        provider_id        TEXT,
        created_at         INTEGER NOT NULL,
        completed_at       INTEGER,
        input_tokens       INTEGER,
        output_tokens      INTEGER,
        reasoning_tokens   INTEGER,
        cache_read_tokens  INTEGER,
        cache_write_tokens INTEGER,
        cost               REAL,
        finish_reason      TEXT
    );

    CREATE TABLE IF NOT EXISTS parts (
        id          TEXT PRIMARY KEY,
        message_id  TEXT NOT NULL,
        session_id  TEXT NOT NULL,
        part_index  INTEGER NOT NULL,        -- visitation order, not host-assigned
        type        TEXT NOT NULL,
        data        JSON NOT NULL,           -- verbatim host payload
        created_at  INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tool_calls (
        id                 TEXT PRIMARY KEY, -- host call id, globally unique
        session_id         TEXT NOT NULL,
        turn_id            TEXT,
        message_id         TEXT,
        tool_name          TEXT NOT NULL,
        args_json          JSON,
        started_at         INTEGER NOT NULL,
        completed_at       INTEGER,
        duration_ms        INTEGER,
        success            INTEGER,          -- NULL while in flight
        error_message      TEXT,
        output_metadata    JSON,
        input_tokens       INTEGER,
        output_tokens      INTEGER,
        reasoning_tokens   INTEGER,
        cache_read_tokens  INTEGER,
        cache_write_tokens INTEGER,
        cost               REAL
    );

    CREATE TABLE IF NOT EXISTS compactions (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id   TEXT NOT NULL,
        started_at   INTEGER NOT NULL,
        completed_at INTEGER
    );

    -- ============================================
    -- Error sink (reconciler failures, per record)
    -- ============================================

    CREATE TABLE IF NOT EXISTS plugin_errors (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp     INTEGER NOT NULL,
        event_type    TEXT,
        event_data    JSON,
        error_message TEXT,
        stack_trace   TEXT
    );

    -- ============================================
    -- Indexes
    -- ============================================

    CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);
    CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);
    CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id);
    CREATE INDEX IF NOT EXISTS idx_turns_session_started ON turns(session_id, started_at DESC);
    CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
    CREATE INDEX IF NOT EXISTS idx_messages_turn ON messages(turn_id);
    CREATE INDEX IF NOT EXISTS idx_parts_message ON parts(message_id);
    CREATE INDEX IF NOT EXISTS idx_parts_session ON parts(session_id);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_session ON tool_calls(session_id);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_turn ON tool_calls(turn_id);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_message ON tool_calls(message_id);
    CREATE INDEX IF NOT EXISTS idx_compactions_session ON compactions(session_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
