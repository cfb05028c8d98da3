//! Database repository layer
//!
//! Query and upsert operations for all ledger entities. All writes are
//! idempotent: replaying an event or re-running a backfill converges on the
//! same rows.

use crate::db::merge;
use crate::error::{Error, Result};
use crate::types::{
    CompactionRecord, MessageRecord, PartRecord, SessionRecord, ToolCallRecord, TurnRecord,
    UsageFigures,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Mutex;

/// Database handle. Single connection behind a mutex: the reconciler is the
/// only logical writer.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable foreign keys and WAL mode for better concurrency
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;  -- 64MB cache
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // ============================================
    // Session operations
    // ============================================

    /// Insert or update a session (live `session.created`). Lifecycle
    /// columns are left alone so a replayed event cannot reopen an ended
    /// session.
    pub fn upsert_session(&self, session: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sessions
                (id, title, parent_id, project_path, worktree, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                parent_id = excluded.parent_id,
                project_path = excluded.project_path,
                worktree = excluded.worktree,
                updated_at = excluded.updated_at
            "#,
            params![
                session.id,
                session.title,
                session.parent_id,
                session.project_path,
                session.worktree,
                session.created_at,
                session.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Update a session's mutable metadata (live `session.updated`).
    pub fn update_session_info(
        &self,
        id: &str,
        title: Option<&str>,
        parent_id: Option<&str>,
        updated_at: i64,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET title = ?2, parent_id = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, title, parent_id, updated_at],
        )?;
        Ok(())
    }

    /// Merge a session observed by backfill. Lifecycle columns are left to
    /// the live reconciler.
    pub fn merge_session(&self, session: &SessionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"
            INSERT INTO sessions
                (id, title, parent_id, project_path, worktree, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            {}
            "#,
            merge::SESSION_MERGE.on_conflict_clause()
        );
        conn.execute(
            &sql,
            params![
                session.id,
                session.title,
                session.parent_id,
                session.project_path,
                session.worktree,
                session.created_at,
                session.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Insert a session only if absent. Returns true when a row was written.
    pub fn insert_session_if_absent(&self, session: &SessionRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO sessions
                (id, title, parent_id, project_path, worktree, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                session.id,
                session.title,
                session.parent_id,
                session.project_path,
                session.worktree,
                session.created_at,
                session.updated_at,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Bump a session's updated_at (live `session.deleted` keeps the row,
    /// only marking activity).
    pub fn touch_session(&self, id: &str, now: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Close a session and its active turn in one transaction
    /// (live `session.idle`).
    pub fn end_session_and_turn(
        &self,
        session_id: &str,
        active_turn_id: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE sessions SET ended_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![session_id, now],
        )?;

        if let Some(turn_id) = active_turn_id {
            tx.execute(
                "UPDATE turns SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
                params![turn_id, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Watermark for incremental backfill: the latest session activity seen.
    pub fn max_session_updated_at(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        let max: Option<i64> =
            conn.query_row("SELECT MAX(updated_at) FROM sessions", [], |r| r.get(0))?;
        Ok(max)
    }

    pub fn session_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?",
            [id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?",
            [id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            id: row.get("id")?,
            title: row.get("title")?,
            parent_id: row.get("parent_id")?,
            project_path: row.get("project_path")?,
            worktree: row.get("worktree")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            ended_at: row.get("ended_at")?,
        })
    }

    // ============================================
    // Turn operations
    // ============================================

    /// Insert or replace a turn (live turn open).
    pub fn upsert_turn(&self, turn: &TurnRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO turns
                (id, session_id, parent_turn_id, user_message, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                turn.id,
                turn.session_id,
                turn.parent_turn_id,
                turn.user_message,
                turn.started_at,
                turn.ended_at,
            ],
        )?;
        Ok(())
    }

    /// Merge a turn observed by backfill: only fills a missing prompt text.
    pub fn merge_turn(&self, turn: &TurnRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"
            INSERT INTO turns
                (id, session_id, parent_turn_id, user_message, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            {}
            "#,
            merge::TURN_MERGE.on_conflict_clause()
        );
        conn.execute(
            &sql,
            params![
                turn.id,
                turn.session_id,
                turn.parent_turn_id,
                turn.user_message,
                turn.started_at,
                turn.ended_at,
            ],
        )?;
        Ok(())
    }

    /// Insert a turn only if absent. Returns true when a row was written.
    pub fn insert_turn_if_absent(&self, turn: &TurnRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO turns
                (id, session_id, parent_turn_id, user_message, started_at, ended_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                turn.id,
                turn.session_id,
                turn.parent_turn_id,
                turn.user_message,
                turn.started_at,
                turn.ended_at,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Close a turn if still open.
    pub fn end_turn(&self, turn_id: &str, ended_at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE turns SET ended_at = ?2 WHERE id = ?1 AND ended_at IS NULL",
            params![turn_id, ended_at],
        )?;
        Ok(())
    }

    /// The turn of `session_id` that was already running at `ts` (latest
    /// turn with `started_at <= ts`). Used to attribute a subagent session
    /// to the parent turn that spawned it.
    pub fn latest_turn_at_or_before(&self, session_id: &str, ts: i64) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT id FROM turns
            WHERE session_id = ?1 AND started_at <= ?2
            ORDER BY started_at DESC
            LIMIT 1
            "#,
            params![session_id, ts],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_turn(&self, id: &str) -> Result<Option<TurnRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM turns WHERE id = ?", [id], Self::row_to_turn)
            .optional()
            .map_err(Error::from)
    }

    fn row_to_turn(row: &Row) -> rusqlite::Result<TurnRecord> {
        Ok(TurnRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            parent_turn_id: row.get("parent_turn_id")?,
            user_message: row.get("user_message")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
        })
    }

    // ============================================
    // Message operations
    // ============================================

    /// Insert or replace a message (live reconciler).
    pub fn upsert_message(&self, msg: &MessageRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO messages
                (id, session_id, turn_id, role, content, agent, is_subagent_prompt,
                 model_id, provider_id, created_at, completed_at,
                 input_tokens, output_tokens, reasoning_tokens,
                 cache_read_tokens, cache_write_tokens, cost, finish_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                msg.id,
                msg.session_id,
                msg.turn_id,
                msg.role,
                msg.content,
                msg.agent,
                msg.is_subagent_prompt,
                msg.model_id,
                msg.provider_id,
                msg.created_at,
                msg.completed_at,
                msg.input_tokens,
                msg.output_tokens,
                msg.reasoning_tokens,
                msg.cache_read_tokens,
                msg.cache_write_tokens,
                msg.cost,
                msg.finish_reason,
            ],
        )?;
        Ok(())
    }

    /// Merge a message observed by backfill: fills empty content and missing
    /// turn attribution, never overwrites live data.
    pub fn merge_message(&self, msg: &MessageRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"
            INSERT INTO messages
                (id, session_id, turn_id, role, content, agent, is_subagent_prompt,
                 model_id, provider_id, created_at, completed_at,
                 input_tokens, output_tokens, reasoning_tokens,
                 cache_read_tokens, cache_write_tokens, cost, finish_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            {}
            "#,
            merge::MESSAGE_MERGE.on_conflict_clause()
        );
        conn.execute(
            &sql,
            params![
                msg.id,
                msg.session_id,
                msg.turn_id,
                msg.role,
                msg.content,
                msg.agent,
                msg.is_subagent_prompt,
                msg.model_id,
                msg.provider_id,
                msg.created_at,
                msg.completed_at,
                msg.input_tokens,
                msg.output_tokens,
                msg.reasoning_tokens,
                msg.cache_read_tokens,
                msg.cache_write_tokens,
                msg.cost,
                msg.finish_reason,
            ],
        )?;
        Ok(())
    }

    /// Insert a message only if absent. Returns true when a row was written.
    pub fn insert_message_if_absent(&self, msg: &MessageRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO messages
                (id, session_id, turn_id, role, content, agent, is_subagent_prompt,
                 model_id, provider_id, created_at, completed_at,
                 input_tokens, output_tokens, reasoning_tokens,
                 cache_read_tokens, cache_write_tokens, cost, finish_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
            params![
                msg.id,
                msg.session_id,
                msg.turn_id,
                msg.role,
                msg.content,
                msg.agent,
                msg.is_subagent_prompt,
                msg.model_id,
                msg.provider_id,
                msg.created_at,
                msg.completed_at,
                msg.input_tokens,
                msg.output_tokens,
                msg.reasoning_tokens,
                msg.cache_read_tokens,
                msg.cache_write_tokens,
                msg.cost,
                msg.finish_reason,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Propagate a completed assistant message's token and cost figures onto
    /// the tool calls it owns.
    pub fn apply_usage_to_tool_calls(&self, message_id: &str, usage: &UsageFigures) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE tool_calls SET
                input_tokens = ?2,
                output_tokens = ?3,
                reasoning_tokens = ?4,
                cache_read_tokens = ?5,
                cache_write_tokens = ?6,
                cost = ?7
            WHERE message_id = ?1
            "#,
            params![
                message_id,
                usage.input_tokens,
                usage.output_tokens,
                usage.reasoning_tokens,
                usage.cache_read_tokens,
                usage.cache_write_tokens,
                usage.cost,
            ],
        )?;
        Ok(())
    }

    pub fn message_exists(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i32 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE id = ?",
            [id],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM messages WHERE id = ?",
            [id],
            Self::row_to_message,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<MessageRecord> {
        Ok(MessageRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            turn_id: row.get("turn_id")?,
            role: row.get("role")?,
            content: row.get("content")?,
            agent: row.get("agent")?,
            is_subagent_prompt: row.get("is_subagent_prompt")?,
            model_id: row.get("model_id")?,
            provider_id: row.get("provider_id")?,
            created_at: row.get("created_at")?,
            completed_at: row.get("completed_at")?,
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            reasoning_tokens: row.get("reasoning_tokens")?,
            cache_read_tokens: row.get("cache_read_tokens")?,
            cache_write_tokens: row.get("cache_write_tokens")?,
            cost: row.get("cost")?,
            finish_reason: row.get("finish_reason")?,
        })
    }

    // ============================================
    // Tool call operations
    // ============================================

    /// Record a tool call announced by `tool.execute.before`. The hook fires
    /// once per call, so an existing row means a replayed event; keeping it
    /// untouched is what stops a replay from regressing a terminal call.
    pub fn upsert_tool_call(&self, call: &ToolCallRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO tool_calls
                (id, session_id, turn_id, tool_name, args_json, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO NOTHING
            "#,
            params![
                call.id,
                call.session_id,
                call.turn_id,
                call.tool_name,
                call.args_json,
                call.started_at,
            ],
        )?;
        Ok(())
    }

    /// Attach the owning message id to an in-flight tool call.
    pub fn attach_tool_call_message(&self, call_id: &str, message_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tool_calls SET message_id = ?2 WHERE id = ?1",
            params![call_id, message_id],
        )?;
        Ok(())
    }

    /// Record the terminal outcome of a tool call. The first terminal
    /// outcome wins; later writes find the call already completed.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_tool_call(
        &self,
        call_id: &str,
        message_id: &str,
        completed_at: i64,
        duration_ms: i64,
        success: bool,
        error_message: Option<&str>,
        output_metadata: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            UPDATE tool_calls SET
                message_id = ?2,
                completed_at = ?3,
                duration_ms = ?4,
                success = ?5,
                error_message = ?6,
                output_metadata = ?7
            WHERE id = ?1 AND completed_at IS NULL
            "#,
            params![
                call_id,
                message_id,
                completed_at,
                duration_ms,
                success,
                error_message,
                output_metadata,
            ],
        )?;
        Ok(())
    }

    /// Merge a terminal tool call observed by backfill.
    pub fn merge_tool_call(&self, call: &ToolCallRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            r#"
            INSERT INTO tool_calls
                (id, session_id, turn_id, message_id, tool_name, args_json,
                 started_at, completed_at, duration_ms, success, error_message,
                 output_metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            {}
            "#,
            merge::TOOL_CALL_MERGE.on_conflict_clause()
        );
        conn.execute(
            &sql,
            params![
                call.id,
                call.session_id,
                call.turn_id,
                call.message_id,
                call.tool_name,
                call.args_json,
                call.started_at,
                call.completed_at,
                call.duration_ms,
                call.success,
                call.error_message,
                call.output_metadata,
            ],
        )?;
        Ok(())
    }

    pub fn get_tool_call(&self, id: &str) -> Result<Option<ToolCallRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM tool_calls WHERE id = ?",
            [id],
            Self::row_to_tool_call,
        )
        .optional()
        .map_err(Error::from)
    }

    fn row_to_tool_call(row: &Row) -> rusqlite::Result<ToolCallRecord> {
        Ok(ToolCallRecord {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            turn_id: row.get("turn_id")?,
            message_id: row.get("message_id")?,
            tool_name: row.get("tool_name")?,
            args_json: row.get("args_json")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            duration_ms: row.get("duration_ms")?,
            success: row.get("success")?,
            error_message: row.get("error_message")?,
            output_metadata: row.get("output_metadata")?,
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            reasoning_tokens: row.get("reasoning_tokens")?,
            cache_read_tokens: row.get("cache_read_tokens")?,
            cache_write_tokens: row.get("cache_write_tokens")?,
            cost: row.get("cost")?,
        })
    }

    // ============================================
    // Part operations
    // ============================================

    /// Insert or replace a part, keeping the host payload verbatim.
    pub fn upsert_part(&self, part: &PartRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO parts
                (id, message_id, session_id, part_index, type, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                part.id,
                part.message_id,
                part.session_id,
                part.part_index,
                part.kind,
                part.data,
                part.created_at,
            ],
        )?;
        Ok(())
    }

    /// Insert a part only if absent. Returns true when a row was written.
    pub fn insert_part_if_absent(&self, part: &PartRecord) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO parts
                (id, message_id, session_id, part_index, type, data, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                part.id,
                part.message_id,
                part.session_id,
                part.part_index,
                part.kind,
                part.data,
                part.created_at,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn count_parts_for_message(&self, message_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM parts WHERE message_id = ?",
            [message_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ============================================
    // Compaction operations
    // ============================================

    /// Open a compaction episode. Returns the row id.
    pub fn begin_compaction(&self, session_id: &str, started_at: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO compactions (session_id, started_at) VALUES (?1, ?2)",
            params![session_id, started_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Close a compaction episode by row id.
    pub fn complete_compaction(&self, id: i64, completed_at: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE compactions SET completed_at = ?2 WHERE id = ?1",
            params![id, completed_at],
        )?;
        Ok(())
    }

    /// The most recent still-open compaction for a session, if any.
    pub fn open_compaction(&self, session_id: &str) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"
            SELECT id FROM compactions
            WHERE session_id = ?1 AND completed_at IS NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#,
            [session_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Error::from)
    }

    pub fn get_compaction(&self, id: i64) -> Result<Option<CompactionRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, session_id, started_at, completed_at FROM compactions WHERE id = ?",
            [id],
            |row| {
                Ok(CompactionRecord {
                    id: row.get(0)?,
                    session_id: row.get(1)?,
                    started_at: row.get(2)?,
                    completed_at: row.get(3)?,
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // ============================================
    // Error sink
    // ============================================

    /// Append a reconciliation failure. Best effort: a failure to record the
    /// failure is logged and swallowed so the event loop keeps going.
    pub fn log_error(
        &self,
        event_type: &str,
        event_data: Option<&str>,
        error_message: &str,
        context: Option<&str>,
    ) {
        let now = crate::types::now_millis();
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            r#"
            INSERT INTO plugin_errors (timestamp, event_type, event_data, error_message, stack_trace)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![now, event_type, event_data, error_message, context],
        );

        if let Err(e) = result {
            tracing::error!(event_type, error = %e, "Failed to record reconciliation error");
        }
    }

    pub fn error_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM plugin_errors", [], |r| r.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn sample_session(id: &str) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            title: Some("test session".to_string()),
            parent_id: None,
            project_path: Some("/work".to_string()),
            worktree: Some("/work".to_string()),
            created_at: 100,
            updated_at: Some(100),
            ended_at: None,
        }
    }

    #[test]
    fn test_session_roundtrip() {
        let db = test_db();
        db.upsert_session(&sample_session("ses_1")).unwrap();

        let loaded = db.get_session("ses_1").unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("test session"));
        assert_eq!(loaded.created_at, 100);
        assert!(db.session_exists("ses_1").unwrap());
        assert!(!db.session_exists("ses_2").unwrap());
    }

    #[test]
    fn test_insert_session_if_absent() {
        let db = test_db();
        assert!(db.insert_session_if_absent(&sample_session("ses_1")).unwrap());
        assert!(!db.insert_session_if_absent(&sample_session("ses_1")).unwrap());
    }

    #[test]
    fn test_merge_session_keeps_ended_at() {
        let db = test_db();
        db.upsert_session(&sample_session("ses_1")).unwrap();
        db.end_session_and_turn("ses_1", None, 500).unwrap();

        let mut later = sample_session("ses_1");
        later.title = Some("renamed".to_string());
        later.updated_at = Some(600);
        db.merge_session(&later).unwrap();

        let loaded = db.get_session("ses_1").unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("renamed"));
        assert_eq!(loaded.updated_at, Some(600));
        // merge never touches lifecycle columns
        assert_eq!(loaded.ended_at, Some(500));
    }

    #[test]
    fn test_replayed_session_upsert_keeps_ended_at() {
        let db = test_db();
        db.upsert_session(&sample_session("ses_1")).unwrap();
        db.end_session_and_turn("ses_1", None, 500).unwrap();

        // session.created replayed after the session already ended
        db.upsert_session(&sample_session("ses_1")).unwrap();

        let loaded = db.get_session("ses_1").unwrap().unwrap();
        assert_eq!(loaded.ended_at, Some(500));
        assert_eq!(loaded.created_at, 100);
    }

    #[test]
    fn test_end_session_closes_turn() {
        let db = test_db();
        db.upsert_session(&sample_session("ses_1")).unwrap();
        db.upsert_turn(&TurnRecord {
            id: "msg_u".to_string(),
            session_id: "ses_1".to_string(),
            parent_turn_id: None,
            user_message: None,
            started_at: 100,
            ended_at: None,
        })
        .unwrap();

        db.end_session_and_turn("ses_1", Some("msg_u"), 200).unwrap();

        let session = db.get_session("ses_1").unwrap().unwrap();
        assert_eq!(session.ended_at, Some(200));
        let turn = db.get_turn("msg_u").unwrap().unwrap();
        assert_eq!(turn.ended_at, Some(200));

        // closing again does not move the timestamp
        db.end_turn("msg_u", 999).unwrap();
        let turn = db.get_turn("msg_u").unwrap().unwrap();
        assert_eq!(turn.ended_at, Some(200));
    }

    #[test]
    fn test_latest_turn_at_or_before() {
        let db = test_db();
        for (id, started_at) in [("t1", 100), ("t2", 200), ("t3", 300)] {
            db.upsert_turn(&TurnRecord {
                id: id.to_string(),
                session_id: "ses_1".to_string(),
                parent_turn_id: None,
                user_message: None,
                started_at,
                ended_at: None,
            })
            .unwrap();
        }

        assert_eq!(
            db.latest_turn_at_or_before("ses_1", 250).unwrap().as_deref(),
            Some("t2")
        );
        assert_eq!(
            db.latest_turn_at_or_before("ses_1", 300).unwrap().as_deref(),
            Some("t3")
        );
        assert_eq!(db.latest_turn_at_or_before("ses_1", 50).unwrap(), None);
        assert_eq!(db.latest_turn_at_or_before("ses_2", 250).unwrap(), None);
    }

    #[test]
    fn test_merge_message_policy() {
        let db = test_db();

        // live write with content and turn attribution
        db.upsert_message(&MessageRecord {
            id: "msg_1".to_string(),
            session_id: "ses_1".to_string(),
            turn_id: Some("t1".to_string()),
            role: "assistant".to_string(),
            content: Some("live content".to_string()),
            created_at: 100,
            ..Default::default()
        })
        .unwrap();

        // backfill sees the same message with different values
        db.merge_message(&MessageRecord {
            id: "msg_1".to_string(),
            session_id: "ses_1".to_string(),
            turn_id: Some("t9".to_string()),
            role: "assistant".to_string(),
            content: Some("backfill content".to_string()),
            created_at: 100,
            ..Default::default()
        })
        .unwrap();

        let loaded = db.get_message("msg_1").unwrap().unwrap();
        assert_eq!(loaded.content.as_deref(), Some("live content"));
        assert_eq!(loaded.turn_id.as_deref(), Some("t1"));

        // a hole left by the live path does get filled
        db.upsert_message(&MessageRecord {
            id: "msg_2".to_string(),
            session_id: "ses_1".to_string(),
            turn_id: None,
            role: "assistant".to_string(),
            content: Some("".to_string()),
            created_at: 110,
            ..Default::default()
        })
        .unwrap();
        db.merge_message(&MessageRecord {
            id: "msg_2".to_string(),
            session_id: "ses_1".to_string(),
            turn_id: Some("t1".to_string()),
            role: "assistant".to_string(),
            content: Some("recovered".to_string()),
            created_at: 110,
            ..Default::default()
        })
        .unwrap();

        let loaded = db.get_message("msg_2").unwrap().unwrap();
        assert_eq!(loaded.content.as_deref(), Some("recovered"));
        assert_eq!(loaded.turn_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_tool_call_lifecycle() {
        let db = test_db();
        db.upsert_tool_call(&ToolCallRecord {
            id: "call_1".to_string(),
            session_id: "ses_1".to_string(),
            turn_id: Some("t1".to_string()),
            tool_name: "read".to_string(),
            args_json: Some(r#"{"path":"/tmp/x"}"#.to_string()),
            started_at: 120,
            ..Default::default()
        })
        .unwrap();

        db.attach_tool_call_message("call_1", "msg_a").unwrap();
        db.finish_tool_call("call_1", "msg_a", 140, 20, true, None, None)
            .unwrap();

        let call = db.get_tool_call("call_1").unwrap().unwrap();
        assert_eq!(call.message_id.as_deref(), Some("msg_a"));
        assert_eq!(call.completed_at, Some(140));
        assert_eq!(call.duration_ms, Some(20));
        assert_eq!(call.success, Some(true));
    }

    #[test]
    fn test_terminal_tool_call_never_regresses() {
        let db = test_db();
        db.upsert_tool_call(&ToolCallRecord {
            id: "call_1".to_string(),
            session_id: "ses_1".to_string(),
            turn_id: Some("t1".to_string()),
            tool_name: "read".to_string(),
            started_at: 120,
            ..Default::default()
        })
        .unwrap();
        db.finish_tool_call("call_1", "msg_a", 140, 20, true, None, None)
            .unwrap();

        // a replayed announcement leaves the finished row alone
        db.upsert_tool_call(&ToolCallRecord {
            id: "call_1".to_string(),
            session_id: "ses_1".to_string(),
            tool_name: "read".to_string(),
            started_at: 999,
            ..Default::default()
        })
        .unwrap();

        let call = db.get_tool_call("call_1").unwrap().unwrap();
        assert_eq!(call.started_at, 120);
        assert_eq!(call.completed_at, Some(140));
        assert_eq!(call.success, Some(true));
        assert_eq!(call.turn_id.as_deref(), Some("t1"));

        // and so does a second terminal write
        db.finish_tool_call("call_1", "msg_a", 500, 380, false, Some("late"), None)
            .unwrap();
        let call = db.get_tool_call("call_1").unwrap().unwrap();
        assert_eq!(call.completed_at, Some(140));
        assert_eq!(call.success, Some(true));
        assert!(call.error_message.is_none());
    }

    #[test]
    fn test_apply_usage_to_tool_calls() {
        let db = test_db();
        db.upsert_tool_call(&ToolCallRecord {
            id: "call_1".to_string(),
            session_id: "ses_1".to_string(),
            tool_name: "bash".to_string(),
            started_at: 120,
            ..Default::default()
        })
        .unwrap();
        db.attach_tool_call_message("call_1", "msg_a").unwrap();

        db.apply_usage_to_tool_calls(
            "msg_a",
            &UsageFigures {
                input_tokens: 10,
                output_tokens: 20,
                reasoning_tokens: 3,
                cache_read_tokens: 1,
                cache_write_tokens: 2,
                cost: 0.5,
            },
        )
        .unwrap();

        let call = db.get_tool_call("call_1").unwrap().unwrap();
        assert_eq!(call.input_tokens, Some(10));
        assert_eq!(call.output_tokens, Some(20));
        assert_eq!(call.cost, Some(0.5));
    }

    #[test]
    fn test_compaction_lifecycle() {
        let db = test_db();
        let id = db.begin_compaction("ses_1", 100).unwrap();
        assert_eq!(db.open_compaction("ses_1").unwrap(), Some(id));

        db.complete_compaction(id, 150).unwrap();
        assert_eq!(db.open_compaction("ses_1").unwrap(), None);

        let row = db.get_compaction(id).unwrap().unwrap();
        assert_eq!(row.completed_at, Some(150));
    }

    #[test]
    fn test_log_error_never_panics() {
        let db = test_db();
        db.log_error("message.updated", Some(r#"{"id":"m"}"#), "boom", None);
        assert_eq!(db.error_count().unwrap(), 1);
    }
}
