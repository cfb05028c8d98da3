//! Live event reconciliation
//!
//! `EventReconciler` consumes the host's event stream and converges the
//! ledger onto what the host reports. Each handler takes the current
//! [`TrackerState`] and returns the next one; when a handler fails the error
//! is appended to `plugin_errors` and the previous state is kept, so a bad
//! event never takes the loop down and never half-applies state.
//!
//! Every write is idempotent. Events carry fully-formed entity snapshots,
//! so replaying a window of the stream converges on the same rows.

pub mod tracker;

use crate::db::Database;
use crate::error::Result;
use crate::host::HostClient;
use crate::types::{
    now_millis, render_parts, AssistantMessage, CompactionPart, LedgerEvent, MessageInfo,
    MessageRecord, PartEnvelope, PartPayload, SessionInfo, SessionRecord, ToolCallRecord,
    ToolPart, ToolState, TurnRecord, UsageFigures, UserMessage,
};

use tracker::{PendingToolCall, TrackerState};

/// Reconciles live host events into the ledger.
pub struct EventReconciler<H: HostClient> {
    db: Database,
    host: H,
    state: TrackerState,
}

impl<H: HostClient> EventReconciler<H> {
    pub fn new(db: Database, host: H) -> Self {
        Self::with_state(db, host, TrackerState::new())
    }

    /// Start from pre-seeded state (the startup backfill seeds session
    /// lineage so subagent prompts are classified correctly after restart).
    pub fn with_state(db: Database, host: H, state: TrackerState) -> Self {
        Self { db, host, state }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Give the store and state back, e.g. to re-run a backfill between
    /// stream reconnects.
    pub fn into_parts(self) -> (Database, TrackerState) {
        (self.db, self.state)
    }

    /// Apply one event. Never returns an error: per-event failures go to the
    /// error sink and leave the state untouched.
    pub fn handle(&mut self, event: LedgerEvent) {
        let state = self.state.clone();

        match self.dispatch(state, &event) {
            Ok(next) => self.state = next,
            Err(e) => {
                tracing::warn!(event = event.kind(), error = %e, "Event reconciliation failed");
                self.db.log_error(
                    event.kind(),
                    Some(&format!("{:?}", event)),
                    &e.to_string(),
                    None,
                );
            }
        }
    }

    fn dispatch(&self, state: TrackerState, event: &LedgerEvent) -> Result<TrackerState> {
        match event {
            LedgerEvent::SessionCreated { info } => self.on_session_created(state, info),
            LedgerEvent::SessionUpdated { info } => self.on_session_updated(state, info),
            LedgerEvent::SessionIdle { session_id } => self.on_session_idle(state, session_id),
            LedgerEvent::SessionDeleted { info } => self.on_session_deleted(state, info),
            LedgerEvent::SessionCompacting { session_id } => {
                self.on_session_compacting(state, session_id)
            }
            LedgerEvent::SessionCompacted { session_id } => {
                self.on_session_compacted(state, session_id)
            }
            LedgerEvent::MessageUpdated { info } => self.on_message_updated(state, info),
            LedgerEvent::PartUpdated { part } => self.on_part_updated(state, part),
            LedgerEvent::ToolExecuteBegin {
                call_id,
                session_id,
                tool,
                args,
            } => self.on_tool_execute(state, call_id, session_id, tool, args),
            LedgerEvent::Unknown => Ok(state),
        }
    }

    // ============================================
    // Session lifecycle
    // ============================================

    fn on_session_created(&self, state: TrackerState, info: &SessionInfo) -> Result<TrackerState> {
        self.db.upsert_session(&SessionRecord::from_info(info, None))?;

        let mut state = state.record_session(&info.id, info.parent_id.as_deref());

        // A subagent spawned while its parent has a turn open inherits it
        if let Some(parent_id) = &info.parent_id {
            if let Some(turn_id) = state.current_turn(parent_id).map(str::to_string) {
                state = state.inherit_turn(&info.id, &turn_id);
            }
        }

        Ok(state)
    }

    fn on_session_updated(&self, state: TrackerState, info: &SessionInfo) -> Result<TrackerState> {
        self.db.update_session_info(
            &info.id,
            info.title.as_deref(),
            info.parent_id.as_deref(),
            info.time.updated,
        )?;
        Ok(state.record_session(&info.id, info.parent_id.as_deref()))
    }

    fn on_session_idle(&self, state: TrackerState, session_id: &str) -> Result<TrackerState> {
        let turn_id = state
            .active_turn(session_id)
            .map(|t| t.turn_id.clone());

        self.db
            .end_session_and_turn(session_id, turn_id.as_deref(), now_millis())?;

        Ok(state.end_turn(session_id))
    }

    /// Deleted sessions keep their ledger rows; only activity is noted.
    fn on_session_deleted(&self, state: TrackerState, info: &SessionInfo) -> Result<TrackerState> {
        self.db.touch_session(&info.id, now_millis())?;
        Ok(state.forget_session(&info.id))
    }

    // ============================================
    // Compaction lifecycle
    // ============================================

    fn on_session_compacting(
        &self,
        state: TrackerState,
        session_id: &str,
    ) -> Result<TrackerState> {
        let row_id = self.db.begin_compaction(session_id, now_millis())?;
        Ok(state.begin_compaction(session_id, row_id))
    }

    fn on_session_compacted(&self, state: TrackerState, session_id: &str) -> Result<TrackerState> {
        let (state, row_id) = state.take_compaction(session_id);
        if let Some(row_id) = row_id {
            self.db.complete_compaction(row_id, now_millis())?;
        }
        Ok(state)
    }

    // ============================================
    // Messages
    // ============================================

    fn on_message_updated(&self, state: TrackerState, info: &MessageInfo) -> Result<TrackerState> {
        // While the host rewrites a session's history, message churn is
        // compaction noise, not new activity
        if state.is_compacting(info.session_id()) {
            return Ok(state);
        }

        match info {
            MessageInfo::User(msg) => self.on_user_message(state, msg),
            MessageInfo::Assistant(msg) => self.on_assistant_message(state, msg),
        }
    }

    /// Render a message's content from its parts. Best effort: the message
    /// row and its turn matter more than the rendering, so a failed detail
    /// fetch is recorded and the row is written with NULL content for the
    /// next backfill pass to fill.
    fn fetch_content(&self, session_id: &str, message_id: &str) -> Option<String> {
        match self.host.message_detail(session_id, message_id) {
            Ok(detail) => render_parts(&detail.parts),
            Err(e) => {
                tracing::warn!(message = message_id, error = %e, "Content fetch failed");
                self.db
                    .log_error("message.content", Some(message_id), &e.to_string(), None);
                None
            }
        }
    }

    /// User messages are atomic: persist immediately, and open a turn unless
    /// this is a subagent prompt (which inherits the parent turn instead).
    fn on_user_message(&self, state: TrackerState, msg: &UserMessage) -> Result<TrackerState> {
        let content = self.fetch_content(&msg.session_id, &msg.id);

        let is_subagent = state.is_known_subagent(&msg.session_id);

        let (state, turn_id, is_subagent_prompt) = if is_subagent {
            let turn_id = state.current_turn(&msg.session_id).map(str::to_string);
            (state, turn_id, true)
        } else {
            self.db.upsert_turn(&TurnRecord {
                id: msg.id.clone(),
                session_id: msg.session_id.clone(),
                parent_turn_id: None,
                user_message: None,
                started_at: msg.time.created,
                ended_at: None,
            })?;
            let state = state.begin_turn(&msg.session_id, &msg.id, msg.time.created);
            (state, Some(msg.id.clone()), false)
        };

        self.db.upsert_message(&MessageRecord {
            id: msg.id.clone(),
            session_id: msg.session_id.clone(),
            turn_id,
            role: "user".to_string(),
            content,
            agent: msg.agent.clone(),
            is_subagent_prompt,
            model_id: msg.model.as_ref().and_then(|m| m.model_id.clone()),
            provider_id: msg.model.as_ref().and_then(|m| m.provider_id.clone()),
            created_at: msg.time.created,
            ..Default::default()
        })?;

        Ok(state)
    }

    /// Assistant messages stream: only the completed snapshot is persisted,
    /// and its usage figures are pushed down onto the tool calls it owns.
    fn on_assistant_message(
        &self,
        state: TrackerState,
        msg: &AssistantMessage,
    ) -> Result<TrackerState> {
        if !msg.is_complete() {
            return Ok(state);
        }

        let content = self.fetch_content(&msg.session_id, &msg.id);
        let turn_id = state.current_turn(&msg.session_id).map(str::to_string);

        self.db.upsert_message(&MessageRecord {
            id: msg.id.clone(),
            session_id: msg.session_id.clone(),
            turn_id,
            role: "assistant".to_string(),
            content,
            agent: msg.agent.clone(),
            is_subagent_prompt: false,
            model_id: msg.model_id.clone(),
            provider_id: msg.provider_id.clone(),
            created_at: msg.time.created,
            completed_at: msg.time.completed,
            input_tokens: Some(msg.tokens.input),
            output_tokens: Some(msg.tokens.output),
            reasoning_tokens: Some(msg.tokens.reasoning),
            cache_read_tokens: Some(msg.tokens.cache.read),
            cache_write_tokens: Some(msg.tokens.cache.write),
            cost: Some(msg.cost),
            finish_reason: msg.finish.clone(),
        })?;

        self.db.apply_usage_to_tool_calls(
            &msg.id,
            &UsageFigures::from_tokens(&msg.tokens, msg.cost),
        )?;

        Ok(state)
    }

    // ============================================
    // Parts
    // ============================================

    fn on_part_updated(&self, state: TrackerState, part: &PartEnvelope) -> Result<TrackerState> {
        match &part.payload {
            PartPayload::Tool(tool) => self.on_tool_part(state, tool),
            PartPayload::Compaction(compaction) => self.on_compaction_part(state, compaction),
            // Other part kinds surface through message content; their raw
            // payloads are persisted by backfill
            _ => Ok(state),
        }
    }

    fn on_tool_part(&self, state: TrackerState, tool: &ToolPart) -> Result<TrackerState> {
        match &tool.state {
            ToolState::Pending | ToolState::Running => {
                self.db
                    .attach_tool_call_message(&tool.call_id, &tool.message_id)?;
                Ok(state)
            }
            ToolState::Completed(done) => {
                self.finish_pending(state, tool, true, None, done.metadata.as_ref())
            }
            ToolState::Error(failed) => self.finish_pending(
                state,
                tool,
                false,
                Some(failed.error.as_str()),
                failed.metadata.as_ref(),
            ),
        }
    }

    /// Terminal tool states are guarded by the pending map: the first
    /// terminal event wins, later duplicates find nothing to claim.
    fn finish_pending(
        &self,
        state: TrackerState,
        tool: &ToolPart,
        success: bool,
        error_message: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<TrackerState> {
        let (state, pending) = state.take_pending_tool(&tool.call_id);

        let Some(pending) = pending else {
            return Ok(state);
        };

        let now = now_millis();
        self.db.finish_tool_call(
            &tool.call_id,
            &tool.message_id,
            now,
            now.saturating_sub(pending.started_at),
            success,
            error_message,
            metadata.map(|m| m.to_string()).as_deref(),
        )?;

        Ok(state)
    }

    /// The compaction part closes the open compaction episode and leaves a
    /// synthetic assistant message marking where history was rewritten.
    fn on_compaction_part(
        &self,
        state: TrackerState,
        part: &CompactionPart,
    ) -> Result<TrackerState> {
        let now = now_millis();

        let (state, row_id) = state.take_compaction(&part.session_id);
        let row_id = match row_id {
            Some(id) => Some(id),
            // Tracker may have restarted mid-compaction; fall back to the store
            None => self.db.open_compaction(&part.session_id)?,
        };
        if let Some(row_id) = row_id {
            self.db.complete_compaction(row_id, now)?;
        }

        self.db.upsert_message(&MessageRecord {
            id: part.message_id.clone(),
            session_id: part.session_id.clone(),
            turn_id: None,
            role: "assistant".to_string(),
            content: Some(format!("[Context compacted. Auto: {}]", part.auto)),
            agent: Some("compaction".to_string()),
            created_at: now,
            completed_at: Some(now),
            ..Default::default()
        })?;

        Ok(state)
    }

    // ============================================
    // Tool execution hook
    // ============================================

    /// `tool.execute.before` fires before the tool part reaches pending, so
    /// this is where the call row is born and attributed to a turn.
    fn on_tool_execute(
        &self,
        state: TrackerState,
        call_id: &str,
        session_id: &str,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<TrackerState> {
        let now = now_millis();
        let turn_id = state.current_turn(session_id).map(str::to_string);

        self.db.upsert_tool_call(&ToolCallRecord {
            id: call_id.to_string(),
            session_id: session_id.to_string(),
            turn_id: turn_id.clone(),
            tool_name: tool.to_string(),
            args_json: Some(args.to_string()),
            started_at: now,
            ..Default::default()
        })?;

        Ok(state.add_pending_tool(
            call_id,
            PendingToolCall {
                session_id: session_id.to_string(),
                tool_name: tool.to_string(),
                turn_id,
                started_at: now,
            },
        ))
    }
}
