//! In-memory derived state for the live reconciler
//!
//! The store alone cannot answer "which turn is active in this session right
//! now" without ordering assumptions, so the reconciler carries a small
//! derived view between events. The state is a value: every updater consumes
//! the old state and returns the next one, so a failed handler simply keeps
//! the previous value and replaying events is side-effect free.
//!
//! Everything here is reconstructible from the event stream. After a restart
//! the maps start empty and repopulate as events arrive; the known gap is
//! user messages in subagent sessions whose parent mapping was only in
//! memory, which are then classified as ordinary prompts. The startup
//! backfill narrows that window by reseeding `session_parents` from the
//! host's session list.

use std::collections::HashMap;

/// The turn currently open in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTurn {
    pub turn_id: String,
    pub started_at: i64,
}

/// A tool call announced by the host but not yet terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingToolCall {
    pub session_id: String,
    pub tool_name: String,
    pub turn_id: Option<String>,
    pub started_at: i64,
}

/// Derived reconciler state. Cheap to clone; all updaters are by-value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackerState {
    /// session id -> parent session id (None for main sessions)
    session_parents: HashMap<String, Option<String>>,
    /// session id -> currently open turn
    active_turns: HashMap<String, ActiveTurn>,
    /// subagent session id -> turn inherited from the parent session
    parent_turns: HashMap<String, String>,
    /// call id -> in-flight tool call
    pending_tools: HashMap<String, PendingToolCall>,
    /// session id -> open compaction row id
    compacting: HashMap<String, i64>,
}

impl TrackerState {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================
    // Session lineage
    // ============================================

    pub fn record_session(mut self, session_id: &str, parent_id: Option<&str>) -> Self {
        self.session_parents
            .insert(session_id.to_string(), parent_id.map(str::to_string));
        self
    }

    /// Drop every trace of a session (deleted on the host).
    pub fn forget_session(mut self, session_id: &str) -> Self {
        self.session_parents.remove(session_id);
        self.active_turns.remove(session_id);
        self.parent_turns.remove(session_id);
        self.compacting.remove(session_id);
        self.pending_tools.retain(|_, p| p.session_id != session_id);
        self
    }

    /// Parent session id, if this session is a known subagent.
    pub fn parent_of(&self, session_id: &str) -> Option<&str> {
        self.session_parents
            .get(session_id)
            .and_then(|p| p.as_deref())
    }

    pub fn is_known_subagent(&self, session_id: &str) -> bool {
        self.parent_of(session_id).is_some()
    }

    // ============================================
    // Turns
    // ============================================

    pub fn begin_turn(mut self, session_id: &str, turn_id: &str, started_at: i64) -> Self {
        self.active_turns.insert(
            session_id.to_string(),
            ActiveTurn {
                turn_id: turn_id.to_string(),
                started_at,
            },
        );
        self
    }

    pub fn end_turn(mut self, session_id: &str) -> Self {
        self.active_turns.remove(session_id);
        self
    }

    pub fn active_turn(&self, session_id: &str) -> Option<&ActiveTurn> {
        self.active_turns.get(session_id)
    }

    /// Record that a subagent session's work belongs to a parent turn.
    pub fn inherit_turn(mut self, session_id: &str, turn_id: &str) -> Self {
        self.parent_turns
            .insert(session_id.to_string(), turn_id.to_string());
        self
    }

    /// The turn new activity in this session belongs to: the session's own
    /// open turn, else the turn inherited from the parent session.
    pub fn current_turn(&self, session_id: &str) -> Option<&str> {
        self.active_turns
            .get(session_id)
            .map(|t| t.turn_id.as_str())
            .or_else(|| self.parent_turns.get(session_id).map(String::as_str))
    }

    // ============================================
    // Tool calls
    // ============================================

    pub fn add_pending_tool(mut self, call_id: &str, pending: PendingToolCall) -> Self {
        self.pending_tools.insert(call_id.to_string(), pending);
        self
    }

    /// Claim an in-flight tool call. The second claim for the same call id
    /// yields None, which is what makes duplicate terminal events no-ops.
    pub fn take_pending_tool(mut self, call_id: &str) -> (Self, Option<PendingToolCall>) {
        let pending = self.pending_tools.remove(call_id);
        (self, pending)
    }

    pub fn pending_tool(&self, call_id: &str) -> Option<&PendingToolCall> {
        self.pending_tools.get(call_id)
    }

    // ============================================
    // Compactions
    // ============================================

    pub fn begin_compaction(mut self, session_id: &str, row_id: i64) -> Self {
        self.compacting.insert(session_id.to_string(), row_id);
        self
    }

    pub fn take_compaction(mut self, session_id: &str) -> (Self, Option<i64>) {
        let row_id = self.compacting.remove(session_id);
        (self, row_id)
    }

    pub fn is_compacting(&self, session_id: &str) -> bool {
        self.compacting.contains_key(session_id)
    }
}
