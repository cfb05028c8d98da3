//! Batch reconciliation of pre-existing history
//!
//! Two front ends feed the same ingestion path:
//!
//! - [`host`] — incremental backfill over the host's query API, run at
//!   tracker startup to catch up on sessions that changed while the tracker
//!   was down;
//! - [`snapshot`] — one-time migration over the host's on-disk snapshot
//!   tree, for ledgers bootstrapped from scratch.
//!
//! Both walk a session's messages in creation order and reconstruct turns
//! retrospectively: a top-level user message closes the previous turn at its
//! own creation time, and whatever turn is still open at the end of the scan
//! is closed at wall clock. Subagent sessions never open turns; their rows
//! are attributed to the parent turn running when the session was created.

pub mod host;
pub mod snapshot;

use std::fmt;

use crate::db::Database;
use crate::error::Result;
use crate::types::{
    now_millis, render_parts, text_content, MessageInfo, MessageRecord, MessageWithParts,
    PartPayload, PartRecord, SessionInfo, ToolCallRecord, ToolState, TurnRecord,
};

/// Per-entity counters for one batch run.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntityStats {
    pub found: usize,
    pub processed: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Counters for a whole backfill or migration run.
#[derive(Debug, Default, Clone, Copy)]
pub struct BackfillStats {
    pub sessions: EntityStats,
    pub turns: EntityStats,
    pub messages: EntityStats,
    pub parts: EntityStats,
    pub tool_calls: EntityStats,
}

impl fmt::Display for BackfillStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, stats) in [
            ("sessions", &self.sessions),
            ("turns", &self.turns),
            ("messages", &self.messages),
            ("parts", &self.parts),
            ("tool calls", &self.tool_calls),
        ] {
            writeln!(
                f,
                "{:>10}: {} found, {} processed, {} skipped, {} errors",
                name, stats.found, stats.processed, stats.skipped, stats.errors
            )?;
        }
        Ok(())
    }
}

/// How ingestion treats rows that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WritePolicy {
    /// Upsert with the per-field merge policy (incremental backfill:
    /// the live reconciler may have written these rows already)
    Merge,
    /// Insert only when absent, counting skips (one-time migration)
    InsertIfAbsent,
}

/// Walk one session's messages in creation order, reconstructing turns and
/// persisting messages, parts, and terminal tool calls.
///
/// `inherited_turn` is the parent turn a subagent session's activity belongs
/// to; main sessions pass None and open their own turns.
pub(crate) fn ingest_session_messages(
    db: &Database,
    session: &SessionInfo,
    messages: &mut Vec<MessageWithParts>,
    inherited_turn: Option<&str>,
    policy: WritePolicy,
    stats: &mut BackfillStats,
) -> Result<()> {
    messages.sort_by_key(|m| m.info.created());

    let is_subagent = session.is_subagent();
    let mut open_turn: Option<String> = None;

    for message in messages.iter() {
        stats.messages.found += 1;

        let current_turn: Option<String> = if is_subagent {
            inherited_turn.map(str::to_string)
        } else {
            if let MessageInfo::User(user) = &message.info {
                // A new top-level prompt ends the previous turn
                if let Some(prev) = open_turn.take() {
                    db.end_turn(&prev, user.time.created)?;
                }

                let turn = TurnRecord {
                    id: user.id.clone(),
                    session_id: user.session_id.clone(),
                    parent_turn_id: None,
                    user_message: text_content(&message.parts),
                    started_at: user.time.created,
                    ended_at: None,
                };

                stats.turns.found += 1;
                match policy {
                    WritePolicy::Merge => {
                        db.merge_turn(&turn)?;
                        stats.turns.processed += 1;
                    }
                    WritePolicy::InsertIfAbsent => {
                        if db.insert_turn_if_absent(&turn)? {
                            stats.turns.processed += 1;
                        } else {
                            stats.turns.skipped += 1;
                        }
                    }
                }

                open_turn = Some(user.id.clone());
            }
            open_turn.clone()
        };

        let record = message_record(&message.info, &message.parts, is_subagent, &current_turn);
        match policy {
            WritePolicy::Merge => {
                db.merge_message(&record)?;
                stats.messages.processed += 1;
            }
            WritePolicy::InsertIfAbsent => {
                if db.insert_message_if_absent(&record)? {
                    stats.messages.processed += 1;
                } else {
                    stats.messages.skipped += 1;
                }
            }
        }

        ingest_parts(db, message, &current_turn, policy, stats)?;
    }

    // The last turn has no successor to close it; wall clock is the best
    // available upper bound
    if let Some(turn_id) = open_turn {
        db.end_turn(&turn_id, now_millis())?;
    }

    Ok(())
}

fn message_record(
    info: &MessageInfo,
    parts: &[crate::types::PartEnvelope],
    is_subagent: bool,
    turn_id: &Option<String>,
) -> MessageRecord {
    let content = render_parts(parts);

    match info {
        MessageInfo::User(msg) => MessageRecord {
            id: msg.id.clone(),
            session_id: msg.session_id.clone(),
            turn_id: turn_id.clone(),
            role: "user".to_string(),
            content,
            agent: msg.agent.clone(),
            is_subagent_prompt: is_subagent,
            model_id: msg.model.as_ref().and_then(|m| m.model_id.clone()),
            provider_id: msg.model.as_ref().and_then(|m| m.provider_id.clone()),
            created_at: msg.time.created,
            ..Default::default()
        },
        MessageInfo::Assistant(msg) => MessageRecord {
            id: msg.id.clone(),
            session_id: msg.session_id.clone(),
            turn_id: turn_id.clone(),
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
        },
    }
}

/// Persist a message's parts verbatim (visitation order as part_index) and
/// lift terminal tool parts into tool_call rows.
fn ingest_parts(
    db: &Database,
    message: &MessageWithParts,
    turn_id: &Option<String>,
    policy: WritePolicy,
    stats: &mut BackfillStats,
) -> Result<()> {
    let created_at = message.info.created();

    for (index, part) in message.parts.iter().enumerate() {
        stats.parts.found += 1;

        let record = PartRecord {
            id: part.id.clone(),
            message_id: part.message_id.clone(),
            session_id: part.session_id.clone(),
            part_index: index as i64,
            kind: part.kind.clone(),
            data: part.raw.to_string(),
            created_at,
        };

        match policy {
            WritePolicy::Merge => {
                db.upsert_part(&record)?;
                stats.parts.processed += 1;
            }
            WritePolicy::InsertIfAbsent => {
                if db.insert_part_if_absent(&record)? {
                    stats.parts.processed += 1;
                } else {
                    stats.parts.skipped += 1;
                }
            }
        }

        if let PartPayload::Tool(tool) = &part.payload {
            let call = match &tool.state {
                ToolState::Completed(done) => Some(ToolCallRecord {
                    id: tool.call_id.clone(),
                    session_id: tool.session_id.clone(),
                    turn_id: turn_id.clone(),
                    message_id: Some(tool.message_id.clone()),
                    tool_name: tool.tool.clone(),
                    args_json: Some(done.input.to_string()),
                    started_at: done.time.start,
                    completed_at: done.time.end,
                    duration_ms: done.time.end.map(|end| end - done.time.start),
                    success: Some(true),
                    error_message: None,
                    output_metadata: done.metadata.as_ref().map(|m| m.to_string()),
                    ..Default::default()
                }),
                ToolState::Error(failed) => Some(ToolCallRecord {
                    id: tool.call_id.clone(),
                    session_id: tool.session_id.clone(),
                    turn_id: turn_id.clone(),
                    message_id: Some(tool.message_id.clone()),
                    tool_name: tool.tool.clone(),
                    args_json: Some(failed.input.to_string()),
                    started_at: failed.time.start,
                    completed_at: failed.time.end,
                    duration_ms: failed.time.end.map(|end| end - failed.time.start),
                    success: Some(false),
                    error_message: Some(failed.error.clone()),
                    output_metadata: failed.metadata.as_ref().map(|m| m.to_string()),
                    ..Default::default()
                }),
                // In-flight states in historical data mean the call never
                // finished; there is nothing durable to record
                ToolState::Pending | ToolState::Running => None,
            };

            if let Some(call) = call {
                stats.tool_calls.found += 1;
                db.merge_tool_call(&call)?;
                stats.tool_calls.processed += 1;
            }
        }
    }

    Ok(())
}
