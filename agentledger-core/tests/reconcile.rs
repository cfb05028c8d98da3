//! Integration tests for live event reconciliation
//!
//! Replays event sequences against an in-memory ledger with a mock host,
//! checking turn lifecycle, tool call attribution, compaction handling, and
//! the error sink.

use std::collections::HashMap;

use agentledger_core::{
    Database, Error, EventReconciler, HostClient, LedgerEvent, MessageWithParts, Result,
    SessionInfo,
};
use serde_json::{json, Value};

/// Host stub serving canned message details.
#[derive(Default)]
struct MockHost {
    sessions: Vec<SessionInfo>,
    /// (session id, message id) -> detail
    details: HashMap<(String, String), MessageWithParts>,
    /// message ids whose detail fetch fails
    failing: Vec<String>,
}

impl MockHost {
    fn add_detail(&mut self, session_id: &str, message_id: &str, detail: Value) {
        let detail: MessageWithParts = serde_json::from_value(detail).unwrap();
        self.details
            .insert((session_id.to_string(), message_id.to_string()), detail);
    }
}

impl HostClient for MockHost {
    fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        Ok(self.sessions.clone())
    }

    fn session_messages(&self, _session_id: &str) -> Result<Vec<MessageWithParts>> {
        Ok(Vec::new())
    }

    fn message_detail(&self, session_id: &str, message_id: &str) -> Result<MessageWithParts> {
        if self.failing.iter().any(|id| id == message_id) {
            return Err(Error::Host("detail fetch failed".to_string()));
        }
        self.details
            .get(&(session_id.to_string(), message_id.to_string()))
            .cloned()
            .ok_or_else(|| Error::Host(format!("no such message: {}", message_id)))
    }
}

fn event(value: Value) -> LedgerEvent {
    serde_json::from_value(value).unwrap()
}

fn reconciler(host: MockHost) -> EventReconciler<MockHost> {
    let db = Database::open_in_memory().unwrap();
    db.migrate().unwrap();
    EventReconciler::new(db, host)
}

fn session_created(id: &str, parent: Option<&str>, created: i64) -> LedgerEvent {
    event(json!({
        "type": "session.created",
        "properties": {
            "info": {
                "id": id,
                "title": "a session",
                "parentID": parent,
                "directory": "/work",
                "time": {"created": created, "updated": created}
            }
        }
    }))
}

fn user_message(session_id: &str, message_id: &str, created: i64) -> LedgerEvent {
    event(json!({
        "type": "message.updated",
        "properties": {
            "info": {
                "role": "user",
                "id": message_id,
                "sessionID": session_id,
                "time": {"created": created}
            }
        }
    }))
}

fn assistant_message(
    session_id: &str,
    message_id: &str,
    created: i64,
    completed: Option<i64>,
) -> LedgerEvent {
    event(json!({
        "type": "message.updated",
        "properties": {
            "info": {
                "role": "assistant",
                "id": message_id,
                "sessionID": session_id,
                "time": {"created": created, "completed": completed},
                "modelID": "model-x",
                "providerID": "prov",
                "tokens": {"input": 10, "output": 20, "reasoning": 1, "cache": {"read": 2, "write": 3}},
                "cost": 0.25,
                "finish": "stop"
            }
        }
    }))
}

fn text_detail(session_id: &str, message_id: &str, role: &str, text: &str) -> Value {
    let time = if role == "assistant" {
        json!({"created": 100, "completed": 150})
    } else {
        json!({"created": 100})
    };
    json!({
        "info": {
            "role": role,
            "id": message_id,
            "sessionID": session_id,
            "time": time,
        },
        "parts": [
            {"id": format!("{message_id}_p0"), "sessionID": session_id,
             "messageID": message_id, "type": "text", "text": text}
        ]
    })
}

#[test]
fn test_turn_lifecycle() {
    let mut host = MockHost::default();
    host.add_detail("ses_1", "msg_u", text_detail("ses_1", "msg_u", "user", "do the thing"));
    host.add_detail("ses_1", "msg_a", text_detail("ses_1", "msg_a", "assistant", "done"));

    let mut reconciler = reconciler(host);
    reconciler.handle(session_created("ses_1", None, 100));
    reconciler.handle(user_message("ses_1", "msg_u", 100));

    // A streaming assistant message is not persisted yet
    reconciler.handle(assistant_message("ses_1", "msg_a", 110, None));
    assert!(reconciler.database().get_message("msg_a").unwrap().is_none());

    reconciler.handle(assistant_message("ses_1", "msg_a", 110, Some(150)));

    let db = reconciler.database();
    let turn = db.get_turn("msg_u").unwrap().unwrap();
    assert_eq!(turn.session_id, "ses_1");
    assert_eq!(turn.started_at, 100);
    assert!(turn.ended_at.is_none());

    let user = db.get_message("msg_u").unwrap().unwrap();
    assert_eq!(user.turn_id.as_deref(), Some("msg_u"));
    assert!(!user.is_subagent_prompt);
    assert_eq!(user.content.as_deref(), Some("[Text: do the thing]"));

    let assistant = db.get_message("msg_a").unwrap().unwrap();
    assert_eq!(assistant.turn_id.as_deref(), Some("msg_u"));
    assert_eq!(assistant.completed_at, Some(150));
    assert_eq!(assistant.input_tokens, Some(10));
    assert_eq!(assistant.cost, Some(0.25));

    // Idle closes both the session and the active turn
    reconciler.handle(event(json!({
        "type": "session.idle",
        "properties": {"sessionID": "ses_1"}
    })));

    let db = reconciler.database();
    let session = db.get_session("ses_1").unwrap().unwrap();
    assert!(session.ended_at.is_some());
    let turn = db.get_turn("msg_u").unwrap().unwrap();
    assert!(turn.ended_at.is_some());
    assert_eq!(db.error_count().unwrap(), 0);
}

#[test]
fn test_tool_call_lifecycle_and_duplicate_terminal() {
    let mut host = MockHost::default();
    host.add_detail("ses_1", "msg_u", text_detail("ses_1", "msg_u", "user", "run it"));

    let mut reconciler = reconciler(host);
    reconciler.handle(session_created("ses_1", None, 100));
    reconciler.handle(user_message("ses_1", "msg_u", 100));

    reconciler.handle(event(json!({
        "type": "tool.execute.before",
        "properties": {
            "callID": "c1",
            "sessionID": "ses_1",
            "tool": "bash",
            "args": {"command": "ls"}
        }
    })));

    let call = reconciler.database().get_tool_call("c1").unwrap().unwrap();
    assert_eq!(call.tool_name, "bash");
    assert_eq!(call.turn_id.as_deref(), Some("msg_u"));
    assert!(call.completed_at.is_none());

    let running = json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": "prt_1", "sessionID": "ses_1", "messageID": "msg_a",
                "type": "tool", "callID": "c1", "tool": "bash",
                "state": {"status": "running"}
            }
        }
    });
    reconciler.handle(event(running));

    let call = reconciler.database().get_tool_call("c1").unwrap().unwrap();
    assert_eq!(call.message_id.as_deref(), Some("msg_a"));
    assert!(call.completed_at.is_none());

    let completed = json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": "prt_1", "sessionID": "ses_1", "messageID": "msg_a",
                "type": "tool", "callID": "c1", "tool": "bash",
                "state": {
                    "status": "completed",
                    "input": {"command": "ls"},
                    "title": "ls",
                    "metadata": {"exit": 0},
                    "time": {"start": 120, "end": 140}
                }
            }
        }
    });
    reconciler.handle(event(completed.clone()));

    let first = reconciler.database().get_tool_call("c1").unwrap().unwrap();
    assert_eq!(first.success, Some(true));
    assert!(first.completed_at.is_some());
    assert_eq!(first.output_metadata.as_deref(), Some(r#"{"exit":0}"#));

    // A duplicate terminal event finds no pending call and changes nothing
    reconciler.handle(event(completed));
    let second = reconciler.database().get_tool_call("c1").unwrap().unwrap();
    assert_eq!(second.completed_at, first.completed_at);
    assert_eq!(second.duration_ms, first.duration_ms);

    // Replaying the announcement hook must not resurrect the finished call
    reconciler.handle(event(json!({
        "type": "tool.execute.before",
        "properties": {
            "callID": "c1",
            "sessionID": "ses_1",
            "tool": "bash",
            "args": {"command": "ls"}
        }
    })));
    let after = reconciler.database().get_tool_call("c1").unwrap().unwrap();
    assert_eq!(after.success, Some(true));
    assert_eq!(after.completed_at, first.completed_at);
    assert_eq!(after.started_at, first.started_at);
    assert_eq!(reconciler.database().error_count().unwrap(), 0);
}

#[test]
fn test_tool_error_records_message() {
    let mut reconciler = reconciler(MockHost::default());
    reconciler.handle(session_created("ses_1", None, 100));
    reconciler.handle(event(json!({
        "type": "tool.execute.before",
        "properties": {"callID": "c1", "sessionID": "ses_1", "tool": "bash", "args": {}}
    })));
    reconciler.handle(event(json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": "prt_1", "sessionID": "ses_1", "messageID": "msg_a",
                "type": "tool", "callID": "c1", "tool": "bash",
                "state": {
                    "status": "error",
                    "input": {},
                    "error": "command not found",
                    "time": {"start": 120, "end": 125}
                }
            }
        }
    })));

    let call = reconciler.database().get_tool_call("c1").unwrap().unwrap();
    assert_eq!(call.success, Some(false));
    assert_eq!(call.error_message.as_deref(), Some("command not found"));
}

#[test]
fn test_subagent_prompt_inherits_parent_turn() {
    let mut host = MockHost::default();
    host.add_detail("ses_p", "msg_p", text_detail("ses_p", "msg_p", "user", "main prompt"));
    host.add_detail("ses_c", "msg_c", text_detail("ses_c", "msg_c", "user", "sub prompt"));

    let mut reconciler = reconciler(host);
    reconciler.handle(session_created("ses_p", None, 100));
    reconciler.handle(user_message("ses_p", "msg_p", 100));
    reconciler.handle(session_created("ses_c", Some("ses_p"), 120));
    reconciler.handle(user_message("ses_c", "msg_c", 125));

    let db = reconciler.database();

    let prompt = db.get_message("msg_c").unwrap().unwrap();
    assert!(prompt.is_subagent_prompt);
    assert_eq!(prompt.turn_id.as_deref(), Some("msg_p"));

    // Subagent prompts never open turns of their own
    assert!(db.get_turn("msg_c").unwrap().is_none());
    assert_eq!(db.error_count().unwrap(), 0);
}

#[test]
fn test_compaction_suppresses_messages_and_leaves_marker() {
    let mut host = MockHost::default();
    host.add_detail("ses_1", "msg_u", text_detail("ses_1", "msg_u", "user", "before"));
    host.add_detail("ses_1", "msg_u2", text_detail("ses_1", "msg_u2", "user", "after"));

    let mut reconciler = reconciler(host);
    reconciler.handle(session_created("ses_1", None, 100));
    reconciler.handle(event(json!({
        "type": "session.compacting",
        "properties": {"sessionID": "ses_1"}
    })));

    // Message churn during compaction is rewrite noise, not activity
    reconciler.handle(user_message("ses_1", "msg_u", 110));
    assert!(reconciler.database().get_message("msg_u").unwrap().is_none());

    // The compaction part closes the episode and leaves a marker message
    reconciler.handle(event(json!({
        "type": "message.part.updated",
        "properties": {
            "part": {
                "id": "prt_c", "sessionID": "ses_1", "messageID": "msg_comp",
                "type": "compaction", "auto": true
            }
        }
    })));

    let db = reconciler.database();
    let marker = db.get_message("msg_comp").unwrap().unwrap();
    assert_eq!(marker.role, "assistant");
    assert_eq!(marker.agent.as_deref(), Some("compaction"));
    assert_eq!(marker.content.as_deref(), Some("[Context compacted. Auto: true]"));
    assert_eq!(db.open_compaction("ses_1").unwrap(), None);

    // Messages flow again once the episode is over
    reconciler.handle(user_message("ses_1", "msg_u2", 200));
    assert!(reconciler.database().get_message("msg_u2").unwrap().is_some());
}

#[test]
fn test_compacted_event_closes_episode() {
    let mut reconciler = reconciler(MockHost::default());
    reconciler.handle(session_created("ses_1", None, 100));
    reconciler.handle(event(json!({
        "type": "session.compacting",
        "properties": {"sessionID": "ses_1"}
    })));
    assert!(reconciler.database().open_compaction("ses_1").unwrap().is_some());

    reconciler.handle(event(json!({
        "type": "session.compacted",
        "properties": {"sessionID": "ses_1"}
    })));
    assert_eq!(reconciler.database().open_compaction("ses_1").unwrap(), None);
}

#[test]
fn test_replay_is_idempotent() {
    let mut host = MockHost::default();
    host.add_detail("ses_1", "msg_u", text_detail("ses_1", "msg_u", "user", "hello"));

    let mut reconciler = reconciler(host);
    let events = [
        session_created("ses_1", None, 100),
        user_message("ses_1", "msg_u", 100),
    ];

    for e in events.iter().chain(events.iter()) {
        reconciler.handle(e.clone());
    }

    let db = reconciler.database();
    let count: i64 = db
        .connection()
        .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
    let count: i64 = db
        .connection()
        .query_row("SELECT COUNT(*) FROM turns", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(db.error_count().unwrap(), 0);
}

#[test]
fn test_content_fetch_failure_still_opens_turn() {
    let mut host = MockHost::default();
    host.failing.push("msg_u".to_string());
    host.add_detail("ses_1", "msg_a", text_detail("ses_1", "msg_a", "assistant", "done"));

    let mut reconciler = reconciler(host);
    reconciler.handle(session_created("ses_1", None, 100));
    reconciler.handle(user_message("ses_1", "msg_u", 100));

    // The failed fetch is recorded, but the message and its turn survive
    // with NULL content for backfill to fill later
    let db = reconciler.database();
    assert_eq!(db.error_count().unwrap(), 1);
    let msg = db.get_message("msg_u").unwrap().unwrap();
    assert!(msg.content.is_none());
    assert!(db.get_turn("msg_u").unwrap().is_some());
    assert_eq!(reconciler.state().current_turn("ses_1"), Some("msg_u"));

    // Subsequent activity in the turn still attributes correctly
    reconciler.handle(assistant_message("ses_1", "msg_a", 110, Some(150)));
    let assistant = reconciler.database().get_message("msg_a").unwrap().unwrap();
    assert_eq!(assistant.turn_id.as_deref(), Some("msg_u"));
}

#[test]
fn test_replayed_session_created_keeps_session_end() {
    let mut reconciler = reconciler(MockHost::default());
    reconciler.handle(session_created("ses_1", None, 100));
    reconciler.handle(event(json!({
        "type": "session.idle",
        "properties": {"sessionID": "ses_1"}
    })));

    let ended = reconciler
        .database()
        .get_session("ses_1")
        .unwrap()
        .unwrap()
        .ended_at;
    assert!(ended.is_some());

    reconciler.handle(session_created("ses_1", None, 100));
    let session = reconciler.database().get_session("ses_1").unwrap().unwrap();
    assert_eq!(session.ended_at, ended);
}

#[test]
fn test_unknown_event_is_a_noop() {
    let mut reconciler = reconciler(MockHost::default());
    reconciler.handle(event(json!({
        "type": "ide.window.focused",
        "properties": {"whatever": 1}
    })));
    assert_eq!(reconciler.database().error_count().unwrap(), 0);
}
