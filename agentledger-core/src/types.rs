//! Core domain types for agentledger
//!
//! Two families of types live here:
//!
//! - **Wire types** — the host runtime's JSON shapes as they arrive over the
//!   event stream, the query API, and the on-disk snapshot tree. Field names
//!   follow the host's camelCase via serde renames. Every entity carries the
//!   host's own opaque string identifiers; we never regenerate ids.
//! - **Record types** — the rows the ledger store persists. Timestamps are
//!   unix epoch milliseconds end to end, matching what the host emits.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Session** | A top-level unit of work in the host runtime |
//! | **Subagent session** | A session spawned by a tool call inside another session's turn |
//! | **Turn** | One user-initiated exchange, from the triggering user message until the session goes idle |
//! | **Part** | A content fragment of a message (text, tool, reasoning, ...) |
//! | **Compaction** | A host-side episode that collapses session context into a summary |

use serde::Deserialize;
use serde_json::Value;

/// Current wall-clock time as unix epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================
// Sessions (wire)
// ============================================

/// Created/updated timestamps on a session, as emitted by the host.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct SessionTime {
    pub created: i64,
    pub updated: i64,
    /// Set while the host is compacting this session's context
    #[serde(default)]
    pub compacting: Option<i64>,
}

/// A session as described by the host (event stream, query API, snapshot).
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Non-null means this is a subagent session spawned from the parent
    #[serde(rename = "parentID", default)]
    pub parent_id: Option<String>,
    #[serde(rename = "projectID", default)]
    pub project_id: Option<String>,
    /// Working directory the session operates in
    #[serde(default)]
    pub directory: Option<String>,
    pub time: SessionTime,
}

impl SessionInfo {
    /// Whether this session was spawned by a tool call in another session.
    pub fn is_subagent(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// A project as stored in the snapshot tree (`project/<id>.json`).
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    #[serde(default)]
    pub worktree: Option<String>,
}

// ============================================
// Messages (wire)
// ============================================

/// Token counts reported on a completed assistant message.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: i64,
    #[serde(default)]
    pub output: i64,
    #[serde(default)]
    pub reasoning: i64,
    #[serde(default)]
    pub cache: CacheUsage,
}

/// Cache token counts nested under [`TokenUsage`].
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct CacheUsage {
    #[serde(default)]
    pub read: i64,
    #[serde(default)]
    pub write: i64,
}

/// Provider/model pair attached to a user message.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID", default)]
    pub provider_id: Option<String>,
    #[serde(rename = "modelID", default)]
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct UserMessageTime {
    pub created: i64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AssistantMessageTime {
    pub created: i64,
    /// Present only once the message has finished streaming
    #[serde(default)]
    pub completed: Option<i64>,
}

/// A user message. Atomic: the host writes it once, never streamed.
#[derive(Debug, Clone, Deserialize)]
pub struct UserMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub time: UserMessageTime,
    /// Agent name, set when this message is a subagent prompt
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<ModelRef>,
}

/// An assistant message. Observed repeatedly while streaming; token/cost
/// figures are authoritative only once `time.completed` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub time: AssistantMessageTime,
    #[serde(rename = "modelID", default)]
    pub model_id: Option<String>,
    #[serde(rename = "providerID", default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub tokens: TokenUsage,
    #[serde(default)]
    pub cost: f64,
    /// Finish reason ("stop", "length", ...)
    #[serde(default)]
    pub finish: Option<String>,
}

impl AssistantMessage {
    pub fn is_complete(&self) -> bool {
        self.time.completed.is_some()
    }
}

/// A message of either role, tagged by the host's `role` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum MessageInfo {
    User(UserMessage),
    Assistant(AssistantMessage),
}

impl MessageInfo {
    pub fn id(&self) -> &str {
        match self {
            MessageInfo::User(m) => &m.id,
            MessageInfo::Assistant(m) => &m.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            MessageInfo::User(m) => &m.session_id,
            MessageInfo::Assistant(m) => &m.session_id,
        }
    }

    pub fn created(&self) -> i64 {
        match self {
            MessageInfo::User(m) => m.time.created,
            MessageInfo::Assistant(m) => m.time.created,
        }
    }
}

/// A message plus its parts, as returned by the host's query API.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageWithParts {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<PartEnvelope>,
}

// ============================================
// Parts (wire)
// ============================================

/// Timing on a tool invocation's state.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ToolTime {
    pub start: i64,
    #[serde(default)]
    pub end: Option<i64>,
}

/// Payload of a completed tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolStateDone {
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub time: ToolTime,
}

/// Payload of a failed tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolStateFailed {
    #[serde(default)]
    pub input: Value,
    pub error: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub time: ToolTime,
}

/// State machine of a tool invocation: pending → running → completed | error.
/// Terminal states never regress.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending,
    Running,
    Completed(ToolStateDone),
    Error(ToolStateFailed),
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolState::Completed(_) | ToolState::Error(_))
    }
}

/// A tool part: one tool invocation attached to an assistant message.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolPart {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    /// Call id, globally unique across the host
    #[serde(rename = "callID")]
    pub call_id: String,
    pub tool: String,
    pub state: ToolState,
}

/// A compaction part: the host collapsed session context into a summary.
#[derive(Debug, Clone, Deserialize)]
pub struct CompactionPart {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(default)]
    pub auto: bool,
}

/// Parsed part payload, tagged by the host's `type` field.
///
/// Tags we do not recognize fall back to [`PartPayload::Unknown`]; the raw
/// JSON is retained on the [`PartEnvelope`] either way, so unknown parts are
/// still persisted verbatim.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartPayload {
    Text {
        #[serde(default)]
        text: String,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    Tool(ToolPart),
    File {
        #[serde(default)]
        filename: Option<String>,
        #[serde(default)]
        url: Option<String>,
    },
    Snapshot {
        #[serde(default)]
        snapshot: String,
    },
    Patch {
        #[serde(default)]
        files: Vec<String>,
    },
    StepStart {
        #[serde(default)]
        snapshot: Option<String>,
    },
    StepFinish {
        #[serde(default)]
        reason: Option<String>,
    },
    Agent {
        #[serde(default)]
        name: String,
    },
    Subtask {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },
    Retry {
        #[serde(default)]
        attempt: i64,
        #[serde(default)]
        error: Option<Value>,
    },
    Compaction(CompactionPart),
    #[serde(other)]
    Unknown,
}

/// A part together with its raw JSON and addressing fields.
///
/// The raw value is what gets persisted to the `parts` table; the parsed
/// payload drives reconciliation and content rendering.
#[derive(Debug, Clone)]
pub struct PartEnvelope {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    /// The host's raw `type` tag, kept even for unknown kinds
    pub kind: String,
    pub payload: PartPayload,
    pub raw: Value,
}

impl<'de> Deserialize<'de> for PartEnvelope {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;

        let get_str = |key: &str| {
            raw.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let payload = PartPayload::deserialize(&raw).unwrap_or(PartPayload::Unknown);

        Ok(PartEnvelope {
            id: get_str("id"),
            session_id: get_str("sessionID"),
            message_id: get_str("messageID"),
            kind: get_str("type"),
            payload,
            raw,
        })
    }
}

/// Render a message's parts into the derived `content` column.
///
/// One bracketed line per part; returns None for an empty part list.
pub fn render_parts(parts: &[PartEnvelope]) -> Option<String> {
    let mut lines = Vec::with_capacity(parts.len());

    for part in parts {
        let line = match &part.payload {
            PartPayload::Text { text } => format!("[Text: {}]", text),
            PartPayload::Reasoning { text } => format!("[Reasoning: {}]", text),
            PartPayload::Tool(tool) => {
                let details = match &tool.state {
                    ToolState::Completed(done) => done
                        .title
                        .clone()
                        .unwrap_or_else(|| done.input.to_string()),
                    ToolState::Error(_) => "error".to_string(),
                    ToolState::Running => "running".to_string(),
                    ToolState::Pending => "pending".to_string(),
                };
                format!("[Tool: {}] {}", tool.tool, details)
            }
            PartPayload::File { filename, url } => format!(
                "[File: {}]",
                filename
                    .as_deref()
                    .or(url.as_deref())
                    .unwrap_or("unknown")
            ),
            PartPayload::Snapshot { snapshot } => {
                format!("[Snapshot: {}...]", truncate(snapshot, 30))
            }
            PartPayload::Patch { files } => format!("[Patch: {}]", files.join(", ")),
            PartPayload::StepStart { snapshot } => match snapshot {
                Some(s) => format!("[Step started: {}...]", truncate(s, 20)),
                None => "[Step started]".to_string(),
            },
            PartPayload::StepFinish { reason } => {
                format!("[Step finished: {}]", reason.as_deref().unwrap_or("unknown"))
            }
            PartPayload::Agent { name } => format!("[Agent: {}]", name),
            PartPayload::Subtask {
                description,
                prompt,
            } => format!(
                "[Subtask: {}]",
                description
                    .as_deref()
                    .or(prompt.as_deref())
                    .unwrap_or_default()
            ),
            PartPayload::Retry { attempt, error } => format!(
                "[Retry attempt {}: {}]",
                attempt,
                error
                    .as_ref()
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
            ),
            PartPayload::Compaction(c) => format!("[Context compacted. Auto: {}]", c.auto),
            PartPayload::Unknown => format!("[{}]", part.kind),
        };
        lines.push(line);
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Concatenated plain text of a message's text parts (used by backfill,
/// where the turn's stored user_message comes from text parts only).
pub fn text_content(parts: &[PartEnvelope]) -> Option<String> {
    let text: String = parts
        .iter()
        .filter_map(|p| match &p.payload {
            PartPayload::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// ============================================
// Events (wire)
// ============================================

/// One event from the host's live stream, adjacently tagged the way the host
/// emits them. Each carries a fully-formed entity snapshot, not a diff.
///
/// `tool.execute.before` is the host's pre-invocation hook; it flows through
/// the same reconciler input so the event loop stays one channel.
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    SessionCreated { info: SessionInfo },
    SessionUpdated { info: SessionInfo },
    SessionIdle { session_id: String },
    SessionDeleted { info: SessionInfo },
    SessionCompacting { session_id: String },
    SessionCompacted { session_id: String },
    MessageUpdated { info: MessageInfo },
    PartUpdated { part: PartEnvelope },
    ToolExecuteBegin {
        call_id: String,
        session_id: String,
        tool: String,
        args: Value,
    },
    /// Event types this version does not understand; ignored.
    Unknown,
}

/// Tags [`LedgerEvent`] recognizes; anything else becomes `Unknown`.
const EVENT_TAGS: &[&str] = &[
    "session.created",
    "session.updated",
    "session.idle",
    "session.deleted",
    "session.compacting",
    "session.compacted",
    "message.updated",
    "message.part.updated",
    "tool.execute.before",
];

/// Derived mirror of the known events. `#[serde(other)]` on an adjacently
/// tagged enum only matches unknown tags without content, so the fallback
/// lives in the manual [`LedgerEvent`] impl instead.
#[derive(Deserialize)]
#[serde(tag = "type", content = "properties")]
enum EventWire {
    #[serde(rename = "session.created")]
    SessionCreated { info: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated { info: SessionInfo },

    #[serde(rename = "session.idle")]
    SessionIdle {
        #[serde(rename = "sessionID")]
        session_id: String,
    },

    #[serde(rename = "session.deleted")]
    SessionDeleted { info: SessionInfo },

    #[serde(rename = "session.compacting")]
    SessionCompacting {
        #[serde(rename = "sessionID")]
        session_id: String,
    },

    #[serde(rename = "session.compacted")]
    SessionCompacted {
        #[serde(rename = "sessionID")]
        session_id: String,
    },

    #[serde(rename = "message.updated")]
    MessageUpdated { info: MessageInfo },

    #[serde(rename = "message.part.updated")]
    PartUpdated { part: PartEnvelope },

    #[serde(rename = "tool.execute.before")]
    ToolExecuteBegin {
        #[serde(rename = "callID")]
        call_id: String,
        #[serde(rename = "sessionID")]
        session_id: String,
        tool: String,
        #[serde(default)]
        args: Value,
    },
}

impl From<EventWire> for LedgerEvent {
    fn from(wire: EventWire) -> Self {
        match wire {
            EventWire::SessionCreated { info } => LedgerEvent::SessionCreated { info },
            EventWire::SessionUpdated { info } => LedgerEvent::SessionUpdated { info },
            EventWire::SessionIdle { session_id } => LedgerEvent::SessionIdle { session_id },
            EventWire::SessionDeleted { info } => LedgerEvent::SessionDeleted { info },
            EventWire::SessionCompacting { session_id } => {
                LedgerEvent::SessionCompacting { session_id }
            }
            EventWire::SessionCompacted { session_id } => {
                LedgerEvent::SessionCompacted { session_id }
            }
            EventWire::MessageUpdated { info } => LedgerEvent::MessageUpdated { info },
            EventWire::PartUpdated { part } => LedgerEvent::PartUpdated { part },
            EventWire::ToolExecuteBegin {
                call_id,
                session_id,
                tool,
                args,
            } => LedgerEvent::ToolExecuteBegin {
                call_id,
                session_id,
                tool,
                args,
            },
        }
    }
}

impl<'de> Deserialize<'de> for LedgerEvent {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;

        // An unrecognized tag is a compatibility no-op whether or not it
        // carries a properties payload; a known tag with a malformed payload
        // is a real error for the caller to report
        let known = raw
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|tag| EVENT_TAGS.contains(&tag));
        if !known {
            return Ok(LedgerEvent::Unknown);
        }

        EventWire::deserialize(&raw)
            .map(LedgerEvent::from)
            .map_err(serde::de::Error::custom)
    }
}

impl LedgerEvent {
    /// Short tag for diagnostics and the error sink.
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::SessionCreated { .. } => "session.created",
            LedgerEvent::SessionUpdated { .. } => "session.updated",
            LedgerEvent::SessionIdle { .. } => "session.idle",
            LedgerEvent::SessionDeleted { .. } => "session.deleted",
            LedgerEvent::SessionCompacting { .. } => "session.compacting",
            LedgerEvent::SessionCompacted { .. } => "session.compacted",
            LedgerEvent::MessageUpdated { .. } => "message.updated",
            LedgerEvent::PartUpdated { .. } => "message.part.updated",
            LedgerEvent::ToolExecuteBegin { .. } => "tool.execute.before",
            LedgerEvent::Unknown => "unknown",
        }
    }
}

// ============================================
// Records (store)
// ============================================

/// A row in `sessions`.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub title: Option<String>,
    pub parent_id: Option<String>,
    pub project_path: Option<String>,
    pub worktree: Option<String>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl SessionRecord {
    /// Build a record from the host's wire shape.
    pub fn from_info(info: &SessionInfo, worktree: Option<&str>) -> Self {
        Self {
            id: info.id.clone(),
            title: info.title.clone(),
            parent_id: info.parent_id.clone(),
            project_path: info.directory.clone(),
            worktree: worktree
                .map(str::to_string)
                .or_else(|| info.directory.clone()),
            created_at: info.time.created,
            updated_at: Some(info.time.updated),
            ended_at: None,
        }
    }
}

/// A row in `turns`. A turn's id is the id of the user message that opened it.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub id: String,
    pub session_id: String,
    pub parent_turn_id: Option<String>,
    pub user_message: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

/// A row in `messages`.
#[derive(Debug, Clone, Default)]
pub struct MessageRecord {
    pub id: String,
    pub session_id: String,
    pub turn_id: Option<String>,
    pub role: String,
    pub content: Option<String>,
    pub agent: Option<String>,
    pub is_subagent_prompt: bool,
    pub model_id: Option<String>,
    pub provider_id: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub cost: Option<f64>,
    pub finish_reason: Option<String>,
}

/// A row in `tool_calls`.
#[derive(Debug, Clone, Default)]
pub struct ToolCallRecord {
    pub id: String,
    pub session_id: String,
    pub turn_id: Option<String>,
    pub message_id: Option<String>,
    pub tool_name: String,
    pub args_json: Option<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub success: Option<bool>,
    pub error_message: Option<String>,
    pub output_metadata: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub reasoning_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub cost: Option<f64>,
}

/// A row in `parts`: the raw payload plus its type tag and ordinal index.
#[derive(Debug, Clone)]
pub struct PartRecord {
    pub id: String,
    pub message_id: String,
    pub session_id: String,
    pub part_index: i64,
    pub kind: String,
    pub data: String,
    pub created_at: i64,
}

/// A row in `compactions`.
#[derive(Debug, Clone)]
pub struct CompactionRecord {
    pub id: i64,
    pub session_id: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// Token/cost figures a completed assistant message passes down to its
/// tool calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageFigures {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub reasoning_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub cost: f64,
}

impl UsageFigures {
    pub fn from_tokens(tokens: &TokenUsage, cost: f64) -> Self {
        Self {
            input_tokens: tokens.input,
            output_tokens: tokens.output,
            reasoning_tokens: tokens.reasoning,
            cache_read_tokens: tokens.cache.read,
            cache_write_tokens: tokens.cache.write,
            cost,
        }
    }
}
