//! The realtime push protocol: envelopes and the message unions.
//!
//! The wire schema is a discriminated union; unknown inbound types fail
//! closed (parse error, message dropped with an error reply) rather than
//! being passed through as free-form maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::{ActionRequest, RiskLevel};
use crate::alert::{Alert, AlertStatus};
use crate::budget::BudgetSnapshot;
use crate::id::{ActionId, AlertId, ConnectionId, ConversationId, RunId};
use crate::llm::TokenUsage;

/// How a client should render a tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisplayType {
    /// Scrollable log lines.
    LogViewer,
    /// Time-series chart of metric samples.
    MetricsChart,
    /// Process list with sortable columns.
    ProcessTable,
    /// Generic table.
    #[default]
    Table,
    /// Generic chart.
    Chart,
    /// Monospaced command output.
    CommandOutput,
    /// Syntax-highlighted code.
    CodeBlock,
    /// Collapsible JSON tree.
    JsonTree,
}

/// Point-in-time server status, published on `system.status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StatusSnapshot {
    /// Seconds since the server started.
    pub uptime_s: u64,
    /// Connected push clients.
    pub connections: usize,
    /// Active alerts.
    pub active_alerts: usize,
    /// ReAct runs currently in flight.
    pub active_runs: usize,
    /// Store write queue depth (backpressure indicator).
    pub store_queue_depth: usize,
    /// Current budget state.
    pub budget: BudgetSnapshot,
}

/// Server-to-client push messages.
///
/// Serialized as `{"type": ..., "data": ...}` and wrapped in an
/// [`Envelope`] that adds `id` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgement.
    Connected {
        /// The id assigned to this connection.
        connection_id: ConnectionId,
    },
    /// Periodic status snapshot.
    SystemStatus(StatusSnapshot),
    /// The model has started reasoning for a run.
    ThinkingStart {
        /// The run.
        run_id: RunId,
    },
    /// The model has finished reasoning for this turn.
    ThinkingEnd {
        /// The run.
        run_id: RunId,
    },
    /// An assistant message is starting.
    AssistantMessageStart {
        /// The run.
        run_id: RunId,
    },
    /// Incremental assistant text.
    AssistantMessageDelta {
        /// The run.
        run_id: RunId,
        /// Text fragment.
        delta: String,
    },
    /// The assistant message is complete.
    AssistantMessageEnd {
        /// The run.
        run_id: RunId,
    },
    /// The model requested a tool call.
    ToolCall {
        /// The run.
        run_id: RunId,
        /// Call id, unique within the run.
        call_id: String,
        /// Tool name.
        name: String,
        /// Validated arguments as sent to the tool.
        arguments: serde_json::Value,
    },
    /// A tool call finished.
    ToolResult {
        /// The run.
        run_id: RunId,
        /// The call this result answers.
        call_id: String,
        /// Tool name.
        name: String,
        /// Rendering hint.
        display_type: DisplayType,
        /// Result payload.
        result: serde_json::Value,
        /// Whether the result is an error.
        is_error: bool,
    },
    /// An action awaits operator approval.
    ActionRequest(ActionRequest),
    /// An approved action has started executing.
    ActionExecuting {
        /// The action.
        action_id: ActionId,
    },
    /// An action finished (or failed terminally).
    ActionComplete {
        /// The action.
        action_id: ActionId,
        /// Exit code when the command ran; absent on rejection/timeout.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        /// Captured stdout (possibly truncated).
        #[serde(default)]
        stdout: String,
        /// Captured stderr (possibly truncated).
        #[serde(default)]
        stderr: String,
        /// Error description when the action did not execute cleanly.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An alert fired.
    Alert(Alert),
    /// An alert changed lifecycle state.
    AlertStateChange {
        /// The alert.
        alert_id: AlertId,
        /// New status.
        status: AlertStatus,
        /// Operator, for acknowledge transitions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        by: Option<String>,
    },
    /// Budget counters changed.
    BudgetUpdate(BudgetSnapshot),
    /// An auto-investigation started.
    InvestigationStart {
        /// The run driving the investigation.
        run_id: RunId,
        /// The alert being investigated.
        alert_id: AlertId,
        /// Investigation title.
        title: String,
    },
    /// Incremental investigation output.
    InvestigationUpdate {
        /// The run.
        run_id: RunId,
        /// Text fragment.
        delta: String,
    },
    /// An investigation terminated.
    InvestigationEnd {
        /// The run.
        run_id: RunId,
        /// Final summary text.
        summary: String,
        /// Tokens spent.
        usage: TokenUsage,
    },
    /// A user-visible error.
    Error {
        /// Stable machine-readable code.
        code: String,
        /// Short human message.
        message: String,
        /// Correlation id for operator follow-up.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
        /// The run the error belongs to, when scoped.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<RunId>,
    },
    /// Heartbeat reply.
    Pong,
}

impl ServerMessage {
    /// Whether this message survives queue overflow at the expense of
    /// non-critical messages.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            ServerMessage::Alert(_)
                | ServerMessage::ActionRequest(_)
                | ServerMessage::ActionComplete { .. }
                | ServerMessage::Error { .. }
        )
    }
}

/// The wire envelope: `{type, id, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The message, flattened to `type` + `data`.
    #[serde(flatten)]
    pub message: ServerMessage,
    /// Unique message id.
    pub id: String,
    /// Server send time.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap a message, stamping a fresh id and `now`.
    pub fn new(message: ServerMessage) -> Self {
        Self {
            message,
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Client-to-server messages.
///
/// Deserialization fails on unknown `type` values; the connection replies
/// with an error envelope and drops the message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A chat message starting or continuing a conversation.
    UserMessage {
        /// The message text.
        text: String,
        /// Conversation to continue; a fresh one is created when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    /// Answer to an `action_request`.
    ActionResponse {
        /// The request being answered.
        action_id: ActionId,
        /// Approve or reject.
        approved: bool,
        /// Fresh authorization marker for critical-risk actions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        authorization: Option<String>,
    },
    /// Cancel an in-flight run.
    Cancel {
        /// The run to cancel.
        run_id: RunId,
    },
    /// Heartbeat.
    Ping,
}

/// Risk levels whose action requests should carry a password re-prompt.
pub fn requires_password(risk: RiskLevel) -> bool {
    risk >= RiskLevel::Critical
}
