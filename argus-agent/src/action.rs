//! The action engine: approval gating and guarded execution for
//! side-effecting commands.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};

use argus_bus::{Bus, BusMessage, Topic};
use argus_store::{AuditEntry, Store};
use argus_tools::{ActionBroker, ActionSpec, ToolContext, ToolError};
use argus_types::{
    ActionCommand, ActionId, ActionOutput, ActionRequest, ActionResponse, ActionStatus,
    RiskLevel, ServerMessage,
};

use crate::emit;

/// Command substrings refused regardless of approval.
pub const BLOCKED_COMMAND_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=",
    ":(){",
    "> /dev/sd",
    "shutdown",
    "reboot",
    "halt -f",
    "init 0",
];

/// Default window an operator has to answer an approval request.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);
/// Default hard timeout on approved command execution.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Captured output beyond this many bytes is truncated.
const OUTPUT_CAPTURE_LIMIT: usize = 64 * 1024;

/// Catalog prefix for action records.
const CATALOG_PREFIX_ACTION: &str = "action:";

/// Action engine errors (server-facing; tools see [`ToolError`]).
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ActionError {
    /// No pending action with that id.
    #[error("no pending action: {0}")]
    NotFound(ActionId),
}

struct PendingAction {
    request: ActionRequest,
    reply: oneshot::Sender<ActionResponse>,
}

/// Owns all pending [`ActionRequest`]s, keyed by id.
///
/// Implements [`ActionBroker`] for the command tools: a submitted action
/// is persisted, announced, and suspended until a correlated response
/// arrives or the window expires. Approval executes the command under
/// the same timeout-and-guard discipline as any tool.
pub struct ActionEngine {
    pending: Mutex<HashMap<ActionId, PendingAction>>,
    bus: Bus,
    store: Store,
    approval_timeout: Duration,
    execution_timeout: Duration,
}

impl ActionEngine {
    /// Create an engine with the default timeouts.
    pub fn new(bus: Bus, store: Store) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            bus,
            store,
            approval_timeout: APPROVAL_TIMEOUT,
            execution_timeout: EXECUTION_TIMEOUT,
        }
    }

    /// Override the approval window (tests).
    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    /// Number of actions awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Deliver an operator's response. Fails when nothing pending
    /// correlates with the id (expired, answered, or never existed).
    pub async fn resolve(&self, response: ActionResponse) -> Result<(), ActionError> {
        let pending = {
            let mut map = self.pending.lock().await;
            map.remove(&response.action_id)
                .ok_or_else(|| ActionError::NotFound(response.action_id.clone()))?
        };
        // The submit side may have timed out concurrently; a dead
        // receiver is not an error worth surfacing to the operator.
        let _ = pending.reply.send(response);
        Ok(())
    }

    async fn audit(&self, action: &str, entity: &ActionId, detail: String) {
        let entry = AuditEntry {
            actor: "operator".into(),
            action: action.into(),
            entity: format!("{CATALOG_PREFIX_ACTION}{entity}"),
            detail,
        };
        if let Err(e) = self.store.audit(entry).await {
            tracing::error!(err = %e, "audit append failed");
        }
    }

    async fn persist(&self, request: &ActionRequest, status: ActionStatus) {
        let record = serde_json::json!({
            "request": request,
            "status": status,
        });
        if let Err(e) = self
            .store
            .catalog_put(format!("{CATALOG_PREFIX_ACTION}{}", request.id), record)
            .await
        {
            tracing::error!(err = %e, "action record persist failed");
        }
    }

    fn publish_complete(
        &self,
        action_id: &ActionId,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
        error: Option<String>,
    ) {
        self.bus.publish(
            Topic::ActionsCompleted,
            BusMessage::ActionCompleted {
                action_id: action_id.clone(),
                exit_code,
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                error: error.clone(),
            },
        );
        emit(
            &self.bus,
            ServerMessage::ActionComplete {
                action_id: action_id.clone(),
                exit_code,
                stdout,
                stderr,
                error,
            },
        );
    }
}

#[async_trait]
impl ActionBroker for ActionEngine {
    async fn submit(&self, spec: ActionSpec, ctx: &ToolContext) -> Result<ActionOutput, ToolError> {
        let command_line = spec.command.display();
        if let Some(pattern) = BLOCKED_COMMAND_PATTERNS
            .iter()
            .find(|p| command_line.contains(*p))
        {
            tracing::warn!(command = %command_line, pattern = %pattern, "blocked command refused");
            return Err(ToolError::ActionRejected(format!(
                "command matches blocked pattern `{pattern}`"
            )));
        }

        let request = ActionRequest {
            id: ActionId::generate(),
            tool: spec.tool.clone(),
            description: spec.description.clone(),
            command: spec.command.clone(),
            risk: spec.risk,
            reversible: spec.reversible,
            requires_password: argus_types::requires_password(spec.risk),
            run_id: ctx.run_id.clone(),
            pending_since: Utc::now(),
        };
        let action_id = request.id.clone();

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut map = self.pending.lock().await;
            map.insert(
                action_id.clone(),
                PendingAction {
                    request: request.clone(),
                    reply: reply_tx,
                },
            );
        }
        self.persist(&request, ActionStatus::Pending).await;
        self.audit("action_requested", &action_id, command_line.clone())
            .await;
        self.bus.publish(
            Topic::ActionsRequested,
            BusMessage::ActionRequested(Arc::new(request.clone())),
        );
        emit(&self.bus, ServerMessage::ActionRequest(request.clone()));

        let response = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                self.pending.lock().await.remove(&action_id);
                self.persist(&request, ActionStatus::TimedOut).await;
                self.audit("action_cancelled", &action_id, String::new()).await;
                return Err(ToolError::Cancelled);
            }
            outcome = tokio::time::timeout(self.approval_timeout, reply_rx) => match outcome {
                Ok(Ok(response)) => response,
                // Timeout, or the pending entry was dropped without a reply.
                _ => {
                    self.pending.lock().await.remove(&action_id);
                    self.persist(&request, ActionStatus::TimedOut).await;
                    self.audit("action_timed_out", &action_id, String::new()).await;
                    self.publish_complete(
                        &action_id,
                        None,
                        String::new(),
                        String::new(),
                        Some("approval timed out".into()),
                    );
                    return Err(ToolError::ActionTimedOut);
                }
            },
        };

        if !response.approved {
            self.persist(&request, ActionStatus::Rejected).await;
            self.audit("action_rejected", &action_id, String::new()).await;
            self.publish_complete(
                &action_id,
                None,
                String::new(),
                String::new(),
                Some("rejected by operator".into()),
            );
            return Err(ToolError::ActionRejected("rejected by operator".into()));
        }

        if request.risk >= RiskLevel::Critical
            && response
                .authorization
                .as_deref()
                .is_none_or(|marker| marker.is_empty())
        {
            self.persist(&request, ActionStatus::Rejected).await;
            self.audit("action_rejected", &action_id, "missing authorization".into())
                .await;
            self.publish_complete(
                &action_id,
                None,
                String::new(),
                String::new(),
                Some("critical action requires a fresh authorization marker".into()),
            );
            return Err(ToolError::ActionRejected(
                "critical action requires a fresh authorization marker".into(),
            ));
        }

        self.persist(&request, ActionStatus::Approved).await;
        self.audit("action_approved", &action_id, String::new()).await;
        emit(
            &self.bus,
            ServerMessage::ActionExecuting {
                action_id: action_id.clone(),
            },
        );

        match self.execute(&request.command, ctx).await {
            Ok(output) => {
                self.audit(
                    "action_executed",
                    &action_id,
                    format!("exit {}", output.exit_code),
                )
                .await;
                self.publish_complete(
                    &action_id,
                    Some(output.exit_code),
                    output.stdout.clone(),
                    output.stderr.clone(),
                    None,
                );
                Ok(output)
            }
            Err(e) => {
                self.audit("action_failed", &action_id, e.to_string()).await;
                self.publish_complete(
                    &action_id,
                    None,
                    String::new(),
                    String::new(),
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }
}

impl ActionEngine {
    async fn execute(
        &self,
        command: &ActionCommand,
        ctx: &ToolContext,
    ) -> Result<ActionOutput, ToolError> {
        let mut cmd = match command {
            ActionCommand::Argv(argv) => {
                let (program, args) = argv
                    .split_first()
                    .ok_or_else(|| ToolError::InvalidInput("empty command".into()))?;
                let mut cmd = tokio::process::Command::new(program);
                cmd.args(args);
                cmd
            }
            ActionCommand::Shell(line) => {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(format!("spawn failed: {e}")))?;

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
            result = tokio::time::timeout(self.execution_timeout, child.wait_with_output()) => {
                match result {
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => {
                        return Err(ToolError::ExecutionFailed(format!("wait failed: {e}")));
                    }
                    Err(_) => return Err(ToolError::Timeout(self.execution_timeout)),
                }
            }
        };

        Ok(ActionOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: truncate_capture(output.stdout),
            stderr: truncate_capture(output.stderr),
        })
    }
}

fn truncate_capture(bytes: Vec<u8>) -> String {
    let mut text = String::from_utf8_lossy(&bytes).into_owned();
    if text.len() > OUTPUT_CAPTURE_LIMIT {
        let boundary = text
            .char_indices()
            .take_while(|(i, _)| *i < OUTPUT_CAPTURE_LIMIT)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        text.truncate(boundary);
        text.push_str("\n… [truncated]");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::RunId;

    fn spec(command: ActionCommand, risk: RiskLevel) -> ActionSpec {
        ActionSpec {
            tool: "run_command".into(),
            description: "test action".into(),
            command,
            risk,
            reversible: false,
        }
    }

    fn engine() -> (Arc<ActionEngine>, Bus) {
        let bus = Bus::new();
        let store = Store::open_in_memory().unwrap();
        (
            Arc::new(ActionEngine::new(bus.clone(), store)),
            bus,
        )
    }

    async fn pending_request(bus: &mut argus_bus::Subscription) -> Arc<ActionRequest> {
        match bus.recv().await.unwrap() {
            BusMessage::ActionRequested(request) => request,
            other => panic!("expected action request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn approval_round_trip_executes_command() {
        let (engine, bus) = engine();
        let mut requests = bus.subscribe(Topic::ActionsRequested);
        let ctx = ToolContext::for_run(RunId::new("r-1"));

        let submit = {
            let engine = Arc::clone(&engine);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                engine
                    .submit(spec(ActionCommand::Shell("echo approved".into()), RiskLevel::High), &ctx)
                    .await
            })
        };

        let request = pending_request(&mut requests).await;
        engine
            .resolve(ActionResponse {
                action_id: request.id.clone(),
                approved: true,
                authorization: None,
            })
            .await
            .unwrap();

        let output = submit.await.unwrap().unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout.trim(), "approved");
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn rejection_returns_tool_error() {
        let (engine, bus) = engine();
        let mut requests = bus.subscribe(Topic::ActionsRequested);
        let ctx = ToolContext::for_run(RunId::new("r-1"));

        let submit = {
            let engine = Arc::clone(&engine);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                engine
                    .submit(spec(ActionCommand::Shell("echo no".into()), RiskLevel::Medium), &ctx)
                    .await
            })
        };

        let request = pending_request(&mut requests).await;
        engine
            .resolve(ActionResponse {
                action_id: request.id.clone(),
                approved: false,
                authorization: None,
            })
            .await
            .unwrap();

        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, ToolError::ActionRejected(_)));
    }

    #[tokio::test]
    async fn approval_timeout_expires_request() {
        let bus = Bus::new();
        let store = Store::open_in_memory().unwrap();
        let engine = Arc::new(
            ActionEngine::new(bus.clone(), store)
                .with_approval_timeout(Duration::from_millis(50)),
        );
        let ctx = ToolContext::for_run(RunId::new("r-1"));

        let err = engine
            .submit(spec(ActionCommand::Shell("echo late".into()), RiskLevel::High), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ActionTimedOut));
        assert_eq!(engine.pending_count().await, 0);

        // A late response no longer correlates.
        let result = engine
            .resolve(ActionResponse {
                action_id: ActionId::new("gone"),
                approved: true,
                authorization: None,
            })
            .await;
        assert!(matches!(result, Err(ActionError::NotFound(_))));
    }

    #[tokio::test]
    async fn blocked_command_refused_without_approval() {
        let (engine, _bus) = engine();
        let ctx = ToolContext::for_run(RunId::new("r-1"));
        let err = engine
            .submit(
                spec(ActionCommand::Shell("rm -rf / --no-preserve-root".into()), RiskLevel::High),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ActionRejected(_)));
        assert_eq!(engine.pending_count().await, 0, "never entered pending");
    }

    #[tokio::test]
    async fn critical_requires_authorization_marker() {
        let (engine, bus) = engine();
        let mut requests = bus.subscribe(Topic::ActionsRequested);
        let ctx = ToolContext::for_run(RunId::new("r-1"));

        let submit = {
            let engine = Arc::clone(&engine);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                engine
                    .submit(spec(ActionCommand::Shell("echo crit".into()), RiskLevel::Critical), &ctx)
                    .await
            })
        };

        let request = pending_request(&mut requests).await;
        assert!(request.requires_password);
        engine
            .resolve(ActionResponse {
                action_id: request.id.clone(),
                approved: true,
                authorization: None,
            })
            .await
            .unwrap();

        let err = submit.await.unwrap().unwrap_err();
        assert!(matches!(err, ToolError::ActionRejected(_)));
    }

    #[tokio::test]
    async fn failing_command_reports_exit_code() {
        let (engine, bus) = engine();
        let mut requests = bus.subscribe(Topic::ActionsRequested);
        let ctx = ToolContext::for_run(RunId::new("r-1"));

        let submit = {
            let engine = Arc::clone(&engine);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                engine
                    .submit(spec(ActionCommand::Shell("exit 3".into()), RiskLevel::Medium), &ctx)
                    .await
            })
        };

        let request = pending_request(&mut requests).await;
        engine
            .resolve(ActionResponse {
                action_id: request.id.clone(),
                approved: true,
                authorization: None,
            })
            .await
            .unwrap();

        let output = submit.await.unwrap().unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[test]
    fn capture_truncation_marks_cut() {
        let big = vec![b'x'; OUTPUT_CAPTURE_LIMIT + 100];
        let text = truncate_capture(big);
        assert!(text.ends_with("[truncated]"));
    }
}
