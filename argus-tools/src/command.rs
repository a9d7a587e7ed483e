//! Command tools: side-effecting operations routed through the action
//! approval engine.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;

use argus_types::{ActionCommand, ActionOutput, DisplayType, RiskLevel};

use crate::{Tool, ToolContext, ToolError};

/// What a command tool wants executed, pending approval.
#[derive(Debug, Clone)]
pub struct ActionSpec {
    /// The tool asking.
    pub tool: String,
    /// One-line human description for the approval prompt.
    pub description: String,
    /// The command to run.
    pub command: ActionCommand,
    /// Risk classification.
    pub risk: RiskLevel,
    /// Whether the effect can be undone.
    pub reversible: bool,
}

/// Seam between command tools and the action engine.
///
/// The implementation (in the agent layer) persists the request,
/// publishes it for approval, awaits the operator's response, and
/// executes on approval. Rejection and timeout come back as
/// [`ToolError`] values the ReAct loop treats as data.
#[async_trait]
pub trait ActionBroker: Send + Sync {
    /// Submit a gated action and wait for its terminal outcome.
    async fn submit(&self, spec: ActionSpec, ctx: &ToolContext) -> Result<ActionOutput, ToolError>;
}

/// Arguments for `run_command`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunCommandInput {
    /// Shell command line to execute on the host.
    pub command: String,
    /// Why the command is needed, shown in the approval prompt.
    pub reason: Option<String>,
}

/// Run an operator-approved shell command on the host.
pub struct RunCommandTool {
    broker: Arc<dyn ActionBroker>,
}

impl RunCommandTool {
    /// Build over an action broker.
    pub fn new(broker: Arc<dyn ActionBroker>) -> Self {
        Self { broker }
    }
}

impl Tool for RunCommandTool {
    const NAME: &'static str = "run_command";
    type Input = RunCommandInput;

    fn description(&self) -> &str {
        "Run a shell command on the host. Requires operator approval."
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::CommandOutput
    }

    async fn call(
        &self,
        input: RunCommandInput,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let description = input
            .reason
            .unwrap_or_else(|| format!("run `{}`", input.command));
        let output = self
            .broker
            .submit(
                ActionSpec {
                    tool: Self::NAME.to_string(),
                    description,
                    command: ActionCommand::Shell(input.command),
                    risk: RiskLevel::High,
                    reversible: false,
                },
                ctx,
            )
            .await?;
        Ok(action_output_json(&output))
    }
}

/// Arguments for `kill_process`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct KillProcessInput {
    /// Process id to signal.
    pub pid: u32,
    /// Signal name (default `TERM`).
    pub signal: Option<String>,
}

/// Send a signal to a process, gated by approval.
pub struct KillProcessTool {
    broker: Arc<dyn ActionBroker>,
}

impl KillProcessTool {
    /// Build over an action broker.
    pub fn new(broker: Arc<dyn ActionBroker>) -> Self {
        Self { broker }
    }
}

impl Tool for KillProcessTool {
    const NAME: &'static str = "kill_process";
    type Input = KillProcessInput;

    fn description(&self) -> &str {
        "Send a signal to a process (default TERM). Requires operator approval."
    }

    fn risk(&self) -> RiskLevel {
        RiskLevel::High
    }

    fn display_type(&self) -> DisplayType {
        DisplayType::CommandOutput
    }

    async fn call(
        &self,
        input: KillProcessInput,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let signal = input.signal.unwrap_or_else(|| "TERM".to_string());
        let output = self
            .broker
            .submit(
                ActionSpec {
                    tool: Self::NAME.to_string(),
                    description: format!("send SIG{signal} to pid {}", input.pid),
                    command: ActionCommand::Argv(vec![
                        "kill".into(),
                        format!("-{signal}"),
                        input.pid.to_string(),
                    ]),
                    risk: RiskLevel::High,
                    reversible: false,
                },
                ctx,
            )
            .await?;
        Ok(action_output_json(&output))
    }
}

fn action_output_json(output: &ActionOutput) -> serde_json::Value {
    serde_json::json!({
        "exit_code": output.exit_code,
        "stdout": output.stdout,
        "stderr": output.stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::RunId;
    use std::sync::Mutex;

    struct RecordingBroker {
        last: Mutex<Option<ActionSpec>>,
        outcome: Result<ActionOutput, &'static str>,
    }

    #[async_trait]
    impl ActionBroker for RecordingBroker {
        async fn submit(
            &self,
            spec: ActionSpec,
            _ctx: &ToolContext,
        ) -> Result<ActionOutput, ToolError> {
            *self.last.lock().unwrap() = Some(spec);
            match &self.outcome {
                Ok(output) => Ok(output.clone()),
                Err(reason) => Err(ToolError::ActionRejected(reason.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn kill_process_builds_argv_and_returns_output() {
        let broker = Arc::new(RecordingBroker {
            last: Mutex::new(None),
            outcome: Ok(ActionOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }),
        });
        let tool = KillProcessTool::new(broker.clone());
        let result = tool
            .call(
                KillProcessInput {
                    pid: 1234,
                    signal: None,
                },
                &ToolContext::for_run(RunId::new("r-1")),
            )
            .await
            .unwrap();
        assert_eq!(result["exit_code"], 0);

        let spec = broker.last.lock().unwrap().clone().unwrap();
        assert_eq!(spec.risk, RiskLevel::High);
        match spec.command {
            ActionCommand::Argv(argv) => {
                assert_eq!(argv, vec!["kill", "-TERM", "1234"]);
            }
            _ => panic!("expected argv command"),
        }
    }

    #[tokio::test]
    async fn rejection_surfaces_as_tool_error() {
        let broker = Arc::new(RecordingBroker {
            last: Mutex::new(None),
            outcome: Err("operator said no"),
        });
        let tool = RunCommandTool::new(broker);
        let err = tool
            .call(
                RunCommandInput {
                    command: "ls".into(),
                    reason: None,
                },
                &ToolContext::for_run(RunId::new("r-1")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ActionRejected(_)));
    }
}
