#![deny(missing_docs)]
//! Tool interface, registry, and dispatch.
//!
//! A tool is declared data: name, description, a schemars-derived input
//! schema, a risk level, and a display-type hint. Arguments are
//! validated by typed deserialization into the tool's input struct,
//! with the [`InputScreen`] middleware failing closed on anything serde
//! would silently ignore; every handler runs under a hard timeout.
//! Handler failures come back as [`ToolError`] values; the ReAct loop
//! turns them into error results and keeps going.

mod command;
mod middleware;
mod registry;
mod telemetry;

pub use command::{ActionBroker, ActionSpec, KillProcessTool, RunCommandTool};
pub use middleware::{InputScreen, Next, OutputLimiter, ToolCall, ToolMiddleware};
pub use registry::ToolRegistry;
pub use telemetry::{
    AggregateMetricsTool, GetAlertTool, GetDependenciesTool, GetDeployEventsTool,
    GetProcessesTool, GetSecurityFindingsTool, GetSpansTool, ListAlertsTool, QueryMetricsTool,
    SearchLogsTool,
};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use schemars::{JsonSchema, r#gen::SchemaGenerator};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use argus_types::{DisplayType, RiskLevel, RunId, ToolDefinition};

/// Default hard timeout for tool handlers.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from tool dispatch and execution.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ToolError {
    /// The requested tool is not registered.
    #[error("tool not found: {0}")]
    NotFound(String),

    /// The input failed schema validation or deserialization.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The handler failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// The handler exceeded its hard timeout.
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),

    /// The operator rejected the gated action.
    #[error("action rejected: {0}")]
    ActionRejected(String),

    /// No approval arrived within the action window.
    #[error("action timed out")]
    ActionTimedOut,

    /// The run was cancelled while the tool was in flight.
    #[error("cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Execution context handed to every tool call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// The run issuing the call.
    pub run_id: RunId,
    /// Tenant scope for store queries; `None` reads across tenants.
    pub tenant: Option<String>,
    /// Cancelled when the owning run is torn down.
    pub cancel: CancellationToken,
}

impl ToolContext {
    /// A context for the given run with no tenant scope.
    pub fn for_run(run_id: RunId) -> Self {
        Self {
            run_id,
            tenant: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// A tool's result payload plus its rendering hint.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// The result payload.
    pub content: serde_json::Value,
    /// How clients should render it.
    pub display_type: DisplayType,
}

/// A strongly-typed tool.
///
/// The input type's schemars derive is the declared argument spec; serde
/// deserialization of the validated input is the only parsing a handler
/// ever sees.
pub trait Tool: Send + Sync + 'static {
    /// Unique tool name.
    const NAME: &'static str;

    /// Typed input arguments.
    type Input: DeserializeOwned + JsonSchema + Send;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// Risk classification; anything above `Low` is gated by approval.
    fn risk(&self) -> RiskLevel {
        RiskLevel::ReadOnly
    }

    /// Rendering hint for results.
    fn display_type(&self) -> DisplayType {
        DisplayType::Table
    }

    /// Hard timeout override for this tool.
    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    /// Execute with validated, typed input.
    fn call(
        &self,
        input: Self::Input,
        ctx: &ToolContext,
    ) -> impl Future<Output = Result<serde_json::Value, ToolError>> + Send;
}

/// Object-safe tool abstraction; registry storage format.
pub trait ToolDyn: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema of the input arguments.
    fn input_schema(&self) -> serde_json::Value;

    /// Risk classification.
    fn risk(&self) -> RiskLevel;

    /// Rendering hint for results.
    fn display_type(&self) -> DisplayType;

    /// Hard timeout for this tool.
    fn timeout(&self) -> Duration;

    /// Execute with raw JSON input.
    fn call_dyn<'a>(
        &'a self,
        input: serde_json::Value,
        ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;
}

impl<T: Tool> ToolDyn for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        Tool::description(self)
    }

    fn input_schema(&self) -> serde_json::Value {
        let schema = SchemaGenerator::default().into_root_schema_for::<T::Input>();
        serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}))
    }

    fn risk(&self) -> RiskLevel {
        Tool::risk(self)
    }

    fn display_type(&self) -> DisplayType {
        Tool::display_type(self)
    }

    fn timeout(&self) -> Duration {
        Tool::timeout(self)
    }

    fn call_dyn<'a>(
        &'a self,
        input: serde_json::Value,
        ctx: &'a ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>> {
        Box::pin(async move {
            let typed: T::Input = serde_json::from_value(input)
                .map_err(|e| ToolError::InvalidInput(e.to_string()))?;
            let content = Tool::call(self, typed, ctx).await?;
            Ok(ToolOutput {
                content,
                display_type: Tool::display_type(self),
            })
        })
    }
}

/// Build the provider-facing definition for a registered tool.
pub fn definition_of(tool: &dyn ToolDyn) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        input_schema: tool.input_schema(),
    }
}
