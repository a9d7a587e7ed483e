//! Tool registry: register, look up, and execute tools.

use std::collections::HashMap;
use std::sync::Arc;

use crate::middleware::{Next, ToolCall, ToolMiddleware};
use crate::{Tool, ToolContext, ToolDyn, ToolError, ToolOutput, definition_of};
use argus_types::ToolDefinition;

/// Registry of tools with a global middleware pipeline.
///
/// Tools are stored type-erased as [`ToolDyn`]. Execution runs the
/// middleware chain in registration order and holds the whole call under
/// the tool's hard timeout.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolDyn>>,
    middleware: Vec<Arc<dyn ToolMiddleware>>,
}

impl ToolRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strongly-typed tool (auto-erased). Overwrites any
    /// existing tool with the same name.
    pub fn register<T: Tool>(&mut self, tool: T) {
        self.tools.insert(T::NAME.to_string(), Arc::new(tool));
    }

    /// Register a pre-erased tool.
    pub fn register_dyn(&mut self, tool: Arc<dyn ToolDyn>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Add middleware applying to all tool executions.
    pub fn add_middleware(&mut self, middleware: impl ToolMiddleware + 'static) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolDyn>> {
        self.tools.get(name).cloned()
    }

    /// Iterate over all registered tools.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ToolDyn>> {
        self.tools.values()
    }

    /// Provider-facing definitions of every registered tool.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| definition_of(t.as_ref())).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Execute a tool through the middleware chain under its timeout.
    ///
    /// Every failure mode is a [`ToolError`]; nothing escapes dispatch.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;

        let timeout = tool.timeout();
        let next = Next::new(tool.as_ref(), &self.middleware);
        let execution = next.run(call, ctx);

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolError::Cancelled),
            result = tokio::time::timeout(timeout, execution) => match result {
                Ok(output) => output,
                Err(_) => {
                    tracing::warn!(tool = %call.name, ?timeout, "tool handler timed out");
                    Err(ToolError::Timeout(timeout))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{InputScreen, OutputLimiter};
    use argus_types::{DisplayType, RiskLevel, RunId};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Deserialize, JsonSchema)]
    struct EchoInput {
        message: String,
    }

    struct EchoTool;

    impl Tool for EchoTool {
        const NAME: &'static str = "echo";
        type Input = EchoInput;

        fn description(&self) -> &str {
            "Echoes the message back"
        }

        async fn call(
            &self,
            input: EchoInput,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            Ok(serde_json::json!({"echoed": input.message}))
        }
    }

    #[derive(Deserialize, JsonSchema)]
    struct SleepInput {
        millis: u64,
    }

    struct SleepTool;

    impl Tool for SleepTool {
        const NAME: &'static str = "sleep";
        type Input = SleepInput;

        fn description(&self) -> &str {
            "Sleeps for a while"
        }

        fn risk(&self) -> RiskLevel {
            RiskLevel::Low
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(50)
        }

        async fn call(
            &self,
            input: SleepInput,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, ToolError> {
            tokio::time::sleep(Duration::from_millis(input.millis)).await;
            Ok(serde_json::json!({"slept": input.millis}))
        }
    }

    fn call(name: &str, input: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "tc_1".into(),
            name: name.into(),
            input,
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::for_run(RunId::new("r-1"))
    }

    #[tokio::test]
    async fn execute_runs_the_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let output = registry
            .execute(&call("echo", serde_json::json!({"message": "hi"})), &ctx())
            .await
            .unwrap();
        assert_eq!(output.content["echoed"], "hi");
        assert_eq!(output.display_type, DisplayType::Table);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute(&call("nope", serde_json::json!({})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
    }

    #[tokio::test]
    async fn missing_field_rejected_by_typed_deserialization() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let err = registry
            .execute(&call("echo", serde_json::json!({})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn input_screen_bounces_undeclared_arguments() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let screen = InputScreen::new(&registry);
        registry.add_middleware(screen);

        let err = registry
            .execute(
                &call("echo", serde_json::json!({"message": "hi", "sudo": true})),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("sudo"),
            "stray key named in the error: {err}"
        );
    }

    #[tokio::test]
    async fn per_tool_timeout_enforced() {
        let mut registry = ToolRegistry::new();
        registry.register(SleepTool);
        let err = registry
            .execute(&call("sleep", serde_json::json!({"millis": 5000})), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(SleepTool);
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = registry
            .execute(&call("sleep", serde_json::json!({"millis": 40})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn output_limiter_truncates() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.add_middleware(OutputLimiter::new(16));

        let output = registry
            .execute(
                &call("echo", serde_json::json!({"message": "x".repeat(100)})),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(output.content["truncated"], true);
    }

    #[test]
    fn definitions_are_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(SleepTool);
        registry.register(EchoTool);
        let defs = registry.definitions();
        assert_eq!(defs[0].name, "echo");
        assert_eq!(defs[1].name, "sleep");
    }
}
