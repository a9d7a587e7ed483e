//! Middleware pipeline in front of tool handlers.
//!
//! Validation is split in two. Typed deserialization in `call_dyn` is
//! the authority on missing and mistyped fields (serde reports those
//! precisely). The [`InputScreen`] middleware covers what serde cannot:
//! it fails closed on argument keys no tool declares, bounds argument
//! size, and leaves an audit line before any approval-gated tool runs.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use argus_types::RiskLevel;

use crate::registry::ToolRegistry;
use crate::{ToolContext, ToolDyn, ToolError, ToolOutput};

/// A boxed future used by the object-safe middleware chain.
pub type BoxedToolFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ToolOutput, ToolError>> + Send + 'a>>;

/// Longest string accepted for a single argument value. Keeps approval
/// prompts, audit lines, and provider retries at a sane size.
const ARGUMENT_STRING_LIMIT: usize = 4096;

/// One tool invocation as seen by middleware.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Call id assigned by the run (unique within it).
    pub id: String,
    /// Tool name.
    pub name: String,
    /// Raw JSON input.
    pub input: serde_json::Value,
}

/// Middleware wrapping tool execution.
///
/// Implementations call `next.run(call, ctx)` to continue the chain, or
/// return early to short-circuit.
pub trait ToolMiddleware: Send + Sync {
    /// Process the call, delegating to `next` for the rest of the chain.
    fn process<'a>(
        &'a self,
        call: &'a ToolCall,
        ctx: &'a ToolContext,
        next: Next<'a>,
    ) -> BoxedToolFuture<'a>;
}

/// The remainder of the middleware chain ending at the tool itself.
pub struct Next<'a> {
    tool: &'a dyn ToolDyn,
    chain: &'a [Arc<dyn ToolMiddleware>],
}

impl<'a> Next<'a> {
    /// Build the chain head for a tool.
    pub fn new(tool: &'a dyn ToolDyn, chain: &'a [Arc<dyn ToolMiddleware>]) -> Self {
        Self { tool, chain }
    }

    /// Run the rest of the chain.
    pub fn run(self, call: &'a ToolCall, ctx: &'a ToolContext) -> BoxedToolFuture<'a> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    tool: self.tool,
                    chain: rest,
                };
                head.process(call, ctx, next)
            }
            None => self.tool.call_dyn(call.input.clone(), ctx),
        }
    }
}

/// What the screen remembers about one tool, captured at registration.
struct ToolFacts {
    /// Argument keys the tool's input type declares.
    declared_keys: BTreeSet<String>,
    /// The tool's risk classification.
    risk: RiskLevel,
}

/// Fail-closed argument screen.
///
/// Every Argus tool takes a JSON object whose shape comes from its
/// typed input struct. Serde will ignore keys the struct never
/// declares, which is exactly wrong for an agent: a hallucinated
/// argument should bounce back to the model, not vanish. The screen
/// rejects undeclared keys, rejects oversized string arguments, and
/// logs the arguments of approval-gated tools before they dispatch.
pub struct InputScreen {
    facts: HashMap<String, ToolFacts>,
}

impl InputScreen {
    /// Capture the declared argument keys and risk of every tool
    /// currently registered. Tools registered later pass unscreened.
    pub fn new(registry: &ToolRegistry) -> Self {
        let facts = registry
            .iter()
            .map(|tool| {
                let declared_keys = declared_keys(&tool.input_schema());
                (
                    tool.name().to_string(),
                    ToolFacts {
                        declared_keys,
                        risk: tool.risk(),
                    },
                )
            })
            .collect();
        Self { facts }
    }

    fn screen(&self, call: &ToolCall) -> Result<(), ToolError> {
        let Some(facts) = self.facts.get(&call.name) else {
            return Ok(());
        };

        let Some(arguments) = call.input.as_object() else {
            return Err(ToolError::InvalidInput(
                "tool arguments must be a JSON object".into(),
            ));
        };

        let stray: Vec<&str> = arguments
            .keys()
            .filter(|key| !facts.declared_keys.contains(*key))
            .map(String::as_str)
            .collect();
        if !stray.is_empty() {
            let declared: Vec<&str> =
                facts.declared_keys.iter().map(String::as_str).collect();
            return Err(ToolError::InvalidInput(format!(
                "undeclared argument(s) {}; `{}` accepts: {}",
                stray.join(", "),
                call.name,
                if declared.is_empty() {
                    "(no arguments)".to_string()
                } else {
                    declared.join(", ")
                }
            )));
        }

        for (key, value) in arguments {
            if let Some(text) = value.as_str() {
                if text.len() > ARGUMENT_STRING_LIMIT {
                    return Err(ToolError::InvalidInput(format!(
                        "argument `{key}` is {} bytes, limit is {ARGUMENT_STRING_LIMIT}",
                        text.len()
                    )));
                }
            }
        }

        if facts.risk.requires_approval() {
            tracing::info!(
                tool = %call.name,
                risk = %facts.risk,
                arguments = %call.input,
                "gated tool dispatching"
            );
        }
        Ok(())
    }
}

impl ToolMiddleware for InputScreen {
    fn process<'a>(
        &'a self,
        call: &'a ToolCall,
        ctx: &'a ToolContext,
        next: Next<'a>,
    ) -> BoxedToolFuture<'a> {
        Box::pin(async move {
            self.screen(call)?;
            next.run(call, ctx).await
        })
    }
}

/// Pull the declared top-level argument keys out of a schemars-derived
/// schema. A schema without a `properties` object declares no
/// arguments, so only an empty arguments object passes for that tool.
fn declared_keys(schema: &serde_json::Value) -> BTreeSet<String> {
    schema["properties"]
        .as_object()
        .map(|properties| properties.keys().cloned().collect())
        .unwrap_or_default()
}

/// Middleware bounding the serialized size of tool output.
///
/// Oversized results are replaced by a preview marker so a runaway
/// handler cannot flood the model context or the push stream.
pub struct OutputLimiter {
    max_bytes: usize,
}

impl OutputLimiter {
    /// Limit serialized output to `max_bytes`.
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl ToolMiddleware for OutputLimiter {
    fn process<'a>(
        &'a self,
        call: &'a ToolCall,
        ctx: &'a ToolContext,
        next: Next<'a>,
    ) -> BoxedToolFuture<'a> {
        Box::pin(async move {
            let output = next.run(call, ctx).await?;
            let serialized = output.content.to_string();
            if serialized.len() <= self.max_bytes {
                return Ok(output);
            }
            let boundary = serialized
                .char_indices()
                .take_while(|(i, _)| *i < self.max_bytes.min(1024))
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            Ok(ToolOutput {
                content: serde_json::json!({
                    "truncated": true,
                    "total_bytes": serialized.len(),
                    "preview": &serialized[..boundary],
                }),
                display_type: output.display_type,
            })
        })
    }
}
