//! The LLM conversation lingua franca.
//!
//! These are the internal types the ReAct loop speaks. Providers convert
//! to and from their own wire formats; nothing provider-specific leaks
//! past this module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Role of a conversation message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human user (or tool results fed back to the model).
    User,
    /// The model.
    Assistant,
    /// System instructions.
    System,
}

/// A content block within a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// Extended thinking from reasoning models.
    Thinking {
        /// The thinking text.
        thinking: String,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Unique identifier for this tool call.
        id: String,
        /// Name of the tool to invoke.
        name: String,
        /// JSON input arguments.
        input: serde_json::Value,
    },
    /// Result of a tool invocation, fed back as a user block.
    ToolResult {
        /// References the `id` of the corresponding `ToolUse`.
        tool_use_id: String,
        /// Serialized result content.
        content: String,
        /// Whether the result represents an error.
        is_error: bool,
    },
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The author role.
    pub role: Role,
    /// The content blocks.
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// A user message with a single text block.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The tool use blocks of this message, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// Rough token estimate for admission control: chars / 4.
    pub fn estimate_tokens(&self) -> u64 {
        let chars: usize = self
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::Text { text } => text.len(),
                ContentBlock::Thinking { thinking } => thinking.len(),
                ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                ContentBlock::ToolResult { content, .. } => content.len(),
            })
            .sum();
        (chars / 4) as u64
    }
}

/// JSON Schema description of a tool for the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Model produced a final response.
    #[default]
    EndTurn,
    /// Model wants to use one or more tools.
    ToolUse,
    /// Hit the max_tokens limit.
    MaxTokens,
}

/// Token usage from a single provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
}

impl TokenUsage {
    /// Input + output.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Add another usage into this one.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// A request to an LLM provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier (empty = provider default).
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<Message>,
    /// System prompt.
    pub system: Option<String>,
    /// Tools available to the model.
    pub tools: Vec<ToolDefinition>,
    /// Maximum output tokens.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: Option<f64>,
}

/// A complete (non-streaming) provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// The assistant message.
    pub message: Message,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token usage for this call.
    pub usage: TokenUsage,
    /// The model that actually served the request.
    pub model: String,
}

/// Errors from LLM providers.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP or network request failed.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// Provider rate-limited the request.
    #[error("rate limited")]
    RateLimited,

    /// Authentication/authorization failed.
    #[error("auth failed: {0}")]
    AuthFailed(String),

    /// Could not parse the provider's response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ProviderError {
    /// Whether retrying this request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited | ProviderError::RequestFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_tag_roundtrip() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "query_metrics".into(),
            input: json!({"name": "cpu.percent"}),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_use");
        let back: ContentBlock = serde_json::from_value(value).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn message_text_joins_text_blocks() {
        let msg = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ToolUse {
                    id: "tu_1".into(),
                    name: "t".into(),
                    input: json!({}),
                },
                ContentBlock::Text { text: "b".into() },
            ],
        };
        assert_eq!(msg.text(), "ab");
        assert_eq!(msg.tool_uses().len(), 1);
    }

    #[test]
    fn token_estimate_is_chars_over_four() {
        let msg = Message::user("x".repeat(400));
        assert_eq!(msg.estimate_tokens(), 100);
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.accumulate(&TokenUsage {
            input_tokens: 10,
            output_tokens: 5,
        });
        total.accumulate(&TokenUsage {
            input_tokens: 3,
            output_tokens: 2,
        });
        assert_eq!(total.total(), 20);
    }

    #[test]
    fn provider_error_retryable() {
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::RequestFailed("timeout".into()).is_retryable());
        assert!(!ProviderError::AuthFailed("bad key".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("bad json".into()).is_retryable());
    }
}
