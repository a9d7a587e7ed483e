//! Streaming completion events and the provider trait.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use futures::Stream;

use crate::llm::{CompletionRequest, CompletionResponse, Message, ProviderError, TokenUsage};

/// An event emitted during a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content.
    TextDelta(String),
    /// Incremental thinking/reasoning content.
    ThinkingDelta(String),
    /// A tool use block has started.
    ToolUseStart {
        /// Tool call identifier.
        id: String,
        /// Tool name.
        name: String,
    },
    /// Incremental tool input JSON for the block started with the same id.
    ToolUseInputDelta {
        /// Tool call identifier.
        id: String,
        /// JSON fragment.
        delta: String,
    },
    /// The complete assembled message (sent at the end of the stream).
    MessageComplete(Message),
    /// Token usage statistics for the stream.
    Usage(TokenUsage),
    /// An error occurred during streaming.
    Error(StreamFault),
}

/// Error information carried inside a stream.
#[derive(Debug, Clone)]
pub struct StreamFault {
    /// Human-readable error message.
    pub message: String,
    /// Whether retrying the whole turn might succeed.
    pub is_retryable: bool,
}

impl StreamFault {
    /// A retryable fault (rate limit, transient network).
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_retryable: true,
        }
    }

    /// A non-retryable fault.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_retryable: false,
        }
    }
}

impl fmt::Display for StreamFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Handle to a streaming completion response.
///
/// Consume with `StreamExt::next()`; the stream ends after
/// [`StreamEvent::MessageComplete`] (or a terminal error).
pub struct StreamHandle {
    /// The stream of events.
    pub receiver: Pin<Box<dyn Stream<Item = StreamEvent> + Send>>,
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle").finish_non_exhaustive()
    }
}

/// LLM provider interface.
///
/// Uses RPITIT and is intentionally not object-safe; runtime provider
/// selection goes through an enum that implements this trait by
/// delegation.
pub trait Provider: Send + Sync {
    /// Send a completion request and get a full response.
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<CompletionResponse, ProviderError>> + Send;

    /// Send a completion request and get a stream of events.
    fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<StreamHandle, ProviderError>> + Send;
}
