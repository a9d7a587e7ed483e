#![deny(missing_docs)]
//! LLM provider clients.
//!
//! Each backend maps the internal [`CompletionRequest`] to its own wire
//! format, with full SSE streaming support. Runtime provider selection
//! goes through [`LlmClient`], an enum implementing [`Provider`] by
//! delegation; the ReAct loop never sees a provider-specific type.

mod anthropic;
mod gemini;
mod openai;
mod retry;
mod sse;

pub use anthropic::Anthropic;
pub use gemini::Gemini;
pub use openai::OpenAi;
pub use retry::with_retries;

use argus_types::{
    CompletionRequest, CompletionResponse, LlmConfig, LlmProviderKind, Provider, ProviderError,
    StreamHandle,
};

/// A runtime-selected provider client.
pub enum LlmClient {
    /// Anthropic messages API.
    Anthropic(Anthropic),
    /// OpenAI chat completions API.
    OpenAi(OpenAi),
    /// Google Gemini generateContent API.
    Gemini(Gemini),
}

impl LlmClient {
    /// Build the configured client.
    pub fn from_config(config: &LlmConfig) -> Self {
        match config.provider {
            LlmProviderKind::Anthropic => {
                let mut client = Anthropic::new(&config.api_key);
                if !config.model.is_empty() {
                    client = client.model(&config.model);
                }
                LlmClient::Anthropic(client)
            }
            LlmProviderKind::Openai => {
                let mut client = OpenAi::new(&config.api_key);
                if !config.model.is_empty() {
                    client = client.model(&config.model);
                }
                LlmClient::OpenAi(client)
            }
            LlmProviderKind::Gemini => {
                let mut client = Gemini::new(&config.api_key);
                if !config.model.is_empty() {
                    client = client.model(&config.model);
                }
                LlmClient::Gemini(client)
            }
        }
    }
}

impl Provider for LlmClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        match self {
            LlmClient::Anthropic(c) => c.complete(request).await,
            LlmClient::OpenAi(c) => c.complete(request).await,
            LlmClient::Gemini(c) => c.complete(request).await,
        }
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<StreamHandle, ProviderError> {
        match self {
            LlmClient::Anthropic(c) => c.complete_stream(request).await,
            LlmClient::OpenAi(c) => c.complete_stream(request).await,
            LlmClient::Gemini(c) => c.complete_stream(request).await,
        }
    }
}

/// Map an HTTP status + body to a [`ProviderError`].
pub(crate) fn map_http_status(status: reqwest::StatusCode, body: &str) -> ProviderError {
    let detail = body.chars().take(300).collect::<String>();
    if status.as_u16() == 429 {
        ProviderError::RateLimited
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        ProviderError::AuthFailed(detail)
    } else if status.is_server_error() {
        ProviderError::RequestFailed(format!("{status}: {detail}"))
    } else {
        ProviderError::InvalidResponse(format!("{status}: {detail}"))
    }
}

/// Map a transport failure to a [`ProviderError`].
pub(crate) fn map_reqwest_error(e: reqwest::Error) -> ProviderError {
    ProviderError::RequestFailed(e.to_string())
}
