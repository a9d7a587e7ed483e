//! Anthropic Messages API client.
//!
//! Reference: <https://docs.anthropic.com/en/api/messages>

use std::collections::HashMap;

use futures::StreamExt;
use serde_json::{Value, json};

use argus_types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Provider, ProviderError, Role,
    StopReason, StreamEvent, StreamFault, StreamHandle, TokenUsage,
};

use crate::sse::sse_events;
use crate::{map_http_status, map_reqwest_error};

/// Default model used when the request does not specify one.
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
/// Default API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the Anthropic Messages API.
pub struct Anthropic {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl Anthropic {
    /// Create a client with the given API key and default model/URL.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            base_url: DEFAULT_BASE_URL.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Override the default model.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the API base URL (testing, proxies).
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn send(&self, body: Value) -> Result<reqwest::Response, ProviderError> {
        tracing::debug!(model = %body["model"], "sending anthropic request");
        let response = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.map_err(map_reqwest_error)?;
            return Err(map_http_status(status, &body_text));
        }
        Ok(response)
    }
}

impl Provider for Anthropic {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let mut body = to_api_request(&request, &self.model);
        body["stream"] = json!(false);
        let response = self.send(body).await?;
        let text = response.text().await.map_err(map_reqwest_error)?;
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid JSON: {e}")))?;
        from_api_response(&parsed)
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<StreamHandle, ProviderError> {
        let mut body = to_api_request(&request, &self.model);
        body["stream"] = json!(true);
        let response = self.send(body).await?;
        Ok(stream_response(response))
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "user",
    }
}

fn to_api_request(request: &CompletionRequest, default_model: &str) -> Value {
    let model = if request.model.is_empty() {
        default_model
    } else {
        &request.model
    };

    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let content: Vec<Value> = m
                .content
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => json!({"type": "text", "text": text}),
                    ContentBlock::Thinking { thinking } => {
                        json!({"type": "thinking", "thinking": thinking})
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect();
            json!({"role": role_name(m.role), "content": content})
        })
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
    });
    if let Some(system) = &request.system {
        body["system"] = json!(system);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if !request.tools.is_empty() {
        body["tools"] = json!(
            request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    })
                })
                .collect::<Vec<_>>()
        );
    }
    body
}

fn parse_stop_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

fn parse_content_block(block: &Value) -> Option<ContentBlock> {
    match block["type"].as_str()? {
        "text" => Some(ContentBlock::Text {
            text: block["text"].as_str().unwrap_or_default().to_string(),
        }),
        "thinking" => Some(ContentBlock::Thinking {
            thinking: block["thinking"].as_str().unwrap_or_default().to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: block["id"].as_str().unwrap_or_default().to_string(),
            name: block["name"].as_str().unwrap_or_default().to_string(),
            input: block["input"].clone(),
        }),
        _ => None,
    }
}

fn from_api_response(response: &Value) -> Result<CompletionResponse, ProviderError> {
    let content = response["content"]
        .as_array()
        .ok_or_else(|| ProviderError::InvalidResponse("missing content array".into()))?
        .iter()
        .filter_map(parse_content_block)
        .collect();

    Ok(CompletionResponse {
        message: Message {
            role: Role::Assistant,
            content,
        },
        stop_reason: parse_stop_reason(response["stop_reason"].as_str()),
        usage: TokenUsage {
            input_tokens: response["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: response["usage"]["output_tokens"].as_u64().unwrap_or(0),
        },
        model: response["model"].as_str().unwrap_or_default().to_string(),
    })
}

struct ToolUseInProgress {
    id: String,
    name: String,
    input_buf: String,
}

/// Streaming state assembled across SSE events.
#[derive(Default)]
struct StreamState {
    text_buf: String,
    thinking_buf: String,
    tool_uses: HashMap<usize, ToolUseInProgress>,
    order: Vec<usize>,
    usage: TokenUsage,
}

impl StreamState {
    fn into_message(mut self) -> Message {
        let mut content = Vec::new();
        if !self.thinking_buf.is_empty() {
            content.push(ContentBlock::Thinking {
                thinking: self.thinking_buf,
            });
        }
        if !self.text_buf.is_empty() {
            content.push(ContentBlock::Text {
                text: self.text_buf,
            });
        }
        for index in self.order {
            if let Some(tool_use) = self.tool_uses.remove(&index) {
                let input = if tool_use.input_buf.is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&tool_use.input_buf).unwrap_or(json!({}))
                };
                content.push(ContentBlock::ToolUse {
                    id: tool_use.id,
                    name: tool_use.name,
                    input,
                });
            }
        }
        Message {
            role: Role::Assistant,
            content,
        }
    }
}

fn stream_response(response: reqwest::Response) -> StreamHandle {
    let events = sse_events(response);
    let stream = async_stream::stream! {
        let mut state = StreamState::default();
        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(e) => e,
                Err(fault) => {
                    yield StreamEvent::Error(fault);
                    return;
                }
            };
            let data: Value = match serde_json::from_str(&event.data) {
                Ok(v) => v,
                Err(_) => continue,
            };
            match data["type"].as_str().unwrap_or_default() {
                "message_start" => {
                    state.usage.input_tokens =
                        data["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0);
                }
                "content_block_start" => {
                    let index = data["index"].as_u64().unwrap_or(0) as usize;
                    let block = &data["content_block"];
                    if block["type"] == "tool_use" {
                        let id = block["id"].as_str().unwrap_or_default().to_string();
                        let name = block["name"].as_str().unwrap_or_default().to_string();
                        state.order.push(index);
                        state.tool_uses.insert(index, ToolUseInProgress {
                            id: id.clone(),
                            name: name.clone(),
                            input_buf: String::new(),
                        });
                        yield StreamEvent::ToolUseStart { id, name };
                    }
                }
                "content_block_delta" => {
                    let index = data["index"].as_u64().unwrap_or(0) as usize;
                    let delta = &data["delta"];
                    match delta["type"].as_str().unwrap_or_default() {
                        "text_delta" => {
                            let text = delta["text"].as_str().unwrap_or_default().to_string();
                            state.text_buf.push_str(&text);
                            yield StreamEvent::TextDelta(text);
                        }
                        "thinking_delta" => {
                            let text = delta["thinking"].as_str().unwrap_or_default().to_string();
                            state.thinking_buf.push_str(&text);
                            yield StreamEvent::ThinkingDelta(text);
                        }
                        "input_json_delta" => {
                            let fragment =
                                delta["partial_json"].as_str().unwrap_or_default().to_string();
                            if let Some(tool_use) = state.tool_uses.get_mut(&index) {
                                tool_use.input_buf.push_str(&fragment);
                                yield StreamEvent::ToolUseInputDelta {
                                    id: tool_use.id.clone(),
                                    delta: fragment,
                                };
                            }
                        }
                        _ => {}
                    }
                }
                "message_delta" => {
                    if let Some(output) = data["usage"]["output_tokens"].as_u64() {
                        state.usage.output_tokens = output;
                    }
                }
                "message_stop" => {
                    yield StreamEvent::Usage(state.usage);
                    yield StreamEvent::MessageComplete(state.into_message());
                    return;
                }
                "error" => {
                    let message = data["error"]["message"]
                        .as_str()
                        .unwrap_or("provider error")
                        .to_string();
                    yield StreamEvent::Error(StreamFault::fatal(message));
                    return;
                }
                _ => {}
            }
        }
        // Stream ended without message_stop: surface what we have.
        yield StreamEvent::Usage(state.usage);
        yield StreamEvent::MessageComplete(state.into_message());
    };
    StreamHandle {
        receiver: Box::pin(stream),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_types::ToolDefinition;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: String::new(),
            messages: vec![Message::user("hello")],
            system: Some("be brief".into()),
            tools: vec![ToolDefinition {
                name: "query_metrics".into(),
                description: "query".into(),
                input_schema: json!({"type": "object"}),
            }],
            max_tokens: 1024,
            temperature: None,
        }
    }

    #[test]
    fn request_mapping_uses_default_model() {
        let body = to_api_request(&request(), DEFAULT_MODEL);
        assert_eq!(body["model"], DEFAULT_MODEL);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["type"], "text");
        assert_eq!(body["tools"][0]["name"], "query_metrics");
    }

    #[test]
    fn response_mapping_parses_tool_use() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "Checking."},
                {"type": "tool_use", "id": "tu_1", "name": "query_metrics",
                 "input": {"name": "cpu.percent"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 30},
            "model": "claude-sonnet-4-20250514"
        });
        let response = from_api_response(&raw).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.message.tool_uses().len(), 1);
    }

    #[test]
    fn missing_content_is_invalid_response() {
        assert!(from_api_response(&json!({"oops": true})).is_err());
    }

    #[test]
    fn stream_state_assembles_message() {
        let mut state = StreamState::default();
        state.text_buf = "The CPU is hot.".into();
        state.order.push(1);
        state.tool_uses.insert(
            1,
            ToolUseInProgress {
                id: "tu_1".into(),
                name: "query_metrics".into(),
                input_buf: "{\"name\":\"cpu.percent\"}".into(),
            },
        );
        let message = state.into_message();
        assert_eq!(message.content.len(), 2);
        match &message.content[1] {
            ContentBlock::ToolUse { input, .. } => {
                assert_eq!(input["name"], "cpu.percent");
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }
}
