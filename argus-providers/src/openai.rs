//! OpenAI chat completions client.
//!
//! Reference: <https://platform.openai.com/docs/api-reference/chat>

use std::collections::BTreeMap;

use futures::StreamExt;
use serde_json::{Value, json};

use argus_types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Provider, ProviderError, Role,
    StopReason, StreamEvent, StreamHandle, TokenUsage,
};

use crate::sse::sse_events;
use crate::{map_http_status, map_reqwest_error};

/// Default model used when the request does not specify one.
const DEFAULT_MODEL: &str = "gpt-4o";
/// Default API base URL.
const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Client for the OpenAI chat completions API.
pub struct OpenAi {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAi {
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

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    async fn send(&self, body: Value) -> Result<reqwest::Response, ProviderError> {
        tracing::debug!(model = %body["model"], "sending openai request");
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
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

impl Provider for OpenAi {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let body = to_api_request(&request, &self.model, false);
        let response = self.send(body).await?;
        let text = response.text().await.map_err(map_reqwest_error)?;
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid JSON: {e}")))?;
        from_api_response(&parsed)
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<StreamHandle, ProviderError> {
        let body = to_api_request(&request, &self.model, true);
        let response = self.send(body).await?;
        Ok(stream_response(response))
    }
}

fn to_api_request(request: &CompletionRequest, default_model: &str, stream: bool) -> Value {
    let model = if request.model.is_empty() {
        default_model
    } else {
        &request.model
    };

    let mut messages: Vec<Value> = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for message in &request.messages {
        match message.role {
            Role::System => {
                messages.push(json!({"role": "system", "content": message.text()}));
            }
            Role::Assistant => {
                let text = message.text();
                let tool_calls: Vec<Value> = message
                    .tool_uses()
                    .into_iter()
                    .map(|(id, name, input)| {
                        json!({
                            "id": id,
                            "type": "function",
                            "function": {"name": name, "arguments": input.to_string()},
                        })
                    })
                    .collect();
                let mut entry = json!({"role": "assistant"});
                entry["content"] = if text.is_empty() { Value::Null } else { json!(text) };
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = json!(tool_calls);
                }
                messages.push(entry);
            }
            Role::User => {
                // Tool results become their own `tool` role messages;
                // plain text stays a user message.
                let mut user_text = String::new();
                for block in &message.content {
                    match block {
                        ContentBlock::Text { text } => user_text.push_str(text),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                            ..
                        } => {
                            messages.push(json!({
                                "role": "tool",
                                "tool_call_id": tool_use_id,
                                "content": content,
                            }));
                        }
                        _ => {}
                    }
                }
                if !user_text.is_empty() {
                    messages.push(json!({"role": "user", "content": user_text}));
                }
            }
        }
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": request.max_tokens,
    });
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
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect::<Vec<_>>()
        );
    }
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({"include_usage": true});
    }
    body
}

fn parse_finish_reason(raw: Option<&str>) -> StopReason {
    match raw {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

fn from_api_response(response: &Value) -> Result<CompletionResponse, ProviderError> {
    let choice = response["choices"]
        .get(0)
        .ok_or_else(|| ProviderError::InvalidResponse("missing choices".into()))?;
    let message = &choice["message"];

    let mut content = Vec::new();
    if let Some(text) = message["content"].as_str() {
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    }
    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for call in tool_calls {
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
            content.push(ContentBlock::ToolUse {
                id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                input: serde_json::from_str(arguments).unwrap_or(json!({})),
            });
        }
    }

    Ok(CompletionResponse {
        message: Message {
            role: Role::Assistant,
            content,
        },
        stop_reason: parse_finish_reason(choice["finish_reason"].as_str()),
        usage: TokenUsage {
            input_tokens: response["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: response["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        },
        model: response["model"].as_str().unwrap_or_default().to_string(),
    })
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
    announced: bool,
}

fn stream_response(response: reqwest::Response) -> StreamHandle {
    let events = sse_events(response);
    let stream = async_stream::stream! {
        let mut text_buf = String::new();
        let mut tool_calls: BTreeMap<u64, PendingToolCall> = BTreeMap::new();
        let mut usage = TokenUsage::default();

        let mut events = std::pin::pin!(events);
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(e) => e,
                Err(fault) => {
                    yield StreamEvent::Error(fault);
                    return;
                }
            };
            if event.data == "[DONE]" {
                break;
            }
            let data: Value = match serde_json::from_str(&event.data) {
                Ok(v) => v,
                Err(_) => continue,
            };

            if let Some(u) = data["usage"].as_object() {
                usage.input_tokens = u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
                usage.output_tokens =
                    u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
            }

            let Some(choice) = data["choices"].get(0) else { continue };
            let delta = &choice["delta"];

            if let Some(text) = delta["content"].as_str() {
                if !text.is_empty() {
                    text_buf.push_str(text);
                    yield StreamEvent::TextDelta(text.to_string());
                }
            }
            if let Some(calls) = delta["tool_calls"].as_array() {
                for call in calls {
                    let index = call["index"].as_u64().unwrap_or(0);
                    let entry = tool_calls.entry(index).or_default();
                    if let Some(id) = call["id"].as_str() {
                        entry.id = id.to_string();
                    }
                    if let Some(name) = call["function"]["name"].as_str() {
                        entry.name.push_str(name);
                    }
                    if !entry.announced && !entry.id.is_empty() && !entry.name.is_empty() {
                        entry.announced = true;
                        yield StreamEvent::ToolUseStart {
                            id: entry.id.clone(),
                            name: entry.name.clone(),
                        };
                    }
                    if let Some(fragment) = call["function"]["arguments"].as_str() {
                        if !fragment.is_empty() {
                            entry.arguments.push_str(fragment);
                            yield StreamEvent::ToolUseInputDelta {
                                id: entry.id.clone(),
                                delta: fragment.to_string(),
                            };
                        }
                    }
                }
            }
        }

        let mut content = Vec::new();
        if !text_buf.is_empty() {
            content.push(ContentBlock::Text { text: text_buf });
        }
        for (_, call) in tool_calls {
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: serde_json::from_str(&call.arguments).unwrap_or(json!({})),
            });
        }
        yield StreamEvent::Usage(usage);
        yield StreamEvent::MessageComplete(Message {
            role: Role::Assistant,
            content,
        });
    };
    StreamHandle {
        receiver: Box::pin(stream),
    }
}
