//! Google Gemini generateContent client.
//!
//! Reference: <https://ai.google.dev/api/generate-content>
//!
//! Gemini function calls carry no call id; ids are synthesized as
//! `{name}#{n}` so tool results can be matched back to a declaration
//! (the name before the `#` is what goes into `functionResponse`).

use futures::StreamExt;
use serde_json::{Value, json};

use argus_types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, Provider, ProviderError, Role,
    StopReason, StreamEvent, StreamHandle, TokenUsage,
};

use crate::sse::sse_events;
use crate::{map_http_status, map_reqwest_error};

/// Default model used when the request does not specify one.
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
/// Default API base URL.
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Client for the Gemini generateContent API.
pub struct Gemini {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl Gemini {
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

    fn url(&self, request_model: &str, method: &str, sse: bool) -> String {
        let model = if request_model.is_empty() {
            &self.model
        } else {
            request_model
        };
        let alt = if sse { "alt=sse&" } else { "" };
        format!(
            "{}/v1beta/models/{model}:{method}?{alt}key={}",
            self.base_url, self.api_key
        )
    }

    async fn send(&self, url: String, body: Value) -> Result<reqwest::Response, ProviderError> {
        tracing::debug!("sending gemini request");
        let response = self
            .client
            .post(url)
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

impl Provider for Gemini {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let url = self.url(&request.model, "generateContent", false);
        let body = to_api_request(&request);
        let response = self.send(url, body).await?;
        let text = response.text().await.map_err(map_reqwest_error)?;
        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("invalid JSON: {e}")))?;
        from_api_response(&parsed, &self.model)
    }

    async fn complete_stream(&self, request: CompletionRequest) -> Result<StreamHandle, ProviderError> {
        let url = self.url(&request.model, "streamGenerateContent", true);
        let body = to_api_request(&request);
        let response = self.send(url, body).await?;
        Ok(stream_response(response, self.model.clone()))
    }
}

/// Recover the function name from a synthesized `{name}#{n}` call id.
fn name_from_call_id(id: &str) -> &str {
    id.split('#').next().unwrap_or(id)
}

fn to_api_request(request: &CompletionRequest) -> Value {
    let contents: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|message| {
            let role = match message.role {
                Role::Assistant => "model",
                _ => "user",
            };
            let parts: Vec<Value> = message
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(json!({"text": text})),
                    ContentBlock::Thinking { .. } => None,
                    ContentBlock::ToolUse { name, input, .. } => {
                        Some(json!({"functionCall": {"name": name, "args": input}}))
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => Some(json!({
                        "functionResponse": {
                            "name": name_from_call_id(tool_use_id),
                            "response": {"result": content, "is_error": is_error},
                        }
                    })),
                })
                .collect();
            json!({"role": role, "parts": parts})
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": {"maxOutputTokens": request.max_tokens},
    });
    if let Some(temperature) = request.temperature {
        body["generationConfig"]["temperature"] = json!(temperature);
    }
    if let Some(system) = &request.system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }
    if !request.tools.is_empty() {
        body["tools"] = json!([{
            "functionDeclarations": request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": sanitize_schema(&t.input_schema),
                    })
                })
                .collect::<Vec<_>>()
        }]);
    }
    body
}

/// Gemini rejects JSON Schema keywords it does not know; strip the
/// metadata keys schemars emits.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => {
            let cleaned: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| {
                    !matches!(k.as_str(), "$schema" | "title" | "definitions" | "$ref")
                })
                .map(|(k, v)| (k.clone(), sanitize_schema(v)))
                .collect();
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

fn parse_finish_reason(raw: Option<&str>, has_calls: bool) -> StopReason {
    if has_calls {
        return StopReason::ToolUse;
    }
    match raw {
        Some("MAX_TOKENS") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

fn parse_parts(parts: &[Value], call_counter: &mut usize) -> Vec<ContentBlock> {
    let mut content = Vec::new();
    for part in parts {
        if let Some(text) = part["text"].as_str() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        } else if let Some(call) = part.get("functionCall") {
            let name = call["name"].as_str().unwrap_or_default().to_string();
            let id = format!("{name}#{call_counter}");
            *call_counter += 1;
            content.push(ContentBlock::ToolUse {
                id,
                name,
                input: call["args"].clone(),
            });
        }
    }
    content
}

fn from_api_response(response: &Value, model: &str) -> Result<CompletionResponse, ProviderError> {
    let candidate = response["candidates"]
        .get(0)
        .ok_or_else(|| ProviderError::InvalidResponse("missing candidates".into()))?;
    let parts = candidate["content"]["parts"].as_array().cloned().unwrap_or_default();

    let mut call_counter = 0;
    let content = parse_parts(&parts, &mut call_counter);
    let has_calls = content
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolUse { .. }));

    Ok(CompletionResponse {
        message: Message {
            role: Role::Assistant,
            content,
        },
        stop_reason: parse_finish_reason(candidate["finishReason"].as_str(), has_calls),
        usage: TokenUsage {
            input_tokens: response["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            output_tokens: response["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or(0),
        },
        model: model.to_string(),
    })
}

fn stream_response(response: reqwest::Response, _model: String) -> StreamHandle {
    let events = sse_events(response);
    let stream = async_stream::stream! {
        let mut content: Vec<ContentBlock> = Vec::new();
        let mut usage = TokenUsage::default();
        let mut call_counter = 0usize;

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

            if let Some(meta) = data["usageMetadata"].as_object() {
                usage.input_tokens = meta
                    .get("promptTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(usage.input_tokens);
                usage.output_tokens = meta
                    .get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(usage.output_tokens);
            }

            let Some(candidate) = data["candidates"].get(0) else { continue };
            let parts = candidate["content"]["parts"].as_array().cloned().unwrap_or_default();
            for block in parse_parts(&parts, &mut call_counter) {
                match &block {
                    ContentBlock::Text { text } => {
                        yield StreamEvent::TextDelta(text.clone());
                        // Coalesce adjacent text chunks in the assembled message.
                        if let Some(ContentBlock::Text { text: last }) = content.last_mut() {
                            last.push_str(text);
                            continue;
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        yield StreamEvent::ToolUseStart {
                            id: id.clone(),
                            name: name.clone(),
                        };
                        yield StreamEvent::ToolUseInputDelta {
                            id: id.clone(),
                            delta: input.to_string(),
                        };
                    }
                    _ => {}
                }
                content.push(block);
            }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_maps_roles_and_functions() {
        let request = CompletionRequest {
            model: String::new(),
            messages: vec![
                Message::user("check cpu"),
                Message {
                    role: Role::Assistant,
                    content: vec![ContentBlock::ToolUse {
                        id: "query_metrics#0".into(),
                        name: "query_metrics".into(),
                        input: json!({"name": "cpu.percent"}),
                    }],
                },
                Message {
                    role: Role::User,
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: "query_metrics#0".into(),
                        content: "{}".into(),
                        is_error: false,
                    }],
                },
            ],
            system: Some("sys".into()),
            tools: vec![],
            max_tokens: 256,
            temperature: None,
        };
        let body = to_api_request(&request);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(
            contents[1]["parts"][0]["functionCall"]["name"],
            "query_metrics"
        );
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["name"],
            "query_metrics"
        );
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "sys");
    }

    #[test]
    fn response_synthesizes_call_ids() {
        let raw = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"name": "query_metrics", "args": {"name": "cpu.percent"}}},
                    {"functionCall": {"name": "search_logs", "args": {}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 7}
        });
        let response = from_api_response(&raw, DEFAULT_MODEL).unwrap();
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        let uses = response.message.tool_uses();
        assert_eq!(uses[0].0, "query_metrics#0");
        assert_eq!(uses[1].0, "search_logs#1");
    }

    #[test]
    fn schema_sanitizer_strips_metadata() {
        let schema = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "Input",
            "type": "object",
            "properties": {"name": {"type": "string"}}
        });
        let cleaned = sanitize_schema(&schema);
        assert!(cleaned.get("$schema").is_none());
        assert!(cleaned.get("title").is_none());
        assert_eq!(cleaned["properties"]["name"]["type"], "string");
    }

    #[test]
    fn name_recovered_from_call_id() {
        assert_eq!(name_from_call_id("query_metrics#3"), "query_metrics");
        assert_eq!(name_from_call_id("bare"), "bare");
    }
}
