//! OpenAI-compatible streaming chat-completion client.
//!
//! Works against the official API as well as compatible gateways (set a
//! custom base URL). Tool-call deltas are accumulated by index while content
//! deltas are forwarded through the caller's channel.

use crate::error::{LlmError, LlmResult};
use crate::llm::{ChatRequest, ChatResponse, DEFAULT_REQUEST_TIMEOUT, Llm, StreamDelta};
use crate::schema::{Message, Role, ToolCall, ToolChoice};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

/// Default OpenAI API base URL.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI-compatible chat client.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl std::fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl OpenAiClient {
    /// Create a client for `model` with the given key and base URL.
    ///
    /// An empty `base_url` falls back to [`OPENAI_API_BASE_URL`].
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url: String = base_url.into();
        Self {
            http: reqwest::Client::new(),
            model: model.into(),
            api_key: api_key.into(),
            base_url: if base_url.is_empty() {
                OPENAI_API_BASE_URL.to_string()
            } else {
                base_url
            },
        }
    }

    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> OpenAiClientBuilder {
        OpenAiClientBuilder::default()
    }

    /// Translate schema messages into the wire format.
    ///
    /// Fails if the context contains no user message.
    fn format_messages(request: &ChatRequest) -> LlmResult<Vec<serde_json::Value>> {
        let mut formatted = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_message
            && !system.content.is_empty()
        {
            formatted.push(json!({"role": "system", "content": system.content}));
        }

        let mut has_user_message = false;
        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    formatted.push(json!({"role": "system", "content": msg.content}));
                }
                Role::User => {
                    has_user_message = true;
                    let mut parts = vec![json!({"type": "text", "text": msg.content})];
                    if request.supports_images
                        && let Some(image) = &msg.base64_image
                    {
                        let uri = if image.starts_with("data:") || image.starts_with("http") {
                            image.clone()
                        } else {
                            format!("data:image/jpeg;base64,{image}")
                        };
                        parts.push(json!({"type": "image_url", "image_url": {"url": uri}}));
                    }
                    formatted.push(json!({"role": "user", "content": parts}));
                }
                Role::Assistant => {
                    let mut entry = json!({"role": "assistant", "content": msg.content});
                    if !msg.tool_calls.is_empty() {
                        entry["tool_calls"] = serde_json::to_value(&msg.tool_calls)?;
                    }
                    formatted.push(entry);
                }
                Role::Tool => {
                    formatted.push(json!({
                        "role": "tool",
                        "content": msg.content,
                        "tool_call_id": msg.tool_call_id.as_deref().unwrap_or_default(),
                    }));
                }
            }
        }
        if !has_user_message {
            return Err(LlmError::invalid("messages must contain a user message"));
        }
        Ok(formatted)
    }

    fn build_body(&self, request: &ChatRequest) -> LlmResult<serde_json::Value> {
        let messages = Self::format_messages(request)?;
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::to_value(&request.tools)?;
            body["tool_choice"] = json!(request.tool_choice);
        } else if request.tool_choice == ToolChoice::Required {
            return Err(LlmError::invalid("tool_choice=required with no tools"));
        }
        Ok(body)
    }
}

#[async_trait]
impl Llm for OpenAiClient {
    async fn handle(
        &self,
        request: ChatRequest,
        deltas: mpsc::Sender<StreamDelta>,
    ) -> LlmResult<ChatResponse> {
        let timeout = request.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let body = self.build_body(&request)?;

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout)
                } else {
                    LlmError::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut acc = Accumulator::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(timeout)
                } else {
                    LlmError::from(e)
                }
            })?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line) = next_line(&mut buffer) {
                let Some(data) = parse_sse_data(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break;
                }
                let parsed: StreamChunk = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "skipping malformed stream chunk");
                        continue;
                    }
                };
                acc.absorb(parsed, &deltas).await?;
            }
        }

        if !acc.saw_choice {
            return Err(LlmError::NoResponse);
        }
        Ok(acc.finish())
    }
}

/// Extract the next complete line from `buffer`, if any.
fn next_line(buffer: &mut String) -> Option<String> {
    buffer.find('\n').map(|pos| {
        let line = buffer[..pos].to_string();
        buffer.drain(..=pos);
        line
    })
}

/// Strip the `data: ` prefix of an SSE line; comments and blanks yield `None`.
fn parse_sse_data(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    trimmed.strip_prefix("data: ").map(str::trim)
}

/// Aggregates stream chunks into the final response.
#[derive(Default)]
struct Accumulator {
    saw_choice: bool,
    content: String,
    tool_calls: Vec<ToolCall>,
}

impl Accumulator {
    async fn absorb(
        &mut self,
        chunk: StreamChunk,
        deltas: &mpsc::Sender<StreamDelta>,
    ) -> LlmResult<()> {
        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };
        self.saw_choice = true;

        if let Some(refusal) = choice.delta.refusal
            && !refusal.is_empty()
        {
            return Err(LlmError::Refusal(refusal));
        }

        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            self.content.push_str(&content);
            // A closed channel means the reader stopped listening; keep
            // accumulating so the aggregate response stays complete.
            let _ = deltas.send(StreamDelta::Content(content)).await;
        }

        for delta in choice.delta.tool_calls.unwrap_or_default() {
            if delta.index >= self.tool_calls.len() {
                self.tool_calls.resize_with(delta.index + 1, || ToolCall {
                    kind: "function".to_string(),
                    ..ToolCall::default()
                });
            }
            let call = &mut self.tool_calls[delta.index];
            if let Some(id) = delta.id {
                call.id = id;
            }
            if let Some(kind) = delta.kind {
                call.kind = kind;
            }
            if let Some(function) = delta.function {
                if let Some(name) = function.name {
                    call.function.name.push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    call.function.arguments.push_str(&arguments);
                }
            }
        }

        if choice.finish_reason.is_some() {
            let _ = deltas.send(StreamDelta::Final).await;
        }
        Ok(())
    }

    fn finish(self) -> ChatResponse {
        ChatResponse {
            content: self.content,
            tool_calls: self.tool_calls,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Builder for [`OpenAiClient`].
#[derive(Debug, Default)]
pub struct OpenAiClientBuilder {
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
}

impl OpenAiClientBuilder {
    /// Set the model id.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the API key.
    #[must_use]
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set a custom base URL (gateways, local models, proxies).
    #[must_use]
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Build the client.
    ///
    /// # Panics
    ///
    /// Panics if model or API key is not set.
    #[must_use]
    pub fn build(self) -> OpenAiClient {
        OpenAiClient::new(
            self.model.expect("model is required"),
            self.api_key.expect("api key is required"),
            self.base_url.unwrap_or_default(),
        )
    }
}
