//! Ollama chat client: streaming completions over NDJSON with thinking
//! traces and incremental tool-call assembly.
//!
//! The `/api/chat` response is a sequence of JSON lines. Tool-call
//! fragments are keyed by index; names append as strings and arguments
//! arrive either as streamed string fragments or as a complete JSON
//! object. Everything is accumulated as opaque text and parsed once the
//! stream signals `done`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;

use dh_domain::{ChatMessage, Role, ToolCall, ToolDefinition};

use crate::BoxStream;

/// Errors raised by the LLM runtime client.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("LLM protocol error: {0}")]
    Protocol(String),

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("model '{0}' is not installed and auto-pull is disabled")]
    ModelMissing(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        LlmError::Transport(e.to_string())
    }
}

impl From<LlmError> for dh_domain::Error {
    fn from(e: LlmError) -> Self {
        dh_domain::Error::Http(e.to_string())
    }
}

/// A single chunk of the streaming chat response.
#[derive(Debug, Clone, Default)]
pub struct StreamChunk {
    pub thinking: String,
    pub content: String,
    /// Populated only on the final (`done`) chunk, once the accumulated
    /// fragments have been parsed.
    pub tool_calls: Vec<ToolCall>,
    pub done: bool,
}

/// Default sampling temperature when the caller does not supply one.
const DEFAULT_TEMPERATURE: f32 = 0.7;

/// Streaming-chat surface the agent loop depends on.
pub trait ChatClient: Send + Sync {
    fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
        think: Option<String>,
        temperature: Option<f32>,
    ) -> BoxStream<'static, Result<StreamChunk, LlmError>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// OllamaClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    chat_model: String,
    num_ctx: u32,
    auto_pull: bool,
    client: reqwest::Client,
    /// Models already verified present, so concurrent callers do not
    /// stampede `/api/show`.
    ensured: Arc<Mutex<HashSet<String>>>,
}

impl OllamaClient {
    pub fn new(
        base_url: &str,
        chat_model: &str,
        num_ctx: u32,
        auto_pull: bool,
        timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            chat_model: chat_model.to_string(),
            num_ctx,
            auto_pull,
            client,
            ensured: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    pub fn chat_model(&self) -> &str {
        &self.chat_model
    }

    /// Check whether a model is installed. `/api/show` answers 200 for
    /// installed models and 404 otherwise.
    pub async fn model_exists(&self, model: &str) -> Result<bool, LlmError> {
        if model.is_empty() {
            return Ok(true);
        }
        let response = self
            .client
            .post(format!("{}/api/show", self.base_url))
            .json(&serde_json::json!({ "name": model }))
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            status => {
                let body = body_snippet(response).await;
                Err(LlmError::Http { status, body })
            }
        }
    }

    /// Make sure `model` is available before inference, pulling it when
    /// auto-pull is enabled. Concurrent callers serialize on the ensure
    /// lock; already-ensured models return immediately.
    pub async fn ensure_model_available(&self, model: &str) -> Result<(), LlmError> {
        if model.is_empty() {
            return Ok(());
        }

        let mut ensured = self.ensured.lock().await;
        if ensured.contains(model) {
            return Ok(());
        }

        if self.model_exists(model).await? {
            ensured.insert(model.to_string());
            return Ok(());
        }

        if !self.auto_pull {
            return Err(LlmError::ModelMissing(model.to_string()));
        }

        tracing::info!(model, base_url = %self.base_url, "pulling model, this may take a while");
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&serde_json::json!({ "name": model, "stream": false }))
            .timeout(Duration::from_secs(3600))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = body_snippet(response).await;
            tracing::error!(model, status = status.as_u16(), body = %body, "model pull failed");
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(model, "model pulled");
        ensured.insert(model.to_string());
        Ok(())
    }

    /// Generate an embedding for one text.
    pub async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, LlmError> {
        self.ensure_model_available(model).await?;

        let response = self
            .client
            .post(format!("{}/api/embeddings", self.base_url))
            .json(&serde_json::json!({ "model": model, "prompt": text }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = body_snippet(response).await;
            return Err(LlmError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = response.json().await?;
        let embedding = data
            .get("embedding")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|v| v as f32)
                    .collect()
            })
            .unwrap_or_default();
        Ok(embedding)
    }

    /// Nothing to tear down beyond dropping the connection pool, but the
    /// lifecycle call keeps shutdown explicit and symmetric.
    pub async fn close(&self) {}

    fn build_chat_payload(
        &self,
        messages: &[ChatMessage],
        tools: &Option<Vec<ToolDefinition>>,
        think: &Option<String>,
        temperature: f32,
    ) -> Value {
        let mut payload = serde_json::json!({
            "model": self.chat_model,
            "messages": messages.iter().map(message_to_wire).collect::<Vec<_>>(),
            "stream": true,
            "options": {
                "temperature": temperature,
                "num_ctx": self.num_ctx,
            },
        });
        if let Some(think) = think {
            payload["think"] = Value::String(think.clone());
        }
        if let Some(tools) = tools {
            payload["tools"] = Value::Array(tools.iter().map(tool_to_wire).collect());
        }
        payload
    }
}

impl ChatClient for OllamaClient {
    /// Stream a chat completion. The stream ends after the `done` chunk
    /// (which carries the finalized tool calls) or on the first error.
    fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolDefinition>>,
        think: Option<String>,
        temperature: Option<f32>,
    ) -> BoxStream<'static, Result<StreamChunk, LlmError>> {
        let this = self.clone();
        let temperature = temperature.unwrap_or(DEFAULT_TEMPERATURE);

        let stream = async_stream::stream! {
            if let Err(e) = this.ensure_model_available(&this.chat_model).await {
                yield Err(e);
                return;
            }

            let payload = this.build_chat_payload(&messages, &tools, &think, temperature);
            tracing::debug!(model = %this.chat_model, messages = messages.len(), "chat request");

            let response = match this
                .client
                .post(format!("{}/api/chat", this.base_url))
                .json(&payload)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = body_snippet(response).await;
                tracing::error!(status = status.as_u16(), body = %body, "chat request failed");
                yield Err(LlmError::Http { status: status.as_u16(), body });
                return;
            }

            let mut accumulator = ToolCallAccumulator::default();
            let mut buffer = String::new();
            let mut bytes = response.bytes_stream();

            loop {
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));
                        for line in drain_lines(&mut buffer) {
                            if let Some(mut parsed) = parse_chat_line(&line, &mut accumulator) {
                                if parsed.done {
                                    parsed.tool_calls = accumulator.finalize();
                                    yield Ok(parsed);
                                    return;
                                }
                                yield Ok(parsed);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(e.into());
                        return;
                    }
                    None => break,
                }
            }

            // Body ended without a done line; flush any trailing partial.
            let trailing = std::mem::take(&mut buffer);
            if !trailing.trim().is_empty() {
                if let Some(mut parsed) = parse_chat_line(&trailing, &mut accumulator) {
                    if parsed.done {
                        parsed.tool_calls = accumulator.finalize();
                    }
                    yield Ok(parsed);
                    return;
                }
            }
            yield Ok(StreamChunk { done: true, tool_calls: accumulator.finalize(), ..Default::default() });
        };

        Box::pin(stream)
    }
}

async fn body_snippet(response: reqwest::Response) -> String {
    let body = response.text().await.unwrap_or_default();
    clip(&body, 500).to_string()
}

/// Truncate to at most `max` bytes on a char boundary.
fn clip(s: &str, max: usize) -> &str {
    let mut end = s.len().min(max);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// NDJSON parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pull complete lines out of the buffer, leaving any partial line for
/// the next read.
fn drain_lines(buffer: &mut String) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.find('\n') {
        let line: String = buffer.drain(..=pos).collect();
        let line = line.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines
}

/// Parse one NDJSON line into a [`StreamChunk`], feeding tool-call
/// fragments into the accumulator. Malformed lines are logged and
/// skipped rather than failing the stream.
fn parse_chat_line(line: &str, accumulator: &mut ToolCallAccumulator) -> Option<StreamChunk> {
    let data: Value = match serde_json::from_str(line.trim()) {
        Ok(data) => data,
        Err(_) => {
            tracing::warn!(line = %clip(line, 200), "unparseable stream line");
            return None;
        }
    };

    let mut chunk = StreamChunk {
        done: data.get("done").and_then(Value::as_bool).unwrap_or(false),
        ..Default::default()
    };

    if let Some(message) = data.get("message") {
        if let Some(thinking) = message.get("thinking").and_then(Value::as_str) {
            chunk.thinking = thinking.to_string();
        }
        if let Some(content) = message.get("content").and_then(Value::as_str) {
            chunk.content = content.to_string();
        }
        if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                accumulator.feed(call);
            }
        }
    }

    Some(chunk)
}

/// Assembles tool calls streamed across chunks, keyed by index.
#[derive(Default)]
struct ToolCallAccumulator {
    partial: BTreeMap<u64, PartialCall>,
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn feed(&mut self, delta: &Value) {
        let index = delta.get("index").and_then(Value::as_u64).unwrap_or(0);
        let entry = self.partial.entry(index).or_default();

        if let Some(id) = delta.get("id").and_then(Value::as_str) {
            if entry.id.is_empty() {
                entry.id = id.to_string();
            }
        }

        if let Some(function) = delta.get("function") {
            if let Some(name) = function.get("name").and_then(Value::as_str) {
                entry.name.push_str(name);
            }
            match function.get("arguments") {
                // A complete object replaces whatever accumulated so far.
                Some(Value::Object(obj)) => {
                    entry.arguments =
                        serde_json::to_string(&Value::Object(obj.clone())).unwrap_or_default();
                }
                Some(Value::String(fragment)) => entry.arguments.push_str(fragment),
                _ => {}
            }
        }
    }

    /// Parse the accumulated fragments into tool calls. Arguments that
    /// fail to parse become `{}` after a structured warning.
    fn finalize(&mut self) -> Vec<ToolCall> {
        let partial = std::mem::take(&mut self.partial);
        partial
            .into_iter()
            .map(|(index, call)| {
                let arguments = if call.arguments.is_empty() {
                    serde_json::json!({})
                } else {
                    match serde_json::from_str(&call.arguments) {
                        Ok(value) => value,
                        Err(e) => {
                            tracing::warn!(
                                tool = %call.name,
                                error = %e,
                                raw = %clip(&call.arguments, 200),
                                "failed to parse tool arguments, using empty object"
                            );
                            serde_json::json!({})
                        }
                    }
                };
                ToolCall {
                    id: if call.id.is_empty() {
                        format!("call_{index}")
                    } else {
                        call.id
                    },
                    name: call.name,
                    arguments,
                }
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire conversion
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert an internal message to the chat API shape.
fn message_to_wire(msg: &ChatMessage) -> Value {
    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let mut wire = serde_json::json!({ "role": role, "content": msg.content });

    if !msg.tool_calls.is_empty() {
        wire["tool_calls"] = Value::Array(
            msg.tool_calls
                .iter()
                .map(|tc| {
                    serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": { "name": tc.name, "arguments": tc.arguments },
                    })
                })
                .collect(),
        );
    }

    if msg.role == Role::Tool {
        if let Some(name) = &msg.tool_name {
            wire["name"] = Value::String(name.clone());
        }
        if let Some(id) = &msg.tool_call_id {
            wire["tool_call_id"] = Value::String(id.clone());
        }
    }

    wire
}

/// Convert a tool definition to the function-call schema the model
/// expects. The parameters schema passes through unchanged.
fn tool_to_wire(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        },
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_lines_keeps_partial() {
        let mut buffer = String::from("{\"a\":1}\n{\"b\":2}\n{\"part");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(buffer, "{\"part");
    }

    #[test]
    fn drain_lines_skips_blank_lines() {
        let mut buffer = String::from("\n\n{\"a\":1}\n");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}"]);
    }

    #[test]
    fn parse_content_and_thinking() {
        let mut acc = ToolCallAccumulator::default();
        let chunk = parse_chat_line(
            r#"{"message":{"thinking":"hmm","content":"Hello"},"done":false}"#,
            &mut acc,
        )
        .unwrap();
        assert_eq!(chunk.thinking, "hmm");
        assert_eq!(chunk.content, "Hello");
        assert!(!chunk.done);
    }

    #[test]
    fn parse_skips_garbage_lines() {
        let mut acc = ToolCallAccumulator::default();
        assert!(parse_chat_line("not json", &mut acc).is_none());
    }

    #[test]
    fn accumulates_string_fragment_arguments() {
        let mut acc = ToolCallAccumulator::default();
        acc.feed(&serde_json::json!({
            "index": 0, "id": "call_a",
            "function": { "name": "multiply", "arguments": "{\"a\":" }
        }));
        acc.feed(&serde_json::json!({
            "index": 0,
            "function": { "arguments": "3,\"b\":2}" }
        }));

        let calls = acc.finalize();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[0].name, "multiply");
        assert_eq!(calls[0].arguments, serde_json::json!({"a": 3, "b": 2}));
    }

    #[test]
    fn accepts_whole_object_arguments() {
        let mut acc = ToolCallAccumulator::default();
        acc.feed(&serde_json::json!({
            "index": 0,
            "function": { "name": "multiply", "arguments": {"a": 3, "b": 2} }
        }));

        let calls = acc.finalize();
        assert_eq!(calls[0].arguments, serde_json::json!({"a": 3, "b": 2}));
    }

    #[test]
    fn malformed_arguments_become_empty_object() {
        let mut acc = ToolCallAccumulator::default();
        acc.feed(&serde_json::json!({
            "index": 0,
            "function": { "name": "broken", "arguments": "{not json" }
        }));

        let calls = acc.finalize();
        assert_eq!(calls[0].arguments, serde_json::json!({}));
    }

    #[test]
    fn preserves_index_order_and_synthesizes_ids() {
        let mut acc = ToolCallAccumulator::default();
        acc.feed(&serde_json::json!({
            "index": 1, "function": { "name": "second", "arguments": "{}" }
        }));
        acc.feed(&serde_json::json!({
            "index": 0, "function": { "name": "first", "arguments": "{}" }
        }));

        let calls = acc.finalize();
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].id, "call_1");
    }

    #[test]
    fn tool_message_wire_shape() {
        let msg = ChatMessage::tool_result("call_1", "web_search", "{\"hits\":3}");
        let wire = message_to_wire(&msg);
        assert_eq!(wire["role"], "tool");
        assert_eq!(wire["name"], "web_search");
        assert_eq!(wire["tool_call_id"], "call_1");
    }

    #[test]
    fn assistant_tool_call_wire_shape() {
        let msg = ChatMessage::assistant_with_tool_call(
            "",
            ToolCall {
                id: "call_1".into(),
                name: "multiply".into(),
                arguments: serde_json::json!({"a": 3}),
            },
        );
        let wire = message_to_wire(&msg);
        assert_eq!(wire["tool_calls"][0]["type"], "function");
        assert_eq!(wire["tool_calls"][0]["function"]["name"], "multiply");
    }

    #[test]
    fn tool_definition_wire_shape() {
        let tool = ToolDefinition {
            name: "web_search".into(),
            description: "Search the web".into(),
            parameters: serde_json::json!({"type": "object", "properties": {}}),
        };
        let wire = tool_to_wire(&tool);
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], "web_search");
        assert_eq!(wire["function"]["parameters"]["type"], "object");
    }
}
