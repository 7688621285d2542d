//! The single-tool stepper.
//!
//! The model may request tools freely, but the loop executes AT MOST one
//! tool per assistant message and only continues after feeding its result
//! back in a new completion request. Surplus tool calls in a single
//! message are discarded and answered with a corrective reminder.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use dh_domain::{ChatMessage, Role, ToolCall};
use dh_llm::{ChatClient, LlmError};
use dh_mcp_client::ToolRouter;

use crate::events::{AgentEvent, DoneMetadata, DoneStatus, LogLevel, ToolStatus};

/// System prompt enforcing the single-tool discipline.
pub const AGENT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to tools.\n\n\
CRITICAL RULE: Emit at most ONE tool call per assistant message.\n\n\
If multiple steps are required:\n\
1. Call exactly ONE tool\n\
2. Wait for the tool's result in the next message\n\
3. Then call the next tool if needed\n\n\
Never emit multiple tool calls in a single response. Always wait for each tool result before proceeding.";

const MULTI_TOOL_REMINDER: &str = "REMINDER: You emitted multiple tool calls in one message. \
Emit at most ONE tool call per message.";

/// Capacity of the event channel between the loop and the caller.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Length cap for the tool result preview on `tool.end` events.
const RESULT_PREVIEW_CHARS: usize = 200;

/// Result of a single agent turn.
#[derive(Debug, Default)]
pub struct AgentTurnResult {
    /// Accumulated thinking. Logged at debug level, never streamed.
    pub thinking: String,
    pub content: String,
    /// At most one element: the tool call selected for execution.
    pub tool_calls: Vec<ToolCall>,
    pub requires_followup: bool,
    /// How many surplus tool calls were discarded this turn.
    pub discarded_tool_calls: usize,
}

/// Agent execution loop.
pub struct AgentLoop {
    chat: Arc<dyn ChatClient>,
    tools: Arc<dyn ToolRouter>,
    max_iterations: usize,
    think_level: Option<String>,
}

impl AgentLoop {
    pub fn new(chat: Arc<dyn ChatClient>, tools: Arc<dyn ToolRouter>, max_iterations: usize) -> Self {
        Self {
            chat,
            tools,
            max_iterations,
            think_level: Some("high".to_string()),
        }
    }

    pub fn with_think_level(mut self, level: Option<String>) -> Self {
        self.think_level = level;
        self
    }

    /// Execute one turn: stream a completion, accumulating thinking
    /// (silently), content, and tool calls.
    ///
    /// If the conversation does not open with a system message, the
    /// single-tool discipline prompt is inserted first. When the model
    /// emits tool calls, only the first is kept and the result demands a
    /// followup; otherwise the final content is returned.
    pub async fn run_turn_stepper(
        &self,
        conversation: &mut Vec<ChatMessage>,
        enable_tools: bool,
    ) -> Result<AgentTurnResult, LlmError> {
        if conversation.first().map(|m| m.role) != Some(Role::System) {
            conversation.insert(0, ChatMessage::system(AGENT_SYSTEM_PROMPT));
        }

        let tools = if enable_tools {
            let defs = self.tools.llm_tools();
            if defs.is_empty() {
                None
            } else {
                Some(defs)
            }
        } else {
            None
        };

        tracing::info!(
            messages = conversation.len(),
            tools_enabled = enable_tools,
            "starting agent turn"
        );

        let mut thinking = String::new();
        let mut content = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        let mut stream =
            self.chat
                .chat_stream(conversation.clone(), tools, self.think_level.clone(), None);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            thinking.push_str(&chunk.thinking);
            content.push_str(&chunk.content);
            tool_calls.extend(chunk.tool_calls);
            if chunk.done {
                break;
            }
        }

        if tool_calls.is_empty() {
            tracing::info!("turn completed without tool calls");
            return Ok(AgentTurnResult {
                thinking,
                content,
                tool_calls: Vec::new(),
                requires_followup: false,
                discarded_tool_calls: 0,
            });
        }

        let discarded = tool_calls.len() - 1;
        if discarded > 0 {
            tracing::warn!(
                emitted = tool_calls.len(),
                "single-tool violation: keeping only the first tool call"
            );
        }
        tool_calls.truncate(1);

        Ok(AgentTurnResult {
            thinking,
            content,
            tool_calls,
            requires_followup: true,
            discarded_tool_calls: discarded,
        })
    }

    /// Execute one tool call via the registry, returning the result as a
    /// string (JSON-encoded when structured). A failure becomes a
    /// `{"error": …}` payload so the model can self-correct instead of
    /// the whole run failing.
    pub async fn execute_tool_call(&self, call: &ToolCall) -> String {
        tracing::info!(tool = %call.name, "executing tool");
        match self.tools.call_tool(&call.name, call.arguments.clone()).await {
            Ok(serde_json::Value::String(text)) => text,
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
            Err(e) => {
                let message = format!("Tool execution failed: {e}");
                tracing::error!(tool = %call.name, error = %e, "tool execution failed");
                serde_json::json!({ "error": message }).to_string()
            }
        }
    }

    /// Run until the model produces a final answer (or the iteration
    /// budget runs out), yielding events through the returned channel.
    ///
    /// Dropping the receiver cancels the loop at its next send.
    /// `iterations` in the final metadata counts completed LLM turns.
    pub fn run_until_completion(
        self: Arc<Self>,
        messages: Vec<ChatMessage>,
        enable_tools: bool,
    ) -> mpsc::Receiver<AgentEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if self.run_loop(messages, enable_tools, &tx).await.is_err() {
                tracing::debug!("event consumer went away, agent loop stopped");
            }
        });
        rx
    }

    /// The loop body. Returns `Err(())` when the consumer disappears.
    async fn run_loop(
        &self,
        messages: Vec<ChatMessage>,
        enable_tools: bool,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> Result<(), ()> {
        let mut conversation = messages;
        let mut iterations = 0usize;
        let mut tool_calls_executed = 0usize;

        while iterations < self.max_iterations {
            iterations += 1;

            let result = match self.run_turn_stepper(&mut conversation, enable_tools).await {
                Ok(result) => result,
                Err(e) => {
                    // Short user-facing string; the cause is logged.
                    tracing::error!(error = %e, iteration = iterations, "agent turn failed");
                    send(tx, AgentEvent::Log {
                        level: LogLevel::Error,
                        msg: "agent turn failed".to_string(),
                    })
                    .await?;
                    return Ok(());
                }
            };

            if !result.thinking.is_empty() {
                tracing::debug!(
                    thinking_chars = result.thinking.len(),
                    "turn produced thinking (not streamed)"
                );
            }

            if result.requires_followup {
                let Some(call) = result.tool_calls.first().cloned() else {
                    continue;
                };

                let started_at = Utc::now();
                let timer = Instant::now();
                send(tx, AgentEvent::Tool {
                    tool: call.name.clone(),
                    status: ToolStatus::Start,
                    args: Some(call.arguments.clone()),
                    ts: started_at.to_rfc3339(),
                    latency_ms: None,
                    result_preview: None,
                })
                .await?;

                conversation.push(ChatMessage::assistant_with_tool_call(
                    result.content.clone(),
                    call.clone(),
                ));

                let tool_result = self.execute_tool_call(&call).await;
                let latency_ms = timer.elapsed().as_millis() as u64;
                tool_calls_executed += 1;

                conversation.push(ChatMessage::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    tool_result.clone(),
                ));

                send(tx, AgentEvent::Tool {
                    tool: call.name.clone(),
                    status: ToolStatus::End,
                    args: None,
                    ts: Utc::now().to_rfc3339(),
                    latency_ms: Some(latency_ms),
                    result_preview: Some(preview(&tool_result)),
                })
                .await?;

                if result.discarded_tool_calls > 0 {
                    conversation.push(ChatMessage::system(MULTI_TOOL_REMINDER));
                }

                tracing::info!(iteration = iterations, "tool completed, continuing");
                continue;
            }

            // Final answer reached.
            let final_text = result.content;
            tracing::info!(iterations, "agent completed");
            for token in tokenize_for_streaming(&final_text) {
                send(tx, AgentEvent::Token { text: token }).await?;
            }
            send(tx, AgentEvent::Done {
                metadata: DoneMetadata {
                    iterations,
                    tool_calls: tool_calls_executed,
                    status: DoneStatus::Success,
                },
                final_text,
            })
            .await?;
            return Ok(());
        }

        let warning = format!("Agent hit max iterations ({})", self.max_iterations);
        tracing::warn!(max_iterations = self.max_iterations, "iteration budget exhausted");
        send(tx, AgentEvent::Log {
            level: LogLevel::Warn,
            msg: warning,
        })
        .await?;
        send(tx, AgentEvent::Done {
            metadata: DoneMetadata {
                iterations,
                tool_calls: tool_calls_executed,
                status: DoneStatus::MaxIterations,
            },
            final_text: String::new(),
        })
        .await?;
        Ok(())
    }
}

async fn send(tx: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> Result<(), ()> {
    tx.send(event).await.map_err(|_| ())
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(RESULT_PREVIEW_CHARS).collect();
    if out.len() < text.len() {
        out.push('…');
    }
    out
}

/// Split text into display tokens, each carrying its trailing whitespace
/// so the frontend renders spacing correctly.
pub fn tokenize_for_streaming(text: &str) -> Vec<String> {
    static TOKEN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let token = TOKEN.get_or_init(|| regex::Regex::new(r"\S+\s*").expect("valid regex"));
    token.find_iter(text).map(|m| m.as_str().to_string()).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
