//! Events streamed to the caller during an agent run.
//!
//! The serialized form is `{"event": <name>, "data": {...}}`, which the
//! HTTP edge forwards as Server-Sent Events. Thinking traces are
//! accumulated inside the loop but never appear here.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Start,
    End,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    Success,
    MaxIterations,
}

/// Run summary carried on the final event.
#[derive(Debug, Clone, Serialize)]
pub struct DoneMetadata {
    /// Completed LLM turns (tool-loop iterations).
    pub iterations: usize,
    /// Tools actually executed.
    pub tool_calls: usize,
    pub status: DoneStatus,
}

/// One event in the agent's output stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum AgentEvent {
    Token {
        text: String,
    },
    Tool {
        tool: String,
        status: ToolStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
        /// RFC 3339 timestamp of the status change.
        ts: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        latency_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        result_preview: Option<String>,
    },
    Log {
        level: LogLevel,
        msg: String,
    },
    Done {
        metadata: DoneMetadata,
        final_text: String,
    },
}

impl AgentEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Token { .. } => "token",
            AgentEvent::Tool { .. } => "tool",
            AgentEvent::Log { .. } => "log",
            AgentEvent::Done { .. } => "done",
        }
    }
}
