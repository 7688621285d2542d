use serde::{Deserialize, Serialize};

/// Upper bound on user/system message content after sanitization.
const MAX_MESSAGE_CHARS: usize = 32_000;

/// A function/tool call emitted by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
///
/// `parameters` is an opaque JSON Schema forwarded unchanged from tool
/// discovery to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the conversation, in the shape the chat runtime expects.
///
/// Assistant messages may carry tool calls; tool messages carry the result
/// text plus the originating call id and tool name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: sanitize_text(&text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: sanitize_text(&text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Assistant message that carries the tool call chosen for execution.
    pub fn assistant_with_tool_call(text: impl Into<String>, call: ToolCall) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            tool_calls: vec![call],
            tool_call_id: None,
            tool_name: None,
        }
    }

    /// Tool-role message carrying the result for a previous tool call.
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }
}

/// Sanitize untrusted message content before it reaches the model.
///
/// Strips control characters (keeping `\n`, `\r`, `\t`) and caps the
/// length at [`MAX_MESSAGE_CHARS`] characters.
pub fn sanitize_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();
    if cleaned.chars().count() > MAX_MESSAGE_CHARS {
        cleaned.chars().take(MAX_MESSAGE_CHARS).collect()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize_text("a\u{0}b\u{7}c"), "abc");
    }

    #[test]
    fn sanitize_keeps_whitespace() {
        assert_eq!(sanitize_text("a\nb\tc\r\n"), "a\nb\tc\r\n");
    }

    #[test]
    fn sanitize_caps_length() {
        let long = "x".repeat(40_000);
        assert_eq!(sanitize_text(&long).chars().count(), 32_000);
    }

    #[test]
    fn user_message_is_sanitized() {
        let msg = ChatMessage::user("hi\u{1b}[31m");
        assert_eq!(msg.content, "hi[31m");
        assert_eq!(msg.role, Role::User);
    }

    #[test]
    fn assistant_content_is_untouched() {
        // Assistant output is model-generated, not untrusted input.
        let msg = ChatMessage::assistant("raw\u{7}");
        assert_eq!(msg.content, "raw\u{7}");
    }

    #[test]
    fn tool_result_carries_call_id_and_name() {
        let msg = ChatMessage::tool_result("call_0", "web_search", "{}");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_0"));
        assert_eq!(msg.tool_name.as_deref(), Some("web_search"));
    }

    #[test]
    fn serialize_skips_empty_optionals() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
        assert!(!json.contains("tool_call_id"));
    }
}
