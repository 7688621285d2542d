//! Server-Sent Events framing for agent events.
//!
//! The HTTP edge drains the agent's event channel and forwards each
//! event as one SSE frame. The first frame of a stream carries a large
//! padding comment so intermediary proxies flush instead of buffering.

use crate::events::AgentEvent;

/// Minimum padding on the first frame. Anything under ~2 KB is known to
/// be held back by some reverse proxies.
const FIRST_FRAME_PADDING_BYTES: usize = 2048;

/// Serialize one event as an SSE frame:
/// `event: <name>\ndata: <json>\n[: padding]\n\n`.
pub fn frame(event: &AgentEvent, first: bool) -> String {
    let value = serde_json::to_value(event).unwrap_or_default();
    let data = value
        .get("data")
        .map(|d| d.to_string())
        .unwrap_or_else(|| "{}".to_string());

    let mut out = String::with_capacity(data.len() + 64);
    out.push_str("event: ");
    out.push_str(event.name());
    out.push_str("\ndata: ");
    out.push_str(&data);
    out.push('\n');

    if first {
        out.push_str(": ");
        out.push_str(&" ".repeat(FIRST_FRAME_PADDING_BYTES));
        out.push('\n');
    }

    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{DoneMetadata, DoneStatus};

    #[test]
    fn frame_carries_event_name_and_data() {
        let event = AgentEvent::Token { text: "hi ".into() };
        let frame = frame(&event, false);
        assert!(frame.starts_with("event: token\n"));
        assert!(frame.contains("data: {\"text\":\"hi \"}"));
        assert!(frame.ends_with("\n\n"));
    }

    #[test]
    fn first_frame_is_padded() {
        let event = AgentEvent::Token { text: "x".into() };
        let padded = frame(&event, true);
        assert!(padded.len() >= FIRST_FRAME_PADDING_BYTES);
        assert!(padded.contains("\n: "));
    }

    #[test]
    fn subsequent_frames_are_not_padded() {
        let event = AgentEvent::Done {
            metadata: DoneMetadata {
                iterations: 1,
                tool_calls: 0,
                status: DoneStatus::Success,
            },
            final_text: "done".into(),
        };
        let unpadded = frame(&event, false);
        assert!(unpadded.len() < 512);
        assert!(!unpadded.contains("\n: "));
    }
}
