//! Chat frame routing and event generation
//!
//! Converts socket frames to front-end events, and outbound commands to the
//! array form the server reads.

use crate::protocol::{ChatEvent, ErrorFrame, InboundFrame, OutboundCommand};

/// Route a text frame to the matching event. Frames that fit no known shape
/// become `ChatEvent::Error` so they are visible but never fatal.
pub fn decode_frame(text: &str) -> ChatEvent {
    if let Ok(frame) = serde_json::from_str::<InboundFrame>(text) {
        return match frame {
            InboundFrame::Message { message } => ChatEvent::Message(message),
            InboundFrame::Status { status, detail } => ChatEvent::Status { status, detail },
            InboundFrame::Log { message } => ChatEvent::Log(message),
        };
    }
    if let Ok(ErrorFrame { error }) = serde_json::from_str::<ErrorFrame>(text) {
        return ChatEvent::Error(format!("Server error: {}", error));
    }

    tracing::debug!(frame = %text, "unrecognised frame");
    ChatEvent::Error(format!("Unrecognised frame: {}", truncate(text, 120)))
}

/// Serialize commands as one JSON array frame.
pub fn encode_commands(commands: &[OutboundCommand]) -> Result<String, serde_json::Error> {
    serde_json::to_string(commands)
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
