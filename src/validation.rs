//! Input validation for outgoing messages and conversation references

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ChatError;
use crate::message::{ConversationId, UserId};
use crate::protocol::ConversationRef;

/// Longest message body the client will send.
pub const MAX_MESSAGE_CHARS: usize = 4000;

static REFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(?P<conv>\d+)|u_(?P<user>\d+))$").expect("valid regex"));

/// Validates a message body before it is sent
pub fn validate_message(msg: &str) -> Result<(), ChatError> {
    if msg.trim().is_empty() {
        return Err(ChatError::InvalidMessage("message cannot be empty".into()));
    }

    let chars = msg.chars().count();
    if chars > MAX_MESSAGE_CHARS {
        return Err(ChatError::InvalidMessage(format!(
            "message too long ({} characters, max {})",
            chars, MAX_MESSAGE_CHARS
        )));
    }

    Ok(())
}

/// Strips NUL characters and trailing whitespace
pub fn sanitize_message(msg: &str) -> String {
    let cleaned: String = msg.chars().filter(|&c| c != '\0').collect();
    cleaned.trim_end().to_string()
}

/// Parses `<id>` or `u_<user id>` as typed by the user or found in a URL
/// fragment.
pub fn parse_conversation_ref(input: &str) -> Result<ConversationRef, ChatError> {
    let trimmed = input.trim().trim_start_matches('#');
    let invalid = || ChatError::InvalidReference(input.to_string());
    let caps = REFERENCE_RE.captures(trimmed).ok_or_else(invalid)?;

    if let Some(conv) = caps.name("conv") {
        let id = conv.as_str().parse::<u64>().map_err(|_| invalid())?;
        return Ok(ConversationRef::Conversation(ConversationId(id)));
    }
    let user = caps.name("user").ok_or_else(invalid)?;
    let id = user.as_str().parse::<u64>().map_err(|_| invalid())?;
    Ok(ConversationRef::User(UserId(id)))
}
