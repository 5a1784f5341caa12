//! Messages crossing the front end / backend boundary, and the JSON frames
//! exchanged with the chat WebSocket.

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::conversation::{ConversationMeta, LoadTicket};
use crate::error::FetchError;
use crate::message::{ConversationId, Message, UserId};

/// How a conversation is named when asking to join it: by id, or by the
/// user at the other end of a direct message (`u_<id>`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConversationRef {
    Conversation(ConversationId),
    User(UserId),
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "{}", id),
            Self::User(id) => write!(f, "u_{}", id),
        }
    }
}

/// Subscription target of a `join` command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JoinTarget {
    /// Every conversation the user belongs to (`"__all__"` on the wire).
    All,
    Conversation(ConversationId),
}

const JOIN_ALL: &str = "__all__";

impl Serialize for JoinTarget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::All => serializer.serialize_str(JOIN_ALL),
            Self::Conversation(id) => serializer.serialize_u64(id.0),
        }
    }
}

impl<'de> Deserialize<'de> for JoinTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Id(u64),
            Name(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Id(id) => Ok(Self::Conversation(ConversationId(id))),
            Raw::Name(name) if name == JOIN_ALL => Ok(Self::All),
            Raw::Name(name) => Err(de::Error::custom(format!("unknown join target {}", name))),
        }
    }
}

/// Commands written to the socket. The server expects a JSON array of them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundCommand {
    Join {
        conversation: JoinTarget,
    },
    Send {
        conversation: ConversationId,
        message: String,
    },
}

/// Frames read from the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InboundFrame {
    Message {
        message: Message,
    },
    Status {
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        detail: Option<serde_json::Value>,
    },
    Log {
        #[serde(default)]
        message: String,
    },
}

/// `{"error": "..."}`, sent by the server for requests it could not parse.
#[derive(Clone, Debug, Deserialize)]
pub struct ErrorFrame {
    pub error: String,
}

/// Actions sent from the front end to the backend
#[derive(Debug, Clone)]
pub enum BackendAction {
    /// Open the socket (and keep reopening it until told otherwise)
    Connect,
    /// Close the socket and stop reconnecting
    Disconnect,
    /// Subscribe to live messages
    Join(JoinTarget),
    /// Post a message to a conversation
    Send {
        conversation: ConversationId,
        content: String,
    },
    /// Fetch the page a ticket describes
    FetchHistory(LoadTicket),
    /// List the conversations the user is in
    LoadPresence,
    /// Join a conversation and return its metadata
    OpenConversation(ConversationRef),
    /// Stop the backend loop
    Shutdown,
}

/// Events sent from the backend to the front end
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// Socket is open
    Connected,
    /// Socket closed; the reason is for display
    Disconnected(String),
    /// A reconnection attempt is scheduled
    Reconnecting { attempt: u32, delay: Duration },
    /// Non-fatal error worth showing
    Error(String),
    /// A live message
    Message(Message),
    /// Server status notice
    Status {
        status: Option<String>,
        detail: Option<serde_json::Value>,
    },
    /// Server log line
    Log(String),
    /// A history request finished
    History {
        ticket: LoadTicket,
        result: Result<Vec<Message>, FetchError>,
    },
    /// Directory listing arrived
    Presence(Vec<ConversationMeta>),
    /// A conversation was joined and described
    ConversationOpened(ConversationMeta),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_all_wire_form() {
        let cmd = OutboundCommand::Join {
            conversation: JoinTarget::All,
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "join", "conversation": "__all__"})
        );
    }

    #[test]
    fn test_send_wire_form() {
        let cmd = OutboundCommand::Send {
            conversation: ConversationId(4),
            message: "boas".into(),
        };
        assert_eq!(
            serde_json::to_value(&cmd).unwrap(),
            json!({"type": "send", "conversation": 4, "message": "boas"})
        );
    }

    #[test]
    fn test_join_target_decodes_both_forms() {
        let all: JoinTarget = serde_json::from_value(json!("__all__")).unwrap();
        assert_eq!(all, JoinTarget::All);
        let one: JoinTarget = serde_json::from_value(json!(12)).unwrap();
        assert_eq!(one, JoinTarget::Conversation(ConversationId(12)));
        assert!(serde_json::from_value::<JoinTarget>(json!("everyone")).is_err());
    }

    #[test]
    fn test_decode_status_frame_without_payload() {
        let frame: InboundFrame = serde_json::from_str(r#"{"type": "status"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Status {
                status: None,
                detail: None
            }
        );
    }

    #[test]
    fn test_conversation_ref_display() {
        assert_eq!(ConversationRef::Conversation(ConversationId(8)).to_string(), "8");
        assert_eq!(ConversationRef::User(UserId(15)).to_string(), "u_15");
    }
}
