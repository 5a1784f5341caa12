//! Chat messages as the portal API delivers them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Avatar shown when an author has no picture.
pub const DEFAULT_AVATAR: &str = "/static/img/user.svg";

/// Server-issued message identifier. Only its ordering is relied upon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ConversationId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who wrote a message, as much as the renderer needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub nickname: String,
    #[serde(default, alias = "pic")]
    pub thumbnail: Option<String>,
    #[serde(default, alias = "url")]
    pub profile: Option<String>,
}

impl Author {
    pub fn new(id: u64, nickname: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            nickname: nickname.into(),
            thumbnail: None,
            profile: None,
        }
    }

    /// Picture to display, falling back to the default avatar.
    pub fn avatar(&self) -> &str {
        self.thumbnail.as_deref().unwrap_or(DEFAULT_AVATAR)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// History pages omit it; the fetcher stamps the requested conversation.
    #[serde(default)]
    pub conversation: ConversationId,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "creation")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        id: u64,
        conversation: ConversationId,
        author: Author,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId(id),
            conversation,
            author,
            content: content.into(),
            created_at,
        }
    }
}
