//! One open chat: its metadata, its timeline and its history-loading state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, MessageId, UserId};
use crate::timeline::{ChatTimeline, GroupingPolicy};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Dm,
    Room,
    #[default]
    #[serde(other)]
    Other,
}

/// A member of a conversation as listed by the portal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub last_read_message: Option<MessageId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub id: ConversationId,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub creation: Option<DateTime<Utc>>,
    #[serde(default)]
    pub users: Vec<Participant>,
    #[serde(default, rename = "lastActivity")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConversationMeta {
    pub fn new(id: ConversationId, kind: ConversationKind) -> Self {
        Self {
            id,
            identifier: None,
            name: None,
            kind,
            creation: None,
            users: Vec::new(),
            last_activity: None,
        }
    }

    /// Title for listings. Direct messages are named after the other
    /// participant.
    pub fn title(&self, me: Option<UserId>) -> String {
        match self.kind {
            ConversationKind::Dm => self
                .users
                .iter()
                .find(|u| Some(u.id) != me)
                .map(|u| u.name.clone().unwrap_or_else(|| u.nickname.clone()))
                .unwrap_or_else(|| format!("Conversation {}", self.id)),
            _ => self
                .name
                .clone()
                .or_else(|| self.identifier.clone())
                .unwrap_or_else(|| format!("Conversation {}", self.id)),
        }
    }

    /// Time used to order listings: last activity, else creation.
    pub fn activity(&self) -> Option<DateTime<Utc>> {
        self.last_activity.or(self.creation)
    }
}

/// History loading state machine.
///
/// `Unopened -> LoadingInitial -> Loaded`, then `Loaded -> LoadingMore -> Loaded`.
/// A failed load falls back to the state it started from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Unopened,
    LoadingInitial,
    Loaded,
    LoadingMore,
}

impl LoadState {
    pub fn is_loading(self) -> bool {
        matches!(self, Self::LoadingInitial | Self::LoadingMore)
    }
}

/// Which kind of page a ticket asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadPhase {
    Initial,
    More,
}

/// Handle for one outstanding history request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadTicket {
    pub conversation: ConversationId,
    /// Only messages older than this id are requested.
    pub before: Option<MessageId>,
    pub phase: LoadPhase,
    pub generation: u64,
}

#[derive(Debug)]
pub struct Conversation {
    pub meta: ConversationMeta,
    timeline: ChatTimeline,
    state: LoadState,
    pending: Option<u64>,
    has_unseen: bool,
}

impl Conversation {
    pub fn new(meta: ConversationMeta, policy: GroupingPolicy, page_size: usize) -> Self {
        Self {
            meta,
            timeline: ChatTimeline::new(policy, page_size),
            state: LoadState::Unopened,
            pending: None,
            has_unseen: false,
        }
    }

    pub fn id(&self) -> ConversationId {
        self.meta.id
    }

    pub fn timeline(&self) -> &ChatTimeline {
        &self.timeline
    }

    pub(crate) fn timeline_mut(&mut self) -> &mut ChatTimeline {
        &mut self.timeline
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Whether the initial history page has been applied.
    pub fn loaded(&self) -> bool {
        matches!(self.state, LoadState::Loaded | LoadState::LoadingMore)
    }

    pub fn min_loaded_id(&self) -> Option<MessageId> {
        self.timeline.min_loaded_id()
    }

    pub fn has_unseen(&self) -> bool {
        self.has_unseen
    }

    pub(crate) fn set_unseen(&mut self, unseen: bool) {
        self.has_unseen = unseen;
    }

    /// Move into a loading state, or report why not. Returns the phase and
    /// the pagination cursor for the request.
    pub(crate) fn start_load(&mut self, generation: u64) -> Option<(LoadPhase, Option<MessageId>)> {
        let (next, phase, before) = match self.state {
            LoadState::Unopened => (LoadState::LoadingInitial, LoadPhase::Initial, None),
            LoadState::Loaded => (LoadState::LoadingMore, LoadPhase::More, self.min_loaded_id()),
            LoadState::LoadingInitial | LoadState::LoadingMore => return None,
        };
        self.state = next;
        self.pending = Some(generation);
        Some((phase, before))
    }

    pub(crate) fn is_pending(&self, generation: u64) -> bool {
        self.pending == Some(generation)
    }

    /// Leave the loading state after a failure, as if it never started.
    pub(crate) fn abort_load(&mut self) {
        self.state = match self.state {
            LoadState::LoadingInitial => LoadState::Unopened,
            LoadState::LoadingMore => LoadState::Loaded,
            other => other,
        };
        self.pending = None;
    }

    pub(crate) fn finish_load(&mut self) {
        self.state = LoadState::Loaded;
        self.pending = None;
    }
}
