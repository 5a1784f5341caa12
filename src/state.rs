//! Session state, separated from any front end.
//!
//! `ChatSession` owns every conversation the user has listed or opened,
//! routes live messages to them, keeps the listing order and arbitrates
//! history loads. Front ends receive it as a parameter rather than reaching
//! for globals, and it is only ever mutated from one thread.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Local;

use crate::config::Settings;
use crate::conversation::{Conversation, ConversationMeta, LoadPhase, LoadState, LoadTicket};
use crate::error::{ChatError, ConfigError, FetchError};
use crate::history::{fetch_with_timeout, HistoryFetcher};
use crate::logging::{TranscriptEntry, TranscriptLogger};
use crate::message::{ConversationId, Message};
use crate::timeline::{GroupingPolicy, InsertResult, DEFAULT_PAGE_SIZE};

/// Maximum lines kept in the system log.
const MAX_SYSTEM_LOG: usize = 500;

/// Where a live message went.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoutedMessage {
    pub conversation: ConversationId,
    pub result: InsertResult,
    /// The conversation is on screen; draw the message now.
    pub render: bool,
    /// The message raised the conversation's unseen flag.
    pub unseen: bool,
}

/// Result of applying a history response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied {
        conversation: ConversationId,
        phase: LoadPhase,
        inserted: usize,
        has_more: bool,
    },
    /// The conversation was closed or re-opened since the request was made.
    Discarded,
}

pub struct ChatSession {
    /// Whether the chat socket is currently open.
    pub is_connected: bool,

    /// System log lines (connection notices, errors).
    pub system_log: Vec<String>,

    conversations: HashMap<ConversationId, Conversation>,

    /// Listing order, most recently active first.
    order: Vec<ConversationId>,

    /// Conversation currently on screen.
    current: Option<ConversationId>,

    /// Conversations whose messages are rendered as they arrive.
    active: HashSet<ConversationId>,

    policy: GroupingPolicy,
    page_size: usize,
    next_generation: u64,

    transcripts: Option<(TranscriptLogger, String)>,
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new(GroupingPolicy::default(), DEFAULT_PAGE_SIZE)
    }
}

impl ChatSession {
    pub fn new(policy: GroupingPolicy, page_size: usize) -> Self {
        Self {
            is_connected: false,
            system_log: Vec::new(),
            conversations: HashMap::new(),
            order: Vec::new(),
            current: None,
            active: HashSet::new(),
            policy,
            page_size,
            next_generation: 1,
            transcripts: None,
        }
    }

    /// Session configured from settings, with transcripts when enabled.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let policy = settings.grouping_policy()?;
        let mut session = Self::new(policy, settings.page_size);
        if settings.transcripts {
            match TranscriptLogger::new(policy.offset()) {
                Ok(logger) => session = session.with_transcripts(logger, &settings.server),
                Err(e) => tracing::warn!("transcripts disabled: {}", e),
            }
        }
        Ok(session)
    }

    pub fn with_transcripts(mut self, logger: TranscriptLogger, server: &str) -> Self {
        self.transcripts = Some((logger, server.to_string()));
        self
    }

    /// Add a conversation to the listing without opening it. Known
    /// conversations only get their metadata refreshed. Returns whether it
    /// was new.
    pub fn track(&mut self, meta: ConversationMeta) -> bool {
        let id = meta.id;
        if let Some(existing) = self.conversations.get_mut(&id) {
            existing.meta = meta;
            self.sort_listing();
            return false;
        }
        self.conversations
            .insert(id, Conversation::new(meta, self.policy, self.page_size));
        self.order.push(id);
        self.sort_listing();
        true
    }

    /// Track a conversation and put it on screen.
    pub fn open(&mut self, meta: ConversationMeta) -> ConversationId {
        let id = meta.id;
        self.track(meta);
        self.switch_to(id);
        id
    }

    /// Drop a conversation. Responses still in flight for it are discarded
    /// when they arrive.
    pub fn close(&mut self, id: ConversationId) -> Option<Conversation> {
        let removed = self.conversations.remove(&id)?;
        self.order.retain(|c| *c != id);
        self.active.remove(&id);
        if self.current == Some(id) {
            self.current = None;
        }
        tracing::debug!(conversation = %id, "conversation closed");
        Some(removed)
    }

    /// Route a live message to its conversation.
    pub fn on_message(&mut self, message: Message) -> Result<RoutedMessage, ChatError> {
        let id = message.conversation;
        let Some(conversation) = self.conversations.get_mut(&id) else {
            tracing::warn!(conversation = %id, message = %message.id, "message for unknown conversation dropped");
            return Err(ChatError::UnknownConversation(id));
        };

        let transcript = self.transcripts.as_ref().map(|(logger, server)| {
            let entry = TranscriptEntry {
                server: server.clone(),
                conversation: id.to_string(),
                created_at: message.created_at,
                nick: message.author.nickname.clone(),
                message: message.content.clone(),
            };
            (logger, entry)
        });

        let created_at = message.created_at;
        let result = conversation.timeline_mut().insert(message);
        // Redelivered frames are written once.
        if let Some((logger, entry)) = transcript.filter(|_| result.is_inserted()) {
            logger.log(entry);
        }
        if result.is_inserted() && conversation.meta.last_activity.map_or(true, |t| t < created_at) {
            conversation.meta.last_activity = Some(created_at);
        }

        let render = self.active.contains(&id);
        let unseen = !render && result.is_inserted();
        if unseen {
            conversation.set_unseen(true);
            self.bump(id);
        }
        Ok(RoutedMessage {
            conversation: id,
            result,
            render,
            unseen,
        })
    }

    /// Render new messages of `id` immediately and clear its unseen flag.
    pub fn mark_active(&mut self, id: ConversationId) -> Result<(), ChatError> {
        let conversation = self
            .conversations
            .get_mut(&id)
            .ok_or(ChatError::UnknownConversation(id))?;
        conversation.set_unseen(false);
        self.active.insert(id);
        Ok(())
    }

    /// New messages of `id` raise its unseen flag instead of rendering.
    pub fn mark_inactive(&mut self, id: ConversationId) -> Result<(), ChatError> {
        if !self.conversations.contains_key(&id) {
            return Err(ChatError::UnknownConversation(id));
        }
        self.active.remove(&id);
        Ok(())
    }

    /// Issue a ticket for the next history page of `id`.
    pub fn begin_load(&mut self, id: ConversationId) -> Result<LoadTicket, ChatError> {
        let generation = self.next_generation;
        let conversation = self
            .conversations
            .get_mut(&id)
            .ok_or(ChatError::UnknownConversation(id))?;

        if conversation.state() == LoadState::Loaded && !conversation.timeline().has_more() {
            return Err(ChatError::HistoryExhausted(id));
        }
        let Some((phase, before)) = conversation.start_load(generation) else {
            tracing::debug!(conversation = %id, "history load already in flight");
            return Err(ChatError::ConcurrentLoadRejected(id));
        };
        self.next_generation += 1;

        Ok(LoadTicket {
            conversation: id,
            before,
            phase,
            generation,
        })
    }

    /// Apply (or reject) the response to a ticket. A failure leaves the
    /// timeline untouched and the conversation ready for a retry.
    pub fn complete_load(
        &mut self,
        ticket: LoadTicket,
        result: Result<Vec<Message>, FetchError>,
    ) -> Result<LoadOutcome, ChatError> {
        let Some(conversation) = self
            .conversations
            .get_mut(&ticket.conversation)
            .filter(|c| c.is_pending(ticket.generation))
        else {
            tracing::debug!(
                conversation = %ticket.conversation,
                generation = ticket.generation,
                "stale history response discarded"
            );
            return Ok(LoadOutcome::Discarded);
        };

        match result {
            Err(source) => {
                conversation.abort_load();
                tracing::warn!(conversation = %ticket.conversation, "history fetch failed: {}", source);
                Err(ChatError::HistoryFetchFailed {
                    conversation: ticket.conversation,
                    source,
                })
            }
            Ok(mut page) => {
                for message in &mut page {
                    message.conversation = ticket.conversation;
                }
                let inserted = conversation.timeline_mut().insert_batch(page);
                conversation.finish_load();
                Ok(LoadOutcome::Applied {
                    conversation: ticket.conversation,
                    phase: ticket.phase,
                    inserted,
                    has_more: conversation.timeline().has_more(),
                })
            }
        }
    }

    /// Begin, fetch and complete one page in sequence.
    pub async fn load_history<F>(
        &mut self,
        id: ConversationId,
        fetcher: &F,
        limit: Duration,
    ) -> Result<LoadOutcome, ChatError>
    where
        F: HistoryFetcher + ?Sized,
    {
        let ticket = self.begin_load(id)?;
        let result = fetch_with_timeout(fetcher, &ticket, limit).await;
        self.complete_load(ticket, result)
    }

    pub fn conversation(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.get(&id)
    }

    pub fn current(&self) -> Option<&Conversation> {
        self.current.and_then(|id| self.conversations.get(&id))
    }

    pub fn current_id(&self) -> Option<ConversationId> {
        self.current
    }

    /// Conversation ids, most recently active first.
    pub fn listing(&self) -> &[ConversationId] {
        &self.order
    }

    pub fn is_active(&self, id: ConversationId) -> bool {
        self.active.contains(&id)
    }

    /// Put `id` on screen; the previous conversation stops rendering live.
    pub fn switch_to(&mut self, id: ConversationId) {
        if !self.conversations.contains_key(&id) {
            return;
        }
        if let Some(previous) = self.current.replace(id) {
            if previous != id {
                self.active.remove(&previous);
            }
        }
        self.active.insert(id);
        if let Some(conversation) = self.conversations.get_mut(&id) {
            conversation.set_unseen(false);
        }
    }

    /// Switch to the next conversation in listing order.
    pub fn next_conversation(&mut self) {
        if let Some(next) = self.neighbour(1) {
            self.switch_to(next);
        }
    }

    /// Switch to the previous conversation in listing order.
    pub fn prev_conversation(&mut self) {
        if let Some(prev) = self.neighbour(self.order.len().saturating_sub(1)) {
            self.switch_to(prev);
        }
    }

    /// Append a timestamped line to the system log.
    pub fn log_system(&mut self, line: impl AsRef<str>) {
        let ts = Local::now().format("%H:%M:%S");
        self.system_log.push(format!("[{}] {}", ts, line.as_ref()));
        if self.system_log.len() > MAX_SYSTEM_LOG {
            let excess = self.system_log.len() - MAX_SYSTEM_LOG;
            self.system_log.drain(..excess);
        }
    }

    fn neighbour(&self, step: usize) -> Option<ConversationId> {
        if self.order.is_empty() {
            return None;
        }
        let idx = match self.current {
            Some(current) => {
                let pos = self.order.iter().position(|c| *c == current)?;
                (pos + step) % self.order.len()
            }
            None => 0,
        };
        self.order.get(idx).copied()
    }

    fn bump(&mut self, id: ConversationId) {
        self.order.retain(|c| *c != id);
        self.order.insert(0, id);
    }

    fn sort_listing(&mut self) {
        let conversations = &self.conversations;
        self.order.sort_by_key(|id| {
            std::cmp::Reverse(conversations.get(id).and_then(|c| c.meta.activity()))
        });
    }
}
