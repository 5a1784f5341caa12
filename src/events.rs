//! Backend event processing (live messages, history pages, listings).

use crossbeam_channel::{Receiver, Sender};

use crate::conversation::LoadPhase;
use crate::error::ChatError;
use crate::message::{ConversationId, MessageId};
use crate::protocol::{BackendAction, ChatEvent};
use crate::state::{ChatSession, LoadOutcome};
use crate::timeline::InsertResult;

/// What the front end should redraw after an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    Connected,
    Disconnected(String),
    /// A line for the status area
    Notice(String),
    /// A message landed in the conversation on screen
    Render {
        conversation: ConversationId,
        message: MessageId,
        result: InsertResult,
    },
    /// A conversation off screen has something new
    Unseen(ConversationId),
    Opened(ConversationId),
    HistoryLoaded {
        conversation: ConversationId,
        phase: LoadPhase,
        inserted: usize,
        has_more: bool,
    },
    ListingChanged,
}

/// Process all pending events from the backend.
pub fn process_events(
    event_rx: &Receiver<ChatEvent>,
    session: &mut ChatSession,
    action_tx: &Sender<BackendAction>,
) -> Vec<SessionUpdate> {
    let mut updates = Vec::new();
    // Drain all pending events from the backend
    while let Ok(event) = event_rx.try_recv() {
        updates.extend(apply_event(session, action_tx, event));
    }
    updates
}

/// Apply one backend event to the session.
pub fn apply_event(
    session: &mut ChatSession,
    action_tx: &Sender<BackendAction>,
    event: ChatEvent,
) -> Option<SessionUpdate> {
    match event {
        ChatEvent::Connected => {
            session.is_connected = true;
            session.log_system("✓ Connected");
            Some(SessionUpdate::Connected)
        }

        ChatEvent::Disconnected(reason) => {
            session.is_connected = false;
            session.log_system(format!("✗ Disconnected: {}", reason));
            Some(SessionUpdate::Disconnected(reason))
        }

        ChatEvent::Reconnecting { attempt, delay } => {
            let line = format!(
                "Reconnecting in {:.1}s (attempt {})",
                delay.as_secs_f64(),
                attempt
            );
            session.log_system(&line);
            Some(SessionUpdate::Notice(line))
        }

        ChatEvent::Error(msg) => {
            session.log_system(format!("⚠ Error: {}", msg));
            Some(SessionUpdate::Notice(format!("Error: {}", msg)))
        }

        ChatEvent::Message(message) => {
            let id = message.id;
            match session.on_message(message) {
                Ok(routed) if routed.render && routed.result.is_inserted() => {
                    Some(SessionUpdate::Render {
                        conversation: routed.conversation,
                        message: id,
                        result: routed.result,
                    })
                }
                Ok(routed) if routed.unseen => Some(SessionUpdate::Unseen(routed.conversation)),
                Ok(_) => None,
                Err(_) => {
                    // Most likely a conversation created elsewhere; refresh the listing.
                    let _ = action_tx.send(BackendAction::LoadPresence);
                    None
                }
            }
        }

        ChatEvent::Status { status, detail } => {
            let line = match (status, detail) {
                (Some(s), Some(d)) => format!("Status: {} {}", s, d),
                (Some(s), None) => format!("Status: {}", s),
                (None, Some(d)) => format!("Status: {}", d),
                (None, None) => return None,
            };
            session.log_system(&line);
            Some(SessionUpdate::Notice(line))
        }

        ChatEvent::Log(line) => {
            tracing::debug!(line = %line, "server log");
            session.log_system(format!("server: {}", line));
            None
        }

        ChatEvent::History { ticket, result } => {
            let conversation = ticket.conversation;
            match session.complete_load(ticket, result) {
                Ok(LoadOutcome::Applied {
                    conversation,
                    phase,
                    inserted,
                    has_more,
                }) => Some(SessionUpdate::HistoryLoaded {
                    conversation,
                    phase,
                    inserted,
                    has_more,
                }),
                Ok(LoadOutcome::Discarded) => None,
                Err(e) => {
                    session.log_system(format!("⚠ {}", e));
                    Some(SessionUpdate::Notice(format!(
                        "Could not load history for {}; try /more again",
                        conversation
                    )))
                }
            }
        }

        ChatEvent::Presence(list) => {
            for meta in list {
                session.track(meta);
            }
            Some(SessionUpdate::ListingChanged)
        }

        ChatEvent::ConversationOpened(meta) => {
            let id = session.open(meta);
            if let Err(e) = request_history(session, action_tx, id) {
                tracing::debug!(conversation = %id, "no initial load: {}", e);
            }
            Some(SessionUpdate::Opened(id))
        }
    }
}

/// Ask the backend for the next history page of `id`.
pub fn request_history(
    session: &mut ChatSession,
    action_tx: &Sender<BackendAction>,
    id: ConversationId,
) -> Result<(), ChatError> {
    let ticket = session.begin_load(id)?;
    if action_tx.send(BackendAction::FetchHistory(ticket.clone())).is_err() {
        // Backend is gone; release the slot so a later attempt is possible.
        let _ = session.complete_load(
            ticket,
            Err(crate::error::FetchError::Http("backend stopped".into())),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationKind, ConversationMeta, LoadState};
    use crate::error::FetchError;
    use crate::message::{Author, Message};
    use chrono::{TimeZone, Utc};
    use crossbeam_channel::unbounded;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn meta(id: u64) -> ConversationMeta {
        ConversationMeta::new(ConversationId(id), ConversationKind::Dm)
    }

    fn msg(id: u64, conversation: u64) -> Message {
        Message::new(
            id,
            ConversationId(conversation),
            Author::new(1, "ana"),
            "hi",
            Utc.with_ymd_and_hms(2021, 3, 1, 10, 0, id as u32 % 60).unwrap(),
        )
    }

    #[test]
    fn test_opened_conversation_requests_initial_history() {
        let mut session = ChatSession::default();
        let (action_tx, action_rx) = unbounded();
        let update = apply_event(&mut session, &action_tx, ChatEvent::ConversationOpened(meta(3)));
        assert_eq!(update, Some(SessionUpdate::Opened(ConversationId(3))));

        match action_rx.try_recv().unwrap() {
            BackendAction::FetchHistory(ticket) => {
                assert_eq!(ticket.conversation, ConversationId(3));
                assert_eq!(ticket.before, None);
                assert_eq!(ticket.phase, LoadPhase::Initial);
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(
            session.conversation(ConversationId(3)).unwrap().state(),
            LoadState::LoadingInitial
        );
    }

    #[test]
    fn test_history_event_is_applied() {
        let mut session = ChatSession::default();
        let (action_tx, action_rx) = unbounded();
        apply_event(&mut session, &action_tx, ChatEvent::ConversationOpened(meta(3)));
        let Ok(BackendAction::FetchHistory(ticket)) = action_rx.try_recv() else {
            panic!("expected a fetch");
        };

        let update = apply_event(
            &mut session,
            &action_tx,
            ChatEvent::History {
                ticket,
                result: Ok(vec![msg(2, 3), msg(1, 3)]),
            },
        );
        assert_eq!(
            update,
            Some(SessionUpdate::HistoryLoaded {
                conversation: ConversationId(3),
                phase: LoadPhase::Initial,
                inserted: 2,
                has_more: false,
            })
        );
    }

    #[test]
    fn test_failed_history_becomes_notice() {
        let mut session = ChatSession::default();
        let (action_tx, action_rx) = unbounded();
        apply_event(&mut session, &action_tx, ChatEvent::ConversationOpened(meta(3)));
        let Ok(BackendAction::FetchHistory(ticket)) = action_rx.try_recv() else {
            panic!("expected a fetch");
        };
        let update = apply_event(
            &mut session,
            &action_tx,
            ChatEvent::History {
                ticket,
                result: Err(FetchError::Timeout(Duration::from_secs(10))),
            },
        );
        assert!(matches!(update, Some(SessionUpdate::Notice(_))));
        // The slot is free again.
        request_history(&mut session, &action_tx, ConversationId(3)).unwrap();
    }

    #[test]
    fn test_unknown_message_refreshes_listing() {
        let mut session = ChatSession::default();
        let (action_tx, action_rx) = unbounded();
        assert_eq!(apply_event(&mut session, &action_tx, ChatEvent::Message(msg(1, 9))), None);
        assert!(matches!(action_rx.try_recv(), Ok(BackendAction::LoadPresence)));
    }

    #[test]
    fn test_message_routing_updates() {
        let mut session = ChatSession::default();
        let (action_tx, _action_rx) = unbounded();
        session.open(meta(1));
        session.track(meta(2));

        assert_eq!(
            apply_event(&mut session, &action_tx, ChatEvent::Message(msg(10, 1))),
            Some(SessionUpdate::Render {
                conversation: ConversationId(1),
                message: MessageId(10),
                result: InsertResult::NewBlock,
            })
        );
        assert_eq!(
            apply_event(&mut session, &action_tx, ChatEvent::Message(msg(11, 2))),
            Some(SessionUpdate::Unseen(ConversationId(2)))
        );
        // Duplicates redraw nothing.
        assert_eq!(
            apply_event(&mut session, &action_tx, ChatEvent::Message(msg(10, 1))),
            None
        );
    }

    #[test]
    fn test_process_events_drains_channel() {
        let mut session = ChatSession::default();
        let (action_tx, _action_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        event_tx.send(ChatEvent::Connected).unwrap();
        event_tx.send(ChatEvent::Presence(vec![meta(1), meta(2)])).unwrap();
        event_tx.send(ChatEvent::Disconnected("bye".into())).unwrap();

        let updates = process_events(&event_rx, &mut session, &action_tx);
        assert_eq!(
            updates,
            vec![
                SessionUpdate::Connected,
                SessionUpdate::ListingChanged,
                SessionUpdate::Disconnected("bye".into()),
            ]
        );
        assert!(!session.is_connected);
        assert_eq!(session.listing().len(), 2);
        assert_eq!(session.system_log.len(), 2);
    }
}
