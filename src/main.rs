//! portal-chat - a terminal client for the portal chat
//!
//! Architecture:
//! - Main thread: owns the session, reads commands and prints conversations
//! - Input thread: blocking stdin reader
//! - Backend thread: runs a Tokio runtime for socket and REST I/O
//! - Communication via crossbeam channels (lock-free, sync-safe)

use std::error::Error;
use std::io::{self, BufRead};
use std::thread;

use chrono::{FixedOffset, Utc};
use crossbeam_channel::{select, unbounded};

use portal_chat::backend::run_backend;
use portal_chat::commands::{handle_input, InputOutcome};
use portal_chat::config::{load_settings, save_settings, Settings};
use portal_chat::events::{apply_event, SessionUpdate};
use portal_chat::format::{block_header, message_line, render_block};
use portal_chat::logging::init_tracing;
use portal_chat::message::{ConversationId, MessageId};
use portal_chat::protocol::{BackendAction, JoinTarget};
use portal_chat::state::ChatSession;
use portal_chat::timeline::InsertResult;
use portal_chat::validation::parse_conversation_ref;

fn main() -> Result<(), Box<dyn Error>> {
    init_tracing();

    let mut settings = load_settings();
    let offset = settings.grouping_policy()?.offset();
    let mut session = ChatSession::from_settings(&settings)?;

    let (action_tx, action_rx) = unbounded::<BackendAction>();
    let (event_tx, event_rx) = unbounded();
    let (line_tx, line_rx) = unbounded::<String>();

    // Spawn the backend thread
    let backend_settings = settings.clone();
    let backend = thread::Builder::new()
        .name("backend".into())
        .spawn(move || run_backend(backend_settings, action_rx, event_tx))?;

    thread::Builder::new().name("stdin".into()).spawn(move || {
        for line in io::stdin().lock().lines().map_while(Result::ok) {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    })?;

    let _ = action_tx.send(BackendAction::Connect);
    let _ = action_tx.send(BackendAction::Join(JoinTarget::All));
    let _ = action_tx.send(BackendAction::LoadPresence);
    if let Some(reference) = settings.recent.first().and_then(|r| parse_conversation_ref(r).ok()) {
        let _ = action_tx.send(BackendAction::OpenConversation(reference));
    }

    println!("Connecting to {} (type /help for commands)", settings.server);

    loop {
        select! {
            recv(line_rx) -> line => {
                let Ok(line) = line else {
                    // stdin closed
                    let _ = action_tx.send(BackendAction::Shutdown);
                    break;
                };
                let mut out = Vec::new();
                let outcome = handle_input(&line, &mut session, &action_tx, &mut out);
                for l in out {
                    println!("{}", l);
                }
                if outcome == InputOutcome::Quit {
                    break;
                }
            }
            recv(event_rx) -> event => {
                let Ok(event) = event else {
                    tracing::warn!("backend stopped");
                    break;
                };
                if let Some(update) = apply_event(&mut session, &action_tx, event) {
                    show(update, &session, &mut settings, offset);
                }
            }
        }
    }

    if let Err(e) = save_settings(&settings) {
        tracing::warn!("could not save settings: {}", e);
    }
    if backend.join().is_err() {
        tracing::error!("backend thread panicked");
    }
    Ok(())
}

fn show(update: SessionUpdate, session: &ChatSession, settings: &mut Settings, offset: FixedOffset) {
    match update {
        SessionUpdate::Connected => println!("-- connected"),
        SessionUpdate::Disconnected(reason) => println!("-- disconnected: {}", reason),
        SessionUpdate::Notice(line) => println!("-- {}", line),
        SessionUpdate::Render {
            conversation,
            message,
            result,
        } => print_live(session, conversation, message, result, offset),
        SessionUpdate::Unseen(id) => {
            if let Some(conversation) = session.conversation(id) {
                println!("-- new message in {} ({})", conversation.meta.title(None), id);
            }
        }
        SessionUpdate::Opened(id) => {
            settings.remember(&id.to_string());
            if let Some(conversation) = session.conversation(id) {
                println!("== {} ==", conversation.meta.title(None));
            }
        }
        SessionUpdate::HistoryLoaded {
            conversation,
            has_more,
            ..
        } => {
            if session.current_id() == Some(conversation) {
                print_conversation(session, conversation, offset);
                if has_more {
                    println!("-- /more for older messages");
                }
            }
        }
        SessionUpdate::ListingChanged => {
            tracing::debug!(count = session.listing().len(), "listing refreshed");
        }
    }
}

/// Print a live message, or the whole conversation when it reshaped blocks.
fn print_live(
    session: &ChatSession,
    conversation: ConversationId,
    message: MessageId,
    result: InsertResult,
    offset: FixedOffset,
) {
    let Some(timeline) = session.conversation(conversation).map(|c| c.timeline()) else {
        return;
    };
    let Some(block) = timeline.block_of(message) else {
        return;
    };
    let at_end = timeline.latest().map(|m| m.id) == Some(message);

    if result.restructures() || !at_end {
        print_conversation(session, conversation, offset);
        return;
    }
    if result == InsertResult::NewBlock {
        println!("{}", block_header(block, Utc::now(), offset));
    }
    println!("{}", message_line(block.last(), offset));
}

fn print_conversation(session: &ChatSession, id: ConversationId, offset: FixedOffset) {
    let Some(conversation) = session.conversation(id) else {
        return;
    };
    let now = Utc::now();
    println!("== {} ==", conversation.meta.title(None));
    for block in conversation.timeline().blocks() {
        for line in render_block(block, now, offset) {
            println!("{}", line);
        }
    }
}
