//! Front-end command handling (/open, /list, /more, etc.).

use crossbeam_channel::Sender;

use crate::error::ChatError;
use crate::events::request_history;
use crate::format::listing_line;
use crate::protocol::{BackendAction, ConversationRef};
use crate::state::ChatSession;
use crate::validation::{parse_conversation_ref, sanitize_message, validate_message};

const HELP: &str = "Supported commands: /open <id|u_user>, /list, /more, /next, /prev, /close, /quit";

/// A parsed `/` command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Open(ConversationRef),
    List,
    More,
    Next,
    Prev,
    Close,
    Quit,
    Help,
    /// Recognised command with bad arguments; carries the usage line
    Usage(&'static str),
    Unknown(String),
}

/// What the front end does after a line of input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputOutcome {
    Continue,
    Quit,
}

/// Parse a line starting with '/'. Returns `None` for plain text.
pub fn parse_command(input: &str) -> Option<Command> {
    let s = input.trim();
    let cmdline = s.strip_prefix('/')?.trim();
    let mut parts = cmdline.split_whitespace();
    let cmd = parts.next().unwrap_or("").to_lowercase();

    let command = match cmd.as_str() {
        "open" | "o" | "join" => match parts.next().map(parse_conversation_ref) {
            Some(Ok(reference)) => Command::Open(reference),
            _ => Command::Usage("Usage: /open <conversation id | u_<user id>>"),
        },
        "list" | "ls" => Command::List,
        "more" | "m" => Command::More,
        "next" | "n" => Command::Next,
        "prev" => Command::Prev,
        "close" | "c" => Command::Close,
        "quit" | "exit" => Command::Quit,
        "help" | "h" => Command::Help,
        unknown => Command::Unknown(unknown.to_string()),
    };
    Some(command)
}

/// Handle one line of user input. Lines for the user are appended to `out`.
pub fn handle_input(
    input: &str,
    session: &mut ChatSession,
    action_tx: &Sender<BackendAction>,
    out: &mut Vec<String>,
) -> InputOutcome {
    let Some(command) = parse_command(input) else {
        send_to_current(input, session, action_tx, out);
        return InputOutcome::Continue;
    };

    match command {
        Command::Open(reference) => {
            // Already listed conversations switch at once; the server reply refreshes them.
            if let ConversationRef::Conversation(id) = reference {
                session.switch_to(id);
            }
            let _ = action_tx.send(BackendAction::OpenConversation(reference));
            out.push(format!("Opening {}...", reference));
        }
        Command::List => {
            if session.listing().is_empty() {
                out.push("No conversations yet".into());
            }
            for id in session.listing() {
                if let Some(conversation) = session.conversation(*id) {
                    let current = session.current_id() == Some(*id);
                    out.push(listing_line(conversation, current));
                }
            }
        }
        Command::More => match session.current_id() {
            Some(id) => match request_history(session, action_tx, id) {
                Ok(()) => out.push("Loading older messages...".into()),
                Err(ChatError::HistoryExhausted(_)) => out.push("No older messages".into()),
                Err(ChatError::ConcurrentLoadRejected(_)) => out.push("Already loading".into()),
                Err(e) => out.push(e.to_string()),
            },
            None => out.push("No conversation open".into()),
        },
        Command::Next => session.next_conversation(),
        Command::Prev => session.prev_conversation(),
        Command::Close => match session.current_id() {
            Some(id) => {
                session.close(id);
                out.push(format!("Closed {}", id));
            }
            None => out.push("No conversation open".into()),
        },
        Command::Quit => {
            let _ = action_tx.send(BackendAction::Shutdown);
            return InputOutcome::Quit;
        }
        Command::Help => out.push(HELP.into()),
        Command::Usage(usage) => out.push(usage.into()),
        Command::Unknown(cmd) => out.push(format!("Unknown command: /{}", cmd)),
    }
    InputOutcome::Continue
}

fn send_to_current(
    input: &str,
    session: &ChatSession,
    action_tx: &Sender<BackendAction>,
    out: &mut Vec<String>,
) {
    let Some(conversation) = session.current_id() else {
        out.push("Open a conversation first (/open <id>)".into());
        return;
    };
    let content = sanitize_message(input);
    if let Err(e) = validate_message(&content) {
        out.push(e.to_string());
        return;
    }
    let _ = action_tx.send(BackendAction::Send {
        conversation,
        content,
    });
}
