use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::time::{timeout, Instant};

use super::connection::{Connector, Transport, WsConnector};
use super::handlers::{decode_frame, encode_commands};
use super::reconnect::{Backoff, ReconnectPolicy};
use crate::config::Settings;
use crate::history::{fetch_with_timeout, ChatApi, HttpChatApi};
use crate::protocol::{BackendAction, ChatEvent, JoinTarget, OutboundCommand};
use crate::validation::{sanitize_message, validate_message};

/// How long one socket read may block before actions are checked again.
const READ_POLL: Duration = Duration::from_millis(50);

/// Tunables for `run_loop`.
#[derive(Clone, Debug, PartialEq)]
pub struct LoopConfig {
    pub reconnect: ReconnectPolicy,
    pub history_timeout: Duration,
}

impl From<&Settings> for LoopConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            reconnect: settings.reconnect.clone(),
            history_timeout: settings.history_timeout(),
        }
    }
}

/// Backend thread entry point: builds the runtime, the socket connector and
/// the REST client from `settings`, then runs until `Shutdown`.
pub fn run_backend(settings: Settings, action_rx: Receiver<BackendAction>, event_tx: Sender<ChatEvent>) {
    // Create a Tokio runtime for this thread
    let rt = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            let _ = event_tx.send(ChatEvent::Error(format!("Failed to create Tokio runtime: {}", e)));
            return;
        }
    };

    let connector = match settings.websocket_url() {
        Ok(url) => match WsConnector::new(url, settings.session_cookie.clone()) {
            Ok(c) => c,
            Err(e) => {
                let _ = event_tx.send(ChatEvent::Error(e.to_string()));
                return;
            }
        },
        Err(e) => {
            let _ = event_tx.send(ChatEvent::Error(e.to_string()));
            return;
        }
    };
    let api = match settings.api_url() {
        Ok(base) => match HttpChatApi::new(base, settings.session_cookie.clone()) {
            Ok(api) => api,
            Err(e) => {
                let _ = event_tx.send(ChatEvent::Error(format!("Failed to build HTTP client: {}", e)));
                return;
            }
        },
        Err(e) => {
            let _ = event_tx.send(ChatEvent::Error(e.to_string()));
            return;
        }
    };

    tracing::info!(url = %connector.url(), "chat backend started");
    rt.block_on(run_loop(
        Arc::new(connector),
        Arc::new(api),
        LoopConfig::from(&settings),
        action_rx,
        event_tx,
    ));
    tracing::info!("chat backend stopped");
}

/// The backend event loop: drains front-end actions, keeps the socket open
/// while a connection is wanted, and turns socket frames into events.
///
/// Subscriptions made with `Join` are remembered and re-sent after every
/// reconnection. REST calls run as separate tasks so a slow history page
/// never stalls the socket.
pub async fn run_loop(
    connector: Arc<dyn Connector>,
    api: Arc<dyn ChatApi>,
    config: LoopConfig,
    action_rx: Receiver<BackendAction>,
    event_tx: Sender<ChatEvent>,
) {
    let mut socket = SocketState::new(connector, config.reconnect.clone(), event_tx.clone());

    loop {
        // Check for actions from the front end (non-blocking)
        loop {
            let action = match action_rx.try_recv() {
                Ok(action) => action,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::debug!("front end went away");
                    return;
                }
            };
            match action {
                BackendAction::Connect => socket.want_connection(),
                BackendAction::Disconnect => socket.disconnect(),
                BackendAction::Join(target) => socket.join(target).await,
                BackendAction::Send { conversation, content } => {
                    let content = sanitize_message(&content);
                    if let Err(e) = validate_message(&content) {
                        let _ = event_tx.send(ChatEvent::Error(e.to_string()));
                        continue;
                    }
                    socket
                        .send(&[OutboundCommand::Send {
                            conversation,
                            message: content,
                        }])
                        .await;
                }
                BackendAction::FetchHistory(ticket) => {
                    let api = Arc::clone(&api);
                    let tx = event_tx.clone();
                    let limit = config.history_timeout;
                    tokio::spawn(async move {
                        let result = fetch_with_timeout(api.as_ref(), &ticket, limit).await;
                        let _ = tx.send(ChatEvent::History { ticket, result });
                    });
                }
                BackendAction::LoadPresence => {
                    let api = Arc::clone(&api);
                    let tx = event_tx.clone();
                    tokio::spawn(async move {
                        let event = match api.presence().await {
                            Ok(list) => ChatEvent::Presence(list),
                            Err(e) => ChatEvent::Error(format!("Failed to list conversations: {}", e)),
                        };
                        let _ = tx.send(event);
                    });
                }
                BackendAction::OpenConversation(reference) => {
                    let api = Arc::clone(&api);
                    let tx = event_tx.clone();
                    tokio::spawn(async move {
                        let event = match api.join(&reference).await {
                            Ok(meta) => ChatEvent::ConversationOpened(meta),
                            Err(e) => ChatEvent::Error(format!("Could not open {}: {}", reference, e)),
                        };
                        let _ = tx.send(event);
                    });
                }
                BackendAction::Shutdown => {
                    socket.close();
                    return;
                }
            }
        }

        socket.maintain().await;

        // Read from the network (with short timeout so we can check for actions)
        if let Some(t) = socket.transport.as_mut() {
            let read = timeout(READ_POLL, t.next_text()).await;
            match read {
                Ok(Some(Ok(text))) => {
                    let _ = event_tx.send(decode_frame(&text));
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("socket read failed: {}", e);
                    socket.lost(format!("Read error: {}", e));
                }
                Ok(None) => socket.lost("Connection closed by server".into()),
                Err(_) => {
                    // Timeout - this is normal, just loop
                }
            }
        } else {
            // No connection, sleep a bit to avoid busy-looping
            tokio::time::sleep(READ_POLL).await;
        }
    }
}

/// Socket ownership plus everything needed to restore it.
struct SocketState {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    event_tx: Sender<ChatEvent>,
    transport: Option<Box<dyn Transport>>,
    /// Whether the front end wants the socket open.
    wanted: bool,
    /// Subscriptions to replay after a reconnection.
    joins: BTreeSet<JoinTarget>,
    backoff: Backoff,
    next_attempt: Option<Instant>,
}

impl SocketState {
    fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy, event_tx: Sender<ChatEvent>) -> Self {
        Self {
            connector,
            policy,
            event_tx,
            transport: None,
            wanted: false,
            joins: BTreeSet::new(),
            backoff: Backoff::default(),
            next_attempt: None,
        }
    }

    fn want_connection(&mut self) {
        self.wanted = true;
        if self.transport.is_none() {
            self.backoff.reset();
            self.next_attempt = None;
        }
    }

    /// Connect when wanted, disconnected and the backoff delay has passed.
    async fn maintain(&mut self) {
        if !self.wanted || self.transport.is_some() {
            return;
        }
        if self.next_attempt.is_some_and(|at| Instant::now() < at) {
            return;
        }

        match self.connector.connect().await {
            Ok(transport) => {
                self.transport = Some(transport);
                self.backoff.reset();
                self.next_attempt = None;
                tracing::info!("chat socket connected");
                let _ = self.event_tx.send(ChatEvent::Connected);

                if !self.joins.is_empty() {
                    let replay: Vec<OutboundCommand> = self
                        .joins
                        .iter()
                        .map(|target| OutboundCommand::Join { conversation: *target })
                        .collect();
                    tracing::debug!(count = replay.len(), "replaying subscriptions");
                    self.send(&replay).await;
                }
            }
            Err(e) => {
                tracing::warn!("connection attempt failed: {}", e);
                let _ = self.event_tx.send(ChatEvent::Error(format!("Connection failed: {}", e)));
                self.schedule_retry();
            }
        }
    }

    /// The socket dropped on its own: report it and plan a reconnection.
    fn lost(&mut self, reason: String) {
        self.transport = None;
        let _ = self.event_tx.send(ChatEvent::Disconnected(reason));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if !self.wanted {
            return;
        }
        match self.backoff.next_delay(&self.policy) {
            Some((attempt, delay)) => {
                self.next_attempt = Some(Instant::now() + delay);
                let _ = self.event_tx.send(ChatEvent::Reconnecting { attempt, delay });
            }
            None => {
                self.wanted = false;
                self.next_attempt = None;
                let _ = self.event_tx.send(ChatEvent::Error(format!(
                    "Giving up after {} reconnection attempts",
                    self.backoff.attempt().saturating_sub(1)
                )));
            }
        }
    }

    async fn join(&mut self, target: JoinTarget) {
        self.joins.insert(target);
        if self.transport.is_some() {
            self.send(&[OutboundCommand::Join { conversation: target }]).await;
        }
    }

    async fn send(&mut self, commands: &[OutboundCommand]) {
        let Some(t) = self.transport.as_mut() else {
            let _ = self.event_tx.send(ChatEvent::Error("Not connected".into()));
            return;
        };
        let text = match encode_commands(commands) {
            Ok(text) => text,
            Err(e) => {
                let _ = self.event_tx.send(ChatEvent::Error(format!("Failed to encode command: {}", e)));
                return;
            }
        };
        if let Err(e) = t.send_text(text).await {
            tracing::warn!("socket write failed: {}", e);
            self.lost(format!("Write error: {}", e));
        }
    }

    fn disconnect(&mut self) {
        self.close();
        let _ = self.event_tx.send(ChatEvent::Disconnected("User disconnected".into()));
    }

    fn close(&mut self) {
        self.wanted = false;
        self.next_attempt = None;
        self.transport = None;
    }
}
