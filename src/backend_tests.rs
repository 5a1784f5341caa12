//! Backend loop tests against in-memory sockets and a scripted REST API

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backend::{run_backend, run_loop, Connector, LoopConfig, ReconnectPolicy, Transport};
use crate::config::Settings;
use crate::conversation::{ConversationKind, ConversationMeta, LoadPhase, LoadTicket};
use crate::error::{FetchError, TransportError};
use crate::history::testing::ScriptedApi;
use crate::message::{Author, ConversationId, Message, MessageId};
use crate::protocol::{BackendAction, ChatEvent, ConversationRef, JoinTarget};

struct MemoryTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outbound
            .send(text)
            .map_err(|_| TransportError::Closed("peer dropped".into()))
    }

    async fn next_text(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }
}

/// Server side of one in-memory socket. Dropping `to_client` closes it.
struct ServerEnd {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    async fn next_frame(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client side closed")
    }
}

/// Hands out queued sockets; refuses once the queue is empty.
#[derive(Default)]
struct MemoryConnector {
    sockets: Mutex<VecDeque<MemoryTransport>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    fn socket(&self) -> ServerEnd {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.sockets
            .lock()
            .unwrap()
            .push_back(MemoryTransport { inbound, outbound });
        ServerEnd {
            to_client,
            from_client,
        }
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.sockets.lock().unwrap().pop_front();
        match next {
            Some(t) => Ok(Box::new(t)),
            None => Err(TransportError::Closed("connection refused".into())),
        }
    }
}

fn fast_policy(max_attempts: Option<u32>) -> LoopConfig {
    LoopConfig {
        reconnect: ReconnectPolicy {
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
            max_attempts,
        },
        history_timeout: Duration::from_millis(200),
    }
}

struct Harness {
    action_tx: Sender<BackendAction>,
    event_rx: Receiver<ChatEvent>,
    handle: JoinHandle<()>,
}

impl Harness {
    fn start(connector: Arc<MemoryConnector>, api: Arc<ScriptedApi>, config: LoopConfig) -> Self {
        let (action_tx, action_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let handle = tokio::spawn(run_loop(connector, api, config, action_rx, event_tx));
        Self {
            action_tx,
            event_rx,
            handle,
        }
    }

    fn send(&self, action: BackendAction) {
        self.action_tx.send(action).unwrap();
    }

    /// Wait for the first event matching `pred`, skipping the others.
    async fn expect(&self, pred: impl Fn(&ChatEvent) -> bool) -> ChatEvent {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            while let Ok(event) = self.event_rx.try_recv() {
                if pred(&event) {
                    return event;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for event");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn shutdown(self) {
        self.send(BackendAction::Shutdown);
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("backend loop did not stop")
            .unwrap();
    }
}

fn message_frame(id: u64, conversation: u64) -> String {
    serde_json::json!({
        "type": "message",
        "message": {
            "id": id,
            "conversation": conversation,
            "creation": "2021-03-01T10:00:00Z",
            "content": "olá",
            "author": {"id": 1, "nickname": "ana"}
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_joins_replayed_after_reconnect() {
    let connector = Arc::new(MemoryConnector::default());
    let mut first = connector.socket();
    let mut second = connector.socket();
    let backend = Harness::start(connector.clone(), Arc::new(ScriptedApi::new()), fast_policy(None));

    backend.send(BackendAction::Connect);
    backend.send(BackendAction::Join(JoinTarget::All));
    backend.send(BackendAction::Join(JoinTarget::Conversation(ConversationId(3))));

    backend.expect(|e| matches!(e, ChatEvent::Connected)).await;
    let expected = r#"[{"type":"join","conversation":"__all__"},{"type":"join","conversation":3}]"#;
    assert_eq!(first.next_frame().await, expected);

    // Server goes away.
    drop(first.to_client);
    backend
        .expect(|e| matches!(e, ChatEvent::Disconnected(reason) if reason == "Connection closed by server"))
        .await;
    let reconnecting = backend
        .expect(|e| matches!(e, ChatEvent::Reconnecting { .. }))
        .await;
    assert!(matches!(
        reconnecting,
        ChatEvent::Reconnecting { attempt: 1, delay } if delay == Duration::from_millis(10)
    ));

    backend.expect(|e| matches!(e, ChatEvent::Connected)).await;
    assert_eq!(second.next_frame().await, expected);
    assert_eq!(connector.attempts(), 2);

    backend.shutdown().await;
}

#[tokio::test]
async fn test_inbound_frames_become_events() {
    let connector = Arc::new(MemoryConnector::default());
    let server = connector.socket();
    let backend = Harness::start(connector, Arc::new(ScriptedApi::new()), fast_policy(None));
    backend.send(BackendAction::Connect);
    backend.expect(|e| matches!(e, ChatEvent::Connected)).await;

    server.to_client.send(message_frame(12, 3)).unwrap();
    server.to_client.send("garbage".into()).unwrap();
    server.to_client.send(r#"{"error":"Invalid request"}"#.into()).unwrap();

    match backend.expect(|e| matches!(e, ChatEvent::Message(_))).await {
        ChatEvent::Message(message) => {
            assert_eq!(message.id, MessageId(12));
            assert_eq!(message.conversation, ConversationId(3));
        }
        _ => unreachable!(),
    }
    backend
        .expect(|e| matches!(e, ChatEvent::Error(text) if text.starts_with("Unrecognised frame")))
        .await;
    backend
        .expect(|e| matches!(e, ChatEvent::Error(text) if text == "Server error: Invalid request"))
        .await;

    backend.shutdown().await;
}

#[tokio::test]
async fn test_send_is_validated_and_encoded() {
    let connector = Arc::new(MemoryConnector::default());
    let mut server = connector.socket();
    let backend = Harness::start(connector, Arc::new(ScriptedApi::new()), fast_policy(None));
    backend.send(BackendAction::Connect);
    backend.expect(|e| matches!(e, ChatEvent::Connected)).await;

    backend.send(BackendAction::Send {
        conversation: ConversationId(4),
        content: "   ".into(),
    });
    backend
        .expect(|e| matches!(e, ChatEvent::Error(text) if text.contains("empty")))
        .await;

    backend.send(BackendAction::Send {
        conversation: ConversationId(4),
        content: "bom dia\0  ".into(),
    });
    assert_eq!(
        server.next_frame().await,
        r#"[{"type":"send","conversation":4,"message":"bom dia"}]"#
    );

    backend.shutdown().await;
}

#[tokio::test]
async fn test_send_without_connection_reports_error() {
    let connector = Arc::new(MemoryConnector::default());
    let backend = Harness::start(connector, Arc::new(ScriptedApi::new()), fast_policy(None));
    backend.send(BackendAction::Send {
        conversation: ConversationId(4),
        content: "hi".into(),
    });
    backend
        .expect(|e| matches!(e, ChatEvent::Error(text) if text == "Not connected"))
        .await;
    backend.shutdown().await;
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let connector = Arc::new(MemoryConnector::default());
    let backend = Harness::start(connector.clone(), Arc::new(ScriptedApi::new()), fast_policy(Some(2)));
    backend.send(BackendAction::Connect);

    backend
        .expect(|e| matches!(e, ChatEvent::Reconnecting { attempt: 2, .. }))
        .await;
    backend
        .expect(|e| matches!(e, ChatEvent::Error(text) if text.starts_with("Giving up after 2")))
        .await;
    // Initial attempt plus two retries, then nothing more.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(connector.attempts(), 3);

    backend.shutdown().await;
}

#[tokio::test]
async fn test_user_disconnect_stops_reconnecting() {
    let connector = Arc::new(MemoryConnector::default());
    let _server = connector.socket();
    let backend = Harness::start(connector.clone(), Arc::new(ScriptedApi::new()), fast_policy(None));
    backend.send(BackendAction::Connect);
    backend.expect(|e| matches!(e, ChatEvent::Connected)).await;

    backend.send(BackendAction::Disconnect);
    backend
        .expect(|e| matches!(e, ChatEvent::Disconnected(reason) if reason == "User disconnected"))
        .await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(connector.attempts(), 1);

    backend.shutdown().await;
}

#[tokio::test]
async fn test_history_round_trip() {
    let api = Arc::new(ScriptedApi::new());
    let page = vec![Message::new(
        39,
        ConversationId(3),
        Author::new(1, "ana"),
        "older",
        Utc.with_ymd_and_hms(2021, 3, 1, 9, 0, 0).unwrap(),
    )];
    api.push_page(Ok(page.clone()));
    let backend = Harness::start(Arc::new(MemoryConnector::default()), api.clone(), fast_policy(None));

    let ticket = LoadTicket {
        conversation: ConversationId(3),
        before: Some(MessageId(40)),
        phase: LoadPhase::More,
        generation: 7,
    };
    backend.send(BackendAction::FetchHistory(ticket.clone()));

    match backend.expect(|e| matches!(e, ChatEvent::History { .. })).await {
        ChatEvent::History {
            ticket: returned,
            result,
        } => {
            assert_eq!(returned, ticket);
            assert_eq!(result, Ok(page));
        }
        _ => unreachable!(),
    }
    assert_eq!(api.requests(), vec![(ConversationId(3), Some(MessageId(40)))]);

    backend.shutdown().await;
}

#[tokio::test]
async fn test_history_timeout_is_reported() {
    let api = Arc::new(ScriptedApi::with_delay(Duration::from_secs(5)));
    let backend = Harness::start(Arc::new(MemoryConnector::default()), api, fast_policy(None));
    let ticket = LoadTicket {
        conversation: ConversationId(3),
        before: None,
        phase: LoadPhase::Initial,
        generation: 1,
    };
    backend.send(BackendAction::FetchHistory(ticket));

    match backend.expect(|e| matches!(e, ChatEvent::History { .. })).await {
        ChatEvent::History { result, .. } => {
            assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(200))));
        }
        _ => unreachable!(),
    }
    backend.shutdown().await;
}

#[tokio::test]
async fn test_presence_and_open_conversation() {
    let api = Arc::new(ScriptedApi::new());
    api.push_conversation(ConversationMeta::new(ConversationId(8), ConversationKind::Room));
    let backend = Harness::start(Arc::new(MemoryConnector::default()), api, fast_policy(None));

    backend.send(BackendAction::LoadPresence);
    match backend.expect(|e| matches!(e, ChatEvent::Presence(_))).await {
        ChatEvent::Presence(list) => assert_eq!(list.len(), 1),
        _ => unreachable!(),
    }

    backend.send(BackendAction::OpenConversation(ConversationRef::Conversation(ConversationId(8))));
    match backend.expect(|e| matches!(e, ChatEvent::ConversationOpened(_))).await {
        ChatEvent::ConversationOpened(meta) => assert_eq!(meta.id, ConversationId(8)),
        _ => unreachable!(),
    }

    backend.send(BackendAction::OpenConversation(ConversationRef::Conversation(ConversationId(9))));
    backend
        .expect(|e| matches!(e, ChatEvent::Error(text) if text.starts_with("Could not open 9")))
        .await;

    backend.shutdown().await;
}

#[tokio::test]
async fn test_loop_exits_when_front_end_drops() {
    let backend = Harness::start(
        Arc::new(MemoryConnector::default()),
        Arc::new(ScriptedApi::new()),
        fast_policy(None),
    );
    drop(backend.action_tx);
    tokio::time::timeout(Duration::from_secs(5), backend.handle)
        .await
        .expect("backend loop did not stop")
        .unwrap();
}

#[test]
fn test_backend_thread_reports_bad_server() {
    let (_action_tx, action_rx) = unbounded::<BackendAction>();
    let (event_tx, event_rx) = unbounded::<ChatEvent>();
    let mut settings = Settings::default();
    settings.server = "ftp://portal.example.edu".into();

    let handle = std::thread::spawn(move || run_backend(settings, action_rx, event_tx));
    let event = event_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(event, ChatEvent::Error(text) if text.contains("unsupported scheme")));
    handle.join().unwrap();
}
