//! In-memory broker used by the integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_stomp_chat::common::{ChatEvent, ChatMessage, ConnectionEvent, ConnectionState};
use rust_stomp_chat::error::{HistoryError, HistoryResult, TransportError};
use rust_stomp_chat::history::{HistorySource, Timeline};
use rust_stomp_chat::network::codec::{Inbound, StompCommand, StompFrame, topic_for};
use rust_stomp_chat::network::transport::Outbound;
use rust_stomp_chat::network::{Transport, TransportEvent, TransportSession};
use tokio::sync::{mpsc, oneshot};

pub const BROKER_URL: &str = "ws://broker.test/ws";

/// Transport handing every opened session to the paired [`MockBroker`].
pub struct MockTransport {
    connections: mpsc::UnboundedSender<MockConnection>,
    refusals: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

pub struct MockBroker {
    connections: mpsc::UnboundedReceiver<MockConnection>,
    refusals: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
}

pub fn mock_transport() -> (MockTransport, MockBroker) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refusals = Arc::new(AtomicUsize::new(0));
    let opens = Arc::new(AtomicUsize::new(0));
    (
        MockTransport {
            connections: tx,
            refusals: Arc::clone(&refusals),
            opens: Arc::clone(&opens),
        },
        MockBroker {
            connections: rx,
            refusals,
            opens,
        },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<TransportSession, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectFailed {
                url: url.to_string(),
                message: "connection refused".to_string(),
            });
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        self.connections
            .send(MockConnection {
                outbound: outbound_rx,
                inbound: inbound_tx,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(TransportSession::new(outbound_tx, inbound_rx))
    }
}

impl MockBroker {
    pub async fn next_connection(&mut self) -> MockConnection {
        self.connections
            .recv()
            .await
            .expect("transport dropped")
    }

    pub fn try_next_connection(&mut self) -> Option<MockConnection> {
        self.connections.try_recv().ok()
    }

    /// Fail the next `count` open attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refusals.store(count, Ordering::SeqCst);
    }

    /// Open attempts so far, refused ones included.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

/// Broker side of one session. Dropping it reads as an abnormal closure on
/// the client side.
pub struct MockConnection {
    outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
}

impl MockConnection {
    pub async fn next_outbound(&mut self) -> Outbound {
        self.outbound.recv().await.expect("client session dropped")
    }

    /// Next STOMP frame written by the client, skipping heartbeats.
    pub async fn next_frame(&mut self) -> StompFrame {
        loop {
            match self.next_outbound().await {
                Outbound::Text(text) => {
                    if let Some(frame) = parse(&text) {
                        return frame;
                    }
                }
                Outbound::Close { code, reason } => {
                    panic!("expected a frame, client closed with {code}: {reason}")
                }
            }
        }
    }

    pub fn try_next_frame(&mut self) -> Option<StompFrame> {
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Outbound::Text(text) = outbound {
                if let Some(frame) = parse(&text) {
                    return Some(frame);
                }
            }
        }
        None
    }

    pub async fn expect_frame(&mut self, command: StompCommand) -> StompFrame {
        let frame = self.next_frame().await;
        assert_eq!(frame.command, command, "unexpected frame {frame:?}");
        frame
    }

    pub async fn expect_connect(&mut self) -> StompFrame {
        self.expect_frame(StompCommand::Connect).await
    }

    /// Complete the handshake with heartbeats disabled.
    pub async fn accept(&mut self) -> StompFrame {
        self.accept_with_heartbeat("0,0").await
    }

    pub async fn accept_with_heartbeat(&mut self, heart_beat: &str) -> StompFrame {
        let connect = self.expect_connect().await;
        self.send_frame(
            &StompFrame::new(StompCommand::Connected)
                .header("version", "1.2")
                .header("heart-beat", heart_beat),
        );
        connect
    }

    pub fn send_frame(&self, frame: &StompFrame) {
        self.send_raw(frame.encode());
    }

    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.inbound.send(TransportEvent::Text(text.into()));
    }

    /// Publish `message` on its room topic.
    pub fn deliver(&self, message: &ChatMessage) {
        let body = serde_json::to_string(message).expect("serialize message");
        self.send_frame(
            &StompFrame::new(StompCommand::Message)
                .header("destination", topic_for(&message.room_id))
                .header("subscription", format!("sub-{}", message.room_id))
                .header("message-id", message.id.clone().unwrap_or_default())
                .with_body(body),
        );
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.inbound.send(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        });
    }
}

fn parse(text: &str) -> Option<StompFrame> {
    match StompFrame::decode(text).expect("client wrote a malformed frame") {
        Inbound::Heartbeat => None,
        Inbound::Frame(frame) => Some(frame),
    }
}

/// Next state transition, skipping messages and diagnostics.
pub async fn next_state(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionState {
    loop {
        match events.recv().await.expect("connection task stopped") {
            ConnectionEvent::StateChanged(state) => return state,
            _ => continue,
        }
    }
}

/// Wait for a timeline update satisfying `accept`.
pub async fn timeline_where<F>(events: &mut mpsc::UnboundedReceiver<ChatEvent>, accept: F) -> Timeline
where
    F: Fn(&Timeline) -> bool,
{
    loop {
        if let ChatEvent::TimelineUpdated(timeline) = events.recv().await.expect("chat task stopped")
        {
            if accept(&timeline) {
                return timeline;
            }
        }
    }
}

pub fn contents(timeline: &Timeline) -> Vec<String> {
    timeline.messages().map(|m| m.content.clone()).collect()
}

/// History source answering every fetch with the same result.
pub struct StaticHistory {
    messages: Vec<ChatMessage>,
    status: Option<u16>,
}

impl StaticHistory {
    pub fn with(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            status: None,
        }
    }

    pub fn empty() -> Self {
        Self::with(Vec::new())
    }

    pub fn failing(status: u16) -> Self {
        Self {
            messages: Vec::new(),
            status: Some(status),
        }
    }
}

#[async_trait]
impl HistorySource for StaticHistory {
    async fn fetch_history(&self, room_id: &str) -> HistoryResult<Vec<ChatMessage>> {
        match self.status {
            Some(status) => Err(HistoryError::Status { status }),
            None => Ok(self
                .messages
                .iter()
                .filter(|m| m.room_id == room_id)
                .cloned()
                .collect()),
        }
    }
}

/// History source that answers once the test releases it.
pub struct GatedHistory {
    gate: Mutex<Option<oneshot::Receiver<Vec<ChatMessage>>>>,
}

impl GatedHistory {
    pub fn new() -> (Self, oneshot::Sender<Vec<ChatMessage>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                gate: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl HistorySource for GatedHistory {
    async fn fetch_history(&self, _room_id: &str) -> HistoryResult<Vec<ChatMessage>> {
        let gate = self.gate.lock().unwrap().take();
        match gate {
            Some(gate) => gate
                .await
                .map_err(|_| HistoryError::Unavailable("gate dropped".to_string())),
            None => Ok(Vec::new()),
        }
    }
}
