//! Broker connection lifecycle.
//!
//! A [`ConnectionManager`] is a cheap handle to a background task that owns
//! the one live [`TransportSession`] and drives the state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closed
//!                     ^             |
//!                     |             v
//!                     +------- Reconnecting
//! ```
//!
//! Abnormal closures (socket errors, missed heartbeats, connect timeouts, any
//! close code other than 1000) schedule exactly one retry after the fixed
//! reconnect delay. `disconnect()` is terminal until the next `connect()`.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};

use super::codec::{
    self, HEARTBEAT_FRAME, Inbound, StompCommand, StompFrame, negotiate_heartbeat,
    parse_heartbeat,
};
use super::credentials::Credentials;
use super::transport::{NORMAL_CLOSURE, Transport, TransportEvent, TransportSession};
use crate::common::commands::{ConnectionCommand, StateListener};
use crate::common::{ConnectionError, ConnectionEvent, ConnectionState};
use crate::config::ChatConfig;
use crate::error::TransportError;

/// Timing and endpoint settings for one connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub url: String,
    pub reconnect_delay: Duration,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
    pub missed_heartbeats: u32,
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from(&ChatConfig {
            broker_url: url.into(),
            ..ChatConfig::default()
        })
    }
}

impl From<&ChatConfig> for ConnectionConfig {
    fn from(config: &ChatConfig) -> Self {
        Self {
            url: config.broker_url.clone(),
            reconnect_delay: config.reconnect_delay(),
            heartbeat_outgoing: Duration::from_millis(config.heartbeat_outgoing_ms),
            heartbeat_incoming: Duration::from_millis(config.heartbeat_incoming_ms),
            missed_heartbeats: config.missed_heartbeats.max(1),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Handle to a running connection task. Clones share the same task; the
/// task stops once every handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionManager {
    /// Spawn the connection task. Inbound chat messages, state changes and
    /// diagnostics arrive on the returned receiver.
    pub fn spawn<T: Transport>(
        transport: T,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let worker = ConnectionWorker {
            transport: Arc::new(transport),
            config,
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            listeners: Vec::new(),
            credentials: Credentials::anonymous(),
            session: None,
            pending_open: None,
            connect_deadline: None,
            reconnect_at: None,
        };
        tokio::spawn(worker.run());

        (
            Self {
                commands: command_tx,
                state: state_rx,
            },
            event_rx,
        )
    }

    /// Start connecting. No-op while connecting or connected; skips the
    /// remaining delay while waiting to reconnect.
    pub fn connect(&self, credentials: impl Into<Credentials>) {
        self.command(ConnectionCommand::Connect(credentials.into()));
    }

    /// Close deliberately. Cancels any pending attempt or scheduled retry.
    pub fn disconnect(&self) {
        self.command(ConnectionCommand::Disconnect);
    }

    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + 'static,
    {
        self.command(ConnectionCommand::OnStateChange(Box::new(listener)));
    }

    /// Transmit a frame. Returns `false` when not connected.
    pub async fn send(&self, frame: StompFrame) -> bool {
        let (reply, result) = oneshot::channel();
        if self
            .commands
            .send(ConnectionCommand::Send { frame, reply })
            .is_err()
        {
            return false;
        }
        result.await.unwrap_or(false)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn command(&self, command: ConnectionCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Connection task is not running");
        }
    }
}

/// Live session plus the liveness bookkeeping negotiated for it.
struct ActiveSession {
    transport: TransportSession,
    heartbeat_out: Option<Duration>,
    heartbeat_in: Option<Duration>,
    next_heartbeat: Option<Instant>,
    last_inbound: Instant,
}

impl ActiveSession {
    fn handshaking(transport: TransportSession) -> Self {
        Self {
            transport,
            heartbeat_out: None,
            heartbeat_in: None,
            next_heartbeat: None,
            last_inbound: Instant::now(),
        }
    }

    fn liveness_deadline(&self, missed_heartbeats: u32) -> Option<Instant> {
        self.heartbeat_in
            .map(|period| self.last_inbound + period * missed_heartbeats)
    }
}

type OpenFuture = BoxFuture<'static, Result<TransportSession, TransportError>>;

struct ConnectionWorker<T> {
    transport: Arc<T>,
    config: ConnectionConfig,
    commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    listeners: Vec<StateListener>,
    credentials: Credentials,
    session: Option<ActiveSession>,
    pending_open: Option<OpenFuture>,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
}

impl<T: Transport> ConnectionWorker<T> {
    async fn run(mut self) {
        log::debug!("Connection task started for {}", self.config.url);

        loop {
            let connected = self.current_state().is_connected();
            let heartbeat_due = self
                .session
                .as_ref()
                .and_then(|session| session.next_heartbeat)
                .filter(|_| connected);
            let liveness_deadline = self
                .session
                .as_ref()
                .and_then(|session| session.liveness_deadline(self.config.missed_heartbeats))
                .filter(|_| connected);

            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                opened = poll_open(&mut self.pending_open) => {
                    self.pending_open = None;
                    self.handle_opened(opened);
                }
                event = next_transport_event(&mut self.session) => {
                    self.handle_transport_event(event);
                }
                _ = sleep_until_deadline(self.connect_deadline) => {
                    let timeout = self.config.connect_timeout;
                    self.handle_abnormal_closure(format!("connect timeout after {timeout:?}"));
                }
                _ = sleep_until_deadline(liveness_deadline) => {
                    self.handle_abnormal_closure("broker heartbeat missed".to_string());
                }
                _ = sleep_until_deadline(heartbeat_due) => {
                    self.send_heartbeat();
                }
                _ = sleep_until_deadline(self.reconnect_at) => {
                    self.reconnect_at = None;
                    self.begin_connecting();
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.transport.close(NORMAL_CLOSURE, "client shut down");
        }
        log::debug!("Connection task stopped for {}", self.config.url);
    }

    fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect(credentials) => match self.current_state() {
                ConnectionState::Connecting | ConnectionState::Connected => {
                    log::debug!("connect() ignored; already {}", self.current_state());
                }
                ConnectionState::Reconnecting => {
                    log::info!("connect() while waiting to reconnect; retrying now");
                    self.credentials = credentials;
                    self.begin_connecting();
                }
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    self.credentials = credentials;
                    self.begin_connecting();
                }
            },
            ConnectionCommand::Disconnect => self.close_deliberately(),
            ConnectionCommand::Send { frame, reply } => {
                let sent = self.transmit(&frame);
                let _ = reply.send(sent);
            }
            ConnectionCommand::OnStateChange(listener) => self.listeners.push(listener),
        }
    }

    fn transmit(&mut self, frame: &StompFrame) -> bool {
        if !self.current_state().is_connected() {
            log::debug!("Dropping {} frame; not connected", frame.command);
            return false;
        }
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        match session.transport.send(frame.encode()) {
            Ok(()) => {
                log::debug!("Sent {} frame", frame.command);
                true
            }
            Err(err) => {
                log::warn!("Failed to send {} frame: {err}", frame.command);
                false
            }
        }
    }

    fn begin_connecting(&mut self) {
        self.reconnect_at = None;
        self.session = None;
        self.set_state(ConnectionState::Connecting);

        let transport = Arc::clone(&self.transport);
        let url = self.config.url.clone();
        self.connect_deadline = Some(Instant::now() + self.config.connect_timeout);
        self.pending_open = Some(Box::pin(async move { transport.open(&url).await }));
        log::info!("Connecting to {}", self.config.url);
    }

    fn handle_opened(&mut self, opened: Result<TransportSession, TransportError>) {
        let transport = match opened {
            Ok(transport) => transport,
            Err(err) => {
                self.handle_abnormal_closure(err.to_string());
                return;
            }
        };

        // Read on every attempt; the auth collaborator may have refreshed it.
        let token = self.credentials.token();
        let connect = codec::connect_frame(
            host_of(&self.config.url),
            token.as_deref(),
            (
                self.config.heartbeat_outgoing.as_millis() as u64,
                self.config.heartbeat_incoming.as_millis() as u64,
            ),
        );
        if let Err(err) = transport.send(connect.encode()) {
            self.handle_abnormal_closure(format!("failed to send CONNECT: {err}"));
            return;
        }
        self.session = Some(ActiveSession::handshaking(transport));
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text(text) => {
                if let Some(session) = self.session.as_mut() {
                    session.last_inbound = Instant::now();
                }
                match StompFrame::decode(&text) {
                    Ok(Inbound::Heartbeat) => log::trace!("Heartbeat from broker"),
                    Ok(Inbound::Frame(frame)) => self.handle_frame(frame),
                    Err(err) => self.report(format!("dropped malformed frame: {err}"), true),
                }
            }
            TransportEvent::Closed { code, reason } if code == NORMAL_CLOSURE => {
                log::info!("Broker closed the connection normally ({reason})");
                self.session = None;
                self.connect_deadline = None;
                self.set_state(ConnectionState::Closed);
            }
            TransportEvent::Closed { code, reason } => {
                self.handle_abnormal_closure(format!("connection closed with code {code}: {reason}"));
            }
        }
    }

    fn handle_frame(&mut self, frame: StompFrame) {
        match frame.command {
            StompCommand::Connected if self.current_state() == ConnectionState::Connecting => {
                let server = frame
                    .get_header("heart-beat")
                    .and_then(parse_heartbeat)
                    .unwrap_or((0, 0));
                let client = (
                    self.config.heartbeat_outgoing.as_millis() as u64,
                    self.config.heartbeat_incoming.as_millis() as u64,
                );
                let (outgoing, incoming) = negotiate_heartbeat(client, server);
                if let Some(session) = self.session.as_mut() {
                    session.heartbeat_out = outgoing;
                    session.heartbeat_in = incoming;
                    session.next_heartbeat = outgoing.map(|period| Instant::now() + period);
                    session.last_inbound = Instant::now();
                }
                self.connect_deadline = None;
                log::info!(
                    "Connected to {} (heartbeat out={outgoing:?}, in={incoming:?})",
                    self.config.url
                );
                self.set_state(ConnectionState::Connected);
            }
            StompCommand::Message => match codec::decode(&frame) {
                Ok(message) => {
                    let destination = frame
                        .get_header("destination")
                        .unwrap_or_default()
                        .to_string();
                    let _ = self.events.send(ConnectionEvent::Message {
                        destination,
                        message,
                    });
                }
                Err(err) => self.report(format!("dropped undecodable message: {err}"), true),
            },
            StompCommand::Error => {
                let summary = frame.get_header("message").unwrap_or("broker error");
                let detail = format!("{summary}: {}", frame.body.trim());
                if self.current_state() == ConnectionState::Connecting {
                    self.handle_abnormal_closure(format!("broker rejected CONNECT ({detail})"));
                } else {
                    self.report(format!("broker error ({detail})"), true);
                }
            }
            StompCommand::Receipt => {
                log::debug!("Receipt {:?}", frame.get_header("receipt-id"));
            }
            other => log::debug!("Ignoring unexpected {other} frame"),
        }
    }

    fn send_heartbeat(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(err) = session.transport.send(HEARTBEAT_FRAME) {
            log::debug!("Heartbeat not sent: {err}");
        }
        session.next_heartbeat = session
            .heartbeat_out
            .map(|period| Instant::now() + period);
    }

    fn handle_abnormal_closure(&mut self, reason: String) {
        self.session = None;
        self.pending_open = None;
        self.connect_deadline = None;
        self.report(reason.clone(), true);

        let delay = self.config.reconnect_delay;
        log::warn!("Connection lost ({reason}); reconnecting in {delay:?}");
        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn close_deliberately(&mut self) {
        self.pending_open = None;
        self.connect_deadline = None;
        self.reconnect_at = None;

        if let Some(session) = self.session.take() {
            if self.current_state().is_connected() {
                let _ = session.transport.send(codec::disconnect_frame().encode());
            }
            session.transport.close(NORMAL_CLOSURE, "client disconnect");
        }
        if self.current_state() != ConnectionState::Closed {
            log::info!("Disconnected from {}", self.config.url);
            self.set_state(ConnectionState::Closed);
        }
    }

    fn report(&self, message: String, recoverable: bool) {
        log::warn!("{message}");
        let _ = self
            .events
            .send(ConnectionEvent::Error(ConnectionError::new(message, recoverable)));
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, next: ConnectionState) {
        let previous = self.current_state();
        if previous == next {
            return;
        }
        log::debug!("Connection state {previous} -> {next}");
        self.state.send_replace(next);
        let _ = self.events.send(ConnectionEvent::StateChanged(next));
        for listener in &self.listeners {
            listener(next);
        }
    }
}

async fn poll_open(pending_open: &mut Option<OpenFuture>) -> Result<TransportSession, TransportError> {
    match pending_open {
        Some(open) => open.await,
        None => pending().await,
    }
}

async fn next_transport_event(session: &mut Option<ActiveSession>) -> TransportEvent {
    match session {
        Some(session) => session.transport.next_event().await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Host part of a broker URL, sent as the STOMP `host` header.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    authority.split(':').next().unwrap_or(authority)
}
