//! Chat facade: one joined room on top of the connection, subscription and
//! history layers.
//!
//! [`ChatClient`] is a handle to a background task that owns the
//! [`ConnectionManager`], the [`SubscriptionRegistry`] and the
//! [`HistoryReconciler`]. Every mutation of that state happens inside the
//! task, so callbacks and events observe one consistent order.

use tokio::sync::{mpsc, oneshot};
use tokio::time;
use uuid::Uuid;

use crate::common::commands::{ChatCommand, StateListener, TimelineListener};
use crate::common::{ChatEvent, ChatMessage, ConnectionEvent, ConnectionState, MessageType};
use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult, HistoryError, HistoryResult};
use crate::history::{HistoryReconciler, HistorySource, Timeline};
use crate::network::codec;
use crate::network::{
    ConnectionConfig, ConnectionManager, Credentials, SubscriptionHandle, SubscriptionRegistry,
    SubscriptionStatus, Transport,
};

/// Handle to a running chat task.
pub struct ChatClient {
    commands: mpsc::UnboundedSender<ChatCommand>,
    connection: ConnectionManager,
    sender_id: String,
}

impl ChatClient {
    /// Spawn the chat task. Timeline updates, connection changes and history
    /// failures are also delivered on the returned receiver.
    pub fn spawn<T, H>(
        config: ChatConfig,
        transport: T,
        history: H,
        credentials: Credentials,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>)
    where
        T: Transport,
        H: HistorySource,
    {
        let sender_id = config
            .sender_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (connection, connection_events) =
            ConnectionManager::spawn(transport, ConnectionConfig::from(&config));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let (history_tx, history_rx) = mpsc::unbounded_channel();

        let worker = ChatWorker {
            config,
            sender_id: sender_id.clone(),
            credentials,
            connection: connection.clone(),
            registry: SubscriptionRegistry::new(connection.clone()),
            reconciler: HistoryReconciler::new(history),
            room: None,
            commands: command_rx,
            connection_events,
            live_tx,
            live_rx,
            history_tx,
            history_rx,
            events: event_tx,
            timeline_listeners: Vec::new(),
            connection_listeners: Vec::new(),
        };
        tokio::spawn(worker.run());

        (
            Self {
                commands: command_tx,
                connection,
                sender_id,
            },
            event_rx,
        )
    }

    /// Join `room_id`, leaving the current room first. Connects when needed,
    /// subscribes to the room topic and loads its history in the background.
    pub async fn join_room(
        &self,
        room_id: impl Into<String>,
        nickname: impl Into<String>,
    ) -> ChatResult<()> {
        let (reply, result) = oneshot::channel();
        self.request(ChatCommand::JoinRoom {
            room_id: room_id.into(),
            nickname: nickname.into(),
            reply,
        })?;
        result.await.map_err(|_| ChatError::Shutdown)?
    }

    pub async fn leave_room(&self) -> ChatResult<()> {
        let (reply, result) = oneshot::channel();
        self.request(ChatCommand::LeaveRoom { reply })?;
        result.await.map_err(|_| ChatError::Shutdown)?
    }

    /// Publish a chat message to the joined room. Fails with
    /// [`ChatError::NotConnected`] without transmitting anything while the
    /// connection is down.
    pub async fn send_message(&self, content: impl Into<String>, is_icon: bool) -> ChatResult<()> {
        let (reply, result) = oneshot::channel();
        self.request(ChatCommand::SendMessage {
            content: content.into(),
            is_icon,
            reply,
        })?;
        result.await.map_err(|_| ChatError::Shutdown)?
    }

    pub fn on_timeline_update<F>(&self, listener: F)
    where
        F: Fn(&Timeline) + Send + 'static,
    {
        let _ = self.request(ChatCommand::OnTimelineUpdate(Box::new(listener)));
    }

    pub fn on_connection_change<F>(&self, listener: F)
    where
        F: Fn(ConnectionState) + Send + 'static,
    {
        let _ = self.request(ChatCommand::OnConnectionChange(Box::new(listener)));
    }

    /// Leave the room and close the connection deliberately.
    pub async fn disconnect(&self) {
        let (reply, done) = oneshot::channel();
        if self.request(ChatCommand::Disconnect { reply }).is_ok() {
            let _ = done.await;
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn request(&self, command: ChatCommand) -> ChatResult<()> {
        self.commands.send(command).map_err(|_| {
            log::warn!("Chat task is not running");
            ChatError::Shutdown
        })
    }
}

struct JoinedRoom {
    room_id: String,
    nickname: String,
    handle: SubscriptionHandle,
}

struct HistoryLoaded {
    epoch: u64,
    result: HistoryResult<Vec<ChatMessage>>,
}

struct ChatWorker<H> {
    config: ChatConfig,
    sender_id: String,
    credentials: Credentials,
    connection: ConnectionManager,
    registry: SubscriptionRegistry<ConnectionManager>,
    reconciler: HistoryReconciler<H>,
    room: Option<JoinedRoom>,
    commands: mpsc::UnboundedReceiver<ChatCommand>,
    connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    live_tx: mpsc::UnboundedSender<ChatMessage>,
    live_rx: mpsc::UnboundedReceiver<ChatMessage>,
    history_tx: mpsc::UnboundedSender<HistoryLoaded>,
    history_rx: mpsc::UnboundedReceiver<HistoryLoaded>,
    events: mpsc::UnboundedSender<ChatEvent>,
    timeline_listeners: Vec<TimelineListener>,
    connection_listeners: Vec<StateListener>,
}

impl<H: HistorySource> ChatWorker<H> {
    async fn run(mut self) {
        log::debug!("Chat task started for sender {}", self.sender_id);

        loop {
            tokio::select! {
                biased;

                event = self.connection_events.recv() => {
                    match event {
                        Some(event) => self.handle_connection_event(event).await,
                        None => break,
                    }
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(message) = self.live_rx.recv() => {
                    self.handle_live_message(message);
                }
                Some(loaded) = self.history_rx.recv() => {
                    self.handle_history(loaded);
                }
            }
        }

        self.connection.disconnect();
        log::debug!("Chat task stopped for sender {}", self.sender_id);
    }

    async fn handle_command(&mut self, command: ChatCommand) {
        match command {
            ChatCommand::JoinRoom {
                room_id,
                nickname,
                reply,
            } => {
                self.join_room(room_id, nickname).await;
                let _ = reply.send(Ok(()));
            }
            ChatCommand::LeaveRoom { reply } => {
                let result = if self.room.is_some() {
                    self.leave_room().await;
                    Ok(())
                } else {
                    Err(ChatError::NotInRoom)
                };
                let _ = reply.send(result);
            }
            ChatCommand::SendMessage {
                content,
                is_icon,
                reply,
            } => {
                let result = self.send_message(content, is_icon).await;
                let _ = reply.send(result);
            }
            ChatCommand::OnTimelineUpdate(listener) => self.timeline_listeners.push(listener),
            ChatCommand::OnConnectionChange(listener) => self.connection_listeners.push(listener),
            ChatCommand::Disconnect { reply } => {
                if self.room.is_some() {
                    self.leave_room().await;
                }
                self.registry.clear();
                self.connection.disconnect();
                let _ = reply.send(());
            }
        }
    }

    async fn join_room(&mut self, room_id: String, nickname: String) {
        if self
            .room
            .as_ref()
            .is_some_and(|room| room.room_id != room_id)
        {
            self.leave_room().await;
        }

        self.connection.connect(self.credentials.clone());

        let live_tx = self.live_tx.clone();
        let handle = self
            .registry
            .subscribe(&room_id, move |message| {
                let _ = live_tx.send(message);
            })
            .await;
        let rejoined = self.room.is_some();
        self.room = Some(JoinedRoom {
            room_id: room_id.clone(),
            nickname,
            handle,
        });
        log::info!("Joined room {room_id}");

        if !rejoined && self.registry.status(&room_id) == Some(SubscriptionStatus::Active) {
            self.announce(MessageType::Join).await;
        }
        self.load_history(&room_id);
    }

    async fn leave_room(&mut self) {
        if self.connection.state().is_connected() {
            self.announce(MessageType::Leave).await;
        }
        if let Some(room) = self.room.take() {
            self.registry.unsubscribe(&room.handle).await;
            log::info!("Left room {}", room.room_id);
        }
        self.reconciler.reset(None);
    }

    async fn send_message(&mut self, content: String, is_icon: bool) -> ChatResult<()> {
        let Some(room) = self.room.as_ref() else {
            return Err(ChatError::NotInRoom);
        };
        let message = ChatMessage::outgoing(
            room.room_id.as_str(),
            self.sender_id.as_str(),
            room.nickname.as_str(),
            content,
            is_icon,
        );
        if !self.connection.send(codec::encode(&message)).await {
            return Err(ChatError::NotConnected);
        }
        if self.reconciler.record_local_send(message) {
            self.publish_timeline();
        }
        Ok(())
    }

    async fn announce(&mut self, message_type: MessageType) {
        if !self.config.announce_membership {
            return;
        }
        let Some(room) = self.room.as_ref() else {
            return;
        };
        let message = ChatMessage::membership(
            message_type,
            room.room_id.as_str(),
            self.sender_id.as_str(),
            room.nickname.as_str(),
        );
        if !self.connection.send(codec::encode(&message)).await {
            log::debug!("{message_type:?} announcement for room {} not sent", room.room_id);
        }
    }

    fn load_history(&mut self, room_id: &str) {
        let epoch = self.reconciler.begin_load(room_id);
        let source = self.reconciler.source();
        let history_tx = self.history_tx.clone();
        let room_id = room_id.to_string();
        let limit = self.config.history_timeout();
        tokio::spawn(async move {
            let result = match time::timeout(limit, source.fetch_history(&room_id)).await {
                Ok(result) => result,
                Err(_) => Err(HistoryError::TimedOut {
                    after_ms: limit.as_millis() as u64,
                }),
            };
            let _ = history_tx.send(HistoryLoaded { epoch, result });
        });
    }

    async fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::StateChanged(state) => {
                if state.is_connected() {
                    let activated = self.registry.resubscribe_all().await;
                    let joined_room_activated = self
                        .room
                        .as_ref()
                        .is_some_and(|room| activated.contains(&room.room_id));
                    if joined_room_activated {
                        self.announce(MessageType::Join).await;
                    }
                } else {
                    self.registry.mark_all_pending();
                }
                for listener in &self.connection_listeners {
                    listener(state);
                }
                let _ = self.events.send(ChatEvent::ConnectionChanged(state));
            }
            ConnectionEvent::Message {
                destination,
                message,
            } => {
                self.registry.dispatch(&destination, message);
            }
            ConnectionEvent::Error(err) => {
                log::debug!("Connection diagnostic: {err}");
            }
        }
    }

    fn handle_live_message(&mut self, message: ChatMessage) {
        if self.reconciler.push_live(message) {
            self.publish_timeline();
        }
    }

    fn handle_history(&mut self, loaded: HistoryLoaded) {
        let Some(outcome) = self.reconciler.complete_load(loaded.epoch, loaded.result) else {
            return;
        };
        if let Some(err) = outcome.history_error {
            let _ = self.events.send(ChatEvent::HistoryUnavailable {
                room_id: outcome.timeline.room_id().to_string(),
                error: err.to_string(),
            });
        }
        self.emit_timeline(outcome.timeline);
    }

    fn publish_timeline(&self) {
        if let Some(timeline) = self.reconciler.timeline() {
            self.emit_timeline(timeline.clone());
        }
    }

    fn emit_timeline(&self, timeline: Timeline) {
        for listener in &self.timeline_listeners {
            listener(&timeline);
        }
        let _ = self.events.send(ChatEvent::TimelineUpdated(timeline));
    }
}
