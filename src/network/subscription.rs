use std::collections::HashMap;

use async_trait::async_trait;

use super::codec::{self, StompFrame};
use super::connection::ConnectionManager;
use crate::common::ChatMessage;

/// Callback bound to a room; invoked once per inbound message, in order.
pub type MessageListener = Box<dyn FnMut(ChatMessage) + Send>;

/// Where subscription frames are written.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: StompFrame) -> bool;
    fn is_connected(&self) -> bool;
}

#[async_trait]
impl FrameSink for ConnectionManager {
    async fn send_frame(&self, frame: StompFrame) -> bool {
        self.send(frame).await
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }
}

/// Identifies one binding. A handle from a replaced binding no longer
/// matches, so unsubscribing with it is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    room_id: String,
    generation: u64,
}

impl SubscriptionHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Waiting for the next CONNECTED transition.
    Pending,
    /// SUBSCRIBE frame accepted by the live session.
    Active,
}

struct Subscription {
    subscription_id: String,
    generation: u64,
    status: SubscriptionStatus,
    listener: MessageListener,
}

/// Room topic -> listener bindings, at most one per room.
pub struct SubscriptionRegistry<S> {
    sink: S,
    entries: HashMap<String, Subscription>,
    next_generation: u64,
}

impl<S: FrameSink> SubscriptionRegistry<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            entries: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Bind `listener` to `room_id`, replacing any previous listener for the
    /// room. When the connection is down the request stays queued until
    /// [`resubscribe_all`](Self::resubscribe_all).
    pub async fn subscribe<F>(&mut self, room_id: &str, listener: F) -> SubscriptionHandle
    where
        F: FnMut(ChatMessage) + Send + 'static,
    {
        let generation = self.next_generation;
        self.next_generation += 1;

        let needs_issue = match self.entries.get_mut(room_id) {
            Some(existing) => {
                log::debug!("Replacing listener for room {room_id}");
                existing.listener = Box::new(listener);
                existing.generation = generation;
                existing.status == SubscriptionStatus::Pending
            }
            None => {
                self.entries.insert(
                    room_id.to_string(),
                    Subscription {
                        subscription_id: format!("sub-{room_id}"),
                        generation,
                        status: SubscriptionStatus::Pending,
                        listener: Box::new(listener),
                    },
                );
                true
            }
        };

        if needs_issue {
            self.issue(room_id).await;
        }

        SubscriptionHandle {
            room_id: room_id.to_string(),
            generation,
        }
    }

    /// Remove the binding named by `handle`. Returns whether anything was removed.
    pub async fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> bool {
        let current = self
            .entries
            .get(&handle.room_id)
            .is_some_and(|entry| entry.generation == handle.generation);
        if !current {
            return false;
        }
        let Some(entry) = self.entries.remove(&handle.room_id) else {
            return false;
        };

        if entry.status == SubscriptionStatus::Active && self.sink.is_connected() {
            let frame = codec::unsubscribe_frame(&entry.subscription_id);
            if !self.sink.send_frame(frame).await {
                log::debug!("UNSUBSCRIBE for room {} not delivered", handle.room_id);
            }
        }
        log::info!("Unsubscribed from room {}", handle.room_id);
        true
    }

    /// Issue every queued binding on a fresh session. Returns the rooms that
    /// became active.
    pub async fn resubscribe_all(&mut self) -> Vec<String> {
        let rooms: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.status == SubscriptionStatus::Pending)
            .map(|(room_id, _)| room_id.clone())
            .collect();
        let mut activated = Vec::new();
        for room_id in rooms {
            if self.issue(&room_id).await {
                activated.push(room_id);
            }
        }
        if !activated.is_empty() {
            log::info!("Subscribed {} room(s) after connect", activated.len());
        }
        activated
    }

    /// A lost session forgets its server-side subscriptions.
    pub fn mark_all_pending(&mut self) {
        for entry in self.entries.values_mut() {
            entry.status = SubscriptionStatus::Pending;
        }
    }

    /// Hand an inbound message to the listener of its room. Messages for
    /// rooms without a binding are dropped.
    pub fn dispatch(&mut self, destination: &str, message: ChatMessage) -> bool {
        let room_id = codec::room_from_topic(destination)
            .map(str::to_string)
            .unwrap_or_else(|| message.room_id.clone());
        match self.entries.get_mut(&room_id) {
            Some(entry) => {
                (entry.listener)(message);
                true
            }
            None => {
                log::trace!("No subscription for room {room_id}; dropping message");
                false
            }
        }
    }

    pub fn status(&self, room_id: &str) -> Option<SubscriptionStatus> {
        self.entries.get(room_id).map(|entry| entry.status)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    async fn issue(&mut self, room_id: &str) -> bool {
        if !self.sink.is_connected() {
            log::debug!("Queued subscription for room {room_id} until connected");
            return false;
        }
        let Some(subscription_id) = self
            .entries
            .get(room_id)
            .map(|entry| entry.subscription_id.clone())
        else {
            return false;
        };

        let sent = self
            .sink
            .send_frame(codec::subscribe_frame(&subscription_id, room_id))
            .await;
        if let Some(entry) = self.entries.get_mut(room_id) {
            entry.status = if sent {
                SubscriptionStatus::Active
            } else {
                SubscriptionStatus::Pending
            };
        }
        if sent {
            log::info!("Subscribed to {}", codec::topic_for(room_id));
        }
        sent
    }
}
