use std::fmt;

use super::types::{ChatMessage, ConnectionState};
use crate::history::Timeline;

/// Diagnostic reported by the connection manager. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
    /// Whether the reconnect policy will keep trying.
    pub recoverable: bool,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Events from the connection manager to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Message {
        destination: String,
        message: ChatMessage,
    },
    Error(ConnectionError),
}

/// Events from the chat client to the UI collaborator.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    TimelineUpdated(Timeline),
    ConnectionChanged(ConnectionState),
    /// History could not be loaded; the timeline only holds live messages.
    HistoryUnavailable { room_id: String, error: String },
}
