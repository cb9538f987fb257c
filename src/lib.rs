//! Realtime chat client over STOMP/WebSocket.
//!
//! The crate is layered bottom-up:
//!
//! - [`network`]: STOMP frame codec, WebSocket transport, the reconnecting
//!   [`ConnectionManager`] and the room [`SubscriptionRegistry`].
//! - [`history`]: REST history source, ordered [`Timeline`] and the
//!   [`HistoryReconciler`] merging history with live traffic.
//! - [`chat`]: the [`ChatClient`] facade a UI talks to.

pub mod chat;
pub mod common;
pub mod config;
pub mod error;
pub mod history;
pub mod network;

pub use chat::ChatClient;
pub use common::{ChatEvent, ChatMessage, ConnectionState, MessageType, RoomDescriptor};
pub use config::ChatConfig;
pub use error::{ChatError, DecodeError, HistoryError, TransportError};
pub use history::{HistoryReconciler, HistorySource, RestHistoryClient, Timeline};
pub use network::{ConnectionManager, Credentials, SubscriptionRegistry, WebSocketTransport};
