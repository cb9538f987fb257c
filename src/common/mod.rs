pub(crate) mod commands;
pub mod events;
pub mod types;

pub use events::{ChatEvent, ConnectionError, ConnectionEvent};
pub use types::{ChatMessage, ConnectionState, MessageType, RoomDescriptor};
