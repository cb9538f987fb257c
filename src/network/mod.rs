pub mod codec;
pub mod connection;
pub mod credentials;
pub mod subscription;
pub mod transport;

pub use connection::{ConnectionConfig, ConnectionManager};
pub use credentials::Credentials;
pub use subscription::{FrameSink, SubscriptionHandle, SubscriptionRegistry, SubscriptionStatus};
pub use transport::{Transport, TransportEvent, TransportSession, WebSocketTransport};
