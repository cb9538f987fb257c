//! Error types for the chat client.

use thiserror::Error;

/// Result type for history operations.
pub type HistoryResult<T> = Result<T, HistoryError>;

/// Result type for facade operations.
pub type ChatResult<T> = Result<T, ChatError>;

/// A single inbound frame could not be turned into a chat event.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame text is empty or has no command line.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Command line is not a known STOMP command.
    #[error("unknown frame command `{0}`")]
    UnknownCommand(String),

    /// A header line lacks the `name:value` separator or uses a bad escape.
    #[error("invalid header line `{0}`")]
    InvalidHeader(String),

    /// A header required for this frame type is missing.
    #[error("missing `{0}` header")]
    MissingHeader(&'static str),

    /// Frame is valid STOMP but not a `MESSAGE` carrying a chat event.
    #[error("expected MESSAGE frame, got {0}")]
    UnexpectedFrame(String),

    /// JSON body does not describe a chat message.
    #[error("invalid message body: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

/// Failure of the underlying socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket could not be opened.
    #[error("failed to connect to {url}: {message}")]
    ConnectFailed { url: String, message: String },

    /// The session is already closed.
    #[error("transport session closed")]
    Closed,
}

/// Failure of the REST history collaborator.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Server answered with a non-success status.
    #[error("history endpoint returned status {status}")]
    Status { status: u16 },

    /// No answer within the configured history timeout.
    #[error("history request timed out after {after_ms} ms")]
    TimedOut { after_ms: u64 },

    /// The history base URL cannot address `/history` or `/rooms`.
    #[error("invalid history URL `{0}`")]
    InvalidUrl(String),

    /// Any other history source failure.
    #[error("history unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to callers of [`crate::chat::ChatClient`].
#[derive(Debug, Error)]
pub enum ChatError {
    /// Operation needs a live broker connection.
    #[error("not connected")]
    NotConnected,

    /// Operation needs a joined room.
    #[error("not in a room")]
    NotInRoom,

    /// The background chat task has stopped.
    #[error("chat client is shut down")]
    Shutdown,
}
