use tokio::sync::oneshot;

use super::types::ConnectionState;
use crate::error::ChatResult;
use crate::history::Timeline;
use crate::network::codec::StompFrame;
use crate::network::credentials::Credentials;

pub(crate) type StateListener = Box<dyn Fn(ConnectionState) + Send>;
pub(crate) type TimelineListener = Box<dyn Fn(&Timeline) + Send>;

/// Requests from a `ConnectionManager` handle to its background task.
pub(crate) enum ConnectionCommand {
    Connect(Credentials),
    Disconnect,
    Send {
        frame: StompFrame,
        reply: oneshot::Sender<bool>,
    },
    OnStateChange(StateListener),
}

/// Requests from a `ChatClient` handle to its background task.
pub(crate) enum ChatCommand {
    JoinRoom {
        room_id: String,
        nickname: String,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    LeaveRoom {
        reply: oneshot::Sender<ChatResult<()>>,
    },
    SendMessage {
        content: String,
        is_icon: bool,
        reply: oneshot::Sender<ChatResult<()>>,
    },
    OnTimelineUpdate(TimelineListener),
    OnConnectionChange(StateListener),
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}
