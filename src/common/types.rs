use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Kind of chat event carried on a room topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Join,
    Leave,
    #[default]
    Chat,
}

/// Domain model of a single chat event.
///
/// `id` is only present once the broker has assigned one; messages built
/// locally for sending carry `None` until the server echo arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(
        default,
        deserialize_with = "deserialize_message_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_icon: bool,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_nickname: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_sent_at")]
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Build a client-originated chat message stamped with the local clock.
    pub fn outgoing(
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_nickname: impl Into<String>,
        content: impl Into<String>,
        is_icon: bool,
    ) -> Self {
        Self {
            id: None,
            message_type: MessageType::Chat,
            content: content.into(),
            is_icon,
            sender_id: sender_id.into(),
            sender_nickname: sender_nickname.into(),
            room_id: room_id.into(),
            sent_at: Utc::now(),
        }
    }

    /// Build a membership announcement (`JOIN` / `LEAVE`) for a room.
    pub fn membership(
        message_type: MessageType,
        room_id: impl Into<String>,
        sender_id: impl Into<String>,
        sender_nickname: impl Into<String>,
    ) -> Self {
        let sender_nickname = sender_nickname.into();
        let verb = match message_type {
            MessageType::Leave => "left",
            _ => "joined",
        };
        Self {
            id: None,
            message_type,
            content: format!("{sender_nickname} {verb} the room"),
            is_icon: false,
            sender_id: sender_id.into(),
            sender_nickname,
            room_id: room_id.into(),
            sent_at: Utc::now(),
        }
    }

    /// Identity used to pair a pending local send with its server echo.
    pub fn echo_key(&self) -> (&str, &str, &str) {
        (&self.sender_id, &self.content, &self.room_id)
    }

    pub fn has_id(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Room entry returned by the REST collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDescriptor {
    #[serde(alias = "roomId")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Lifecycle state of a connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(label)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(i64),
}

fn deserialize_message_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawId>::deserialize(deserializer)?;
    Ok(match raw {
        Some(RawId::Text(text)) if !text.is_empty() => Some(text),
        Some(RawId::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Millis(i64),
    Text(String),
}

/// Accepts RFC 3339, a naive ISO-8601 date-time (read as UTC) or epoch millis.
fn deserialize_sent_at<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw = Option::<RawTimestamp>::deserialize(deserializer)?;
    match raw {
        None => Ok(Utc::now()),
        Some(RawTimestamp::Millis(millis)) => Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {millis}"))),
        Some(RawTimestamp::Text(text)) => parse_timestamp(&text)
            .ok_or_else(|| D::Error::custom(format!("unrecognised timestamp `{text}`"))),
    }
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
