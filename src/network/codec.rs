//! STOMP 1.2 framing plus the JSON chat payload carried inside `SEND` and
//! `MESSAGE` frames.

use std::fmt;
use std::time::Duration;

use crate::common::ChatMessage;
use crate::error::DecodeError;

pub const TOPIC_PREFIX: &str = "/topic/chat/";
pub const SEND_PREFIX: &str = "/app/chat.send/";
pub const HEARTBEAT_FRAME: &str = "\n";

/// Topic a room's messages are published on.
pub fn topic_for(room_id: &str) -> String {
    format!("{TOPIC_PREFIX}{room_id}")
}

/// Destination client messages for a room are sent to.
pub fn send_destination(room_id: &str) -> String {
    format!("{SEND_PREFIX}{room_id}")
}

pub fn room_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .filter(|room_id| !room_id.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StompCommand {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl StompCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
            StompCommand::Disconnect => "DISCONNECT",
        }
    }

    fn parse(line: &str) -> Option<Self> {
        let command = match line {
            "CONNECT" | "STOMP" => StompCommand::Connect,
            "CONNECTED" => StompCommand::Connected,
            "SEND" => StompCommand::Send,
            "SUBSCRIBE" => StompCommand::Subscribe,
            "UNSUBSCRIBE" => StompCommand::Unsubscribe,
            "MESSAGE" => StompCommand::Message,
            "RECEIPT" => StompCommand::Receipt,
            "ERROR" => StompCommand::Error,
            "DISCONNECT" => StompCommand::Disconnect,
            _ => return None,
        };
        Some(command)
    }

    /// CONNECT and CONNECTED headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One inbound unit read off the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Heartbeat,
    Frame(StompFrame),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins when a header is repeated.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get_header("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one transport message. Leading end-of-lines are heartbeats; a
    /// message made only of them decodes to [`Inbound::Heartbeat`].
    pub fn decode(text: &str) -> Result<Inbound, DecodeError> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() || text == "\0" {
            return Ok(Inbound::Heartbeat);
        }

        let (head, rest) = split_head(text)
            .ok_or_else(|| DecodeError::MalformedFrame("missing header terminator".into()))?;

        let mut lines = head.split('\n').map(|line| line.trim_end_matches('\r'));
        let command_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| DecodeError::MalformedFrame("missing command line".into()))?;
        let command = StompCommand::parse(command_line)
            .ok_or_else(|| DecodeError::UnknownCommand(command_line.to_string()))?;

        let mut headers = Vec::new();
        for line in lines.filter(|line| !line.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| DecodeError::InvalidHeader(line.to_string()))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let declared_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| DecodeError::InvalidHeader(format!("content-length:{value}")))
            })
            .transpose()?;

        let body = match declared_length {
            Some(length) => rest.get(..length).ok_or_else(|| {
                DecodeError::MalformedFrame(format!(
                    "body shorter than content-length {length}"
                ))
            })?,
            None => rest.split('\0').next().unwrap_or_default(),
        };

        Ok(Inbound::Frame(StompFrame {
            command,
            headers,
            body: body.to_string(),
        }))
    }
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    let lf = text.find("\n\n").map(|index| (index, 2));
    let crlf = text.find("\r\n\r\n").map(|index| (index, 4));
    let (index, width) = match (lf, crlf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(found), None) | (None, Some(found)) => found,
        (None, None) => {
            // Header-only frame terminated directly by NUL.
            let index = text.find("\n\0")?;
            return Some((&text[..index], ""));
        }
    };
    Some((&text[..index], &text[index + width..]))
}

fn escape_header(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            ':' => escaped.push_str("\\c"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_header(raw: &str) -> Result<String, DecodeError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(DecodeError::InvalidHeader(raw.to_string())),
        }
    }
    Ok(out)
}

/// `heart-beat:<cx>,<cy>` in milliseconds.
pub fn parse_heartbeat(value: &str) -> Option<(u64, u64)> {
    let (first, second) = value.split_once(',')?;
    Some((first.trim().parse().ok()?, second.trim().parse().ok()?))
}

/// Negotiated `(outgoing, incoming)` heartbeat periods; `None` means disabled.
///
/// `client` is what this side offered in CONNECT, `server` is the broker's
/// `heart-beat` header from CONNECTED.
pub fn negotiate_heartbeat(
    client: (u64, u64),
    server: (u64, u64),
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
    };
    (pick(client.0, server.1), pick(client.1, server.0))
}

pub fn connect_frame(host: &str, bearer_token: Option<&str>, heartbeat: (u64, u64)) -> StompFrame {
    let authorization = match bearer_token {
        Some(token) if !token.is_empty() => format!("Bearer {token}"),
        _ => String::new(),
    };
    StompFrame::new(StompCommand::Connect)
        .header("accept-version", "1.2")
        .header("host", host)
        .header("heart-beat", format!("{},{}", heartbeat.0, heartbeat.1))
        .header("Authorization", authorization)
}

pub fn subscribe_frame(subscription_id: &str, room_id: &str) -> StompFrame {
    StompFrame::new(StompCommand::Subscribe)
        .header("id", subscription_id)
        .header("destination", topic_for(room_id))
        .header("ack", "auto")
}

pub fn unsubscribe_frame(subscription_id: &str) -> StompFrame {
    StompFrame::new(StompCommand::Unsubscribe).header("id", subscription_id)
}

pub fn disconnect_frame() -> StompFrame {
    StompFrame::new(StompCommand::Disconnect)
}

/// Wrap a chat message in a `SEND` frame for its room.
pub fn encode(message: &ChatMessage) -> StompFrame {
    let body = serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string());
    StompFrame::new(StompCommand::Send)
        .header("destination", send_destination(&message.room_id))
        .header("content-type", "application/json")
        .with_body(body)
}

/// Extract the chat message from a `MESSAGE` frame. A body without a room id
/// inherits the room named by the frame's destination topic.
pub fn decode(frame: &StompFrame) -> Result<ChatMessage, DecodeError> {
    if frame.command != StompCommand::Message {
        return Err(DecodeError::UnexpectedFrame(frame.command.to_string()));
    }
    let mut message: ChatMessage = serde_json::from_str(&frame.body)?;
    if message.room_id.is_empty() {
        let destination = frame
            .get_header("destination")
            .ok_or(DecodeError::MissingHeader("destination"))?;
        let room_id = room_from_topic(destination)
            .ok_or(DecodeError::MissingHeader("destination"))?;
        message.room_id = room_id.to_string();
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MessageType;

    fn frame_of(inbound: Inbound) -> StompFrame {
        match inbound {
            Inbound::Frame(frame) => frame,
            Inbound::Heartbeat => panic!("expected a frame"),
        }
    }

    #[test]
    fn topics_map_to_rooms() {
        assert_eq!(topic_for("policy"), "/topic/chat/policy");
        assert_eq!(send_destination("policy"), "/app/chat.send/policy");
        assert_eq!(room_from_topic("/topic/chat/policy"), Some("policy"));
        assert_eq!(room_from_topic("/topic/chat/"), None);
        assert_eq!(room_from_topic("/queue/other"), None);
    }

    #[test]
    fn decodes_message_frame_from_broker() {
        let raw = "MESSAGE\ndestination:/topic/chat/policy\nsubscription:sub-policy\n\
                   message-id:7\ncontent-type:application/json\n\n\
                   {\"id\":9,\"type\":\"CHAT\",\"content\":\"hi\",\"senderId\":\"u1\",\
                   \"roomId\":\"policy\",\"sentAt\":\"2024-03-01T10:00:00Z\"}\0";
        let frame = frame_of(StompFrame::decode(raw).unwrap());

        assert_eq!(frame.command, StompCommand::Message);
        assert_eq!(frame.get_header("subscription"), Some("sub-policy"));

        let message = decode(&frame).unwrap();
        assert_eq!(message.id.as_deref(), Some("9"));
        assert_eq!(message.content, "hi");
        assert_eq!(message.room_id, "policy");
    }

    #[test]
    fn respects_content_length_with_embedded_nul() {
        let raw = "MESSAGE\ndestination:/topic/chat/a\ncontent-length:5\n\nab\0cd\0";
        let frame = frame_of(StompFrame::decode(raw).unwrap());
        assert_eq!(frame.body, "ab\0cd");
    }

    #[test]
    fn tolerates_crlf_and_missing_nul() {
        let raw = "CONNECTED\r\nversion:1.2\r\nheart-beat:4000,4000\r\n\r\n";
        let frame = frame_of(StompFrame::decode(raw).unwrap());
        assert_eq!(frame.command, StompCommand::Connected);
        assert_eq!(frame.get_header("heart-beat"), Some("4000,4000"));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn bare_end_of_lines_are_heartbeats() {
        assert_eq!(StompFrame::decode("\n").unwrap(), Inbound::Heartbeat);
        assert_eq!(StompFrame::decode("\r\n\n").unwrap(), Inbound::Heartbeat);
    }

    #[test]
    fn header_escaping_survives_encode_and_decode() {
        let frame = StompFrame::new(StompCommand::Send)
            .header("destination", "/app/chat.send/a")
            .header("note", "a:b\\c\nd")
            .with_body("x");
        let encoded = frame.encode();
        assert!(encoded.contains("note:a\\cb\\\\c\\nd\n"));
        assert!(encoded.contains("content-length:1\n"));
        assert!(encoded.ends_with("\n\nx\0"));

        let decoded = frame_of(StompFrame::decode(&encoded).unwrap());
        assert_eq!(decoded.get_header("note"), Some("a:b\\c\nd"));
    }

    #[test]
    fn malformed_input_is_an_error_not_a_panic() {
        assert!(matches!(
            StompFrame::decode("BOGUS\n\n\0"),
            Err(DecodeError::UnknownCommand(_))
        ));
        assert!(matches!(
            StompFrame::decode("MESSAGE\nno-separator\n\n\0"),
            Err(DecodeError::InvalidHeader(_))
        ));
        assert!(matches!(
            StompFrame::decode("MESSAGE\ndestination:/topic/chat/a"),
            Err(DecodeError::MalformedFrame(_))
        ));
        assert!(matches!(
            StompFrame::decode("MESSAGE\ncontent-length:99\n\nshort\0"),
            Err(DecodeError::MalformedFrame(_))
        ));

        let frame = StompFrame::new(StompCommand::Message)
            .header("destination", "/topic/chat/a")
            .with_body("not json");
        assert!(matches!(decode(&frame), Err(DecodeError::InvalidBody(_))));
    }

    #[test]
    fn room_falls_back_to_destination() {
        let frame = StompFrame::new(StompCommand::Message)
            .header("destination", "/topic/chat/lobby")
            .with_body(r#"{"type":"JOIN","senderNickname":"ana"}"#);
        let message = decode(&frame).unwrap();
        assert_eq!(message.room_id, "lobby");
        assert_eq!(message.message_type, MessageType::Join);

        let receipt = StompFrame::new(StompCommand::Receipt);
        assert!(matches!(
            decode(&receipt),
            Err(DecodeError::UnexpectedFrame(_))
        ));
    }

    #[test]
    fn encode_targets_room_send_destination() {
        let message = ChatMessage::outgoing("policy", "u1", "ana", "hello", false);
        let frame = encode(&message);
        assert_eq!(frame.command, StompCommand::Send);
        assert_eq!(frame.get_header("destination"), Some("/app/chat.send/policy"));

        let body: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
        assert_eq!(body["content"], "hello");
    }

    #[test]
    fn connect_frame_carries_bearer_and_heartbeat() {
        let frame = connect_frame("chat.local", Some("tok"), (4000, 4000));
        assert_eq!(frame.get_header("Authorization"), Some("Bearer tok"));
        assert_eq!(frame.get_header("heart-beat"), Some("4000,4000"));

        let anonymous = connect_frame("chat.local", None, (0, 0));
        assert_eq!(anonymous.get_header("Authorization"), Some(""));
        // CONNECT headers are written verbatim.
        assert!(anonymous.encode().contains("host:chat.local\n"));
    }

    #[test]
    fn heartbeat_negotiation() {
        let (out, inc) = negotiate_heartbeat((4000, 4000), (10000, 0));
        assert_eq!(out, None);
        assert_eq!(inc, Some(Duration::from_millis(10000)));

        let (out, inc) = negotiate_heartbeat((4000, 4000), (4000, 4000));
        assert_eq!(out, Some(Duration::from_millis(4000)));
        assert_eq!(inc, Some(Duration::from_millis(4000)));

        assert_eq!(parse_heartbeat("0, 250"), Some((0, 250)));
        assert_eq!(parse_heartbeat("nope"), None);
    }
}
