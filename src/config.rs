use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "config/chat.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// WebSocket endpoint of the STOMP broker.
    pub broker_url: String,
    /// Base URL of the REST service serving `/history` and `/rooms`.
    pub history_url: String,
    pub reconnect_delay_ms: u64,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    /// Silent heartbeat periods tolerated before the link is declared dead.
    pub missed_heartbeats: u32,
    pub connect_timeout_ms: u64,
    /// Upper bound on one history fetch; live traffic is held back until it
    /// answers or times out.
    pub history_timeout_ms: u64,
    /// Publish JOIN/LEAVE messages when entering and leaving a room.
    pub announce_membership: bool,
    /// Stable sender id; a random one is generated per client when unset.
    pub sender_id: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            broker_url: "ws://localhost:8080/ws".to_string(),
            history_url: "http://localhost:8080".to_string(),
            reconnect_delay_ms: 5000,
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            missed_heartbeats: 2,
            connect_timeout_ms: 10_000,
            history_timeout_ms: 10_000,
            announce_membership: true,
            sender_id: None,
        }
    }
}

impl ChatConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }
}

pub fn load_config(path: &str) -> ChatConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<ChatConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                ChatConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            ChatConfig::default()
        }
    }
}

pub fn save_config(path: &str, config: &ChatConfig) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)
}
