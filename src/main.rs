use std::collections::HashSet;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use rust_stomp_chat::common::{ChatEvent, ChatMessage, MessageType};
use rust_stomp_chat::config::{self, ChatConfig};
use rust_stomp_chat::history::TimelineEntry;
use rust_stomp_chat::{
    ChatClient, ChatError, Credentials, HistoryError, HistorySource, RestHistoryClient, Timeline,
    WebSocketTransport,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(
    name = "rust_stomp_chat",
    version,
    about = "Realtime room chat over STOMP/WebSocket"
)]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    /// Bearer token sent with CONNECT and history requests
    #[arg(long, env = "CHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Overrides `broker_url` from the config file
    #[arg(long, env = "CHAT_BROKER_URL")]
    broker_url: Option<String>,
    /// Overrides `history_url` from the config file
    #[arg(long, env = "CHAT_HISTORY_URL")]
    history_url: Option<String>,
    #[arg(long, env = "CHAT_NICKNAME", default_value = "guest")]
    nickname: String,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Clone, PartialEq, Eq)]
enum Mode {
    /// Join a room and chat from stdin
    Join { room: String },
    /// List rooms known to the history service
    Rooms,
    /// Print stored messages of one room, or of every room
    History { room: Option<String> },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    History(#[from] HistoryError),
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let mut app_config = config::load_config(&cli.config);
    if let Some(url) = &cli.broker_url {
        app_config.broker_url = url.clone();
    }
    if let Some(url) = &cli.history_url {
        app_config.history_url = url.clone();
    }
    let credentials = Credentials::from(cli.token.clone());

    let result = match &cli.mode {
        Mode::Join { room } => run_chat(app_config, credentials, room, &cli.nickname).await,
        Mode::Rooms => list_rooms(&app_config, credentials).await,
        Mode::History { room } => print_history(&app_config, credentials, room.as_deref()).await,
    };
    if let Err(err) = result {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn history_client(
    app_config: &ChatConfig,
    credentials: Credentials,
) -> Result<RestHistoryClient, CliError> {
    Ok(RestHistoryClient::with_timeout(
        app_config.history_url.as_str(),
        credentials,
        app_config.history_timeout(),
    )?)
}

async fn list_rooms(app_config: &ChatConfig, credentials: Credentials) -> Result<(), CliError> {
    let client = history_client(app_config, credentials)?;
    for room in client.list_rooms().await? {
        match room.name {
            Some(name) => println!("{}\t{name}", room.id),
            None => println!("{}", room.id),
        }
    }
    Ok(())
}

async fn print_history(
    app_config: &ChatConfig,
    credentials: Credentials,
    room: Option<&str>,
) -> Result<(), CliError> {
    let client = history_client(app_config, credentials)?;
    let messages = match room {
        Some(room) => client.fetch_history(room).await?,
        None => client.fetch_all_history().await?,
    };
    for message in &messages {
        print_message(message, "");
    }
    Ok(())
}

async fn run_chat(
    app_config: ChatConfig,
    credentials: Credentials,
    room: &str,
    nickname: &str,
) -> Result<(), CliError> {
    let history = history_client(&app_config, credentials.clone())?;
    let (client, mut events) =
        ChatClient::spawn(app_config, WebSocketTransport, history, credentials);

    // Print what the chat task reports while stdin is being read.
    let printer = tokio::spawn(async move {
        let mut seen = TimelinePrinter::default();
        while let Some(event) = events.recv().await {
            match event {
                ChatEvent::TimelineUpdated(timeline) => {
                    for entry in seen.unseen(&timeline) {
                        print_message(&entry.message, if entry.pending { " (sending)" } else { "" });
                    }
                }
                ChatEvent::ConnectionChanged(state) => println!("* connection {state}"),
                ChatEvent::HistoryUnavailable { room_id, error } => {
                    println!("* history for {room_id} unavailable: {error}")
                }
            }
        }
    });

    client.join_room(room, nickname).await?;
    log::info!("Chatting in {room} as {nickname} ({})", client.sender_id());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                log::warn!("Failed to read stdin: {err}");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let (content, is_icon) = match line.strip_prefix("/icon ") {
            Some(icon) => (icon.trim(), true),
            None => (line, false),
        };
        if let Err(err) = client.send_message(content, is_icon).await {
            println!("* not sent: {err}");
        }
    }

    client.disconnect().await;
    drop(client);
    let _ = printer.await;
    Ok(())
}

/// Remembers which timeline entries were already printed, so entries
/// inserted mid-timeline still show up and confirmed sends are not repeated.
#[derive(Default)]
struct TimelinePrinter {
    room_id: Option<String>,
    printed: HashSet<String>,
    /// `(sender_id, content)` of sends shown while still pending.
    sending: Vec<(String, String)>,
}

impl TimelinePrinter {
    fn unseen<'a>(&mut self, timeline: &'a Timeline) -> Vec<&'a TimelineEntry> {
        if self.room_id.as_deref() != Some(timeline.room_id()) {
            self.room_id = Some(timeline.room_id().to_string());
            self.printed.clear();
            self.sending.clear();
        }
        let mut unseen = Vec::new();
        for entry in timeline.entries() {
            if !self.printed.insert(entry_key(entry)) {
                continue;
            }
            let message = &entry.message;
            let sent = (message.sender_id.clone(), message.content.clone());
            if entry.pending {
                self.sending.push(sent);
            } else if let Some(index) = self.sending.iter().position(|shown| *shown == sent) {
                self.sending.remove(index);
                continue;
            }
            unseen.push(entry);
        }
        unseen
    }
}

fn entry_key(entry: &TimelineEntry) -> String {
    let message = &entry.message;
    match message.id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => format!("id:{id}"),
        None => format!(
            "{}:{}:{}:{}",
            if entry.pending { "pending" } else { "plain" },
            message.sent_at.to_rfc3339(),
            message.sender_id,
            message.content
        ),
    }
}

fn print_message(message: &ChatMessage, marker: &str) {
    let time = message.sent_at.format("%H:%M:%S");
    match message.message_type {
        MessageType::Join | MessageType::Leave => println!("[{time}] * {}", message.content),
        MessageType::Chat if message.is_icon => {
            println!("[{time}] {} [icon:{}]{marker}", message.sender_nickname, message.content)
        }
        MessageType::Chat => {
            println!("[{time}] {}: {}{marker}", message.sender_nickname, message.content)
        }
    }
}
