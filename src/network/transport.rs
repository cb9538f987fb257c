use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::error::TransportError;

/// Close code of a deliberate, normal shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the socket dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

const STOMP_SUBPROTOCOL: &str = "v12.stomp";

/// Raw event read off a physical connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    Closed { code: u16, reason: String },
}

/// Instruction for the socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// One open physical connection. The writer task stops once the outbound
/// channel closes; the reader task is aborted when the session is dropped.
pub struct TransportSession {
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    reader: Option<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    /// Tie the task feeding `inbound` to this session's lifetime.
    pub fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Next inbound event. A vanished IO task reads as an abnormal closure.
    pub async fn next_event(&mut self) -> TransportEvent {
        self.inbound
            .recv()
            .await
            .unwrap_or_else(|| TransportEvent::Closed {
                code: ABNORMAL_CLOSURE,
                reason: "transport task ended".to_string(),
            })
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens physical connections to the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<TransportSession, TransportError>;
}

/// WebSocket transport negotiating the STOMP 1.2 sub-protocol.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<TransportSession, TransportError> {
        let connect_failed = |message: String| TransportError::ConnectFailed {
            url: url.to_string(),
            message,
        };

        let mut request = url
            .into_client_request()
            .map_err(|err| connect_failed(err.to_string()))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(STOMP_SUBPROTOCOL),
        );

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|err| connect_failed(err.to_string()))?;
        log::debug!("WebSocket opened to {url}");

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<TransportEvent>();

        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Text(text) => {
                        if let Err(err) = write.send(Message::Text(text.into())).await {
                            log::warn!("WebSocket write failed: {err}");
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(err) = write.send(Message::Close(Some(frame))).await {
                            log::debug!("WebSocket close frame not sent: {err}");
                        }
                        return;
                    }
                }
            }
            let _ = write.close().await;
        });

        let reader = tokio::spawn(async move {
            loop {
                let event = match read.next().await {
                    Some(Ok(Message::Text(text))) => TransportEvent::Text(text.to_string()),
                    Some(Ok(Message::Binary(bytes))) => {
                        TransportEvent::Text(String::from_utf8_lossy(&bytes).into_owned())
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = inbound_tx.send(TransportEvent::Closed { code, reason });
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        let _ = inbound_tx.send(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: err.to_string(),
                        });
                        break;
                    }
                    None => {
                        let _ = inbound_tx.send(TransportEvent::Closed {
                            code: ABNORMAL_CLOSURE,
                            reason: "stream ended".to_string(),
                        });
                        break;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(TransportSession::new(outbound_tx, inbound_rx).with_reader(reader))
    }
}
