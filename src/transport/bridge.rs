//! WebSocket Bridge Transport
//!
//! Single responsibility: speak JSON frames to a bridge process that hosts the
//! messaging library, and turn its frames into transport events.
//!
//! # Frames
//!
//! Every frame is a JSON text message tagged by `"type"`.
//!
//! ```text
//! courier -> bridge   connect { credentials }
//!                     probe   { id, target }
//!                     send    { id, target, text }
//!                     end
//!
//! bridge -> courier   connection     { state: connecting|open|close, code?, reason? }
//!                     pairing        { code }
//!                     creds          { credentials }
//!                     message_status { id, remote, status }
//!                     receipt        { id, remote }
//!                     response       { id, ok, result?, error?, rejected? }
//! ```
//!
//! Requests are matched to responses by a per-connection id counter. When the
//! socket goes away every pending request fails with `Disconnected`.

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::{frame::coding::CloseCode, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{
    AckLevel, CloseSignal, Link, LinkHandle, MessageKey, Receipt, SendResponse, StatusUpdate,
    TargetInfo, Transport, TransportEvent,
};
use crate::error::TransportError;
use crate::session::Credentials;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>>;

const EVENT_BUFFER: usize = 256;
const ACK_BUFFER: usize = 64;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Outbound<'a> {
    Connect {
        credentials: Option<&'a Credentials>,
    },
    Probe {
        id: u64,
        target: &'a str,
    },
    Send {
        id: u64,
        target: &'a str,
        text: &'a str,
    },
    End,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum LinkState {
    Connecting,
    Open,
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Connection {
        state: LinkState,
        #[serde(default)]
        code: Option<u16>,
        #[serde(default)]
        reason: Option<String>,
    },
    Pairing {
        code: String,
    },
    Creds {
        credentials: Credentials,
    },
    MessageStatus {
        id: String,
        remote: String,
        status: u8,
    },
    Receipt {
        id: String,
        remote: String,
    },
    Response {
        id: u64,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        rejected: bool,
    },
}

/// Transport that talks to the messaging library through a WebSocket bridge.
pub struct BridgeTransport {
    url: String,
    request_timeout: Duration,
}

impl BridgeTransport {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            request_timeout,
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Link, TransportError> {
        debug!(url = %self.url, "Connecting to messaging bridge");

        let (ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Disconnected(format!("bridge connect failed: {}", e)))?;
        let (mut sink, stream) = ws.split();

        let hello = Outbound::Connect {
            credentials: credentials.as_ref(),
        };
        send_frame(&mut sink, &hello).await?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (status_tx, _) = broadcast::channel(ACK_BUFFER);
        let (receipt_tx, _) = broadcast::channel(ACK_BUFFER);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let recv_task = tokio::spawn(receiver_loop(
            stream,
            events_tx,
            status_tx.clone(),
            receipt_tx.clone(),
            Arc::clone(&pending),
        ));

        info!(url = %self.url, "Bridge link established");

        let handle = BridgeLink {
            sink: Mutex::new(sink),
            next_id: AtomicU64::new(1),
            pending,
            status_tx,
            receipt_tx,
            request_timeout: self.request_timeout,
            recv_task,
        };

        Ok(Link {
            events: events_rx,
            handle: Arc::new(handle),
        })
    }
}

/// Request half of a bridge connection.
struct BridgeLink {
    sink: Mutex<WsSink>,
    next_id: AtomicU64,
    pending: Pending,
    status_tx: broadcast::Sender<StatusUpdate>,
    receipt_tx: broadcast::Sender<Receipt>,
    request_timeout: Duration,
    recv_task: tokio::task::JoinHandle<()>,
}

impl BridgeLink {
    async fn request<'a, F>(&self, frame: F) -> Result<Value, TransportError>
    where
        F: FnOnce(u64) -> Outbound<'a>,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let outbound = frame(id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let sent = {
            let mut sink = self.sink.lock().await;
            send_frame(&mut sink, &outbound).await
        };
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected("response channel closed".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TransportError::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl LinkHandle for BridgeLink {
    async fn probe_target(&self, target: &str) -> Result<TargetInfo, TransportError> {
        let value = self.request(|id| Outbound::Probe { id, target }).await?;
        let mut info: TargetInfo = serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("malformed probe result: {}", e)))?;
        if info.id.is_empty() {
            info.id = target.to_string();
        }
        Ok(info)
    }

    async fn send_text(&self, target: &str, text: &str) -> Result<SendResponse, TransportError> {
        let value = self.request(|id| Outbound::Send { id, target, text }).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("malformed send result: {}", e)))
    }

    fn status_updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    fn receipts(&self) -> broadcast::Receiver<Receipt> {
        self.receipt_tx.subscribe()
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        if send_frame(&mut sink, &Outbound::End).await.is_ok() {
            let _ = sink.close().await;
        }
        debug!("Bridge link closed");
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

async fn send_frame(sink: &mut WsSink, frame: &Outbound<'_>) -> Result<(), TransportError> {
    let text = serde_json::to_string(frame)
        .map_err(|e| TransportError::Protocol(format!("failed to encode frame: {}", e)))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| TransportError::Disconnected(format!("failed to send: {}", e)))
}

/// Receiver loop - runs in a spawned task for the lifetime of the link.
async fn receiver_loop(
    mut stream: WsStream,
    events: mpsc::Sender<TransportEvent>,
    status_tx: broadcast::Sender<StatusUpdate>,
    receipt_tx: broadcast::Sender<Receipt>,
    pending: Pending,
) {
    let mut closed = false;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<Inbound>(&text) {
                Ok(frame) => {
                    if let Some(event) = route(frame, &status_tx, &receipt_tx, &pending).await {
                        closed |= matches!(event, TransportEvent::Close(_));
                        if events.send(event).await.is_err() {
                            debug!("Event consumer gone, stopping receiver");
                            break;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring undecodable bridge frame"),
            },
            Ok(Message::Close(frame)) => {
                info!(frame = ?frame, "Bridge closed connection");
                if !closed {
                    let signal = match frame {
                        Some(f) => CloseSignal {
                            code: (f.code != CloseCode::Normal).then(|| u16::from(f.code)),
                            reason: Some(f.reason.to_string()).filter(|r| !r.is_empty()),
                        },
                        None => CloseSignal::default(),
                    };
                    let _ = events.send(TransportEvent::Close(signal)).await;
                    closed = true;
                }
                break;
            }
            Err(e) => {
                error!(error = %e, "Bridge WebSocket error");
                if !closed {
                    let signal = CloseSignal::new(None, format!("bridge socket error: {}", e));
                    let _ = events.send(TransportEvent::Close(signal)).await;
                    closed = true;
                }
                break;
            }
            _ => {}
        }
    }

    if !closed {
        let _ = events
            .send(TransportEvent::Close(CloseSignal::new(None, "bridge stream ended")))
            .await;
    }

    let mut pending = pending.lock().await;
    for (id, tx) in pending.drain() {
        debug!(id = id, "Failing pending request");
        let _ = tx.send(Err(TransportError::Disconnected("link closed".into())));
    }
}

/// Turn a decoded frame into an event, or deliver it to its subscribers.
async fn route(
    frame: Inbound,
    status_tx: &broadcast::Sender<StatusUpdate>,
    receipt_tx: &broadcast::Sender<Receipt>,
    pending: &Pending,
) -> Option<TransportEvent> {
    match frame {
        Inbound::Connection { state, code, reason } => Some(match state {
            LinkState::Connecting => TransportEvent::Connecting,
            LinkState::Open => TransportEvent::Open,
            LinkState::Close => TransportEvent::Close(CloseSignal { code, reason }),
        }),
        Inbound::Pairing { code } => Some(TransportEvent::PairingChallenge(code)),
        Inbound::Creds { credentials } => Some(TransportEvent::CredentialsRotated(credentials)),
        Inbound::MessageStatus { id, remote, status } => {
            // No subscribers is fine
            let _ = status_tx.send(StatusUpdate {
                key: MessageKey { id, remote },
                level: AckLevel::from_code(status),
            });
            None
        }
        Inbound::Receipt { id, remote } => {
            let _ = receipt_tx.send(Receipt {
                key: MessageKey { id, remote },
            });
            None
        }
        Inbound::Response {
            id,
            ok,
            result,
            error,
            rejected,
        } => {
            let outcome = if ok {
                Ok(result)
            } else {
                let message = error.unwrap_or_else(|| "request failed".to_string());
                if rejected {
                    Err(TransportError::Rejected(message))
                } else {
                    Err(TransportError::Protocol(message))
                }
            };
            match pending.lock().await.remove(&id) {
                Some(tx) => {
                    let _ = tx.send(outcome);
                }
                None => debug!(id = id, "Response for unknown or expired request"),
            }
            None
        }
    }
}
