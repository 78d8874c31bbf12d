//! Scripted transport for testing.
//!
//! Each call to `connect` consumes the next [`ConnectionScript`]. A script lists
//! the lifecycle events the link emits (each after a delay, so paused-clock
//! tests stay deterministic) and how the link answers probes and sends.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{
    AckLevel, CloseSignal, Link, LinkHandle, MessageKey, Receipt, SendResponse, StatusUpdate,
    TargetInfo, Transport, TransportEvent,
};
use crate::error::TransportError;
use crate::session::Credentials;

/// Acknowledgement a scripted link emits after a successful send.
#[derive(Debug, Clone)]
pub enum ScriptedAck {
    Status(AckLevel),
    Receipt,
    /// Status update for a different message id
    Foreign(AckLevel),
}

/// Behaviour of one scripted connection.
#[derive(Debug, Clone)]
pub struct ConnectionScript {
    refuse: Option<TransportError>,
    hang: bool,
    events: Vec<(Duration, TransportEvent)>,
    probe: Option<Result<TargetInfo, TransportError>>,
    send: Option<Result<SendResponse, TransportError>>,
    send_delay: Duration,
    acks: Vec<(Duration, ScriptedAck)>,
}

impl ConnectionScript {
    fn with_events(events: Vec<(Duration, TransportEvent)>) -> Self {
        Self {
            refuse: None,
            hang: false,
            events,
            probe: None,
            send: None,
            send_delay: Duration::ZERO,
            acks: Vec::new(),
        }
    }

    /// Connection that opens immediately.
    pub fn opens() -> Self {
        Self::with_events(vec![
            (Duration::ZERO, TransportEvent::Connecting),
            (Duration::ZERO, TransportEvent::Open),
        ])
    }

    /// Connection that closes before opening.
    pub fn closes(code: Option<u16>, reason: &str) -> Self {
        let signal = CloseSignal {
            code,
            reason: Some(reason.to_string()).filter(|r| !r.is_empty()),
        };
        Self::with_events(vec![
            (Duration::ZERO, TransportEvent::Connecting),
            (Duration::from_millis(100), TransportEvent::Close(signal)),
        ])
    }

    /// Connection that never leaves CONNECTING.
    pub fn silent() -> Self {
        Self::with_events(vec![(Duration::ZERO, TransportEvent::Connecting)])
    }

    /// Connection that asks for pairing instead of opening.
    pub fn pairing(challenge: &str) -> Self {
        Self::with_events(vec![
            (Duration::ZERO, TransportEvent::Connecting),
            (
                Duration::from_millis(100),
                TransportEvent::PairingChallenge(challenge.to_string()),
            ),
        ])
    }

    /// `connect` itself fails.
    pub fn refused(err: TransportError) -> Self {
        let mut script = Self::with_events(Vec::new());
        script.refuse = Some(err);
        script
    }

    /// `connect` never returns, like a handshake the server never finishes.
    pub fn hangs() -> Self {
        let mut script = Self::with_events(Vec::new());
        script.hang = true;
        script
    }

    /// Append an event emitted `delay` after the previous one.
    pub fn with_event(mut self, delay: Duration, event: TransportEvent) -> Self {
        self.events.push((delay, event));
        self
    }

    pub fn with_probe(mut self, result: Result<TargetInfo, TransportError>) -> Self {
        self.probe = Some(result);
        self
    }

    pub fn with_send(mut self, result: Result<SendResponse, TransportError>) -> Self {
        self.send = Some(result);
        self
    }

    /// Delay before the send call answers.
    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = delay;
        self
    }

    /// Emit `ack` `delay` after a successful send.
    pub fn with_ack(mut self, delay: Duration, ack: ScriptedAck) -> Self {
        self.acks.push((delay, ack));
        self
    }
}

/// Transport that plays back connection scripts in order.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<ConnectionScript>>,
    connects: AtomicU32,
    sends: Arc<AtomicU32>,
    credentials_seen: Mutex<Vec<Option<Credentials>>>,
}

impl ScriptedTransport {
    pub fn new(scripts: impl IntoIterator<Item = ConnectionScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            connects: AtomicU32::new(0),
            sends: Arc::new(AtomicU32::new(0)),
            credentials_seen: Mutex::new(Vec::new()),
        }
    }

    /// Number of `connect` calls, including refused ones.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Number of `send_text` calls across all links.
    pub fn send_count(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    /// Credentials passed to each `connect` call, in order.
    pub fn credentials_seen(&self) -> Vec<Option<Credentials>> {
        self.credentials_seen
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Link, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.credentials_seen.lock() {
            seen.push(credentials);
        }

        let script = self
            .scripts
            .lock()
            .ok()
            .and_then(|mut scripts| scripts.pop_front())
            .ok_or_else(|| TransportError::Disconnected("no scripted connection left".into()))?;

        if let Some(err) = script.refuse {
            return Err(err);
        }
        if script.hang {
            std::future::pending::<()>().await;
        }

        let (events_tx, events_rx) = mpsc::channel(32);
        let feeder_tx = events_tx.clone();
        let events = script.events;
        let feeder = tokio::spawn(async move {
            for (delay, event) in events {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if feeder_tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let (status_tx, _) = broadcast::channel(16);
        let (receipt_tx, _) = broadcast::channel(16);

        let handle = ScriptedLink {
            keepalive: Mutex::new(Some(events_tx)),
            feeder,
            probe: script.probe,
            send: script.send,
            send_delay: script.send_delay,
            acks: script.acks,
            sends: Arc::clone(&self.sends),
            status_tx,
            receipt_tx,
        };

        Ok(Link {
            events: events_rx,
            handle: Arc::new(handle),
        })
    }
}

struct ScriptedLink {
    /// Holds the event stream open until `close`
    keepalive: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    feeder: JoinHandle<()>,
    probe: Option<Result<TargetInfo, TransportError>>,
    send: Option<Result<SendResponse, TransportError>>,
    send_delay: Duration,
    acks: Vec<(Duration, ScriptedAck)>,
    sends: Arc<AtomicU32>,
    status_tx: broadcast::Sender<StatusUpdate>,
    receipt_tx: broadcast::Sender<Receipt>,
}

#[async_trait]
impl LinkHandle for ScriptedLink {
    async fn probe_target(&self, target: &str) -> Result<TargetInfo, TransportError> {
        match &self.probe {
            Some(result) => result.clone(),
            None => Ok(TargetInfo {
                id: target.to_string(),
                subject: Some("Scripted group".to_string()),
                participants: Some(3),
            }),
        }
    }

    async fn send_text(&self, target: &str, _text: &str) -> Result<SendResponse, TransportError> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }

        let response = match &self.send {
            Some(result) => result.clone()?,
            None => SendResponse {
                message_id: Some(format!("MSG-{}", n)),
                remote: Some(target.to_string()),
            },
        };

        if let Some(id) = response.message_id.clone().filter(|id| !id.is_empty()) {
            let remote = response.remote.clone().unwrap_or_else(|| target.to_string());
            for (delay, ack) in self.acks.clone() {
                let key = MessageKey {
                    id: id.clone(),
                    remote: remote.clone(),
                };
                let status_tx = self.status_tx.clone();
                let receipt_tx = self.receipt_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    match ack {
                        ScriptedAck::Status(level) => {
                            let _ = status_tx.send(StatusUpdate { key, level });
                        }
                        ScriptedAck::Receipt => {
                            let _ = receipt_tx.send(Receipt { key });
                        }
                        ScriptedAck::Foreign(level) => {
                            let key = MessageKey {
                                id: format!("{}-other", key.id),
                                remote: key.remote,
                            };
                            let _ = status_tx.send(StatusUpdate { key, level });
                        }
                    }
                });
            }
        }

        Ok(response)
    }

    fn status_updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    fn receipts(&self) -> broadcast::Receiver<Receipt> {
        self.receipt_tx.subscribe()
    }

    async fn close(&self) {
        self.feeder.abort();
        if let Ok(mut keepalive) = self.keepalive.lock() {
            keepalive.take();
        }
    }
}

impl Drop for ScriptedLink {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripts_play_in_order() {
        let transport = ScriptedTransport::new([
            ConnectionScript::closes(Some(428), "Connection Closed"),
            ConnectionScript::opens(),
        ]);

        let mut first = transport.connect(None).await.unwrap();
        assert_eq!(first.events.recv().await, Some(TransportEvent::Connecting));
        assert!(matches!(
            first.events.recv().await,
            Some(TransportEvent::Close(CloseSignal { code: Some(428), .. }))
        ));

        let mut second = transport.connect(None).await.unwrap();
        assert_eq!(second.events.recv().await, Some(TransportEvent::Connecting));
        assert_eq!(second.events.recv().await, Some(TransportEvent::Open));

        assert!(transport.connect(None).await.is_err());
        assert_eq!(transport.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_never_returns() {
        let transport = ScriptedTransport::new([ConnectionScript::hangs()]);

        let result =
            tokio::time::timeout(Duration::from_secs(3600), transport.connect(None)).await;
        assert!(result.is_err());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_default_send_assigns_ids() {
        let transport = ScriptedTransport::new([ConnectionScript::opens()]);
        let link = transport.connect(None).await.unwrap();

        let response = link.handle.send_text("g@g.us", "hi").await.unwrap();
        assert_eq!(response.message_id.as_deref(), Some("MSG-1"));
        assert_eq!(response.remote.as_deref(), Some("g@g.us"));
        assert_eq!(transport.send_count(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_event_stream() {
        let transport = ScriptedTransport::new([ConnectionScript::opens()]);
        let mut link = transport.connect(None).await.unwrap();
        link.events.recv().await;
        link.events.recv().await;

        link.handle.close().await;
        assert_eq!(link.events.recv().await, None);
    }
}
