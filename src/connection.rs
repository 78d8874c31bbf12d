//! Connection State Machine
//!
//! Single responsibility: track one transport connection from CONNECTING to
//! OPEN to CLOSED, and classify why it closed.
//!
//! ```text
//!   CONNECTING ──open──▶ OPEN
//!       │                 │
//!       └──close──▶ CLOSED(reason) ◀──close──┘
//! ```
//!
//! CLOSED is terminal for a `Connection`. Reconnecting means establishing a new
//! one; the old instance is dropped, which aborts its event pump.
//!
//! Pairing challenges never change state; they are forwarded to whoever is
//! waiting on the connection. Credential rotations are persisted through the
//! [`SessionStore`] from inside the event pump, so they are written in arrival
//! order regardless of what the state is.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::pairing::PairingDisplay;
use crate::session::SessionStore;
use crate::transport::{CloseSignal, LinkHandle, Transport, TransportEvent};

const CHALLENGE_BUFFER: usize = 8;

/// Classified reason for a close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Credentials were revoked; reconnecting cannot help
    LoggedOut,
    Transient,
    /// Close carried no code and no reason
    Unknown,
}

impl CloseReason {
    /// Map a raw close to a reason.
    ///
    /// Status code 401, or a reason mentioning "logged out" or a removed
    /// device, means the session was revoked. Everything else is worth
    /// another connection.
    pub fn classify(signal: &CloseSignal) -> Self {
        let reason = signal
            .reason
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();

        if signal.code == Some(401)
            || reason.contains("logged out")
            || reason.contains("loggedout")
            || reason.contains("device_removed")
            || reason.contains("device removed")
        {
            Self::LoggedOut
        } else if signal.code.is_none() && reason.trim().is_empty() {
            Self::Unknown
        } else {
            Self::Transient
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::LoggedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoggedOut => "LOGGED_OUT",
            Self::Transient => "TRANSIENT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Lifecycle state of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed { reason: CloseReason, detail: String },
}

impl ConnectionState {
    /// Apply a transport event. Events that do not drive the lifecycle leave
    /// the state unchanged, and nothing leaves `Closed`.
    pub fn on_event(self, event: &TransportEvent) -> Self {
        match (self, event) {
            (closed @ Self::Closed { .. }, _) => closed,
            (_, TransportEvent::Close(signal)) => Self::Closed {
                reason: CloseReason::classify(signal),
                detail: signal.describe(),
            },
            (Self::Connecting, TransportEvent::Open) => Self::Open,
            (state, _) => state,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "CONNECTING",
            Self::Open => "OPEN",
            Self::Closed { .. } => "CLOSED",
        }
    }
}

/// What to do with a pairing challenge while waiting for OPEN.
#[derive(Clone, Copy)]
pub enum PairingPolicy<'a> {
    /// Unattended run: a challenge means the session is not usable
    Reject,
    Display(&'a dyn PairingDisplay),
}

/// Next thing observed on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    Challenge(String),
    State(ConnectionState),
}

/// One live transport connection.
pub struct Connection {
    link: Arc<dyn LinkHandle>,
    state_rx: watch::Receiver<ConnectionState>,
    challenges: mpsc::Receiver<String>,
    pump: JoinHandle<()>,
}

impl Connection {
    /// Start a transport connection with the store's current credentials.
    ///
    /// Returns as soon as the transport accepted the connect call; the
    /// connection starts in CONNECTING.
    pub async fn establish(
        transport: &dyn Transport,
        store: Arc<SessionStore>,
    ) -> Result<Self, DispatchError> {
        let credentials = store.current().await;
        debug!(has_credentials = credentials.is_some(), "Opening transport connection");

        let link = transport.connect(credentials).await?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (challenge_tx, challenges) = mpsc::channel(CHALLENGE_BUFFER);
        let pump = tokio::spawn(event_pump(link.events, store, state_tx, challenge_tx));

        Ok(Self {
            link: link.handle,
            state_rx,
            challenges,
            pump,
        })
    }

    /// [`Connection::establish`], failing with `ConnectTimeout` if the
    /// transport has not accepted the connect call within `limit`.
    pub async fn establish_within(
        transport: &dyn Transport,
        store: Arc<SessionStore>,
        limit: Duration,
    ) -> Result<Self, DispatchError> {
        match tokio::time::timeout(limit, Self::establish(transport, store)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(limit_secs = limit.as_secs(), "Transport connect stalled");
                Err(DispatchError::ConnectTimeout(limit.as_secs()))
            }
        }
    }

    /// Connect and wait for OPEN, both within one `limit`.
    ///
    /// On failure the half-open connection is closed before returning.
    pub async fn open(
        transport: &dyn Transport,
        store: Arc<SessionStore>,
        limit: Duration,
        pairing: PairingPolicy<'_>,
    ) -> Result<Self, DispatchError> {
        let deadline = Instant::now() + limit;
        let mut connection = Self::establish_within(transport, store, limit).await?;

        if let Err(e) = connection.wait_open_until(deadline, limit, pairing).await {
            connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Protocol handle of this connection.
    pub fn link(&self) -> Arc<dyn LinkHandle> {
        Arc::clone(&self.link)
    }

    /// Wait for the next challenge or state change.
    pub async fn next_signal(&mut self) -> Signal {
        tokio::select! {
            Some(code) = self.challenges.recv() => Signal::Challenge(code),
            _ = self.state_rx.changed() => Signal::State(self.state_rx.borrow_and_update().clone()),
        }
    }

    /// Pairing challenge that arrived and has not been consumed yet.
    pub fn take_challenge(&mut self) -> Option<String> {
        self.challenges.try_recv().ok()
    }

    /// Wait until the connection is OPEN, bounded by `limit`.
    pub async fn wait_open(
        &mut self,
        limit: Duration,
        pairing: PairingPolicy<'_>,
    ) -> Result<(), DispatchError> {
        self.wait_open_until(Instant::now() + limit, limit, pairing)
            .await
    }

    async fn wait_open_until(
        &mut self,
        deadline: Instant,
        limit: Duration,
        pairing: PairingPolicy<'_>,
    ) -> Result<(), DispatchError> {
        loop {
            let state = self.state_rx.borrow_and_update().clone();
            match state {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closed { reason, detail } => {
                    return Err(close_error(reason, &detail))
                }
                ConnectionState::Connecting => {}
            }

            match tokio::time::timeout_at(deadline, self.next_signal()).await {
                Err(_) => return Err(DispatchError::ConnectTimeout(limit.as_secs())),
                Ok(Signal::State(_)) => continue,
                Ok(Signal::Challenge(code)) => match pairing {
                    PairingPolicy::Reject => {
                        warn!("Pairing challenge received on an unattended run");
                        return Err(DispatchError::AuthNotReady(
                            "pairing challenge received; the stored session is not accepted, run `courier authenticate`"
                                .to_string(),
                        ));
                    }
                    PairingPolicy::Display(display) => display.show(&code),
                },
            }
        }
    }

    /// End the connection.
    pub async fn close(&self) {
        self.link.close().await;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Error for a connection that closed before it was useful.
pub fn close_error(reason: CloseReason, detail: &str) -> DispatchError {
    match reason {
        CloseReason::LoggedOut => DispatchError::LoggedOut(format!(
            "{}; delete the credential file and run `courier authenticate`",
            detail
        )),
        _ if detail.to_ascii_lowercase().contains("replaced") => DispatchError::Transport(format!(
            "connection closed: {} (another client took over this session; avoid overlapping runs)",
            detail
        )),
        _ => DispatchError::Transport(format!("connection closed: {}", detail)),
    }
}

/// Event pump - runs in a spawned task for the lifetime of the connection.
async fn event_pump(
    mut events: mpsc::Receiver<TransportEvent>,
    store: Arc<SessionStore>,
    state_tx: watch::Sender<ConnectionState>,
    challenge_tx: mpsc::Sender<String>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::CredentialsRotated(creds) => {
                debug!(ready = creds.is_ready(), "Credential rotation");
                if let Err(e) = store.on_rotate(creds).await {
                    error!(error = %e, "Failed to persist rotated credentials");
                }
            }
            TransportEvent::PairingChallenge(code) => {
                info!("Pairing challenge received");
                if challenge_tx.try_send(code).is_err() {
                    debug!("Pairing challenge dropped, nobody is waiting");
                }
            }
            event => {
                let current = state_tx.borrow().clone();
                let next = current.clone().on_event(&event);
                if next != current {
                    match &next {
                        ConnectionState::Closed { reason, detail } => info!(
                            from = current.label(),
                            reason = reason.as_str(),
                            detail = %detail,
                            "Connection closed"
                        ),
                        state => info!(from = current.label(), to = state.label(), "Connection state"),
                    }
                    state_tx.send_replace(next);
                }
            }
        }
    }

    if !state_tx.borrow().is_closed() {
        debug!("Transport event stream ended");
        state_tx.send_replace(ConnectionState::Closed {
            reason: CloseReason::Unknown,
            detail: "transport event stream ended".to_string(),
        });
    }
}
