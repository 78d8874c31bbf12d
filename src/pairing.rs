//! Interactive pairing
//!
//! Bootstraps a session: open a connection that is allowed to ask for pairing,
//! forward every challenge to a [`PairingDisplay`], and finish once the
//! session store reports a usable session.
//!
//! The library usually closes the connection right after a successful pairing
//! and expects a reconnect. A close is therefore only a failure if the store
//! is still not ready when it happens.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{close_error, Connection, ConnectionState, Signal};
use crate::error::DispatchError;
use crate::session::SessionStore;
use crate::transport::Transport;

/// Renders a pairing challenge for out-of-band approval.
pub trait PairingDisplay: Send + Sync {
    fn show(&self, challenge: &str);
}

/// Prints challenges to stdout.
pub struct StdoutDisplay;

impl PairingDisplay for StdoutDisplay {
    fn show(&self, challenge: &str) {
        println!();
        println!("Pairing code (open Linked Devices on the phone and scan or enter it):");
        println!();
        println!("  {}", challenge);
        println!();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingSettings {
    pub max_attempts: u32,
    /// Bound on the transport connect call
    pub connect_timeout: Duration,
    /// Wait for readiness per attempt
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl PairingSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.pairing.max_attempts,
            connect_timeout: Duration::from_secs(config.dispatch.connect_timeout_secs),
            timeout: Duration::from_secs(config.pairing.timeout_secs),
            retry_delay: Duration::from_secs(config.pairing.retry_delay_secs),
        }
    }
}

pub struct PairingFlow {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    settings: PairingSettings,
}

impl PairingFlow {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<SessionStore>,
        settings: PairingSettings,
    ) -> Self {
        Self {
            transport,
            store,
            settings,
        }
    }

    /// Pair until the store holds a usable session or attempts run out.
    pub async fn run(&self, display: &dyn PairingDisplay) -> Result<(), DispatchError> {
        self.store.load().await;
        if self.store.is_ready().await {
            info!("Session already paired");
            return Ok(());
        }

        let mut last_error = None;
        for attempt in 1..=self.settings.max_attempts {
            info!(attempt = attempt, max = self.settings.max_attempts, "Pairing attempt");
            match self.attempt(display).await {
                Ok(()) => {
                    info!(identity = ?self.identity().await, "Session paired");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Pairing attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < self.settings.max_attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DispatchError::AuthNotReady("pairing was not attempted".to_string())
        }))
    }

    async fn attempt(&self, display: &dyn PairingDisplay) -> Result<(), DispatchError> {
        let mut connection = Connection::establish_within(
            self.transport.as_ref(),
            Arc::clone(&self.store),
            self.settings.connect_timeout,
        )
        .await?;

        let ready = self.store.wait_ready(self.settings.timeout);
        tokio::pin!(ready);

        let result = loop {
            tokio::select! {
                is_ready = &mut ready => {
                    break if is_ready {
                        Ok(())
                    } else {
                        Err(DispatchError::AuthNotReady(format!(
                            "pairing not completed within {}s",
                            self.settings.timeout.as_secs()
                        )))
                    };
                }
                signal = connection.next_signal() => match signal {
                    Signal::Challenge(code) => display.show(&code),
                    Signal::State(ConnectionState::Open) => {
                        debug!("Connection open, waiting for credentials");
                    }
                    Signal::State(ConnectionState::Closed { reason, detail }) => {
                        break if self.store.is_ready().await {
                            Ok(())
                        } else {
                            Err(close_error(reason, &detail))
                        };
                    }
                    Signal::State(ConnectionState::Connecting) => {}
                },
            }
        };

        connection.close().await;
        result
    }

    async fn identity(&self) -> Option<String> {
        self.store
            .current()
            .await
            .and_then(|c| c.identity_id().map(str::to_string))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Credentials;
    use crate::transport::mock::{ConnectionScript, ScriptedTransport};
    use crate::transport::{CloseSignal, TransportEvent};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDisplay {
        shown: Mutex<Vec<String>>,
    }

    impl RecordingDisplay {
        fn challenges(&self) -> Vec<String> {
            self.shown.lock().unwrap().clone()
        }
    }

    impl PairingDisplay for RecordingDisplay {
        fn show(&self, challenge: &str) {
            self.shown.lock().unwrap().push(challenge.to_string());
        }
    }

    fn settings() -> PairingSettings {
        PairingSettings {
            max_attempts: 3,
            connect_timeout: Duration::from_secs(60),
            timeout: Duration::from_secs(180),
            retry_delay: Duration::from_secs(5),
        }
    }

    fn paired() -> Credentials {
        Credentials::new(json!({ "registered": true, "me": { "id": "5511:2@s.whatsapp.net" } }))
    }

    #[tokio::test]
    async fn test_pairing_shows_challenge_and_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("creds.json")));
        let transport = Arc::new(ScriptedTransport::new([ConnectionScript::pairing("2@ref,key")
            .with_event(
                Duration::from_millis(50),
                TransportEvent::CredentialsRotated(paired()),
            )
            .with_event(
                Duration::from_millis(10),
                TransportEvent::Close(CloseSignal::new(Some(515), "restart required")),
            )]));

        let display = RecordingDisplay::default();
        let flow = PairingFlow::new(transport, Arc::clone(&store), settings());
        flow.run(&display).await.unwrap();

        assert_eq!(display.challenges(), vec!["2@ref,key".to_string()]);
        assert!(SessionStore::new(store.path()).load().await.unwrap().is_ready());
    }

    #[tokio::test]
    async fn test_already_paired_opens_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, serde_json::to_vec(&paired()).unwrap()).unwrap();

        let transport = Arc::new(ScriptedTransport::new(Vec::new()));
        let flow = PairingFlow::new(
            transport.clone(),
            Arc::new(SessionStore::new(&path)),
            settings(),
        );
        flow.run(&RecordingDisplay::default()).await.unwrap();
        assert_eq!(transport.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logged_out_closes_exhaust_attempts() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("creds.json")));
        let transport = Arc::new(ScriptedTransport::new([
            ConnectionScript::closes(Some(401), "Connection Failure"),
            ConnectionScript::closes(Some(401), "Connection Failure"),
            ConnectionScript::closes(Some(401), "Connection Failure"),
        ]));

        let flow = PairingFlow::new(transport.clone(), store, settings());
        let err = flow.run(&RecordingDisplay::default()).await.unwrap_err();

        assert!(matches!(err, DispatchError::LoggedOut(_)));
        assert_eq!(transport.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_connect_counts_as_a_failed_attempt() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("creds.json")));
        let transport = Arc::new(ScriptedTransport::new([
            ConnectionScript::hangs(),
            ConnectionScript::pairing("2@second").with_event(
                Duration::from_millis(50),
                TransportEvent::CredentialsRotated(paired()),
            ),
        ]));
        let started = tokio::time::Instant::now();

        let display = RecordingDisplay::default();
        let flow = PairingFlow::new(transport.clone(), store, settings());
        flow.run(&display).await.unwrap();

        assert_eq!(transport.connect_count(), 2);
        assert_eq!(display.challenges(), vec!["2@second".to_string()]);
        // 60s connect bound, 5s retry delay, then the second attempt
        assert!(started.elapsed() < Duration::from_secs(70));
    }
}
