//! Session keep-alive
//!
//! Opens the stored session, holds the connection long enough for pending
//! credential rotations to be persisted, then closes it. Run periodically so a
//! session that is rarely used for sending does not go stale.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::{close_error, Connection, ConnectionState, PairingPolicy, Signal};
use crate::error::DispatchError;
use crate::session::SessionStore;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveSettings {
    pub connect_timeout: Duration,
    pub hold: Duration,
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
}

impl KeepAliveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.dispatch.connect_timeout_secs),
            hold: Duration::from_secs(config.keepalive.hold_secs),
            max_reconnects: config.keepalive.max_reconnects,
            reconnect_delay: Duration::from_secs(config.keepalive.reconnect_delay_secs),
        }
    }
}

pub struct KeepAlive {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    settings: KeepAliveSettings,
}

impl KeepAlive {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<SessionStore>,
        settings: KeepAliveSettings,
    ) -> Self {
        Self {
            transport,
            store,
            settings,
        }
    }

    /// Hold one connection, reconnecting after transient closes.
    ///
    /// Returns the number of reconnects that were needed.
    pub async fn run(&self) -> Result<u32, DispatchError> {
        self.store.load().await;
        if !self.store.is_ready().await {
            return Err(DispatchError::AuthNotReady(format!(
                "{}; run `courier authenticate` first",
                self.store.describe().await
            )));
        }

        let mut reconnects = 0;
        loop {
            match self.hold_once().await {
                Ok(()) => {
                    info!(reconnects = reconnects, "Session refreshed");
                    return Ok(reconnects);
                }
                Err(e) if e.is_retryable() && reconnects < self.settings.max_reconnects => {
                    reconnects += 1;
                    warn!(
                        error = %e,
                        reconnect = reconnects,
                        max = self.settings.max_reconnects,
                        "Keep-alive connection lost, reconnecting"
                    );
                    tokio::time::sleep(self.settings.reconnect_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn hold_once(&self) -> Result<(), DispatchError> {
        let mut connection = Connection::open(
            self.transport.as_ref(),
            Arc::clone(&self.store),
            self.settings.connect_timeout,
            PairingPolicy::Reject,
        )
        .await?;
        info!(hold_secs = self.settings.hold.as_secs(), "Connection open, holding");

        let result = hold(&mut connection, self.settings.hold).await;
        connection.close().await;
        result
    }
}

async fn hold(connection: &mut Connection, period: Duration) -> Result<(), DispatchError> {
    let until = Instant::now() + period;
    loop {
        match tokio::time::timeout_at(until, connection.next_signal()).await {
            Err(_) => return Ok(()),
            Ok(Signal::State(ConnectionState::Closed { reason, detail })) => {
                return Err(close_error(reason, &detail))
            }
            Ok(Signal::Challenge(_)) => {
                return Err(DispatchError::AuthNotReady(
                    "pairing challenge received while holding the session".to_string(),
                ))
            }
            Ok(Signal::State(_)) => {}
        }
    }
}
