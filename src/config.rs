//! Configuration for courier

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::{Backoff, DispatchBudget};
use crate::error::DispatchError;

/// Configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub status: StatusConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub confirm: ConfirmConfig,

    #[serde(default)]
    pub pairing: PairingConfig,

    #[serde(default)]
    pub keepalive: KeepAliveConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory holding `creds.json`
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Where the delivery status record is written
    #[serde(default = "default_status_file")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// WebSocket endpoint of the messaging bridge
    #[serde(default = "default_bridge_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum dispatch attempts per job
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-attempt wait for the connection to open, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Pause after OPEN before the first protocol call, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Timeout for probe and send calls, in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Whole-job budget, in seconds
    #[serde(default = "default_overall_deadline")]
    pub overall_deadline_secs: u64,

    /// Backoff base in milliseconds (delay = base * attempt^2)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmConfig {
    /// Best-effort delivery confirmation wait, in milliseconds
    #[serde(default = "default_confirm_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    #[serde(default = "default_pairing_attempts")]
    pub max_attempts: u32,

    /// How long one attempt waits for the session to become ready, in seconds
    #[serde(default = "default_pairing_timeout")]
    pub timeout_secs: u64,

    /// Pause between attempts, in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    /// How long an open connection is held, in seconds
    #[serde(default = "default_hold")]
    pub hold_secs: u64,

    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: u32,

    #[serde(default = "default_retry_delay")]
    pub reconnect_delay_secs: u64,
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("auth")
}

fn default_ready_poll_ms() -> u64 {
    400
}

fn default_status_file() -> PathBuf {
    PathBuf::from("send_status.json")
}

fn default_bridge_url() -> String {
    "ws://127.0.0.1:8787".to_string()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_settle_delay() -> u64 {
    6_000
}

fn default_query_timeout() -> u64 {
    60
}

fn default_overall_deadline() -> u64 {
    300
}

fn default_backoff_base() -> u64 {
    2_000
}

fn default_backoff_cap() -> u64 {
    30_000
}

fn default_confirm_timeout() -> u64 {
    10_000
}

fn default_pairing_attempts() -> u32 {
    3
}

fn default_pairing_timeout() -> u64 {
    180
}

fn default_retry_delay() -> u64 {
    5
}

fn default_hold() -> u64 {
    10
}

fn default_max_reconnects() -> u32 {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_dir: default_auth_dir(),
            ready_poll_ms: default_ready_poll_ms(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            file: default_status_file(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            connect_timeout_secs: default_connect_timeout(),
            settle_delay_ms: default_settle_delay(),
            query_timeout_secs: default_query_timeout(),
            overall_deadline_secs: default_overall_deadline(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_confirm_timeout(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_pairing_attempts(),
            timeout_secs: default_pairing_timeout(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            hold_secs: default_hold(),
            max_reconnects: default_max_reconnects(),
            reconnect_delay_secs: default_retry_delay(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, DispatchError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config =
            toml::from_str(&content).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the retry loop meaningless.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.dispatch.max_attempts == 0 {
            return Err(DispatchError::Config(
                "dispatch.max_attempts must be at least 1".into(),
            ));
        }
        if self.dispatch.backoff_cap_ms < self.dispatch.backoff_base_ms {
            return Err(DispatchError::Config(
                "dispatch.backoff_cap_ms must not be below backoff_base_ms".into(),
            ));
        }
        if self.pairing.max_attempts == 0 {
            return Err(DispatchError::Config(
                "pairing.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Path of the credential file inside the auth directory
    pub fn creds_path(&self) -> PathBuf {
        self.session.auth_dir.join("creds.json")
    }

    /// Attempt budget handed to the dispatch controller
    pub fn budget(&self) -> DispatchBudget {
        let d = &self.dispatch;
        DispatchBudget {
            max_attempts: d.max_attempts,
            connect_timeout: Duration::from_secs(d.connect_timeout_secs),
            settle_delay: Duration::from_millis(d.settle_delay_ms),
            query_timeout: Duration::from_secs(d.query_timeout_secs),
            overall_deadline: Duration::from_secs(d.overall_deadline_secs),
            confirmation_timeout: Duration::from_millis(self.confirm.timeout_ms),
            backoff: Backoff {
                base: Duration::from_millis(d.backoff_base_ms),
                cap: Duration::from_millis(d.backoff_cap_ms),
            },
        }
    }
}
