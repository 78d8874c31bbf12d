//! Session Store
//!
//! Single responsibility: own the persisted session credentials.
//!
//! The credential blob belongs to the messaging library. The only thing this
//! crate reads from it is the readiness predicate: a session is usable when it
//! is registered and carries an identity id.
//!
//! Rotations reach the store from two writers: this process (through
//! [`SessionStore::on_rotate`]) and, possibly, the library writing the same
//! file on its own. Readiness therefore looks at memory first and then at the
//! file on disk.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::atomic::write_atomic;
use crate::error::DispatchError;

/// Where the identity id lives inside the blob; first match wins.
const IDENTITY_POINTERS: [&str; 2] = ["/me/id", "/identity/id"];

/// Opaque session credentials produced by the messaging library.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(Value);

impl Credentials {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// `registered` flag of the blob; absent counts as not registered.
    pub fn registered(&self) -> bool {
        self.0
            .get("registered")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Identity id of the paired account, if any.
    pub fn identity_id(&self) -> Option<&str> {
        IDENTITY_POINTERS
            .iter()
            .filter_map(|p| self.0.pointer(p).and_then(Value::as_str))
            .find(|id| !id.is_empty())
    }

    /// Readiness predicate: registered and identified.
    pub fn is_ready(&self) -> bool {
        self.registered() && self.identity_id().is_some()
    }
}

/// Persisted credentials for one session.
pub struct SessionStore {
    path: PathBuf,
    current: RwLock<Option<Credentials>>,
    /// Serializes persists; one write per credential file at a time
    write_lock: Mutex<()>,
    poll_interval: Duration,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(None),
            write_lock: Mutex::new(()),
            poll_interval: Duration::from_millis(400),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Load credentials from disk into memory.
    ///
    /// A missing or unreadable file means "no session", never an error.
    pub async fn load(&self) -> Option<Credentials> {
        let creds = read_credentials(&self.path).await;
        match &creds {
            Some(c) => info!(
                path = %self.path.display(),
                ready = c.is_ready(),
                "Loaded session credentials"
            ),
            None => info!(path = %self.path.display(), "No session credentials on disk"),
        }
        *self.current.write().await = creds.clone();
        creds
    }

    /// Credentials currently held in memory.
    pub async fn current(&self) -> Option<Credentials> {
        self.current.read().await.clone()
    }

    /// Handle a credential rotation from the transport.
    pub async fn on_rotate(&self, creds: Credentials) -> Result<(), DispatchError> {
        *self.current.write().await = Some(creds.clone());
        self.persist(&creds).await
    }

    /// Durably write credentials (temp file, then rename).
    pub async fn persist(&self, creds: &Credentials) -> Result<(), DispatchError> {
        let _guard = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(creds)?;
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), "Credentials persisted");
        Ok(())
    }

    /// True when either the in-memory or the on-disk credentials are usable.
    pub async fn is_ready(&self) -> bool {
        if self
            .current
            .read()
            .await
            .as_ref()
            .map(Credentials::is_ready)
            .unwrap_or(false)
        {
            return true;
        }
        read_credentials(&self.path)
            .await
            .map(|c| c.is_ready())
            .unwrap_or(false)
    }

    /// Poll readiness until it holds or `limit` elapses.
    pub async fn wait_ready(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.is_ready().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Describe why the stored session is not usable.
    pub async fn describe(&self) -> String {
        let creds = match self.current().await {
            Some(c) => Some(c),
            None => read_credentials(&self.path).await,
        };
        match creds {
            None => format!("no credentials at {}", self.path.display()),
            Some(c) => format!(
                "identity={} registered={}",
                c.identity_id().unwrap_or("null"),
                c.registered()
            ),
        }
    }
}

async fn read_credentials(path: &Path) -> Option<Credentials> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Credential file unreadable");
            return None;
        }
    };
    if raw.trim().len() < 2 {
        return None;
    }
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Some(Credentials::new(value)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Credential file is not valid JSON");
            None
        }
    }
}
