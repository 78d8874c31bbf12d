//! Status Reporter
//!
//! Writes the Delivery Status Record, the one file downstream tooling polls.
//! Writes are atomic. Once a success has been recorded in this run, later
//! failure reports are suppressed so a send that already happened is never
//! reported as failed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::atomic::write_atomic;
use crate::dispatch::SentMessage;
use crate::error::DispatchError;

/// Persisted outcome of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatus {
    pub success: bool,
    /// RFC 3339
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_target: Option<String>,
    /// Classified error kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl DeliveryStatus {
    pub fn success(message: &SentMessage, attempts: u32) -> Self {
        Self {
            success: true,
            timestamp: Utc::now().to_rfc3339(),
            message_id: Some(message.message_id.clone()),
            remote_target: Some(message.remote_target.clone()),
            error: None,
            detail: None,
            attempts,
        }
    }

    pub fn failure(error: &DispatchError, attempts: u32) -> Self {
        Self {
            success: false,
            timestamp: Utc::now().to_rfc3339(),
            message_id: None,
            remote_target: None,
            error: Some(error.kind().to_string()),
            detail: Some(error.to_string()),
            attempts,
        }
    }

    /// A success always names the message it sent.
    pub fn is_consistent(&self) -> bool {
        !self.success
            || self
                .message_id
                .as_deref()
                .map(|id| !id.is_empty())
                .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct ReporterState {
    success_recorded: bool,
    writes: u32,
}

/// Single writer of the status file for this process.
pub struct StatusReporter {
    path: PathBuf,
    state: Mutex<ReporterState>,
}

impl StatusReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(ReporterState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an outcome.
    ///
    /// Returns `Ok(false)` when the record was suppressed because a success is
    /// already on disk.
    pub async fn report(&self, status: &DeliveryStatus) -> Result<bool, DispatchError> {
        if !status.is_consistent() {
            return Err(DispatchError::PreconditionInvalid(
                "success record without a message id".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        if state.success_recorded && !status.success {
            warn!(
                error = status.error.as_deref().unwrap_or("unknown"),
                "Suppressing failure report after a recorded success"
            );
            return Ok(false);
        }

        let bytes = serde_json::to_vec_pretty(status)?;
        write_atomic(&self.path, &bytes).await?;

        state.writes += 1;
        state.success_recorded |= status.success;
        if state.writes > 1 {
            debug!(writes = state.writes, "Status record rewritten");
        }
        info!(
            path = %self.path.display(),
            success = status.success,
            message_id = status.message_id.as_deref().unwrap_or("-"),
            "Status recorded"
        );
        Ok(true)
    }

    /// Record a failure that happened before any attempt ran.
    ///
    /// Write errors are logged, not returned; the caller is already failing.
    pub async fn record_failure(&self, err: &DispatchError) {
        if let Err(e) = self.report(&DeliveryStatus::failure(err, 0)).await {
            error!(error = %e, "Failed to record failure");
        }
    }

    /// Whether this run has recorded a success.
    pub async fn has_success(&self) -> bool {
        self.state.lock().await.success_recorded
    }

    /// Read a status record back.
    pub async fn read(path: &Path) -> Result<DeliveryStatus, DispatchError> {
        let raw = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
