//! Messaging Transport Contract
//!
//! The wire protocol (handshake, encryption, framing) belongs to an external
//! messaging library. This module is the seam the rest of the crate depends on.
//!
//! | Module   | Responsibility                                      |
//! |----------|-----------------------------------------------------|
//! | `bridge` | WebSocket adapter to a process running the library  |
//! | `mock`   | Scripted transport for tests and dry runs           |
//!
//! A [`Transport`] produces one [`Link`] per connection. A link has two halves:
//! the event stream (connection lifecycle, pairing challenges, credential
//! rotations) which the connection state machine consumes, and the
//! [`LinkHandle`] used for protocol calls and acknowledgement subscriptions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::error::TransportError;
use crate::session::Credentials;

pub mod bridge;
pub mod mock;

pub use bridge::BridgeTransport;

/// Raw close information reported by the library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSignal {
    /// Library status code (401 = logged out)
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl CloseSignal {
    pub fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: Some(reason.into()),
        }
    }

    /// Human-readable summary for logs and status records.
    pub fn describe(&self) -> String {
        match (self.code, self.reason.as_deref()) {
            (Some(code), Some(reason)) => format!("{} (code {})", reason, code),
            (Some(code), None) => format!("code {}", code),
            (None, Some(reason)) => reason.to_string(),
            (None, None) => "connection closed".to_string(),
        }
    }
}

/// Event emitted by a link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting,
    Open,
    Close(CloseSignal),
    /// Out-of-band code a human has to approve
    PairingChallenge(String),
    CredentialsRotated(Credentials),
}

/// Identifies one sent message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub id: String,
    pub remote: String,
}

/// Acknowledgement level of a sent message, in protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AckLevel {
    Error,
    Pending,
    ServerAck,
    DeliveryAck,
    Read,
    Played,
}

impl AckLevel {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Error,
            1 => Self::Pending,
            2 => Self::ServerAck,
            3 => Self::DeliveryAck,
            4 => Self::Read,
            _ => Self::Played,
        }
    }
}

/// Per-message status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub key: MessageKey,
    pub level: AckLevel,
}

/// Receipt event for a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub key: MessageKey,
}

/// Metadata returned by a target probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Option<usize>,
}

/// Library response to a send call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub remote: Option<String>,
}

/// One connection produced by a transport.
pub struct Link {
    pub events: mpsc::Receiver<TransportEvent>,
    pub handle: Arc<dyn LinkHandle>,
}

/// Opens connections to the messaging service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a connection; lifecycle is reported on the returned event stream.
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Link, TransportError>;
}

/// Protocol calls on a live connection.
#[async_trait]
pub trait LinkHandle: Send + Sync {
    /// Lightweight metadata lookup; `Rejected` means the target does not exist
    /// or is not accessible.
    async fn probe_target(&self, target: &str) -> Result<TargetInfo, TransportError>;

    async fn send_text(&self, target: &str, text: &str) -> Result<SendResponse, TransportError>;

    /// Subscribe to per-message status updates.
    fn status_updates(&self) -> broadcast::Receiver<StatusUpdate>;

    /// Subscribe to receipt events.
    fn receipts(&self) -> broadcast::Receiver<Receipt>;

    /// End the connection. Safe to call more than once.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_levels_are_ordered() {
        assert!(AckLevel::from_code(3) >= AckLevel::DeliveryAck);
        assert!(AckLevel::from_code(4) > AckLevel::DeliveryAck);
        assert!(AckLevel::from_code(2) < AckLevel::DeliveryAck);
        assert_eq!(AckLevel::from_code(9), AckLevel::Played);
    }

    #[test]
    fn test_close_signal_describe() {
        assert_eq!(
            CloseSignal::new(Some(401), "Connection Failure").describe(),
            "Connection Failure (code 401)"
        );
        assert_eq!(CloseSignal::default().describe(), "connection closed");
    }
}
