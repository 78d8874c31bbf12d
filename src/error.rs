//! Error types for courier

use thiserror::Error;

/// Errors surfaced by the dispatch pipeline.
///
/// Attempt-level errors are classified by the dispatch controller through
/// [`DispatchError::is_retryable`]; everything ends up in the status record
/// under [`DispatchError::kind`].
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No usable session: {0}")]
    AuthNotReady(String),

    #[error("Session logged out: {0}")]
    LoggedOut(String),

    #[error("Timed out after {0}s waiting for the connection to open")]
    ConnectTimeout(u64),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("No delivery confirmation within {0}s")]
    ConfirmationTimeout(u64),

    #[error("Invalid input: {0}")]
    PreconditionInvalid(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    /// Stable name written to the status record.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthNotReady(_) => "AuthNotReady",
            Self::LoggedOut(_) => "LoggedOut",
            Self::ConnectTimeout(_) => "ConnectTimeout",
            Self::TargetUnreachable(_) => "TargetUnreachable",
            Self::SendFailed(_) => "SendFailed",
            Self::ConfirmationTimeout(_) => "ConfirmationTimeout",
            Self::PreconditionInvalid(_) => "PreconditionInvalid",
            Self::Transport(_) => "TransportError",
            Self::DeadlineExceeded(_) => "DeadlineExceeded",
            Self::Interrupted(_) => "Interrupted",
            Self::Config(_) => "ConfigError",
            Self::Io(_) => "IoError",
            Self::Json(_) => "JsonError",
        }
    }

    /// Whether another dispatch attempt can change the result.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout(_) | Self::SendFailed(_) | Self::Transport(_)
        )
    }

    /// Whether the operator has to pair the device again.
    pub fn requires_pairing(&self) -> bool {
        matches!(self, Self::AuthNotReady(_) | Self::LoggedOut(_))
    }
}

/// Errors reported by a transport link for a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("link disconnected: {0}")]
    Disconnected(String),

    /// The remote side answered and refused the request.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),
}

impl From<TransportError> for DispatchError {
    fn from(err: TransportError) -> Self {
        DispatchError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(DispatchError::ConnectTimeout(60).is_retryable());
        assert!(DispatchError::SendFailed("no id".into()).is_retryable());
        assert!(DispatchError::Transport("reset".into()).is_retryable());

        assert!(!DispatchError::TargetUnreachable("gone".into()).is_retryable());
        assert!(!DispatchError::PreconditionInvalid("empty".into()).is_retryable());
        assert!(!DispatchError::LoggedOut("401".into()).is_retryable());
        assert!(!DispatchError::AuthNotReady("missing".into()).is_retryable());
        assert!(!DispatchError::DeadlineExceeded("5m".into()).is_retryable());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(DispatchError::AuthNotReady("x".into()).kind(), "AuthNotReady");
        assert_eq!(DispatchError::LoggedOut("x".into()).kind(), "LoggedOut");
        assert_eq!(
            DispatchError::from(TransportError::Timeout(10)).kind(),
            "TransportError"
        );
    }

    #[test]
    fn test_requires_pairing() {
        assert!(DispatchError::LoggedOut("x".into()).requires_pairing());
        assert!(!DispatchError::ConnectTimeout(1).requires_pairing());
    }
}
