//! Error types, error codes, and recovery hints for the sync client.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a caller should do after seeing an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// The controller is already reconnecting; nothing to do.
    Reconnect,
    /// Offer a manual retry affordance.
    Retry,
    /// Prompt the user for new credentials before connecting again.
    Reauthenticate,
    None,
}

/// Which deadline expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    Heartbeat,
    Handshake,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Heartbeat => write!(f, "heartbeat"),
            TimeoutKind::Handshake => write!(f, "handshake"),
        }
    }
}

/// Link-level failures. These are recovered by the reconnection state machine
/// and never surfaced per occurrence.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("not connected")]
    NotConnected,

    #[error("operation abandoned")]
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("{0} timed out")]
    Timeout(TimeoutKind),

    #[error("outgoing queue full ({pending} pending, capacity {capacity})")]
    QueueOverflow { pending: usize, capacity: usize },

    #[error("storage error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("sync client has shut down")]
    Shutdown,
}

impl SyncError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Protocol(_) => "protocol_error",
            Self::Auth(_) => "auth_error",
            Self::Timeout(_) => "timeout_error",
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::Store(_) => "store_error",
            Self::Config(_) => "config_error",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn recovery(&self) -> RecoveryAction {
        match self {
            Self::Transport(_) | Self::Timeout(_) => RecoveryAction::Reconnect,
            Self::Auth(_) => RecoveryAction::Reauthenticate,
            Self::QueueOverflow { .. } | Self::Store(_) => RecoveryAction::Retry,
            Self::Protocol(_) | Self::Config(_) | Self::Shutdown => RecoveryAction::None,
        }
    }

    /// Errors the reconnection loop must not retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_) | Self::Shutdown)
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// Serializable form handed to UI layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    pub message: String,
    pub recovery: RecoveryAction,
}

impl From<&SyncError> for ErrorReport {
    fn from(err: &SyncError) -> Self {
        Self {
            error: err.error_code().to_string(),
            message: err.to_string(),
            recovery: err.recovery(),
        }
    }
}
