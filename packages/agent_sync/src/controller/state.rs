use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    AttemptsExhausted { attempts: u32 },
    AuthRejected { message: String },
    /// A non-auth error no retry can fix, such as a malformed endpoint.
    Unrecoverable { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::AttemptsExhausted { attempts } => {
                write!(f, "gave up after {attempts} attempts")
            }
            FailureReason::AuthRejected { message } => write!(f, "authentication rejected: {message}"),
            FailureReason::Unrecoverable { message } => f.write_str(message),
        }
    }
}

/// Exactly one of these is current at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `attempt` is 1-based; `max_attempts` is `None` when retrying forever.
    Reconnecting {
        attempt: u32,
        max_attempts: Option<u32>,
    },
    Failed {
        reason: FailureReason,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Reconnecting {
                attempt,
                max_attempts: Some(max),
            } => write!(f, "reconnecting ({attempt}/{max})"),
            ConnectionState::Reconnecting {
                attempt,
                max_attempts: None,
            } => write!(f, "reconnecting ({attempt})"),
            ConnectionState::Failed { reason } => write!(f, "failed: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}
