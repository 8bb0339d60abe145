use std::fmt;
use thiserror::Error;

/// Runtime permission consulted before a privileged adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Connect,
    Scan,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "BLUETOOTH_CONNECT"),
            Self::Scan => write!(f, "BLUETOOTH_SCAN"),
        }
    }
}

/// Errors surfaced by the session core. None of these are fatal to the
/// host process; the facade publishes them on its error channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("No {0} permission")]
    PermissionDenied(Permission),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Can't connect to a non-paired device ({0})")]
    NonPairedTarget(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    #[error("No active connection")]
    NotConnected,

    #[error("Session has been released")]
    Released,
}

impl SessionError {
    /// Channel-level failures all terminate the session as transport errors.
    pub fn into_transport(self) -> Self {
        match self {
            Self::MalformedPayload(reason) => Self::Transport(format!("malformed payload: {}", reason)),
            other => other,
        }
    }

    /// Human readable cause without the variant prefix for transport errors.
    pub fn reason(&self) -> String {
        match self {
            Self::Transport(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
