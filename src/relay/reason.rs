//! Why a relay or session closed.

use std::fmt;

use crate::error::Error;

/// Reason recorded exactly once when a relay closes, logged verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The TCP peer closed its side.
    Normal,
    /// The session peer sent `unbind`.
    Unbind,
    /// The bound session closed.
    PeerClosed,
    /// No bytes moved in either direction for the configured period.
    InactivityTimeout,
    /// No session became available in time.
    PoolTimeout,
    /// I/O failure or failure to obtain a session.
    TransportError(String),
    /// The pool was full when the session came back.
    Purge,
    /// The owning endpoint is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Returns the short label, without transport detail.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Unbind => "unbind",
            Self::PeerClosed => "peer closed",
            Self::InactivityTimeout => "inactivity timeout",
            Self::PoolTimeout => "pool timeout",
            Self::TransportError(_) => "transport error",
            Self::Purge => "purge",
            Self::Shutdown => "shutdown",
        }
    }

    /// Maps a failed acquisition onto the reason its relay closes with.
    #[must_use]
    pub fn from_acquire_error(error: &Error) -> Self {
        match error {
            Error::PoolTimeout { .. } => Self::PoolTimeout,
            Error::PoolClosed => Self::Shutdown,
            Error::Connection { message } => Self::TransportError(message.clone()),
            other => Self::TransportError(other.to_string()),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransportError(detail) => write!(f, "transport error: {detail}"),
            other => f.write_str(other.as_str()),
        }
    }
}
