//! Application-level control messages carried as WebSocket text frames.
//!
//! | Text | Direction | Meaning |
//! |------|-----------|---------|
//! | `unbind` | both | graceful release of the current binding |
//! | decimal integer | local → browser | open that many relay sessions |
//! | URL | local → browser | tunnel endpoint, sent once on control open |

// ============================================================================
// Imports
// ============================================================================

use url::Url;

// ============================================================================
// Constants
// ============================================================================

/// Text sent by a relay once its TCP side has closed.
pub const UNBIND: &str = "unbind";

// ============================================================================
// ControlMessage
// ============================================================================

/// A parsed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Graceful release signal.
    Unbind,
    /// Request for this many new relay sessions.
    Batch(usize),
    /// Canonical tunnel endpoint.
    Endpoint(Url),
}

impl ControlMessage {
    /// Parses a text frame. Returns `None` for anything unrecognized.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if text == UNBIND {
            return Some(Self::Unbind);
        }
        if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
            return text.parse().ok().map(Self::Batch);
        }
        Url::parse(text).ok().map(Self::Endpoint)
    }

    /// Returns the text frame payload.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Unbind => UNBIND.to_string(),
            Self::Batch(count) => count.to_string(),
            Self::Endpoint(url) => url.to_string(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
