//! Message-oriented WebSocket session handle.
//!
//! A [`Session`] is what the relay and the pool work with. It is backed by
//! a reader task and a writer task that own the underlying connection;
//! the handle talks to them over channels. Two backends produce sessions:
//!
//! - [`crate::transport::client`]: the hand-rolled outbound client
//! - [`crate::transport::server`]: inbound sessions framed by `tokio-tungstenite`
//!
//! Both expose the same surface: send binary, send text, a stream of
//! received events, a close notification delivered exactly once, and the
//! number of bytes queued but not yet written (used for backpressure).
//!
//! # State Machine
//!
//! ```text
//! Connecting ──handshake ok──► Open ──close frame / error / close()──► Closed
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::Signature;

// ============================================================================
// Constants
// ============================================================================

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Endpoint going away (handle dropped).
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Protocol error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Abnormal closure, never sent on the wire.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Application code used when the CONNECT endpoint cannot be reached.
pub const CLOSE_PROXY_ERROR: u16 = 4000;

// ============================================================================
// SessionState
// ============================================================================

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TCP connected, handshake not yet verified.
    Connecting,
    /// Handshake complete, messages flow.
    Open,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Returns the lowercase name used in logs.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CloseInfo
// ============================================================================

/// Close code and reason reported when a session closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// Close code, if the peer sent one.
    pub code: Option<u16>,
    /// Close reason, possibly empty.
    pub reason: String,
}

impl CloseInfo {
    /// Creates a close info with a code.
    #[inline]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            reason: reason.into(),
        }
    }

    /// Synthetic close for a connection that ended without a close frame.
    #[inline]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }
}

// ============================================================================
// SessionEvent
// ============================================================================

/// Event observed on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A binary message.
    Binary(Vec<u8>),
    /// A text message.
    Text(String),
    /// The session closed. Always the last event.
    Closed(CloseInfo),
}

// ============================================================================
// Outbound
// ============================================================================

/// Commands consumed by a backend writer task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Write a binary message.
    Binary(Vec<u8>),
    /// Write a text message.
    Text(String),
    /// Write a close frame and stop.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

// ============================================================================
// SessionShared
// ============================================================================

/// State shared between the handle and the backend tasks.
pub(crate) struct SessionShared {
    /// Process-unique signature.
    pub signature: Signature,
    /// Lifecycle state.
    state: Mutex<SessionState>,
    /// Bytes accepted by `send_*` and not yet written to the transport.
    buffered: AtomicUsize,
    /// Event sink; the receiver lives in the handle.
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionShared {
    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Transitions `Connecting -> Open`.
    pub fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Connecting {
            *state = SessionState::Open;
        }
    }

    /// Delivers a message event unless the session already closed.
    pub fn emit(&self, event: SessionEvent) {
        if self.state() == SessionState::Closed {
            return;
        }
        let _ = self.events_tx.send(event);
    }

    /// Transitions to `Closed` and emits the close event.
    ///
    /// Returns `false` if the session was already closed; the close event is
    /// emitted exactly once per session.
    pub fn finish(&self, info: CloseInfo) -> bool {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Closed;
        }
        debug!(sig = %self.signature, code = ?info.code, reason = %info.reason, "Session closed");
        let _ = self.events_tx.send(SessionEvent::Closed(info));
        true
    }

    /// Accounts for `len` bytes having reached the transport.
    #[inline]
    pub fn written(&self, len: usize) {
        self.buffered.fetch_sub(len, Ordering::AcqRel);
    }
}

// ============================================================================
// SessionLink
// ============================================================================

/// Backend side of a session: what the reader and writer tasks hold.
pub(crate) struct SessionLink {
    /// Shared state.
    pub shared: Arc<SessionShared>,
    /// Messages queued by the handle.
    pub outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

// ============================================================================
// Session
// ============================================================================

/// One established, message-oriented WebSocket connection.
///
/// A session is owned by exactly one holder at a time: the pool's idle set,
/// a pending acquisition, or a relay that borrows it for one binding.
/// Dropping the handle makes the writer send a going-away close frame.
pub struct Session {
    /// Peer address (IP, or the first `X-Forwarded-For` entry).
    peer: String,
    /// Shared with backend tasks.
    shared: Arc<SessionShared>,
    /// Channel to the writer task.
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    /// Events from the reader task.
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("sig", &self.shared.signature)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session - Constructor
// ============================================================================

impl Session {
    /// Creates a handle in `Connecting` state and the link for its backend.
    pub(crate) fn new(peer: impl Into<String>) -> (Self, SessionLink) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            signature: Signature::next(),
            state: Mutex::new(SessionState::Connecting),
            buffered: AtomicUsize::new(0),
            events_tx,
        });

        let session = Self {
            peer: peer.into(),
            shared: Arc::clone(&shared),
            outbound_tx,
            events_rx,
        };
        (session, SessionLink { shared, outbound_rx })
    }
}

// ============================================================================
// Session - Accessors
// ============================================================================

impl Session {
    /// Returns the process-unique signature.
    #[inline]
    #[must_use]
    pub fn signature(&self) -> Signature {
        self.shared.signature
    }

    /// Returns the peer address.
    #[inline]
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Returns `true` while the session is open.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Returns bytes accepted for sending but not yet written.
    #[inline]
    #[must_use]
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }
}

// ============================================================================
// Session - Messaging
// ============================================================================

impl Session {
    /// Queues a binary message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the session is not open.
    pub fn send_binary(&self, data: Vec<u8>) -> Result<()> {
        let len = data.len();
        self.enqueue(Outbound::Binary(data), len)
    }

    /// Queues a text message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] if the session is not open.
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        let len = text.len();
        self.enqueue(Outbound::Text(text), len)
    }

    /// Starts a close handshake. No-op if the session is not open.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if !self.is_open() {
            return;
        }
        let _ = self.outbound_tx.send(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the close event has been consumed and the
    /// backend has stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    fn enqueue(&self, message: Outbound, len: usize) -> Result<()> {
        if !self.is_open() {
            return Err(Error::ConnectionClosed);
        }
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        self.outbound_tx.send(message).map_err(|_| {
            self.shared.written(len);
            Error::ConnectionClosed
        })
    }
}

// ============================================================================
// Test Support
// ============================================================================

/// In-memory peer for a test session: observes what the session sends and
/// injects what it receives.
#[cfg(test)]
pub(crate) struct TestPeer {
    /// Shared state of the paired session.
    pub shared: Arc<SessionShared>,
    /// What the session sent.
    pub outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

#[cfg(test)]
impl TestPeer {
    /// Injects a binary message.
    pub fn binary(&self, data: &[u8]) {
        self.shared.emit(SessionEvent::Binary(data.to_vec()));
    }

    /// Injects a text message.
    pub fn text(&self, text: &str) {
        self.shared.emit(SessionEvent::Text(text.to_string()));
    }

    /// Closes the session from the peer side.
    pub fn close(&self, code: u16, reason: &str) {
        self.shared.finish(CloseInfo::new(code, reason));
    }

    /// Pretends `len` queued bytes reached the wire.
    pub fn drain(&self, len: usize) {
        self.shared.written(len);
    }

    /// Sets the buffered byte count directly.
    pub fn set_buffered(&self, len: usize) {
        self.shared.buffered.store(len, Ordering::Release);
    }

    /// Returns the next outbound message without waiting.
    pub fn try_sent(&mut self) -> Option<Outbound> {
        self.outbound_rx.try_recv().ok()
    }

    /// Waits for the next outbound message.
    pub async fn sent(&mut self) -> Option<Outbound> {
        self.outbound_rx.recv().await
    }
}

#[cfg(test)]
impl Session {
    /// Creates an open session wired to an in-memory peer.
    pub(crate) fn test_pair() -> (Self, TestPeer) {
        let (session, link) = Self::new("127.0.0.1");
        link.shared.mark_open();
        let peer = TestPeer {
            shared: link.shared,
            outbound_rx: link.outbound_rx,
        };
        (session, peer)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_connecting() {
        let (session, link) = Session::new("10.0.0.1");
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.send_text("early").is_err());
        link.shared.mark_open();
        assert!(session.is_open());
        assert_eq!(session.peer(), "10.0.0.1");
    }

    #[test]
    fn test_send_tracks_buffered_bytes() {
        let (session, mut peer) = Session::test_pair();
        session.send_binary(vec![0u8; 10]).unwrap();
        session.send_text("unbind").unwrap();
        assert_eq!(session.buffered_amount(), 16);

        assert!(matches!(peer.try_sent(), Some(Outbound::Binary(data)) if data.len() == 10));
        peer.drain(10);
        assert_eq!(session.buffered_amount(), 6);
    }

    #[tokio::test]
    async fn test_close_event_emitted_exactly_once() {
        let (mut session, peer) = Session::test_pair();
        peer.binary(b"abc");
        assert!(peer.shared.finish(CloseInfo::new(CLOSE_NORMAL, "bye")));
        assert!(!peer.shared.finish(CloseInfo::abnormal("again")));
        peer.binary(b"late");

        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Binary(b"abc".to_vec()))
        );
        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Closed(CloseInfo::new(CLOSE_NORMAL, "bye")))
        );
        assert!(session.events_rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_send_after_close_fails() {
        let (session, peer) = Session::test_pair();
        peer.close(CLOSE_NORMAL, "");
        assert!(matches!(
            session.send_binary(vec![1]),
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(session.buffered_amount(), 0);
    }

    #[test]
    fn test_close_queues_close_frame_when_open() {
        let (session, mut peer) = Session::test_pair();
        session.close(CLOSE_NORMAL, "purge");
        assert!(matches!(
            peer.try_sent(),
            Some(Outbound::Close { code: 1000, ref reason }) if reason == "purge"
        ));
    }
}
