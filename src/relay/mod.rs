//! Binding of one raw TCP stream to one WebSocket session.
//!
//! A [`Relay`] is created paused around an accepted (or freshly connected)
//! TCP stream. Nothing is read from the stream until a session is bound, so
//! no bytes are lost before a destination exists.
//!
//! # Lifecycle
//!
//! ```text
//! new (paused) ──bind(session)──► active ──TCP closes──► closed, "unbind" sent
//!       │                           │                        │
//!       │ close(pool timeout)       │ session closes         │ peer "unbind"
//!       ▼                           ▼                        ▼
//!  closed before bind         Completion::Failed      Completion::Succeeded
//! ```
//!
//! # Unbind Protocol
//!
//! Whichever TCP side closes first sends `unbind` over the session and
//! waits. The other relay, on receiving `unbind`, closes its own TCP side,
//! which sends `unbind` back. A relay succeeds only once it has both sent
//! and received `unbind`, so a session is never reused while bytes of the
//! previous binding can still be in flight.
//!
//! # Forwarding
//!
//! One TCP read becomes one binary message, and each binary message is
//! written to the TCP stream as-is. After every forwarded read the session's
//! buffered byte count drives [`Backpressure`].

// ============================================================================
// Submodules
// ============================================================================

/// Pause/resume hysteresis.
pub mod backpressure;

/// Close reasons.
pub mod reason;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::pending;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::identifiers::Signature;
use crate::protocol::{ControlMessage, UNBIND};
use crate::transport::session::{Session, SessionEvent};

pub use backpressure::{Backpressure, Transition};
pub use reason::CloseReason;

// ============================================================================
// Constants
// ============================================================================

/// Bytes read from the TCP stream per message.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Characters of unexpected text included in the log.
const TEXT_PREVIEW_LEN: usize = 16;

// ============================================================================
// Side
// ============================================================================

/// Which end of the tunnel created the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Client side: wraps an accepted local proxy connection.
    Local,
    /// Server side: wraps a connection to the CONNECT endpoint.
    Remote,
}

impl Side {
    /// Returns the side tag used in logs.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Outcome of one binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Completion {
    /// Both sides unbound; the session may be reused.
    Succeeded,
    /// The session closed; it must not be reused.
    Failed,
}

impl Completion {
    /// Returns `true` for [`Completion::Succeeded`].
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

// ============================================================================
// Relay
// ============================================================================

/// One TCP stream, bindable to one session.
///
/// Confined to the task that owns it; the bound session is borrowed
/// mutably for the duration of [`Relay::bind`].
pub struct Relay {
    side: Side,
    signature: Signature,
    /// Correlation tag: `<session>.<relay>`, or `-.<relay>` before bind.
    tag: String,
    /// `None` once closed.
    stream: Option<TcpStream>,
    config: RelayConfig,
    backpressure: Backpressure,
    bound: bool,
    closed: bool,
    close_reason: Option<CloseReason>,
    unbind_sent: bool,
    unbind_recv: bool,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("side", &self.side)
            .field("tag", &self.tag)
            .field("closed", &self.closed)
            .field("close_reason", &self.close_reason)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Relay - Constructor
// ============================================================================

impl Relay {
    /// Wraps a stream in a paused, unbound relay.
    #[must_use]
    pub fn new(side: Side, stream: TcpStream, config: RelayConfig) -> Self {
        let signature = Signature::next();
        Self {
            side,
            signature,
            tag: format!("-.{signature}"),
            stream: Some(stream),
            backpressure: Backpressure::from_config(&config),
            config,
            bound: false,
            closed: false,
            close_reason: None,
            unbind_sent: false,
            unbind_recv: false,
        }
    }
}

// ============================================================================
// Relay - Accessors
// ============================================================================

impl Relay {
    /// Returns the side tag.
    #[inline]
    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    /// Returns the relay's own signature.
    #[inline]
    #[must_use]
    pub fn signature(&self) -> Signature {
        self.signature
    }

    /// Returns `true` once the TCP side has closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns `true` while no bytes are read from the TCP side.
    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        !self.bound || self.backpressure.is_paused()
    }

    /// Returns why the relay closed, once it has.
    #[inline]
    #[must_use]
    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }
}

// ============================================================================
// Relay - Lifecycle
// ============================================================================

impl Relay {
    /// Resolves if the TCP peer hangs up before sending anything.
    ///
    /// Used while waiting for a session. Once bytes are pending the stream
    /// cannot be probed without consuming them, so this never resolves.
    pub async fn closed_while_paused(&self) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let mut probe = [0u8; 1];
        match stream.peek(&mut probe).await {
            Ok(0) | Err(_) => {}
            Ok(_) => pending::<()>().await,
        }
    }

    /// Closes the TCP side, recording `reason`.
    ///
    /// # Panics
    ///
    /// Panics if the relay is already closed.
    pub async fn close(&mut self, reason: CloseReason) {
        assert!(!self.closed, "relay {} closed twice", self.tag);
        self.closed = true;

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }

        info!(side = %self.side, sig = %self.tag, reason = %reason, "Unbind");
        self.close_reason = Some(reason);
    }

    /// Binds `session` and runs the relay until the binding completes.
    ///
    /// If the relay closed before a session became available, succeeds
    /// immediately without touching the session. A session that closed
    /// after it was handed over fails the binding and closes the relay.
    ///
    /// # Panics
    ///
    /// Panics if the relay was bound before.
    pub async fn bind(&mut self, session: &mut Session) -> Completion {
        assert!(!self.bound, "relay {} is already bound", self.tag);
        self.bound = true;
        self.tag = format!("{}.{}", session.signature(), self.signature);
        self.unbind_sent = false;
        self.unbind_recv = false;

        if self.closed {
            warn!(side = %self.side, sig = %self.tag, "Bound closed before bind");
            return Completion::Succeeded;
        }

        if !session.is_open() {
            warn!(side = %self.side, sig = %self.tag, state = %session.state(), "Session closed before bind");
            self.close(CloseReason::PeerClosed).await;
            return Completion::Failed;
        }

        info!(side = %self.side, sig = %self.tag, ip = %session.peer(), "Bind");
        self.run(session).await
    }
}

// ============================================================================
// Relay - Event Loop
// ============================================================================

impl Relay {
    async fn run(&mut self, session: &mut Session) -> Completion {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut idle_at = self.idle_deadline();
        let mut drain_at: Option<Instant> = None;

        loop {
            let reading = !self.closed && !self.backpressure.is_paused();
            let watching_idle = !self.closed && idle_at.is_some();

            tokio::select! {
                event = session.next_event() => {
                    match event {
                        Some(SessionEvent::Binary(data)) => {
                            if self.closed {
                                debug!(side = %self.side, sig = %self.tag, bytes = data.len(), "Data discard, bound closed");
                                continue;
                            }
                            idle_at = self.idle_deadline();
                            if let Err(e) = self.write(&data).await {
                                self.close(CloseReason::TransportError(e.to_string())).await;
                                if self.announce_unbind(session) {
                                    return Completion::Succeeded;
                                }
                            }
                        }
                        Some(SessionEvent::Text(text)) => {
                            if ControlMessage::parse(&text) != Some(ControlMessage::Unbind) {
                                let preview: String = text.chars().take(TEXT_PREVIEW_LEN).collect();
                                warn!(side = %self.side, sig = %self.tag, msg = ?preview, "Unexpected text on websocket");
                                continue;
                            }
                            self.unbind_recv = true;
                            if self.unbind_sent {
                                return Completion::Succeeded;
                            }
                            if !self.closed {
                                self.close(CloseReason::Unbind).await;
                                if self.announce_unbind(session) {
                                    return Completion::Succeeded;
                                }
                            }
                        }
                        Some(SessionEvent::Closed(info)) => {
                            if !self.closed {
                                self.close(CloseReason::PeerClosed).await;
                            }
                            info!(
                                side = %self.side,
                                sig = %self.tag,
                                code = ?info.code,
                                reason = %info.reason,
                                "WebSocket is closed"
                            );
                            return Completion::Failed;
                        }
                        None => {
                            if !self.closed {
                                self.close(CloseReason::PeerClosed).await;
                            }
                            return Completion::Failed;
                        }
                    }
                }

                read = read_some(&mut self.stream, &mut buf), if reading => {
                    match read {
                        Ok(0) => {
                            self.close(CloseReason::Normal).await;
                            if self.announce_unbind(session) {
                                return Completion::Succeeded;
                            }
                        }
                        Ok(n) => {
                            idle_at = self.idle_deadline();
                            // A failed send means the session closed; its close event follows.
                            let _ = session.send_binary(buf[..n].to_vec());
                            drain_at = self.check_backpressure(session);
                        }
                        Err(e) => {
                            self.close(CloseReason::TransportError(e.to_string())).await;
                            if self.announce_unbind(session) {
                                return Completion::Succeeded;
                            }
                        }
                    }
                }

                () = sleep_opt(drain_at), if drain_at.is_some() => {
                    drain_at = self.check_backpressure(session);
                }

                () = sleep_opt(idle_at), if watching_idle => {
                    self.close(CloseReason::InactivityTimeout).await;
                    if self.announce_unbind(session) {
                        return Completion::Succeeded;
                    }
                }
            }
        }
    }

    /// Sends `unbind` after the TCP side closed.
    ///
    /// Returns `true` if the peer's `unbind` already arrived.
    fn announce_unbind(&mut self, session: &Session) -> bool {
        if session.is_open() && session.send_text(UNBIND).is_ok() {
            self.unbind_sent = true;
        }
        self.unbind_sent && self.unbind_recv
    }

    /// Applies backpressure; returns the next drain check, if paused.
    fn check_backpressure(&mut self, session: &Session) -> Option<Instant> {
        let outbytes = session.buffered_amount();
        match self.backpressure.check(outbytes) {
            Some(Transition::Paused) => {
                info!(side = %self.side, sig = %self.tag, outbytes, "Paused");
            }
            Some(Transition::Resumed) => {
                info!(side = %self.side, sig = %self.tag, outbytes, "Resumed");
            }
            None => {}
        }
        self.backpressure
            .is_paused()
            .then(|| Instant::now() + self.config.drain_interval)
    }

    fn idle_deadline(&self) -> Option<Instant> {
        self.config.inactivity_timeout.map(|t| Instant::now() + t)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.write_all(data).await,
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn read_some(stream: &mut Option<TcpStream>, buf: &mut [u8]) -> io::Result<usize> {
    match stream {
        Some(stream) => stream.read(buf).await,
        None => pending().await,
    }
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use crate::transport::session::{Outbound, TestPeer};

    type Bound = (Completion, Relay, Session);

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    async fn spawn_bound(config: RelayConfig) -> (JoinHandle<Bound>, TcpStream, TestPeer) {
        let (app, relay_stream) = tcp_pair().await;
        let (mut session, peer) = Session::test_pair();
        let mut relay = Relay::new(Side::Local, relay_stream, config);
        let task = tokio::spawn(async move {
            let completion = relay.bind(&mut session).await;
            (completion, relay, session)
        });
        (task, app, peer)
    }

    async fn next_sent(peer: &mut TestPeer) -> Outbound {
        timeout(Duration::from_secs(5), peer.sent())
            .await
            .expect("relay sent nothing")
            .expect("outbound channel closed")
    }

    async fn read_to_eof(app: &mut TcpStream) -> Vec<u8> {
        let mut out = Vec::new();
        timeout(Duration::from_secs(5), app.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_forwards_both_directions_then_unbinds() {
        let (task, mut app, mut peer) = spawn_bound(RelayConfig::default()).await;

        app.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        assert!(matches!(
            next_sent(&mut peer).await,
            Outbound::Binary(data) if data.starts_with(b"CONNECT")
        ));

        peer.binary(b"HTTP/1.1 200 Connection Established\r\n\r\n");
        let mut reply = [0u8; 39];
        app.read_exact(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 200"));

        peer.text("hello there");
        peer.text(UNBIND);

        assert!(read_to_eof(&mut app).await.is_empty());
        assert!(matches!(next_sent(&mut peer).await, Outbound::Text(t) if t == UNBIND));

        let (completion, relay, session) = task.await.unwrap();
        assert_eq!(completion, Completion::Succeeded);
        assert_eq!(relay.close_reason(), Some(&CloseReason::Unbind));
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_unbind_waits_for_peer() {
        let (task, app, mut peer) = spawn_bound(RelayConfig::default()).await;

        drop(app);
        assert!(matches!(next_sent(&mut peer).await, Outbound::Text(t) if t == UNBIND));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        // Stray data from the previous binding is dropped, not fatal.
        peer.binary(b"late bytes");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        peer.text(UNBIND);
        let (completion, relay, _session) = task.await.unwrap();
        assert_eq!(completion, Completion::Succeeded);
        assert_eq!(relay.close_reason(), Some(&CloseReason::Normal));
    }

    #[tokio::test]
    async fn test_session_close_fails_completion() {
        let (task, mut app, peer) = spawn_bound(RelayConfig::default()).await;

        peer.close(1001, "tab closed");

        assert!(read_to_eof(&mut app).await.is_empty());
        let (completion, relay, session) = task.await.unwrap();
        assert_eq!(completion, Completion::Failed);
        assert_eq!(relay.close_reason(), Some(&CloseReason::PeerClosed));
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn test_closed_before_bind_succeeds_without_io() {
        let (_app, relay_stream) = tcp_pair().await;
        let (mut session, mut peer) = Session::test_pair();
        let mut relay = Relay::new(Side::Local, relay_stream, RelayConfig::default());

        relay.close(CloseReason::PoolTimeout).await;
        assert_eq!(relay.bind(&mut session).await, Completion::Succeeded);
        assert!(peer.try_sent().is_none());
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_bind_to_closed_session_fails_and_closes_stream() {
        let (mut app, relay_stream) = tcp_pair().await;
        let (mut session, mut peer) = Session::test_pair();
        peer.close(1000, "purge");
        let mut relay = Relay::new(Side::Remote, relay_stream, RelayConfig::default());

        assert_eq!(relay.bind(&mut session).await, Completion::Failed);
        assert_eq!(relay.close_reason(), Some(&CloseReason::PeerClosed));
        assert!(peer.try_sent().is_none());
        assert!(read_to_eof(&mut app).await.is_empty());
    }

    #[tokio::test]
    async fn test_other_control_text_is_ignored() {
        let (task, mut app, peer) = spawn_bound(RelayConfig::default()).await;

        peer.text("3");
        peer.text("wss://tunnel.example.com/");
        peer.binary(b"still bound");
        let mut buf = [0u8; 11];
        timeout(Duration::from_secs(5), app.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"still bound");
        assert!(!task.is_finished());

        peer.close(1000, "");
        let (completion, _, _) = task.await.unwrap();
        assert_eq!(completion, Completion::Failed);
    }

    #[tokio::test]
    #[should_panic(expected = "closed twice")]
    async fn test_double_close_panics() {
        let (_app, relay_stream) = tcp_pair().await;
        let mut relay = Relay::new(Side::Remote, relay_stream, RelayConfig::default());
        relay.close(CloseReason::Normal).await;
        relay.close(CloseReason::Normal).await;
    }

    #[tokio::test]
    #[should_panic(expected = "already bound")]
    async fn test_rebind_panics() {
        let (_app, relay_stream) = tcp_pair().await;
        let (mut session, _peer) = Session::test_pair();
        let mut relay = Relay::new(Side::Remote, relay_stream, RelayConfig::default());
        relay.close(CloseReason::Normal).await;
        let _ = relay.bind(&mut session).await;
        let _ = relay.bind(&mut session).await;
    }

    #[tokio::test]
    async fn test_closed_while_paused_detects_hangup() {
        let (app, relay_stream) = tcp_pair().await;
        let relay = Relay::new(Side::Local, relay_stream, RelayConfig::default());
        assert!(relay.is_paused());

        drop(app);
        timeout(Duration::from_secs(5), relay.closed_while_paused())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_while_paused_ignores_pending_data() {
        let (mut app, relay_stream) = tcp_pair().await;
        let relay = Relay::new(Side::Local, relay_stream, RelayConfig::default());

        app.write_all(b"CONNECT").await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), relay.closed_while_paused())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_backpressure_hysteresis() {
        let config = RelayConfig::new()
            .with_watermarks(10, 100)
            .with_drain_interval(Duration::from_millis(10));
        let (task, mut app, mut peer) = spawn_bound(config).await;

        peer.set_buffered(200);
        app.write_all(b"first").await.unwrap();
        assert!(matches!(next_sent(&mut peer).await, Outbound::Binary(d) if d == b"first"));

        // Paused: nothing more is read from TCP.
        app.write_all(b"second").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(peer.try_sent().is_none());

        // Below high but above low: still paused.
        peer.set_buffered(50);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(peer.try_sent().is_none());

        peer.set_buffered(10);
        assert!(matches!(next_sent(&mut peer).await, Outbound::Binary(d) if d == b"second"));

        peer.close(1000, "");
        let (completion, _relay, _session) = task.await.unwrap();
        assert_eq!(completion, Completion::Failed);
    }

    #[tokio::test]
    async fn test_inactivity_timeout_closes_local_side() {
        let config = RelayConfig::new().with_inactivity_timeout(Duration::from_millis(50));
        let (task, mut app, mut peer) = spawn_bound(config).await;

        assert!(read_to_eof(&mut app).await.is_empty());
        assert!(matches!(next_sent(&mut peer).await, Outbound::Text(t) if t == UNBIND));

        peer.text(UNBIND);
        let (completion, relay, _session) = task.await.unwrap();
        assert_eq!(completion, Completion::Succeeded);
        assert_eq!(relay.close_reason(), Some(&CloseReason::InactivityTimeout));
    }
}
