//! Inbound WebSocket acceptor.
//!
//! Accepts TCP connections, reads exactly one HTTP request head and
//! dispatches it once: healthcheck, rejection, or WebSocket upgrade. The
//! upgrade response is written here (reusing the accept computation from
//! [`crate::protocol::handshake`]); frames after that are handled by
//! `tokio-tungstenite` and exposed as a [`Session`].
//!
//! # Dispatch
//!
//! ```text
//! accept ──► read head ──► GET? ──no──► 405
//!                           │
//!                          yes ──► route(path)
//!                                   ├─ Healthcheck ──► 200 OK
//!                                   ├─ NotFound    ──► 404
//!                                   └─ Upgrade     ──► valid upgrade? ──no──► 400
//!                                                          │
//!                                                         yes ──► 101 ──► Session
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::handshake::{self, MAX_HEAD_SIZE};

use super::session::{
    CLOSE_GOING_AWAY, CloseInfo, Outbound, Session, SessionEvent, SessionLink, SessionShared,
};

// ============================================================================
// Constants
// ============================================================================

/// Time allowed for a client to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum number of request headers.
const MAX_HEADERS: usize = 32;

// ============================================================================
// RequestHead
// ============================================================================

/// The parsed request head of one inbound connection.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: String,
    /// Path without query string.
    pub path: String,
    /// Headers with lowercase names.
    pub headers: Vec<(String, String)>,
    /// Client address: first `X-Forwarded-For` entry, else the socket peer IP.
    pub remote_ip: String,
}

impl RequestHead {
    /// Returns the first value of a header (`name` must be lowercase).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns the `Sec-WebSocket-Key` if this is a valid upgrade request.
    #[must_use]
    pub fn upgrade_key(&self) -> Option<&str> {
        let upgrade = self
            .header("upgrade")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
        let connection = self.header("connection").is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
        let version = self.header("sec-websocket-version").map(str::trim) == Some("13");
        if upgrade && connection && version {
            self.header("sec-websocket-key").map(str::trim)
        } else {
            None
        }
    }
}

// ============================================================================
// Route / Handler
// ============================================================================

/// Routing decision for a `GET` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answer `200 OK` with body `OK`.
    Healthcheck,
    /// Complete the WebSocket upgrade and hand over the session.
    Upgrade,
    /// Answer `404`.
    NotFound,
}

/// Application side of the acceptor.
pub trait Handler: Send + Sync + 'static {
    /// Decides what to do with a `GET` request.
    fn route(&self, request: &RequestHead) -> Route;

    /// Receives an open session for a request routed to [`Route::Upgrade`].
    fn on_session(&self, request: RequestHead, session: Session);
}

// ============================================================================
// Acceptor
// ============================================================================

/// A bound inbound listener.
///
/// # Example
///
/// ```ignore
/// let acceptor = Acceptor::bind("0.0.0.0", 10000).await?;
/// println!("listening on {}", acceptor.local_addr());
/// let task = acceptor.spawn(handler);
/// ```
pub struct Acceptor {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Bound address.
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "WebSocket acceptor bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the accept loop.
    pub fn spawn<H: Handler>(self, handler: Arc<H>) -> JoinHandle<()> {
        tokio::spawn(self.accept_loop(handler))
    }

    async fn accept_loop<H: Handler>(self, handler: Arc<H>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handler.as_ref()).await {
                            debug!(error = %e, ?addr, "Inbound connection failed");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                }
            }
        }
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Reads one request head and dispatches the connection exactly once.
async fn handle_connection<H: Handler>(
    mut stream: TcpStream,
    addr: SocketAddr,
    handler: &H,
) -> Result<()> {
    let (head, leftover) = timeout(HEAD_TIMEOUT, read_head(&mut stream, addr))
        .await
        .map_err(|_| Error::connection_timeout(HEAD_TIMEOUT.as_millis() as u64))??;

    if head.method != "GET" {
        warn!(method = %head.method, path = %head.path, status = 405, "HTTP client error");
        return respond(&mut stream, "405 Method Not Allowed", "405").await;
    }

    match handler.route(&head) {
        Route::Healthcheck => {
            info!(method = "GET", path = %head.path, ip = %head.remote_ip, "HTTP request");
            respond(&mut stream, "200 OK", "OK").await
        }
        Route::NotFound => {
            warn!(method = "GET", path = %head.path, status = 404, "HTTP client error");
            respond(&mut stream, "404 Not Found", "404").await
        }
        Route::Upgrade => {
            let Some(key) = head.upgrade_key() else {
                // One notification per invalid upgrade.
                warn!(path = %head.path, ip = %head.remote_ip, "WebSocket error: Not an upgrade request");
                return respond(&mut stream, "400 Bad Request", "400").await;
            };

            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\n\
                 Upgrade: websocket\r\n\
                 Connection: Upgrade\r\n\
                 Sec-WebSocket-Accept: {}\r\n\r\n",
                handshake::accept_key(key)
            );
            stream.write_all(response.as_bytes()).await?;
            stream.set_nodelay(true)?;

            let ws = WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await;
            let session = spawn_session(ws, head.remote_ip.clone());
            handler.on_session(head, session);
            Ok(())
        }
    }
}

/// Reads bytes until a complete request head is parsed.
async fn read_head(stream: &mut TcpStream, addr: SocketAddr) -> Result<(RequestHead, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(Error::connection("closed before request head"));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf)? {
            httparse::Status::Complete(used) => {
                let headers: Vec<(String, String)> = request
                    .headers
                    .iter()
                    .filter(|h| !h.name.is_empty())
                    .map(|h| {
                        (
                            h.name.to_ascii_lowercase(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                let path = request
                    .path
                    .unwrap_or("/")
                    .split('?')
                    .next()
                    .unwrap_or("/")
                    .to_string();
                let forwarded = headers
                    .iter()
                    .find(|(n, _)| n == "x-forwarded-for")
                    .and_then(|(_, v)| v.split(',').next())
                    .map(|ip| ip.trim().to_string())
                    .filter(|ip| !ip.is_empty());

                let head = RequestHead {
                    method: request.method.unwrap_or_default().to_string(),
                    path,
                    remote_ip: forwarded.unwrap_or_else(|| addr.ip().to_string()),
                    headers,
                };
                return Ok((head, buf.split_off(used)));
            }
            httparse::Status::Partial if buf.len() >= MAX_HEAD_SIZE => {
                return Err(Error::protocol("request head too large"));
            }
            httparse::Status::Partial => {}
        }
    }
}

/// Writes a minimal response and closes the write side.
async fn respond(stream: &mut TcpStream, status: &str, body: &str) -> Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

// ============================================================================
// Library-Backed Session
// ============================================================================

/// Wraps an upgraded stream in a [`Session`] and starts its tasks.
pub(crate) fn spawn_session(ws: WebSocketStream<TcpStream>, remote_ip: String) -> Session {
    let (session, link) = Session::new(remote_ip);
    let SessionLink {
        shared,
        outbound_rx,
    } = link;
    shared.mark_open();

    let (sink, stream) = ws.split();
    tokio::spawn(run_reader(stream, Arc::clone(&shared)));
    tokio::spawn(run_writer(sink, outbound_rx, shared));
    session
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = futures_util::stream::SplitStream<WebSocketStream<TcpStream>>;

async fn run_reader(mut stream: WsStream, shared: Arc<SessionShared>) {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => shared.emit(SessionEvent::Binary(data.to_vec())),
            Ok(Message::Text(text)) => shared.emit(SessionEvent::Text(text.as_str().to_owned())),
            Ok(Message::Close(frame)) => {
                let info = match frame {
                    Some(frame) => CloseInfo::new(u16::from(frame.code), frame.reason.as_str()),
                    None => CloseInfo {
                        code: None,
                        reason: String::new(),
                    },
                };
                shared.finish(info);
                // Keep polling so the close reply gets flushed.
            }
            // Pings are answered by the library.
            Ok(_) => {}
            Err(e) => {
                shared.finish(CloseInfo::abnormal(e.to_string()));
                return;
            }
        }
    }
    shared.finish(CloseInfo::abnormal("connection lost"));
}

async fn run_writer(
    mut sink: WsSink,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<SessionShared>,
) {
    loop {
        let (message, accounted, last) = match outbound_rx.recv().await {
            Some(Outbound::Binary(data)) => {
                let len = data.len();
                (Message::binary(data), len, false)
            }
            Some(Outbound::Text(text)) => {
                let len = text.len();
                (Message::text(text), len, false)
            }
            Some(Outbound::Close { code, reason }) => {
                shared.finish(CloseInfo::new(code, reason.clone()));
                (close_message(code, reason), 0, true)
            }
            None => (close_message(CLOSE_GOING_AWAY, String::new()), 0, true),
        };

        let sent = sink.send(message).await;
        shared.written(accounted);
        if let Err(e) = sent {
            shared.finish(CloseInfo::abnormal(format!("write failed: {e}")));
            break;
        }
        if last {
            break;
        }
    }
    trace!(sig = %shared.signature, "Writer stopped");
}

fn close_message(code: u16, reason: String) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    }))
}

// ============================================================================
// Tests
// ============================================================================
