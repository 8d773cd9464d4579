//! Outbound WebSocket client session.
//!
//! Opens a TCP connection (TLS-wrapped for `wss://`), performs the opening
//! handshake by hand and then runs the frame codec from
//! [`crate::protocol::frame`] in a reader and a writer task.
//!
//! # Connection Flow
//!
//! 1. TCP connect (with timeout), optional TLS with SNI from the URL host
//! 2. Send the upgrade request with a fresh `Sec-WebSocket-Key`
//! 3. Feed response bytes to the header parser until the head is complete
//! 4. Verify the response; on success the session is `Open`
//! 5. Bytes after the head are WebSocket frames

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::protocol::frame::{self, OpCode};
use crate::protocol::handshake;

use super::session::{
    CLOSE_GOING_AWAY, CLOSE_PROTOCOL_ERROR, CloseInfo, Outbound, Session, SessionEvent,
    SessionLink, SessionShared,
};

// ============================================================================
// Constants
// ============================================================================

/// Timeout for TCP connect, TLS and the opening handshake together.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read buffer size for the reader task.
const READ_CHUNK: usize = 64 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Control frames the reader asks the writer to send.
enum Reply {
    /// Answer a ping.
    Pong(Vec<u8>),
    /// Answer or initiate a close.
    Close(u16, String),
}

// ============================================================================
// ClientSession
// ============================================================================

/// Factory for outbound sessions.
///
/// # Example
///
/// ```ignore
/// use wsbridge::ClientSession;
///
/// let url = url::Url::parse("wss://tunnel.example.com/ws/rem/relay")?;
/// let session = ClientSession::connect(&url).await?;
/// session.send_binary(b"hello".to_vec())?;
/// ```
pub struct ClientSession;

impl ClientSession {
    /// Connects to `url` and completes the opening handshake.
    ///
    /// The URL path (and query) is the upgrade path.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if the scheme is not `ws` or `wss`
    /// - [`Error::Io`] if the TCP connection fails
    /// - [`Error::Tls`] if the TLS handshake fails
    /// - [`Error::Handshake`] if the upgrade response does not verify
    /// - [`Error::ConnectionTimeout`] if all of the above take longer than 30s
    pub async fn connect(url: &Url) -> Result<Session> {
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            other => return Err(Error::config(format!("unsupported scheme: {other}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config("server URL has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::config("server URL has no port"))?;

        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        let host_header = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.clone(),
        };

        let attempt = async {
            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            tcp.set_nodelay(true)?;
            let peer = tcp.peer_addr()?.ip().to_string();

            if secure {
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| Error::tls(format!("invalid server name {host}: {e}")))?;
                let tls = tls_connector()
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::tls(e.to_string()))?;
                Self::handshake(tls, &host_header, &path, peer).await
            } else {
                Self::handshake(tcp, &host_header, &path, peer).await
            }
        };

        timeout(CONNECT_TIMEOUT, attempt)
            .await
            .map_err(|_| Error::connection_timeout(CONNECT_TIMEOUT.as_millis() as u64))?
    }

    /// Runs the opening handshake over an established stream and starts the
    /// session tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Handshake`] or [`Error::HttpParse`] if the response
    /// does not verify, or [`Error::Io`] on transport failure.
    pub async fn handshake<S>(
        mut stream: S,
        host: &str,
        path: &str,
        peer: impl Into<String>,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, link) = Session::new(peer);
        let key = handshake::generate_key();

        stream
            .write_all(handshake::upgrade_request(host, path, &key).as_bytes())
            .await?;
        stream.flush().await?;

        let mut buf = Vec::with_capacity(1024);
        let (head, used) = loop {
            if let Some(parsed) = handshake::parse_response(&buf)? {
                break parsed;
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(Error::handshake("connection closed during handshake"));
            }
        };

        if let Err(e) = handshake::verify_handshake_response(&key, &head) {
            warn!(sig = %session.signature(), error = %e, "Invalid server handshake");
            return Err(e);
        }
        buf.drain(..used);

        link.shared.mark_open();
        debug!(sig = %session.signature(), peer = %session.peer(), "Handshake completed");

        let (read_half, write_half) = tokio::io::split(stream);
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        let SessionLink {
            shared,
            outbound_rx,
        } = link;

        tokio::spawn(run_reader(read_half, buf, Arc::clone(&shared), reply_tx));
        tokio::spawn(run_writer(write_half, outbound_rx, reply_rx, shared));

        Ok(session)
    }
}

// ============================================================================
// TLS
// ============================================================================

/// Shared TLS connector with the webpki root store.
fn tls_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR
        .get_or_init(|| {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}

// ============================================================================
// Reader Task
// ============================================================================

/// Decodes server frames into session events.
async fn run_reader<S>(
    mut read_half: ReadHalf<S>,
    mut buf: Vec<u8>,
    shared: Arc<SessionShared>,
    reply_tx: mpsc::UnboundedSender<Reply>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    buf.reserve(READ_CHUNK);

    loop {
        // Drain every complete frame before reading again.
        loop {
            match frame::decode_frame(&buf) {
                Ok(Some((frame, used))) => {
                    buf.drain(..used);
                    if let Some(info) = handle_frame(frame, &shared, &reply_tx) {
                        shared.finish(info);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(sig = %shared.signature, error = %e, "Malformed frame");
                    let reason = e.to_string();
                    let _ = reply_tx.send(Reply::Close(CLOSE_PROTOCOL_ERROR, reason.clone()));
                    shared.finish(CloseInfo::new(CLOSE_PROTOCOL_ERROR, reason));
                    return;
                }
            }
        }

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                shared.finish(CloseInfo::abnormal("connection lost"));
                return;
            }
            Ok(n) => trace!(sig = %shared.signature, bytes = n, "Read"),
            Err(e) => {
                shared.finish(CloseInfo::abnormal(e.to_string()));
                return;
            }
        }
    }
}

/// Dispatches one frame. Returns close info when the session must end.
fn handle_frame(
    frame: frame::Frame,
    shared: &SessionShared,
    reply_tx: &mpsc::UnboundedSender<Reply>,
) -> Option<CloseInfo> {
    match frame.opcode {
        OpCode::Binary => shared.emit(SessionEvent::Binary(frame.payload)),
        OpCode::Text => match String::from_utf8(frame.payload) {
            Ok(text) => shared.emit(SessionEvent::Text(text)),
            Err(_) => {
                let _ = reply_tx.send(Reply::Close(CLOSE_PROTOCOL_ERROR, "invalid utf-8".into()));
                return Some(CloseInfo::new(CLOSE_PROTOCOL_ERROR, "invalid utf-8"));
            }
        },
        OpCode::Ping => {
            let _ = reply_tx.send(Reply::Pong(frame.payload));
        }
        OpCode::Pong => {}
        OpCode::Close => {
            let (code, reason) = frame::parse_close_payload(&frame.payload);
            let _ = reply_tx.send(Reply::Close(code.unwrap_or(1000), String::new()));
            return Some(CloseInfo { code, reason });
        }
        // Rejected by the decoder.
        OpCode::Continuation => {}
    }
    None
}

// ============================================================================
// Writer Task
// ============================================================================

/// Encodes queued messages and replies onto the transport.
async fn run_writer<S>(
    mut write_half: WriteHalf<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    mut reply_rx: mpsc::UnboundedReceiver<Reply>,
    shared: Arc<SessionShared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let (bytes, accounted, last) = tokio::select! {
            biased;

            Some(reply) = reply_rx.recv() => match reply {
                Reply::Pong(payload) => (frame::encode_frame(OpCode::Pong, &payload), 0, false),
                Reply::Close(code, reason) => (
                    frame::encode_frame(OpCode::Close, &frame::close_payload(code, &reason)),
                    0,
                    true,
                ),
            },

            message = outbound_rx.recv() => match message {
                Some(Outbound::Binary(data)) => {
                    (frame::encode_frame(OpCode::Binary, &data), data.len(), false)
                }
                Some(Outbound::Text(text)) => {
                    (frame::encode_frame(OpCode::Text, text.as_bytes()), text.len(), false)
                }
                Some(Outbound::Close { code, reason }) => {
                    let bytes = frame::encode_frame(OpCode::Close, &frame::close_payload(code, &reason));
                    shared.finish(CloseInfo::new(code, reason));
                    (bytes, 0, true)
                }
                None => (
                    frame::encode_frame(OpCode::Close, &frame::close_payload(CLOSE_GOING_AWAY, "")),
                    0,
                    true,
                ),
            },
        };

        let written = write_half.write_all(&bytes).await;
        shared.written(accounted);
        if let Err(e) = written {
            shared.finish(CloseInfo::abnormal(format!("write failed: {e}")));
            break;
        }
        if last {
            break;
        }
    }

    let _ = write_half.shutdown().await;
    trace!(sig = %shared.signature, "Writer stopped");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    use crate::protocol::handshake::accept_key;
    use crate::transport::session::SessionState;

    /// Reads the upgrade request from the server end and returns the key.
    async fn read_request(server: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 512];
            let n = server.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("GET /ws/rem/relay HTTP/1.1\r\n"));
        text.lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .unwrap()
            .to_string()
    }

    fn response(accept: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        )
    }

    fn server_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() < 126);
        let mut frame = vec![0x80 | opcode.as_u8(), payload.len() as u8];
        frame.extend_from_slice(payload);
        frame
    }

    #[tokio::test]
    async fn test_handshake_and_messages() {
        let (client, mut server) = duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            let key = read_request(&mut server).await;
            let mut reply = response(&accept_key(&key)).into_bytes();
            // First frame arrives in the same read as the head.
            reply.extend(server_frame(OpCode::Text, b"unbind"));
            server.write_all(&reply).await.unwrap();
            server.write_all(&server_frame(OpCode::Binary, b"\x00\x01")).await.unwrap();
            server
        });

        let mut session = ClientSession::handshake(client, "localhost", "/ws/rem/relay", "127.0.0.1")
            .await
            .expect("handshake");
        assert_eq!(session.state(), SessionState::Open);

        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Text("unbind".into()))
        );
        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Binary(vec![0, 1]))
        );

        let mut server = server_task.await.unwrap();
        session.send_binary(b"hello".to_vec()).unwrap();

        let mut raw = vec![0u8; 2 + 4 + 5];
        server.read_exact(&mut raw).await.unwrap();
        let (frame, used) = frame::decode_frame(&raw).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_accept() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=").as_bytes())
                .await
                .unwrap();
            server
        });

        let err = ClientSession::handshake(client, "localhost", "/ws/rem/relay", "127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));
    }

    #[tokio::test]
    async fn test_peer_close_emits_close_once_and_replies() {
        let (client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let key = read_request(&mut server).await;
            server.write_all(response(&accept_key(&key)).as_bytes()).await.unwrap();
            server
                .write_all(&server_frame(OpCode::Close, &frame::close_payload(1000, "purge")))
                .await
                .unwrap();
            let mut echoed = Vec::new();
            server.read_to_end(&mut echoed).await.unwrap();
            echoed
        });

        let mut session = ClientSession::handshake(client, "localhost", "/ws/rem/relay", "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(
            session.next_event().await,
            Some(SessionEvent::Closed(CloseInfo::new(1000, "purge")))
        );
        assert_eq!(session.state(), SessionState::Closed);

        drop(session);
        let echoed = server_task.await.unwrap();
        let (frame, _) = frame::decode_frame(&echoed).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let key = read_request(&mut server).await;
            server.write_all(response(&accept_key(&key)).as_bytes()).await.unwrap();
            server.write_all(&server_frame(OpCode::Ping, b"hb")).await.unwrap();
            let mut raw = vec![0u8; 2 + 4 + 2];
            server.read_exact(&mut raw).await.unwrap();
            raw
        });

        let _session = ClientSession::handshake(client, "localhost", "/ws/rem/relay", "127.0.0.1")
            .await
            .unwrap();
        let raw = server_task.await.unwrap();
        let (frame, _) = frame::decode_frame(&raw).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Pong);
        assert_eq!(frame.payload, b"hb");
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_session() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            let key = read_request(&mut server).await;
            server.write_all(response(&accept_key(&key)).as_bytes()).await.unwrap();
            // Continuation frame: fragmentation is not supported.
            server.write_all(&[0x00, 0x01, 0x42]).await.unwrap();
            server
        });

        let mut session = ClientSession::handshake(client, "localhost", "/ws/rem/relay", "127.0.0.1")
            .await
            .unwrap();
        match session.next_event().await {
            Some(SessionEvent::Closed(info)) => assert_eq!(info.code, Some(CLOSE_PROTOCOL_ERROR)),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let url = Url::parse("http://example.com/ws").unwrap();
        assert!(matches!(
            ClientSession::connect(&url).await,
            Err(Error::Config { .. })
        ));
    }
}
