//! Tunnel server: terminates relay sessions onto the CONNECT endpoint.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{RelayConfig, ServerConfig};
use crate::error::Result;
use crate::relay::{Relay, Side};
use crate::transport::server::{Acceptor, Handler, RequestHead, Route};
use crate::transport::session::{CLOSE_GOING_AWAY, CLOSE_PROXY_ERROR, Session};

use super::connect::ConnectEndpoint;
use super::{HEALTHCHECK_PATH, REMOTE_RELAY_PATH, ROOT_PATH};

// ============================================================================
// Server
// ============================================================================

/// Entry point of the tunnel server.
pub struct Server;

impl Server {
    /// Starts the CONNECT endpoint and the WebSocket acceptor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] on invalid settings or
    /// [`crate::Error::Io`] if a listener cannot bind.
    pub async fn start(config: ServerConfig) -> Result<ServerHandle> {
        config.validate()?;
        info!(host = %config.host, port = config.port, "Tunnel server is starting");

        let endpoint = ConnectEndpoint::bind(
            &config.connect_host,
            config.connect_port,
            config.allow_private_destinations,
        )
        .await?;
        let connect_addr = endpoint.local_addr();

        let acceptor = Acceptor::bind(&config.host, config.port).await?;
        let ws_addr = acceptor.local_addr();

        let cancel = CancellationToken::new();
        let handler = Arc::new(ServerHandler {
            connect_addr,
            relay: config.relay.clone(),
            cancel: cancel.clone(),
        });

        let tasks = vec![endpoint.spawn(), acceptor.spawn(handler)];
        info!(%ws_addr, %connect_addr, "Tunnel server is ready");

        Ok(ServerHandle {
            ws_addr,
            connect_addr,
            cancel,
            tasks,
        })
    }
}

// ============================================================================
// ServerHandle
// ============================================================================

/// A running tunnel server.
#[derive(Debug)]
pub struct ServerHandle {
    ws_addr: SocketAddr,
    connect_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Returns the WebSocket listener address.
    #[inline]
    #[must_use]
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    /// Returns the CONNECT endpoint address.
    #[inline]
    #[must_use]
    pub fn connect_addr(&self) -> SocketAddr {
        self.connect_addr
    }

    /// Stops accepting and closes every relay session.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
        info!("Tunnel server stopped");
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.cancel.is_cancelled() {
            self.shutdown();
        }
    }
}

// ============================================================================
// ServerHandler
// ============================================================================

struct ServerHandler {
    connect_addr: SocketAddr,
    relay: RelayConfig,
    cancel: CancellationToken,
}

impl Handler for ServerHandler {
    fn route(&self, request: &RequestHead) -> Route {
        match request.path.as_str() {
            ROOT_PATH | HEALTHCHECK_PATH => Route::Healthcheck,
            REMOTE_RELAY_PATH => Route::Upgrade,
            _ => Route::NotFound,
        }
    }

    fn on_session(&self, request: RequestHead, session: Session) {
        info!(ip = %request.remote_ip, sig = %session.signature(), "WebSocket is open");
        tokio::spawn(serve_session(
            session,
            self.connect_addr,
            self.relay.clone(),
            self.cancel.clone(),
        ));
    }
}

/// Binds the session to fresh relays until a binding fails.
async fn serve_session(
    mut session: Session,
    connect_addr: SocketAddr,
    config: RelayConfig,
    cancel: CancellationToken,
) {
    loop {
        let stream = match TcpStream::connect(connect_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(sig = %session.signature(), error = %e, "Proxy connection error");
                session.close(CLOSE_PROXY_ERROR, "proxy connection error");
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        let mut relay = Relay::new(Side::Remote, stream, config.clone());
        let completion = tokio::select! {
            completion = relay.bind(&mut session) => completion,
            () = cancel.cancelled() => {
                session.close(CLOSE_GOING_AWAY, "shutdown");
                return;
            }
        };
        if !completion.is_success() {
            return;
        }
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
    use tokio::time::timeout;

    use crate::protocol::UNBIND;
    use crate::transport::session::Outbound;

    fn route(path: &str) -> Route {
        let handler = ServerHandler {
            connect_addr: "127.0.0.1:9".parse().unwrap(),
            relay: RelayConfig::default(),
            cancel: CancellationToken::new(),
        };
        let request = RequestHead {
            method: "GET".to_string(),
            path: path.to_string(),
            headers: Vec::new(),
            remote_ip: "127.0.0.1".to_string(),
        };
        handler.route(&request)
    }

    #[test]
    fn test_routes() {
        assert_eq!(route("/"), Route::Healthcheck);
        assert_eq!(route("/healthcheck"), Route::Healthcheck);
        assert_eq!(route("/ws/rem/relay"), Route::Upgrade);
        assert_eq!(route("/ws/loc/relay"), Route::NotFound);
    }

    #[tokio::test]
    async fn test_proxy_connection_error_closes_with_4000() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);

        let (session, mut peer) = Session::test_pair();
        serve_session(session, addr, RelayConfig::default(), CancellationToken::new()).await;
        assert!(matches!(
            peer.try_sent(),
            Some(Outbound::Close { code: 4000, ref reason }) if reason == "proxy connection error"
        ));
    }

    #[tokio::test]
    async fn test_session_rebinds_after_unbind() {
        let endpoint = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = endpoint.local_addr().unwrap();
        let (session, mut peer) = Session::test_pair();
        let task = tokio::spawn(serve_session(
            session,
            addr,
            RelayConfig::default(),
            CancellationToken::new(),
        ));

        let (first, _) = endpoint.accept().await.unwrap();
        drop(first);
        let sent = timeout(Duration::from_secs(5), peer.sent()).await.unwrap();
        assert!(matches!(sent, Some(Outbound::Text(ref t)) if t == UNBIND));

        peer.text(UNBIND);
        let (_second, _) = timeout(Duration::from_secs(5), endpoint.accept())
            .await
            .unwrap()
            .unwrap();

        peer.close(1000, "");
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
