//! Tunnel client: local proxy listener backed by the session pool.
//!
//! In direct mode the client opens relay sessions to the server itself. In
//! browser mode a device connects a control channel to the client's
//! WebSocket listener and opens the relay sessions on the client's behalf;
//! the local proxy only listens while that control channel is up.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{ClientConfig, Mode};
use crate::error::{Error, Result};
use crate::relay::{CloseReason, Relay, Side};
use crate::transport::client::ClientSession;
use crate::transport::pool::{DemandReceiver, SessionPool};
use crate::transport::server::{Acceptor, Handler, RequestHead, Route};
use crate::transport::session::{CLOSE_NORMAL, Session};

use super::control::ControlChannel;
use super::{LOCAL_CONTROL_PATH, LOCAL_RELAY_PATH};

// ============================================================================
// ClientShared
// ============================================================================

/// State shared by the listener, connector and relay tasks.
struct ClientShared {
    config: ClientConfig,
    pool: Arc<SessionPool>,
    cancel: CancellationToken,
    proxy_addr: watch::Sender<Option<SocketAddr>>,
}

// ============================================================================
// Client
// ============================================================================

/// Entry point of the tunnel client.
pub struct Client;

impl Client {
    /// Starts the client in the configured mode.
    ///
    /// In direct mode the local proxy is listening when this returns. In
    /// browser mode it starts once a device connects; use
    /// [`ClientHandle::ready`] to wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on invalid settings or [`Error::Io`] if a
    /// listener cannot bind.
    pub async fn start(config: ClientConfig) -> Result<ClientHandle> {
        config.validate()?;
        info!(mode = %config.mode, "Tunnel client is starting");

        let (pool, demand) = SessionPool::new(config.pool.clone());
        let (proxy_addr, proxy_rx) = watch::channel(None);
        let shared = Arc::new(ClientShared {
            config,
            pool,
            cancel: CancellationToken::new(),
            proxy_addr,
        });

        let ws_addr = match shared.config.mode {
            Mode::Direct => {
                let relay_url = shared.config.relay_url()?;
                let listener = bind_proxy(&shared).await?;
                tokio::spawn(run_proxy(
                    Arc::clone(&shared),
                    listener,
                    shared.cancel.clone(),
                ));
                tokio::spawn(run_connector(Arc::clone(&shared), demand, relay_url));
                None
            }
            Mode::Browser => {
                let acceptor = Acceptor::bind(&shared.config.host, shared.config.port).await?;
                let ws_addr = acceptor.local_addr();
                let handler = Arc::new(BrowserHandler {
                    shared: Arc::clone(&shared),
                    state: Arc::new(Mutex::new(BrowserState {
                        demand: Some(demand),
                        control_ip: None,
                    })),
                });
                let task = acceptor.spawn(handler);
                let cancel = shared.cancel.clone();
                tokio::spawn(async move {
                    cancel.cancelled().await;
                    task.abort();
                });
                info!(url = %format!("http://{ws_addr}"), "Waiting for device to connect");
                Some(ws_addr)
            }
        };

        Ok(ClientHandle {
            shared,
            ws_addr,
            proxy_rx,
        })
    }
}

// ============================================================================
// ClientHandle
// ============================================================================

/// A running tunnel client.
pub struct ClientHandle {
    shared: Arc<ClientShared>,
    ws_addr: Option<SocketAddr>,
    proxy_rx: watch::Receiver<Option<SocketAddr>>,
}

impl ClientHandle {
    /// Returns the mode the client runs in.
    #[inline]
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.shared.config.mode
    }

    /// Returns the browser-mode WebSocket listener address.
    #[inline]
    #[must_use]
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    /// Returns the local proxy address while it is listening.
    #[inline]
    #[must_use]
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        *self.proxy_rx.borrow()
    }

    /// Returns the session pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.shared.pool
    }

    /// Waits until the local proxy is listening and returns its address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] if the client shuts down first.
    pub async fn ready(&self) -> Result<SocketAddr> {
        let mut rx = self.proxy_rx.clone();
        tokio::select! {
            addr = rx.wait_for(Option::is_some) => {
                let addr = *addr.map_err(|_| Error::PoolClosed)?;
                addr.ok_or(Error::PoolClosed)
            }
            () = self.shared.cancel.cancelled() => Err(Error::PoolClosed),
        }
    }

    /// Stops the listeners and closes idle sessions.
    pub fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.pool.shutdown();
        info!("Tunnel client stopped");
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        if !self.shared.cancel.is_cancelled() {
            self.shutdown();
        }
    }
}

// ============================================================================
// Local Proxy
// ============================================================================

async fn bind_proxy(shared: &ClientShared) -> Result<TcpListener> {
    let listener =
        TcpListener::bind((shared.config.proxy_host.as_str(), shared.config.proxy_port)).await?;
    let addr = listener.local_addr()?;
    shared.proxy_addr.send_replace(Some(addr));
    info!(kind = "https", %addr, "Proxy server is ready");
    Ok(listener)
}

/// Accepts proxy clients until `stop` fires.
async fn run_proxy(shared: Arc<ClientShared>, listener: TcpListener, stop: CancellationToken) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "Proxy connection accepted");
                    tokio::spawn(serve_local(Arc::clone(&shared), stream));
                }
                Err(e) => warn!(error = %e, "Proxy accept failed"),
            },
        }
    }
    shared.proxy_addr.send_replace(None);
    info!("Proxy server is stopped");
}

/// Waits for a session, binds it, and returns it to the pool on success.
async fn serve_local(shared: Arc<ClientShared>, stream: TcpStream) {
    let _ = stream.set_nodelay(true);
    let mut relay = Relay::new(Side::Local, stream, shared.config.local_relay());

    let acquired = tokio::select! {
        acquired = shared.pool.acquire() => acquired,
        () = relay.closed_while_paused() => {
            debug!(sig = %relay.signature(), "Proxy client left while waiting");
            relay.close(CloseReason::Normal).await;
            return;
        }
    };

    let mut session = match acquired {
        Ok(session) => session,
        Err(e) => {
            warn!(sig = %relay.signature(), error = %e, "No session for proxy connection");
            relay.close(CloseReason::from_acquire_error(&e)).await;
            return;
        }
    };

    if relay.bind(&mut session).await.is_success() {
        shared.pool.release(session);
    }
}

// ============================================================================
// Direct Mode
// ============================================================================

/// Opens relay sessions to the server on demand.
async fn run_connector(shared: Arc<ClientShared>, mut demand: DemandReceiver, url: Url) {
    loop {
        let count = tokio::select! {
            () = shared.cancel.cancelled() => return,
            count = demand.recv() => match count {
                Some(count) => count,
                None => return,
            },
        };
        info!(count, waitcnt = shared.pool.waiting_count(), "WebSocket is requested");

        for _ in 0..count {
            let pool = Arc::clone(&shared.pool);
            let url = url.clone();
            tokio::spawn(async move {
                match ClientSession::connect(&url).await {
                    Ok(session) => {
                        info!(ip = %session.peer(), sig = %session.signature(), "WebSocket is open");
                        pool.add(session);
                    }
                    Err(e) if e.is_recoverable() => {
                        warn!(error = %e, "Server connection error");
                        pool.source_failed(Error::connection("server connection error"));
                    }
                    Err(e) => {
                        error!(error = %e, "Server connection failed permanently");
                        pool.source_failed(Error::connection("server connection error"));
                    }
                }
            });
        }
    }
}

// ============================================================================
// Browser Mode
// ============================================================================

/// Control channel bookkeeping.
struct BrowserState {
    /// Held here while no control channel is connected.
    demand: Option<DemandReceiver>,
    /// Peer of the connected control channel.
    control_ip: Option<String>,
}

struct BrowserHandler {
    shared: Arc<ClientShared>,
    state: Arc<Mutex<BrowserState>>,
}

impl Handler for BrowserHandler {
    fn route(&self, request: &RequestHead) -> Route {
        let state = self.state.lock();
        match request.path.as_str() {
            LOCAL_CONTROL_PATH if state.control_ip.is_none() => Route::Upgrade,
            LOCAL_RELAY_PATH if state.control_ip.as_deref() == Some(request.remote_ip.as_str()) => {
                Route::Upgrade
            }
            _ => Route::NotFound,
        }
    }

    fn on_session(&self, request: RequestHead, session: Session) {
        match request.path.as_str() {
            LOCAL_CONTROL_PATH => {
                let demand = {
                    let mut state = self.state.lock();
                    match state.demand.take() {
                        Some(demand) => {
                            state.control_ip = Some(request.remote_ip.clone());
                            Some(demand)
                        }
                        None => None,
                    }
                };
                let Some(demand) = demand else {
                    // Lost a race with another control channel.
                    session.close(CLOSE_NORMAL, "control channel in use");
                    return;
                };
                tokio::spawn(run_control(
                    Arc::clone(&self.shared),
                    Arc::clone(&self.state),
                    session,
                    demand,
                    request.remote_ip,
                ));
            }
            LOCAL_RELAY_PATH => {
                info!(ip = %request.remote_ip, sig = %session.signature(), "WebSocket is open");
                self.shared.pool.add(session);
            }
            _ => {}
        }
    }
}

/// Runs one device connection: proxy listener up while the control channel lives.
async fn run_control(
    shared: Arc<ClientShared>,
    state: Arc<Mutex<BrowserState>>,
    session: Session,
    demand: DemandReceiver,
    ip: String,
) {
    info!(%ip, sig = %session.signature(), "Device is connected");

    let listener = match bind_proxy(&shared).await {
        Ok(listener) => Some(listener),
        Err(e) => {
            error!(error = %e, "Proxy server failed to start");
            session.close(CLOSE_NORMAL, "proxy unavailable");
            None
        }
    };

    let demand = match listener {
        Some(listener) => {
            let stop = shared.cancel.child_token();
            let proxy = tokio::spawn(run_proxy(Arc::clone(&shared), listener, stop.clone()));
            let channel = ControlChannel::new(session, shared.config.server_url.clone());
            let demand = channel.run(demand, shared.cancel.clone()).await;
            stop.cancel();
            let _ = proxy.await;
            demand
        }
        None => demand,
    };

    let mut state = state.lock();
    state.control_ip = None;
    state.demand = Some(demand);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    use crate::config::PoolConfig;
    use crate::transport::session::Outbound;

    const REQUEST: &[u8] = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";

    fn shared(acquire_timeout: Duration) -> (Arc<ClientShared>, DemandReceiver) {
        let url = Url::parse("ws://127.0.0.1:9").unwrap();
        let config = ClientConfig::direct(url)
            .with_pool(PoolConfig::new().with_acquire_timeout(acquire_timeout));
        let (pool, demand) = SessionPool::new(config.pool.clone());
        let (proxy_addr, _) = watch::channel(None);
        let shared = Arc::new(ClientShared {
            config,
            pool,
            cancel: CancellationToken::new(),
            proxy_addr,
        });
        (shared, demand)
    }

    /// Returns the proxy client's end and the accepted end.
    async fn proxy_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pool_timeout_closes_proxy_connection() {
        let (shared, mut demand) = shared(Duration::from_millis(100));
        let (mut client, accepted) = proxy_pair().await;
        let task = tokio::spawn(serve_local(Arc::clone(&shared), accepted));

        client.write_all(REQUEST).await.unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(demand.try_recv().unwrap(), 1);

        // Unread request bytes may turn the close into a reset; either way no reply.
        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap();
        assert!(!matches!(read, Ok(n) if n > 0));

        assert_eq!(shared.pool.waiting_count(), 0);
        assert_eq!(shared.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_hangup_while_waiting_abandons_acquisition() {
        let (shared, _demand) = shared(Duration::from_secs(60));
        let (client, accepted) = proxy_pair().await;
        let task = tokio::spawn(serve_local(Arc::clone(&shared), accepted));

        while shared.pool.waiting_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(client);

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(shared.pool.waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_session_from_pool_carries_request() {
        let (shared, _demand) = shared(Duration::from_secs(5));
        let (mut client, accepted) = proxy_pair().await;
        let (session, mut peer) = Session::test_pair();
        shared.pool.add(session);

        let task = tokio::spawn(serve_local(Arc::clone(&shared), accepted));
        client.write_all(REQUEST).await.unwrap();
        match timeout(Duration::from_secs(5), peer.sent()).await.unwrap() {
            Some(Outbound::Binary(data)) => assert_eq!(data, REQUEST),
            other => panic!("expected the request bytes, got {other:?}"),
        }

        peer.close(1000, "");
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(shared.pool.idle_count(), 0);
    }
}
