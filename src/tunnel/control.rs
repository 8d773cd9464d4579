//! Browser-mode control channel.
//!
//! A single signaling-only session from the browser. It is told the tunnel
//! endpoint once on open, then receives a batch size every time the pool
//! signals demand. It never carries relay bytes.

// ============================================================================
// Imports
// ============================================================================

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::protocol::ControlMessage;
use crate::transport::pool::DemandReceiver;
use crate::transport::session::{CLOSE_GOING_AWAY, Session, SessionEvent};

// ============================================================================
// ControlChannel
// ============================================================================

/// The signaling session of one connected device.
#[derive(Debug)]
pub struct ControlChannel {
    session: Session,
    endpoint: Url,
}

impl ControlChannel {
    /// Wraps an open session.
    #[must_use]
    pub fn new(session: Session, endpoint: Url) -> Self {
        Self { session, endpoint }
    }

    /// Announces the endpoint and forwards demand until the session closes
    /// or `shutdown` fires.
    ///
    /// Returns the demand receiver so the next control channel can take
    /// over.
    pub async fn run(
        mut self,
        mut demand: DemandReceiver,
        shutdown: CancellationToken,
    ) -> DemandReceiver {
        let sig = self.session.signature();
        let announce = ControlMessage::Endpoint(self.endpoint.clone()).to_text();
        if let Err(e) = self.session.send_text(announce) {
            warn!(%sig, error = %e, "Control channel closed before announce");
            return demand;
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    self.session.close(CLOSE_GOING_AWAY, "shutdown");
                    break;
                }

                count = demand.recv() => {
                    let Some(count) = count else { break };
                    match self.session.send_text(ControlMessage::Batch(count).to_text()) {
                        Ok(()) => debug!(%sig, count, "WebSocket batch requested"),
                        Err(e) => warn!(%sig, count, error = %e, "Batch request lost"),
                    }
                }

                event = self.session.next_event() => match event {
                    Some(SessionEvent::Closed(close)) => {
                        info!(%sig, code = ?close.code, reason = %close.reason, "Device is disconnected");
                        break;
                    }
                    None => break,
                    Some(SessionEvent::Text(text)) => {
                        warn!(%sig, len = text.len(), "Unexpected text on control channel");
                    }
                    Some(SessionEvent::Binary(data)) => {
                        warn!(%sig, bytes = data.len(), "Unexpected binary on control channel");
                    }
                },
            }
        }

        demand
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::config::PoolConfig;
    use crate::transport::pool::SessionPool;
    use crate::transport::session::{Outbound, TestPeer};

    async fn next_text(peer: &mut TestPeer) -> String {
        match timeout(Duration::from_secs(5), peer.sent()).await.unwrap() {
            Some(Outbound::Text(text)) => text,
            other => panic!("expected text, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_announces_endpoint_and_forwards_demand() {
        let (pool, demand) = SessionPool::new(PoolConfig::new().with_batch_size(3));
        let (session, mut peer) = Session::test_pair();
        let endpoint = Url::parse("wss://tunnel.example.com").unwrap();
        let channel = ControlChannel::new(session, endpoint);
        let task = tokio::spawn(channel.run(demand, CancellationToken::new()));

        assert_eq!(next_text(&mut peer).await, "wss://tunnel.example.com/");

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        assert_eq!(next_text(&mut peer).await, "3");

        // Closing the control session ends the channel and hands demand back.
        peer.close(1001, "tab closed");
        let mut demand = task.await.unwrap();
        assert!(demand.try_recv().is_err());

        pool.shutdown();
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let (_pool, demand) = SessionPool::new(PoolConfig::new());
        let (session, mut peer) = Session::test_pair();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            ControlChannel::new(session, Url::parse("ws://127.0.0.1:10000").unwrap())
                .run(demand, shutdown.clone()),
        );

        next_text(&mut peer).await;
        shutdown.cancel();
        task.await.unwrap();
        assert!(matches!(
            peer.try_sent(),
            Some(Outbound::Close { code: 1001, .. })
        ));
    }
}
