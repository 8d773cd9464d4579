//! Pool of idle, reusable WebSocket sessions.
//!
//! Relays borrow sessions from the pool and hand them back after a clean
//! unbind. When the pool is empty, acquisitions queue up in FIFO order and
//! a single demand signal asks the session source (direct connector or the
//! browser control channel) for more sessions.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 SessionPool                  │
//! │  idle:    [S1, S2, ...]   (≤ max_size)       │
//! │  waiters: [W1, W2, ...]   (FIFO oneshots)    │
//! │  outstanding: requested, not yet arrived     │
//! └──────────────┬───────────────────────────────┘
//!                │ demand(batch)   ▲ add(session) / source_failed()
//!                ▼                 │
//!        Connector / ControlChannel
//! ```
//!
//! # Races
//!
//! Each waiter is a `oneshot` channel. Delivery either succeeds (the
//! receiver is still alive) or hands the session back to the pool, so a
//! timed-out or cancelled acquisition never receives a session. A session
//! that lands in a receiver at the exact moment its acquisition gives up is
//! reclaimed by [`Waiter`]'s drop and released again.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::relay::CloseReason;
use crate::transport::session::{CLOSE_NORMAL, Session};

// ============================================================================
// Types
// ============================================================================

/// What a waiting acquisition receives.
type Delivery = Result<Session>;

/// Receiver of demand signals; each value is the number of sessions wanted.
pub type DemandReceiver = mpsc::UnboundedReceiver<usize>;

// ============================================================================
// PoolInner
// ============================================================================

#[derive(Default)]
struct PoolInner {
    /// Open sessions not bound to any relay.
    idle: VecDeque<Session>,
    /// Pending acquisitions, oldest first.
    waiters: VecDeque<oneshot::Sender<Delivery>>,
    /// Sessions requested from the source and not yet arrived.
    outstanding: usize,
    /// Bumped on every demand signal.
    demand_generation: u64,
    /// Sessions ever delivered by the source.
    added: usize,
    /// Set by `shutdown`.
    closed: bool,
}

impl PoolInner {
    /// Drops waiters whose acquisition has already given up.
    fn prune_waiters(&mut self) {
        self.waiters.retain(|w| !w.is_closed());
    }
}

// ============================================================================
// SessionPool
// ============================================================================

/// Bounded pool of idle sessions plus a FIFO of pending acquisitions.
///
/// Constructed once per listening endpoint and shared by `Arc`.
///
/// # Example
///
/// ```ignore
/// let (pool, mut demand) = SessionPool::new(PoolConfig::default());
/// tokio::spawn(async move {
///     while let Some(count) = demand.recv().await {
///         // open `count` sessions and pool.add() them
///     }
/// });
/// let session = pool.acquire().await?;
/// ```
pub struct SessionPool {
    /// Size, batch and timeout settings.
    config: PoolConfig,
    /// Idle set, wait queue and demand accounting.
    inner: Mutex<PoolInner>,
    /// Demand signal sink.
    demand_tx: mpsc::UnboundedSender<usize>,
}

// ============================================================================
// SessionPool - Constructor
// ============================================================================

impl SessionPool {
    /// Creates an empty pool and the receiver of its demand signals.
    #[must_use]
    pub fn new(config: PoolConfig) -> (Arc<Self>, DemandReceiver) {
        let (demand_tx, demand_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(Self {
            config,
            inner: Mutex::new(PoolInner::default()),
            demand_tx,
        });
        (pool, demand_rx)
    }
}

// ============================================================================
// SessionPool - Accessors
// ============================================================================

impl SessionPool {
    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the number of idle sessions.
    #[inline]
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.lock().idle.len()
    }

    /// Returns the number of pending acquisitions.
    #[inline]
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.prune_waiters();
        inner.waiters.len()
    }

    /// Returns how many sessions the source has delivered so far.
    #[inline]
    #[must_use]
    pub fn added_count(&self) -> usize {
        self.inner.lock().added
    }

    /// Returns the number of requested sessions that have not arrived.
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }
}

// ============================================================================
// SessionPool - Acquire
// ============================================================================

impl SessionPool {
    /// Acquires an open session.
    ///
    /// Returns an idle session immediately if one exists. Otherwise queues
    /// behind earlier acquisitions, signals demand once per empty pool, and
    /// waits up to the configured timeout. Sessions found closed are
    /// discarded and acquisition continues.
    ///
    /// # Errors
    ///
    /// - [`Error::PoolTimeout`] if no live session arrives in time
    /// - [`Error::PoolClosed`] if the pool shuts down while waiting
    /// - the source's error if the session requested for this waiter failed
    pub async fn acquire(&self) -> Result<Session> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        loop {
            let waiter = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(Error::PoolClosed);
                }
                match inner.idle.pop_front() {
                    Some(session) => Err(session),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        inner.prune_waiters();
                        inner.waiters.push_back(tx);
                        self.signal_demand(&mut inner);
                        Ok(Waiter {
                            rx,
                            pool: self,
                            generation: inner.demand_generation,
                        })
                    }
                }
            };

            let session = match waiter {
                Err(session) => session,
                Ok(mut waiter) => match timeout_at(deadline, &mut waiter.rx).await {
                    Ok(Ok(delivery)) => delivery?,
                    Ok(Err(_)) => return Err(Error::PoolClosed),
                    Err(_) => match waiter.reclaim() {
                        Some(Ok(session)) => session,
                        Some(Err(e)) => return Err(e),
                        None => {
                            self.forget_demand(waiter.generation);
                            return Err(Error::pool_timeout(
                                self.config.acquire_timeout.as_millis() as u64,
                            ));
                        }
                    },
                },
            };

            if session.is_open() {
                return Ok(session);
            }

            info!(
                state = %session.state(),
                sig = %session.signature(),
                "WebSocket is dead, retrying"
            );
            drop(session);
            tokio::task::yield_now().await;
        }
    }

    /// Emits one demand signal if nothing is outstanding.
    fn signal_demand(&self, inner: &mut PoolInner) {
        if inner.outstanding > 0 || inner.waiters.is_empty() {
            return;
        }
        let batch = self.config.batch_size;
        inner.outstanding = batch;
        inner.demand_generation += 1;
        if self.demand_tx.send(batch).is_err() {
            warn!("No session source is listening for demand");
        }
        debug!(count = batch, waiting = inner.waiters.len(), "WebSocket is requested");
    }

    /// Clears demand that evidently got lost and asks again for the
    /// remaining waiters.
    ///
    /// `generation` is the demand a timed-out waiter was waiting on. If no
    /// newer signal went out during its whole timeout, the sessions still
    /// counted as outstanding are not coming.
    fn forget_demand(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.demand_generation != generation || inner.outstanding == 0 {
            return;
        }
        warn!(
            outstanding = inner.outstanding,
            "Requested sessions never arrived, requesting again"
        );
        inner.outstanding = 0;
        inner.prune_waiters();
        self.signal_demand(&mut inner);
    }
}

// ============================================================================
// SessionPool - Supply
// ============================================================================

impl SessionPool {
    /// Adds a newly opened session from the session source.
    ///
    /// Counts against outstanding demand; the oldest waiter gets it first.
    pub fn add(&self, session: Session) {
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);
        inner.added += 1;
        self.offer(&mut inner, session);
        self.signal_demand(&mut inner);
    }

    /// Returns a session after a clean bind/unbind cycle.
    ///
    /// Closed sessions are dropped. If the pool is already full the session
    /// is purged (closed) instead of queued.
    pub fn release(&self, session: Session) {
        if !session.is_open() {
            debug!(sig = %session.signature(), "Released session is closed, dropping");
            return;
        }
        let mut inner = self.inner.lock();
        self.offer(&mut inner, session);
    }

    /// Reports that a requested session could not be opened.
    ///
    /// The oldest waiter receives the error; if waiters remain and no other
    /// requests are outstanding, demand is signalled again.
    pub fn source_failed(&self, error: Error) {
        let mut inner = self.inner.lock();
        inner.outstanding = inner.outstanding.saturating_sub(1);

        let mut error = Some(error);
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(Err(error.take().unwrap_or(Error::ConnectionClosed))) {
                Ok(()) => break,
                Err(Err(e)) => error = Some(e),
                Err(Ok(_)) => unreachable!("only errors are sent here"),
            }
        }

        self.signal_demand(&mut inner);
    }

    /// Delivers to the oldest live waiter, else idles or purges.
    fn offer(&self, inner: &mut PoolInner, mut session: Session) {
        if inner.closed {
            session.close(CLOSE_NORMAL, CloseReason::Shutdown.as_str());
            return;
        }

        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(Ok(session)) {
                Ok(()) => return,
                Err(Ok(returned)) => session = returned,
                Err(Err(_)) => unreachable!("only sessions are sent here"),
            }
        }

        if inner.idle.len() < self.config.max_size {
            debug!(sig = %session.signature(), idle = inner.idle.len() + 1, "Session is idle");
            inner.idle.push_back(session);
        } else {
            info!(sig = %session.signature(), "WebSocket is purged");
            session.close(CLOSE_NORMAL, CloseReason::Purge.as_str());
        }
    }
}

// ============================================================================
// SessionPool - Lifecycle
// ============================================================================

impl SessionPool {
    /// Closes idle sessions and fails all waiters.
    pub fn shutdown(&self) {
        let (idle, waiters) = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.outstanding = 0;
            (
                std::mem::take(&mut inner.idle),
                std::mem::take(&mut inner.waiters),
            )
        };

        for session in idle {
            session.close(CLOSE_NORMAL, CloseReason::Shutdown.as_str());
        }
        // Dropping senders wakes receivers with PoolClosed.
        drop(waiters);

        info!("Session pool shut down");
    }
}

// ============================================================================
// Waiter
// ============================================================================

/// A queued acquisition.
///
/// Dropping it (timeout or cancellation) closes the receiver; anything
/// delivered before that is handed back to the pool.
struct Waiter<'a> {
    rx: oneshot::Receiver<Delivery>,
    pool: &'a SessionPool,
    /// Demand generation current when the waiter was queued.
    generation: u64,
}

impl Waiter<'_> {
    /// Stops accepting deliveries and returns one that already arrived.
    fn reclaim(&mut self) -> Option<Delivery> {
        self.rx.close();
        self.rx.try_recv().ok()
    }
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(Ok(session)) = self.reclaim() {
            debug!(sig = %session.signature(), "Reclaimed session from cancelled acquisition");
            self.pool.release(session);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
