//! Bounded pool of news server sessions.
//!
//! A [`ConnectionPool`] is either *shared* (created once by the composition root,
//! used by every engine call that opts in, closed at shutdown) or *ephemeral*
//! (created for one engine call and closed at its end). Both modes use the same type.
//!
//! Checked-out sessions are limited by a semaphore with `max_connections` permits.
//! Idle sessions sit in a LIFO stack so the most recently used (and therefore most
//! likely still open) session is handed out first.

use crate::error::{Error, Result};
use crate::nntp::{ArticleBody, ArticleStatus, Connector, NntpSession};
use crate::types::PoolTotals;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Snapshot of pool counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Sessions ever opened
    pub created: u64,
    /// Idle sessions ever handed out again
    pub reused: u64,
    /// Sessions ever closed or discarded
    pub closed: u64,
    /// Successful checkouts
    pub acquisitions: u64,
    /// Sessions currently checked out
    pub in_use: usize,
    /// Sessions currently idle
    pub idle: usize,
    /// Highest number of simultaneously checked-out sessions
    pub peak_in_use: usize,
    /// Configured cap
    pub max_connections: usize,
}

impl PoolStats {
    /// Cumulative counters only
    pub fn totals(&self) -> PoolTotals {
        PoolTotals {
            created: self.created,
            reused: self.reused,
            closed: self.closed,
        }
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    reused: AtomicU64,
    closed: AtomicU64,
    acquisitions: AtomicU64,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

/// Bounded, thread-safe pool of sessions against one server
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    max_connections: usize,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn NntpSession>>>,
    counters: Counters,
    closed: AtomicBool,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_connections", &self.max_connections)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool; with `keep_alive` set, idle sessions are pinged on that interval.
    ///
    /// Must be called from within a Tokio runtime when `keep_alive` is set.
    pub fn new(
        connector: Arc<dyn Connector>,
        max_connections: usize,
        keep_alive: Option<Duration>,
    ) -> Arc<Self> {
        let max_connections = max_connections.max(1);
        let pool = Arc::new(Self {
            connector,
            max_connections,
            permits: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(Vec::new()),
            counters: Counters::default(),
            closed: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        });

        if let Some(interval) = keep_alive.filter(|d| !d.is_zero()) {
            spawn_keep_alive(Arc::downgrade(&pool), interval, pool.cancel_token.clone());
        }

        pool
    }

    /// Check out a session, waiting for a free slot until `deadline`.
    ///
    /// Returns [`Error::PoolExhausted`] when no slot frees up in time and
    /// [`Error::PoolClosed`] once [`close_all`](Self::close_all) has run. Opening a
    /// new session is bounded by the same deadline.
    pub async fn acquire(self: &Arc<Self>, deadline: Instant) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let permit =
            match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::PoolClosed),
                Err(_) => return Err(Error::PoolExhausted),
            };

        let session = match self.pop_idle() {
            Some(session) => {
                self.counters.reused.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("reusing idle NNTP session");
                session
            }
            None => {
                let session = tokio::time::timeout_at(deadline, self.connector.connect())
                    .await
                    .map_err(|_| Error::Timeout)??;
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    created = self.counters.created.load(Ordering::Relaxed),
                    "created NNTP session"
                );
                session
            }
        };

        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        let in_use = self.counters.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.counters.peak_in_use.fetch_max(in_use, Ordering::AcqRel);

        Ok(PooledConnection {
            session: Some(session),
            permit: Some(permit),
            pool: Arc::clone(self),
        })
    }

    /// Open up to `count` sessions ahead of demand, never exceeding the cap.
    ///
    /// Returns how many sessions were opened.
    pub async fn pre_warm(&self, count: usize) -> Result<usize> {
        let mut opened = 0;
        for _ in 0..count {
            if self.is_closed() || self.in_use() + self.idle_count() >= self.max_connections {
                break;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let session = self.connector.connect().await?;
            self.counters.created.fetch_add(1, Ordering::Relaxed);
            self.push_idle(session);
            drop(permit);
            opened += 1;
        }
        if opened > 0 {
            tracing::debug!(opened, "pre-warmed NNTP sessions");
        }
        Ok(opened)
    }

    /// Fire-and-forget [`pre_warm`](Self::pre_warm); failures are logged, never returned
    pub fn spawn_pre_warm(self: &Arc<Self>, count: usize) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.pre_warm(count).await {
                tracing::warn!(error = %e, requested = count, "NNTP pool pre-warm failed");
            }
        })
    }

    /// Close every idle session and refuse further checkouts.
    ///
    /// Sessions still checked out are closed when they come back.
    pub async fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel_token.cancel();
        self.permits.close();

        let drained: Vec<Box<dyn NntpSession>> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        let count = drained.len();
        for mut session in drained {
            session.quit().await;
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
        }
        tracing::debug!(closed = count, "closed NNTP pool");
    }

    /// Whether [`close_all`](Self::close_all) has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Configured cap on checked-out sessions
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.counters.created.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            in_use: self.in_use(),
            idle: self.idle_count(),
            peak_in_use: self.counters.peak_in_use.load(Ordering::Relaxed),
            max_connections: self.max_connections,
        }
    }

    fn in_use(&self) -> usize {
        self.counters.in_use.load(Ordering::Acquire)
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn pop_idle(&self) -> Option<Box<dyn NntpSession>> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    fn push_idle(&self, session: Box<dyn NntpSession>) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push(session),
            Err(_) => self.discard(session),
        }
    }

    fn discard(&self, session: Box<dyn NntpSession>) {
        drop(session);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn check_in(&self, session: Box<dyn NntpSession>, healthy: bool) {
        self.counters.in_use.fetch_sub(1, Ordering::AcqRel);
        if healthy && !self.is_closed() {
            self.push_idle(session);
        } else {
            tracing::trace!(healthy, "discarding NNTP session");
            self.discard(session);
        }
    }

    /// Ping every session that is idle right now; failing ones are discarded
    async fn ping_idle(&self) {
        let rounds = self.idle_count();
        for _ in 0..rounds {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(mut session) = self.pop_idle() else {
                break;
            };
            match session.ping().await {
                Ok(()) if !self.is_closed() => self.push_idle(session),
                Ok(()) => self.discard(session),
                Err(e) => {
                    tracing::debug!(error = %e, "idle NNTP session failed keep-alive");
                    self.discard(session);
                }
            }
            drop(permit);
        }
    }
}

fn spawn_keep_alive(pool: Weak<ConnectionPool>, period: Duration, cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(pool) = pool.upgrade() else {
                        break;
                    };
                    pool.ping_idle().await;
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
    });
}

/// A checked-out session.
///
/// Hand it back with [`release`](Self::release). Dropping it without releasing
/// (for example because the surrounding future was cancelled) discards the session.
pub struct PooledConnection {
    session: Option<Box<dyn NntpSession>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// `STAT` on the underlying session
    pub async fn stat(&mut self, message_id: &str) -> Result<ArticleStatus> {
        self.session()?.stat(message_id).await
    }

    /// `BODY` on the underlying session, keeping at most `limit` bytes
    pub async fn body(&mut self, message_id: &str, limit: usize) -> Result<Option<ArticleBody>> {
        self.session()?.body(message_id, limit).await
    }

    /// Return the session; unhealthy sessions are closed instead of pooled
    pub fn release(mut self, healthy: bool) {
        self.finish(healthy);
    }

    fn session(&mut self) -> Result<&mut Box<dyn NntpSession>> {
        self.session.as_mut().ok_or(Error::PoolClosed)
    }

    fn finish(&mut self, healthy: bool) {
        if let Some(session) = self.session.take() {
            self.pool.check_in(session, healthy);
        }
        // Permit goes back only after the session is idle again.
        self.permit.take();
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.finish(false);
    }
}
