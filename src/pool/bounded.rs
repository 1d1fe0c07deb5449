//! Bounded Connection Pool
//!
//! A fixed number of anonymous backend connections shared by all callers
//! that do not need session affinity.
//!
//! ## Capacity
//!
//! Capacity is a semaphore with `size` permits, independent of the idle
//! queue. A permit is taken *before* looking for an idle connection, so
//! at most `size` connections are ever checked out, and a caller at full
//! capacity waits on the semaphore (or times out) instead of on the queue.
//! The `acquire` deadline also bounds the replacement connect, so a slow
//! backend cannot hold a caller past its timeout.
//!
//! ```text
//!  acquire(timeout)
//!        │
//!        ▼
//!  ┌──────────────┐  timeout   ┌──────────────────┐
//!  │ take permit  │──────────> │ PoolExhausted    │
//!  └──────┬───────┘            └──────────────────┘
//!         ▼
//!  ┌──────────────┐  empty or  ┌──────────────────┐
//!  │ pop idle     │──────────> │ open replacement │
//!  └──────┬───────┘  stale     └────────┬─────────┘
//!         ▼                             │
//!  PooledConnection <───────────────────┘
//!         │
//!         ▼ drop
//!  healthy → back to idle, permit released
//!  poisoned → discarded,   permit released
//! ```

use crate::connection::{BackendConnection, ConnectionError, ConnectionStats};
use crate::protocol::{Reply, Request};
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Longest wait `acquire` honors; keeps the deadline from overflowing.
const MAX_ACQUIRE_WAIT: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Backend host
    pub host: String,

    /// Backend port
    pub port: u16,

    /// Number of connections (default: 10)
    pub size: usize,

    /// Deadline for opening one connection (default: 5s)
    pub connect_timeout: Duration,

    /// How long `send` waits for a free connection (default: 5s)
    pub acquire_timeout: Duration,

    /// Per-phase deadline of one exchange (default: 5s)
    pub request_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            size: 10,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors returned by the pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No capacity became free within the timeout
    #[error("no pooled connection available within {0:?}")]
    Exhausted(Duration),

    /// The pool has been closed
    #[error("connection pool is closed")]
    Closed,

    /// Opening or using a connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured size
    pub capacity: usize,
    /// Connections that can be checked out right now
    pub available: usize,
    /// Open connections waiting in the idle queue
    pub idle: usize,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} available, {} idle",
            self.available, self.capacity, self.idle
        )
    }
}

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<VecDeque<Arc<BackendConnection>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    stats: Arc<ConnectionStats>,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, VecDeque<Arc<BackendConnection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fixed-capacity pool of backend connections.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Opens `config.size` connections up front.
    ///
    /// If any of them fails, the ones already opened are closed and the
    /// error is returned; a half-filled pool is never handed out.
    pub async fn initialize(
        config: PoolConfig,
        stats: Arc<ConnectionStats>,
    ) -> Result<Self, PoolError> {
        let mut idle = VecDeque::with_capacity(config.size);

        for _ in 0..config.size {
            match BackendConnection::open(
                &config.host,
                config.port,
                config.connect_timeout,
                Arc::clone(&stats),
            )
            .await
            {
                Ok(conn) => idle.push_back(Arc::new(conn)),
                Err(e) => {
                    warn!(
                        host = %config.host,
                        port = config.port,
                        opened = idle.len(),
                        error = %e,
                        "Connection pool initialization failed"
                    );
                    for conn in idle {
                        conn.close().await;
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            host = %config.host,
            port = config.port,
            size = config.size,
            "Connection pool ready"
        );

        Ok(Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.size)),
                idle: Mutex::new(idle),
                closed: AtomicBool::new(false),
                config,
                stats,
            }),
        })
    }

    /// Checks out a connection, waiting up to `limit` in total.
    ///
    /// The deadline covers both the wait for capacity and opening a
    /// replacement when no healthy idle connection is left; running out of
    /// time in either fails with [`PoolError::Exhausted`]. A zero `limit`
    /// never waits. The connection goes back to the pool when the returned
    /// guard is dropped.
    pub async fn acquire(&self, limit: Duration) -> Result<PooledConnection, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let deadline = Instant::now() + limit.min(MAX_ACQUIRE_WAIT);

        let permits = Arc::clone(&self.inner.permits);
        let permit = if limit.is_zero() {
            permits.try_acquire_owned().map_err(|e| match e {
                TryAcquireError::Closed => PoolError::Closed,
                TryAcquireError::NoPermits => PoolError::Exhausted(limit),
            })?
        } else {
            match timeout_at(deadline, permits.acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(PoolError::Closed),
                Err(_) => return Err(PoolError::Exhausted(limit)),
            }
        };

        let conn = match self.pop_idle() {
            Some(conn) => conn,
            None => {
                let config = &self.inner.config;
                debug!(host = %config.host, "Opening replacement connection");
                let open = BackendConnection::open(
                    &config.host,
                    config.port,
                    config.connect_timeout,
                    Arc::clone(&self.inner.stats),
                );
                // The permit is dropped with the error, so capacity is not lost.
                match timeout_at(deadline, open).await {
                    Ok(conn) => Arc::new(conn?),
                    Err(_) => {
                        debug!(host = %config.host, ?limit, "Replacement connect outlived acquire");
                        return Err(PoolError::Exhausted(limit));
                    }
                }
            }
        };

        Ok(PooledConnection {
            conn,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    fn pop_idle(&self) -> Option<Arc<BackendConnection>> {
        let mut idle = self.inner.idle();
        while let Some(conn) = idle.pop_front() {
            if conn.is_open() {
                return Some(conn);
            }
            debug!(conn = conn.id(), "Discarding closed idle connection");
        }
        None
    }

    /// Returns a connection to the pool.
    ///
    /// Same as dropping the guard.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Acquires a connection, runs one exchange and releases it.
    ///
    /// Uses the configured acquire and request timeouts.
    pub async fn send(&self, request: &Request) -> Result<Reply, PoolError> {
        let conn = self.acquire(self.inner.config.acquire_timeout).await?;
        let reply = conn
            .send_request(request, self.inner.config.request_timeout)
            .await?;
        Ok(reply)
    }

    /// Closes the pool and every idle connection.
    ///
    /// Waiting and later `acquire` calls fail with [`PoolError::Closed`].
    /// Connections checked out right now are closed when their guards drop.
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut idle = self.inner.idle();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            idle.drain(..).collect()
        };
        self.inner.permits.close();

        for conn in &drained {
            conn.close().await;
        }
        info!(closed = drained.len(), "Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            capacity: self.inner.config.size,
            available: self.inner.permits.available_permits(),
            idle: self.inner.idle().len(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to [`BackendConnection`]. Dropping the guard releases it:
/// an open connection goes back to the idle queue, a poisoned one is
/// discarded, and the capacity unit is freed either way.
pub struct PooledConnection {
    conn: Arc<BackendConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = BackendConnection;

    fn deref(&self) -> &BackendConnection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.conn.is_open() {
            debug!(conn = self.conn.id(), "Dropping poisoned pool connection");
            return;
        }

        let mut idle = self.pool.idle();
        if !self.pool.closed.load(Ordering::Acquire) {
            idle.push_back(Arc::clone(&self.conn));
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
