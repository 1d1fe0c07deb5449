//! Session Registry
//!
//! Maps external session ids to dedicated backend connections.
//!
//! ## Slots
//!
//! ```text
//! HashMap<String, Arc<SessionEntry>>      (std Mutex, never held across .await)
//!                      │
//!                      ▼
//!        SessionEntry { OnceCell<Arc<BackendConnection>>, last_used }
//! ```
//!
//! Resolving a session takes the map lock only long enough to find or insert
//! its slot. The connect runs inside the slot's `OnceCell`, so concurrent
//! first uses of one id share a single connect while other ids proceed in
//! parallel. A failed connect leaves the cell empty for the next caller.
//!
//! A slot whose connection was poisoned is swapped for a fresh one, but only
//! if it is still the registered slot, so two callers that both notice the
//! same dead connection create one replacement between them.

use crate::connection::{BackendConnection, ConnectionError, ConnectionStats, LastUsed};
use crate::protocol::{Reply, Request};
use crate::session::sweeper::IdleSweeper;
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Configuration for session connections and the idle sweep.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend host
    pub host: String,

    /// Backend port
    pub port: u16,

    /// Deadline for opening a session connection (default: 5s)
    pub connect_timeout: Duration,

    /// Per-phase deadline of one exchange (default: 5s)
    pub request_timeout: Duration,

    /// Sessions unused for longer than this are evicted (default: 300s)
    pub idle_timeout: Duration,

    /// Interval between idle sweeps (default: 60s)
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Errors returned by the session registry.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The registry has been stopped
    #[error("session registry is stopped")]
    Stopped,

    /// Opening or using the session connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

struct SessionEntry {
    id: String,
    conn: OnceCell<Arc<BackendConnection>>,
    last_used: LastUsed,
}

impl SessionEntry {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            conn: OnceCell::new(),
            last_used: LastUsed::new(),
        }
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.get() {
            conn.close().await;
        }
    }
}

type SessionMap = HashMap<String, Arc<SessionEntry>>;

struct RegistryInner {
    config: SessionConfig,
    sessions: Mutex<SessionMap>,
    stopped: AtomicBool,
    sweeper: Mutex<Option<IdleSweeper>>,
    stats: Arc<ConnectionStats>,
}

impl RegistryInner {
    fn sessions(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweeper(&self) -> MutexGuard<'_, Option<IdleSweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry of session-affine backend connections.
///
/// Cloning is cheap and every clone refers to the same registry.
///
/// # Example
///
/// ```no_run
/// use kvbridge::connection::ConnectionStats;
/// use kvbridge::protocol::Request;
/// use kvbridge::session::{SessionConfig, SessionRegistry};
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), kvbridge::session::SessionError> {
/// let registry = SessionRegistry::new(SessionConfig::default(), Arc::new(ConnectionStats::new()));
/// registry.start();
///
/// // Both requests travel over the same socket.
/// registry.send_request("session-1", &Request::create_cursor("c", None)).await?;
/// let page = registry.send_request("session-1", &Request::get_forward("c", 10)).await?;
///
/// registry.stop().await;
/// # let _ = page;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Creates an empty registry. Call [`start`](Self::start) to run the
    /// idle sweeper.
    pub fn new(config: SessionConfig, stats: Arc<ConnectionStats>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                sessions: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                sweeper: Mutex::new(None),
                stats,
            }),
        }
    }

    /// Starts the background idle sweeper. Calling it again does nothing.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut sweeper = self.inner.sweeper();
        if self.is_stopped() {
            debug!("Not starting the idle sweeper of a stopped registry");
            return;
        }

        if sweeper.is_none() {
            *sweeper = Some(IdleSweeper::start(
                self.downgrade(),
                self.inner.config.sweep_interval,
            ));
            info!(
                idle_timeout_s = self.inner.config.idle_timeout.as_secs(),
                "Session registry started"
            );
        }
    }

    /// Stops the sweeper and closes every session connection.
    ///
    /// Later calls to [`get_or_create`](Self::get_or_create) fail with
    /// [`SessionError::Stopped`].
    pub async fn stop(&self) {
        // `stopped` flips while both the sweeper slot and the map are held,
        // so `start` and `get_or_create` see either all of it or none.
        let (sweeper, drained) = {
            let mut sweeper = self.inner.sweeper();
            let mut sessions = self.inner.sessions();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            let drained: Vec<Arc<SessionEntry>> =
                sessions.drain().map(|(_, entry)| entry).collect();
            (sweeper.take(), drained)
        };

        if let Some(mut sweeper) = sweeper {
            sweeper.stop().await;
        }

        for entry in &drained {
            entry.close().await;
        }
        info!(closed = drained.len(), "Session registry stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Returns the open connection of `session_id`, connecting it first if
    /// needed.
    pub async fn get_or_create(
        &self,
        session_id: &str,
    ) -> Result<Arc<BackendConnection>, SessionError> {
        let (_, conn) = self.resolve(session_id).await?;
        Ok(conn)
    }

    /// Sends one frame over the session's connection.
    pub async fn send_for_session(
        &self,
        session_id: &str,
        frame: &[u8],
        limit: Duration,
    ) -> Result<Bytes, SessionError> {
        let (entry, conn) = self.resolve(session_id).await?;
        let reply = conn.send(frame, limit).await?;
        entry.last_used.touch();
        Ok(reply)
    }

    /// Sends a typed request over the session's connection, using the
    /// configured request timeout.
    pub async fn send_request(
        &self,
        session_id: &str,
        request: &Request,
    ) -> Result<Reply, SessionError> {
        let (entry, conn) = self.resolve(session_id).await?;
        let reply = conn
            .send_request(request, self.inner.config.request_timeout)
            .await?;
        entry.last_used.touch();
        Ok(reply)
    }

    async fn resolve(
        &self,
        session_id: &str,
    ) -> Result<(Arc<SessionEntry>, Arc<BackendConnection>), SessionError> {
        loop {
            let entry = {
                let mut sessions = self.inner.sessions();
                if self.is_stopped() {
                    return Err(SessionError::Stopped);
                }
                let entry = match sessions.get(session_id) {
                    Some(entry) => Arc::clone(entry),
                    None => {
                        let entry = Arc::new(SessionEntry::new(session_id));
                        sessions.insert(session_id.to_string(), Arc::clone(&entry));
                        entry
                    }
                };
                // Touched under the lock so a concurrent sweep cannot evict it.
                entry.last_used.touch();
                entry
            };

            let conn = Arc::clone(
                entry
                    .conn
                    .get_or_try_init(|| self.connect(session_id))
                    .await?,
            );

            if self.is_stopped() {
                conn.close().await;
                return Err(SessionError::Stopped);
            }

            if conn.is_open() {
                return Ok((entry, conn));
            }

            let replaced = {
                let mut sessions = self.inner.sessions();
                match sessions.get(session_id) {
                    Some(current) if Arc::ptr_eq(current, &entry) => {
                        sessions.remove(session_id);
                        true
                    }
                    _ => false,
                }
            };
            if replaced {
                debug!(
                    session = %session_id,
                    conn = conn.id(),
                    "Replacing closed session connection"
                );
            }
        }
    }

    async fn connect(&self, session_id: &str) -> Result<Arc<BackendConnection>, ConnectionError> {
        let config = &self.inner.config;
        let conn = BackendConnection::open(
            &config.host,
            config.port,
            config.connect_timeout,
            Arc::clone(&self.inner.stats),
        )
        .await?;
        debug!(session = %session_id, conn = conn.id(), "Session connection created");
        Ok(Arc::new(conn))
    }

    /// Evicts and closes every session idle for longer than the idle
    /// timeout. Returns how many were evicted.
    ///
    /// Entries leave the map before their sockets are closed, so a racing
    /// lookup of the same id starts a fresh connection.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout;
        let mut expired = Vec::new();
        {
            let mut sessions = self.inner.sessions();
            sessions.retain(|_, entry| {
                if entry.last_used.idle_for() > idle_timeout {
                    expired.push(Arc::clone(entry));
                    false
                } else {
                    true
                }
            });
        }

        for entry in &expired {
            entry.close().await;
            debug!(session = %entry.id, "Idle session evicted");
        }
        expired.len()
    }

    /// Closes and forgets one session. Returns false if it was unknown.
    pub async fn remove(&self, session_id: &str) -> bool {
        let entry = self.inner.sessions().remove(session_id);
        match entry {
            Some(entry) => {
                entry.close().await;
                debug!(session = %session_id, "Session removed");
                true
            }
            None => false,
        }
    }

    /// Returns true if `session_id` currently has a slot.
    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions().contains_key(session_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// A registry reference that does not keep the registry alive.
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<SessionRegistry> {
        self.0.upgrade().map(|inner| SessionRegistry { inner })
    }
}

impl fmt::Debug for WeakRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakRegistry")
    }
}
