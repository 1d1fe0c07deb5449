//! Gateway Handler
//!
//! Executes typed requests against the backend over a connection picked by
//! route: the shared pool for anonymous traffic, or the caller's own session
//! connection.
//!
//! ## Supported Operations
//!
//! ### Key Operations (any route)
//! - `get(key)` - Fetch a value
//! - `set(key, value)` - Store a value
//! - `remove(key)` - Delete a key
//!
//! ### Cursor Operations (session route only)
//! - `create_cursor(name [, start_key])` - Create a named cursor
//! - `delete_cursor(name)` - Destroy a cursor
//! - `get_forward(cursor, amount)` - Up to `amount` entries forward
//! - `get_backward(cursor, amount)` - Up to `amount` entries backward
//! - `get_keys(cursor, amount)` - Up to `amount` keys forward
//! - `get_keys_prefix(cursor, prefix, amount)` - Keys with a prefix
//!
//! Cursors live on the socket that created them. Over the pool the next
//! request may land on a different socket, so cursor requests there are
//! rejected up front.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Gateway                             │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  encode()   │───>│  route      │───>│  decode()   │      │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘      │
//! │                            │                                │
//! │              ┌─────────────┴─────────────┐                  │
//! │              ▼                           ▼                  │
//! │       ConnectionPool              SessionRegistry           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::connection::{ConnectionError, ConnectionStats};
use crate::pool::{ConnectionPool, PoolConfig, PoolError};
use crate::protocol::{decode, Command, FrameError, Reply, Request};
use crate::session::{SessionConfig, SessionError, SessionRegistry};
use crate::{DEFAULT_HOST, DEFAULT_PORT};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Where a request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Route {
    /// Any connection from the shared pool
    Pooled,
    /// The dedicated connection of one session
    Session(String),
}

impl Route {
    pub fn session(id: impl Into<String>) -> Self {
        Route::Session(id.into())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Pooled => f.write_str("pool"),
            Route::Session(id) => write!(f, "session {}", id),
        }
    }
}

/// Deadlines used by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Wait for a pooled connection (default: 5s)
    pub acquire: Duration,
    /// Per-phase deadline of one exchange (default: 5s)
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            acquire: Duration::from_secs(5),
            request: Duration::from_secs(5),
        }
    }
}

/// Everything needed to build a gateway against one backend.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Pool size (default: 10)
    pub pool_size: usize,
    pub connect_timeout: Duration,
    pub timeouts: Timeouts,
    /// Session idle timeout (default: 300s)
    pub idle_timeout: Duration,
    /// Interval between idle sweeps (default: 60s)
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        let session = SessionConfig::default();
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            pool_size: pool.size,
            connect_timeout: pool.connect_timeout,
            timeouts: Timeouts::default(),
            idle_timeout: session.idle_timeout,
            sweep_interval: session.sweep_interval,
        }
    }
}

impl GatewayConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            host: self.host.clone(),
            port: self.port,
            size: self.pool_size,
            connect_timeout: self.connect_timeout,
            acquire_timeout: self.timeouts.acquire,
            request_timeout: self.timeouts.request,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout: self.connect_timeout,
            request_timeout: self.timeouts.request,
            idle_timeout: self.idle_timeout,
            sweep_interval: self.sweep_interval,
        }
    }
}

/// Errors returned by the gateway.
///
/// Backend answers such as `ERR` or `DATA_NOT_FOUND` are not errors; they
/// come back as a [`Reply`].
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),

    /// A cursor command was routed to the pool
    #[error("{0} needs a session: cursors live on the connection that created them")]
    CursorRequiresSession(Command),

    /// The session route carried an empty id
    #[error("missing session id")]
    MissingSession,
}

/// Routes requests to the backend and decodes the answers.
///
/// Cloning is cheap and every clone shares the same pool and registry.
#[derive(Clone)]
pub struct Gateway {
    pool: ConnectionPool,
    sessions: SessionRegistry,
    timeouts: Timeouts,
}

impl Gateway {
    /// Creates a gateway over an existing pool and registry.
    pub fn new(pool: ConnectionPool, sessions: SessionRegistry, timeouts: Timeouts) -> Self {
        Self {
            pool,
            sessions,
            timeouts,
        }
    }

    /// Fills the pool, starts the session registry and returns the gateway.
    pub async fn connect(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let stats = Arc::new(ConnectionStats::new());
        let pool = ConnectionPool::initialize(config.pool_config(), Arc::clone(&stats)).await?;
        let sessions = SessionRegistry::new(config.session_config(), stats);
        sessions.start();
        Ok(Self::new(pool, sessions, config.timeouts))
    }

    /// Encodes `request`, sends it over the connection picked by `route`
    /// and decodes the reply.
    pub async fn execute(&self, route: &Route, request: &Request) -> Result<Reply, GatewayError> {
        match route {
            Route::Pooled if request.uses_cursor() => {
                return Err(GatewayError::CursorRequiresSession(request.command()));
            }
            Route::Session(id) if id.is_empty() => return Err(GatewayError::MissingSession),
            _ => {}
        }

        let frame = request.encode()?;
        let raw = self.exchange(route, &frame).await?;
        let reply = decode(&raw, request.reply_shape())?;

        trace!(
            route = %route,
            command = %request.command(),
            reply = ?reply.command(),
            entries = reply.entries().len(),
            "Request executed"
        );
        Ok(reply)
    }

    async fn exchange(&self, route: &Route, frame: &[u8]) -> Result<Bytes, GatewayError> {
        match route {
            Route::Pooled => {
                let conn = self.pool.acquire(self.timeouts.acquire).await?;
                Ok(conn.send(frame, self.timeouts.request).await?)
            }
            Route::Session(id) => Ok(self
                .sessions
                .send_for_session(id, frame, self.timeouts.request)
                .await?),
        }
    }

    pub async fn get(&self, route: &Route, key: impl Into<Bytes>) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::get(key)).await
    }

    pub async fn set(
        &self,
        route: &Route,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::set(key, value)).await
    }

    pub async fn remove(
        &self,
        route: &Route,
        key: impl Into<Bytes>,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::remove(key)).await
    }

    pub async fn create_cursor(
        &self,
        route: &Route,
        name: impl Into<Bytes>,
        start_key: Option<Bytes>,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::create_cursor(name, start_key))
            .await
    }

    pub async fn delete_cursor(
        &self,
        route: &Route,
        name: impl Into<Bytes>,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::delete_cursor(name)).await
    }

    pub async fn get_forward(
        &self,
        route: &Route,
        cursor: impl Into<Bytes>,
        amount: u16,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::get_forward(cursor, amount))
            .await
    }

    pub async fn get_backward(
        &self,
        route: &Route,
        cursor: impl Into<Bytes>,
        amount: u16,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::get_backward(cursor, amount))
            .await
    }

    pub async fn get_keys(
        &self,
        route: &Route,
        cursor: impl Into<Bytes>,
        amount: u16,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::get_keys(cursor, amount)).await
    }

    pub async fn get_keys_prefix(
        &self,
        route: &Route,
        cursor: impl Into<Bytes>,
        prefix: impl Into<Bytes>,
        amount: u16,
    ) -> Result<Reply, GatewayError> {
        self.execute(route, &Request::get_keys_prefix(cursor, prefix, amount))
            .await
    }

    /// Stops the session registry and closes the pool.
    pub async fn shutdown(&self) {
        self.sessions.stop().await;
        self.pool.close().await;
        debug!("Gateway shut down");
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("pool", &self.pool)
            .field("sessions", &self.sessions)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Entry, ErrorCode};
    use crate::test_support::MockBackend;

    async fn gateway_for(backend: &MockBackend, pool_size: usize) -> Gateway {
        let config = GatewayConfig {
            host: backend.host().to_string(),
            port: backend.port(),
            pool_size,
            timeouts: Timeouts {
                acquire: Duration::from_millis(200),
                request: Duration::from_secs(2),
            },
            ..Default::default()
        };
        Gateway::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_set_get_remove_over_pool() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 2).await;
        let route = Route::Pooled;

        let reply = gateway.set(&route, "alpha", "1").await.unwrap();
        assert!(reply.is_ok());

        let reply = gateway.get(&route, "alpha").await.unwrap();
        assert_eq!(reply, Reply::ok_with(vec![Entry::new("alpha", "1")]));

        assert!(gateway.remove(&route, "alpha").await.unwrap().is_ok());
        let reply = gateway.get(&route, "alpha").await.unwrap();
        assert_eq!(reply, Reply::NotFound);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_get_remove_over_session() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;
        let route = Route::session("abc");

        gateway.set(&route, "alpha", "1").await.unwrap();
        let reply = gateway.get(&route, "alpha").await.unwrap();
        assert_eq!(reply.value_of(b"alpha").unwrap().as_ref(), b"1");

        gateway.remove(&route, "alpha").await.unwrap();
        assert!(gateway.get(&route, "alpha").await.unwrap().is_not_found());
        assert_eq!(gateway.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_cursor_pagination() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;
        let route = Route::session("reader");

        for key in ["user:1", "user:2", "item:1", "user:3"] {
            gateway.set(&Route::Pooled, key, "x").await.unwrap();
        }

        gateway.create_cursor(&route, "all", None).await.unwrap();
        let page = gateway.get_forward(&route, "all", 3).await.unwrap();
        assert_eq!(
            page.entries(),
            &[
                Entry::new("item:1", "x"),
                Entry::new("user:1", "x"),
                Entry::new("user:2", "x"),
            ]
        );
        let page = gateway.get_forward(&route, "all", 3).await.unwrap();
        assert_eq!(page.entries(), &[Entry::new("user:3", "x")]);

        let back = gateway.get_backward(&route, "all", 2).await.unwrap();
        assert_eq!(
            back.entries(),
            &[Entry::new("user:3", "x"), Entry::new("user:2", "x")]
        );

        gateway
            .create_cursor(&route, "users", Some(Bytes::from("user:")))
            .await
            .unwrap();
        let keys = gateway.get_keys(&route, "users", 2).await.unwrap();
        assert_eq!(
            keys.entries(),
            &[Entry::key_only("user:1"), Entry::key_only("user:2")]
        );

        gateway.create_cursor(&route, "prefixed", None).await.unwrap();
        let keys = gateway
            .get_keys_prefix(&route, "prefixed", "item:", 10)
            .await
            .unwrap();
        assert_eq!(keys.entries(), &[Entry::key_only("item:1")]);
    }

    #[tokio::test]
    async fn test_deleted_cursor_is_gone() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;
        let route = Route::session("s");

        gateway.create_cursor(&route, "c", None).await.unwrap();
        assert!(gateway.delete_cursor(&route, "c").await.unwrap().is_ok());

        let reply = gateway.get_forward(&route, "c", 1).await.unwrap();
        assert_eq!(reply, Reply::Error(ErrorCode::CursorNotFound));
    }

    #[tokio::test]
    async fn test_cursor_over_pool_is_rejected() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;

        let err = gateway
            .create_cursor(&Route::Pooled, "c", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::CursorRequiresSession(Command::CreateCursor)
        ));

        let err = gateway.get_keys(&Route::Pooled, "c", 1).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::CursorRequiresSession(Command::GetKeys)
        ));
    }

    #[tokio::test]
    async fn test_empty_session_id_is_rejected() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;

        let err = gateway.get(&Route::session(""), "k").await.unwrap_err();
        assert!(matches!(err, GatewayError::MissingSession));
        assert!(gateway.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_cursor_name_is_rejected() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;

        let name = Bytes::from(vec![b'c'; 300]);
        let err = gateway
            .delete_cursor(&Route::session("s"), name)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Frame(FrameError::FieldTooLong { .. })
        ));
        assert_eq!(backend.requests(), 0);
    }

    #[tokio::test]
    async fn test_pool_exhaustion_surfaces() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;

        let _held = gateway.pool().acquire(Duration::ZERO).await.unwrap();
        let err = gateway.get(&Route::Pooled, "k").await.unwrap_err();
        assert!(matches!(err, GatewayError::Pool(PoolError::Exhausted(_))));

        // Session traffic does not compete for pool capacity.
        assert!(gateway.get(&Route::session("s"), "k").await.is_ok());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated_connections() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;

        let a = gateway.sessions().get_or_create("a").await.unwrap();
        gateway.get(&Route::session("a"), "k").await.unwrap();
        gateway.get(&Route::session("b"), "k").await.unwrap();
        let a_again = gateway.sessions().get_or_create("a").await.unwrap();

        assert_eq!(a.id(), a_again.id());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // One pooled connection plus two sessions.
        assert_eq!(backend.accepted(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let backend = MockBackend::start().await;
        let gateway = gateway_for(&backend, 1).await;
        gateway.get(&Route::session("s"), "k").await.unwrap();

        gateway.shutdown().await;

        assert!(matches!(
            gateway.get(&Route::Pooled, "k").await,
            Err(GatewayError::Pool(PoolError::Closed))
        ));
        assert!(matches!(
            gateway.get(&Route::session("s"), "k").await,
            Err(GatewayError::Session(SessionError::Stopped))
        ));
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_connection_error() {
        let backend = MockBackend::silent().await;
        let config = GatewayConfig {
            host: backend.host().to_string(),
            port: backend.port(),
            pool_size: 1,
            timeouts: Timeouts {
                acquire: Duration::from_millis(200),
                request: Duration::from_millis(50),
            },
            ..Default::default()
        };
        let gateway = Gateway::connect(&config).await.unwrap();

        let err = gateway.get(&Route::Pooled, "k").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Connection(ConnectionError::Timeout { .. })
        ));
        // The poisoned connection gave its capacity back.
        assert_eq!(gateway.pool().status().available, 1);
    }
}
