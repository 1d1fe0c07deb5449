//! # kvbridge - Pooled and Session-Affine Connections to a Binary KV Backend
//!
//! kvbridge is the connection layer between stateless request/response
//! callers and a key-value backend that speaks a length-prefixed binary
//! protocol over plain TCP, one request at a time per socket.
//!
//! ## Features
//!
//! - **Wire Codec**: Typed requests and replies for the backend's framed protocol
//! - **Bounded Pool**: A fixed number of anonymous connections with backpressure
//! - **Session Affinity**: One dedicated connection per external session id
//! - **Idle Reaping**: A background sweeper closes sessions nobody uses
//! - **Poisoning**: A connection that fails mid-exchange is never reused
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               kvbridge                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌──────────────────────────────────────────────┐    │
//! │  │   Caller    │───>│                 Gateway                      │    │
//! │  │ (Route,     │    │   encode ──> pick connection ──> decode      │    │
//! │  │  Request)   │    └───────────┬───────────────────────┬──────────┘    │
//! │  └─────────────┘                │ Route::Pooled         │ Route::Session│
//! │                                 ▼                       ▼               │
//! │                     ┌───────────────────┐   ┌─────────────────────┐     │
//! │                     │  ConnectionPool   │   │  SessionRegistry    │     │
//! │                     │  Semaphore(N)     │   │  id -> OnceCell     │     │
//! │                     │  idle VecDeque    │   │                     │     │
//! │                     └─────────┬─────────┘   └──────────┬──────────┘     │
//! │                               │                        │     ▲          │
//! │                               ▼                        ▼     │          │
//! │                     ┌──────────────────────────────────────┐ │          │
//! │                     │  BackendConnection (one socket each) │ │          │
//! │                     └──────────────────────────────────────┘ │          │
//! │                                          ┌───────────────────┴───────┐  │
//! │                                          │  IdleSweeper              │  │
//! │                                          │  (Background Tokio Task)  │  │
//! │                                          └───────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use kvbridge::gateway::{Gateway, GatewayConfig, Route};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let gateway = Gateway::connect(&GatewayConfig::default()).await?;
//!
//!     // Plain key operations can use any pooled connection
//!     gateway.set(&Route::Pooled, "alpha", "1").await?;
//!     let reply = gateway.get(&Route::Pooled, "alpha").await?;
//!     println!("{}", reply);
//!
//!     // Cursors need the same socket every time
//!     let session = Route::session("session-42");
//!     gateway.create_cursor(&session, "scan", None).await?;
//!     let page = gateway.get_forward(&session, "scan", 100).await?;
//!     println!("{}", page);
//!
//!     gateway.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: Frame format, typed requests/replies, encoder and decoder
//! - [`connection`]: One socket, one exchange at a time, with timeouts
//! - [`pool`]: Bounded pool of anonymous connections
//! - [`session`]: Session registry and idle sweeper
//! - [`gateway`]: Routing of requests to the pool or a session
//!
//! ## Design Highlights
//!
//! ### One Exchange per Socket
//!
//! The backend has no request ids, so two requests in flight on one socket
//! would interleave their bytes. Each connection owns its stream behind an
//! async mutex, and holding the lock is the only way to touch the socket.
//!
//! ### Capacity Before Connections
//!
//! The pool takes a semaphore permit before it looks at its idle queue. The
//! number of checked-out connections can never exceed the pool size, and a
//! caller at capacity times out with a clear `Exhausted` error.
//!
//! ### Poison, Don't Resync
//!
//! After a timeout or a short read the position of the next frame boundary
//! is unknown. The connection is closed and replaced instead of reused.

pub mod connection;
pub mod gateway;
pub mod pool;
pub mod protocol;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types for convenience
pub use connection::{BackendConnection, ConnectionError, ConnectionStats};
pub use gateway::{Gateway, GatewayConfig, GatewayError, Route, Timeouts};
pub use pool::{ConnectionPool, PoolConfig, PoolError};
pub use protocol::{decode, Command, Entry, ErrorCode, FrameError, Reply, Request};
pub use session::{SessionConfig, SessionError, SessionRegistry};

/// The default backend port
pub const DEFAULT_PORT: u16 = 8080;

/// The default backend host
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of kvbridge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
