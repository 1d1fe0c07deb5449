//! Bounded Pool Module
//!
//! Anonymous backend connections for traffic that needs no session
//! affinity. The pool caps how many connections anonymous callers can hold
//! at once and saves the connect cost on every request.
//!
//! ## Example
//!
//! ```no_run
//! use kvbridge::connection::ConnectionStats;
//! use kvbridge::pool::{ConnectionPool, PoolConfig};
//! use kvbridge::protocol::Request;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), kvbridge::pool::PoolError> {
//! let stats = Arc::new(ConnectionStats::new());
//! let pool = ConnectionPool::initialize(PoolConfig::default(), stats).await?;
//!
//! // One-shot: acquire, exchange, release
//! let reply = pool.send(&Request::get("alpha")).await?;
//!
//! // Scoped: the guard is released when it goes out of scope
//! {
//!     let conn = pool.acquire(Duration::from_secs(1)).await?;
//!     conn.send_request(&Request::set("alpha", "2"), Duration::from_secs(5)).await?;
//! }
//!
//! pool.close().await;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

pub mod bounded;

pub use bounded::{ConnectionPool, PoolConfig, PoolError, PoolStatus, PooledConnection};
