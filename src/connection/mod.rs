//! Backend Connection Module
//!
//! This module manages individual TCP connections to the key-value backend.
//! The backend speaks a strict request/response protocol without request
//! identifiers, so a connection carries exactly one exchange at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            Callers (pool guards, session handles)           │
//! └──────────┬───────────────────┬───────────────────┬──────────┘
//!            │ send()            │ send()            │ send()
//!            ▼                   ▼                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BackendConnection                        │
//! │                                                             │
//! │   ┌────────────────────┐                                    │
//! │   │ Mutex<State<S>>    │  one exchange at a time            │
//! │   └─────────┬──────────┘                                    │
//! │             ▼                                               │
//! │   ┌─────────────┐    ┌──────────────┐    ┌──────────────┐   │
//! │   │ Write frame │───>│ Read length  │───>│ Read body    │   │
//! │   └─────────────┘    └──────────────┘    └──────────────┘   │
//! └──────────────────────────────┬──────────────────────────────┘
//!                                │ one socket
//!                                ▼
//!                        key-value backend
//! ```
//!
//! ## Features
//!
//! - **Per-phase timeouts**: write, length read and body read each get the
//!   full deadline
//! - **Poisoning**: any transport failure closes the connection for good
//! - **Statistics**: shared lock-free counters
//!
//! ## Example
//!
//! ```no_run
//! use kvbridge::connection::{BackendConnection, ConnectionStats};
//! use kvbridge::protocol::Request;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), kvbridge::connection::ConnectionError> {
//! let stats = Arc::new(ConnectionStats::new());
//! let conn = BackendConnection::open("127.0.0.1", 8080, Duration::from_secs(5), stats).await?;
//!
//! let reply = conn.send_request(&Request::get("alpha"), Duration::from_secs(5)).await?;
//! println!("{}", reply);
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

pub mod backend;

// Re-export commonly used types
pub(crate) use backend::LastUsed;
pub use backend::{BackendConnection, ConnectionError, ConnectionStats, Phase};
