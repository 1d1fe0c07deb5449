//! Session Module
//!
//! Session affinity for the gateway: every external session id gets its own
//! backend connection, created on first use and reused until the session has
//! been idle for too long.
//!
//! ## Components
//!
//! - **Registry** (`registry`): the session id to connection map with
//!   atomic get-or-create
//! - **Sweeper** (`sweeper`): background task that evicts idle sessions
//!
//! ## Why Sessions?
//!
//! Cursors are server-side state tied to the socket that created them. A
//! client that creates a cursor and then pages through it must keep talking
//! over the same socket, which the anonymous pool cannot promise.

pub mod registry;
pub mod sweeper;

// Re-export commonly used types
pub use registry::{SessionConfig, SessionError, SessionRegistry};
pub use sweeper::IdleSweeper;
