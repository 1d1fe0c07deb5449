//! Gateway Module
//!
//! The consumer of the connection layer: it takes a typed request and a
//! route, picks a connection, runs the exchange and hands back the decoded
//! reply.
//!
//! ## Architecture
//!
//! ```text
//! Caller (HTTP handler, CLI, ...)
//!       │  Route + Request
//!       ▼
//! ┌─────────────────┐
//! │    Gateway      │  (this module)
//! │                 │
//! │  - Route        │
//! │  - Encode       │
//! │  - Decode       │
//! └────────┬────────┘
//!          │
//!    ┌─────┴──────────────┐
//!    ▼                    ▼
//! ┌──────────────┐  ┌─────────────────┐
//! │ Pool         │  │ SessionRegistry │
//! └──────────────┘  └─────────────────┘
//! ```
//!
//! ## Routes
//!
//! - `Route::Pooled`: any connection from the bounded pool; key operations only
//! - `Route::Session(id)`: the session's own connection; required for cursors

pub mod handler;

// Re-export the gateway types
pub use handler::{Gateway, GatewayConfig, GatewayError, Route, Timeouts};
