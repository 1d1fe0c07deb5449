//! Binary Wire Protocol
//!
//! This module implements the backend's length-prefixed binary protocol.
//!
//! ## Overview
//!
//! Every message is a single frame: an 18-byte big-endian header
//! (`total_length`, `element_count`, `command_code`) followed by a
//! command-specific body. The codec is pure: it never touches a socket.
//!
//! ## Modules
//!
//! - `types`: command codes, `Request`/`Reply` and the encoders
//! - `parser`: frame validation and decoding
//!
//! ## Example
//!
//! ```
//! use kvbridge::protocol::{decode, Entry, Reply, Request};
//!
//! // Building a request
//! let request = Request::get("alpha");
//! let frame = request.encode().unwrap();
//!
//! // Decoding the backend's answer
//! let answer = Reply::ok_with(vec![Entry::new("alpha", "1")]).encode().unwrap();
//! let reply = decode(&answer, request.reply_shape()).unwrap();
//! assert!(reply.is_ok());
//! # let _ = frame;
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{decode, decode_request, FrameError, FrameResult, Header};
pub use types::{
    Command, Entry, EntryShape, ErrorCode, Reply, Request, HEADER_LEN, LENGTH_PREFIX_LEN,
    MAX_CURSOR_NAME_LEN, MAX_FRAME_LEN,
};
