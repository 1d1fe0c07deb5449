//! Frame Decoder
//!
//! Turns complete frames into typed [`Reply`] and [`Request`] values.
//!
//! The decoder never reads past the buffer it is given. Keys and values are
//! returned as slices of the input `Bytes`, so decoding a reply does not copy
//! payload data (slicing a `Bytes` only bumps a reference count).
//!
//! ## Validation
//!
//! A frame is rejected with a [`FrameError`] when:
//!
//! 1. it is shorter than the 18-byte header,
//! 2. its declared `total_length` is below the header size or above
//!    [`MAX_FRAME_LEN`],
//! 3. its declared `total_length` differs from the number of bytes received,
//! 4. an element (or an error code) runs past the end of the frame, or
//! 5. bytes are left over after the declared elements.
//!
//! A truncated frame is therefore always an error, never a shorter valid frame.

use crate::protocol::types::{
    width, Command, Entry, EntryShape, ErrorCode, Reply, Request, HEADER_LEN, LENGTH_PREFIX_LEN,
    MAX_FRAME_LEN,
};
use bytes::{Buf, Bytes};

/// Errors that can occur while encoding or decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Fewer bytes than the fixed header
    #[error("frame too short: {len} bytes, header needs {}", HEADER_LEN)]
    TooShort { len: usize },

    /// Declared length cannot even hold the header
    #[error("declared frame length {declared} is below the {}-byte header", HEADER_LEN)]
    LengthBelowHeader { declared: u64 },

    /// Declared length disagrees with the bytes received
    #[error("declared frame length {declared} does not match the {actual} bytes received")]
    LengthMismatch { declared: u64, actual: usize },

    /// The frame exceeds the maximum allowed size
    #[error("frame too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    /// An element's length prefix points past the end of the frame
    #[error("element {index} of {count} runs past the end of the frame")]
    Truncated { index: u64, count: u64 },

    /// ERR reply without its error code
    #[error("error reply is missing its error code")]
    MissingErrorCode,

    /// Bytes left after the last declared element
    #[error("{0} trailing bytes after the last element")]
    TrailingBytes(usize),

    /// A field is too long for its length prefix
    #[error("{field} is {len} bytes (max: {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// A request frame whose command the backend does not accept
    #[error("not a request command: {0}")]
    NotARequest(u16),
}

/// Result type for codec operations.
pub type FrameResult<T> = Result<T, FrameError>;

/// The fixed 18-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub total_length: u64,
    pub element_count: u64,
    pub command_code: u16,
}

impl Header {
    /// Reads the header from the start of `buf`.
    ///
    /// Only the header itself is checked; the body is not inspected.
    pub fn parse(mut buf: &[u8]) -> FrameResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::TooShort { len: buf.len() });
        }

        let header = Header {
            total_length: buf.get_u64(),
            element_count: buf.get_u64(),
            command_code: buf.get_u16(),
        };
        check_declared_length(header.total_length)?;
        Ok(header)
    }

    /// Validates an 8-byte length prefix and returns the declared frame length.
    ///
    /// This is what a reader uses to learn how many more bytes to wait for.
    pub fn frame_length(prefix: [u8; LENGTH_PREFIX_LEN]) -> FrameResult<usize> {
        let declared = u64::from_be_bytes(prefix);
        check_declared_length(declared)?;
        Ok(declared as usize)
    }

    /// The command, if the code is known.
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command_code)
    }
}

fn check_declared_length(declared: u64) -> FrameResult<()> {
    if declared < HEADER_LEN as u64 {
        return Err(FrameError::LengthBelowHeader { declared });
    }
    if declared > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            size: declared,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Validates the header of a complete frame and returns it with the body.
fn split_frame(frame: &Bytes) -> FrameResult<(Header, Bytes)> {
    let header = Header::parse(frame)?;
    if header.total_length != frame.len() as u64 {
        return Err(FrameError::LengthMismatch {
            declared: header.total_length,
            actual: frame.len(),
        });
    }
    Ok((header, frame.slice(HEADER_LEN..)))
}

/// Decodes a complete reply frame.
///
/// `shape` tells the decoder whether entries carry values; use
/// [`Request::reply_shape`] of the request that produced the reply.
///
/// # Example
///
/// ```
/// use kvbridge::protocol::{decode, Entry, EntryShape, Reply};
///
/// let frame = Reply::ok_with(vec![Entry::new("alpha", "1")]).encode().unwrap();
/// let reply = decode(&frame, EntryShape::KeyValue).unwrap();
///
/// assert!(reply.is_ok());
/// assert_eq!(reply.value_of(b"alpha").unwrap().as_ref(), b"1");
/// ```
pub fn decode(frame: &Bytes, shape: EntryShape) -> FrameResult<Reply> {
    let (header, mut body) = split_frame(frame)?;

    let command = match header.command() {
        Some(command) => command,
        None => return Ok(Reply::Unrecognized(header.command_code)),
    };

    let reply = match command {
        Command::Err => {
            if body.remaining() < width::ERROR_CODE {
                return Err(FrameError::MissingErrorCode);
            }
            Reply::Error(ErrorCode::from_code(body.get_u16()))
        }
        Command::DataNotFound => Reply::NotFound,
        Command::InvalidCommand => Reply::InvalidCommand,
        command => Reply::Entries {
            command,
            entries: decode_entries(&mut body, header.element_count, shape)?,
        },
    };

    finish(&body)?;
    Ok(reply)
}

/// Decodes a complete request frame, as the backend would.
pub fn decode_request(frame: &Bytes) -> FrameResult<Request> {
    let (header, mut body) = split_frame(frame)?;
    let amount = header.element_count as u16;

    let request = match header.command() {
        Some(Command::Get) => Request::Get {
            key: read_key(&mut body, 0, 1)?,
        },
        Some(Command::Set) => {
            let key = read_key(&mut body, 0, 1)?;
            let value = read_value(&mut body, 0, 1)?;
            Request::Set { key, value }
        }
        Some(Command::Remove) => Request::Remove {
            key: read_key(&mut body, 0, 1)?,
        },
        Some(Command::CreateCursor) => {
            let name = read_name(&mut body)?;
            let key = read_key(&mut body, 0, 1)?;
            Request::CreateCursor {
                name,
                start_key: (!key.is_empty()).then_some(key),
            }
        }
        Some(Command::DeleteCursor) => Request::DeleteCursor {
            name: read_name(&mut body)?,
        },
        Some(Command::GetForward) => Request::GetForward {
            cursor: read_name(&mut body)?,
            amount,
        },
        Some(Command::GetBackward) => Request::GetBackward {
            cursor: read_name(&mut body)?,
            amount,
        },
        Some(Command::GetKeys) => Request::GetKeys {
            cursor: read_name(&mut body)?,
            amount,
        },
        Some(Command::GetKeysPrefix) => {
            let cursor = read_name(&mut body)?;
            let prefix = read_key(&mut body, 0, 1)?;
            Request::GetKeysPrefix {
                cursor,
                prefix,
                amount,
            }
        }
        _ => return Err(FrameError::NotARequest(header.command_code)),
    };

    finish(&body)?;
    Ok(request)
}

fn decode_entries(body: &mut Bytes, count: u64, shape: EntryShape) -> FrameResult<Vec<Entry>> {
    // Every entry needs at least its key length, so a bogus count cannot
    // drive a huge allocation.
    let capacity = count.min((body.remaining() / width::KEY_LEN) as u64) as usize;
    let mut entries = Vec::with_capacity(capacity);

    for index in 0..count {
        let key = read_key(body, index, count)?;
        let value = match shape {
            EntryShape::KeyValue => Some(read_value(body, index, count)?),
            EntryShape::KeysOnly => None,
        };
        entries.push(Entry { key, value });
    }

    Ok(entries)
}

fn finish(body: &Bytes) -> FrameResult<()> {
    if body.has_remaining() {
        return Err(FrameError::TrailingBytes(body.remaining()));
    }
    Ok(())
}

fn read_name(body: &mut Bytes) -> FrameResult<Bytes> {
    if body.remaining() < width::NAME_LEN {
        return Err(FrameError::Truncated { index: 0, count: 1 });
    }
    let len = body.get_u8() as usize;
    take(body, len, 0, 1)
}

fn read_key(body: &mut Bytes, index: u64, count: u64) -> FrameResult<Bytes> {
    if body.remaining() < width::KEY_LEN {
        return Err(FrameError::Truncated { index, count });
    }
    let len = body.get_u16() as usize;
    take(body, len, index, count)
}

fn read_value(body: &mut Bytes, index: u64, count: u64) -> FrameResult<Bytes> {
    if body.remaining() < width::VALUE_LEN {
        return Err(FrameError::Truncated { index, count });
    }
    let len = body.get_u32() as usize;
    take(body, len, index, count)
}

#[inline]
fn take(body: &mut Bytes, len: usize, index: u64, count: u64) -> FrameResult<Bytes> {
    if body.remaining() < len {
        return Err(FrameError::Truncated { index, count });
    }
    Ok(body.split_to(len))
}
