//! Wire Protocol Data Types
//!
//! This module defines the vocabulary of the backend's binary protocol:
//! command codes, typed requests, decoded replies and the encoders that turn
//! them into frames.
//!
//! ## Frame Format
//!
//! Every message, in either direction, is one length-prefixed frame.
//! All integers are big-endian.
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────┬──────────────────────┐
//! │ total_length │ element_count │ command_code │ body                 │
//! │ u64 BE       │ u64 BE        │ u16 BE       │ command-specific     │
//! └──────────────┴───────────────┴──────────────┴──────────────────────┘
//!   offset 0       offset 8        offset 16      offset 18
//! ```
//!
//! `total_length` counts the whole frame, itself included.
//!
//! ## Request Bodies
//!
//! | Command         | element_count | body                                             |
//! |-----------------|---------------|--------------------------------------------------|
//! | GET, REMOVE     | 1             | `u16 key_len, key`                               |
//! | SET             | 1             | `u16 key_len, key, u32 value_len, value`         |
//! | CREATE_CURSOR   | 1             | `u8 name_len, name, u16 key_len, key`            |
//! | DELETE_CURSOR   | 1             | `u8 name_len, name`                              |
//! | GET_FF, GET_FB  | amount        | `u8 name_len, name`                              |
//! | GET_KEYS        | amount        | `u8 name_len, name`                              |
//! | GET_KEYS_PREFIX | amount        | `u8 name_len, name, u16 prefix_len, prefix`      |
//!
//! ## Reply Bodies
//!
//! - OK: `element_count` entries, each `u16 key_len, key[, u32 value_len, value]`
//!   (values are absent for GET_KEYS / GET_KEYS_PREFIX)
//! - ERR: `u16 error_code`
//! - DATA_NOT_FOUND, INVALID_COMMAND: no body

use crate::protocol::parser::{FrameError, FrameResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Size of the `total_length` prefix.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Size of the fixed frame header (`total_length` + `element_count` + `command_code`).
pub const HEADER_LEN: usize = 18;

/// Maximum size of a single frame (512 MB).
pub const MAX_FRAME_LEN: u64 = 512 * 1024 * 1024;

/// Maximum cursor name length (the name length travels in a single byte).
pub const MAX_CURSOR_NAME_LEN: usize = u8::MAX as usize;

/// Maximum key length.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Maximum value length.
pub const MAX_VALUE_LEN: usize = u32::MAX as usize;

/// Byte widths of the length fields inside a body.
pub mod width {
    pub const NAME_LEN: usize = 1;
    pub const KEY_LEN: usize = 2;
    pub const VALUE_LEN: usize = 4;
    pub const ERROR_CODE: usize = 2;
}

/// Command codes shared by both ends of the wire.
///
/// The numeric values are the wire contract and must match the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Ok = 0,
    Err = 1,
    Get = 2,
    Set = 3,
    GetKeys = 4,
    GetKeysPrefix = 5,
    GetForward = 6,
    GetBackward = 7,
    Remove = 8,
    CreateCursor = 9,
    DeleteCursor = 10,
    DataNotFound = 11,
    InvalidCommand = 12,
}

impl Command {
    /// Every command, in code order.
    pub const ALL: [Command; 13] = [
        Command::Ok,
        Command::Err,
        Command::Get,
        Command::Set,
        Command::GetKeys,
        Command::GetKeysPrefix,
        Command::GetForward,
        Command::GetBackward,
        Command::Remove,
        Command::CreateCursor,
        Command::DeleteCursor,
        Command::DataNotFound,
        Command::InvalidCommand,
    ];

    /// Looks up a command by its wire code.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Returns the wire code.
    #[inline]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Returns the protocol name of the command.
    pub fn name(self) -> &'static str {
        match self {
            Command::Ok => "OK",
            Command::Err => "ERR",
            Command::Get => "GET",
            Command::Set => "SET",
            Command::GetKeys => "GET_KEYS",
            Command::GetKeysPrefix => "GET_KEYS_PREFIX",
            Command::GetForward => "GET_FF",
            Command::GetBackward => "GET_FB",
            Command::Remove => "REMOVE",
            Command::CreateCursor => "CREATE_CURSOR",
            Command::DeleteCursor => "DELETE_CURSOR",
            Command::DataNotFound => "DATA_NOT_FOUND",
            Command::InvalidCommand => "INVALID_COMMAND",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether decoded entries carry values or keys only.
///
/// A reply is usually tagged `OK`, so the shape of its entries depends on the
/// request that produced it (see [`Request::reply_shape`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryShape {
    /// `u16 key_len, key, u32 value_len, value`
    KeyValue,
    /// `u16 key_len, key`
    KeysOnly,
}

/// Error codes carried by `ERR` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unknown,
    PartitionDied,
    CursorNotFound,
    MessageTooShort,
    /// A code this client does not know about.
    Other(u16),
}

impl ErrorCode {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => ErrorCode::Unknown,
            1 => ErrorCode::PartitionDied,
            2 => ErrorCode::CursorNotFound,
            3 => ErrorCode::MessageTooShort,
            other => ErrorCode::Other(other),
        }
    }

    pub fn code(self) -> u16 {
        match self {
            ErrorCode::Unknown => 0,
            ErrorCode::PartitionDied => 1,
            ErrorCode::CursorNotFound => 2,
            ErrorCode::MessageTooShort => 3,
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Unknown => f.write_str("UNKNOWN"),
            ErrorCode::PartitionDied => f.write_str("PARTITION_DIED"),
            ErrorCode::CursorNotFound => f.write_str("CURSOR_NOT_FOUND"),
            ErrorCode::MessageTooShort => f.write_str("MSG_TOO_SHORT"),
            ErrorCode::Other(code) => write!(f, "ERROR_{}", code),
        }
    }
}

/// A single key (and optional value) carried by a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    /// `None` for keys-only replies.
    pub value: Option<Bytes>,
}

impl Entry {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn key_only(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    fn encoded_len(&self) -> usize {
        width::KEY_LEN
            + self.key.len()
            + self
                .value
                .as_ref()
                .map(|v| width::VALUE_LEN + v.len())
                .unwrap_or(0)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", String::from_utf8_lossy(&self.key))?;
        if let Some(value) = &self.value {
            write!(f, ": \"{}\"", String::from_utf8_lossy(value))?;
        }
        Ok(())
    }
}

/// A request the gateway can send to the backend.
///
/// # Example
///
/// ```
/// use kvbridge::protocol::{Command, Request};
///
/// let request = Request::set("alpha", "1");
/// let frame = request.encode().unwrap();
///
/// // 18 header bytes + 2 + 5 ("alpha") + 4 + 1 ("1")
/// assert_eq!(frame.len(), 30);
/// assert_eq!(request.command(), Command::Set);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Get {
        key: Bytes,
    },
    Set {
        key: Bytes,
        value: Bytes,
    },
    Remove {
        key: Bytes,
    },
    /// Creates a named cursor, optionally positioned at `start_key`.
    CreateCursor {
        name: Bytes,
        start_key: Option<Bytes>,
    },
    DeleteCursor {
        name: Bytes,
    },
    /// Fetches up to `amount` entries forward from the cursor.
    GetForward {
        cursor: Bytes,
        amount: u16,
    },
    /// Fetches up to `amount` entries backward from the cursor.
    GetBackward {
        cursor: Bytes,
        amount: u16,
    },
    GetKeys {
        cursor: Bytes,
        amount: u16,
    },
    GetKeysPrefix {
        cursor: Bytes,
        prefix: Bytes,
        amount: u16,
    },
}

impl Request {
    pub fn get(key: impl Into<Bytes>) -> Self {
        Request::Get { key: key.into() }
    }

    pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Request::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<Bytes>) -> Self {
        Request::Remove { key: key.into() }
    }

    pub fn create_cursor(name: impl Into<Bytes>, start_key: Option<Bytes>) -> Self {
        Request::CreateCursor {
            name: name.into(),
            start_key,
        }
    }

    pub fn delete_cursor(name: impl Into<Bytes>) -> Self {
        Request::DeleteCursor { name: name.into() }
    }

    pub fn get_forward(cursor: impl Into<Bytes>, amount: u16) -> Self {
        Request::GetForward {
            cursor: cursor.into(),
            amount,
        }
    }

    pub fn get_backward(cursor: impl Into<Bytes>, amount: u16) -> Self {
        Request::GetBackward {
            cursor: cursor.into(),
            amount,
        }
    }

    pub fn get_keys(cursor: impl Into<Bytes>, amount: u16) -> Self {
        Request::GetKeys {
            cursor: cursor.into(),
            amount,
        }
    }

    pub fn get_keys_prefix(
        cursor: impl Into<Bytes>,
        prefix: impl Into<Bytes>,
        amount: u16,
    ) -> Self {
        Request::GetKeysPrefix {
            cursor: cursor.into(),
            prefix: prefix.into(),
            amount,
        }
    }

    /// Returns the command code this request is sent with.
    pub fn command(&self) -> Command {
        match self {
            Request::Get { .. } => Command::Get,
            Request::Set { .. } => Command::Set,
            Request::Remove { .. } => Command::Remove,
            Request::CreateCursor { .. } => Command::CreateCursor,
            Request::DeleteCursor { .. } => Command::DeleteCursor,
            Request::GetForward { .. } => Command::GetForward,
            Request::GetBackward { .. } => Command::GetBackward,
            Request::GetKeys { .. } => Command::GetKeys,
            Request::GetKeysPrefix { .. } => Command::GetKeysPrefix,
        }
    }

    /// Returns true if the request operates on a server-held cursor.
    ///
    /// Cursors live on the backend connection that created them.
    pub fn uses_cursor(&self) -> bool {
        !matches!(
            self,
            Request::Get { .. } | Request::Set { .. } | Request::Remove { .. }
        )
    }

    /// The shape of the entries in the reply to this request.
    pub fn reply_shape(&self) -> EntryShape {
        match self {
            Request::GetKeys { .. } | Request::GetKeysPrefix { .. } => EntryShape::KeysOnly,
            _ => EntryShape::KeyValue,
        }
    }

    /// The value of the header's `element_count` field.
    ///
    /// Paginated cursor commands carry the requested amount there.
    pub fn element_count(&self) -> u64 {
        match self {
            Request::GetForward { amount, .. }
            | Request::GetBackward { amount, .. }
            | Request::GetKeys { amount, .. }
            | Request::GetKeysPrefix { amount, .. } => u64::from(*amount),
            _ => 1,
        }
    }

    /// Exact size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Request::Get { key } | Request::Remove { key } => width::KEY_LEN + key.len(),
            Request::Set { key, value } => {
                width::KEY_LEN + key.len() + width::VALUE_LEN + value.len()
            }
            Request::CreateCursor { name, start_key } => {
                width::NAME_LEN
                    + name.len()
                    + width::KEY_LEN
                    + start_key.as_ref().map(Bytes::len).unwrap_or(0)
            }
            Request::DeleteCursor { name } => width::NAME_LEN + name.len(),
            Request::GetForward { cursor, .. }
            | Request::GetBackward { cursor, .. }
            | Request::GetKeys { cursor, .. } => width::NAME_LEN + cursor.len(),
            Request::GetKeysPrefix { cursor, prefix, .. } => {
                width::NAME_LEN + cursor.len() + width::KEY_LEN + prefix.len()
            }
        };
        HEADER_LEN + body
    }

    /// Checks every length-prefixed field against the width of its prefix.
    pub fn validate(&self) -> FrameResult<()> {
        match self {
            Request::Get { key } | Request::Remove { key } => check_len("key", key, MAX_KEY_LEN),
            Request::Set { key, value } => {
                check_len("key", key, MAX_KEY_LEN)?;
                check_len("value", value, MAX_VALUE_LEN)
            }
            Request::CreateCursor { name, start_key } => {
                check_len("cursor name", name, MAX_CURSOR_NAME_LEN)?;
                match start_key {
                    Some(key) => check_len("key", key, MAX_KEY_LEN),
                    None => Ok(()),
                }
            }
            Request::DeleteCursor { name } => check_len("cursor name", name, MAX_CURSOR_NAME_LEN),
            Request::GetForward { cursor, .. }
            | Request::GetBackward { cursor, .. }
            | Request::GetKeys { cursor, .. } => {
                check_len("cursor name", cursor, MAX_CURSOR_NAME_LEN)
            }
            Request::GetKeysPrefix { cursor, prefix, .. } => {
                check_len("cursor name", cursor, MAX_CURSOR_NAME_LEN)?;
                check_len("prefix", prefix, MAX_KEY_LEN)
            }
        }
    }

    /// Encodes the request into a complete frame.
    pub fn encode(&self) -> FrameResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encodes the request into an existing buffer.
    ///
    /// Nothing is written if a field is too long for its length prefix.
    pub fn encode_into(&self, buf: &mut BytesMut) -> FrameResult<()> {
        self.validate()?;

        let total_length = self.encoded_len();
        buf.reserve(total_length);
        buf.put_u64(total_length as u64);
        buf.put_u64(self.element_count());
        buf.put_u16(self.command().code());

        match self {
            Request::Get { key } | Request::Remove { key } => put_key(buf, key),
            Request::Set { key, value } => {
                put_key(buf, key);
                put_value(buf, value);
            }
            Request::CreateCursor { name, start_key } => {
                put_name(buf, name);
                put_key(buf, start_key.as_deref().unwrap_or_default());
            }
            Request::DeleteCursor { name } => put_name(buf, name),
            Request::GetForward { cursor, .. }
            | Request::GetBackward { cursor, .. }
            | Request::GetKeys { cursor, .. } => put_name(buf, cursor),
            Request::GetKeysPrefix { cursor, prefix, .. } => {
                put_name(buf, cursor);
                put_key(buf, prefix);
            }
        }

        Ok(())
    }
}

/// A decoded reply from the backend.
///
/// Backend-signaled failures (`Error`, `NotFound`, `InvalidCommand`) are
/// ordinary replies, not transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A frame that carries entries. For replies `command` is `OK`.
    Entries {
        command: Command,
        entries: Vec<Entry>,
    },

    /// `ERR` with the backend's error code.
    Error(ErrorCode),

    /// `DATA_NOT_FOUND`
    NotFound,

    /// `INVALID_COMMAND`
    InvalidCommand,

    /// A command code outside the known table.
    Unrecognized(u16),
}

impl Reply {
    /// Common reply for successful operations without entries.
    pub fn ok() -> Self {
        Reply::Entries {
            command: Command::Ok,
            entries: Vec::new(),
        }
    }

    /// An `OK` reply carrying the given entries.
    pub fn ok_with(entries: Vec<Entry>) -> Self {
        Reply::Entries {
            command: Command::Ok,
            entries,
        }
    }

    /// Returns the command code of the reply, or `None` if unrecognized.
    pub fn command(&self) -> Option<Command> {
        match self {
            Reply::Entries { command, .. } => Some(*command),
            Reply::Error(_) => Some(Command::Err),
            Reply::NotFound => Some(Command::DataNotFound),
            Reply::InvalidCommand => Some(Command::InvalidCommand),
            Reply::Unrecognized(_) => None,
        }
    }

    /// Returns true if this is an `OK` reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Entries { command: Command::Ok, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Reply::NotFound)
    }

    /// Returns the entries of the reply (empty for non-entry replies).
    pub fn entries(&self) -> &[Entry] {
        match self {
            Reply::Entries { entries, .. } => entries,
            _ => &[],
        }
    }

    /// Consumes the reply and returns its entries.
    pub fn into_entries(self) -> Vec<Entry> {
        match self {
            Reply::Entries { entries, .. } => entries,
            _ => Vec::new(),
        }
    }

    /// Looks up the value for `key` among the entries.
    pub fn value_of(&self, key: &[u8]) -> Option<&Bytes> {
        self.entries()
            .iter()
            .find(|e| e.key.as_ref() == key)
            .and_then(|e| e.value.as_ref())
    }

    /// Exact size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Reply::Entries { entries, .. } => entries.iter().map(Entry::encoded_len).sum(),
            Reply::Error(_) => width::ERROR_CODE,
            Reply::NotFound | Reply::InvalidCommand | Reply::Unrecognized(_) => 0,
        };
        HEADER_LEN + body
    }

    /// Encodes the reply into a complete frame, as the backend would send it.
    pub fn encode(&self) -> FrameResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encodes the reply into an existing buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) -> FrameResult<()> {
        if let Reply::Entries { entries, .. } = self {
            for entry in entries {
                check_len("key", &entry.key, MAX_KEY_LEN)?;
                if let Some(value) = &entry.value {
                    check_len("value", value, MAX_VALUE_LEN)?;
                }
            }
        }

        let (code, element_count) = match self {
            Reply::Entries { command, entries } => (command.code(), entries.len() as u64),
            Reply::Unrecognized(code) => (*code, 0),
            other => (other.command().map(Command::code).unwrap_or_default(), 0),
        };

        buf.reserve(self.encoded_len());
        buf.put_u64(self.encoded_len() as u64);
        buf.put_u64(element_count);
        buf.put_u16(code);

        match self {
            Reply::Entries { entries, .. } => {
                for entry in entries {
                    put_key(buf, &entry.key);
                    if let Some(value) = &entry.value {
                        put_value(buf, value);
                    }
                }
            }
            Reply::Error(code) => buf.put_u16(code.code()),
            Reply::NotFound | Reply::InvalidCommand | Reply::Unrecognized(_) => {}
        }

        Ok(())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Entries { command, entries } => {
                write!(f, "{} {{", command)?;
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", entry)?;
                }
                f.write_str("}")
            }
            Reply::Error(code) => write!(f, "(error) {}", code),
            Reply::NotFound => f.write_str("(data not found)"),
            Reply::InvalidCommand => f.write_str("(invalid command)"),
            Reply::Unrecognized(code) => write!(f, "(unrecognized command {})", code),
        }
    }
}

fn check_len(field: &'static str, data: &[u8], max: usize) -> FrameResult<()> {
    if data.len() > max {
        return Err(FrameError::FieldTooLong {
            field,
            len: data.len(),
            max,
        });
    }
    Ok(())
}

// Callers validate lengths first, so the narrowing casts below are lossless.

#[inline]
fn put_name(buf: &mut BytesMut, name: &[u8]) {
    buf.put_u8(name.len() as u8);
    buf.put_slice(name);
}

#[inline]
fn put_key(buf: &mut BytesMut, key: &[u8]) {
    buf.put_u16(key.len() as u16);
    buf.put_slice(key);
}

#[inline]
fn put_value(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}
