//! Backend Connection
//!
//! One `BackendConnection` owns one socket to the key-value backend and runs
//! one request/response exchange at a time over it.
//!
//! ## Exchange
//!
//! ```text
//! send(frame)
//!    │
//!    ▼
//! ┌──────────────────────────────┐
//! │ lock guard (owns the stream) │   at most one exchange per socket
//! └──────────────┬───────────────┘
//!                ▼
//!     write_all + flush           ── timeout ──┐
//!                ▼                             │
//!     read_exact 8-byte length    ── timeout ──┤
//!                ▼                             ├──> poison (close, never reuse)
//!     read_exact remaining bytes  ── timeout ──┤
//!                ▼                             │
//!           reply frame           ── EOF/IO ───┘
//! ```
//!
//! The protocol has no request identifiers and no way to find the next frame
//! boundary after a partial read, so any failure inside an exchange closes the
//! connection for good.

use crate::protocol::{decode, FrameError, Header, Reply, Request, LENGTH_PREFIX_LEN};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Statistics shared by every connection of one gateway
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections established
    pub connections_opened: AtomicU64,
    /// Currently open connections
    pub active_connections: AtomicU64,
    /// Connect attempts that failed
    pub connect_failures: AtomicU64,
    /// Total request frames sent
    pub requests_sent: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Connections closed because of a transport failure
    pub connections_poisoned: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn connection_poisoned(&self) {
        self.connections_poisoned.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of currently open connections.
    pub fn active(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// The stage of an exchange that ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Write,
    ReadHeader,
    ReadBody,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => f.write_str("connect"),
            Phase::Write => f.write_str("write"),
            Phase::ReadHeader => f.write_str("header read"),
            Phase::ReadBody => f.write_str("body read"),
        }
    }
}

/// Errors that can occur on a backend connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The backend could not be reached
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A phase of the exchange exceeded its deadline
    #[error("timed out during {phase} after {limit:?}")]
    Timeout { phase: Phase, limit: Duration },

    /// The backend closed the socket in the middle of a frame
    #[error("connection closed by backend")]
    Closed,

    /// The connection is closed or was poisoned by an earlier failure
    #[error("connection is not open")]
    NotConnected,

    /// Any other socket error
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The reply could not be framed or decoded
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
}

impl From<io::Error> for ConnectionError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => ConnectionError::Closed,
            _ => ConnectionError::Io(e),
        }
    }
}

/// Tracks when something was last used.
///
/// Stored as milliseconds since creation so it can be read and updated
/// without a lock.
#[derive(Debug)]
pub(crate) struct LastUsed {
    epoch: Instant,
    offset_ms: AtomicU64,
}

impl LastUsed {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.offset_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.offset_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

enum State<S> {
    /// Not connected yet
    Fresh,
    Open(Channel<S>),
    /// Closed or poisoned; never reopened
    Closed,
}

struct Channel<S> {
    stream: S,
    /// Set while an exchange is on the wire. Still set when the guard is next
    /// taken means the previous exchange was dropped mid-frame.
    in_flight: bool,
}

/// A single connection to the backend.
///
/// All methods take `&self`; share the connection with an `Arc` when more
/// than one task needs it. Exchanges are serialized by an internal lock.
pub struct BackendConnection<S = TcpStream> {
    id: u64,
    addr: String,
    state: Mutex<State<S>>,
    open: AtomicBool,
    last_used: LastUsed,
    stats: Arc<ConnectionStats>,
}

impl BackendConnection<TcpStream> {
    /// Creates an unconnected connection to `host:port`.
    pub fn new(host: &str, port: u16, stats: Arc<ConnectionStats>) -> Self {
        Self::with_state(format!("{}:{}", host, port), State::Fresh, stats)
    }

    /// Creates a connection and connects it.
    pub async fn open(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        stats: Arc<ConnectionStats>,
    ) -> Result<Self, ConnectionError> {
        let conn = Self::new(host, port, stats);
        conn.connect(connect_timeout).await?;
        Ok(conn)
    }

    /// Establishes the TCP connection.
    ///
    /// A failed connect leaves the connection closed; create a new one to
    /// try again. Calling this on an open connection does nothing.
    pub async fn connect(&self, limit: Duration) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().await;
        match *state {
            State::Fresh => {}
            State::Open(_) => return Ok(()),
            State::Closed => return Err(ConnectionError::NotConnected),
        }

        let attempt = match timeout(limit, TcpStream::connect(self.addr.as_str())).await {
            Ok(attempt) => attempt,
            Err(_) => {
                *state = State::Closed;
                self.stats.connect_failed();
                debug!(conn = self.id, addr = %self.addr, ?limit, "Connect timed out");
                return Err(ConnectionError::Timeout {
                    phase: Phase::Connect,
                    limit,
                });
            }
        };
        let stream = match attempt.and_then(|stream| stream.set_nodelay(true).map(|_| stream)) {
            Ok(stream) => stream,
            Err(source) => {
                *state = State::Closed;
                self.stats.connect_failed();
                debug!(conn = self.id, addr = %self.addr, error = %source, "Connect failed");
                return Err(ConnectionError::Connect {
                    addr: self.addr.clone(),
                    source,
                });
            }
        };

        *state = State::Open(Channel {
            stream,
            in_flight: false,
        });
        self.mark_open();
        debug!(conn = self.id, addr = %self.addr, "Connected to backend");
        Ok(())
    }
}

impl<S> BackendConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Adopts an already-connected stream.
    ///
    /// `label` names the peer in logs.
    pub fn from_stream(stream: S, label: impl Into<String>, stats: Arc<ConnectionStats>) -> Self {
        let conn = Self::with_state(
            label.into(),
            State::Open(Channel {
                stream,
                in_flight: false,
            }),
            stats,
        );
        conn.mark_open();
        conn
    }

    /// Sends one complete frame and returns the backend's reply frame.
    ///
    /// `limit` applies separately to the write, the length read and the body
    /// read. Any failure poisons the connection.
    pub async fn send(&self, frame: &[u8], limit: Duration) -> Result<Bytes, ConnectionError> {
        let mut state = self.state.lock().await;

        let result = match &mut *state {
            State::Open(channel) if channel.in_flight => {
                warn!(
                    conn = self.id,
                    addr = %self.addr,
                    "Previous exchange was abandoned mid-frame"
                );
                Err(ConnectionError::NotConnected)
            }
            State::Open(channel) => {
                channel.in_flight = true;
                let result = self.exchange(&mut channel.stream, frame, limit).await;
                if result.is_ok() {
                    channel.in_flight = false;
                }
                result
            }
            State::Fresh | State::Closed => return Err(ConnectionError::NotConnected),
        };

        match result {
            Ok(reply) => {
                self.last_used.touch();
                Ok(reply)
            }
            Err(e) => {
                *state = State::Closed;
                if self.mark_closed() {
                    self.stats.connection_poisoned();
                    warn!(conn = self.id, addr = %self.addr, error = %e, "Connection poisoned");
                }
                Err(e)
            }
        }
    }

    /// Encodes `request`, sends it and decodes the reply.
    ///
    /// A reply that arrives whole but does not decode leaves the connection
    /// usable; the frame boundary is still intact.
    pub async fn send_request(
        &self,
        request: &Request,
        limit: Duration,
    ) -> Result<Reply, ConnectionError> {
        let frame = request.encode()?;
        let reply = self.send(&frame, limit).await?;
        Ok(decode(&reply, request.reply_shape())?)
    }

    async fn exchange(
        &self,
        stream: &mut S,
        frame: &[u8],
        limit: Duration,
    ) -> Result<Bytes, ConnectionError> {
        let write = async {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        timeout(limit, write)
            .await
            .map_err(|_| ConnectionError::Timeout {
                phase: Phase::Write,
                limit,
            })??;
        self.stats.request_sent();
        self.stats.bytes_written(frame.len());

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        timeout(limit, stream.read_exact(&mut prefix))
            .await
            .map_err(|_| ConnectionError::Timeout {
                phase: Phase::ReadHeader,
                limit,
            })??;
        let total = Header::frame_length(prefix)?;

        let mut reply = BytesMut::with_capacity(total);
        reply.extend_from_slice(&prefix);
        reply.resize(total, 0);
        timeout(limit, stream.read_exact(&mut reply[LENGTH_PREFIX_LEN..]))
            .await
            .map_err(|_| ConnectionError::Timeout {
                phase: Phase::ReadBody,
                limit,
            })??;
        self.stats.bytes_read(total);

        trace!(
            conn = self.id,
            written = frame.len(),
            read = total,
            "Exchange complete"
        );
        Ok(reply.freeze())
    }
}

impl<S> BackendConnection<S> {
    fn with_state(addr: String, state: State<S>, stats: Arc<ConnectionStats>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            state: Mutex::new(state),
            open: AtomicBool::new(false),
            last_used: LastUsed::new(),
            stats,
        }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The backend address (or stream label).
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Returns true until the connection is closed or poisoned.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Time since connect or the last successful exchange.
    pub fn idle_for(&self) -> Duration {
        self.last_used.idle_for()
    }

    /// Closes the connection. Safe to call more than once.
    ///
    /// Waits for an exchange in progress to finish first.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        *state = State::Closed;
        if self.mark_closed() {
            debug!(conn = self.id, addr = %self.addr, "Connection closed");
        }
    }

    fn mark_open(&self) {
        self.open.store(true, Ordering::Release);
        self.last_used.touch();
        self.stats.connection_opened();
    }

    /// Flips the open flag. Returns true for the caller that actually closed it.
    fn mark_closed(&self) -> bool {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        if was_open {
            self.stats.connection_closed();
        }
        was_open
    }
}

impl<S> Drop for BackendConnection<S> {
    fn drop(&mut self) {
        self.mark_closed();
    }
}

impl<S> fmt::Debug for BackendConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConnection")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("open", &self.is_open())
            .finish()
    }
}
