//! In-process mock backend for socket-level tests.
//!
//! Speaks the wire protocol over a real `TcpListener` on `127.0.0.1:0`, keeps
//! an in-memory ordered map, and gives every accepted connection its own
//! cursor table (cursors are per-socket on the real backend too).
//!
//! It also counts accepted connections and flags a request that arrives
//! while the previous one on the same socket is still unanswered.

use crate::protocol::{decode_request, Entry, ErrorCode, Header, Reply, Request, LENGTH_PREFIX_LEN};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behavior {
    /// Answer every request
    Serve,
    /// Read requests, never answer
    Silent,
}

#[derive(Default)]
struct Shared {
    store: Mutex<BTreeMap<Bytes, Bytes>>,
    accepted: AtomicUsize,
    requests: AtomicUsize,
    overlaps: AtomicUsize,
}

pub(crate) struct MockBackend {
    host: String,
    port: u16,
    shared: Arc<Shared>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub(crate) async fn start() -> Self {
        Self::spawn(Behavior::Serve, Duration::ZERO).await
    }

    /// Waits `delay` before answering each request.
    pub(crate) async fn with_delay(delay: Duration) -> Self {
        Self::spawn(Behavior::Serve, delay).await
    }

    pub(crate) async fn silent() -> Self {
        Self::spawn(Behavior::Silent, Duration::ZERO).await
    }

    async fn spawn(behavior: Behavior, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());

        let shared_clone = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared_clone.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, Arc::clone(&shared_clone), behavior, delay));
            }
        });

        Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            shared,
            handle,
        }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far.
    pub(crate) fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Request frames received so far.
    pub(crate) fn requests(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Requests that arrived before the previous reply on the same socket.
    pub(crate) fn overlaps(&self) -> usize {
        self.shared.overlaps.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A listener that never accepts. Once its accept queue is full, new
/// connects get no answer and hang until the caller gives up.
pub(crate) struct StalledListener {
    _listener: TcpListener,
    queued: Vec<TcpStream>,
    port: u16,
}

impl StalledListener {
    /// Binds with a zero backlog, which leaves room for one queued connect.
    pub(crate) fn bind() -> Self {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            _listener: listener,
            queued: Vec::new(),
            port,
        }
    }

    /// Binds and fills the accept queue right away.
    pub(crate) async fn full() -> Self {
        let mut stalled = Self::bind();
        stalled.fill().await;
        stalled
    }

    /// Connects until a connect stops completing.
    pub(crate) async fn fill(&mut self) {
        for _ in 0..16 {
            let attempt = TcpStream::connect(("127.0.0.1", self.port));
            match timeout(Duration::from_millis(100), attempt).await {
                Ok(Ok(stream)) => self.queued.push(stream),
                _ => break,
            }
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

async fn read_frame(stream: &mut TcpStream) -> Option<Bytes> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    stream.read_exact(&mut prefix).await.ok()?;
    let total = Header::frame_length(prefix).ok()?;

    let mut frame = vec![0u8; total];
    frame[..LENGTH_PREFIX_LEN].copy_from_slice(&prefix);
    stream.read_exact(&mut frame[LENGTH_PREFIX_LEN..]).await.ok()?;
    Some(Bytes::from(frame))
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>, behavior: Behavior, delay: Duration) {
    let mut cursors: HashMap<Bytes, Bound<Bytes>> = HashMap::new();

    while let Some(frame) = read_frame(&mut stream).await {
        shared.requests.fetch_add(1, Ordering::SeqCst);
        if behavior == Behavior::Silent {
            continue;
        }

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        // A well-behaved client sends nothing until it has its reply.
        let mut next_byte = [0u8; 1];
        if let Ok(Ok(n)) = tokio::time::timeout(Duration::ZERO, stream.peek(&mut next_byte)).await {
            if n > 0 {
                shared.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        let reply = match decode_request(&frame) {
            Ok(request) => execute(&shared, &mut cursors, request),
            Err(_) => Reply::InvalidCommand,
        };
        let Ok(bytes) = reply.encode() else { return };
        if stream.write_all(&bytes).await.is_err() {
            return;
        }
    }
}

fn execute(shared: &Shared, cursors: &mut HashMap<Bytes, Bound<Bytes>>, request: Request) -> Reply {
    let mut store = shared.store.lock().unwrap();

    match request {
        Request::Get { key } => match store.get(&key) {
            Some(value) => Reply::ok_with(vec![Entry::new(key, value.clone())]),
            None => Reply::NotFound,
        },
        Request::Set { key, value } => {
            store.insert(key, value);
            Reply::ok()
        }
        Request::Remove { key } => match store.remove(&key) {
            Some(_) => Reply::ok(),
            None => Reply::NotFound,
        },
        Request::CreateCursor { name, start_key } => {
            let position = start_key.map(Bound::Included).unwrap_or(Bound::Unbounded);
            cursors.insert(name, position);
            Reply::ok()
        }
        Request::DeleteCursor { name } => match cursors.remove(&name) {
            Some(_) => Reply::ok(),
            None => Reply::Error(ErrorCode::CursorNotFound),
        },
        Request::GetForward { cursor, amount } => {
            forward(&store, cursors, &cursor, amount, |_| true, true)
        }
        Request::GetKeys { cursor, amount } => {
            forward(&store, cursors, &cursor, amount, |_| true, false)
        }
        Request::GetKeysPrefix {
            cursor,
            prefix,
            amount,
        } => forward(&store, cursors, &cursor, amount, |k| k.starts_with(&prefix), false),
        Request::GetBackward { cursor, amount } => {
            let Some(position) = cursors.get_mut(&cursor) else {
                return Reply::Error(ErrorCode::CursorNotFound);
            };
            let upper = match position.clone() {
                Bound::Included(k) => Bound::Excluded(k),
                Bound::Excluded(k) => Bound::Included(k),
                Bound::Unbounded => return Reply::ok(),
            };
            let entries: Vec<Entry> = store
                .range((Bound::Unbounded, upper))
                .rev()
                .take(amount as usize)
                .map(|(k, v)| Entry::new(k.clone(), v.clone()))
                .collect();
            if let Some(last) = entries.last() {
                *position = Bound::Included(last.key.clone());
            }
            Reply::ok_with(entries)
        }
    }
}

fn forward(
    store: &BTreeMap<Bytes, Bytes>,
    cursors: &mut HashMap<Bytes, Bound<Bytes>>,
    cursor: &Bytes,
    amount: u16,
    filter: impl Fn(&Bytes) -> bool,
    with_values: bool,
) -> Reply {
    let Some(position) = cursors.get_mut(cursor) else {
        return Reply::Error(ErrorCode::CursorNotFound);
    };
    let entries: Vec<Entry> = store
        .range((position.clone(), Bound::Unbounded))
        .filter(|(k, _)| filter(k))
        .take(amount as usize)
        .map(|(k, v)| {
            if with_values {
                Entry::new(k.clone(), v.clone())
            } else {
                Entry::key_only(k.clone())
            }
        })
        .collect();
    if let Some(last) = entries.last() {
        *position = Bound::Excluded(last.key.clone());
    }
    Reply::ok_with(entries)
}
