//! Accepted connections and their lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Wrap a plain or TLS socket behind one blocking `Read + Write` type
//! - Count in-flight connections so shutdown can wait for them
//! - On shutdown, stop idle keep-alive connections from taking new requests

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use rustls::{ServerConnection, StreamOwned};

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A blocking client connection, with or without TLS.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Transport {
    fn socket(&self) -> &TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            Transport::Tls(stream) => &stream.sock,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Finish the connection: TLS close_notify, then half-close the socket.
    pub fn close(mut self) {
        if let Transport::Tls(stream) = &mut self {
            stream.conn.send_close_notify();
            let _ = stream.flush();
        }
        let _ = self.socket().shutdown(Shutdown::Write);
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(sock) => sock.flush(),
            Transport::Tls(stream) => stream.flush(),
        }
    }
}

/// One connection's view of the server's drain state.
///
/// A connection is idle while it waits for its next request line. Once the
/// server drains, an idle connection closes instead of reading another
/// request, and a busy one finishes its current response with
/// `Connection: close`.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    idle: Arc<AtomicBool>,
    draining: Arc<AtomicBool>,
}

impl ConnectionState {
    /// State for a connection that no tracker will ever drain.
    pub fn detached() -> Self {
        Self {
            idle: Arc::new(AtomicBool::new(false)),
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mark the connection as waiting for its next request.
    ///
    /// Returns `false` when the server is draining and the connection should
    /// close instead.
    pub fn enter_idle(&self) -> bool {
        self.idle.store(true, Ordering::SeqCst);
        !self.draining.load(Ordering::SeqCst)
    }

    /// A request head has arrived.
    pub fn enter_busy(&self) {
        self.idle.store(false, Ordering::SeqCst);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Start draining this connection alone.
    ///
    /// Used where the connection is not registered with a tracker, such as a
    /// forked child.
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::detached()
    }
}

/// A tracked socket, kept so a drain can half-close it while idle.
#[derive(Debug)]
struct Registered {
    socket: TcpStream,
    idle: Arc<AtomicBool>,
}

type Registry = Arc<Mutex<HashMap<ConnectionId, Registered>>>;

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
    draining: Arc<AtomicBool>,
    sockets: Registry,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        self.active_count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
            state: ConnectionState {
                idle: Arc::new(AtomicBool::new(false)),
                draining: Arc::clone(&self.draining),
            },
            sockets: None,
        }
    }

    /// Like [`track`](Self::track), and keep a handle on `socket` so
    /// [`drain`](Self::drain) can close it while it sits idle.
    pub fn track_socket(&self, socket: &TcpStream) -> ConnectionGuard {
        let mut guard = self.track();
        match socket.try_clone() {
            Ok(socket) => {
                lock(&self.sockets).insert(
                    guard.id,
                    Registered {
                        socket,
                        idle: Arc::clone(&guard.state.idle),
                    },
                );
                guard.sockets = Some(Arc::clone(&self.sockets));
            }
            Err(err) => {
                tracing::debug!(connection_id = %guard.id, error = %err, "Failed to register socket for draining");
            }
        }
        guard
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Stop every connection from taking another request.
    ///
    /// Idle registered sockets are half-closed for reading so their handlers
    /// see end-of-stream right away. Returns how many were closed.
    pub fn drain(&self) -> usize {
        self.draining.store(true, Ordering::SeqCst);
        let sockets = lock(&self.sockets);
        let mut closed = 0;
        for (id, registered) in sockets.iter() {
            if registered.idle.load(Ordering::SeqCst) {
                if let Err(err) = registered.socket.shutdown(Shutdown::Read) {
                    tracing::debug!(connection_id = %id, error = %err, "Failed to close idle connection");
                } else {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Wait until every connection has closed or `timeout` has passed.
    ///
    /// Returns `true` if the tracker drained in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active_count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }
}

fn lock(sockets: &Registry) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Registered>> {
    sockets.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
    state: ConnectionState,
    sockets: Option<Registry>,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Drain state to hand to the connection's handler.
    pub fn state(&self) -> ConnectionState {
        self.state.clone()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(sockets) = &self.sockets {
            lock(sockets).remove(&self.id);
        }
        self.active_count.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
