//! The accept loop.
//!
//! # Responsibilities
//! - Resolve the TLS identity, wrap the app, bind the listener
//! - Accept connections until an OS signal or an app-requested stop
//! - Dispatch each connection according to the concurrency mode
//! - On shutdown, close idle keep-alive connections at once and give
//!   in-flight requests a grace period
//!
//! # Design Decisions
//! - Accepting is async (Tokio); serving a connection is blocking, on its
//!   own thread or in a forked child, since the app contract is synchronous
//! - The same [`ConnectionHandler`] runs in every mode
//! - Per-connection failures are logged and never stop the loop

use std::future::Future;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::ServerConfig as TlsConfig;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::app::{App, AppError};
use crate::config::{ConcurrencyMode, ServerConfig};
use crate::http::handler::ConnectionHandler;
use crate::http::middleware::{DebugMiddleware, ErrorIsolation};
use crate::http::request::ConnectionInfo;
use crate::lifecycle::shutdown::ShutdownFlag;
use crate::net::connection::{ConnectionId, ConnectionTracker, Transport};
#[cfg(unix)]
use crate::net::connection::ConnectionState;
use crate::net::listener::{self, ListenerError};
use crate::tls::{self, TlsError, TlsIdentity};

/// Exit code a forked connection child uses to ask the parent to stop.
pub const SHUTDOWN_EXIT_CODE: i32 = 3;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("listener setup failed: {0}")]
    Io(#[from] io::Error),
}

/// Why [`Server::serve_forever`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown future resolved (normally an OS signal).
    Signal,
    /// An app called `Request::shutdown_server`.
    Requested,
}

/// A bound development server.
pub struct Server {
    listener: std::net::TcpListener,
    local_addr: SocketAddr,
    app: Arc<dyn App>,
    tls: Option<TlsIdentity>,
    mode: ConcurrencyMode,
    grace: Duration,
    shutdown: ShutdownFlag,
    tracker: ConnectionTracker,
}

impl Server {
    /// Prepare TLS, wrap `app` and bind the listening socket.
    pub fn bind<A: App>(config: &ServerConfig, app: A) -> Result<Self, ServeError> {
        let tls = TlsIdentity::resolve(&config.tls)?;

        let app: Arc<dyn App> = if config.debug {
            Arc::new(DebugMiddleware::new(app))
        } else {
            Arc::new(ErrorIsolation::new(app))
        };

        let listener = listener::bind(&config.host, config.port)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            app,
            tls,
            mode: config.concurrency,
            grace: config.shutdown_grace(),
            shutdown: ShutdownFlag::new(),
            tracker: ConnectionTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    /// Handle that stops the accept loop when raised.
    pub fn shutdown_flag(&self) -> ShutdownFlag {
        self.shutdown.clone()
    }

    pub fn tls(&self) -> Option<&TlsIdentity> {
        self.tls.as_ref()
    }

    /// Accept and serve connections until `signal` resolves or an app asks
    /// the server to stop. The socket is closed before returning.
    pub async fn serve_forever<F>(self, signal: F) -> Result<StopReason, ServeError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            local_addr,
            app,
            tls,
            mode,
            grace,
            shutdown,
            tracker,
        } = self;

        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let dispatcher = Dispatcher {
            app,
            tls_config: tls.as_ref().map(TlsIdentity::config),
            local_addr,
            mode,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };

        #[cfg(unix)]
        let mut children = if mode == ConcurrencyMode::Forked {
            Some(ChildReaper::new()?)
        } else {
            None
        };
        #[cfg(not(unix))]
        let mut children: Option<()> = None;

        tracing::info!(
            address = %local_addr,
            mode = ?mode,
            tls = tls.is_some(),
            "Server listening"
        );

        tokio::pin!(signal);
        let mut in_flight: Option<oneshot::Receiver<()>> = None;

        let reason = loop {
            tokio::select! {
                biased;

                _ = &mut signal => break StopReason::Signal,
                _ = shutdown.wait() => break StopReason::Requested,

                _ = reaper_tick(&mut children) => {
                    #[cfg(unix)]
                    {
                        if let Some(reaper) = children.as_mut() {
                            reaper.reap(&shutdown);
                        }
                    }
                }

                _ = finished(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                }

                accepted = listener.accept(), if in_flight.is_none() => {
                    match accepted {
                        Ok((tcp, peer)) => match dispatcher.dispatch(tcp, peer, &listener) {
                            Dispatched::Running => {}
                            Dispatched::Sequential(done) => in_flight = Some(done),
                            #[cfg(unix)]
                            Dispatched::Forked(pid) => {
                                if let Some(reaper) = children.as_mut() {
                                    reaper.adopt(pid);
                                }
                            }
                        },
                        Err(err) => {
                            tracing::warn!(error = %err, "Failed to accept connection");
                        }
                    }
                }
            }
        };

        drop(listener);
        let closed = tracker.drain();
        tracing::info!(reason = ?reason, idle_closed = closed, "Server stopped accepting");

        #[cfg(unix)]
        {
            if let Some(reaper) = children.as_mut() {
                reaper.drain(grace, &shutdown).await;
            }
        }
        if !tracker.wait_idle(grace).await {
            tracing::warn!(
                active = tracker.active_count(),
                "Connections still active after grace period; abandoning them"
            );
        }

        // Ad-hoc certificate files go away with the identity.
        drop(tls);
        Ok(reason)
    }
}

/// What became of an accepted connection.
enum Dispatched {
    /// Serving on its own thread, or dropped.
    Running,
    /// Serving on the handler thread; the receiver fires when it is done.
    Sequential(oneshot::Receiver<()>),
    /// Serving in the child process with this pid.
    #[cfg(unix)]
    Forked(libc::pid_t),
}

/// Everything needed to start serving one accepted connection.
struct Dispatcher {
    app: Arc<dyn App>,
    tls_config: Option<Arc<TlsConfig>>,
    local_addr: SocketAddr,
    mode: ConcurrencyMode,
    shutdown: ShutdownFlag,
    tracker: ConnectionTracker,
}

impl Dispatcher {
    /// Hand one accepted connection to the configured mode.
    fn dispatch(
        &self,
        tcp: tokio::net::TcpStream,
        peer: SocketAddr,
        #[allow(unused_variables)] listener: &tokio::net::TcpListener,
    ) -> Dispatched {
        let tcp = match into_blocking(tcp) {
            Ok(tcp) => tcp,
            Err(err) => {
                tracing::warn!(peer = %peer, error = %err, "Failed to prepare connection");
                return Dispatched::Running;
            }
        };
        let info = ConnectionInfo {
            remote_addr: peer,
            local_addr: tcp.local_addr().unwrap_or(self.local_addr),
            server_name: self.local_addr.ip().to_string(),
            scheme: if self.tls_config.is_some() { "https" } else { "http" },
            multithread: self.mode.is_multithread(),
            multiprocess: self.mode.is_multiprocess(),
        };
        let handler = ConnectionHandler::new(Arc::clone(&self.app), info, self.shutdown.clone());
        let tls_config = self.tls_config.clone();

        match self.mode {
            ConcurrencyMode::Sequential | ConcurrencyMode::Threaded => {
                let guard = self.tracker.track_socket(&tcp);
                let id = guard.id();
                let handler = handler.with_state(guard.state());
                let (done_tx, done_rx) = oneshot::channel();
                let spawned = std::thread::Builder::new()
                    .name(format!("devserver-{}", id))
                    .spawn(move || {
                        serve_connection(&handler, tls_config, tcp, peer, id);
                        drop(guard);
                        let _ = done_tx.send(());
                    });
                match spawned {
                    Ok(_) if self.mode == ConcurrencyMode::Sequential => Dispatched::Sequential(done_rx),
                    Ok(_) => Dispatched::Running,
                    Err(err) => {
                        tracing::error!(peer = %peer, error = %err, "Failed to spawn connection thread");
                        Dispatched::Running
                    }
                }
            }
            ConcurrencyMode::Forked => {
                #[cfg(unix)]
                {
                    use std::os::fd::AsRawFd;
                    match fork_connection(&handler, tls_config, tcp, peer, listener.as_raw_fd()) {
                        Some(pid) => Dispatched::Forked(pid),
                        None => Dispatched::Running,
                    }
                }
                #[cfg(not(unix))]
                {
                    let _ = (handler, tls_config, tcp);
                    tracing::error!(peer = %peer, "Forked mode is only available on unix");
                    Dispatched::Running
                }
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("mode", &self.mode)
            .field("tls", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}

fn into_blocking(tcp: tokio::net::TcpStream) -> io::Result<TcpStream> {
    let tcp = tcp.into_std()?;
    tcp.set_nonblocking(false)?;
    Ok(tcp)
}

async fn finished(in_flight: &mut Option<oneshot::Receiver<()>>) {
    match in_flight.as_mut() {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending().await,
    }
}

/// Serve one connection to completion on the current thread.
///
/// Nothing escapes: failures and panics are logged here.
fn serve_connection(
    handler: &ConnectionHandler,
    tls_config: Option<Arc<TlsConfig>>,
    tcp: TcpStream,
    peer: SocketAddr,
    id: ConnectionId,
) {
    let mut transport = match tls_config {
        None => Transport::Plain(tcp),
        Some(config) => match tls::accept(config, tcp) {
            Ok(stream) => Transport::Tls(Box::new(stream)),
            Err(err) => {
                tracing::warn!(connection_id = %id, peer = %peer, error = %err, "TLS handshake failed");
                return;
            }
        },
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut transport)));
    match outcome {
        Ok(Ok(served)) => {
            tracing::trace!(connection_id = %id, peer = %peer, requests = served, "Connection finished");
        }
        Ok(Err(err)) if err.is_disconnect() => {
            tracing::debug!(connection_id = %id, peer = %peer, error = %err, "Connection dropped by peer");
        }
        Ok(Err(err)) => {
            tracing::error!(connection_id = %id, peer = %peer, error = %err, "Connection failed");
        }
        Err(payload) => {
            let err = AppError::from_panic(payload);
            tracing::error!(connection_id = %id, peer = %peer, error = %err, "Connection handler panicked");
        }
    }
    transport.close();
}

/// The connection a forked child serves, for its drain signal handler.
#[cfg(unix)]
static CHILD_CONNECTION: std::sync::OnceLock<(ConnectionState, std::os::fd::RawFd)> =
    std::sync::OnceLock::new();

/// Signal the parent sends a forked child when the server drains.
#[cfg(unix)]
const DRAIN_SIGNAL: libc::c_int = libc::SIGUSR1;

#[cfg(unix)]
extern "C" fn drain_child_connection(_signal: libc::c_int) {
    if let Some((state, fd)) = CHILD_CONNECTION.get() {
        state.begin_drain();
        if state.is_idle() {
            // SAFETY: shutdown(2) is async-signal-safe and `fd` stays open
            // until the child exits.
            unsafe {
                libc::shutdown(*fd, libc::SHUT_RD);
            }
        }
    }
}

/// Fork a child to serve `tcp`. Returns the child's pid in the parent.
#[cfg(unix)]
fn fork_connection(
    handler: &ConnectionHandler,
    tls_config: Option<Arc<TlsConfig>>,
    tcp: TcpStream,
    peer: SocketAddr,
    listener_fd: std::os::fd::RawFd,
) -> Option<libc::pid_t> {
    use std::os::fd::AsRawFd;

    let id = ConnectionId::new();
    // SAFETY: the accept loop runs on a single-threaded runtime in forked
    // mode, and the child only runs blocking code before `_exit`.
    match unsafe { libc::fork() } {
        -1 => {
            let err = io::Error::last_os_error();
            tracing::error!(peer = %peer, error = %err, "Failed to fork connection handler");
            None
        }
        0 => {
            let handler = handler.clone().with_state(ConnectionState::detached());
            let _ = CHILD_CONNECTION.set((handler.state().clone(), tcp.as_raw_fd()));
            let on_drain = drain_child_connection as extern "C" fn(libc::c_int);
            // SAFETY: plain libc calls in the freshly forked child.
            unsafe {
                libc::close(listener_fd);
                libc::signal(libc::SIGTERM, libc::SIG_DFL);
                libc::signal(libc::SIGINT, libc::SIG_DFL);
                libc::signal(DRAIN_SIGNAL, on_drain as libc::sighandler_t);
            }
            serve_connection(&handler, tls_config, tcp, peer, id);
            let code = if handler.shutdown_requested() {
                SHUTDOWN_EXIT_CODE
            } else {
                0
            };
            // SAFETY: leave without running destructors or atexit handlers
            // that belong to the parent (temp certificate files, runtime).
            unsafe { libc::_exit(code) }
        }
        pid => {
            tracing::debug!(connection_id = %id, peer = %peer, pid, "Forked connection handler");
            drop(tcp);
            Some(pid)
        }
    }
}

/// Reaps forked connection children on SIGCHLD.
#[cfg(unix)]
struct ChildReaper {
    sigchld: tokio::signal::unix::Signal,
    running: std::collections::HashSet<libc::pid_t>,
}

#[cfg(unix)]
impl ChildReaper {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigchld: signal(SignalKind::child())?,
            running: std::collections::HashSet::new(),
        })
    }

    fn adopt(&mut self, pid: libc::pid_t) {
        self.running.insert(pid);
    }

    /// Collect every exited child. Returns `true` once no children remain.
    fn reap(&mut self, shutdown: &ShutdownFlag) -> bool {
        loop {
            let mut status = 0;
            // SAFETY: non-blocking wait for any child of this process.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid == 0 {
                return false;
            }
            if pid < 0 {
                // ECHILD: nothing left to wait for.
                return true;
            }
            self.running.remove(&pid);
            if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == SHUTDOWN_EXIT_CODE {
                shutdown.raise();
            }
            tracing::trace!(pid, "Reaped connection child");
        }
    }

    /// Tell every child to stop taking requests, then wait for them.
    async fn drain(&mut self, grace: Duration, shutdown: &ShutdownFlag) {
        for &pid in &self.running {
            // SAFETY: `pid` is a child of this process that has not been
            // reaped yet, so the id cannot have been reused.
            unsafe {
                libc::kill(pid, DRAIN_SIGNAL);
            }
        }
        let deadline = Instant::now() + grace;
        while !self.reap(shutdown) {
            if Instant::now() >= deadline {
                tracing::warn!("Connection children still running after grace period");
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[cfg(unix)]
async fn reaper_tick(children: &mut Option<ChildReaper>) {
    match children.as_mut() {
        Some(reaper) => {
            reaper.sigchld.recv().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn reaper_tick(_children: &mut Option<()>) {
    std::future::pending().await
}
