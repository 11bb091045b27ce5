//! Per-connection request loop.
//!
//! # Data Flow
//! ```text
//! stream
//!     → parser.rs (request line + headers)      ── malformed → 4xx/505, close
//!     → request.rs (Request record)             ── bad framing → 400/411, close
//!     → [100 Continue]
//!     → app (wrapped by middleware) + Responder
//!     → drain unread body
//!     → keep-alive? loop : close
//! ```
//!
//! # Design Decisions
//! - Blocking I/O on the connection's own thread or process; the async
//!   runtime only accepts
//! - One request at a time per connection, strictly in order
//! - A draining server gets no further requests on the connection: the
//!   handler checks before each request line and the in-flight response
//!   closes the connection

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::app::{self, App, AppError};
use crate::http::parser::{self, ParseError, RequestHead};
use crate::http::request::{ConnectionInfo, Request};
use crate::http::response::{self, Responder, ResponseError, Start, Status};
use crate::http::stream::{Buffered, SharedStream};
use crate::lifecycle::shutdown::ShutdownFlag;
use crate::net::connection::ConnectionState;
use crate::observability::metrics;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Why a connection ended abnormally.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to send error response: {0}")]
    Response(#[from] ResponseError),

    #[error("application error: {0}")]
    App(#[from] AppError),
}

impl HandlerError {
    /// The peer went away mid-connection.
    pub fn is_disconnect(&self) -> bool {
        match self {
            HandlerError::Io(_) | HandlerError::Response(ResponseError::Io(_)) => true,
            HandlerError::App(err) => err.is_disconnect(),
            HandlerError::Response(_) => false,
        }
    }
}

/// Serves every request on one connection.
#[derive(Clone)]
pub struct ConnectionHandler {
    app: Arc<dyn App>,
    info: ConnectionInfo,
    shutdown: ShutdownFlag,
    state: ConnectionState,
}

impl ConnectionHandler {
    pub fn new(app: Arc<dyn App>, info: ConnectionInfo, shutdown: ShutdownFlag) -> Self {
        Self {
            app,
            info,
            shutdown,
            state: ConnectionState::detached(),
        }
    }

    /// Follow `state` to stop serving once the server drains.
    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.state = state;
        self
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// An app on this connection (or any other sharing the flag) asked the
    /// server to stop.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_raised()
    }

    /// Run the request loop until the connection should close.
    ///
    /// Returns how many requests reached the app.
    pub fn handle<S: Read + Write>(&self, stream: &mut S) -> Result<u32, HandlerError> {
        let cell = RefCell::new(Buffered::new(stream));
        let shared: SharedStream<'_> = &cell;
        let mut served = 0;

        loop {
            if !self.state.enter_idle() {
                tracing::debug!(peer = %self.info.remote_addr, "Server draining; closing connection");
                break;
            }
            let head = match parser::parse_head(shared) {
                Ok(head) => head,
                Err(ParseError::ConnectionClosed) => break,
                // The drain cut the read short.
                Err(_) if self.state.is_draining() => break,
                Err(ParseError::Io(err)) => return Err(err.into()),
                Err(err) => {
                    self.reject(shared, &err)?;
                    break;
                }
            };
            self.state.enter_busy();

            let shutdown = Cell::new(false);
            let mut request = match Request::from_head(&head, &self.info, shared, &shutdown) {
                Ok(request) => request,
                Err(err) => {
                    self.reject(shared, &err)?;
                    break;
                }
            };

            if expects_continue(&head) {
                let mut stream = shared.borrow_mut();
                stream.write_all(CONTINUE)?;
                stream.flush()?;
            }

            let mut responder = Responder::new(shared).with_drain_state(self.state.clone());
            let result = app::drive(self.app.as_ref(), &mut request, &mut responder);
            served += 1;
            log_access(&request, &responder);

            let mut keep_alive = result.is_ok()
                && responder.has_content_length()
                && !responder.must_close()
                && head.is_http11()
                && !request.wants_close()
                && !shutdown.get()
                && !self.state.is_draining();

            if shutdown.get() {
                self.shutdown.raise();
            }

            if let Err(err) = result {
                if !err.is_disconnect() {
                    tracing::error!(
                        peer = %self.info.remote_addr,
                        path = %request.path(),
                        error = %err,
                        "Error on request"
                    );
                }
                return Err(err.into());
            }

            // Unread body bytes would be parsed as the next request.
            if let Err(err) = request.body().drain() {
                tracing::debug!(peer = %self.info.remote_addr, error = %err, "Failed to drain request body");
                keep_alive = false;
            }
            if !keep_alive {
                break;
            }
        }

        Ok(served)
    }

    fn reject(&self, stream: SharedStream<'_>, err: &ParseError) -> Result<(), ResponseError> {
        let Some(code) = err.status() else {
            return Ok(());
        };
        let status = Status::from(code);
        tracing::info!(
            peer = %self.info.remote_addr,
            status = code,
            error = %err,
            "Rejected malformed request"
        );
        metrics::record_request(code);

        let page = response::error_page(&status, &response::escape_html(&err.to_string()));
        let mut headers = response::html_headers(page.len());
        headers.push(("Connection".into(), "close".into()));

        let mut responder = Responder::new(stream);
        responder.start(Start::ok(status, headers))?.write(page.as_bytes())
    }
}

fn expects_continue(head: &RequestHead) -> bool {
    head.is_http11()
        && head
            .header("expect")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

fn log_access(request: &Request<'_>, responder: &Responder<'_>) {
    let status = responder.status().map(Status::code).unwrap_or(0);
    metrics::record_request(status);
    tracing::info!(
        peer = %request.remote_addr(),
        method = %request.method(),
        path = %request.path(),
        protocol = request.protocol(),
        status,
        size = responder.bytes_written(),
        "request"
    );
}
