//! Response state and the start/write protocol.
//!
//! # Responsibilities
//! - Hold the pending status and headers set by [`Responder::start`]
//! - Flush the head on the first [`Responder::write`]
//! - Decide whether the connection must close after this response
//!
//! # Design Decisions
//! - Headers are immutable once flushed; violations surface as
//!   [`ResponseError`] instead of being ignored
//! - No chunked transfer encoding: a response without `Content-Length` is
//!   delimited by closing the connection
//! - Every write is flushed straight to the transport

use std::fmt;
use std::io::{self, Write};
use std::time::SystemTime;

use thiserror::Error;

use crate::http::stream::SharedStream;
use crate::net::connection::ConnectionState;

/// `Server` header value used when the app does not set one.
pub const SERVER_HEADER: &str = concat!("devserver/", env!("CARGO_PKG_VERSION"));

/// Errors raised by the start/write protocol.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("response already started")]
    AlreadyStarted,

    #[error("headers already sent")]
    HeadersAlreadySent,

    #[error("write() before start()")]
    WriteBeforeStart,

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

/// An HTTP status code with its reason phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: u16,
    reason: String,
}

impl Status {
    /// Status with an explicit reason phrase.
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<u16> for Status {
    fn from(code: u16) -> Self {
        let reason = http::StatusCode::from_u16(code)
            .ok()
            .and_then(|status| status.canonical_reason())
            .unwrap_or("Unknown");
        Self::new(code, reason)
    }
}

impl From<http::StatusCode> for Status {
    fn from(status: http::StatusCode) -> Self {
        Self::from(status.as_u16())
    }
}

/// Parses `"404 Not Found"` or a bare `"404"`.
impl std::str::FromStr for Status {
    type Err = ResponseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (code, reason) = match s.split_once(' ') {
            Some((code, reason)) => (code, Some(reason.trim())),
            None => (s, None),
        };
        let code: u16 = code
            .parse()
            .ok()
            .filter(|c| (100..=999).contains(c))
            .ok_or_else(|| ResponseError::InvalidHeader(format!("bad status line '{}'", s)))?;
        Ok(match reason {
            Some(reason) if !reason.is_empty() => Self::new(code, reason),
            _ => Self::from(code),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// Header list in the order the app supplied it.
pub type Headers = Vec<(String, String)>;

/// The start-response command.
#[derive(Debug, Clone)]
pub enum Start {
    /// Normal start. Allowed once, before anything is sent.
    Ok { status: Status, headers: Headers },
    /// Error start. Replaces a pending head; fails once the head is on the wire.
    Error { status: Status, headers: Headers },
}

impl Start {
    pub fn ok(status: impl Into<Status>, headers: Headers) -> Self {
        Start::Ok {
            status: status.into(),
            headers,
        }
    }

    pub fn error(status: impl Into<Status>, headers: Headers) -> Self {
        Start::Error {
            status: status.into(),
            headers,
        }
    }
}

#[derive(Debug)]
struct Head {
    status: Status,
    headers: Headers,
}

/// Writes one response onto a connection.
pub struct Responder<'a> {
    stream: SharedStream<'a>,
    pending: Option<Head>,
    sent: Option<Status>,
    has_content_length: bool,
    close: bool,
    bytes_written: u64,
    drain: Option<ConnectionState>,
}

impl<'a> Responder<'a> {
    pub fn new(stream: SharedStream<'a>) -> Self {
        Self {
            stream,
            pending: None,
            sent: None,
            has_content_length: false,
            close: false,
            bytes_written: 0,
            drain: None,
        }
    }

    /// Close the connection after this response if the server has started
    /// draining by the time the head goes out.
    pub fn with_drain_state(mut self, state: ConnectionState) -> Self {
        self.drain = Some(state);
        self
    }

    /// Set the status and headers for this response.
    ///
    /// Returns `self` so the first write can chain off it.
    pub fn start(&mut self, start: Start) -> Result<&mut Self, ResponseError> {
        let (status, headers, replace) = match start {
            Start::Ok { status, headers } => (status, headers, false),
            Start::Error { status, headers } => (status, headers, true),
        };

        if self.sent.is_some() {
            return Err(if replace {
                ResponseError::HeadersAlreadySent
            } else {
                ResponseError::AlreadyStarted
            });
        }
        if self.pending.is_some() && !replace {
            return Err(ResponseError::AlreadyStarted);
        }

        for (name, value) in &headers {
            validate_header(name, value)?;
        }
        self.pending = Some(Head { status, headers });
        Ok(self)
    }

    /// Write body bytes, flushing the head first if needed.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ResponseError> {
        let mut buf = Vec::with_capacity(data.len() + 256);
        if self.sent.is_none() {
            let head = self.pending.take().ok_or(ResponseError::WriteBeforeStart)?;
            self.encode_head(&head, &mut buf);
            self.sent = Some(head.status);
        }
        buf.extend_from_slice(data);

        let mut stream = self.stream.borrow_mut();
        stream.write_all(&buf)?;
        stream.flush()?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    fn encode_head(&mut self, head: &Head, buf: &mut Vec<u8>) {
        let mut has_server = false;
        let mut has_date = false;

        buf.extend_from_slice(format!("HTTP/1.1 {}\r\n", head.status).as_bytes());
        for (name, value) in &head.headers {
            if name.eq_ignore_ascii_case("content-length") {
                self.has_content_length = true;
            } else if name.eq_ignore_ascii_case("server") {
                has_server = true;
            } else if name.eq_ignore_ascii_case("date") {
                has_date = true;
            } else if name.eq_ignore_ascii_case("connection")
                && value.trim().eq_ignore_ascii_case("close")
            {
                self.close = true;
            }
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if self.drain.as_ref().is_some_and(ConnectionState::is_draining) {
            self.close = true;
        }
        if !self.has_content_length || self.close {
            self.close = true;
            if !head
                .headers
                .iter()
                .any(|(name, _)| name.eq_ignore_ascii_case("connection"))
            {
                buf.extend_from_slice(b"Connection: close\r\n");
            }
        }
        if !has_server {
            buf.extend_from_slice(format!("Server: {}\r\n", SERVER_HEADER).as_bytes());
        }
        if !has_date {
            let date = httpdate::fmt_http_date(SystemTime::now());
            buf.extend_from_slice(format!("Date: {}\r\n", date).as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
    }

    pub fn headers_sent(&self) -> bool {
        self.sent.is_some()
    }

    /// Status that went out on the wire, if any.
    pub fn status(&self) -> Option<&Status> {
        self.sent.as_ref()
    }

    /// Body bytes written so far (head excluded).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// The flushed head carried `Content-Length`.
    pub fn has_content_length(&self) -> bool {
        self.has_content_length
    }

    /// Force the connection closed after this response.
    pub fn close_connection(&mut self) {
        self.close = true;
    }

    pub fn must_close(&self) -> bool {
        self.close
    }
}

impl fmt::Debug for Responder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("pending", &self.pending)
            .field("sent", &self.sent)
            .field("close", &self.close)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

/// Complete HTML error page for `status`. `description` is inserted as HTML.
pub fn error_page(status: &Status, description: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=en>\n<title>{code} {reason}</title>\n\
         <h1>{reason}</h1>\n<p>{description}</p>\n",
        code = status.code(),
        reason = escape_html(status.reason()),
        description = description,
    )
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

/// Head for a self-contained HTML response.
pub fn html_headers(body_len: usize) -> Headers {
    vec![
        ("Content-Type".into(), "text/html; charset=utf-8".into()),
        ("Content-Length".into(), body_len.to_string()),
    ]
}

fn validate_header(name: &str, value: &str) -> Result<(), ResponseError> {
    http::HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ResponseError::InvalidHeader(format!("bad header name {:?}", name)))?;
    http::HeaderValue::from_str(value).map_err(|_| {
        ResponseError::InvalidHeader(format!("bad value for header {:?}", name))
    })?;
    Ok(())
}
