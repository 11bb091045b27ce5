//! The per-request record handed to the app.
//!
//! # Responsibilities
//! - Turn a parsed [`RequestHead`] into a [`Request`] with decoded path,
//!   query, header map and connection facts
//! - Expose the request body as a reader bounded by `Content-Length`
//! - Carry the hook an app uses to ask the server to stop
//!
//! # Design Decisions
//! - Headers are keyed CGI-style (`HTTP_` + upper-case, `-` → `_`); a
//!   repeated header keeps its last value
//! - `Content-Type` and `Content-Length` live in dedicated fields
//! - An absolute-URI request target overrides the `Host` header; its
//!   authority and path are used exactly as sent, never normalized

use std::cell::Cell;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::net::SocketAddr;

use crate::http::parser::{ParseError, RequestHead};
use crate::http::stream::SharedStream;

/// Facts about the connection a request arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    /// Host name the server was configured with.
    pub server_name: String,
    /// `http` or `https`.
    pub scheme: &'static str,
    pub multithread: bool,
    pub multiprocess: bool,
}

/// CGI-style key for a header name: `X-Forwarded-For` → `HTTP_X_FORWARDED_FOR`.
pub fn environ_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len() + 5);
    key.push_str("HTTP_");
    key.extend(name.chars().map(|c| match c {
        '-' => '_',
        c => c.to_ascii_uppercase(),
    }));
    key
}

/// One parsed HTTP request.
pub struct Request<'a> {
    method: String,
    path: String,
    query: String,
    version: http::Version,
    scheme: &'static str,
    content_type: Option<String>,
    content_length: Option<u64>,
    headers: BTreeMap<String, String>,
    remote_addr: SocketAddr,
    server_name: String,
    server_port: u16,
    multithread: bool,
    multiprocess: bool,
    body: RequestBody<'a>,
    shutdown: &'a Cell<bool>,
}

impl<'a> Request<'a> {
    /// Build the request record from a parsed head.
    ///
    /// Fails with `BadRequest` for an unparsable target or `Content-Length`,
    /// and with `LengthRequired` for a `Transfer-Encoding` body.
    pub fn from_head(
        head: &RequestHead,
        info: &ConnectionInfo,
        stream: SharedStream<'a>,
        shutdown: &'a Cell<bool>,
    ) -> Result<Self, ParseError> {
        if head.header("transfer-encoding").is_some() {
            return Err(ParseError::LengthRequired);
        }

        let content_length = match head.header("content-length") {
            None => None,
            Some(value) => {
                let value = value.trim();
                if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(ParseError::BadRequest(format!(
                        "invalid Content-Length {:?}",
                        value
                    )));
                }
                Some(value.parse::<u64>().map_err(|_| {
                    ParseError::BadRequest(format!("Content-Length {:?} out of range", value))
                })?)
            }
        };

        let mut headers = BTreeMap::new();
        let mut content_type = None;
        for (name, value) in &head.headers {
            if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.clone());
            } else if !name.eq_ignore_ascii_case("content-length") {
                headers.insert(environ_key(name), value.clone());
            }
        }

        let target = Target::parse(&head.target)?;
        if let Some(authority) = target.authority {
            headers.insert("HTTP_HOST".to_string(), authority);
        }

        Ok(Self {
            method: head.method.clone(),
            path: percent_decode(&target.path),
            query: target.query,
            version: head.version,
            scheme: info.scheme,
            content_type,
            content_length,
            headers,
            remote_addr: info.remote_addr,
            server_name: info.server_name.clone(),
            server_port: info.local_addr.port(),
            multithread: info.multithread,
            multiprocess: info.multiprocess,
            body: RequestBody {
                stream,
                remaining: content_length.unwrap_or(0),
            },
            shutdown,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Percent-decoded path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string, without the `?`.
    pub fn query_string(&self) -> &str {
        &self.query
    }

    pub fn version(&self) -> http::Version {
        self.version
    }

    /// `HTTP/1.0` or `HTTP/1.1`.
    pub fn protocol(&self) -> &'static str {
        if self.version == http::Version::HTTP_10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Header by HTTP name (`"X-Foo"`) or by key (`"HTTP_X_FOO"`).
    pub fn header(&self, name: &str) -> Option<&str> {
        let value = if name.starts_with("HTTP_") {
            self.headers.get(name)
        } else {
            self.headers.get(&environ_key(name))
        };
        value.map(String::as_str)
    }

    /// All headers, keyed CGI-style, sorted by key.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn is_multithread(&self) -> bool {
        self.multithread
    }

    pub fn is_multiprocess(&self) -> bool {
        self.multiprocess
    }

    pub fn body(&mut self) -> &mut RequestBody<'a> {
        &mut self.body
    }

    /// Ask the server to stop once this response is complete.
    pub fn shutdown_server(&self) {
        self.shutdown.set(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.get()
    }

    /// The client sent `Connection: close`.
    pub fn wants_close(&self) -> bool {
        self.header("Connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    }

    /// Flat CGI-style view of the request, for logging and debugging apps.
    pub fn environ(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = self.headers.clone();
        env.insert("REQUEST_METHOD".into(), self.method.clone());
        env.insert("SCRIPT_NAME".into(), String::new());
        env.insert("PATH_INFO".into(), self.path.clone());
        env.insert("QUERY_STRING".into(), self.query.clone());
        env.insert("SERVER_NAME".into(), self.server_name.clone());
        env.insert("SERVER_PORT".into(), self.server_port.to_string());
        env.insert("SERVER_PROTOCOL".into(), self.protocol().into());
        env.insert("REMOTE_ADDR".into(), self.remote_addr.ip().to_string());
        env.insert("REMOTE_PORT".into(), self.remote_addr.port().to_string());
        env.insert("URL_SCHEME".into(), self.scheme.into());
        if let Some(ct) = &self.content_type {
            env.insert("CONTENT_TYPE".into(), ct.clone());
        }
        if let Some(len) = self.content_length {
            env.insert("CONTENT_LENGTH".into(), len.to_string());
        }
        env
    }
}

impl std::fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query", &self.query)
            .field("version", &self.version)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Request body, bounded by `Content-Length` (empty when absent).
pub struct RequestBody<'a> {
    stream: SharedStream<'a>,
    remaining: u64,
}

impl RequestBody<'_> {
    /// Bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Discard whatever the app did not read.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }
}

impl Read for RequestBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.stream.borrow_mut().read(&mut buf[..max])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside the request body",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

struct Target {
    path: String,
    query: String,
    authority: Option<String>,
}

impl Target {
    fn parse(target: &str) -> Result<Self, ParseError> {
        let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let uri: http::Uri = target
                .parse()
                .map_err(|e| ParseError::BadRequest(format!("bad request target: {}", e)))?;
            let authority = uri
                .authority()
                .ok_or_else(|| ParseError::BadRequest("request target without host".into()))?;
            return Ok(Self {
                path: uri.path().to_string(),
                query: uri.query().unwrap_or("").to_string(),
                authority: Some(authority.as_str().to_string()),
            });
        }

        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        Ok(Self {
            path: path.to_string(),
            query: query.to_string(),
            authority: None,
        })
    }
}

fn percent_decode(raw: &str) -> String {
    let bytes = urlencoding::decode_binary(raw.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stream::Buffered;
    use std::cell::RefCell;
    use std::io::{Cursor, Write};

    struct Input(Cursor<Vec<u8>>);

    impl Read for Input {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Write for Input {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            remote_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: "127.0.0.1:5000".parse().unwrap(),
            server_name: "127.0.0.1".into(),
            scheme: "http",
            multithread: true,
            multiprocess: false,
        }
    }

    fn head(target: &str, headers: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: "GET".into(),
            target: target.into(),
            version: http::Version::HTTP_11,
            headers: headers
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn header_keys_are_cgi_style() {
        assert_eq!(environ_key("X-Forwarded-For"), "HTTP_X_FORWARDED_FOR");
        assert_eq!(environ_key("host"), "HTTP_HOST");
    }

    #[test]
    fn builds_request_fields() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(Vec::new()))));
        let shutdown = Cell::new(false);
        let h = head(
            "/caf%C3%A9%20bar?x=%20y",
            &[
                ("Host", "example.com"),
                ("X-Dup", "first"),
                ("x-dup", "second"),
                ("Content-Type", "text/plain"),
                ("Content-Length", "0"),
            ],
        );
        let req = Request::from_head(&h, &info(), &cell, &shutdown).unwrap();

        assert_eq!(req.path(), "café bar");
        assert_eq!(req.query_string(), "x=%20y");
        assert_eq!(req.header("Host"), Some("example.com"));
        assert_eq!(req.header("HTTP_X_DUP"), Some("second"));
        assert_eq!(req.content_type(), Some("text/plain"));
        assert_eq!(req.content_length(), Some(0));
        assert_eq!(req.header("Content-Type"), None);
        assert_eq!(req.header("Content-Length"), None);
        assert_eq!(req.server_port(), 5000);
        assert_eq!(req.protocol(), "HTTP/1.1");

        let env = req.environ();
        assert_eq!(env["REQUEST_METHOD"], "GET");
        assert_eq!(env["CONTENT_LENGTH"], "0");
        assert_eq!(env["REMOTE_ADDR"], "127.0.0.1");
    }

    #[test]
    fn absolute_target_overrides_host() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(Vec::new()))));
        let shutdown = Cell::new(false);
        let h = head("http://localhost:5000/index.htm?a=1", &[("Host", "ignored")]);
        let req = Request::from_head(&h, &info(), &cell, &shutdown).unwrap();
        assert_eq!(req.header("Host"), Some("localhost:5000"));
        assert_eq!(req.path(), "/index.htm");
        assert_eq!(req.query_string(), "a=1");

        // Authority and path reach the app as sent.
        let h = head("http://Example.COM:80/a/../b", &[("Host", "other")]);
        let req = Request::from_head(&h, &info(), &cell, &shutdown).unwrap();
        assert_eq!(req.header("Host"), Some("Example.COM:80"));
        assert_eq!(req.path(), "/a/../b");
        assert_eq!(req.query_string(), "");
    }

    #[test]
    fn rejects_bad_framing() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(Vec::new()))));
        let shutdown = Cell::new(false);

        let h = head("/", &[("Content-Length", "ten")]);
        let err = Request::from_head(&h, &info(), &cell, &shutdown).unwrap_err();
        assert_eq!(err.status(), Some(400));

        let h = head("/", &[("Content-Length", "+5")]);
        assert!(Request::from_head(&h, &info(), &cell, &shutdown).is_err());

        let h = head("/", &[("Transfer-Encoding", "chunked")]);
        let err = Request::from_head(&h, &info(), &cell, &shutdown).unwrap_err();
        assert_eq!(err.status(), Some(411));
    }

    #[test]
    fn body_is_bounded_by_content_length() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(b"helloNEXT".to_vec()))));
        let shutdown = Cell::new(false);
        let h = head("/", &[("Content-Length", "5")]);
        let mut req = Request::from_head(&h, &info(), &cell, &shutdown).unwrap();

        let mut body = String::new();
        req.body().read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello");
        assert_eq!(req.body().remaining(), 0);
        drop(req);

        let mut rest = String::new();
        cell.borrow_mut().read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[test]
    fn drain_discards_unread_body() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(b"abcdef".to_vec()))));
        let shutdown = Cell::new(false);
        let h = head("/", &[("Content-Length", "4")]);
        let mut req = Request::from_head(&h, &info(), &cell, &shutdown).unwrap();
        assert_eq!(req.body().drain().unwrap(), 4);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(b"ab".to_vec()))));
        let shutdown = Cell::new(false);
        let h = head("/", &[("Content-Length", "10")]);
        let mut req = Request::from_head(&h, &info(), &cell, &shutdown).unwrap();
        let mut buf = Vec::new();
        let err = req.body().read_to_end(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn shutdown_hook_sets_the_flag() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(Vec::new()))));
        let shutdown = Cell::new(false);
        let req = Request::from_head(&head("/", &[]), &info(), &cell, &shutdown).unwrap();
        req.shutdown_server();
        assert!(shutdown.get());
    }

    #[test]
    fn connection_close_is_detected() {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(Vec::new()))));
        let shutdown = Cell::new(false);
        let h = head("/", &[("Connection", "keep-alive, Close")]);
        let req = Request::from_head(&h, &info(), &cell, &shutdown).unwrap();
        assert!(req.wants_close());
    }
}
