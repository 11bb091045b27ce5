//! HTTP/1.x request-head parser.
//!
//! Reads the request line and header block from a [`SharedStream`] and leaves
//! the body untouched. Limits are fixed: a request line of at most 64 KiB,
//! at most 100 header lines (folded continuation lines included), each at
//! most 64 KiB.

use std::io;

use thiserror::Error;

use crate::http::stream::{read_line, Line, SharedStream};

pub const MAX_LINE: usize = 65_536;
pub const MAX_HEADERS: usize = 100;

/// Why a request head could not be parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The peer closed before sending a request line.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("request line too long")]
    UriTooLong,

    #[error("too many headers or header line too long")]
    HeadersTooLarge,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unsupported HTTP version {0}")]
    VersionNotSupported(String),

    /// Chunked request bodies are not accepted.
    #[error("request body without Content-Length")]
    LengthRequired,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ParseError {
    /// Status code of the error response, if one should be sent.
    pub fn status(&self) -> Option<u16> {
        match self {
            ParseError::ConnectionClosed | ParseError::Io(_) => None,
            ParseError::UriTooLong => Some(414),
            ParseError::HeadersTooLarge => Some(431),
            ParseError::BadRequest(_) => Some(400),
            ParseError::VersionNotSupported(_) => Some(505),
            ParseError::LengthRequired => Some(411),
        }
    }
}

/// A parsed request line plus raw headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: http::Version,
    /// Headers in arrival order, names as sent.
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Last value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// HTTP/1.1 or later.
    pub fn is_http11(&self) -> bool {
        self.version == http::Version::HTTP_11
    }
}

/// Read one request head off the stream.
pub fn parse_head(stream: SharedStream<'_>) -> Result<RequestHead, ParseError> {
    let line = loop {
        match read_line(stream, MAX_LINE)? {
            Line::Eof => return Err(ParseError::ConnectionClosed),
            Line::TooLong => return Err(ParseError::UriTooLong),
            Line::Complete(line) => {
                let line = trim_eol(&line);
                // Stray CRLFs between pipelined requests are tolerated.
                if !line.is_empty() {
                    break String::from_utf8_lossy(line).into_owned();
                }
            }
        }
    };

    let (method, target, version) = parse_request_line(&line)?;
    let headers = parse_headers(stream)?;

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

fn parse_request_line(line: &str) -> Result<(String, String, http::Version), ParseError> {
    let mut parts = line.split_ascii_whitespace();
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => {
            return Err(ParseError::BadRequest(format!(
                "malformed request line {:?}",
                line
            )))
        }
    };

    if http::Method::from_bytes(method.as_bytes()).is_err() {
        return Err(ParseError::BadRequest(format!("bad method {:?}", method)));
    }

    let version = match version {
        "HTTP/1.0" => http::Version::HTTP_10,
        "HTTP/1.1" => http::Version::HTTP_11,
        other => {
            let numbers = other
                .strip_prefix("HTTP/")
                .and_then(|v| v.split_once('.'))
                .filter(|(major, minor)| {
                    !major.is_empty()
                        && !minor.is_empty()
                        && major.bytes().all(|b| b.is_ascii_digit())
                        && minor.bytes().all(|b| b.is_ascii_digit())
                });
            match numbers {
                // Any other 1.x minor is served as 1.1.
                Some(("1", _)) => http::Version::HTTP_11,
                Some(_) => return Err(ParseError::VersionNotSupported(other.to_string())),
                None => return Err(ParseError::BadRequest(format!("bad version {:?}", other))),
            }
        }
    };

    Ok((method.to_string(), target.to_string(), version))
}

fn parse_headers(stream: SharedStream<'_>) -> Result<Vec<(String, String)>, ParseError> {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut lines = 0;
    loop {
        let line = match read_line(stream, MAX_LINE)? {
            Line::Eof => {
                return Err(ParseError::BadRequest(
                    "connection closed inside the header block".into(),
                ))
            }
            Line::TooLong => return Err(ParseError::HeadersTooLarge),
            Line::Complete(line) => line,
        };
        let line = trim_eol(&line);
        if line.is_empty() {
            return Ok(headers);
        }
        if lines == MAX_HEADERS {
            return Err(ParseError::HeadersTooLarge);
        }
        lines += 1;

        if line[0] == b' ' || line[0] == b'\t' {
            let (_, value) = headers.last_mut().ok_or_else(|| {
                ParseError::BadRequest("continuation line before any header".into())
            })?;
            let folded = String::from_utf8_lossy(line);
            value.push(' ');
            value.push_str(folded.trim());
            continue;
        }

        let text = String::from_utf8_lossy(line);
        let (name, value) = text
            .split_once(':')
            .ok_or_else(|| ParseError::BadRequest(format!("header line without colon {:?}", text)))?;
        if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::BadRequest(format!("bad header name {:?}", name)));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stream::Buffered;
    use std::cell::RefCell;
    use std::io::{Cursor, Read, Write};

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

    fn parse(raw: &[u8]) -> Result<RequestHead, ParseError> {
        let cell = RefCell::new(Buffered::new(Input(Cursor::new(raw.to_vec()))));
        parse_head(&cell)
    }

    #[test]
    fn parses_a_simple_request() {
        let head = parse(b"GET /a?b=c HTTP/1.1\r\nHost: example\r\nX-Y:  z \r\n\r\n").unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/a?b=c");
        assert!(head.is_http11());
        assert_eq!(head.header("host"), Some("example"));
        assert_eq!(head.header("x-y"), Some("z"));
    }

    #[test]
    fn skips_leading_blank_lines_and_accepts_bare_lf() {
        let head = parse(b"\r\n\nPOST / HTTP/1.0\nA: b\n\n").unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.version, http::Version::HTTP_10);
        assert_eq!(head.header("a"), Some("b"));
    }

    #[test]
    fn folds_continuation_lines() {
        let head = parse(b"GET / HTTP/1.1\r\nX-Long: one\r\n  two\r\n\ttwo-b\r\n\r\n").unwrap();
        assert_eq!(head.header("x-long"), Some("one two two-b"));
    }

    #[test]
    fn eof_before_anything_is_connection_closed() {
        assert!(matches!(parse(b""), Err(ParseError::ConnectionClosed)));
    }

    #[test]
    fn maps_malformed_input_to_status_codes() {
        fn status(raw: &[u8]) -> Option<u16> {
            parse(raw).unwrap_err().status()
        }

        assert_eq!(status(b"GARBAGE\r\n\r\n"), Some(400));
        assert_eq!(status(b"GET / HTTP/2.0\r\n\r\n"), Some(505));
        assert_eq!(status(b"GET / FTP/1.0\r\n\r\n"), Some(400));
        assert_eq!(status(b"GET / HTTP/1.1\r\nNoColon\r\n\r\n"), Some(400));
        assert_eq!(status(b"GET / HTTP/1.1\r\nBad Name: x\r\n\r\n"), Some(400));
        assert_eq!(status(b"GET / HTTP/1.1\r\n folded-first\r\n\r\n"), Some(400));
        assert_eq!(status(b"GET / HTTP/1.1\r\nHost: x\r\n"), Some(400));
    }

    #[test]
    fn later_minor_versions_are_served_as_http11() {
        let head = parse(b"GET / HTTP/1.2\r\n\r\n").unwrap();
        assert_eq!(head.version, http::Version::HTTP_11);
    }

    #[test]
    fn enforces_size_limits() {
        let mut long_line = b"GET /".to_vec();
        long_line.extend(std::iter::repeat(b'a').take(MAX_LINE));
        long_line.extend_from_slice(b" HTTP/1.1\r\n\r\n");
        assert_eq!(parse(&long_line).unwrap_err().status(), Some(414));

        let mut many = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            many.extend_from_slice(format!("X-{}: v\r\n", i).as_bytes());
        }
        many.extend_from_slice(b"\r\n");
        assert_eq!(parse(&many).unwrap_err().status(), Some(431));
    }

    #[test]
    fn folded_lines_count_against_the_header_limit() {
        let mut folded = b"GET / HTTP/1.1\r\nX-A: start\r\n".to_vec();
        let chunk = "b".repeat(1024);
        for _ in 0..MAX_HEADERS {
            folded.extend_from_slice(format!(" {}\r\n", chunk).as_bytes());
        }
        folded.extend_from_slice(b"\r\n");
        assert!(matches!(parse(&folded), Err(ParseError::HeadersTooLarge)));

        let mut within = b"GET / HTTP/1.1\r\nX-A: start\r\n".to_vec();
        for _ in 1..MAX_HEADERS {
            within.extend_from_slice(b" more\r\n");
        }
        within.extend_from_slice(b"\r\n");
        let head = parse(&within).unwrap();
        assert_eq!(head.header("x-a").unwrap().len(), "start".len() + 5 * (MAX_HEADERS - 1));
    }
}
