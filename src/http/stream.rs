//! Buffered, shared access to one connection.
//!
//! The request body reads from the connection while the responder writes to
//! it; both hold a shared `&RefCell<dyn Stream>` and borrow it only for the
//! duration of a single read or write.

use std::cell::RefCell;
use std::io::{self, BufRead, BufReader, Read, Write};

/// A buffered, writable byte stream.
pub trait Stream: BufRead + Write {}

impl<T: BufRead + Write + ?Sized> Stream for T {}

/// Shared handle used by [`Request`](crate::http::request::Request) and
/// [`Responder`](crate::http::response::Responder).
pub type SharedStream<'a> = &'a RefCell<dyn Stream + 'a>;

/// Read side buffered, write side passed straight through.
pub struct Buffered<S> {
    inner: BufReader<S>,
}

impl<S: Read + Write> Buffered<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Unwrap the stream. Buffered, unread input is discarded.
    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

impl<S: Read> Read for Buffered<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<S: Read> BufRead for Buffered<S> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.inner.consume(amt)
    }
}

impl<S: Write> Write for Buffered<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.get_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.get_mut().flush()
    }
}

/// Outcome of reading one CRLF/LF-terminated line.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// Line including its terminator.
    Complete(Vec<u8>),
    /// The limit was hit before a terminator.
    TooLong,
    /// Peer closed before sending anything.
    Eof,
}

/// Read one line of at most `limit` bytes (terminator included).
pub fn read_line(stream: SharedStream<'_>, limit: usize) -> io::Result<Line> {
    let mut guard = stream.borrow_mut();
    let mut buf = Vec::new();
    let mut limited = Read::take(&mut *guard, limit as u64 + 1);
    let n = limited.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(Line::Eof);
    }
    if buf.len() > limit {
        return Ok(Line::TooLong);
    }
    Ok(Line::Complete(buf))
}
