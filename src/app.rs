//! The application contract.
//!
//! An app receives the parsed [`Request`] and a [`Responder`]. It commits to a
//! status and headers with [`Responder::start`], may write body bytes
//! directly, and returns a [`Body`] whose chunks the server writes afterwards.
//!
//! ```ignore
//! use devserver::{app_fn, Body, Start};
//!
//! let app = app_fn(|_req, res| {
//!     res.start(Start::ok(200, vec![("Content-Length".into(), "5".into())]))?;
//!     Ok(Body::from("hello"))
//! });
//! ```

use std::any::Any;
use std::io;

use bytes::Bytes;
use thiserror::Error;

use crate::http::request::Request;
use crate::http::response::{Responder, ResponseError};

/// A request-handling unit: fixed calling contract, arbitrary behavior.
pub trait App: Send + Sync + 'static {
    fn call(
        &self,
        request: &mut Request<'_>,
        responder: &mut Responder<'_>,
    ) -> Result<Body, AppError>;
}

impl<A: App + ?Sized> App for std::sync::Arc<A> {
    fn call(
        &self,
        request: &mut Request<'_>,
        responder: &mut Responder<'_>,
    ) -> Result<Body, AppError> {
        (**self).call(request, responder)
    }
}

impl<A: App + ?Sized> App for Box<A> {
    fn call(
        &self,
        request: &mut Request<'_>,
        responder: &mut Responder<'_>,
    ) -> Result<Body, AppError> {
        (**self).call(request, responder)
    }
}

/// An [`App`] backed by a closure. Build one with [`app_fn`].
pub struct FnApp<F>(F);

/// Turn a closure into an [`App`].
pub fn app_fn<F>(f: F) -> FnApp<F>
where
    F: Fn(&mut Request<'_>, &mut Responder<'_>) -> Result<Body, AppError> + Send + Sync + 'static,
{
    FnApp(f)
}

impl<F> App for FnApp<F>
where
    F: Fn(&mut Request<'_>, &mut Responder<'_>) -> Result<Body, AppError> + Send + Sync + 'static,
{
    fn call(
        &self,
        request: &mut Request<'_>,
        responder: &mut Responder<'_>,
    ) -> Result<Body, AppError> {
        (self.0)(request, responder)
    }
}

/// Response body: a lazy sequence of byte chunks.
///
/// The sequence may fail part-way; the error is handled like any other app
/// failure, except that the head may already be on the wire.
pub struct Body {
    chunks: Box<dyn Iterator<Item = Result<Bytes, AppError>>>,
}

impl Body {
    pub fn empty() -> Self {
        Self::from_results(std::iter::empty())
    }

    /// Body from infallible chunks.
    pub fn from_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        I::IntoIter: 'static,
        B: Into<Bytes>,
    {
        Self::from_results(chunks.into_iter().map(|chunk| Ok(chunk.into())))
    }

    /// Body from chunks that may fail while streaming.
    pub fn from_results<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Result<Bytes, AppError>>,
        I::IntoIter: 'static,
    {
        Self {
            chunks: Box::new(chunks.into_iter()),
        }
    }
}

impl Iterator for Body {
    type Item = Result<Bytes, AppError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body").finish_non_exhaustive()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::from_chunks([Bytes::from_static(s.as_bytes())])
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::from_chunks([Bytes::from(s)])
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Self::from_chunks([Bytes::from(v)])
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Self::from_chunks([b])
    }
}

/// Failure raised by an app, or by the server while serving its response.
#[derive(Debug, Error)]
pub enum AppError {
    /// The start/write protocol was violated or the transport failed.
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// The app panicked; the payload message is kept.
    #[error("application panicked: {0}")]
    Panicked(String),

    /// Any other application failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Build from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        AppError::Panicked(message)
    }

    /// The peer went away; there is nobody left to send an error page to.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, AppError::Response(ResponseError::Io(_)))
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Other(err.into())
    }
}

/// Run an app to completion: call it, then write every body chunk.
///
/// An empty body still flushes the head once iteration ends, so the response
/// is always terminated.
pub(crate) fn drive<A: App + ?Sized>(
    app: &A,
    request: &mut Request<'_>,
    responder: &mut Responder<'_>,
) -> Result<(), AppError> {
    let body = app.call(request, responder)?;
    for chunk in body {
        responder.write(&chunk?)?;
    }
    if !responder.headers_sent() {
        responder.write(b"")?;
    }
    Ok(())
}
