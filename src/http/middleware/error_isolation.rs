//! Turning app failures into error responses.
//!
//! # Responsibilities
//! - Run the wrapped app to completion (call, body iteration, writes) with
//!   panics caught
//! - Replace a not-yet-sent response with a complete 500 page
//! - Mark the connection for closing when the failure comes mid-stream
//! - Hand the original failure back to the caller for logging
//!
//! # Design Decisions
//! - A failure after the head is on the wire cannot be reported in-band;
//!   the truncated response is delimited by closing the connection
//! - Transport failures skip the error page (nobody is listening)

use std::panic::{self, AssertUnwindSafe};

use crate::app::{self, App, AppError, Body};
use crate::http::request::Request;
use crate::http::response::{self, Responder, Start, Status};
use crate::observability::metrics;

const GENERIC_DESCRIPTION: &str = "The server encountered an internal error and was unable to \
     complete your request. Either the server is overloaded or there is an error in the \
     application.";

/// Wraps an app so failures become 500 responses instead of broken connections.
#[derive(Debug, Clone)]
pub struct ErrorIsolation<A> {
    inner: A,
}

impl<A: App> ErrorIsolation<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }
}

impl<A: App> App for ErrorIsolation<A> {
    fn call(
        &self,
        request: &mut Request<'_>,
        responder: &mut Responder<'_>,
    ) -> Result<Body, AppError> {
        isolate(&self.inner, request, responder, |_| GENERIC_DESCRIPTION.to_string())
    }
}

/// Like [`ErrorIsolation`], but the error page shows the failure chain.
///
/// Never expose this to untrusted clients.
#[derive(Debug, Clone)]
pub struct DebugMiddleware<A> {
    inner: A,
}

impl<A: App> DebugMiddleware<A> {
    pub fn new(inner: A) -> Self {
        Self { inner }
    }
}

impl<A: App> App for DebugMiddleware<A> {
    fn call(
        &self,
        request: &mut Request<'_>,
        responder: &mut Responder<'_>,
    ) -> Result<Body, AppError> {
        isolate(&self.inner, request, responder, describe_chain)
    }
}

fn isolate<A: App>(
    inner: &A,
    request: &mut Request<'_>,
    responder: &mut Responder<'_>,
    describe: impl Fn(&AppError) -> String,
) -> Result<Body, AppError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| app::drive(inner, request, responder)));
    let err = match outcome {
        Ok(Ok(())) => return Ok(Body::empty()),
        Ok(Err(err)) => err,
        Err(payload) => AppError::from_panic(payload),
    };
    metrics::record_app_error();

    if err.is_disconnect() {
        tracing::debug!(error = %err, "Client went away while responding");
        responder.close_connection();
        return Err(err);
    }

    if responder.headers_sent() {
        tracing::error!(
            path = %request.path(),
            error = %err,
            "Application failed after headers were sent; closing connection"
        );
        responder.close_connection();
        return Err(err);
    }

    let status = Status::from(500);
    let page = response::error_page(&status, &describe(&err));
    let sent = responder
        .start(Start::error(status, response::html_headers(page.len())))
        .and_then(|responder| responder.write(page.as_bytes()));
    if let Err(send_err) = sent {
        tracing::debug!(error = %send_err, "Failed to send error page");
        responder.close_connection();
    }
    Err(err)
}

fn describe_chain(err: &AppError) -> String {
    let text = match err {
        AppError::Other(inner) => format!("{:#}", inner),
        other => {
            let mut text = other.to_string();
            let mut source = std::error::Error::source(other);
            while let Some(cause) = source {
                text.push_str(": ");
                text.push_str(&cause.to_string());
                source = cause.source();
            }
            text
        }
    };
    format!("<pre>{}</pre>", response::escape_html(&text))
}
