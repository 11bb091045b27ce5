//! Development HTTP server for synchronous request/response apps.
//!
//! Serves an [`App`] over HTTP/1.x (optionally TLS with a throwaway
//! certificate), isolates app failures into 500 pages, and can restart the
//! worker process whenever watched source files change.

pub mod app;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod reload;
pub mod tls;

pub use app::{app_fn, App, AppError, Body, FnApp};
pub use config::{ConcurrencyMode, DevServerConfig, ServerConfig, TlsSource};
pub use http::{
    DebugMiddleware, ErrorIsolation, Request, Responder, ResponseError, Server, Start, Status,
};
pub use lifecycle::{run, RunError};
pub use reload::is_running_from_reloader;
pub use tls::adhoc::{generate_adhoc_pair, AdhocPair};
