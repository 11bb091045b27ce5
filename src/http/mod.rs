//! HTTP/1.x serving subsystem.
//!
//! # Data Flow
//! ```text
//! listener (server.rs, async accept)
//!     → per-connection thread or forked child
//!     → [TLS handshake]
//!     → handler.rs (request loop)
//!         → parser.rs → request.rs → middleware → app → response.rs
//! ```

pub mod handler;
pub mod middleware;
pub mod parser;
pub mod request;
pub mod response;
pub mod server;
pub mod stream;

pub use handler::{ConnectionHandler, HandlerError};
pub use middleware::{DebugMiddleware, ErrorIsolation};
pub use request::{ConnectionInfo, Request, RequestBody};
pub use response::{Headers, Responder, ResponseError, Start, Status};
pub use server::{ServeError, Server, StopReason, SHUTDOWN_EXIT_CODE};
