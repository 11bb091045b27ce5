//! App wrappers applied by the server.
//!
//! Exactly one wrapper is installed per server: [`ErrorIsolation`] by
//! default, [`DebugMiddleware`] when `server.debug` is set.

pub mod error_isolation;

pub use error_isolation::{DebugMiddleware, ErrorIsolation};
