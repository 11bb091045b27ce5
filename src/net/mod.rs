//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind, address family selection)
//!     → tls (optional blocking handshake)
//!     → connection.rs (Transport, lifecycle tracking)
//!     → Hand off to the HTTP connection handler
//! ```

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionState, ConnectionTracker, Transport};
pub use listener::ListenerError;
