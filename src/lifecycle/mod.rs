//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → supervisor (reloader on, not a worker)
//!                     → or bind server and serve
//!
//! Shutdown (shutdown.rs):
//!     App request → ShutdownFlag → accept loop stops → drain → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → graceful shutdown of supervisor or worker
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accepting, drain connections, release TLS files
//! - Draining has a deadline: connections still running are abandoned

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::ShutdownFlag;
pub use signals::ShutdownSignal;
pub use startup::{run, RunError};
