//! Source reloading.
//!
//! # Data Flow
//! ```text
//! launcher (reloader enabled, not itself a worker)
//!     → supervisor.rs: spawn worker (same executable, DEVSERVER_RUN_MAIN=true)
//!     → every interval: watch.rs re-stats the watched files
//!         → change: SIGTERM the worker's process group, respawn
//!     → shutdown signal: stop the group, return
//! ```

pub mod process;
pub mod supervisor;
pub mod watch;

pub use process::{
    is_running_from_reloader, ChildProcess, CommandSpawner, Spawner, WorkerExit, WorkerProcess,
    RUN_MAIN_ENV,
};
pub use supervisor::{ReloadError, Sleep, Supervisor, SupervisorExit, TokioSleep};
pub use watch::{Change, MtimeSnapshot, WatchSet};
