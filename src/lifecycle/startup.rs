//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Decide the process role: reloading supervisor or serving worker
//! - Build the Tokio runtime that fits the role and concurrency mode
//! - Bind the server and serve until a signal or an app-requested stop
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and surfaces as [`RunError`]
//! - The supervisor preflights the port but never keeps it bound
//! - Forked mode runs the accept loop on a current-thread runtime, so the
//!   process is single-threaded when it forks

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::app::App;
use crate::config::validation::validate_config;
use crate::config::{ConcurrencyMode, ConfigError, DevServerConfig};
use crate::http::server::{ServeError, Server};
use crate::lifecycle::signals::ShutdownSignal;
use crate::net::listener::{self, ListenerError};
use crate::observability::metrics::{self, MetricsError};
use crate::reload::{is_running_from_reloader, ReloadError, Supervisor, SupervisorExit};

const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bind(#[from] ListenerError),

    #[error(transparent)]
    Serve(#[from] ServeError),

    #[error(transparent)]
    Reload(#[from] ReloadError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("runtime error: {0}")]
    Io(#[from] io::Error),
}

/// Serve `app` until shutdown and return the process exit code.
///
/// With the reloader enabled, the first process becomes the supervisor and
/// the app is only ever called inside the workers it spawns.
pub fn run<A: App>(app: A, config: &DevServerConfig) -> Result<i32, RunError> {
    validate_config(config).map_err(ConfigError::Validation)?;

    if config.reloader.enabled && !is_running_from_reloader() {
        drop(app);
        return run_supervisor(config);
    }
    run_worker(app, config)
}

fn run_supervisor(config: &DevServerConfig) -> Result<i32, RunError> {
    let server = &config.server;
    listener::ensure_available(&server.host, server.port)?;
    announce(server.scheme(), &server.display_host(), server.port);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async {
        let signal = ShutdownSignal::install()?;
        let mut supervisor = Supervisor::from_config(&config.reloader)?;
        let exit = supervisor
            .run(async {
                signal.recv().await;
            })
            .await?;
        tracing::info!(generations = supervisor.generation(), "Reloader stopped");
        Ok::<_, RunError>(match exit {
            SupervisorExit::Shutdown => 0,
            SupervisorExit::WorkerExited(code) => code,
        })
    });
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

fn run_worker<A: App>(app: A, config: &DevServerConfig) -> Result<i32, RunError> {
    let mut builder = match config.server.concurrency {
        ConcurrencyMode::Forked => tokio::runtime::Builder::new_current_thread(),
        ConcurrencyMode::Sequential | ConcurrencyMode::Threaded => {
            tokio::runtime::Builder::new_multi_thread()
        }
    };
    let runtime = builder.enable_all().build()?;

    let result = runtime.block_on(async {
        if let Some(address) = &config.observability.metrics_address {
            metrics::init(address)?;
        }

        let server = Server::bind(&config.server, app)?;
        if !is_running_from_reloader() {
            announce(
                server.scheme(),
                &config.server.display_host(),
                server.local_addr().port(),
            );
        }

        let signal = ShutdownSignal::install()?;
        let reason = server
            .serve_forever(async {
                signal.recv().await;
            })
            .await?;
        tracing::info!(reason = ?reason, "Shutdown complete");
        Ok::<_, RunError>(0)
    });
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    result
}

fn announce(scheme: &str, host: &str, port: u16) {
    tracing::info!(" * Running on {}://{}:{}/ (Press CTRL+C to quit)", scheme, host, port);
}
