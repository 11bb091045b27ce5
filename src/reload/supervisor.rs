//! The reloading supervisor.
//!
//! # Responsibilities
//! - Keep exactly one worker running
//! - Poll the watch set and restart the worker when a file changes
//! - Respawn crashed workers on the next poll
//! - Tear the worker's process group down on shutdown
//!
//! # Design Decisions
//! - All state lives in the [`Supervisor`] value; nothing is global
//! - Time and processes are injected ([`Sleep`], [`Spawner`]) so the loop can
//!   be driven deterministically
//! - The supervisor never binds the server port

use std::future::Future;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ReloaderConfig;
use crate::observability::metrics;
use crate::reload::process::{self, CommandSpawner, Spawner, WorkerExit, WorkerProcess};
use crate::reload::watch::{MtimeSnapshot, WatchSet};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to start worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to stop worker: {0}")]
    Stop(#[source] io::Error),

    #[error("failed to wait for worker: {0}")]
    Wait(#[source] io::Error),
}

/// Why [`Supervisor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The shutdown future resolved and the worker was stopped.
    Shutdown,
    /// The worker exited on its own with this code.
    WorkerExited(i32),
}

/// Suspension between polls.
pub trait Sleep: Send {
    fn sleep(&mut self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// [`Sleep`] on the Tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleep;

impl Sleep for TokioSleep {
    async fn sleep(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Restarts the worker whenever a watched file changes.
pub struct Supervisor<S: Spawner, T: Sleep = TokioSleep> {
    spawner: S,
    sleeper: T,
    watch: WatchSet,
    snapshot: MtimeSnapshot,
    interval: Duration,
    grace: Duration,
    worker: Option<S::Worker>,
    generation: u64,
}

impl Supervisor<CommandSpawner, TokioSleep> {
    /// Supervisor that re-runs the current executable.
    pub fn from_config(config: &ReloaderConfig) -> io::Result<Self> {
        Ok(Self::new(
            CommandSpawner::current()?,
            TokioSleep,
            WatchSet::from_config(config),
            config,
        ))
    }
}

impl<S: Spawner, T: Sleep> Supervisor<S, T> {
    pub fn new(spawner: S, sleeper: T, watch: WatchSet, config: &ReloaderConfig) -> Self {
        Self {
            spawner,
            sleeper,
            watch,
            snapshot: MtimeSnapshot::default(),
            interval: config.interval(),
            grace: config.grace_period(),
            worker: None,
            generation: 0,
        }
    }

    /// How many workers have been spawned so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Supervise workers until `shutdown` resolves or a worker exits on its own.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<SupervisorExit, ReloadError>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(
            roots = self.watch.roots().len(),
            interval_ms = self.interval.as_millis() as u64,
            "Restarting with reloader"
        );
        self.respawn()?;
        tokio::pin!(shutdown);

        loop {
            let event = {
                let exited = wait_worker(&mut self.worker);
                let tick = self.sleeper.sleep(self.interval);
                tokio::select! {
                    biased;

                    _ = &mut shutdown => Event::Shutdown,
                    exit = exited => Event::Exited(exit),
                    _ = tick => Event::Tick,
                }
            };

            match event {
                Event::Shutdown => {
                    self.stop_worker().await?;
                    return Ok(SupervisorExit::Shutdown);
                }
                Event::Exited(exit) => {
                    let exit = exit.map_err(ReloadError::Wait)?;
                    self.worker = None;
                    if let Some(outcome) = self.on_worker_exit(exit) {
                        return Ok(outcome);
                    }
                }
                Event::Tick => {
                    if self.worker.is_none() {
                        tracing::info!("Restarting crashed worker");
                        self.retry_respawn();
                    } else if let Some(change) = self.snapshot.detect_change(&self.watch) {
                        tracing::info!(path = %change, "Detected change in {}, reloading", change);
                        metrics::record_reload();
                        self.stop_worker().await?;
                        self.retry_respawn();
                    }
                }
            }
        }
    }

    /// Decide what a worker exit means. `Some` ends supervision.
    fn on_worker_exit(&mut self, exit: WorkerExit) -> Option<SupervisorExit> {
        if exit.success() {
            tracing::info!("Worker exited cleanly; stopping reloader");
            return Some(SupervisorExit::WorkerExited(0));
        }
        if let WorkerExit::Signaled(signal) = exit {
            if is_teardown_signal(signal) {
                tracing::info!(signal, "Worker was stopped externally; stopping reloader");
                return Some(SupervisorExit::WorkerExited(exit.code()));
            }
        }
        tracing::warn!(
            generation = self.generation,
            exit = %exit,
            "Worker crashed; restarting on next poll"
        );
        metrics::record_worker_crash();
        None
    }

    /// Spawn a worker and re-snapshot the watch set in the same step.
    fn respawn(&mut self) -> Result<(), ReloadError> {
        let worker = self.spawner.spawn().map_err(ReloadError::Spawn)?;
        self.generation += 1;
        tracing::debug!(generation = self.generation, pid = worker.id(), "Worker started");
        self.worker = Some(worker);
        self.snapshot = MtimeSnapshot::take(&self.watch);
        Ok(())
    }

    /// Respawn after the first worker. A failure leaves no worker behind and
    /// the next tick tries again; the executable may be mid-rebuild.
    fn retry_respawn(&mut self) {
        if let Err(err) = self.respawn() {
            tracing::warn!(
                generation = self.generation,
                error = %err,
                "Failed to start worker; retrying on next poll"
            );
        }
    }

    async fn stop_worker(&mut self) -> Result<(), ReloadError> {
        let Some(mut worker) = self.worker.take() else {
            return Ok(());
        };
        let exit = process::stop(&mut worker, self.grace)
            .await
            .map_err(ReloadError::Stop)?;
        tracing::debug!(generation = self.generation, exit = %exit, "Worker stopped");
        Ok(())
    }
}

impl<S: Spawner, T: Sleep> std::fmt::Debug for Supervisor<S, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("generation", &self.generation)
            .field("interval", &self.interval)
            .field("watched_files", &self.snapshot.len())
            .finish_non_exhaustive()
    }
}

enum Event {
    Shutdown,
    Exited(io::Result<WorkerExit>),
    Tick,
}

async fn wait_worker<W: WorkerProcess>(worker: &mut Option<W>) -> io::Result<WorkerExit> {
    match worker.as_mut() {
        Some(worker) => worker.wait().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn is_teardown_signal(signal: i32) -> bool {
    [libc::SIGTERM, libc::SIGINT, libc::SIGHUP, libc::SIGKILL].contains(&signal)
}

#[cfg(not(unix))]
fn is_teardown_signal(_signal: i32) -> bool {
    false
}
