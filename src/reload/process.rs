//! Worker processes.
//!
//! The supervisor only sees the [`Spawner`] and [`WorkerProcess`] traits.
//! Production uses [`CommandSpawner`], which re-runs the current executable
//! with the same arguments in a new process group, so that stopping a
//! worker also stops anything it forked.

use std::ffi::OsString;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Environment marker telling a process it is the supervised worker.
pub const RUN_MAIN_ENV: &str = "DEVSERVER_RUN_MAIN";

/// True inside a worker started by the supervisor.
pub fn is_running_from_reloader() -> bool {
    std::env::var(RUN_MAIN_ENV).is_ok_and(|value| value == "true")
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exited(i32),
    Signaled(i32),
}

impl WorkerExit {
    pub fn success(self) -> bool {
        self == WorkerExit::Exited(0)
    }

    /// Shell-style exit code (`128 + signal` for signal deaths).
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Exited(code) => code,
            WorkerExit::Signaled(signal) => 128 + signal,
        }
    }
}

impl From<ExitStatus> for WorkerExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return WorkerExit::Signaled(signal);
            }
        }
        WorkerExit::Exited(status.code().unwrap_or(1))
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Exited(code) => write!(f, "exit code {}", code),
            WorkerExit::Signaled(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Handle to a running worker.
pub trait WorkerProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Group signalled by `terminate` and `kill`, where groups exist.
    fn process_group_id(&self) -> Option<i32>;

    /// Ask the worker (and its group) to stop. A group that is already gone
    /// is not an error.
    fn terminate(&mut self) -> io::Result<()>;

    /// Stop the worker (and its group) unconditionally.
    fn kill(&mut self) -> io::Result<()>;

    fn wait(&mut self) -> impl Future<Output = io::Result<WorkerExit>> + Send;

    /// Wait at most `timeout`; `None` if the worker is still running.
    fn wait_timeout(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Option<WorkerExit>>> + Send {
        async move {
            match tokio::time::timeout(timeout, self.wait()).await {
                Ok(exit) => exit.map(Some),
                Err(_) => Ok(None),
            }
        }
    }
}

/// Starts workers.
pub trait Spawner: Send {
    type Worker: WorkerProcess;

    fn spawn(&mut self) -> io::Result<Self::Worker>;
}

/// Stop a worker: terminate, wait up to `grace`, then kill.
pub async fn stop<W: WorkerProcess>(worker: &mut W, grace: Duration) -> io::Result<WorkerExit> {
    worker.terminate()?;
    if let Some(exit) = worker.wait_timeout(grace).await? {
        return Ok(exit);
    }
    tracing::warn!(
        pid = worker.id(),
        grace_ms = grace.as_millis() as u64,
        "Worker ignored SIGTERM; killing it"
    );
    worker.kill()?;
    worker.wait().await
}

/// Re-runs an executable with the reloader marker set.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// The running executable with this process's own arguments.
    pub fn current() -> io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            std::env::args_os().skip(1).collect(),
        ))
    }
}

impl Spawner for CommandSpawner {
    type Worker = ChildProcess;

    fn spawn(&mut self) -> io::Result<ChildProcess> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .env(RUN_MAIN_ENV, "true")
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pgid = child.id().map(|pid| pid as i32);
        Ok(ChildProcess { child, pgid })
    }
}

/// A worker started by [`CommandSpawner`].
#[derive(Debug)]
pub struct ChildProcess {
    child: tokio::process::Child,
    pgid: Option<i32>,
}

impl ChildProcess {
    #[cfg(unix)]
    fn signal_group(&mut self, signal: libc::c_int) -> io::Result<()> {
        let Some(pgid) = self.pgid else {
            return Ok(());
        };
        // SAFETY: killpg has no memory-safety preconditions.
        if unsafe { libc::killpg(pgid, signal) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }
}

impl WorkerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn process_group_id(&self) -> Option<i32> {
        self.pgid
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            self.signal_group(libc::SIGKILL)
        }
        #[cfg(not(unix))]
        {
            self.child.start_kill()
        }
    }

    async fn wait(&mut self) -> io::Result<WorkerExit> {
        self.child.wait().await.map(WorkerExit::from)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str) -> CommandSpawner {
        CommandSpawner::new("/bin/sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn exit_codes_are_reported() {
        let mut worker = shell("exit 7").spawn().unwrap();
        assert_eq!(worker.wait().await.unwrap(), WorkerExit::Exited(7));
        assert_eq!(WorkerExit::Exited(7).code(), 7);
    }

    #[tokio::test]
    async fn workers_see_the_marker() {
        let mut worker = shell(&format!("test \"${}\" = true", RUN_MAIN_ENV))
            .spawn()
            .unwrap();
        assert!(worker.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn stop_terminates_the_process_group() {
        let mut worker = shell("sleep 30 & wait").spawn().unwrap();
        assert_eq!(worker.process_group_id(), worker.id().map(|id| id as i32));

        let exit = stop(&mut worker, Duration::from_secs(5)).await.unwrap();
        assert_eq!(exit, WorkerExit::Signaled(libc::SIGTERM));
        assert_eq!(exit.code(), 128 + libc::SIGTERM);

        // Group already gone.
        worker.terminate().unwrap();
    }

    #[tokio::test]
    async fn stop_kills_workers_that_ignore_sigterm() {
        let mut worker = shell("trap '' TERM; while :; do sleep 0.05; done")
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let exit = stop(&mut worker, Duration::from_millis(200)).await.unwrap();
        assert_eq!(exit, WorkerExit::Signaled(libc::SIGKILL));
    }
}
