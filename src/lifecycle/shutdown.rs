//! Shutdown coordination.
//!
//! Two sources can stop a worker: an OS signal (see [`signals`]) and the app
//! itself through `Request::shutdown_server`. The latter is carried by a
//! [`ShutdownFlag`] shared between connection handlers and the accept loop.
//!
//! [`signals`]: crate::lifecycle::signals

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// App-requested server stop, observable from sync and async code.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    raised: AtomicBool,
    notify: Notify,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter. Idempotent.
    pub fn raise(&self) {
        if !self.inner.raised.swap(true, Ordering::SeqCst) {
            tracing::info!("Shutdown requested by application");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Resolve once the flag is raised.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent raise is not missed.
            notified.as_mut().enable();
            if self.is_raised() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_raise_from_another_thread() {
        let flag = ShutdownFlag::new();
        let remote = flag.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.raise();
        });
        tokio::time::timeout(Duration::from_secs(2), flag.wait())
            .await
            .expect("flag was not observed");
        assert!(flag.is_raised());
    }

    #[tokio::test]
    async fn already_raised_flag_resolves_immediately() {
        let flag = ShutdownFlag::new();
        flag.raise();
        flag.raise();
        flag.wait().await;
    }
}
