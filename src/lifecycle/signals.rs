//! OS signal handling.
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Handlers are registered eagerly by [`ShutdownSignal::install`], so a
//!   signal arriving before anyone awaits it is not lost
//! - SIGTERM and SIGINT both mean graceful shutdown

use std::io;

/// Pending OS shutdown request (SIGTERM or SIGINT; Ctrl+C elsewhere).
#[derive(Debug)]
pub struct ShutdownSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    /// Register the handlers. Must be called inside a Tokio runtime.
    pub fn install() -> io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sigint: signal(SignalKind::interrupt())?,
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// Wait for the next shutdown signal and return its name.
    pub async fn recv(mut self) -> &'static str {
        #[cfg(unix)]
        {
            let name = tokio::select! {
                _ = self.sigterm.recv() => "SIGTERM",
                _ = self.sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = name, "Received shutdown signal");
            name
        }

        #[cfg(not(unix))]
        {
            let _ = &mut self;
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to wait for Ctrl+C");
                std::future::pending::<()>().await;
            }
            tracing::info!("Received Ctrl+C");
            "CTRL_C"
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn sigterm_is_delivered() {
        let signal = ShutdownSignal::install().unwrap();
        // SAFETY: signalling our own process, with a handler registered above.
        unsafe {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
        let name = tokio::time::timeout(Duration::from_secs(2), signal.recv())
            .await
            .expect("signal not delivered");
        assert_eq!(name, "SIGTERM");
    }
}
