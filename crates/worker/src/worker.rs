//! Worker trait and process lifecycle.
//!
//! [`Worker`] is what a host process supervises; [`WorkerRunner`] serves
//! one until SIGINT/SIGTERM (or a programmatic notify) and then drains it
//! under a deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::error::WorkerError;

// ── Worker trait ─────────────────────────────────────────────────────

/// A long-running background worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run until shutdown. Returns once the worker has stopped dispatching.
    async fn serve(&self) -> Result<(), WorkerError>;

    /// Stop admitting work and block until in-flight work has finished.
    async fn shutdown(&self);

    /// Worker kind, as reported to a process supervisor.
    fn name(&self) -> &str;
}

// ── WorkerRunner ─────────────────────────────────────────────────────

/// Runs a [`Worker`] with signal handling and graceful shutdown.
pub struct WorkerRunner;

impl WorkerRunner {
    /// Serve `worker` until a shutdown signal, then drain it.
    ///
    /// A drain that outlives `shutdown_timeout` is abandoned with a warning;
    /// the forced stop itself is left to the process exiting.
    pub async fn run(
        worker: Arc<dyn Worker>,
        shutdown_timeout: Duration,
        shutdown_notify: Option<Arc<Notify>>,
    ) -> Result<(), WorkerError> {
        let name = worker.name().to_string();
        info!(worker = %name, "starting worker");

        let serving = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.serve().await })
        };
        tokio::pin!(serving);

        tokio::select! {
            joined = &mut serving => {
                // Serve ended on its own; nothing left to drain.
                return match joined {
                    Ok(result) => result,
                    Err(e) => {
                        error!(worker = %name, error = %e, "serve task aborted");
                        Ok(())
                    }
                };
            }
            _ = Self::wait_for_shutdown(shutdown_notify) => {
                info!(worker = %name, "shutdown signal received");
            }
        }

        info!(worker = %name, timeout = ?shutdown_timeout, "stopping worker");
        match tokio::time::timeout(shutdown_timeout, worker.shutdown()).await {
            Ok(()) => info!(worker = %name, "worker stopped gracefully"),
            Err(_) => {
                warn!(worker = %name, "worker stop timed out, forcing shutdown");
                serving.abort();
                return Ok(());
            }
        }

        let result = match serving.await {
            Ok(result) => result,
            Err(e) => {
                warn!(worker = %name, error = %e, "serve task did not finish cleanly");
                Ok(())
            }
        };
        info!(worker = %name, "worker shutdown complete");
        result
    }

    /// Wait for either an OS shutdown signal or a programmatic notification.
    async fn wait_for_shutdown(external: Option<Arc<Notify>>) {
        match external {
            Some(notify) => {
                tokio::select! {
                    _ = Self::os_signal() => {}
                    _ = notify.notified() => {}
                }
            }
            None => Self::os_signal().await,
        }
    }

    /// Wait for SIGINT or SIGTERM (Unix) or Ctrl+C elsewhere.
    async fn os_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(mut sigint), Ok(mut sigterm)) => {
                    tokio::select! {
                        _ = sigint.recv() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "failed to register signal handlers");
                    std::future::pending::<()>().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl_c");
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_util::sync::CancellationToken;

    struct MockWorker {
        stop: CancellationToken,
        shut_down: AtomicBool,
        stall: bool,
    }

    impl MockWorker {
        fn new(stall: bool) -> Self {
            Self {
                stop: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                stall,
            }
        }
    }

    #[async_trait]
    impl Worker for MockWorker {
        async fn serve(&self) -> Result<(), WorkerError> {
            self.stop.cancelled().await;
            Ok(())
        }

        async fn shutdown(&self) {
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.shut_down.store(true, Ordering::SeqCst);
            self.stop.cancel();
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    #[tokio::test]
    async fn notify_triggers_graceful_shutdown() {
        let worker = Arc::new(MockWorker::new(false));
        let notify = Arc::new(Notify::new());
        notify.notify_one();

        WorkerRunner::run(worker.clone(), Duration::from_secs(1), Some(notify))
            .await
            .unwrap();
        assert!(worker.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stalled_shutdown_times_out() {
        let worker = Arc::new(MockWorker::new(true));
        let notify = Arc::new(Notify::new());
        notify.notify_one();

        let result =
            WorkerRunner::run(worker.clone(), Duration::from_millis(20), Some(notify)).await;
        assert!(result.is_ok());
        assert!(!worker.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn serve_ending_on_its_own_returns() {
        let worker = Arc::new(MockWorker::new(false));
        worker.stop.cancel();
        WorkerRunner::run(worker, Duration::from_secs(1), None).await.unwrap();
    }
}
