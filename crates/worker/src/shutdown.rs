//! Graceful drain: `running -> draining -> stopped`.

use tracing::{info, warn};

use crate::config::ShutdownMode;
use crate::engine::{Engine, Shared};
use crate::execute::stop_pending;
use crate::metrics::EngineState;
use crate::registry::Task;

impl Engine {
    /// Stop admitting work and block until every in-flight execution has
    /// finished. Safe to call more than once; later callers wait for the
    /// first drain to complete.
    pub async fn shutdown(&self) {
        shutdown(&self.shared).await
    }
}

pub(crate) async fn shutdown(shared: &Shared) {
    if !shared.advance_state(EngineState::Draining) {
        shared.reached(EngineState::Stopped).await;
        return;
    }
    info!(worker = %shared.name, mode = ?shared.shutdown_mode, "draining task queue worker");

    shared.registry.close_all();
    shared.draining.cancel();

    for task in shared.registry.tasks() {
        match shared.shutdown_mode {
            ShutdownMode::Requeue => {
                if let Err(e) = shared.queue.clear(&task.name).await {
                    warn!(task = %task.name, error = %e, "failed to clear queue");
                }
            }
            ShutdownMode::Stop => stop_queued(shared, task).await,
        }
    }
    shared.signal_refresh();

    let running = shared.registry.running_total();
    if running > 0 {
        info!(running, "waiting for in-flight jobs");
    }
    shared.tracker.close();
    shared.tracker.wait().await;

    shared.lifetime.cancel();
    shared.advance_state(EngineState::Stopped);
    info!(worker = %shared.name, "task queue worker stopped");
}

/// Drain a task's queue, marking every still-pending job `stopped`.
async fn stop_queued(shared: &Shared, task: &Task) {
    let mut stopped = 0usize;
    loop {
        match shared.queue.pop(&task.name).await {
            Ok(Some(job_id)) => match stop_pending(shared, job_id).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(job_id = %job_id, error = %e, "failed to stop queued job"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(task = %task.name, error = %e, "failed to drain queue");
                break;
            }
        }
    }
    if stopped > 0 {
        info!(task = %task.name, stopped, "queued jobs stopped");
    }
}
