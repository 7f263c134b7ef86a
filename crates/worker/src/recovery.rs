//! Startup recovery.
//!
//! Rebuilds the in-memory queues from the job store: every `queueing` or
//! `retrying` row of a registered task is normalized to `queueing` and
//! pushed exactly once, then each task's summary is recounted.

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use taskwerk_core::{Filter, JobStatus, JobUpdate, SummaryUpdate};
use taskwerk_storage::{recount_summary, stream_jobs, transition_job};

use crate::engine::{Engine, Shared};
use crate::error::WorkerError;
use crate::metrics::EngineState;

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Pending rows visited.
    pub scanned: usize,
    /// Rows moved from `retrying` to `queueing`.
    pub normalized: usize,
    /// Job references pushed to the queue.
    pub requeued: usize,
    /// Set when a page fetch failed and the scan stopped early.
    pub interrupted: bool,
}

impl Engine {
    /// Replay pending jobs into the queues and mark the engine ready.
    ///
    /// Only valid before [`serve`](Engine::serve): recovery rebuilds the
    /// queues from scratch, which would strand jobs an active dispatch loop
    /// is claiming. [`serve`](Engine::serve) runs it on its own.
    ///
    /// Idempotent: queues are cleared first, so running it again pushes each
    /// pending job once more, never twice. Per-job errors are logged and
    /// skipped.
    pub async fn recover(&self) -> Result<RecoveryReport, WorkerError> {
        // Held for the whole pass so `serve` cannot start underneath it.
        let wakes = self.wake_rx.lock().await;
        if wakes.is_none() {
            return Err(WorkerError::AlreadyServing);
        }
        if self.shared.is_draining() {
            return Err(WorkerError::ShuttingDown);
        }
        Ok(recover(&self.shared).await)
    }
}

pub(crate) async fn recover(shared: &Shared) -> RecoveryReport {
    let mut report = RecoveryReport::default();
    let registry = &shared.registry;

    if registry.is_empty() {
        warn!(worker = %shared.name, "no tasks registered; skipping recovery");
        shared.advance_state(EngineState::Running);
        return report;
    }

    let _gate = shared.recovery_gate.write().await;
    let store = shared.store.as_ref();

    for task in registry.tasks() {
        if let Err(e) = shared.queue.clear(&task.name).await {
            warn!(task = %task.name, error = %e, "failed to clear stale queue");
        }
        if let Err(e) = store
            .summary()
            .update_summary(&task.name, &SummaryUpdate::loading(false))
            .await
        {
            warn!(task = %task.name, error = %e, "failed to reset loading flag");
        }
    }

    let filter = Filter::default()
        .tasks(registry.names())
        .statuses(&JobStatus::PENDING)
        .limit(shared.recovery_page_size);
    let mut jobs = stream_jobs(store, filter);

    while let Some(next) = jobs.next().await {
        let job = match next {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, scanned = report.scanned, "recovery scan interrupted");
                report.interrupted = true;
                break;
            }
        };
        report.scanned += 1;

        let Some(task) = registry.get(&job.task_name) else {
            continue;
        };

        if job.status != JobStatus::Queueing {
            match transition_job(store, &job, job.status, JobUpdate::status(JobStatus::Queueing)).await {
                Ok(affected) => report.normalized += affected as usize,
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to normalize job status"),
            }
        }

        match shared.queue.push(&task.name, job.id).await {
            Ok(()) => report.requeued += 1,
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to re-enqueue job"),
        }
    }
    drop(jobs);

    for task in registry.tasks() {
        match recount_summary(store, &task.name).await {
            Ok(counts) => debug!(task = %task.name, total = counts.total(), "summary recounted"),
            Err(e) => warn!(task = %task.name, error = %e, "failed to recount summary"),
        }
        shared.signal(task.slot);
    }

    shared.advance_state(EngineState::Running);
    info!(
        worker = %shared.name,
        scanned = report.scanned,
        normalized = report.normalized,
        requeued = report.requeued,
        interrupted = report.interrupted,
        "recovery complete"
    );
    report
}
