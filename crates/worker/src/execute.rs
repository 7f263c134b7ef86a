//! One execution unit: admit, pop, claim, run the handler, record the outcome.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use taskwerk_core::{Job, JobStatus, JobUpdate};
use taskwerk_storage::{transition_job, StorageError};

use crate::config::ShutdownMode;
use crate::engine::Shared;
use crate::error::TaskError;
use crate::handler::JobContext;
use crate::registry::Task;

/// How long a job whose lock is held elsewhere waits before it is queued again.
const LOCKED_REQUEUE_DELAY: Duration = Duration::from_millis(50);

pub(crate) async fn run(shared: Arc<Shared>, slot: usize) {
    let Some(task) = shared.registry.slot(slot) else {
        return;
    };
    let Some(admission) = task.limiter.try_admit() else {
        trace!(task = %task.name, "no free slot");
        return;
    };

    let job_id = match shared.queue.pop(&task.name).await {
        Ok(Some(id)) => id,
        Ok(None) => return,
        Err(e) => {
            warn!(task = %task.name, error = %e, "failed to pop job");
            return;
        }
    };
    // More may be queued; let another unit try the next free slot.
    shared.signal(slot);

    let key = shared.lock_key(job_id);
    match shared.locker.try_lock(&key).await {
        Ok(true) => {
            if let Err(e) = execute(&shared, task, job_id).await {
                error!(job_id = %job_id, task = %task.name, error = %e, "job bookkeeping failed");
            }
            if let Err(e) = shared.locker.unlock(&key).await {
                warn!(job_id = %job_id, error = %e, "failed to release job lock");
            }
        }
        Ok(false) => {
            debug!(job_id = %job_id, "job is locked elsewhere; queueing it again");
            requeue_locked(&shared, slot, job_id);
        }
        Err(e) => warn!(job_id = %job_id, error = %e, "failed to lock job; leaving it for recovery"),
    }

    drop(admission);
    if !shared.is_draining() {
        shared.signal(slot);
    }
}

async fn execute(shared: &Arc<Shared>, task: &Task, job_id: Uuid) -> Result<(), StorageError> {
    let store = shared.store.as_ref();
    let Some(mut job) = store.find_job(job_id).await? else {
        warn!(job_id = %job_id, task = %task.name, "queued job is missing from the store");
        return Ok(());
    };
    if !job.status.is_pending() {
        debug!(job_id = %job_id, status = %job.status, "job is no longer pending; skipping");
        return Ok(());
    }

    let claim = JobUpdate::status(JobStatus::Running);
    if transition_job(store, &job, job.status, claim.clone()).await? == 0 {
        debug!(job_id = %job_id, "job was claimed elsewhere");
        return Ok(());
    }
    job.apply(&claim);

    let cancel = shared.lifetime.child_token();
    shared.track_running(job.id, cancel.clone());
    let ctx = JobContext {
        job: job.clone(),
        attempt: job.retry_count + 1,
        cancel,
    };

    debug!(job_id = %job.id, task = %task.name, attempt = ctx.attempt, "job started");
    let started = Instant::now();
    let result = invoke(task, ctx).await;
    shared.untrack_running(job.id);

    finish(shared, task, &job, result, started.elapsed()).await
}

async fn invoke(task: &Task, ctx: JobContext) -> Result<(), TaskError> {
    let call = AssertUnwindSafe(task.handler.handle(ctx)).catch_unwind();
    let outcome = match task.options.timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => return Err(TaskError::Timeout(limit)),
        },
        None => call.await,
    };
    outcome.unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(&*panic))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn finish(
    shared: &Arc<Shared>,
    task: &Task,
    job: &Job,
    result: Result<(), TaskError>,
    elapsed: Duration,
) -> Result<(), StorageError> {
    let store = shared.store.as_ref();
    let elapsed_ms = elapsed.as_millis() as u64;

    match result {
        Ok(()) => {
            let update = JobUpdate::status(JobStatus::Success)
                .error(None)
                .finished_at(Some(Utc::now()));
            if transition_job(store, job, JobStatus::Running, update).await? == 0 {
                info!(job_id = %job.id, "job was stopped while running; result discarded");
                return Ok(());
            }
            info!(job_id = %job.id, task = %task.name, elapsed_ms, "job succeeded");
        }
        Err(err) if err.is_retryable() && job.has_retry_budget() => {
            let retry_count = job.retry_count + 1;
            let update = JobUpdate::status(JobStatus::Retrying)
                .retry_count(retry_count)
                .error(Some(err.to_string()));
            if transition_job(store, job, JobStatus::Running, update).await? == 0 {
                info!(job_id = %job.id, "job was stopped while running; retry dropped");
                return Ok(());
            }
            let delay = err
                .retry_delay()
                .unwrap_or_else(|| shared.retry.delay_for(retry_count));
            warn!(
                job_id = %job.id,
                task = %task.name,
                retry = retry_count,
                max_retry = job.max_retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "job failed; retrying"
            );
            schedule_retry(shared, task.slot, job.id, retry_count, delay);
        }
        Err(err) => {
            let update = JobUpdate::status(JobStatus::Failure)
                .error(Some(err.to_string()))
                .finished_at(Some(Utc::now()));
            if transition_job(store, job, JobStatus::Running, update).await? == 0 {
                info!(job_id = %job.id, "job was stopped while running; failure discarded");
                return Ok(());
            }
            error!(
                job_id = %job.id,
                task = %task.name,
                retry_count = job.retry_count,
                elapsed_ms,
                error = %err,
                "job failed"
            );
        }
    }
    Ok(())
}

// ── Retries ──────────────────────────────────────────────────────────

/// Push a `retrying` job back after `delay`. The wait is tracked so a drain
/// cuts it short instead of waiting it out.
fn schedule_retry(
    shared: &Arc<Shared>,
    slot: usize,
    job_id: Uuid,
    retry_count: u32,
    delay: Duration,
) {
    defer(shared, slot, job_id, delay, move |job: &Job| {
        job.status == JobStatus::Retrying && job.retry_count == retry_count
    });
}

/// The lock holder may still be finishing an earlier run of the same job
/// (stopped, then retried). Hand the reference back instead of dropping it.
fn requeue_locked(shared: &Arc<Shared>, slot: usize, job_id: Uuid) {
    defer(shared, slot, job_id, LOCKED_REQUEUE_DELAY, |job: &Job| job.status.is_pending());
}

/// After `delay`, push the job again if `still_due` holds for its stored row.
fn defer<F>(shared: &Arc<Shared>, slot: usize, job_id: Uuid, delay: Duration, still_due: F)
where
    F: Fn(&Job) -> bool + Send + 'static,
{
    let shared = Arc::clone(shared);
    let tracker = shared.tracker.clone();
    tracker.spawn(async move {
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shared.draining.cancelled() => {}
            }
        }
        if shared.is_draining() {
            park(&shared, job_id).await;
            return;
        }
        match shared.store.find_job(job_id).await {
            Ok(Some(job)) if still_due(&job) => requeue(&shared, slot, job_id).await,
            Ok(_) => debug!(job_id = %job_id, "job changed while waiting; not re-enqueued"),
            Err(e) => warn!(job_id = %job_id, error = %e, "failed to load job; leaving it for recovery"),
        }
    });
}

async fn requeue(shared: &Shared, slot: usize, job_id: Uuid) {
    let Some(task) = shared.registry.slot(slot) else {
        return;
    };
    let _gate = shared.recovery_gate.read().await;
    match shared.queue.push(&task.name, job_id).await {
        Ok(()) => shared.signal(slot),
        Err(e) => warn!(job_id = %job_id, error = %e, "failed to re-enqueue job; leaving it for recovery"),
    }
}

/// A job that comes due during a drain is never pushed.
async fn park(shared: &Shared, job_id: Uuid) {
    match shared.shutdown_mode {
        ShutdownMode::Requeue => {
            debug!(job_id = %job_id, "drain in progress; job left pending for recovery");
        }
        ShutdownMode::Stop => {
            if let Err(e) = stop_pending(shared, job_id).await {
                warn!(job_id = %job_id, error = %e, "failed to stop job during drain");
            }
        }
    }
}

/// Move a pending job to `stopped`. Returns `false` if it was no longer pending.
pub(crate) async fn stop_pending(shared: &Shared, job_id: Uuid) -> Result<bool, StorageError> {
    let store = shared.store.as_ref();
    let Some(job) = store.find_job(job_id).await? else {
        return Ok(false);
    };
    if !job.status.is_pending() {
        return Ok(false);
    }
    let update = JobUpdate::status(JobStatus::Stopped).finished_at(Some(Utc::now()));
    Ok(transition_job(store, &job, job.status, update).await? > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_str_and_string() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "unknown panic");
    }
}
