//! Job store and summary store contracts.
//!
//! The job store is the system of record for job rows and per-task summary
//! counters. Backends must make `update_job` a row-level conditional write
//! (the returned `affected` count is what callers use to adjust summaries)
//! and `increment_summary` an atomic read-modify-write.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use tracing::debug;
use uuid::Uuid;

use taskwerk_core::{
    Filter, Job, JobStatus, JobUpdate, NewJob, SummaryDelta, SummaryUpdate, TaskSummary,
    UpdateOutcome,
};

use crate::error::StorageError;

// ── Traits ───────────────────────────────────────────────────────────

/// Persistent job rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `queueing` status and return the stored row.
    async fn create_job(&self, new: NewJob) -> Result<Job, StorageError>;

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StorageError>;

    /// Apply `update` to every row matching `filter` (pagination ignored).
    async fn update_job(
        &self,
        filter: &Filter,
        update: &JobUpdate,
    ) -> Result<UpdateOutcome, StorageError>;

    /// One page of matching rows, oldest first.
    async fn list_jobs(&self, filter: &Filter) -> Result<Vec<Job>, StorageError>;

    /// Number of matching rows (pagination ignored).
    async fn count_jobs(&self, filter: &Filter) -> Result<u64, StorageError>;

    fn summary(&self) -> &dyn SummaryStore;
}

/// Per-task aggregate counters.
#[async_trait]
pub trait SummaryStore: Send + Sync {
    async fn find_summary(&self, task_name: &str) -> Result<Option<TaskSummary>, StorageError>;

    async fn all_summaries(&self) -> Result<Vec<TaskSummary>, StorageError>;

    /// Atomically add every delta to the task's counters.
    async fn increment_summary(
        &self,
        task_name: &str,
        deltas: &[SummaryDelta],
    ) -> Result<(), StorageError>;

    async fn update_summary(
        &self,
        task_name: &str,
        update: &SummaryUpdate,
    ) -> Result<(), StorageError>;

    /// Overwrite the task's counters with a recount.
    async fn replace_counts(
        &self,
        task_name: &str,
        counts: &TaskSummary,
    ) -> Result<(), StorageError>;
}

#[async_trait]
impl<T: JobStore + ?Sized> JobStore for Arc<T> {
    async fn create_job(&self, new: NewJob) -> Result<Job, StorageError> {
        (**self).create_job(new).await
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        (**self).find_job(id).await
    }

    async fn update_job(
        &self,
        filter: &Filter,
        update: &JobUpdate,
    ) -> Result<UpdateOutcome, StorageError> {
        (**self).update_job(filter, update).await
    }

    async fn list_jobs(&self, filter: &Filter) -> Result<Vec<Job>, StorageError> {
        (**self).list_jobs(filter).await
    }

    async fn count_jobs(&self, filter: &Filter) -> Result<u64, StorageError> {
        (**self).count_jobs(filter).await
    }

    fn summary(&self) -> &dyn SummaryStore {
        (**self).summary()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Lazily page through every job matching `filter`.
///
/// Pages are fetched on demand starting at `filter.page`, so a consumer can
/// resume an interrupted scan by passing the page it stopped at. The stream
/// ends after the first page shorter than `filter.limit`, and yields the
/// store error (then ends) if a page fetch fails.
pub fn stream_jobs<'a>(
    store: &'a dyn JobStore,
    filter: Filter,
) -> BoxStream<'a, Result<Job, StorageError>> {
    let limit = filter.limit.max(1);
    let first = Filter { limit, ..filter };

    stream::try_unfold(Some(first), move |next| async move {
        let Some(filter) = next else {
            return Ok::<_, StorageError>(None);
        };
        let page = store.list_jobs(&filter).await?;
        debug!(page = filter.page, rows = page.len(), "fetched job page");

        let following = (page.len() == filter.limit).then(|| Filter {
            page: filter.page + 1,
            ..filter.clone()
        });
        Ok(Some((stream::iter(page.into_iter().map(Ok)), following)))
    })
    .try_flatten()
    .boxed()
}

/// Rebuild one task's counters from the job rows.
pub async fn recount_summary(
    store: &dyn JobStore,
    task_name: &str,
) -> Result<TaskSummary, StorageError> {
    let mut counts = TaskSummary::new(task_name);
    for status in JobStatus::ALL {
        let filter = Filter::default().task(task_name).status(status);
        counts.set(status, store.count_jobs(&filter).await? as i64);
    }
    store.summary().replace_counts(task_name, &counts).await?;
    Ok(counts)
}

/// Move one job between statuses with a conditional update and adjust the
/// summary by the rows actually affected.
///
/// Returns the affected row count: `0` means the job was no longer in
/// `from` (another writer got there first) and nothing was changed.
pub async fn transition_job(
    store: &dyn JobStore,
    job: &Job,
    from: JobStatus,
    update: JobUpdate,
) -> Result<u64, StorageError> {
    let to = update.status.unwrap_or(from);
    let filter = Filter::job(job.id).status(from);
    let outcome = store.update_job(&filter, &update).await?;

    if outcome.affected > 0 && from != to {
        store
            .summary()
            .increment_summary(
                &job.task_name,
                &taskwerk_core::transition_deltas(from, to, outcome.affected),
            )
            .await?;
    }
    Ok(outcome.affected)
}
