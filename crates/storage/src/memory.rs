//! In-memory job store.
//!
//! Rows live in an insertion-ordered map so listing is oldest-first without
//! a sort. Every write takes the table lock for its full read-modify-write,
//! which gives the same guarantees a row-locking database would.

use std::collections::HashMap;

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use taskwerk_core::{
    Filter, Job, JobUpdate, NewJob, SummaryDelta, SummaryUpdate, TaskSummary, UpdateOutcome,
};

use crate::error::StorageError;
use crate::store::{JobStore, SummaryStore};

// ── Jobs ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<IndexMap<Uuid, Job>>,
    summaries: MemorySummaryStore,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row as-is, bypassing summary bookkeeping.
    ///
    /// Used to seed a store with rows left behind by a previous process.
    pub async fn insert_raw(&self, job: Job) {
        self.jobs.write().await.insert(job.id, job);
    }

    /// Every stored row, oldest first.
    pub async fn all_jobs(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }
}

/// Whether applying `update` would change anything besides `updated_at`.
fn changes(job: &Job, update: &JobUpdate) -> bool {
    update.status.is_some_and(|s| s != job.status)
        || update.retry_count.is_some_and(|r| r != job.retry_count)
        || update.max_retry.is_some_and(|m| m != job.max_retry)
        || update.error.as_ref().is_some_and(|e| *e != job.error)
        || update.finished_at.is_some_and(|f| f != job.finished_at)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StorageError> {
        let job = Job::from_new(Uuid::new_v4(), new);
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StorageError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update_job(
        &self,
        filter: &Filter,
        update: &JobUpdate,
    ) -> Result<UpdateOutcome, StorageError> {
        let mut jobs = self.jobs.write().await;
        let mut outcome = UpdateOutcome::default();

        let targets: Vec<&mut Job> = match filter.job_id {
            Some(id) => jobs.get_mut(&id).into_iter().collect(),
            None => jobs.values_mut().collect(),
        };
        for job in targets.into_iter().filter(|j| filter.matches(j)) {
            outcome.matched += 1;
            if changes(job, update) {
                job.apply(update);
                outcome.affected += 1;
            }
        }
        Ok(outcome)
    }

    async fn list_jobs(&self, filter: &Filter) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .filter(|j| filter.matches(j))
            .skip(filter.offset())
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn count_jobs(&self, filter: &Filter) -> Result<u64, StorageError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| filter.matches(j)).count() as u64)
    }

    fn summary(&self) -> &dyn SummaryStore {
        &self.summaries
    }
}

// ── Summaries ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemorySummaryStore {
    summaries: Mutex<HashMap<String, TaskSummary>>,
}

#[async_trait]
impl SummaryStore for MemorySummaryStore {
    async fn find_summary(&self, task_name: &str) -> Result<Option<TaskSummary>, StorageError> {
        Ok(self.summaries.lock().await.get(task_name).cloned())
    }

    async fn all_summaries(&self) -> Result<Vec<TaskSummary>, StorageError> {
        let mut all: Vec<_> = self.summaries.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.task_name.cmp(&b.task_name));
        Ok(all)
    }

    async fn increment_summary(
        &self,
        task_name: &str,
        deltas: &[SummaryDelta],
    ) -> Result<(), StorageError> {
        let mut summaries = self.summaries.lock().await;
        let summary = summaries
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSummary::new(task_name));
        for (status, delta) in deltas {
            summary.apply(*status, *delta);
        }
        Ok(())
    }

    async fn update_summary(
        &self,
        task_name: &str,
        update: &SummaryUpdate,
    ) -> Result<(), StorageError> {
        let mut summaries = self.summaries.lock().await;
        let summary = summaries
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSummary::new(task_name));
        if let Some(is_loading) = update.is_loading {
            summary.is_loading = is_loading;
        }
        Ok(())
    }

    async fn replace_counts(
        &self,
        task_name: &str,
        counts: &TaskSummary,
    ) -> Result<(), StorageError> {
        let mut summaries = self.summaries.lock().await;
        summaries
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSummary::new(task_name))
            .copy_counts(counts);
        Ok(())
    }
}
