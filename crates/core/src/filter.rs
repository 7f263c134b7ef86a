//! Job filtering and pagination.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{Job, JobStatus};

/// Default page size for listing jobs.
pub const DEFAULT_PAGE_LIMIT: usize = 10;

/// Criteria for selecting jobs. Unset criteria match everything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub task_names: Vec<String>,
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    /// 1-based page number.
    pub page: usize,
    pub limit: usize,
}

impl Default for Filter {
    fn default() -> Self {
        Self {
            job_id: None,
            task_names: Vec::new(),
            statuses: Vec::new(),
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl Filter {
    /// Filter selecting exactly one job.
    pub fn job(id: Uuid) -> Self {
        Self {
            job_id: Some(id),
            ..Self::default()
        }
    }

    pub fn task(mut self, name: impl Into<String>) -> Self {
        self.task_names.push(name.into());
        self
    }

    pub fn tasks<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task_names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses.extend_from_slice(statuses);
        self
    }

    pub fn page(mut self, page: usize) -> Self {
        self.page = page.max(1);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Number of rows skipped before this page.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.limit
    }

    /// Whether `job` satisfies every set criterion. Pagination is ignored.
    pub fn matches(&self, job: &Job) -> bool {
        if let Some(id) = self.job_id {
            if job.id != id {
                return false;
            }
        }
        if !self.task_names.is_empty() && !self.task_names.iter().any(|t| *t == job.task_name) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&job.status) {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    fn job(task: &str) -> Job {
        Job::from_new(Uuid::new_v4(), NewJob::new(task, serde_json::Value::Null))
    }

    #[test]
    fn empty_filter_matches_all() {
        assert!(Filter::default().matches(&job("a")));
    }

    #[test]
    fn task_and_status_criteria_combine() {
        let filter = Filter::default()
            .tasks(["a", "b"])
            .statuses(&JobStatus::PENDING);

        let mut j = job("b");
        assert!(filter.matches(&j));

        j.status = JobStatus::Success;
        assert!(!filter.matches(&j));

        assert!(!filter.matches(&job("c")));
    }

    #[test]
    fn job_id_filter_is_exact() {
        let j = job("a");
        assert!(Filter::job(j.id).matches(&j));
        assert!(!Filter::job(Uuid::new_v4()).matches(&j));
    }

    #[test]
    fn offset_from_page() {
        assert_eq!(Filter::default().limit(10).offset(), 0);
        assert_eq!(Filter::default().limit(10).page(3).offset(), 20);
        assert_eq!(Filter::default().page(0).page, 1);
    }
}
