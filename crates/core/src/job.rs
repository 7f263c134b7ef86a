//! Job record and status lifecycle.
//!
//! A [`Job`] is one unit of work belonging to a registered task. The store
//! owns job rows; the engine only ever moves them between [`JobStatus`]
//! values and never deletes them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ── Status ───────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queueing,
    Retrying,
    Running,
    Success,
    Failure,
    Stopped,
}

impl JobStatus {
    /// Every status, in summary column order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queueing,
        JobStatus::Retrying,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failure,
        JobStatus::Stopped,
    ];

    /// Statuses replayed by recovery after a restart.
    pub const PENDING: [JobStatus; 2] = [JobStatus::Queueing, JobStatus::Retrying];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queueing => "queueing",
            JobStatus::Retrying => "retrying",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failure => "failure",
            JobStatus::Stopped => "stopped",
        }
    }

    /// Terminal statuses are never picked up again without an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure | JobStatus::Stopped)
    }

    /// Waiting in a queue (fresh or between attempts).
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStatus::Queueing | JobStatus::Retrying)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queueing" => Ok(JobStatus::Queueing),
            "retrying" => Ok(JobStatus::Retrying),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failure" => Ok(JobStatus::Failure),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

// ── Job ──────────────────────────────────────────────────────────────

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Assigned by the job store on creation.
    pub id: Uuid,
    /// Registered task this job belongs to.
    pub task_name: String,
    /// Opaque payload handed to the task handler.
    pub args: serde_json::Value,
    pub status: JobStatus,
    /// Attempts that failed and were scheduled again.
    pub retry_count: u32,
    pub max_retry: u32,
    /// Last handler error, if any.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh `queueing` row from a submission.
    pub fn from_new(id: Uuid, new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_name: new.task_name,
            args: new.args,
            status: JobStatus::Queueing,
            retry_count: 0,
            max_retry: new.max_retry.unwrap_or(0),
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Whether another failed attempt may still be retried.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retry
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, update: &JobUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(retry_count) = update.retry_count {
            self.retry_count = retry_count;
        }
        if let Some(max_retry) = update.max_retry {
            self.max_retry = max_retry;
        }
        if let Some(error) = &update.error {
            self.error = error.clone();
        }
        if let Some(finished_at) = update.finished_at {
            self.finished_at = finished_at;
        }
        self.updated_at = Utc::now();
    }
}

/// Submission payload for a new job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub task_name: String,
    #[serde(default)]
    pub args: serde_json::Value,
    /// `None` falls back to the task's configured default.
    #[serde(default)]
    pub max_retry: Option<u32>,
}

impl NewJob {
    pub fn new(task_name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            task_name: task_name.into(),
            args,
            max_retry: None,
        }
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }
}

/// Partial set of job fields written by `update_job`.
///
/// `error` and `finished_at` are doubly optional: the outer `None` leaves the
/// field untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub retry_count: Option<u32>,
    pub max_retry: Option<u32>,
    pub error: Option<Option<String>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = Some(max_retry);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn finished_at(mut self, finished_at: Option<DateTime<Utc>>) -> Self {
        self.finished_at = Some(finished_at);
        self
    }
}

/// Result of a filtered update: rows that matched vs. rows actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub affected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("QUEUEING".parse::<JobStatus>().unwrap(), JobStatus::Queueing);
        assert_eq!("failure".parse::<JobStatus>().unwrap(), JobStatus::Failure);
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
    }

    #[test]
    fn terminal_and_pending_are_disjoint() {
        for status in JobStatus::ALL {
            assert!(!(status.is_terminal() && status.is_pending()), "{status}");
        }
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Running.is_pending());
    }

    #[test]
    fn new_job_starts_queueing() {
        let job = Job::from_new(Uuid::new_v4(), NewJob::new("send-email", serde_json::json!({"to": "a@b"})).max_retry(3));
        assert_eq!(job.status, JobStatus::Queueing);
        assert_eq!(job.max_retry, 3);
        assert_eq!(job.retry_count, 0);
        assert!(job.has_retry_budget());
    }

    #[test]
    fn apply_clears_error_on_some_none() {
        let mut job = Job::from_new(Uuid::new_v4(), NewJob::new("t", serde_json::Value::Null));
        job.apply(&JobUpdate::status(JobStatus::Retrying).error(Some("boom".into())));
        assert_eq!(job.error.as_deref(), Some("boom"));

        job.apply(&JobUpdate::status(JobStatus::Queueing).error(None));
        assert_eq!(job.error, None);
        assert_eq!(job.status, JobStatus::Queueing);
    }
}
