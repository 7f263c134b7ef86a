//! Per-task aggregate status counters.

use serde::{Deserialize, Serialize};

use crate::job::JobStatus;

/// Counters for one task, one column per [`JobStatus`].
///
/// Counters are signed so a drifted value survives until the next full
/// recount repairs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_name: String,
    pub queueing: i64,
    pub retrying: i64,
    pub running: i64,
    pub success: i64,
    pub failure: i64,
    pub stopped: i64,
    /// Set while a bulk operation on the task is in progress.
    pub is_loading: bool,
}

impl TaskSummary {
    pub fn new(task_name: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            ..Self::default()
        }
    }

    pub fn count(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::Queueing => self.queueing,
            JobStatus::Retrying => self.retrying,
            JobStatus::Running => self.running,
            JobStatus::Success => self.success,
            JobStatus::Failure => self.failure,
            JobStatus::Stopped => self.stopped,
        }
    }

    fn count_mut(&mut self, status: JobStatus) -> &mut i64 {
        match status {
            JobStatus::Queueing => &mut self.queueing,
            JobStatus::Retrying => &mut self.retrying,
            JobStatus::Running => &mut self.running,
            JobStatus::Success => &mut self.success,
            JobStatus::Failure => &mut self.failure,
            JobStatus::Stopped => &mut self.stopped,
        }
    }

    pub fn apply(&mut self, status: JobStatus, delta: i64) {
        *self.count_mut(status) += delta;
    }

    pub fn set(&mut self, status: JobStatus, value: i64) {
        *self.count_mut(status) = value;
    }

    /// Sum over every status column.
    pub fn total(&self) -> i64 {
        JobStatus::ALL.iter().map(|s| self.count(*s)).sum()
    }

    /// Copy the counters (not the name or loading flag) from `other`.
    pub fn copy_counts(&mut self, other: &TaskSummary) {
        for status in JobStatus::ALL {
            self.set(status, other.count(status));
        }
    }
}

/// Delta for a single status column.
pub type SummaryDelta = (JobStatus, i64);

/// Deltas moving `n` jobs from one status to another.
pub fn transition_deltas(from: JobStatus, to: JobStatus, n: u64) -> [SummaryDelta; 2] {
    let n = n as i64;
    [(from, -n), (to, n)]
}

/// Partial update of summary fields that are not counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryUpdate {
    pub is_loading: Option<bool>,
}

impl SummaryUpdate {
    pub fn loading(is_loading: bool) -> Self {
        Self {
            is_loading: Some(is_loading),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_keeps_total() {
        let mut s = TaskSummary::new("t");
        s.apply(JobStatus::Queueing, 3);
        for (status, delta) in transition_deltas(JobStatus::Queueing, JobStatus::Running, 2) {
            s.apply(status, delta);
        }
        assert_eq!(s.queueing, 1);
        assert_eq!(s.running, 2);
        assert_eq!(s.total(), 3);
    }

    #[test]
    fn zero_affected_is_a_no_op() {
        let mut s = TaskSummary::new("t");
        s.apply(JobStatus::Retrying, 1);
        let before = s.clone();
        for (status, delta) in transition_deltas(JobStatus::Retrying, JobStatus::Queueing, 0) {
            s.apply(status, delta);
        }
        assert_eq!(s, before);
    }
}
