//! Queue storage trait.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;

/// Per-task queue of job references.
///
/// Implementations hold only job ids; the job rows themselves live in the
/// job store. Pop order is whatever the backend provides, FIFO for the
/// in-memory queue.
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Append a job reference to the task's queue.
    async fn push(&self, task_name: &str, job_id: Uuid) -> Result<(), QueueError>;

    /// Remove and return the next job reference, or `None` when empty.
    async fn pop(&self, task_name: &str) -> Result<Option<Uuid>, QueueError>;

    /// Drop every queued reference to one job. Returns `false` if none was queued.
    async fn remove(&self, task_name: &str, job_id: Uuid) -> Result<bool, QueueError>;

    /// Drop every queued reference for the task.
    async fn clear(&self, task_name: &str) -> Result<(), QueueError>;

    /// Number of queued references for the task.
    async fn len(&self, task_name: &str) -> Result<usize, QueueError>;
}

/// Blanket implementation so `Arc<dyn QueueStorage>` can be used directly.
#[async_trait]
impl<T: QueueStorage + ?Sized> QueueStorage for Arc<T> {
    async fn push(&self, task_name: &str, job_id: Uuid) -> Result<(), QueueError> {
        (**self).push(task_name, job_id).await
    }

    async fn pop(&self, task_name: &str) -> Result<Option<Uuid>, QueueError> {
        (**self).pop(task_name).await
    }

    async fn remove(&self, task_name: &str, job_id: Uuid) -> Result<bool, QueueError> {
        (**self).remove(task_name, job_id).await
    }

    async fn clear(&self, task_name: &str) -> Result<(), QueueError> {
        (**self).clear(task_name).await
    }

    async fn len(&self, task_name: &str) -> Result<usize, QueueError> {
        (**self).len(task_name).await
    }
}
