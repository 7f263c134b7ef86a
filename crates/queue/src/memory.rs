//! In-process queue backend.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::storage::QueueStorage;

/// FIFO queues keyed by task name, held in memory.
///
/// Contents do not survive a restart; recovery rebuilds them from the job
/// store.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<Uuid>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the queued ids for a task, front first.
    pub async fn snapshot(&self, task_name: &str) -> Vec<Uuid> {
        self.queues
            .lock()
            .await
            .get(task_name)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueStorage for MemoryQueue {
    async fn push(&self, task_name: &str, job_id: Uuid) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues.entry(task_name.to_string()).or_default().push_back(job_id);
        Ok(())
    }

    async fn pop(&self, task_name: &str) -> Result<Option<Uuid>, QueueError> {
        let mut queues = self.queues.lock().await;
        Ok(queues.get_mut(task_name).and_then(|q| q.pop_front()))
    }

    async fn remove(&self, task_name: &str, job_id: Uuid) -> Result<bool, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(q) = queues.get_mut(task_name) else {
            return Ok(false);
        };
        let before = q.len();
        q.retain(|id| *id != job_id);
        Ok(q.len() < before)
    }

    async fn clear(&self, task_name: &str) -> Result<(), QueueError> {
        if let Some(q) = self.queues.lock().await.get_mut(task_name) {
            debug!(task = task_name, dropped = q.len(), "queue cleared");
            q.clear();
        }
        Ok(())
    }

    async fn len(&self, task_name: &str) -> Result<usize, QueueError> {
        Ok(self
            .queues
            .lock()
            .await
            .get(task_name)
            .map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_is_fifo_per_task() {
        let queue = MemoryQueue::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        queue.push("mail", a).await.unwrap();
        queue.push("sms", c).await.unwrap();
        queue.push("mail", b).await.unwrap();

        assert_eq!(queue.pop("mail").await.unwrap(), Some(a));
        assert_eq!(queue.pop("mail").await.unwrap(), Some(b));
        assert_eq!(queue.pop("mail").await.unwrap(), None);
        assert_eq!(queue.pop("sms").await.unwrap(), Some(c));
    }

    #[tokio::test]
    async fn clear_only_touches_one_task() {
        let queue = MemoryQueue::new();
        queue.push("mail", Uuid::new_v4()).await.unwrap();
        queue.push("sms", Uuid::new_v4()).await.unwrap();

        queue.clear("mail").await.unwrap();
        assert_eq!(queue.len("mail").await.unwrap(), 0);
        assert_eq!(queue.len("sms").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_drops_every_reference_to_a_job() {
        let queue = MemoryQueue::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        queue.push("mail", a).await.unwrap();
        queue.push("mail", b).await.unwrap();
        queue.push("mail", a).await.unwrap();

        assert!(queue.remove("mail", a).await.unwrap());
        assert_eq!(queue.snapshot("mail").await, vec![b]);
        assert!(!queue.remove("mail", a).await.unwrap());
        assert!(!queue.remove("sms", b).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_task_is_empty() {
        let queue = MemoryQueue::new();
        assert_eq!(queue.pop("nope").await.unwrap(), None);
        assert_eq!(queue.len("nope").await.unwrap(), 0);
        queue.clear("nope").await.unwrap();
        assert!(queue.snapshot("nope").await.is_empty());
    }
}
