use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use taskwerk_core::JobStatus;
use taskwerk_queue::QueueError;
use taskwerk_storage::StorageError;

/// Errors surfaced by the engine's public API.
///
/// Per-job failures inside the dispatch loop never surface here; they are
/// logged and reflected in the job's stored status.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("task '{0}' has been registered")]
    DuplicateTask(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("worker is shutting down")]
    ShuttingDown,

    #[error("worker is already serving")]
    AlreadyServing,

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Error returned by a task handler.
///
/// Everything except [`TaskError::Fatal`] is retried while the job has
/// retry budget left.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    /// Retry after an explicit delay instead of the engine's backoff.
    #[error("{message} (retry in {delay:?})")]
    Retry { message: String, delay: Duration },

    /// Never retried, regardless of remaining budget.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        TaskError::Fatal(message.into())
    }

    pub fn retry_in(message: impl Into<String>, delay: Duration) -> Self {
        TaskError::Retry {
            message: message.into(),
            delay,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::Fatal(_))
    }

    /// Delay requested by the handler, if any.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            TaskError::Retry { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Fatal(format!("invalid job args: {err}"))
    }
}
