use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("job not found: {0}")]
    JobNotFound(uuid::Uuid),

    #[error("core error: {0}")]
    Core(#[from] taskwerk_core::CoreError),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("{0}")]
    Other(String),
}
