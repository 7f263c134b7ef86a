pub mod error;
pub mod locker;
pub mod memory;
pub mod store;

pub use error::StorageError;
pub use locker::{Locker, MemoryLocker};
pub use memory::{MemoryJobStore, MemorySummaryStore};
pub use store::{recount_summary, stream_jobs, transition_job, JobStore, SummaryStore};
