pub mod error;
pub mod filter;
pub mod job;
pub mod summary;

pub use error::CoreError;
pub use filter::{Filter, DEFAULT_PAGE_LIMIT};
pub use job::{Job, JobStatus, JobUpdate, NewJob, UpdateOutcome};
pub use summary::{transition_deltas, SummaryDelta, SummaryUpdate, TaskSummary};
