pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod metrics;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod worker;

mod dispatch;
mod execute;
mod shutdown;

pub use config::{EngineConfig, RetryConfig, ShutdownMode, TaskConfig, WorkerConfig};
pub use engine::{Engine, EngineBuilder, WORKER_KIND};
pub use error::{TaskError, WorkerError};
pub use handler::{handler_fn, HandlerGroup, JobContext, TaskHandler, TaskModule};
pub use limiter::{Admission, Limiter};
pub use metrics::{EngineState, EngineStats, TaskStats};
pub use recovery::RecoveryReport;
pub use registry::{Registry, Task, TaskOptions};
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerRunner};

pub use taskwerk_core::{Job, JobStatus, NewJob};
