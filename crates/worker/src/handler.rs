//! Task handlers and module mounting.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use taskwerk_core::Job;

use crate::error::TaskError;
use crate::registry::TaskOptions;

// ── Context ──────────────────────────────────────────────────────────

/// Everything a handler gets for one attempt at one job.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// The job row as it was when the attempt started (status `running`).
    pub job: Job,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cancelled when the job is stopped or the engine's lifetime ends.
    /// Advisory: handlers that ignore it simply run to completion.
    pub cancel: CancellationToken,
}

impl JobContext {
    /// Deserialize the job's payload.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
        Ok(serde_json::from_value(self.job.args.clone())?)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ── Handler trait ────────────────────────────────────────────────────

/// Executes one job of a task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<(), TaskError>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn handle(&self, ctx: JobContext) -> Result<(), TaskError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```ignore
/// let handler = handler_fn(|ctx| async move {
///     let to: String = ctx.args()?;
///     send_mail(&to).await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ── Modules ──────────────────────────────────────────────────────────

/// One handler waiting to be registered.
pub struct HandlerEntry {
    pub task_name: String,
    pub options: TaskOptions,
    pub handler: Arc<dyn TaskHandler>,
}

/// Handlers a module contributes, in mount order.
#[derive(Default)]
pub struct HandlerGroup {
    pub(crate) entries: Vec<HandlerEntry>,
}

impl HandlerGroup {
    pub fn add(&mut self, task_name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.add_with(task_name, TaskOptions::default(), handler);
    }

    pub fn add_with(
        &mut self,
        task_name: impl Into<String>,
        options: TaskOptions,
        handler: Arc<dyn TaskHandler>,
    ) {
        self.entries.push(HandlerEntry {
            task_name: task_name.into(),
            options,
            handler,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A service module owning a set of task handlers.
pub trait TaskModule: Send + Sync {
    fn name(&self) -> &str;

    fn mount(&self, group: &mut HandlerGroup);
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskwerk_core::NewJob;
    use uuid::Uuid;

    fn ctx(args: serde_json::Value) -> JobContext {
        JobContext {
            job: Job::from_new(Uuid::new_v4(), NewJob::new("t", args)),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn closure_handler_runs() {
        let handler = handler_fn(|ctx: JobContext| async move {
            let n: u32 = ctx.args()?;
            if n == 0 {
                return Err(TaskError::failed("zero"));
            }
            Ok(())
        });

        assert!(handler.handle(ctx(serde_json::json!(1))).await.is_ok());
        assert!(handler.handle(ctx(serde_json::json!(0))).await.is_err());
    }

    #[tokio::test]
    async fn bad_args_are_fatal() {
        let err = ctx(serde_json::json!("nope")).args::<u32>().unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn group_keeps_mount_order() {
        let mut group = HandlerGroup::default();
        group.add("a", handler_fn(|_| async { Ok(()) }));
        group.add("b", handler_fn(|_| async { Ok(()) }));
        let names: Vec<_> = group.entries.iter().map(|e| e.task_name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
    }
}
