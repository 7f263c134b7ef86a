//! The task queue engine: shared state, builder, and public operations.
//!
//! An [`Engine`] owns the task registry, the adapters, the wake channel
//! feeding the dispatch loop, and the tracker every execution unit is
//! spawned on. The dispatch loop, execution units, recovery and shutdown
//! all work on the same [`Shared`] behind an `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskwerk_core::{Job, JobStatus, JobUpdate, NewJob};
use taskwerk_queue::QueueStorage;
use taskwerk_storage::{transition_job, JobStore, Locker, MemoryLocker};

use crate::config::{ShutdownMode, WorkerConfig};
use crate::dispatch;
use crate::error::WorkerError;
use crate::execute::stop_pending;
use crate::handler::{TaskHandler, TaskModule};
use crate::metrics::{EngineState, EngineStats, TaskStats};
use crate::registry::{Registry, TaskOptions};
use crate::retry::RetryPolicy;
use crate::worker::Worker;

/// Worker kind reported to a host supervisor.
pub const WORKER_KIND: &str = "task-queue";

// ── Shared state ─────────────────────────────────────────────────────

/// Message on the dispatch loop's single fan-in channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    /// A job may be waiting for the task in this slot.
    Task(usize),
    /// Re-evaluate loop state only.
    Refresh,
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) registry: Registry,
    pub(crate) queue: Arc<dyn QueueStorage>,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) locker: Arc<dyn Locker>,
    pub(crate) retry: RetryPolicy,
    pub(crate) shutdown_mode: ShutdownMode,
    pub(crate) recovery_page_size: usize,
    /// Every execution unit and delayed retry is spawned here.
    pub(crate) tracker: TaskTracker,
    /// Process lifetime. Handlers get child tokens; cancelled once stopped.
    pub(crate) lifetime: CancellationToken,
    /// Cancelled when draining starts. Doubles as the shutdown flag.
    pub(crate) draining: CancellationToken,
    /// Held for writing while recovery rebuilds the queues.
    pub(crate) recovery_gate: RwLock<()>,
    wake_tx: mpsc::UnboundedSender<Wake>,
    state: watch::Sender<EngineState>,
    running_jobs: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Shared {
    /// Wake the dispatch loop for a slot. Coalesces while a wake is in flight.
    pub(crate) fn signal(&self, slot: usize) {
        if let Some(task) = self.registry.slot(slot) {
            if task.arm_wake() && self.wake_tx.send(Wake::Task(slot)).is_err() {
                task.disarm_wake();
            }
        }
    }

    pub(crate) fn signal_refresh(&self) {
        let _ = self.wake_tx.send(Wake::Refresh);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.is_cancelled()
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Resolves once the lifecycle is at or past `state`.
    pub(crate) async fn reached(&self, state: EngineState) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s >= state).await;
    }

    /// Move the lifecycle forward. Returns `false` if already at or past `to`.
    pub(crate) fn advance_state(&self, to: EngineState) -> bool {
        self.state.send_if_modified(|state| {
            if *state < to {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn lock_key(&self, job_id: Uuid) -> String {
        format!("{}:task-queue-worker-lock:{job_id}", self.name)
    }

    pub(crate) fn track_running(&self, job_id: Uuid, cancel: CancellationToken) {
        if let Ok(mut running) = self.running_jobs.lock() {
            running.insert(job_id, cancel);
        }
    }

    pub(crate) fn untrack_running(&self, job_id: Uuid) {
        if let Ok(mut running) = self.running_jobs.lock() {
            running.remove(&job_id);
        }
    }

    fn cancel_running(&self, job_id: Uuid) -> bool {
        let token = self
            .running_jobs
            .lock()
            .ok()
            .and_then(|running| running.get(&job_id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

// ── Builder ──────────────────────────────────────────────────────────

/// Fluent builder for an [`Engine`].
///
/// # Example
/// ```ignore
/// let engine = EngineBuilder::new("billing")
///     .queue(Arc::new(MemoryQueue::new()))
///     .store(Arc::new(MemoryJobStore::new()))
///     .task("send-email", "mail", handler_fn(|ctx| async move { Ok(()) }))
///     .build()
///     .await?;
/// ```
pub struct EngineBuilder {
    name: String,
    registry: Registry,
    first_error: Option<WorkerError>,
    queue: Option<Arc<dyn QueueStorage>>,
    store: Option<Arc<dyn JobStore>>,
    locker: Option<Arc<dyn Locker>>,
    config: WorkerConfig,
    retry: Option<RetryPolicy>,
}

impl EngineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: Registry::new(),
            first_error: None,
            queue: None,
            store: None,
            locker: None,
            config: WorkerConfig::default(),
            retry: None,
        }
    }

    pub fn queue(mut self, queue: Arc<dyn QueueStorage>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to an in-process [`MemoryLocker`].
    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Takes precedence over the `[retry]` config section.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Register a task and return its dispatch slot.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        module: impl Into<String>,
        options: TaskOptions,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<usize, WorkerError> {
        self.registry.register(name, module, options, handler)
    }

    pub fn task(
        self,
        name: impl Into<String>,
        module: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.task_with(name, module, TaskOptions::default(), handler)
    }

    /// Fluent registration. The first failure is reported by [`build`](Self::build).
    pub fn task_with(
        mut self,
        name: impl Into<String>,
        module: impl Into<String>,
        options: TaskOptions,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        if let Err(err) = self.registry.register(name, module, options, handler) {
            warn!(error = %err, "task registration failed");
            self.first_error.get_or_insert(err);
        }
        self
    }

    /// Mount every handler a module contributes.
    pub fn module(mut self, module: &dyn TaskModule) -> Self {
        let mut group = crate::handler::HandlerGroup::default();
        module.mount(&mut group);
        for entry in group.entries {
            self = self.task_with(entry.task_name, module.name(), entry.options, entry.handler);
        }
        self
    }

    pub async fn build(self) -> Result<Engine, WorkerError> {
        let EngineBuilder {
            name,
            mut registry,
            first_error,
            queue,
            store,
            locker,
            config,
            retry,
        } = self;

        if let Some(err) = first_error {
            return Err(err);
        }
        config.validate()?;
        let queue = queue.ok_or_else(|| WorkerError::Config("no queue storage configured".into()))?;
        let store = store.ok_or_else(|| WorkerError::Config("no job store configured".into()))?;
        let locker = locker.unwrap_or_else(|| Arc::new(MemoryLocker::new()));

        for (task_name, overrides) in &config.tasks {
            match registry.get_mut(task_name) {
                Some(task) => {
                    let options = overrides.apply_to(&task.options);
                    task.reconfigure(options);
                }
                None => warn!(task = %task_name, "config overrides a task that is not registered"),
            }
        }

        let name = config.engine.name.clone().unwrap_or(name);
        let released = locker
            .reset(&format!("{name}:task-queue-worker-lock:*"))
            .await?;
        debug!(worker = %name, released, "stale job locks reset");

        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(EngineState::Starting);

        info!(worker = %name, tasks = registry.len(), "task queue worker built");

        Ok(Engine {
            shared: Arc::new(Shared {
                name,
                registry,
                queue,
                store,
                locker,
                retry: retry.unwrap_or_else(|| config.retry.policy()),
                shutdown_mode: config.engine.shutdown_mode,
                recovery_page_size: config.engine.recovery_page_size,
                tracker: TaskTracker::new(),
                lifetime: CancellationToken::new(),
                draining: CancellationToken::new(),
                recovery_gate: RwLock::new(()),
                wake_tx,
                state,
                running_jobs: Mutex::new(HashMap::new()),
            }),
            wake_rx: AsyncMutex::new(Some(wake_rx)),
        })
    }
}

// ── Engine ───────────────────────────────────────────────────────────

pub struct Engine {
    pub(crate) shared: Arc<Shared>,
    /// Taken by [`serve`](Engine::serve). Manual recovery holds the lock so
    /// it never overlaps a running dispatch loop.
    pub(crate) wake_rx: AsyncMutex<Option<mpsc::UnboundedReceiver<Wake>>>,
}

impl Engine {
    pub fn builder(name: impl Into<String>) -> EngineBuilder {
        EngineBuilder::new(name)
    }

    /// Service name this engine was built for (lock key prefix).
    pub fn service_name(&self) -> &str {
        &self.shared.name
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    /// Resolves once recovery has finished (or the engine is already past it).
    pub async fn ready(&self) {
        self.shared.reached(EngineState::Running).await;
    }

    /// Fire the administrative refresh signal.
    pub fn refresh(&self) {
        self.shared.signal_refresh();
    }

    /// Recover pending jobs, then run the dispatch loop until shutdown.
    ///
    /// Can only be called once per engine.
    pub async fn serve(&self) -> Result<(), WorkerError> {
        let wakes = self
            .wake_rx
            .lock()
            .await
            .take()
            .ok_or(WorkerError::AlreadyServing)?;

        if !self.shared.is_draining() {
            crate::recovery::recover(&self.shared).await;
            self.shared.signal_refresh();
        }

        dispatch::run(self.shared.clone(), wakes).await;
        Ok(())
    }

    /// Submit a new job in `queueing` status and wake its task.
    pub async fn add_job(&self, mut new: NewJob) -> Result<Job, WorkerError> {
        let shared = &self.shared;
        let task = shared
            .registry
            .get(&new.task_name)
            .ok_or_else(|| WorkerError::UnknownTask(new.task_name.clone()))?;
        if shared.is_draining() {
            return Err(WorkerError::ShuttingDown);
        }
        new.max_retry.get_or_insert(task.options.max_retry);

        let gate = shared.recovery_gate.read().await;
        let job = shared.store.create_job(new).await?;
        if let Err(e) = shared
            .store
            .summary()
            .increment_summary(&job.task_name, &[(JobStatus::Queueing, 1)])
            .await
        {
            warn!(job_id = %job.id, error = %e, "failed to count new job in summary");
        }
        shared.queue.push(&task.name, job.id).await?;
        drop(gate);

        // A drain that started meanwhile may already have emptied the queue.
        if shared.is_draining() {
            if shared.shutdown_mode == ShutdownMode::Stop {
                stop_pending(shared, job.id).await?;
                info!(job_id = %job.id, task = %task.name, "job stopped; worker is draining");
                return Err(WorkerError::ShuttingDown);
            }
            debug!(job_id = %job.id, task = %task.name, "job stored during drain");
            return Ok(job);
        }
        shared.signal(task.slot);

        debug!(job_id = %job.id, task = %task.name, "job queued");
        Ok(job)
    }

    /// Force a non-terminal job to `stopped`, cancelling its handler if running.
    pub async fn stop_job(&self, id: Uuid) -> Result<(), WorkerError> {
        let shared = &self.shared;
        let job = shared
            .store
            .find_job(id)
            .await?
            .ok_or(WorkerError::JobNotFound(id))?;
        let invalid = WorkerError::InvalidTransition {
            id,
            from: job.status,
            to: JobStatus::Stopped,
        };
        if job.status.is_terminal() {
            return Err(invalid);
        }

        // Queued references go first so a retry after the stop starts clean.
        let dequeued = job.status.is_pending() && shared.queue.remove(&job.task_name, id).await?;
        let update = JobUpdate::status(JobStatus::Stopped).finished_at(Some(Utc::now()));
        let moved = transition_job(shared.store.as_ref(), &job, job.status, update).await;
        if !matches!(moved, Ok(n) if n > 0) {
            if dequeued {
                self.restore_reference(&job.task_name, id).await;
            }
            moved?;
            return Err(invalid);
        }
        let cancelled = job.status == JobStatus::Running && shared.cancel_running(id);

        info!(job_id = %id, task = %job.task_name, from = %job.status, cancelled, "job stopped");
        Ok(())
    }

    /// Re-queue a `failure` or `stopped` job with a fresh retry budget.
    pub async fn retry_job(&self, id: Uuid) -> Result<(), WorkerError> {
        let shared = &self.shared;
        if shared.is_draining() {
            return Err(WorkerError::ShuttingDown);
        }
        let job = shared
            .store
            .find_job(id)
            .await?
            .ok_or(WorkerError::JobNotFound(id))?;
        let invalid = WorkerError::InvalidTransition {
            id,
            from: job.status,
            to: JobStatus::Queueing,
        };
        if !matches!(job.status, JobStatus::Failure | JobStatus::Stopped) {
            return Err(invalid);
        }
        let task = shared
            .registry
            .get(&job.task_name)
            .ok_or_else(|| WorkerError::UnknownTask(job.task_name.clone()))?;

        let _gate = shared.recovery_gate.read().await;
        let update = JobUpdate::status(JobStatus::Queueing)
            .retry_count(0)
            .error(None)
            .finished_at(None);
        if transition_job(shared.store.as_ref(), &job, job.status, update).await? == 0 {
            return Err(invalid);
        }
        shared.queue.push(&task.name, id).await?;
        shared.signal(task.slot);

        info!(job_id = %id, task = %task.name, "job re-queued");
        Ok(())
    }

    async fn restore_reference(&self, task_name: &str, id: Uuid) {
        let shared = &self.shared;
        let Some(task) = shared.registry.get(task_name) else {
            return;
        };
        match shared.queue.push(&task.name, id).await {
            Ok(()) => shared.signal(task.slot),
            Err(e) => warn!(job_id = %id, error = %e, "failed to restore job reference; leaving it for recovery"),
        }
    }

    pub async fn stats(&self) -> EngineStats {
        let shared = &self.shared;
        let mut tasks = Vec::with_capacity(shared.registry.len());
        for task in shared.registry.tasks() {
            tasks.push(TaskStats {
                name: task.name.clone(),
                module: task.module.clone(),
                slot: task.slot,
                running: task.limiter.running(),
                capacity: task.limiter.capacity(),
                queued: shared.queue.len(&task.name).await.ok(),
            });
        }
        EngineStats {
            name: shared.name.clone(),
            state: shared.state(),
            in_flight: shared.tracker.len(),
            tasks,
        }
    }
}

#[async_trait]
impl Worker for Engine {
    async fn serve(&self) -> Result<(), WorkerError> {
        Engine::serve(self).await
    }

    async fn shutdown(&self) {
        Engine::shutdown(self).await
    }

    fn name(&self) -> &str {
        WORKER_KIND
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use taskwerk_core::NewJob;
    use taskwerk_queue::MemoryQueue;
    use taskwerk_storage::{MemoryJobStore, SummaryStore};

    use super::*;
    use crate::handler::{handler_fn, HandlerGroup};

    fn builder(queue: Arc<MemoryQueue>, store: Arc<MemoryJobStore>) -> EngineBuilder {
        EngineBuilder::new("svc").queue(queue).store(store)
    }

    struct Mail;

    impl TaskModule for Mail {
        fn name(&self) -> &str {
            "mail"
        }

        fn mount(&self, group: &mut HandlerGroup) {
            group.add("send-email", handler_fn(|_| async { Ok(()) }));
            group.add_with(
                "send-digest",
                TaskOptions::default().concurrency(3),
                handler_fn(|_| async { Ok(()) }),
            );
        }
    }

    #[tokio::test]
    async fn build_fails_on_duplicate_task() {
        let result = builder(Arc::new(MemoryQueue::new()), Arc::new(MemoryJobStore::new()))
            .task("a", "m", handler_fn(|_| async { Ok(()) }))
            .task("a", "m", handler_fn(|_| async { Ok(()) }))
            .build()
            .await;
        assert!(matches!(result, Err(WorkerError::DuplicateTask(ref n)) if n == "a"));
    }

    #[tokio::test]
    async fn build_requires_adapters() {
        let result = EngineBuilder::new("svc").build().await;
        assert!(matches!(result, Err(WorkerError::Config(_))));
    }

    #[tokio::test]
    async fn module_tasks_carry_module_name() {
        let engine = builder(Arc::new(MemoryQueue::new()), Arc::new(MemoryJobStore::new()))
            .module(&Mail)
            .build()
            .await
            .unwrap();
        let digest = engine.registry().get("send-digest").unwrap();
        assert_eq!(digest.module, "mail");
        assert_eq!(digest.slot, 1);
        assert_eq!(digest.limiter().capacity(), 3);
    }

    #[tokio::test]
    async fn config_overrides_registered_options() {
        let config = WorkerConfig::from_toml(
            r#"
[engine]
name = "from-config"

[tasks.a]
concurrency = 5
max_retry = 2
"#,
        )
        .unwrap();
        let engine = builder(Arc::new(MemoryQueue::new()), Arc::new(MemoryJobStore::new()))
            .config(config)
            .task("a", "m", handler_fn(|_| async { Ok(()) }))
            .build()
            .await
            .unwrap();
        assert_eq!(engine.service_name(), "from-config");
        let task = engine.registry().get("a").unwrap();
        assert_eq!(task.limiter().capacity(), 5);
        assert_eq!(task.options.max_retry, 2);
    }

    #[tokio::test]
    async fn build_resets_stale_locks() {
        let locker = Arc::new(MemoryLocker::new());
        locker.try_lock("svc:task-queue-worker-lock:old").await.unwrap();
        locker.try_lock("other:task-queue-worker-lock:old").await.unwrap();

        builder(Arc::new(MemoryQueue::new()), Arc::new(MemoryJobStore::new()))
            .locker(locker.clone())
            .build()
            .await
            .unwrap();

        assert!(!locker.is_held("svc:task-queue-worker-lock:old").await);
        assert!(locker.is_held("other:task-queue-worker-lock:old").await);
    }

    #[tokio::test]
    async fn add_job_queues_and_counts() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryJobStore::new());
        let engine = builder(queue.clone(), store.clone())
            .task_with(
                "a",
                "m",
                TaskOptions::default().max_retry(4),
                handler_fn(|_| async { Ok(()) }),
            )
            .build()
            .await
            .unwrap();

        let job = engine.add_job(NewJob::new("a", serde_json::json!({}))).await.unwrap();
        assert_eq!(job.status, JobStatus::Queueing);
        assert_eq!(job.max_retry, 4);
        assert_eq!(queue.snapshot("a").await, vec![job.id]);

        let summary = store.summary().find_summary("a").await.unwrap().unwrap();
        assert_eq!(summary.queueing, 1);
    }

    #[tokio::test]
    async fn add_job_rejects_unknown_task() {
        let engine = builder(Arc::new(MemoryQueue::new()), Arc::new(MemoryJobStore::new()))
            .build()
            .await
            .unwrap();
        let err = engine
            .add_job(NewJob::new("nope", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn stop_then_retry_round_trip() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryJobStore::new());
        let engine = builder(queue.clone(), store.clone())
            .task("a", "m", handler_fn(|_| async { Ok(()) }))
            .build()
            .await
            .unwrap();
        let job = engine.add_job(NewJob::new("a", serde_json::Value::Null)).await.unwrap();

        engine.stop_job(job.id).await.unwrap();
        let stopped = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(stopped.status, JobStatus::Stopped);
        assert!(stopped.finished_at.is_some());
        assert!(queue.snapshot("a").await.is_empty());
        assert!(matches!(
            engine.stop_job(job.id).await,
            Err(WorkerError::InvalidTransition { .. })
        ));

        engine.retry_job(job.id).await.unwrap();
        let requeued = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Queueing);
        assert_eq!(requeued.finished_at, None);
        // Exactly one reference: the stale one went with the stop.
        assert_eq!(queue.snapshot("a").await, vec![job.id]);

        let summary = store.summary().find_summary("a").await.unwrap().unwrap();
        assert_eq!((summary.queueing, summary.stopped), (1, 0));
    }

    #[tokio::test]
    async fn worker_name_is_kind() {
        let engine = builder(Arc::new(MemoryQueue::new()), Arc::new(MemoryJobStore::new()))
            .build()
            .await
            .unwrap();
        assert_eq!(Worker::name(&engine), "task-queue");
        assert_eq!(engine.state(), EngineState::Starting);
    }
}
