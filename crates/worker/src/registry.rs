//! Task registry.
//!
//! Built once before the engine serves and read-only afterwards. Each task
//! gets a dense, zero-based dispatch slot in registration order, one
//! admission limiter, and one coalescing wake flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::WorkerError;
use crate::handler::TaskHandler;
use crate::limiter::Limiter;

/// Per-task execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Maximum simultaneous executions of this task.
    pub concurrency: usize,
    /// Deadline for one attempt. Exceeding it counts as a failed attempt.
    pub timeout: Option<Duration>,
    /// Retry budget for submissions that don't carry their own.
    pub max_retry: u32,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout: None,
            max_retry: 0,
        }
    }
}

impl TaskOptions {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }
}

/// A registered task.
pub struct Task {
    pub name: String,
    pub module: String,
    pub slot: usize,
    pub options: TaskOptions,
    pub(crate) handler: Arc<dyn TaskHandler>,
    pub(crate) limiter: Limiter,
    /// Set while a wake for this slot is in flight to the dispatch loop.
    wake_pending: AtomicBool,
}

impl Task {
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// Mark a wake as pending. Returns `false` if one already was.
    pub(crate) fn arm_wake(&self) -> bool {
        !self.wake_pending.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn disarm_wake(&self) {
        self.wake_pending.store(false, Ordering::SeqCst);
    }

    /// Replace the options, rebuilding the limiter for the new capacity.
    pub(crate) fn reconfigure(&mut self, options: TaskOptions) {
        self.limiter = Limiter::new(options.concurrency);
        self.options = options;
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("slot", &self.slot)
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    tasks: Vec<Task>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and return its dispatch slot.
    ///
    /// A name that is already registered is rejected and the registry is
    /// left unchanged.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        module: impl Into<String>,
        options: TaskOptions,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<usize, WorkerError> {
        let name = name.into();
        if self.index.contains_key(&name) {
            return Err(WorkerError::DuplicateTask(name));
        }

        let slot = self.tasks.len();
        let module = module.into();
        info!(task = %name, module = %module, slot, concurrency = options.concurrency, "registered task");

        self.index.insert(name.clone(), slot);
        self.tasks.push(Task {
            name,
            module,
            slot,
            limiter: Limiter::new(options.concurrency),
            options,
            handler,
            wake_pending: AtomicBool::new(false),
        });
        Ok(slot)
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.index.get(name).map(|slot| &self.tasks[*slot])
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Task> {
        let slot = *self.index.get(name)?;
        self.tasks.get_mut(slot)
    }

    pub fn slot(&self, slot: usize) -> Option<&Task> {
        self.tasks.get(slot)
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Task names in slot order.
    pub fn names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Executions currently holding an admission slot, across all tasks.
    pub fn running_total(&self) -> usize {
        self.tasks.iter().map(|t| t.limiter.running()).sum()
    }

    pub(crate) fn close_all(&self) {
        for task in &self.tasks {
            task.limiter.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> Arc<dyn TaskHandler> {
        handler_fn(|_| async { Ok(()) })
    }

    #[test]
    fn slots_follow_registration_order() {
        let mut registry = Registry::new();
        assert_eq!(registry.register("a", "m", TaskOptions::default(), noop()).unwrap(), 0);
        assert_eq!(registry.register("b", "m", TaskOptions::default(), noop()).unwrap(), 1);
        assert_eq!(registry.register("c", "n", TaskOptions::default(), noop()).unwrap(), 2);

        assert_eq!(registry.get("b").unwrap().slot, 1);
        assert_eq!(registry.slot(2).unwrap().name, "c");
        assert_eq!(registry.names(), ["a", "b", "c"]);
    }

    #[test]
    fn duplicate_name_is_rejected_and_registry_unchanged() {
        let mut registry = Registry::new();
        registry
            .register("send-email", "mail", TaskOptions::default().concurrency(2), noop())
            .unwrap();

        let err = registry
            .register("send-email", "other", TaskOptions::default(), noop())
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateTask(ref n) if n == "send-email"));

        assert_eq!(registry.len(), 1);
        let task = registry.get("send-email").unwrap();
        assert_eq!(task.module, "mail");
        assert_eq!(task.limiter().capacity(), 2);
    }

    #[test]
    fn wake_flag_coalesces() {
        let mut registry = Registry::new();
        registry.register("a", "m", TaskOptions::default(), noop()).unwrap();
        let task = registry.get("a").unwrap();

        assert!(task.arm_wake());
        assert!(!task.arm_wake());
        task.disarm_wake();
        assert!(task.arm_wake());
    }

    #[test]
    fn running_total_sums_limiters() {
        let mut registry = Registry::new();
        registry.register("a", "m", TaskOptions::default().concurrency(2), noop()).unwrap();
        registry.register("b", "m", TaskOptions::default(), noop()).unwrap();

        let _a1 = registry.get("a").unwrap().limiter().try_admit().unwrap();
        let _a2 = registry.get("a").unwrap().limiter().try_admit().unwrap();
        let _b1 = registry.get("b").unwrap().limiter().try_admit().unwrap();
        assert_eq!(registry.running_total(), 3);

        registry.close_all();
        assert!(registry.get("b").unwrap().limiter().try_admit().is_none());
    }
}
