use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::registry::TaskOptions;
use crate::retry::RetryPolicy;

// ── Top-level config ────────────────────────────────────────────────

/// Engine configuration.
///
/// Parsed from `taskwerk.toml` with support for environment variable overrides.
/// Per-task sections override the options given when the task was registered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-task overrides keyed by task name.
    #[serde(default)]
    pub tasks: HashMap<String, TaskConfig>,
}

// ── Section configs ─────────────────────────────────────────────────

/// What happens to queued jobs that have not started when draining begins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownMode {
    /// Drop the queue entries; the rows stay pending and are replayed on the next start.
    #[default]
    Requeue,
    /// Mark the jobs `stopped`.
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Service name, used as the lock key prefix. Overrides the builder's name.
    pub name: Option<String>,

    /// Page size used when recovery scans for pending jobs.
    #[serde(default = "default_recovery_page_size")]
    pub recovery_page_size: usize,

    /// Upper bound a runner waits for the drain before giving up.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub shutdown_mode: ShutdownMode,
}

fn default_recovery_page_size() -> usize {
    10
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: None,
            recovery_page_size: default_recovery_page_size(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            shutdown_mode: ShutdownMode::default(),
        }
    }
}

impl EngineConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Backoff between failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

/// Override for one task. Unset fields keep the registered value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    pub concurrency: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub max_retry: Option<u32>,
}

impl TaskConfig {
    pub fn apply_to(&self, options: &TaskOptions) -> TaskOptions {
        let mut out = options.clone();
        if let Some(concurrency) = self.concurrency {
            out.concurrency = concurrency;
        }
        if let Some(secs) = self.timeout_secs {
            out.timeout = Some(Duration::from_secs(secs));
        }
        if let Some(max_retry) = self.max_retry {
            out.max_retry = max_retry;
        }
        out
    }
}

// ── Loading ─────────────────────────────────────────────────────────

impl WorkerConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, WorkerError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, WorkerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `TASKWERK_SECTION_KEY` overrides `section.key`.
    /// - `TASKWERK_ENGINE_NAME` -> `engine.name`
    /// - `TASKWERK_ENGINE_RECOVERY_PAGE_SIZE` -> `engine.recovery_page_size`
    /// - `TASKWERK_ENGINE_SHUTDOWN_TIMEOUT_SECS` -> `engine.shutdown_timeout_secs`
    /// - `TASKWERK_ENGINE_SHUTDOWN_MODE` -> `engine.shutdown_mode`
    /// - `TASKWERK_RETRY_INITIAL_DELAY_MS` -> `retry.initial_delay_ms`
    /// - `TASKWERK_RETRY_MAX_DELAY_MS` -> `retry.max_delay_ms`
    /// - `TASKWERK_RETRY_MULTIPLIER` -> `retry.multiplier`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub(crate) fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("TASKWERK_ENGINE_NAME") {
            self.engine.name = Some(v);
        }
        if let Some(n) = lookup("TASKWERK_ENGINE_RECOVERY_PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.engine.recovery_page_size = n;
        }
        if let Some(n) = lookup("TASKWERK_ENGINE_SHUTDOWN_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.engine.shutdown_timeout_secs = n;
        }
        if let Some(v) = lookup("TASKWERK_ENGINE_SHUTDOWN_MODE") {
            match v.to_ascii_lowercase().as_str() {
                "requeue" => self.engine.shutdown_mode = ShutdownMode::Requeue,
                "stop" => self.engine.shutdown_mode = ShutdownMode::Stop,
                other => tracing::warn!(value = other, "ignoring unknown TASKWERK_ENGINE_SHUTDOWN_MODE"),
            }
        }
        if let Some(n) = lookup("TASKWERK_RETRY_INITIAL_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry.initial_delay_ms = n;
        }
        if let Some(n) = lookup("TASKWERK_RETRY_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.retry.max_delay_ms = n;
        }
        if let Some(n) = lookup("TASKWERK_RETRY_MULTIPLIER").and_then(|v| v.parse().ok()) {
            self.retry.multiplier = n;
        }
    }

    // ── Validation ──────────────────────────────────────────────────

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.engine.recovery_page_size == 0 {
            return Err(WorkerError::Config(
                "engine.recovery_page_size must be at least 1".into(),
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(WorkerError::Config(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(WorkerError::Config(
                "retry.max_delay_ms must not be below retry.initial_delay_ms".into(),
            ));
        }
        for (name, task) in &self.tasks {
            if task.concurrency == Some(0) {
                return Err(WorkerError::Config(format!(
                    "task '{name}' concurrency must be at least 1"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg = WorkerConfig::from_toml("").unwrap();
        assert_eq!(cfg.engine.recovery_page_size, 10);
        assert_eq!(cfg.engine.shutdown_mode, ShutdownMode::Requeue);
        assert_eq!(cfg.retry.policy(), RetryPolicy::default());
        assert!(cfg.tasks.is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[engine]
name = "billing"
recovery_page_size = 50
shutdown_timeout_secs = 5
shutdown_mode = "stop"

[retry]
initial_delay_ms = 10
max_delay_ms = 1000
multiplier = 3.0

[tasks.send-email]
concurrency = 4
timeout_secs = 60
max_retry = 5

[tasks.report]
max_retry = 1
"#;
        let cfg = WorkerConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.engine.name.as_deref(), Some("billing"));
        assert_eq!(cfg.engine.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.engine.shutdown_mode, ShutdownMode::Stop);
        assert_eq!(cfg.retry.policy().delay_for(2), Duration::from_millis(30));

        let email = cfg.tasks["send-email"].apply_to(&TaskOptions::default());
        assert_eq!(email.concurrency, 4);
        assert_eq!(email.timeout, Some(Duration::from_secs(60)));
        assert_eq!(email.max_retry, 5);

        let report = cfg.tasks["report"].apply_to(&TaskOptions::default().concurrency(2));
        assert_eq!(report.concurrency, 2);
        assert_eq!(report.max_retry, 1);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let toml = r#"
[tasks.a]
concurrency = 0
"#;
        let err = WorkerConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, WorkerError::Config(ref m) if m.contains("'a'")));
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        let toml = r#"
[retry]
multiplier = 0.5
"#;
        assert!(matches!(
            WorkerConfig::from_toml(toml),
            Err(WorkerError::Config(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(
            WorkerConfig::from_toml("[engine\nname ="),
            Err(WorkerError::ConfigParse(_))
        ));
    }

    #[test]
    fn overrides_replace_file_values() {
        let vars: HashMap<&str, &str> = [
            ("TASKWERK_ENGINE_NAME", "reports"),
            ("TASKWERK_ENGINE_SHUTDOWN_MODE", "STOP"),
            ("TASKWERK_RETRY_INITIAL_DELAY_MS", "0"),
            ("TASKWERK_ENGINE_RECOVERY_PAGE_SIZE", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut cfg = WorkerConfig::default();
        cfg.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.engine.name.as_deref(), Some("reports"));
        assert_eq!(cfg.engine.shutdown_mode, ShutdownMode::Stop);
        assert_eq!(cfg.retry.initial_delay_ms, 0);
        assert_eq!(cfg.engine.recovery_page_size, 10);
    }
}
