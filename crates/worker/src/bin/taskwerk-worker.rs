//! taskwerk-worker: runs the task queue engine against in-memory adapters.
//!
//! Registers a small set of demo tasks, optionally seeds jobs, and serves
//! until SIGINT/SIGTERM, then drains in-flight jobs.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, no config file
//! taskwerk-worker --jobs 20
//!
//! # With a config file and periodic stats
//! taskwerk-worker --config taskwerk.toml --stats-interval 5
//!
//! # Via environment variables
//! TASKWERK_CONFIG=taskwerk.toml TASKWERK_ENGINE_SHUTDOWN_MODE=stop taskwerk-worker
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use taskwerk_queue::MemoryQueue;
use taskwerk_storage::MemoryJobStore;
use taskwerk_worker::{
    handler_fn, Engine, HandlerGroup, JobContext, NewJob, TaskError, TaskModule, TaskOptions,
    WorkerConfig, WorkerRunner,
};

/// Background task queue worker.
#[derive(Parser, Debug)]
#[command(name = "taskwerk-worker", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, env = "TASKWERK_CONFIG")]
    config: Option<PathBuf>,

    /// Service name (lock key prefix). The config file's `engine.name` wins.
    #[arg(long, env = "TASKWERK_NAME", default_value = "taskwerk")]
    name: String,

    /// Demo jobs to submit at startup, split across the demo tasks.
    #[arg(long, env = "TASKWERK_DEMO_JOBS", default_value_t = 0)]
    jobs: usize,

    /// Interval in seconds between stats log lines (0 = disabled).
    #[arg(long, env = "TASKWERK_STATS_INTERVAL", default_value_t = 30)]
    stats_interval: u64,
}

#[derive(Debug, Deserialize)]
struct EmailArgs {
    to: String,
}

/// Demo module: a fast mail sender and a report that fails its first attempt.
struct DemoModule;

impl TaskModule for DemoModule {
    fn name(&self) -> &str {
        "demo"
    }

    fn mount(&self, group: &mut HandlerGroup) {
        group.add_with(
            "send-email",
            TaskOptions::default().concurrency(2),
            handler_fn(|ctx: JobContext| async move {
                let args: EmailArgs = ctx.args()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
                tracing::info!(job_id = %ctx.job.id, to = %args.to, "email sent");
                Ok(())
            }),
        );
        group.add_with(
            "build-report",
            TaskOptions::default()
                .max_retry(2)
                .timeout(Duration::from_secs(30)),
            handler_fn(|ctx: JobContext| async move {
                if ctx.attempt == 1 {
                    return Err(TaskError::failed("report source not ready"));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }),
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting taskwerk-worker");

    let config = match &cli.config {
        Some(path) => WorkerConfig::from_file(path)?,
        None => {
            let mut config = WorkerConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    let shutdown_timeout = config.engine.shutdown_timeout();

    let engine = Arc::new(
        Engine::builder(cli.name.clone())
            .queue(Arc::new(MemoryQueue::new()))
            .store(Arc::new(MemoryJobStore::new()))
            .config(config)
            .module(&DemoModule)
            .build()
            .await?,
    );

    for i in 0..cli.jobs {
        let new = if i % 2 == 0 {
            NewJob::new("send-email", serde_json::json!({ "to": format!("user{i}@example.com") }))
        } else {
            NewJob::new("build-report", serde_json::json!({ "report": i }))
        };
        engine.add_job(new).await?;
    }

    if cli.stats_interval > 0 {
        let engine = engine.clone();
        let every = Duration::from_secs(cli.stats_interval);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let stats = engine.stats().await;
                tracing::info!(
                    state = %stats.state,
                    in_flight = stats.in_flight,
                    running = stats.running_total(),
                    "worker stats"
                );
                for task in &stats.tasks {
                    tracing::debug!(
                        task = %task.name,
                        running = task.running,
                        capacity = task.capacity,
                        queued = ?task.queued,
                        "task stats"
                    );
                }
            }
        });
    }

    WorkerRunner::run(engine, shutdown_timeout, None).await?;

    tracing::info!("taskwerk-worker exited cleanly");
    Ok(())
}
