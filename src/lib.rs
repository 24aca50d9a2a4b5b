//! # Render Farm
//!
//! A screenshot and PDF render service built on a pool of headless Chrome
//! processes. Render requests go into one durable priority queue per job kind;
//! bounded worker groups lease jobs, run them through the render pipeline on an
//! isolated browser context and store the artifact.
//!
//! ## Architecture
//!
//! | Component | Responsibility |
//! |-----------|----------------|
//! | [`BrowserPool`] | Bounded browser processes, context leases, health monitoring and replacement |
//! | [`JobQueue`] | Priority + FIFO ordering, locks with stall recovery, retry with backoff, retention |
//! | [`Worker`] | Leases jobs for one kind with bounded concurrency |
//! | [`RenderPipeline`] | Context setup, navigation, capture, upload with progress milestones |
//! | [`Dispatcher`] | Lifecycle of all of the above plus the API-facing façade |
//!
//! ## Job lifecycle
//!
//! `Pending → Active → Completed`, or `Active → Pending` again while retries
//! remain (after `backoff_base × 2^(attempts-1)`), or `Active → Failed` once
//! they are exhausted. A worker that stops renewing its lock loses the job to
//! stall recovery.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use render_farm::{ChromeLauncher, Config, Dispatcher, JobKind, JobRequest, LocalStore, SystemClock};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let launcher = Arc::new(ChromeLauncher::new(config.pool.clone()));
//!     let store = Arc::new(LocalStore::new("artifacts", "http://localhost:8080/artifacts"));
//!     let dispatcher = Dispatcher::new(config, launcher, store, Arc::new(SystemClock)).await?;
//!     dispatcher.start().await?;
//!
//!     let id = dispatcher.enqueue(JobRequest::screenshot("https://example.com"))?;
//!     println!("{:?}", dispatcher.get_job_status(JobKind::Screenshot, &id));
//!
//!     dispatcher.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! render-farm serve --seed jobs.jsonl
//! render-farm render --url https://example.com --output page.png
//! render-farm render --url https://example.com --kind pdf --output page.pdf
//! ```

/// Browser pool management for concurrent Chrome instances
pub mod browser_pool;

/// chromiumoxide-backed browser engine
pub mod chrome;

/// Command-line interface implementation
pub mod cli;

/// Time source used by the queue
pub mod clock;

/// Configuration and settings
pub mod config;

/// Lifecycle controller and API façade
pub mod dispatcher;

/// Browser engine seams
pub mod engine;

/// Error types
pub mod error;

/// Readiness reporting
pub mod health;

/// Job records and options
pub mod job;

/// Metric recording helpers
pub mod metrics;

/// Render pipeline for a single job
pub mod pipeline;

/// Durable priority job queue
pub mod queue;

/// Artifact storage
pub mod storage;

/// Utility functions and helpers
pub mod utils;

/// Queue consumers
pub mod worker;

#[cfg(test)]
mod testing;


pub use browser_pool::{BrowserPool, InstanceHealth, InstanceStatus, LeasedContext, PoolHealth, PoolStats};
pub use chrome::ChromeLauncher;
pub use cli::{load_config, setup_logging, setup_metrics, Cli, CliRunner, Commands};
pub use clock::{Clock, FakeClock, SystemClock};
pub use config::*;
pub use dispatcher::Dispatcher;
pub use engine::{BrowserLauncher, BrowserProcess, ContextOptions, RenderPage};
pub use error::*;
pub use health::{HealthLevel, HealthReport, HealthThresholds, SystemHealthChecker};
pub use job::*;
pub use pipeline::{NoProgress, ProgressReporter, RenderOutput, RenderPipeline};
pub use queue::{
    AckOutcome, CancelOutcome, JobControl, JobEvent, JobEventKind, JobLease, JobQueue, QueueStats,
};
pub use storage::{ArtifactStore, LocalStore, MemoryStore, Metadata};
pub use utils::*;
pub use worker::{Worker, WorkerStats};
