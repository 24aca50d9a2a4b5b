//! Configuration management with serde serialization/deserialization
//!
//! This module provides every tunable of the render farm: browser pool sizing,
//! queue locking/retry/retention policy, worker concurrency and render timeouts.
//! A JSON file can provide the base values; the CLI (and its environment
//! variables) overrides individual fields on top.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the render farm
///
/// # Examples
///
/// ```rust
/// use render_farm::Config;
///
/// let mut config = Config::default();
/// config.pool.max_concurrent_browsers = 4;
/// config.workers.screenshot_concurrency = 8;
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub render: RenderConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

/// Browser pool sizing and health monitoring
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live browser processes (default: 2)
    pub max_concurrent_browsers: usize,

    /// Isolated contexts a single browser may host at once (default: 4)
    pub contexts_per_browser: usize,

    /// How long `acquire_page` waits for a free slot before `PoolExhausted` (default: 10s)
    pub acquire_timeout: Duration,

    /// Upper bound on launching one browser process (default: 30s)
    pub launch_timeout: Duration,

    /// Upper bound on creating a context and page inside a browser (default: 10s)
    pub context_timeout: Duration,

    /// Interval of the background health monitor (default: 30s)
    pub health_check_interval: Duration,

    /// Deadline for a single health ping (default: 5s)
    pub ping_timeout: Duration,

    /// How long shutdown waits for outstanding leases (default: 10s)
    pub shutdown_grace: Duration,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Directory holding per-instance user data dirs (default: system temp dir)
    pub user_data_root: Option<PathBuf>,

    /// Memory limit per Chrome instance in bytes (default: 1GB)
    pub memory_limit: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_browsers: 2,
            contexts_per_browser: 4,
            acquire_timeout: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(30),
            context_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            chrome_path: None,
            user_data_root: None,
            memory_limit: Some(1024 * 1024 * 1024), // 1GB
        }
    }
}

impl PoolConfig {
    /// Maximum number of outstanding context leases across the whole pool.
    pub fn max_leases(&self) -> usize {
        self.max_concurrent_browsers * self.contexts_per_browser
    }
}

/// Retention window for terminal jobs
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
    pub max_count: usize,
}

/// Job queue locking, retry and retention policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Lock held by a worker on a leased job (default: 30s)
    pub lock_duration: Duration,

    /// Stall recoveries allowed before a job is failed (default: 2)
    pub max_stalled_count: u32,

    /// Attempts a job gets before it fails permanently (default: 3)
    pub max_attempts: u32,

    /// First retry delay, doubled for every further attempt (default: 2s)
    pub backoff_base: Duration,

    /// Completed jobs kept for polling (default: 1h / 1000 jobs)
    pub completed_retention: RetentionPolicy,

    /// Failed jobs kept for diagnosis (default: 24h / 5000 jobs)
    pub failed_retention: RetentionPolicy,

    /// Snapshot directory; the queue is memory-only when unset
    pub state_dir: Option<PathBuf>,

    /// Debounce between snapshot writes (default: 250ms)
    pub persist_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            max_stalled_count: 2,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            completed_retention: RetentionPolicy {
                max_age: Duration::from_secs(60 * 60),
                max_count: 1000,
            },
            failed_retention: RetentionPolicy {
                max_age: Duration::from_secs(24 * 60 * 60),
                max_count: 5000,
            },
            state_dir: None,
            persist_interval: Duration::from_millis(250),
        }
    }
}

/// Worker group sizing and lifecycle timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Parallel screenshot pipelines (default: 4)
    pub screenshot_concurrency: usize,

    /// Parallel PDF pipelines (default: 3)
    pub pdf_concurrency: usize,

    /// Idle poll interval when a queue is empty (default: 1s)
    pub poll_interval: Duration,

    /// Stall recovery and retention pruning interval (default: 5s)
    pub maintenance_interval: Duration,

    /// How long shutdown waits for in-flight pipelines (default: 30s)
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            screenshot_concurrency: 4,
            pdf_concurrency: 3,
            poll_interval: Duration::from_secs(1),
            maintenance_interval: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Render pipeline defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Upper bound on a whole pipeline run (default: 60s)
    pub job_timeout: Duration,

    /// Default operation timeout for captures and selector waits (default: 30s)
    pub default_timeout: Duration,

    /// Default navigation timeout when a job does not set one (default: 30s)
    pub navigation_timeout: Duration,

    /// Lifetime of the signed URL attached to results (default: 1h)
    pub signed_url_ttl: Duration,

    /// Viewport used when a job does not set one
    pub default_viewport: Viewport,

    /// User-Agent used when a job does not set one (default: browser default)
    pub user_agent: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(60),
            default_timeout: Duration::from_secs(30),
            navigation_timeout: Duration::from_secs(30),
            signed_url_ttl: Duration::from_secs(60 * 60),
            default_viewport: Viewport::default(),
            user_agent: None,
        }
    }
}

/// Artifact storage location
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the local artifact store (default: ./artifacts)
    pub root: PathBuf,

    /// Public base URL signed URLs are built on
    pub base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("artifacts"),
            base_url: "http://localhost:8080/artifacts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Port of the Prometheus scrape endpoint; disabled when unset
    pub prometheus_port: Option<u16>,
}

/// Browser viewport configuration
///
/// # Examples
///
/// ```rust
/// use render_farm::Viewport;
///
/// let mobile = Viewport {
///     width: 375,
///     height: 667,
///     device_scale_factor: 2.0,
///     mobile: true,
/// };
/// assert!(mobile.width < Viewport::default().width);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 720)
    pub height: u32,

    /// Device pixel ratio for high-DPI displays (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file; missing fields keep their defaults.
    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.pool.max_concurrent_browsers == 0 {
            return invalid("max_concurrent_browsers must be greater than 0");
        }
        if self.pool.contexts_per_browser == 0 {
            return invalid("contexts_per_browser must be greater than 0");
        }
        if self.pool.acquire_timeout.is_zero() || self.pool.ping_timeout.is_zero() {
            return invalid("pool timeouts must be greater than 0");
        }
        if self.workers.maintenance_interval.is_zero() || self.pool.health_check_interval.is_zero() {
            return invalid("background intervals must be greater than 0");
        }
        if self.queue.max_attempts == 0 {
            return invalid("max_attempts must be greater than 0");
        }
        if self.queue.lock_duration.is_zero() {
            return invalid("lock_duration must be greater than 0");
        }
        if self.render.navigation_timeout.is_zero() || self.render.job_timeout.is_zero() {
            return invalid("render timeouts must be greater than 0");
        }
        if self.render.default_viewport.width == 0 || self.render.default_viewport.height == 0 {
            return invalid("viewport dimensions must be greater than 0");
        }
        if self.queue.failed_retention.max_age < self.queue.completed_retention.max_age {
            tracing::warn!("failed jobs are retained for less time than completed jobs");
        }

        Ok(())
    }
}

/// Generate Chrome command-line arguments for one pool instance
///
/// # Examples
///
/// ```rust
/// use render_farm::{get_chrome_args, PoolConfig};
///
/// let args = get_chrome_args(&PoolConfig::default());
/// assert!(args.contains(&"--disable-gpu".to_string()));
/// ```
pub fn get_chrome_args(config: &PoolConfig) -> Vec<String> {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-process-singleton-dialog".to_string(),
        "--disable-features=ProcessSingleton".to_string(),
        "--hide-scrollbars".to_string(),
        "--mute-audio".to_string(),
        "--memory-pressure-off".to_string(),
    ];

    if let Some(memory_limit) = config.memory_limit {
        args.push(format!(
            "--js-flags=--max-old-space-size={}",
            memory_limit / 1024 / 1024
        ));
    }

    args
}
