use crate::chrome::ChromeLauncher;
use crate::clock::SystemClock;
use crate::config::{Config, Viewport};
use crate::dispatcher::Dispatcher;
use crate::job::{
    ImageFormat, JobKind, JobOptions, JobRequest, PdfOptions, Priority, ScreenshotOptions,
    WaitUntil,
};
use crate::metrics;
use crate::queue::JobEventKind;
use crate::storage::{LocalStore, MemoryStore};
use crate::utils::{format_bytes, format_duration};
use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "render-farm")]
#[command(about = "Headless browser screenshot and PDF render service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(flatten)]
    pub overrides: Overrides,
}

/// Per-field overrides applied on top of the configuration file.
#[derive(Args, Debug, Default, Clone)]
pub struct Overrides {
    #[arg(long, global = true, env = "MAX_CONCURRENT_BROWSERS")]
    pub max_concurrent_browsers: Option<usize>,

    #[arg(long, global = true, env = "CONTEXTS_PER_BROWSER")]
    pub contexts_per_browser: Option<usize>,

    #[arg(long, global = true, env = "SCREENSHOT_CONCURRENCY")]
    pub screenshot_concurrency: Option<usize>,

    #[arg(long, global = true, env = "PDF_CONCURRENCY")]
    pub pdf_concurrency: Option<usize>,

    #[arg(long, global = true, env = "DEFAULT_TIMEOUT_MS")]
    pub default_timeout_ms: Option<u64>,

    #[arg(long, global = true, env = "NAVIGATION_TIMEOUT_MS")]
    pub navigation_timeout_ms: Option<u64>,

    #[arg(long, global = true, env = "JOB_MAX_ATTEMPTS")]
    pub job_max_attempts: Option<u32>,

    #[arg(long, global = true, env = "JOB_BACKOFF_MS")]
    pub job_backoff_ms: Option<u64>,

    #[arg(long, global = true, env = "COMPLETED_RETENTION_SECS")]
    pub completed_retention_secs: Option<u64>,

    #[arg(long, global = true, env = "FAILED_RETENTION_SECS")]
    pub failed_retention_secs: Option<u64>,

    #[arg(long, global = true, env = "CHROME_PATH", help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, env = "STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "QUEUE_STATE_DIR")]
    pub queue_state_dir: Option<PathBuf>,

    #[arg(long, global = true, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(n) = self.max_concurrent_browsers {
            config.pool.max_concurrent_browsers = n;
        }
        if let Some(n) = self.contexts_per_browser {
            config.pool.contexts_per_browser = n;
        }
        if let Some(n) = self.screenshot_concurrency {
            config.workers.screenshot_concurrency = n;
        }
        if let Some(n) = self.pdf_concurrency {
            config.workers.pdf_concurrency = n;
        }
        if let Some(ms) = self.default_timeout_ms {
            config.render.default_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.navigation_timeout_ms {
            config.render.navigation_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = self.job_max_attempts {
            config.queue.max_attempts = n;
        }
        if let Some(ms) = self.job_backoff_ms {
            config.queue.backoff_base = Duration::from_millis(ms);
        }
        if let Some(secs) = self.completed_retention_secs {
            config.queue.completed_retention.max_age = Duration::from_secs(secs);
        }
        if let Some(secs) = self.failed_retention_secs {
            config.queue.failed_retention.max_age = Duration::from_secs(secs);
        }
        if let Some(path) = &self.chrome_path {
            config.pool.chrome_path = Some(path.clone());
        }
        if let Some(dir) = &self.storage_dir {
            config.storage.root = dir.clone();
        }
        if let Some(dir) = &self.queue_state_dir {
            config.queue.state_dir = Some(dir.clone());
        }
        if let Some(port) = self.metrics_port {
            config.metrics.prometheus_port = Some(port);
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the dispatcher until SIGINT/SIGTERM
    Serve {
        #[arg(long, help = "JSON-lines file of job requests to enqueue at startup")]
        seed: Option<PathBuf>,
    },

    /// Render one page synchronously and write the artifact to a file
    Render(RenderArgs),

    /// Validate configuration
    Validate {
        #[arg(help = "Configuration file to validate")]
        file: PathBuf,
    },

    /// Start the browser pool and print the readiness report
    Health {
        #[arg(long, help = "Print the full report as JSON")]
        detailed: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    #[arg(short, long, help = "URL to render", conflicts_with = "html")]
    pub url: Option<String>,

    #[arg(long, help = "File with inline HTML to render")]
    pub html: Option<PathBuf>,

    #[arg(short, long, default_value = "screenshot", help = "screenshot or pdf")]
    pub kind: JobKind,

    #[arg(short, long, help = "Output file path")]
    pub output: PathBuf,

    #[arg(long, help = "Image format (png, jpeg, webp)")]
    pub format: Option<String>,

    #[arg(long, help = "Viewport width")]
    pub width: Option<u32>,

    #[arg(long, help = "Viewport height")]
    pub height: Option<u32>,

    #[arg(long, help = "Capture the full scrollable page")]
    pub full_page: bool,

    #[arg(long, help = "Print the PDF in landscape")]
    pub landscape: bool,

    #[arg(long, help = "CSS selector to wait for before capturing")]
    pub selector: Option<String>,

    #[arg(long, help = "Navigation lifecycle event (load, domcontentloaded, networkidle)")]
    pub wait_until: Option<String>,

    #[arg(long, help = "Extra delay in milliseconds before capturing")]
    pub wait: Option<u64>,
}

/// Load the optional configuration file, apply overrides and validate.
pub async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    args.overrides.apply(&mut config);
    config.validate()?;

    info!(
        browsers = config.pool.max_concurrent_browsers,
        contexts_per_browser = config.pool.contexts_per_browser,
        screenshot_concurrency = config.workers.screenshot_concurrency,
        pdf_concurrency = config.workers.pdf_concurrency,
        "Configuration loaded"
    );
    Ok(config)
}

pub struct CliRunner {
    config: Config,
}

impl CliRunner {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, command: Commands, shutdown: CancellationToken) -> anyhow::Result<()> {
        match command {
            Commands::Serve { seed } => self.run_server(seed, shutdown).await,
            Commands::Render(args) => self.run_render(args).await,
            Commands::Validate { file } => validate_config(&file).await,
            Commands::Health { detailed } => self.show_health(detailed).await,
        }
    }

    async fn dispatcher_with(&self, store: Arc<dyn crate::storage::ArtifactStore>) -> anyhow::Result<Dispatcher> {
        let launcher = Arc::new(ChromeLauncher::new(self.config.pool.clone()));
        Ok(Dispatcher::new(self.config.clone(), launcher, store, Arc::new(SystemClock)).await?)
    }

    pub async fn run_server(&self, seed: Option<PathBuf>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let store = Arc::new(LocalStore::new(
            self.config.storage.root.clone(),
            self.config.storage.base_url.clone(),
        ));
        let dispatcher = self.dispatcher_with(store).await?;
        dispatcher.start().await?;

        let event_log = spawn_event_log(&dispatcher, shutdown.clone());

        if let Some(path) = seed {
            match read_requests_from_file(&path).await {
                Ok(requests) => {
                    let total = requests.len();
                    let mut accepted = 0;
                    for request in requests {
                        match dispatcher.enqueue(request) {
                            Ok(_) => accepted += 1,
                            Err(e) => warn!(error = %e, "Rejected seeded job"),
                        }
                    }
                    info!(accepted, total, "Seeded jobs");
                }
                Err(e) => error!(error = %e, "Failed to read seed file"),
            }
        }

        shutdown.cancelled().await;
        info!("Shutdown requested");
        dispatcher.stop().await;
        event_log.abort();
        Ok(())
    }

    pub async fn run_render(&self, args: RenderArgs) -> anyhow::Result<()> {
        let html = match &args.html {
            Some(path) => Some(
                fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?,
            ),
            None => None,
        };
        let request = create_single_request(&args, html)?;

        let store = Arc::new(MemoryStore::new());
        let dispatcher = self.dispatcher_with(store.clone()).await?;
        dispatcher.pool().start().await?;

        let rendered = dispatcher.render_sync(request).await;
        dispatcher.stop().await;
        let output = rendered?;

        let artifact = store
            .get(&output.result.key)
            .ok_or_else(|| anyhow!("artifact {} vanished", output.result.key))?;
        fs::write(&args.output, &artifact.bytes)
            .await
            .with_context(|| format!("writing {}", args.output.display()))?;

        println!(
            "Rendered {} ({}) in {}",
            args.output.display(),
            format_bytes(output.result.size),
            format_duration(output.duration)
        );
        if let Some((width, height)) = output.dimensions {
            println!("Dimensions: {width}x{height}");
        }
        Ok(())
    }

    pub async fn show_health(&self, detailed: bool) -> anyhow::Result<()> {
        let dispatcher = self.dispatcher_with(Arc::new(MemoryStore::new())).await?;
        dispatcher.pool().start().await?;
        let report = dispatcher.check_health().await;
        dispatcher.stop().await;

        if detailed {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("System Health Check");
        println!("==================");
        println!("Overall: {:?} (ready: {})", report.overall, report.ready);
        let stats = &report.pool.stats;
        println!("Browser Pool:");
        println!("  Instances: {}", stats.total_instances);
        println!("  Healthy instances: {}", stats.healthy_instances);
        println!("  Active leases: {}/{}", stats.active_leases, stats.capacity);
        println!("\nQueues:");
        for queue in &report.queues {
            println!(
                "  {}: {} waiting, {} active, {} delayed",
                queue.kind, queue.stats.waiting, queue.stats.active, queue.stats.delayed
            );
        }
        if !report.issues.is_empty() {
            println!("\nIssues:");
            for issue in &report.issues {
                println!("  - {issue}");
            }
        }
        Ok(())
    }
}

/// Log every terminal job event until shutdown.
fn spawn_event_log(dispatcher: &Dispatcher, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut screenshots = dispatcher.subscribe(JobKind::Screenshot);
    let mut pdfs = dispatcher.subscribe(JobKind::Pdf);

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = screenshots.recv() => event,
                event = pdfs.recv() => event,
            };
            let event = match event {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Event log fell behind");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match &event.event {
                JobEventKind::Completed(result) => {
                    info!(job_id = %event.job_id, kind = %event.kind, url = %result.url, "Job completed")
                }
                JobEventKind::Failed(reason) => {
                    warn!(job_id = %event.job_id, kind = %event.kind, %reason, "Job failed")
                }
                _ => {}
            }
        }
    })
}

pub async fn validate_config(path: &Path) -> anyhow::Result<()> {
    println!("Validating configuration: {}", path.display());
    let config = Config::from_file(path).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!(
        "  Browsers: {} x {} contexts",
        config.pool.max_concurrent_browsers, config.pool.contexts_per_browser
    );
    println!(
        "  Workers: {} screenshot, {} pdf",
        config.workers.screenshot_concurrency, config.workers.pdf_concurrency
    );
    println!(
        "  Attempts: {} (backoff {:?})",
        config.queue.max_attempts, config.queue.backoff_base
    );
    println!(
        "  Viewport: {}x{}",
        config.render.default_viewport.width, config.render.default_viewport.height
    );
    Ok(())
}

/// Parse a JSON-lines file of job requests. Blank lines and `#` comments are skipped.
pub async fn read_requests_from_file(path: &Path) -> anyhow::Result<Vec<JobRequest>> {
    let content = fs::read_to_string(path).await?;
    parse_requests(&content)
}

fn parse_requests(content: &str) -> anyhow::Result<Vec<JobRequest>> {
    content
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            serde_json::from_str(line).with_context(|| format!("line {number}"))
        })
        .collect()
}

pub fn create_single_request(args: &RenderArgs, html: Option<String>) -> anyhow::Result<JobRequest> {
    let viewport = match (args.width, args.height) {
        (None, None) => None,
        (width, height) => {
            let default = Viewport::default();
            Some(Viewport {
                width: width.unwrap_or(default.width),
                height: height.unwrap_or(default.height),
                ..default
            })
        }
    };
    let wait_until = match args.wait_until.as_deref() {
        None | Some("load") => WaitUntil::Load,
        Some("domcontentloaded") => WaitUntil::DomContentLoaded,
        Some("networkidle") => WaitUntil::NetworkIdle,
        Some(other) => bail!("unknown wait-until event: {other}"),
    };

    let mut options = match args.kind {
        JobKind::Screenshot => {
            let format = match args.format.as_deref().map(str::to_ascii_lowercase).as_deref() {
                None | Some("png") => ImageFormat::Png,
                Some("jpeg") | Some("jpg") => ImageFormat::Jpeg,
                Some("webp") => ImageFormat::Webp,
                Some(other) => bail!("unknown image format: {other}"),
            };
            JobOptions::Screenshot(ScreenshotOptions {
                format,
                full_page: args.full_page,
                ..Default::default()
            })
        }
        JobKind::Pdf => JobOptions::Pdf(PdfOptions {
            landscape: args.landscape,
            ..Default::default()
        }),
    };

    let render = options.render_mut();
    render.viewport = viewport;
    render.wait_until = wait_until;
    render.wait_for_selector = args.selector.clone();
    render.delay = args.wait.map(Duration::from_millis);

    Ok(JobRequest {
        id: None,
        url: args.url.clone(),
        html,
        options,
        priority: Priority::High,
        max_attempts: None,
    })
}

/// Install the fmt subscriber; `RUST_LOG` wins over the verbosity flag.
pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;
    Ok(())
}

/// Install the Prometheus exporter when a port is configured.
pub fn setup_metrics(config: &Config) -> anyhow::Result<()> {
    if let Some(port) = config.metrics.prometheus_port {
        metrics::install_prometheus(port)?;
    }
    Ok(())
}
