//! Lifecycle controller and API façade
//!
//! The [`Dispatcher`] owns one browser pool, one render pipeline and one queue
//! per job kind. `start` brings up the pool, one worker group per kind and the
//! background tasks; `stop` tears them down in reverse order.

use crate::browser_pool::BrowserPool;
use crate::clock::Clock;
use crate::config::Config;
use crate::engine::BrowserLauncher;
use crate::error::{RenderError, ServiceError};
use crate::health::{HealthReport, SystemHealthChecker};
use crate::job::{Job, JobId, JobKind, JobRequest, JobStatus};
use crate::metrics;
use crate::pipeline::{NoProgress, RenderOutput, RenderPipeline};
use crate::queue::{CancelOutcome, JobEvent, JobQueue, QueueStats};
use crate::storage::ArtifactStore;
use crate::worker::{Worker, WorkerStats};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct Running {
    workers_cancel: CancellationToken,
    background_cancel: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
    background_handles: Vec<JoinHandle<()>>,
}

pub struct Dispatcher {
    config: Config,
    clock: Arc<dyn Clock>,
    pool: Arc<BrowserPool>,
    pipeline: Arc<RenderPipeline>,
    screenshots: Arc<JobQueue>,
    pdfs: Arc<JobQueue>,
    health: SystemHealthChecker,
    workers: Mutex<Vec<Arc<Worker>>>,
    running: Mutex<Option<Running>>,
    started: AtomicBool,
}

impl Dispatcher {
    /// Build every component and restore queue snapshots. Nothing runs until
    /// [`Dispatcher::start`].
    pub async fn new(
        config: Config,
        launcher: Arc<dyn BrowserLauncher>,
        store: Arc<dyn ArtifactStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let pool = BrowserPool::new(config.pool.clone(), launcher);
        let pipeline = Arc::new(RenderPipeline::new(pool.clone(), store, config.render.clone()));
        let screenshots =
            Arc::new(JobQueue::open(JobKind::Screenshot, config.queue.clone(), clock.clone()).await?);
        let pdfs = Arc::new(JobQueue::open(JobKind::Pdf, config.queue.clone(), clock.clone()).await?);

        Ok(Self {
            config,
            clock,
            pool,
            pipeline,
            screenshots,
            pdfs,
            health: SystemHealthChecker::default(),
            workers: Mutex::new(Vec::new()),
            running: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BrowserPool> {
        &self.pool
    }

    pub fn queue(&self, kind: JobKind) -> &Arc<JobQueue> {
        match kind {
            JobKind::Screenshot => &self.screenshots,
            JobKind::Pdf => &self.pdfs,
        }
    }

    fn concurrency(&self, kind: JobKind) -> usize {
        match kind {
            JobKind::Screenshot => self.config.workers.screenshot_concurrency,
            JobKind::Pdf => self.config.workers.pdf_concurrency,
        }
    }

    /// Initialize storage, launch the pool, then spawn workers and background tasks.
    ///
    /// A dispatcher runs once: after [`Dispatcher::stop`] its pool is shut down
    /// for good and `start` is refused. Build a new dispatcher to run again.
    pub async fn start(&self) -> Result<(), ServiceError> {
        if self.pool.is_shutting_down() {
            return Err(RenderError::BrowserUnavailable(
                "dispatcher was stopped and cannot be restarted".to_string(),
            )
            .into());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting dispatcher...");

        let prepared = async {
            self.pipeline.store().initialize().await?;
            self.pool.start().await?;
            Ok::<(), ServiceError>(())
        };
        if let Err(e) = prepared.await {
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let workers_cancel = CancellationToken::new();
        let background_cancel = CancellationToken::new();
        let mut workers = Vec::new();
        let mut worker_handles = Vec::new();
        for kind in JobKind::ALL {
            let concurrency = self.concurrency(kind);
            if concurrency == 0 {
                debug!(%kind, "No workers configured");
                continue;
            }
            let worker = Arc::new(Worker::new(
                self.queue(kind).clone(),
                self.pipeline.clone(),
                concurrency,
                self.config.workers.clone(),
            ));
            worker_handles.push(worker.spawn(workers_cancel.clone()));
            workers.push(worker);
        }

        let mut background_handles: Vec<JoinHandle<()>> = JobKind::ALL
            .iter()
            .filter_map(|kind| self.queue(*kind).spawn_persistence(background_cancel.clone()))
            .collect();
        background_handles.push(self.spawn_maintenance(background_cancel.clone()));

        info!(
            workers = workers.len(),
            screenshot_concurrency = self.concurrency(JobKind::Screenshot),
            pdf_concurrency = self.concurrency(JobKind::Pdf),
            "Dispatcher started"
        );
        *self.workers.lock() = workers;
        *self.running.lock() = Some(Running {
            workers_cancel,
            background_cancel,
            worker_handles,
            background_handles,
        });
        Ok(())
    }

    /// Stall recovery, retention pruning and depth gauges on a fixed interval.
    fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queues = [self.screenshots.clone(), self.pdfs.clone()];
        let every = self.config.workers.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for queue in &queues {
                            let recovered = queue.recover_stalled();
                            if !recovered.is_empty() {
                                info!(kind = %queue.kind(), recovered = recovered.len(), "Stall recovery ran");
                            }
                            queue.prune();
                            metrics::record_queue_depth(queue.kind(), &queue.stats());
                        }
                    }
                }
            }
            debug!("Maintenance task stopped");
        })
    }

    /// Stop leasing, drain workers within the grace period, flush queue
    /// snapshots and shut the pool down.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            self.pool.shutdown().await;
            return;
        };
        info!("Stopping dispatcher...");

        running.workers_cancel.cancel();
        for handle in running.worker_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }

        running.background_cancel.cancel();
        for handle in running.background_handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }
        for kind in JobKind::ALL {
            if let Err(e) = self.queue(kind).flush().await {
                warn!(%kind, error = %e, "Failed to flush job queue");
            }
        }

        self.pool.shutdown().await;
        self.started.store(false, Ordering::SeqCst);
        info!("Dispatcher stopped");
    }

    pub fn enqueue(&self, request: JobRequest) -> Result<JobId, ServiceError> {
        Ok(self.queue(request.kind()).enqueue(request)?)
    }

    pub fn get_job_status(&self, kind: JobKind, job_id: &str) -> Option<Job> {
        self.queue(kind).get_job(job_id)
    }

    pub fn cancel(&self, kind: JobKind, job_id: &str) -> CancelOutcome {
        self.queue(kind).cancel(job_id)
    }

    pub fn get_queue_stats(&self, kind: JobKind) -> QueueStats {
        self.queue(kind).stats()
    }

    pub fn subscribe(&self, kind: JobKind) -> broadcast::Receiver<JobEvent> {
        self.queue(kind).subscribe()
    }

    /// Render immediately, bypassing the queue but not the pool or pipeline.
    ///
    /// There is no retry: the first failure is returned to the caller.
    pub async fn render_sync(&self, request: JobRequest) -> Result<RenderOutput, ServiceError> {
        let source = request.validate().map_err(RenderError::InvalidRequest)?;
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| format!("sync-{}", Uuid::new_v4()));
        let now = self.clock.now();
        let mut job = Job::pending(id, request, source, 1, now);
        job.status = JobStatus::Active;
        job.attempts = 1;
        job.started_at = Some(now);

        let pipeline = self.pipeline.clone();
        let render = AbortOnDropHandle::new(tokio::spawn(async move {
            pipeline.run(&job, &NoProgress).await
        }));
        match render.await {
            Ok(outcome) => Ok(outcome?),
            Err(e) => {
                if e.is_panic() {
                    error!("Synchronous render panicked");
                }
                Err(RenderError::Unknown.into())
            }
        }
    }

    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.lock().iter().map(|w| w.stats()).collect()
    }

    /// Pool health, worker liveness and queue depth in one readiness report.
    pub async fn check_health(&self) -> HealthReport {
        let pool = self.pool.check_health().await;
        let queues = JobKind::ALL
            .iter()
            .map(|kind| (*kind, self.get_queue_stats(*kind)))
            .collect();
        self.health.assess(pool, self.worker_stats(), queues)
    }
}
