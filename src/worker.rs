use crate::config::WorkerConfig;
use crate::error::{QueueError, RenderError};
use crate::job::JobKind;
use crate::pipeline::{discard_artifact, ProgressReporter, RenderOutput, RenderPipeline};
use crate::queue::{AckOutcome, JobControl, JobLease, JobQueue};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, info, warn};

/// Forwards pipeline milestones to the queue under the worker's lease.
pub struct LeaseProgress {
    queue: Arc<JobQueue>,
    lease: JobLease,
}

impl ProgressReporter for LeaseProgress {
    fn report(&self, percent: u8) -> Result<(), RenderError> {
        match self.queue.update_progress(&self.lease, percent) {
            Ok(JobControl::Continue) => Ok(()),
            Ok(JobControl::Cancel) => Err(RenderError::Cancelled),
            Err(QueueError::LockMismatch(id)) => Err(RenderError::QueueStalled(id)),
            Err(e) => Err(RenderError::QueueStalled(e.to_string())),
        }
    }
}

#[derive(Default)]
struct WorkerCounters {
    running: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    processed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: String,
    pub kind: JobKind,
    pub running: bool,
    pub concurrency: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub processed: usize,
    pub failed: usize,
    pub retried: usize,
}

/// Bounded-concurrency consumer of one queue.
pub struct Worker {
    id: String,
    kind: JobKind,
    queue: Arc<JobQueue>,
    pipeline: Arc<RenderPipeline>,
    concurrency: usize,
    config: WorkerConfig,
    counters: WorkerCounters,
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        pipeline: Arc<RenderPipeline>,
        concurrency: usize,
        config: WorkerConfig,
    ) -> Self {
        let kind = queue.kind();
        Self {
            id: format!("{kind}-worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            kind,
            queue,
            pipeline,
            concurrency,
            config,
            counters: WorkerCounters::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.counters.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            id: self.id.clone(),
            kind: self.kind,
            running: self.is_running(),
            concurrency: self.concurrency,
            in_flight: c.in_flight.load(Ordering::Relaxed),
            peak_in_flight: c.peak_in_flight.load(Ordering::Relaxed),
            processed: c.processed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
        }
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run(cancel).await })
    }

    /// Lease and process jobs until `cancel` fires, then drain in-flight
    /// pipelines for up to the shutdown grace and abandon the rest.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(worker_id = %self.id, kind = %self.kind, concurrency = self.concurrency, "Starting worker");
        self.counters.running.store(true, Ordering::SeqCst);

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    self.reap(joined);
                    continue;
                }
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some(lease) = self.queue.lease(&self.id) else {
                drop(permit);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => self.reap(joined),
                    _ = self.queue.wait_for_job(self.config.poll_interval) => {}
                }
                continue;
            };

            let worker = self.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.process(lease).await;
            });
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(worker_id = %self.id, in_flight, "Draining in-flight jobs");
            let drained = tokio::time::timeout(self.config.shutdown_grace, async {
                while let Some(joined) = tasks.join_next().await {
                    self.reap(joined);
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    worker_id = %self.id,
                    abandoned = tasks.len(),
                    "Shutdown grace elapsed, abandoning jobs to stall recovery"
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }

        self.counters.running.store(false, Ordering::SeqCst);
        info!(worker_id = %self.id, "Worker stopped");
    }

    fn reap(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(worker_id = %self.id, "Job task panicked outside the pipeline");
            }
        }
    }

    async fn process(&self, lease: JobLease) {
        let c = &self.counters;
        let now = c.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        c.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        debug!(worker_id = %self.id, job_id = %lease.job_id(), attempt = lease.job.attempts + 1, "Processing job");

        let outcome = self.render(&lease).await;
        if let Some(outcome) = outcome {
            self.acknowledge(&lease, outcome);
        }

        c.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run the pipeline in its own task so a panic becomes a failed attempt,
    /// renewing the lock every half lock period meanwhile.
    ///
    /// Returns `None` when the lock was lost; the job belongs to someone else then.
    async fn render(&self, lease: &JobLease) -> Option<Result<RenderOutput, RenderError>> {
        let pipeline = self.pipeline.clone();
        let job = lease.job.clone();
        let progress = LeaseProgress {
            queue: self.queue.clone(),
            lease: lease.clone(),
        };
        let mut render = AbortOnDropHandle::new(tokio::spawn(async move {
            pipeline.run(&job, &progress).await
        }));

        let renew_every = (self.queue.config().lock_duration / 2).max(Duration::from_millis(10));
        let mut renew = tokio::time::interval(renew_every);
        renew.tick().await;

        loop {
            tokio::select! {
                joined = &mut render => {
                    return Some(match joined {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            if e.is_panic() {
                                error!(worker_id = %self.id, job_id = %lease.job_id(), "Render pipeline panicked");
                            }
                            Err(RenderError::Unknown)
                        }
                    });
                }
                _ = renew.tick() => {
                    if let Err(e) = self.queue.extend_lock(lease) {
                        warn!(worker_id = %self.id, job_id = %lease.job_id(), error = %e, "Lost job lock, abandoning render");
                        return None;
                    }
                }
            }
        }
    }

    fn acknowledge(&self, lease: &JobLease, outcome: Result<RenderOutput, RenderError>) {
        let c = &self.counters;
        match outcome {
            Ok(output) => {
                let key = output.result.key.clone();
                match self.queue.acknowledge_success(lease, output.result) {
                    Ok(AckOutcome::Completed) => {
                        c.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => discard_artifact(self.pipeline.store().clone(), key),
                    Err(e) => {
                        warn!(worker_id = %self.id, job_id = %lease.job_id(), error = %e, "Success acknowledgement rejected");
                        discard_artifact(self.pipeline.store().clone(), key);
                    }
                }
            }
            Err(error) => match self.queue.acknowledge_failure(lease, &error) {
                Ok(AckOutcome::Retrying { .. }) => {
                    c.retried.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {
                    c.failed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(worker_id = %self.id, job_id = %lease.job_id(), error = %e, "Failure acknowledgement rejected");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser_pool::BrowserPool;
    use crate::config::{PoolConfig, QueueConfig, RenderConfig};
    use crate::job::{JobRequest, JobStatus};
    use crate::queue::JobEventKind;
    use crate::storage::MemoryStore;
    use crate::testing::FakeLauncher;

    struct Harness {
        queue: Arc<JobQueue>,
        pool: Arc<BrowserPool>,
        launcher: Arc<FakeLauncher>,
        worker: Arc<Worker>,
    }

    async fn harness(concurrency: usize, max_attempts: u32) -> Harness {
        let launcher = Arc::new(FakeLauncher::new());
        let pool = BrowserPool::new(
            PoolConfig {
                max_concurrent_browsers: 2,
                contexts_per_browser: 4,
                ..Default::default()
            },
            launcher.clone(),
        );
        pool.start().await.unwrap();

        let queue = Arc::new(JobQueue::new(
            JobKind::Screenshot,
            QueueConfig {
                max_attempts,
                backoff_base: Duration::from_millis(10),
                ..Default::default()
            },
        ));
        let pipeline = Arc::new(RenderPipeline::new(
            pool.clone(),
            Arc::new(MemoryStore::new()),
            RenderConfig::default(),
        ));
        let worker = Arc::new(Worker::new(
            queue.clone(),
            pipeline,
            concurrency,
            WorkerConfig {
                poll_interval: Duration::from_millis(10),
                shutdown_grace: Duration::from_secs(2),
                ..Default::default()
            },
        ));
        Harness {
            queue,
            pool,
            launcher,
            worker,
        }
    }

    async fn wait_terminal(queue: &JobQueue, id: &str) -> crate::job::Job {
        for _ in 0..200 {
            if let Some(job) = queue.get_job(id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_worker_completes_job() {
        let h = harness(2, 3).await;
        let mut events = h.queue.subscribe();
        let cancel = CancellationToken::new();
        let handle = h.worker.spawn(cancel.clone());

        let id = h.queue.enqueue(JobRequest::screenshot("https://example.com")).unwrap();
        let job = wait_terminal(&h.queue, &id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.attempts, 1);

        let mut last = None;
        while let Ok(event) = events.try_recv() {
            last = Some(event.event);
        }
        assert!(matches!(last, Some(JobEventKind::Completed(_))));

        cancel.cancel();
        handle.await.unwrap();
        assert!(!h.worker.is_running());
        assert_eq!(h.worker.stats().processed, 1);
        assert_eq!(h.pool.stats().active_leases, 0);
    }

    #[tokio::test]
    async fn test_worker_respects_concurrency() {
        let h = harness(2, 3).await;
        h.launcher.navigation_delay(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let handle = h.worker.spawn(cancel.clone());

        let ids: Vec<_> = (0..6)
            .map(|i| {
                h.queue
                    .enqueue(JobRequest::screenshot(format!("https://{i}.test")))
                    .unwrap()
            })
            .collect();
        for id in &ids {
            assert_eq!(wait_terminal(&h.queue, id).await.status, JobStatus::Completed);
        }

        cancel.cancel();
        handle.await.unwrap();
        let stats = h.worker.stats();
        assert_eq!(stats.processed, 6);
        assert!(stats.peak_in_flight <= 2);
    }

    #[tokio::test]
    async fn test_pipeline_panic_becomes_unknown_error() {
        let h = harness(1, 1).await;
        h.launcher.panic_on_capture(true);
        let cancel = CancellationToken::new();
        let handle = h.worker.spawn(cancel.clone());

        let id = h.queue.enqueue(JobRequest::screenshot("https://example.com")).unwrap();
        let job = wait_terminal(&h.queue, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("Unknown error"));

        cancel.cancel();
        handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.pool.stats().active_leases, 0, "dropped lease was released");
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_job() {
        let h = harness(1, 3).await;
        h.launcher.navigation_delay(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let handle = h.worker.spawn(cancel.clone());

        let id = h.queue.enqueue(JobRequest::screenshot("https://example.com")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.queue.get_job(&id).unwrap().status, JobStatus::Active);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(h.queue.get_job(&id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancelled_active_job_ends_failed() {
        let h = harness(1, 3).await;
        h.launcher.navigation_delay(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let handle = h.worker.spawn(cancel.clone());

        let id = h.queue.enqueue(JobRequest::screenshot("https://example.com")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.queue.cancel(&id);

        let job = wait_terminal(&h.queue, &id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert_eq!(job.attempts, 1, "cancellation is not retried");

        cancel.cancel();
        handle.await.unwrap();
    }
}
