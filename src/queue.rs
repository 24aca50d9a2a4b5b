//! Priority job queue with lease locks, stall recovery and retry backoff
//!
//! One [`JobQueue`] exists per [`JobKind`]. It is the only owner of job records:
//! every status change goes through its lease/acknowledge operations, which run
//! inside a short synchronous critical section and never across an await.
//!
//! Ordering is by priority tier first, then by enqueue order. A job whose lock
//! expires without an acknowledgement is considered stalled and goes back to
//! Pending; stalls are counted separately from attempts.

use crate::clock::{self, Clock, SystemClock};
use crate::config::{QueueConfig, RetentionPolicy};
use crate::error::{QueueError, RenderError};
use crate::job::{Job, JobId, JobKind, JobRequest, JobResult, JobSource, JobStatus, Priority};
use crate::metrics;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;
pub const STALLED_REASON: &str = "job stalled more than allowable limit";
pub const CANCELLED_REASON: &str = "Job cancelled";

/// Lifecycle notifications, in order: `Active`, any number of `Progress`,
/// then `Completed` or `Failed` exactly once per job (or `Removed` when a
/// pending job is cancelled). `Retrying` and `Stalled` send the job back to
/// Pending and a new `Active` follows.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEventKind {
    Active { attempt: u32 },
    Progress(u8),
    Retrying { attempt: u32, delay: Duration },
    Stalled { count: u32 },
    Completed(JobResult),
    Failed(String),
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub event: JobEventKind,
}

/// Exclusive claim on an Active job, handed to one worker by [`JobQueue::lease`].
#[derive(Debug, Clone)]
pub struct JobLease {
    pub job: Job,
    pub worker_id: String,
    token: Uuid,
}

impl JobLease {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Completed,
    Retrying { attempt: u32, delay: Duration },
    Failed,
    /// The job was cancelled while active; whatever it produced is discarded.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobControl {
    Continue,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Removed,
    Requested,
    AlreadyFinished,
    NotFound,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
}

impl QueueStats {
    pub fn backlog(&self) -> usize {
        self.waiting + self.delayed
    }
}

#[derive(Debug)]
struct JobLock {
    worker_id: String,
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<JobId, Job>,
    order: HashMap<JobId, u64>,
    pending: BTreeSet<(Priority, u64, JobId)>,
    locks: HashMap<JobId, JobLock>,
    next_seq: u64,
}

impl QueueState {
    fn assign_seq(&mut self, id: &str) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(id.to_string(), seq);
        seq
    }

    fn push_pending(&mut self, id: &str, priority: Priority) {
        let seq = match self.order.get(id) {
            Some(seq) => *seq,
            None => self.assign_seq(id),
        };
        self.pending.insert((priority, seq, id.to_string()));
    }

    fn remove_pending(&mut self, id: &str, priority: Priority) {
        if let Some(seq) = self.order.get(id) {
            self.pending.remove(&(priority, *seq, id.to_string()));
        }
    }

    fn remove_job(&mut self, id: &str) -> Option<Job> {
        let job = self.jobs.remove(id)?;
        self.remove_pending(id, job.priority);
        self.order.remove(id);
        self.locks.remove(id);
        Some(job)
    }

    /// The job must be Active and locked by this lease's token.
    fn owned_job(&mut self, lease: &JobLease) -> Result<&mut Job, QueueError> {
        let id = lease.job_id();
        match self.locks.get(id) {
            Some(lock) if lock.token == lease.token => {}
            _ => return Err(QueueError::LockMismatch(id.to_string())),
        }
        match self.jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Active => Ok(job),
            Some(_) => Err(QueueError::LockMismatch(id.to_string())),
            None => Err(QueueError::NotFound(id.to_string())),
        }
    }

    fn snapshot(&self, kind: JobKind) -> QueueSnapshot {
        let mut jobs: Vec<SnapshotEntry> = self
            .jobs
            .values()
            .map(|job| SnapshotEntry {
                seq: self.order.get(&job.id).copied().unwrap_or_default(),
                job: job.clone(),
            })
            .collect();
        jobs.sort_by_key(|entry| entry.seq);
        QueueSnapshot {
            kind,
            next_seq: self.next_seq,
            jobs,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    kind: JobKind,
    next_seq: u64,
    jobs: Vec<SnapshotEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    seq: u64,
    job: Job,
}

/// Exponential retry delay: `base × 2^(attempts_made - 1)`.
pub fn backoff_delay(base: Duration, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << exponent)
}

pub struct JobQueue {
    kind: JobKind,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
    events: broadcast::Sender<JobEvent>,
    job_available: Notify,
    dirty: Notify,
    flush_lock: tokio::sync::Mutex<()>,
}

impl JobQueue {
    /// Memory-only queue on the system clock.
    pub fn new(kind: JobKind, config: QueueConfig) -> Self {
        Self::with_clock(kind, config, Arc::new(SystemClock))
    }

    pub fn with_clock(kind: JobKind, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            kind,
            config,
            clock,
            state: Mutex::new(QueueState::default()),
            events,
            job_available: Notify::new(),
            dirty: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Open the queue, restoring its snapshot when a state directory is configured.
    ///
    /// Jobs that were Active when the snapshot was taken lost their worker, so
    /// they go through stall recovery right away.
    pub async fn open(
        kind: JobKind,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let queue = Self::with_clock(kind, config, clock);
        let Some(path) = queue.snapshot_path() else {
            return Ok(queue);
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(queue),
            Err(e) => return Err(e.into()),
        };
        let snapshot: QueueSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.kind != kind {
            return Err(QueueError::Persistence(format!(
                "snapshot {} belongs to the {} queue",
                path.display(),
                snapshot.kind
            )));
        }
        queue.restore(snapshot);
        Ok(queue)
    }

    fn restore(&self, snapshot: QueueSnapshot) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.next_seq = snapshot.next_seq;

        for SnapshotEntry { seq, job } in snapshot.jobs {
            state.order.insert(job.id.clone(), seq);
            state.next_seq = state.next_seq.max(seq + 1);
            match job.status {
                JobStatus::Pending => state.push_pending(&job.id, job.priority),
                JobStatus::Active => {
                    state.locks.insert(
                        job.id.clone(),
                        JobLock {
                            worker_id: "restored".to_string(),
                            token: Uuid::nil(),
                            expires_at: DateTime::<Utc>::MIN_UTC,
                        },
                    );
                }
                JobStatus::Completed | JobStatus::Failed => {}
            }
            state.jobs.insert(job.id.clone(), job);
        }

        let recovered = self.recover_stalled_locked(&mut state, now);
        info!(
            kind = %self.kind,
            jobs = state.jobs.len(),
            recovered = recovered.len(),
            "Restored job queue snapshot"
        );
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Persist a new Pending job and return its id without waiting for execution.
    pub fn enqueue(&self, request: JobRequest) -> Result<JobId, QueueError> {
        if request.kind() != self.kind {
            return Err(QueueError::InvalidJob(format!(
                "{} job submitted to the {} queue",
                request.kind(),
                self.kind
            )));
        }
        let source: JobSource = request.validate().map_err(QueueError::InvalidJob)?;

        let now = self.clock.now();
        let id = request.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.trim().is_empty() {
            return Err(QueueError::InvalidJob("job id must not be empty".to_string()));
        }

        let priority = request.priority;
        let job = Job::pending(id.clone(), request, source, self.config.max_attempts, now);

        {
            let mut state = self.state.lock();
            if state.jobs.contains_key(&id) {
                return Err(QueueError::DuplicateJob(id));
            }
            state.assign_seq(&id);
            state.push_pending(&id, job.priority);
            state.jobs.insert(id.clone(), job);
        }

        debug!(job_id = %id, kind = %self.kind, ?priority, "Job enqueued");
        metrics::record_job_enqueued(self.kind);
        self.job_available.notify_one();
        self.mark_dirty();
        Ok(id)
    }

    /// Atomically claim the next eligible Pending job for `worker_id`.
    pub fn lease(&self, worker_id: &str) -> Option<JobLease> {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if !self.recover_stalled_locked(state, now).is_empty() {
            self.mark_dirty();
        }

        let (priority, _, id) = state
            .pending
            .iter()
            .find(|(_, _, id)| state.jobs.get(id).is_some_and(|job| job.available_at <= now))
            .cloned()?;
        state.remove_pending(&id, priority);

        let token = Uuid::new_v4();
        state.locks.insert(
            id.clone(),
            JobLock {
                worker_id: worker_id.to_string(),
                token,
                expires_at: clock::add(now, self.config.lock_duration),
            },
        );

        let job = state.jobs.get_mut(&id)?;
        job.status = JobStatus::Active;
        job.progress = 0;
        job.started_at = Some(now);
        let lease = JobLease {
            job: job.clone(),
            worker_id: worker_id.to_string(),
            token,
        };
        let attempt = job.attempts + 1;
        drop(guard);

        debug!(job_id = %id, worker_id, attempt, "Job leased");
        self.emit(&id, JobEventKind::Active { attempt });
        self.mark_dirty();
        Some(lease)
    }

    /// Push the lock expiry forward; called periodically by the lease holder.
    pub fn extend_lock(&self, lease: &JobLease) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.owned_job(lease)?;
        if let Some(lock) = state.locks.get_mut(lease.job_id()) {
            lock.expires_at = clock::add(now, self.config.lock_duration);
        }
        Ok(())
    }

    /// Record advisory progress. Returns [`JobControl::Cancel`] once the job
    /// has been cancelled so the holder can stop cooperatively.
    pub fn update_progress(&self, lease: &JobLease, percent: u8) -> Result<JobControl, QueueError> {
        let percent = percent.min(100);
        let (advanced, control) = {
            let mut state = self.state.lock();
            let job = state.owned_job(lease)?;
            let advanced = percent > job.progress;
            if advanced {
                job.progress = percent;
            }
            let control = if job.cancel_requested {
                JobControl::Cancel
            } else {
                JobControl::Continue
            };
            (advanced, control)
        };

        if advanced {
            self.emit(lease.job_id(), JobEventKind::Progress(percent));
        }
        Ok(control)
    }

    pub fn acknowledge_success(
        &self,
        lease: &JobLease,
        result: JobResult,
    ) -> Result<AckOutcome, QueueError> {
        let now = self.clock.now();
        let (outcome, event, duration) = {
            let mut state = self.state.lock();
            let job = state.owned_job(lease)?;
            job.attempts += 1;
            job.completed_at = Some(now);
            let duration = job.started_at.and_then(|s| (now - s).to_std().ok());

            let (outcome, event) = if job.cancel_requested {
                job.status = JobStatus::Failed;
                job.result = None;
                job.error = Some(CANCELLED_REASON.to_string());
                (AckOutcome::Cancelled, JobEventKind::Failed(CANCELLED_REASON.to_string()))
            } else {
                job.status = JobStatus::Completed;
                job.progress = 100;
                job.error = None;
                job.result = Some(result.clone());
                (AckOutcome::Completed, JobEventKind::Completed(result))
            };
            state.locks.remove(lease.job_id());
            (outcome, event, duration)
        };

        match outcome {
            AckOutcome::Completed => {
                info!(job_id = %lease.job_id(), kind = %self.kind, attempts = lease.job.attempts + 1, "Job completed");
                metrics::record_job_completed(self.kind, duration);
            }
            _ => {
                info!(job_id = %lease.job_id(), kind = %self.kind, "Cancelled job finished, result discarded");
                metrics::record_job_failed(self.kind);
            }
        }
        self.emit(lease.job_id(), event);
        self.mark_dirty();
        Ok(outcome)
    }

    /// Count a failed attempt and either schedule a retry or fail the job.
    ///
    /// Errors that cannot succeed on another attempt fail the job immediately.
    pub fn acknowledge_failure(
        &self,
        lease: &JobLease,
        error: &RenderError,
    ) -> Result<AckOutcome, QueueError> {
        let now = self.clock.now();
        let message = error.to_string();
        let (outcome, event) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let job = state.owned_job(lease)?;
            job.attempts += 1;
            job.error = Some(message.clone());
            job.result = None;

            let outcome = if job.cancel_requested {
                job.status = JobStatus::Failed;
                job.error = Some(CANCELLED_REASON.to_string());
                job.completed_at = Some(now);
                AckOutcome::Cancelled
            } else if error.is_retryable() && job.attempts < job.max_attempts {
                let delay = backoff_delay(self.config.backoff_base, job.attempts);
                job.status = JobStatus::Pending;
                job.progress = 0;
                job.available_at = clock::add(now, delay);
                AckOutcome::Retrying {
                    attempt: job.attempts,
                    delay,
                }
            } else {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                AckOutcome::Failed
            };

            let (priority, id) = (job.priority, job.id.clone());
            let event = match &outcome {
                AckOutcome::Retrying { attempt, delay } => {
                    // Re-enqueued jobs queue behind work submitted meanwhile.
                    state.order.remove(&id);
                    state.push_pending(&id, priority);
                    JobEventKind::Retrying {
                        attempt: *attempt,
                        delay: *delay,
                    }
                }
                AckOutcome::Cancelled => JobEventKind::Failed(CANCELLED_REASON.to_string()),
                _ => JobEventKind::Failed(message.clone()),
            };
            state.locks.remove(&id);
            (outcome, event)
        };

        match &outcome {
            AckOutcome::Retrying { attempt, delay } => {
                warn!(job_id = %lease.job_id(), kind = %self.kind, attempt, ?delay, error = %message, "Job attempt failed, retrying");
                metrics::record_job_retried(self.kind);
                self.job_available.notify_one();
            }
            _ => {
                warn!(job_id = %lease.job_id(), kind = %self.kind, error = %message, "Job failed");
                metrics::record_job_failed(self.kind);
            }
        }
        self.emit(lease.job_id(), event);
        self.mark_dirty();
        Ok(outcome)
    }

    /// Remove a Pending job outright, or flag an Active one for cancellation.
    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let outcome = {
            let mut state = self.state.lock();
            match state.jobs.get_mut(job_id) {
                None => CancelOutcome::NotFound,
                Some(job) if job.status.is_terminal() => CancelOutcome::AlreadyFinished,
                Some(job) if job.status == JobStatus::Active => {
                    job.cancel_requested = true;
                    CancelOutcome::Requested
                }
                Some(_) => {
                    state.remove_job(job_id);
                    CancelOutcome::Removed
                }
            }
        };

        match outcome {
            CancelOutcome::Removed => {
                info!(job_id, kind = %self.kind, "Pending job removed");
                self.emit(job_id, JobEventKind::Removed);
                self.mark_dirty();
            }
            CancelOutcome::Requested => {
                info!(job_id, kind = %self.kind, "Cancellation requested for active job");
                self.mark_dirty();
            }
            _ => {}
        }
        outcome
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        let now = self.clock.now();
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending if job.is_delayed(now) => stats.delayed += 1,
                JobStatus::Pending => stats.waiting += 1,
                JobStatus::Active => stats.active += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Time until the earliest delayed job becomes eligible, if any.
    pub fn next_delayed_in(&self) -> Option<Duration> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .pending
            .iter()
            .filter_map(|(_, _, id)| state.jobs.get(id))
            .filter(|job| job.available_at > now)
            .map(|job| (job.available_at - now).to_std().unwrap_or_default())
            .min()
    }

    /// Wait until a job may have become available, at most `max_wait`.
    pub async fn wait_for_job(&self, max_wait: Duration) {
        let wait = match self.next_delayed_in() {
            Some(delay) => delay.min(max_wait),
            None => max_wait,
        };
        let _ = tokio::time::timeout(wait, self.job_available.notified()).await;
    }

    /// Return jobs whose lock expired to Pending, failing those over the stall budget.
    pub fn recover_stalled(&self) -> Vec<JobId> {
        let now = self.clock.now();
        let recovered = {
            let mut state = self.state.lock();
            self.recover_stalled_locked(&mut state, now)
        };
        if !recovered.is_empty() {
            self.mark_dirty();
            self.job_available.notify_one();
        }
        recovered
    }

    fn recover_stalled_locked(&self, state: &mut QueueState, now: DateTime<Utc>) -> Vec<JobId> {
        let expired: Vec<JobId> = state
            .locks
            .iter()
            .filter(|(_, lock)| lock.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            let Some(lock) = state.locks.remove(id) else {
                continue;
            };
            let Some(job) = state.jobs.get_mut(id) else {
                continue;
            };
            if job.status != JobStatus::Active {
                continue;
            }

            job.stalled_count += 1;
            let count = job.stalled_count;
            metrics::record_job_stalled(self.kind);

            if count > self.config.max_stalled_count {
                job.status = JobStatus::Failed;
                job.error = Some(STALLED_REASON.to_string());
                job.result = None;
                job.completed_at = Some(now);
                warn!(job_id = %id, worker_id = %lock.worker_id, stalled = count, "Stalled job exceeded its recovery budget");
                metrics::record_job_failed(self.kind);
                self.emit(id, JobEventKind::Failed(STALLED_REASON.to_string()));
            } else {
                job.status = JobStatus::Pending;
                job.progress = 0;
                job.available_at = now;
                let priority = job.priority;
                state.push_pending(id, priority);
                warn!(job_id = %id, worker_id = %lock.worker_id, stalled = count, "Recovered stalled job");
                self.emit(id, JobEventKind::Stalled { count });
            }
        }

        expired
    }

    /// Drop terminal jobs outside their retention window. Returns how many went.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let removed = {
            let mut state = self.state.lock();
            let mut removed = 0;
            for (status, policy) in [
                (JobStatus::Completed, self.config.completed_retention),
                (JobStatus::Failed, self.config.failed_retention),
            ] {
                removed += prune_status(&mut state, status, policy, now);
            }
            removed
        };

        if removed > 0 {
            debug!(kind = %self.kind, removed, "Pruned finished jobs");
            self.mark_dirty();
        }
        removed
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.config
            .state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", self.kind)))
    }

    /// Write the snapshot to disk (temp file, then rename).
    pub async fn flush(&self) -> Result<(), QueueError> {
        let Some(path) = self.snapshot_path() else {
            return Ok(());
        };
        let _guard = self.flush_lock.lock().await;

        let bytes = {
            let state = self.state.lock();
            serde_json::to_vec(&state.snapshot(self.kind))?
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Background writer that flushes the snapshot shortly after mutations and
    /// once more on cancellation. Returns `None` for memory-only queues.
    pub fn spawn_persistence(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        self.snapshot_path()?;
        let queue = self.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.dirty.notified() => {
                        tokio::time::sleep(queue.config.persist_interval).await;
                        if let Err(e) = queue.flush().await {
                            warn!(kind = %queue.kind, error = %e, "Failed to persist job queue");
                        }
                    }
                }
            }
            if let Err(e) = queue.flush().await {
                warn!(kind = %queue.kind, error = %e, "Failed to persist job queue on shutdown");
            }
        }))
    }

    fn mark_dirty(&self) {
        if self.config.state_dir.is_some() {
            self.dirty.notify_one();
        }
    }

    fn emit(&self, job_id: &str, event: JobEventKind) {
        // No subscribers is fine.
        let _ = self.events.send(JobEvent {
            job_id: job_id.to_string(),
            kind: self.kind,
            event,
        });
    }
}

fn prune_status(
    state: &mut QueueState,
    status: JobStatus,
    policy: RetentionPolicy,
    now: DateTime<Utc>,
) -> usize {
    let cutoff = chrono::Duration::from_std(policy.max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut finished: Vec<(DateTime<Utc>, JobId)> = state
        .jobs
        .values()
        .filter(|job| job.status == status)
        .map(|job| (job.completed_at.unwrap_or(job.created_at), job.id.clone()))
        .collect();
    finished.sort();

    let excess = finished.len().saturating_sub(policy.max_count);
    let mut removed = 0;
    for (index, (finished_at, id)) in finished.iter().enumerate() {
        if index < excess || *finished_at < cutoff {
            state.remove_job(id);
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn test_config() -> QueueConfig {
        QueueConfig {
            lock_duration: Duration::from_secs(30),
            max_stalled_count: 2,
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn queue_with_clock(kind: JobKind) -> (JobQueue, FakeClock) {
        let clock = FakeClock::new();
        let queue = JobQueue::with_clock(kind, test_config(), Arc::new(clock.clone()));
        (queue, clock)
    }

    fn artifact(key: &str) -> JobResult {
        JobResult {
            key: key.to_string(),
            url: format!("https://cdn.test/{key}"),
            size: 42,
            content_type: "image/png".to_string(),
        }
    }

    fn nav_timeout() -> RenderError {
        RenderError::timeout("navigation", Duration::from_secs(30))
    }

    #[test]
    fn test_high_priority_leased_before_earlier_normal() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let b = queue
            .enqueue(JobRequest::screenshot("https://b.test").with_priority(Priority::Normal))
            .unwrap();
        let a = queue
            .enqueue(JobRequest::screenshot("https://a.test").with_priority(Priority::High))
            .unwrap();

        assert_eq!(queue.lease("w1").unwrap().job_id(), a);
        assert_eq!(queue.lease("w1").unwrap().job_id(), b);
        assert!(queue.lease("w1").is_none());
    }

    #[test]
    fn test_fifo_within_priority_tier() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let ids: Vec<_> = (0..5)
            .map(|i| {
                queue
                    .enqueue(JobRequest::screenshot(format!("https://{i}.test")))
                    .unwrap()
            })
            .collect();
        let low = queue
            .enqueue(JobRequest::screenshot("https://low.test").with_priority(Priority::Low))
            .unwrap();

        for id in &ids {
            assert_eq!(queue.lease("w").unwrap().job_id(), id);
        }
        assert_eq!(queue.lease("w").unwrap().job_id(), low);
    }

    #[test]
    fn test_enqueue_rejects_wrong_kind_and_duplicates() {
        let (queue, _) = queue_with_clock(JobKind::Pdf);
        assert!(matches!(
            queue.enqueue(JobRequest::screenshot("https://a.test")),
            Err(QueueError::InvalidJob(_))
        ));

        queue.enqueue(JobRequest::pdf("https://a.test").with_id("job-1")).unwrap();
        assert!(matches!(
            queue.enqueue(JobRequest::pdf("https://b.test").with_id("job-1")),
            Err(QueueError::DuplicateJob(_))
        ));
        assert!(matches!(
            queue.enqueue(JobRequest::pdf("not a url")),
            Err(QueueError::InvalidJob(_))
        ));
    }

    #[test]
    fn test_leased_job_invisible_to_other_workers() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        let lease = queue.lease("w1").unwrap();
        assert!(queue.lease("w2").is_none());
        assert_eq!(queue.get_job(lease.job_id()).unwrap().status, JobStatus::Active);
        assert_eq!(queue.stats().active, 1);
    }

    #[test]
    fn test_success_is_terminal() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        let lease = queue.lease("w1").unwrap();

        assert_eq!(
            queue.acknowledge_success(&lease, artifact("a.png")).unwrap(),
            AckOutcome::Completed
        );
        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.result.is_some());
        assert!(job.error.is_none());

        // A late failure report must not regress the record.
        assert!(matches!(
            queue.acknowledge_failure(&lease, &nav_timeout()),
            Err(QueueError::LockMismatch(_))
        ));
        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_retry_law_late_success() {
        let (queue, clock) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();

        for _ in 0..2 {
            let lease = queue.lease("w1").unwrap();
            let outcome = queue.acknowledge_failure(&lease, &nav_timeout()).unwrap();
            assert!(matches!(outcome, AckOutcome::Retrying { .. }));
            clock.advance(Duration::from_secs(10));
        }

        let lease = queue.lease("w1").unwrap();
        queue.acknowledge_success(&lease, artifact("a.png")).unwrap();

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, job.max_attempts);
        assert!(job.result.is_some());
        assert!(job.error.is_none());
    }

    #[test]
    fn test_always_timing_out_job_fails_after_backoff() {
        let (queue, clock) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://slow.test")).unwrap();

        let lease = queue.lease("w1").unwrap();
        let failed_at = clock.now();
        assert_eq!(
            queue.acknowledge_failure(&lease, &nav_timeout()).unwrap(),
            AckOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        let job = queue.get_job(&id).unwrap();
        assert!(job.available_at - failed_at >= chrono::Duration::seconds(2));
        assert!(queue.lease("w1").is_none(), "backoff not yet elapsed");
        assert_eq!(queue.stats().delayed, 1);

        clock.advance(Duration::from_secs(2));
        let lease = queue.lease("w1").unwrap();
        let failed_at = clock.now();
        assert_eq!(
            queue.acknowledge_failure(&lease, &nav_timeout()).unwrap(),
            AckOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_secs(4)
            }
        );
        let job = queue.get_job(&id).unwrap();
        assert!(job.available_at - failed_at >= chrono::Duration::seconds(4));

        clock.advance(Duration::from_secs(4));
        let lease = queue.lease("w1").unwrap();
        assert_eq!(
            queue.acknowledge_failure(&lease, &nav_timeout()).unwrap(),
            AckOutcome::Failed
        );

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.result.is_none());
        assert!(job.error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_non_retryable_error_fails_immediately() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        let lease = queue.lease("w1").unwrap();
        let outcome = queue
            .acknowledge_failure(&lease, &RenderError::InvalidRequest("bad".to_string()))
            .unwrap();
        assert_eq!(outcome, AckOutcome::Failed);
        assert_eq!(queue.get_job(&id).unwrap().attempts, 1);
    }

    #[test]
    fn test_stall_recovery_budget() {
        let (queue, clock) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();

        let first = queue.lease("worker-a").unwrap();
        clock.advance(Duration::from_secs(31));

        let second = queue.lease("worker-b").unwrap();
        assert_eq!(second.job_id(), id);
        assert_eq!(second.job.stalled_count, 1);
        assert!(matches!(
            queue.acknowledge_success(&first, artifact("stale.png")),
            Err(QueueError::LockMismatch(_))
        ));

        clock.advance(Duration::from_secs(31));
        let third = queue.lease("worker-c").unwrap();
        assert_eq!(third.job.stalled_count, 2);

        clock.advance(Duration::from_secs(31));
        assert!(queue.lease("worker-d").is_none());

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(STALLED_REASON));
        assert_eq!(job.attempts, 0, "stalls do not consume attempts");
    }

    #[test]
    fn test_extend_lock_prevents_stall() {
        let (queue, clock) = queue_with_clock(JobKind::Screenshot);
        queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        let lease = queue.lease("w1").unwrap();

        for _ in 0..4 {
            clock.advance(Duration::from_secs(20));
            queue.extend_lock(&lease).unwrap();
            assert!(queue.recover_stalled().is_empty());
        }
        queue.acknowledge_success(&lease, artifact("a.png")).unwrap();
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        let lease = queue.lease("w1").unwrap();

        queue.update_progress(&lease, 60).unwrap();
        queue.update_progress(&lease, 30).unwrap();
        assert_eq!(queue.get_job(&id).unwrap().progress, 60);
        queue.update_progress(&lease, 250).unwrap();
        assert_eq!(queue.get_job(&id).unwrap().progress, 100);
    }

    #[test]
    fn test_cancel_pending_removes_job() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        assert_eq!(queue.cancel(&id), CancelOutcome::Removed);
        assert!(queue.get_job(&id).is_none());
        assert!(queue.lease("w1").is_none());
        assert_eq!(queue.cancel(&id), CancelOutcome::NotFound);
    }

    #[test]
    fn test_cancel_active_discards_result() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        let lease = queue.lease("w1").unwrap();

        assert_eq!(queue.cancel(&id), CancelOutcome::Requested);
        assert_eq!(queue.update_progress(&lease, 30).unwrap(), JobControl::Cancel);
        assert_eq!(
            queue.acknowledge_success(&lease, artifact("a.png")).unwrap(),
            AckOutcome::Cancelled
        );

        let job = queue.get_job(&id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert_eq!(job.error.as_deref(), Some(CANCELLED_REASON));
        assert_eq!(queue.cancel(&id), CancelOutcome::AlreadyFinished);
    }

    #[test]
    fn test_retention_prunes_oldest_completed_first() {
        let clock = FakeClock::new();
        let mut config = test_config();
        config.completed_retention = RetentionPolicy {
            max_age: Duration::from_secs(3600),
            max_count: 2,
        };
        config.failed_retention = RetentionPolicy {
            max_age: Duration::from_secs(86400),
            max_count: 10,
        };
        let queue = JobQueue::with_clock(JobKind::Screenshot, config, Arc::new(clock.clone()));

        let mut completed = Vec::new();
        for i in 0..3 {
            let id = queue
                .enqueue(JobRequest::screenshot(format!("https://{i}.test")))
                .unwrap();
            let lease = queue.lease("w").unwrap();
            queue.acknowledge_success(&lease, artifact(&id)).unwrap();
            completed.push(id);
            clock.advance(Duration::from_secs(1));
        }
        let failed = queue
            .enqueue(JobRequest::screenshot("https://f.test").with_max_attempts(1))
            .unwrap();
        let lease = queue.lease("w").unwrap();
        queue.acknowledge_failure(&lease, &nav_timeout()).unwrap();

        assert_eq!(queue.prune(), 1);
        assert!(queue.get_job(&completed[0]).is_none());
        assert!(queue.get_job(&completed[2]).is_some());

        clock.advance(Duration::from_secs(2 * 3600));
        assert_eq!(queue.prune(), 2);
        assert!(queue.get_job(&failed).is_some(), "failed jobs are kept longer");
        assert_eq!(queue.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle_order() {
        let (queue, _) = queue_with_clock(JobKind::Screenshot);
        let mut events = queue.subscribe();
        let id = queue.enqueue(JobRequest::screenshot("https://a.test")).unwrap();
        let lease = queue.lease("w1").unwrap();
        queue.update_progress(&lease, 10).unwrap();
        queue.update_progress(&lease, 60).unwrap();
        queue.acknowledge_success(&lease, artifact("a.png")).unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.job_id, id);
            seen.push(event.event);
        }
        assert_eq!(
            seen,
            vec![
                JobEventKind::Active { attempt: 1 },
                JobEventKind::Progress(10),
                JobEventKind::Progress(60),
                JobEventKind::Completed(artifact("a.png")),
            ]
        );
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_recovers_active_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = QueueConfig {
            state_dir: Some(dir.path().to_path_buf()),
            ..test_config()
        };
        let clock = Arc::new(FakeClock::new());

        let queue = JobQueue::open(JobKind::Pdf, config.clone(), clock.clone())
            .await
            .unwrap();
        let active = queue.enqueue(JobRequest::pdf("https://a.test").with_id("active")).unwrap();
        let waiting = queue
            .enqueue(JobRequest::pdf("https://b.test").with_id("waiting"))
            .unwrap();
        assert_eq!(queue.lease("w1").unwrap().job_id(), active);
        queue.flush().await.unwrap();
        drop(queue);

        let reopened = JobQueue::open(JobKind::Pdf, config, clock).await.unwrap();
        let job = reopened.get_job(&active).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.stalled_count, 1);
        assert_eq!(reopened.get_job(&waiting).unwrap().status, JobStatus::Pending);
        assert_eq!(reopened.stats().waiting, 2);

        // Original order survives the restart.
        assert_eq!(reopened.lease("w2").unwrap().job_id(), active);
        assert_eq!(reopened.lease("w2").unwrap().job_id(), waiting);
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let base = Duration::from_secs(2);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(8));
    }
}
