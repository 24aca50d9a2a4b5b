//! Browser pool management for concurrent browser processes
//!
//! The pool owns a fixed number of slots, each backed by at most one browser
//! process. Callers lease an isolated context with one page through
//! [`BrowserPool::acquire_page`]; the least-loaded healthy instance serves it.
//! A background monitor pings every instance and replaces unresponsive ones in
//! detached tasks, so acquisition never waits on recovery.
//!
//! All bookkeeping sits behind one short synchronous lock that is never held
//! across an await. Slow work (launch, context creation, ping, close) happens
//! outside it.

use crate::config::PoolConfig;
use crate::engine::{BrowserLauncher, BrowserProcess, ContextOptions, RenderPage};
use crate::error::RenderError;
use crate::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Current status of a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Slot has no process (not launched yet, or the last launch failed)
    Empty,
    /// A process is being launched for this slot
    Launching,
    /// Instance is serving leases
    Healthy,
    /// Instance failed a health check and is being replaced
    Restarting,
}

struct Slot {
    id: usize,
    generation: u64,
    status: InstanceStatus,
    process: Option<Arc<dyn BrowserProcess>>,
    context_count: usize,
    created_at: Option<DateTime<Utc>>,
    failure_count: usize,
}

impl Slot {
    fn empty(id: usize) -> Self {
        Self {
            id,
            generation: 0,
            status: InstanceStatus::Empty,
            process: None,
            context_count: 0,
            created_at: None,
            failure_count: 0,
        }
    }

    fn accepts_lease(&self, per_instance: usize) -> bool {
        self.status == InstanceStatus::Healthy
            && self.context_count < per_instance
            && self.process.as_ref().is_some_and(|p| p.is_alive())
    }
}

struct PoolState {
    slots: Vec<Slot>,
    outstanding: usize,
}

struct LeaseRecord {
    instance_id: usize,
    generation: u64,
    page: Arc<dyn RenderPage>,
    leased_at: DateTime<Utc>,
}

/// Per-instance view for health reports.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub id: usize,
    pub generation: u64,
    pub status: InstanceStatus,
    pub context_count: usize,
    pub created_at: Option<DateTime<Utc>>,
    pub failure_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub restarting_instances: usize,
    pub active_leases: usize,
    pub capacity: usize,
    pub total_leases: u64,
    pub replacements: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub stats: PoolStats,
    pub instances: Vec<InstanceHealth>,
}

/// A leased context and its page.
///
/// Release it with [`LeasedContext::release`]. If it is dropped instead (panic,
/// aborted future), the context is released by a spawned task.
pub struct LeasedContext {
    pool: Arc<BrowserPool>,
    context_id: Uuid,
    instance_id: usize,
    page: Arc<dyn RenderPage>,
    released: bool,
}

impl LeasedContext {
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    pub fn instance_id(&self) -> usize {
        self.instance_id
    }

    pub fn page(&self) -> &dyn RenderPage {
        self.page.as_ref()
    }

    pub async fn release(mut self) {
        self.released = true;
        self.pool.release_context(self.context_id).await;
    }
}

impl Drop for LeasedContext {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        let context_id = self.context_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.release_context(context_id).await;
                });
            }
            Err(_) => pool.forget_context(context_id),
        }
    }
}

pub struct BrowserPool {
    config: PoolConfig,
    launcher: Arc<dyn BrowserLauncher>,
    state: Mutex<PoolState>,
    leases: DashMap<Uuid, LeaseRecord>,
    capacity_freed: Notify,
    shutting_down: AtomicBool,
    monitor: CancellationToken,
    total_leases: AtomicU64,
    replacements: AtomicU64,
}

impl BrowserPool {
    pub fn new(config: PoolConfig, launcher: Arc<dyn BrowserLauncher>) -> Arc<Self> {
        let slots = (0..config.max_concurrent_browsers).map(Slot::empty).collect();
        Arc::new(Self {
            config,
            launcher,
            state: Mutex::new(PoolState {
                slots,
                outstanding: 0,
            }),
            leases: DashMap::new(),
            capacity_freed: Notify::new(),
            shutting_down: AtomicBool::new(false),
            monitor: CancellationToken::new(),
            total_leases: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
        })
    }

    /// Launch every slot and start the health monitor.
    ///
    /// Fails only if no browser at all could be started; slots whose launch
    /// failed are retried by the monitor.
    pub async fn start(self: &Arc<Self>) -> Result<(), RenderError> {
        let slot_ids: Vec<(usize, u64)> = {
            let mut state = self.state.lock();
            state
                .slots
                .iter_mut()
                .filter(|slot| slot.status == InstanceStatus::Empty)
                .map(|slot| {
                    slot.status = InstanceStatus::Launching;
                    (slot.id, slot.generation)
                })
                .collect()
        };

        let results = join_all(
            slot_ids
                .iter()
                .map(|(id, generation)| self.launch_into(*id, *generation)),
        )
        .await;

        let launched = results.iter().filter(|r| r.is_ok()).count();
        if launched == 0 && !slot_ids.is_empty() {
            let reason = results
                .into_iter()
                .find_map(Result::err)
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(RenderError::BrowserUnavailable(format!(
                "no browser could be launched: {reason}"
            )));
        }

        info!(
            launched,
            slots = slot_ids.len(),
            capacity = self.config.max_leases(),
            "Browser pool started"
        );
        self.spawn_monitor();
        Ok(())
    }

    /// Launch a process for a slot already marked Launching or Restarting.
    async fn launch_into(&self, slot_id: usize, generation: u64) -> Result<(), RenderError> {
        let launched = match tokio::time::timeout(
            self.config.launch_timeout,
            self.launcher.launch(slot_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RenderError::timeout("browser launch", self.config.launch_timeout)),
        };

        let process = match launched {
            Ok(process) => process,
            Err(e) => {
                error!(instance_id = slot_id, error = %e, "Failed to launch browser instance");
                let mut state = self.state.lock();
                if let Some(slot) = state.slots.get_mut(slot_id) {
                    if slot.generation == generation {
                        slot.status = InstanceStatus::Empty;
                        slot.failure_count += 1;
                    }
                }
                return Err(e);
            }
        };

        let accepted = {
            let mut state = self.state.lock();
            match state.slots.get_mut(slot_id) {
                Some(slot)
                    if slot.generation == generation && !self.shutting_down.load(Ordering::SeqCst) =>
                {
                    slot.process = Some(process.clone());
                    slot.status = InstanceStatus::Healthy;
                    slot.context_count = 0;
                    slot.created_at = Some(Utc::now());
                    true
                }
                _ => false,
            }
        };

        if !accepted {
            process.terminate().await;
            return Err(RenderError::BrowserUnavailable("pool is shutting down".to_string()));
        }

        debug!(instance_id = slot_id, generation, "Browser instance ready");
        self.capacity_freed.notify_waiters();
        Ok(())
    }

    /// Lease an isolated context with one page from the least-loaded healthy instance.
    pub async fn acquire_page(
        self: &Arc<Self>,
        options: &ContextOptions,
    ) -> Result<LeasedContext, RenderError> {
        let deadline = Instant::now() + self.config.acquire_timeout;

        let (slot_id, generation, process) = loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(RenderError::BrowserUnavailable(
                    "pool is shutting down".to_string(),
                ));
            }

            let freed = self.capacity_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Some(reserved) = self.reserve_slot() {
                break reserved;
            }

            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                metrics::record_pool_exhausted();
                return Err(RenderError::PoolExhausted(self.config.acquire_timeout));
            }
        };

        let opened = match tokio::time::timeout(
            self.config.context_timeout,
            process.open_page(options),
        )
        .await
        {
            Ok(Ok(page)) => Ok(page),
            Ok(Err(e)) => Err(RenderError::BrowserUnavailable(format!(
                "context creation failed on instance {slot_id}: {e}"
            ))),
            Err(_) => Err(RenderError::BrowserUnavailable(format!(
                "context creation on instance {slot_id} timed out after {:?}",
                self.config.context_timeout
            ))),
        };

        let page = match opened {
            Ok(page) => page,
            Err(e) => {
                warn!(instance_id = slot_id, error = %e, "Failed to open browser context");
                self.free_slot(slot_id, generation);
                return Err(e);
            }
        };

        let context_id = Uuid::new_v4();
        self.leases.insert(
            context_id,
            LeaseRecord {
                instance_id: slot_id,
                generation,
                page: page.clone(),
                leased_at: Utc::now(),
            },
        );
        self.total_leases.fetch_add(1, Ordering::Relaxed);
        self.report_utilization();
        debug!(%context_id, instance_id = slot_id, "Context leased");

        Ok(LeasedContext {
            pool: self.clone(),
            context_id,
            instance_id: slot_id,
            page,
            released: false,
        })
    }

    fn reserve_slot(&self) -> Option<(usize, u64, Arc<dyn BrowserProcess>)> {
        let mut state = self.state.lock();
        if state.outstanding >= self.config.max_leases() {
            return None;
        }

        let per_instance = self.config.contexts_per_browser;
        let slot = state
            .slots
            .iter_mut()
            .filter(|slot| slot.accepts_lease(per_instance))
            .min_by_key(|slot| slot.context_count)?;

        slot.context_count += 1;
        let reserved = (slot.id, slot.generation, slot.process.clone()?);
        state.outstanding += 1;
        Some(reserved)
    }

    fn free_slot(&self, slot_id: usize, generation: u64) {
        {
            let mut state = self.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if let Some(slot) = state.slots.get_mut(slot_id) {
                // Leases from a replaced process must not touch the new one.
                if slot.generation == generation {
                    slot.context_count = slot.context_count.saturating_sub(1);
                }
            }
        }
        self.report_utilization();
        self.capacity_freed.notify_waiters();
    }

    /// Close a leased context and free its slot. Unknown or already released ids are a no-op.
    pub async fn release_context(&self, context_id: Uuid) -> bool {
        let Some((_, record)) = self.leases.remove(&context_id) else {
            return false;
        };
        // Slot accounting must not sit behind an await: callers may drop this
        // future (job timeout, aborted worker) while the page is closing.
        self.free_slot(record.instance_id, record.generation);
        let held = (Utc::now() - record.leased_at).to_std().unwrap_or_default();
        debug!(%context_id, instance_id = record.instance_id, ?held, "Context released");

        let instance_id = record.instance_id;
        let close_timeout = self.config.context_timeout;
        let closing = tokio::spawn(async move {
            match tokio::time::timeout(close_timeout, record.page.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(%context_id, instance_id, error = %e, "Context close failed"),
                Err(_) => warn!(%context_id, instance_id, "Context close timed out"),
            }
        });
        if let Err(e) = closing.await {
            error!(%context_id, instance_id, error = %e, "Context close task failed");
        }
        true
    }

    /// Release bookkeeping without closing the page; used when no runtime is left.
    fn forget_context(&self, context_id: Uuid) {
        if let Some((_, record)) = self.leases.remove(&context_id) {
            self.free_slot(record.instance_id, record.generation);
        }
    }

    /// Ping every instance and schedule replacement of the ones that fail.
    pub async fn check_health(self: &Arc<Self>) -> PoolHealth {
        let mut issues = Vec::new();
        let mut candidates = Vec::new();
        let mut relaunch = Vec::new();

        {
            let state = self.state.lock();
            for slot in &state.slots {
                match (&slot.status, &slot.process) {
                    (InstanceStatus::Healthy, Some(process)) => {
                        candidates.push((slot.id, slot.generation, process.clone()))
                    }
                    (InstanceStatus::Empty, _) => relaunch.push(slot.id),
                    (InstanceStatus::Restarting, _) | (InstanceStatus::Launching, _) => {
                        issues.push(format!("instance {} is restarting", slot.id))
                    }
                    (InstanceStatus::Healthy, None) => relaunch.push(slot.id),
                }
            }
        }

        let ping_timeout = self.config.ping_timeout;
        let pings = join_all(candidates.into_iter().map(|(id, generation, process)| async move {
            let outcome = if !process.is_alive() {
                Err("process exited".to_string())
            } else {
                match tokio::time::timeout(ping_timeout, process.ping()).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("no ping response within {ping_timeout:?}")),
                }
            };
            (id, generation, outcome)
        }))
        .await;

        for (id, generation, outcome) in pings {
            if let Err(reason) = outcome {
                warn!(instance_id = id, %reason, "Browser instance failed health check");
                issues.push(format!("instance {id} unhealthy: {reason}"));
                self.schedule_replacement(id, Some(generation));
            }
        }
        for id in relaunch {
            if !self.shutting_down.load(Ordering::SeqCst) {
                issues.push(format!("instance {id} has no running browser"));
                self.schedule_replacement(id, None);
            }
        }

        let stats = self.stats();
        metrics::record_pool_health(stats.healthy_instances, stats.total_instances);
        PoolHealth {
            healthy: issues.is_empty() && stats.healthy_instances > 0,
            issues,
            stats,
            instances: self.instances(),
        }
    }

    /// Terminate and relaunch a slot in a detached task.
    ///
    /// `expected_generation` guards against replacing a process that was
    /// already swapped out since it was observed.
    fn schedule_replacement(self: &Arc<Self>, slot_id: usize, expected_generation: Option<u64>) {
        let (old, generation) = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(slot_id) else {
                return;
            };
            if expected_generation.is_some_and(|g| g != slot.generation)
                || matches!(slot.status, InstanceStatus::Restarting | InstanceStatus::Launching)
            {
                return;
            }
            slot.generation += 1;
            slot.status = InstanceStatus::Restarting;
            slot.context_count = 0;
            slot.failure_count += 1;
            (slot.process.take(), slot.generation)
        };

        let pool = self.clone();
        tokio::spawn(async move {
            if let Some(old) = old {
                old.terminate().await;
            }
            if pool.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            match pool.launch_into(slot_id, generation).await {
                Ok(()) => {
                    pool.replacements.fetch_add(1, Ordering::Relaxed);
                    metrics::record_browser_replaced();
                    info!(instance_id = slot_id, generation, "Browser instance replaced");
                }
                Err(e) => {
                    error!(instance_id = slot_id, error = %e, "Browser replacement failed, retrying on next health check")
                }
            }
        });
    }

    fn spawn_monitor(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let cancel = self.monitor.clone();
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let health = pool.check_health().await;
                        if !health.healthy {
                            warn!(issues = ?health.issues, "Browser pool degraded");
                        }
                    }
                }
            }
            debug!("Browser pool monitor stopped");
        });
    }

    /// Stop leasing, wait up to the grace period for outstanding leases, then
    /// terminate every instance.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down browser pool...");
        self.monitor.cancel();
        self.capacity_freed.notify_waiters();

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            let freed = self.capacity_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            let outstanding = self.state.lock().outstanding;
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, freed).await.is_err() {
                warn!(outstanding, "Shutdown grace elapsed with contexts still leased");
                break;
            }
        }

        let processes: Vec<(usize, Arc<dyn BrowserProcess>)> = {
            let mut state = self.state.lock();
            state
                .slots
                .iter_mut()
                .filter_map(|slot| {
                    slot.generation += 1;
                    slot.status = InstanceStatus::Empty;
                    slot.context_count = 0;
                    slot.process.take().map(|p| (slot.id, p))
                })
                .collect()
        };
        self.leases.clear();

        join_all(processes.iter().map(|(_, process)| process.terminate())).await;
        info!(terminated = processes.len(), "Browser pool shutdown complete");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            capacity: self.config.max_leases(),
            active_leases: state.outstanding,
            total_leases: self.total_leases.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
            ..Default::default()
        };
        for slot in &state.slots {
            if slot.process.is_some() {
                stats.total_instances += 1;
            }
            match slot.status {
                InstanceStatus::Healthy => stats.healthy_instances += 1,
                InstanceStatus::Restarting | InstanceStatus::Launching => {
                    stats.restarting_instances += 1
                }
                InstanceStatus::Empty => {}
            }
        }
        stats
    }

    pub fn instances(&self) -> Vec<InstanceHealth> {
        self.state
            .lock()
            .slots
            .iter()
            .map(|slot| InstanceHealth {
                id: slot.id,
                generation: slot.generation,
                status: slot.status,
                context_count: slot.context_count,
                created_at: slot.created_at,
                failure_count: slot.failure_count,
            })
            .collect()
    }

    fn report_utilization(&self) {
        metrics::record_pool_utilization(self.state.lock().outstanding, self.config.max_leases());
    }
}
