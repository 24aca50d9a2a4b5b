use crate::browser_pool::PoolHealth;
use crate::job::JobKind;
use crate::queue::QueueStats;
use crate::worker::WorkerStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub min_healthy_browsers: usize,
    /// Fraction of the lease cap in use above which the pool reports a warning.
    pub max_utilization: f64,
    pub backlog_warning: usize,
    pub backlog_critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_healthy_browsers: 1,
            max_utilization: 0.9,
            backlog_warning: 100,
            backlog_critical: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    pub kind: JobKind,
    pub level: HealthLevel,
    pub stats: QueueStats,
}

/// Readiness of the whole service at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall: HealthLevel,
    /// False only when something is critical.
    pub ready: bool,
    pub browsers: HealthLevel,
    pub workers: HealthLevel,
    pub pool: PoolHealth,
    pub worker_stats: Vec<WorkerStats>,
    pub queues: Vec<QueueHealth>,
    pub issues: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

pub struct SystemHealthChecker {
    thresholds: HealthThresholds,
}

impl Default for SystemHealthChecker {
    fn default() -> Self {
        Self::new(HealthThresholds::default())
    }
}

impl SystemHealthChecker {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Fold pool, worker and queue observations into one report.
    pub fn assess(
        &self,
        pool: PoolHealth,
        worker_stats: Vec<WorkerStats>,
        queues: Vec<(JobKind, QueueStats)>,
    ) -> HealthReport {
        let mut issues = pool.issues.clone();

        let browsers = self.check_browser_pool_health(&pool, &mut issues);
        let workers = self.check_worker_health(&worker_stats, &mut issues);
        let queues: Vec<QueueHealth> = queues
            .into_iter()
            .map(|(kind, stats)| QueueHealth {
                kind,
                level: self.check_queue_health(kind, &stats, &mut issues),
                stats,
            })
            .collect();

        let overall = queues
            .iter()
            .map(|q| q.level)
            .chain([browsers, workers])
            .max()
            .unwrap_or(HealthLevel::Healthy);

        info!(?overall, issues = issues.len(), "Health check completed");

        HealthReport {
            overall,
            ready: overall != HealthLevel::Critical,
            browsers,
            workers,
            pool,
            worker_stats,
            queues,
            issues,
            checked_at: Utc::now(),
        }
    }

    fn check_browser_pool_health(&self, pool: &PoolHealth, issues: &mut Vec<String>) -> HealthLevel {
        let stats = &pool.stats;

        if stats.healthy_instances < self.thresholds.min_healthy_browsers {
            error!(
                healthy = stats.healthy_instances,
                total = stats.total_instances,
                "Browser pool health critical"
            );
            issues.push(format!(
                "only {} of {} browsers healthy",
                stats.healthy_instances, stats.total_instances
            ));
            return HealthLevel::Critical;
        }

        if !pool.healthy {
            return HealthLevel::Warning;
        }

        let utilization = if stats.capacity > 0 {
            stats.active_leases as f64 / stats.capacity as f64
        } else {
            0.0
        };
        if utilization > self.thresholds.max_utilization {
            warn!("Browser pool high utilization: {:.2}%", utilization * 100.0);
            issues.push(format!("pool utilization at {:.0}%", utilization * 100.0));
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    fn check_worker_health(&self, workers: &[WorkerStats], issues: &mut Vec<String>) -> HealthLevel {
        let stopped: Vec<&WorkerStats> = workers.iter().filter(|w| !w.running).collect();
        if stopped.is_empty() {
            return HealthLevel::Healthy;
        }
        for worker in &stopped {
            error!(worker_id = %worker.id, kind = %worker.kind, "Worker is not running");
            issues.push(format!("worker {} is not running", worker.id));
        }
        HealthLevel::Critical
    }

    fn check_queue_health(&self, kind: JobKind, stats: &QueueStats, issues: &mut Vec<String>) -> HealthLevel {
        let backlog = stats.backlog();
        if backlog > self.thresholds.backlog_critical {
            error!(%kind, backlog, "Queue backlog critical");
            issues.push(format!("{kind} backlog at {backlog} jobs"));
            HealthLevel::Critical
        } else if backlog > self.thresholds.backlog_warning {
            warn!(%kind, backlog, "Queue backlog high");
            issues.push(format!("{kind} backlog at {backlog} jobs"));
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser_pool::PoolStats;

    fn pool(healthy: usize, total: usize, active: usize, capacity: usize) -> PoolHealth {
        PoolHealth {
            healthy: healthy == total,
            issues: Vec::new(),
            stats: PoolStats {
                total_instances: total,
                healthy_instances: healthy,
                active_leases: active,
                capacity,
                ..Default::default()
            },
            instances: Vec::new(),
        }
    }

    fn worker(running: bool) -> WorkerStats {
        WorkerStats {
            id: "screenshot-worker-1".to_string(),
            kind: JobKind::Screenshot,
            running,
            concurrency: 4,
            in_flight: 0,
            peak_in_flight: 0,
            processed: 0,
            failed: 0,
            retried: 0,
        }
    }

    fn backlog(waiting: usize) -> QueueStats {
        QueueStats {
            waiting,
            ..Default::default()
        }
    }

    #[test]
    fn test_all_healthy() {
        let report = SystemHealthChecker::default().assess(
            pool(2, 2, 1, 20),
            vec![worker(true)],
            vec![(JobKind::Screenshot, backlog(3))],
        );
        assert_eq!(report.overall, HealthLevel::Healthy);
        assert!(report.ready);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_one_unhealthy_browser_is_a_warning() {
        let mut degraded = pool(1, 2, 0, 20);
        degraded.issues.push("browser 1 did not answer a ping".to_string());
        let report = SystemHealthChecker::default().assess(degraded, vec![worker(true)], Vec::new());
        assert_eq!(report.browsers, HealthLevel::Warning);
        assert!(report.ready);
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn test_no_healthy_browsers_is_critical() {
        let report = SystemHealthChecker::default().assess(pool(0, 2, 0, 20), Vec::new(), Vec::new());
        assert_eq!(report.overall, HealthLevel::Critical);
        assert!(!report.ready);
    }

    #[test]
    fn test_high_utilization_warns() {
        let report = SystemHealthChecker::default().assess(pool(2, 2, 19, 20), Vec::new(), Vec::new());
        assert_eq!(report.browsers, HealthLevel::Warning);
    }

    #[test]
    fn test_stopped_worker_is_critical() {
        let report = SystemHealthChecker::default().assess(pool(2, 2, 0, 20), vec![worker(false)], Vec::new());
        assert_eq!(report.workers, HealthLevel::Critical);
        assert!(!report.ready);
    }

    #[test]
    fn test_backlog_thresholds() {
        let checker = SystemHealthChecker::default();
        let report = checker.assess(
            pool(2, 2, 0, 20),
            Vec::new(),
            vec![(JobKind::Screenshot, backlog(150)), (JobKind::Pdf, backlog(5))],
        );
        assert_eq!(report.queues[0].level, HealthLevel::Warning);
        assert_eq!(report.queues[1].level, HealthLevel::Healthy);
        assert_eq!(report.overall, HealthLevel::Warning);

        let report = checker.assess(pool(2, 2, 0, 20), Vec::new(), vec![(JobKind::Pdf, backlog(1001))]);
        assert_eq!(report.overall, HealthLevel::Critical);
    }
}
