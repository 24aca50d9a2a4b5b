//! Metric recording helpers
//!
//! Every helper goes through the `metrics` facade, so they are no-ops until a
//! recorder is installed (see [`install_prometheus`]).

use crate::job::JobKind;
use crate::queue::QueueStats;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

pub fn record_job_enqueued(kind: JobKind) {
    ::metrics::counter!("render_jobs_enqueued_total", 1, "kind" => kind.as_str());
}

pub fn record_job_completed(kind: JobKind, duration: Option<Duration>) {
    ::metrics::counter!("render_jobs_completed_total", 1, "kind" => kind.as_str());
    if let Some(duration) = duration {
        ::metrics::histogram!("render_job_duration_seconds", duration.as_secs_f64(), "kind" => kind.as_str());
    }
}

pub fn record_job_failed(kind: JobKind) {
    ::metrics::counter!("render_jobs_failed_total", 1, "kind" => kind.as_str());
}

pub fn record_job_retried(kind: JobKind) {
    ::metrics::counter!("render_jobs_retried_total", 1, "kind" => kind.as_str());
}

pub fn record_job_stalled(kind: JobKind) {
    ::metrics::counter!("render_jobs_stalled_total", 1, "kind" => kind.as_str());
}

/// One pipeline run; `outcome` is `"success"` or an error kind label.
pub fn record_render(kind: JobKind, duration: Duration, outcome: &'static str) {
    ::metrics::histogram!(
        "render_pipeline_duration_seconds",
        duration.as_secs_f64(),
        "kind" => kind.as_str(),
        "outcome" => outcome
    );
}

pub fn record_queue_depth(kind: JobKind, stats: &QueueStats) {
    ::metrics::gauge!("render_queue_waiting", stats.waiting as f64, "kind" => kind.as_str());
    ::metrics::gauge!("render_queue_active", stats.active as f64, "kind" => kind.as_str());
    ::metrics::gauge!("render_queue_delayed", stats.delayed as f64, "kind" => kind.as_str());
}

pub fn record_pool_utilization(active: usize, capacity: usize) {
    let utilization = if capacity == 0 {
        0.0
    } else {
        (active as f64 / capacity as f64) * 100.0
    };
    ::metrics::gauge!("browser_pool_active_leases", active as f64);
    ::metrics::gauge!("browser_pool_utilization_percent", utilization);
}

pub fn record_pool_health(healthy: usize, total: usize) {
    ::metrics::gauge!("browser_pool_healthy_instances", healthy as f64);
    ::metrics::gauge!("browser_pool_instances", total as f64);
}

pub fn record_pool_exhausted() {
    ::metrics::increment_counter!("browser_pool_exhausted_total");
}

pub fn record_browser_replaced() {
    ::metrics::increment_counter!("browser_replacements_total");
}

/// Install the Prometheus recorder with its scrape listener on `port`.
pub fn install_prometheus(port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    info!(%addr, "Prometheus exporter listening");
    Ok(())
}
