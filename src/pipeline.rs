//! The render pipeline one job goes through once it holds a lease
//!
//! acquire context (10) → headers, cookies, blocking (30) → navigate and wait
//! (60) → capture (80) → upload (90). The context goes back to the pool
//! whatever happens; acknowledging the job (100) is the caller's business.

use crate::browser_pool::{BrowserPool, LeasedContext};
use crate::config::RenderConfig;
use crate::engine::ContextOptions;
use crate::error::RenderError;
use crate::job::{Job, JobKind, JobOptions, JobResult, JobSource};
use crate::metrics;
use crate::storage::{ArtifactStore, Metadata};
use crate::utils::{format_bytes, ResourceFilter};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const PROGRESS_ACQUIRED: u8 = 10;
pub const PROGRESS_CONFIGURED: u8 = 30;
pub const PROGRESS_NAVIGATED: u8 = 60;
pub const PROGRESS_CAPTURED: u8 = 80;
pub const PROGRESS_UPLOADED: u8 = 90;

/// Receives progress milestones; returning an error stops the pipeline at
/// that milestone (used for cooperative cancellation).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: u8) -> Result<(), RenderError>;
}

/// Reporter for synchronous renders, which nobody polls.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _percent: u8) -> Result<(), RenderError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub result: JobResult,
    /// Pixel size of screenshots; `None` for PDFs.
    pub dimensions: Option<(u32, u32)>,
    pub duration: Duration,
}

pub struct RenderPipeline {
    pool: Arc<BrowserPool>,
    store: Arc<dyn ArtifactStore>,
    config: RenderConfig,
}

impl RenderPipeline {
    pub fn new(pool: Arc<BrowserPool>, store: Arc<dyn ArtifactStore>, config: RenderConfig) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Run the whole pipeline for `job` under the configured job timeout.
    pub async fn run(
        &self,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<RenderOutput, RenderError> {
        let started = Instant::now();
        let job_timeout = self.config.job_timeout;

        let outcome = match timeout(job_timeout, self.execute(job, progress)).await {
            Ok(outcome) => outcome,
            // An unreleased lease frees its slot on drop; a release already in
            // progress freed it before closing the page.
            Err(_) => Err(RenderError::timeout("render job", job_timeout)),
        };
        let duration = started.elapsed();

        match &outcome {
            Ok(output) => {
                info!(
                    job_id = %job.id,
                    kind = %job.kind,
                    size = %format_bytes(output.result.size),
                    ?duration,
                    "Render finished"
                );
                metrics::record_render(job.kind, duration, "success");
            }
            Err(e) => {
                warn!(job_id = %job.id, kind = %job.kind, error = %e, ?duration, "Render failed");
                metrics::record_render(job.kind, duration, e.kind());
            }
        }

        outcome.map(|mut output| {
            output.duration = duration;
            output
        })
    }

    async fn execute(
        &self,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<RenderOutput, RenderError> {
        let render = job.render_options();
        let context_options = ContextOptions {
            viewport: render
                .viewport
                .clone()
                .unwrap_or_else(|| self.config.default_viewport.clone()),
            user_agent: render.user_agent.clone().or_else(|| self.config.user_agent.clone()),
        };

        let lease = self.pool.acquire_page(&context_options).await?;
        debug!(
            job_id = %job.id,
            context_id = %lease.context_id(),
            instance_id = lease.instance_id(),
            "Context acquired"
        );

        let outcome = self.render_on(&lease, job, progress).await;
        lease.release().await;
        outcome
    }

    async fn render_on(
        &self,
        lease: &LeasedContext,
        job: &Job,
        progress: &dyn ProgressReporter,
    ) -> Result<RenderOutput, RenderError> {
        let render = job.render_options();
        let page = lease.page();
        progress.report(PROGRESS_ACQUIRED)?;

        page.set_extra_headers(&render.headers).await?;
        let cookie_scope = match &job.source {
            JobSource::Url(url) => Some(url.as_str()),
            JobSource::Html(_) => None,
        };
        page.set_cookies(&render.cookies, cookie_scope).await?;
        page.block_resources(ResourceFilter::new(render.block_resources.clone()))
            .await?;
        progress.report(PROGRESS_CONFIGURED)?;

        let navigation_timeout = render
            .navigation_timeout
            .unwrap_or(self.config.navigation_timeout);
        let navigated = match &job.source {
            JobSource::Url(url) => {
                timeout(navigation_timeout, page.navigate(url, render.wait_until)).await
            }
            JobSource::Html(html) => {
                timeout(navigation_timeout, page.set_content(html, render.wait_until)).await
            }
        };
        navigated.map_err(|_| RenderError::timeout("navigation", navigation_timeout))??;

        if let Some(selector) = &render.wait_for_selector {
            let wait = self.config.default_timeout;
            timeout(wait, page.wait_for_selector(selector))
                .await
                .map_err(|_| RenderError::timeout("selector wait", wait))??;
        }
        if let Some(delay) = render.delay {
            tokio::time::sleep(delay).await;
        }
        progress.report(PROGRESS_NAVIGATED)?;

        let capture_timeout = self.config.default_timeout;
        let captured = match &job.options {
            JobOptions::Screenshot(options) => {
                timeout(capture_timeout, page.screenshot(options)).await
            }
            JobOptions::Pdf(options) => timeout(capture_timeout, page.pdf(options)).await,
        };
        let bytes = captured.map_err(|_| RenderError::timeout("capture", capture_timeout))??;
        if bytes.is_empty() {
            return Err(RenderError::Capture("browser returned an empty artifact".to_string()));
        }
        let dimensions = match job.kind {
            JobKind::Screenshot => image_dimensions(&bytes),
            JobKind::Pdf => None,
        };
        progress.report(PROGRESS_CAPTURED)?;

        let content_type = job.options.content_type();
        let size = bytes.len();
        let mut metadata = Metadata::new();
        metadata.insert("job_id".to_string(), job.id.clone());
        metadata.insert("kind".to_string(), job.kind.to_string());
        if let JobSource::Url(url) = &job.source {
            metadata.insert("source_url".to_string(), url.clone());
        }
        if let Some((width, height)) = dimensions {
            metadata.insert("width".to_string(), width.to_string());
            metadata.insert("height".to_string(), height.to_string());
        }

        let key = self
            .store
            .upload(bytes, content_type, &metadata)
            .await?;
        let url = match self.store.signed_url(&key, self.config.signed_url_ttl).await {
            Ok(url) => url,
            Err(e) => {
                discard_artifact(self.store.clone(), key);
                return Err(e.into());
            }
        };

        if let Err(e) = progress.report(PROGRESS_UPLOADED) {
            discard_artifact(self.store.clone(), key);
            return Err(e);
        }

        Ok(RenderOutput {
            result: JobResult {
                key,
                url,
                size,
                content_type: content_type.to_string(),
            },
            dimensions,
            duration: Duration::ZERO,
        })
    }
}

fn image_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    let reader = image::io::Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    match reader.into_dimensions() {
        Ok(dimensions) => Some(dimensions),
        Err(e) => {
            debug!(error = %e, "Could not read screenshot dimensions");
            None
        }
    }
}

/// Best-effort deletion of an artifact nobody will claim, off the caller's path.
pub fn discard_artifact(store: Arc<dyn ArtifactStore>, key: String) {
    tokio::spawn(async move {
        match store.delete(&key).await {
            Ok(()) => debug!(%key, "Discarded orphaned artifact"),
            Err(e) => error!(%key, error = %e, "Failed to discard orphaned artifact"),
        }
    });
}
