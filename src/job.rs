//! Job records and render options
//!
//! A [`Job`] is the durable representation of one render request. Its options
//! are a tagged variant keyed by [`JobKind`], validated once at enqueue time so
//! the pipeline can trust what it leases.

use crate::config::Viewport;
use crate::utils::{validate_url, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

pub type JobId = String;

const MAX_VIEWPORT_WIDTH: u32 = 7680;
const MAX_VIEWPORT_HEIGHT: u32 = 4320;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Screenshot,
    Pdf,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Screenshot, JobKind::Pdf];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Screenshot => "screenshot",
            JobKind::Pdf => "pdf",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "screenshot" => Ok(JobKind::Screenshot),
            "pdf" => Ok(JobKind::Pdf),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Priority tiers; a lower numeric value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub fn value(&self) -> u8 {
        match self {
            Priority::High => 1,
            Priority::Normal => 5,
            Priority::Low => 10,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" | "1" => Ok(Priority::High),
            "normal" | "5" => Ok(Priority::Normal),
            "low" | "10" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// What to render: a remote page or inline markup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Url(String),
    Html(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitUntil {
    #[default]
    #[serde(rename = "load")]
    Load,
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    #[serde(rename = "networkidle")]
    NetworkIdle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Options shared by both job kinds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub viewport: Option<Viewport>,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: Vec<Cookie>,
    pub block_resources: BTreeSet<ResourceKind>,
    pub wait_until: WaitUntil,
    pub navigation_timeout: Option<Duration>,
    pub wait_for_selector: Option<String>,
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Webp => "image/webp",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotOptions {
    #[serde(flatten)]
    pub render: RenderOptions,
    pub format: ImageFormat,
    pub quality: Option<u8>,
    pub full_page: bool,
    pub omit_background: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaperFormat {
    Letter,
    Legal,
    Tabloid,
    A3,
    #[default]
    A4,
    A5,
}

impl PaperFormat {
    /// Paper size in inches as (width, height).
    pub fn dimensions(&self) -> (f64, f64) {
        match self {
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
            PaperFormat::A3 => (11.69, 16.54),
            PaperFormat::A4 => (8.27, 11.69),
            PaperFormat::A5 => (5.83, 8.27),
        }
    }
}

/// Page margins in inches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfOptions {
    #[serde(flatten)]
    pub render: RenderOptions,
    pub format: PaperFormat,
    /// Explicit paper size in inches, overrides `format`.
    pub paper_size: Option<(f64, f64)>,
    pub margins: Margins,
    pub landscape: bool,
    pub print_background: bool,
    pub scale: f64,
    pub header_template: Option<String>,
    pub footer_template: Option<String>,
    pub page_ranges: Option<String>,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            render: RenderOptions::default(),
            format: PaperFormat::default(),
            paper_size: None,
            margins: Margins::default(),
            landscape: false,
            print_background: true,
            scale: 1.0,
            header_template: None,
            footer_template: None,
            page_ranges: None,
        }
    }
}

impl PdfOptions {
    pub fn paper_dimensions(&self) -> (f64, f64) {
        self.paper_size.unwrap_or_else(|| self.format.dimensions())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "options", rename_all = "lowercase")]
pub enum JobOptions {
    Screenshot(ScreenshotOptions),
    Pdf(PdfOptions),
}

impl JobOptions {
    pub fn kind(&self) -> JobKind {
        match self {
            JobOptions::Screenshot(_) => JobKind::Screenshot,
            JobOptions::Pdf(_) => JobKind::Pdf,
        }
    }

    pub fn render(&self) -> &RenderOptions {
        match self {
            JobOptions::Screenshot(opts) => &opts.render,
            JobOptions::Pdf(opts) => &opts.render,
        }
    }

    pub fn render_mut(&mut self) -> &mut RenderOptions {
        match self {
            JobOptions::Screenshot(opts) => &mut opts.render,
            JobOptions::Pdf(opts) => &mut opts.render,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            JobOptions::Screenshot(opts) => opts.format.content_type(),
            JobOptions::Pdf(_) => "application/pdf",
        }
    }
}

/// A render request as submitted by the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(flatten)]
    pub options: JobOptions,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl JobRequest {
    pub fn screenshot(url: impl Into<String>) -> Self {
        Self {
            id: None,
            url: Some(url.into()),
            html: None,
            options: JobOptions::Screenshot(ScreenshotOptions::default()),
            priority: Priority::Normal,
            max_attempts: None,
        }
    }

    pub fn pdf(url: impl Into<String>) -> Self {
        Self {
            options: JobOptions::Pdf(PdfOptions::default()),
            ..Self::screenshot(url)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn kind(&self) -> JobKind {
        self.options.kind()
    }

    /// Check the request and resolve its source.
    pub fn validate(&self) -> Result<JobSource, String> {
        let source = match (&self.url, &self.html) {
            (Some(_), Some(_)) => return Err("url and html are mutually exclusive".to_string()),
            (None, None) => return Err("either url or html is required".to_string()),
            (Some(url), None) => {
                validate_url(url).map_err(|e| format!("invalid url {url}: {e}"))?;
                JobSource::Url(url.clone())
            }
            (None, Some(html)) => {
                if html.trim().is_empty() {
                    return Err("html must not be empty".to_string());
                }
                JobSource::Html(html.clone())
            }
        };

        validate_render_options(self.options.render())?;

        match &self.options {
            JobOptions::Screenshot(opts) => {
                if let Some(quality) = opts.quality {
                    if opts.format == ImageFormat::Png {
                        return Err("quality is not supported for png".to_string());
                    }
                    if !(1..=100).contains(&quality) {
                        return Err(format!("quality must be between 1 and 100, got {quality}"));
                    }
                }
            }
            JobOptions::Pdf(opts) => {
                if !(0.1..=2.0).contains(&opts.scale) {
                    return Err(format!("scale must be between 0.1 and 2.0, got {}", opts.scale));
                }
                let m = &opts.margins;
                if [m.top, m.right, m.bottom, m.left].iter().any(|v| *v < 0.0) {
                    return Err("margins must not be negative".to_string());
                }
                if let Some((w, h)) = opts.paper_size {
                    if w <= 0.0 || h <= 0.0 {
                        return Err("paper size must be positive".to_string());
                    }
                }
            }
        }

        if self.max_attempts == Some(0) {
            return Err("max_attempts must be at least 1".to_string());
        }

        Ok(source)
    }
}

fn validate_render_options(opts: &RenderOptions) -> Result<(), String> {
    if let Some(viewport) = &opts.viewport {
        if viewport.width == 0 || viewport.height == 0 {
            return Err("viewport dimensions must be greater than 0".to_string());
        }
        if viewport.width > MAX_VIEWPORT_WIDTH || viewport.height > MAX_VIEWPORT_HEIGHT {
            return Err(format!(
                "viewport {}x{} exceeds {}x{}",
                viewport.width, viewport.height, MAX_VIEWPORT_WIDTH, MAX_VIEWPORT_HEIGHT
            ));
        }
        if viewport.device_scale_factor <= 0.0 {
            return Err("device_scale_factor must be positive".to_string());
        }
    }
    if opts.navigation_timeout.is_some_and(|t| t.is_zero()) {
        return Err("navigation_timeout must be greater than 0".to_string());
    }
    if let Some(selector) = &opts.wait_for_selector {
        if selector.trim().is_empty() {
            return Err("wait_for_selector must not be empty".to_string());
        }
    }
    for cookie in &opts.cookies {
        if cookie.name.is_empty() {
            return Err("cookie names must not be empty".to_string());
        }
    }
    Ok(())
}

/// Where a finished artifact lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub key: String,
    pub url: String,
    pub size: usize,
    pub content_type: String,
}

/// The durable job record owned by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub source: JobSource,
    pub options: JobOptions,
    pub priority: Priority,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub stalled_count: u32,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh Pending record for a validated request.
    pub fn pending(
        id: JobId,
        request: JobRequest,
        source: JobSource,
        default_max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind: request.kind(),
            source,
            max_attempts: request.max_attempts.unwrap_or(default_max_attempts),
            priority: request.priority,
            options: request.options,
            status: JobStatus::Pending,
            progress: 0,
            attempts: 0,
            stalled_count: 0,
            result: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            available_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn render_options(&self) -> &RenderOptions {
        self.options.render()
    }

    /// Pending but held back by a retry backoff.
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.available_at > now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_values_order_high_first() {
        assert_eq!(Priority::High.value(), 1);
        assert_eq!(Priority::Normal.value(), 5);
        assert_eq!(Priority::Low.value(), 10);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
    }

    #[test]
    fn test_request_requires_exactly_one_source() {
        let mut request = JobRequest::screenshot("https://example.com");
        assert_eq!(
            request.validate(),
            Ok(JobSource::Url("https://example.com".to_string()))
        );

        request.html = Some("<h1>hi</h1>".to_string());
        assert!(request.validate().is_err());

        request.url = None;
        assert_eq!(
            request.validate(),
            Ok(JobSource::Html("<h1>hi</h1>".to_string()))
        );

        request.html = None;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_request_rejects_non_http_url() {
        assert!(JobRequest::screenshot("ftp://example.com").validate().is_err());
        assert!(JobRequest::screenshot("file:///etc/passwd").validate().is_err());
    }

    #[test]
    fn test_screenshot_quality_rules() {
        let mut opts = ScreenshotOptions {
            quality: Some(80),
            ..Default::default()
        };
        let mut request = JobRequest::screenshot("https://example.com");
        request.options = JobOptions::Screenshot(opts.clone());
        assert!(request.validate().is_err(), "png does not take a quality");

        opts.format = ImageFormat::Jpeg;
        request.options = JobOptions::Screenshot(opts.clone());
        assert!(request.validate().is_ok());

        opts.quality = Some(0);
        request.options = JobOptions::Screenshot(opts);
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_pdf_scale_and_margins() {
        let mut request = JobRequest::pdf("https://example.com");
        request.options = JobOptions::Pdf(PdfOptions {
            scale: 3.0,
            ..Default::default()
        });
        assert!(request.validate().is_err());

        request.options = JobOptions::Pdf(PdfOptions {
            margins: Margins {
                top: -1.0,
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_oversized_viewport_rejected() {
        let mut request = JobRequest::screenshot("https://example.com");
        request.options = JobOptions::Screenshot(ScreenshotOptions {
            render: RenderOptions {
                viewport: Some(Viewport {
                    width: 10_000,
                    height: 100,
                    device_scale_factor: 1.0,
                    mobile: false,
                }),
                ..Default::default()
            },
            ..Default::default()
        });
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_request_json_is_tagged_by_kind() {
        let json = r#"{
            "url": "https://example.com",
            "kind": "pdf",
            "options": { "landscape": true, "format": "letter", "block_resources": ["image", "font"] },
            "priority": "high"
        }"#;
        let request: JobRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.kind(), JobKind::Pdf);
        assert_eq!(request.priority, Priority::High);
        match &request.options {
            JobOptions::Pdf(opts) => {
                assert!(opts.landscape);
                assert_eq!(opts.paper_dimensions(), (8.5, 11.0));
                assert!(opts.render.block_resources.contains(&ResourceKind::Image));
                assert!(opts.render.block_resources.contains(&ResourceKind::Font));
            }
            other => panic!("expected pdf options, got {other:?}"),
        }
    }
}
