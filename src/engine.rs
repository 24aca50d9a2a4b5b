//! Browser engine capabilities the pool and pipeline are written against
//!
//! The pool only ever sees a launched browser as an opaque [`BrowserProcess`]
//! and a leased page as a [`RenderPage`]. The production implementation lives
//! in [`crate::chrome`]; tests plug in an in-process fake.

use crate::config::Viewport;
use crate::error::RenderError;
use crate::job::{Cookie, PdfOptions, ScreenshotOptions, WaitUntil};
use crate::utils::ResourceFilter;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Isolation settings for a freshly opened browser context.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextOptions {
    pub viewport: Viewport,
    pub user_agent: Option<String>,
}

/// Starts browser processes for pool slots.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, instance_id: usize) -> Result<Arc<dyn BrowserProcess>, RenderError>;
}

/// One running browser process.
#[async_trait]
pub trait BrowserProcess: Send + Sync {
    /// Open an isolated context holding a single page.
    async fn open_page(&self, options: &ContextOptions) -> Result<Arc<dyn RenderPage>, RenderError>;

    /// Round-trip to the browser; callers bound it with a timeout.
    async fn ping(&self) -> Result<(), RenderError>;

    /// Cheap liveness check that does not talk to the browser.
    fn is_alive(&self) -> bool;

    async fn terminate(&self);
}

/// A page inside its own context. Closing it disposes the context too.
#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> Result<(), RenderError>;

    /// `url` scopes cookies that carry no explicit domain.
    async fn set_cookies(&self, cookies: &[Cookie], url: Option<&str>) -> Result<(), RenderError>;

    async fn block_resources(&self, filter: ResourceFilter) -> Result<(), RenderError>;

    async fn navigate(&self, url: &str, wait_until: WaitUntil) -> Result<(), RenderError>;

    async fn set_content(&self, html: &str, wait_until: WaitUntil) -> Result<(), RenderError>;

    async fn wait_for_selector(&self, selector: &str) -> Result<(), RenderError>;

    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, RenderError>;

    async fn pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, RenderError>;

    async fn close(&self) -> Result<(), RenderError>;
}
