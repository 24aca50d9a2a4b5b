//! In-process browser engine for tests
//!
//! Behaves like a browser as far as the pool and pipeline can tell: contexts
//! open and close, screenshots decode as real PNGs, and individual instances
//! can be made unresponsive or crash-prone on demand.

use crate::engine::{BrowserLauncher, BrowserProcess, ContextOptions, RenderPage};
use crate::error::RenderError;
use crate::job::{Cookie, PdfOptions, ScreenshotOptions, WaitUntil};
use crate::utils::ResourceFilter;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Knobs shared by every page the launcher hands out.
#[derive(Default)]
pub struct PageBehavior {
    navigation_failures: AtomicUsize,
    hang_navigation: AtomicBool,
    navigation_delay: Mutex<Option<Duration>>,
    fail_capture: AtomicBool,
    panic_on_capture: AtomicBool,
    missing_selector: AtomicBool,
    hang_close: AtomicBool,
}

#[derive(Default)]
pub struct FakeLauncher {
    browsers: Mutex<Vec<(usize, Arc<FakeBrowser>)>>,
    fail_launches: AtomicBool,
    fail_next_open: Arc<AtomicBool>,
    behavior: Arc<PageBehavior>,
    pages_opened: Arc<AtomicUsize>,
    pages_closed: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_open(&self) {
        self.fail_next_open.store(true, Ordering::SeqCst);
    }

    /// The next `count` navigations fail.
    pub fn fail_navigations(&self, count: usize) {
        self.behavior.navigation_failures.store(count, Ordering::SeqCst);
    }

    pub fn hang_navigation(&self, hang: bool) {
        self.behavior.hang_navigation.store(hang, Ordering::SeqCst);
    }

    pub fn navigation_delay(&self, delay: Duration) {
        *self.behavior.navigation_delay.lock() = Some(delay);
    }

    pub fn fail_capture(&self, fail: bool) {
        self.behavior.fail_capture.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_capture(&self, panic: bool) {
        self.behavior.panic_on_capture.store(panic, Ordering::SeqCst);
    }

    pub fn missing_selector(&self, missing: bool) {
        self.behavior.missing_selector.store(missing, Ordering::SeqCst);
    }

    /// Closing a page never completes while set.
    pub fn hang_close(&self, hang: bool) {
        self.behavior.hang_close.store(hang, Ordering::SeqCst);
    }

    /// First browser launched for a slot.
    pub fn browser(&self, instance_id: usize) -> Option<Arc<FakeBrowser>> {
        self.browsers
            .lock()
            .iter()
            .find(|(id, _)| *id == instance_id)
            .map(|(_, b)| b.clone())
    }

    pub fn launches(&self) -> usize {
        self.browsers.lock().len()
    }

    pub fn pages_opened(&self) -> usize {
        self.pages_opened.load(Ordering::SeqCst)
    }

    pub fn pages_closed(&self) -> usize {
        self.pages_closed.load(Ordering::SeqCst)
    }

    /// Page operations in the order they happened.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self, instance_id: usize) -> Result<Arc<dyn BrowserProcess>, RenderError> {
        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(RenderError::BrowserUnavailable("launch refused".to_string()));
        }
        let browser = Arc::new(FakeBrowser {
            alive: AtomicBool::new(true),
            unresponsive: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            fail_next_open: self.fail_next_open.clone(),
            behavior: self.behavior.clone(),
            pages_opened: self.pages_opened.clone(),
            pages_closed: self.pages_closed.clone(),
            log: self.log.clone(),
        });
        self.browsers.lock().push((instance_id, browser.clone()));
        Ok(browser)
    }
}

pub struct FakeBrowser {
    alive: AtomicBool,
    unresponsive: AtomicBool,
    terminated: AtomicBool,
    fail_next_open: Arc<AtomicBool>,
    behavior: Arc<PageBehavior>,
    pages_opened: Arc<AtomicUsize>,
    pages_closed: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakeBrowser {
    /// Pings never answer while set.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrowserProcess for FakeBrowser {
    async fn open_page(&self, options: &ContextOptions) -> Result<Arc<dyn RenderPage>, RenderError> {
        if self.fail_next_open.swap(false, Ordering::SeqCst) {
            return Err(RenderError::BrowserUnavailable("target crashed".to_string()));
        }
        self.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePage {
            options: options.clone(),
            closed: AtomicBool::new(false),
            behavior: self.behavior.clone(),
            pages_closed: self.pages_closed.clone(),
            log: self.log.clone(),
        }))
    }

    async fn ping(&self) -> Result<(), RenderError> {
        if self.unresponsive.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst)
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }
}

pub struct FakePage {
    options: ContextOptions,
    closed: AtomicBool,
    behavior: Arc<PageBehavior>,
    pages_closed: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl FakePage {
    fn record(&self, entry: String) {
        self.log.lock().push(entry);
    }
}

#[async_trait]
impl RenderPage for FakePage {
    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> Result<(), RenderError> {
        for (name, value) in headers {
            self.record(format!("header {name}={value}"));
        }
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[Cookie], _url: Option<&str>) -> Result<(), RenderError> {
        for cookie in cookies {
            self.record(format!("cookie {}", cookie.name));
        }
        Ok(())
    }

    async fn block_resources(&self, filter: ResourceFilter) -> Result<(), RenderError> {
        for kind in filter.blocked() {
            self.record(format!("block {kind:?}"));
        }
        Ok(())
    }

    async fn navigate(&self, url: &str, _wait_until: WaitUntil) -> Result<(), RenderError> {
        self.record(format!("navigate {url}"));
        let delay = *self.behavior.navigation_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.hang_navigation.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let failures = &self.behavior.navigation_failures;
        if failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RenderError::Navigation(format!("{url}: net::ERR_CONNECTION_RESET")));
        }
        Ok(())
    }

    async fn set_content(&self, html: &str, _wait_until: WaitUntil) -> Result<(), RenderError> {
        self.record(format!("content {} bytes", html.len()));
        Ok(())
    }

    async fn wait_for_selector(&self, selector: &str) -> Result<(), RenderError> {
        self.record(format!("selector {selector}"));
        if self.behavior.missing_selector.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, RenderError> {
        if self.behavior.panic_on_capture.load(Ordering::SeqCst) {
            panic!("renderer crashed");
        }
        if self.behavior.fail_capture.load(Ordering::SeqCst) {
            return Err(RenderError::Capture("target closed".to_string()));
        }
        self.record(format!("screenshot {:?}", options.format));

        let viewport = &self.options.viewport;
        let image = image::RgbaImage::new(viewport.width, viewport.height);
        let mut bytes = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut bytes, image::ImageOutputFormat::Png)
            .map_err(|e| RenderError::Capture(e.to_string()))?;
        Ok(bytes.into_inner())
    }

    async fn pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, RenderError> {
        if self.behavior.fail_capture.load(Ordering::SeqCst) {
            return Err(RenderError::Capture("printing failed".to_string()));
        }
        self.record(format!("pdf landscape={}", options.landscape));
        Ok(b"%PDF-1.7\n%fake\n".to_vec())
    }

    async fn close(&self) -> Result<(), RenderError> {
        if self.behavior.hang_close.load(Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pages_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
