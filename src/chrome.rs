//! Chromium engine driven over the DevTools protocol with chromiumoxide
//!
//! Every pool slot is one Chromium process with its own user data dir. Each
//! lease gets a fresh browser context (incognito-like isolation) holding a
//! single page; closing the page disposes the context.

use crate::config::{get_chrome_args, PoolConfig};
use crate::engine::{BrowserLauncher, BrowserProcess, ContextOptions, RenderPage};
use crate::error::RenderError;
use crate::job::{Cookie, ImageFormat, PdfOptions, ScreenshotOptions, WaitUntil};
use crate::utils::{ResourceFilter, ResourceKind};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams as FetchEnableParams, EventRequestPaused,
    FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, ErrorReason, Headers, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, EventLifecycleEvent, NavigateParams, PrintToPdfParams,
    SetDocumentContentParams, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::listeners::EventStream;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::{FutureExt, Stream, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Chrome's own networkIdle threshold: no connections for 500ms.
const INLINE_IDLE_WINDOW: Duration = Duration::from_millis(500);

/// Launches one Chromium process per pool slot.
pub struct ChromeLauncher {
    config: PoolConfig,
}

impl ChromeLauncher {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }

    fn browser_config(&self, user_data_dir: &PathBuf) -> Result<BrowserConfig, RenderError> {
        let mut builder = BrowserConfig::builder()
            .args(get_chrome_args(&self.config))
            .user_data_dir(user_data_dir);

        if let Some(chrome_path) = &self.config.chrome_path {
            builder = builder.chrome_executable(chrome_path);
        }

        builder.build().map_err(RenderError::BrowserUnavailable)
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, instance_id: usize) -> Result<Arc<dyn BrowserProcess>, RenderError> {
        let root = self
            .config
            .user_data_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let user_data_dir = root.join(format!(
            "render-farm-{}-{}-{}",
            std::process::id(),
            instance_id,
            uuid::Uuid::new_v4().simple()
        ));
        tokio::fs::create_dir_all(&user_data_dir).await.map_err(|e| {
            RenderError::BrowserUnavailable(format!("failed to create user data dir: {e}"))
        })?;

        let (browser, mut handler) = Browser::launch(self.browser_config(&user_data_dir)?)
            .await
            .map_err(|e| RenderError::BrowserUnavailable(format!("launch failed: {e}")))?;

        // The handler must be polled for the CDP connection to make progress.
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    warn!(instance_id, error = %e, "Browser handler error");
                    break;
                }
            }
            debug!(instance_id, "Browser handler stream ended");
        });

        info!(instance_id, dir = %user_data_dir.display(), "Launched browser process");
        Ok(Arc::new(ChromeBrowser {
            instance_id,
            browser: Arc::new(Mutex::new(browser)),
            handler: handler_task,
            user_data_dir,
        }))
    }
}

pub struct ChromeBrowser {
    instance_id: usize,
    browser: Arc<Mutex<Browser>>,
    handler: JoinHandle<()>,
    user_data_dir: PathBuf,
}

#[async_trait]
impl BrowserProcess for ChromeBrowser {
    async fn open_page(&self, options: &ContextOptions) -> Result<Arc<dyn RenderPage>, RenderError> {
        let (context_id, page) = {
            let mut browser = self.browser.lock().await;
            let context_id = browser
                .create_browser_context(CreateBrowserContextParams::default())
                .await?;
            let target = CreateTargetParams::builder()
                .url("about:blank")
                .browser_context_id(context_id.clone())
                .build()
                .map_err(RenderError::BrowserUnavailable)?;

            match browser.new_page(target).await {
                Ok(page) => (context_id, page),
                Err(e) => {
                    let _ = browser.dispose_browser_context(context_id).await;
                    return Err(e.into());
                }
            }
        };

        let page = ChromePage {
            page,
            context_id,
            browser: self.browser.clone(),
            interceptor: parking_lot::Mutex::new(None),
        };
        if let Err(e) = page.apply_context_options(options).await {
            let _ = page.close().await;
            return Err(e);
        }
        Ok(Arc::new(page))
    }

    async fn ping(&self) -> Result<(), RenderError> {
        let browser = self.browser.lock().await;
        browser.version().await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    async fn terminate(&self) {
        {
            let mut browser = self.browser.lock().await;
            if tokio::time::timeout(CLOSE_TIMEOUT, browser.close()).await.is_err() {
                warn!(instance_id = self.instance_id, "Browser did not close in time, killing it");
            }
            let _ = browser.kill().await;
        }
        self.handler.abort();

        if let Err(e) = tokio::fs::remove_dir_all(&self.user_data_dir).await {
            debug!(instance_id = self.instance_id, error = %e, "Could not remove user data dir");
        }
        info!(instance_id = self.instance_id, "Browser process terminated");
    }
}

struct ChromePage {
    page: Page,
    context_id: BrowserContextId,
    browser: Arc<Mutex<Browser>>,
    interceptor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChromePage {
    async fn apply_context_options(&self, options: &ContextOptions) -> Result<(), RenderError> {
        let viewport = &options.viewport;
        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(RenderError::BrowserUnavailable)?;
        self.page.execute(metrics).await?;

        if let Some(user_agent) = &options.user_agent {
            self.page
                .execute(SetUserAgentOverrideParams::new(user_agent.clone()))
                .await?;
        }
        Ok(())
    }

    /// Subscribe to lifecycle events, dropping the ones Chrome replays for the
    /// document already in the frame when they are enabled.
    async fn lifecycle_events(&self) -> Result<EventStream<EventLifecycleEvent>, RenderError> {
        let mut events = self.page.event_listener::<EventLifecycleEvent>().await?;
        self.page
            .execute(SetLifecycleEventsEnabledParams::new(true))
            .await?;
        while let Some(Some(_)) = events.next().now_or_never() {}
        Ok(events)
    }
}

/// Lifecycle event a wait strategy waits for, or `None` for the load event.
fn lifecycle_milestone(wait_until: WaitUntil) -> Option<&'static str> {
    match wait_until {
        WaitUntil::Load => None,
        WaitUntil::DomContentLoaded => Some("DOMContentLoaded"),
        WaitUntil::NetworkIdle => Some("networkIdle"),
    }
}

async fn wait_for_lifecycle<S, E>(events: S, reached: impl Fn(&E) -> bool) -> Result<(), RenderError>
where
    S: Stream<Item = E>,
{
    futures::pin_mut!(events);
    while let Some(event) = events.next().await {
        if reached(&event) {
            return Ok(());
        }
    }
    Err(RenderError::Navigation(
        "page closed before the awaited lifecycle event".to_string(),
    ))
}

#[async_trait]
impl RenderPage for ChromePage {
    async fn set_extra_headers(&self, headers: &BTreeMap<String, String>) -> Result<(), RenderError> {
        if headers.is_empty() {
            return Ok(());
        }
        let value = serde_json::to_value(headers)
            .map_err(|e| RenderError::InvalidRequest(format!("invalid headers: {e}")))?;
        self.page
            .execute(SetExtraHttpHeadersParams::new(Headers::new(value)))
            .await?;
        Ok(())
    }

    async fn set_cookies(&self, cookies: &[Cookie], url: Option<&str>) -> Result<(), RenderError> {
        if cookies.is_empty() {
            return Ok(());
        }
        let params = cookies
            .iter()
            .map(|cookie| {
                let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
                param.domain = cookie.domain.clone();
                param.path = cookie.path.clone();
                if param.domain.is_none() {
                    param.url = url.map(str::to_string);
                }
                param
            })
            .collect::<Vec<_>>();
        self.page.set_cookies(params).await?;
        Ok(())
    }

    async fn block_resources(&self, filter: ResourceFilter) -> Result<(), RenderError> {
        if filter.is_empty() {
            return Ok(());
        }

        let mut paused = self.page.event_listener::<EventRequestPaused>().await?;
        let page = self.page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let kind = ResourceKind::from_browser_type(event.resource_type.as_ref());
                let result = if filter.should_block(kind) {
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
                } else {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };
                if let Err(e) = result {
                    debug!(error = %e, "Intercepted request could not be resolved");
                }
            }
        });
        if let Some(previous) = self.interceptor.lock().replace(task) {
            previous.abort();
        }

        self.page.execute(FetchEnableParams::default()).await?;
        Ok(())
    }

    async fn navigate(&self, url: &str, wait_until: WaitUntil) -> Result<(), RenderError> {
        let failed = |e: String| RenderError::Navigation(format!("{url}: {e}"));
        let Some(milestone) = lifecycle_milestone(wait_until) else {
            // goto resolves once the load event fired.
            return self
                .page
                .goto(url)
                .await
                .map(|_| ())
                .map_err(|e| failed(e.to_string()));
        };

        let events = self.lifecycle_events().await?;
        let navigated = self
            .page
            .execute(NavigateParams::new(url))
            .await
            .map_err(|e| failed(e.to_string()))?;
        if let Some(error) = navigated.result.error_text.clone() {
            return Err(failed(error));
        }
        // Same-document navigations start no new loader.
        let Some(loader_id) = navigated.result.loader_id.clone() else {
            return Ok(());
        };
        let frame_id = navigated.result.frame_id.clone();

        wait_for_lifecycle(events, |event: &Arc<EventLifecycleEvent>| {
            event.name == milestone && event.frame_id == frame_id && event.loader_id == loader_id
        })
        .await
    }

    async fn set_content(&self, html: &str, wait_until: WaitUntil) -> Result<(), RenderError> {
        let failed = |e: String| RenderError::Navigation(format!("inline html: {e}"));
        match wait_until {
            WaitUntil::Load => self
                .page
                .set_content(html)
                .await
                .map(|_| ())
                .map_err(|e| failed(e.to_string())),
            WaitUntil::DomContentLoaded => {
                let frame_id = self
                    .page
                    .mainframe()
                    .await
                    .map_err(|e| failed(e.to_string()))?
                    .ok_or_else(|| failed("page has no main frame".to_string()))?;
                // The document is parsed by the time the command returns.
                self.page
                    .execute(SetDocumentContentParams::new(frame_id, html))
                    .await
                    .map(|_| ())
                    .map_err(|e| failed(e.to_string()))
            }
            WaitUntil::NetworkIdle => {
                let frame_id = self
                    .page
                    .mainframe()
                    .await
                    .map_err(|e| failed(e.to_string()))?
                    .ok_or_else(|| failed("page has no main frame".to_string()))?;
                let events = self.lifecycle_events().await?;
                self.page
                    .set_content(html)
                    .await
                    .map_err(|e| failed(e.to_string()))?;

                // Writing a document keeps the frame's loader, so Chrome only
                // reports idleness again if requests outlive the load event.
                let idle = wait_for_lifecycle(events, |event: &Arc<EventLifecycleEvent>| {
                    event.name == "networkIdle" && event.frame_id == frame_id
                });
                match tokio::time::timeout(INLINE_IDLE_WINDOW, idle).await {
                    Ok(result) => result,
                    Err(_) => Ok(()),
                }
            }
        }
    }

    async fn wait_for_selector(&self, selector: &str) -> Result<(), RenderError> {
        loop {
            if self.page.find_element(selector).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn screenshot(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, RenderError> {
        let format = match options.format {
            ImageFormat::Png => CaptureScreenshotFormat::Png,
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            ImageFormat::Webp => CaptureScreenshotFormat::Webp,
        };
        let mut builder = ScreenshotParams::builder()
            .format(format)
            .full_page(options.full_page)
            .omit_background(options.omit_background);
        if let Some(quality) = options.quality {
            builder = builder.quality(quality as i64);
        }

        self.page
            .screenshot(builder.build())
            .await
            .map_err(|e| RenderError::Capture(e.to_string()))
    }

    async fn pdf(&self, options: &PdfOptions) -> Result<Vec<u8>, RenderError> {
        let (width, height) = options.paper_dimensions();
        let header_footer = options.header_template.is_some() || options.footer_template.is_some();
        let params = PrintToPdfParams {
            landscape: Some(options.landscape),
            print_background: Some(options.print_background),
            scale: Some(options.scale),
            paper_width: Some(width),
            paper_height: Some(height),
            margin_top: Some(options.margins.top),
            margin_right: Some(options.margins.right),
            margin_bottom: Some(options.margins.bottom),
            margin_left: Some(options.margins.left),
            display_header_footer: Some(header_footer),
            header_template: options.header_template.clone(),
            footer_template: options.footer_template.clone(),
            page_ranges: options.page_ranges.clone(),
            ..Default::default()
        };

        self.page
            .pdf(params)
            .await
            .map_err(|e| RenderError::Capture(e.to_string()))
    }

    async fn close(&self) -> Result<(), RenderError> {
        if let Some(interceptor) = self.interceptor.lock().take() {
            interceptor.abort();
        }

        let closed = self.page.clone().close().await;
        let disposed = self
            .browser
            .lock()
            .await
            .dispose_browser_context(self.context_id.clone())
            .await;

        closed?;
        disposed?;
        Ok(())
    }
}
