//! Chrome/Chromium backend built on chromiumoxide
//!
//! One browser process per session with a single isolated browser context. Every page
//! created in that context pauses its requests through the CDP `Fetch` domain so that
//! static sub-resources are answered from, and recorded into, the [`ResourceCache`].

use crate::backend::{BrowserLauncher, BrowserSession, RenderPage};
use crate::config::{create_browser_config, EngineConfig, ImageFormat, ScreenshotSpec, Viewport, WaitUntil};
use crate::resource_cache::{is_static_resource, ResourceCache};
use crate::utils::lock;
use crate::RenderError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FulfillRequestParams,
    GetResponseBodyParams, HeaderEntry, RequestPattern, RequestStage,
};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, Viewport as ClipViewport};
use chromiumoxide::cdp::browser_protocol::target::{CreateBrowserContextParams, CreateTargetParams};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const NETWORK_QUIET_PERIOD: Duration = Duration::from_millis(500);

/// Reports `document.readyState` and how many resource loads have started so far.
const NETWORK_PROBE: &str =
    "JSON.stringify([document.readyState, performance.getEntriesByType('resource').length])";

/// The resource timing buffer stops growing at 250 entries, which would freeze the
/// network idle check on a long-lived pooled page.
const CLEAR_RESOURCE_TIMINGS: &str = "(() => { performance.clearResourceTimings(); return true; })()";

const CLEAR_DOCUMENT: &str = "(() => { \
    if (document.body) { document.body.innerHTML = ''; } \
    performance.clearResourceTimings(); \
    return true; })()";

static LAUNCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Launches real Chrome processes.
#[derive(Debug, Default, Clone)]
pub struct ChromiumLauncher;

impl ChromiumLauncher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(
        &self,
        config: &EngineConfig,
        cache: ResourceCache,
    ) -> Result<Arc<dyn BrowserSession>, RenderError> {
        Ok(Arc::new(ChromiumSession::launch(config, cache).await?))
    }
}

pub struct ChromiumSession {
    browser: Mutex<Browser>,
    handler: JoinHandle<()>,
    context_id: Option<BrowserContextId>,
    cache: ResourceCache,
    connected: Arc<AtomicBool>,
    /// Removed once the process has exited.
    profile: StdMutex<Option<TempDir>>,
}

impl ChromiumSession {
    /// Starts a browser with a fresh profile directory owned by the session.
    pub async fn launch(config: &EngineConfig, cache: ResourceCache) -> Result<Self, RenderError> {
        let launch_id = LAUNCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        let profile = tempfile::Builder::new()
            .prefix(&format!("markup-render-{}-{}-", std::process::id(), launch_id))
            .tempdir()?;
        let browser_config = create_browser_config(config, profile.path())?;

        let (mut browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| RenderError::BrowserLaunchFailed(e.to_string()))?;

        let connected = Arc::new(AtomicBool::new(true));
        let handler_connected = connected.clone();

        // The handler is a stream that must be polled for the CDP connection to make progress
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Browser handler error: {}", e);
                        break;
                    }
                    None => {
                        debug!("Browser handler stream ended");
                        break;
                    }
                }
            }
            handler_connected.store(false, Ordering::Relaxed);
        });

        let context_id = match browser
            .create_browser_context(CreateBrowserContextParams::default())
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Falling back to the default browser context: {}", e);
                None
            }
        };

        // Pages opened by the launch itself are never used
        if let Ok(pages) = browser.pages().await {
            for page in pages {
                let _ = page.close().await;
            }
        }

        info!("Browser launched (launch {})", launch_id);

        Ok(ChromiumSession {
            browser: Mutex::new(browser),
            handler: handler_task,
            context_id,
            cache,
            connected,
            profile: StdMutex::new(Some(profile)),
        })
    }

    pub fn profile_dir(&self) -> Option<PathBuf> {
        lock(&self.profile)
            .as_ref()
            .map(|dir| dir.path().to_path_buf())
    }

    /// Opens a page in the session's context with request interception enabled.
    pub async fn open_page(&self) -> Result<ChromiumPage, RenderError> {
        let mut target = CreateTargetParams::builder().url("about:blank");
        if let Some(context_id) = &self.context_id {
            target = target.browser_context_id(context_id.clone());
        }
        let target = target.build().map_err(RenderError::Browser)?;

        let page = self.browser.lock().await.new_page(target).await?;
        let interceptor = install_interception(&page, self.cache.clone()).await?;

        debug!("Created page");
        Ok(ChromiumPage { page, interceptor })
    }
}

#[async_trait]
impl BrowserSession for ChromiumSession {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, RenderError> {
        Ok(Box::new(self.open_page().await?))
    }

    async fn close(&self) -> Result<(), RenderError> {
        let mut browser = self.browser.lock().await;
        let result = browser.close().await.map(|_| ());
        let _ = browser.wait().await;
        self.handler.abort();
        self.connected.store(false, Ordering::Relaxed);
        remove_profile(&self.profile);
        info!("Browser closed");
        result.map_err(RenderError::from)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed) && !self.handler.is_finished()
    }
}

fn remove_profile(profile: &StdMutex<Option<TempDir>>) {
    if let Some(dir) = lock(profile).take() {
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            warn!("Failed to remove browser profile {}: {}", path.display(), e);
        }
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

/// Enables `Fetch` on the page and spawns the task answering its paused requests.
async fn install_interception(
    page: &Page,
    cache: ResourceCache,
) -> Result<JoinHandle<()>, RenderError> {
    let mut paused = page.event_listener::<EventRequestPaused>().await?;

    let pattern = |stage: RequestStage| RequestPattern {
        url_pattern: Some("*".to_string()),
        resource_type: None,
        request_stage: Some(stage),
    };
    page.execute(EnableParams {
        patterns: Some(vec![pattern(RequestStage::Request), pattern(RequestStage::Response)]),
        handle_auth_requests: None,
    })
    .await?;

    let page = page.clone();
    Ok(tokio::spawn(async move {
        while let Some(event) = paused.next().await {
            let page = page.clone();
            let cache = cache.clone();
            tokio::spawn(async move {
                if let Err(e) = answer_paused_request(&page, &cache, &event).await {
                    debug!("Paused request {} not answered: {}", event.request.url, e);
                }
            });
        }
    }))
}

async fn answer_paused_request(
    page: &Page,
    cache: &ResourceCache,
    event: &EventRequestPaused,
) -> Result<(), RenderError> {
    let url = event.request.url.as_str();
    let request_id = event.request_id.clone();

    if !is_static_resource(url) {
        page.execute(ContinueRequestParams::new(request_id)).await?;
        return Ok(());
    }

    match event.response_status_code {
        // Request stage
        None if event.response_error_reason.is_none() => {
            if let Some(hit) = cache.lookup(url) {
                let headers: Vec<HeaderEntry> = hit
                    .headers
                    .iter()
                    .map(|(name, value)| HeaderEntry::new(name.clone(), value.clone()))
                    .collect();

                let fulfill = FulfillRequestParams::builder()
                    .request_id(request_id)
                    .response_code(i64::from(hit.status))
                    .response_headers(headers)
                    .body(BASE64.encode(&hit.body))
                    .build()
                    .map_err(RenderError::Browser)?;
                page.execute(fulfill).await?;
                return Ok(());
            }
        }
        // Response stage
        Some(status) if (200..300).contains(&status) => {
            let body = page
                .execute(GetResponseBodyParams::new(request_id.clone()))
                .await?;
            let bytes = if body.result.base64_encoded {
                BASE64
                    .decode(body.result.body.as_bytes())
                    .map_err(|e| RenderError::Browser(e.to_string()))?
            } else {
                body.result.body.clone().into_bytes()
            };
            let headers = event
                .response_headers
                .as_ref()
                .map(|headers| {
                    headers
                        .iter()
                        .map(|entry| (entry.name.clone(), entry.value.clone()))
                        .collect()
                })
                .unwrap_or_default();

            cache.store_response(url, status as u16, headers, Bytes::from(bytes));
        }
        _ => {}
    }

    page.execute(ContinueRequestParams::new(request_id)).await?;
    Ok(())
}

pub struct ChromiumPage {
    page: Page,
    interceptor: JoinHandle<()>,
}

impl ChromiumPage {
    /// `document.readyState` and the number of resource loads recorded since the last
    /// clear.
    pub async fn probe_network(&self) -> Result<(String, u64), RenderError> {
        let raw: String = self.page.evaluate(NETWORK_PROBE).await?.into_value()?;
        let (ready_state, resources): (String, u64) = serde_json::from_str(&raw)?;
        Ok((ready_state, resources))
    }
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), RenderError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(RenderError::Browser)?;

        self.page.execute(params).await?;
        Ok(())
    }

    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        limit: Duration,
    ) -> Result<(), RenderError> {
        let started = Instant::now();

        timeout(limit, self.page.goto(url))
            .await
            .map_err(|_| RenderError::Browser(format!("Navigation timeout of {limit:?} exceeded")))??;

        if wait_until == WaitUntil::NetworkIdle {
            let remaining = limit.saturating_sub(started.elapsed());
            self.wait_for_network_idle(remaining).await?;
        }

        Ok(())
    }

    async fn set_content(&self, html: &str, limit: Duration) -> Result<(), RenderError> {
        self.page.evaluate(CLEAR_RESOURCE_TIMINGS).await?;
        timeout(limit, self.page.set_content(html))
            .await
            .map_err(|_| RenderError::Browser(format!("Content load timeout of {limit:?} exceeded")))??;
        Ok(())
    }

    async fn wait_for_network_idle(&self, limit: Duration) -> Result<(), RenderError> {
        let deadline = Instant::now() + limit;
        let mut last_count = None;
        let mut quiet_since = Instant::now();

        loop {
            let (ready_state, count) = self.probe_network().await?;
            let now = Instant::now();

            if last_count != Some(count) {
                last_count = Some(count);
                quiet_since = now;
            } else if ready_state == "complete" && now - quiet_since >= NETWORK_QUIET_PERIOD {
                return Ok(());
            }

            if now >= deadline {
                return Err(RenderError::Browser(format!(
                    "Timeout of {limit:?} exceeded waiting for network idle"
                )));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn wait_for_selector(&self, selector: &str, limit: Duration) -> Result<(), RenderError> {
        let deadline = Instant::now() + limit;

        loop {
            match self.page.find_element(selector).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if let RenderError::PageLost(message) = RenderError::from(e).classify(selector) {
                        return Err(RenderError::Browser(message));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(RenderError::TargetElementNotFound(selector.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn screenshot_element(
        &self,
        selector: &str,
        spec: &ScreenshotSpec,
    ) -> Result<Vec<u8>, RenderError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| RenderError::TargetElementNotFound(selector.to_string()))?;
        let bounds = element.scroll_into_view().await?.bounding_box().await?;

        let format = match spec.format {
            ImageFormat::Jpeg => CaptureScreenshotFormat::Jpeg,
            ImageFormat::Png => CaptureScreenshotFormat::Png,
        };

        let mut params = ScreenshotParams::builder()
            .format(format)
            .clip(ClipViewport {
                x: bounds.x,
                y: bounds.y,
                width: bounds.width,
                height: bounds.height,
                scale: 1.0,
            })
            .capture_beyond_viewport(true)
            .omit_background(spec.omit_background);
        if let Some(quality) = spec.quality {
            params = params.quality(i64::from(quality));
        }

        Ok(self.page.screenshot(params.build()).await?)
    }

    async fn reset(&self) -> Result<(), RenderError> {
        self.page.evaluate(CLEAR_DOCUMENT).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), RenderError> {
        self.interceptor.abort();
        self.page.clone().close().await?;
        Ok(())
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        self.interceptor.abort();
    }
}
