//! The render engine: one long-lived browser, a page pool and an admission queue.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized --init--> Launching --> Ready <--> Restarting
//!       ^                                 |            |
//!       +------- relaunch failed ---------+------------+
//!                                   close() from anywhere --> Closed
//! ```
//!
//! Jobs submitted while the engine is `Launching` or `Restarting` wait in the queue,
//! which is paused for as long as no browser is available.

use crate::backend::{BrowserLauncher, BrowserSession, RenderPage};
use crate::chromium::ChromiumLauncher;
use crate::config::{EngineConfig, ScreenshotSpec};
use crate::job::{ensure_artifact_exists, normalize_artifact_path, AdmittedJob, JobSource, RenderJob};
use crate::markup::prepare_direct_markup;
use crate::metrics;
use crate::page_pool::{PagePool, PoolStats};
use crate::queue::{settle, AdmissionQueue, JobRunner, QueueStats};
use crate::resource_cache::ResourceCache;
use crate::task_registry::TaskRegistry;
use crate::utils::{format_duration, lock};
use crate::{ErrorSeverity, RenderError};
use futures::FutureExt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// How long `close()` waits for running jobs before tearing the browser down.
const CLOSE_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineLifecycle {
    Uninitialized,
    Launching,
    Ready,
    Restarting,
    Closed,
}

struct EngineState {
    lifecycle: EngineLifecycle,
    render_count: usize,
    session: Option<Arc<dyn BrowserSession>>,
    idle_timer: Option<JoinHandle<()>>,
}

struct EngineInner {
    config: Mutex<EngineConfig>,
    state: Mutex<EngineState>,
    queue: AdmissionQueue<AdmittedJob, Vec<u8>>,
    pool: Arc<PagePool>,
    cache: ResourceCache,
    registry: TaskRegistry,
    launcher: Arc<dyn BrowserLauncher>,
    /// Serialises init, restart and teardown.
    transition: tokio::sync::Mutex<()>,
    this: Weak<EngineInner>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
    }
}

/// Renders jobs on a shared browser with bounded concurrency.
///
/// Cloning is cheap; all clones drive the same browser.
///
/// # Examples
///
/// ```rust,no_run
/// use markup_render::{EngineConfig, RenderEngine, RenderJob};
///
/// # async fn example() -> Result<(), markup_render::RenderError> {
/// let engine = RenderEngine::new(EngineConfig::default());
/// engine.init().await?;
///
/// let job = RenderJob::file("card_1", "/tmp/card_1.html");
/// let jpeg = engine.execute_task(job).await?;
/// println!("{} bytes", jpeg.len());
///
/// engine.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RenderEngine {
    inner: Arc<EngineInner>,
}

impl RenderEngine {
    /// Creates an engine backed by Chrome. Must be called inside a Tokio runtime.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_launcher(config, Arc::new(ChromiumLauncher::new()))
    }

    pub fn with_launcher(config: EngineConfig, launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self::with_parts(config, launcher, TaskRegistry::new())
    }

    /// Creates an engine that retires tasks in an existing registry.
    pub fn with_parts(
        config: EngineConfig,
        launcher: Arc<dyn BrowserLauncher>,
        registry: TaskRegistry,
    ) -> Self {
        let mut config = config;
        config.pool = config.pool.normalized();
        config.max_concurrent = config.max_concurrent.max(1);

        let inner = Arc::new_cyclic(|this: &Weak<EngineInner>| {
            let weak = this.clone();
            let runner: JobRunner<AdmittedJob, Vec<u8>> = Arc::new(move |admitted| {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(inner) => inner.run_job(admitted).await,
                        None => Err(RenderError::EngineClosed),
                    }
                }
                .boxed()
            });

            let queue = AdmissionQueue::new(config.max_concurrent, runner);
            queue.pause();

            EngineInner {
                pool: Arc::new(PagePool::new(config.pool.clone())),
                cache: ResourceCache::new(config.cache.clone()),
                config: Mutex::new(config),
                state: Mutex::new(EngineState {
                    lifecycle: EngineLifecycle::Uninitialized,
                    render_count: 0,
                    session: None,
                    idle_timer: None,
                }),
                queue,
                registry,
                launcher,
                transition: tokio::sync::Mutex::new(()),
                this: this.clone(),
            }
        });

        Self { inner }
    }

    /// Launches the browser and starts dispatching queued jobs.
    ///
    /// Calling `init` on a ready engine is a no-op.
    pub async fn init(&self) -> Result<(), RenderError> {
        let _transition = self.inner.transition.lock().await;

        {
            let mut state = lock(&self.inner.state);
            match state.lifecycle {
                EngineLifecycle::Ready => return Ok(()),
                EngineLifecycle::Closed => return Err(RenderError::EngineClosed),
                _ => state.lifecycle = EngineLifecycle::Launching,
            }
        }

        info!("Launching browser...");
        let config = self.config();

        match self.inner.launch_with_retry(&config).await {
            Ok(session) => {
                let orphan = {
                    let mut state = lock(&self.inner.state);
                    if state.lifecycle == EngineLifecycle::Closed {
                        Some(session)
                    } else {
                        state.session = Some(session);
                        state.render_count = 0;
                        state.lifecycle = EngineLifecycle::Ready;
                        if state.idle_timer.is_none() {
                            state.idle_timer = Some(
                                self.inner
                                    .pool
                                    .start_idle_cleanup(config.pool.cleanup_interval),
                            );
                        }
                        self.inner.queue.resume();
                        None
                    }
                };

                // Closed while launching
                if let Some(session) = orphan {
                    let _ = session.close().await;
                    return Err(RenderError::EngineClosed);
                }

                info!(
                    "Render engine ready (max concurrent {}, restart after {} renders)",
                    config.max_concurrent, config.restart_after_renders
                );
                Ok(())
            }
            Err(e) => {
                {
                    let mut state = lock(&self.inner.state);
                    if state.lifecycle != EngineLifecycle::Closed {
                        state.lifecycle = EngineLifecycle::Uninitialized;
                    }
                }
                error!("Browser launch failed: {}", e);
                self.inner.queue.reject_pending(e.clone());
                Err(e)
            }
        }
    }

    /// Admits a job and waits for its image.
    ///
    /// Engine-scoped fields of `job.overrides` are applied to the shared engine before
    /// the job is queued; job-scoped ones only affect this job.
    pub async fn execute_task(&self, job: RenderJob) -> Result<Vec<u8>, RenderError> {
        let (receiver, restart) = {
            let mut state = lock(&self.inner.state);
            match state.lifecycle {
                EngineLifecycle::Uninitialized => return Err(RenderError::EngineNotInitialized),
                EngineLifecycle::Closed => return Err(RenderError::EngineClosed),
                _ => {}
            }

            let settings = self.inner.admit_settings(&job);

            let mut restart = false;
            if state.lifecycle == EngineLifecycle::Ready {
                let crashed = state
                    .session
                    .as_ref()
                    .is_some_and(|session| !session.is_connected());
                state.render_count += 1;

                if crashed {
                    warn!("Browser disconnected, relaunching before task {}", job.task_id);
                }
                if crashed || state.render_count >= settings.restart_after_renders {
                    restart = self.inner.begin_restart(&mut state);
                }
            }

            debug!("Admitting task {} ({})", job.task_id, job.source.mode());
            let receiver = self.inner.queue.enqueue(AdmittedJob { job, settings })?;
            let stats = self.inner.queue.stats();
            metrics::set_queue_depth(stats.queue_length, stats.processing_count);

            (receiver, restart)
        };

        if restart {
            self.inner.spawn_restart();
        }

        settle(receiver).await
    }

    /// Replaces the browser process, keeping every queued job.
    ///
    /// Running jobs finish on the old process first. If no new process can be launched,
    /// queued jobs are rejected with the launch error and the engine needs `init` again.
    pub async fn restart_browser(&self) {
        let _transition = self.inner.transition.lock().await;

        {
            let mut state = lock(&self.inner.state);
            match state.lifecycle {
                EngineLifecycle::Closed | EngineLifecycle::Uninitialized => return,
                EngineLifecycle::Restarting => {}
                _ => {
                    state.lifecycle = EngineLifecycle::Restarting;
                    self.inner.queue.pause();
                }
            }
            info!(
                "Restarting browser after {} renders ({} queued)",
                state.render_count,
                self.inner.queue.stats().queue_length
            );
        }

        self.inner.queue.wait_idle().await;

        let old = lock(&self.inner.state).session.take();
        let dropped = self.inner.pool.drain().await;
        debug!("Dropped {} pooled pages of the old browser", dropped);
        if let Some(old) = old {
            if let Err(e) = old.close().await {
                warn!("Failed to close old browser: {}", e);
            }
        }
        metrics::record_browser_restart();

        let config = self.config();
        match self.inner.launch_with_retry(&config).await {
            Ok(session) => {
                let orphan = {
                    let mut state = lock(&self.inner.state);
                    if state.lifecycle == EngineLifecycle::Closed {
                        Some(session)
                    } else {
                        state.session = Some(session);
                        state.render_count = 0;
                        state.lifecycle = EngineLifecycle::Ready;
                        self.inner.queue.resume();
                        None
                    }
                };

                match orphan {
                    Some(session) => {
                        let _ = session.close().await;
                    }
                    None => info!("Browser restarted"),
                }
            }
            Err(e) => {
                error!("Browser relaunch failed: {}", e);
                {
                    let mut state = lock(&self.inner.state);
                    if state.lifecycle != EngineLifecycle::Closed {
                        state.lifecycle = EngineLifecycle::Uninitialized;
                    }
                }
                self.inner.queue.reject_pending(e);
            }
        }
    }

    /// Rejects queued jobs, waits briefly for running ones and shuts the browser down.
    pub async fn close(&self) -> Result<(), RenderError> {
        {
            let mut state = lock(&self.inner.state);
            if state.lifecycle == EngineLifecycle::Closed {
                return Ok(());
            }
            state.lifecycle = EngineLifecycle::Closed;
        }

        let rejected = self.inner.queue.close();
        info!("Closing render engine ({} queued jobs rejected)", rejected);

        if timeout(CLOSE_GRACE_PERIOD, self.inner.queue.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "{} jobs still running after {:?}, closing anyway",
                self.inner.queue.stats().processing_count,
                CLOSE_GRACE_PERIOD
            );
        }

        let _transition = self.inner.transition.lock().await;

        let (session, timer) = {
            let mut state = lock(&self.inner.state);
            (state.session.take(), state.idle_timer.take())
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        self.inner.pool.shut_down().await;
        self.inner.registry.stop_cleanup_timers();

        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    pub fn get_processing(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn render_count(&self) -> usize {
        lock(&self.inner.state).render_count
    }

    pub fn lifecycle(&self) -> EngineLifecycle {
        lock(&self.inner.state).lifecycle
    }

    /// Snapshot of the current engine-wide configuration.
    pub fn config(&self) -> EngineConfig {
        lock(&self.inner.config).clone()
    }
}

impl EngineInner {
    /// Moves a ready engine to `Restarting` and holds the queue. Returns whether the
    /// caller must spawn the restart.
    fn begin_restart(&self, state: &mut EngineState) -> bool {
        if state.lifecycle != EngineLifecycle::Ready {
            return false;
        }
        state.lifecycle = EngineLifecycle::Restarting;
        self.queue.pause();
        true
    }

    fn spawn_restart(&self) {
        if let Some(inner) = self.this.upgrade() {
            let engine = RenderEngine { inner };
            tokio::spawn(async move { engine.restart_browser().await });
        }
    }

    /// Resolves the settings for one job and applies its engine-scoped overrides.
    fn admit_settings(&self, job: &RenderJob) -> EngineConfig {
        let mut base = lock(&self.config);
        let settings = base.merged(&job.overrides);

        if job.overrides.touches_engine() {
            base.max_concurrent = settings.max_concurrent;
            base.restart_after_renders = settings.restart_after_renders;
            base.pool = settings.pool.clone();
            base.cache = settings.cache.clone();

            self.queue.set_max_concurrent(base.max_concurrent);
            self.pool.set_limits(base.pool.clone());
            self.cache.set_limits(base.cache.clone());
        }

        settings
    }

    async fn launch_with_retry(
        &self,
        config: &EngineConfig,
    ) -> Result<Arc<dyn BrowserSession>, RenderError> {
        let attempts = config.retry.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            match self.launcher.launch(config, self.cache.clone()).await {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!("Browser launch attempt {}/{} failed: {}", attempt + 1, attempts, e);
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        sleep(config.retry.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RenderError::BrowserLaunchFailed("no launch attempted".to_string())))
    }

    fn under_pressure(&self) -> bool {
        let stats = self.queue.stats();
        stats.queue_length > 0 || stats.processing_count > 1
    }

    async fn run_job(&self, admitted: AdmittedJob) -> Result<Vec<u8>, RenderError> {
        let AdmittedJob { job, settings } = admitted;
        let started = Instant::now();

        let result = self
            .capture(&job, &settings)
            .await
            .map_err(|e| e.classify(job.source.describe()));

        self.registry.cleanup_task(&job.task_id);
        metrics::record_render(started.elapsed(), &result);

        match &result {
            Ok(image) => info!(
                "Task {} rendered ({} bytes in {})",
                job.task_id,
                image.len(),
                format_duration(started.elapsed())
            ),
            Err(e) => match e.severity() {
                ErrorSeverity::Low | ErrorSeverity::Medium => {
                    warn!("Task {} failed: {}", job.task_id, e)
                }
                ErrorSeverity::High | ErrorSeverity::Critical => {
                    error!("Task {} failed: {}", job.task_id, e)
                }
            },
        }

        result
    }

    async fn capture(
        &self,
        job: &RenderJob,
        settings: &EngineConfig,
    ) -> Result<Vec<u8>, RenderError> {
        let session = lock(&self.state)
            .session
            .clone()
            .ok_or(RenderError::EngineNotInitialized)?;
        if !session.is_connected() {
            // Jobs still queued wait for the relaunch; this one is already dispatched.
            if self.begin_restart(&mut lock(&self.state)) {
                warn!("Browser disconnected during task {}, relaunching", job.task_id);
                self.spawn_restart();
            }
            return Err(RenderError::PageLost("browser disconnected".to_string()));
        }

        let page = self.pool.acquire(session.as_ref()).await?;

        let result = match timeout(
            settings.task_timeout,
            execute_on_page(page.as_ref(), job, settings),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RenderError::TaskTimeout(settings.task_timeout)),
        };

        match &result {
            Err(e) if e.taints_page() => self.pool.discard(page).await,
            _ => self.pool.release(page, self.under_pressure()).await,
        }

        result
    }
}

async fn execute_on_page(
    page: &dyn RenderPage,
    job: &RenderJob,
    settings: &EngineConfig,
) -> Result<Vec<u8>, RenderError> {
    let options = &job.options;
    let viewport = options.viewport.as_ref().unwrap_or(&settings.viewport);
    page.set_viewport(viewport).await?;

    let load_timeout = options.goto.timeout.unwrap_or(settings.page_load_timeout);

    match &job.source {
        JobSource::File { html_file_path } => {
            let (path, url) = normalize_artifact_path(html_file_path)?;
            ensure_artifact_exists(&path).await?;

            page.navigate(
                url.as_str(),
                options.goto.wait_until.unwrap_or_default(),
                load_timeout,
            )
            .await?;
        }
        JobSource::Direct {
            html_content,
            virtual_url,
        } => {
            let html = prepare_direct_markup(html_content, virtual_url);
            page.set_content(&html, load_timeout).await?;
            page.wait_for_network_idle(settings.network_idle_timeout)
                .await?;
        }
    }

    let selector = options.selector();
    page.wait_for_selector(selector, settings.selector_timeout)
        .await?;

    let spec = ScreenshotSpec::resolve(&options.screenshot);
    page.screenshot_element(selector, &spec).await
}
