//! Configuration management with serde serialization/deserialization
//!
//! This module provides the engine configuration, the per-call override set and the
//! per-job renderer options (navigation, target selector, screenshot format).

use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Default JPEG quality when none (or zero) is requested.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Default target element for captures.
pub const DEFAULT_SELECTOR: &str = "body";

/// Main configuration structure for the render engine
///
/// Controls the admission queue, the page pool, the resource cache, artifact retention
/// and the renderer process recycling policy.
///
/// # Examples
///
/// ```rust
/// use markup_render::EngineConfig;
///
/// let config = EngineConfig {
///     max_concurrent: 4,
///     restart_after_renders: 500,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of jobs executing at once (default: CPU count clamped to 10-15)
    pub max_concurrent: usize,

    /// Hard deadline for one job, racing the whole capture (default: 15 seconds)
    pub task_timeout: Duration,

    /// Navigation / content injection deadline (default: 15 seconds)
    pub page_load_timeout: Duration,

    /// How long to wait for the target selector to attach (default: 3 seconds)
    pub selector_timeout: Duration,

    /// Direct mode network-idle wait (default: 10 seconds)
    pub network_idle_timeout: Duration,

    /// Relaunch the renderer process after this many renders (default: 200)
    ///
    /// Bounds memory growth of the long-lived browser under sustained load.
    pub restart_after_renders: usize,

    /// Base URL used when markup is rendered inline without one of its own
    pub default_virtual_url: String,

    /// Browser viewport used for new pages
    pub viewport: Viewport,

    pub pool: PagePoolConfig,

    pub cache: CacheConfig,

    pub artifacts: ArtifactConfig,

    /// Backoff used when relaunching the browser and for caller-level retries
    pub retry: RetryConfig,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string
    pub user_agent: Option<String>,

    /// Run the browser headless (default: true)
    pub headless: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: num_cpus::get().clamp(10, 15),
            task_timeout: Duration::from_secs(15),
            page_load_timeout: Duration::from_secs(15),
            selector_timeout: Duration::from_secs(3),
            network_idle_timeout: Duration::from_secs(10),
            restart_after_renders: 200,
            default_virtual_url: "http://127.0.0.1:8080".to_string(),
            viewport: Viewport::default(),
            pool: PagePoolConfig::default(),
            cache: CacheConfig::default(),
            artifacts: ArtifactConfig::default(),
            retry: RetryConfig::default(),
            chrome_path: None,
            user_agent: None,
            headless: true,
        }
    }
}

impl EngineConfig {
    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.max_concurrent == 0 {
            return Err(RenderError::Configuration(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.task_timeout.is_zero() || self.page_load_timeout.is_zero() {
            return Err(RenderError::Configuration(
                "timeouts must be greater than 0".to_string(),
            ));
        }
        if self.restart_after_renders == 0 {
            return Err(RenderError::Configuration(
                "restart_after_renders must be greater than 0".to_string(),
            ));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(RenderError::Configuration(
                "viewport dimensions must be greater than 0".to_string(),
            ));
        }
        if self.pool.max_pages == 0 {
            return Err(RenderError::Configuration(
                "pool.max_pages must be greater than 0".to_string(),
            ));
        }
        if !(self.cache.cleanup_ratio > 0.0 && self.cache.cleanup_ratio <= 1.0) {
            return Err(RenderError::Configuration(
                "cache.cleanup_ratio must be in (0, 1]".to_string(),
            ));
        }
        if self.cache.max_items == 0 || self.cache.max_bytes == 0 {
            return Err(RenderError::Configuration(
                "cache limits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Layers `overrides` on top of this configuration without touching either input.
    pub fn merged(&self, overrides: &EngineOverrides) -> EngineConfig {
        let mut merged = self.clone();

        if let Some(max_concurrent) = overrides.max_concurrent {
            merged.max_concurrent = max_concurrent.max(1);
        }
        if let Some(timeout) = overrides.task_timeout {
            merged.task_timeout = timeout;
        }
        if let Some(timeout) = overrides.page_load_timeout {
            merged.page_load_timeout = timeout;
        }
        if let Some(timeout) = overrides.selector_timeout {
            merged.selector_timeout = timeout;
        }
        if let Some(timeout) = overrides.network_idle_timeout {
            merged.network_idle_timeout = timeout;
        }
        if let Some(renders) = overrides.restart_after_renders {
            merged.restart_after_renders = renders.max(1);
        }
        if let Some(viewport) = &overrides.viewport {
            merged.viewport = viewport.clone();
        }
        if let Some(max_pages) = overrides.max_pages {
            merged.pool.max_pages = max_pages.max(1);
        }
        if let Some(min_pages) = overrides.min_pages {
            merged.pool.min_pages = min_pages;
        }
        if let Some(idle) = overrides.page_idle_timeout {
            merged.pool.idle_timeout = idle;
        }
        if let Some(items) = overrides.cache_max_items {
            merged.cache.max_items = items.max(1);
        }
        if let Some(bytes) = overrides.cache_max_bytes {
            merged.cache.max_bytes = bytes.max(1);
        }
        if let Some(ratio) = overrides.cache_cleanup_ratio {
            merged.cache.cleanup_ratio = ratio.clamp(f64::EPSILON, 1.0);
        }

        merged.pool = merged.pool.normalized();
        merged
    }
}

/// Per-call overrides of the engine tunables
///
/// Job-scoped fields (timeouts, viewport) only affect the job they travel with;
/// engine-scoped fields (concurrency, pool, cache, restart ceiling) are applied to the
/// shared engine when the job is admitted.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct EngineOverrides {
    pub max_concurrent: Option<usize>,
    pub task_timeout: Option<Duration>,
    pub page_load_timeout: Option<Duration>,
    pub selector_timeout: Option<Duration>,
    pub network_idle_timeout: Option<Duration>,
    pub restart_after_renders: Option<usize>,
    pub viewport: Option<Viewport>,
    pub max_pages: Option<usize>,
    pub min_pages: Option<usize>,
    pub page_idle_timeout: Option<Duration>,
    pub cache_max_items: Option<usize>,
    pub cache_max_bytes: Option<usize>,
    pub cache_cleanup_ratio: Option<f64>,
}

impl EngineOverrides {
    /// True when any field targets the shared engine rather than a single job.
    pub fn touches_engine(&self) -> bool {
        self.max_concurrent.is_some()
            || self.restart_after_renders.is_some()
            || self.max_pages.is_some()
            || self.min_pages.is_some()
            || self.page_idle_timeout.is_some()
            || self.cache_max_items.is_some()
            || self.cache_max_bytes.is_some()
            || self.cache_cleanup_ratio.is_some()
    }
}

/// Browser viewport configuration
///
/// # Examples
///
/// ```rust
/// use markup_render::Viewport;
///
/// let card = Viewport {
///     width: 1200,
///     height: 630,
///     device_scale_factor: 2.0,
///     mobile: false,
/// };
/// assert_eq!(Viewport::default().width, 800);
/// # let _ = card;
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Viewport {
    /// Viewport width in pixels (default: 800)
    pub width: u32,

    /// Viewport height in pixels (default: 600)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PagePoolConfig {
    /// Upper bound on idle pages kept for reuse (default: 10)
    pub max_pages: usize,

    /// Idle pages kept even when there is no load (default: 2)
    pub min_pages: usize,

    /// Pages idle longer than this are closed by the background scan (default: 10 minutes)
    pub idle_timeout: Duration,

    /// How often the idle scan runs (default: 3 minutes)
    pub cleanup_interval: Duration,
}

impl Default for PagePoolConfig {
    fn default() -> Self {
        Self {
            max_pages: 10,
            min_pages: 2,
            idle_timeout: Duration::from_secs(10 * 60),
            cleanup_interval: Duration::from_secs(3 * 60),
        }
    }
}

impl PagePoolConfig {
    /// Keeps `min_pages <= max_pages` and `max_pages >= 1`.
    pub fn normalized(mut self) -> Self {
        self.max_pages = self.max_pages.max(1);
        self.min_pages = self.min_pages.min(self.max_pages);
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry count that triggers eviction (default: 50)
    pub max_items: usize,

    /// Total body size that triggers eviction (default: 300 MB)
    pub max_bytes: usize,

    /// Fraction of entries removed by one eviction pass (default: 2/3)
    pub cleanup_ratio: f64,

    /// Entries younger than this are never evicted (default: 30 seconds)
    pub min_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_items: 50,
            max_bytes: 300 * 1024 * 1024,
            cleanup_ratio: 2.0 / 3.0,
            min_age: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Root directory for on-disk markup (default: `<cwd>/.data/component`)
    pub root: PathBuf,

    /// Completed artifacts retained per directory by the cleanup timer (default: 2)
    pub keep_count: usize,

    /// Cleanup timer period (default: 5 minutes)
    pub cleanup_interval: Duration,

    /// An artifact must be at least this old before it can be reused (default: 5 seconds)
    pub reuse_min_age: Duration,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        let root = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".data")
            .join("component");

        Self {
            root,
            keep_count: 2,
            cleanup_interval: Duration::from_secs(5 * 60),
            reuse_min_age: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff for the given zero-based attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(delay as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Lifecycle point a navigation waits for
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    #[default]
    DomContentLoaded,
    Load,
    NetworkIdle,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct NavigationOptions {
    pub timeout: Option<Duration>,
    pub wait_until: Option<WaitUntil>,
}

/// Screenshot request as supplied by a caller
///
/// `format` is free text on purpose: anything other than JPEG or PNG is recovered by
/// falling back to JPEG at quality 90.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ScreenshotOptions {
    pub format: Option<String>,
    pub quality: Option<u8>,
    pub omit_background: bool,
}

/// Per-job renderer options
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RendererOptions {
    pub goto: NavigationOptions,
    /// CSS selector of the element to capture (default: `body`)
    pub selector: Option<String>,
    pub screenshot: ScreenshotOptions,
    /// Resize the page before capture
    pub viewport: Option<Viewport>,
}

impl RendererOptions {
    pub fn selector(&self) -> &str {
        self.selector.as_deref().unwrap_or(DEFAULT_SELECTOR)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = RenderError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "png" => Ok(ImageFormat::Png),
            other => Err(RenderError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Resolved screenshot parameters handed to the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenshotSpec {
    pub format: ImageFormat,
    /// `None` for PNG
    pub quality: Option<u8>,
    pub omit_background: bool,
}

impl Default for ScreenshotSpec {
    fn default() -> Self {
        Self {
            format: ImageFormat::Jpeg,
            quality: Some(DEFAULT_JPEG_QUALITY),
            omit_background: false,
        }
    }
}

impl ScreenshotSpec {
    pub fn resolve(options: &ScreenshotOptions) -> ScreenshotSpec {
        let requested = options.format.as_deref().unwrap_or("jpeg");

        match requested.parse::<ImageFormat>() {
            Ok(ImageFormat::Png) => ScreenshotSpec {
                format: ImageFormat::Png,
                quality: None,
                omit_background: options.omit_background,
            },
            Ok(ImageFormat::Jpeg) => ScreenshotSpec {
                format: ImageFormat::Jpeg,
                quality: Some(
                    options
                        .quality
                        .filter(|quality| *quality > 0)
                        .unwrap_or(DEFAULT_JPEG_QUALITY)
                        .min(100),
                ),
                omit_background: options.omit_background,
            },
            Err(err) => {
                warn!("{}, falling back to JPEG", err);
                ScreenshotSpec {
                    omit_background: options.omit_background,
                    ..ScreenshotSpec::default()
                }
            }
        }
    }
}

/// Generate Chrome command-line arguments based on configuration
///
/// Each launch gets its own user data directory so a restarted process never trips
/// over the profile lock of its predecessor. The caller owns that directory.
///
/// # Examples
///
/// ```rust
/// use markup_render::{chrome_args, EngineConfig};
/// use std::path::Path;
///
/// let args = chrome_args(&EngineConfig::default(), Path::new("/tmp/profile"));
/// assert!(args.contains(&"--no-sandbox".to_string()));
/// ```
pub fn chrome_args(config: &EngineConfig, user_data_dir: &Path) -> Vec<String> {

    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--allow-file-access-from-files".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir={}", user_data_dir.display()),
    ];

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config(
    config: &EngineConfig,
    user_data_dir: &Path,
) -> Result<chromiumoxide::browser::BrowserConfig, RenderError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .request_timeout(config.page_load_timeout)
        .args(chrome_args(config, user_data_dir));

    if !config.headless {
        builder = builder.with_head();
    }

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(RenderError::BrowserLaunchFailed)
}
