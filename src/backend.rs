//! Renderer backend traits.
//!
//! The engine drives pages through these traits only. The production backend lives in
//! [`crate::chromium`]; tests substitute an in-memory one.

use crate::config::{EngineConfig, ScreenshotSpec, Viewport, WaitUntil};
use crate::resource_cache::ResourceCache;
use crate::RenderError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Starts renderer processes.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launches a process with one isolated context whose network layer is served by
    /// `cache`.
    async fn launch(
        &self,
        config: &EngineConfig,
        cache: ResourceCache,
    ) -> Result<Arc<dyn BrowserSession>, RenderError>;
}

/// A running renderer process.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn RenderPage>, RenderError>;

    async fn close(&self) -> Result<(), RenderError>;

    fn is_connected(&self) -> bool {
        true
    }
}

/// One page (tab) of a renderer process, owned by at most one job at a time.
#[async_trait]
pub trait RenderPage: Send + Sync {
    async fn set_viewport(&self, viewport: &Viewport) -> Result<(), RenderError>;

    /// Loads `url`, waiting for the given lifecycle point.
    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<(), RenderError>;

    /// Replaces the document with `html` without a network round trip for the document.
    async fn set_content(&self, html: &str, timeout: Duration) -> Result<(), RenderError>;

    /// Waits until no sub-resource request has started for a short quiet period.
    async fn wait_for_network_idle(&self, timeout: Duration) -> Result<(), RenderError>;

    /// Fails with [`RenderError::TargetElementNotFound`] when `selector` never attaches.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration)
        -> Result<(), RenderError>;

    async fn screenshot_element(
        &self,
        selector: &str,
        spec: &ScreenshotSpec,
    ) -> Result<Vec<u8>, RenderError>;

    /// Clears page-local state so the page can be handed to another job.
    async fn reset(&self) -> Result<(), RenderError>;

    async fn close(&self) -> Result<(), RenderError>;
}
