use metrics::{counter, gauge, histogram, increment_counter};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

use crate::RenderError;

pub const RENDERS_TOTAL: &str = "markup_render_renders_total";
pub const RENDER_DURATION_SECONDS: &str = "markup_render_render_duration_seconds";
pub const CACHE_HITS_TOTAL: &str = "markup_render_cache_hits_total";
pub const CACHE_MISSES_TOTAL: &str = "markup_render_cache_misses_total";
pub const CACHE_EVICTIONS_TOTAL: &str = "markup_render_cache_evictions_total";
pub const CACHE_BYTES: &str = "markup_render_cache_bytes";
pub const BROWSER_RESTARTS_TOTAL: &str = "markup_render_browser_restarts_total";
pub const QUEUE_LENGTH: &str = "markup_render_queue_length";
pub const QUEUE_PROCESSING: &str = "markup_render_queue_processing";
pub const POOL_IDLE_PAGES: &str = "markup_render_pool_idle_pages";

pub fn record_render(duration: Duration, result: &Result<Vec<u8>, RenderError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(RenderError::TaskTimeout(_)) => "timeout",
        Err(RenderError::PageLost(_)) => "page_lost",
        Err(_) => "failed",
    };

    increment_counter!(RENDERS_TOTAL, "outcome" => outcome);
    histogram!(RENDER_DURATION_SECONDS, duration.as_secs_f64());
}

pub fn record_cache_lookup(hit: bool) {
    if hit {
        increment_counter!(CACHE_HITS_TOTAL);
    } else {
        increment_counter!(CACHE_MISSES_TOTAL);
    }
}

pub fn record_cache_eviction(evicted: usize, remaining_bytes: usize) {
    counter!(CACHE_EVICTIONS_TOTAL, evicted as u64);
    gauge!(CACHE_BYTES, remaining_bytes as f64);
}

pub fn record_browser_restart() {
    increment_counter!(BROWSER_RESTARTS_TOTAL);
}

pub fn set_queue_depth(queue_length: usize, processing: usize) {
    gauge!(QUEUE_LENGTH, queue_length as f64);
    gauge!(QUEUE_PROCESSING, processing as f64);
}

pub fn set_idle_pages(idle: usize) {
    gauge!(POOL_IDLE_PAGES, idle as f64);
}

/// Serves every metric above on `http://<addr>/metrics`.
pub struct PrometheusExporter {
    addr: SocketAddr,
}

impl PrometheusExporter {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn with_port(port: u16) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Installs the global recorder. Must run inside the Tokio runtime.
    pub fn install(&self) -> Result<(), RenderError> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| RenderError::Configuration(format!("metrics exporter: {e}")))?;

        info!("Prometheus metrics available on http://{}/metrics", self.addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_render(Duration::from_millis(10), &Ok(vec![1, 2, 3]));
        record_render(
            Duration::from_millis(10),
            &Err(RenderError::TaskTimeout(Duration::from_secs(1))),
        );
        record_cache_lookup(true);
        record_cache_lookup(false);
        record_cache_eviction(3, 1024);
        record_browser_restart();
        set_queue_depth(2, 5);
        set_idle_pages(1);
    }

    #[test]
    fn test_exporter_address() {
        let exporter = PrometheusExporter::with_port(9100);
        assert_eq!(exporter.addr.port(), 9100);
    }
}
