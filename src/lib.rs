//! # Markup Render
//!
//! Renders markup (HTML documents or pre-produced component markup) to JPEG/PNG images
//! through one long-lived headless Chrome process. Jobs are admitted through a bounded
//! queue, pages are pooled and reused, and static sub-resources are cached across renders
//! by intercepting the browser's network layer.
//!
//! ## Pipeline
//!
//! ```text
//! ComponentOptions --compile--> Direct | File --admit--> queue --page--> image bytes
//! ```
//!
//! - **Direct mode**: markup is injected into a page and resolved against a virtual base
//!   URL; relative `./resources/...` references are rewritten to absolute ones.
//! - **File mode**: markup is written to an on-disk artifact and loaded from a `file://`
//!   URL. Completed artifacts are reused and pruned by a per-directory cleanup timer.
//!
//! ## Features
//!
//! - **Admission Queue**: FIFO admission with a configurable concurrency ceiling
//! - **Page Pool**: Idle pages are reused and closed after an idle timeout
//! - **Resource Cache**: Static resources are served from memory on subsequent renders
//! - **Periodic Restart**: The browser is relaunched after a configurable render count
//!   without dropping queued jobs
//! - **Typed Errors**: Every failure reaches the caller as a [`RenderError`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use markup_render::{EngineConfig, RenderEngine, RenderJob};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = RenderEngine::new(EngineConfig::default());
//!     engine.init().await?;
//!
//!     let job = RenderJob::direct(
//!         "hello",
//!         "<html><head></head><body><h1>Hello</h1></body></html>",
//!         "http://127.0.0.1:8080",
//!     );
//!     let image = engine.execute_task(job).await?;
//!     println!("Rendered {} bytes", image.len());
//!
//!     engine.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! markup-render render card.html --output card.jpg --selector "#card"
//! markup-render batch components/ --output images/ --concurrency 10
//! ```

/// Configuration and per-job options
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Renderer backend traits
pub mod backend;

/// Chrome backend over the DevTools protocol
pub mod chromium;

/// Render engine: browser lifecycle, admission and capture
pub mod engine;

/// Bounded FIFO admission queue
pub mod queue;

/// Pool of reusable pages
pub mod page_pool;

/// In-memory cache of static sub-resources
pub mod resource_cache;

/// Task ids and on-disk artifact bookkeeping
pub mod task_registry;

/// Render jobs and artifact path handling
pub mod job;

/// Markup rewriting and resource scanning
pub mod markup;

/// Compile-then-render entry point
pub mod pipeline;

/// Compiler persisting markup as on-disk artifacts
pub mod artifact;

/// Command-line interface implementation
pub mod cli;

/// Prometheus metrics
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use artifact::ArtifactCompiler;
pub use config::*;
pub use engine::{EngineLifecycle, RenderEngine};
pub use error::*;
pub use job::{JobSource, RenderJob};
pub use page_pool::PoolStats;
pub use pipeline::{CompileContext, CompileOutput, ComponentOptions, MarkupCompiler, Renderer};
pub use queue::QueueStats;
pub use resource_cache::{CacheStats, ResourceCache};
pub use task_registry::TaskRegistry;
pub use utils::{format_bytes, format_duration, sanitize_task_name};
