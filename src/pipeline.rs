//! Render entry point: compile, admit, await the image.

use crate::config::{EngineOverrides, RendererOptions};
use crate::engine::RenderEngine;
use crate::job::{JobSource, RenderJob};
use crate::resource_cache::ResourceCache;
use crate::task_registry::TaskRegistry;
use crate::RenderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

fn default_create() -> bool {
    true
}

/// Caller-facing description of what to render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentOptions {
    /// Seeds the task id
    pub name: String,
    /// Sub-directory of the artifact root for file-mode output
    #[serde(default)]
    pub path: Option<String>,
    /// When false nothing is written and the markup is rendered inline
    #[serde(default = "default_create")]
    pub create: bool,
    /// Pre-produced markup
    #[serde(default)]
    pub markup: String,
}

impl ComponentOptions {
    pub fn new(name: impl Into<String>, markup: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            create: true,
            markup: markup.into(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn inline(mut self) -> Self {
        self.create = false;
        self
    }
}

/// What a compiler hands back for one task.
#[derive(Debug, Clone)]
pub struct CompileContext {
    pub task_id: String,
    pub registry: TaskRegistry,
    pub cache: ResourceCache,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompileOutput {
    /// Ready markup, nothing written (creation disabled)
    Markup(String),
    Direct {
        html_content: String,
        virtual_url: String,
        resources: Vec<String>,
    },
    File {
        html_file_path: String,
        resources: Vec<String>,
    },
}

impl CompileOutput {
    pub fn resources(&self) -> &[String] {
        match self {
            CompileOutput::Markup(_) => &[],
            CompileOutput::Direct { resources, .. } | CompileOutput::File { resources, .. } => {
                resources
            }
        }
    }
}

/// Turns a component description into renderable markup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarkupCompiler: Send + Sync {
    async fn compile(
        &self,
        component: &ComponentOptions,
        context: &CompileContext,
    ) -> Result<CompileOutput, RenderError>;
}

pub struct Renderer<C> {
    engine: RenderEngine,
    compiler: C,
}

impl<C: MarkupCompiler> Renderer<C> {
    pub fn new(engine: RenderEngine, compiler: C) -> Self {
        Self { engine, compiler }
    }

    pub fn engine(&self) -> &RenderEngine {
        &self.engine
    }

    pub fn compiler(&self) -> &C {
        &self.compiler
    }

    /// Renders one component. The task is retired on every path.
    pub async fn render(
        &self,
        component: &ComponentOptions,
        options: RendererOptions,
        overrides: EngineOverrides,
    ) -> Result<Vec<u8>, RenderError> {
        let registry = self.engine.registry().clone();
        let task_id = registry.create_task(&component.name);

        let result = self
            .compile_and_execute(&task_id, component, options, overrides)
            .await;

        registry.cleanup_task(&task_id);
        result
    }

    /// Like [`Renderer::render`], retrying page-lost failures with backoff.
    ///
    /// Each attempt runs under a fresh task id.
    pub async fn render_with_retry(
        &self,
        component: &ComponentOptions,
        options: RendererOptions,
        overrides: EngineOverrides,
    ) -> Result<Vec<u8>, RenderError> {
        let retry = self.engine.config().retry;
        let attempts = retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match self
                .render(component, options.clone(), overrides.clone())
                .await
            {
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "Render of {} lost its page, retrying in {:?} (attempt {}/{})",
                        component.name,
                        delay,
                        attempt + 2,
                        attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn compile_and_execute(
        &self,
        task_id: &str,
        component: &ComponentOptions,
        options: RendererOptions,
        overrides: EngineOverrides,
    ) -> Result<Vec<u8>, RenderError> {
        let context = CompileContext {
            task_id: task_id.to_string(),
            registry: self.engine.registry().clone(),
            cache: self.engine.cache().clone(),
        };

        let output = self.compiler.compile(component, &context).await?;

        let source = match output {
            CompileOutput::Markup(html_content) => JobSource::Direct {
                html_content,
                virtual_url: self.engine.config().default_virtual_url,
            },
            CompileOutput::Direct {
                html_content,
                virtual_url,
                ..
            } => JobSource::Direct {
                html_content,
                virtual_url,
            },
            CompileOutput::File { html_file_path, .. } => JobSource::File { html_file_path },
        };
        debug!("Task {} compiled for {} mode", task_id, source.mode());

        self.engine
            .execute_task(RenderJob {
                task_id: task_id.to_string(),
                source,
                options,
                overrides,
            })
            .await
    }
}
