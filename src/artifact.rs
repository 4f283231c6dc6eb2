//! Compiler that persists pre-produced markup as on-disk artifacts.

use crate::config::ArtifactConfig;
use crate::markup::{ensure_doctype, scan_resources};
use crate::pipeline::{CompileContext, CompileOutput, ComponentOptions, MarkupCompiler};
use crate::task_registry::TaskRegistry;
use crate::RenderError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Writes component markup under the artifact root, or hands it over in memory when
/// every resource it needs is already cached and a virtual base URL is configured.
#[derive(Debug, Clone)]
pub struct ArtifactCompiler {
    config: ArtifactConfig,
    virtual_base: Option<String>,
}

impl ArtifactCompiler {
    pub fn new(config: ArtifactConfig) -> Self {
        Self {
            config,
            virtual_base: None,
        }
    }

    /// Enables direct mode for markup whose resources are all cached.
    pub fn with_virtual_base(mut self, base: impl Into<String>) -> Self {
        self.virtual_base = Some(base.into());
        self
    }

    pub fn config(&self) -> &ArtifactConfig {
        &self.config
    }

    /// Resolves the output directory for a component. Only relative paths that stay
    /// under the artifact root are accepted.
    pub fn target_dir(&self, path: Option<&str>) -> Result<PathBuf, RenderError> {
        let Some(sub) = path.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(self.config.root.clone());
        };

        let sub = Path::new(sub);
        let escapes = sub
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(RenderError::InvalidPath(sub.display().to_string()));
        }

        Ok(self.config.root.join(sub))
    }

    async fn write_artifact(
        &self,
        registry: &TaskRegistry,
        dir: &Path,
        target: &Path,
        html: &str,
    ) -> Result<(), RenderError> {
        let reusable = registry
            .find_and_lock_reusable_file_with_age(dir, self.config.reuse_min_age)
            .await?;

        if let Some(reusable) = reusable {
            let outcome = overwrite_and_rename(&reusable, target, html).await;
            registry.release_reusable_lock(&reusable);

            match outcome {
                Ok(()) => {
                    debug!(
                        "Reused artifact {} as {}",
                        reusable.display(),
                        target.display()
                    );
                    return Ok(());
                }
                Err(e) => warn!(
                    "Could not reuse artifact {}, writing fresh: {}",
                    reusable.display(),
                    e
                ),
            }
        }

        tokio::fs::write(target, html).await?;
        Ok(())
    }
}

async fn overwrite_and_rename(from: &Path, to: &Path, html: &str) -> std::io::Result<()> {
    tokio::fs::write(from, html).await?;
    tokio::fs::rename(from, to).await
}

#[async_trait]
impl MarkupCompiler for ArtifactCompiler {
    async fn compile(
        &self,
        component: &ComponentOptions,
        context: &CompileContext,
    ) -> Result<CompileOutput, RenderError> {
        let html = ensure_doctype(&component.markup);
        let resources = scan_resources(&html);

        if !component.create {
            return Ok(CompileOutput::Markup(html));
        }

        if let Some(base) = &self.virtual_base {
            if !resources.is_empty() && context.cache.check_resources_in_cache(&resources) {
                debug!(
                    "All {} resources cached, rendering {} in direct mode",
                    resources.len(),
                    context.task_id
                );
                return Ok(CompileOutput::Direct {
                    html_content: html,
                    virtual_url: base.clone(),
                    resources,
                });
            }
        }

        let dir = self.target_dir(component.path.as_deref())?;
        tokio::fs::create_dir_all(&dir).await?;
        context
            .registry
            .start_cleanup_timer(&dir, self.config.cleanup_interval, self.config.keep_count);

        let target = dir.join(format!("{}.html", context.task_id));
        self.write_artifact(&context.registry, &dir, &target, &html)
            .await?;

        Ok(CompileOutput::File {
            html_file_path: target.to_string_lossy().into_owned(),
            resources,
        })
    }
}
