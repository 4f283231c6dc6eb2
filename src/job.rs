//! Render jobs as admitted to the queue.

use crate::config::{EngineConfig, EngineOverrides, RendererOptions};
use crate::RenderError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// What a job renders. Each mode carries exactly the fields it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JobSource {
    /// Markup injected straight into a page, resolved against `virtual_url`.
    Direct {
        html_content: String,
        virtual_url: String,
    },
    /// Markup already written to disk.
    File { html_file_path: String },
}

impl JobSource {
    pub fn mode(&self) -> &'static str {
        match self {
            JobSource::Direct { .. } => "direct",
            JobSource::File { .. } => "file",
        }
    }

    /// What is being loaded, for error messages.
    pub fn describe(&self) -> &str {
        match self {
            JobSource::Direct { virtual_url, .. } => virtual_url,
            JobSource::File { html_file_path } => html_file_path,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderJob {
    pub task_id: String,
    pub source: JobSource,
    pub options: RendererOptions,
    pub overrides: EngineOverrides,
}

impl RenderJob {
    pub fn direct(
        task_id: impl Into<String>,
        html_content: impl Into<String>,
        virtual_url: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            source: JobSource::Direct {
                html_content: html_content.into(),
                virtual_url: virtual_url.into(),
            },
            options: RendererOptions::default(),
            overrides: EngineOverrides::default(),
        }
    }

    pub fn file(task_id: impl Into<String>, html_file_path: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            source: JobSource::File {
                html_file_path: html_file_path.into(),
            },
            options: RendererOptions::default(),
            overrides: EngineOverrides::default(),
        }
    }

    pub fn with_options(mut self, options: RendererOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_overrides(mut self, overrides: EngineOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// A job together with the configuration resolved for it at admission.
#[derive(Debug, Clone)]
pub(crate) struct AdmittedJob {
    pub job: RenderJob,
    pub settings: EngineConfig,
}

/// Turns an artifact path (plain or `file://`) into an absolute path and its file URL.
///
/// Backslashes are treated as separators and relative paths are resolved against the
/// current directory.
pub fn normalize_artifact_path(raw: &str) -> Result<(PathBuf, Url), RenderError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(RenderError::InvalidPath("empty artifact path".to_string()));
    }

    let path = if trimmed.starts_with("file:") {
        Url::parse(trimmed)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| RenderError::InvalidPath(raw.to_string()))?
    } else {
        PathBuf::from(trimmed.replace('\\', "/"))
    };

    let absolute = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()
            .map_err(|e| RenderError::InvalidPath(format!("{raw}: {e}")))?
            .join(path)
    };

    let url = Url::from_file_path(&absolute)
        .map_err(|_| RenderError::InvalidPath(raw.to_string()))?;

    Ok((absolute, url))
}

/// Fails with [`RenderError::FileNotFound`] unless `path` exists.
pub async fn ensure_artifact_exists(path: &Path) -> Result<(), RenderError> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(RenderError::FileNotFound(path.display().to_string())),
        Err(e) => Err(RenderError::InvalidPath(format!("{}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_absolute_and_file_url() {
        let (path, url) = normalize_artifact_path("/tmp/render/a.html").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/render/a.html"));
        assert_eq!(url.as_str(), "file:///tmp/render/a.html");

        let (path, _) = normalize_artifact_path("file:///tmp/render/b%20c.html").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/render/b c.html"));
    }

    #[test]
    fn test_normalize_relative_and_backslashes() {
        let (path, url) = normalize_artifact_path(r".data\component\x.html").unwrap();
        assert!(path.is_absolute());
        assert!(path.ends_with(".data/component/x.html"));
        assert_eq!(url.scheme(), "file");
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(matches!(
            normalize_artifact_path("  "),
            Err(RenderError::InvalidPath(_))
        ));
        assert!(matches!(
            normalize_artifact_path("file://remote-host:99999/x"),
            Err(RenderError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_artifact_exists() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.html");
        std::fs::write(&present, "<html></html>").unwrap();

        tokio_test::assert_ok!(ensure_artifact_exists(&present).await);
        assert!(matches!(
            ensure_artifact_exists(&dir.path().join("missing.html")).await,
            Err(RenderError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_source_tagging() {
        let job = RenderJob::file("t1", "/tmp/a.html");
        assert_eq!(job.source.mode(), "file");
        assert_eq!(job.source.describe(), "/tmp/a.html");

        let json = serde_json::to_value(&RenderJob::direct("t2", "<p/>", "http://v").source).unwrap();
        assert_eq!(json["type"], "direct");
        assert_eq!(json["virtual_url"], "http://v");
    }
}
