use crate::{
    ArtifactCompiler, ComponentOptions, EngineConfig, EngineOverrides, ImageFormat, RenderEngine,
    Renderer, RendererOptions, ScreenshotOptions, ScreenshotSpec, Viewport,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "markup-render")]
#[command(about = "Render HTML markup to images with a pooled headless Chrome")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Maximum concurrent renders")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Per-render timeout in seconds")]
    pub timeout: Option<u64>,

    #[arg(long, global = true, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Expose Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Render one markup file to an image
    Render {
        #[arg(help = "Markup file to render")]
        input: PathBuf,

        #[arg(short, long, help = "Output image path")]
        output: PathBuf,

        #[command(flatten)]
        render: RenderArgs,
    },

    /// Render every *.html file of a directory
    Batch {
        #[arg(help = "Directory containing markup files")]
        input: PathBuf,

        #[arg(short, long, help = "Output directory for images")]
        output: PathBuf,

        #[arg(short, long, default_value = "10", help = "Renders submitted at once")]
        concurrency: usize,

        #[command(flatten)]
        render: RenderArgs,
    },

    /// Validate configuration
    Validate {
        #[arg(help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RenderArgs {
    #[arg(long, help = "CSS selector of the element to capture (default: body)")]
    pub selector: Option<String>,

    #[arg(long, help = "Output format (jpeg, png)")]
    pub format: Option<String>,

    #[arg(long, help = "JPEG quality (1-100)")]
    pub quality: Option<u8>,

    #[arg(long, help = "Viewport width")]
    pub width: Option<u32>,

    #[arg(long, help = "Viewport height")]
    pub height: Option<u32>,

    #[arg(long, help = "Render in memory against this base URL when resources are cached")]
    pub base_url: Option<String>,

    #[arg(long, help = "Artifact sub-directory under the artifact root")]
    pub path: Option<String>,
}

impl RenderArgs {
    pub fn renderer_options(&self, defaults: &Viewport) -> RendererOptions {
        let viewport = if self.width.is_some() || self.height.is_some() {
            Some(Viewport {
                width: self.width.unwrap_or(defaults.width),
                height: self.height.unwrap_or(defaults.height),
                ..defaults.clone()
            })
        } else {
            None
        };

        RendererOptions {
            selector: self.selector.clone(),
            screenshot: ScreenshotOptions {
                format: self.format.clone(),
                quality: self.quality,
                omit_background: false,
            },
            viewport,
            ..Default::default()
        }
    }

    pub fn image_format(&self) -> ImageFormat {
        ScreenshotSpec::resolve(&ScreenshotOptions {
            format: self.format.clone(),
            ..Default::default()
        })
        .format
    }
}

/// Applies the global flags on top of a loaded configuration.
pub fn apply_cli_overrides(config: &mut EngineConfig, args: &Cli) {
    if let Some(max_concurrent) = args.max_concurrent {
        config.max_concurrent = max_concurrent;
    }
    if let Some(timeout) = args.timeout {
        config.task_timeout = Duration::from_secs(timeout);
    }
    if let Some(chrome_path) = &args.chrome_path {
        config.chrome_path = Some(chrome_path.clone());
    }
}

pub async fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(EngineConfig::default()),
    }
}

pub struct CliRunner {
    pub config: EngineConfig,
    pub engine: RenderEngine,
}

impl CliRunner {
    /// Builds the engine without launching the browser.
    pub fn new(config: EngineConfig) -> Self {
        let engine = RenderEngine::new(config.clone());
        Self { config, engine }
    }

    pub async fn run(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Render {
                input,
                output,
                render,
            } => {
                self.engine.init().await?;
                self.run_render(&input, &output, &render).await
            }
            Commands::Batch {
                input,
                output,
                concurrency,
                render,
            } => {
                self.engine.init().await?;
                self.run_batch(&input, &output, concurrency, &render).await
            }
            Commands::Validate { config } => validate_config(&config).await,
        }
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.engine.close().await {
            warn!("Engine shutdown failed: {}", e);
        }
    }

    fn renderer(&self, args: &RenderArgs) -> Renderer<ArtifactCompiler> {
        let mut compiler = ArtifactCompiler::new(self.config.artifacts.clone());
        if let Some(base) = &args.base_url {
            compiler = compiler.with_virtual_base(base.clone());
        }
        Renderer::new(self.engine.clone(), compiler)
    }

    pub async fn run_render(&self, input: &Path, output: &Path, args: &RenderArgs) -> Result<()> {
        info!("Rendering {}", input.display());
        let started = Instant::now();

        let renderer = self.renderer(args);
        let image = render_file(&renderer, input, args, &self.config.viewport).await?;

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(output, &image).await?;

        println!("Rendered successfully:");
        println!("  Input: {}", input.display());
        println!("  Output: {}", output.display());
        println!("  Format: {:?}", args.image_format());
        println!("  Size: {}", crate::format_bytes(image.len()));
        println!("  Duration: {}", crate::format_duration(started.elapsed()));

        Ok(())
    }

    pub async fn run_batch(
        &self,
        input: &Path,
        output: &Path,
        concurrency: usize,
        args: &RenderArgs,
    ) -> Result<()> {
        let files = list_markup_files(input).await?;
        if files.is_empty() {
            bail!("no *.html files in {}", input.display());
        }
        info!("Loaded {} markup files from {}", files.len(), input.display());

        fs::create_dir_all(output).await?;

        let renderer = self.renderer(args);
        let extension = args.image_format().extension();
        let started = Instant::now();

        let results: Vec<(PathBuf, Result<Vec<u8>>)> = stream::iter(files)
            .map(|file| {
                let renderer = &renderer;
                let viewport = &self.config.viewport;
                async move {
                    let result = render_file(renderer, &file, args, viewport).await;
                    (file, result)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut success_count = 0;
        let mut error_count = 0;

        for (file, result) in results {
            match result {
                Ok(image) => {
                    let stem = file
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "image".to_string());
                    let target = output.join(format!("{stem}.{extension}"));
                    fs::write(&target, &image).await?;
                    success_count += 1;
                    info!("Saved image: {}", target.display());
                }
                Err(e) => {
                    error_count += 1;
                    warn!("Failed to render {}: {:#}", file.display(), e);
                }
            }
        }

        let queue = self.engine.get_processing();
        let cache = self.engine.cache().stats();
        let pool = self.engine.pool_stats();

        println!("Batch completed in {}", crate::format_duration(started.elapsed()));
        println!("  Success: {success_count}, Errors: {error_count}");
        println!(
            "  Queue: {} processing, {} waiting (max {})",
            queue.processing_count, queue.queue_length, queue.max_concurrent
        );
        println!(
            "  Cache: {} entries, {}, {} hits / {} misses",
            cache.entries,
            crate::format_bytes(cache.total_bytes),
            cache.hits,
            cache.misses
        );
        println!(
            "  Pages: {} idle, {} created, {} closed",
            pool.idle_pages, pool.pages_created, pool.pages_closed
        );

        if error_count > 0 {
            bail!("{error_count} of {} renders failed", success_count + error_count);
        }
        Ok(())
    }
}

async fn render_file(
    renderer: &Renderer<ArtifactCompiler>,
    input: &Path,
    args: &RenderArgs,
    viewport: &Viewport,
) -> Result<Vec<u8>> {
    let markup = fs::read_to_string(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let name = input
        .file_stem()
        .map(|s| crate::sanitize_task_name(&s.to_string_lossy()))
        .unwrap_or_else(|| "task".to_string());

    let mut component = ComponentOptions::new(name, markup);
    component.path = args.path.clone();

    let image = renderer
        .render_with_retry(
            &component,
            args.renderer_options(viewport),
            EngineOverrides::default(),
        )
        .await?;
    Ok(image)
}

async fn list_markup_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("html") {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

pub async fn validate_config(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = load_config(Some(config_path)).await?;
    config.validate()?;

    println!("Configuration is valid:");
    println!("  Max concurrent: {}", config.max_concurrent);
    println!("  Task timeout: {:?}", config.task_timeout);
    println!("  Restart after: {} renders", config.restart_after_renders);
    println!(
        "  Page pool: {}-{} pages, idle timeout {:?}",
        config.pool.min_pages, config.pool.max_pages, config.pool.idle_timeout
    );
    println!(
        "  Cache: {} items / {}",
        config.cache.max_items,
        crate::format_bytes(config.cache.max_bytes)
    );
    println!(
        "  Viewport: {}x{}",
        config.viewport.width, config.viewport.height
    );
    println!("  Artifact root: {}", config.artifacts.root.display());

    Ok(())
}

pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_render_command() {
        let cli = Cli::parse_from([
            "markup-render",
            "render",
            "card.html",
            "-o",
            "card.png",
            "--format",
            "png",
            "--width",
            "1200",
            "--max-concurrent",
            "4",
        ]);

        assert_eq!(cli.max_concurrent, Some(4));
        let Commands::Render { input, output, render } = cli.command else {
            panic!("expected render command");
        };
        assert_eq!(input, PathBuf::from("card.html"));
        assert_eq!(output, PathBuf::from("card.png"));
        assert_eq!(render.image_format(), ImageFormat::Png);

        let options = render.renderer_options(&Viewport::default());
        let viewport = options.viewport.as_ref().unwrap();
        assert_eq!((viewport.width, viewport.height), (1200, 600));
        assert_eq!(options.selector(), "body");
    }

    #[test]
    fn test_apply_cli_overrides() {
        let cli = Cli::parse_from([
            "markup-render",
            "--timeout",
            "30",
            "--chrome-path",
            "/usr/bin/chromium",
            "validate",
            "config.json",
        ]);
        let mut config = EngineConfig::default();
        apply_cli_overrides(&mut config, &cli);

        assert_eq!(config.task_timeout, Duration::from_secs(30));
        assert_eq!(config.chrome_path.as_deref(), Some("/usr/bin/chromium"));
    }

    #[test]
    fn test_no_viewport_without_dimensions() {
        let args = RenderArgs::default();
        assert!(args.renderer_options(&Viewport::default()).viewport.is_none());
        assert_eq!(args.image_format(), ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn test_load_and_validate_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_concurrent": 3, "restart_after_renders": 50}"#).unwrap();

        let config = load_config(Some(&path)).await.unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.restart_after_renders, 50);
        assert!(validate_config(&path).await.is_ok());

        std::fs::write(&path, r#"{"max_concurrent": 0}"#).unwrap();
        assert!(validate_config(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_list_markup_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.html"), "").unwrap();
        std::fs::write(dir.path().join("a.html"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let files = list_markup_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.html", "b.html"]);
    }
}
