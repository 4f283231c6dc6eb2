use anyhow::Result;
use clap::Parser;
use markup_render::cli::{apply_cli_overrides, load_config, setup_logging, Cli, CliRunner};
use markup_render::metrics::PrometheusExporter;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose);

    info!("Starting markup-render v{}", env!("CARGO_PKG_VERSION"));

    let mut config = load_config(args.config.as_deref()).await?;
    apply_cli_overrides(&mut config, &args);
    config.validate()?;

    info!("Max concurrent renders: {}", config.max_concurrent);
    info!("Task timeout: {:?}", config.task_timeout);

    if let Some(port) = args.metrics_port {
        PrometheusExporter::with_port(port).install()?;
    }

    let runner = CliRunner::new(config);

    let result = tokio::select! {
        result = runner.run(args.command) => result,
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    runner.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
