use anyhow::Context;
use clap::Parser;
use page_capture::{
    read_urls_from_file, setup_logging, BrowserSettings, Cli, CliRunner, Config, Metrics,
    PrometheusExporter,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let config = load_config(&args).await?;
    setup_logging(args.verbose || config.browser.debug)?;

    info!("Starting page-capture v{}", env!("CARGO_PKG_VERSION"));

    let mut urls = args.urls.clone();
    if let Some(input) = &args.input {
        urls.extend(read_urls_from_file(input).await?);
    }
    if urls.is_empty() {
        eprintln!("usage: page-capture [OPTIONS] <URL>...");
        eprintln!("example:\n  page-capture https://example.org/ https://example.com/");
        std::process::exit(1);
    }

    if let Some(addr) = args.metrics_addr {
        PrometheusExporter::new(addr).start()?;
    }
    let metrics = Arc::new(Metrics::new());

    let runner = CliRunner::new(config, &args, metrics).await?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let failures = tokio::select! {
        failures = runner.run(urls, args.progress_interval) => failures,
        _ = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            0
        }
    };

    info!("Shutting down...");
    runner.service.shutdown().await;

    if failures > 0 {
        error!("{} captures failed", failures);
        std::process::exit(1);
    }

    info!("page-capture stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let config: Config = if let Some(config_path) = &args.config {
        let config_content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        let mut config: Config = serde_json::from_str(&config_content)?;
        // Environment toggles win over the file.
        config.browser.apply_env();
        config
    } else {
        Config {
            browser: BrowserSettings::from_env(),
            ..Default::default()
        }
    };

    config.validate()?;
    Ok(config)
}

fn setup_shutdown_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
