use crate::{
    import_cookies, import_storage, Artifact, ArtifactKind, CaptureError, CaptureResult,
    CaptureService, Config, ImageFormat, Metrics, OutputSink, ProgressTracker,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "page-capture")]
#[command(about = "Capture web pages as image, HTML, PDF and HAR")]
#[command(version)]
pub struct Cli {
    /// URLs to capture
    pub urls: Vec<String>,

    #[arg(short, long, help = "File containing URLs (one per line)")]
    pub input: Option<PathBuf>,

    #[arg(long, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Capture timeout in seconds [default: 60]")]
    pub timeout: Option<u64>,

    #[arg(long, help = "Image format (png, jpg) [default: png]")]
    pub format: Option<ImageFormat>,

    #[arg(long, help = "Image quality, below 100 forces JPEG [default: 100]")]
    pub quality: Option<u8>,

    #[arg(long, help = "Headless browser remote address, such as 127.0.0.1:9222")]
    pub remote_addr: Option<String>,

    #[arg(long, help = "Chrome executable path")]
    pub chrome_path: Option<String>,

    #[arg(long, help = "Maximum concurrent captures")]
    pub max_concurrent: Option<usize>,

    #[arg(long, help = "YAML file with cookies and local storage to inject")]
    pub cookies: Option<PathBuf>,

    #[arg(long, help = "Save as image")]
    pub img: bool,

    #[arg(long, help = "Save as PDF")]
    pub pdf: bool,

    #[arg(long, help = "Save as raw HTML")]
    pub raw: bool,

    #[arg(long, help = "Export HAR")]
    pub har: bool,

    #[arg(short, long, default_value = ".", help = "Output directory")]
    pub output: PathBuf,

    #[arg(long, help = "Serve Prometheus metrics on this address")]
    pub metrics_addr: Option<std::net::SocketAddr>,

    #[arg(long, help = "Progress reporting interval in seconds")]
    pub progress_interval: Option<u64>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,
}

impl Cli {
    /// The image is saved when asked for or when no other artifact is.
    pub fn wants_image(&self) -> bool {
        self.img || !(self.pdf || self.raw || self.har)
    }

    /// Fold the command line into `config`.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent_captures = max_concurrent;
        }
        if let Some(chrome_path) = &self.chrome_path {
            config.chrome_path = Some(chrome_path.clone());
        }
        if let Some(remote_addr) = &self.remote_addr {
            config.remote_addr = Some(remote_addr.clone());
        }

        let capture = &mut config.capture;
        if let Some(timeout) = self.timeout {
            capture.timeout = Duration::from_secs(timeout);
        }
        if let Some(format) = self.format {
            capture.format = format;
        }
        if let Some(quality) = self.quality {
            capture.quality = quality;
        }
        capture.produce_pdf = self.pdf;
        capture.produce_html = self.raw;
        capture.produce_trace = self.har;
        // Artifacts are written by the runner, only for the flags given.
        capture.sink = OutputSink::InMemory;
    }
}

pub struct CliRunner {
    pub config: Config,
    pub service: CaptureService,
    output: OutputSink,
    save_image: bool,
}

impl CliRunner {
    pub async fn new(
        mut config: Config,
        args: &Cli,
        metrics: Arc<Metrics>,
    ) -> anyhow::Result<Self> {
        args.apply_to(&mut config);

        if let Some(path) = &args.cookies {
            let yaml = fs::read_to_string(path).await?;
            config.capture.cookies = import_cookies(&yaml)?;
            config.capture.storage = import_storage(&yaml)?;
            info!(
                "Loaded {} cookies and {} local storage items from {}",
                config.capture.cookies.len(),
                config.capture.storage.len(),
                path.display()
            );
        }

        let service = CaptureService::new(config.clone(), metrics).await?;

        Ok(Self {
            config,
            service,
            output: OutputSink::OnDisk {
                directory: args.output.clone(),
            },
            save_image: args.wants_image(),
        })
    }

    /// Capture every URL and write the requested artifacts.
    ///
    /// Returns the number of failed captures.
    pub async fn run(&self, urls: Vec<String>, progress_interval: Option<u64>) -> usize {
        info!("Capturing {} URLs", urls.len());

        let tracker = Arc::new(ProgressTracker::new(urls.len()));
        if let Some(seconds) = progress_interval {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(seconds.max(1)));

                while !tracker.is_complete() {
                    interval.tick().await;
                    let progress = tracker.get_progress();

                    println!(
                        "Progress: {}/{} - Success: {}, Errors: {}, Rate: {:.1}/s, ETA: {:?}",
                        progress.completed,
                        progress.total,
                        progress.success,
                        progress.errors,
                        progress.rate,
                        progress.eta
                    );
                }
            });
        }

        let results = self
            .service
            .capture_all(urls, &self.config.capture, Some(tracker))
            .await;

        let mut failures = 0;
        for (url, result) in results {
            match result {
                Ok(capture) => self.save(&capture).await,
                Err(e) => {
                    failures += 1;
                    error!("Capture of {} failed: {}", url, e);
                    println!("{url} => {e}");
                }
            }
        }
        failures
    }

    async fn save(&self, capture: &CaptureResult) {
        let format = self.config.capture.effective_format();
        let mut artifacts = Vec::new();
        if self.save_image {
            artifacts.push((ArtifactKind::Image(format), Some(&capture.image)));
        }
        artifacts.push((ArtifactKind::Html, capture.html.as_ref()));
        artifacts.push((ArtifactKind::Pdf, capture.pdf.as_ref()));
        artifacts.push((ArtifactKind::Har, capture.har.as_ref()));

        for (kind, artifact) in artifacts {
            let Some(bytes) = artifact.and_then(Artifact::bytes) else {
                continue;
            };
            match self.output.store(kind, &capture.url, bytes.to_vec()).await {
                Ok(stored) => {
                    if let Some(path) = stored.path() {
                        println!("{} => {}", capture.url, path.display());
                    }
                }
                Err(e) => println!("{} => {}", capture.url, e),
            }
        }
        debug!("Saved artifacts of {} ({})", capture.url, capture.title);
    }
}

pub async fn read_urls_from_file(path: &PathBuf) -> Result<Vec<String>, CaptureError> {
    let content = fs::read_to_string(path).await?;
    Ok(parse_url_list(&content))
}

fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    Ok(())
}
