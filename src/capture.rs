//! Capture pipeline
//!
//! [`Capturer::capture`] runs the ordered actions of one page visit against a
//! page handed out by a [`PageSource`]:
//!
//! 1. allocate a page
//! 2. arm the network correlator, dialog handling and page emulation
//! 3. inject cookies and host-filtered local storage
//! 4. probe the target and route documents through the viewer
//! 5. navigate and wait for the configured lifecycle milestone
//! 6. run the per-site interaction script
//! 7. scroll to the bottom until the page settles
//! 8. capture title, image and the optional HTML and PDF
//! 9. drain the correlator
//! 10. compose the trace
//! 11. release the page
//!
//! Everything shares one deadline. Page allocation, navigation, the image and
//! the deadline itself are fatal; every other step degrades to a missing
//! artifact.

use crate::{
    har, scripts, utils, Artifact, ArtifactKind, BatchProcessor, BrowserSession, BrowserSettings,
    CaptureError, CaptureOptions, Clip, Config, Correlator, CorrelatorSettings, Metrics,
    PageSession, PageSource, ProgressTracker,
};
use chrono::Utc;
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};
use url::Url;

/// Artifacts of one capture
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    /// Requested URL, with any viewer rewrite undone
    pub url: String,
    pub title: String,
    pub image: Artifact,
    pub html: Option<Artifact>,
    pub pdf: Option<Artifact>,
    pub har: Option<Artifact>,
    /// Encoded bytes received over the network during the page load
    pub transferred_bytes: u64,
}

/// Runs the capture pipeline
pub struct Capturer {
    http: reqwest::Client,
    stealth: bool,
    metrics: Arc<Metrics>,
}

impl Capturer {
    pub fn new(settings: &BrowserSettings, metrics: Arc<Metrics>) -> Result<Self, CaptureError> {
        let mut builder = reqwest::Client::builder();
        if let Some(user_agent) = &settings.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            http: builder.build()?,
            stealth: settings.stealth,
            metrics,
        })
    }

    /// Capture `url` with a fresh page from `source`.
    pub async fn capture(
        &self,
        source: &dyn PageSource,
        url: &str,
        options: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        let start = std::time::Instant::now();
        self.metrics.capture_started();

        let result = self.run(source, url, options).await;

        self.metrics.record_capture(start.elapsed(), result.is_ok());
        match &result {
            Ok(capture) => info!(
                "Captured {} in {} ({} transferred)",
                capture.url,
                utils::format_duration(start.elapsed()),
                utils::format_bytes(capture.transferred_bytes)
            ),
            Err(e) => warn!("Capture of {} failed: {}", url, e),
        }
        result
    }

    async fn run(
        &self,
        source: &dyn PageSource,
        url: &str,
        options: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        let input = utils::validate_url(url)?;
        let deadline = Instant::now() + options.timeout;

        let session = within(deadline, options.timeout, source.open_page()).await?;
        let outcome = self.run_on_page(session.clone(), &input, options, deadline).await;

        if let Err(e) = session.close().await {
            debug!("Failed to close page for {}: {}", input, e);
        }
        outcome
    }

    async fn run_on_page(
        &self,
        session: Arc<dyn PageSession>,
        input: &Url,
        options: &CaptureOptions,
        deadline: Instant,
    ) -> Result<CaptureResult, CaptureError> {
        let started = Utc::now();

        let mut correlator = Correlator::spawn(
            session.clone(),
            CorrelatorSettings {
                collect_responses: options.produce_trace,
                fetch_timeout: options.response_fetch_timeout,
                deadline,
            },
        );

        self.arm(&*session, &mut correlator, options).await;
        let injection_failures = self.inject_state(&*session, input, options).await;
        if !injection_failures.is_empty() {
            debug!("{} injection items failed for {}", injection_failures.len(), input);
        }

        let target =
            utils::viewer_target(&self.http, input, options.probe_timeout, deadline).await;

        let navigation =
            navigate(&*session, &target, &options.wait_until, deadline, options.timeout).await;
        if let Err(e) = navigation {
            correlator.abort();
            return Err(e);
        }
        debug!("{} reached {}", target, options.wait_until);

        self.run_site_script(&*session, input, deadline).await;
        settle(&*session, options, deadline).await;

        let result_url = utils::revert_viewer_url(&target);
        let artifacts = match self
            .capture_artifacts(&*session, &result_url, options, deadline)
            .await
        {
            Ok(artifacts) => artifacts,
            Err(e) => {
                correlator.abort();
                return Err(e);
            }
        };

        let log = correlator.drain().await;
        self.metrics.record_transferred(log.transferred_bytes);

        let har = if options.produce_trace {
            self.metrics.record_trace(log.entry_count());
            match har::compose(&log, &result_url, started) {
                Ok(bytes) => {
                    self.store_degraded(options, ArtifactKind::Har, &result_url, bytes)
                        .await
                }
                Err(e) => {
                    self.degraded("har", &e);
                    None
                }
            }
        } else {
            None
        };

        Ok(CaptureResult {
            url: result_url,
            title: artifacts.title,
            image: artifacts.image,
            html: artifacts.html,
            pdf: artifacts.pdf,
            har,
            transferred_bytes: log.transferred_bytes,
        })
    }

    /// Install listeners and page settings before anything is loaded.
    async fn arm(
        &self,
        session: &dyn PageSession,
        correlator: &mut Correlator,
        options: &CaptureOptions,
    ) {
        match session.network_events().await {
            Ok(events) => correlator.listen(events),
            Err(e) => self.degraded("network", &e),
        }
        if let Err(e) = session.auto_dismiss_dialogs().await {
            self.degraded("dialogs", &e);
        }
        if let Err(e) = session.enable_domains().await {
            self.degraded("domains", &e);
        }
        if let Err(e) = session.emulate_viewport(&options.viewport).await {
            self.degraded("emulation", &e);
        }
        if let Err(e) = session.deny_downloads().await {
            self.degraded("downloads", &e);
        }
        if self.stealth {
            if let Err(e) = session.add_script_on_new_document(scripts::STEALTH_SCRIPT).await {
                self.degraded("stealth", &e);
            }
        }
    }

    /// Best-effort cookie and local storage injection. Returns the failures.
    async fn inject_state(
        &self,
        session: &dyn PageSession,
        input: &Url,
        options: &CaptureOptions,
    ) -> Vec<CaptureError> {
        let mut failures = Vec::new();

        for cookie in &options.cookies {
            if let Err(e) = session.set_cookie(cookie).await {
                debug!("Cookie {} for {} not set: {}", cookie.name, cookie.domain, e);
                failures.push(e);
            }
        }

        let host = &input[url::Position::BeforeHost..url::Position::AfterPort];
        for item in options.storage.iter().filter(|item| item.host == host) {
            let script = scripts::local_storage_script(&item.host, &item.key, &item.value);
            if let Err(e) = session.add_script_on_new_document(&script).await {
                debug!("Local storage item {} not set: {}", item.key, e);
                failures.push(e);
            }
        }

        for failure in &failures {
            self.degraded("injection", failure);
        }
        failures
    }

    async fn run_site_script(&self, session: &dyn PageSession, input: &Url, deadline: Instant) {
        let Some(expression) = input.host_str().and_then(scripts::site_expression) else {
            return;
        };

        match timeout_at(deadline, session.evaluate(&expression)).await {
            Ok(Ok(_)) => debug!("Ran site script for {}", input),
            Ok(Err(e)) => self.degraded("site_script", &e),
            Err(_) => debug!("Site script for {} ran into the deadline", input),
        }
    }

    async fn capture_artifacts(
        &self,
        session: &dyn PageSession,
        url: &str,
        options: &CaptureOptions,
        deadline: Instant,
    ) -> Result<PageArtifacts, CaptureError> {
        let title = match within(deadline, options.timeout, session.title()).await {
            Ok(title) => title.unwrap_or_default(),
            Err(e @ CaptureError::Timeout(_)) => return Err(e),
            Err(e) => {
                self.degraded("title", &e);
                String::new()
            }
        };

        let clip = match within(deadline, options.timeout, session.content_size()).await {
            Ok((width, height)) => clip_for(width, height, options),
            Err(e @ CaptureError::Timeout(_)) => return Err(e),
            Err(e) => {
                self.degraded("layout", &e);
                clip_for(0.0, 0.0, options)
            }
        };

        let format = options.effective_format();
        let image_bytes = within(
            deadline,
            options.timeout,
            session.capture_image(clip, options.quality, format),
        )
        .await?;
        let image = options
            .sink
            .store(ArtifactKind::Image(format), url, image_bytes)
            .await?;

        let html = if options.produce_html {
            match within(deadline, options.timeout, session.outer_html()).await {
                Ok(html) => {
                    self.store_degraded(options, ArtifactKind::Html, url, html.into_bytes())
                        .await
                }
                Err(e) => {
                    self.degraded("html", &e);
                    None
                }
            }
        } else {
            None
        };

        let pdf = if options.produce_pdf {
            match within(deadline, options.timeout, session.render_pdf()).await {
                Ok(pdf) => self.store_degraded(options, ArtifactKind::Pdf, url, pdf).await,
                Err(e) => {
                    self.degraded("pdf", &e);
                    None
                }
            }
        } else {
            None
        };

        Ok(PageArtifacts {
            title,
            image,
            html,
            pdf,
        })
    }

    async fn store_degraded(
        &self,
        options: &CaptureOptions,
        kind: ArtifactKind,
        url: &str,
        bytes: Vec<u8>,
    ) -> Option<Artifact> {
        match options.sink.store(kind, url, bytes).await {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                self.degraded("sink", &e);
                None
            }
        }
    }

    fn degraded(&self, stage: &'static str, error: &CaptureError) {
        warn!("Degraded capture step {}: {}", stage, error);
        self.metrics.record_degraded(stage);
    }
}

struct PageArtifacts {
    title: String,
    image: Artifact,
    html: Option<Artifact>,
    pdf: Option<Artifact>,
}

/// Await `future` unless the deadline passes first.
async fn within<T, F>(deadline: Instant, budget: Duration, future: F) -> Result<T, CaptureError>
where
    F: Future<Output = Result<T, CaptureError>>,
{
    timeout_at(deadline, future)
        .await
        .map_err(|_| CaptureError::Timeout(budget))?
}

/// Navigate and block until `milestone` fires for the new document.
async fn navigate(
    session: &dyn PageSession,
    url: &str,
    milestone: &str,
    deadline: Instant,
    budget: Duration,
) -> Result<(), CaptureError> {
    within(deadline, budget, async {
        let mut lifecycle = session.navigate(url).await?;
        while let Some(event) = lifecycle.next().await {
            if event == milestone {
                return Ok(());
            }
        }
        Err(CaptureError::NavigationFailed(format!(
            "{url}: page closed before {milestone}"
        )))
    })
    .await
}

/// Scroll step by step to the bottom of the page.
///
/// Stops once the bottom is reached, when the script throws, or when only
/// the settle margin of the deadline is left.
async fn settle(session: &dyn PageSession, options: &CaptureOptions, deadline: Instant) {
    let now = Instant::now();
    let settle_deadline = deadline
        .checked_sub(options.settle_margin)
        .unwrap_or(now)
        .max(now);

    loop {
        match timeout_at(settle_deadline, session.evaluate(scripts::SCROLL_STEP_SCRIPT)).await {
            Ok(Ok(serde_json::Value::Bool(true))) => return,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!("Scrolling stopped: {}", e);
                return;
            }
            Err(_) => {
                debug!("Page did not settle before the deadline");
                return;
            }
        }

        let next = Instant::now() + options.settle_interval;
        if next >= settle_deadline {
            debug!("Page did not settle before the deadline");
            return;
        }
        tokio::time::sleep_until(next).await;
    }
}

/// Clip for the full content box, clamped to the configured maxima.
fn clip_for(width: f64, height: f64, options: &CaptureOptions) -> Clip {
    let mut width = if width > 0.0 { width } else { f64::from(options.viewport.width) };
    let mut height = if height > 0.0 { height } else { f64::from(options.viewport.height) };

    if options.max_width > 0 {
        width = width.min(f64::from(options.max_width));
    }
    if options.max_height > 0 {
        height = height.min(f64::from(options.max_height));
    }

    Clip {
        x: 0.0,
        y: 0.0,
        width,
        height,
    }
}

/// Browser-backed capture service
///
/// Owns one browser session and bounds the number of pages captured at the
/// same time.
pub struct CaptureService {
    session: Arc<BrowserSession>,
    capturer: Arc<Capturer>,
    config: Config,
}

impl CaptureService {
    pub async fn new(config: Config, metrics: Arc<Metrics>) -> Result<Self, CaptureError> {
        config.validate()?;
        let session = Arc::new(BrowserSession::from_config(&config).await?);
        let capturer = Arc::new(Capturer::new(&config.browser, metrics)?);

        Ok(Self {
            session,
            capturer,
            config,
        })
    }

    /// Capture one URL with the configured default options.
    pub async fn capture(&self, url: &str) -> Result<CaptureResult, CaptureError> {
        self.capture_with(url, &self.config.capture).await
    }

    pub async fn capture_with(
        &self,
        url: &str,
        options: &CaptureOptions,
    ) -> Result<CaptureResult, CaptureError> {
        self.capturer.capture(self.session.as_ref(), url, options).await
    }

    /// Capture several URLs concurrently, bounded by the configured limit.
    pub async fn capture_all(
        &self,
        urls: Vec<String>,
        options: &CaptureOptions,
        progress: Option<Arc<ProgressTracker>>,
    ) -> Vec<(String, Result<CaptureResult, CaptureError>)> {
        let source: Arc<dyn PageSource> = self.session.clone();
        let mut processor = BatchProcessor::new(
            self.capturer.clone(),
            source,
            self.config.max_concurrent_captures,
        );
        if let Some(progress) = progress {
            processor = processor.with_progress(progress);
        }
        processor.process_urls(urls, options).await
    }

    pub fn is_alive(&self) -> bool {
        self.session.is_alive()
    }

    pub async fn shutdown(self) {
        info!("Shutting down capture service...");
        match Arc::try_unwrap(self.session) {
            Ok(session) => session.shutdown().await,
            Err(_) => warn!("Browser session still in use, leaving it to the runtime"),
        }
        info!("Capture service shutdown complete");
    }
}
