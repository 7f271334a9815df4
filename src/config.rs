//! Configuration management with serde serialization/deserialization
//!
//! This module holds the per-capture option set, the cookie and local-storage
//! items injected before navigation, the browser settings that used to be read
//! ad hoc from the environment, and the service-level configuration loaded by
//! the command line.

use crate::{CaptureError, OutputSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Service-level configuration for the capture tool
///
/// Loaded once at startup (JSON, see `--config`) and never mutated while
/// captures are running.
///
/// # Examples
///
/// ```rust
/// use page_capture::Config;
///
/// let config = Config {
///     max_concurrent_captures: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of pages captured at the same time (default: CPU count)
    pub max_concurrent_captures: usize,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Attach to an already running browser at `host:port` instead of
    /// launching one
    pub remote_addr: Option<String>,

    /// Browser process settings
    pub browser: BrowserSettings,

    /// Default option set applied to every capture
    pub capture: CaptureOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_captures: num_cpus::get(),
            chrome_path: None,
            remote_addr: None,
            browser: BrowserSettings::default(),
            capture: CaptureOptions::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.max_concurrent_captures == 0 {
            return Err(CaptureError::ConfigurationError(
                "Max concurrent captures must be greater than 0".to_string(),
            ));
        }
        self.capture.validate()
    }
}

/// Browser process settings
///
/// Built once at startup, from the config file and the `CAPTURE_*`
/// environment toggles, and passed by reference to whatever needs it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BrowserSettings {
    /// Verbose browser session debugging
    pub debug: bool,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_agent: Option<String>,
    /// Upstream proxy passed to Chrome as `--proxy-server`
    pub proxy: Option<String>,
    /// Install the anti-detection script on every new document
    pub stealth: bool,
    /// Timeout for reaching a remote debugging endpoint
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            debug: false,
            headless: true,
            sandbox: true,
            disable_gpu: true,
            user_agent: None,
            proxy: None,
            stealth: false,
            connect_timeout: Duration::from_secs(20),
        }
    }
}

const PROXY_VARIABLES: &[&str] = &[
    "PROXY_SERVER",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

impl BrowserSettings {
    /// Defaults overridden by the environment toggles of the process.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        settings.apply_lookup(lookup);
        settings
    }

    /// Override these settings with the environment toggles that are set.
    pub fn apply_env(&mut self) {
        self.apply_lookup(|key| std::env::var(key).ok());
    }

    /// Override these settings with the variables `lookup` knows about.
    /// Unset variables leave the current value alone.
    pub fn apply_lookup<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).map(|value| is_truthy(&value));

        if let Some(debug) = flag("CAPTURE_DEBUG") {
            self.debug = debug;
        }
        if let Some(no_headless) = flag("CAPTURE_NO_HEADLESS") {
            self.headless = !no_headless;
        }
        if let Some(no_sandbox) = flag("CAPTURE_NO_SANDBOX") {
            self.sandbox = !no_sandbox;
        }
        if let Some(disable_gpu) = flag("CAPTURE_DISABLE_GPU") {
            self.disable_gpu = disable_gpu;
        }
        if let Some(stealth) = flag("CAPTURE_STEALTH") {
            self.stealth = stealth;
        }
        if let Some(user_agent) = lookup("CAPTURE_USER_AGENT").filter(|ua| !ua.is_empty()) {
            self.user_agent = Some(user_agent);
        }

        let proxy = PROXY_VARIABLES
            .iter()
            .filter_map(|key| lookup(key))
            .find(|value| !value.is_empty() && url::Url::parse(value).is_ok());
        if proxy.is_some() {
            self.proxy = proxy;
        }

        if let Some(seconds) = lookup("CAPTURE_CONNECT_TIMEOUT")
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            self.connect_timeout = Duration::from_secs(seconds);
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Browser viewport emulated for the captured page
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1280)
    pub width: u32,

    /// Viewport height in pixels (default: 800)
    pub height: u32,

    /// Device pixel ratio (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

/// Raster format of the captured image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// PNG - lossless
    Png,
    /// JPEG - lossy, honours the quality setting
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

impl FromStr for ImageFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            other => Err(CaptureError::ConfigurationError(format!(
                "Unsupported image format: {other}"
            ))),
        }
    }
}

/// Fully resolved option set for one capture
///
/// Built before a capture starts and only ever read afterwards, so several
/// concurrent captures can share one instance.
///
/// # Examples
///
/// ```rust
/// use page_capture::{CaptureOptions, ImageFormat};
///
/// let options = CaptureOptions {
///     quality: 80,
///     produce_trace: true,
///     ..Default::default()
/// };
/// assert_eq!(options.effective_format(), ImageFormat::Jpeg);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Image quality 0-100; anything below 100 forces JPEG (default: 100)
    pub quality: u8,

    /// Clamp for the captured content width, 0 means unbounded
    pub max_width: u32,

    /// Clamp for the captured content height, 0 means unbounded
    pub max_height: u32,

    pub viewport: Viewport,

    pub format: ImageFormat,

    pub produce_pdf: bool,
    pub produce_html: bool,
    pub produce_trace: bool,

    pub cookies: Vec<Cookie>,
    pub storage: Vec<LocalStorageItem>,

    pub sink: OutputSink,

    /// Lifecycle event that marks navigation as complete
    pub wait_until: String,

    /// Overall deadline for one capture (default: 60 seconds)
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Budget for fetching one response body and cookie jar
    #[serde(with = "humantime_serde")]
    pub response_fetch_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub settle_interval: Duration,

    /// Time reserved after scrolling for the artifact captures
    #[serde(with = "humantime_serde")]
    pub settle_margin: Duration,

    /// Budget for the HEAD request that detects office and PDF documents
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            quality: 100,
            max_width: 0,
            max_height: 0,
            viewport: Viewport::default(),
            format: ImageFormat::Png,
            produce_pdf: false,
            produce_html: false,
            produce_trace: false,
            cookies: Vec::new(),
            storage: Vec::new(),
            sink: OutputSink::InMemory,
            wait_until: "DOMContentLoaded".to_string(),
            timeout: Duration::from_secs(60),
            response_fetch_timeout: Duration::from_secs(5),
            settle_interval: Duration::from_millis(150),
            settle_margin: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

impl CaptureOptions {
    /// Image format actually requested from the browser.
    pub fn effective_format(&self) -> ImageFormat {
        if self.quality != 100 {
            ImageFormat::Jpeg
        } else {
            self.format
        }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.quality > 100 {
            return Err(CaptureError::ConfigurationError(
                "Quality must be between 0 and 100".to_string(),
            ));
        }
        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(CaptureError::ConfigurationError(
                "Viewport dimensions must be greater than 0".to_string(),
            ));
        }
        if self.viewport.device_scale_factor <= 0.0 {
            return Err(CaptureError::ConfigurationError(
                "Scale factor must be positive".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(CaptureError::ConfigurationError(
                "Capture timeout must be greater than 0".to_string(),
            ));
        }
        if self.wait_until.trim().is_empty() {
            return Err(CaptureError::ConfigurationError(
                "Lifecycle milestone must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum CookiePriority {
    Low,
    Medium,
    High,
}

/// Cookie injected into the browser before navigation
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub path: Option<String>,
    /// Session cookie when absent
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub same_site: Option<SameSite>,
    #[serde(default)]
    pub priority: Option<CookiePriority>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: None,
            expires: None,
            http_only: false,
            secure: false,
            same_site: None,
            priority: None,
        }
    }
}

/// Local storage entry written into pages served from `host`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LocalStorageItem {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub host: String,
}

/// Parse the `cookies:` section of a YAML file.
///
/// ```yaml
/// cookies:
///   example.com:
///     - name: foo
///       value: bar
/// ```
///
/// Cookies without a domain inherit the key they are listed under.
pub fn import_cookies(yaml: &str) -> Result<Vec<Cookie>, CaptureError> {
    #[derive(Deserialize)]
    struct Document {
        #[serde(default)]
        cookies: BTreeMap<String, Vec<Cookie>>,
    }

    let document: Document = serde_yaml::from_str(yaml)?;
    let mut cookies = Vec::new();
    for (domain, items) in document.cookies {
        for mut cookie in items {
            if cookie.domain.is_empty() {
                cookie.domain = domain.clone();
            }
            cookies.push(cookie);
        }
    }
    Ok(cookies)
}

/// Parse the `local-storage:` section of a YAML file.
///
/// Items without a host inherit the key they are listed under.
pub fn import_storage(yaml: &str) -> Result<Vec<LocalStorageItem>, CaptureError> {
    #[derive(Deserialize)]
    struct Document {
        #[serde(default, rename = "local-storage")]
        local_storage: BTreeMap<String, Vec<LocalStorageItem>>,
    }

    let document: Document = serde_yaml::from_str(yaml)?;
    let mut storage = Vec::new();
    for (host, items) in document.local_storage {
        for mut item in items {
            if item.host.is_empty() {
                item.host = host.clone();
            }
            storage.push(item);
        }
    }
    Ok(storage)
}

/// Generate Chrome command-line arguments for a locally launched browser
///
/// # Examples
///
/// ```rust
/// use page_capture::{get_chrome_args, BrowserSettings, Viewport};
///
/// let args = get_chrome_args(&BrowserSettings::default(), &Viewport::default());
/// assert!(args.contains(&"--no-first-run".to_string()));
/// ```
pub fn get_chrome_args(settings: &BrowserSettings, viewport: &Viewport) -> Vec<String> {
    let mut args = vec![
        "--ignore-certificate-errors".to_string(),
        "--allow-running-insecure-content".to_string(),
        "--no-default-browser-check".to_string(),
        "--disable-web-security".to_string(),
        "--disable-webgl".to_string(),
        "--no-first-run".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-sync".to_string(),
        format!("--window-size={},{}", viewport.width, viewport.height),
    ];

    if settings.disable_gpu {
        args.push("--disable-gpu".to_string());
    }

    if let Some(user_agent) = &settings.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    if let Some(proxy) = &settings.proxy {
        args.push(format!("--proxy-server={proxy}"));
    }

    args
}

/// Throwaway profile directory for one launched browser.
pub fn user_data_dir() -> PathBuf {
    std::env::temp_dir().join(format!("page-capture-runner-{}", uuid::Uuid::new_v4()))
}

pub fn create_browser_config(
    config: &Config,
    user_data_dir: &std::path::Path,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let viewport = &config.capture.viewport;
    let mut builder = BrowserConfig::builder()
        .window_size(viewport.width, viewport.height)
        .user_data_dir(user_data_dir)
        .args(get_chrome_args(&config.browser, viewport));

    if !config.browser.headless {
        builder = builder.with_head();
    }

    if !config.browser.sandbox {
        builder = builder.no_sandbox();
    }

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::BrowserLaunchFailed)
}
