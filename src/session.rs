//! Browser session management
//!
//! The capture pipeline talks to the browser only through the [`PageSource`]
//! and [`PageSession`] traits defined here. [`BrowserSession`] implements them
//! on top of chromiumoxide, either by launching a local Chrome or by attaching
//! to a remote debugging endpoint.

use crate::cdp::CdpPage;
use crate::{
    create_browser_config, user_data_dir, BrowserSettings, CaptureError, Config, Cookie,
    ImageFormat, Viewport,
};
use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Response metadata carried by a "response received" observation
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    pub url: String,
    pub status: i64,
    pub status_text: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
    pub mime_type: String,
    pub encoded_data_length: f64,
}

/// Low-level network lifecycle observation of one page
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    RequestWillBeSent {
        request_id: String,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
    },
    ResponseReceived {
        request_id: String,
        response: ResponseMeta,
    },
    DataReceived {
        request_id: String,
        encoded_data_length: u64,
    },
}

impl NetworkEvent {
    pub fn request_id(&self) -> &str {
        match self {
            NetworkEvent::RequestWillBeSent { request_id, .. }
            | NetworkEvent::ResponseReceived { request_id, .. }
            | NetworkEvent::DataReceived { request_id, .. } => request_id,
        }
    }
}

/// Cookie as reported by the browser's cookie jar
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Seconds since the epoch, negative for session cookies
    pub expires: f64,
    pub http_only: bool,
    pub secure: bool,
}

/// Screenshot clip rectangle in CSS pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clip {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Control channel to one browser page
#[async_trait]
pub trait PageSession: Send + Sync {
    /// Network lifecycle events of the page, from the moment of the call on.
    async fn network_events(&self) -> Result<BoxStream<'static, NetworkEvent>, CaptureError>;

    /// Accept every JavaScript dialog the page opens.
    async fn auto_dismiss_dialogs(&self) -> Result<(), CaptureError>;

    /// Enable the page and network domains and lifecycle events.
    async fn enable_domains(&self) -> Result<(), CaptureError>;

    async fn emulate_viewport(&self, viewport: &Viewport) -> Result<(), CaptureError>;

    async fn deny_downloads(&self) -> Result<(), CaptureError>;

    async fn add_script_on_new_document(&self, source: &str) -> Result<(), CaptureError>;

    async fn set_cookie(&self, cookie: &Cookie) -> Result<(), CaptureError>;

    /// Evaluate `expression` and return its value. Script exceptions are errors.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, CaptureError>;

    /// Start navigating to `url`.
    ///
    /// Returns the names of the lifecycle events fired for the new document.
    async fn navigate(&self, url: &str) -> Result<BoxStream<'static, String>, CaptureError>;

    async fn title(&self) -> Result<Option<String>, CaptureError>;

    /// Width and height of the rendered content in CSS pixels.
    async fn content_size(&self) -> Result<(f64, f64), CaptureError>;

    async fn capture_image(
        &self,
        clip: Clip,
        quality: u8,
        format: ImageFormat,
    ) -> Result<Vec<u8>, CaptureError>;

    async fn render_pdf(&self) -> Result<Vec<u8>, CaptureError>;

    async fn outer_html(&self) -> Result<String, CaptureError>;

    async fn response_body(&self, request_id: &str) -> Result<Vec<u8>, CaptureError>;

    async fn all_cookies(&self) -> Result<Vec<SessionCookie>, CaptureError>;

    async fn close(&self) -> Result<(), CaptureError>;
}

/// Something that hands out fresh pages
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn open_page(&self) -> Result<Arc<dyn PageSession>, CaptureError>;
}

/// A live browser, launched locally or attached remotely
pub struct BrowserSession {
    browser: Mutex<Browser>,
    handler: tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>>,
    /// Throwaway profile of a locally launched browser
    user_data_dir: Option<PathBuf>,
    settings: BrowserSettings,
}

impl BrowserSession {
    /// Launch a local Chrome with a throwaway profile.
    pub async fn launch(config: &Config) -> Result<Self, CaptureError> {
        let profile = user_data_dir();
        tokio::fs::create_dir_all(&profile).await.map_err(|e| {
            CaptureError::BrowserLaunchFailed(format!("Failed to create user data dir: {e}"))
        })?;

        let browser_config = create_browser_config(config, &profile)?;
        let (browser, handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        info!("Launched local browser with profile {}", profile.display());
        Ok(Self {
            browser: Mutex::new(browser),
            handler: spawn_handler(handler),
            user_data_dir: Some(profile),
            settings: config.browser.clone(),
        })
    }

    /// Attach to a browser exposing its debugging endpoint at `addr` (`host:port`).
    pub async fn connect(addr: &str, settings: &BrowserSettings) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .timeout(settings.connect_timeout)
            .build()?;
        let ws_url = resolve_websocket_url(&client, addr).await?;

        let (browser, handler) =
            tokio::time::timeout(settings.connect_timeout, Browser::connect(ws_url.clone()))
                .await
                .map_err(|_| {
                    CaptureError::RemoteUnavailable(format!("Timed out connecting to {ws_url}"))
                })?
                .map_err(|e| CaptureError::RemoteUnavailable(e.to_string()))?;

        info!("Attached to remote browser at {}", addr);
        Ok(Self {
            browser: Mutex::new(browser),
            handler: spawn_handler(handler),
            user_data_dir: None,
            settings: settings.clone(),
        })
    }

    pub async fn from_config(config: &Config) -> Result<Self, CaptureError> {
        match &config.remote_addr {
            Some(addr) => Self::connect(addr, &config.browser).await,
            None => Self::launch(config).await,
        }
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    pub fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }

    /// Close a launched browser or detach from a remote one.
    pub async fn shutdown(self) {
        if self.user_data_dir.is_some() {
            let mut browser = self.browser.lock().await;
            if let Err(e) = browser.close().await {
                warn!("Failed to close browser: {}", e);
            }
            let _ = browser.wait().await;
        }
        self.handler.abort();

        if let Some(dir) = &self.user_data_dir {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                debug!("Failed to remove {}: {}", dir.display(), e);
            }
        }
    }
}

#[async_trait]
impl PageSource for BrowserSession {
    async fn open_page(&self) -> Result<Arc<dyn PageSession>, CaptureError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::PageAllocationFailed(e.to_string()))?;

        Ok(Arc::new(CdpPage::new(page, self.settings.debug)))
    }
}

/// The handler implements Stream and must be polled for the browser to make progress.
fn spawn_handler(
    mut handler: chromiumoxide::Handler,
) -> tokio::task::JoinHandle<Result<(), chromiumoxide::error::CdpError>> {
    tokio::spawn(async move {
        loop {
            match handler.next().await {
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    error!("Handler error: {}", e);
                    return Err(e);
                }
                None => {
                    info!("Handler stream ended");
                    break;
                }
            }
        }
        Ok(())
    })
}

/// Resolve the browser websocket URL of a remote debugging endpoint.
///
/// Chrome only answers `/json/version` for IP or `localhost` hosts, so the
/// request claims to be for `localhost` and the answer is rewritten back.
pub async fn resolve_websocket_url(
    client: &reqwest::Client,
    addr: &str,
) -> Result<String, CaptureError> {
    #[derive(serde::Deserialize)]
    struct Version {
        #[serde(rename = "webSocketDebuggerUrl")]
        web_socket_debugger_url: String,
    }

    let version: Version = client
        .get(format!("http://{addr}/json/version"))
        .header(reqwest::header::HOST, "localhost")
        .send()
        .await
        .map_err(|e| CaptureError::RemoteUnavailable(e.to_string()))?
        .error_for_status()
        .map_err(|e| CaptureError::RemoteUnavailable(e.to_string()))?
        .json()
        .await
        .map_err(|e| CaptureError::RemoteUnavailable(e.to_string()))?;

    Ok(version
        .web_socket_debugger_url
        .replacen("localhost", addr, 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_resolve_websocket_url_rewrites_host() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json/version"))
            .and(header("host", "localhost"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "Browser": "HeadlessChrome/120.0",
                "webSocketDebuggerUrl": "ws://localhost/devtools/browser/abc"
            })))
            .mount(&server)
            .await;

        let addr = server.address().to_string();
        let url = resolve_websocket_url(&reqwest::Client::new(), &addr)
            .await
            .unwrap();

        assert_eq!(url, format!("ws://{addr}/devtools/browser/abc"));
    }

    #[tokio::test]
    async fn test_resolve_websocket_url_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = resolve_websocket_url(&reqwest::Client::new(), &server.address().to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::RemoteUnavailable(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_network_event_request_id() {
        let event = NetworkEvent::DataReceived {
            request_id: "42.1".to_string(),
            encoded_data_length: 10,
        };
        assert_eq!(event.request_id(), "42.1");
    }
}
