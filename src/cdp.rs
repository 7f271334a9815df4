use crate::{
    CaptureError, Clip, Cookie, CookiePriority, ImageFormat, NetworkEvent, PageSession,
    ResponseMeta, SameSite, SessionCookie, Viewport,
};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    self, EventDataReceived, EventRequestWillBeSent, EventResponseReceived, GetResponseBodyParams,
    Headers, RequestId, SetCookieParams, TimeSinceEpoch,
};
use chromiumoxide::cdp::browser_protocol::page::{
    self, AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
    CaptureScreenshotParams, EventJavascriptDialogOpening, EventLifecycleEvent,
    HandleJavaScriptDialogParams, NavigateParams, PrintToPdfParams, SetLifecycleEventsEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::storage::GetCookiesParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// [`PageSession`] backed by a chromiumoxide page
pub struct CdpPage {
    page: Page,
    debug: bool,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl CdpPage {
    pub fn new(page: Page, debug: bool) -> Self {
        Self {
            page,
            debug,
            background: Mutex::new(Vec::new()),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut background) = self.background.lock() {
            background.push(task);
        }
    }
}

fn header_pairs(headers: &Headers) -> Vec<(String, String)> {
    headers
        .inner()
        .as_object()
        .map(|object| {
            object
                .iter()
                .map(|(name, value)| {
                    let value = match value.as_str() {
                        Some(text) => text.to_string(),
                        None => value.to_string(),
                    };
                    (name.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default()
}

fn same_site(value: SameSite) -> network::CookieSameSite {
    match value {
        SameSite::Strict => network::CookieSameSite::Strict,
        SameSite::Lax => network::CookieSameSite::Lax,
        SameSite::None => network::CookieSameSite::None,
    }
}

fn priority(value: CookiePriority) -> network::CookiePriority {
    match value {
        CookiePriority::Low => network::CookiePriority::Low,
        CookiePriority::Medium => network::CookiePriority::Medium,
        CookiePriority::High => network::CookiePriority::High,
    }
}

/// Every cookie of the browser context, not only those of the current URL.
fn cookie_jar_params() -> GetCookiesParams {
    GetCookiesParams::default()
}

fn decode_base64(data: &str) -> Result<Vec<u8>, CaptureError> {
    base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|e| CaptureError::CaptureFailed(format!("base64 decode failed: {e}")))
}

#[async_trait]
impl PageSession for CdpPage {
    async fn network_events(&self) -> Result<BoxStream<'static, NetworkEvent>, CaptureError> {
        let requests = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await?
            .map(|event| NetworkEvent::RequestWillBeSent {
                request_id: event.request_id.inner().clone(),
                method: event.request.method.clone(),
                url: event.request.url.clone(),
                headers: header_pairs(&event.request.headers),
            });

        let responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await?
            .map(|event| NetworkEvent::ResponseReceived {
                request_id: event.request_id.inner().clone(),
                response: ResponseMeta {
                    url: event.response.url.clone(),
                    status: event.response.status,
                    status_text: event.response.status_text.clone(),
                    protocol: event.response.protocol.clone().unwrap_or_default(),
                    headers: header_pairs(&event.response.headers),
                    mime_type: event.response.mime_type.clone(),
                    encoded_data_length: event.response.encoded_data_length,
                },
            });

        let data = self
            .page
            .event_listener::<EventDataReceived>()
            .await?
            .map(|event| NetworkEvent::DataReceived {
                request_id: event.request_id.inner().clone(),
                encoded_data_length: event.encoded_data_length.max(0) as u64,
            });

        let debug = self.debug;
        Ok(stream::select_all([requests.boxed(), responses.boxed(), data.boxed()])
            .inspect(move |event| {
                if debug {
                    trace!("network event: {:?}", event);
                }
            })
            .boxed())
    }

    async fn auto_dismiss_dialogs(&self) -> Result<(), CaptureError> {
        let mut dialogs = self
            .page
            .event_listener::<EventJavascriptDialogOpening>()
            .await?;
        let handle = self.page.clone();

        self.track(tokio::spawn(async move {
            while let Some(dialog) = dialogs.next().await {
                debug!("Dismissing {:?} dialog: {}", dialog.r#type, dialog.message);
                if let Err(e) = handle.execute(HandleJavaScriptDialogParams::new(true)).await {
                    debug!("Failed to dismiss dialog: {}", e);
                }
            }
        }));
        Ok(())
    }

    async fn enable_domains(&self) -> Result<(), CaptureError> {
        self.page.execute(page::EnableParams::default()).await?;
        self.page.execute(network::EnableParams::default()).await?;
        self.page
            .execute(SetLifecycleEventsEnabledParams::new(true))
            .await?;
        Ok(())
    }

    async fn emulate_viewport(&self, viewport: &Viewport) -> Result<(), CaptureError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width)
            .height(viewport.height)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::ChromeError)?;

        self.page.execute(params).await?;
        Ok(())
    }

    async fn deny_downloads(&self) -> Result<(), CaptureError> {
        self.page
            .execute(SetDownloadBehaviorParams::new(SetDownloadBehaviorBehavior::Deny))
            .await?;
        Ok(())
    }

    async fn add_script_on_new_document(&self, source: &str) -> Result<(), CaptureError> {
        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(source))
            .await?;
        Ok(())
    }

    async fn set_cookie(&self, cookie: &Cookie) -> Result<(), CaptureError> {
        let mut builder = SetCookieParams::builder()
            .name(cookie.name.clone())
            .value(cookie.value.clone())
            .domain(cookie.domain.clone())
            .http_only(cookie.http_only)
            .secure(cookie.secure);

        if let Some(path) = &cookie.path {
            builder = builder.path(path.clone());
        }
        if let Some(expires) = cookie.expires {
            builder = builder.expires(TimeSinceEpoch::new(expires.timestamp() as f64));
        }
        if let Some(value) = cookie.same_site {
            builder = builder.same_site(same_site(value));
        }
        if let Some(value) = cookie.priority {
            builder = builder.priority(priority(value));
        }

        let params = builder.build().map_err(CaptureError::ChromeError)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, CaptureError> {
        let params = EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(CaptureError::ChromeError)?;

        let result = self
            .page
            .evaluate(params)
            .await
            .map_err(|e| CaptureError::ScriptFailed(e.to_string()))?;

        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn navigate(&self, url: &str) -> Result<BoxStream<'static, String>, CaptureError> {
        let lifecycle = self.page.event_listener::<EventLifecycleEvent>().await?;

        let response = self
            .page
            .execute(NavigateParams::new(url))
            .await
            .map_err(|e| CaptureError::NavigationFailed(e.to_string()))?;

        if let Some(error_text) = &response.result.error_text {
            return Err(CaptureError::NavigationFailed(format!("{url}: {error_text}")));
        }

        let frame_id = response.result.frame_id.clone();
        let loader_id = response.result.loader_id.clone();

        Ok(lifecycle
            .filter_map(move |event| {
                let same_frame = event.frame_id == frame_id;
                let same_loader = loader_id
                    .as_ref()
                    .map_or(true, |loader| event.loader_id == *loader);
                let name = (same_frame && same_loader).then(|| event.name.clone());
                futures::future::ready(name)
            })
            .boxed())
    }

    async fn title(&self) -> Result<Option<String>, CaptureError> {
        Ok(self.page.get_title().await?)
    }

    async fn content_size(&self) -> Result<(f64, f64), CaptureError> {
        let metrics = self.page.layout_metrics().await?;
        let content = metrics.css_content_size;
        Ok((content.width, content.height))
    }

    async fn capture_image(
        &self,
        clip: Clip,
        quality: u8,
        format: ImageFormat,
    ) -> Result<Vec<u8>, CaptureError> {
        let mut builder = CaptureScreenshotParams::builder()
            .capture_beyond_viewport(true)
            .clip(page::Viewport {
                x: clip.x,
                y: clip.y,
                width: clip.width,
                height: clip.height,
                scale: 1.0,
            });

        builder = match format {
            ImageFormat::Png => builder.format(CaptureScreenshotFormat::Png),
            ImageFormat::Jpeg => builder
                .format(CaptureScreenshotFormat::Jpeg)
                .quality(i64::from(quality)),
        };

        let response = self
            .page
            .execute(builder.build())
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))?;

        let data: &str = response.data.as_ref();
        decode_base64(data)
    }

    async fn render_pdf(&self) -> Result<Vec<u8>, CaptureError> {
        let params = PrintToPdfParams::builder()
            .landscape(true)
            .print_background(true)
            .build();

        self.page
            .pdf(params)
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }

    async fn outer_html(&self) -> Result<String, CaptureError> {
        self.page
            .content()
            .await
            .map_err(|e| CaptureError::CaptureFailed(e.to_string()))
    }

    async fn response_body(&self, request_id: &str) -> Result<Vec<u8>, CaptureError> {
        let response = self
            .page
            .execute(GetResponseBodyParams::new(RequestId::new(request_id)))
            .await?;

        if response.result.base64_encoded {
            decode_base64(&response.result.body)
        } else {
            Ok(response.result.body.clone().into_bytes())
        }
    }

    async fn all_cookies(&self) -> Result<Vec<SessionCookie>, CaptureError> {
        let response = self.page.execute(cookie_jar_params()).await?;

        Ok(response
            .result
            .cookies
            .iter()
            .map(|cookie| SessionCookie {
                name: cookie.name.clone(),
                value: cookie.value.clone(),
                domain: cookie.domain.clone(),
                path: cookie.path.clone(),
                expires: cookie.expires,
                http_only: cookie.http_only,
                secure: cookie.secure,
            })
            .collect())
    }

    async fn close(&self) -> Result<(), CaptureError> {
        if let Ok(mut background) = self.background.lock() {
            for task in background.drain(..) {
                task.abort();
            }
        }

        self.page.clone().close().await?;
        Ok(())
    }
}
