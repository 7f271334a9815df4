#[cfg(test)]
mod integration_tests {
    use crate::har::Har;
    use crate::{
        utils, Artifact, BatchProcessor, BrowserSettings, CaptureError, CaptureOptions, Capturer,
        Clip, Config, Cookie, Correlator, CorrelatorSettings, ErrorSeverity, ImageFormat, LocalStorageItem, Metrics,
        NetworkEvent, OutputSink, PageSession, PageSource, ProgressTracker, ResponseMeta,
        SessionCookie, Viewport,
    };
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::stream::{self, BoxStream};
    use futures::StreamExt;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const JPEG_BYTES: &[u8] = b"\xff\xd8\xff\xe0\0\x10JFIF\0";

    /// How a fake page behaves
    #[derive(Clone, Default)]
    struct Scenario {
        events: Vec<NetworkEvent>,
        bodies: HashMap<String, Vec<u8>>,
        hung_bodies: HashSet<String>,
        jar: Vec<SessionCookie>,
        hang_navigation: bool,
        fail_jar: bool,
        fail_image: bool,
        fail_pdf: bool,
    }

    struct FakePage {
        scenario: Scenario,
        events_tx: mpsc::UnboundedSender<NetworkEvent>,
        events_rx: Mutex<Option<mpsc::UnboundedReceiver<NetworkEvent>>>,
        navigated: Mutex<Vec<String>>,
        cookies_set: Mutex<Vec<Cookie>>,
        scripts_added: Mutex<Vec<String>>,
        image_requests: Mutex<Vec<(u8, ImageFormat)>>,
        body_fetches: AtomicUsize,
        closed: AtomicBool,
    }

    impl FakePage {
        fn new(scenario: Scenario) -> Self {
            let (events_tx, events_rx) = mpsc::unbounded();
            Self {
                scenario,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                navigated: Mutex::new(Vec::new()),
                cookies_set: Mutex::new(Vec::new()),
                scripts_added: Mutex::new(Vec::new()),
                image_requests: Mutex::new(Vec::new()),
                body_fetches: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl PageSession for FakePage {
        async fn network_events(&self) -> Result<BoxStream<'static, NetworkEvent>, CaptureError> {
            self.events_rx
                .lock()
                .unwrap()
                .take()
                .map(|rx| rx.boxed())
                .ok_or_else(|| CaptureError::ChromeError("events already taken".to_string()))
        }

        async fn auto_dismiss_dialogs(&self) -> Result<(), CaptureError> {
            Ok(())
        }

        async fn enable_domains(&self) -> Result<(), CaptureError> {
            Ok(())
        }

        async fn emulate_viewport(&self, _viewport: &Viewport) -> Result<(), CaptureError> {
            Ok(())
        }

        async fn deny_downloads(&self) -> Result<(), CaptureError> {
            Err(CaptureError::ChromeError("not supported".to_string()))
        }

        async fn add_script_on_new_document(&self, source: &str) -> Result<(), CaptureError> {
            self.scripts_added.lock().unwrap().push(source.to_string());
            Ok(())
        }

        async fn set_cookie(&self, cookie: &Cookie) -> Result<(), CaptureError> {
            self.cookies_set.lock().unwrap().push(cookie.clone());
            Ok(())
        }

        async fn evaluate(&self, _expression: &str) -> Result<serde_json::Value, CaptureError> {
            Ok(serde_json::Value::Bool(true))
        }

        async fn navigate(&self, url: &str) -> Result<BoxStream<'static, String>, CaptureError> {
            self.navigated.lock().unwrap().push(url.to_string());
            for event in &self.scenario.events {
                let _ = self.events_tx.unbounded_send(event.clone());
            }

            if self.scenario.hang_navigation {
                return Ok(stream::pending().boxed());
            }
            let lifecycle = ["init", "DOMContentLoaded", "load"].map(str::to_string);
            Ok(stream::iter(lifecycle).boxed())
        }

        async fn title(&self) -> Result<Option<String>, CaptureError> {
            Ok(Some("Fake page".to_string()))
        }

        async fn content_size(&self) -> Result<(f64, f64), CaptureError> {
            Ok((1280.0, 2400.0))
        }

        async fn capture_image(
            &self,
            _clip: Clip,
            quality: u8,
            format: ImageFormat,
        ) -> Result<Vec<u8>, CaptureError> {
            self.image_requests.lock().unwrap().push((quality, format));
            if self.scenario.fail_image {
                return Err(CaptureError::CaptureFailed("compositor gone".to_string()));
            }
            Ok(match format {
                ImageFormat::Png => PNG_BYTES.to_vec(),
                ImageFormat::Jpeg => JPEG_BYTES.to_vec(),
            })
        }

        async fn render_pdf(&self) -> Result<Vec<u8>, CaptureError> {
            if self.scenario.fail_pdf {
                return Err(CaptureError::CaptureFailed("printing failed".to_string()));
            }
            Ok(b"%PDF-1.7 fake".to_vec())
        }

        async fn outer_html(&self) -> Result<String, CaptureError> {
            Ok("<!DOCTYPE html><html><body>fake</body></html>".to_string())
        }

        async fn response_body(&self, request_id: &str) -> Result<Vec<u8>, CaptureError> {
            self.body_fetches.fetch_add(1, Ordering::SeqCst);
            if self.scenario.hung_bodies.contains(request_id) {
                return std::future::pending().await;
            }
            self.scenario
                .bodies
                .get(request_id)
                .cloned()
                .ok_or_else(|| CaptureError::NetworkError(format!("no body for {request_id}")))
        }

        async fn all_cookies(&self) -> Result<Vec<SessionCookie>, CaptureError> {
            if self.scenario.fail_jar {
                return Err(CaptureError::ChromeError("target closed".to_string()));
            }
            Ok(self.scenario.jar.clone())
        }

        async fn close(&self) -> Result<(), CaptureError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeSource {
        scenario: Scenario,
        pages: Mutex<Vec<Arc<FakePage>>>,
    }

    impl FakeSource {
        fn new(scenario: Scenario) -> Self {
            Self {
                scenario,
                pages: Mutex::new(Vec::new()),
            }
        }

        fn page(&self, index: usize) -> Arc<FakePage> {
            self.pages.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl PageSource for FakeSource {
        async fn open_page(&self) -> Result<Arc<dyn PageSession>, CaptureError> {
            let page = Arc::new(FakePage::new(self.scenario.clone()));
            self.pages.lock().unwrap().push(page.clone());
            Ok(page)
        }
    }

    fn request(id: &str, method: &str, url: &str) -> NetworkEvent {
        NetworkEvent::RequestWillBeSent {
            request_id: id.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            headers: vec![("Accept".to_string(), "*/*".to_string())],
        }
    }

    fn response(id: &str, url: &str, status: i64, mime_type: &str) -> NetworkEvent {
        NetworkEvent::ResponseReceived {
            request_id: id.to_string(),
            response: ResponseMeta {
                url: url.to_string(),
                status,
                status_text: String::new(),
                protocol: "http/1.1".to_string(),
                headers: vec![("Content-Type".to_string(), mime_type.to_string())],
                mime_type: mime_type.to_string(),
                encoded_data_length: 120.0,
            },
        }
    }

    fn data(id: &str, length: u64) -> NetworkEvent {
        NetworkEvent::DataReceived {
            request_id: id.to_string(),
            encoded_data_length: length,
        }
    }

    fn jar_cookie(name: &str, domain: &str) -> SessionCookie {
        SessionCookie {
            name: name.to_string(),
            value: "1".to_string(),
            domain: domain.to_string(),
            path: "/".to_string(),
            expires: -1.0,
            http_only: false,
            secure: true,
        }
    }

    /// Two XHRs, one failing, plus some transferred data.
    fn xhr_scenario() -> Scenario {
        let mut bodies = HashMap::new();
        bodies.insert("1".to_string(), br#"{"ok":true}"#.to_vec());
        bodies.insert("2".to_string(), b"oops".to_vec());

        Scenario {
            events: vec![
                request("1", "GET", "https://www.example.com/api?page=2"),
                request("2", "POST", "https://www.example.com/fail"),
                response("1", "https://www.example.com/api?page=2", 200, "application/json"),
                data("1", 1000),
                response("2", "https://www.example.com/fail", 500, "text/plain"),
                data("2", 250),
            ],
            bodies,
            jar: vec![jar_cookie("foo", ".example.com"), jar_cookie("bar", "other.test")],
            ..Default::default()
        }
    }

    fn capturer() -> Capturer {
        Capturer::new(&BrowserSettings::default(), Arc::new(Metrics::noop())).unwrap()
    }

    fn options() -> CaptureOptions {
        CaptureOptions {
            timeout: Duration::from_secs(10),
            settle_margin: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    fn parse_har(artifact: &Artifact) -> Har {
        serde_json::from_slice(artifact.bytes().unwrap()).unwrap()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert!(config.max_concurrent_captures > 0);
        assert_eq!(config.capture.timeout, Duration::from_secs(60));
        assert_eq!(config.capture.quality, 100);
        assert_eq!(config.capture.sink, OutputSink::InMemory);
        assert!(config.remote_addr.is_none());
    }

    #[test]
    fn test_error_severity() {
        assert!(matches!(
            CaptureError::InvalidUrl("test".to_string()).severity(),
            ErrorSeverity::Low
        ));
        assert!(matches!(
            CaptureError::ConfigurationError("test".to_string()).severity(),
            ErrorSeverity::High
        ));
    }

    #[tokio::test]
    async fn test_trace_has_one_entry_per_response() {
        let server = MockServer::start().await;
        let source = FakeSource::new(xhr_scenario());
        let options = CaptureOptions {
            produce_trace: true,
            ..options()
        };

        let url = format!("{}/page", server.uri());
        let result = capturer().capture(&source, &url, &options).await.unwrap();

        assert_eq!(result.url, url);
        assert_eq!(result.title, "Fake page");
        assert_eq!(result.transferred_bytes, 1250);

        let har = parse_har(result.har.as_ref().unwrap());
        assert_eq!(har.log.version, "1.2");
        assert_eq!(har.log.pages.len(), 1);
        assert_eq!(har.log.pages[0].title, url);
        assert_eq!(har.log.entries.len(), 2);
        assert!(har.log.entries.iter().all(|entry| entry.pageref == "page_1"));

        let ok = &har.log.entries[0];
        assert_eq!(ok.request.method, "GET");
        assert_eq!(ok.request.query_string[0].name, "page");
        assert_eq!(ok.response.status, 200);
        assert_eq!(ok.response.status_text, "OK");
        assert_eq!(ok.response.content.encoding.as_deref(), Some("base64"));

        let failed = &har.log.entries[1];
        assert_eq!(failed.request.method, "POST");
        assert_eq!(failed.response.status, 500);
        assert_eq!(failed.response.status_text, "Internal Server Error");

        assert!(source.page(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_jar_cookies_matched_by_domain() {
        let server = MockServer::start().await;
        let source = FakeSource::new(xhr_scenario());
        let options = CaptureOptions {
            produce_trace: true,
            cookies: vec![Cookie::new("foo", "1", "example.com")],
            ..options()
        };

        let result = capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        let page = source.page(0);
        assert_eq!(page.cookies_set.lock().unwrap()[0].name, "foo");

        let har = parse_har(result.har.as_ref().unwrap());
        for entry in &har.log.entries {
            let names: Vec<_> = entry.response.cookies.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["foo"]);
        }
    }

    #[tokio::test]
    async fn test_hung_body_fetch_is_omitted() {
        let server = MockServer::start().await;
        let mut scenario = xhr_scenario();
        scenario.hung_bodies.insert("2".to_string());
        let source = FakeSource::new(scenario);
        let options = CaptureOptions {
            produce_trace: true,
            response_fetch_timeout: Duration::from_millis(200),
            ..options()
        };

        let result = capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        let har = parse_har(result.har.as_ref().unwrap());
        assert_eq!(har.log.entries.len(), 1);
        assert_eq!(har.log.entries[0].response.status, 200);
    }

    #[tokio::test]
    async fn test_deadline_is_fatal() {
        let server = MockServer::start().await;
        let source = FakeSource::new(Scenario {
            hang_navigation: true,
            ..xhr_scenario()
        });
        let options = CaptureOptions {
            timeout: Duration::from_millis(300),
            produce_trace: true,
            ..options()
        };

        let result = capturer().capture(&source, &server.uri(), &options).await;

        match result {
            Err(CaptureError::Timeout(budget)) => assert_eq!(budget, Duration::from_millis(300)),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(source.page(0).closed.load(Ordering::SeqCst));
        assert!(source.page(0).image_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_bounds_content_type_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/pdf")
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let source = FakeSource::new(Scenario {
            hang_navigation: true,
            ..Scenario::default()
        });
        let options = CaptureOptions {
            timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_secs(3),
            ..options()
        };

        let start = std::time::Instant::now();
        let result = capturer().capture(&source, &server.uri(), &options).await;

        assert!(matches!(result, Err(CaptureError::Timeout(_))));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(source.page(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_deadline_cancels_inflight_fetches() {
        let server = MockServer::start().await;
        let mut scenario = xhr_scenario();
        scenario.hung_bodies.insert("2".to_string());
        let source = FakeSource::new(scenario);
        let options = CaptureOptions {
            produce_trace: true,
            timeout: Duration::from_millis(1500),
            settle_margin: Duration::from_millis(200),
            response_fetch_timeout: Duration::from_secs(30),
            ..options()
        };

        let start = std::time::Instant::now();
        let result = capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.transferred_bytes, 1250);
        let har = parse_har(result.har.as_ref().unwrap());
        assert_eq!(har.log.entries.len(), 1);
        assert_eq!(har.log.entries[0].request.method, "GET");
    }

    #[tokio::test]
    async fn test_failed_body_fetch_drops_entry() {
        let server = MockServer::start().await;
        let mut scenario = xhr_scenario();
        scenario.bodies.remove("2");
        let source = FakeSource::new(scenario);
        let options = CaptureOptions {
            produce_trace: true,
            ..options()
        };

        let result = capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        let har = parse_har(result.har.as_ref().unwrap());
        assert_eq!(har.log.entries.len(), 1);
        assert_eq!(har.log.entries[0].response.status, 200);
        assert_eq!(source.page(0).body_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_cookie_fetch_drops_entries() {
        let server = MockServer::start().await;
        let source = FakeSource::new(Scenario {
            fail_jar: true,
            ..xhr_scenario()
        });
        let options = CaptureOptions {
            produce_trace: true,
            ..options()
        };

        let result = capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        let har = parse_har(result.har.as_ref().unwrap());
        assert!(har.log.entries.is_empty());
        assert_eq!(har.log.pages.len(), 1);
        assert_eq!(result.image.bytes(), Some(PNG_BYTES));
    }

    #[tokio::test]
    async fn test_drain_stops_endless_event_source() {
        let page: Arc<dyn PageSession> = Arc::new(FakePage::new(Scenario::default()));
        let mut correlator = Correlator::spawn(
            page,
            CorrelatorSettings {
                collect_responses: false,
                fetch_timeout: Duration::from_secs(1),
                deadline: tokio::time::Instant::now() + Duration::from_secs(30),
            },
        );

        correlator.listen(stream::repeat(data("1", 1)).boxed());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let log = tokio::time::timeout(Duration::from_secs(5), correlator.drain())
            .await
            .expect("drain returns while the source is still producing");
        assert!(log.transferred_bytes > 0);
        assert!(log.order.is_empty());
    }

    #[tokio::test]
    async fn test_image_only_capture() {
        let server = MockServer::start().await;
        let source = FakeSource::new(xhr_scenario());

        let result = capturer()
            .capture(&source, &server.uri(), &options())
            .await
            .unwrap();

        assert_eq!(result.image.bytes(), Some(PNG_BYTES));
        assert!(result.html.is_none());
        assert!(result.pdf.is_none());
        assert!(result.har.is_none());
        // Bodies are only fetched for traces.
        assert_eq!(source.page(0).body_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quality_selects_image_format() {
        let server = MockServer::start().await;
        let source = FakeSource::new(Scenario::default());
        let capturer = capturer();

        let lossy = CaptureOptions {
            quality: 80,
            ..options()
        };
        let result = capturer.capture(&source, &server.uri(), &lossy).await.unwrap();
        assert_eq!(result.image.bytes(), Some(JPEG_BYTES));

        let lossless = options();
        capturer
            .capture(&source, &server.uri(), &lossless)
            .await
            .unwrap();

        assert_eq!(
            *source.page(0).image_requests.lock().unwrap(),
            vec![(80, ImageFormat::Jpeg)]
        );
        assert_eq!(
            *source.page(1).image_requests.lock().unwrap(),
            vec![(100, ImageFormat::Png)]
        );
    }

    #[tokio::test]
    async fn test_image_failure_is_fatal() {
        let server = MockServer::start().await;
        let source = FakeSource::new(Scenario {
            fail_image: true,
            ..xhr_scenario()
        });
        let options = CaptureOptions {
            produce_trace: true,
            produce_pdf: true,
            ..options()
        };

        let result = capturer().capture(&source, &server.uri(), &options).await;
        assert!(matches!(result, Err(CaptureError::CaptureFailed(_))));
        assert!(source.page(0).closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pdf_failure_degrades() {
        let server = MockServer::start().await;
        let source = FakeSource::new(Scenario {
            fail_pdf: true,
            ..xhr_scenario()
        });
        let options = CaptureOptions {
            produce_html: true,
            produce_pdf: true,
            ..options()
        };

        let result = capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        assert!(result.pdf.is_none());
        assert!(result.html.unwrap().bytes().unwrap().starts_with(b"<!DOCTYPE html>"));
        assert_eq!(result.image.bytes(), Some(PNG_BYTES));
    }

    #[tokio::test]
    async fn test_pdf_documents_open_in_viewer() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/report.pdf"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "application/pdf"))
            .mount(&server)
            .await;

        let source = FakeSource::new(Scenario::default());
        let url = format!("{}/report.pdf", server.uri());

        let result = capturer().capture(&source, &url, &options()).await.unwrap();

        let navigated = source.page(0).navigated.lock().unwrap().clone();
        assert_eq!(navigated, vec![format!("{}{}", utils::VIEWER_ENDPOINT, url)]);
        assert_eq!(result.url, url);
    }

    #[tokio::test]
    async fn test_invalid_url_opens_no_page() {
        let source = FakeSource::new(Scenario::default());

        let result = capturer().capture(&source, "ftp://example.com/", &options()).await;
        assert!(matches!(result, Err(CaptureError::InvalidUrl(_))));
        assert!(source.pages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_storage_filtered_by_host() {
        let server = MockServer::start().await;
        let source = FakeSource::new(Scenario::default());
        let host = server.address().to_string();
        let options = CaptureOptions {
            storage: vec![
                LocalStorageItem {
                    key: "theme".to_string(),
                    value: "dark".to_string(),
                    host: host.clone(),
                },
                LocalStorageItem {
                    key: "token".to_string(),
                    value: "secret".to_string(),
                    host: "elsewhere.test".to_string(),
                },
            ],
            ..options()
        };

        capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        let scripts = source.page(0).scripts_added.lock().unwrap().clone();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains(r#"setItem("theme", "dark")"#));
        assert!(scripts[0].contains(&host));
    }

    #[tokio::test]
    async fn test_on_disk_sink() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let source = FakeSource::new(xhr_scenario());
        let options = CaptureOptions {
            produce_trace: true,
            produce_pdf: true,
            sink: OutputSink::OnDisk {
                directory: dir.path().to_path_buf(),
            },
            ..options()
        };

        let result = capturer()
            .capture(&source, &server.uri(), &options)
            .await
            .unwrap();

        let image = result.image.path().unwrap();
        let pdf = result.pdf.as_ref().and_then(Artifact::path).unwrap();
        let har = result.har.as_ref().and_then(Artifact::path).unwrap();

        assert_eq!(image.extension().unwrap(), "png");
        assert_eq!(pdf.extension().unwrap(), "pdf");
        assert_eq!(har.extension().unwrap(), "har");
        assert!(image.starts_with(dir.path()));

        let document: Har = serde_json::from_slice(&std::fs::read(har).unwrap()).unwrap();
        assert_eq!(document.log.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_keeps_input_order() {
        let server = MockServer::start().await;
        let source: Arc<dyn PageSource> = Arc::new(FakeSource::new(Scenario::default()));
        let progress = Arc::new(ProgressTracker::new(3));

        let processor = BatchProcessor::new(Arc::new(capturer()), source, 2)
            .with_progress(progress.clone());
        let urls = vec![
            format!("{}/a", server.uri()),
            "not a url".to_string(),
            format!("{}/b", server.uri()),
        ];

        let results = processor.process_urls(urls.clone(), &options()).await;

        assert_eq!(results.len(), 3);
        for ((url, _), expected) in results.iter().zip(&urls) {
            assert_eq!(url, expected);
        }
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(CaptureError::InvalidUrl(_))));
        assert!(results[2].1.is_ok());

        assert!(progress.is_complete());
        assert_eq!(progress.get_progress().errors, 1);
    }
}
