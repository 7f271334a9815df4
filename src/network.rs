//! Network event correlation
//!
//! Every network observation of a page is sent over a channel to one
//! correlator task. That task is the only owner of the request and response
//! stores. For each "response received" it spawns a short-lived fetch of the
//! response body and the cookie jar, bounded by its own timeout and by the
//! capture deadline. [`Correlator::drain`] closes the event source and waits
//! for the task to finish.

use crate::{har, CaptureError, NetworkEvent, PageSession, ResponseMeta, SessionCookie};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Request side of a trace entry
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkRequestRecord {
    pub request_id: String,
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Query parameters in URL order; names may repeat
    pub query: Vec<(String, String)>,
}

impl NetworkRequestRecord {
    pub fn new(
        request_id: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
        headers: Vec<(String, String)>,
    ) -> Self {
        let url = url.into();
        let query = url::Url::parse(&url)
            .map(|parsed| {
                parsed
                    .query_pairs()
                    .filter(|(name, _)| !name.is_empty())
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            request_id: request_id.into(),
            method: method.into(),
            url,
            headers,
            query,
        }
    }
}

/// Response side of a trace entry, finalized after the body fetch
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponseRecord {
    pub status: i64,
    pub status_text: String,
    pub protocol: String,
    pub headers: Vec<(String, String)>,
    /// Cookies of the jar that apply to the response host
    pub cookies: Vec<SessionCookie>,
    pub mime_type: String,
    pub encoded_size: i64,
    pub body: Vec<u8>,
}

impl NetworkResponseRecord {
    pub fn new(meta: &ResponseMeta, jar: &[SessionCookie], body: Vec<u8>) -> Self {
        let host = url::Url::parse(&meta.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_default();

        Self {
            status: meta.status,
            status_text: har::status_text(meta.status, &meta.status_text),
            protocol: meta.protocol.clone(),
            headers: meta.headers.clone(),
            cookies: har::match_cookies(jar, &host),
            mime_type: meta.mime_type.clone(),
            encoded_size: meta.encoded_data_length as i64,
            body,
        }
    }
}

/// Everything the correlator learned about one page load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelatedLog {
    /// Request ids in order of their first "request will be sent"
    pub order: Vec<String>,
    pub requests: HashMap<String, NetworkRequestRecord>,
    pub responses: HashMap<String, NetworkResponseRecord>,
    pub transferred_bytes: u64,
}

impl CorrelatedLog {
    /// Request/response pairs in trace order. Ids missing a side are skipped.
    pub fn entries(&self) -> impl Iterator<Item = (&NetworkRequestRecord, &NetworkResponseRecord)> {
        self.order
            .iter()
            .filter_map(|id| Some((self.requests.get(id)?, self.responses.get(id)?)))
    }

    pub fn entry_count(&self) -> usize {
        self.entries().count()
    }

    fn record_request(&mut self, record: NetworkRequestRecord) {
        // A redirect reuses the request id and keeps the original position.
        if !self.requests.contains_key(&record.request_id) {
            self.order.push(record.request_id.clone());
        }
        self.requests.insert(record.request_id.clone(), record);
    }
}

/// Most events forwarded after a stop request.
pub const FLUSH_LIMIT: usize = 1024;

const YIELD_EVERY: usize = 64;

/// Tuning of one correlator
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorSettings {
    /// Fetch bodies and cookies for responses; off when no trace is wanted
    pub collect_responses: bool,
    pub fetch_timeout: Duration,
    /// Capture deadline; in-flight fetches are cancelled once it passes
    pub deadline: Instant,
}

/// Handle to the correlator task of one page
pub struct Correlator {
    sender: mpsc::UnboundedSender<NetworkEvent>,
    forwarder: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
    task: JoinHandle<CorrelatedLog>,
}

impl Correlator {
    pub fn spawn(session: Arc<dyn PageSession>, settings: CorrelatorSettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(receiver, session, settings));

        Self {
            sender,
            forwarder: None,
            task,
        }
    }

    /// Forward every event of `events` until the correlator is drained.
    ///
    /// A stop request wins over pending events. What the source has already
    /// buffered at that point is flushed, up to [`FLUSH_LIMIT`] events.
    pub fn listen(&mut self, mut events: BoxStream<'static, NetworkEvent>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let sender = self.sender.clone();

        let handle = tokio::spawn(async move {
            let mut forwarded = 0usize;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    event = events.next() => match event {
                        Some(event) => {
                            if sender.send(event).is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                }

                // An always-ready source must not monopolize the worker.
                forwarded += 1;
                if forwarded % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }

            for _ in 0..FLUSH_LIMIT {
                match events.next().now_or_never() {
                    Some(Some(event)) => {
                        if sender.send(event).is_err() {
                            return;
                        }
                    }
                    _ => return,
                }
            }
            debug!("Flush limit reached, dropping remaining network events");
        });

        self.forwarder = Some((stop_tx, handle));
    }

    pub fn on_request_started(
        &self,
        request_id: String,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
    ) {
        self.observe(NetworkEvent::RequestWillBeSent {
            request_id,
            method,
            url,
            headers,
        });
    }

    pub fn on_response_received(&self, request_id: String, response: ResponseMeta) {
        self.observe(NetworkEvent::ResponseReceived {
            request_id,
            response,
        });
    }

    pub fn on_data_received(&self, request_id: String, encoded_data_length: u64) {
        self.observe(NetworkEvent::DataReceived {
            request_id,
            encoded_data_length,
        });
    }

    pub fn observe(&self, event: NetworkEvent) {
        if self.sender.send(event).is_err() {
            debug!("Correlator already finished, dropping event");
        }
    }

    /// Stop listening and wait until every in-flight fetch has completed or
    /// been cancelled by the deadline.
    pub async fn drain(self) -> CorrelatedLog {
        let Correlator {
            sender,
            forwarder,
            task,
        } = self;

        if let Some((stop, handle)) = forwarder {
            let _ = stop.send(());
            if let Err(e) = handle.await {
                debug!("Event forwarder ended abnormally: {}", e);
            }
        }
        drop(sender);

        match task.await {
            Ok(log) => log,
            Err(e) => {
                warn!("Correlator task failed: {}", e);
                CorrelatedLog::default()
            }
        }
    }

    /// Tear the correlator down without waiting for in-flight fetches.
    pub fn abort(self) {
        if let Some((_, handle)) = &self.forwarder {
            handle.abort();
        }
        self.task.abort();
    }
}

async fn run(
    mut receiver: mpsc::UnboundedReceiver<NetworkEvent>,
    session: Arc<dyn PageSession>,
    settings: CorrelatorSettings,
) -> CorrelatedLog {
    let mut log = CorrelatedLog::default();
    let mut fetches: JoinSet<Option<(String, NetworkResponseRecord)>> = JoinSet::new();
    let mut open = true;
    let mut expired = false;

    let deadline = tokio::time::sleep_until(settings.deadline);
    tokio::pin!(deadline);

    while open || !fetches.is_empty() {
        tokio::select! {
            event = receiver.recv(), if open => match event {
                Some(NetworkEvent::RequestWillBeSent { request_id, method, url, headers }) => {
                    log.record_request(NetworkRequestRecord::new(request_id, method, url, headers));
                }
                Some(NetworkEvent::ResponseReceived { request_id, response }) => {
                    if settings.collect_responses && !expired {
                        let fetch_deadline = (Instant::now() + settings.fetch_timeout).min(settings.deadline);
                        fetches.spawn(fetch_response(session.clone(), request_id, response, fetch_deadline));
                    }
                }
                Some(NetworkEvent::DataReceived { encoded_data_length, .. }) => {
                    log.transferred_bytes += encoded_data_length;
                }
                None => open = false,
            },
            Some(joined) = fetches.join_next(), if !fetches.is_empty() => match joined {
                Ok(Some((request_id, record))) => {
                    log.responses.insert(request_id, record);
                }
                Ok(None) => {}
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Response fetch panicked: {}", e),
            },
            _ = &mut deadline, if !expired => {
                expired = true;
                if !fetches.is_empty() {
                    debug!("Deadline reached, cancelling {} response fetches", fetches.len());
                }
                fetches.abort_all();
            }
        }
    }

    log
}

async fn fetch_response(
    session: Arc<dyn PageSession>,
    request_id: String,
    meta: ResponseMeta,
    deadline: Instant,
) -> Option<(String, NetworkResponseRecord)> {
    let fetched = tokio::time::timeout_at(deadline, async {
        let body = session.response_body(&request_id).await?;
        let jar = session.all_cookies().await?;
        Ok::<_, CaptureError>((body, jar))
    })
    .await;

    match fetched {
        Ok(Ok((body, jar))) => {
            let record = NetworkResponseRecord::new(&meta, &jar, body);
            Some((request_id, record))
        }
        Ok(Err(e)) => {
            debug!("Dropping response {} ({}): {}", request_id, meta.url, e);
            None
        }
        Err(_) => {
            debug!("Response fetch for {} ({}) timed out", request_id, meta.url);
            None
        }
    }
}
