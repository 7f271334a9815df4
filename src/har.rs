//! HAR 1.2 trace documents
//!
//! [`compose`] turns a [`CorrelatedLog`] into a serialized HTTP Archive. It is
//! a pure function of its inputs: the capture start time is passed in, so
//! identical inputs give byte-identical documents.

use crate::{
    CaptureError, CorrelatedLog, NetworkRequestRecord, NetworkResponseRecord, SessionCookie,
};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Id of the single page every entry refers to
pub const PAGE_ID: &str = "page_1";

pub const HAR_VERSION: &str = "1.2";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Har {
    pub log: Log,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    pub pages: Vec<Page>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
    pub comment: String,
}

impl Default for Creator {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            comment: "web page capture".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: String,
    pub title: String,
    pub started_date_time: String,
    pub page_timings: PageTimings,
}

/// `-1` marks a timing that was not measured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTimings {
    pub on_content_load: i64,
    pub on_load: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub pageref: String,
    pub started_date_time: String,
    pub time: f64,
    pub request: Request,
    pub response: Response,
    pub cache: Cache,
    pub timings: Timings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cache {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<NameValue>,
    pub query_string: Vec<NameValue>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: i64,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<NameValue>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub http_only: bool,
    pub secure: bool,
}

/// Status text for a response: the canonical reason phrase when the status
/// code has one, the browser-reported text otherwise.
pub fn status_text(status: i64, reported: &str) -> String {
    u16::try_from(status)
        .ok()
        .and_then(|code| reqwest::StatusCode::from_u16(code).ok())
        .and_then(|code| code.canonical_reason())
        .map(str::to_string)
        .unwrap_or_else(|| reported.to_string())
}

/// Cookies of `jar` that apply to `host`.
///
/// A cookie applies when its domain, without a leading dot, equals the host
/// or is a dot-separated suffix of it.
pub fn match_cookies(jar: &[SessionCookie], host: &str) -> Vec<SessionCookie> {
    let host = host.to_ascii_lowercase();
    jar.iter()
        .filter(|cookie| {
            let domain = cookie.domain.trim_start_matches('.').to_ascii_lowercase();
            !domain.is_empty()
                && (host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .is_some_and(|rest| rest.ends_with('.')))
        })
        .cloned()
        .collect()
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn name_values(pairs: &[(String, String)]) -> Vec<NameValue> {
    pairs
        .iter()
        .map(|(name, value)| NameValue {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn har_cookie(cookie: &SessionCookie) -> Cookie {
    let expires = (cookie.expires > 0.0)
        .then(|| {
            let seconds = cookie.expires.trunc() as i64;
            let nanos = (cookie.expires.fract() * 1e9) as u32;
            Utc.timestamp_opt(seconds, nanos).single()
        })
        .flatten()
        .map(timestamp);

    Cookie {
        name: cookie.name.clone(),
        value: cookie.value.clone(),
        path: cookie.path.clone(),
        domain: cookie.domain.clone(),
        expires,
        http_only: cookie.http_only,
        secure: cookie.secure,
    }
}

fn entry(
    request: &NetworkRequestRecord,
    response: &NetworkResponseRecord,
    started: &str,
) -> Entry {
    let text = (!response.body.is_empty())
        .then(|| base64::engine::general_purpose::STANDARD.encode(&response.body));
    let encoding = text.as_ref().map(|_| "base64".to_string());

    Entry {
        pageref: PAGE_ID.to_string(),
        started_date_time: started.to_string(),
        time: 0.0,
        request: Request {
            method: request.method.clone(),
            url: request.url.clone(),
            http_version: response.protocol.clone(),
            cookies: Vec::new(),
            headers: name_values(&request.headers),
            query_string: name_values(&request.query),
            headers_size: -1,
            body_size: -1,
        },
        response: Response {
            status: response.status,
            status_text: response.status_text.clone(),
            http_version: response.protocol.clone(),
            cookies: response.cookies.iter().map(har_cookie).collect(),
            headers: name_values(&response.headers),
            content: Content {
                size: response.encoded_size,
                mime_type: response.mime_type.clone(),
                text,
                encoding,
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
        },
        cache: Cache::default(),
        timings: Timings::default(),
    }
}

/// Build the trace document of one capture.
pub fn build(log: &CorrelatedLog, page_url: &str, started: DateTime<Utc>) -> Har {
    let started = timestamp(started);
    let entries = log
        .entries()
        .map(|(request, response)| entry(request, response, &started))
        .collect();

    Har {
        log: Log {
            version: HAR_VERSION.to_string(),
            creator: Creator::default(),
            pages: vec![Page {
                id: PAGE_ID.to_string(),
                title: page_url.to_string(),
                started_date_time: started,
                page_timings: PageTimings {
                    on_content_load: -1,
                    on_load: -1,
                },
            }],
            entries,
        },
    }
}

/// Serialize the trace document of one capture as pretty-printed JSON.
pub fn compose(
    log: &CorrelatedLog,
    page_url: &str,
    started: DateTime<Utc>,
) -> Result<Vec<u8>, CaptureError> {
    Ok(serde_json::to_vec_pretty(&build(log, page_url, started))?)
}
