use std::time::Duration;
use url::Url;

/// Prefix that wraps a document URL into the hosted document viewer.
pub const VIEWER_ENDPOINT: &str = "https://docs.google.com/viewer?url=";

/// Content types browsers download instead of rendering.
const VIEWER_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-powerpoint",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

/// Media type of a `Content-Type` header value, parameters stripped.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub fn needs_viewer(content_type: &str) -> bool {
    VIEWER_CONTENT_TYPES.contains(&media_type(content_type).as_str())
}

/// HEAD-probe `url` and report its content type.
///
/// Any failure (timeout, connection refused, missing header) yields `None`.
pub async fn probe_content_type(
    client: &reqwest::Client,
    url: &Url,
    timeout: Duration,
) -> Option<String> {
    let response = match client.head(url.as_str()).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Content type probe for {} failed: {}", url, e);
            return None;
        }
    };

    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Navigation target for `url`: documents are routed through the viewer.
///
/// The HEAD request gives up at `timeout` or at `deadline`, whichever comes first,
/// and the URL is then used as is.
pub async fn viewer_target(
    client: &reqwest::Client,
    url: &Url,
    timeout: Duration,
    deadline: tokio::time::Instant,
) -> String {
    let budget = timeout.min(deadline.saturating_duration_since(tokio::time::Instant::now()));
    let content_type =
        tokio::time::timeout_at(deadline, probe_content_type(client, url, budget)).await;

    match content_type.ok().flatten() {
        Some(content_type) if needs_viewer(&content_type) => {
            tracing::debug!("Opening {} ({}) through the document viewer", url, content_type);
            format!("{VIEWER_ENDPOINT}{url}")
        }
        _ => url.to_string(),
    }
}

/// Undo [`viewer_target`].
pub fn revert_viewer_url(link: &str) -> String {
    link.replacen(VIEWER_ENDPOINT, "", 1)
}

/// File extension for artifact bytes, judged by their content.
pub fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    if let Ok(format) = image::guess_format(bytes) {
        return match format {
            image::ImageFormat::Png => Some("png"),
            image::ImageFormat::Jpeg => Some("jpg"),
            image::ImageFormat::WebP => Some("webp"),
            image::ImageFormat::Gif => Some("gif"),
            _ => None,
        };
    }

    if bytes.starts_with(b"%PDF") {
        return Some("pdf");
    }

    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_ascii_lowercase();
    let head = head.trim_start();
    if head.starts_with('{') {
        Some("har")
    } else if head.starts_with("<!doctype html") || head.starts_with("<html") {
        Some("html")
    } else {
        None
    }
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '&' | '=' | '#' | '%' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// Base file name for artifacts of `url`: host and path, sanitized, followed
/// by a short digest of the full URL so scheme or sanitizing collisions
/// still get distinct names.
pub fn artifact_basename(url: &str) -> String {
    let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, url.as_bytes())
        .simple()
        .to_string();
    format!("{}_{}", readable_basename(url), &digest[..8])
}

fn readable_basename(url: &str) -> String {
    let stripped = match Url::parse(url) {
        Ok(parsed) => {
            let mut name = parsed.host_str().unwrap_or_default().to_string();
            name.push_str(parsed.path());
            if let Some(query) = parsed.query() {
                name.push('_');
                name.push_str(query);
            }
            name
        }
        Err(_) => url.to_string(),
    };

    let sanitized = sanitize_filename(&stripped);
    if sanitized.is_empty() {
        "capture".to_string()
    } else {
        sanitized.chars().take(200).collect()
    }
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn validate_url(url: &str) -> Result<Url, crate::CaptureError> {
    let parsed = Url::parse(url)?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(crate::CaptureError::InvalidUrl(format!(
            "unsupported scheme {scheme} in {url}"
        ))),
    }
}

/// Registrable domain (eTLD+1) of a host name.
pub fn registrable_domain(host: &str) -> Option<String> {
    psl::domain_str(&host.to_ascii_lowercase()).map(str::to_string)
}
