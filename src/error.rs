use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Remote browser unreachable: {0}")]
    RemoteUnavailable(String),

    #[error("Page allocation failed: {0}")]
    PageAllocationFailed(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailed(String),

    #[error("Script evaluation failed: {0}")]
    ScriptFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Chrome error: {0}")]
    ChromeError(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl CaptureError {
    /// Whether the error aborts a whole capture.
    ///
    /// Everything else is absorbed by the pipeline and shows up as a missing
    /// artifact or trace entry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CaptureError::BrowserLaunchFailed(_)
                | CaptureError::RemoteUnavailable(_)
                | CaptureError::PageAllocationFailed(_)
                | CaptureError::NavigationFailed(_)
                | CaptureError::Timeout(_)
                | CaptureError::InvalidUrl(_)
                | CaptureError::ConfigurationError(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CaptureError::InvalidUrl(_) => ErrorSeverity::Low,
            CaptureError::ScriptFailed(_) => ErrorSeverity::Low,
            CaptureError::ConfigurationError(_) => ErrorSeverity::High,
            CaptureError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            CaptureError::RemoteUnavailable(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<AcquireError> for CaptureError {
    fn from(err: AcquireError) -> Self {
        CaptureError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CaptureError {
    fn from(err: serde_yaml::Error) -> Self {
        CaptureError::ConfigurationError(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        CaptureError::ChromeError(err.to_string())
    }
}

impl From<reqwest::Error> for CaptureError {
    fn from(err: reqwest::Error) -> Self {
        CaptureError::NetworkError(err.to_string())
    }
}

impl From<url::ParseError> for CaptureError {
    fn from(err: url::ParseError) -> Self {
        CaptureError::InvalidUrl(err.to_string())
    }
}
