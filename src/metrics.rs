use crate::CaptureError;
use metrics::{Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

/// Capture metrics
///
/// Handles are registered with whatever recorder is installed when the struct
/// is built. Without a recorder every update is a no-op.
pub struct Metrics {
    pub captures_completed: Counter,
    pub captures_failed: Counter,
    pub capture_duration: Histogram,
    pub trace_entries: Histogram,
    pub transferred_bytes: Counter,
    pub active_captures: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            captures_completed: metrics::register_counter!("page_capture_completed_total"),
            captures_failed: metrics::register_counter!("page_capture_failed_total"),
            capture_duration: metrics::register_histogram!("page_capture_duration_seconds"),
            trace_entries: metrics::register_histogram!("page_capture_trace_entries"),
            transferred_bytes: metrics::register_counter!("page_capture_transferred_bytes_total"),
            active_captures: metrics::register_gauge!("page_capture_active"),
        }
    }

    pub fn noop() -> Self {
        Self {
            captures_completed: Counter::noop(),
            captures_failed: Counter::noop(),
            capture_duration: Histogram::noop(),
            trace_entries: Histogram::noop(),
            transferred_bytes: Counter::noop(),
            active_captures: Gauge::noop(),
        }
    }

    pub fn capture_started(&self) {
        self.active_captures.increment(1.0);
    }

    pub fn record_capture(&self, duration: Duration, success: bool) {
        self.active_captures.decrement(1.0);
        if success {
            self.captures_completed.increment(1);
        } else {
            self.captures_failed.increment(1);
        }

        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_trace(&self, entries: usize) {
        self.trace_entries.record(entries as f64);
    }

    pub fn record_transferred(&self, bytes: u64) {
        self.transferred_bytes.increment(bytes);
    }

    /// Count a failure that was absorbed by the pipeline.
    pub fn record_degraded(&self, stage: &'static str) {
        metrics::increment_counter!("page_capture_degraded_total", "stage" => stage);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PrometheusExporter {
    addr: SocketAddr,
}

impl PrometheusExporter {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Install the global recorder and serve `/metrics` on the configured address.
    ///
    /// Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), CaptureError> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| CaptureError::ConfigurationError(format!("metrics exporter: {e}")))?;

        info!("Serving Prometheus metrics on {}", self.addr);
        Ok(())
    }
}
