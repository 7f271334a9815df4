//! # Page Capture
//!
//! Captures web pages through a headless Chrome session driven over the
//! DevTools protocol. One capture produces a screenshot and, on request, the
//! rendered HTML, a PDF and an HTTP Archive (HAR) of the network traffic
//! recorded while the page loaded.
//!
//! ## Features
//!
//! - **Launch or attach**: runs a local Chrome with a throwaway profile, or
//!   attaches to a remote debugging endpoint
//! - **Network correlation**: requests, responses and cookies are matched by
//!   request id into a HAR 1.2 document
//! - **One deadline**: every step of a capture shares the same deadline
//! - **Degraded artifacts**: only navigation, the screenshot and the deadline
//!   are fatal, everything else is reported as a missing artifact
//! - **Concurrent processing**: semaphore-bounded batch capture
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page_capture::{CaptureService, Config, Metrics};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.capture.produce_trace = true;
//!
//!     let service = CaptureService::new(config, Arc::new(Metrics::noop())).await?;
//!     let capture = service.capture("https://example.com").await?;
//!     println!("{}: {:?}", capture.title, capture.har.is_some());
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! page-capture --pdf --har --output captures/ https://example.org/ https://example.com/
//! page-capture --remote-addr 127.0.0.1:9222 --cookies cookies.yaml https://example.com/
//! ```

/// Configuration, option sets and cookie import
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Browser session and the page abstraction the pipeline runs against
pub mod session;

/// DevTools protocol implementation of a page session
pub mod cdp;

/// Network event correlation
pub mod network;

/// HTTP Archive model and trace composition
pub mod har;

/// The capture pipeline
pub mod capture;

/// Artifact storage
pub mod sink;

/// Scripts evaluated inside captured pages
pub mod scripts;

/// Batch capture with bounded concurrency
pub mod worker;

/// Command-line interface implementation
pub mod cli;

/// Capture metrics and the Prometheus exporter
pub mod metrics;

/// Utility functions and helpers
pub mod utils;

#[cfg(test)]
mod tests;

pub use self::metrics::{Metrics, PrometheusExporter};
pub use capture::*;
pub use cdp::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use network::*;
pub use session::*;
pub use sink::*;
pub use worker::*;
