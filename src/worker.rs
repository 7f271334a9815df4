use crate::{CaptureError, CaptureOptions, CaptureResult, Capturer, PageSource};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Captures several URLs at once against one page source
pub struct BatchProcessor {
    capturer: Arc<Capturer>,
    source: Arc<dyn PageSource>,
    limiter: Arc<Semaphore>,
    progress: Option<Arc<ProgressTracker>>,
}

impl BatchProcessor {
    pub fn new(capturer: Arc<Capturer>, source: Arc<dyn PageSource>, max_concurrent: usize) -> Self {
        Self {
            capturer,
            source,
            limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<ProgressTracker>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Capture every URL; results come back in input order.
    pub async fn process_urls(
        &self,
        urls: Vec<String>,
        options: &CaptureOptions,
    ) -> Vec<(String, Result<CaptureResult, CaptureError>)> {
        let total = urls.len();
        info!("Processing batch of {} URLs", total);

        let options = Arc::new(options.clone());
        let mut tasks = JoinSet::new();

        for (index, url) in urls.iter().cloned().enumerate() {
            let capturer = self.capturer.clone();
            let source = self.source.clone();
            let limiter = self.limiter.clone();
            let options = options.clone();
            let progress = self.progress.clone();

            tasks.spawn(async move {
                let result = match limiter.acquire_owned().await {
                    Ok(_permit) => capturer.capture(source.as_ref(), &url, &options).await,
                    Err(e) => Err(CaptureError::from(e)),
                };
                if let Some(progress) = progress {
                    progress.record_completion(result.is_ok());
                }
                debug!("Finished {} ({}/{})", url, index + 1, total);
                (index, result)
            });
        }

        let mut slots: Vec<Option<Result<CaptureResult, CaptureError>>> =
            (0..total).map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => error!("Capture task failed: {}", e),
            }
        }

        let results: Vec<_> = urls
            .into_iter()
            .zip(slots)
            .map(|(url, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(CaptureError::CaptureFailed("capture task aborted".to_string()))
                });
                (url, result)
            })
            .collect();

        info!(
            "Batch processing completed. Captured: {}, Errors: {}",
            results.iter().filter(|(_, r)| r.is_ok()).count(),
            results.iter().filter(|(_, r)| r.is_err()).count()
        );

        results
    }
}

pub struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    errors: AtomicUsize,
    start_time: std::time::Instant,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: AtomicUsize::new(0),
            errors: AtomicUsize::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn record_completion(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get_progress(&self) -> ProgressInfo {
        let completed = self.completed.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed();
        let rate = if elapsed.as_secs_f64() > 0.0 {
            completed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        ProgressInfo {
            total: self.total,
            completed,
            errors,
            success: completed.saturating_sub(errors),
            elapsed,
            rate,
            eta: if completed > 0 && rate > 0.0 {
                let remaining = self.total.saturating_sub(completed);
                Some(Duration::from_secs_f64(remaining as f64 / rate))
            } else {
                None
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Relaxed) >= self.total
    }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
    pub total: usize,
    pub completed: usize,
    pub errors: usize,
    pub success: usize,
    pub elapsed: Duration,
    pub rate: f64,
    pub eta: Option<Duration>,
}
