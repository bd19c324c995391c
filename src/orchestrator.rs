//! Inference orchestrator: bounded worker-pool offload for CPU-bound
//! detection.
//!
//! The orchestrator owns a semaphore-gated pool of blocking workers. A
//! submitted request waits for a permit (backpressure is expressed as
//! latency, not rejection), runs the engine on a blocking thread so the
//! reactor is never stalled, and records the observed wall-clock latency in
//! the rolling window on success.
//!
//! An optional queue-depth cap turns sustained overload into fast
//! [`DetectorError::Busy`] failures instead of unbounded memory growth;
//! it is disabled by default.

use crate::engine::{DetectionEngine, EngineError};
use crate::stats::{LatencyWindow, StatsSnapshot};
use crate::{metrics, DetectionResult, DetectorError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::warn;

/// Stage label used for metrics emitted by the orchestrator.
const STAGE: &str = "detect";

/// Default worker-pool size. Inference is CPU-bound; small and fixed.
pub const DEFAULT_WORKERS: usize = 4;

/// Orchestrates detection requests over a bounded blocking-worker pool.
///
/// One instance is constructed at startup and shared behind an `Arc` by all
/// request handlers. The engine is shared read-only across workers.
pub struct InferenceOrchestrator {
    engine: Arc<dyn DetectionEngine>,
    permits: Arc<Semaphore>,
    pending: AtomicUsize,
    max_queue_depth: Option<usize>,
    window: LatencyWindow,
}

/// Decrements the pending-request counter when the request leaves `submit`,
/// on every exit path.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl InferenceOrchestrator {
    /// Create an orchestrator with `workers` concurrent blocking workers and
    /// a latency window of `window_capacity` samples.
    ///
    /// `workers` is clamped to at least 1.
    pub fn new(engine: Arc<dyn DetectionEngine>, workers: usize, window_capacity: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            pending: AtomicUsize::new(0),
            max_queue_depth: None,
            window: LatencyWindow::new(window_capacity),
        }
    }

    /// Cap the number of requests allowed to be in flight (queued plus
    /// running). Past the cap, `submit` fails fast with
    /// [`DetectorError::Busy`].
    pub fn with_queue_cap(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = Some(max_queue_depth);
        self
    }

    /// Run detection on `image`, off the calling task's thread.
    ///
    /// Waits for a free worker (queueing under load), runs the engine on the
    /// blocking pool, and records the observed latency — queue wait included
    /// — on success.
    ///
    /// # Errors
    ///
    /// - [`DetectorError::Decode`] when the engine cannot decode the input.
    /// - [`DetectorError::Engine`] for any other engine fault, including a
    ///   worker thread that died mid-call.
    /// - [`DetectorError::Busy`] when a queue cap is configured and exceeded.
    /// - [`DetectorError::Closed`] if the pool has been shut down.
    pub async fn submit(&self, image: Vec<u8>) -> Result<DetectionResult, DetectorError> {
        // Admission and increment are one atomic step, so racing
        // submissions can never push the in-flight count past the cap.
        if let Some(cap) = self.max_queue_depth {
            let admitted = self
                .pending
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                    (n < cap).then_some(n + 1)
                });
            if admitted.is_err() {
                metrics::inc_error(STAGE, "busy");
                return Err(DetectorError::Busy);
            }
        } else {
            self.pending.fetch_add(1, Ordering::Relaxed);
        }
        let _pending = PendingGuard(&self.pending);

        metrics::inc_request(STAGE);
        let start = Instant::now();

        // Queue for a worker; the clock is already running, so queue wait
        // shows up in the latency window.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DetectorError::Closed)?;

        let engine = Arc::clone(&self.engine);
        let output = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.detect(&image)
        })
        .await
        .map_err(|e| {
            metrics::inc_error(STAGE, "worker_died");
            DetectorError::Engine(format!("worker task failed: {e}"))
        })?;

        let output = match output {
            Ok(out) => out,
            Err(EngineError::Decode(msg)) => {
                metrics::inc_error(STAGE, "decode");
                return Err(DetectorError::Decode(msg));
            }
            Err(EngineError::Internal(msg)) => {
                metrics::inc_error(STAGE, "engine");
                warn!(error = %msg, "detection engine failed");
                return Err(DetectorError::Engine(msg));
            }
        };

        let latency = start.elapsed();
        self.window.record(latency);
        metrics::record_stage_latency(STAGE, latency);

        Ok(DetectionResult {
            detections: output.detections,
            annotated_image: output.annotated_image,
            latency,
        })
    }

    /// Aggregate statistics over the rolling latency window.
    ///
    /// Zero-valued when nothing has been processed yet.
    pub fn stats(&self) -> StatsSnapshot {
        self.window.snapshot()
    }
}
