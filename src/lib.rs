//! # detection-orchestrator
//!
//! An orchestration service for single-image object detection over Tokio.
//!
//! ## Architecture
//!
//! ```text
//! POST /detect ──► Orchestrator (blocking worker pool) ──► HTTP response
//!                         │
//!                         └──► background fan-out ──► Broadcaster (WebSocket)
//!                                                 └─► Publisher (MQTT "cam")
//! ```
//!
//! The detection engine itself is an external collaborator behind the
//! [`engine::DetectionEngine`] trait; this crate owns the request lifecycle,
//! the worker-offload model, subscriber fan-out, and the broker session.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod orchestrator;
pub mod publisher;
pub mod stats;
pub mod web_api;

// Re-exports for convenience
pub use broadcast::Broadcaster;
pub use engine::{DetectionEngine, JpegEngine, StaticEngine};
pub use orchestrator::InferenceOrchestrator;
pub use publisher::BrokerPublisher;

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///   for local development
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`DetectorError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), DetectorError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| DetectorError::Other(format!("tracing init failed: {e}")))
}

/// Top-level service errors.
///
/// Every error surface in the request and fan-out path maps to a variant
/// here. Request-path variants ([`DetectorError::Decode`],
/// [`DetectorError::Engine`], [`DetectorError::Busy`]) propagate to the HTTP
/// response; background-path variants ([`DetectorError::NotConnected`]) are
/// logged and metered but never surfaced to the HTTP caller.
#[derive(Error, Debug)]
pub enum DetectorError {
    /// The input image could not be decoded (malformed or truncated bytes).
    ///
    /// A client error — surfaced as HTTP 400.
    #[error("image decode failed: {0}")]
    Decode(String),

    /// The detection engine failed internally.
    ///
    /// A server error — surfaced as HTTP 500 with a sanitized message.
    #[error("detection engine failed: {0}")]
    Engine(String),

    /// The worker queue-depth cap is exceeded; the request was shed rather
    /// than queued. Only possible when a cap is configured.
    #[error("worker pool at capacity")]
    Busy,

    /// The broker session is not in the `Connected` state.
    ///
    /// Internal only: the background publish task logs and meters this,
    /// it never reaches the HTTP caller.
    #[error("broker not connected")]
    NotConnected,

    /// A worker task or internal channel shut down unexpectedly.
    #[error("worker channel closed unexpectedly")]
    Closed,

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so that misconfiguration surfaces
    /// immediately rather than at the first request.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// A single detection produced by the engine.
///
/// Serialized with the wire names `cls` / `conf` expected by existing
/// downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Class index reported by the engine (non-negative).
    pub cls: u32,
    /// Confidence score in `[0, 1]`.
    pub conf: f32,
}

/// The complete result of one detection request.
///
/// Created once per request by the orchestrator. The broadcaster and the
/// publisher each receive independent owned copies — there is no shared
/// mutable buffer between consumers.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Detections in engine output order (never re-sorted).
    pub detections: Vec<Detection>,
    /// Annotated frame, JPEG-encoded. Non-empty for every successful result.
    pub annotated_image: Vec<u8>,
    /// Wall-clock processing duration, including any queue wait.
    pub latency: Duration,
}

/// Generate a short request identifier for trace correlation.
///
/// A UUID v4 truncated to its first 8 hex characters — long enough to
/// correlate log lines within a process lifetime, short enough to read.
pub fn short_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id.chars().take(8).collect()
}
