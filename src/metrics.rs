//! Prometheus metrics for the detection service.
//!
//! Call [`init_metrics`] once at process startup. Every helper is a no-op if
//! `init_metrics` was never called, so the service always runs — observability
//! simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `detector_requests_total` | Counter | `stage` |
//! | `detector_errors_total` | Counter | `stage`, `err_type` |
//! | `detector_stage_duration_seconds` | Histogram | `stage` |
//! | `detector_frames_dropped_total` | Counter | `stage` |
//! | `detector_active_subscribers` | Gauge | — |
//!
//! Stages: `detect` (orchestrator), `broadcast` (subscriber fan-out),
//! `publish` (broker).

use crate::DetectorError;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

/// All Prometheus metrics for the service, bundled so they can be stored in
/// a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Total requests processed per stage.
    pub requests_total: CounterVec,
    /// Errors by stage and error type.
    pub errors_total: CounterVec,
    /// Stage processing latency histogram.
    pub stage_duration: HistogramVec,
    /// Frames dropped for slow subscribers, per stage.
    pub frames_dropped: CounterVec,
    /// Number of currently connected live subscribers.
    pub active_subscribers: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private
/// registry.
///
/// Must be called once at process startup. Calling it a second time is a
/// no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`DetectorError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
pub fn init_metrics() -> Result<(), DetectorError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let requests_total = CounterVec::new(
        Opts::new("detector_requests_total", "Total requests processed"),
        &["stage"],
    )
    .map_err(|e| DetectorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(requests_total.clone()))
        .map_err(|e| DetectorError::Other(format!("metrics registration failed: {e}")))?;

    let errors_total = CounterVec::new(
        Opts::new("detector_errors_total", "Errors by stage and type"),
        &["stage", "err_type"],
    )
    .map_err(|e| DetectorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(errors_total.clone()))
        .map_err(|e| DetectorError::Other(format!("metrics registration failed: {e}")))?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "detector_stage_duration_seconds",
            "Processing duration per stage",
        ),
        &["stage"],
    )
    .map_err(|e| DetectorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(stage_duration.clone()))
        .map_err(|e| DetectorError::Other(format!("metrics registration failed: {e}")))?;

    let frames_dropped = CounterVec::new(
        Opts::new(
            "detector_frames_dropped_total",
            "Frames dropped for lagging subscribers",
        ),
        &["stage"],
    )
    .map_err(|e| DetectorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(frames_dropped.clone()))
        .map_err(|e| DetectorError::Other(format!("metrics registration failed: {e}")))?;

    let active_subscribers = IntGauge::new(
        "detector_active_subscribers",
        "Currently connected live subscribers",
    )
    .map_err(|e| DetectorError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(active_subscribers.clone()))
        .map_err(|e| DetectorError::Other(format!("metrics registration failed: {e}")))?;

    // If another thread raced us, the first one wins — both initializations
    // produce identical metric descriptors, so neither outcome is incorrect.
    let _ = METRICS.set(Metrics {
        registry,
        requests_total,
        errors_total,
        stage_duration,
        frames_dropped,
        active_subscribers,
    });

    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record the processing latency for a stage.
///
/// No-op if metrics have not been initialised.
pub fn record_stage_latency(stage: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.stage_duration.get_metric_with_label_values(&[stage]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Increment the request counter for a stage.
///
/// No-op if metrics have not been initialised.
pub fn inc_request(stage: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.requests_total.get_metric_with_label_values(&[stage]) {
            c.inc();
        }
    }
}

/// Increment the error counter for a stage and error type.
///
/// No-op if metrics have not been initialised.
pub fn inc_error(stage: &str, err_type: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .errors_total
            .get_metric_with_label_values(&[stage, err_type])
        {
            c.inc();
        }
    }
}

/// Increment the dropped-frame counter for a stage.
///
/// No-op if metrics have not been initialised.
pub fn inc_dropped_frame(stage: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.frames_dropped.get_metric_with_label_values(&[stage]) {
            c.inc();
        }
    }
}

/// Set the live-subscriber gauge.
///
/// No-op if metrics have not been initialised.
pub fn set_active_subscribers(count: i64) {
    if let Some(m) = metrics() {
        m.active_subscribers.set(count);
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails. Observability degrades gracefully rather than panicking.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
