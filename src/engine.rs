//! Detection engine abstraction and implementations.
//!
//! The engine is an external collaborator: a stateless-per-call function
//! from raw image bytes to a list of detections plus an annotated JPEG.
//! Implementations here cover the codec boundary and testing:
//!
//! - [`JpegEngine`]: decodes the upload and re-encodes it as JPEG without
//!   producing detections — the "engine found nothing" path, and the stand-in
//!   used when no model backend is wired in.
//! - [`StaticEngine`]: returns a configured detection list after an optional
//!   simulated delay. Useful for pipeline smoke tests without a model.
//!
//! Engines are invoked from blocking worker threads (never from the reactor),
//! so `detect` is a plain synchronous call. Implementations must be
//! `Send + Sync`: a single instance is shared read-only across the pool.

use crate::Detection;
use image::DynamicImage;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by a detection engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The input bytes are not a decodable image.
    #[error("cannot decode input image: {0}")]
    Decode(String),

    /// Any other engine-internal fault (model failure, encode failure, ...).
    #[error("{0}")]
    Internal(String),
}

/// Output of one engine invocation.
///
/// `detections` preserves engine output order. `annotated_image` is always a
/// complete JPEG buffer when the call succeeds — decode failures are errors,
/// never an empty buffer paired with detections.
#[derive(Debug, Clone)]
pub struct EngineOutput {
    /// Detections in engine output order.
    pub detections: Vec<Detection>,
    /// Annotated frame, JPEG-encoded.
    pub annotated_image: Vec<u8>,
}

/// Trait for detection engines.
///
/// Implementations must be thread-safe (`Send + Sync`) for read-only sharing
/// across the worker pool. The trait is object-safe to allow dynamic dispatch
/// via `Arc<dyn DetectionEngine>`.
pub trait DetectionEngine: Send + Sync {
    /// Run detection on raw image bytes.
    ///
    /// Called from a blocking worker thread; implementations may burn CPU
    /// freely but must not touch the async runtime.
    ///
    /// # Errors
    ///
    /// [`EngineError::Decode`] when the input is not a decodable image,
    /// [`EngineError::Internal`] for any other engine fault.
    fn detect(&self, image: &[u8]) -> Result<EngineOutput, EngineError>;
}

/// Encode a decoded frame as JPEG at the given quality.
///
/// Frames are converted to RGB first; JPEG has no alpha channel.
///
/// # Errors
///
/// Returns [`EngineError::Internal`] if the encoder fails.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, EngineError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    encoder
        .encode_image(&rgb)
        .map_err(|e| EngineError::Internal(format!("jpeg encode failed: {e}")))?;
    Ok(buf)
}

// ============================================================================
// JPEG passthrough engine
// ============================================================================

/// Codec-backed passthrough engine.
///
/// Decodes the input with the `image` crate and re-encodes the unmodified
/// frame as JPEG (default quality 70, matching the service's historic
/// output). Produces zero detections — the annotated image for an empty
/// detection set is the re-encoded source frame.
#[derive(Debug, Clone)]
pub struct JpegEngine {
    /// JPEG re-encode quality (1-100).
    pub quality: u8,
}

impl JpegEngine {
    /// Create a passthrough engine with the given re-encode quality.
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl Default for JpegEngine {
    fn default() -> Self {
        Self { quality: 70 }
    }
}

impl DetectionEngine for JpegEngine {
    fn detect(&self, image: &[u8]) -> Result<EngineOutput, EngineError> {
        let decoded =
            image::load_from_memory(image).map_err(|e| EngineError::Decode(e.to_string()))?;
        let annotated_image = encode_jpeg(&decoded, self.quality)?;
        Ok(EngineOutput {
            detections: Vec::new(),
            annotated_image,
        })
    }
}

// ============================================================================
// Static engine (testing / demo)
// ============================================================================

/// Engine returning a fixed detection list and annotated buffer.
///
/// Sleeps for the configured delay on the worker thread to simulate
/// CPU-bound inference time, so latency-window tests see non-zero samples.
#[derive(Debug, Clone)]
pub struct StaticEngine {
    detections: Vec<Detection>,
    annotated_image: Vec<u8>,
    delay: Duration,
}

impl StaticEngine {
    /// Create an engine that reports no detections and a 1-byte annotated
    /// buffer.
    pub fn new() -> Self {
        Self {
            detections: Vec::new(),
            annotated_image: vec![0xFF],
            delay: Duration::from_millis(1),
        }
    }

    /// Set the detections every call returns.
    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }

    /// Set the annotated buffer every call returns.
    pub fn with_annotated_image(mut self, annotated_image: Vec<u8>) -> Self {
        self.annotated_image = annotated_image;
        self
    }

    /// Set the simulated per-call inference delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl Default for StaticEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionEngine for StaticEngine {
    fn detect(&self, image: &[u8]) -> Result<EngineOutput, EngineError> {
        if image.is_empty() {
            return Err(EngineError::Decode("empty input".to_string()));
        }
        if !self.delay.is_zero() {
            // Runs on a blocking worker thread, not the reactor.
            std::thread::sleep(self.delay);
        }
        Ok(EngineOutput {
            detections: self.detections.clone(),
            annotated_image: self.annotated_image.clone(),
        })
    }
}
