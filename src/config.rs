//! Service configuration.
//!
//! Loaded from a TOML file, from the environment, or both (environment
//! overrides file values). Every field has a documented default; the config
//! is validated before the service starts so misconfiguration fails fast.
//!
//! ## Environment Variables
//!
//! - `DETECTOR_HOST` / `DETECTOR_PORT` — HTTP bind address
//! - `DETECTOR_WORKERS` — blocking worker pool size
//! - `DETECTOR_MAX_QUEUE_DEPTH` — optional in-flight request cap
//! - `BROKER_URL` — broker endpoint (e.g. `mqtt://broker:1883`); unset
//!   disables broker publishing entirely

use crate::DetectorError;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

/// Default bind host: all interfaces.
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default HTTP port.
fn default_port() -> u16 {
    8000
}

/// Default worker-pool size for CPU-bound inference.
fn default_workers() -> usize {
    crate::orchestrator::DEFAULT_WORKERS
}

/// Default latency window capacity.
fn default_latency_window() -> usize {
    crate::stats::DEFAULT_WINDOW_CAPACITY
}

/// Default broker routing key.
fn default_routing_key() -> String {
    crate::publisher::DEFAULT_ROUTING_KEY.to_string()
}

/// Default maximum upload size: 10 MB.
fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

// ── Config ───────────────────────────────────────────────────────────────

/// Root configuration for the detection service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    /// IP address or hostname to bind the HTTP server to.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port the HTTP server listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of concurrent blocking inference workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Optional cap on in-flight requests (queued plus running). Unset
    /// means backpressure is expressed purely as latency.
    #[serde(default)]
    pub max_queue_depth: Option<usize>,
    /// Capacity of the rolling latency window.
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    /// Broker endpoint URL. `None` disables broker publishing.
    #[serde(default)]
    pub broker_url: Option<String>,
    /// Routing key for outgoing broker messages.
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    /// Maximum allowed upload body size in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            max_queue_depth: None,
            latency_window: default_latency_window(),
            broker_url: None,
            routing_key: default_routing_key(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl ServiceConfig {
    /// Parse a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Config`] on malformed TOML or unknown
    /// field types.
    pub fn from_toml(text: &str) -> Result<Self, DetectorError> {
        toml::from_str(text).map_err(|e| DetectorError::Config(format!("invalid config: {e}")))
    }

    /// Load a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Config`] when the file cannot be read or
    /// parsed.
    pub fn load(path: &std::path::Path) -> Result<Self, DetectorError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DetectorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Apply environment-variable overrides on top of `self`.
    ///
    /// Unparseable numeric values are ignored (the existing value wins)
    /// rather than failing startup.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("DETECTOR_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("DETECTOR_PORT") {
            if let Ok(port) = port.parse() {
                self.port = port;
            }
        }
        if let Ok(workers) = std::env::var("DETECTOR_WORKERS") {
            if let Ok(workers) = workers.parse() {
                self.workers = workers;
            }
        }
        if let Ok(depth) = std::env::var("DETECTOR_MAX_QUEUE_DEPTH") {
            if let Ok(depth) = depth.parse() {
                self.max_queue_depth = Some(depth);
            }
        }
        if let Ok(url) = std::env::var("BROKER_URL") {
            if !url.is_empty() {
                self.broker_url = Some(url);
            }
        }
        self
    }

    /// Build the effective startup configuration: defaults plus environment
    /// overrides.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Check semantic constraints.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Config`] naming the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), DetectorError> {
        if self.workers == 0 {
            return Err(DetectorError::Config(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.latency_window == 0 {
            return Err(DetectorError::Config(
                "latency_window must be at least 1".to_string(),
            ));
        }
        if self.max_queue_depth == Some(0) {
            return Err(DetectorError::Config(
                "max_queue_depth must be at least 1 when set".to_string(),
            ));
        }
        if self.routing_key.is_empty() {
            return Err(DetectorError::Config(
                "routing_key must not be empty".to_string(),
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(DetectorError::Config(
                "max_upload_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
