//! Rolling latency statistics.
//!
//! A fixed-capacity FIFO window over the most recent processing durations,
//! mutated concurrently by in-flight requests and read by the stats endpoint.
//! Plain ring-buffer semantics: oldest sample evicted at capacity, no
//! priority structure.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Default window capacity: the 100 most recent samples.
pub const DEFAULT_WINDOW_CAPACITY: usize = 100;

/// Aggregate statistics over the current window, in seconds.
///
/// All fields are zero when no samples have been recorded yet.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Mean processing time over the window.
    pub avg_time: f64,
    /// Fastest sample in the window.
    pub min_time: f64,
    /// Slowest sample in the window.
    pub max_time: f64,
    /// Number of samples currently in the window (≤ capacity).
    pub total_processed: usize,
}

/// Thread-safe bounded window of recent latency samples.
#[derive(Debug)]
pub struct LatencyWindow {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
}

impl LatencyWindow {
    /// Create a window holding at most `capacity` samples.
    ///
    /// A zero capacity is promoted to 1 so that `record` is never a no-op.
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    /// Append a sample, evicting the oldest when the window is full.
    pub fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        samples.push_back(sample);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// True when no samples have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute aggregate statistics over the current window.
    ///
    /// Returns a zeroed [`StatsSnapshot`] when the window is empty —
    /// never divides by zero.
    pub fn snapshot(&self) -> StatsSnapshot {
        let samples = self.samples.lock().unwrap_or_else(|p| p.into_inner());
        if samples.is_empty() {
            return StatsSnapshot::default();
        }

        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = 0.0_f64;
        for s in samples.iter() {
            let secs = s.as_secs_f64();
            sum += secs;
            min = min.min(secs);
            max = max.max(secs);
        }

        StatsSnapshot {
            avg_time: sum / samples.len() as f64,
            min_time: min,
            max_time: max,
            total_processed: samples.len(),
        }
    }
}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}
