//! Subscriber broadcaster: fan-out of detection frames to live WebSocket
//! subscribers.
//!
//! Each subscriber owns its socket in its own task and drains a bounded
//! per-connection channel (single-writer discipline — `deliver` never touches
//! a socket). Delivery is best-effort and isolated:
//!
//! - a full channel means the subscriber is slow; the frame is dropped for
//!   that subscriber only (never backpressure on the producer),
//! - a closed channel means the subscriber is gone; it is unregistered after
//!   the delivery pass completes,
//! - one subscriber's failure never affects delivery to the others.
//!
//! The registry is a concurrent map; register/unregister/deliver may race
//! freely, and unregistering an already-removed subscriber is a no-op.

use crate::{metrics, Detection};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stage label used for metrics emitted by the broadcaster.
const STAGE: &str = "broadcast";

/// At most one undelivered frame is buffered per connection; a slower
/// consumer sees dropped frames, not a growing backlog. The slot is a
/// hand-off, not a queue: when it is occupied the *incoming* frame is the
/// one discarded, and a consumer that catches up drains the older buffered
/// frame first.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 1;

/// Unique identity of one live subscriber connection.
pub type SubscriberId = u64;

/// JSON frame pushed to every live subscriber on each completed detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    /// Identifier of the device that submitted the image.
    pub prototype_id: String,
    /// Structured detections, engine output order.
    pub detections: Vec<Detection>,
    /// Annotated frame, base64-encoded JPEG.
    pub image: String,
    /// Client-supplied or server-assigned timestamp, stringified epoch.
    pub timestamp: String,
}

/// Registry of live subscribers and the fan-out protocol over them.
///
/// One instance is constructed at startup and shared behind an `Arc` by the
/// WebSocket handler (register/unregister) and the background fan-out tasks
/// (deliver).
pub struct Broadcaster {
    subscribers: DashMap<SubscriberId, mpsc::Sender<String>>,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber.
    ///
    /// Returns the subscriber's identity and the receiving end of its frame
    /// channel. The caller (the connection task) owns the receiver; dropping
    /// it marks the connection dead, and the next delivery pass will remove
    /// the registry entry.
    pub fn register(&self) -> (SubscriberId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers.insert(id, tx);
        metrics::set_active_subscribers(self.subscribers.len() as i64);
        debug!(subscriber_id = id, "subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber. Idempotent: removing an unknown or
    /// already-removed id is a no-op.
    ///
    /// Returns `true` if an entry was actually removed.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            metrics::set_active_subscribers(self.subscribers.len() as i64);
            debug!(subscriber_id = id, "subscriber unregistered");
        }
        removed
    }

    /// Number of currently registered subscribers.
    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Fan a frame out to every registered subscriber.
    ///
    /// The frame is serialized once and handed to each per-connection channel
    /// with a non-blocking send, so a slow or dead peer can never stall the
    /// caller. Dead connections found during the pass are unregistered after
    /// the pass completes — the registry is never mutated while iterating.
    ///
    /// Returns the number of subscribers the frame was handed to.
    pub fn deliver(&self, frame: &WsFrame) -> usize {
        if self.subscribers.is_empty() {
            return 0;
        }

        let message = match serde_json::to_string(frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "frame serialization failed, dropping broadcast");
                metrics::inc_error(STAGE, "serialize");
                return 0;
            }
        };

        // Snapshot the senders so concurrent register/unregister cannot
        // invalidate the iteration.
        let targets: Vec<(SubscriberId, mpsc::Sender<String>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut delivered = 0;
        let mut dead: Vec<SubscriberId> = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop this frame for this subscriber only.
                    metrics::inc_dropped_frame(STAGE);
                    debug!(subscriber_id = id, "subscriber lagging, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    metrics::inc_error(STAGE, "delivery_failure");
                    dead.push(id);
                }
            }
        }

        for id in dead {
            self.unregister(id);
        }

        metrics::inc_request(STAGE);
        delivered
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
