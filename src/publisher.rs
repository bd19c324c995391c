//! Broker publisher: durable MQTT session for downstream consumers.
//!
//! The publisher owns one broker session and a driver task that polls the
//! MQTT event loop. The session moves through an explicit state machine:
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ConnAck──► Connected
//!        ▲                                                │
//!        └────────────── connection failure ◄─────────────┘
//! ```
//!
//! `publish` succeeds only in `Connected`; in any other state it fails with
//! [`DetectorError::NotConnected`] — logged and metered, never retried here.
//! Delivery is at-most-once from the caller's perspective: retry policy, if
//! any, belongs to the caller. On a dropped connection the driver re-polls
//! with capped exponential backoff, so a dead broker never turns into a
//! retry storm.

use crate::{metrics, Detection, DetectorError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Stage label used for metrics emitted by the publisher.
const STAGE: &str = "publish";

/// Default routing key for outgoing detection messages.
pub const DEFAULT_ROUTING_KEY: &str = "cam";

/// First reconnect delay after a connection failure.
const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Outgoing messages carry base64 JPEG frames; allow up to 10 MB packets.
const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

// ── Session state ──────────────────────────────────────────────────────────
//
// The state is packed with a session generation into one atomic word:
// upper bits generation, low byte state. Each driver task is tagged with
// the generation it was spawned under and may only move the state while
// that generation is current, so a driver left over from a failed session
// can never clobber the state of the session that replaced it.

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;

fn pack_session(generation: u64, state: u8) -> u64 {
    (generation << 8) | u64::from(state)
}

fn session_generation(word: u64) -> u64 {
    word >> 8
}

fn session_state(word: u64) -> u8 {
    (word & 0xFF) as u8
}

/// Move the state to `state` if `generation` is still the current session.
/// Returns `false` when the session has been superseded.
fn try_set_state(session: &AtomicU64, generation: u64, state: u8) -> bool {
    let mut current = session.load(Ordering::Acquire);
    loop {
        if session_generation(current) != generation {
            return false;
        }
        match session.compare_exchange(
            current,
            pack_session(generation, state),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

/// Connection state of the broker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; `publish` fails with `NotConnected`.
    Disconnected,
    /// Session establishment in progress; `publish` still fails.
    Connecting,
    /// Live session; `publish` may succeed.
    Connected,
}

fn state_from_raw(raw: u8) -> SessionState {
    match raw {
        STATE_CONNECTED => SessionState::Connected,
        STATE_CONNECTING => SessionState::Connecting,
        _ => SessionState::Disconnected,
    }
}

// ── Wire payload ───────────────────────────────────────────────────────────

/// The wire payload published to the broker for each detection.
///
/// `detections` is a JSON-serialized *string*, not a structured array: the
/// nested serialization is a wire-compatibility requirement of existing
/// downstream consumers and must be preserved exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CamMessage {
    /// Identifier of the device that submitted the image.
    pub prototype_id: String,
    /// JSON-encoded string of the detection sequence.
    pub detections: String,
    /// Annotated frame, base64-encoded JPEG.
    pub image: String,
}

impl CamMessage {
    /// Build the wire payload, applying the nested-serialization quirk to
    /// `detections` and base64-encoding the annotated frame.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Other`] if the detection list cannot be
    /// serialized.
    pub fn new(
        prototype_id: &str,
        detections: &[Detection],
        annotated_image: &[u8],
    ) -> Result<Self, DetectorError> {
        let detections = serde_json::to_string(detections)
            .map_err(|e| DetectorError::Other(format!("detections serialization failed: {e}")))?;
        Ok(Self {
            prototype_id: prototype_id.to_string(),
            detections,
            image: BASE64.encode(annotated_image),
        })
    }
}

// ── Publisher ──────────────────────────────────────────────────────────────

/// Publishes [`CamMessage`]s to the broker on a fixed routing key.
///
/// Constructed once at startup and shared behind an `Arc`. Access to the
/// broker connection is serialized through the client's internal request
/// channel, so concurrent `publish` calls never interleave writes on the
/// wire.
pub struct BrokerPublisher {
    routing_key: String,
    session: Arc<AtomicU64>,
    client: RwLock<Option<AsyncClient>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl BrokerPublisher {
    /// Create a publisher for the given routing key, initially
    /// `Disconnected`.
    pub fn new(routing_key: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            session: Arc::new(AtomicU64::new(pack_session(0, STATE_DISCONNECTED))),
            client: RwLock::new(None),
            driver: Mutex::new(None),
        }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        state_from_raw(session_state(self.session.load(Ordering::Acquire)))
    }

    /// Establish the broker session and start the reconnecting driver task.
    ///
    /// Idempotent: a second call while connecting or connected is a no-op.
    /// Returns once the driver is running; the session reaches `Connected`
    /// asynchronously when the broker acknowledges.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::Config`] when the endpoint URL cannot be
    /// parsed. Connection failures are not errors here — the driver keeps
    /// retrying with backoff.
    pub async fn connect(&self, endpoint: &str) -> Result<(), DetectorError> {
        // Claim a fresh generation; any driver from a previous session is
        // now stale and its state stores are ignored.
        let mut current = self.session.load(Ordering::Acquire);
        let generation = loop {
            if session_state(current) != STATE_DISCONNECTED {
                debug!("broker session already established, connect is a no-op");
                return Ok(());
            }
            let next = session_generation(current) + 1;
            match self.session.compare_exchange(
                current,
                pack_session(next, STATE_CONNECTING),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };

        let (host, port) = match parse_endpoint(endpoint) {
            Ok(hp) => hp,
            Err(e) => {
                try_set_state(&self.session, generation, STATE_DISCONNECTED);
                return Err(e);
            }
        };

        let client_id = format!("detection-orchestrator-{}", crate::short_request_id());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

        let (client, eventloop) = AsyncClient::new(options, 64);
        {
            let mut guard = self.client.write().unwrap_or_else(|p| p.into_inner());
            *guard = Some(client);
        }

        let handle = tokio::spawn(drive_session(
            eventloop,
            Arc::clone(&self.session),
            generation,
        ));
        {
            let mut guard = self.driver.lock().unwrap_or_else(|p| p.into_inner());
            *guard = Some(handle);
        }

        info!(endpoint = %endpoint, "broker session starting");
        Ok(())
    }

    /// Publish one message on the fixed routing key with persistent
    /// (at-least-once) delivery.
    ///
    /// # Errors
    ///
    /// Returns [`DetectorError::NotConnected`] when the session is not in
    /// the `Connected` state or the connection handle is gone. The message
    /// is not retried — at-most-once from the caller's perspective.
    pub async fn publish(&self, message: &CamMessage) -> Result<(), DetectorError> {
        if self.state() != SessionState::Connected {
            metrics::inc_error(STAGE, "not_connected");
            return Err(DetectorError::NotConnected);
        }

        let payload = serde_json::to_vec(message)
            .map_err(|e| DetectorError::Other(format!("message serialization failed: {e}")))?;

        let client = {
            let guard = self.client.read().unwrap_or_else(|p| p.into_inner());
            guard.clone()
        };
        let Some(client) = client else {
            metrics::inc_error(STAGE, "not_connected");
            return Err(DetectorError::NotConnected);
        };

        client
            .publish(&self.routing_key, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| {
                // The request channel is gone: the session is dead. Demote
                // within the current generation only.
                let current = self.session.load(Ordering::Acquire);
                try_set_state(
                    &self.session,
                    session_generation(current),
                    STATE_DISCONNECTED,
                );
                metrics::inc_error(STAGE, "session_lost");
                warn!(error = %e, "broker request channel closed");
                DetectorError::NotConnected
            })?;

        metrics::inc_request(STAGE);
        debug!(
            prototype_id = %message.prototype_id,
            routing_key = %self.routing_key,
            "cam message published"
        );
        Ok(())
    }

    /// Release the session: disconnect, stop the driver, return to
    /// `Disconnected`.
    pub async fn close(&self) {
        let client = {
            let mut guard = self.client.write().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        // Supersede the generation so any running driver goes stale.
        let _ = self.session.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            Some(pack_session(session_generation(w) + 1, STATE_DISCONNECTED))
        });

        let handle = {
            let mut guard = self.driver.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        if let Some(mut handle) = handle {
            // The driver exits on its own once the client is dropped; give
            // it a moment to flush the disconnect, then stop waiting.
            if tokio::time::timeout(Duration::from_secs(3), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                warn!("broker driver did not exit in time, aborted");
            }
        }
        info!("broker session closed");
    }

    /// Install a pre-built client under a fresh generation and mark the
    /// session `Connected`, skipping the driver. Lets tests exercise the
    /// publish path without a broker.
    #[cfg(test)]
    fn install_client_for_test(&self, client: AsyncClient) {
        let mut guard = self.client.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(client);
        let _ = self.session.fetch_update(Ordering::AcqRel, Ordering::Acquire, |w| {
            Some(pack_session(session_generation(w) + 1, STATE_CONNECTED))
        });
    }
}

/// Drive the MQTT event loop: track session state and reconnect with capped
/// exponential backoff after failures. Exits when the client handle is
/// dropped or the session generation is superseded by a newer `connect`.
async fn drive_session(mut eventloop: EventLoop, session: Arc<AtomicU64>, generation: u64) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if session_generation(session.load(Ordering::Acquire)) != generation {
            debug!("broker session superseded, stale driver exiting");
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if !try_set_state(&session, generation, STATE_CONNECTED) {
                    break;
                }
                backoff = INITIAL_BACKOFF;
                info!("broker session established");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                if !try_set_state(&session, generation, STATE_CONNECTING) {
                    break;
                }
                warn!("broker requested disconnect, will reconnect");
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                try_set_state(&session, generation, STATE_DISCONNECTED);
                debug!("publisher dropped, broker driver exiting");
                break;
            }
            Err(e) => {
                if !try_set_state(&session, generation, STATE_DISCONNECTED) {
                    break;
                }
                warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "broker connection lost");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                // The next poll re-dials the broker.
                if !try_set_state(&session, generation, STATE_CONNECTING) {
                    break;
                }
            }
        }
    }
}

/// Parse a broker endpoint of the form `mqtt://host:port`, `tcp://host:port`,
/// or bare `host:port`. Port defaults to 1883.
fn parse_endpoint(endpoint: &str) -> Result<(String, u16), DetectorError> {
    let rest = match endpoint.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(DetectorError::Config(format!(
                "unsupported broker scheme '{scheme}' in '{endpoint}'"
            )))
        }
        None => endpoint,
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(DetectorError::Config(format!(
            "empty broker endpoint '{endpoint}'"
        )));
    }

    match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| {
                DetectorError::Config(format!("invalid broker port in '{endpoint}'"))
            })?;
            if host.is_empty() {
                return Err(DetectorError::Config(format!(
                    "empty broker host in '{endpoint}'"
                )));
            }
            Ok((host.to_string(), port))
        }
        None => Ok((rest.to_string(), 1883)),
    }
}
