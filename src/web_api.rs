//! HTTP and WebSocket surface of the detection service.
//!
//! ## Endpoints
//!
//! - `POST /api/v1/detect` — multipart upload, synchronous detection result
//! - `GET  /api/v1/stats` — rolling latency statistics
//! - `GET  /api/v1/ws` — live detection frames over WebSocket
//! - `GET  /health` — health check with live subscriber count
//! - `GET  /metrics` — Prometheus metrics
//! - `GET  /` — service banner
//!
//! The detect handler awaits the orchestrator, returns the HTTP response,
//! and hands the result to a detached fan-out task that broadcasts to live
//! subscribers and publishes to the broker in parallel. The HTTP response
//! never waits on either sink, and failures in the background task are
//! contained — logged, metered, never surfaced to the caller.

use crate::broadcast::{Broadcaster, WsFrame};
use crate::config::ServiceConfig;
use crate::orchestrator::InferenceOrchestrator;
use crate::publisher::{BrokerPublisher, CamMessage};
use crate::{short_request_id, Detection, DetectorError};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Multipart, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Maximum WebSocket message size (1 MB).
const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// WebSocket ping interval in seconds.
const WS_PING_INTERVAL_SECS: u64 = 30;

/// Upper bound on a single WebSocket write. A peer that stops reading
/// (full TCP window, no reset) would otherwise block its connection task
/// forever; expiry is treated as a write failure and removes the
/// subscriber.
const WS_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Service name reported by the health endpoint.
const SERVICE_NAME: &str = "object_detection";

// ============================================================================
// Types
// ============================================================================

/// JSON response body for `POST /api/v1/detect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResponse {
    /// Identifier of the device that submitted the image, echoed back.
    pub prototype_id: String,
    /// Detections in engine output order.
    pub detections: Vec<Detection>,
    /// End-to-end processing time in seconds, queue wait included.
    pub inference_time: f64,
    /// Client-supplied timestamp, or the server's epoch time when absent.
    pub timestamp: String,
}

/// Shared application state available to all handlers.
///
/// The three collaborators are constructed once at startup and injected
/// here — no ambient singletons, so lifetimes and test isolation stay
/// explicit.
pub struct AppState {
    /// Worker-pool inference front end.
    pub orchestrator: Arc<InferenceOrchestrator>,
    /// Live subscriber registry and fan-out.
    pub broadcaster: Arc<Broadcaster>,
    /// Broker session.
    pub publisher: Arc<BrokerPublisher>,
}

// ============================================================================
// Server
// ============================================================================

/// Build the service router over the given collaborators.
///
/// Split out from [`start_server`] so tests can drive the router without
/// binding a socket.
pub fn build_router(config: &ServiceConfig, state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/detect", post(detect_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/ws", get(websocket_handler))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP/WebSocket server.
///
/// Binds to `config.host:config.port` and blocks until the server shuts
/// down.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn start_server(
    config: ServiceConfig,
    orchestrator: Arc<InferenceOrchestrator>,
    broadcaster: Arc<Broadcaster>,
    publisher: Arc<BrokerPublisher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState {
        orchestrator,
        broadcaster,
        publisher,
    });
    let app = build_router(&config, state);

    info!("Detection service listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============================================================================
// Detection
// ============================================================================

/// `POST /api/v1/detect` — run detection on an uploaded image.
///
/// Multipart form fields: `prototype_id` (text, required), `image` (binary,
/// required, non-empty), `timestamp` (text, optional — defaults to the
/// server's stringified epoch seconds).
async fn detect_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<DetectResponse>, ApiError> {
    let mut prototype_id: Option<String> = None;
    let mut image: Option<Vec<u8>> = None;
    let mut timestamp: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("prototype_id") => {
                prototype_id = Some(field.text().await.map_err(|e| {
                    ApiError::BadRequest(format!("unreadable prototype_id field: {e}"))
                })?);
            }
            Some("image") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("unreadable image field: {e}")))?;
                image = Some(bytes.to_vec());
            }
            Some("timestamp") => {
                timestamp = Some(field.text().await.map_err(|e| {
                    ApiError::BadRequest(format!("unreadable timestamp field: {e}"))
                })?);
            }
            _ => {}
        }
    }

    let prototype_id =
        prototype_id.ok_or_else(|| ApiError::BadRequest("prototype_id field required".into()))?;
    let image = image.ok_or_else(|| ApiError::BadRequest("image field required".into()))?;
    // Reject before the engine ever sees the request.
    if image.is_empty() {
        return Err(ApiError::BadRequest("Empty image payload".into()));
    }
    let timestamp = timestamp.unwrap_or_else(epoch_timestamp);

    let request_id = short_request_id();
    let start = Instant::now();
    info!(
        request_id = %request_id,
        prototype_id = %prototype_id,
        bytes = image.len(),
        "detection request received"
    );

    let result = state.orchestrator.submit(image).await.map_err(|e| {
        warn!(request_id = %request_id, error = %e, "detection request failed");
        ApiError::from(e)
    })?;

    let inference_time = start.elapsed().as_secs_f64();
    debug!(
        request_id = %request_id,
        detections = result.detections.len(),
        duration_ms = (inference_time * 1000.0) as u64,
        "detection request complete"
    );

    // Hand the result to the sinks without blocking the response. The
    // spawned task contains every failure internally.
    if !result.annotated_image.is_empty() {
        tokio::spawn(fan_out(
            Arc::clone(&state),
            prototype_id.clone(),
            result.detections.clone(),
            result.annotated_image,
            timestamp.clone(),
        ));
    }

    Ok(Json(DetectResponse {
        prototype_id,
        detections: result.detections,
        inference_time,
        timestamp,
    }))
}

/// Deliver one completed result to the live subscribers and the broker,
/// in parallel.
///
/// Runs detached from the already-sent HTTP response. Both sinks are
/// best-effort: every failure here is logged and metered, never propagated —
/// a broken sink must not crash the process or affect sibling requests.
async fn fan_out(
    state: Arc<AppState>,
    prototype_id: String,
    detections: Vec<Detection>,
    annotated_image: Vec<u8>,
    timestamp: String,
) {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;

    let frame = WsFrame {
        prototype_id: prototype_id.clone(),
        detections: detections.clone(),
        image: BASE64.encode(&annotated_image),
        timestamp,
    };

    let (delivered, publish_result) = tokio::join!(
        async { state.broadcaster.deliver(&frame) },
        async {
            let cam = CamMessage::new(&prototype_id, &detections, &annotated_image)?;
            state.publisher.publish(&cam).await
        }
    );

    debug!(
        prototype_id = %prototype_id,
        delivered,
        "result broadcast to subscribers"
    );
    match publish_result {
        Ok(()) => {}
        Err(DetectorError::NotConnected) => {
            debug!(prototype_id = %prototype_id, "broker offline, cam message dropped");
        }
        Err(e) => {
            warn!(prototype_id = %prototype_id, error = %e, "cam message publish failed");
        }
    }
}

/// The server's default timestamp: current time as stringified epoch
/// seconds.
fn epoch_timestamp() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

// ============================================================================
// WebSocket
// ============================================================================

/// `GET /api/v1/ws` — upgrade to a live detection-frame subscription.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.max_message_size(WS_MAX_MESSAGE_SIZE)
        .on_upgrade(|socket| subscriber_stream(socket, state))
}

/// Drive one subscriber connection: push frames from the broadcaster,
/// keep the peer alive with pings, tolerate arbitrary inbound frames,
/// and unregister on any exit path.
///
/// Every write is bounded by [`WS_SEND_TIMEOUT`]; a write that cannot
/// complete in time is a dead peer, handled exactly like a write error.
async fn subscriber_stream(mut socket: WebSocket, state: Arc<AppState>) {
    let (id, mut frames) = state.broadcaster.register();
    info!(subscriber_id = id, "WebSocket subscriber connected");

    let mut ping_interval = tokio::time::interval(Duration::from_secs(WS_PING_INTERVAL_SECS));

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(text) => {
                        if !send_bounded(&mut socket, id, Message::Text(text)).await {
                            break;
                        }
                    }
                    // Broadcaster dropped our channel (unregistered).
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if !send_bounded(&mut socket, id, Message::Pong(data)).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Inbound text/binary frames are treated as keepalive.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(subscriber_id = id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if !send_bounded(&mut socket, id, Message::Ping(Vec::new())).await {
                    break;
                }
            }
        }
    }

    // Idempotent: the broadcaster may already have removed us after a
    // failed delivery.
    state.broadcaster.unregister(id);
    info!(subscriber_id = id, "WebSocket subscriber disconnected");
}

/// Send one frame with the per-write timeout. Returns `false` when the
/// write failed or timed out, in which case the connection is done.
async fn send_bounded(socket: &mut WebSocket, id: u64, message: Message) -> bool {
    match tokio::time::timeout(WS_SEND_TIMEOUT, socket.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            warn!(subscriber_id = id, "WebSocket write timed out, dropping subscriber");
            false
        }
    }
}

// ============================================================================
// Utility handlers
// ============================================================================

/// `GET /` — service banner.
async fn root_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Object Detection Service Running" }))
}

/// `GET /health` — health check.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "active_connections": state.broadcaster.connection_count(),
    }))
}

/// `GET /api/v1/stats` — rolling latency statistics.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<crate::stats::StatsSnapshot> {
    Json(state.orchestrator.stats())
}

/// `GET /metrics` — Prometheus metrics endpoint.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

// ============================================================================
// Error type
// ============================================================================

/// API-level errors returned by handlers.
///
/// Each variant maps to an HTTP status code and a `{"detail": ...}` JSON
/// body, the error shape existing clients already parse.
#[derive(Debug)]
enum ApiError {
    /// Client-side problem with the upload (missing field, empty or
    /// undecodable image).
    BadRequest(String),
    /// The worker queue cap was exceeded.
    Busy,
    /// Engine or internal processing failure.
    Internal(String),
}

impl From<DetectorError> for ApiError {
    fn from(e: DetectorError) -> Self {
        match e {
            DetectorError::Decode(msg) => ApiError::BadRequest(format!("Invalid image: {msg}")),
            DetectorError::Busy => ApiError::Busy,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Busy => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service overloaded, retry later".to_string(),
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Processing error: {msg}"),
            ),
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}
