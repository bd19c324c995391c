//! Integration tests for `src/web_api.rs`
//!
//! Tests spawn a real HTTP server on a unique port and exercise it via
//! `reqwest`. The broadcaster handed to the server is kept by the test, so
//! WebSocket fan-out can be verified by registering a subscriber directly
//! on the shared registry without a WebSocket client.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use detection_orchestrator::broadcast::{Broadcaster, WsFrame};
use detection_orchestrator::config::ServiceConfig;
use detection_orchestrator::engine::{DetectionEngine, EngineError, EngineOutput};
use detection_orchestrator::publisher::BrokerPublisher;
use detection_orchestrator::web_api::{start_server, DetectResponse};
use detection_orchestrator::{Detection, InferenceOrchestrator, JpegEngine, StaticEngine};

// ============================================================================
// Test Infrastructure
// ============================================================================

/// Atomic counter for unique per-test port allocation.
/// Starts high to avoid collisions with common services.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(29400);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Spawn a server backed by the given engine and return its base URL plus
/// the shared broadcaster, so tests can register subscribers and observe
/// fan-out.
async fn spawn_server(engine: Arc<dyn DetectionEngine>) -> (String, Arc<Broadcaster>) {
    let port = next_port();
    let config = ServiceConfig {
        host: "127.0.0.1".to_string(),
        port,
        ..ServiceConfig::default()
    };
    let orchestrator = Arc::new(InferenceOrchestrator::new(engine, 2, 100));
    let broadcaster = Arc::new(Broadcaster::new());
    let publisher = Arc::new(BrokerPublisher::new("cam"));

    let shared = Arc::clone(&broadcaster);
    tokio::spawn(async move {
        let _ = start_server(config, orchestrator, shared, publisher).await;
    });
    // Give the server a moment to bind.
    tokio::time::sleep(Duration::from_millis(300)).await;
    (format!("http://127.0.0.1:{port}"), broadcaster)
}

fn client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .expect("reqwest client must build in tests")
}

/// Engine canned with two detections and a one-byte annotated image.
fn two_detection_engine() -> Arc<dyn DetectionEngine> {
    Arc::new(
        StaticEngine::new()
            .with_detections(vec![
                Detection { cls: 0, conf: 0.91 },
                Detection { cls: 3, conf: 0.44 },
            ])
            .with_annotated_image(vec![0xAB]),
    )
}

/// A minimal valid JPEG, 4x4 black.
fn tiny_jpeg() -> Vec<u8> {
    let img = image::DynamicImage::new_rgb8(4, 4);
    detection_orchestrator::engine::encode_jpeg(&img, 70).expect("fixture jpeg must encode")
}

fn detect_form(prototype_id: &str, image: Vec<u8>) -> Form {
    Form::new()
        .text("prototype_id", prototype_id.to_string())
        .part("image", Part::bytes(image).file_name("frame.jpg"))
}

/// Engine that always fails with an internal error.
struct BrokenEngine;

impl DetectionEngine for BrokenEngine {
    fn detect(&self, _image: &[u8]) -> Result<EngineOutput, EngineError> {
        Err(EngineError::Internal("model fault".to_string()))
    }
}

// ============================================================================
// POST /api/v1/detect
// ============================================================================

#[tokio::test]
async fn test_detect_returns_engine_detections() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-7", vec![1, 2, 3]))
        .send()
        .await
        .expect("request must succeed");

    assert_eq!(resp.status(), StatusCode::OK);
    let body: DetectResponse = resp.json().await.expect("valid response body");
    assert_eq!(body.prototype_id, "cam-7");
    assert_eq!(body.detections.len(), 2);
    assert_eq!(body.detections[0].cls, 0);
    assert_eq!(body.detections[1].cls, 3);
    assert!(body.inference_time > 0.0);
}

#[tokio::test]
async fn test_detect_echoes_client_timestamp() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;

    let form = detect_form("cam-1", vec![1]).text("timestamp", "1699999999.25");
    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(form)
        .send()
        .await
        .expect("request must succeed");

    let body: DetectResponse = resp.json().await.expect("valid response body");
    assert_eq!(body.timestamp, "1699999999.25");
}

#[tokio::test]
async fn test_detect_defaults_timestamp_to_epoch_seconds() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", vec![1]))
        .send()
        .await
        .expect("request must succeed");

    let body: DetectResponse = resp.json().await.expect("valid response body");
    let secs: f64 = body.timestamp.parse().expect("numeric default timestamp");
    assert!(secs > 1.5e9);
}

#[tokio::test]
async fn test_detect_rejects_empty_image_with_400() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", Vec::new()))
        .send()
        .await
        .expect("request must succeed");

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json error body");
    assert_eq!(body["detail"], "Empty image payload");
}

#[tokio::test]
async fn test_detect_rejects_missing_image_field_with_400() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;

    let form = Form::new().text("prototype_id", "cam-1");
    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(form)
        .send()
        .await
        .expect("request must succeed");

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json error body");
    assert!(body["detail"].as_str().expect("detail string").contains("image"));
}

#[tokio::test]
async fn test_detect_rejects_undecodable_image_with_400() {
    let (base, _broadcaster) = spawn_server(Arc::new(JpegEngine::default())).await;

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", vec![0xDE, 0xAD, 0xBE, 0xEF]))
        .send()
        .await
        .expect("request must succeed");

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.expect("json error body");
    assert!(body["detail"]
        .as_str()
        .expect("detail string")
        .starts_with("Invalid image"));
}

#[tokio::test]
async fn test_detect_accepts_valid_jpeg_through_real_codec() {
    let (base, _broadcaster) = spawn_server(Arc::new(JpegEngine::default())).await;

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", tiny_jpeg()))
        .send()
        .await
        .expect("request must succeed");

    assert_eq!(resp.status(), StatusCode::OK);
    let body: DetectResponse = resp.json().await.expect("valid response body");
    assert!(body.detections.is_empty());
}

#[tokio::test]
async fn test_detect_engine_failure_returns_500_processing_error() {
    let (base, _broadcaster) = spawn_server(Arc::new(BrokenEngine)).await;

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", vec![1, 2, 3]))
        .send()
        .await
        .expect("request must succeed");

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.expect("json error body");
    assert!(body["detail"]
        .as_str()
        .expect("detail string")
        .starts_with("Processing error"));
}

// ============================================================================
// Fan-out to live subscribers
// ============================================================================

#[tokio::test]
async fn test_detect_result_is_broadcast_to_subscribers() {
    let (base, broadcaster) = spawn_server(two_detection_engine()).await;
    let (_id, mut frames) = broadcaster.register();

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-9", vec![1, 2, 3]))
        .send()
        .await
        .expect("request must succeed");
    assert_eq!(resp.status(), StatusCode::OK);

    let text = tokio::time::timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("fan-out must arrive within 2s")
        .expect("channel must stay open");
    let frame: Value = serde_json::from_str(&text).expect("frame is JSON");

    assert_eq!(frame["prototype_id"], "cam-9");
    assert_eq!(frame["detections"].as_array().expect("array").len(), 2);
    let decoded = BASE64
        .decode(frame["image"].as_str().expect("base64 string"))
        .expect("image must decode");
    assert_eq!(decoded, vec![0xAB]);
}

#[tokio::test]
async fn test_fan_out_skipped_when_engine_yields_no_annotated_image() {
    let engine = Arc::new(
        StaticEngine::new()
            .with_detections(vec![Detection { cls: 1, conf: 0.8 }])
            .with_annotated_image(Vec::new()),
    );
    let (base, broadcaster) = spawn_server(engine).await;
    let (_id, mut frames) = broadcaster.register();

    let resp = client()
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", vec![1]))
        .send()
        .await
        .expect("request must succeed");
    assert_eq!(resp.status(), StatusCode::OK);

    let waited = tokio::time::timeout(Duration::from_millis(500), frames.recv()).await;
    assert!(waited.is_err(), "no frame expected without an annotated image");
}

#[tokio::test]
async fn test_unresponsive_subscriber_is_eventually_unregistered() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (base, broadcaster) = spawn_server(two_detection_engine()).await;
    let addr = base.trim_start_matches("http://").to_string();

    // Raw WebSocket handshake; the peer then never reads another byte.
    let mut peer = tokio::net::TcpStream::connect(&addr)
        .await
        .expect("tcp connect");
    let handshake = format!(
        "GET /api/v1/ws HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    peer.write_all(handshake.as_bytes())
        .await
        .expect("handshake write");
    let mut buf = [0u8; 1024];
    let n = peer.read(&mut buf).await.expect("handshake response");
    assert!(
        String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 101"),
        "upgrade must be accepted"
    );

    let registered = async {
        while broadcaster.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), registered)
        .await
        .expect("subscriber must register after upgrade");

    // Large frames fill the socket buffers of the non-reading peer until a
    // server-side write stalls past its timeout and the subscriber is
    // dropped. The TCP connection itself stays open the whole time.
    let flood = WsFrame {
        prototype_id: "cam-1".to_string(),
        detections: Vec::new(),
        image: "x".repeat(256 * 1024),
        timestamp: "0".to_string(),
    };
    let removed = async {
        while broadcaster.connection_count() > 0 {
            broadcaster.deliver(&flood);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(20), removed)
        .await
        .expect("unresponsive subscriber must be unregistered");
    assert_eq!(broadcaster.connection_count(), 0);
    drop(peer);
}

// ============================================================================
// GET /api/v1/stats
// ============================================================================

#[tokio::test]
async fn test_stats_start_zeroed() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;

    let body: Value = client()
        .get(format!("{base}/api/v1/stats"))
        .send()
        .await
        .expect("request must succeed")
        .json()
        .await
        .expect("json body");

    assert_eq!(body["total_processed"], 0);
    assert_eq!(body["avg_time"], 0.0);
    assert_eq!(body["min_time"], 0.0);
    assert_eq!(body["max_time"], 0.0);
}

#[tokio::test]
async fn test_stats_count_completed_requests() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;
    let http = client();

    for _ in 0..3 {
        let resp = http
            .post(format!("{base}/api/v1/detect"))
            .multipart(detect_form("cam-1", vec![1, 2, 3]))
            .send()
            .await
            .expect("request must succeed");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    let body: Value = http
        .get(format!("{base}/api/v1/stats"))
        .send()
        .await
        .expect("request must succeed")
        .json()
        .await
        .expect("json body");

    assert_eq!(body["total_processed"], 3);
    assert!(body["avg_time"].as_f64().expect("avg is f64") >= 0.0);
    assert!(
        body["max_time"].as_f64().expect("max is f64")
            >= body["min_time"].as_f64().expect("min is f64")
    );
}

#[tokio::test]
async fn test_stats_ignore_failed_requests() {
    let (base, _broadcaster) = spawn_server(Arc::new(BrokenEngine)).await;
    let http = client();

    let resp = http
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", vec![1]))
        .send()
        .await
        .expect("request must succeed");
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: Value = http
        .get(format!("{base}/api/v1/stats"))
        .send()
        .await
        .expect("request must succeed")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["total_processed"], 0);
}

// ============================================================================
// Utility endpoints
// ============================================================================

#[tokio::test]
async fn test_root_returns_service_banner() {
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;

    let body: Value = client()
        .get(&base)
        .send()
        .await
        .expect("request must succeed")
        .json()
        .await
        .expect("json body");
    assert_eq!(body["message"], "Object Detection Service Running");
}

#[tokio::test]
async fn test_health_reports_service_and_connection_count() {
    let (base, broadcaster) = spawn_server(two_detection_engine()).await;
    let (_id, _frames) = broadcaster.register();

    let body: Value = client()
        .get(format!("{base}/health"))
        .send()
        .await
        .expect("request must succeed")
        .json()
        .await
        .expect("json body");

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "object_detection");
    assert_eq!(body["active_connections"], 1);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_prometheus_text() {
    detection_orchestrator::metrics::init_metrics().expect("metrics must init");
    let (base, _broadcaster) = spawn_server(two_detection_engine()).await;
    let http = client();

    // One completed request so the stage counters have samples to encode.
    let resp = http
        .post(format!("{base}/api/v1/detect"))
        .multipart(detect_form("cam-1", vec![1, 2, 3]))
        .send()
        .await
        .expect("request must succeed");
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = http
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("request must succeed");
    assert_eq!(resp.status(), StatusCode::OK);
    let text = resp.text().await.expect("text body");
    assert!(text.contains("detector_requests_total"));
    assert!(text.contains("detector_stage_duration_seconds"));
}
