//! Detection service binary.
//!
//! Wires the engine, orchestrator, broadcaster, and broker publisher
//! together from environment configuration and runs the HTTP server.

use detection_orchestrator::{
    broadcast::Broadcaster,
    config::ServiceConfig,
    engine::JpegEngine,
    init_tracing,
    metrics::init_metrics,
    orchestrator::InferenceOrchestrator,
    publisher::BrokerPublisher,
    web_api::start_server,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing()?;
    init_metrics()?;

    let config = ServiceConfig::from_env();
    config.validate().map_err(|e| format!("invalid configuration: {e}"))?;
    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        "starting detection service"
    );

    let engine = Arc::new(JpegEngine::default());
    let mut orchestrator =
        InferenceOrchestrator::new(engine, config.workers, config.latency_window);
    if let Some(cap) = config.max_queue_depth {
        orchestrator = orchestrator.with_queue_cap(cap);
    }
    let orchestrator = Arc::new(orchestrator);

    let broadcaster = Arc::new(Broadcaster::new());
    let publisher = Arc::new(BrokerPublisher::new(&config.routing_key));

    // A missing or unreachable broker never blocks startup. The publisher
    // keeps retrying in the background once connect() has been called.
    match &config.broker_url {
        Some(url) => {
            if let Err(e) = publisher.connect(url).await {
                warn!(error = %e, "broker connection failed, publishing disabled until reconnect");
            }
        }
        None => info!("BROKER_URL not set, broker publishing disabled"),
    }

    start_server(config, orchestrator, broadcaster, publisher).await
}
