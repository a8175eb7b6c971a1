use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use transcribe_dispatch::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{
        dispatcher::{Dispatcher, DispatcherSettings},
        queue::{JobStore, StoreSettings},
        redis_log::RedisStreamLog,
        results::ResultChannel,
        shutdown,
        storage::BlobArea,
        stream_log::StreamLog,
    },
    telemetry,
};

/// Multipart framing on top of the largest accepted input.
const BODY_OVERHEAD: usize = 1024 * 1024;

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing transcription front door");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    telemetry::describe_metrics();

    tracing::info!("Connecting to Redis streams");
    let log: Arc<dyn StreamLog> = Arc::new(
        RedisStreamLog::new(&config.redis_url, config.max_stream_length)
            .expect("Failed to initialize Redis client"),
    );

    let jobs = Arc::new(JobStore::new(
        Arc::clone(&log),
        StoreSettings {
            prefix: config.stream_prefix.clone(),
            claim_timeout: config.claim_timeout(),
            retention: config.job_retention(),
        },
    ));
    jobs.health_check()
        .await
        .expect("Job store is unreachable");

    let results = Arc::new(ResultChannel::new(
        Arc::clone(&log),
        &config.stream_prefix,
        config.result_retention(),
    ));
    let blobs = Arc::new(BlobArea::new(&config.blob_base_dir, config.max_input_bytes));

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&jobs),
        results,
        blobs,
        DispatcherSettings {
            group: format!("dispatch:{}", config.consumer_name),
            consumer: config.consumer_name.clone(),
            block: config.block(),
        },
    ));

    let (shutdown_handle, shutdown_signal) = shutdown::new_pair();
    let delivery = dispatcher
        .start(shutdown_signal.clone())
        .await
        .expect("Failed to subscribe to results stream");

    let state = AppState::new(
        Arc::clone(&dispatcher),
        jobs,
        config.submit_timeout(),
        config.default_params(),
        config.diarize_bounds(),
    );

    let body_limit = usize::try_from(config.max_input_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_OVERHEAD);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/transcribe",
            post(routes::transcribe::submit_transcription),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    let mut server_signal = shutdown_signal;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown::wait_for_os_signal() => {}
                _ = server_signal.wait() => {}
            }
        })
        .await
        .expect("Server error");

    tracing::info!(inflight = dispatcher.inflight(), "Server stopped, closing dispatcher");
    shutdown_handle.trigger();
    if let Err(e) = delivery.await {
        tracing::error!(error = %e, "Delivery loop task failed");
    }
}
