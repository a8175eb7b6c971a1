use std::sync::Arc;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::trace::TraceLayer;

use transcribe_dispatch::{
    config::AppConfig,
    routes,
    services::{
        janitor::{Janitor, RetentionPolicy},
        processor::{CommandProcessor, Processor},
        queue::{JobStore, StoreSettings},
        redis_log::RedisStreamLog,
        results::ResultChannel,
        shutdown,
        storage::BlobArea,
        stream_log::StreamLog,
        worker::{Worker, WorkerSettings},
    },
    telemetry,
};

#[tokio::main]
async fn main() {
    telemetry::init_tracing();

    tracing::info!("Starting transcription worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    telemetry::describe_metrics();

    let command = config
        .processor_command
        .as_deref()
        .expect("PROCESSOR_COMMAND must be set for workers");
    let processor: Arc<dyn Processor> = Arc::new(
        CommandProcessor::from_command_line(command, &config.device, config.hf_token.clone())
            .expect("PROCESSOR_COMMAND is empty"),
    );

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
    let results = Arc::new(ResultChannel::new(
        Arc::clone(&log),
        &config.stream_prefix,
        config.result_retention(),
    ));
    let blobs = Arc::new(BlobArea::new(&config.blob_base_dir, config.max_input_bytes));

    let (shutdown_handle, shutdown_signal) = shutdown::new_pair();

    let janitor = Janitor::new(
        Arc::clone(&jobs),
        Arc::clone(&results),
        Arc::clone(&blobs),
        RetentionPolicy {
            jobs: config.job_retention(),
            blobs: config.blob_retention(),
        },
    );
    let janitor_task = tokio::spawn(janitor.run(config.janitor_interval(), shutdown_signal.clone()));

    // Health and metrics for the orchestrator
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .with_state(Arc::clone(&jobs))
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(&config.worker_bind_addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!("Worker health endpoint listening on {}", config.worker_bind_addr);
    let mut server_signal = shutdown_signal.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_signal.wait().await })
            .await
        {
            tracing::error!(error = %e, "Health server error");
        }
    });

    let worker = Arc::new(Worker::new(
        jobs,
        results,
        blobs,
        processor,
        WorkerSettings {
            group: config.consumer_group.clone(),
            consumer: config.consumer_name.clone(),
            batch_size: config.batch_size,
            slots: config.worker_slots,
            block: config.block(),
        },
    ));
    let mut worker_task = tokio::spawn(worker.run(shutdown_signal));

    let stopped_early = tokio::select! {
        _ = shutdown::wait_for_os_signal() => None,
        joined = &mut worker_task => Some(joined),
    };
    shutdown_handle.trigger();
    let joined = match stopped_early {
        Some(joined) => joined,
        None => worker_task.await,
    };
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Worker stopped with error"),
        Err(e) => tracing::error!(error = %e, "Worker task failed"),
    }

    let _ = janitor_task.await;
    let _ = server_task.await;
    tracing::info!("Worker shut down");
}
