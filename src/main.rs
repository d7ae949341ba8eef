use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use bg_remover_queue::app_state::AppState;
use bg_remover_queue::config::AppConfig;
use bg_remover_queue::routes;
use bg_remover_queue::services::{
    processor::Processor, remover::RembgClient, scheduler::Scheduler, storage::ResultStorage,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing background remover server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_counter!("bg_jobs_submitted_total", "Jobs admitted to the queue");
    metrics::describe_counter!(
        "bg_jobs_rejected_total",
        "Submissions rejected at admission, by reason"
    );
    metrics::describe_counter!("bg_jobs_completed_total", "Queued jobs that completed");
    metrics::describe_counter!("bg_jobs_failed_total", "Queued jobs that failed");
    metrics::describe_counter!("bg_jobs_inline_total", "Requests processed inline");
    metrics::describe_gauge!("bg_queue_depth", "Jobs waiting for a worker slot");
    metrics::describe_gauge!("bg_jobs_active", "Jobs currently processing");
    metrics::describe_gauge!("bg_jobs_inline_active", "Inline requests holding a worker slot");
    metrics::describe_histogram!(
        "bg_processing_seconds",
        "Time to run one image through the pipeline"
    );

    // Result storage, pruned of files left by a previous run
    tracing::info!(folder = %config.output_folder, "Initializing result storage");
    let storage = ResultStorage::new(&config.output_folder)
        .await
        .expect("Failed to create output folder");
    match storage
        .cleanup_older_than(Duration::from_secs(config.file_max_age_secs))
        .await
    {
        Ok(removed) => tracing::info!(removed, "Removed stale result files"),
        Err(e) => tracing::warn!(error = %e, "Startup cleanup failed"),
    }

    tracing::info!(url = %config.rembg_url, "Using rembg backend");
    let remover = Arc::new(RembgClient::new(config.rembg_url.clone()));
    let processor = Processor::new(remover, Arc::new(storage));

    let bind_addr = config.bind_addr.clone();
    let max_content_length = config.max_content_length;
    let state = AppState::new(config, processor).with_metrics(prometheus_handle);

    // Start the dispatcher
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(state.queue.clone(), state.processor.clone());
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(max_content_length));

    tracing::info!("Starting background remover on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .expect("Server error");

    // In-flight workers are detached and simply end with the process
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
    }
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
