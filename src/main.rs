use axum::extract::DefaultBodyLimit;
use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use image_relay::{
    app_state::AppState,
    config::AppConfig,
    pipeline::{self, Orchestrator},
    routes,
    services::{
        intake::Intake, progress::ProgressReporter, queue::RedisBroker, sink::ResultSink,
        storage::R2Client, token::TokenVerifier,
    },
};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

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
    let settings = config
        .worker()
        .expect("Worker settings missing from environment");

    tracing::info!("Initializing image-relay worker");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("upload_jobs_admitted_total", "Uploads admitted into the pipeline");
    metrics::describe_counter!(
        "upload_jobs_rejected_total",
        "Uploads rejected at intake, by reason"
    );
    metrics::describe_histogram!(
        "upload_stage_duration_seconds",
        "Time spent in each pipeline stage"
    );
    metrics::describe_counter!(
        "upload_stage_failures_total",
        "Stage failures by stage and error code"
    );
    metrics::describe_histogram!(
        "upload_job_duration_seconds",
        "Time from admission to a published terminal result"
    );
    metrics::describe_counter!(
        "upload_results_published_total",
        "Terminal results appended to the result stream"
    );
    metrics::describe_counter!(
        "upload_result_publish_retries_total",
        "Failed result stream appends that were retried"
    );
    metrics::describe_counter!(
        "upload_full_decodes_total",
        "Images that passed the pixel ceiling and were fully decoded"
    );

    // Connect to Redis
    tracing::info!("Connecting to Redis");
    let broker = Arc::new(
        RedisBroker::connect(config.broker())
            .await
            .expect("Failed to connect to Redis"),
    );

    // Initialize R2 storage client
    tracing::info!("Initializing R2 storage client");
    let r2_client = R2Client::new(
        &settings.r2_bucket,
        &settings.r2_endpoint,
        &settings.r2_access_key,
        &settings.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let verifier = TokenVerifier::from_base64_pem(&settings.token_public_key, &config.token_issuer)
        .expect("Failed to load token verification key");

    // Assemble the pipeline
    let pipeline_config = config.pipeline();
    let reporter = ProgressReporter::new(broker.clone());
    let orchestrator = Arc::new(Orchestrator::new(
        pipeline::standard_stages(&pipeline_config, Arc::new(r2_client)),
        pipeline_config.queue_capacity,
        pipeline_config.sink_workers,
        reporter.clone(),
        ResultSink::new(broker.clone()),
    ));

    let ctx = CancellationToken::new();
    let pipeline_task = {
        let orchestrator = orchestrator.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { orchestrator.run(ctx).await })
    };

    let intake = Intake::new(verifier, broker.clone(), reporter, orchestrator.clone());
    let state = AppState::new(intake, broker);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/uploads", post(routes::upload::submit_upload))
        .route(
            "/api/v1/uploads/{job_id}/status",
            get(routes::status::get_upload_status),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Intake is closed; let queued jobs drain before cancelling the rest.
    tracing::info!("Draining pipeline");
    orchestrator.close().await;
    match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, pipeline_task).await {
        Ok(Ok(())) => tracing::info!("Pipeline drained"),
        Ok(Err(e)) => tracing::error!(error = %e, "Pipeline task failed"),
        Err(_) => {
            tracing::warn!("Pipeline drain timed out, cancelling in-flight jobs");
            ctx.cancel();
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
