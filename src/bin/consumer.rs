use image_relay::{
    config::AppConfig,
    db::{self, queries, queries::PgResultApplier},
    services::{
        broker::ResultStream,
        consumer::ResultConsumer,
        queue::RedisBroker,
        reclaimer::OrphanReclaimer,
    },
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting result consumer");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");
    let pool_config = config
        .database()
        .expect("Database settings missing from environment");

    // Initialize database
    tracing::info!(
        max_connections = pool_config.max_connections,
        "Connecting to PostgreSQL"
    );
    let db_pool = db::init_pool(&pool_config)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Blocking reads park their connection, so they get one of their own.
    tracing::info!("Connecting to Redis");
    let broker = Arc::new(
        RedisBroker::connect(config.broker())
            .await
            .expect("Failed to connect to Redis"),
    );
    let reader = Arc::new(
        RedisBroker::connect(config.broker())
            .await
            .expect("Failed to connect to Redis"),
    );
    broker
        .ensure_group()
        .await
        .expect("Failed to create consumer group");

    let consumer = Arc::new(
        ResultConsumer::new(
            broker.clone(),
            Arc::new(PgResultApplier::new(db_pool.clone())),
            config.consumer(),
        )
        .with_reader(reader),
    );
    let reclaimer = OrphanReclaimer::new(broker.clone(), consumer.clone(), config.reclaimer());

    tracing::info!(consumer = %consumer.name(), "Consumer ready");

    let cancel = CancellationToken::new();
    let consumer_task = {
        let consumer = consumer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };
    let reclaimer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { reclaimer.run(cancel).await })
    };
    let prune_task = tokio::spawn(prune_entries(
        db_pool,
        config.entry_retention(),
        cancel.clone(),
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
    }
    cancel.cancel();

    match consumer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Result consumer failed"),
        Err(e) => tracing::error!(error = %e, "Result consumer task panicked"),
    }
    if let Err(e) = reclaimer_task.await {
        tracing::error!(error = %e, "Reclaimer task panicked");
    }
    if let Err(e) = prune_task.await {
        tracing::error!(error = %e, "Entry pruning task panicked");
    }
    tracing::info!("Result consumer stopped");
}

/// Periodically forgets applied entry ids past the retention window.
async fn prune_entries(pool: PgPool, retention: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match queries::prune_applied_entries(&pool, retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Pruned applied entry ids"),
            Err(e) => tracing::error!(error = %e, "Failed to prune applied entry ids"),
        }
    }
}
