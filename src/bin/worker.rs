use image_jobs::{
    config::AppConfig,
    db::{self, store::PgJobStore},
    services::{
        fetch::HttpFetcher,
        pipeline::TransformPool,
        queue::JobQueue,
        storage::{ArtifactStore, LocalArtifactStore, R2ArtifactStore},
        worker::{ConsumerSettings, JobConsumer},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting image job worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if let Some(addr) = &config.worker_metrics_addr {
        let addr: SocketAddr = addr.parse().expect("Invalid WORKER_METRICS_ADDR");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
        tracing::info!(%addr, "Serving worker metrics");
    }

    metrics::describe_histogram!(
        "image_jobs_processing_seconds",
        "Time from claim to terminal status for one job"
    );
    metrics::describe_counter!("image_jobs_completed_total", "Jobs that reached COMPLETED");
    metrics::describe_counter!("image_jobs_failed_total", "Jobs that reached FAILED");
    metrics::describe_counter!(
        "image_jobs_reclaimed_messages_total",
        "Messages taken over after sitting unacked past the visibility timeout"
    );
    metrics::describe_counter!(
        "image_jobs_duplicate_deliveries_total",
        "Deliveries skipped because the job was completed or owned elsewhere"
    );

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let queue = JobQueue::new(&config.redis_url, &config.queue_name, &config.consumer_name)
        .expect("Failed to initialize job queue");

    queue.init().await.expect("Failed to create consumer group");

    let fetcher = HttpFetcher::new(config.fetch_timeout(), config.max_image_bytes)
        .expect("Failed to initialize HTTP client");

    let artifacts: Arc<dyn ArtifactStore> = match config.r2() {
        Some(r2) => Arc::new(R2ArtifactStore::new(r2).expect("Failed to initialize R2 client")),
        None => Arc::new(LocalArtifactStore::new(&config.artifact_dir)),
    };

    let consumer = Arc::new(JobConsumer::new(
        Arc::new(PgJobStore::new(db_pool.clone())),
        Arc::new(fetcher),
        artifacts,
        TransformPool::new(config.transform_threads),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, stopping consumer");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(
        consumer = %config.consumer_name,
        max_in_flight = config.max_in_flight,
        visibility_timeout_secs = config.visibility_timeout_secs,
        transform_threads = config.transform_threads,
        "Worker ready, starting job processing loop"
    );

    consumer
        .run(
            Arc::new(queue),
            ConsumerSettings {
                max_in_flight: config.max_in_flight,
                poll_interval: config.poll_interval(),
                visibility_timeout: config.visibility_timeout(),
            },
            shutdown_rx,
        )
        .await;

    db_pool.close().await;
    tracing::info!("Worker stopped");
}
