use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use image_jobs::{
    app_state::AppState,
    config::AppConfig,
    db,
    routes::{self, metrics::MetricsState},
    services::{
        queue::JobQueue,
        storage::{ArtifactStore, LocalArtifactStore, R2ArtifactStore},
        submission::DirectivePolicy,
    },
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

    tracing::info!("Initializing image-jobs API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("image_jobs_submitted_total", "Jobs accepted and enqueued");
    metrics::describe_counter!(
        "image_jobs_publish_failures_total",
        "Jobs persisted but not enqueued (stranded in PENDING)"
    );
    metrics::describe_gauge!("image_jobs_queue_depth", "Messages waiting in the work queue");

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis work queue
    tracing::info!(queue = %config.queue_name, "Connecting to Redis work queue");
    let queue = JobQueue::new(&config.redis_url, &config.queue_name, &config.consumer_name)
        .expect("Failed to initialize job queue");

    let artifacts: Arc<dyn ArtifactStore> = match config.r2() {
        Some(r2) => {
            tracing::info!(bucket = r2.bucket, "Reading artifacts from R2");
            Arc::new(R2ArtifactStore::new(r2).expect("Failed to initialize R2 client"))
        }
        None => {
            tracing::info!(dir = %config.artifact_dir, "Reading artifacts from local directory");
            Arc::new(LocalArtifactStore::new(&config.artifact_dir))
        }
    };

    let policy = DirectivePolicy::from_strict_flag(config.strict_directives);
    tracing::info!(?policy, "Directive policy");

    let state = AppState::new(db_pool.clone(), queue, artifacts, policy);

    let metrics_state = MetricsState {
        handle: prometheus_handle,
        app: state.clone(),
    };

    let app = routes::router(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    tracing::info!("Starting image-jobs on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");

    db_pool.close().await;
}
