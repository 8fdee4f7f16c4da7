use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Ignored by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Redis connection string for the work queue
    pub redis_url: String,

    /// Name of the single work queue
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Name of this worker within the consumer group. Defaults to the host name.
    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Local directory for result artifacts when R2 is not configured
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    /// R2 bucket name. When set, artifacts go to R2 instead of `artifact_dir`.
    pub r2_bucket: Option<String>,
    pub r2_endpoint: Option<String>,
    pub r2_access_key: Option<String>,
    pub r2_secret_key: Option<String>,

    /// Upper bound on a single source download
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// Largest source image accepted, in bytes
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,

    /// Messages a single consumer processes concurrently
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Concurrent CPU-bound transforms; defaults to available parallelism
    #[serde(default = "default_transform_threads")]
    pub transform_threads: usize,

    /// Reject submissions containing unknown or malformed directives
    #[serde(default = "default_strict_directives")]
    pub strict_directives: bool,

    /// Worker-only Prometheus listener (e.g., "0.0.0.0:9100"); disabled when unset
    pub worker_metrics_addr: Option<String>,

    /// Sleep between polls of an empty queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Unacked messages idle this long are reclaimed by any worker
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_queue_name() -> String {
    "image_processing_queue".to_string()
}

fn default_consumer_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4().simple()))
}

fn default_artifact_dir() -> String {
    "processed_images".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_image_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_max_in_flight() -> usize {
    8
}

fn default_transform_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

fn default_strict_directives() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    /// R2 credentials, if all four settings are present.
    pub fn r2(&self) -> Option<R2Settings<'_>> {
        Some(R2Settings {
            bucket: self.r2_bucket.as_deref()?,
            endpoint: self.r2_endpoint.as_deref()?,
            access_key: self.r2_access_key.as_deref()?,
            secret_key: self.r2_secret_key.as_deref()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct R2Settings<'a> {
    pub bucket: &'a str,
    pub endpoint: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
}
