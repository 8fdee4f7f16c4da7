use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Job API and health routes. `/metrics` is mounted separately by the server.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/images/process", post(jobs::submit_job))
        .route("/api/v1/images/jobs/{job_id}", get(jobs::get_job_status))
        .route("/api/v1/images/jobs/{job_id}/result", get(jobs::get_job_result))
        .with_state(state)
}
