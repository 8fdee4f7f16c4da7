use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::api::{JobStatusResponse, SubmitJobRequest, SubmitJobResponse};
use crate::models::job::JobStatus;
use crate::services::storage::{result_key, RESULT_CONTENT_TYPE};
use crate::services::submission;

/// POST /api/v1/images/process: submit an image for transformation.
pub async fn submit_job(
    State(state): State<AppState>,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let Json(request) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let job_id = submission::submit(
        state.store.as_ref(),
        state.publisher.as_ref(),
        request,
        state.directive_policy,
    )
    .await?;

    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

/// GET /api/v1/images/jobs/{job_id}: poll a job's status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    submission::get_status(state.store.as_ref(), &job_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))
}

/// GET /api/v1/images/jobs/{job_id}/result: download the result of a completed job.
pub async fn get_job_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = submission::get_status(state.store.as_ref(), &job_id)
        .await?
        .filter(|job| job.status == JobStatus::Completed)
        .ok_or_else(|| ApiError::not_found(format!("no result for job {job_id}")))?;

    let bytes = state.artifacts.get(&result_key(job.job_id)).await?;

    Ok(([(header::CONTENT_TYPE, RESULT_CONTENT_TYPE)], bytes))
}
