use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{Job, JobId, JobStatus};

/// Request to submit an image for transformation.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobRequest {
    #[serde(alias = "imageUrl")]
    #[garde(length(max = 2048), custom(validate_source_ref))]
    pub source_ref: String,

    #[serde(alias = "transformations")]
    #[garde(length(min = 1, max = 32), inner(length(min = 1, max = 64)))]
    pub directives: Vec<String>,
}

/// The source must be an absolute http(s) URL; anything else cannot be fetched.
fn validate_source_ref(value: &str, _: &()) -> garde::Result {
    let url = url::Url::parse(value)
        .map_err(|e| garde::Error::new(format!("not a valid absolute URL: {e}")))?;

    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(()),
        "http" | "https" => Err(garde::Error::new("URL has no host")),
        other => Err(garde::Error::new(format!("unsupported URL scheme: {other}"))),
    }
}

/// Response after submitting a job.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitJobResponse {
    pub job_id: JobId,
}

/// Read-only projection of a job for polling clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result_ref: Option<String>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            result_ref: job.result_ref,
            error_detail: job.error_detail,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}
