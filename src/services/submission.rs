//! Submission and status query services.

use garde::Validate;

use crate::db::store::{JobStore, StoreError};
use crate::models::api::{JobStatusResponse, SubmitJobRequest};
use crate::models::directive::{parse_strict, DirectiveError};
use crate::models::job::{JobId, NewJob};
use crate::services::queue::{JobPublisher, QueueError, WorkMessage};

/// How the submission path treats directives it cannot parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectivePolicy {
    /// Reject the whole submission.
    Strict,
    /// Accept it; the worker skips what it cannot parse.
    Lenient,
}

impl DirectivePolicy {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict {
            DirectivePolicy::Strict
        } else {
            DirectivePolicy::Lenient
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job store unavailable: {0}")]
    Store(#[from] StoreError),

    /// The job row exists but no work message was published; it stays `PENDING`.
    #[error("Queue unavailable, job {job_id} was not enqueued: {source}")]
    NotEnqueued {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

impl From<garde::Report> for SubmitError {
    fn from(report: garde::Report) -> Self {
        SubmitError::Validation(report.to_string())
    }
}

impl From<DirectiveError> for SubmitError {
    fn from(e: DirectiveError) -> Self {
        SubmitError::Validation(e.to_string())
    }
}

/// Validate a submission, persist it as `PENDING` and publish its work message.
///
/// Returns only after the row exists. If publishing fails the row is left behind
/// and the caller gets [`SubmitError::NotEnqueued`], never a job id.
pub async fn submit(
    store: &dyn JobStore,
    publisher: &dyn JobPublisher,
    request: SubmitJobRequest,
    policy: DirectivePolicy,
) -> Result<JobId, SubmitError> {
    request.validate()?;
    if policy == DirectivePolicy::Strict {
        parse_strict(&request.directives)?;
    }

    let job = store
        .insert(NewJob {
            id: JobId::new(),
            source_ref: request.source_ref,
            directives: request.directives,
        })
        .await?;

    let message = WorkMessage {
        job_id: job.id,
        image_url: job.source_ref,
        transformations: job.directives,
    };

    if let Err(source) = publisher.publish(&message).await {
        tracing::error!(
            job_id = %job.id,
            error = %source,
            "Failed to publish work message, job is stranded in PENDING"
        );
        metrics::counter!("image_jobs_publish_failures_total").increment(1);
        return Err(SubmitError::NotEnqueued {
            job_id: job.id,
            source,
        });
    }

    metrics::counter!("image_jobs_submitted_total").increment(1);
    tracing::info!(job_id = %job.id, "Job submitted");

    Ok(job.id)
}

/// Look up a job's current state. Malformed and unknown ids are both `None`.
pub async fn get_status(
    store: &dyn JobStore,
    raw_id: &str,
) -> Result<Option<JobStatusResponse>, StoreError> {
    let Ok(job_id) = raw_id.parse::<JobId>() else {
        return Ok(None);
    };

    Ok(store.get(job_id).await?.map(JobStatusResponse::from))
}
