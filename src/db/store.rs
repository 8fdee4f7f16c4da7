//! Persistence capability for jobs.
//!
//! The worker and the HTTP services only talk to the [`JobStore`] trait, so the
//! state machine can be exercised without a database.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::queries;
use crate::models::job::{Job, JobId, NewJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job in `PENDING`.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Read a job. Unknown ids yield `None`.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Take ownership of a job by moving it to `PROCESSING`.
    ///
    /// Succeeds only if the stored version still equals `expected_version` and the job
    /// is not `COMPLETED`. Returns the version the caller now holds.
    async fn claim(&self, id: JobId, expected_version: i64) -> Result<Option<i64>, StoreError>;

    /// Commit `COMPLETED` with `result_ref`. False when `version` is no longer current.
    async fn complete(&self, id: JobId, version: i64, result_ref: &str) -> Result<bool, StoreError>;

    /// Commit `FAILED` with `error_detail`. False when `version` is no longer current.
    async fn fail(&self, id: JobId, version: i64, error_detail: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job store unavailable: {0}")]
    Unavailable(String),
}

/// [`JobStore`] backed by PostgreSQL. Each call borrows one pooled connection.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        Ok(queries::create_job(&self.pool, &job).await?)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(queries::get_job(&self.pool, id).await?)
    }

    async fn claim(&self, id: JobId, expected_version: i64) -> Result<Option<i64>, StoreError> {
        Ok(queries::claim_job(&self.pool, id, expected_version).await?)
    }

    async fn complete(&self, id: JobId, version: i64, result_ref: &str) -> Result<bool, StoreError> {
        Ok(queries::complete_job(&self.pool, id, version, result_ref).await?)
    }

    async fn fail(&self, id: JobId, version: i64, error_detail: &str) -> Result<bool, StoreError> {
        Ok(queries::fail_job(&self.pool, id, version, error_detail).await?)
    }
}
