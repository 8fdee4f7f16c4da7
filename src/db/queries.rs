use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::job::{Job, JobId, JobStatus, NewJob};

const JOB_COLUMNS: &str =
    "id, source_ref, directives, status, result_ref, error_detail, version, created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job, sqlx::Error> {
    let status_str: String = row.try_get("status")?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: Box::new(e),
        })?;
    let directives: sqlx::types::Json<Vec<String>> = row.try_get("directives")?;
    let id: uuid::Uuid = row.try_get("id")?;

    Ok(Job {
        id: JobId::from(id),
        source_ref: row.try_get("source_ref")?,
        directives: directives.0,
        status,
        result_ref: row.try_get("result_ref")?,
        error_detail: row.try_get("error_detail")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Insert a new job in `PENDING`.
pub async fn create_job(pool: &PgPool, job: &NewJob) -> Result<Job, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO image_jobs (id, source_ref, directives, status)
        VALUES ($1, $2, $3, 'PENDING')
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(job.id.as_uuid())
    .bind(&job.source_ref)
    .bind(sqlx::types::Json(&job.directives))
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: JobId) -> Result<Option<Job>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM image_jobs WHERE id = $1"))
        .bind(job_id.as_uuid())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Move a job to `PROCESSING` if nobody wrote it since `expected_version` was read
/// and it is not already `COMPLETED`. Returns the new version on success.
pub async fn claim_job(
    pool: &PgPool,
    job_id: JobId,
    expected_version: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE image_jobs
        SET status = 'PROCESSING',
            result_ref = NULL,
            error_detail = NULL,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1 AND version = $2 AND status <> 'COMPLETED'
        RETURNING version
        "#,
    )
    .bind(job_id.as_uuid())
    .bind(expected_version)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get("version")).transpose()
}

/// Write the terminal `COMPLETED` outcome. Returns false if the caller no longer
/// holds `version`.
pub async fn complete_job(
    pool: &PgPool,
    job_id: JobId,
    version: i64,
    result_ref: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE image_jobs
        SET status = 'COMPLETED',
            result_ref = $3,
            error_detail = NULL,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1 AND version = $2 AND status = 'PROCESSING'
        "#,
    )
    .bind(job_id.as_uuid())
    .bind(version)
    .bind(result_ref)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Write the terminal `FAILED` outcome. Returns false if the caller no longer
/// holds `version`.
pub async fn fail_job(
    pool: &PgPool,
    job_id: JobId,
    version: i64,
    error_detail: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE image_jobs
        SET status = 'FAILED',
            result_ref = NULL,
            error_detail = $3,
            version = version + 1,
            updated_at = NOW()
        WHERE id = $1 AND version = $2 AND status = 'PROCESSING'
        "#,
    )
    .bind(job_id.as_uuid())
    .bind(version)
    .bind(error_detail)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Count jobs stuck in `PENDING` (e.g. stranded by a failed publish).
pub async fn count_pending_jobs(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row = sqlx::query("SELECT COUNT(*) AS pending FROM image_jobs WHERE status = 'PENDING'")
        .fetch_one(pool)
        .await?;

    row.try_get("pending")
}
