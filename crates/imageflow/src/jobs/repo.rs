// crates/imageflow/src/jobs/repo.rs

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use crate::jobs::model::{Job, JobId, JobRow, JobStatus, NewJob, StatusCounts};
use crate::jobs::store::{ensure_converted_path, ensure_plain_status, JobStore};

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    // ----------------------------
    // Create
    // ----------------------------

    #[instrument(skip(self, job), fields(filename = %job.filename))]
    async fn create(&self, job: NewJob) -> anyhow::Result<JobId> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO images (filename, file_path, status, email)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&job.filename)
        .bind(&job.file_path)
        .bind(JobStatus::Uploaded.as_str())
        .bind(&job.email)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobId(id))
    }

    // ----------------------------
    // Reads
    // ----------------------------

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get(&self, id: JobId) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, filename, file_path, converted_path, status, email, created_at, updated_at
            FROM images
            WHERE id = $1
            "#,
        )
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose().map_err(Into::into)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// Only `Uploaded` rows (or rows already at `status`) match, so a repeat is
    /// a no-op and a terminal row is never moved to the other terminal state.
    #[instrument(skip(self), fields(job_id = %id, status = %status))]
    async fn set_status(&self, id: JobId, status: JobStatus) -> anyhow::Result<bool> {
        ensure_plain_status(status)?;

        let res = sqlx::query(
            r#"
            UPDATE images
            SET status = $2,
                updated_at = now()
            WHERE id = $1
              AND status IN ('Uploaded', $2)
            "#,
        )
        .bind(id.as_i64())
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Status and path move together in one UPDATE. A converted row only
    /// accepts the same path again.
    #[instrument(skip(self), fields(job_id = %id))]
    async fn set_converted(&self, id: JobId, converted_path: &str) -> anyhow::Result<bool> {
        ensure_converted_path(converted_path)?;

        let res = sqlx::query(
            r#"
            UPDATE images
            SET status = 'Converted',
                converted_path = $2,
                updated_at = now()
            WHERE id = $1
              AND (
                status = 'Uploaded'
                OR (status = 'Converted' AND converted_path = $2)
              )
            "#,
        )
        .bind(id.as_i64())
        .bind(converted_path)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // Metrics
    // ----------------------------

    async fn status_counts(&self) -> anyhow::Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM images
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(status.parse()?, n);
        }
        Ok(counts)
    }
}
