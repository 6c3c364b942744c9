//! PostgreSQL job store.
//!
//! Both job tables are addressed through [`JobKind::table`]; the statements
//! differ only in the kind-specific input and result columns. Every write is
//! one conditional `UPDATE` whose affected-row count tells the caller whether
//! it still owned the row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use handbook_core::{
    Error, Job, JobKind, JobOutput, JobStatus, JobStore, NewJob, QueueStats, Result, SweepReport,
};

/// PostgreSQL implementation of [`JobStore`].
#[derive(Clone)]
pub struct PgJobStore {
    pool: Pool<Postgres>,
    default_max_attempts: i32,
}

impl PgJobStore {
    /// Create a new store with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            default_max_attempts: handbook_core::defaults::JOB_MAX_ATTEMPTS,
        }
    }

    /// Override `max_attempts` for jobs enqueued without an explicit value.
    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Column list shared by every SELECT/RETURNING, normalised across kinds.
    fn select_columns(kind: JobKind) -> &'static str {
        match kind {
            JobKind::Ocr => {
                "id, status::text AS status, file_path AS input_reference,
                 NULL::text AS input_text, NULL::jsonb AS input_metadata,
                 result AS result_text, NULL::jsonb AS result_json,
                 error_message, last_error, attempts, max_attempts, claimed_by,
                 claimed_at, heartbeat_at, run_after, created_at, updated_at"
            }
            JobKind::Analyze => {
                "id, status::text AS status, document_id::text AS input_reference,
                 input_text, input_metadata,
                 NULL::text AS result_text, result AS result_json,
                 error_message, last_error, attempts, max_attempts, claimed_by,
                 claimed_at, heartbeat_at, run_after, created_at, updated_at"
            }
        }
    }

    /// Parse a row produced with [`Self::select_columns`].
    fn parse_job_row(kind: JobKind, row: sqlx::postgres::PgRow) -> Result<Job> {
        let status: String = row.try_get("status")?;
        let result_text: Option<String> = row.try_get("result_text")?;
        let result_json: Option<JsonValue> = row.try_get("result_json")?;
        let result = match (result_text, result_json) {
            (Some(text), _) => Some(JobOutput::Text(text)),
            (None, Some(json)) => Some(JobOutput::Json(json)),
            (None, None) => None,
        };

        Ok(Job {
            id: row.try_get("id")?,
            kind,
            status: status.parse::<JobStatus>()?,
            input_reference: row.try_get("input_reference")?,
            input_text: row.try_get("input_text")?,
            input_metadata: row.try_get("input_metadata")?,
            result,
            error_message: row.try_get("error_message")?,
            last_error: row.try_get("last_error")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_at: row.try_get("claimed_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            run_after: row.try_get("run_after")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn delay_until(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
        now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
    }

    /// Delete a job row. Only used by test cleanup and operator tooling.
    pub async fn delete(&self, kind: JobKind, job_id: Uuid) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE id = $1", kind.table());
        let result = sqlx::query(&query)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid> {
        let job_id = Uuid::now_v7();
        let now = Utc::now();
        let max_attempts = job.max_attempts.unwrap_or(self.default_max_attempts);

        match job.kind {
            JobKind::Ocr => {
                if job.input_reference.trim().is_empty() {
                    return Err(Error::InvalidInput("OCR job needs a file path".into()));
                }
                sqlx::query(
                    "INSERT INTO ocr_jobs (id, status, file_path, max_attempts, run_after, created_at, updated_at)
                     VALUES ($1, 'pending'::job_status, $2, $3, $4, $4, $4)",
                )
                .bind(job_id)
                .bind(&job.input_reference)
                .bind(max_attempts)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
            }
            JobKind::Analyze => {
                let document_id = Uuid::parse_str(&job.input_reference).map_err(|e| {
                    Error::InvalidInput(format!(
                        "Analyze job needs a document id, got '{}': {}",
                        job.input_reference, e
                    ))
                })?;
                sqlx::query(
                    "INSERT INTO analyze_jobs (id, status, document_id, input_text, input_metadata,
                                               max_attempts, run_after, created_at, updated_at)
                     VALUES ($1, 'pending'::job_status, $2, $3, $4, $5, $6, $6, $6)",
                )
                .bind(job_id)
                .bind(document_id)
                .bind(&job.input_text)
                .bind(&job.input_metadata)
                .bind(max_attempts)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(Error::Database)?;
            }
        }

        debug!(
            subsystem = "db",
            component = "jobs",
            op = "enqueue",
            job_kind = %job.kind,
            %job_id,
            "Job enqueued"
        );
        Ok(job_id)
    }

    async fn get(&self, kind: JobKind, job_id: Uuid) -> Result<Option<Job>> {
        let query = format!(
            "SELECT {} FROM {} WHERE id = $1",
            Self::select_columns(kind),
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(|r| Self::parse_job_row(kind, r)).transpose()
    }

    async fn poll_once(&self, kind: JobKind) -> Result<Option<Job>> {
        // Plain read; ownership is decided by `claim`.
        let query = format!(
            "SELECT {} FROM {}
             WHERE status = 'pending'::job_status AND run_after <= $1
             ORDER BY created_at ASC
             LIMIT 1",
            Self::select_columns(kind),
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.map(|r| Self::parse_job_row(kind, r)).transpose()
    }

    async fn claim(&self, kind: JobKind, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let query = format!(
            "UPDATE {}
             SET status = 'processing'::job_status, updated_at = $1,
                 claimed_by = $2, claimed_at = $1, heartbeat_at = $1
             WHERE id = $3 AND status = 'pending'::job_status",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(Utc::now())
            .bind(worker_id)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(&self, kind: JobKind, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let query = format!(
            "UPDATE {} SET heartbeat_at = $1
             WHERE id = $2 AND status = 'processing'::job_status AND claimed_by = $3",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(Utc::now())
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn complete(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        output: &JobOutput,
    ) -> Result<bool> {
        let query = format!(
            "UPDATE {}
             SET status = 'done'::job_status, result = $1, error_message = NULL,
                 attempts = attempts + 1, heartbeat_at = NULL, updated_at = $2
             WHERE id = $3 AND status = 'processing'::job_status AND claimed_by = $4",
            kind.table()
        );

        let q = sqlx::query(&query);
        let q = match (kind, output) {
            (JobKind::Ocr, JobOutput::Text(text)) => q.bind(text.clone()),
            (JobKind::Ocr, JobOutput::Json(json)) => q.bind(json.to_string()),
            (JobKind::Analyze, JobOutput::Json(json)) => q.bind(json.clone()),
            (JobKind::Analyze, JobOutput::Text(text)) => q.bind(JsonValue::String(text.clone())),
        };

        let result = q
            .bind(Utc::now())
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
    ) -> Result<bool> {
        let query = format!(
            "UPDATE {}
             SET status = 'error'::job_status, error_message = $1, result = NULL,
                 attempts = attempts + 1, heartbeat_at = NULL, updated_at = $2
             WHERE id = $3 AND status = 'processing'::job_status AND claimed_by = $4",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(error)
            .bind(Utc::now())
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue(
        &self,
        kind: JobKind,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        delay: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let query = format!(
            "UPDATE {}
             SET status = 'pending'::job_status, attempts = attempts + 1, last_error = $1,
                 run_after = $2, claimed_by = NULL, claimed_at = NULL, heartbeat_at = NULL,
                 updated_at = $3
             WHERE id = $4 AND status = 'processing'::job_status AND claimed_by = $5",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(error)
            .bind(Self::delay_until(now, delay))
            .bind(now)
            .bind(job_id)
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue_stale(&self, kind: JobKind, stale_after: Duration) -> Result<SweepReport> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Exhausted jobs first so the requeue below only sees the rest.
        let abandon = format!(
            "UPDATE {}
             SET status = 'error'::job_status, result = NULL,
                 error_message = 'Abandoned by worker ' || COALESCE(claimed_by, 'unknown')
                                 || ' after ' || (attempts + 1) || ' attempt(s)',
                 attempts = attempts + 1, heartbeat_at = NULL, updated_at = $1
             WHERE status = 'processing'::job_status
               AND COALESCE(heartbeat_at, claimed_at, updated_at) < $2
               AND attempts + 1 >= max_attempts",
            kind.table()
        );
        let abandoned = sqlx::query(&abandon)
            .bind(now)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        let requeue = format!(
            "UPDATE {}
             SET status = 'pending'::job_status, attempts = attempts + 1,
                 last_error = 'Worker ' || COALESCE(claimed_by, 'unknown')
                              || ' stopped sending heartbeats',
                 claimed_by = NULL, claimed_at = NULL, heartbeat_at = NULL,
                 run_after = $1, updated_at = $1
             WHERE status = 'processing'::job_status
               AND COALESCE(heartbeat_at, claimed_at, updated_at) < $2",
            kind.table()
        );
        let requeued = sqlx::query(&requeue)
            .bind(now)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        tx.commit().await.map_err(Error::Database)?;

        if requeued > 0 || abandoned > 0 {
            warn!(
                subsystem = "db",
                component = "jobs",
                op = "requeue_stale",
                job_kind = %kind,
                requeued,
                abandoned,
                "Swept stale processing jobs"
            );
        }
        Ok(SweepReport {
            requeued,
            abandoned,
        })
    }

    async fn reset(&self, kind: JobKind, job_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        let query = format!(
            "UPDATE {}
             SET status = 'pending'::job_status, result = NULL, error_message = NULL,
                 last_error = NULL, attempts = 0, claimed_by = NULL, claimed_at = NULL,
                 heartbeat_at = NULL, run_after = $1, updated_at = $1
             WHERE id = $2 AND status = 'error'::job_status",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(now)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn stats(&self, kind: JobKind) -> Result<QueueStats> {
        let query = format!(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'error') AS error
             FROM {}",
            kind.table()
        );
        let row = sqlx::query(&query)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            done: row.try_get("done")?,
            error: row.try_get("error")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_columns_normalise_kind_specific_fields() {
        let ocr = PgJobStore::select_columns(JobKind::Ocr);
        assert!(ocr.contains("file_path AS input_reference"));
        assert!(ocr.contains("result AS result_text"));
        assert!(ocr.contains("NULL::jsonb AS result_json"));

        let analyze = PgJobStore::select_columns(JobKind::Analyze);
        assert!(analyze.contains("document_id::text AS input_reference"));
        assert!(analyze.contains("result AS result_json"));
        assert!(analyze.contains("NULL::text AS result_text"));
    }

    #[test]
    fn test_delay_until_adds_delay() {
        let now = Utc::now();
        let later = PgJobStore::delay_until(now, Duration::from_secs(30));
        assert_eq!((later - now).num_seconds(), 30);
    }
}
