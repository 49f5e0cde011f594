//! Postgres job store
//!
//! All coordination between workers happens through the conditional
//! updates here: the claim query leases rows under `FOR UPDATE SKIP
//! LOCKED`, and every settlement is guarded by `status = 'RUNNING'` so
//! a caller that lost its lease affects zero rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use conveyor_core::error::{StoreError, StoreResult};
use conveyor_core::job::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus, NewJob};
use conveyor_core::store::JobStore;

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_job(&self, new: NewJob) -> StoreResult<Job> {
        if new.id.is_empty() {
            return Err(StoreError::InvalidInput("id is required"));
        }
        if new.job_type.is_empty() {
            return Err(StoreError::InvalidInput("type is required"));
        }
        if new.payload.is_null() {
            return Err(StoreError::InvalidInput("payload is required"));
        }
        let max_attempts = if new.max_attempts <= 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            new.max_attempts
        };

        let inserted = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs (
                id, type, payload, status,
                attempts, max_attempts,
                next_run_at,
                idempotency_key
            ) VALUES (
                $1, $2, $3, 'PENDING',
                0, $4,
                NOW(),
                $5
            )
            RETURNING id, type, payload, status, attempts, max_attempts,
                      next_run_at, idempotency_key,
                      started_at, completed_at, error_message,
                      locked_by, locked_until,
                      created_at, updated_at
            "#,
        )
        .bind(&new.id)
        .bind(&new.job_type)
        .bind(&new.payload)
        .bind(max_attempts)
        .bind(&new.idempotency_key)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(row) => Ok(row.into()),
            Err(err) => {
                // Idempotency collision: hand back the canonical row.
                if is_unique_violation(&err) {
                    if let Some(key) = &new.idempotency_key {
                        if let Some(existing) = self.get_by_idempotency_key(key).await? {
                            return Ok(existing);
                        }
                    }
                }
                Err(StoreError::storage(err))
            }
        }
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, type, payload, status, attempts, max_attempts,
                   next_run_at, idempotency_key,
                   started_at, completed_at, error_message,
                   locked_by, locked_until,
                   created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::storage)?;

        Ok(row.map(|r| r.into()))
    }

    async fn get_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, type, payload, status, attempts, max_attempts,
                   next_run_at, idempotency_key,
                   started_at, completed_at, error_message,
                   locked_by, locked_until,
                   created_at, updated_at
            FROM jobs
            WHERE idempotency_key = $1
            LIMIT 1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::storage)?;

        Ok(row.map(|r| r.into()))
    }

    async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>> {
        if worker_id.is_empty() {
            return Err(StoreError::InvalidInput("worker_id is required"));
        }
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let lease_until = now + chrono::Duration::milliseconds(lease.as_millis() as i64);

        // One atomic statement: lock-and-skip selection feeding the
        // lease update, so concurrent claimers partition the eligible
        // set. `started_at` keeps its original value across retries.
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH eligible AS (
                SELECT id
                FROM jobs
                WHERE
                    (
                        status = 'PENDING'
                        AND (next_run_at IS NULL OR next_run_at <= $2)
                        AND (locked_until IS NULL OR locked_until <= $2)
                    )
                    OR
                    (
                        status = 'RUNNING'
                        AND locked_until IS NOT NULL
                        AND locked_until <= $2
                    )
                ORDER BY next_run_at ASC NULLS FIRST, id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'RUNNING',
                locked_by = $1,
                locked_until = $4,
                started_at = COALESCE(started_at, $2),
                updated_at = $2
            FROM eligible
            WHERE jobs.id = eligible.id
            RETURNING jobs.id, jobs.type, jobs.payload, jobs.status,
                      jobs.attempts, jobs.max_attempts,
                      jobs.next_run_at, jobs.idempotency_key,
                      jobs.started_at, jobs.completed_at, jobs.error_message,
                      jobs.locked_by, jobs.locked_until,
                      jobs.created_at, jobs.updated_at
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(limit)
        .bind(lease_until)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::storage)?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn heartbeat(
        &self,
        job_id: &str,
        worker_id: &str,
        extend_by: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        if job_id.is_empty() {
            return Err(StoreError::InvalidInput("job_id is required"));
        }
        if worker_id.is_empty() {
            return Err(StoreError::InvalidInput("worker_id is required"));
        }

        let extended = now + chrono::Duration::milliseconds(extend_by.as_millis() as i64);

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_until = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(extended)
        .execute(&self.pool)
        .await
        .map_err(StoreError::storage)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StaleState("heartbeat"));
        }
        Ok(())
    }

    async fn mark_success(&self, job_id: &str, completed_at: DateTime<Utc>) -> StoreResult<()> {
        if job_id.is_empty() {
            return Err(StoreError::InvalidInput("job_id is required"));
        }

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'SUCCESS',
                completed_at = $2,
                error_message = NULL,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(completed_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::storage)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StaleState("mark_success"));
        }
        Ok(())
    }

    async fn mark_failure(
        &self,
        job_id: &str,
        attempts: i32,
        next_run_at: Option<DateTime<Utc>>,
        error: &str,
        terminal: bool,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        if job_id.is_empty() {
            return Err(StoreError::InvalidInput("job_id is required"));
        }
        let error = if error.is_empty() {
            "unknown error"
        } else {
            error
        };

        // Terminal failures get completed_at and no next run; retries
        // keep completed_at NULL and defer to next_run_at.
        let (status, completed, next): (
            &str,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
        ) = if terminal {
            ("FAILED", Some(completed_at.unwrap_or_else(Utc::now)), None)
        } else {
            ("PENDING", None, next_run_at)
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = $3,
                next_run_at = $4,
                completed_at = $5,
                error_message = $6,
                locked_by = NULL,
                locked_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(attempts)
        .bind(next)
        .bind(completed)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(StoreError::storage)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StaleState("mark_failure"));
        }
        Ok(())
    }

    async fn record_step_once(
        &self,
        job_id: &str,
        step_key: &str,
        result_hash: Option<&str>,
    ) -> StoreResult<bool> {
        if job_id.is_empty() {
            return Err(StoreError::InvalidInput("job_id is required"));
        }
        if step_key.is_empty() {
            return Err(StoreError::InvalidInput("step_key is required"));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO job_executions (job_id, step_key, result_hash)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(job_id)
        .bind(step_key)
        .bind(result_hash)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(true),
            // Duplicate composite key: the step already ran.
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(StoreError::storage(err)),
        }
    }
}

/// The only place duplicate-key detection touches driver specifics:
/// Postgres signals unique violations with SQLSTATE 23505.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err.as_database_error() {
        Some(db_err) => db_err.code().as_deref() == Some("23505"),
        None => false,
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    #[sqlx(rename = "type")]
    job_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    next_run_at: Option<DateTime<Utc>>,
    idempotency_key: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    locked_by: Option<String>,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: row.id,
            job_type: row.job_type,
            payload: row.payload,
            status: JobStatus::parse(&row.status),
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            next_run_at: row.next_run_at,
            idempotency_key: row.idempotency_key,
            started_at: row.started_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            locked_by: row.locked_by,
            locked_until: row.locked_until,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
