//! Repository contract
//!
//! The single coordination surface between the submission API, the
//! worker fleet and the database. Every operation is one atomic unit (a
//! transaction or an equivalent conditional update).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::job::{Job, NewJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `PENDING` job with `attempts = 0` and
    /// `next_run_at = now`.
    ///
    /// A unique-conflict on the idempotency key returns the existing
    /// job unchanged, not an error.
    async fn create_job(&self, new: NewJob) -> StoreResult<Job>;

    /// Fetch a job by id. `Ok(None)` when absent; never synthesized.
    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Job>>;

    /// Fetch a job by its idempotency key.
    async fn get_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Job>>;

    /// Atomically lease up to `limit` eligible jobs for this worker and
    /// move them to `RUNNING`.
    ///
    /// Eligible are `PENDING` jobs that are due and unlocked, plus
    /// `RUNNING` jobs whose lease has expired (crash recovery).
    /// Selection skips rows locked by concurrent claimers so that N
    /// polling workers partition the eligible set without contention.
    async fn claim(
        &self,
        worker_id: &str,
        limit: i64,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<Job>>;

    /// Extend the lease of an in-flight job. Succeeds only while the
    /// row is `RUNNING` and `locked_by` matches; otherwise
    /// [`StoreError::StaleState`](crate::error::StoreError).
    async fn heartbeat(
        &self,
        job_id: &str,
        worker_id: &str,
        extend_by: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Settle a job as `SUCCESS`. Conditional on the row still being
    /// `RUNNING`; zero rows affected is reported as stale state.
    async fn mark_success(&self, job_id: &str, completed_at: DateTime<Utc>) -> StoreResult<()>;

    /// Settle a failed attempt: terminal moves the job to `FAILED`,
    /// non-terminal re-queues it as `PENDING` at `next_run_at`. Either
    /// way the lease is released and `attempts` is set to the given
    /// value. Conditional on `RUNNING`, like [`mark_success`].
    ///
    /// [`mark_success`]: JobStore::mark_success
    async fn mark_failure(
        &self,
        job_id: &str,
        attempts: i32,
        next_run_at: Option<DateTime<Utc>>,
        error: &str,
        terminal: bool,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Record that a named side-effect step ran for a job. Returns
    /// `true` on first insertion, `false` when the `(job_id, step_key)`
    /// marker already exists.
    async fn record_step_once(
        &self,
        job_id: &str,
        step_key: &str,
        result_hash: Option<&str>,
    ) -> StoreResult<bool>;
}
