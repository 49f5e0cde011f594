//! In-memory job store
//!
//! Implements the repository contract over a mutex-guarded map with the
//! same eligibility, ordering and conditional-update semantics as the
//! Postgres store. Used by tests that exercise claim/settle behavior
//! without a database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conveyor_core::error::{StoreError, StoreResult};
use conveyor_core::job::{DEFAULT_MAX_ATTEMPTS, Job, JobStatus, NewJob};
use conveyor_core::store::JobStore;

#[derive(Default)]
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    jobs: BTreeMap<String, Job>,
    steps: HashMap<(String, String), Option<String>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot a job for assertions.
    pub fn job(&self, id: &str) -> Option<Job> {
        self.inner.lock().unwrap().jobs.get(id).cloned()
    }

    /// True when the `(job_id, step_key)` marker exists.
    pub fn step_recorded(&self, job_id: &str, step_key: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .steps
            .contains_key(&(job_id.to_string(), step_key.to_string()))
    }
}

fn eligible(job: &Job, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Pending => {
            job.next_run_at.is_none_or(|t| t <= now) && job.locked_until.is_none_or(|t| t <= now)
        }
        // Lease recovery: an expired RUNNING row is claimable again.
        JobStatus::Running => job.locked_until.is_some_and(|t| t <= now),
        _ => false,
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
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

        let mut inner = self.inner.lock().unwrap();

        if let Some(key) = &new.idempotency_key {
            if let Some(existing) = inner
                .jobs
                .values()
                .find(|j| j.idempotency_key.as_deref() == Some(key.as_str()))
            {
                return Ok(existing.clone());
            }
        }
        if inner.jobs.contains_key(&new.id) {
            return Err(StoreError::storage(anyhow::anyhow!(
                "duplicate key: jobs.id"
            )));
        }

        let now = Utc::now();
        let job = Job {
            id: new.id.clone(),
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts,
            next_run_at: Some(now),
            idempotency_key: new.idempotency_key,
            started_at: None,
            completed_at: None,
            error_message: None,
            locked_by: None,
            locked_until: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(new.id, job.clone());
        Ok(job)
    }

    async fn get_by_id(&self, id: &str) -> StoreResult<Option<Job>> {
        Ok(self.inner.lock().unwrap().jobs.get(id).cloned())
    }

    async fn get_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Job>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| j.idempotency_key.as_deref() == Some(key))
            .cloned())
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

        let mut inner = self.inner.lock().unwrap();
        let lease_until = now + chrono::Duration::milliseconds(lease.as_millis() as i64);

        // next_run_at ascending with nulls first, ties broken by id.
        let mut ids: Vec<(Option<DateTime<Utc>>, String)> = inner
            .jobs
            .values()
            .filter(|j| eligible(j, now))
            .map(|j| (j.next_run_at, j.id.clone()))
            .collect();
        ids.sort();
        ids.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            if let Some(job) = inner.jobs.get_mut(&id) {
                job.status = JobStatus::Running;
                job.locked_by = Some(worker_id.to_string());
                job.locked_until = Some(lease_until);
                job.started_at = job.started_at.or(Some(now));
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
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

        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(job_id) {
            Some(job)
                if job.status == JobStatus::Running
                    && job.locked_by.as_deref() == Some(worker_id) =>
            {
                job.locked_until =
                    Some(now + chrono::Duration::milliseconds(extend_by.as_millis() as i64));
                job.updated_at = now;
                Ok(())
            }
            _ => Err(StoreError::StaleState("heartbeat")),
        }
    }

    async fn mark_success(&self, job_id: &str, completed_at: DateTime<Utc>) -> StoreResult<()> {
        if job_id.is_empty() {
            return Err(StoreError::InvalidInput("job_id is required"));
        }

        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Success;
                job.completed_at = Some(completed_at);
                job.error_message = None;
                job.locked_by = None;
                job.locked_until = None;
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::StaleState("mark_success")),
        }
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

        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Running => {
                if terminal {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(completed_at.unwrap_or_else(Utc::now));
                    job.next_run_at = None;
                } else {
                    job.status = JobStatus::Pending;
                    job.completed_at = None;
                    job.next_run_at = next_run_at;
                }
                job.attempts = attempts;
                job.error_message = Some(error.to_string());
                job.locked_by = None;
                job.locked_until = None;
                job.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(StoreError::StaleState("mark_failure")),
        }
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

        let mut inner = self.inner.lock().unwrap();
        let key = (job_id.to_string(), step_key.to_string());
        if inner.steps.contains_key(&key) {
            return Ok(false);
        }
        inner.steps.insert(key, result_hash.map(str::to_string));
        Ok(true)
    }
}
