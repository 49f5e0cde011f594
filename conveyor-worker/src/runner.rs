//! Job runner
//!
//! Executes claimed jobs and settles outcomes: retry with backoff on
//! failure, and an exactly-once success guard via the step-marker
//! table. The runner never claims; jobs arrive already `RUNNING` under
//! this worker's lease.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use conveyor_core::job::Job;
use conveyor_core::store::JobStore;

use crate::backoff::BackoffConfig;
use crate::executor::JobExecutor;
use crate::pool::JobHandler;

/// Step key marking the success side-effect as performed.
const STEP_EXECUTE_SUCCESS: &str = "execute_success";

pub struct Runner {
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
    backoff: BackoffConfig,
    worker_id: String,
    lease: Duration,
}

impl Runner {
    pub fn new(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
        backoff: BackoffConfig,
        worker_id: String,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            backoff,
            worker_id,
            lease,
        }
    }

    fn heartbeat_interval(&self) -> Duration {
        // Extend at a third of the lease so a missed beat still leaves slack.
        (self.lease / 3).max(Duration::from_millis(100))
    }

    /// Runs the work function under a lease-extending heartbeat.
    /// Returns `None` when the heartbeat lost the lease and the work
    /// was cancelled; settlement then belongs to whichever worker
    /// recovered the job.
    async fn run_with_heartbeat(&self, job: &Job) -> Option<anyhow::Result<()>> {
        let lease_lost = CancellationToken::new();
        let heartbeat_stop = CancellationToken::new();

        let heartbeat = {
            let store = Arc::clone(&self.store);
            let job_id = job.id.clone();
            let worker_id = self.worker_id.clone();
            let extend_by = self.lease;
            let lease_lost = lease_lost.clone();
            let heartbeat_stop = heartbeat_stop.clone();
            let period = self.heartbeat_interval();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await; // skip the immediate first tick

                loop {
                    tokio::select! {
                        _ = heartbeat_stop.cancelled() => break,
                        _ = ticker.tick() => {
                            match store.heartbeat(&job_id, &worker_id, extend_by, Utc::now()).await {
                                Ok(()) => {}
                                Err(err) if err.is_stale() => {
                                    warn!("job {} lease lost, cancelling work", job_id);
                                    lease_lost.cancel();
                                    break;
                                }
                                Err(err) => warn!("job {} heartbeat error: {:#}", job_id, err),
                            }
                        }
                    }
                }
            })
        };

        let outcome = tokio::select! {
            result = self.executor.execute(job) => Some(result),
            _ = lease_lost.cancelled() => None,
        };

        heartbeat_stop.cancel();
        let _ = heartbeat.await;

        outcome
    }

    async fn settle_success(&self, job: &Job, started: Instant) {
        // Durable side-effect marker first; if it cannot be written the
        // success is not provable and the attempt is retried.
        let inserted = match self
            .store
            .record_step_once(&job.id, STEP_EXECUTE_SUCCESS, None)
            .await
        {
            Ok(inserted) => inserted,
            Err(err) => {
                error!("job {} record_step_once error: {:#}", job.id, err);
                self.settle_failure(job, "record-step failed").await;
                return;
            }
        };

        if let Err(err) = self.store.mark_success(&job.id, Utc::now()).await {
            if err.is_stale() {
                warn!("job {} mark_success rejected: {:#}", job.id, err);
            } else {
                error!("job {} mark_success error: {:#}", job.id, err);
            }
            return;
        }

        if inserted {
            info!("job {} SUCCESS ({:?})", job.id, started.elapsed());
        } else {
            // A prior attempt crashed after the side-effect but before
            // settlement; this settlement is a replay.
            info!(
                "job {} SUCCESS (idempotent replay) ({:?})",
                job.id,
                started.elapsed()
            );
        }
    }

    async fn settle_failure(&self, job: &Job, message: &str) {
        let next_attempts = job.attempts + 1;
        let terminal = next_attempts >= job.max_attempts;

        if terminal {
            match self
                .store
                .mark_failure(&job.id, next_attempts, None, message, true, Some(Utc::now()))
                .await
            {
                Ok(()) => info!(
                    "job {} FAILED terminal attempts={}/{}",
                    job.id, next_attempts, job.max_attempts
                ),
                Err(err) if err.is_stale() => {
                    warn!("job {} mark_failure rejected: {:#}", job.id, err)
                }
                Err(err) => error!("job {} mark_failure error: {:#}", job.id, err),
            }
            return;
        }

        let delay = self.backoff.next(next_attempts as u32);
        let next_run = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);

        match self
            .store
            .mark_failure(&job.id, next_attempts, Some(next_run), message, false, None)
            .await
        {
            Ok(()) => info!(
                "job {} RETRY scheduled attempts={}/{} next_in={:?}",
                job.id, next_attempts, job.max_attempts, delay
            ),
            Err(err) if err.is_stale() => {
                warn!("job {} mark_failure rejected: {:#}", job.id, err)
            }
            Err(err) => error!("job {} mark_failure error: {:#}", job.id, err),
        }
    }
}

#[async_trait]
impl JobHandler for Runner {
    async fn process(&self, job: Job) {
        let started = Instant::now();

        let Some(result) = self.run_with_heartbeat(&job).await else {
            // Another worker owns recovery once the lease is gone.
            warn!("job {} abandoned after losing its lease", job.id);
            return;
        };

        match result {
            Ok(()) => self.settle_success(&job, started).await,
            Err(err) => self.settle_failure(&job, &err.to_string()).await,
        }
    }
}
