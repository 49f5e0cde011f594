//! Poll loop
//!
//! Single driver per worker process: waits for the next tick, claims a
//! batch of due jobs under this worker's lease, and hands them to the
//! local pool. A refused submit releases the lease so the job is not
//! hoarded by a saturated worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conveyor_core::store::JobStore;

use crate::config::Config;
use crate::pool::Pool;

/// Jobs claimed per tick.
const CLAIM_BATCH_LIMIT: i64 = 10;
/// Requeue delay when the local pool refuses a job.
const BACKPRESSURE_DELAY: Duration = Duration::from_millis(250);
/// Drain budget for in-flight work at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Poller {
    config: Config,
    store: Arc<dyn JobStore>,
    pool: Pool,
}

impl Poller {
    pub fn new(config: Config, store: Arc<dyn JobStore>, pool: Pool) -> Self {
        Self {
            config,
            store,
            pool,
        }
    }

    /// Runs until cancelled, then drains the pool.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            "Starting poll loop (interval: {:?})",
            self.config.poll_interval
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let dispatched = self.poll_once().await;
                    if dispatched > 0 {
                        debug!("Dispatched {} job(s) this cycle", dispatched);
                    }
                }
            }
        }

        info!("shutting down worker...");
        if !self.pool.stop(SHUTDOWN_TIMEOUT).await {
            warn!("pool drain timed out; leased jobs will be recovered after expiry");
        }
        info!("worker stopped");
    }

    /// One claim-and-dispatch cycle. Claim errors abandon the tick; the
    /// next tick retries.
    async fn poll_once(&self) -> usize {
        let claimed = match self
            .store
            .claim(
                &self.config.worker_id,
                CLAIM_BATCH_LIMIT,
                self.config.lease,
                Utc::now(),
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                warn!("claim error: {:#}", err);
                return 0;
            }
        };

        let mut dispatched = 0;
        for job in claimed {
            let job_id = job.id.clone();
            let attempts = job.attempts;

            if self.pool.submit(job) {
                dispatched += 1;
                continue;
            }

            // Backpressure: reschedule quickly and release the lease.
            // Attempts are passed through unchanged; a full queue is
            // not a failed execution.
            let next_run =
                Utc::now() + chrono::Duration::milliseconds(BACKPRESSURE_DELAY.as_millis() as i64);
            match self
                .store
                .mark_failure(
                    &job_id,
                    attempts,
                    Some(next_run),
                    "queue full - rescheduled",
                    false,
                    None,
                )
                .await
            {
                Ok(()) => info!("queue full: rescheduled job {}", job_id),
                Err(err) => warn!("job {} backpressure release failed: {:#}", job_id, err),
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use conveyor_core::job::{Job, JobStatus, NewJob};
    use conveyor_store::MemoryJobStore;

    use crate::pool::JobHandler;

    struct NoopHandler;

    #[async_trait]
    impl JobHandler for NoopHandler {
        async fn process(&self, _job: Job) {}
    }

    fn test_config() -> Config {
        Config {
            worker_id: "w1".to_string(),
            ..Config::default()
        }
    }

    async fn seed(store: &MemoryJobStore, id: &str) {
        store
            .create_job(NewJob {
                id: id.to_string(),
                job_type: "email".to_string(),
                payload: serde_json::json!({"to": "a"}),
                max_attempts: 3,
                idempotency_key: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_once_dispatches_claimed_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "j1").await;
        seed(&store, "j2").await;

        let pool = Pool::new(Arc::new(NoopHandler), 2, 8);
        let poller = Poller::new(test_config(), Arc::clone(&store) as Arc<dyn JobStore>, pool);

        assert_eq!(poller.poll_once().await, 2);
        assert!(poller.pool.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_backpressure_releases_lease_with_short_delay() {
        let store = Arc::new(MemoryJobStore::new());
        seed(&store, "j1").await;
        seed(&store, "j2").await;

        // One slot, and the executor cannot run between the two
        // submits, so the second claim is refused.
        let pool = Pool::new(Arc::new(NoopHandler), 1, 1);
        let poller = Poller::new(test_config(), Arc::clone(&store) as Arc<dyn JobStore>, pool);

        let before = Utc::now();
        assert_eq!(poller.poll_once().await, 1);

        let released = store.job("j2").unwrap();
        assert_eq!(released.status, JobStatus::Pending);
        assert_eq!(released.attempts, 0);
        assert!(released.locked_by.is_none());
        let next_run = released.next_run_at.unwrap();
        assert!(next_run >= before + chrono::Duration::milliseconds(250));
        assert!(next_run <= Utc::now() + chrono::Duration::milliseconds(250));

        assert!(poller.pool.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let store = Arc::new(MemoryJobStore::new());
        let pool = Pool::new(Arc::new(NoopHandler), 1, 1);
        let poller = Poller::new(test_config(), store as Arc<dyn JobStore>, pool);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        poller.run(shutdown).await;
    }
}
