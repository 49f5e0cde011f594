//! Bounded worker pool with graceful shutdown.
//!
//! The poll loop is the single producer; a fixed set of executor tasks
//! consume the queue. `submit` never blocks: a full queue is the
//! backpressure signal the caller must handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use conveyor_core::job::Job;

/// Processes one claimed job through to settlement.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn process(&self, job: Job);
}

pub struct Pool {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    executors: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Spawns `workers` executor tasks reading from a bounded queue of
    /// `queue_size` slots.
    pub fn new(handler: Arc<dyn JobHandler>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let queue_size = queue_size.max(1);

        let (tx, rx) = mpsc::channel::<Job>(queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let executors = (0..workers)
            .map(|_| {
                let rx = Arc::clone(&rx);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    loop {
                        // The lock covers only the dequeue, not the work.
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => handler.process(job).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            executors: Mutex::new(executors),
        }
    }

    /// Tries to enqueue a job without blocking.
    /// Returns false if the queue is full or the pool is stopped.
    pub fn submit(&self, job: Job) -> bool {
        match self.tx.lock().unwrap().as_ref() {
            Some(tx) => tx.try_send(job).is_ok(),
            None => false,
        }
    }

    /// Stops accepting new work and drains queued work. Returns false
    /// when the executors did not finish within the deadline; their
    /// leases will be recovered by another worker after expiry.
    pub async fn stop(&self, deadline: Duration) -> bool {
        // Dropping the sender closes the channel once it is drained.
        self.tx.lock().unwrap().take();

        let executors = std::mem::take(&mut *self.executors.lock().unwrap());
        let drain = async {
            for handle in executors {
                let _ = handle.await;
            }
        };
        tokio::time::timeout(deadline, drain).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use conveyor_core::job::JobStatus;
    use tokio::sync::{Semaphore, mpsc::UnboundedSender};

    fn test_job(id: &str) -> Job {
        let now = Utc::now();
        Job {
            id: id.to_string(),
            job_type: "email".to_string(),
            payload: serde_json::json!({}),
            status: JobStatus::Running,
            attempts: 0,
            max_attempts: 3,
            next_run_at: None,
            idempotency_key: None,
            started_at: Some(now),
            completed_at: None,
            error_message: None,
            locked_by: Some("w1".to_string()),
            locked_until: Some(now + chrono::Duration::seconds(30)),
            created_at: now,
            updated_at: now,
        }
    }

    struct CountingHandler {
        processed: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn process(&self, _job: Job) {
            self.processed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct GatedHandler {
        started: UnboundedSender<String>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl JobHandler for GatedHandler {
        async fn process(&self, job: Job) {
            let _ = self.started.send(job.id);
            let _permit = self.gate.acquire().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_stop_drains_queued_jobs() {
        let handler = Arc::new(CountingHandler {
            processed: AtomicUsize::new(0),
        });
        let pool = Pool::new(Arc::clone(&handler) as Arc<dyn JobHandler>, 2, 8);

        for i in 0..5 {
            assert!(pool.submit(test_job(&format!("j{i}"))));
        }
        assert!(pool.stop(Duration::from_secs(5)).await);
        assert_eq!(handler.processed.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_submit_after_stop_returns_false() {
        let handler = Arc::new(CountingHandler {
            processed: AtomicUsize::new(0),
        });
        let pool = Pool::new(handler, 2, 4);

        assert!(pool.stop(Duration::from_secs(1)).await);
        assert!(!pool.submit(test_job("late")));
    }

    #[tokio::test]
    async fn test_submit_refuses_when_queue_full() {
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(GatedHandler {
            started: started_tx,
            gate: Arc::clone(&gate),
        });
        let pool = Pool::new(handler, 1, 1);

        // First job is picked up by the lone executor and held there.
        assert!(pool.submit(test_job("a")));
        assert_eq!(started_rx.recv().await.as_deref(), Some("a"));

        // Second fills the single queue slot; third is refused.
        assert!(pool.submit(test_job("b")));
        assert!(!pool.submit(test_job("c")));

        gate.add_permits(2);
        assert!(pool.stop(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_stop_times_out_on_stuck_executor() {
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let gate = Arc::new(Semaphore::new(0));
        let handler = Arc::new(GatedHandler {
            started: started_tx,
            gate: Arc::clone(&gate),
        });
        let pool = Pool::new(handler, 1, 1);

        assert!(pool.submit(test_job("stuck")));
        assert_eq!(started_rx.recv().await.as_deref(), Some("stuck"));

        assert!(!pool.stop(Duration::from_millis(50)).await);
    }
}
