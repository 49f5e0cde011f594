//! Work dispatch seam.
//!
//! Production deployments plug in an executor that dispatches on
//! `job.job_type`; the registry itself lives outside this crate.

use async_trait::async_trait;

use conveyor_core::job::Job;

/// Executes the work for one claimed job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> anyhow::Result<()>;
}

/// Demo executor failing a configurable fraction of runs, for
/// exercising the retry ladder end to end.
pub struct FailureInjector {
    fail_rate: f64,
}

impl FailureInjector {
    pub fn new(fail_rate: f64) -> Self {
        Self { fail_rate }
    }
}

#[async_trait]
impl JobExecutor for FailureInjector {
    async fn execute(&self, _job: &Job) -> anyhow::Result<()> {
        if rand::random::<f64>() < self.fail_rate {
            anyhow::bail!("simulated failure");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conveyor_core::job::JobStatus;

    fn test_job() -> Job {
        let now = Utc::now();
        Job {
            id: "j1".to_string(),
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

    #[tokio::test]
    async fn test_zero_rate_always_succeeds() {
        let executor = FailureInjector::new(0.0);
        for _ in 0..50 {
            assert!(executor.execute(&test_job()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_full_rate_always_fails_with_message() {
        let executor = FailureInjector::new(1.0);
        let err = executor.execute(&test_job()).await.unwrap_err();
        assert_eq!(err.to_string(), "simulated failure");
    }
}
