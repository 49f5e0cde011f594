//! Job Service
//!
//! Validation and idempotency handling for job submission.

use conveyor_core::error::StoreError;
use conveyor_core::job::{DEFAULT_MAX_ATTEMPTS, Job, NewJob};
use conveyor_core::store::JobStore;

/// Service error type
#[derive(Debug)]
pub enum SubmitError {
    InvalidInput,
    Store(StoreError),
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidInput(_) => SubmitError::InvalidInput,
            other => SubmitError::Store(other),
        }
    }
}

/// Validate and create a job.
///
/// A colliding idempotency key returns the pre-existing job unchanged
/// (the store guarantees it); `max_attempts <= 0` falls back to the
/// default of 3.
pub async fn create(
    store: &dyn JobStore,
    id: String,
    job_type: String,
    payload: serde_json::Value,
    max_attempts: i32,
    idempotency_key: Option<String>,
) -> Result<Job, SubmitError> {
    if job_type.trim().is_empty() || payload.is_null() {
        return Err(SubmitError::InvalidInput);
    }
    let max_attempts = if max_attempts <= 0 {
        DEFAULT_MAX_ATTEMPTS
    } else {
        max_attempts
    };

    let job = store
        .create_job(NewJob {
            id,
            job_type,
            payload,
            max_attempts,
            idempotency_key: normalize_idempotency_key(idempotency_key),
        })
        .await?;

    Ok(job)
}

/// Trims the caller-supplied key; empty means absent.
pub fn normalize_idempotency_key(key: Option<String>) -> Option<String> {
    let key = key?.trim().to_string();
    if key.is_empty() { None } else { Some(key) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::job::JobStatus;
    use conveyor_store::MemoryJobStore;

    #[test]
    fn test_normalize_idempotency_key() {
        assert_eq!(normalize_idempotency_key(None), None);
        assert_eq!(normalize_idempotency_key(Some("".into())), None);
        assert_eq!(normalize_idempotency_key(Some("   ".into())), None);
        assert_eq!(
            normalize_idempotency_key(Some("  K1 ".into())),
            Some("K1".into())
        );
    }

    #[tokio::test]
    async fn test_create_applies_default_max_attempts() {
        let store = MemoryJobStore::new();
        let job = create(
            &store,
            "j1".into(),
            "email".into(),
            serde_json::json!({"to": "a"}),
            0,
            None,
        )
        .await
        .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_create_rejects_blank_type_and_null_payload() {
        let store = MemoryJobStore::new();
        assert!(matches!(
            create(
                &store,
                "j1".into(),
                "  ".into(),
                serde_json::json!({}),
                3,
                None
            )
            .await,
            Err(SubmitError::InvalidInput)
        ));
        assert!(matches!(
            create(
                &store,
                "j1".into(),
                "email".into(),
                serde_json::Value::Null,
                3,
                None
            )
            .await,
            Err(SubmitError::InvalidInput)
        ));
    }

    #[tokio::test]
    async fn test_replayed_submit_returns_same_job() {
        let store = MemoryJobStore::new();
        let first = create(
            &store,
            "j1".into(),
            "email".into(),
            serde_json::json!({"to": "a"}),
            3,
            Some("K".into()),
        )
        .await
        .unwrap();

        let second = create(
            &store,
            "j2".into(),
            "email".into(),
            serde_json::json!({"to": "a"}),
            3,
            Some("K".into()),
        )
        .await
        .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.idempotency_key.as_deref(), Some("K"));
    }
}
