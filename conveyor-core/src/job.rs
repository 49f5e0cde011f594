//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attempt cap applied when a caller does not supply one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PENDING" => JobStatus::Pending,
            "RUNNING" => JobStatus::Running,
            "SUCCESS" => JobStatus::Success,
            "FAILED" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }

    /// Terminal states are absorbing; no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }
}

/// One unit of deferred work.
///
/// The canonical model shared by the API, the worker and the store.
/// `locked_by`/`locked_until` form the lease asserting a worker's
/// exclusive execution right until the wall-clock expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque to the scheduler; handlers interpret it.
    pub payload: serde_json::Value,

    pub status: JobStatus,

    // Retry
    pub attempts: i32,
    pub max_attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,

    // Idempotency
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    // Execution tracking
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    // Distributed locking (lease)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,

    // Metadata
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for inserting a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: i32,
    pub idempotency_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_status_parse_unknown_defaults_to_pending() {
        assert_eq!(JobStatus::parse("bogus"), JobStatus::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serializes_as_screaming_snake() {
        let json = serde_json::to_string(&JobStatus::Pending).unwrap();
        assert_eq!(json, "\"PENDING\"");
    }
}
