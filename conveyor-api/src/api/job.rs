//! Job API Handlers
//!
//! The body is decoded by hand so malformed JSON maps to the
//! `invalid_json` error code instead of the extractor's plain-text
//! rejection.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use uuid::Uuid;

use conveyor_core::job::Job;

use crate::api::SharedStore;
use crate::api::error::{ApiError, ApiResult};
use crate::service::job as job_service;

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type", default)]
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_attempts: i32,
}

/// POST /jobs
/// Submit a new job; an `Idempotency-Key` header makes the call safe to
/// replay.
pub async fn create_job(
    State(store): State<SharedStore>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let req: CreateJobRequest =
        serde_json::from_slice(&body).map_err(|_| ApiError::BadRequest("invalid_json"))?;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let id = Uuid::new_v4().to_string();

    let job = job_service::create(
        store.as_ref(),
        id,
        req.job_type,
        req.payload,
        req.max_attempts,
        idempotency_key,
    )
    .await
    .map_err(|e| match e {
        job_service::SubmitError::InvalidInput => {
            ApiError::BadRequest("type_and_payload_required")
        }
        job_service::SubmitError::Store(err) => {
            tracing::error!("create job failed: {:#}", err);
            ApiError::Internal("create_failed")
        }
    })?;

    tracing::info!("Job created: {} type={}", job.id, job.job_type);

    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(store): State<SharedStore>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    let job = store.get_by_id(&id).await.map_err(|err| {
        tracing::error!("fetch job {} failed: {:#}", id, err);
        ApiError::Internal("fetch_failed")
    })?;

    match job {
        Some(job) => Ok(Json(job)),
        None => Err(ApiError::NotFound("not_found")),
    }
}
