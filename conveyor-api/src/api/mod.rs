//! API Module
//!
//! HTTP layer for the submission surface. Handler panics are caught at
//! the boundary and rendered as a 500 JSON body.

pub mod error;
pub mod health;
pub mod job;

use std::any::Any;
use std::sync::Arc;

use axum::{
    Router,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use conveyor_core::store::JobStore;

pub type SharedStore = Arc<dyn JobStore>;

/// Create the API router with all endpoints
pub fn create_router(store: SharedStore) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/jobs", post(job::create_job))
        .route("/jobs/{id}", get(job::get_job))
        .with_state(store)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(handle_panic))
}

fn handle_panic(_err: Box<dyn Any + Send + 'static>) -> axum::response::Response {
    error::ApiError::Internal("internal_server_error").into_response()
}
