//! Conveyor submission API
//!
//! Thin HTTP surface over the job store: accepts typed jobs with opaque
//! payloads, serves reads, and honors submission idempotency.

mod api;
mod service;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_core::store::JobStore;
use conveyor_store::{PgJobStore, db};

/// Drain budget for in-flight connections at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting conveyor API...");

    let database_url = std::env::var("DB_DSN").context("DB_DSN is required")?;

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(&database_url)
        .await
        .context("failed to create database pool")?;

    db::run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));
    let app = api::create_router(store);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("0.0.0.0:{port}");

    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("failed to bind to address")?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let server = axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .into_future();
    let mut server = std::pin::pin!(server);

    tokio::select! {
        result = &mut server => result.context("server error")?,
        _ = shutdown.cancelled() => {
            // Bound the post-signal drain; a stalled connection must
            // not hold the process open.
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server).await {
                Ok(result) => result.context("server error")?,
                Err(_) => tracing::warn!("connection drain timed out after {:?}", SHUTDOWN_TIMEOUT),
            }
        }
    }

    tracing::info!("api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutting down api...");
}
