//! Conveyor worker
//!
//! A member of the worker fleet: polls the shared store for due jobs,
//! claims them under a lease, executes them on a bounded local pool and
//! settles outcomes with retry/backoff. Crash recovery is implicit —
//! leases this process fails to settle expire and are re-claimed by
//! another worker.

mod backoff;
mod config;
mod executor;
mod pool;
mod poller;
mod runner;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_core::store::JobStore;
use conveyor_store::{PgJobStore, db};

use crate::config::Config;
use crate::executor::FailureInjector;
use crate::pool::Pool;
use crate::poller::Poller;
use crate::runner::Runner;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    config.validate()?;

    let pool = db::create_pool(&config.db_dsn)
        .await
        .context("db open failed")?;

    let store: Arc<dyn JobStore> = Arc::new(PgJobStore::new(pool));

    let runner = Arc::new(Runner::new(
        Arc::clone(&store),
        Arc::new(FailureInjector::new(config.fail_rate)),
        config.backoff,
        config.worker_id.clone(),
        config.lease,
    ));

    let work_pool = Pool::new(runner, config.pool_size, config.queue_size);

    info!(
        "worker started id={} poll={:?} pool={} queue={} fail_rate={:.2}",
        config.worker_id, config.poll_interval, config.pool_size, config.queue_size, config.fail_rate
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    Poller::new(config, store, work_pool).run(shutdown).await;

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
}
