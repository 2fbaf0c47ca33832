//! Coordinator binary: the single dispatcher loop described in
//! `dispatcher_core::dispatcher`, wired to Postgres and a real HTTP client.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use dispatcher_core::{BackendRegistry, Config, CoordinatorLock, Dispatcher};
use dispatcher_store_postgres::{PgCoordinatorLock, PgJobStore};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "coordinator")]
#[command(about = "Runs the card-verification dispatch loop", long_about = None)]
struct Args {
    /// Path to an optional TOML config file; environment variables
    /// (`DISPATCHER__*`) always take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    let pool = PgPoolOptions::new()
        .max_connections(config.api_server_urls.len().max(1) as u32 + 2)
        .connect(&config.database_url)
        .await
        .context("connecting to database")?;

    let lock_conn = PgCoordinatorLock::acquire_connection(&pool)
        .await
        .context("reserving advisory lock connection")?;
    let lock = PgCoordinatorLock::new(lock_conn);

    if !lock.try_acquire(&config.worker_id).await? {
        error!(worker_id = %config.worker_id, "another coordinator already holds this worker id");
        return Err(anyhow!(
            "coordinator singleton lock contention for worker_id={}",
            config.worker_id
        ));
    }
    info!(worker_id = %config.worker_id, "acquired coordinator singleton lock");

    let store = Arc::new(PgJobStore::new(pool));
    let registry = Arc::new(BackendRegistry::new(
        config.api_server_urls.clone(),
        config.healthcheck_path.clone(),
        config.healthcheck_timeout(),
        config.healthcheck_cache(),
    )?);
    let dispatcher = Dispatcher::new(store, registry, config.clone())?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    dispatcher.run(cancel).await;

    lock.release(&config.worker_id).await?;
    info!(worker_id = %config.worker_id, "released coordinator singleton lock; exiting");
    Ok(())
}
