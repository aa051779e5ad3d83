mod bootstrap;

use anyhow::Result;
use tokio::sync::watch;

use courier_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use courier_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let bootstrap::Application { config, db_pool, queue: _queue, pool, reconciler } =
        bootstrap::bootstrap_with_config(config).await?;

    let (stop, shutdown) = watch::channel(false);
    let pool_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { pool.run(shutdown).await }
    });
    let reconciler_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reconciler.run(shutdown).await }
    });

    tracing::info!(
        event_name = "system.worker.started",
        correlation_id = "bootstrap",
        worker_slots = config.queue.worker_slots,
        "courier-worker started"
    );

    wait_for_shutdown().await?;

    tracing::info!(
        event_name = "system.worker.stopping",
        correlation_id = "shutdown",
        "courier-worker stopping"
    );
    stop.send(true)?;
    pool_handle.await?;
    reconciler_handle.await?;

    db_pool.close().await;
    tracing::info!(
        event_name = "system.worker.stopped",
        correlation_id = "shutdown",
        "courier-worker stopped"
    );

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
