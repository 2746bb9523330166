// Daemon entry point for the coordinator.

use anyhow::{Context, Result};
use foreman::{Config, Coordinator};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,foreman=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting foreman coordinator");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(db_path = %config.database_path, "Configuration loaded");

    let health_interval = config.coordinator.heartbeat_check_interval;
    let coordinator = Coordinator::from_config(config)
        .await
        .context("Failed to open coordinator store")?;
    coordinator.start();
    tracing::info!("Coordinator started; submit tasks through the in-process API");

    // Log a health snapshot periodically until interrupted
    let mut ticker = tokio::time::interval(health_interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                match coordinator.get_health().await {
                    Ok(health) => tracing::info!(
                        active_workers = health.active_workers,
                        pending = health.pending_tasks,
                        in_flight = health.in_flight_tasks,
                        completed = health.completed_tasks,
                        dead_letter = health.dead_letter_tasks,
                        "system health"
                    ),
                    Err(e) => tracing::error!(error = %e, "health check failed"),
                }
            }
        }
    }

    tracing::info!("Shutting down");
    coordinator.shutdown().await.context("Shutdown failed")?;
    Ok(())
}
