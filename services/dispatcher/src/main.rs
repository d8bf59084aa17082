//! Stagehand Dispatcher
//!
//! Long-running process that tracks worker capacity, dispatches staging
//! tasks, and feeds desired state to the placement backend.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stagehand_bus::{InProcessBus, MessageBus};
use stagehand_dispatcher::pool::{STAGING_ADVERTISE_SUBJECT, WORKER_ADVERTISE_SUBJECT};
use stagehand_dispatcher::{AdvertisementListener, CapacityPool};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = stagehand_dispatcher::config::Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stagehand dispatcher");
    info!(
        min_staging_memory_mb = config.min_staging_memory_mb,
        disk_floor_mb = config.staging_disk_floor_mb(),
        placement_addrs = config.placement_addrs.len(),
        "Configuration loaded"
    );

    let bus: Arc<dyn MessageBus> = Arc::new(InProcessBus::new());
    let staging_pool = Arc::new(CapacityPool::new("staging"));
    let run_pool = Arc::new(CapacityPool::new("run"));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the advertisement listeners
    let staging_listener_handle = tokio::spawn({
        let listener = AdvertisementListener::new(Arc::clone(&staging_pool), STAGING_ADVERTISE_SUBJECT);
        let bus = Arc::clone(&bus);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            listener.run(bus, shutdown_rx).await;
        }
    });

    let run_listener_handle = tokio::spawn({
        let listener = AdvertisementListener::new(Arc::clone(&run_pool), WORKER_ADVERTISE_SUBJECT);
        let bus = Arc::clone(&bus);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            listener.run(bus, shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = staging_listener_handle => {
            info!("Staging advertisement listener exited");
        }
        _ = run_listener_handle => {
            info!("Run advertisement listener exited");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Give workers time to shut down gracefully
    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Dispatcher shutdown complete");
    Ok(())
}
