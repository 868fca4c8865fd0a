//! Periodic inactivity sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::PoolManager;

/// Run [`PoolManager::sweep_inactive`] every `interval` until `shutdown`
/// flips or its sender is dropped.
pub fn spawn_inactivity_sweeper(
    manager: Arc<PoolManager>,
    interval: Duration,
    threshold_hours: f64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            threshold_hours, "Inactivity sweeper started"
        );

        let mut timer = tokio::time::interval(interval);
        // First tick fires immediately; startup recovery already ran.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    match manager.sweep_inactive(threshold_hours).await {
                        Ok(cleaned) if cleaned.is_empty() => debug!("Inactivity sweep: nothing to clean"),
                        Ok(cleaned) => info!(count = cleaned.len(), jobs = ?cleaned, "Inactivity sweep cleaned workers"),
                        Err(e) => error!(error = %e, "Inactivity sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Inactivity sweeper stopping");
                    break;
                }
            }
        }
    })
}
