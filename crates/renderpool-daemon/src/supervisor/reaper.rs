//! Child reaper.
//!
//! Consumes the `SIGCHLD` stream and hands each notification to
//! [`PoolManager::reap_exited`]. Several exits can collapse into one signal,
//! so every notification sweeps all tracked children.

use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pool::PoolManager;

/// Start the reaper task. The signal stream is registered before this
/// returns, so no exit after the call is missed.
pub fn spawn_child_reaper(
    manager: Arc<PoolManager>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<JoinHandle<()>> {
    let mut child_exits = signal(SignalKind::child())?;

    Ok(tokio::spawn(async move {
        info!("Child reaper started");
        // Exits that happened before registration.
        reap(&manager).await;

        loop {
            tokio::select! {
                notified = child_exits.recv() => {
                    if notified.is_none() {
                        warn!("Child exit notifications closed");
                        break;
                    }
                    reap(&manager).await;
                }
                _ = shutdown.changed() => {
                    info!("Child reaper stopping");
                    break;
                }
            }
        }
    }))
}

async fn reap(manager: &PoolManager) {
    match manager.reap_exited().await {
        Ok(0) => debug!("No tracked worker exited"),
        Ok(count) => info!(count, "Reaped exited workers"),
        Err(e) => error!(error = %e, "Failed to reap exited workers"),
    }
}
