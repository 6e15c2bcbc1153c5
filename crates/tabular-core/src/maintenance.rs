//! Background eviction of stale materializations.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::service::QueryService;

/// Sweep schedule.
#[derive(Debug, Clone, Copy)]
pub struct SweepConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Entries older than this are evicted
    pub retention: Duration,
}

/// Handle for the periodic sweep task
pub struct SweeperHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Signal the task to stop and wait for it
    pub async fn stop(self) {
        self.shutdown();
        let _ = self.handle.await;
    }
}

/// Spawn a task that calls [`QueryService::maintenance_sweep`] every
/// `config.interval`. The first sweep runs one interval after start.
pub fn start_sweeper(service: Arc<QueryService>, config: SweepConfig) -> SweeperHandle {
    let (shutdown_tx, mut rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(config.interval);
        interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Skip the immediate first tick; startup sweeps are the host's call.
        interval_timer.tick().await;

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    debug!("Periodic eviction sweep triggered");
                    let report = service.maintenance_sweep(config.retention).await;
                    if report.removed > 0 {
                        info!("Periodic sweep evicted {} entries", report.removed);
                    }
                }
                changed = rx.changed() => {
                    if changed.is_err() || *rx.borrow() {
                        info!("Eviction sweeper shutting down");
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle {
        shutdown_tx,
        handle,
    }
}
