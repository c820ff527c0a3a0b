//! Background timer of the DM.
//!
//! One timer drives every periodic task: awaiting-message flush, target
//! configuration polling and heartbeat checks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::lifecycle::InstancesManager;

pub struct TimerWorker {
    manager: Arc<InstancesManager>,
    interval: Duration,
    heartbeat_period: Duration,
}

impl TimerWorker {
    pub fn new(manager: Arc<InstancesManager>, interval: Duration, heartbeat_period: Duration) -> Self {
        Self {
            manager,
            interval,
            heartbeat_period,
        }
    }

    /// Run the timer until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            heartbeat_period_secs = self.heartbeat_period.as_secs(),
            "Starting DM timer"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;
        let mut last_heartbeat_check = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let check_heartbeats = last_heartbeat_check.elapsed() >= self.heartbeat_period;
                    if check_heartbeats {
                        last_heartbeat_check = Instant::now();
                    }
                    self.tick(check_heartbeats).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("DM timer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Runs one pass of the periodic tasks.
    pub async fn tick(&self, check_heartbeats: bool) {
        let sent = self.manager.flush_all_awaiting_messages().await;
        self.manager.poll_configurations().await;
        let flipped = if check_heartbeats {
            self.manager.check_heartbeats().await
        } else {
            0
        };

        if sent > 0 || flipped > 0 {
            debug!(sent, flipped, "Timer pass complete");
        }
    }
}
