//! Periodic background sync.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::SyncOrchestrator;

/// Timer loop that syncs one provider every `interval`.
///
/// The first tick fires one full interval after `run` starts. A tick that
/// overruns delays the following ones rather than bursting to catch up.
pub struct PeriodicSync {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
}

impl PeriodicSync {
    pub fn new(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> Self {
        Self {
            orchestrator,
            interval,
        }
    }

    /// Run until `shutdown` is cancelled. Returns the number of ticks handled.
    ///
    /// A tick in progress is abandoned on cancellation; the orchestrator lock
    /// is released when its future is dropped.
    pub async fn run(self, shutdown: CancellationToken) -> u64 {
        let provider_id = self.orchestrator.provider().id().to_string();
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0;

        info!(
            provider = %provider_id,
            interval_secs = self.interval.as_secs(),
            "Periodic sync started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    debug!(provider = %provider_id, "Periodic sync tick");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.orchestrator.scheduled_sync() => ticks += 1,
                    }
                }
            }
        }

        info!(provider = %provider_id, ticks, "Periodic sync stopped");
        ticks
    }
}
