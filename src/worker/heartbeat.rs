use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::HeartbeatConfig;
use crate::scheduler::{RunnerId, RunnerStatus};
use crate::store::{RunnerPatch, SharedRunnerStore};
use crate::worker::monitor::AggregateStatus;

/// Maps the pool aggregate onto the status the registry sees.
pub fn runner_status_for(aggregate: AggregateStatus) -> RunnerStatus {
    match aggregate {
        AggregateStatus::Idle => RunnerStatus::Idle,
        AggregateStatus::Busy => RunnerStatus::Running,
    }
}

/// Reports this runner's status and liveness to the registry.
///
/// Pings on a fixed interval derived from the runner ttl and immediately on
/// every aggregate status edge. Pings are best effort: failures are logged
/// and the next tick tries again.
pub struct HeartbeatReporter {
    runner_id: RunnerId,
    store: SharedRunnerStore,
    config: HeartbeatConfig,
    status_rx: watch::Receiver<AggregateStatus>,
}

impl HeartbeatReporter {
    pub fn new(
        runner_id: RunnerId,
        store: SharedRunnerStore,
        config: HeartbeatConfig,
        status_rx: watch::Receiver<AggregateStatus>,
    ) -> Self {
        Self {
            runner_id,
            store,
            config,
            status_rx,
        }
    }

    pub fn current_status(&self) -> RunnerStatus {
        runner_status_for(*self.status_rx.borrow())
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        tracing::info!(
            runner_id = %self.runner_id,
            interval_ms = self.config.interval().as_millis() as u64,
            "Heartbeat started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                changed = self.status_rx.changed(), if watching => {
                    if changed.is_err() {
                        // Pool dropped; keep pinging the last known status.
                        watching = false;
                        continue;
                    }
                }
            }

            let status = runner_status_for(*self.status_rx.borrow_and_update());
            self.ping(status).await;
        }

        tracing::info!(runner_id = %self.runner_id, "Heartbeat stopped");
    }

    /// Patch status and last-ping time. Returns whether the registry accepted it.
    pub async fn ping(&self, status: RunnerStatus) -> bool {
        let write = self.store.patch(self.runner_id, RunnerPatch::ping(status));
        match tokio::time::timeout(self.config.deadline(), write).await {
            Ok(Ok(_)) => {
                tracing::debug!(runner_id = %self.runner_id, status = %status, "Heartbeat sent");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(runner_id = %self.runner_id, error = %e, "Heartbeat rejected");
                false
            }
            Err(_) => {
                tracing::warn!(runner_id = %self.runner_id, "Heartbeat timed out");
                false
            }
        }
    }
}
