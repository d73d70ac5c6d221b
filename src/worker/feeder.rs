use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::FeederConfig;
use crate::error::PoolError;
use crate::scheduler::Competencies;
use crate::store::{JobFilter, PageRequest, SharedJobStore};
use crate::worker::monitor::{AggregateStatus, PoolStatus};
use crate::worker::pool::WorkerPool;

/// Pulls pending jobs into the pool whenever it has room.
///
/// A round runs when the pool turns ACCEPTING, when the runner turns IDLE and
/// on a slow timer that catches jobs nobody pushed.
pub struct JobFeeder {
    pool: WorkerPool,
    store: SharedJobStore,
    filter: JobFilter,
    config: FeederConfig,
}

impl JobFeeder {
    pub fn new(
        pool: WorkerPool,
        store: SharedJobStore,
        competencies: &Competencies,
        config: FeederConfig,
    ) -> Self {
        Self {
            pool,
            store,
            filter: JobFilter::pending_for(competencies),
            config,
        }
    }

    /// Submit pending jobs until the pool is full or nothing is left to take.
    ///
    /// Returns the number of jobs placed.
    pub async fn fill(&self) -> usize {
        let page = PageRequest::first(self.config.page_size());
        let mut placed = 0;

        'rounds: while self.pool.status() == PoolStatus::Accepting {
            let jobs = match self.store.list(&self.filter, page).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to list pending jobs");
                    break;
                }
            };
            if jobs.is_empty() {
                break;
            }

            for job in jobs.items {
                let job_id = job.id;
                match self.pool.submit(job).await {
                    Ok(_) => {
                        placed += 1;
                        continue 'rounds;
                    }
                    Err(PoolError::NotPending { .. }) => continue,
                    Err(PoolError::Reservation(e)) if e.is_locking_failed() => {
                        tracing::debug!(job_id = %job_id, "Job taken elsewhere");
                        continue;
                    }
                    Err(PoolError::Busy) | Err(PoolError::ShuttingDown) => break 'rounds,
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to submit job");
                        break 'rounds;
                    }
                }
            }

            // Every job on the page was lost to someone else.
            break;
        }

        if placed > 0 {
            tracing::info!(placed, "Pulled pending jobs");
        }
        placed
    }

    /// Run fill rounds on triggers until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut pool_rx = self.pool.subscribe();
        let mut aggregate_rx = self.pool.monitor().watch_aggregate();
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            page_size = self.config.page_size(),
            "Job feeder started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
                changed = pool_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *pool_rx.borrow_and_update() != PoolStatus::Accepting {
                        continue;
                    }
                }
                changed = aggregate_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *aggregate_rx.borrow_and_update() != AggregateStatus::Idle {
                        continue;
                    }
                }
            }

            if self.pool.is_shutting_down() {
                break;
            }
            self.fill().await;
        }

        tracing::info!("Job feeder stopped");
    }
}
