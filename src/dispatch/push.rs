use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::PushConfig;
use crate::dispatch::callback::{CallbackOutcome, RunnerCallback};
use crate::error::MeshError;
use crate::scheduler::{Job, RunnerId, RunnerStatus};
use crate::store::{JobEvent, JobSubscriber, PageRequest, RunnerFilter, RunnerPatch, SharedRunnerStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// A runner accepted and reserved the job.
    Delegated(RunnerId),
    /// No idle runner took it; the job stays pending for the feeders.
    Unplaced,
}

struct PushInner {
    runners: SharedRunnerStore,
    callback: Arc<dyn RunnerCallback>,
    config: PushConfig,
}

/// Offers new and released jobs to idle runners that can execute them.
///
/// Registered as a [`JobSubscriber`]; each event that leaves a job pending
/// starts one scan on the runtime captured at construction, so the store's
/// writer never waits on a runner.
#[derive(Clone)]
pub struct PushDispatcher {
    inner: Arc<PushInner>,
    handle: Handle,
}

impl PushDispatcher {
    /// Build a dispatcher bound to the current tokio runtime.
    pub fn new(
        runners: SharedRunnerStore,
        callback: Arc<dyn RunnerCallback>,
        config: PushConfig,
    ) -> Result<Self, MeshError> {
        let handle = Handle::try_current()
            .map_err(|e| MeshError::Config(format!("push dispatcher needs a tokio runtime: {e}")))?;
        Ok(Self::with_handle(handle, runners, callback, config))
    }

    pub fn with_handle(
        handle: Handle,
        runners: SharedRunnerStore,
        callback: Arc<dyn RunnerCallback>,
        config: PushConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PushInner {
                runners,
                callback,
                config,
            }),
            handle,
        }
    }

    /// Run a scan in the background.
    pub fn spawn_dispatch(&self, job: Job) -> JoinHandle<PushOutcome> {
        let dispatcher = self.clone();
        self.handle
            .spawn(async move { dispatcher.dispatch(&job).await })
    }

    /// Offer `job` to idle runners, page by page, until one accepts.
    pub async fn dispatch(&self, job: &Job) -> PushOutcome {
        let filter = RunnerFilter::idle_for(job);
        let first = PageRequest::first(self.inner.config.page_size.max(1));
        let mut page = first;
        let mut restarts = 0;

        loop {
            let runners = match self.inner.runners.list(&filter, page).await {
                Ok(runners) => runners,
                Err(e) => {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to list runners");
                    return PushOutcome::Unplaced;
                }
            };

            let mut disconnected = false;
            for runner in &runners.items {
                match self
                    .inner
                    .callback
                    .put_running_job(&runner.callback, job)
                    .await
                {
                    CallbackOutcome::Accepted => {
                        tracing::info!(job_id = %job.id, runner_id = %runner.id, "Job delegated to runner");
                        return PushOutcome::Delegated(runner.id);
                    }
                    CallbackOutcome::Declined => {
                        tracing::debug!(job_id = %job.id, runner_id = %runner.id, "Runner declined job");
                    }
                    CallbackOutcome::Unreachable(reason) => {
                        tracing::warn!(
                            job_id = %job.id,
                            runner_id = %runner.id,
                            reason = %reason,
                            "Runner unreachable, marking disconnected"
                        );
                        disconnected = true;
                        self.mark_disconnected(runner.id).await;
                    }
                }
            }

            // Disconnections shift the idle listing, so rescan from the top.
            if disconnected && restarts < self.inner.config.max_restarts {
                restarts += 1;
                page = first;
                continue;
            }
            if !runners.has_more {
                tracing::debug!(job_id = %job.id, "No runner accepted job");
                return PushOutcome::Unplaced;
            }
            page = page.next();
        }
    }

    async fn mark_disconnected(&self, runner_id: RunnerId) {
        let patch = RunnerPatch::status(RunnerStatus::Disconnected);
        if let Err(e) = self.inner.runners.patch(runner_id, patch).await {
            tracing::warn!(runner_id = %runner_id, error = %e, "Failed to mark runner disconnected");
        }
    }
}

impl JobSubscriber for PushDispatcher {
    fn on_job_event(&self, event: &JobEvent) {
        if event.leaves_pending() {
            self.spawn_dispatch(event.job().clone());
        }
    }
}

impl std::fmt::Debug for PushDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushDispatcher")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
