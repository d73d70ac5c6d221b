use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::api::{registry_router, RegistryState};
use crate::config::PushConfig;
use crate::dispatch::{HttpRunnerCallback, PushDispatcher, RunnerCallback};
use crate::error::Result;
use crate::scheduler::{Job, NewJob};
use crate::store::{
    JobStore, MemoryJobStore, MemoryRunnerStore, SharedJobStore, SharedRunnerStore,
};

/// The registry: job and runner stores plus the push dispatcher that offers
/// every new or released job to idle runners.
pub struct Registry {
    jobs: Arc<MemoryJobStore>,
    runners: Arc<MemoryRunnerStore>,
    push: PushDispatcher,
}

impl Registry {
    /// Build a registry on the current runtime that pushes through `callback`.
    pub async fn new(callback: Arc<dyn RunnerCallback>, config: PushConfig) -> Result<Self> {
        let jobs = Arc::new(MemoryJobStore::new());
        let runners = Arc::new(MemoryRunnerStore::new());
        let push = PushDispatcher::new(runners.clone(), callback, config)?;
        jobs.subscribe(Arc::new(push.clone())).await;

        Ok(Self {
            jobs,
            runners,
            push,
        })
    }

    /// Registry that reaches runners over HTTP.
    pub async fn with_http_callbacks(timeout: Duration, config: PushConfig) -> Result<Self> {
        let callback = HttpRunnerCallback::new(timeout)?;
        Self::new(Arc::new(callback), config).await
    }

    /// Create a job. The push dispatcher picks it up from the store event.
    pub async fn submit(&self, spec: NewJob) -> Result<Job> {
        let job = self.jobs.create(spec).await?;
        tracing::info!(job_id = %job.id, category = %job.category, name = %job.name, "Job submitted");
        Ok(job)
    }

    pub fn job_store(&self) -> SharedJobStore {
        self.jobs.clone()
    }

    pub fn runner_store(&self) -> SharedRunnerStore {
        self.runners.clone()
    }

    pub fn push(&self) -> &PushDispatcher {
        &self.push
    }

    pub fn router(&self) -> Router {
        registry_router(RegistryState {
            jobs: self.job_store(),
            runners: self.runner_store(),
        })
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("jobs", &self.jobs)
            .field("push", &self.push)
            .finish_non_exhaustive()
    }
}
