use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::scheduler::{Job, JobId, JobStatus, NewJob, NewRunner, RunStatus, Runner, RunnerId};
use crate::store::{
    JobEvent, JobFilter, JobPatch, JobStore, JobSubscriber, Page, PageRequest, RunnerFilter,
    RunnerPatch, RunnerStore, StoreResult,
};

/// Insertion-ordered table so paging is stable across calls.
#[derive(Debug)]
struct Table<K, V> {
    rows: HashMap<K, V>,
    order: Vec<K>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Copy, V: Clone> Table<K, V> {
    fn insert(&mut self, key: K, value: V) {
        if self.rows.insert(key, value).is_none() {
            self.order.push(key);
        }
    }

    fn remove(&mut self, key: &K) -> Option<V> {
        let removed = self.rows.remove(key)?;
        self.order.retain(|k| k != key);
        Some(removed)
    }

    fn page(&self, page: PageRequest, keep: impl Fn(&V) -> bool) -> Page<V> {
        let matching: Vec<&V> = self
            .order
            .iter()
            .filter_map(|k| self.rows.get(k))
            .filter(|v| keep(*v))
            .collect();
        let total = matching.len();
        let items: Vec<V> = matching
            .into_iter()
            .skip(page.offset())
            .take(page.size)
            .cloned()
            .collect();
        Page {
            has_more: page.offset() + items.len() < total,
            items,
            total,
        }
    }
}

/// Checks a patch against the stored job and applies it.
///
/// Accepted transitions: PENDING→RUNNING (reservation), RUNNING→DONE
/// (completion), RUNNING→PENDING (release), and same-status writes that only
/// carry a result. DONE is terminal.
fn apply_patch(job: &mut Job, patch: JobPatch) -> StoreResult<()> {
    if let Some(expected) = patch.expected_version {
        if expected != job.version {
            return Err(StoreError::Conflict {
                id: job.id.to_string(),
                expected,
                actual: job.version,
            });
        }
    }
    if job.status.is_terminal() {
        return Err(StoreError::Invalid(format!("job {} is terminal", job.id)));
    }
    if !patch.status.is_consistent() {
        return Err(StoreError::Invalid(format!(
            "inconsistent status {:?}",
            patch.status
        )));
    }

    let now = Utc::now();
    match (job.status.run, patch.status.run) {
        (RunStatus::Pending, RunStatus::Running) => job.processing.started = Some(now),
        (RunStatus::Running, RunStatus::Done) => job.processing.finished = Some(now),
        (RunStatus::Running, RunStatus::Pending) => job.processing.started = None,
        (from, to) if from == to => {}
        (from, to) => {
            return Err(StoreError::Invalid(format!(
                "job {} cannot move from {} to {}",
                job.id, from, to
            )))
        }
    }

    job.status = patch.status;
    if patch.result.is_some() {
        job.result = patch.result;
    }
    job.version += 1;
    Ok(())
}

/// In-memory versioned job store with synchronous event fan-out.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<Table<JobId, Job>>,
    subscribers: RwLock<Vec<Arc<dyn JobSubscriber>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn JobSubscriber>) {
        self.subscribers.write().await.push(subscriber);
    }

    async fn publish(&self, event: JobEvent) {
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            subscriber.on_job_event(&event);
        }
    }
}

impl std::fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryJobStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn list(&self, filter: &JobFilter, page: PageRequest) -> StoreResult<Page<Job>> {
        let jobs = self.jobs.read().await;
        Ok(jobs.page(page, |job| filter.matches(job)))
    }

    async fn create(&self, spec: NewJob) -> StoreResult<Job> {
        if spec.category.is_empty() || spec.name.is_empty() {
            return Err(StoreError::Invalid(
                "job category and name are required".to_string(),
            ));
        }
        let job = Job::from_new(Uuid::new_v4(), spec);
        self.jobs.write().await.insert(job.id, job.clone());
        tracing::debug!(job_id = %job.id, category = %job.category, name = %job.name, "Job created");

        self.publish(JobEvent::Created(job.clone())).await;
        Ok(job)
    }

    async fn get(&self, id: JobId) -> StoreResult<Job> {
        self.jobs
            .read()
            .await
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))
    }

    async fn patch(&self, id: JobId, patch: JobPatch) -> StoreResult<Job> {
        let (previous, job) = {
            let mut jobs = self.jobs.write().await;
            let job = jobs
                .rows
                .get_mut(&id)
                .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
            let previous: JobStatus = job.status;
            apply_patch(job, patch)?;
            (previous, job.clone())
        };
        tracing::debug!(job_id = %id, version = job.version, status = %job.status, "Job patched");

        self.publish(JobEvent::Updated {
            previous,
            job: job.clone(),
        })
        .await;
        Ok(job)
    }
}

/// In-memory runner registry.
#[derive(Debug, Default)]
pub struct MemoryRunnerStore {
    runners: RwLock<Table<RunnerId, Runner>>,
}

impl MemoryRunnerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunnerStore for MemoryRunnerStore {
    async fn register(&self, spec: NewRunner) -> StoreResult<Runner> {
        let runner = Runner::from_new(Uuid::new_v4(), spec);
        self.runners.write().await.insert(runner.id, runner.clone());
        tracing::info!(runner_id = %runner.id, callback = %runner.callback, "Runner registered");
        Ok(runner)
    }

    async fn get(&self, id: RunnerId) -> StoreResult<Runner> {
        self.runners
            .read()
            .await
            .rows
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("runner {id}")))
    }

    async fn list(&self, filter: &RunnerFilter, page: PageRequest) -> StoreResult<Page<Runner>> {
        let runners = self.runners.read().await;
        Ok(runners.page(page, |runner| filter.matches(runner)))
    }

    async fn list_all(&self) -> StoreResult<Vec<Runner>> {
        let runners = self.runners.read().await;
        Ok(runners
            .order
            .iter()
            .filter_map(|id| runners.rows.get(id).cloned())
            .collect())
    }

    async fn patch(&self, id: RunnerId, patch: RunnerPatch) -> StoreResult<Runner> {
        let mut runners = self.runners.write().await;
        let runner = runners
            .rows
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("runner {id}")))?;
        if let Some(status) = patch.status {
            runner.runtime.status = status;
        }
        if let Some(last_ping) = patch.last_ping {
            runner.runtime.last_ping = last_ping;
        }
        Ok(runner.clone())
    }

    async fn remove(&self, id: RunnerId) -> StoreResult<Runner> {
        let removed = self
            .runners
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("runner {id}")))?;
        tracing::info!(runner_id = %id, "Runner removed");
        Ok(removed)
    }
}
