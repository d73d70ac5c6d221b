//! Registry storage contracts.
//!
//! The registry keeps jobs and runners in a versioned store that is consumed
//! through two narrow traits:
//!
//! - [`JobStore`]: list with filter and paging, create, conditional patch
//! - [`RunnerStore`]: register, list with filter and paging, patch status
//!
//! Every accepted job write bumps the job's `version`. A patch that names an
//! `expected_version` is rejected with [`StoreError::Conflict`] when the
//! stored version differs; this is the only mutual exclusion between runners.
//!
//! [`memory`] provides the in-process implementation used by the registry
//! binary and the tests.

pub mod memory;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::scheduler::{
    Competencies, Job, JobId, JobStatus, NewJob, NewRunner, RunStatus, Runner, RunnerId,
    RunnerStatus,
};

pub use memory::{MemoryJobStore, MemoryRunnerStore};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub index: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn first(size: usize) -> Self {
        Self { index: 0, size }
    }

    pub fn next(self) -> Self {
        Self {
            index: self.index + 1,
            size: self.size,
        }
    }

    pub fn offset(&self) -> usize {
        self.index.saturating_mul(self.size)
    }
}

/// One page of a filtered listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// False when this page is the last one ("complete" listing).
    pub has_more: bool,
    /// Number of matching items across all pages.
    pub total: usize,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            has_more: false,
            total: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Job listing filter. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub categories: Option<BTreeSet<String>>,
    pub names: Option<BTreeSet<String>>,
    pub account_id: Option<String>,
    pub run_status: Option<RunStatus>,
}

impl JobFilter {
    /// Pending jobs a runner with these competencies can execute.
    pub fn pending_for(competencies: &Competencies) -> Self {
        Self {
            categories: Some(competencies.categories.clone()),
            names: Some(competencies.names.clone()),
            account_id: None,
            run_status: Some(RunStatus::Pending),
        }
    }

    pub fn with_run_status(mut self, run: RunStatus) -> Self {
        self.run_status = Some(run);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.categories
            .get_or_insert_with(BTreeSet::new)
            .insert(category.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.categories
            .as_ref()
            .map_or(true, |c| c.contains(&job.category))
            && self.names.as_ref().map_or(true, |n| n.contains(&job.name))
            && self
                .account_id
                .as_ref()
                .map_or(true, |a| job.accounting.account_id.as_ref() == Some(a))
            && self.run_status.map_or(true, |r| job.status.run == r)
    }
}

/// Conditional job write.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPatch {
    /// Reject the write unless the stored version equals this one.
    pub expected_version: Option<u64>,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
}

impl JobPatch {
    pub fn checked(version: u64, status: JobStatus) -> Self {
        Self {
            expected_version: Some(version),
            status,
            result: None,
        }
    }

    pub fn unchecked(status: JobStatus) -> Self {
        Self {
            expected_version: None,
            status,
            result: None,
        }
    }

    pub fn with_result(mut self, result: Option<serde_json::Value>) -> Self {
        self.result = result;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerFilter {
    pub category: String,
    pub name: String,
    pub runtime_status: Option<RunnerStatus>,
}

impl RunnerFilter {
    /// Idle runners able to execute `job`.
    pub fn idle_for(job: &Job) -> Self {
        Self {
            category: job.category.clone(),
            name: job.name.clone(),
            runtime_status: Some(RunnerStatus::Idle),
        }
    }

    pub fn matches(&self, runner: &Runner) -> bool {
        runner.competencies.accepts(&self.category, &self.name)
            && self
                .runtime_status
                .map_or(true, |s| runner.runtime.status == s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerPatch {
    pub status: Option<RunnerStatus>,
    pub last_ping: Option<DateTime<Utc>>,
}

impl RunnerPatch {
    pub fn status(status: RunnerStatus) -> Self {
        Self {
            status: Some(status),
            last_ping: None,
        }
    }

    pub fn ping(status: RunnerStatus) -> Self {
        Self {
            status: Some(status),
            last_ping: Some(Utc::now()),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn list(&self, filter: &JobFilter, page: PageRequest) -> StoreResult<Page<Job>>;

    async fn create(&self, spec: NewJob) -> StoreResult<Job>;

    async fn get(&self, id: JobId) -> StoreResult<Job>;

    async fn patch(&self, id: JobId, patch: JobPatch) -> StoreResult<Job>;
}

#[async_trait]
pub trait RunnerStore: Send + Sync {
    async fn register(&self, spec: NewRunner) -> StoreResult<Runner>;

    async fn get(&self, id: RunnerId) -> StoreResult<Runner>;

    async fn list(&self, filter: &RunnerFilter, page: PageRequest) -> StoreResult<Page<Runner>>;

    async fn list_all(&self) -> StoreResult<Vec<Runner>>;

    async fn patch(&self, id: RunnerId, patch: RunnerPatch) -> StoreResult<Runner>;

    async fn remove(&self, id: RunnerId) -> StoreResult<Runner>;
}

/// Notification emitted by a job store after an accepted write.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Created(Job),
    Updated { previous: JobStatus, job: Job },
}

impl JobEvent {
    pub fn job(&self) -> &Job {
        match self {
            JobEvent::Created(job) => job,
            JobEvent::Updated { job, .. } => job,
        }
    }

    /// True when the event leaves a job waiting for a runner.
    pub fn leaves_pending(&self) -> bool {
        self.job().is_pending()
    }
}

/// Receives job events synchronously from the store that produced them.
///
/// Implementations must not block; long work belongs on a spawned task.
pub trait JobSubscriber: Send + Sync {
    fn on_job_event(&self, event: &JobEvent);
}

pub type SharedJobStore = Arc<dyn JobStore>;
pub type SharedRunnerStore = Arc<dyn RunnerStore>;
