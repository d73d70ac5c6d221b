use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::MeshError;
use crate::scheduler::Job;

/// Path a runner serves to accept pushed jobs.
pub const RUNNING_JOBS_PATH: &str = "/jobs/running";

/// What a runner said when offered a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// The runner reserved the job and will execute it.
    Accepted,
    /// The runner answered but did not take the job.
    Declined,
    /// The runner could not be reached at all.
    Unreachable(String),
}

/// Offers a job to a runner's callback endpoint.
#[async_trait]
pub trait RunnerCallback: Send + Sync {
    async fn put_running_job(&self, callback: &str, job: &Job) -> CallbackOutcome;
}

/// `PUT {callback}/jobs/running` with the job as JSON body.
#[derive(Debug, Clone)]
pub struct HttpRunnerCallback {
    client: Client,
}

impl HttpRunnerCallback {
    pub fn new(timeout: Duration) -> Result<Self, MeshError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn url_for(callback: &str) -> String {
        format!("{}{}", callback.trim_end_matches('/'), RUNNING_JOBS_PATH)
    }
}

#[async_trait]
impl RunnerCallback for HttpRunnerCallback {
    async fn put_running_job(&self, callback: &str, job: &Job) -> CallbackOutcome {
        let url = Self::url_for(callback);
        match self.client.put(&url).json(job).send().await {
            Ok(response) if response.status().is_success() => CallbackOutcome::Accepted,
            Ok(response) => {
                tracing::debug!(job_id = %job.id, url = %url, status = %response.status(), "Runner declined job");
                CallbackOutcome::Declined
            }
            Err(e) => CallbackOutcome::Unreachable(e.to_string()),
        }
    }
}
