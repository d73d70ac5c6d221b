use crate::config::RetryConfig;
use crate::error::{ReservationError, StoreError};
use crate::scheduler::{Job, JobId, JobStatus};
use crate::store::{JobPatch, SharedJobStore};

/// Writes job status changes with optimistic concurrency and bounded retry.
///
/// - [`reserve`](Self::reserve) claims a pending job, conditioned on its version
/// - [`update`](Self::update) writes the final status without a version check
/// - [`release`](Self::release) hands a reserved job back to PENDING
///
/// Only transport errors are retried. A store rejection is the store's answer
/// and is returned immediately.
#[derive(Clone)]
pub struct ReservationClient {
    store: SharedJobStore,
    retry: RetryConfig,
}

impl ReservationClient {
    pub fn new(store: SharedJobStore, retry: RetryConfig) -> Self {
        Self { store, retry }
    }

    /// Claim `job` for this runner. Succeeds for exactly one caller per version.
    pub async fn reserve(&self, job: &Job) -> Result<Job, ReservationError> {
        let patch = JobPatch::checked(job.version, JobStatus::running());
        match self.write_with_retry(job.id, patch).await {
            Ok(reserved) => {
                tracing::debug!(job_id = %job.id, version = reserved.version, "Job reserved");
                Ok(reserved)
            }
            Err(Attempted::Rejected(reason)) => {
                tracing::debug!(job_id = %job.id, error = %reason, "Job not reservable");
                Err(ReservationError::LockingFailed {
                    job_id: job.id,
                    reason,
                })
            }
            Err(Attempted::Exhausted {
                attempts,
                last_error,
            }) => Err(ReservationError::JobUpdateFailure {
                job_id: job.id,
                attempts,
                last_error,
            }),
        }
    }

    /// Write the job's current status and result.
    ///
    /// No expected version is sent: a finished result must not be lost to an
    /// unrelated concurrent write. Terminal jobs are still rejected by the store.
    pub async fn update(&self, job: &Job) -> Result<Job, ReservationError> {
        let patch = JobPatch::unchecked(job.status).with_result(job.result.clone());
        match self.write_with_retry(job.id, patch).await {
            Ok(updated) => Ok(updated),
            Err(Attempted::Rejected(last_error)) => Err(ReservationError::JobUpdateFailure {
                job_id: job.id,
                attempts: 1,
                last_error,
            }),
            Err(Attempted::Exhausted {
                attempts,
                last_error,
            }) => Err(ReservationError::JobUpdateFailure {
                job_id: job.id,
                attempts,
                last_error,
            }),
        }
    }

    /// Return a reserved job to PENDING so another slot or runner can take it.
    pub async fn release(&self, job: &Job) -> Result<Job, ReservationError> {
        let patch = JobPatch::checked(job.version, JobStatus::pending());
        self.write_with_retry(job.id, patch)
            .await
            .map_err(|failure| ReservationError::UnlockingFailed {
                job_id: job.id,
                reason: failure.into_error(),
            })
    }

    async fn write_with_retry(&self, id: JobId, patch: JobPatch) -> Result<Job, Attempted> {
        let max_attempts = self.retry.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.store.patch(id, patch.clone()).await {
                Ok(job) => return Ok(job),
                Err(e) if !e.is_transient() => return Err(Attempted::Rejected(e)),
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(
                        job_id = %id,
                        attempts = attempt,
                        error = %e,
                        "Job update retries exhausted"
                    );
                    return Err(Attempted::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        job_id = %id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Job update failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

enum Attempted {
    Rejected(StoreError),
    Exhausted { attempts: u32, last_error: StoreError },
}

impl Attempted {
    fn into_error(self) -> StoreError {
        match self {
            Attempted::Rejected(e) => e,
            Attempted::Exhausted { last_error, .. } => last_error,
        }
    }
}

impl std::fmt::Debug for ReservationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
