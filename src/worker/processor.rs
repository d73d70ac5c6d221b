use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ProcessorError;
use crate::scheduler::{ExitStatus, Job, JobStatus};

/// Executes one reserved job.
///
/// Returns the job with `result` and, optionally, a status filled in. Status
/// fields left unset are completed by the pool (DONE/SUCCESS). Returning the
/// job as PENDING puts it back up for placement. An error is recorded as
/// DONE/FAILURE.
#[async_trait]
pub trait JobProcessor: Send {
    async fn process(self: Box<Self>) -> Result<Job, ProcessorError>;
}

/// Builds a processor for each job a slot picks up.
///
/// `shutdown` is cancelled when the pool shuts down; long-running processors
/// should watch it and return early.
pub trait ProcessorFactory: Send + Sync {
    fn create_for(&self, job: &Job, shutdown: CancellationToken) -> Box<dyn JobProcessor>;
}

/// Runs `arguments[0]` with the remaining arguments as a child process.
#[derive(Debug, Clone, Default)]
pub struct ShellProcessorFactory;

impl ShellProcessorFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessorFactory for ShellProcessorFactory {
    fn create_for(&self, job: &Job, shutdown: CancellationToken) -> Box<dyn JobProcessor> {
        Box::new(ShellProcessor {
            job: job.clone(),
            shutdown,
        })
    }
}

pub struct ShellProcessor {
    job: Job,
    shutdown: CancellationToken,
}

#[async_trait]
impl JobProcessor for ShellProcessor {
    async fn process(self: Box<Self>) -> Result<Job, ProcessorError> {
        let ShellProcessor { mut job, shutdown } = *self;
        let (program, args) = job
            .arguments
            .split_first()
            .ok_or(ProcessorError::MissingCommand)?;

        tracing::info!(job_id = %job.id, program = %program, "Executing job");

        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output?;
                let stdout = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let exit_code = output.status.code();

                let exit = if output.status.success() {
                    ExitStatus::Success
                } else {
                    ExitStatus::Failure
                };
                tracing::info!(job_id = %job.id, exit = %exit, exit_code = ?exit_code, "Job completed");

                job.status = JobStatus::done(exit);
                job.result = Some(json!({
                    "exit_code": exit_code,
                    "stdout": stdout,
                    "stderr": stderr,
                }));
            }
            _ = shutdown.cancelled() => {
                // Dropping the wait future kills the child (kill_on_drop).
                tracing::warn!(job_id = %job.id, "Job interrupted by shutdown");
                job.status = JobStatus::done(ExitStatus::Aborted);
                job.result = Some(json!({ "error": "interrupted by runner shutdown" }));
            }
        }

        Ok(job)
    }
}

type BoxedOutcome = Pin<Box<dyn Future<Output = Result<Job, ProcessorError>> + Send>>;

/// Adapts an async closure into a [`ProcessorFactory`].
pub struct FnProcessorFactory<F> {
    f: Arc<F>,
}

impl<F, Fut> FnProcessorFactory<F>
where
    F: Fn(Job, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Job, ProcessorError>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Arc::new(f) }
    }
}

impl<F, Fut> ProcessorFactory for FnProcessorFactory<F>
where
    F: Fn(Job, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Job, ProcessorError>> + Send + 'static,
{
    fn create_for(&self, job: &Job, shutdown: CancellationToken) -> Box<dyn JobProcessor> {
        Box::new(FnProcessor {
            outcome: Box::pin((self.f)(job.clone(), shutdown)),
        })
    }
}

struct FnProcessor {
    outcome: BoxedOutcome,
}

#[async_trait]
impl JobProcessor for FnProcessor {
    async fn process(self: Box<Self>) -> Result<Job, ProcessorError> {
        self.outcome.await
    }
}
