pub mod job;
pub mod runner;

pub use job::{ExitStatus, Job, JobId, JobStatus, NewJob, RunStatus};
pub use runner::{Competencies, NewRunner, Runner, RunnerId, RunnerStatus};
