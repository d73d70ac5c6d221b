use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Done,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Done => write!(f, "done"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitStatus {
    Success,
    Failure,
    Aborted,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "success"),
            ExitStatus::Failure => write!(f, "failure"),
            ExitStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Run/exit pair of a job.
///
/// `exit` is present exactly when `run` is [`RunStatus::Done`]. The
/// constructors only build valid pairs; [`JobStatus::is_consistent`] checks
/// pairs that arrive from elsewhere (deserialized payloads, processor output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub run: RunStatus,
    pub exit: Option<ExitStatus>,
}

impl JobStatus {
    pub const fn pending() -> Self {
        Self {
            run: RunStatus::Pending,
            exit: None,
        }
    }

    pub const fn running() -> Self {
        Self {
            run: RunStatus::Running,
            exit: None,
        }
    }

    pub const fn done(exit: ExitStatus) -> Self {
        Self {
            run: RunStatus::Done,
            exit: Some(exit),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.exit.is_some() == (self.run == RunStatus::Done)
    }

    pub fn is_terminal(&self) -> bool {
        self.run == RunStatus::Done
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::pending()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit {
            Some(exit) => write!(f, "{}/{}", self.run, exit),
            None => write!(f, "{}", self.run),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accounting {
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processing {
    pub submitted: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

impl Processing {
    pub fn submitted_now() -> Self {
        Self {
            submitted: Utc::now(),
            started: None,
            finished: None,
        }
    }
}

/// A unit of work tracked by the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub category: String,
    pub name: String,
    pub arguments: Vec<String>,
    pub status: JobStatus,
    pub version: u64,
    pub accounting: Accounting,
    pub processing: Processing,
    pub result: Option<serde_json::Value>,
}

impl Job {
    /// Materialize a submitted job. Only stores call this: they own ids and versions.
    pub fn from_new(id: JobId, spec: NewJob) -> Self {
        Self {
            id,
            category: spec.category,
            name: spec.name,
            arguments: spec.arguments,
            status: JobStatus::pending(),
            version: 1,
            accounting: Accounting {
                account_id: spec.account_id,
            },
            processing: Processing::submitted_now(),
            result: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status.run == RunStatus::Pending
    }
}

/// What a submitter provides when creating a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

impl NewJob {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            name: name.into(),
            arguments: Vec::new(),
            account_id: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_keep_exit_iff_done() {
        assert!(JobStatus::pending().is_consistent());
        assert!(JobStatus::running().is_consistent());
        assert!(JobStatus::done(ExitStatus::Aborted).is_consistent());

        let broken = JobStatus {
            run: RunStatus::Running,
            exit: Some(ExitStatus::Success),
        };
        assert!(!broken.is_consistent());

        let missing_exit = JobStatus {
            run: RunStatus::Done,
            exit: None,
        };
        assert!(!missing_exit.is_consistent());
    }

    #[test]
    fn new_job_starts_pending_at_version_one() {
        let spec = NewJob::new("shell", "echo")
            .with_args(["hello", "world"])
            .with_account("acct-1");
        let job = Job::from_new(Uuid::new_v4(), spec);

        assert!(job.is_pending());
        assert_eq!(job.version, 1);
        assert_eq!(job.arguments, vec!["hello", "world"]);
        assert_eq!(job.accounting.account_id.as_deref(), Some("acct-1"));
        assert!(job.processing.started.is_none());
        assert!(job.processing.finished.is_none());
    }

    #[test]
    fn status_serializes_upper_case() {
        let json = serde_json::to_value(JobStatus::done(ExitStatus::Failure)).unwrap();
        assert_eq!(json["run"], "DONE");
        assert_eq!(json["exit"], "FAILURE");
    }

    #[test]
    fn run_status_parses_case_insensitively() {
        assert_eq!("PENDING".parse::<RunStatus>().unwrap(), RunStatus::Pending);
        assert_eq!("done".parse::<RunStatus>().unwrap(), RunStatus::Done);
        assert!("finished".parse::<RunStatus>().is_err());
    }
}
