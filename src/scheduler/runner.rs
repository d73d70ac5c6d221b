use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RunnerId = Uuid;

/// Runtime status a runner advertises to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerStatus {
    Idle,
    Running,
    Disconnected,
}

impl std::fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerStatus::Idle => write!(f, "idle"),
            RunnerStatus::Running => write!(f, "running"),
            RunnerStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Categories and names a runner can execute.
///
/// A job matches when both its category and its name are declared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competencies {
    pub categories: BTreeSet<String>,
    pub names: BTreeSet<String>,
}

impl Competencies {
    pub fn new<C, N, S, T>(categories: C, names: N) -> Self
    where
        C: IntoIterator<Item = S>,
        N: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn accepts(&self, category: &str, name: &str) -> bool {
        self.categories.contains(category) && self.names.contains(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRuntime {
    pub status: RunnerStatus,
    pub created: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub callback: String,
    pub competencies: Competencies,
    #[serde(rename = "ttl_secs", with = "serde_duration_secs")]
    pub ttl: Duration,
    pub runtime: RunnerRuntime,
}

impl Runner {
    pub fn from_new(id: RunnerId, spec: NewRunner) -> Self {
        let now = Utc::now();
        Self {
            id,
            callback: spec.callback,
            competencies: spec.competencies,
            ttl: spec.ttl,
            runtime: RunnerRuntime {
                // A runner is busy until its pool reports an idle slot.
                status: RunnerStatus::Running,
                created: now,
                last_ping: now,
            },
        }
    }
}

/// Registration request for a runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRunner {
    pub callback: String,
    pub competencies: Competencies,
    #[serde(rename = "ttl_secs", with = "serde_duration_secs")]
    pub ttl: Duration,
}

mod serde_duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
