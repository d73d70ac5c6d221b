use std::time::Duration;

use crate::error::MeshError;
use crate::scheduler::Competencies;

/// Retry policy for job status writes (reservation, update, release).
///
/// Attempt `n` (1-based) that hits a transport error sleeps `n * base_delay`
/// before the next one.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay to sleep after a failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots.
    pub capacity: usize,
    /// How long an idle slot waits for a job before re-checking shutdown.
    pub worker_wait_timeout: Duration,
    /// Time in-flight jobs get to finish once shutdown starts.
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            worker_wait_timeout: Duration::from_millis(1000),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }
}

/// Heartbeat timing derived from the runner ttl.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    pub ttl: Duration,
    /// Fraction of ttl between periodic pings.
    pub interval_ratio: f64,
    /// Fraction of ttl a single ping may take before it is abandoned.
    pub deadline_ratio: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            interval_ratio: 0.66,
            deadline_ratio: 0.90,
        }
    }
}

impl HeartbeatConfig {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    pub fn interval(&self) -> Duration {
        self.ttl.mul_f64(self.interval_ratio)
    }

    pub fn deadline(&self) -> Duration {
        self.ttl.mul_f64(self.deadline_ratio)
    }
}

/// Pull dispatcher settings.
#[derive(Debug, Clone)]
pub struct FeederConfig {
    pub page_size: usize,
    /// Periodic re-check for pending jobs, independent of pool edges.
    pub interval: Duration,
}

impl FeederConfig {
    pub const MIN_PAGE_SIZE: usize = 10;
    pub const MAX_PAGE_SIZE: usize = 20;

    pub fn page_size(&self) -> usize {
        self.page_size
            .clamp(Self::MIN_PAGE_SIZE, Self::MAX_PAGE_SIZE)
    }
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            interval: Duration::from_secs(30),
        }
    }
}

/// Push dispatcher settings.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub page_size: usize,
    /// Upper bound on scan restarts caused by disconnected runners.
    pub max_restarts: u32,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            max_restarts: 3,
        }
    }
}

/// Everything a runner process needs to join the registry.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL the registry pushes jobs to.
    pub callback: String,
    pub competencies: Competencies,
    pub pool: PoolConfig,
    pub heartbeat: HeartbeatConfig,
    pub feeder: FeederConfig,
    pub retry: RetryConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            callback: "http://127.0.0.1:8081".to_string(),
            competencies: Competencies::default(),
            pool: PoolConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            feeder: FeederConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn new(callback: impl Into<String>, competencies: Competencies) -> Self {
        Self {
            callback: callback.into(),
            competencies,
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.pool.capacity = capacity;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.heartbeat.ttl = ttl;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_feeder_interval(mut self, interval: Duration) -> Self {
        self.feeder.interval = interval;
        self
    }

    pub fn with_worker_wait_timeout(mut self, timeout: Duration) -> Self {
        self.pool.worker_wait_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.pool.shutdown_grace = grace;
        self
    }

    /// Reject settings a runner cannot start with.
    pub fn validate(&self) -> Result<(), MeshError> {
        let problem = if self.pool.capacity == 0 {
            "worker pool capacity must be at least 1"
        } else if self.competencies.categories.is_empty() || self.competencies.names.is_empty() {
            "a runner needs at least one category and one name"
        } else if self.heartbeat.interval().is_zero() {
            "runner ttl is too short to schedule heartbeats"
        } else if self.feeder.interval.is_zero() {
            "feeder interval must be positive"
        } else if self.pool.worker_wait_timeout.is_zero() {
            "worker wait timeout must be positive"
        } else {
            return Ok(());
        };
        Err(MeshError::Config(problem.to_string()))
    }
}
