use thiserror::Error;

use crate::scheduler::{JobId, RunStatus};
use crate::worker::monitor::SlotId;

/// Rejections and failures reported by a job or runner store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {id}: expected {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid change: {0}")]
    Invalid(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl StoreError {
    /// Transport failures are the only ones worth retrying; everything else
    /// is the store's answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transport(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    #[error("Job {job_id} could not be locked: {reason}")]
    LockingFailed { job_id: JobId, reason: StoreError },

    #[error("Job {job_id} could not be released: {reason}")]
    UnlockingFailed { job_id: JobId, reason: StoreError },

    #[error("Job {job_id} update failed after {attempts} attempts: {last_error}")]
    JobUpdateFailure {
        job_id: JobId,
        attempts: u32,
        last_error: StoreError,
    },
}

impl ReservationError {
    pub fn is_locking_failed(&self) -> bool {
        matches!(self, ReservationError::LockingFailed { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shutting down")]
    ShuttingDown,

    #[error("Job {job_id} is {run}, only pending jobs can be submitted")]
    NotPending { job_id: JobId, run: RunStatus },

    #[error("Worker pool is busy")]
    Busy,

    #[error(transparent)]
    Reservation(#[from] ReservationError),
}

impl PoolError {
    /// The job was not taken, but nothing is wrong with the pool.
    pub fn is_declined(&self) -> bool {
        match self {
            PoolError::Busy | PoolError::NotPending { .. } => true,
            PoolError::Reservation(e) => e.is_locking_failed(),
            PoolError::ShuttingDown => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("Unknown worker slot: {0}")]
    UnknownSlot(SlotId),

    #[error("UNKNOWN is reserved for slots that never reported")]
    UnknownNotAssignable,
}

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("Job {0} was not reserved before processing")]
    NotReserved(JobId),

    #[error("Failed to launch job process: {0}")]
    Launch(#[from] std::io::Error),

    #[error("Job has no command to run")]
    MissingCommand,

    #[error("Job failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn only_transport_errors_are_transient() {
        assert!(StoreError::Transport("reset".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        assert!(!StoreError::Invalid("terminal".into()).is_transient());
        assert!(!StoreError::Conflict {
            id: "x".into(),
            expected: 1,
            actual: 2
        }
        .is_transient());
    }

    #[test]
    fn declined_pool_errors() {
        let job_id = Uuid::new_v4();
        assert!(PoolError::Busy.is_declined());
        assert!(PoolError::NotPending {
            job_id,
            run: RunStatus::Running
        }
        .is_declined());
        assert!(PoolError::Reservation(ReservationError::LockingFailed {
            job_id,
            reason: StoreError::Invalid("terminal".into()),
        })
        .is_declined());
        assert!(!PoolError::ShuttingDown.is_declined());
        assert!(!PoolError::Reservation(ReservationError::JobUpdateFailure {
            job_id,
            attempts: 5,
            last_error: StoreError::Transport("down".into()),
        })
        .is_declined());
    }
}
