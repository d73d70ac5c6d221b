//! Runner side of the mesh: everything that turns pending jobs into results.
//!
//! # Components
//!
//! - [`ReservationClient`]: version-checked job writes with bounded retry
//! - [`StatusMonitor`]: slot status table, IDLE/BUSY aggregate, ACCEPTING/FULL flag
//! - [`WorkerPool`]: fixed slots, reserve-then-handoff, graceful shutdown
//! - [`JobFeeder`]: pulls pending jobs whenever the pool has room
//! - [`HeartbeatReporter`]: keeps the runner's registry entry fresh
//! - [`processor`]: the pluggable job execution seam
//!
//! # Job flow
//!
//! 1. A job arrives by push (registry callback) or pull (feeder)
//! 2. [`WorkerPool::submit`] reserves it in the store and hands it to an idle slot
//! 3. The slot runs the job's processor and writes the final status through
//!    [`ReservationClient::update`]
//! 4. The slot reports IDLE again, which may reopen the pool and trigger the feeder

pub mod feeder;
pub mod heartbeat;
pub mod monitor;
pub mod pool;
pub mod processor;
pub mod reservation;

pub use feeder::JobFeeder;
pub use heartbeat::HeartbeatReporter;
pub use monitor::{AggregateStatus, PoolStatus, SlotId, SlotStatus, StatusListener, StatusMonitor};
pub use pool::{ShutdownReport, WorkerPool};
pub use processor::{
    FnProcessorFactory, JobProcessor, ProcessorFactory, ShellProcessorFactory,
};
pub use reservation::ReservationClient;
