//! Registry-side job placement.
//!
//! The push path offers each new or released job to idle runners through
//! their callback endpoint. Runners that miss a push pick the job up later
//! through their own [`JobFeeder`](crate::worker::JobFeeder).

pub mod callback;
pub mod push;

pub use callback::{CallbackOutcome, HttpRunnerCallback, RunnerCallback, RUNNING_JOBS_PATH};
pub use push::{PushDispatcher, PushOutcome};
