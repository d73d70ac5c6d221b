pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{MeshError, Result};
pub use node::RunnerNode;
pub use registry::Registry;
