//! jobwarden: safety coordinator for concurrently running parameterized jobs.
//!
//! Keeps jobs of the same family from clobbering each other's checkpoints,
//! refuses duplicate submissions, releases dependent jobs when their
//! predecessors finish, caps per-job memory with swap disabled, and adapts
//! per-group parallelism to host headroom.

pub mod autoscale;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod guard;
pub mod job;
pub mod limits;
pub mod metrics;
pub mod probe;
pub mod queue;

// Re-export commonly used types
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{Coordinator, CoordinatorError, JobRequest, SubmitOutcome};
pub use error::{CheckpointError, GraphError, KeyError, ProbeError};
