//! Checkpoint keys and durable checkpoint storage.
//!
//! - **ParameterKeyBuilder**: derives a collision-free key from a job's
//!   differentiating parameters
//! - **CheckpointStore**: one file per key, replaced atomically, deleted
//!   idempotently
//!
//! # Example
//!
//! ```rust,ignore
//! use jobwarden::checkpoint::{CheckpointStore, ParameterKeyBuilder};
//! use jobwarden::job::JobIdentity;
//!
//! let builder = ParameterKeyBuilder::new("ingest").differentiating(["threshold", "year"]);
//! let identity = JobIdentity::new("ingest")
//!     .with_param("threshold", 250)
//!     .with_param("year", 2024);
//! let key = builder.build_for(&identity)?; // "ingest:250:2024"
//!
//! let store = CheckpointStore::open("./checkpoints").await?;
//! store.write(&key, b"{\"step\":3}").await?;
//! store.delete(&key).await?;
//! store.delete(&key).await?; // still Ok
//! ```

pub mod key;
pub mod store;

pub use key::{build_key, build_named_key, CheckpointKey, KeyRegistry, ParameterKeyBuilder};
pub use store::{CheckpointStore, WriteReceipt};

pub(crate) use store::atomic_write;
