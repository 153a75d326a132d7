//! Interface to the external job queue daemon.
//!
//! The coordinator never runs jobs itself. It hands a `JobSpec` to the
//! daemon, asks it which identities are live, tells it the per-group
//! parallelism limit, and polls job status.
//!
//! - **InMemoryJobQueue**: scripted backend for tests and dry runs
//! - **RedisJobQueue**: Redis hashes and lists shared with the daemon
//!
//! ```text
//!   Coordinator ──submit──► JobQueueClient ──► daemon ──► job process
//!   Guard ──list_running──►       │
//!   Autoscaler ──set_parallelism──►
//!   DependencyWatcher ──status──►
//! ```

pub mod memory;
pub mod redis_queue;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointKey;
use crate::job::{JobId, JobIdentity, JobStatus};
use crate::limits::MemoryCap;

pub use memory::InMemoryJobQueue;
pub use redis_queue::{QueueKeys, RedisJobQueue};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue daemon could not be reached.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or parse job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The queue has no record of the job.
    #[error("Job {0} not found")]
    JobNotFound(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The daemon refused the request.
    #[error("Queue rejected request: {0}")]
    Rejected(String),
}

/// Identifier assigned by the queue daemon on submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueJobId(String);

impl QueueJobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job status as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl QueueStatus {
    /// Returns whether the job occupies (or is waiting for) a slot.
    pub fn is_live(&self) -> bool {
        matches!(self, QueueStatus::Queued | QueueStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl From<QueueStatus> for JobStatus {
    fn from(status: QueueStatus) -> Self {
        match status {
            QueueStatus::Queued => JobStatus::Queued,
            QueueStatus::Running => JobStatus::Running,
            QueueStatus::Succeeded => JobStatus::Succeeded,
            QueueStatus::Failed => JobStatus::Failed,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        JobStatus::from(*self).fmt(f)
    }
}

/// Everything the daemon needs to launch one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Submitter-chosen identifier.
    pub job_id: JobId,
    /// Family and resolved parameters.
    pub identity: JobIdentity,
    /// Human-readable label, for operators only.
    pub label: String,
    /// Resource group the job counts against.
    pub group: String,
    /// Key the job reads and writes its checkpoint under.
    pub checkpoint_key: CheckpointKey,
    /// Hard memory limit, swap disabled.
    pub memory_cap: MemoryCap,
    /// When the coordinator handed the job over.
    pub submitted_at: DateTime<Utc>,
}

/// Client side of the external job queue daemon.
///
/// Implementations must be safe to share between the coordinator, the
/// autoscaler and the dependency watcher.
#[async_trait]
pub trait JobQueueClient: Send + Sync {
    /// Hands a job to the daemon.
    async fn submit(&self, spec: &JobSpec) -> Result<QueueJobId, QueueError>;

    /// Identities of all queued or running jobs.
    async fn list_running(&self) -> Result<Vec<JobIdentity>, QueueError>;

    /// Sets how many jobs of `group` may run at once.
    async fn set_parallelism(&self, group: &str, limit: usize) -> Result<(), QueueError>;

    /// Current status of a submitted job.
    async fn status(&self, id: &QueueJobId) -> Result<QueueStatus, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));

        let err = QueueError::JobNotFound("job-000001".to_string());
        assert!(err.to_string().contains("not found"));

        let err = QueueError::Timeout(Duration::from_secs(5));
        assert!(err.to_string().contains("5s"));
    }

    #[test]
    fn test_live_statuses() {
        assert!(QueueStatus::Queued.is_live());
        assert!(QueueStatus::Running.is_live());
        assert!(QueueStatus::Succeeded.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_maps_to_job_status() {
        assert_eq!(JobStatus::from(QueueStatus::Running), JobStatus::Running);
        assert_eq!(JobStatus::from(QueueStatus::Failed), JobStatus::Failed);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&QueueStatus::Succeeded).expect("serialize");
        assert_eq!(json, "\"succeeded\"");
    }
}
