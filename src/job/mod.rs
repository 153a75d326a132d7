//! Job definitions for the coordinator.
//!
//! This module defines the core job types the coordinator reasons about:
//!
//! - `Job`: A parameterized unit of work submitted to the external queue
//! - `JobId`: Submitter-chosen identifier used for dependency edges
//! - `JobIdentity`: Family plus parameters, the unit of duplicate detection
//! - `JobStatus`: Last observed status of a job

pub mod defaults;
pub mod identity;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use defaults::{EnvironmentProvider, PolicyViolation, Resolved, StaticEnvironment};
pub use identity::JobIdentity;

/// Submitter-chosen job identifier.
///
/// Dependency edges are expressed in terms of `JobId`s. The queue daemon
/// assigns its own identifier on submission (`queue::QueueJobId`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Status of a job as observed by the coordinator.
///
/// The external queue daemon owns `Queued`, `Running`, `Succeeded` and
/// `Failed`. `Pending` and `Blocked` are coordinator-side views: a job that
/// was never submitted, or one held back by its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet submitted.
    Pending,
    /// Accepted by the queue daemon, waiting for a slot.
    Queued,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Held back by unresolved or failed predecessors.
    Blocked,
}

impl JobStatus {
    /// Returns whether the status can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// A parameterized job.
///
/// Jobs are created by a submitter. Their status is mutated only by the
/// external queue daemon; the coordinator records what it observes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Submitter-chosen identifier.
    pub id: JobId,
    /// Family and parameters.
    pub identity: JobIdentity,
    /// Resource group the job runs in.
    pub group: String,
    /// Jobs that must succeed before this one may be submitted.
    #[serde(default)]
    pub depends_on: Vec<JobId>,
    /// Last observed status.
    #[serde(default = "default_status")]
    pub status: JobStatus,
}

fn default_status() -> JobStatus {
    JobStatus::Pending
}

impl Job {
    /// Creates a new pending job with no dependencies.
    pub fn new(id: impl Into<JobId>, identity: JobIdentity, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identity,
            group: group.into(),
            depends_on: Vec::new(),
            status: JobStatus::Pending,
        }
    }

    /// Adds a predecessor that must succeed first.
    pub fn depends_on(mut self, predecessor: impl Into<JobId>) -> Self {
        self.depends_on.push(predecessor.into());
        self
    }

    /// Human-readable label derived from the identity.
    pub fn label(&self) -> String {
        self.identity.label()
    }
}
