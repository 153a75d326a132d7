//! In-process job queue.
//!
//! Stands in for the daemon in tests and dry runs. Jobs never execute: their
//! status only changes when a test scripts it with `set_status`. Failure
//! modes (unreachable daemon, slow responses, refused submissions) can be
//! switched on to exercise the fail-open and fail-safe paths.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{JobQueueClient, JobSpec, QueueError, QueueJobId, QueueStatus};
use crate::job::{JobId, JobIdentity};

#[derive(Debug, Clone)]
struct QueuedJob {
    spec: JobSpec,
    status: QueueStatus,
}

#[derive(Debug, Default)]
struct QueueState {
    next_id: u64,
    jobs: BTreeMap<QueueJobId, QueuedJob>,
    parallelism: HashMap<String, usize>,
    unreachable: bool,
    latency: Option<Duration>,
    reject_submissions: bool,
    reject_parallelism: bool,
}

/// Job queue kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn simulate_network(&self) -> Result<(), QueueError> {
        let (latency, unreachable) = {
            let state = self.state.lock().await;
            (state.latency, state.unreachable)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unreachable {
            return Err(QueueError::ConnectionFailed(
                "in-memory queue marked unreachable".to_string(),
            ));
        }
        Ok(())
    }

    /// Sets the status of a submitted job.
    pub async fn set_status(&self, id: &QueueJobId, status: QueueStatus) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))?;
        job.status = status;
        Ok(())
    }

    /// Sets the status of the most recent submission of `job_id`.
    pub async fn set_status_for(&self, job_id: &JobId, status: QueueStatus) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .values_mut()
            .rev()
            .find(|job| &job.spec.job_id == job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job.status = status;
        Ok(())
    }

    /// All submitted specs, in submission order.
    pub async fn submitted(&self) -> Vec<JobSpec> {
        let state = self.state.lock().await;
        state.jobs.values().map(|job| job.spec.clone()).collect()
    }

    /// Last parallelism set for `group`.
    pub async fn parallelism(&self, group: &str) -> Option<usize> {
        self.state.lock().await.parallelism.get(group).copied()
    }

    /// Makes every call fail with `ConnectionFailed`.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    /// Delays every call by `latency`.
    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().await.latency = latency;
    }

    /// Makes `submit` fail with `Rejected`.
    pub async fn fail_submissions(&self, reject: bool) {
        self.state.lock().await.reject_submissions = reject;
    }

    /// Makes `set_parallelism` fail with `Rejected`.
    pub async fn fail_parallelism_updates(&self, reject: bool) {
        self.state.lock().await.reject_parallelism = reject;
    }
}

#[async_trait]
impl JobQueueClient for InMemoryJobQueue {
    async fn submit(&self, spec: &JobSpec) -> Result<QueueJobId, QueueError> {
        self.simulate_network().await?;

        let mut state = self.state.lock().await;
        if state.reject_submissions {
            return Err(QueueError::Rejected(format!(
                "submission of {} refused",
                spec.label
            )));
        }

        state.next_id += 1;
        // Zero-padded so BTreeMap order is submission order
        let id = QueueJobId::new(format!("job-{:06}", state.next_id));
        state.jobs.insert(
            id.clone(),
            QueuedJob {
                spec: spec.clone(),
                status: QueueStatus::Queued,
            },
        );
        Ok(id)
    }

    async fn list_running(&self) -> Result<Vec<JobIdentity>, QueueError> {
        self.simulate_network().await?;

        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status.is_live())
            .map(|job| job.spec.identity.clone())
            .collect())
    }

    async fn set_parallelism(&self, group: &str, limit: usize) -> Result<(), QueueError> {
        self.simulate_network().await?;

        let mut state = self.state.lock().await;
        if state.reject_parallelism {
            return Err(QueueError::Rejected(format!(
                "parallelism update for {} refused",
                group
            )));
        }
        state.parallelism.insert(group.to_string(), limit);
        Ok(())
    }

    async fn status(&self, id: &QueueJobId) -> Result<QueueStatus, QueueError> {
        self.simulate_network().await?;

        let state = self.state.lock().await;
        state
            .jobs
            .get(id)
            .map(|job| job.status)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }
}
