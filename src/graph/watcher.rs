//! Drives a dependency graph against the live queue.
//!
//! Each tick polls the status of every submitted job, applies the
//! resulting transitions, then submits whatever became eligible. Blocked
//! jobs are never submitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{DependencyGraph, NodeState};
use crate::coordinator::{Coordinator, CoordinatorError, JobRequest, SubmitOutcome};
use crate::error::GraphError;
use crate::job::{Job, JobId, JobStatus};
use crate::queue::{QueueJobId, QueueStatus};

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Errors that stop the watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Failed to submit job '{job}': {source}")]
    Submit {
        job: JobId,
        #[source]
        source: CoordinatorError,
    },
}

/// What one tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchReport {
    pub submitted: Vec<JobId>,
    /// Eligible jobs left for a later tick (identical job live, queue error).
    pub deferred: Vec<JobId>,
    pub started: Vec<JobId>,
    pub succeeded: Vec<JobId>,
    pub failed: Vec<JobId>,
    pub blocked: Vec<JobId>,
    pub released: Vec<JobId>,
}

impl WatchReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// Submits jobs as their predecessors resolve.
pub struct DependencyWatcher {
    graph: DependencyGraph,
    jobs: HashMap<JobId, Job>,
    coordinator: Arc<Coordinator>,
    submitted: HashMap<JobId, QueueJobId>,
    poll_interval: Duration,
}

impl DependencyWatcher {
    /// Builds the graph from `jobs` and their `depends_on` lists.
    pub fn new(jobs: Vec<Job>, coordinator: Arc<Coordinator>) -> Result<Self, GraphError> {
        let graph = DependencyGraph::from_jobs(&jobs)?;
        Ok(Self::with_graph(graph, jobs, coordinator))
    }

    /// Uses a prebuilt graph, e.g. one with skip-on-failure edges.
    ///
    /// Every job in `graph` must have an entry in `jobs`; jobs without one
    /// are never submitted.
    pub fn with_graph(graph: DependencyGraph, jobs: Vec<Job>, coordinator: Arc<Coordinator>) -> Self {
        Self {
            graph,
            jobs: jobs.into_iter().map(|job| (job.id.clone(), job)).collect(),
            coordinator,
            submitted: HashMap::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Last observed status of a job.
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.jobs.get(id).map(|job| job.status)
    }

    /// Queue id of a submitted job that has not finished.
    pub fn queue_id(&self, id: &JobId) -> Option<&QueueJobId> {
        self.submitted.get(id)
    }

    pub fn is_complete(&self) -> bool {
        self.graph.is_complete()
    }

    /// Polls, applies transitions and submits eligible jobs.
    ///
    /// # Errors
    ///
    /// Returns `WatchError::Submit` when a job can never be submitted
    /// (invalid parameters, unknown group). Transient queue errors are
    /// logged and retried on the next tick.
    pub async fn tick(&mut self) -> Result<WatchReport, WatchError> {
        let mut report = WatchReport::default();

        self.poll(&mut report).await?;
        self.submit_eligible(&mut report).await?;
        self.sync_statuses();

        Ok(report)
    }

    async fn poll(&mut self, report: &mut WatchReport) -> Result<(), WatchError> {
        let queue = self.coordinator.queue().clone();
        let polled: Vec<(JobId, QueueJobId)> = self
            .submitted
            .iter()
            .map(|(job, queue_id)| (job.clone(), queue_id.clone()))
            .collect();

        let statuses = join_all(polled.iter().map(|(_, queue_id)| queue.status(queue_id))).await;

        for ((job, queue_id), status) in polled.into_iter().zip(statuses) {
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    warn!(job_id = %job, queue_id = %queue_id, error = %e, "Status poll failed");
                    continue;
                }
            };

            match status {
                QueueStatus::Queued => {}
                QueueStatus::Running => {
                    if self.graph.node_state(&job)? == NodeState::Submitted {
                        self.graph.mark_running(&job)?;
                        report.started.push(job);
                    }
                }
                QueueStatus::Succeeded => {
                    self.submitted.remove(&job);
                    let released = self.graph.mark_succeeded(&job)?;
                    report.released.extend(released);
                    report.succeeded.push(job);
                }
                QueueStatus::Failed => {
                    self.submitted.remove(&job);
                    let outcome = self.graph.mark_failed(&job)?;
                    report.blocked.extend(outcome.blocked);
                    report.released.extend(outcome.released);
                    report.failed.push(job);
                }
            }
        }

        Ok(())
    }

    async fn submit_eligible(&mut self, report: &mut WatchReport) -> Result<(), WatchError> {
        for id in self.graph.eligible() {
            let Some(job) = self.jobs.get(&id) else {
                warn!(job_id = %id, "Eligible job has no definition, skipping");
                continue;
            };

            match self.coordinator.submit(JobRequest::from(job)).await {
                Ok(SubmitOutcome::Submitted { queue_id, .. }) => {
                    self.graph.mark_submitted(&id)?;
                    self.submitted.insert(id.clone(), queue_id);
                    report.submitted.push(id);
                }
                Ok(SubmitOutcome::AlreadyRunning) => {
                    debug!(job_id = %id, "Identical job live, deferring");
                    report.deferred.push(id);
                }
                Err(e) if e.is_fatal() => {
                    return Err(WatchError::Submit { job: id, source: e });
                }
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Submission failed, retrying next tick");
                    report.deferred.push(id);
                }
            }
        }
        Ok(())
    }

    fn sync_statuses(&mut self) {
        for (id, job) in self.jobs.iter_mut() {
            if let Ok(status) = self.graph.status(id) {
                job.status = status;
            }
        }
    }

    /// Ticks every poll interval until the graph completes or a shutdown
    /// signal arrives.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), WatchError> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            jobs = self.graph.len(),
            poll_interval_secs = self.poll_interval.as_secs(),
            "Dependency watcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Dependency watcher received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await?;
                    if !report.is_idle() {
                        debug!(
                            submitted = report.submitted.len(),
                            succeeded = report.succeeded.len(),
                            failed = report.failed.len(),
                            blocked = report.blocked.len(),
                            "Dependency watcher tick complete"
                        );
                    }
                    if self.graph.is_complete() {
                        info!(
                            blocked = self.graph.blocked().len(),
                            "All jobs resolved"
                        );
                        break;
                    }
                }
            }
        }

        info!("Dependency watcher stopped");
        Ok(())
    }
}
