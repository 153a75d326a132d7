//! Submission path for parameterized jobs.
//!
//! `Coordinator::submit` ties the components together:
//!
//! 1. resolve environment defaults (overrides are logged and dropped)
//! 2. derive the checkpoint key (a missing differentiating parameter is fatal)
//! 3. look up the group profile
//! 4. ask the duplicate guard
//! 5. derive the hard memory cap
//! 6. hand the `JobSpec` to the queue
//!
//! If the queue rejects the job, the guard reservation is released so the
//! same identity can be retried immediately.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::autoscale::{GroupLimits, GroupResourceProfile};
use crate::checkpoint::{CheckpointKey, CheckpointStore, KeyRegistry};
use crate::config::{ConfigError, CoordinatorConfig};
use crate::error::{CheckpointError, KeyError};
use crate::guard::{ConcurrencyGuard, GuardDecision};
use crate::job::defaults::resolve;
use crate::job::{EnvironmentProvider, Job, JobId, JobIdentity, PolicyViolation, StaticEnvironment};
use crate::limits::MemoryCapPolicy;
use crate::queue::{JobQueueClient, JobSpec, QueueError, QueueJobId};

/// Errors surfaced by the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    InvalidParameter(#[from] KeyError),

    #[error("Unknown resource group '{0}'")]
    UnknownGroup(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl CoordinatorError {
    /// Whether retrying the same request can never succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvalidParameter(_)
                | CoordinatorError::UnknownGroup(_)
                | CoordinatorError::Config(_)
        )
    }
}

/// A job the caller wants submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: JobId,
    pub identity: JobIdentity,
    pub group: String,
}

impl JobRequest {
    pub fn new(job_id: impl Into<JobId>, identity: JobIdentity, group: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            identity,
            group: group.into(),
        }
    }
}

impl From<&Job> for JobRequest {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            identity: job.identity.clone(),
            group: job.group.clone(),
        }
    }
}

/// Result of a submission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The queue accepted the job.
    ///
    /// `violations` lists submitted parameters that were reset to the
    /// environment's resolved default.
    Submitted {
        queue_id: QueueJobId,
        spec: JobSpec,
        violations: Vec<PolicyViolation>,
    },
    /// An identical job is queued or running; nothing was submitted.
    AlreadyRunning,
}

impl SubmitOutcome {
    pub fn is_submitted(&self) -> bool {
        matches!(self, SubmitOutcome::Submitted { .. })
    }

    /// Defaults the submission overrode; empty unless submitted.
    pub fn violations(&self) -> &[PolicyViolation] {
        match self {
            SubmitOutcome::Submitted { violations, .. } => violations,
            SubmitOutcome::AlreadyRunning => &[],
        }
    }
}

/// Front door for job submission.
pub struct Coordinator {
    keys: KeyRegistry,
    environment: Arc<dyn EnvironmentProvider>,
    profiles: HashMap<String, GroupResourceProfile>,
    memory_policy: MemoryCapPolicy,
    guard: ConcurrencyGuard,
    queue: Arc<dyn JobQueueClient>,
    store: Arc<CheckpointStore>,
    limits: GroupLimits,
}

impl Coordinator {
    pub fn new(
        profiles: impl IntoIterator<Item = GroupResourceProfile>,
        queue: Arc<dyn JobQueueClient>,
        store: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            keys: KeyRegistry::new(),
            environment: Arc::new(StaticEnvironment::new()),
            profiles: profiles
                .into_iter()
                .map(|profile| (profile.name.clone(), profile))
                .collect(),
            memory_policy: MemoryCapPolicy::default(),
            guard: ConcurrencyGuard::new(queue.clone()),
            queue,
            store,
            limits: GroupLimits::new(),
        }
    }

    /// Builds a coordinator from configuration, opening the checkpoint store.
    pub async fn from_config(
        config: &CoordinatorConfig,
        queue: Arc<dyn JobQueueClient>,
    ) -> Result<Self, CoordinatorError> {
        config.validate()?;
        let store = Arc::new(CheckpointStore::open(&config.checkpoint_dir).await?);

        let guard = ConcurrencyGuard::new(queue.clone())
            .with_timeout(config.guard_timeout())
            .with_reservation_ttl(config.reservation_ttl());

        Ok(Self::new(config.groups.clone(), queue, store)
            .with_keys(config.key_registry())
            .with_environment(Arc::new(config.environment()))
            .with_memory_policy(config.memory_policy())
            .with_guard(guard))
    }

    pub fn with_keys(mut self, keys: KeyRegistry) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_environment(mut self, environment: Arc<dyn EnvironmentProvider>) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_memory_policy(mut self, policy: MemoryCapPolicy) -> Self {
        self.memory_policy = policy;
        self
    }

    pub fn with_guard(mut self, guard: ConcurrencyGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Reads current limits from the autoscaler's view.
    pub fn with_limits(mut self, limits: GroupLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Submits a job unless an identical one is live.
    ///
    /// # Errors
    ///
    /// - `InvalidParameter` and `UnknownGroup` are caller bugs; see
    ///   [`CoordinatorError::is_fatal`].
    /// - `Queue` when the daemon rejected or could not be reached; the
    ///   reservation is released first.
    pub async fn submit(&self, request: JobRequest) -> Result<SubmitOutcome, CoordinatorError> {
        let resolved = resolve(self.environment.as_ref(), &request.identity);
        let identity = resolved.identity;
        let violations = resolved.violations;

        let checkpoint_key = self.keys.key_for(&identity)?;

        let profile = self
            .profiles
            .get(&request.group)
            .ok_or_else(|| CoordinatorError::UnknownGroup(request.group.clone()))?;

        if self.guard.check_and_reserve(&identity).await == GuardDecision::AlreadyRunning {
            info!(job_id = %request.job_id, label = %identity, "Skipping submission, identical job is live");
            return Ok(SubmitOutcome::AlreadyRunning);
        }

        let memory_cap = self.memory_policy.derive_limit(&identity, profile);
        let spec = JobSpec {
            job_id: request.job_id.clone(),
            label: identity.label(),
            identity: identity.clone(),
            group: request.group.clone(),
            checkpoint_key,
            memory_cap,
            submitted_at: Utc::now(),
        };

        match self.queue.submit(&spec).await {
            Ok(queue_id) => {
                info!(
                    job_id = %spec.job_id,
                    queue_id = %queue_id,
                    key = %spec.checkpoint_key,
                    group = %spec.group,
                    memory_mb = spec.memory_cap.hard_limit_mib(),
                    "Job submitted"
                );
                Ok(SubmitOutcome::Submitted {
                    queue_id,
                    spec,
                    violations,
                })
            }
            Err(e) => {
                self.guard.release(&identity);
                warn!(job_id = %request.job_id, error = %e, "Queue rejected submission");
                Err(e.into())
            }
        }
    }

    /// Checkpoint key of an identity after defaults are applied.
    pub fn checkpoint_key(&self, identity: &JobIdentity) -> Result<CheckpointKey, KeyError> {
        let resolved = resolve(self.environment.as_ref(), identity);
        self.keys.key_for(&resolved.identity)
    }

    /// Current parallelism of `group`.
    ///
    /// Falls back to the profile's initial value until the autoscaler
    /// publishes one.
    pub fn current_limit(&self, group: &str) -> Option<usize> {
        let limit = self
            .limits
            .get(group)
            .or_else(|| self.profiles.get(group).map(GroupResourceProfile::initial));
        debug!(group = %group, limit = ?limit, "Current limit lookup");
        limit
    }

    pub fn profile(&self, group: &str) -> Option<&GroupResourceProfile> {
        self.profiles.get(group)
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn JobQueueClient> {
        &self.queue
    }
}
