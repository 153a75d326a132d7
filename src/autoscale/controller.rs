//! The autoscaler control loop.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{GroupLimitStore, GroupLimits, GroupResourceProfile, ScalingPolicy};
use crate::config::ConfigError;
use crate::metrics::MetricsCollector;
use crate::probe::{ResourceProbe, ResourceSample};
use crate::queue::JobQueueClient;

/// Number of scaling decisions kept for inspection.
pub const HISTORY_CAPACITY: usize = 256;

/// Per-group position in the scaling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingState {
    Stable,
    Probing,
    ScalingUp,
    ScalingDown,
    /// Changed recently; no sampling until `until`.
    Cooldown { until: Instant },
}

impl ScalingState {
    pub fn name(&self) -> &'static str {
        match self {
            ScalingState::Stable => "stable",
            ScalingState::Probing => "probing",
            ScalingState::ScalingUp => "scaling_up",
            ScalingState::ScalingDown => "scaling_down",
            ScalingState::Cooldown { .. } => "cooldown",
        }
    }
}

impl fmt::Display for ScalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metric that caused a limit change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingTrigger {
    CpuLoad,
    MemoryAvailable,
    /// Limit restored from persisted state at startup.
    ManualRestore,
}

impl fmt::Display for ScalingTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingTrigger::CpuLoad => write!(f, "cpu_load"),
            ScalingTrigger::MemoryAvailable => write!(f, "memory_available"),
            ScalingTrigger::ManualRestore => write!(f, "manual_restore"),
        }
    }
}

/// Record of one applied limit change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingDecision {
    pub timestamp: DateTime<Utc>,
    pub group: String,
    pub old_limit: usize,
    pub new_limit: usize,
    pub trigger: ScalingTrigger,
}

impl ScalingDecision {
    /// "up" or "down".
    pub fn direction(&self) -> &'static str {
        if self.new_limit > self.old_limit {
            "up"
        } else {
            "down"
        }
    }
}

/// What happened to one group during a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupTick {
    /// Skipped without sampling.
    CoolingDown { remaining: Duration },
    /// Inside the stable band, or already at the bound.
    Unchanged,
    /// Limit changed and cooldown started.
    Scaled(ScalingDecision),
    /// Scale-up declined by the memory safety check.
    Vetoed {
        candidate: usize,
        required_bytes: u64,
        budget_bytes: u64,
    },
    /// No fresh sample; limit left as is.
    ProbeUnavailable,
    /// The queue refused the new limit; limit left as is.
    QueueRejected(String),
}

/// Outcome of one tick across all groups.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub outcomes: BTreeMap<String, GroupTick>,
    /// Sample the decisions were based on.
    pub sample: Option<ResourceSample>,
    /// Whether the host was sampled at all.
    pub probed: bool,
}

impl TickReport {
    pub fn outcome(&self, group: &str) -> Option<&GroupTick> {
        self.outcomes.get(group)
    }

    pub fn decisions(&self) -> Vec<&ScalingDecision> {
        self.outcomes
            .values()
            .filter_map(|outcome| match outcome {
                GroupTick::Scaled(decision) => Some(decision),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct GroupState {
    limit: usize,
    state: ScalingState,
}

/// Adjusts per-group parallelism to host headroom.
///
/// Sole writer of group limits. Other components read them through the
/// `GroupLimits` view returned by [`Autoscaler::limits`].
pub struct Autoscaler {
    profiles: BTreeMap<String, GroupResourceProfile>,
    policy: ScalingPolicy,
    probe: ResourceProbe,
    queue: Arc<dyn JobQueueClient>,
    groups: BTreeMap<String, GroupState>,
    limits: GroupLimits,
    store: Option<GroupLimitStore>,
    history: VecDeque<ScalingDecision>,
    metrics: MetricsCollector,
}

impl Autoscaler {
    /// Creates an autoscaler with every group at its initial parallelism.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if two profiles share a name.
    pub fn new(
        profiles: impl IntoIterator<Item = GroupResourceProfile>,
        policy: ScalingPolicy,
        probe: ResourceProbe,
        queue: Arc<dyn JobQueueClient>,
    ) -> Result<Self, ConfigError> {
        let limits = GroupLimits::new();
        let mut groups = BTreeMap::new();
        let mut by_name = BTreeMap::new();

        for profile in profiles {
            if by_name.contains_key(&profile.name) {
                return Err(ConfigError::ValidationFailed(format!(
                    "group '{}' is defined more than once",
                    profile.name
                )));
            }
            let initial = profile.initial();
            limits.set(&profile.name, initial);
            groups.insert(
                profile.name.clone(),
                GroupState {
                    limit: initial,
                    state: ScalingState::Stable,
                },
            );
            by_name.insert(profile.name.clone(), profile);
        }

        Ok(Self {
            profiles: by_name,
            policy,
            probe,
            queue,
            groups,
            limits,
            store: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            metrics: MetricsCollector::new(),
        })
    }

    /// Persists limits to `store` after every change.
    pub fn with_store(mut self, store: GroupLimitStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Restores persisted limits and pushes every limit to the queue.
    ///
    /// Persisted values are clamped to the current profile bounds; values of
    /// groups that no longer exist are ignored. Failures are logged and
    /// leave the initial limits in place.
    pub async fn initialize(&mut self) {
        if let Some(store) = self.store.clone() {
            match store.load().await {
                Ok(persisted) => {
                    for (group, stored) in persisted {
                        self.restore(&group, stored);
                    }
                }
                Err(e) => {
                    warn!(path = ?store.path(), error = %e, "Failed to load persisted group limits");
                }
            }
        }

        for (group, state) in &self.groups {
            match self.queue.set_parallelism(group, state.limit).await {
                Ok(()) => self.metrics.record_group_limit(group, state.limit),
                Err(e) => {
                    warn!(group = %group, limit = state.limit, error = %e, "Failed to push initial limit");
                }
            }
        }
    }

    fn restore(&mut self, group: &str, stored: usize) {
        let Some(profile) = self.profiles.get(group) else {
            debug!(group = %group, "Ignoring persisted limit of unknown group");
            return;
        };
        let restored = profile.clamp(stored);
        let Some(state) = self.groups.get_mut(group) else {
            return;
        };
        if state.limit == restored {
            return;
        }

        let decision = ScalingDecision {
            timestamp: Utc::now(),
            group: group.to_string(),
            old_limit: state.limit,
            new_limit: restored,
            trigger: ScalingTrigger::ManualRestore,
        };
        state.limit = restored;
        self.limits.set(group, restored);

        info!(
            group = %group,
            old_limit = decision.old_limit,
            new_limit = restored,
            "Restored persisted parallelism limit"
        );
        self.record(decision);
    }

    /// Current limit of `group`.
    pub fn current_limit(&self, group: &str) -> Option<usize> {
        self.groups.get(group).map(|state| state.limit)
    }

    pub fn state(&self, group: &str) -> Option<ScalingState> {
        self.groups.get(group).map(|state| state.state)
    }

    /// Shared read view of all limits.
    pub fn limits(&self) -> GroupLimits {
        self.limits.clone()
    }

    /// Recent decisions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &ScalingDecision> {
        self.history.iter()
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn profile(&self, group: &str) -> Option<&GroupResourceProfile> {
        self.profiles.get(group)
    }

    /// Runs one tick at the current time.
    pub async fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now()).await
    }

    /// Runs one tick as if the clock read `now`.
    pub async fn tick_at(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();
        let mut active = Vec::new();

        for (name, group) in self.groups.iter_mut() {
            if let ScalingState::Cooldown { until } = group.state {
                if now < until {
                    report.outcomes.insert(
                        name.clone(),
                        GroupTick::CoolingDown {
                            remaining: until - now,
                        },
                    );
                    continue;
                }
                debug!(group = %name, "Cooldown elapsed");
            }
            group.state = ScalingState::Probing;
            active.push(name.clone());
        }

        if active.is_empty() {
            debug!("Every group is cooling down, skipping probe");
            return report;
        }

        report.probed = true;
        let sample = match self.probe.sample(&active).await {
            Ok(sample) if !sample.stale => sample,
            Ok(stale) => {
                warn!(sampled_at = %stale.sampled_at, "Only a stale resource sample is available");
                self.hold(&active, &mut report);
                return report;
            }
            Err(e) => {
                warn!(error = %e, "Resource probe failed");
                self.hold(&active, &mut report);
                return report;
            }
        };

        for name in &active {
            let outcome = self.evaluate(name, &sample, now).await;
            report.outcomes.insert(name.clone(), outcome);
        }

        report.sample = Some(sample);
        report
    }

    fn hold(&mut self, active: &[String], report: &mut TickReport) {
        for name in active {
            warn!(group = %name, "Resource probe unavailable, limit unchanged");
            self.set_state(name, ScalingState::Stable);
            report
                .outcomes
                .insert(name.clone(), GroupTick::ProbeUnavailable);
        }
    }

    fn set_state(&mut self, group: &str, state: ScalingState) {
        if let Some(entry) = self.groups.get_mut(group) {
            entry.state = state;
        }
    }

    async fn evaluate(&mut self, name: &str, sample: &ResourceSample, now: Instant) -> GroupTick {
        let Some(profile) = self.profiles.get(name).cloned() else {
            return GroupTick::Unchanged;
        };
        let current = self
            .groups
            .get(name)
            .map(|state| state.limit)
            .unwrap_or_else(|| profile.initial());

        let cpu = sample.cpu_load_fraction;
        let memory = sample.memory_available_fraction;
        let step = self.policy.step;

        if cpu < self.policy.scale_up_cpu_below && memory > self.policy.scale_up_memory_above {
            let candidate = profile.clamp(current.saturating_add(step));
            if candidate == current {
                self.set_state(name, ScalingState::Stable);
                return GroupTick::Unchanged;
            }
            self.set_state(name, ScalingState::ScalingUp);

            let per_job_bytes = effective_per_job_bytes(&profile, current, sample);
            let required_bytes = per_job_bytes.saturating_mul(candidate as u64);
            let budget_bytes =
                (sample.memory_available_bytes as f64 * (1.0 - self.policy.safety_margin)) as u64;
            if required_bytes > budget_bytes {
                info!(
                    group = %name,
                    current = current,
                    candidate = candidate,
                    required_bytes = required_bytes,
                    budget_bytes = budget_bytes,
                    "Scale-up vetoed, not enough memory headroom"
                );
                self.metrics.record_veto(name);
                self.set_state(name, ScalingState::Stable);
                return GroupTick::Vetoed {
                    candidate,
                    required_bytes,
                    budget_bytes,
                };
            }

            return self
                .apply(name, current, candidate, ScalingTrigger::CpuLoad, now)
                .await;
        }

        let memory_pressure = memory < self.policy.scale_down_memory_below;
        if cpu > self.policy.scale_down_cpu_above || memory_pressure {
            let candidate = profile.clamp(current.saturating_sub(step));
            if candidate == current {
                self.set_state(name, ScalingState::Stable);
                return GroupTick::Unchanged;
            }
            self.set_state(name, ScalingState::ScalingDown);

            let trigger = if memory_pressure {
                ScalingTrigger::MemoryAvailable
            } else {
                ScalingTrigger::CpuLoad
            };
            return self.apply(name, current, candidate, trigger, now).await;
        }

        self.set_state(name, ScalingState::Stable);
        GroupTick::Unchanged
    }

    async fn apply(
        &mut self,
        name: &str,
        old_limit: usize,
        new_limit: usize,
        trigger: ScalingTrigger,
        now: Instant,
    ) -> GroupTick {
        if let Err(e) = self.queue.set_parallelism(name, new_limit).await {
            warn!(
                group = %name,
                old_limit = old_limit,
                new_limit = new_limit,
                error = %e,
                "Queue rejected parallelism update, limit unchanged"
            );
            self.set_state(name, ScalingState::Stable);
            return GroupTick::QueueRejected(e.to_string());
        }

        if let Some(entry) = self.groups.get_mut(name) {
            entry.limit = new_limit;
            entry.state = ScalingState::Cooldown {
                until: now + self.policy.cooldown,
            };
        }
        self.limits.set(name, new_limit);

        let decision = ScalingDecision {
            timestamp: Utc::now(),
            group: name.to_string(),
            old_limit,
            new_limit,
            trigger,
        };
        self.metrics
            .record_scaling(name, decision.direction(), new_limit);

        info!(
            group = %name,
            old_limit = old_limit,
            new_limit = new_limit,
            trigger = %trigger,
            "Parallelism limit changed"
        );

        self.persist().await;
        self.record(decision.clone());
        GroupTick::Scaled(decision)
    }

    async fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.limits.snapshot()).await {
                warn!(path = ?store.path(), error = %e, "Failed to persist group limits");
            }
        }
    }

    fn record(&mut self, decision: ScalingDecision) {
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(decision);
    }

    /// Ticks every `tick_interval` until a shutdown signal arrives.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.policy.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            groups = self.groups.len(),
            tick_interval_secs = self.policy.tick_interval.as_secs(),
            "Autoscaler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Autoscaler received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    debug!(
                        probed = report.probed,
                        changes = report.decisions().len(),
                        "Autoscaler tick complete"
                    );
                }
            }
        }

        info!("Autoscaler stopped");
    }
}

/// Per-job memory used for the scale-up veto.
///
/// The declared figure, raised to the measured average when the group's
/// running jobs already use more than declared.
fn effective_per_job_bytes(
    profile: &GroupResourceProfile,
    current: usize,
    sample: &ResourceSample,
) -> u64 {
    let declared = profile.per_job_memory_bytes();
    match sample.per_group_footprint.get(&profile.name) {
        Some(footprint) if current > 0 => declared.max(footprint / current as u64),
        _ => declared,
    }
}
