//! Dependency chaining between jobs.
//!
//! A `DependencyGraph` is built once from jobs and predecessor edges and
//! rejected if it contains a cycle. Afterwards it only moves forward:
//!
//! ```text
//!  Waiting ──all predecessors resolved──► Eligible ──► Submitted ──► Running
//!     │                                                   │            │
//!     └──FailFast predecessor failed──► Blocked           ▼            ▼
//!                                                    Succeeded | Failed
//! ```
//!
//! An edge resolves when its predecessor succeeded, or when the predecessor
//! failed (or was blocked) and the edge uses `EdgePolicy::SkipOnFailure`.
//! `Blocked` is permanent. An edge declared more than once keeps
//! `FailFast` if any declaration asks for it.
//!
//! The `watcher` submodule drives a graph against the live queue.

pub mod watcher;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::GraphError;
use crate::job::{Job, JobId, JobStatus};
use crate::metrics::MetricsCollector;

pub use watcher::{DependencyWatcher, WatchError, WatchReport};

/// What a successor does when its predecessor fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgePolicy {
    /// The successor and everything after it is blocked.
    #[default]
    FailFast,
    /// The edge counts as resolved; the successor may still run.
    SkipOnFailure,
}

/// `successor` may not start before `predecessor` resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub successor: JobId,
    pub predecessor: JobId,
    #[serde(default)]
    pub policy: EdgePolicy,
}

/// Graph-local state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Some predecessor edge is unresolved.
    Waiting,
    /// Ready to submit.
    Eligible,
    Submitted,
    Running,
    Succeeded,
    Failed,
    /// A predecessor failed across a fail-fast edge. Never submitted.
    Blocked,
}

impl NodeState {
    /// Status reported for the job.
    pub fn job_status(&self) -> JobStatus {
        match self {
            NodeState::Waiting | NodeState::Blocked => JobStatus::Blocked,
            NodeState::Eligible => JobStatus::Pending,
            NodeState::Submitted => JobStatus::Queued,
            NodeState::Running => JobStatus::Running,
            NodeState::Succeeded => JobStatus::Succeeded,
            NodeState::Failed => JobStatus::Failed,
        }
    }

    /// Whether the state can no longer change.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Blocked
        )
    }

    fn name(&self) -> &'static str {
        match self {
            NodeState::Waiting => "waiting",
            NodeState::Eligible => "eligible",
            NodeState::Submitted => "submitted",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Blocked => "blocked",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Effect of marking a job failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Successors that became permanently blocked.
    pub blocked: Vec<JobId>,
    /// Successors released across skip-on-failure edges.
    pub released: Vec<JobId>,
}

#[derive(Debug, Clone)]
struct Node {
    state: NodeState,
    predecessors: Vec<(JobId, EdgePolicy)>,
    successors: Vec<(JobId, EdgePolicy)>,
}

/// Collects jobs and edges; `build` validates them.
#[derive(Debug, Default)]
pub struct DependencyGraphBuilder {
    jobs: Vec<JobId>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_job(&mut self, id: impl Into<JobId>) -> &mut Self {
        self.jobs.push(id.into());
        self
    }

    /// Adds a fail-fast edge.
    pub fn add_edge(&mut self, successor: impl Into<JobId>, predecessor: impl Into<JobId>) -> &mut Self {
        self.add_edge_with_policy(successor, predecessor, EdgePolicy::FailFast)
    }

    pub fn add_edge_with_policy(
        &mut self,
        successor: impl Into<JobId>,
        predecessor: impl Into<JobId>,
        policy: EdgePolicy,
    ) -> &mut Self {
        self.edges.push(DependencyEdge {
            successor: successor.into(),
            predecessor: predecessor.into(),
            policy,
        });
        self
    }

    /// Validates the graph.
    ///
    /// # Errors
    ///
    /// - `GraphError::DuplicateJob` if a job was added twice
    /// - `GraphError::UnknownJob` if an edge names a job that was not added
    /// - `GraphError::CyclicDependency` naming one cycle, if any exists
    pub fn build(&self) -> Result<DependencyGraph, GraphError> {
        let mut nodes: HashMap<JobId, Node> = HashMap::with_capacity(self.jobs.len());
        for id in &self.jobs {
            let node = Node {
                state: NodeState::Waiting,
                predecessors: Vec::new(),
                successors: Vec::new(),
            };
            if nodes.insert(id.clone(), node).is_some() {
                return Err(GraphError::DuplicateJob(id.to_string()));
            }
        }

        let mut seen_edges = HashSet::new();
        for edge in &self.edges {
            for endpoint in [&edge.successor, &edge.predecessor] {
                if !nodes.contains_key(endpoint) {
                    return Err(GraphError::UnknownJob(endpoint.to_string()));
                }
            }
            if !seen_edges.insert((edge.successor.clone(), edge.predecessor.clone())) {
                // Repeated edge: FailFast wins over SkipOnFailure
                if edge.policy == EdgePolicy::FailFast {
                    tighten_edge(&mut nodes, edge);
                }
                continue;
            }
            if let Some(node) = nodes.get_mut(&edge.successor) {
                node.predecessors.push((edge.predecessor.clone(), edge.policy));
            }
            if let Some(node) = nodes.get_mut(&edge.predecessor) {
                node.successors.push((edge.successor.clone(), edge.policy));
            }
        }

        let order = topological_sort(&self.jobs, &nodes)?;

        for node in nodes.values_mut() {
            if node.predecessors.is_empty() {
                node.state = NodeState::Eligible;
            }
        }

        debug!(jobs = order.len(), edges = seen_edges.len(), "Dependency graph built");

        Ok(DependencyGraph {
            order,
            nodes,
            metrics: MetricsCollector::new(),
        })
    }
}

fn tighten_edge(nodes: &mut HashMap<JobId, Node>, edge: &DependencyEdge) {
    if let Some(node) = nodes.get_mut(&edge.successor) {
        for (id, policy) in &mut node.predecessors {
            if *id == edge.predecessor {
                *policy = EdgePolicy::FailFast;
            }
        }
    }
    if let Some(node) = nodes.get_mut(&edge.predecessor) {
        for (id, policy) in &mut node.successors {
            if *id == edge.successor {
                *policy = EdgePolicy::FailFast;
            }
        }
    }
}

/// Kahn's algorithm, ties broken by insertion order.
fn topological_sort(jobs: &[JobId], nodes: &HashMap<JobId, Node>) -> Result<Vec<JobId>, GraphError> {
    let mut in_degree: HashMap<&JobId, usize> = nodes
        .iter()
        .map(|(id, node)| (id, node.predecessors.len()))
        .collect();

    let mut ready: VecDeque<&JobId> = jobs
        .iter()
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut order = Vec::with_capacity(jobs.len());

    while let Some(id) = ready.pop_front() {
        order.push(id.clone());
        if let Some(node) = nodes.get(id) {
            for (successor, _) in &node.successors {
                if let Some(degree) = in_degree.get_mut(successor) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(successor);
                    }
                }
            }
        }
    }

    if order.len() == jobs.len() {
        return Ok(order);
    }

    let remaining: HashSet<&JobId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree > 0)
        .map(|(id, _)| *id)
        .collect();
    Err(GraphError::CyclicDependency(find_cycle(jobs, nodes, &remaining)))
}

/// Walks predecessor links inside the unsorted remainder until a job repeats.
fn find_cycle(jobs: &[JobId], nodes: &HashMap<JobId, Node>, remaining: &HashSet<&JobId>) -> Vec<String> {
    let Some(start) = jobs.iter().find(|id| remaining.contains(id)) else {
        return Vec::new();
    };

    let mut path: Vec<&JobId> = vec![start];
    let mut position: HashMap<&JobId, usize> = HashMap::from([(start, 0)]);
    let mut current = start;

    loop {
        // Every job left over by Kahn's algorithm has a leftover predecessor
        let next = nodes.get(current).and_then(|node| {
            node.predecessors
                .iter()
                .map(|(pred, _)| pred)
                .find(|pred| remaining.contains(pred))
        });
        let Some(next) = next else {
            return path.iter().map(|id| id.to_string()).collect();
        };

        if let Some(&at) = position.get(next) {
            // Report in dependency order: predecessor before successor
            let mut cycle: Vec<String> = path[at..].iter().rev().map(|id| id.to_string()).collect();
            if let Some(first) = cycle.first().cloned() {
                cycle.push(first);
            }
            return cycle;
        }

        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

/// Validated, acyclic dependency graph with per-job state.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    order: Vec<JobId>,
    nodes: HashMap<JobId, Node>,
    metrics: MetricsCollector,
}

impl DependencyGraph {
    pub fn builder() -> DependencyGraphBuilder {
        DependencyGraphBuilder::new()
    }

    /// Builds a graph from jobs and their `depends_on` lists (fail-fast edges).
    pub fn from_jobs(jobs: &[Job]) -> Result<Self, GraphError> {
        let mut builder = DependencyGraphBuilder::new();
        for job in jobs {
            builder.add_job(job.id.clone());
        }
        for job in jobs {
            for predecessor in &job.depends_on {
                builder.add_edge(job.id.clone(), predecessor.clone());
            }
        }
        builder.build()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn node(&self, id: &JobId) -> Result<&Node, GraphError> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownJob(id.to_string()))
    }

    pub fn node_state(&self, id: &JobId) -> Result<NodeState, GraphError> {
        Ok(self.node(id)?.state)
    }

    pub fn status(&self, id: &JobId) -> Result<JobStatus, GraphError> {
        Ok(self.node(id)?.state.job_status())
    }

    /// Jobs ready to submit, in topological order.
    pub fn eligible(&self) -> Vec<JobId> {
        self.in_state(|state| state == NodeState::Eligible)
    }

    /// Jobs handed to the queue that have not finished.
    pub fn in_flight(&self) -> Vec<JobId> {
        self.in_state(|state| matches!(state, NodeState::Submitted | NodeState::Running))
    }

    /// Jobs that will never run.
    pub fn blocked(&self) -> Vec<JobId> {
        self.in_state(|state| state == NodeState::Blocked)
    }

    fn in_state(&self, predicate: impl Fn(NodeState) -> bool) -> Vec<JobId> {
        self.order
            .iter()
            .filter(|id| self.nodes.get(*id).is_some_and(|node| predicate(node.state)))
            .cloned()
            .collect()
    }

    /// Whether every job succeeded, failed, or is blocked.
    pub fn is_complete(&self) -> bool {
        self.nodes.values().all(|node| node.state.is_final())
    }

    pub fn successors(&self, id: &JobId) -> Result<Vec<JobId>, GraphError> {
        Ok(self.node(id)?.successors.iter().map(|(s, _)| s.clone()).collect())
    }

    pub fn predecessors(&self, id: &JobId) -> Result<Vec<JobId>, GraphError> {
        Ok(self.node(id)?.predecessors.iter().map(|(p, _)| p.clone()).collect())
    }

    /// Every job, predecessors before successors.
    pub fn topological_order(&self) -> &[JobId] {
        &self.order
    }

    fn transition(&mut self, id: &JobId, allowed: &[NodeState], to: NodeState) -> Result<bool, GraphError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownJob(id.to_string()))?;

        if node.state == to {
            return Ok(false);
        }
        if !allowed.contains(&node.state) {
            return Err(GraphError::InvalidTransition {
                job: id.to_string(),
                from: node.state.to_string(),
                to: to.to_string(),
            });
        }

        node.state = to;
        self.metrics.record_graph_transition(to.name());
        debug!(job_id = %id, state = %to, "Job state changed");
        Ok(true)
    }

    /// Records that an eligible job was handed to the queue.
    pub fn mark_submitted(&mut self, id: &JobId) -> Result<(), GraphError> {
        self.transition(id, &[NodeState::Eligible], NodeState::Submitted)?;
        Ok(())
    }

    /// Records that the queue started a submitted job.
    pub fn mark_running(&mut self, id: &JobId) -> Result<(), GraphError> {
        self.transition(id, &[NodeState::Submitted], NodeState::Running)?;
        Ok(())
    }

    /// Records success and returns the successors that became eligible.
    ///
    /// Repeating the mark returns an empty list.
    pub fn mark_succeeded(&mut self, id: &JobId) -> Result<Vec<JobId>, GraphError> {
        let changed = self.transition(
            id,
            &[NodeState::Submitted, NodeState::Running],
            NodeState::Succeeded,
        )?;
        if !changed {
            return Ok(Vec::new());
        }

        let mut released = Vec::new();
        for (successor, _) in self.node(id)?.successors.clone() {
            if self.try_release(&successor)? {
                released.push(successor);
            }
        }

        if !released.is_empty() {
            info!(job_id = %id, released = released.len(), "Successors released");
        }
        Ok(released)
    }

    /// Records failure and propagates it to successors.
    ///
    /// Successors across fail-fast edges, and everything downstream of them,
    /// become permanently blocked. Successors across skip-on-failure edges
    /// are re-evaluated and may be released. Repeating the mark returns an
    /// empty outcome.
    pub fn mark_failed(&mut self, id: &JobId) -> Result<FailureOutcome, GraphError> {
        let changed = self.transition(
            id,
            &[NodeState::Submitted, NodeState::Running],
            NodeState::Failed,
        )?;
        let mut outcome = FailureOutcome::default();
        if !changed {
            return Ok(outcome);
        }

        let mut queue = VecDeque::from([id.clone()]);
        while let Some(failed) = queue.pop_front() {
            for (successor, policy) in self.node(&failed)?.successors.clone() {
                match policy {
                    EdgePolicy::FailFast => {
                        if self.node_state(&successor)? == NodeState::Waiting {
                            self.transition(&successor, &[NodeState::Waiting], NodeState::Blocked)?;
                            outcome.blocked.push(successor.clone());
                            queue.push_back(successor);
                        }
                    }
                    EdgePolicy::SkipOnFailure => {
                        if self.try_release(&successor)? {
                            outcome.released.push(successor);
                        }
                    }
                }
            }
        }

        if !outcome.blocked.is_empty() {
            info!(
                job_id = %id,
                blocked = outcome.blocked.len(),
                "Failure blocked downstream jobs"
            );
        }
        Ok(outcome)
    }

    /// Moves a waiting job to eligible if every predecessor edge resolved.
    fn try_release(&mut self, id: &JobId) -> Result<bool, GraphError> {
        let node = self.node(id)?;
        if node.state != NodeState::Waiting {
            return Ok(false);
        }

        let resolved = node.predecessors.iter().all(|(pred, policy)| {
            match self.nodes.get(pred).map(|p| p.state) {
                Some(NodeState::Succeeded) => true,
                Some(NodeState::Failed | NodeState::Blocked) => *policy == EdgePolicy::SkipOnFailure,
                _ => false,
            }
        });
        if !resolved {
            return Ok(false);
        }

        self.transition(id, &[NodeState::Waiting], NodeState::Eligible)
    }
}
