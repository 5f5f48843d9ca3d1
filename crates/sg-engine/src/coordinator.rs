//! Task coordination for fan-out steps.
//!
//! One [`Coordinator`] per run owns the task graph, the registered agents and
//! the run's conflict log. Every public operation is one transaction on the
//! graph state, and every transaction starts by sweeping expired leases
//! against the injected clock. There are no background timers.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use sg_core::clock::{SequenceCounter, SharedClock};
use sg_core::config::CoordinatorConfig;
use sg_core::types::{
    AgentId, Artifact, ConflictId, ConflictKind, ConflictRecord, ConflictStatus,
    ResolutionStrategy, RunId, TaskId, TaskStatus,
};
use sg_telemetry::metrics::{global_metrics, names};

use crate::content::{AcceptanceCheck, AdapterRequest, ContentGenerator};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid task graph: {0}")]
    Validation(String),
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency {
        cycle: Vec<TaskId>,
        conflict_id: ConflictId,
    },
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),
    #[error("unknown conflict: {0}")]
    UnknownConflict(ConflictId),
    #[error("agent {agent} does not hold a live claim on {task}")]
    NotHolder { task: TaskId, agent: AgentId },
    #[error("conflict {0} is already resolved")]
    ConflictClosed(ConflictId),
    #[error("conflict {0} is not an interface incompatibility")]
    WrongConflictKind(ConflictId),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

fn default_priority() -> f64 {
    0.5
}

/// A unit of work produced by a fan-out step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Task priority in [0, 1].
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Capabilities an agent needs to be a full match.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub estimate_secs: Option<u64>,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            depends_on: Vec::new(),
            priority: default_priority(),
            capabilities: BTreeSet::new(),
            estimate_secs: None,
        }
    }

    pub fn after(mut self, dependency: impl Into<TaskId>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn requiring(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }
}

/// An agent's request for exclusive work on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub agent: AgentId,
    pub task: TaskId,
    /// Priority score the requester brings; falls back to the task's own.
    #[serde(default)]
    pub priority: Option<f64>,
    /// Declared duration of the work; the lease adds a grace margin.
    #[serde(default)]
    pub estimate: Option<Duration>,
    /// Stamped by the coordinator on arrival when absent.
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
}

impl ClaimRequest {
    pub fn new(agent: impl Into<AgentId>, task: impl Into<TaskId>) -> Self {
        Self {
            agent: agent.into(),
            task: task.into(),
            priority: None,
            estimate: None,
            requested_at: None,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimate = Some(estimate);
        self
    }

    pub fn at(mut self, requested_at: DateTime<Utc>) -> Self {
        self.requested_at = Some(requested_at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AlreadyClaimed,
    DependenciesPending,
    NotAvailable,
    UnknownTask,
    UnknownAgent,
    AgentBusy,
    Throttled,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RejectReason::AlreadyClaimed => "already_claimed",
            RejectReason::DependenciesPending => "dependencies_pending",
            RejectReason::NotAvailable => "not_available",
            RejectReason::UnknownTask => "unknown_task",
            RejectReason::UnknownAgent => "unknown_agent",
            RejectReason::AgentBusy => "agent_busy",
            RejectReason::Throttled => "throttled",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimGrant {
    pub task: TaskId,
    pub agent: AgentId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimOutcome {
    Granted(ClaimGrant),
    Rejected(RejectReason),
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted(_))
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            ClaimOutcome::Granted(_) => None,
            ClaimOutcome::Rejected(reason) => Some(*reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub total: usize,
    pub available: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub task: TaskId,
    /// Dependents that became available in the same transaction.
    pub unblocked: Vec<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseExpiry {
    pub task: TaskId,
    pub agent: AgentId,
    pub reassigned_to: Option<AgentId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphProgress {
    pub total: usize,
    pub available: usize,
    pub claimed: usize,
    pub blocked: usize,
    pub completed: usize,
    pub conflicted: usize,
    pub unresolved_conflicts: usize,
}

impl GraphProgress {
    pub fn all_completed(&self) -> bool {
        self.completed == self.total
    }

    /// Every task completed and nothing left unresolved.
    pub fn is_done(&self) -> bool {
        self.all_completed() && self.unresolved_conflicts == 0
    }
}

/// Simultaneous conflict signals, handled in [`ConflictKind::resolution_rank`]
/// order by [`Coordinator::apply_signals`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictSignal {
    Incompatibility {
        tasks: Vec<TaskId>,
        agents: Vec<AgentId>,
        description: String,
    },
    Exhaustion {
        agent: AgentId,
        description: String,
    },
}

impl ConflictSignal {
    pub fn kind(&self) -> ConflictKind {
        match self {
            ConflictSignal::Incompatibility { .. } => ConflictKind::InterfaceIncompatibility,
            ConflictSignal::Exhaustion { .. } => ConflictKind::ResourceExhaustion,
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub holder: Option<AgentId>,
    pub lease_expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub completed_by: Option<AgentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub capabilities: BTreeSet<String>,
    pub claimed: Option<TaskId>,
    pub throttled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub tasks: Vec<TaskSnapshot>,
    pub agents: Vec<AgentSnapshot>,
    pub conflicts: Vec<ConflictRecord>,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Lease {
    agent: AgentId,
    expires: Instant,
    expires_wall: DateTime<Utc>,
}

#[derive(Debug)]
struct TaskEntry {
    spec: TaskSpec,
    status: TaskStatus,
    lease: Option<Lease>,
    artifacts: Vec<Artifact>,
    waiters: Vec<ClaimRequest>,
    completed_by: Option<AgentId>,
}

#[derive(Debug)]
struct AgentEntry {
    capabilities: BTreeSet<String>,
    claimed: Option<TaskId>,
    last_heartbeat: Instant,
    throttled: bool,
}

#[derive(Debug, Default)]
struct GraphState {
    tasks: BTreeMap<TaskId, TaskEntry>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
    agents: BTreeMap<AgentId, AgentEntry>,
    conflicts: Vec<ConflictRecord>,
}

impl GraphState {
    fn deps_completed(&self, spec: &TaskSpec) -> bool {
        spec.depends_on.iter().all(|d| {
            self.tasks
                .get(d)
                .is_some_and(|t| t.status == TaskStatus::Completed)
        })
    }

    fn conflict_mut(&mut self, id: ConflictId) -> Result<&mut ConflictRecord> {
        self.conflicts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(CoordinatorError::UnknownConflict(id))
    }

    /// Return conflicted tasks to the pool once no unresolved conflict
    /// names them.
    fn release_conflicted(&mut self, tasks: &[TaskId]) {
        for id in tasks {
            let still_conflicted = self
                .conflicts
                .iter()
                .any(|c| c.status.is_unresolved() && c.tasks.contains(id));
            if still_conflicted {
                continue;
            }
            let ready = match self.tasks.get(id) {
                Some(t) if t.status == TaskStatus::Conflicted => self.deps_completed(&t.spec),
                _ => continue,
            };
            if let Some(task) = self.tasks.get_mut(id) {
                task.status = if ready {
                    TaskStatus::Available
                } else {
                    TaskStatus::Blocked
                };
            }
        }
    }
}

/// Fields of a conflict about to be recorded.
struct ConflictDraft {
    kind: ConflictKind,
    tasks: Vec<TaskId>,
    agents: Vec<AgentId>,
    description: String,
    strategy: Option<ResolutionStrategy>,
    status: ConflictStatus,
    outcome: Option<String>,
    attempts: u32,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct Coordinator {
    run_id: RunId,
    config: CoordinatorConfig,
    clock: SharedClock,
    seq: Arc<SequenceCounter>,
    state: Mutex<GraphState>,
}

impl Coordinator {
    pub fn new(
        run_id: RunId,
        config: CoordinatorConfig,
        clock: SharedClock,
        seq: Arc<SequenceCounter>,
    ) -> Self {
        Self {
            run_id,
            config,
            clock,
            seq,
            state: Mutex::new(GraphState::default()),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    // -- Graph ---------------------------------------------------------------

    /// Replace the task graph. The graph is validated and checked for cycles
    /// before any task becomes available; on a cycle nothing is loaded and an
    /// escalated `cyclic_dependency` conflict is recorded.
    pub async fn load_graph(&self, specs: Vec<TaskSpec>) -> Result<GraphSummary> {
        validate_specs(&specs)?;
        let mut st = self.state.lock().await;

        if let Some(cycle) = find_cycle(&specs) {
            let record = self.record_conflict(
                &mut st,
                ConflictDraft {
                    kind: ConflictKind::CyclicDependency,
                    tasks: cycle.clone(),
                    agents: Vec::new(),
                    description: format!("task dependencies form a cycle: {}", cycle.join(" -> ")),
                    strategy: Some(ResolutionStrategy::Escalate),
                    status: ConflictStatus::Escalated,
                    outcome: None,
                    attempts: 0,
                },
            );
            return Err(CoordinatorError::CyclicDependency {
                cycle,
                conflict_id: record.id,
            });
        }

        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for spec in &specs {
            for dep in &spec.depends_on {
                dependents.entry(dep.clone()).or_default().push(spec.id.clone());
            }
        }
        st.tasks = specs
            .into_iter()
            .map(|spec| {
                let status = if spec.depends_on.is_empty() {
                    TaskStatus::Available
                } else {
                    TaskStatus::Blocked
                };
                (
                    spec.id.clone(),
                    TaskEntry {
                        spec,
                        status,
                        lease: None,
                        artifacts: Vec::new(),
                        waiters: Vec::new(),
                        completed_by: None,
                    },
                )
            })
            .collect();
        st.dependents = dependents;
        for agent in st.agents.values_mut() {
            agent.claimed = None;
        }

        let available: Vec<TaskId> = st
            .tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Available)
            .map(|(id, _)| id.clone())
            .collect();
        tracing::info!(
            run_id = %self.run_id,
            tasks = st.tasks.len(),
            available = available.len(),
            "task graph loaded"
        );
        Ok(GraphSummary {
            total: st.tasks.len(),
            available,
        })
    }

    // -- Agents --------------------------------------------------------------

    pub async fn register_agent<I, S>(&self, agent: impl Into<AgentId>, capabilities: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let agent = agent.into();
        let now = self.clock.now();
        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let mut st = self.state.lock().await;
        let entry = st.agents.entry(agent.clone()).or_insert_with(|| AgentEntry {
            capabilities: BTreeSet::new(),
            claimed: None,
            last_heartbeat: now,
            throttled: false,
        });
        entry.capabilities = capabilities;
        entry.last_heartbeat = now;
        tracing::debug!(run_id = %self.run_id, agent = %agent, "agent registered");
    }

    /// Record liveness. A live claim is extended to at least one grace
    /// period from now.
    pub async fn heartbeat(&self, agent: &str) -> Result<()> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);

        let entry = st
            .agents
            .get_mut(agent)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent.to_string()))?;
        entry.last_heartbeat = now;
        let claimed = entry.claimed.clone();

        if let Some(task_id) = claimed {
            let grace = self.config.claim_grace();
            if let Some(lease) = st.tasks.get_mut(&task_id).and_then(|t| t.lease.as_mut()) {
                if lease.expires < now + grace {
                    lease.expires = now + grace;
                    lease.expires_wall = wall + chrono_duration(grace);
                }
            }
        }
        Ok(())
    }

    pub async fn unthrottle(&self, agent: &str) -> Result<()> {
        let mut st = self.state.lock().await;
        let entry = st
            .agents
            .get_mut(agent)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent.to_string()))?;
        entry.throttled = false;
        tracing::info!(run_id = %self.run_id, agent = %agent, "agent unthrottled");
        Ok(())
    }

    // -- Claims --------------------------------------------------------------

    /// Grant or reject one claim. Concurrent requests for the same task are
    /// serialized by the graph lock: exactly one wins.
    pub async fn claim(&self, request: ClaimRequest) -> ClaimOutcome {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut request = request;
        request.requested_at.get_or_insert(wall);

        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);
        let outcome = self.try_claim(&mut st, &request, now, wall);
        if outcome.reject_reason() == Some(RejectReason::AlreadyClaimed) {
            register_waiter(&mut st, request.clone());
        }
        record_claim_metric(&outcome);
        tracing::debug!(
            run_id = %self.run_id,
            agent = %request.agent,
            task = %request.task,
            granted = outcome.is_granted(),
            reason = ?outcome.reject_reason(),
            "claim evaluated"
        );
        outcome
    }

    /// Arbitrate requests that arrived together. Per task, candidates are
    /// ranked by composite score, then earliest request, then lowest agent
    /// id; the best eligible candidate wins and the rest are rejected with
    /// `already_claimed`.
    pub async fn claim_batch(&self, requests: Vec<ClaimRequest>) -> Vec<(ClaimRequest, ClaimOutcome)> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);

        let mut by_task: BTreeMap<TaskId, Vec<ClaimRequest>> = BTreeMap::new();
        for mut request in requests {
            request.requested_at.get_or_insert(wall);
            by_task.entry(request.task.clone()).or_default().push(request);
        }

        let mut results = Vec::new();
        for (task_id, candidates) in by_task {
            let contenders = candidates.len();
            let ranked = self.rank(&st, candidates, now);
            let mut winner: Option<(AgentId, f64)> = None;
            let mut losers = Vec::new();

            for (request, score) in ranked {
                let outcome = if winner.is_some() {
                    ClaimOutcome::Rejected(RejectReason::AlreadyClaimed)
                } else {
                    self.try_claim(&mut st, &request, now, wall)
                };
                if outcome.is_granted() {
                    winner = Some((request.agent.clone(), score));
                } else if outcome.reject_reason() == Some(RejectReason::AlreadyClaimed) {
                    register_waiter(&mut st, request.clone());
                    losers.push(request.agent.clone());
                }
                record_claim_metric(&outcome);
                results.push((request, outcome));
            }

            if contenders > 1 {
                if let Some((agent, score)) = winner {
                    let mut agents = vec![agent.clone()];
                    agents.extend(losers);
                    self.record_conflict(
                        &mut st,
                        ConflictDraft {
                            kind: ConflictKind::ClaimContention,
                            tasks: vec![task_id.clone()],
                            agents,
                            description: format!(
                                "{contenders} agents requested {task_id} simultaneously"
                            ),
                            strategy: Some(ResolutionStrategy::PriorityScore),
                            status: ConflictStatus::Resolved,
                            outcome: Some(format!("granted to {agent} (score {score:.3})")),
                            attempts: 1,
                        },
                    );
                }
            }
        }
        results
    }

    /// Give a claimed task back. The best waiting agent, if any, is granted
    /// it in the same transaction; otherwise it returns to the pool.
    pub async fn release(&self, agent: &str, task: &str) -> Result<Option<AgentId>> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);
        check_holder(&st, agent, task)?;

        if let Some(entry) = st.tasks.get_mut(task) {
            entry.lease = None;
            entry.status = TaskStatus::Available;
        }
        if let Some(a) = st.agents.get_mut(agent) {
            a.claimed = None;
        }
        let next = self.grant_to_waiter(&mut st, task, now, wall);
        tracing::debug!(
            run_id = %self.run_id,
            agent = %agent,
            task = %task,
            next = ?next,
            "claim released"
        );
        Ok(next)
    }

    /// Mark a task completed and, in the same transaction, make every
    /// dependent whose dependencies are now all completed available.
    pub async fn complete(
        &self,
        agent: &str,
        task: &str,
        artifacts: Vec<Artifact>,
    ) -> Result<Completion> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);
        check_holder(&st, agent, task)?;

        if let Some(entry) = st.tasks.get_mut(task) {
            entry.status = TaskStatus::Completed;
            entry.lease = None;
            entry.artifacts = artifacts;
            entry.completed_by = Some(agent.to_string());
            entry.waiters.clear();
        }
        if let Some(a) = st.agents.get_mut(agent) {
            a.claimed = None;
        }

        let candidates = st.dependents.get(task).cloned().unwrap_or_default();
        let unblocked: Vec<TaskId> = candidates
            .into_iter()
            .filter(|id| {
                st.tasks
                    .get(id)
                    .is_some_and(|t| t.status == TaskStatus::Blocked && st.deps_completed(&t.spec))
            })
            .collect();
        for id in &unblocked {
            if let Some(t) = st.tasks.get_mut(id) {
                t.status = TaskStatus::Available;
            }
        }
        tracing::info!(
            run_id = %self.run_id,
            agent = %agent,
            task = %task,
            unblocked = ?unblocked,
            "task completed"
        );
        Ok(Completion {
            task: task.to_string(),
            unblocked,
        })
    }

    /// Sweep expired leases now.
    pub async fn expire_leases(&self) -> Vec<LeaseExpiry> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall)
    }

    /// Drop every live claim, as when the run is aborted.
    pub async fn release_all(&self) -> Vec<TaskId> {
        let mut st = self.state.lock().await;
        let mut released = Vec::new();
        for (id, task) in st.tasks.iter_mut() {
            if task.lease.take().is_some() {
                task.status = TaskStatus::Available;
                released.push(id.clone());
            }
            task.waiters.clear();
        }
        for agent in st.agents.values_mut() {
            agent.claimed = None;
        }
        if !released.is_empty() {
            tracing::info!(run_id = %self.run_id, released = ?released, "released all claims");
        }
        released
    }

    // -- Conflicts -----------------------------------------------------------

    /// Record an open interface incompatibility between task outputs. Tasks
    /// that are not finished stop being claimable until it is resolved.
    pub async fn report_incompatibility(
        &self,
        tasks: Vec<TaskId>,
        agents: Vec<AgentId>,
        description: impl Into<String>,
    ) -> Result<ConflictRecord> {
        let mut st = self.state.lock().await;
        for id in &tasks {
            if !st.tasks.contains_key(id) {
                return Err(CoordinatorError::UnknownTask(id.clone()));
            }
        }
        for id in &tasks {
            if let Some(t) = st.tasks.get_mut(id) {
                if matches!(t.status, TaskStatus::Available | TaskStatus::Blocked) {
                    t.status = TaskStatus::Conflicted;
                }
            }
        }
        Ok(self.record_conflict(
            &mut st,
            ConflictDraft {
                kind: ConflictKind::InterfaceIncompatibility,
                tasks,
                agents,
                description: description.into(),
                strategy: None,
                status: ConflictStatus::Open,
                outcome: None,
                attempts: 0,
            },
        ))
    }

    /// Try a bounded number of adapters from the content generator. The
    /// graph lock is not held while the generator runs. Returns the conflict
    /// as it stands afterwards: resolved, or escalated when every attempt
    /// failed or was refused by the acceptance check.
    pub async fn resolve_incompatibility(
        &self,
        conflict_id: ConflictId,
        generator: &dyn ContentGenerator,
        checks: &dyn AcceptanceCheck,
    ) -> Result<ConflictRecord> {
        let (conflict, artifacts) = {
            let mut st = self.state.lock().await;
            let conflict = st.conflict_mut(conflict_id)?.clone();
            if conflict.kind != ConflictKind::InterfaceIncompatibility {
                return Err(CoordinatorError::WrongConflictKind(conflict_id));
            }
            if !conflict.status.is_unresolved() {
                return Err(CoordinatorError::ConflictClosed(conflict_id));
            }
            let artifacts: Vec<Artifact> = conflict
                .tasks
                .iter()
                .filter_map(|id| st.tasks.get(id))
                .flat_map(|t| t.artifacts.iter().cloned())
                .collect();
            (conflict, artifacts)
        };

        let max_attempts = self.config.max_adapter_attempts;
        let mut accepted: Option<Vec<Artifact>> = None;
        let mut last_failure = String::from("no adapter attempts configured");
        let mut attempts = 0;
        while attempts < max_attempts && accepted.is_none() {
            attempts += 1;
            let request = AdapterRequest {
                run_id: self.run_id,
                conflict: conflict.clone(),
                artifacts: artifacts.clone(),
                attempt: attempts,
            };
            match generator.generate_adapter(&request).await {
                Ok(adapter) if checks.accept(&conflict, &adapter) => accepted = Some(adapter),
                Ok(_) => last_failure = "adapter failed acceptance checks".into(),
                Err(e) => last_failure = e.to_string(),
            }
        }

        let mut st = self.state.lock().await;
        let record = st.conflict_mut(conflict_id)?;
        if !record.status.is_unresolved() {
            // A human closed it while the generator was running.
            return Ok(record.clone());
        }
        record.attempts += attempts;
        match accepted {
            Some(adapter) => {
                let names: Vec<&str> = adapter.iter().map(|a| a.name.as_str()).collect();
                record.status = ConflictStatus::Resolved;
                record.strategy = Some(ResolutionStrategy::AdapterGeneration);
                record.outcome = Some(format!("adapter accepted: {}", names.join(", ")));
                let resolved = record.clone();
                if let Some(first) = resolved.tasks.first() {
                    if let Some(task) = st.tasks.get_mut(first) {
                        task.artifacts.extend(adapter);
                    }
                }
                st.release_conflicted(&resolved.tasks);
                tracing::info!(run_id = %self.run_id, conflict_id = %conflict_id, "interface conflict resolved by adapter");
                Ok(resolved)
            }
            None => {
                record.status = ConflictStatus::Escalated;
                record.strategy = Some(ResolutionStrategy::Escalate);
                record.outcome = Some(format!(
                    "{attempts} adapter attempt(s) failed: {last_failure}"
                ));
                tracing::warn!(
                    run_id = %self.run_id,
                    conflict_id = %conflict_id,
                    attempts,
                    "interface conflict escalated"
                );
                Ok(record.clone())
            }
        }
    }

    /// Throttle an agent that ran out of resources and hand its claimed task
    /// to the best waiting agent, or back to the pool.
    pub async fn report_exhaustion(
        &self,
        agent: &str,
        description: impl Into<String>,
    ) -> Result<ConflictRecord> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);

        let entry = st
            .agents
            .get_mut(agent)
            .ok_or_else(|| CoordinatorError::UnknownAgent(agent.to_string()))?;
        entry.throttled = true;
        let released = entry.claimed.take();

        let mut tasks = Vec::new();
        let mut agents = vec![agent.to_string()];
        let outcome = match released {
            Some(task_id) => {
                if let Some(task) = st.tasks.get_mut(&task_id) {
                    task.lease = None;
                    task.status = TaskStatus::Available;
                }
                let next = self.grant_to_waiter(&mut st, &task_id, now, wall);
                tasks.push(task_id.clone());
                match next {
                    Some(winner) => {
                        agents.push(winner.clone());
                        format!("agent throttled; {task_id} reassigned to {winner}")
                    }
                    None => format!("agent throttled; {task_id} returned to pool"),
                }
            }
            None => "agent throttled; no claimed task".to_string(),
        };

        Ok(self.record_conflict(
            &mut st,
            ConflictDraft {
                kind: ConflictKind::ResourceExhaustion,
                tasks,
                agents,
                description: description.into(),
                strategy: Some(ResolutionStrategy::ThrottleAndRedistribute),
                status: ConflictStatus::Resolved,
                outcome: Some(outcome),
                attempts: 1,
            },
        ))
    }

    /// Handle simultaneous signals in policy order: interface
    /// incompatibilities before resource exhaustion.
    pub async fn apply_signals(
        &self,
        mut signals: Vec<ConflictSignal>,
        generator: &dyn ContentGenerator,
        checks: &dyn AcceptanceCheck,
    ) -> Vec<Result<ConflictRecord>> {
        signals.sort_by_key(|s| s.kind().resolution_rank());
        let mut results = Vec::with_capacity(signals.len());
        for signal in signals {
            let result = match signal {
                ConflictSignal::Incompatibility {
                    tasks,
                    agents,
                    description,
                } => match self.report_incompatibility(tasks, agents, description).await {
                    Ok(record) => self.resolve_incompatibility(record.id, generator, checks).await,
                    Err(e) => Err(e),
                },
                ConflictSignal::Exhaustion { agent, description } => {
                    self.report_exhaustion(&agent, description).await
                }
            };
            results.push(result);
        }
        results
    }

    /// Close an unresolved conflict on a human's behalf.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        note: impl Into<String>,
    ) -> Result<ConflictRecord> {
        let mut st = self.state.lock().await;
        let record = st.conflict_mut(conflict_id)?;
        if !record.status.is_unresolved() {
            return Err(CoordinatorError::ConflictClosed(conflict_id));
        }
        record.status = ConflictStatus::Resolved;
        record.strategy = Some(ResolutionStrategy::HumanOverride);
        record.outcome = Some(note.into());
        let resolved = record.clone();
        st.release_conflicted(&resolved.tasks);
        tracing::info!(run_id = %self.run_id, conflict_id = %conflict_id, "conflict resolved by human");
        Ok(resolved)
    }

    /// Close every unresolved conflict on a human's behalf.
    pub async fn resolve_all(&self, note: &str) -> Vec<ConflictRecord> {
        let ids: Vec<ConflictId> = {
            let st = self.state.lock().await;
            st.conflicts
                .iter()
                .filter(|c| c.status.is_unresolved())
                .map(|c| c.id)
                .collect()
        };
        let mut closed = Vec::new();
        for id in ids {
            if let Ok(record) = self.resolve_conflict(id, note).await {
                closed.push(record);
            }
        }
        closed
    }

    pub async fn conflict(&self, conflict_id: ConflictId) -> Option<ConflictRecord> {
        let st = self.state.lock().await;
        st.conflicts.iter().find(|c| c.id == conflict_id).cloned()
    }

    pub async fn conflicts(&self) -> Vec<ConflictRecord> {
        self.state.lock().await.conflicts.clone()
    }

    pub async fn unresolved_conflicts(&self) -> Vec<ConflictRecord> {
        let st = self.state.lock().await;
        st.conflicts
            .iter()
            .filter(|c| c.status.is_unresolved())
            .cloned()
            .collect()
    }

    // -- Views ---------------------------------------------------------------

    pub async fn progress(&self) -> GraphProgress {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);

        let mut p = GraphProgress {
            total: st.tasks.len(),
            unresolved_conflicts: st.conflicts.iter().filter(|c| c.status.is_unresolved()).count(),
            ..GraphProgress::default()
        };
        for task in st.tasks.values() {
            match task.status {
                TaskStatus::Available => p.available += 1,
                TaskStatus::Claimed => p.claimed += 1,
                TaskStatus::Blocked => p.blocked += 1,
                TaskStatus::Completed => p.completed += 1,
                TaskStatus::Conflicted => p.conflicted += 1,
            }
        }
        p
    }

    pub async fn task_status(&self, task: &str) -> Option<TaskStatus> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);
        st.tasks.get(task).map(|t| t.status)
    }

    pub async fn holder(&self, task: &str) -> Option<AgentId> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);
        st.tasks
            .get(task)
            .and_then(|t| t.lease.as_ref().map(|l| l.agent.clone()))
    }

    pub async fn available_tasks(&self) -> Vec<TaskId> {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let mut st = self.state.lock().await;
        self.sweep(&mut st, now, wall);
        st.tasks
            .iter()
            .filter(|(_, t)| t.status == TaskStatus::Available)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn artifacts(&self) -> Vec<Artifact> {
        let st = self.state.lock().await;
        st.tasks
            .values()
            .flat_map(|t| t.artifacts.iter().cloned())
            .collect()
    }

    // -- Persistence ---------------------------------------------------------

    pub async fn snapshot(&self) -> CoordinatorSnapshot {
        let st = self.state.lock().await;
        CoordinatorSnapshot {
            tasks: st
                .tasks
                .values()
                .map(|t| TaskSnapshot {
                    spec: t.spec.clone(),
                    status: t.status,
                    holder: t.lease.as_ref().map(|l| l.agent.clone()),
                    lease_expires: t.lease.as_ref().map(|l| l.expires_wall),
                    artifacts: t.artifacts.clone(),
                    completed_by: t.completed_by.clone(),
                })
                .collect(),
            agents: st
                .agents
                .iter()
                .map(|(id, a)| AgentSnapshot {
                    id: id.clone(),
                    capabilities: a.capabilities.clone(),
                    claimed: a.claimed.clone(),
                    throttled: a.throttled,
                })
                .collect(),
            conflicts: st.conflicts.clone(),
        }
    }

    /// Rebuild state from a snapshot. Leases do not survive a restart:
    /// claimed tasks go back to the pool and agents must claim again.
    pub async fn restore(&self, snapshot: CoordinatorSnapshot) {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for t in &snapshot.tasks {
            for dep in &t.spec.depends_on {
                dependents.entry(dep.clone()).or_default().push(t.spec.id.clone());
            }
        }
        st.tasks = snapshot
            .tasks
            .into_iter()
            .map(|t| {
                let status = match t.status {
                    TaskStatus::Claimed => TaskStatus::Available,
                    other => other,
                };
                (
                    t.spec.id.clone(),
                    TaskEntry {
                        spec: t.spec,
                        status,
                        lease: None,
                        artifacts: t.artifacts,
                        waiters: Vec::new(),
                        completed_by: t.completed_by,
                    },
                )
            })
            .collect();
        st.dependents = dependents;
        st.agents = snapshot
            .agents
            .into_iter()
            .map(|a| {
                (
                    a.id,
                    AgentEntry {
                        capabilities: a.capabilities,
                        claimed: None,
                        last_heartbeat: now,
                        throttled: a.throttled,
                    },
                )
            })
            .collect();
        st.conflicts = snapshot.conflicts;
    }

    // -- Internals -----------------------------------------------------------

    fn try_claim(
        &self,
        st: &mut GraphState,
        request: &ClaimRequest,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> ClaimOutcome {
        let Some(agent) = st.agents.get(&request.agent) else {
            return ClaimOutcome::Rejected(RejectReason::UnknownAgent);
        };
        let throttled = agent.throttled;
        let busy = agent.claimed.is_some();
        let Some(task) = st.tasks.get(&request.task) else {
            return ClaimOutcome::Rejected(RejectReason::UnknownTask);
        };
        let reason = match task.status {
            TaskStatus::Claimed => Some(RejectReason::AlreadyClaimed),
            TaskStatus::Blocked => Some(RejectReason::DependenciesPending),
            TaskStatus::Completed | TaskStatus::Conflicted => Some(RejectReason::NotAvailable),
            TaskStatus::Available if !st.deps_completed(&task.spec) => {
                Some(RejectReason::DependenciesPending)
            }
            TaskStatus::Available if throttled => Some(RejectReason::Throttled),
            TaskStatus::Available if busy => Some(RejectReason::AgentBusy),
            TaskStatus::Available => None,
        };
        if let Some(reason) = reason {
            return ClaimOutcome::Rejected(reason);
        }

        let estimate = request
            .estimate
            .or_else(|| task.spec.estimate_secs.map(Duration::from_secs))
            .unwrap_or_else(|| self.config.default_estimate());
        let ttl = estimate + self.config.claim_grace();
        let expires_wall = wall + chrono_duration(ttl);

        if let Some(task) = st.tasks.get_mut(&request.task) {
            task.status = TaskStatus::Claimed;
            task.lease = Some(Lease {
                agent: request.agent.clone(),
                expires: now + ttl,
                expires_wall,
            });
            task.waiters.retain(|w| w.agent != request.agent);
        }
        if let Some(agent) = st.agents.get_mut(&request.agent) {
            agent.claimed = Some(request.task.clone());
        }
        for other in st.tasks.values_mut() {
            other.waiters.retain(|w| w.agent != request.agent);
        }
        ClaimOutcome::Granted(ClaimGrant {
            task: request.task.clone(),
            agent: request.agent.clone(),
            expires_at: expires_wall,
        })
    }

    /// Composite priority score of a request.
    fn score(&self, st: &GraphState, request: &ClaimRequest, now: Instant) -> f64 {
        let w = &self.config.weights;
        let (Some(task), Some(agent)) = (st.tasks.get(&request.task), st.agents.get(&request.agent))
        else {
            return 0.0;
        };

        let priority = request.priority.unwrap_or(task.spec.priority).clamp(0.0, 1.0);
        let capability = if task.spec.capabilities.is_empty() {
            1.0
        } else {
            let matched = task
                .spec
                .capabilities
                .intersection(&agent.capabilities)
                .count();
            matched as f64 / task.spec.capabilities.len() as f64
        };
        let readiness = if task.spec.depends_on.is_empty() {
            1.0
        } else {
            let done = task
                .spec
                .depends_on
                .iter()
                .filter(|d| {
                    st.tasks
                        .get(*d)
                        .is_some_and(|t| t.status == TaskStatus::Completed)
                })
                .count();
            done as f64 / task.spec.depends_on.len() as f64
        };
        let availability = if agent.throttled || agent.claimed.is_some() {
            0.0
        } else if now.saturating_duration_since(agent.last_heartbeat) > self.config.heartbeat_timeout()
        {
            0.5
        } else {
            1.0
        };

        w.task_priority * priority
            + w.capability_match * capability
            + w.dependency_readiness * readiness
            + w.availability * availability
    }

    /// Order requests best first: score, then earliest request, then lowest
    /// agent id.
    fn rank(
        &self,
        st: &GraphState,
        requests: Vec<ClaimRequest>,
        now: Instant,
    ) -> Vec<(ClaimRequest, f64)> {
        let mut scored: Vec<(ClaimRequest, f64)> = requests
            .into_iter()
            .map(|r| {
                let s = self.score(st, &r, now);
                (r, s)
            })
            .collect();
        scored.sort_by(|(ra, sa), (rb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| ra.requested_at.cmp(&rb.requested_at))
                .then_with(|| ra.agent.cmp(&rb.agent))
        });
        scored
    }

    /// Grant `task` to its best eligible waiter, if any.
    fn grant_to_waiter(
        &self,
        st: &mut GraphState,
        task: &str,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Option<AgentId> {
        let waiters = st
            .tasks
            .get_mut(task)
            .map(|t| std::mem::take(&mut t.waiters))
            .unwrap_or_default();
        if waiters.is_empty() {
            return None;
        }
        let ranked = self.rank(st, waiters, now);
        let mut winner = None;
        let mut remaining = Vec::new();
        for (request, _) in ranked {
            if winner.is_none() {
                let outcome = self.try_claim(st, &request, now, wall);
                if outcome.is_granted() {
                    record_claim_metric(&outcome);
                    winner = Some(request.agent.clone());
                    continue;
                }
            }
            remaining.push(request);
        }
        if let Some(t) = st.tasks.get_mut(task) {
            t.waiters = remaining;
        }
        winner
    }

    /// Revert expired leases. A `claim_contention` conflict is recorded only
    /// when another agent was waiting for the task.
    fn sweep(&self, st: &mut GraphState, now: Instant, wall: DateTime<Utc>) -> Vec<LeaseExpiry> {
        let expired: Vec<(TaskId, AgentId)> = st
            .tasks
            .iter()
            .filter_map(|(id, t)| match &t.lease {
                Some(lease) if lease.expires <= now => Some((id.clone(), lease.agent.clone())),
                _ => None,
            })
            .collect();

        let mut expiries = Vec::with_capacity(expired.len());
        for (task_id, agent) in expired {
            if let Some(task) = st.tasks.get_mut(&task_id) {
                task.lease = None;
                task.status = TaskStatus::Available;
                task.waiters.retain(|w| w.agent != agent);
            }
            if let Some(a) = st.agents.get_mut(&agent) {
                if a.claimed.as_deref() == Some(task_id.as_str()) {
                    a.claimed = None;
                }
            }

            let waiting: Vec<AgentId> = st
                .tasks
                .get(&task_id)
                .map(|t| t.waiters.iter().map(|w| w.agent.clone()).collect())
                .unwrap_or_default();
            let reassigned_to = if waiting.is_empty() {
                tracing::debug!(run_id = %self.run_id, task = %task_id, agent = %agent, "lease expired, task recycled");
                None
            } else {
                let winner = self.grant_to_waiter(st, &task_id, now, wall);
                let mut agents = vec![agent.clone()];
                agents.extend(waiting);
                let outcome = match &winner {
                    Some(w) => format!("reassigned to {w}"),
                    None => "returned to pool; no waiting agent was eligible".to_string(),
                };
                self.record_conflict(
                    st,
                    ConflictDraft {
                        kind: ConflictKind::ClaimContention,
                        tasks: vec![task_id.clone()],
                        agents,
                        description: format!("claim on {task_id} held by {agent} expired while others waited"),
                        strategy: Some(ResolutionStrategy::PriorityScore),
                        status: ConflictStatus::Resolved,
                        outcome: Some(outcome),
                        attempts: 1,
                    },
                );
                winner
            };
            expiries.push(LeaseExpiry {
                task: task_id,
                agent,
                reassigned_to,
            });
        }
        expiries
    }

    fn record_conflict(&self, st: &mut GraphState, draft: ConflictDraft) -> ConflictRecord {
        let record = ConflictRecord {
            id: Uuid::new_v4(),
            seq: self.seq.next(),
            kind: draft.kind,
            tasks: draft.tasks,
            agents: draft.agents,
            description: draft.description,
            strategy: draft.strategy,
            status: draft.status,
            outcome: draft.outcome,
            attempts: draft.attempts,
            recorded_at: self.clock.wall(),
        };
        global_metrics().increment_counter(names::CONFLICTS, &[("kind", &record.kind.to_string())]);
        tracing::warn!(
            run_id = %self.run_id,
            conflict_id = %record.id,
            seq = record.seq,
            kind = %record.kind,
            status = ?record.status,
            "{}",
            record.description
        );
        st.conflicts.push(record.clone());
        record
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

fn record_claim_metric(outcome: &ClaimOutcome) {
    let label = match outcome {
        ClaimOutcome::Granted(_) => "granted".to_string(),
        ClaimOutcome::Rejected(reason) => reason.to_string(),
    };
    global_metrics().increment_counter(names::CLAIMS, &[("outcome", &label)]);
}

fn register_waiter(st: &mut GraphState, request: ClaimRequest) {
    let holder = st
        .tasks
        .get(&request.task)
        .and_then(|t| t.lease.as_ref().map(|l| l.agent.clone()));
    if holder.as_deref() == Some(request.agent.as_str()) {
        return;
    }
    if let Some(task) = st.tasks.get_mut(&request.task) {
        if !task.waiters.iter().any(|w| w.agent == request.agent) {
            task.waiters.push(request);
        }
    }
}

fn check_holder(st: &GraphState, agent: &str, task: &str) -> Result<()> {
    let entry = st
        .tasks
        .get(task)
        .ok_or_else(|| CoordinatorError::UnknownTask(task.to_string()))?;
    match &entry.lease {
        Some(lease) if lease.agent == agent => Ok(()),
        _ => Err(CoordinatorError::NotHolder {
            task: task.to_string(),
            agent: agent.to_string(),
        }),
    }
}

fn validate_specs(specs: &[TaskSpec]) -> Result<()> {
    let mut ids = BTreeSet::new();
    for spec in specs {
        if spec.id.trim().is_empty() {
            return Err(CoordinatorError::Validation("task id must not be empty".into()));
        }
        if !ids.insert(spec.id.as_str()) {
            return Err(CoordinatorError::Validation(format!(
                "duplicate task id `{}`",
                spec.id
            )));
        }
        if !(0.0..=1.0).contains(&spec.priority) {
            return Err(CoordinatorError::Validation(format!(
                "task `{}` priority {} is outside [0, 1]",
                spec.id, spec.priority
            )));
        }
    }
    for spec in specs {
        for dep in &spec.depends_on {
            if !ids.contains(dep.as_str()) {
                return Err(CoordinatorError::Validation(format!(
                    "task `{}` depends on unknown task `{}`",
                    spec.id, dep
                )));
            }
        }
    }
    Ok(())
}

/// Depth-first search for a dependency cycle. Returns the cycle as a path
/// that starts and ends on the same task.
fn find_cycle(specs: &[TaskSpec]) -> Option<Vec<TaskId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let graph: BTreeMap<&str, Vec<&str>> = specs
        .iter()
        .map(|s| {
            (
                s.id.as_str(),
                s.depends_on.iter().map(|d| d.as_str()).collect(),
            )
        })
        .collect();
    let mut marks: HashMap<&str, Mark> = graph.keys().map(|k| (*k, Mark::Unvisited)).collect();

    for &start in graph.keys() {
        if marks.get(start) != Some(&Mark::Unvisited) {
            continue;
        }
        // Iterative DFS: (node, index of next edge to follow).
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::InProgress);
        while let Some((node, edge)) = stack.last().copied() {
            let edges = graph.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if edge < edges.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let next = edges[edge];
                match marks.get(next).copied() {
                    Some(Mark::Unvisited) => {
                        marks.insert(next, Mark::InProgress);
                        stack.push((next, 0));
                    }
                    Some(Mark::InProgress) => {
                        let from = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                        let mut cycle: Vec<TaskId> =
                            stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    _ => {}
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }
    None
}
