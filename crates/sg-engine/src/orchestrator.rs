//! Workflow sequencer.
//!
//! One [`Orchestrator`] is shared by every run. Each run sits behind its own
//! async mutex, which is the run's transaction boundary: a public operation
//! locks the run, applies its change, drives the run forward as far as it can
//! go without a human, and commits the result to the manifest store before
//! releasing the lock. Agents talk to the run's [`Coordinator`] directly so
//! claim traffic never waits on the run lock.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use sg_bridge::event_bus::EventBus;
use sg_bridge::notifications::MessageType;
use sg_bridge::protocol::{EngineEvent, GatePendingPayload};
use sg_core::clock::{SequenceCounter, SharedClock, SystemClock};
use sg_core::config::Config;
use sg_core::context::RunContext;
use sg_core::definition::{Cursor, Step, StepAction, ValidationError, WorkflowCatalog, WorkflowDefinition};
use sg_core::types::{
    AgentId, Artifact, ConflictId, ConflictKind, ConflictRecord, ConflictStatus, DecisionKind, DefaultAction,
    EscalationId, EscalationTrigger, GateInstanceId, GateKey, GateVerdict, HumanResponse, Mode, RecipientClass,
    RiskTier, RunId, RunStatus, StepId, TaskId,
};
use sg_telemetry::metrics::{global_metrics, names};

use crate::content::{
    generate_with_retry, AcceptanceCheck, ContentGenerator, ContentRequest, NonEmptyAdapter,
};
use crate::coordinator::{
    ClaimOutcome, ClaimRequest, Completion, Coordinator, CoordinatorError, GraphProgress,
};
use crate::escalation::{
    Escalation, EscalationContext, EscalationError, EscalationManager, EscalationSubject,
    SlaOutcome,
};
use crate::gate::{GateController, GateError, GatePolicy, GateResolution, PendingGate, VerdictReason};
use crate::history::{ApprovalHistory, HistoryError};
use crate::learning::LearningEngine;
use crate::manifest::{ManifestError, ManifestStore, RunManifest, MANIFEST_VERSION};
use crate::risk::{self, RiskAssessment};
use crate::run_state::{BlockReason, RunEvent, RunStateError, RunStateMachine, StepStage};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("unknown run: {0}")]
    UnknownRun(RunId),
    #[error("run {run_id} is already {status}")]
    RunFinished { run_id: RunId, status: RunStatus },
    #[error("run {0} has no pending gate")]
    NoPendingGate(RunId),
    #[error("no pending gate instance {0}")]
    UnknownGate(GateInstanceId),
    #[error("gate {instance_id} of run {run_id} passed its deadline; its default action was applied")]
    GateExpired {
        run_id: RunId,
        instance_id: GateInstanceId,
    },
    #[error("run {run_id} cannot do that while {stage}")]
    WrongStage { run_id: RunId, stage: String },
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    State(#[from] RunStateError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Escalation(#[from] EscalationError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a run is gated and what it knows about the project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub mode: Mode,
    #[serde(default)]
    pub skip_gates: BTreeSet<StepId>,
    #[serde(default)]
    pub require_gates: BTreeSet<StepId>,
    #[serde(default)]
    pub context: RunContext,
}

impl RunOptions {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            skip_gates: BTreeSet::new(),
            require_gates: BTreeSet::new(),
            context: RunContext::default(),
        }
    }

    pub fn skipping<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.skip_gates.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn requiring<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.require_gates.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }
}

/// One line of an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub phase: String,
    pub step_id: StepId,
    pub gate_name: String,
    pub risk: RiskTier,
    pub risk_reason: String,
    pub verdict: GateVerdict,
    pub reason: VerdictReason,
    pub confidence: f64,
    /// The step cannot be skipped under the run's compliance framework.
    pub compliance_locked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepView {
    pub phase: String,
    pub step_id: StepId,
    pub gate_name: String,
    /// 1-based position in execution order.
    pub position: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run_id: RunId,
    pub workflow_type: String,
    pub mode: Mode,
    pub status: RunStatus,
    pub step: Option<StepView>,
    pub stage: StepStage,
    pub pending_gate: Option<PendingGate>,
    pub tasks: Option<GraphProgress>,
    pub completed_steps: Vec<StepId>,
    pub unresolved_conflicts: Vec<ConflictRecord>,
    pub open_escalations: Vec<Escalation>,
    pub approvals: usize,
    pub risk_score: f64,
    pub updated_at: DateTime<Utc>,
}

/// What one [`Orchestrator::tick`] did across all runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickSummary {
    pub gates_timed_out: usize,
    pub escalations_reraised: usize,
    pub defaults_applied: usize,
    pub leases_expired: usize,
    /// Runs whose tick failed and were left for the next one.
    pub failed_runs: usize,
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

struct RunState {
    run_id: RunId,
    workflow: WorkflowDefinition,
    options: RunOptions,
    policy: GatePolicy,
    context: RunContext,
    machine: RunStateMachine,
    cursor: Cursor,
    stage: StepStage,
    pending_gate: Option<PendingGate>,
    coordinator: Arc<Coordinator>,
    escalations: EscalationManager,
    seq: Arc<SequenceCounter>,
    accumulated: Vec<Artifact>,
    completed_steps: Vec<StepId>,
    created_at: DateTime<Utc>,
}

impl RunState {
    fn current_step(&self) -> Option<(String, Step)> {
        self.workflow
            .step_at(self.cursor)
            .map(|(phase, step)| (phase.name.clone(), step.clone()))
    }

    fn gate_key(&self, step: &Step) -> GateKey {
        GateKey::new(self.workflow.workflow_type.clone(), step.id.clone())
    }

    fn ensure_active(&self) -> Result<()> {
        let status = self.machine.state();
        if status.is_terminal() {
            return Err(OrchestratorError::RunFinished {
                run_id: self.run_id,
                status,
            });
        }
        Ok(())
    }

    fn wrong_stage(&self) -> OrchestratorError {
        OrchestratorError::WrongStage {
            run_id: self.run_id,
            stage: describe_stage(&self.stage),
        }
    }
}

struct RunHandle {
    coordinator: Arc<Coordinator>,
    state: Mutex<RunState>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    config: Config,
    catalog: WorkflowCatalog,
    clock: SharedClock,
    generator: Arc<dyn ContentGenerator>,
    acceptance: Arc<dyn AcceptanceCheck>,
    store: Arc<dyn ManifestStore>,
    history: StdMutex<ApprovalHistory>,
    learning: LearningEngine,
    gates: GateController,
    bus: EventBus,
    runs: DashMap<RunId, Arc<RunHandle>>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        generator: Arc<dyn ContentGenerator>,
        store: Arc<dyn ManifestStore>,
    ) -> Self {
        let clock: SharedClock = Arc::new(SystemClock);
        let gates = GateController::new(
            clock.clone(),
            config.gates.decision_sla(),
            config.gates.default_action,
        );
        Self {
            learning: LearningEngine::from_config(&config.gates),
            catalog: WorkflowCatalog::builtin(),
            clock,
            generator,
            acceptance: Arc::new(NonEmptyAdapter),
            store,
            history: StdMutex::new(ApprovalHistory::in_memory()),
            gates,
            bus: EventBus::new(),
            runs: DashMap::new(),
            config,
        }
    }

    /// Replace the time source. Call before starting runs.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.gates = GateController::new(
            clock.clone(),
            self.config.gates.decision_sla(),
            self.config.gates.default_action,
        );
        self.clock = clock;
        self
    }

    /// Use `history` as the approval log and rebuild learned confidence from it.
    pub fn with_history(self, history: ApprovalHistory) -> Self {
        self.learning.rebuild(&history);
        Self {
            history: StdMutex::new(history),
            ..self
        }
    }

    pub fn with_catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_acceptance(mut self, acceptance: Arc<dyn AcceptanceCheck>) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn learning(&self) -> &LearningEngine {
        &self.learning
    }

    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    pub fn run_ids(&self) -> Vec<RunId> {
        self.runs.iter().map(|e| *e.key()).collect()
    }

    /// Approval records of one run, in sequence order.
    pub fn approvals(&self, run_id: RunId) -> Vec<sg_core::types::ApprovalRecord> {
        self.history().for_run(run_id).cloned().collect()
    }

    fn history(&self) -> MutexGuard<'_, ApprovalHistory> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle(&self, run_id: RunId) -> Result<Arc<RunHandle>> {
        self.runs
            .get(&run_id)
            .map(|h| h.value().clone())
            .ok_or(OrchestratorError::UnknownRun(run_id))
    }

    // -- Planning ------------------------------------------------------------

    /// Evaluate every step of a workflow without starting a run.
    pub fn dry_run(&self, workflow_type: &str, options: &RunOptions) -> Result<Vec<PlannedStep>> {
        let workflow = self.catalog.get(workflow_type)?;
        let policy = self.build_policy(workflow, options);
        let plan = workflow
            .phases
            .iter()
            .flat_map(|phase| phase.steps.iter().map(move |step| (phase, step)))
            .map(|(phase, step)| {
                let assessment = risk::assess(step, &options.context);
                let key = GateKey::new(workflow.workflow_type.clone(), step.id.clone());
                let confidence = self.learning.confidence(&key);
                let (verdict, reason) = policy.evaluate(&step.id, assessment.tier, confidence);
                PlannedStep {
                    phase: phase.name.clone(),
                    step_id: step.id.clone(),
                    gate_name: step.gate_name.clone(),
                    risk: assessment.tier,
                    risk_reason: assessment.reason,
                    verdict,
                    reason,
                    confidence,
                    compliance_locked: policy.compliance_locked.contains(&step.id),
                }
            })
            .collect();
        Ok(plan)
    }

    fn build_policy(&self, workflow: &WorkflowDefinition, options: &RunOptions) -> GatePolicy {
        let locked: Vec<StepId> = if options.context.compliance.is_some() {
            workflow
                .steps()
                .filter(|s| s.compliance_impact)
                .map(|s| s.id.clone())
                .collect()
        } else {
            Vec::new()
        };
        GatePolicy::new(options.mode, self.config.gates.confidence_threshold)
            .skipping(options.skip_gates.iter().cloned())
            .requiring(options.require_gates.iter().cloned())
            .locking(locked)
    }

    // -- Run lifecycle -------------------------------------------------------

    pub async fn start_run(&self, workflow_type: &str, options: RunOptions) -> Result<RunStatusReport> {
        let workflow = self.catalog.get(workflow_type)?.clone();
        workflow.validate()?;
        let run_id = Uuid::new_v4();
        let seq = Arc::new(SequenceCounter::new());
        let coordinator = Arc::new(Coordinator::new(
            run_id,
            self.config.coordinator.clone(),
            self.clock.clone(),
            seq.clone(),
        ));
        let policy = self.build_policy(&workflow, &options);
        let state = RunState {
            run_id,
            policy,
            context: options.context.clone(),
            options,
            machine: RunStateMachine::new(),
            cursor: Cursor::default(),
            stage: StepStage::Ready,
            pending_gate: None,
            coordinator: coordinator.clone(),
            escalations: EscalationManager::new(
                self.clock.clone(),
                self.config.escalation.clone(),
                self.bus.clone(),
            ),
            seq,
            accumulated: Vec::new(),
            completed_steps: Vec::new(),
            created_at: self.clock.wall(),
            workflow,
        };

        tracing::info!(
            run_id = %run_id,
            workflow_type = %state.workflow.workflow_type,
            mode = %state.options.mode,
            risk_score = state.context.risk_score(),
            "run started"
        );
        self.bus.publish(EngineEvent::RunStarted {
            run_id,
            workflow_type: state.workflow.workflow_type.clone(),
            mode: state.options.mode,
        });
        global_metrics().add_gauge(names::ACTIVE_RUNS, 1);

        let handle = Arc::new(RunHandle {
            coordinator,
            state: Mutex::new(state),
        });
        self.runs.insert(run_id, handle.clone());

        let mut run = handle.state.lock().await;
        self.drive(&mut run).await?;
        self.persist(&run).await?;
        Ok(self.report(&run).await)
    }

    /// The run as it stands. A gate whose deadline passed since the last
    /// transaction is timed out first, so the report never shows it pending.
    pub async fn status(&self, run_id: RunId) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        if self.expire_gates(&mut run).await? > 0 {
            if !run.machine.is_terminal() {
                self.drive(&mut run).await?;
            }
            self.persist(&run).await?;
        }
        Ok(self.report(&run).await)
    }

    /// Drive a run forward after outside events, e.g. agents finishing work.
    pub async fn advance(&self, run_id: RunId) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        if !run.machine.is_terminal() {
            self.expire_gates(&mut run).await?;
            if !run.machine.is_terminal() {
                self.drive(&mut run).await?;
            }
            self.persist(&run).await?;
        }
        Ok(self.report(&run).await)
    }

    /// Apply a human decision to the run's pending gate.
    pub async fn respond_to_gate(
        &self,
        run_id: RunId,
        response: HumanResponse,
    ) -> Result<RunStatusReport> {
        self.respond_inner(run_id, None, response).await
    }

    /// Decide a gate by its instance id, as carried in the `GatePending`
    /// event.
    pub async fn respond_to_gate_instance(
        &self,
        instance_id: GateInstanceId,
        response: HumanResponse,
    ) -> Result<RunStatusReport> {
        let pending = self
            .gates
            .pending(instance_id)
            .ok_or(OrchestratorError::UnknownGate(instance_id))?;
        self.respond_inner(pending.run_id, Some(instance_id), response)
            .await
    }

    async fn respond_inner(
        &self,
        run_id: RunId,
        expected: Option<GateInstanceId>,
        response: HumanResponse,
    ) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        run.ensure_active()?;
        let answered = expected.or_else(|| run.pending_gate.as_ref().map(|g| g.instance_id));
        if self.expire_gates(&mut run).await? > 0 {
            // A late answer never counts as a human decision.
            if !run.machine.is_terminal() {
                self.drive(&mut run).await?;
            }
            self.persist(&run).await?;
            if let Some(instance_id) = answered {
                return Err(OrchestratorError::GateExpired {
                    run_id,
                    instance_id,
                });
            }
        }
        let pending = run
            .pending_gate
            .clone()
            .ok_or(OrchestratorError::NoPendingGate(run_id))?;
        if let Some(instance_id) = expected {
            if pending.instance_id != instance_id {
                return Err(OrchestratorError::UnknownGate(instance_id));
            }
        }
        let resolution = self.gates.respond(pending.instance_id, response)?;
        tracing::info!(
            run_id = %run_id,
            gate = %pending.gate,
            decision = %resolution.decision,
            "gate decided by human"
        );
        self.apply_resolution(&mut run, resolution).await?;
        self.drive(&mut run).await?;
        self.persist(&run).await?;
        Ok(self.report(&run).await)
    }

    /// Stop a run: pending gates close as aborted, claims are released and
    /// open escalations are closed.
    pub async fn abort(&self, run_id: RunId, reason: &str) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        run.ensure_active()?;
        self.abort_inner(&mut run, reason).await?;
        self.persist(&run).await?;
        Ok(self.report(&run).await)
    }

    /// A human pushes the run past its current blocked step. Open conflicts
    /// are closed as human overrides; the step is not re-executed.
    pub async fn force_progress(&self, run_id: RunId, note: &str) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        run.ensure_active()?;
        if !matches!(run.stage, StepStage::Blocked { .. } | StepStage::AwaitingTasks) {
            return Err(run.wrong_stage());
        }
        self.force_inner(&mut run, note).await?;
        self.drive(&mut run).await?;
        self.persist(&run).await?;
        Ok(self.report(&run).await)
    }

    /// Ask for approval again on a step whose gate was rejected.
    pub async fn reopen_gate(&self, run_id: RunId) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        run.ensure_active()?;
        if !matches!(
            run.stage,
            StepStage::Blocked {
                reason: BlockReason::GateRejected { .. }
            }
        ) {
            return Err(run.wrong_stage());
        }
        let Some((_, step)) = run.current_step() else {
            return Err(run.wrong_stage());
        };
        run.escalations
            .resolve_for_subject(&EscalationSubject::Step(step.id.clone()), "gate reopened");
        let assessment = risk::assess(&step, &run.context);
        let confidence = self.learning.confidence(&run.gate_key(&step));
        self.open_gate(&mut run, &step, &assessment, confidence)?;
        self.persist(&run).await?;
        Ok(self.report(&run).await)
    }

    /// Run the current step's content again after a content failure or a
    /// rejected task graph.
    pub async fn retry_step(&self, run_id: RunId) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        run.ensure_active()?;
        let cyclic = match &run.stage {
            StepStage::Blocked {
                reason: BlockReason::ContentFailure { .. } | BlockReason::InvalidGraph { .. },
            } => None,
            StepStage::Blocked {
                reason: BlockReason::CyclicDependency { conflict_id },
            } => Some(*conflict_id),
            _ => return Err(run.wrong_stage()),
        };
        if let Some(conflict_id) = cyclic {
            if let Err(e) = run.coordinator.resolve_conflict(conflict_id, "step retried").await {
                tracing::debug!(run_id = %run_id, error = %e, "cycle conflict already closed");
            }
            run.escalations
                .resolve_for_subject(&EscalationSubject::Conflict(conflict_id), "step retried");
        }
        if let Some((_, step)) = run.current_step() {
            run.escalations
                .resolve_for_subject(&EscalationSubject::Step(step.id), "step retried");
        }
        run.stage = StepStage::Cleared;
        self.ensure_running(&mut run)?;
        self.drive(&mut run).await?;
        self.persist(&run).await?;
        Ok(self.report(&run).await)
    }

    /// Close a conflict on a human's behalf and let the run continue.
    pub async fn resolve_conflict(
        &self,
        run_id: RunId,
        conflict_id: ConflictId,
        note: &str,
    ) -> Result<RunStatusReport> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        run.ensure_active()?;
        run.coordinator.resolve_conflict(conflict_id, note).await?;
        run.escalations
            .resolve_for_subject(&EscalationSubject::Conflict(conflict_id), note);

        let next = match &run.stage {
            StepStage::Blocked {
                reason: BlockReason::UnresolvedConflict { conflict_id: id },
            } if *id == conflict_id => Some(StepStage::AwaitingTasks),
            StepStage::Blocked {
                reason: BlockReason::CyclicDependency { conflict_id: id },
            } if *id == conflict_id => Some(StepStage::Cleared),
            _ => None,
        };
        if let Some(stage) = next {
            run.stage = stage;
            self.ensure_running(&mut run)?;
        }
        self.drive(&mut run).await?;
        self.persist(&run).await?;
        Ok(self.report(&run).await)
    }

    pub async fn acknowledge_escalation(
        &self,
        run_id: RunId,
        escalation_id: EscalationId,
    ) -> Result<Escalation> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        let escalation = run.escalations.acknowledge(escalation_id)?;
        self.persist(&run).await?;
        Ok(escalation)
    }

    pub async fn resolve_escalation(
        &self,
        run_id: RunId,
        escalation_id: EscalationId,
        note: &str,
    ) -> Result<Escalation> {
        let handle = self.handle(run_id)?;
        let mut run = handle.state.lock().await;
        let escalation = run.escalations.resolve(escalation_id, note)?;
        self.persist(&run).await?;
        Ok(escalation)
    }

    /// Apply every elapsed deadline: gate SLAs, escalation SLAs and task
    /// leases. Runs are handled one at a time under their own lock.
    ///
    /// A run that fails is logged and counted in `failed_runs`; the other
    /// runs are still ticked.
    pub async fn tick(&self) -> Result<TickSummary> {
        let handles: Vec<Arc<RunHandle>> = self.runs.iter().map(|e| e.value().clone()).collect();
        let mut summary = TickSummary::default();
        for handle in handles {
            let mut run = handle.state.lock().await;
            if run.machine.is_terminal() {
                continue;
            }
            if let Err(e) = self.tick_run(&mut run, &mut summary).await {
                tracing::error!(run_id = %run.run_id, error = %e, "tick failed for run");
                summary.failed_runs += 1;
            }
        }
        Ok(summary)
    }

    async fn tick_run(&self, run: &mut RunState, summary: &mut TickSummary) -> Result<()> {
        summary.gates_timed_out += self.expire_gates(run).await?;
        if !run.machine.is_terminal() {
            for outcome in run.escalations.check_slas() {
                match &outcome {
                    SlaOutcome::Reraised { .. } => summary.escalations_reraised += 1,
                    SlaOutcome::ApplyDefault { .. } => summary.defaults_applied += 1,
                    SlaOutcome::Exhausted { .. } => {}
                }
                self.apply_sla_outcome(run, outcome).await?;
                if run.machine.is_terminal() {
                    break;
                }
            }
        }
        if !run.machine.is_terminal() {
            summary.leases_expired += run.coordinator.expire_leases().await.len();
            self.drive(run).await?;
        }
        self.persist(run).await
    }

    /// Time out the run's gates whose deadline has passed and apply their
    /// default actions. Returns how many expired.
    async fn expire_gates(&self, run: &mut RunState) -> Result<usize> {
        let mut expired = 0;
        for resolution in self.gates.expire_due_for_run(run.run_id) {
            expired += 1;
            self.apply_resolution(run, resolution).await?;
            if run.machine.is_terminal() {
                break;
            }
        }
        Ok(expired)
    }

    // -- Agent-facing wrappers -----------------------------------------------

    /// The run's task coordinator, for agents that talk to it directly.
    pub fn coordinator(&self, run_id: RunId) -> Result<Arc<Coordinator>> {
        Ok(self.handle(run_id)?.coordinator.clone())
    }

    pub async fn register_agent<I, S>(&self, run_id: RunId, agent: &str, capabilities: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.coordinator(run_id)?
            .register_agent(agent, capabilities)
            .await;
        Ok(())
    }

    pub async fn heartbeat(&self, run_id: RunId, agent: &str) -> Result<()> {
        Ok(self.coordinator(run_id)?.heartbeat(agent).await?)
    }

    pub async fn claim_task(&self, run_id: RunId, request: ClaimRequest) -> Result<ClaimOutcome> {
        let outcome = self.coordinator(run_id)?.claim(request.clone()).await;
        if outcome.is_granted() {
            self.bus.publish(EngineEvent::TaskClaimed {
                run_id,
                task_id: request.task,
                agent_id: request.agent,
            });
        }
        Ok(outcome)
    }

    pub async fn claim_batch(
        &self,
        run_id: RunId,
        requests: Vec<ClaimRequest>,
    ) -> Result<Vec<(ClaimRequest, ClaimOutcome)>> {
        let results = self.coordinator(run_id)?.claim_batch(requests).await;
        for (request, outcome) in &results {
            if outcome.is_granted() {
                self.bus.publish(EngineEvent::TaskClaimed {
                    run_id,
                    task_id: request.task.clone(),
                    agent_id: request.agent.clone(),
                });
            }
        }
        Ok(results)
    }

    /// Give up a claim. Returns the waiting agent the task went to, if any.
    pub async fn release_task(&self, run_id: RunId, agent: &str, task: &str) -> Result<Option<AgentId>> {
        let next = self.coordinator(run_id)?.release(agent, task).await?;
        if let Some(winner) = &next {
            self.bus.publish(EngineEvent::TaskClaimed {
                run_id,
                task_id: task.to_string(),
                agent_id: winner.clone(),
            });
        }
        Ok(next)
    }

    /// Complete a task and drive the run; the step finishes once every task
    /// is done with nothing unresolved.
    pub async fn complete_task(
        &self,
        run_id: RunId,
        agent: &str,
        task: &str,
        artifacts: Vec<Artifact>,
    ) -> Result<Completion> {
        let completion = self
            .coordinator(run_id)?
            .complete(agent, task, artifacts)
            .await?;
        self.bus.publish(EngineEvent::TaskCompleted {
            run_id,
            task_id: completion.task.clone(),
            agent_id: agent.to_string(),
            unblocked: completion.unblocked.clone(),
        });
        self.advance(run_id).await?;
        Ok(completion)
    }

    /// Record an interface incompatibility and try adapters until one is
    /// accepted or `escalation.max_auto_resolution_attempts` have been made.
    /// A conflict still open after that blocks the step.
    pub async fn report_incompatibility(
        &self,
        run_id: RunId,
        tasks: Vec<TaskId>,
        agents: Vec<AgentId>,
        description: &str,
    ) -> Result<ConflictRecord> {
        let coordinator = self.coordinator(run_id)?;
        let reported = coordinator
            .report_incompatibility(tasks, agents, description)
            .await?;
        let max_attempts = self.config.escalation.max_auto_resolution_attempts;
        let mut record = reported;
        while record.status.is_unresolved() && record.attempts < max_attempts {
            let before = record.attempts;
            record = coordinator
                .resolve_incompatibility(record.id, self.generator.as_ref(), self.acceptance.as_ref())
                .await?;
            if record.attempts == before {
                break;
            }
        }
        self.publish_conflict(run_id, &record);
        self.advance(run_id).await?;
        Ok(record)
    }

    pub async fn report_exhaustion(
        &self,
        run_id: RunId,
        agent: &str,
        description: &str,
    ) -> Result<ConflictRecord> {
        let record = self
            .coordinator(run_id)?
            .report_exhaustion(agent, description)
            .await?;
        self.publish_conflict(run_id, &record);
        self.advance(run_id).await?;
        Ok(record)
    }

    fn publish_conflict(&self, run_id: RunId, record: &ConflictRecord) {
        self.bus.publish(EngineEvent::ConflictRecorded {
            run_id,
            conflict_id: record.id,
            kind: record.kind,
            status: record.status,
        });
    }

    // -- Persistence ---------------------------------------------------------

    /// Rebuild a run from its manifest. A run that is already loaded is left
    /// alone.
    pub async fn resume(&self, manifest: RunManifest) -> Result<RunId> {
        let run_id = manifest.run_id;
        if self.runs.contains_key(&run_id) {
            return Ok(run_id);
        }
        let workflow = self.catalog.get(&manifest.workflow_type)?.clone();

        // Approvals committed to the manifest but missing from the log are
        // replayed in order.
        let last_seq = {
            let mut history = self.history();
            for record in &manifest.approvals {
                if record.seq > history.last_seq(run_id) {
                    let gate = record.gate.clone();
                    let decision = record.decision;
                    history.append(record.clone())?;
                    self.learning.record(&gate, decision);
                }
            }
            manifest.last_seq.max(history.last_seq(run_id))
        };

        let seq = Arc::new(SequenceCounter::starting_after(last_seq));
        let coordinator = Arc::new(Coordinator::new(
            run_id,
            self.config.coordinator.clone(),
            self.clock.clone(),
            seq.clone(),
        ));
        coordinator.restore(manifest.coordinator).await;
        let mut escalations = EscalationManager::new(
            self.clock.clone(),
            self.config.escalation.clone(),
            self.bus.clone(),
        );
        escalations.restore(manifest.escalations);
        if let Some(pending) = &manifest.pending_gate {
            self.gates.restore(pending.clone());
        }

        let terminal = manifest.state.is_terminal();
        let state = RunState {
            run_id,
            workflow,
            options: manifest.options,
            policy: manifest.policy,
            context: manifest.context,
            machine: manifest.state,
            cursor: manifest.cursor,
            stage: manifest.stage,
            pending_gate: manifest.pending_gate,
            coordinator: coordinator.clone(),
            escalations,
            seq,
            accumulated: manifest.accumulated,
            completed_steps: manifest.completed_steps,
            created_at: manifest.created_at,
        };
        self.runs.insert(
            run_id,
            Arc::new(RunHandle {
                coordinator,
                state: Mutex::new(state),
            }),
        );
        if !terminal {
            global_metrics().add_gauge(names::ACTIVE_RUNS, 1);
        }
        tracing::info!(run_id = %run_id, "run resumed from manifest");
        Ok(run_id)
    }

    /// Resume every unfinished run in the store.
    pub async fn resume_all(&self) -> Result<Vec<RunId>> {
        let mut resumed = Vec::new();
        for manifest in self.store.list().await? {
            if manifest.status().is_terminal() || self.runs.contains_key(&manifest.run_id) {
                continue;
            }
            resumed.push(self.resume(manifest).await?);
        }
        Ok(resumed)
    }

    async fn persist(&self, run: &RunState) -> Result<()> {
        let approvals = self.approvals(run.run_id);
        let manifest = RunManifest {
            version: MANIFEST_VERSION,
            run_id: run.run_id,
            workflow_type: run.workflow.workflow_type.clone(),
            options: run.options.clone(),
            policy: run.policy.clone(),
            context: run.context.clone(),
            state: run.machine.clone(),
            cursor: run.cursor,
            stage: run.stage.clone(),
            pending_gate: run.pending_gate.clone(),
            coordinator: run.coordinator.snapshot().await,
            approvals,
            escalations: run.escalations.to_log(),
            accumulated: run.accumulated.clone(),
            completed_steps: run.completed_steps.clone(),
            last_seq: run.seq.current(),
            created_at: run.created_at,
            updated_at: self.clock.wall(),
        };
        self.store.save(&manifest).await?;
        Ok(())
    }

    async fn report(&self, run: &RunState) -> RunStatusReport {
        let step = run.workflow.step_at(run.cursor).map(|(phase, step)| StepView {
            phase: phase.name.clone(),
            step_id: step.id.clone(),
            gate_name: step.gate_name.clone(),
            position: run.workflow.ordinal(run.cursor) + 1,
            total: run.workflow.step_count(),
        });
        let tasks = match run.stage {
            StepStage::AwaitingTasks | StepStage::Blocked { .. } => {
                let progress = run.coordinator.progress().await;
                (progress.total > 0).then_some(progress)
            }
            _ => None,
        };
        let unresolved_conflicts = run.coordinator.unresolved_conflicts().await;
        let approvals = self.history().for_run(run.run_id).count();
        RunStatusReport {
            run_id: run.run_id,
            workflow_type: run.workflow.workflow_type.clone(),
            mode: run.options.mode,
            status: run.machine.state(),
            step,
            stage: run.stage.clone(),
            pending_gate: run.pending_gate.clone(),
            tasks,
            completed_steps: run.completed_steps.clone(),
            unresolved_conflicts,
            open_escalations: run.escalations.open().into_iter().cloned().collect(),
            approvals,
            risk_score: run.context.risk_score(),
            updated_at: self.clock.wall(),
        }
    }

    // -- Driving -------------------------------------------------------------

    /// Move the run forward until it needs a human, waits for agents, or
    /// finishes.
    async fn drive(&self, run: &mut RunState) -> Result<()> {
        loop {
            if run.machine.is_terminal() {
                return Ok(());
            }
            match run.stage.clone() {
                StepStage::Finished
                | StepStage::Blocked { .. }
                | StepStage::AwaitingApproval { .. } => return Ok(()),
                StepStage::Ready => {
                    let Some((_, step)) = run.current_step() else {
                        return Ok(());
                    };
                    let assessment = risk::assess(&step, &run.context);
                    let confidence = self.learning.confidence(&run.gate_key(&step));
                    let (verdict, reason) = run.policy.evaluate(&step.id, assessment.tier, confidence);
                    global_metrics().increment_counter(
                        names::GATE_DECISIONS,
                        &[("mode", &run.options.mode.to_string()), ("verdict", &verdict.to_string())],
                    );
                    tracing::info!(
                        run_id = %run.run_id,
                        step_id = %step.id,
                        risk = %assessment.tier,
                        confidence,
                        verdict = %verdict,
                        reason = ?reason,
                        "gate evaluated"
                    );
                    self.bus.publish(EngineEvent::StepStarted {
                        run_id: run.run_id,
                        step_id: step.id.clone(),
                        risk: assessment.tier,
                    });
                    match verdict {
                        GateVerdict::AutoProceed => run.stage = StepStage::Cleared,
                        GateVerdict::RequireApproval => {
                            self.open_gate(run, &step, &assessment, confidence)?;
                            return Ok(());
                        }
                    }
                }
                StepStage::Cleared => self.execute_step(run).await?,
                StepStage::AwaitingTasks => {
                    if !self.check_tasks(run).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn open_gate(
        &self,
        run: &mut RunState,
        step: &Step,
        assessment: &RiskAssessment,
        confidence: f64,
    ) -> Result<()> {
        let pending = self.gates.open(
            run.run_id,
            run.gate_key(step),
            step.gate_name.clone(),
            assessment.tier,
            confidence,
            step.default_action,
        );
        run.stage = StepStage::AwaitingApproval {
            instance_id: pending.instance_id,
        };
        run.pending_gate = Some(pending.clone());
        if run.machine.state() == RunStatus::Running {
            self.transition(run, RunEvent::PauseForGate)?;
        }

        self.bus.publish(EngineEvent::GatePending(GatePendingPayload {
            run_id: run.run_id,
            instance_id: pending.instance_id,
            gate: pending.gate.clone(),
            gate_name: pending.gate_name.clone(),
            risk: pending.risk,
            confidence,
            deadline: pending.deadline,
            default_action: pending.default_action,
        }));
        run.escalations.announce(
            RecipientClass::Operator,
            MessageType::GatePending,
            serde_json::json!({
                "run_id": run.run_id,
                "instance_id": pending.instance_id,
                "gate": pending.gate.to_string(),
                "gate_name": pending.gate_name,
                "risk": pending.risk,
                "risk_reason": assessment.reason,
                "confidence": confidence,
                "deadline": pending.deadline,
                "default_action": pending.default_action,
            }),
        );

        if assessment.tier == RiskTier::Destructive {
            let context = EscalationContext::new(
                run.run_id,
                EscalationSubject::Gate(pending.instance_id),
                format!(
                    "step {} ({}) is destructive: {}",
                    step.id, step.gate_name, assessment.reason
                ),
                "approving may overwrite or remove work that already exists",
            )
            .propose(format!("review the change and approve gate {}", pending.gate))
            .propose("reject the gate and revise the run context")
            .recommend("inspect the affected artifacts before approving")
            .defaulting_to(Some(pending.default_action));
            escalate(run, EscalationTrigger::DestructiveGate, context);
        }
        Ok(())
    }

    /// Generate the current step's content and either finish the step or
    /// hand its task graph to the coordinator.
    async fn execute_step(&self, run: &mut RunState) -> Result<()> {
        let Some((_, step)) = run.current_step() else {
            return Ok(());
        };
        let request = ContentRequest {
            run_id: run.run_id,
            workflow_type: run.workflow.workflow_type.clone(),
            step_id: step.id.clone(),
            content_id: step.content_id.clone(),
            context: run.accumulated.clone(),
            fans_out: step.fans_out,
            attempt: 0,
        };
        let generated = generate_with_retry(
            self.generator.as_ref(),
            &request,
            self.config.content.timeout(),
            self.config.content.retries,
        )
        .await;

        let content = match generated {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(run_id = %run.run_id, step_id = %step.id, error = %e, "content generation failed");
                let context = EscalationContext::new(
                    run.run_id,
                    EscalationSubject::Step(step.id.clone()),
                    format!("content generation for step {} failed: {e}", step.id),
                    format!("run is blocked at step {}", step.id),
                )
                .propose("retry the step once the content generator is healthy")
                .propose("force progress past the step")
                .recommend("check the content generator and retry the step")
                .defaulting_to(Some(self.effective_default(&step)));
                escalate(run, EscalationTrigger::ContentGenerationFailure, context);
                return self.block(run, BlockReason::ContentFailure { error: e.to_string() });
            }
        };

        run.accumulated.extend(content.artifacts);

        if !step.fans_out || content.tasks.is_empty() {
            return self.finish_step(run).await;
        }
        match run.coordinator.load_graph(content.tasks).await {
            Ok(summary) => {
                tracing::info!(
                    run_id = %run.run_id,
                    step_id = %step.id,
                    tasks = summary.total,
                    "step waiting for tasks"
                );
                run.stage = StepStage::AwaitingTasks;
                Ok(())
            }
            Err(CoordinatorError::CyclicDependency { cycle, conflict_id }) => {
                let context = EscalationContext::new(
                    run.run_id,
                    EscalationSubject::Conflict(conflict_id),
                    format!(
                        "task graph for step {} has a dependency cycle: {}",
                        step.id,
                        cycle.join(" -> ")
                    ),
                    format!("no task of step {} can start", step.id),
                )
                .propose("break the cycle and retry the step")
                .recommend("fix the task dependencies, then resolve the conflict");
                escalate(run, EscalationTrigger::CyclicDependency, context);
                self.block(run, BlockReason::CyclicDependency { conflict_id })
            }
            Err(e) => {
                let context = EscalationContext::new(
                    run.run_id,
                    EscalationSubject::Step(step.id.clone()),
                    format!("content for step {} produced an invalid task graph: {e}", step.id),
                    format!("run is blocked at step {}", step.id),
                )
                .propose("retry the step")
                .propose("force progress past the step")
                .recommend("inspect the generated task graph");
                escalate(run, EscalationTrigger::ContentGenerationFailure, context);
                self.block(run, BlockReason::InvalidGraph { error: e.to_string() })
            }
        }
    }

    /// Returns `true` when the step finished and driving should continue.
    async fn check_tasks(&self, run: &mut RunState) -> Result<bool> {
        let progress = run.coordinator.progress().await;
        if progress.is_done() {
            self.finish_step(run).await?;
            return Ok(true);
        }
        let unresolved = run.coordinator.unresolved_conflicts().await;
        let max_attempts = self.config.escalation.max_auto_resolution_attempts;
        let stuck = progress.all_completed()
            || unresolved.iter().any(|c| {
                c.status == ConflictStatus::Escalated
                    || (c.kind == ConflictKind::InterfaceIncompatibility && c.attempts >= max_attempts)
            });
        let Some(conflict) = unresolved.into_iter().next().filter(|_| stuck) else {
            return Ok(false);
        };

        let subject = EscalationSubject::Conflict(conflict.id);
        let already_raised = run
            .escalations
            .open()
            .iter()
            .any(|e| e.context.subject == subject);
        if !already_raised {
            if let Some((_, step)) = run.current_step() {
                let outcome = conflict.outcome.clone().unwrap_or_default();
                let context = EscalationContext::new(
                    run.run_id,
                    subject,
                    format!("{} conflict: {} {}", conflict.kind, conflict.description, outcome)
                        .trim_end()
                        .to_string(),
                    format!("step {} cannot finish until the conflict is resolved", step.id),
                )
                .propose(format!("resolve conflict {} by hand", conflict.id))
                .propose("force progress past the step")
                .recommend(format!("review tasks {}", conflict.tasks.join(", ")))
                .defaulting_to(Some(self.effective_default(&step)));
                escalate(run, EscalationTrigger::UnresolvedConflict, context);
            }
        }
        self.block(
            run,
            BlockReason::UnresolvedConflict {
                conflict_id: conflict.id,
            },
        )?;
        Ok(false)
    }

    async fn finish_step(&self, run: &mut RunState) -> Result<()> {
        let Some((_, step)) = run.current_step() else {
            return Ok(());
        };
        self.ensure_running(run)?;
        match &step.action {
            StepAction::Generate { artifact } => {
                run.context.existing_artifacts.insert(artifact.clone());
            }
            StepAction::ReviseDecision { decision } => {
                run.context.approved_decisions.insert(decision.clone());
            }
            _ => {}
        }
        // Task output belongs to the step whose graph the agents worked.
        let graph_loaded = matches!(
            run.stage,
            StepStage::AwaitingTasks
                | StepStage::Blocked {
                    reason: BlockReason::UnresolvedConflict { .. }
                }
        );
        if step.fans_out && graph_loaded {
            run.accumulated.extend(run.coordinator.artifacts().await);
        }
        run.completed_steps.push(step.id.clone());
        run.pending_gate = None;
        tracing::info!(run_id = %run.run_id, step_id = %step.id, "step completed");
        self.bus.publish(EngineEvent::StepCompleted {
            run_id: run.run_id,
            step_id: step.id.clone(),
        });

        match run.workflow.next_cursor(run.cursor) {
            Some(next) => {
                run.cursor = next;
                run.stage = StepStage::Ready;
            }
            None => {
                run.stage = StepStage::Finished;
                self.transition(run, RunEvent::Finish)?;
                run.escalations.resolve_all("run completed");
                global_metrics().add_gauge(names::ACTIVE_RUNS, -1);
                run.escalations.announce(
                    RecipientClass::ProjectLead,
                    MessageType::RunCompleted,
                    serde_json::json!({
                        "run_id": run.run_id,
                        "workflow_type": run.workflow.workflow_type,
                        "completed_steps": run.completed_steps,
                    }),
                );
                tracing::info!(run_id = %run.run_id, "run completed");
            }
        }
        Ok(())
    }

    fn block(&self, run: &mut RunState, reason: BlockReason) -> Result<()> {
        let step_id = run.current_step().map(|(_, s)| s.id).unwrap_or_default();
        tracing::warn!(
            run_id = %run.run_id,
            step_id = %step_id,
            reason = %reason.describe(),
            "step blocked"
        );
        self.bus.publish(EngineEvent::StepBlocked {
            run_id: run.run_id,
            step_id,
            reason: reason.describe(),
        });
        run.stage = StepStage::Blocked { reason };
        if run.machine.state() == RunStatus::Running {
            self.transition(run, RunEvent::PauseForGate)?;
        }
        Ok(())
    }

    async fn force_inner(&self, run: &mut RunState, note: &str) -> Result<()> {
        run.coordinator.release_all().await;
        for record in run.coordinator.resolve_all(note).await {
            self.publish_conflict(run.run_id, &record);
        }
        run.escalations.resolve_all(note);
        tracing::warn!(run_id = %run.run_id, note = %note, "progress forced past blocked step");
        self.finish_step(run).await
    }

    // -- Gate outcomes -------------------------------------------------------

    /// Commit a closed gate to the approval log and the learning engine, in
    /// sequence order. On a failed append the gate is put back.
    fn commit_decision(&self, run: &mut RunState, resolution: &GateResolution) -> Result<()> {
        {
            let mut history = self.history();
            let record = resolution.to_record(run.seq.next());
            if let Err(e) = history.append(record) {
                self.gates.restore(resolution.pending.clone());
                return Err(e.into());
            }
            self.learning.record(&resolution.pending.gate, resolution.decision);
        }
        self.bus.publish(EngineEvent::GateResolved {
            run_id: run.run_id,
            instance_id: resolution.pending.instance_id,
            gate: resolution.pending.gate.clone(),
            decision: resolution.decision,
            applied_action: resolution.applied_action,
        });
        run.escalations.resolve_for_subject(
            &EscalationSubject::Gate(resolution.pending.instance_id),
            &format!("gate closed: {}", resolution.decision),
        );
        run.pending_gate = None;
        Ok(())
    }

    async fn apply_resolution(&self, run: &mut RunState, resolution: GateResolution) -> Result<()> {
        self.commit_decision(run, &resolution)?;
        let pending = &resolution.pending;

        if resolution.decision == DecisionKind::TimedOutDefault {
            let action = resolution.applied_action.unwrap_or(pending.default_action);
            let context = EscalationContext::new(
                run.run_id,
                EscalationSubject::Step(pending.gate.step_id.clone()),
                format!(
                    "no response for gate {} before its deadline; default action `{action}` applied",
                    pending.gate
                ),
                format!("step {} continued on a default, not a human decision", pending.gate.step_id),
            )
            .propose("confirm the default outcome")
            .propose("reopen the gate if the default was wrong")
            .recommend("review the step before later gates build on it");
            escalate(run, EscalationTrigger::GateTimeout, context);
        }

        if resolution.proceeds() {
            run.stage = StepStage::Cleared;
            self.ensure_running(run)?;
        } else if resolution.aborts_run() {
            self.abort_inner(run, "gate default action aborted the run").await?;
        } else if resolution.decision != DecisionKind::Aborted {
            let context = EscalationContext::new(
                run.run_id,
                EscalationSubject::Step(pending.gate.step_id.clone()),
                format!("gate {} was {}", pending.gate, resolution.decision),
                format!("run is blocked at step {}", pending.gate.step_id),
            )
            .propose("reopen the gate after addressing the concern")
            .propose("force progress past the step")
            .propose("abort the run")
            .recommend("address the rejection and reopen the gate");
            escalate(run, EscalationTrigger::GateRejected, context);
            self.block(
                run,
                BlockReason::GateRejected {
                    instance_id: pending.instance_id,
                },
            )?;
        }
        Ok(())
    }

    async fn apply_sla_outcome(&self, run: &mut RunState, outcome: SlaOutcome) -> Result<()> {
        let SlaOutcome::ApplyDefault { subject, action, .. } = outcome else {
            return Ok(());
        };
        match (&subject, action) {
            (_, DefaultAction::AbortRun) => {
                self.abort_inner(run, "escalation default action aborted the run")
                    .await
            }
            // A pending gate's own deadline decides its default.
            (EscalationSubject::Gate(_), _) => Ok(()),
            (_, DefaultAction::Approve) => {
                if matches!(run.stage, StepStage::Blocked { .. } | StepStage::AwaitingTasks) {
                    self.force_inner(run, "escalation default action: approve").await
                } else {
                    Ok(())
                }
            }
            (_, DefaultAction::Reject) => {
                tracing::warn!(run_id = %run.run_id, subject = ?subject, "escalation default is reject; step stays blocked");
                Ok(())
            }
        }
    }

    async fn abort_inner(&self, run: &mut RunState, reason: &str) -> Result<()> {
        for resolution in self.gates.cancel_run(run.run_id) {
            self.commit_decision(run, &resolution)?;
        }
        let released = run.coordinator.release_all().await;
        run.escalations.resolve_all(reason);
        run.pending_gate = None;
        self.transition(run, RunEvent::Abort)?;
        global_metrics().add_gauge(names::ACTIVE_RUNS, -1);
        run.escalations.announce(
            RecipientClass::ProjectLead,
            MessageType::RunAborted,
            serde_json::json!({
                "run_id": run.run_id,
                "reason": reason,
                "released_tasks": released,
            }),
        );
        tracing::warn!(run_id = %run.run_id, reason = %reason, "run aborted");
        Ok(())
    }

    // -- Helpers -------------------------------------------------------------

    fn transition(&self, run: &mut RunState, event: RunEvent) -> Result<()> {
        let from = run.machine.state();
        let to = run.machine.transition(event, self.clock.wall())?;
        self.bus.publish(EngineEvent::RunStatusChanged {
            run_id: run.run_id,
            from,
            to,
        });
        Ok(())
    }

    fn ensure_running(&self, run: &mut RunState) -> Result<()> {
        if run.machine.state() == RunStatus::PausedForGate {
            self.transition(run, RunEvent::Resume)?;
        }
        Ok(())
    }

    fn effective_default(&self, step: &Step) -> DefaultAction {
        step.default_action
            .unwrap_or(self.config.gates.default_action)
    }
}

/// Raise an escalation, logging instead of failing when the trigger has no
/// rule configured.
fn escalate(run: &mut RunState, trigger: EscalationTrigger, context: EscalationContext) {
    if let Err(e) = run.escalations.raise(trigger, context) {
        tracing::error!(run_id = %run.run_id, trigger = %trigger, error = %e, "could not raise escalation");
    }
}

fn describe_stage(stage: &StepStage) -> String {
    match stage {
        StepStage::Ready => "ready".into(),
        StepStage::AwaitingApproval { .. } => "awaiting approval".into(),
        StepStage::Cleared => "cleared".into(),
        StepStage::AwaitingTasks => "awaiting tasks".into(),
        StepStage::Blocked { reason } => format!("blocked ({})", reason.describe()),
        StepStage::Finished => "finished".into(),
    }
}
