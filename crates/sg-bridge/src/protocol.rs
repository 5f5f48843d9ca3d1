use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sg_core::types::{
    AgentId, ConflictId, ConflictKind, ConflictStatus, DecisionKind, DefaultAction,
    GateInstanceId, GateKey, Mode, RiskTier, RunId, RunStatus, StepId, TaskId,
};

use crate::notifications::Notification;

/// Everything the engine announces to the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: RunId,
        workflow_type: String,
        mode: Mode,
    },
    RunStatusChanged {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    StepStarted {
        run_id: RunId,
        step_id: StepId,
        risk: RiskTier,
    },
    StepCompleted {
        run_id: RunId,
        step_id: StepId,
    },
    StepBlocked {
        run_id: RunId,
        step_id: StepId,
        reason: String,
    },
    GatePending(GatePendingPayload),
    GateResolved {
        run_id: RunId,
        instance_id: GateInstanceId,
        gate: GateKey,
        decision: DecisionKind,
        applied_action: Option<DefaultAction>,
    },
    TaskClaimed {
        run_id: RunId,
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskCompleted {
        run_id: RunId,
        task_id: TaskId,
        agent_id: AgentId,
        unblocked: Vec<TaskId>,
    },
    ConflictRecorded {
        run_id: RunId,
        conflict_id: ConflictId,
        kind: ConflictKind,
        status: ConflictStatus,
    },
    Notification(Notification),
}

impl EngineEvent {
    /// Short machine-readable name, matching the serialized `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::RunStarted { .. } => "run_started",
            EngineEvent::RunStatusChanged { .. } => "run_status_changed",
            EngineEvent::StepStarted { .. } => "step_started",
            EngineEvent::StepCompleted { .. } => "step_completed",
            EngineEvent::StepBlocked { .. } => "step_blocked",
            EngineEvent::GatePending(_) => "gate_pending",
            EngineEvent::GateResolved { .. } => "gate_resolved",
            EngineEvent::TaskClaimed { .. } => "task_claimed",
            EngineEvent::TaskCompleted { .. } => "task_completed",
            EngineEvent::ConflictRecorded { .. } => "conflict_recorded",
            EngineEvent::Notification(_) => "notification",
        }
    }
}

/// Emitted when a gate starts waiting for a human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatePendingPayload {
    pub run_id: RunId,
    pub instance_id: GateInstanceId,
    pub gate: GateKey,
    pub gate_name: String,
    pub risk: RiskTier,
    pub confidence: f64,
    pub deadline: DateTime<Utc>,
    pub default_action: DefaultAction,
}
