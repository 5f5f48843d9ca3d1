use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type RunId = Uuid;
pub type GateInstanceId = Uuid;
pub type ConflictId = Uuid;
pub type EscalationId = Uuid;
pub type StepId = String;
pub type TaskId = String;
pub type AgentId = String;

// ---------------------------------------------------------------------------
// RiskTier
// ---------------------------------------------------------------------------

/// Potential impact of a step. Ordered so that `max` picks the more
/// conservative tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Safe,
    Sensitive,
    Destructive,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskTier::Safe => "safe",
            RiskTier::Sensitive => "sensitive",
            RiskTier::Destructive => "destructive",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Guided,
    Autonomous,
    Learning,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Mode::Guided => "guided",
            Mode::Autonomous => "autonomous",
            Mode::Learning => "learning",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for Mode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guided" => Ok(Mode::Guided),
            "autonomous" => Ok(Mode::Autonomous),
            "learning" => Ok(Mode::Learning),
            other => Err(ParseEnumError {
                kind: "mode",
                value: other.to_string(),
            }),
        }
    }
}

/// Returned when a string does not name a known variant.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

// ---------------------------------------------------------------------------
// GateVerdict / DecisionKind / DefaultAction
// ---------------------------------------------------------------------------

/// Outcome of evaluating a gate for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    AutoProceed,
    RequireApproval,
}

impl fmt::Display for GateVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateVerdict::AutoProceed => write!(f, "auto_proceed"),
            GateVerdict::RequireApproval => write!(f, "require_approval"),
        }
    }
}

/// How a pending gate was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Approved,
    Rejected,
    /// The SLA elapsed and the configured default action was applied.
    TimedOutDefault,
    /// The run was aborted while the gate was pending.
    Aborted,
}

impl DecisionKind {
    /// Only genuine human decisions carry a learning signal.
    pub fn is_human(&self) -> bool {
        matches!(self, DecisionKind::Approved | DecisionKind::Rejected)
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DecisionKind::Approved => "approved",
            DecisionKind::Rejected => "rejected",
            DecisionKind::TimedOutDefault => "timed_out_default",
            DecisionKind::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// A human response to a pending gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HumanResponse {
    Approve,
    Reject,
}

impl FromStr for HumanResponse {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "approve" | "approved" | "y" | "yes" => Ok(HumanResponse::Approve),
            "reject" | "rejected" | "n" | "no" => Ok(HumanResponse::Reject),
            other => Err(ParseEnumError {
                kind: "response",
                value: other.to_string(),
            }),
        }
    }
}

/// Action applied when a gate deadline elapses without a human response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    Approve,
    Reject,
    AbortRun,
}

impl fmt::Display for DefaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DefaultAction::Approve => "approve",
            DefaultAction::Reject => "reject",
            DefaultAction::AbortRun => "abort_run",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// GateKey
// ---------------------------------------------------------------------------

/// Identifies a gate definition. Shared by every run of one workflow type and
/// never shared across workflow types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GateKey {
    pub workflow_type: String,
    pub step_id: StepId,
}

impl GateKey {
    pub fn new(workflow_type: impl Into<String>, step_id: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            step_id: step_id.into(),
        }
    }
}

impl fmt::Display for GateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow_type, self.step_id)
    }
}

// ---------------------------------------------------------------------------
// ApprovalRecord
// ---------------------------------------------------------------------------

/// Immutable log entry for a closed gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// Run-local sequence number shared with conflict records.
    pub seq: u64,
    pub gate: GateKey,
    pub run_id: RunId,
    pub instance_id: GateInstanceId,
    pub decision: DecisionKind,
    /// Set when `decision` is `TimedOutDefault`.
    #[serde(default)]
    pub applied_action: Option<DefaultAction>,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: DateTime<Utc>,
    pub latency_ms: u64,
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    CyclicDependency,
    InterfaceIncompatibility,
    ClaimContention,
    ResourceExhaustion,
}

impl ConflictKind {
    /// Order in which simultaneous signals are handled (lower first).
    pub fn resolution_rank(&self) -> u8 {
        match self {
            ConflictKind::CyclicDependency => 0,
            ConflictKind::InterfaceIncompatibility => 1,
            ConflictKind::ClaimContention => 2,
            ConflictKind::ResourceExhaustion => 3,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConflictKind::CyclicDependency => "cyclic_dependency",
            ConflictKind::InterfaceIncompatibility => "interface_incompatibility",
            ConflictKind::ClaimContention => "claim_contention",
            ConflictKind::ResourceExhaustion => "resource_exhaustion",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Escalate,
    AdapterGeneration,
    PriorityScore,
    ThrottleAndRedistribute,
    HumanOverride,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Escalated,
}

impl ConflictStatus {
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, ConflictStatus::Resolved)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub seq: u64,
    pub kind: ConflictKind,
    #[serde(default)]
    pub tasks: Vec<TaskId>,
    #[serde(default)]
    pub agents: Vec<AgentId>,
    pub description: String,
    pub strategy: Option<ResolutionStrategy>,
    pub status: ConflictStatus,
    pub outcome: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Available,
    Claimed,
    Blocked,
    Completed,
    Conflicted,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Available => "available",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Conflicted => "conflicted",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    PausedForGate,
    Completed,
    Aborted,
}

impl RunStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &RunStatus) -> bool {
        matches!(
            (self, target),
            (RunStatus::Running, RunStatus::PausedForGate)
                | (RunStatus::PausedForGate, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Aborted)
                | (RunStatus::PausedForGate, RunStatus::Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Running => "running",
            RunStatus::PausedForGate => "paused_for_gate",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Escalation vocabulary
// ---------------------------------------------------------------------------

/// Who receives an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientClass {
    Operator,
    TechnicalLead,
    ProjectLead,
    Executive,
}

impl fmt::Display for RecipientClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecipientClass::Operator => "operator",
            RecipientClass::TechnicalLead => "technical_lead",
            RecipientClass::ProjectLead => "project_lead",
            RecipientClass::Executive => "executive",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationTrigger {
    UnresolvedConflict,
    DestructiveGate,
    GateTimeout,
    GateRejected,
    CyclicDependency,
    ContentGenerationFailure,
}

impl fmt::Display for EscalationTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EscalationTrigger::UnresolvedConflict => "unresolved_conflict",
            EscalationTrigger::DestructiveGate => "destructive_gate",
            EscalationTrigger::GateTimeout => "gate_timeout",
            EscalationTrigger::GateRejected => "gate_rejected",
            EscalationTrigger::CyclicDependency => "cyclic_dependency",
            EscalationTrigger::ContentGenerationFailure => "content_generation_failure",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// Opaque content produced by the external content generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub body: String,
}

impl Artifact {
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
        }
    }
}
