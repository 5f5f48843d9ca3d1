use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use sg_core::clock::SharedClock;
use sg_core::types::{
    ApprovalRecord, DecisionKind, DefaultAction, GateInstanceId, GateKey, GateVerdict,
    HumanResponse, Mode, RiskTier, RunId, StepId,
};
use sg_telemetry::metrics::{global_metrics, names};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gate instance {0} is not pending")]
    NotPending(GateInstanceId),
    #[error("gate instance {0} passed its deadline; the default action applies")]
    Expired(GateInstanceId),
}

pub type Result<T> = std::result::Result<T, GateError>;

// ---------------------------------------------------------------------------
// GatePolicy
// ---------------------------------------------------------------------------

/// Why a policy produced its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    DestructiveFloor,
    Skipped,
    Required,
    ComplianceLocked,
    GuidedDefault,
    AutonomousDefault,
    ConfidenceAboveThreshold,
    ConfidenceBelowThreshold,
}

/// Gate rules for one run: its mode plus the operator's overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatePolicy {
    pub mode: Mode,
    #[serde(default)]
    pub skip: BTreeSet<StepId>,
    #[serde(default)]
    pub require: BTreeSet<StepId>,
    /// Steps that cannot be skipped because a compliance framework applies.
    #[serde(default)]
    pub compliance_locked: BTreeSet<StepId>,
    pub threshold: f64,
}

impl GatePolicy {
    pub fn new(mode: Mode, threshold: f64) -> Self {
        Self {
            mode,
            skip: BTreeSet::new(),
            require: BTreeSet::new(),
            compliance_locked: BTreeSet::new(),
            threshold,
        }
    }

    pub fn skipping<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.skip.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn requiring<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.require.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn locking<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        self.compliance_locked.extend(steps.into_iter().map(Into::into));
        self
    }

    pub fn decide(&self, step_id: &str, risk: RiskTier, confidence: f64) -> GateVerdict {
        self.evaluate(step_id, risk, confidence).0
    }

    /// Verdict plus the rule that produced it. The destructive floor is
    /// checked before anything else.
    pub fn evaluate(
        &self,
        step_id: &str,
        risk: RiskTier,
        confidence: f64,
    ) -> (GateVerdict, VerdictReason) {
        use GateVerdict::{AutoProceed, RequireApproval};

        if risk == RiskTier::Destructive {
            return (RequireApproval, VerdictReason::DestructiveFloor);
        }
        let locked = self.compliance_locked.contains(step_id);
        let skipped = !locked && self.skip.contains(step_id);
        let required = self.require.contains(step_id);

        match self.mode {
            Mode::Guided if skipped => (AutoProceed, VerdictReason::Skipped),
            Mode::Guided if locked => (RequireApproval, VerdictReason::ComplianceLocked),
            Mode::Guided => (RequireApproval, VerdictReason::GuidedDefault),

            Mode::Autonomous if required => (RequireApproval, VerdictReason::Required),
            Mode::Autonomous if locked => (RequireApproval, VerdictReason::ComplianceLocked),
            Mode::Autonomous => (AutoProceed, VerdictReason::AutonomousDefault),

            Mode::Learning if skipped => (AutoProceed, VerdictReason::Skipped),
            Mode::Learning if required => (RequireApproval, VerdictReason::Required),
            Mode::Learning if locked => (RequireApproval, VerdictReason::ComplianceLocked),
            Mode::Learning if confidence > self.threshold => {
                (AutoProceed, VerdictReason::ConfidenceAboveThreshold)
            }
            Mode::Learning => (RequireApproval, VerdictReason::ConfidenceBelowThreshold),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingGate / GateResolution
// ---------------------------------------------------------------------------

/// A gate waiting for a human. Wall-clock fields survive a restart; the
/// monotonic deadline is rebuilt from them on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingGate {
    pub instance_id: GateInstanceId,
    pub run_id: RunId,
    pub gate: GateKey,
    pub gate_name: String,
    pub risk: RiskTier,
    pub confidence: f64,
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub default_action: DefaultAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateResolution {
    pub pending: PendingGate,
    pub decision: DecisionKind,
    /// The default action applied when `decision` is `TimedOutDefault`.
    pub applied_action: Option<DefaultAction>,
    pub resolved_at: DateTime<Utc>,
    pub latency: Duration,
}

impl GateResolution {
    /// Whether the step behind the gate may run.
    pub fn proceeds(&self) -> bool {
        matches!(
            (self.decision, self.applied_action),
            (DecisionKind::Approved, _)
                | (DecisionKind::TimedOutDefault, Some(DefaultAction::Approve))
        )
    }

    pub fn aborts_run(&self) -> bool {
        self.applied_action == Some(DefaultAction::AbortRun)
    }

    pub fn to_record(&self, seq: u64) -> ApprovalRecord {
        ApprovalRecord {
            seq,
            gate: self.pending.gate.clone(),
            run_id: self.pending.run_id,
            instance_id: self.pending.instance_id,
            decision: self.decision,
            applied_action: self.applied_action,
            requested_at: self.pending.requested_at,
            resolved_at: self.resolved_at,
            latency_ms: self.latency.as_millis() as u64,
        }
    }
}

// ---------------------------------------------------------------------------
// GateController
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Waiting {
    gate: PendingGate,
    opened: Instant,
    deadline: Instant,
}

/// Pending gates keyed by instance id. Removing an entry from the map is the
/// resolution point: a response, a timeout and a cancellation race for the
/// same removal and exactly one of them wins.
pub struct GateController {
    clock: SharedClock,
    sla: Duration,
    default_action: DefaultAction,
    pending: DashMap<GateInstanceId, Waiting>,
}

impl GateController {
    pub fn new(clock: SharedClock, sla: Duration, default_action: DefaultAction) -> Self {
        Self {
            clock,
            sla,
            default_action,
            pending: DashMap::new(),
        }
    }

    /// Start waiting for a human. `default_action` overrides the configured
    /// one for this gate. A destructive gate never defaults to approval.
    pub fn open(
        &self,
        run_id: RunId,
        gate: GateKey,
        gate_name: impl Into<String>,
        risk: RiskTier,
        confidence: f64,
        default_action: Option<DefaultAction>,
    ) -> PendingGate {
        let opened = self.clock.now();
        let requested_at = self.clock.wall();
        let mut action = default_action.unwrap_or(self.default_action);
        if risk == RiskTier::Destructive && action == DefaultAction::Approve {
            action = DefaultAction::Reject;
        }
        let pending = PendingGate {
            instance_id: Uuid::new_v4(),
            run_id,
            gate,
            gate_name: gate_name.into(),
            risk,
            confidence,
            requested_at,
            deadline: requested_at + chrono_duration(self.sla),
            default_action: action,
        };
        tracing::info!(
            run_id = %run_id,
            gate = %pending.gate,
            instance_id = %pending.instance_id,
            risk = %risk,
            default_action = %action,
            "gate pending approval"
        );
        self.pending.insert(
            pending.instance_id,
            Waiting {
                gate: pending.clone(),
                opened,
                deadline: opened + self.sla,
            },
        );
        pending
    }

    /// Re-register a gate loaded from a manifest. The time already spent
    /// waiting is taken from the wall clock.
    pub fn restore(&self, gate: PendingGate) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        let waited = (wall - gate.requested_at).to_std().unwrap_or_default();
        let remaining = (gate.deadline - wall).to_std().unwrap_or_default();
        let opened = now.checked_sub(waited).unwrap_or(now);
        self.pending.insert(
            gate.instance_id,
            Waiting {
                gate,
                opened,
                deadline: now + remaining,
            },
        );
    }

    pub fn respond(
        &self,
        instance_id: GateInstanceId,
        response: HumanResponse,
    ) -> Result<GateResolution> {
        let now = self.clock.now();
        let Some((_, waiting)) = self.pending.remove_if(&instance_id, |_, w| w.deadline > now)
        else {
            // Still pending means the deadline passed; expiry owns that gate.
            return Err(if self.pending.contains_key(&instance_id) {
                GateError::Expired(instance_id)
            } else {
                GateError::NotPending(instance_id)
            });
        };
        let decision = match response {
            HumanResponse::Approve => DecisionKind::Approved,
            HumanResponse::Reject => DecisionKind::Rejected,
        };
        Ok(self.resolve(waiting, decision, None))
    }

    /// Apply default actions to every gate whose deadline has passed.
    pub fn expire_due(&self) -> Vec<GateResolution> {
        self.expire_where(|_| true)
    }

    pub fn expire_due_for_run(&self, run_id: RunId) -> Vec<GateResolution> {
        self.expire_where(|w| w.gate.run_id == run_id)
    }

    fn expire_where(&self, filter: impl Fn(&Waiting) -> bool) -> Vec<GateResolution> {
        let now = self.clock.now();
        let due: Vec<GateInstanceId> = self
            .pending
            .iter()
            .filter(|e| e.deadline <= now && filter(e.value()))
            .map(|e| *e.key())
            .collect();
        due.into_iter()
            .filter_map(|id| self.pending.remove_if(&id, |_, w| w.deadline <= now))
            .map(|(_, waiting)| {
                let action = waiting.gate.default_action;
                tracing::warn!(
                    gate = %waiting.gate.gate,
                    instance_id = %waiting.gate.instance_id,
                    default_action = %action,
                    "gate deadline elapsed, applying default action"
                );
                self.resolve(waiting, DecisionKind::TimedOutDefault, Some(action))
            })
            .collect()
    }

    /// Close a gate because its run was aborted.
    pub fn cancel(&self, instance_id: GateInstanceId) -> Option<GateResolution> {
        self.pending
            .remove(&instance_id)
            .map(|(_, w)| self.resolve(w, DecisionKind::Aborted, None))
    }

    pub fn cancel_run(&self, run_id: RunId) -> Vec<GateResolution> {
        let ids: Vec<GateInstanceId> = self
            .pending
            .iter()
            .filter(|e| e.gate.run_id == run_id)
            .map(|e| *e.key())
            .collect();
        ids.into_iter().filter_map(|id| self.cancel(id)).collect()
    }

    pub fn pending(&self, instance_id: GateInstanceId) -> Option<PendingGate> {
        self.pending.get(&instance_id).map(|w| w.gate.clone())
    }

    pub fn pending_for_run(&self, run_id: RunId) -> Vec<PendingGate> {
        self.pending
            .iter()
            .filter(|e| e.gate.run_id == run_id)
            .map(|e| e.gate.clone())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn resolve(
        &self,
        waiting: Waiting,
        decision: DecisionKind,
        applied_action: Option<DefaultAction>,
    ) -> GateResolution {
        let latency = self.clock.now().saturating_duration_since(waiting.opened);
        let metrics = global_metrics();
        metrics.increment_counter(names::GATE_RESOLUTIONS, &[("decision", &decision.to_string())]);
        if decision.is_human() {
            metrics.record_histogram(names::GATE_LATENCY, latency.as_secs_f64());
        }
        GateResolution {
            pending: waiting.gate,
            decision,
            applied_action,
            resolved_at: self.clock.wall(),
            latency,
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}
