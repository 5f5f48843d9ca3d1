//! Human escalations with per-level response SLAs.
//!
//! A run owns one [`EscalationManager`]. Raising an escalation picks the
//! first level of the trigger's rule; [`EscalationManager::check_slas`]
//! moves breached escalations up one level, and at the last level hands the
//! subject's default action back to the caller. Every transition lands in
//! the audit log and raises a notification.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sg_bridge::event_bus::EventBus;
use sg_bridge::notifications::{MessageType, Notification, NotificationOutbox};
use sg_bridge::protocol::EngineEvent;
use sg_core::clock::SharedClock;
use sg_core::config::{EscalationConfig, EscalationLevelConfig};
use sg_core::types::{
    ConflictId, DefaultAction, EscalationId, EscalationTrigger, GateInstanceId, RecipientClass,
    RunId, StepId,
};
use sg_telemetry::metrics::{global_metrics, names};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("no escalation rule for trigger `{0}`")]
    NoRule(EscalationTrigger),
    #[error("escalation context is missing {0}")]
    IncompleteContext(&'static str),
    #[error("unknown escalation: {0}")]
    Unknown(EscalationId),
    #[error("escalation {0} is already closed")]
    Closed(EscalationId),
}

pub type Result<T> = std::result::Result<T, EscalationError>;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// What the escalation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EscalationSubject {
    Gate(GateInstanceId),
    Conflict(ConflictId),
    Step(StepId),
}

/// Everything a human needs to act without digging through logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationContext {
    pub run_id: RunId,
    pub subject: EscalationSubject,
    pub description: String,
    pub impact: String,
    pub proposed_resolutions: Vec<String>,
    pub recommended_action: String,
    /// Applied when the last level breaches its SLA. `None` leaves the
    /// escalation open for a human.
    pub default_action: Option<DefaultAction>,
}

impl EscalationContext {
    pub fn new(
        run_id: RunId,
        subject: EscalationSubject,
        description: impl Into<String>,
        impact: impl Into<String>,
    ) -> Self {
        Self {
            run_id,
            subject,
            description: description.into(),
            impact: impact.into(),
            proposed_resolutions: Vec::new(),
            recommended_action: String::new(),
            default_action: None,
        }
    }

    pub fn propose(mut self, resolution: impl Into<String>) -> Self {
        self.proposed_resolutions.push(resolution.into());
        self
    }

    pub fn recommend(mut self, action: impl Into<String>) -> Self {
        self.recommended_action = action.into();
        self
    }

    pub fn defaulting_to(mut self, action: Option<DefaultAction>) -> Self {
        self.default_action = action;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.description.trim().is_empty() {
            return Err(EscalationError::IncompleteContext("a description"));
        }
        if self.impact.trim().is_empty() {
            return Err(EscalationError::IncompleteContext("an impact assessment"));
        }
        if self.proposed_resolutions.iter().all(|r| r.trim().is_empty()) {
            return Err(EscalationError::IncompleteContext("a proposed resolution"));
        }
        if self.recommended_action.trim().is_empty() {
            return Err(EscalationError::IncompleteContext("a recommended action"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Open,
    /// A human has taken it; SLAs stop running.
    Acknowledged,
    Resolved,
    DefaultApplied,
}

impl EscalationStatus {
    pub fn is_closed(&self) -> bool {
        matches!(self, EscalationStatus::Resolved | EscalationStatus::DefaultApplied)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: EscalationId,
    pub trigger: EscalationTrigger,
    /// Zero-based index into the trigger's levels.
    pub level: usize,
    pub recipient: RecipientClass,
    pub raised_at: DateTime<Utc>,
    /// Wall-clock SLA deadline of the current level; `None` once the last
    /// level breached without a default action.
    pub deadline: Option<DateTime<Utc>>,
    pub status: EscalationStatus,
    pub context: EscalationContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Raised,
    Reraised,
    Acknowledged,
    Resolved,
    DefaultApplied,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub escalation_id: EscalationId,
    pub trigger: EscalationTrigger,
    pub event: AuditEvent,
    pub recipient: RecipientClass,
    pub level: usize,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
    /// Full context at the time of the event.
    pub context: EscalationContext,
}

/// Result of an SLA breach.
#[derive(Debug, Clone, PartialEq)]
pub enum SlaOutcome {
    Reraised {
        id: EscalationId,
        level: usize,
        recipient: RecipientClass,
    },
    /// The last level breached; the caller applies `action` to `subject`.
    ApplyDefault {
        id: EscalationId,
        subject: EscalationSubject,
        action: DefaultAction,
    },
    /// The last level breached and there is no default to apply.
    Exhausted {
        id: EscalationId,
        subject: EscalationSubject,
    },
}

/// Persisted form of a manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EscalationLog {
    pub escalations: Vec<Escalation>,
    pub audit: Vec<AuditEntry>,
}

// ---------------------------------------------------------------------------
// EscalationManager
// ---------------------------------------------------------------------------

pub struct EscalationManager {
    clock: SharedClock,
    config: EscalationConfig,
    bus: EventBus,
    escalations: Vec<Escalation>,
    deadlines: HashMap<EscalationId, Instant>,
    audit: Vec<AuditEntry>,
    outbox: NotificationOutbox,
}

impl EscalationManager {
    pub fn new(clock: SharedClock, config: EscalationConfig, bus: EventBus) -> Self {
        Self {
            clock,
            config,
            bus,
            escalations: Vec::new(),
            deadlines: HashMap::new(),
            audit: Vec::new(),
            outbox: NotificationOutbox::default(),
        }
    }

    pub fn raise(
        &mut self,
        trigger: EscalationTrigger,
        context: EscalationContext,
    ) -> Result<Escalation> {
        context.validate()?;
        let first = self.level(trigger, 0)?.clone();
        let now = self.clock.now();
        let wall = self.clock.wall();

        let escalation = Escalation {
            id: Uuid::new_v4(),
            trigger,
            level: 0,
            recipient: first.recipient,
            raised_at: wall,
            deadline: Some(wall + chrono_duration(first.sla())),
            status: EscalationStatus::Open,
            context,
        };
        self.deadlines.insert(escalation.id, now + first.sla());
        tracing::warn!(
            run_id = %escalation.context.run_id,
            escalation_id = %escalation.id,
            trigger = %trigger,
            recipient = %first.recipient,
            "escalation raised: {}",
            escalation.context.description
        );
        self.audit_event(&escalation, AuditEvent::Raised, None);
        self.notify(&escalation, MessageType::Escalation);
        self.escalations.push(escalation.clone());
        Ok(escalation)
    }

    /// Handle every breached SLA: move up one level, or at the last level
    /// return the subject's default action for the caller to apply.
    pub fn check_slas(&mut self) -> Vec<SlaOutcome> {
        let now = self.clock.now();
        let due: Vec<EscalationId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut outcomes = Vec::with_capacity(due.len());
        for id in due {
            self.deadlines.remove(&id);
            let Some(index) = self.escalations.iter().position(|e| e.id == id) else {
                continue;
            };
            let escalation = &self.escalations[index];
            if escalation.status != EscalationStatus::Open {
                continue;
            }
            let trigger = escalation.trigger;
            let next_level = escalation.level + 1;

            if let Ok(next) = self.level(trigger, next_level).cloned() {
                let wall = self.clock.wall();
                let escalation = &mut self.escalations[index];
                escalation.level = next_level;
                escalation.recipient = next.recipient;
                escalation.deadline = Some(wall + chrono_duration(next.sla()));
                let snapshot = escalation.clone();
                self.deadlines.insert(id, now + next.sla());
                tracing::warn!(
                    escalation_id = %id,
                    trigger = %trigger,
                    recipient = %next.recipient,
                    level = next_level,
                    "escalation SLA breached, re-raised"
                );
                self.audit_event(&snapshot, AuditEvent::Reraised, None);
                self.notify(&snapshot, MessageType::EscalationReraised);
                outcomes.push(SlaOutcome::Reraised {
                    id,
                    level: next_level,
                    recipient: next.recipient,
                });
                continue;
            }

            let escalation = &mut self.escalations[index];
            escalation.deadline = None;
            let subject = escalation.context.subject.clone();
            match escalation.context.default_action {
                Some(action) => {
                    escalation.status = EscalationStatus::DefaultApplied;
                    let snapshot = escalation.clone();
                    tracing::warn!(
                        escalation_id = %id,
                        trigger = %trigger,
                        default_action = %action,
                        "escalation exhausted, applying default action"
                    );
                    self.audit_event(&snapshot, AuditEvent::DefaultApplied, Some(action.to_string()));
                    self.notify(&snapshot, MessageType::EscalationDefaultApplied);
                    outcomes.push(SlaOutcome::ApplyDefault {
                        id,
                        subject,
                        action,
                    });
                }
                None => {
                    let snapshot = escalation.clone();
                    tracing::warn!(
                        escalation_id = %id,
                        trigger = %trigger,
                        "escalation exhausted with no default action; waiting for a human"
                    );
                    self.audit_event(&snapshot, AuditEvent::Exhausted, None);
                    outcomes.push(SlaOutcome::Exhausted { id, subject });
                }
            }
        }
        outcomes
    }

    pub fn acknowledge(&mut self, id: EscalationId) -> Result<Escalation> {
        let escalation = self.open_mut(id)?;
        escalation.status = EscalationStatus::Acknowledged;
        let snapshot = escalation.clone();
        self.deadlines.remove(&id);
        self.audit_event(&snapshot, AuditEvent::Acknowledged, None);
        Ok(snapshot)
    }

    pub fn resolve(&mut self, id: EscalationId, note: impl Into<String>) -> Result<Escalation> {
        let escalation = self.open_mut(id)?;
        escalation.status = EscalationStatus::Resolved;
        escalation.deadline = None;
        let snapshot = escalation.clone();
        self.deadlines.remove(&id);
        self.audit_event(&snapshot, AuditEvent::Resolved, Some(note.into()));
        tracing::info!(escalation_id = %id, trigger = %snapshot.trigger, "escalation resolved");
        Ok(snapshot)
    }

    /// Resolve every open escalation about `subject`.
    pub fn resolve_for_subject(&mut self, subject: &EscalationSubject, note: &str) -> Vec<Escalation> {
        let ids: Vec<EscalationId> = self
            .escalations
            .iter()
            .filter(|e| !e.status.is_closed() && &e.context.subject == subject)
            .map(|e| e.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.resolve(id, note).ok())
            .collect()
    }

    pub fn resolve_all(&mut self, note: &str) -> Vec<Escalation> {
        let ids: Vec<EscalationId> = self
            .escalations
            .iter()
            .filter(|e| !e.status.is_closed())
            .map(|e| e.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.resolve(id, note).ok())
            .collect()
    }

    pub fn get(&self, id: EscalationId) -> Option<&Escalation> {
        self.escalations.iter().find(|e| e.id == id)
    }

    pub fn open(&self) -> Vec<&Escalation> {
        self.escalations
            .iter()
            .filter(|e| !e.status.is_closed())
            .collect()
    }

    pub fn all(&self) -> &[Escalation] {
        &self.escalations
    }

    pub fn audit_log(&self) -> &[AuditEntry] {
        &self.audit
    }

    pub fn outbox(&self) -> &NotificationOutbox {
        &self.outbox
    }

    /// Queue and publish a notification that is not tied to an escalation.
    pub fn announce(
        &mut self,
        recipient: RecipientClass,
        message_type: MessageType,
        payload: serde_json::Value,
    ) {
        let notification = Notification::new(recipient, message_type, payload, self.clock.wall());
        self.outbox.push(notification.clone());
        self.bus.publish(EngineEvent::Notification(notification));
    }

    pub fn to_log(&self) -> EscalationLog {
        EscalationLog {
            escalations: self.escalations.clone(),
            audit: self.audit.clone(),
        }
    }

    /// Reload persisted escalations. SLA deadlines are rebuilt from their
    /// wall-clock form; a deadline already in the past breaches on the next
    /// [`check_slas`](Self::check_slas).
    pub fn restore(&mut self, log: EscalationLog) {
        let now = self.clock.now();
        let wall = self.clock.wall();
        self.deadlines.clear();
        for escalation in &log.escalations {
            if escalation.status != EscalationStatus::Open {
                continue;
            }
            if let Some(deadline) = escalation.deadline {
                let remaining = (deadline - wall).to_std().unwrap_or_default();
                self.deadlines.insert(escalation.id, now + remaining);
            }
        }
        self.escalations = log.escalations;
        self.audit = log.audit;
    }

    // -- Internals -----------------------------------------------------------

    fn level(&self, trigger: EscalationTrigger, index: usize) -> Result<&EscalationLevelConfig> {
        let rule = self
            .config
            .rule_for(trigger)
            .ok_or(EscalationError::NoRule(trigger))?;
        rule.levels.get(index).ok_or(EscalationError::NoRule(trigger))
    }

    fn open_mut(&mut self, id: EscalationId) -> Result<&mut Escalation> {
        let escalation = self
            .escalations
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(EscalationError::Unknown(id))?;
        if escalation.status.is_closed() {
            return Err(EscalationError::Closed(id));
        }
        Ok(escalation)
    }

    fn audit_event(&mut self, escalation: &Escalation, event: AuditEvent, note: Option<String>) {
        self.audit.push(AuditEntry {
            escalation_id: escalation.id,
            trigger: escalation.trigger,
            event,
            recipient: escalation.recipient,
            level: escalation.level,
            at: self.clock.wall(),
            note,
            context: escalation.context.clone(),
        });
    }

    fn notify(&mut self, escalation: &Escalation, message_type: MessageType) {
        global_metrics().increment_counter(
            names::ESCALATIONS,
            &[("level", &escalation.recipient.to_string())],
        );
        let payload = serde_json::json!({
            "escalation_id": escalation.id,
            "run_id": escalation.context.run_id,
            "trigger": escalation.trigger,
            "level": escalation.level,
            "subject": escalation.context.subject,
            "description": escalation.context.description,
            "impact": escalation.context.impact,
            "proposed_resolutions": escalation.context.proposed_resolutions,
            "recommended_action": escalation.context.recommended_action,
            "default_action": escalation.context.default_action,
            "deadline": escalation.deadline,
        });
        self.announce(escalation.recipient, message_type, payload);
    }
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::clock::ManualClock;
    use std::time::Duration;

    fn manager() -> (std::sync::Arc<ManualClock>, EscalationManager) {
        let clock = ManualClock::shared();
        let mgr = EscalationManager::new(clock.clone(), EscalationConfig::default(), EventBus::new());
        (clock, mgr)
    }

    fn context(default_action: Option<DefaultAction>) -> EscalationContext {
        EscalationContext::new(
            Uuid::new_v4(),
            EscalationSubject::Step("07".into()),
            "tasks T2 and T3 disagree on the session API",
            "implementation step cannot finish",
        )
        .propose("accept T2's interface and regenerate T3")
        .recommend("review both outputs")
        .defaulting_to(default_action)
    }

    #[test]
    fn raise_requires_a_complete_context() {
        let (_clock, mut mgr) = manager();
        let mut ctx = context(None);
        ctx.proposed_resolutions.clear();
        assert!(matches!(
            mgr.raise(EscalationTrigger::UnresolvedConflict, ctx),
            Err(EscalationError::IncompleteContext(_))
        ));
        assert!(mgr.all().is_empty());
    }

    #[test]
    fn first_level_comes_from_the_trigger_table() {
        let (_clock, mut mgr) = manager();
        let e = mgr
            .raise(EscalationTrigger::DestructiveGate, context(None))
            .unwrap();
        assert_eq!(e.recipient, RecipientClass::ProjectLead);
        assert_eq!(e.level, 0);
        assert_eq!(mgr.outbox().len(), 1);
        assert_eq!(mgr.audit_log()[0].event, AuditEvent::Raised);
    }

    #[test]
    fn breach_reraises_then_applies_default() {
        let (clock, mut mgr) = manager();
        let e = mgr
            .raise(EscalationTrigger::UnresolvedConflict, context(Some(DefaultAction::Reject)))
            .unwrap();
        clock.advance(Duration::from_secs(29 * 60));
        assert!(mgr.check_slas().is_empty());
        clock.advance(Duration::from_secs(60));
        assert_eq!(
            mgr.check_slas(),
            vec![SlaOutcome::Reraised {
                id: e.id,
                level: 1,
                recipient: RecipientClass::ProjectLead
            }]
        );
        clock.advance(Duration::from_secs(60 * 60));
        let outcomes = mgr.check_slas();
        assert!(matches!(
            outcomes.as_slice(),
            [SlaOutcome::ApplyDefault { action: DefaultAction::Reject, .. }]
        ));
        assert_eq!(mgr.get(e.id).unwrap().status, EscalationStatus::DefaultApplied);
        let events: Vec<AuditEvent> = mgr.audit_log().iter().map(|a| a.event).collect();
        assert_eq!(
            events,
            vec![AuditEvent::Raised, AuditEvent::Reraised, AuditEvent::DefaultApplied]
        );
    }

    #[test]
    fn acknowledged_escalations_stop_their_sla() {
        let (clock, mut mgr) = manager();
        let e = mgr
            .raise(EscalationTrigger::GateRejected, context(None))
            .unwrap();
        mgr.acknowledge(e.id).unwrap();
        clock.advance(Duration::from_secs(24 * 60 * 60));
        assert!(mgr.check_slas().is_empty());
        mgr.resolve(e.id, "handled").unwrap();
        assert!(matches!(mgr.resolve(e.id, "again"), Err(EscalationError::Closed(_))));
    }

    #[test]
    fn restored_manager_keeps_wall_clock_deadlines() {
        let (clock, mut mgr) = manager();
        mgr.raise(EscalationTrigger::GateTimeout, context(None)).unwrap();
        clock.advance(Duration::from_secs(10 * 60));
        let log = mgr.to_log();

        let mut resumed =
            EscalationManager::new(clock.clone(), EscalationConfig::default(), EventBus::new());
        resumed.restore(log);
        clock.advance(Duration::from_secs(4 * 60));
        assert!(resumed.check_slas().is_empty());
        clock.advance(Duration::from_secs(60));
        assert!(matches!(
            resumed.check_slas().as_slice(),
            [SlaOutcome::Exhausted { .. }]
        ));
    }
}
