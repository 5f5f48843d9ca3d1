use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use sg_core::types::RecipientClass;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A new escalation at its first level.
    Escalation,
    /// An escalation moved to the next level after an SLA breach.
    EscalationReraised,
    /// The last level breached its SLA and the default action was applied.
    EscalationDefaultApplied,
    GatePending,
    RunCompleted,
    RunAborted,
}

/// A structured message for an external delivery channel. The engine picks
/// the recipient class and the payload; the channel is not its concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: RecipientClass,
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient: RecipientClass,
        message_type: MessageType,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient,
            message_type,
            payload,
            timestamp,
        }
    }
}

/// Bounded in-memory record of recent notifications, oldest evicted first.
#[derive(Debug, Clone)]
pub struct NotificationOutbox {
    notifications: VecDeque<Notification>,
    max_notifications: usize,
}

impl NotificationOutbox {
    pub fn new(max: usize) -> Self {
        Self {
            notifications: VecDeque::new(),
            max_notifications: max,
        }
    }

    pub fn push(&mut self, n: Notification) {
        self.notifications.push_back(n);
        while self.notifications.len() > self.max_notifications {
            self.notifications.pop_front();
        }
    }

    pub fn list_all(&self) -> Vec<&Notification> {
        self.notifications.iter().collect()
    }

    pub fn for_recipient(&self, recipient: RecipientClass) -> Vec<&Notification> {
        self.notifications
            .iter()
            .filter(|n| n.recipient == recipient)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    /// Take everything queued so far.
    pub fn drain(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }
}

impl Default for NotificationOutbox {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(recipient: RecipientClass, message_type: MessageType) -> Notification {
        Notification::new(
            recipient,
            message_type,
            serde_json::json!({ "description": "test" }),
            Utc::now(),
        )
    }

    #[test]
    fn test_push_overflow_evicts_oldest() {
        let mut outbox = NotificationOutbox::new(2);
        outbox.push(make(RecipientClass::TechnicalLead, MessageType::Escalation));
        outbox.push(make(RecipientClass::ProjectLead, MessageType::GatePending));
        outbox.push(make(RecipientClass::Operator, MessageType::RunCompleted));
        let all = outbox.list_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].recipient, RecipientClass::ProjectLead);
        assert_eq!(all[1].recipient, RecipientClass::Operator);
    }

    #[test]
    fn test_filter_by_recipient() {
        let mut outbox = NotificationOutbox::default();
        outbox.push(make(RecipientClass::ProjectLead, MessageType::Escalation));
        outbox.push(make(RecipientClass::TechnicalLead, MessageType::Escalation));
        outbox.push(make(RecipientClass::ProjectLead, MessageType::EscalationReraised));
        assert_eq!(outbox.for_recipient(RecipientClass::ProjectLead).len(), 2);
        assert!(outbox.for_recipient(RecipientClass::Executive).is_empty());
    }

    #[test]
    fn test_drain_empties() {
        let mut outbox = NotificationOutbox::default();
        outbox.push(make(RecipientClass::Operator, MessageType::RunAborted));
        assert_eq!(outbox.drain().len(), 1);
        assert!(outbox.is_empty());
    }
}
