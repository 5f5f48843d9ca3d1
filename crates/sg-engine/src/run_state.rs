use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sg_core::types::{ConflictId, GateInstanceId, RunStatus};

// ---------------------------------------------------------------------------
// RunEvent
// ---------------------------------------------------------------------------

/// Events that drive a run's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// A gate needs a human, or the current step is blocked.
    PauseForGate,
    Resume,
    /// The last step finished.
    Finish,
    Abort,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunStateError {
    #[error("invalid transition from {from} on {event:?}")]
    InvalidTransition { from: RunStatus, event: RunEvent },
}

pub type Result<T> = std::result::Result<T, RunStateError>;

// ---------------------------------------------------------------------------
// RunStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub event: RunEvent,
    pub at: DateTime<Utc>,
}

/// Status of one run plus every transition it took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStateMachine {
    current: RunStatus,
    history: Vec<Transition>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            current: RunStatus::Running,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> RunStatus {
        self.current
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transition(&mut self, event: RunEvent, at: DateTime<Utc>) -> Result<RunStatus> {
        use RunStatus::*;

        let next = match (self.current, event) {
            (Running, RunEvent::PauseForGate) => PausedForGate,
            (PausedForGate, RunEvent::Resume) => Running,
            (Running, RunEvent::Finish) => Completed,
            (Running | PausedForGate, RunEvent::Abort) => Aborted,
            (from, event) => return Err(RunStateError::InvalidTransition { from, event }),
        };
        debug_assert!(self.current.can_transition_to(&next));

        self.history.push(Transition {
            from: self.current,
            to: next,
            event,
            at,
        });
        tracing::debug!(from = %self.current, to = %next, ?event, "run status transition");
        self.current = next;
        Ok(next)
    }
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// StepStage
// ---------------------------------------------------------------------------

/// Why the current step cannot move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    GateRejected { instance_id: GateInstanceId },
    UnresolvedConflict { conflict_id: ConflictId },
    ContentFailure { error: String },
    CyclicDependency { conflict_id: ConflictId },
    InvalidGraph { error: String },
}

impl BlockReason {
    pub fn describe(&self) -> String {
        match self {
            BlockReason::GateRejected { instance_id } => format!("gate {instance_id} was rejected"),
            BlockReason::UnresolvedConflict { conflict_id } => {
                format!("conflict {conflict_id} is unresolved")
            }
            BlockReason::ContentFailure { error } => format!("content generation failed: {error}"),
            BlockReason::CyclicDependency { conflict_id } => {
                format!("task graph has a dependency cycle (conflict {conflict_id})")
            }
            BlockReason::InvalidGraph { error } => format!("task graph is invalid: {error}"),
        }
    }
}

/// Where the current step is within its own lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StepStage {
    /// Gate not evaluated yet.
    #[default]
    Ready,
    AwaitingApproval { instance_id: GateInstanceId },
    /// Gate passed; content not generated yet.
    Cleared,
    /// Content generated; waiting for fan-out tasks.
    AwaitingTasks,
    Blocked { reason: BlockReason },
    /// Every step is done.
    Finished,
}

impl StepStage {
    pub fn is_blocked(&self) -> bool {
        matches!(self, StepStage::Blocked { .. })
    }
}
