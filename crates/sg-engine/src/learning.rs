//! Per-gate confidence learned from human decisions.
//!
//! Each gate keeps an exponentially weighted estimate
//! `new = old + α·(target − old)` with target 1 for an approval and 0 for a
//! rejection. Timeouts and aborts carry no signal and leave the score as is.

use ahash::RandomState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use sg_core::config::GatesConfig;
use sg_core::types::{DecisionKind, GateKey};

use crate::history::ApprovalHistory;

/// Learned state of one gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateScore {
    pub confidence: f64,
    pub approvals: u32,
    pub rejections: u32,
    /// Timeouts and aborts seen for this gate.
    pub ignored: u32,
}

/// Confidence table shared by every run. Each update is a single entry
/// transaction on the gate's key.
#[derive(Debug)]
pub struct LearningEngine {
    alpha: f64,
    initial: f64,
    scores: DashMap<GateKey, GateScore, RandomState>,
}

impl LearningEngine {
    pub fn new(alpha: f64, initial: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0 - f64::EPSILON),
            initial: initial.clamp(0.0, 1.0),
            scores: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn from_config(gates: &GatesConfig) -> Self {
        Self::new(gates.learning_rate, gates.initial_confidence)
    }

    /// Apply one resolved decision and return the gate's confidence after it.
    pub fn record(&self, gate: &GateKey, decision: DecisionKind) -> f64 {
        let mut entry = self.scores.entry(gate.clone()).or_insert(GateScore {
            confidence: self.initial,
            approvals: 0,
            rejections: 0,
            ignored: 0,
        });
        let score = entry.value_mut();
        let target = match decision {
            DecisionKind::Approved => {
                score.approvals += 1;
                1.0
            }
            DecisionKind::Rejected => {
                score.rejections += 1;
                0.0
            }
            DecisionKind::TimedOutDefault | DecisionKind::Aborted => {
                score.ignored += 1;
                return score.confidence;
            }
        };
        let before = score.confidence;
        score.confidence = (before + self.alpha * (target - before)).clamp(0.0, 1.0);
        tracing::debug!(
            gate = %gate,
            decision = %decision,
            before,
            after = score.confidence,
            "gate confidence updated"
        );
        score.confidence
    }

    /// Current confidence, or the configured prior for an unseen gate.
    pub fn confidence(&self, gate: &GateKey) -> f64 {
        self.scores
            .get(gate)
            .map(|s| s.confidence)
            .unwrap_or(self.initial)
    }

    pub fn score(&self, gate: &GateKey) -> Option<GateScore> {
        self.scores.get(gate).map(|s| *s)
    }

    /// Replay the full history in log order, replacing all learned state.
    pub fn rebuild(&self, history: &ApprovalHistory) {
        self.scores.clear();
        for record in history.records() {
            self.record(&record.gate, record.decision);
        }
        tracing::info!(
            gates = self.scores.len(),
            records = history.len(),
            "learning engine rebuilt from history"
        );
    }

    /// All learned gates, sorted by key.
    pub fn snapshot(&self) -> Vec<(GateKey, GateScore)> {
        let mut all: Vec<_> = self
            .scores
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl Default for LearningEngine {
    fn default() -> Self {
        Self::from_config(&GatesConfig::default())
    }
}
