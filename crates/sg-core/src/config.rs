use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{DefaultAction, EscalationTrigger, Mode, RecipientClass};

/// Top-level configuration loaded from `~/.stepgate/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub gates: GatesConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
}

impl Config {
    /// Load config from `~/.stepgate/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gates.validate()?;
        self.coordinator.validate()?;
        self.content.validate()?;
        self.escalation.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        base_dir().join("config.toml")
    }
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stepgate")
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Where run manifests and the approval history live.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            state_dir: default_state_dir(),
        }
    }
}

impl GeneralConfig {
    /// `state_dir` with a leading `~/` expanded.
    pub fn state_path(&self) -> PathBuf {
        match self.state_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest),
            None => PathBuf::from(&self.state_dir),
        }
    }
}

fn default_project_name() -> String {
    "stepgate".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_state_dir() -> String {
    "~/.stepgate/state".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatesConfig {
    #[serde(default = "default_mode")]
    pub default_mode: Mode,
    /// LEARNING mode auto-proceeds once confidence exceeds this.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Exponential update weight α.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Score reported for a gate with no history.
    #[serde(default = "default_initial_confidence")]
    pub initial_confidence: f64,
    #[serde(default = "default_decision_sla_secs")]
    pub decision_sla_secs: u64,
    #[serde(default = "default_gate_action")]
    pub default_action: DefaultAction,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            default_mode: default_mode(),
            confidence_threshold: default_confidence_threshold(),
            learning_rate: default_learning_rate(),
            initial_confidence: default_initial_confidence(),
            decision_sla_secs: default_decision_sla_secs(),
            default_action: default_gate_action(),
        }
    }
}

impl GatesConfig {
    pub fn decision_sla(&self) -> Duration {
        Duration::from_secs(self.decision_sla_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Validation(format!(
                "gates.confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate < 1.0) {
            return Err(ConfigError::Validation(format!(
                "gates.learning_rate must be within (0, 1), got {}",
                self.learning_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.initial_confidence) {
            return Err(ConfigError::Validation(format!(
                "gates.initial_confidence must be within [0, 1], got {}",
                self.initial_confidence
            )));
        }
        if self.decision_sla_secs == 0 {
            return Err(ConfigError::Validation(
                "gates.decision_sla_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_mode() -> Mode {
    Mode::Guided
}
fn default_confidence_threshold() -> f64 {
    0.8
}
fn default_learning_rate() -> f64 {
    0.2
}
fn default_initial_confidence() -> f64 {
    0.5
}
fn default_decision_sla_secs() -> u64 {
    30 * 60
}
fn default_gate_action() -> DefaultAction {
    DefaultAction::Approve
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Added to an agent's declared estimate to form the claim lease.
    #[serde(default = "default_claim_grace_secs")]
    pub claim_grace_secs: u64,
    /// Used when a claim request carries no estimate.
    #[serde(default = "default_estimate_secs")]
    pub default_estimate_secs: u64,
    /// An agent without a heartbeat for this long scores as unavailable.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Adapter generation attempts before an interface conflict escalates.
    #[serde(default = "default_max_adapter_attempts")]
    pub max_adapter_attempts: u32,
    #[serde(default)]
    pub weights: PriorityWeights,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            claim_grace_secs: default_claim_grace_secs(),
            default_estimate_secs: default_estimate_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            max_adapter_attempts: default_max_adapter_attempts(),
            weights: PriorityWeights::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn claim_grace(&self) -> Duration {
        Duration::from_secs(self.claim_grace_secs)
    }

    pub fn default_estimate(&self) -> Duration {
        Duration::from_secs(self.default_estimate_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_estimate_secs == 0 {
            return Err(ConfigError::Validation(
                "coordinator.default_estimate_secs must be positive".into(),
            ));
        }
        self.weights.validate()
    }
}

fn default_claim_grace_secs() -> u64 {
    60
}
fn default_estimate_secs() -> u64 {
    15 * 60
}
fn default_heartbeat_timeout_secs() -> u64 {
    120
}
fn default_max_adapter_attempts() -> u32 {
    1
}

/// Weights of the composite score used to arbitrate claim contention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    #[serde(default = "default_w_priority")]
    pub task_priority: f64,
    #[serde(default = "default_w_capability")]
    pub capability_match: f64,
    #[serde(default = "default_w_readiness")]
    pub dependency_readiness: f64,
    #[serde(default = "default_w_availability")]
    pub availability: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            task_priority: default_w_priority(),
            capability_match: default_w_capability(),
            dependency_readiness: default_w_readiness(),
            availability: default_w_availability(),
        }
    }
}

impl PriorityWeights {
    fn validate(&self) -> Result<(), ConfigError> {
        let parts = [
            self.task_priority,
            self.capability_match,
            self.dependency_readiness,
            self.availability,
        ];
        if parts.iter().any(|w| *w < 0.0) {
            return Err(ConfigError::Validation(
                "coordinator.weights must not be negative".into(),
            ));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Validation(format!(
                "coordinator.weights must sum to 1.0, got {sum}"
            )));
        }
        Ok(())
    }
}

fn default_w_priority() -> f64 {
    0.4
}
fn default_w_capability() -> f64 {
    0.3
}
fn default_w_readiness() -> f64 {
    0.2
}
fn default_w_availability() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_content_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts after the first failure.
    #[serde(default = "default_content_retries")]
    pub retries: u32,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_content_timeout_secs(),
            retries: default_content_retries(),
        }
    }
}

impl ContentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "content.timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn default_content_timeout_secs() -> u64 {
    120
}
fn default_content_retries() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationLevelConfig {
    pub recipient: RecipientClass,
    pub sla_secs: u64,
}

impl EscalationLevelConfig {
    pub fn new(recipient: RecipientClass, sla_mins: u64) -> Self {
        Self {
            recipient,
            sla_secs: sla_mins * 60,
        }
    }

    pub fn sla(&self) -> Duration {
        Duration::from_secs(self.sla_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRule {
    pub trigger: EscalationTrigger,
    pub levels: Vec<EscalationLevelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Automatic resolution attempts before a conflict counts as unresolved.
    #[serde(default = "default_max_auto_attempts")]
    pub max_auto_resolution_attempts: u32,
    #[serde(default = "default_escalation_rules")]
    pub rules: Vec<EscalationRule>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_auto_resolution_attempts: default_max_auto_attempts(),
            rules: default_escalation_rules(),
        }
    }
}

impl EscalationConfig {
    pub fn rule_for(&self, trigger: EscalationTrigger) -> Option<&EscalationRule> {
        self.rules.iter().find(|r| r.trigger == trigger)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.trigger) {
                return Err(ConfigError::Validation(format!(
                    "escalation.rules has duplicate trigger `{}`",
                    rule.trigger
                )));
            }
            if rule.levels.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "escalation rule `{}` has no levels",
                    rule.trigger
                )));
            }
            if rule.levels.iter().any(|l| l.sla_secs == 0) {
                return Err(ConfigError::Validation(format!(
                    "escalation rule `{}` has a zero SLA",
                    rule.trigger
                )));
            }
        }
        Ok(())
    }
}

fn default_max_auto_attempts() -> u32 {
    1
}

fn default_escalation_rules() -> Vec<EscalationRule> {
    use EscalationLevelConfig as L;
    use RecipientClass::*;
    vec![
        EscalationRule {
            trigger: EscalationTrigger::UnresolvedConflict,
            levels: vec![L::new(TechnicalLead, 30), L::new(ProjectLead, 60)],
        },
        EscalationRule {
            trigger: EscalationTrigger::DestructiveGate,
            levels: vec![L::new(ProjectLead, 15), L::new(Executive, 60)],
        },
        EscalationRule {
            trigger: EscalationTrigger::GateTimeout,
            levels: vec![L::new(ProjectLead, 15)],
        },
        EscalationRule {
            trigger: EscalationTrigger::GateRejected,
            levels: vec![L::new(ProjectLead, 30)],
        },
        EscalationRule {
            trigger: EscalationTrigger::CyclicDependency,
            levels: vec![L::new(TechnicalLead, 30), L::new(ProjectLead, 60)],
        },
        EscalationRule {
            trigger: EscalationTrigger::ContentGenerationFailure,
            levels: vec![L::new(TechnicalLead, 30)],
        },
    ]
}
