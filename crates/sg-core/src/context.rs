use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::types::ParseEnumError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceFramework {
    Gdpr,
    Soc2,
    Pci,
    Hipaa,
    Iso27001,
}

impl fmt::Display for ComplianceFramework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ComplianceFramework::Gdpr => "GDPR",
            ComplianceFramework::Soc2 => "SOC2",
            ComplianceFramework::Pci => "PCI",
            ComplianceFramework::Hipaa => "HIPAA",
            ComplianceFramework::Iso27001 => "ISO27001",
        };
        write!(f, "{}", label)
    }
}

impl FromStr for ComplianceFramework {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gdpr" => Ok(ComplianceFramework::Gdpr),
            "soc2" => Ok(ComplianceFramework::Soc2),
            "pci" => Ok(ComplianceFramework::Pci),
            "hipaa" => Ok(ComplianceFramework::Hipaa),
            "iso27001" => Ok(ComplianceFramework::Iso27001),
            other => Err(ParseEnumError {
                kind: "compliance framework",
                value: other.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Facts about the project a run operates on. Risk classification reads this
/// on every evaluation, so updating it mid-run changes later gate decisions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// Artifacts produced by earlier runs (or earlier steps of this run).
    #[serde(default)]
    pub existing_artifacts: BTreeSet<String>,
    /// Architecture decisions that have already been approved.
    #[serde(default)]
    pub approved_decisions: BTreeSet<String>,
    /// Interfaces other teams or customers already depend on.
    #[serde(default)]
    pub public_interfaces: BTreeSet<String>,
    #[serde(default)]
    pub compliance: Option<ComplianceFramework>,
    #[serde(default)]
    pub multi_team: bool,
    #[serde(default)]
    pub architecture_impact: bool,
}

impl RunContext {
    pub fn with_artifact(mut self, name: impl Into<String>) -> Self {
        self.existing_artifacts.insert(name.into());
        self
    }

    pub fn with_approved_decision(mut self, name: impl Into<String>) -> Self {
        self.approved_decisions.insert(name.into());
        self
    }

    pub fn with_compliance(mut self, framework: ComplianceFramework) -> Self {
        self.compliance = Some(framework);
        self
    }

    /// Aggregate risk score in [0, 1] reported alongside plans and status.
    pub fn risk_score(&self) -> f64 {
        let mut score = 0.3;
        if self.compliance.is_some() {
            score += 0.2;
        }
        if self.multi_team {
            score += 0.1;
        }
        if self.architecture_impact {
            score += 0.2;
        }
        f64::min(score, 1.0)
    }
}
