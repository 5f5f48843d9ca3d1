//! Risk classification of workflow steps.
//!
//! Classification is recomputed against the current [`RunContext`] every time
//! a gate is evaluated. Nothing is cached, so a context change (an approved
//! decision, a newly produced artifact) can raise a step to `destructive`
//! even when its gate has earned enough confidence to auto-proceed.

use serde::{Deserialize, Serialize};

use sg_core::context::RunContext;
use sg_core::definition::{Step, StepAction};
use sg_core::types::RiskTier;

/// A tier plus the rule that produced it, for plans and escalations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub reason: String,
}

/// Classify `step` under `ctx`.
pub fn classify(step: &Step, ctx: &RunContext) -> RiskTier {
    assess(step, ctx).tier
}

pub fn assess(step: &Step, ctx: &RunContext) -> RiskAssessment {
    let (derived, reason) = from_action(&step.action, ctx);

    // A declared tier replaces the derived one unless the context says the
    // step is destructive.
    let (mut tier, mut reason) = match step.declared_risk {
        Some(declared) if derived != RiskTier::Destructive => {
            (declared, format!("declared {declared}"))
        }
        _ => (derived, reason),
    };

    if step.compliance_impact && tier == RiskTier::Safe {
        if let Some(framework) = ctx.compliance {
            tier = RiskTier::Sensitive;
            reason = format!("compliance-critical under {framework}");
        }
    }

    RiskAssessment { tier, reason }
}

fn from_action(action: &StepAction, ctx: &RunContext) -> (RiskTier, String) {
    match action {
        StepAction::Generate { artifact } if ctx.existing_artifacts.contains(artifact) => (
            RiskTier::Destructive,
            format!("overwrites existing artifact `{artifact}`"),
        ),
        StepAction::Generate { artifact } => {
            (RiskTier::Safe, format!("produces new artifact `{artifact}`"))
        }
        StepAction::Delete { artifact } => {
            (RiskTier::Destructive, format!("deletes artifact `{artifact}`"))
        }
        StepAction::DeprecateInterface { interface } => {
            let audience = if ctx.public_interfaces.contains(interface) {
                "public"
            } else {
                "declared"
            };
            (
                RiskTier::Destructive,
                format!("deprecates {audience} interface `{interface}`"),
            )
        }
        StepAction::ReviseDecision { decision } if ctx.approved_decisions.contains(decision) => (
            RiskTier::Destructive,
            format!("changes approved decision `{decision}`"),
        ),
        StepAction::ReviseDecision { decision } => (
            RiskTier::Sensitive,
            format!("records architecture decision `{decision}`"),
        ),
        StepAction::DefineContract { contract } => (
            RiskTier::Sensitive,
            format!("defines external contract `{contract}`"),
        ),
        StepAction::AllocateBudget { scope } => {
            (RiskTier::Sensitive, format!("allocates budget for `{scope}`"))
        }
        StepAction::Implement if ctx.architecture_impact => (
            RiskTier::Destructive,
            "implementation with architecture impact".to_string(),
        ),
        StepAction::Implement => (RiskTier::Sensitive, "implementation work".to_string()),
        StepAction::Other { name } => (
            RiskTier::Sensitive,
            format!("unrecognised action `{name}`"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sg_core::context::ComplianceFramework;

    fn step(action: StepAction) -> Step {
        Step::new("x", "x_gate", "x-content", action)
    }

    fn generate(name: &str) -> StepAction {
        StepAction::Generate {
            artifact: name.into(),
        }
    }

    #[test]
    fn generate_is_safe_until_the_artifact_exists() {
        let s = step(generate("prd"));
        assert_eq!(classify(&s, &RunContext::default()), RiskTier::Safe);
        let ctx = RunContext::default().with_artifact("prd");
        assert_eq!(classify(&s, &ctx), RiskTier::Destructive);
    }

    #[test]
    fn revising_an_approved_decision_is_destructive() {
        let s = step(StepAction::ReviseDecision {
            decision: "architecture".into(),
        });
        assert_eq!(classify(&s, &RunContext::default()), RiskTier::Sensitive);
        let ctx = RunContext::default().with_approved_decision("architecture");
        assert_eq!(classify(&s, &ctx), RiskTier::Destructive);
    }

    #[test]
    fn unknown_actions_fail_conservative() {
        let s = step(StepAction::Other {
            name: "rotate_keys".into(),
        });
        assert_eq!(classify(&s, &RunContext::default()), RiskTier::Sensitive);
    }

    #[test]
    fn deletes_and_deprecations_are_destructive() {
        let ctx = RunContext::default();
        assert_eq!(
            classify(&step(StepAction::Delete { artifact: "a".into() }), &ctx),
            RiskTier::Destructive
        );
        assert_eq!(
            classify(
                &step(StepAction::DeprecateInterface {
                    interface: "v1".into()
                }),
                &ctx
            ),
            RiskTier::Destructive
        );
    }

    #[test]
    fn declared_tier_never_hides_a_destructive_context() {
        let s = step(generate("prd")).with_risk(RiskTier::Safe);
        assert_eq!(classify(&s, &RunContext::default()), RiskTier::Safe);
        let ctx = RunContext::default().with_artifact("prd");
        let assessed = assess(&s, &ctx);
        assert_eq!(assessed.tier, RiskTier::Destructive);
        assert!(assessed.reason.contains("overwrites"));
    }

    #[test]
    fn declared_tier_can_raise_a_safe_step() {
        let s = step(generate("notes")).with_risk(RiskTier::Destructive);
        assert_eq!(classify(&s, &RunContext::default()), RiskTier::Destructive);
    }

    #[test]
    fn compliance_steps_are_at_least_sensitive_under_a_framework() {
        let s = step(generate("enterprise_prd")).compliance_critical();
        assert_eq!(classify(&s, &RunContext::default()), RiskTier::Safe);
        let ctx = RunContext::default().with_compliance(ComplianceFramework::Hipaa);
        let assessed = assess(&s, &ctx);
        assert_eq!(assessed.tier, RiskTier::Sensitive);
        assert!(assessed.reason.contains("HIPAA"));
    }

    #[test]
    fn architecture_impact_makes_implementation_destructive() {
        let s = step(StepAction::Implement);
        let mut ctx = RunContext::default();
        assert_eq!(classify(&s, &ctx), RiskTier::Sensitive);
        ctx.architecture_impact = true;
        assert_eq!(classify(&s, &ctx), RiskTier::Destructive);
    }
}
