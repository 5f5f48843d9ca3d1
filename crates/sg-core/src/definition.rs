//! Workflow definitions: ordered phases of steps, immutable once registered
//! for a workflow type.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use crate::types::{DefaultAction, RiskTier, StepId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A malformed workflow or step definition. Fatal to run construction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("workflow type must not be empty")]
    EmptyWorkflowType,
    #[error("workflow `{0}` has no phases")]
    NoPhases(String),
    #[error("phase `{0}` has no steps")]
    EmptyPhase(String),
    #[error("phase `{phase}` position {position} is not strictly increasing")]
    PhaseOrder { phase: String, position: u32 },
    #[error("step id must not be empty (phase `{0}`)")]
    EmptyStepId(String),
    #[error("step `{0}` has no content id")]
    EmptyContentId(StepId),
    #[error("duplicate step id: `{0}`")]
    DuplicateStep(StepId),
    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: StepId, dependency: StepId },
    #[error("step `{step}` depends on later step `{dependency}`")]
    ForwardDependency { step: StepId, dependency: StepId },
    #[error("duplicate workflow type: `{0}`")]
    DuplicateWorkflow(String),
    #[error("unknown workflow type: `{0}`")]
    UnknownWorkflow(String),
    #[error("could not read workflow catalog: {0}")]
    Io(String),
    #[error("could not parse workflow catalog: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// StepAction
// ---------------------------------------------------------------------------

/// What a step does to the project, as far as risk classification cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Produce an artifact. Overwrites it if it already exists.
    Generate { artifact: String },
    Delete { artifact: String },
    DeprecateInterface { interface: String },
    /// Record or change an architecture decision.
    ReviseDecision { decision: String },
    /// Define an external-facing contract such as an API or schema.
    DefineContract { contract: String },
    AllocateBudget { scope: String },
    /// Hand the step's task graph to agents.
    Implement,
    /// Anything the classifier does not know about.
    Other { name: String },
}

// ---------------------------------------------------------------------------
// Step / Phase / WorkflowDefinition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub gate_name: String,
    /// Identifier of the external content the step triggers.
    pub content_id: String,
    pub action: StepAction,
    /// `None` derives the tier from `action`.
    #[serde(default)]
    pub declared_risk: Option<RiskTier>,
    #[serde(default)]
    pub fans_out: bool,
    #[serde(default)]
    pub compliance_impact: bool,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// Overrides the configured gate timeout action for this step.
    #[serde(default)]
    pub default_action: Option<DefaultAction>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        gate_name: impl Into<String>,
        content_id: impl Into<String>,
        action: StepAction,
    ) -> Self {
        Self {
            id: id.into(),
            gate_name: gate_name.into(),
            content_id: content_id.into(),
            action,
            declared_risk: None,
            fans_out: false,
            compliance_impact: false,
            depends_on: Vec::new(),
            default_action: None,
        }
    }

    pub fn fanning_out(mut self) -> Self {
        self.fans_out = true;
        self
    }

    pub fn compliance_critical(mut self) -> Self {
        self.compliance_impact = true;
        self
    }

    pub fn with_risk(mut self, tier: RiskTier) -> Self {
        self.declared_risk = Some(tier);
        self
    }

    pub fn after(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub position: u32,
    pub steps: Vec<Step>,
}

/// Position of a step inside a definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub phase: usize,
    pub step: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub workflow_type: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<Phase>,
}

impl WorkflowDefinition {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workflow_type.trim().is_empty() {
            return Err(ValidationError::EmptyWorkflowType);
        }
        if self.phases.is_empty() {
            return Err(ValidationError::NoPhases(self.workflow_type.clone()));
        }

        let mut last_position: Option<u32> = None;
        let mut seen: HashSet<&str> = HashSet::new();
        for phase in &self.phases {
            if phase.steps.is_empty() {
                return Err(ValidationError::EmptyPhase(phase.name.clone()));
            }
            if last_position.is_some_and(|p| phase.position <= p) {
                return Err(ValidationError::PhaseOrder {
                    phase: phase.name.clone(),
                    position: phase.position,
                });
            }
            last_position = Some(phase.position);

            for step in &phase.steps {
                if step.id.trim().is_empty() {
                    return Err(ValidationError::EmptyStepId(phase.name.clone()));
                }
                if step.content_id.trim().is_empty() {
                    return Err(ValidationError::EmptyContentId(step.id.clone()));
                }
                if !seen.insert(step.id.as_str()) {
                    return Err(ValidationError::DuplicateStep(step.id.clone()));
                }
            }
        }

        // Dependencies may only point backwards.
        let order: HashMap<&str, usize> = self
            .steps()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        for (index, step) in self.steps().enumerate() {
            for dep in &step.depends_on {
                match order.get(dep.as_str()) {
                    None => {
                        return Err(ValidationError::UnknownDependency {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        })
                    }
                    Some(&dep_index) if dep_index >= index => {
                        return Err(ValidationError::ForwardDependency {
                            step: step.id.clone(),
                            dependency: dep.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    /// All steps in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    pub fn step_at(&self, cursor: Cursor) -> Option<(&Phase, &Step)> {
        let phase = self.phases.get(cursor.phase)?;
        phase.steps.get(cursor.step).map(|s| (phase, s))
    }

    /// The cursor after `cursor`, or `None` when the workflow is finished.
    pub fn next_cursor(&self, cursor: Cursor) -> Option<Cursor> {
        let phase = self.phases.get(cursor.phase)?;
        if cursor.step + 1 < phase.steps.len() {
            return Some(Cursor {
                phase: cursor.phase,
                step: cursor.step + 1,
            });
        }
        if cursor.phase + 1 < self.phases.len() {
            return Some(Cursor {
                phase: cursor.phase + 1,
                step: 0,
            });
        }
        None
    }

    /// Zero-based index of the step at `cursor` in execution order.
    pub fn ordinal(&self, cursor: Cursor) -> usize {
        self.phases
            .iter()
            .take(cursor.phase)
            .map(|p| p.steps.len())
            .sum::<usize>()
            + cursor.step
    }
}

// ---------------------------------------------------------------------------
// WorkflowCatalog
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    workflows: Vec<WorkflowDefinition>,
}

/// Registry of workflow definitions keyed by workflow type.
#[derive(Debug, Clone, Default)]
pub struct WorkflowCatalog {
    definitions: BTreeMap<String, WorkflowDefinition>,
}

impl WorkflowCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog preloaded with the `feature` and `enterprise` workflows.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for def in [feature_workflow(), enterprise_workflow()] {
            // Built-in definitions are validated by the unit tests below.
            catalog.definitions.insert(def.workflow_type.clone(), def);
        }
        catalog
    }

    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), ValidationError> {
        definition.validate()?;
        if self.definitions.contains_key(&definition.workflow_type) {
            return Err(ValidationError::DuplicateWorkflow(
                definition.workflow_type.clone(),
            ));
        }
        tracing::debug!(workflow_type = %definition.workflow_type, "registered workflow definition");
        self.definitions
            .insert(definition.workflow_type.clone(), definition);
        Ok(())
    }

    pub fn get(&self, workflow_type: &str) -> Result<&WorkflowDefinition, ValidationError> {
        self.definitions
            .get(workflow_type)
            .ok_or_else(|| ValidationError::UnknownWorkflow(workflow_type.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.definitions.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Register every `[[workflows]]` entry from a TOML document.
    pub fn extend_from_toml(&mut self, text: &str) -> Result<usize, ValidationError> {
        let file: CatalogFile =
            toml::from_str(text).map_err(|e| ValidationError::Parse(e.to_string()))?;
        let count = file.workflows.len();
        for def in file.workflows {
            self.register(def)?;
        }
        Ok(count)
    }

    pub fn load_toml(&mut self, path: &Path) -> Result<usize, ValidationError> {
        let text = std::fs::read_to_string(path).map_err(|e| ValidationError::Io(e.to_string()))?;
        self.extend_from_toml(&text)
    }
}

// ---------------------------------------------------------------------------
// Built-in workflows
// ---------------------------------------------------------------------------

fn generate(artifact: &str) -> StepAction {
    StepAction::Generate {
        artifact: artifact.to_string(),
    }
}

fn phase(name: &str, position: u32, steps: Vec<Step>) -> Phase {
    Phase {
        name: name.to_string(),
        position,
        steps,
    }
}

/// Nine-step feature delivery workflow.
pub fn feature_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_type: "feature".into(),
        description: "Single feature from directory setup to project history".into(),
        phases: vec![
            phase(
                "initialization",
                1,
                vec![Step::new(
                    "01",
                    "feature_directory_creation",
                    "01-create-feature-directory",
                    generate("feature_directory"),
                )],
            ),
            phase(
                "requirements",
                2,
                vec![
                    Step::new("02", "prd_generation", "02-generate-prd", generate("prd")).after("01"),
                    Step::new(
                        "03",
                        "srs_generation",
                        "03-generate-srs",
                        StepAction::DefineContract {
                            contract: "srs".into(),
                        },
                    )
                    .after("02"),
                ],
            ),
            phase(
                "design",
                3,
                vec![
                    Step::new(
                        "04",
                        "design_decisions",
                        "04-design-decisions",
                        StepAction::ReviseDecision {
                            decision: "architecture".into(),
                        },
                    )
                    .after("03"),
                    Step::new(
                        "05",
                        "design_analysis",
                        "05-design-analysis",
                        generate("design_analysis"),
                    )
                    .after("04"),
                ],
            ),
            phase(
                "planning",
                4,
                vec![Step::new(
                    "06",
                    "task_creation",
                    "06-generate-tasks",
                    StepAction::AllocateBudget {
                        scope: "tasks".into(),
                    },
                )
                .after("05")],
            ),
            phase(
                "implementation",
                5,
                vec![Step::new(
                    "07",
                    "task_implementation",
                    "07-implement-tasks",
                    StepAction::Implement,
                )
                .fanning_out()
                .after("06")],
            ),
            phase(
                "closure",
                6,
                vec![
                    Step::new(
                        "08",
                        "completion_summary",
                        "08-completion-summary",
                        generate("completion_summary"),
                    )
                    .after("07"),
                    Step::new(
                        "09",
                        "project_history",
                        "09-update-project-history",
                        generate("project_history_entry"),
                    )
                    .after("08"),
                ],
            ),
        ],
    }
}

/// Eight-step enterprise scaling workflow with compliance-critical steps.
pub fn enterprise_workflow() -> WorkflowDefinition {
    WorkflowDefinition {
        workflow_type: "enterprise".into(),
        description: "Scaling an MVP into an enterprise deployment".into(),
        phases: vec![
            phase(
                "transition",
                1,
                vec![Step::new(
                    "s01",
                    "mvp_to_scaling_transition",
                    "s01-mvp-to-scaling-transition",
                    StepAction::ReviseDecision {
                        decision: "mvp_architecture".into(),
                    },
                )],
            ),
            phase(
                "enterprise_design",
                2,
                vec![Step::new(
                    "s02",
                    "enterprise_design_decisions",
                    "s02-enterprise-design-decisions",
                    StepAction::ReviseDecision {
                        decision: "enterprise_architecture".into(),
                    },
                )
                .after("s01")],
            ),
            phase(
                "requirements",
                3,
                vec![
                    Step::new(
                        "s03",
                        "enterprise_srs_generation",
                        "s03-enterprise-srs",
                        StepAction::DefineContract {
                            contract: "enterprise_srs".into(),
                        },
                    )
                    .compliance_critical()
                    .after("s02"),
                    Step::new(
                        "s04",
                        "enterprise_prd_creation",
                        "s04-enterprise-prd",
                        generate("enterprise_prd"),
                    )
                    .compliance_critical()
                    .after("s03"),
                ],
            ),
            phase(
                "analysis",
                4,
                vec![Step::new(
                    "s05",
                    "enterprise_design_analysis",
                    "s05-enterprise-design-analysis",
                    generate("enterprise_design_analysis"),
                )
                .after("s04")],
            ),
            phase(
                "planning",
                5,
                vec![Step::new(
                    "s06",
                    "enterprise_task_creation",
                    "s06-enterprise-tasks",
                    StepAction::Implement,
                )
                .fanning_out()
                .compliance_critical()
                .after("s05")],
            ),
            phase(
                "closure",
                6,
                vec![
                    Step::new(
                        "s07",
                        "enterprise_completion_summary",
                        "s07-enterprise-completion-summary",
                        generate("enterprise_completion_summary"),
                    )
                    .compliance_critical()
                    .after("s06"),
                    Step::new(
                        "s08",
                        "enterprise_history_update",
                        "s08-enterprise-history-update",
                        generate("enterprise_history_entry"),
                    )
                    .after("s07"),
                ],
            ),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_workflows_validate() {
        feature_workflow().validate().unwrap();
        enterprise_workflow().validate().unwrap();
        assert_eq!(feature_workflow().step_count(), 9);
        assert_eq!(enterprise_workflow().step_count(), 8);
    }

    #[test]
    fn cursor_walks_every_step_in_order() {
        let def = feature_workflow();
        let mut cursor = Cursor::default();
        let mut ids = vec![def.step_at(cursor).unwrap().1.id.clone()];
        while let Some(next) = def.next_cursor(cursor) {
            assert_eq!(def.ordinal(next), def.ordinal(cursor) + 1);
            cursor = next;
            ids.push(def.step_at(cursor).unwrap().1.id.clone());
        }
        assert_eq!(ids, vec!["01", "02", "03", "04", "05", "06", "07", "08", "09"]);
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let mut def = feature_workflow();
        def.phases[1].steps[1].id = "02".into();
        assert_eq!(
            def.validate(),
            Err(ValidationError::DuplicateStep("02".into()))
        );
    }

    #[test]
    fn forward_dependencies_are_rejected() {
        let mut def = feature_workflow();
        def.phases[0].steps[0].depends_on.push("05".into());
        assert!(matches!(
            def.validate(),
            Err(ValidationError::ForwardDependency { .. })
        ));
    }

    #[test]
    fn phases_must_be_ordered() {
        let mut def = feature_workflow();
        def.phases[2].position = 1;
        assert!(matches!(def.validate(), Err(ValidationError::PhaseOrder { .. })));
    }

    #[test]
    fn catalog_loads_custom_workflows_from_toml() {
        let text = r#"
[[workflows]]
workflow_type = "hotfix"

[[workflows.phases]]
name = "fix"
position = 1

[[workflows.phases.steps]]
id = "h1"
gate_name = "patch"
content_id = "patch"
fans_out = true
action = { kind = "implement" }

[[workflows.phases.steps]]
id = "h2"
gate_name = "cleanup"
content_id = "cleanup"
depends_on = ["h1"]
action = { kind = "delete", artifact = "scratch" }
"#;
        let mut catalog = WorkflowCatalog::builtin();
        assert_eq!(catalog.extend_from_toml(text).unwrap(), 1);
        let def = catalog.get("hotfix").unwrap();
        assert_eq!(def.step_count(), 2);
        assert!(def.phases[0].steps[0].fans_out);
        assert_eq!(catalog.names(), vec!["enterprise", "feature", "hotfix"]);
    }

    #[test]
    fn catalog_rejects_duplicates_and_unknown_types() {
        let mut catalog = WorkflowCatalog::builtin();
        assert!(matches!(
            catalog.register(feature_workflow()),
            Err(ValidationError::DuplicateWorkflow(_))
        ));
        assert!(matches!(
            catalog.get("nope"),
            Err(ValidationError::UnknownWorkflow(_))
        ));
    }
}
