pub mod agents;
pub mod control;
pub mod init_config;
pub mod run;
pub mod status;
pub mod workflows;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use sg_core::config::Config;
use sg_core::definition::WorkflowCatalog;
use sg_engine::content::TemplateGenerator;
use sg_engine::history::ApprovalHistory;
use sg_engine::manifest::FileManifestStore;
use sg_engine::orchestrator::{Orchestrator, RunStatusReport};
use sg_engine::run_state::StepStage;

/// The orchestrator plus the store it writes to, with every unfinished run
/// already resumed.
pub struct Engine {
    pub orchestrator: Orchestrator,
    pub store: Arc<FileManifestStore>,
}

impl Engine {
    pub async fn open(
        config: &Config,
        state_dir: &Path,
        workflows: Option<&Path>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;
        let history = ApprovalHistory::open(state_dir.join("approval-history.jsonl"))
            .context("failed to open approval history")?;

        let mut catalog = WorkflowCatalog::builtin();
        if let Some(path) = workflows {
            let added = catalog
                .load_toml(path)
                .with_context(|| format!("failed to load workflows from {}", path.display()))?;
            tracing::info!(path = %path.display(), added, "loaded workflow definitions");
        }

        let store = Arc::new(FileManifestStore::new(state_dir));
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(TemplateGenerator::new()),
            store.clone(),
        )
        .with_catalog(catalog)
        .with_history(history);

        let resumed = orchestrator.resume_all().await?;
        tracing::debug!(resumed = resumed.len(), "unfinished runs resumed");
        Ok(Self {
            orchestrator,
            store,
        })
    }
}

pub fn stage_label(stage: &StepStage) -> String {
    match stage {
        StepStage::Ready => "ready".into(),
        StepStage::AwaitingApproval { .. } => "awaiting approval".into(),
        StepStage::Cleared => "cleared".into(),
        StepStage::AwaitingTasks => "awaiting tasks".into(),
        StepStage::Blocked { reason } => format!("blocked: {}", reason.describe()),
        StepStage::Finished => "finished".into(),
    }
}

/// Print a run report, human-readable or as JSON.
pub fn print_report(report: &RunStatusReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "run {}  ({}, {})  {}",
        report.run_id, report.workflow_type, report.mode, report.status
    );
    println!("{}", "-".repeat(60));
    if let Some(step) = &report.step {
        println!(
            "Step:        {} {} [{}]  ({}/{})",
            step.step_id, step.gate_name, step.phase, step.position, step.total
        );
    }
    println!("Stage:       {}", stage_label(&report.stage));
    println!("Completed:   {}", report.completed_steps.join(", "));
    println!("Approvals:   {}", report.approvals);
    println!("Risk score:  {:.2}", report.risk_score);

    if let Some(gate) = &report.pending_gate {
        println!();
        println!("Pending gate {}", gate.instance_id);
        println!("  gate:        {} ({})", gate.gate, gate.gate_name);
        println!("  risk:        {}", gate.risk);
        println!("  confidence:  {:.2}", gate.confidence);
        println!("  deadline:    {}", gate.deadline.format("%Y-%m-%d %H:%M:%S UTC"));
        println!("  on timeout:  {}", gate.default_action);
    }

    if let Some(tasks) = &report.tasks {
        println!();
        println!(
            "Tasks:       {}/{} completed, {} claimed, {} available, {} blocked, {} conflicted",
            tasks.completed,
            tasks.total,
            tasks.claimed,
            tasks.available,
            tasks.blocked,
            tasks.conflicted
        );
    }

    if !report.unresolved_conflicts.is_empty() {
        println!();
        println!("Unresolved conflicts:");
        for c in &report.unresolved_conflicts {
            println!("  {}  {}  {}", c.id, c.kind, c.description);
        }
    }

    if !report.open_escalations.is_empty() {
        println!();
        println!("Open escalations:");
        for e in &report.open_escalations {
            let deadline = e
                .deadline
                .map(|d| d.format("%H:%M UTC").to_string())
                .unwrap_or_else(|| "-".into());
            println!(
                "  {}  [{}] {}  (due {})",
                e.id, e.recipient, e.context.description, deadline
            );
            println!("      recommended: {}", e.context.recommended_action);
        }
    }
    Ok(())
}
