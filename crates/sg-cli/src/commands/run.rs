use clap::Args;
use sg_core::config::Config;
use sg_core::context::{ComplianceFramework, RunContext};
use sg_core::types::{GateVerdict, Mode};
use sg_engine::gate::VerdictReason;
use sg_engine::orchestrator::RunOptions;
use sg_engine::run_state::StepStage;

use super::{agents, print_report, Engine};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Workflow type, e.g. `feature` or `enterprise`.
    pub workflow: String,

    /// guided, learning or autonomous (default: `gates.default_mode`).
    #[arg(long)]
    pub mode: Option<Mode>,

    /// Step ids whose gate should be skipped.
    #[arg(long, value_delimiter = ',')]
    pub skip_gates: Vec<String>,

    /// Step ids whose gate must always ask.
    #[arg(long, value_delimiter = ',')]
    pub require_gates: Vec<String>,

    /// Compliance framework the work falls under.
    #[arg(long)]
    pub compliance: Option<ComplianceFramework>,

    /// Artifacts that already exist (repeatable).
    #[arg(long = "artifact")]
    pub artifacts: Vec<String>,

    /// Architecture decisions already approved (repeatable).
    #[arg(long = "decision")]
    pub decisions: Vec<String>,

    /// Interfaces external consumers depend on (repeatable).
    #[arg(long = "public-interface")]
    pub public_interfaces: Vec<String>,

    #[arg(long)]
    pub multi_team: bool,

    #[arg(long)]
    pub architecture_impact: bool,
}

impl RunArgs {
    pub fn options(&self, config: &Config) -> RunOptions {
        let context = RunContext {
            existing_artifacts: self.artifacts.iter().cloned().collect(),
            approved_decisions: self.decisions.iter().cloned().collect(),
            public_interfaces: self.public_interfaces.iter().cloned().collect(),
            compliance: self.compliance,
            multi_team: self.multi_team,
            architecture_impact: self.architecture_impact,
        };
        RunOptions::new(self.mode.unwrap_or(config.gates.default_mode))
            .skipping(self.skip_gates.iter().cloned())
            .requiring(self.require_gates.iter().cloned())
            .with_context(context)
    }
}

/// Run the `run` subcommand: start a run and drive it as far as it goes.
pub async fn start(
    engine: &Engine,
    config: &Config,
    args: &RunArgs,
    agent_count: usize,
) -> anyhow::Result<()> {
    let mut report = engine
        .orchestrator
        .start_run(&args.workflow, args.options(config))
        .await?;

    if agent_count > 0 && report.stage == StepStage::AwaitingTasks {
        let done = agents::simulate(engine, report.run_id, agent_count).await?;
        println!("{agent_count} simulated agents completed {done} tasks");
        report = engine.orchestrator.status(report.run_id).await?;
    }

    print_report(&report, false)?;
    if report.pending_gate.is_some() {
        println!();
        println!("Respond with: sg respond {} approve|reject", report.run_id);
    }
    Ok(())
}

/// Run the `plan` subcommand: print how every step would be gated.
pub fn plan(engine: &Engine, config: &Config, args: &RunArgs) -> anyhow::Result<()> {
    let options = args.options(config);
    let steps = engine.orchestrator.dry_run(&args.workflow, &options)?;

    println!("{} workflow, {} mode", args.workflow, options.mode);
    println!("{}", "=".repeat(78));
    println!(
        "{:<6} {:<28} {:<13} {:<17} {:>5}  WHY",
        "STEP", "GATE", "RISK", "VERDICT", "CONF"
    );
    println!("{}", "-".repeat(78));

    let mut asks = 0;
    for step in &steps {
        if step.verdict == GateVerdict::RequireApproval {
            asks += 1;
        }
        let lock = if step.compliance_locked { " [locked]" } else { "" };
        println!(
            "{:<6} {:<28} {:<13} {:<17} {:>5.2}  {}{}",
            step.step_id,
            truncate(&step.gate_name, 28),
            step.risk.to_string(),
            step.verdict.to_string(),
            step.confidence,
            reason_label(step.reason),
            lock
        );
    }
    println!("{}", "-".repeat(78));
    println!("{asks} of {} steps would ask for approval", steps.len());
    Ok(())
}

fn reason_label(reason: VerdictReason) -> &'static str {
    match reason {
        VerdictReason::DestructiveFloor => "destructive step",
        VerdictReason::Skipped => "skipped by operator",
        VerdictReason::Required => "required by operator",
        VerdictReason::ComplianceLocked => "compliance locked",
        VerdictReason::GuidedDefault => "guided mode",
        VerdictReason::AutonomousDefault => "autonomous mode",
        VerdictReason::ConfidenceAboveThreshold => "trusted",
        VerdictReason::ConfidenceBelowThreshold => "not yet trusted",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max - 3).collect();
        format!("{cut}...")
    }
}
