use sg_core::types::{ConflictId, EscalationId, HumanResponse, RunId};
use sg_engine::orchestrator::OrchestratorError;
use sg_engine::run_state::StepStage;
use uuid::Uuid;

use super::{agents, print_report, Engine};

/// Run the `respond` subcommand: decide the pending gate, then keep going.
/// `id` is a run id or the gate instance id from a notification.
pub async fn respond(
    engine: &Engine,
    id: Uuid,
    response: HumanResponse,
    agent_count: usize,
) -> anyhow::Result<()> {
    let mut report = match engine.orchestrator.respond_to_gate(id, response).await {
        Err(OrchestratorError::UnknownRun(_)) => {
            engine
                .orchestrator
                .respond_to_gate_instance(id, response)
                .await?
        }
        other => other?,
    };
    let run_id = report.run_id;
    if agent_count > 0 && report.stage == StepStage::AwaitingTasks {
        let done = agents::simulate(engine, run_id, agent_count).await?;
        println!("{agent_count} simulated agents completed {done} tasks");
        report = engine.orchestrator.status(run_id).await?;
    }
    print_report(&report, false)
}

pub async fn abort(engine: &Engine, run_id: RunId, reason: &str) -> anyhow::Result<()> {
    let report = engine.orchestrator.abort(run_id, reason).await?;
    println!("Run {run_id} aborted: {reason}");
    print_report(&report, false)
}

pub async fn force(engine: &Engine, run_id: RunId, note: &str) -> anyhow::Result<()> {
    let report = engine.orchestrator.force_progress(run_id, note).await?;
    print_report(&report, false)
}

pub async fn reopen(engine: &Engine, run_id: RunId) -> anyhow::Result<()> {
    let report = engine.orchestrator.reopen_gate(run_id).await?;
    print_report(&report, false)
}

pub async fn retry(engine: &Engine, run_id: RunId) -> anyhow::Result<()> {
    let report = engine.orchestrator.retry_step(run_id).await?;
    print_report(&report, false)
}

pub async fn resolve(
    engine: &Engine,
    run_id: RunId,
    conflict_id: ConflictId,
    note: &str,
) -> anyhow::Result<()> {
    let report = engine
        .orchestrator
        .resolve_conflict(run_id, conflict_id, note)
        .await?;
    print_report(&report, false)
}

pub async fn acknowledge(
    engine: &Engine,
    run_id: RunId,
    escalation_id: EscalationId,
) -> anyhow::Result<()> {
    let escalation = engine
        .orchestrator
        .acknowledge_escalation(run_id, escalation_id)
        .await?;
    println!(
        "Escalation {} acknowledged by {} ({})",
        escalation.id, escalation.recipient, escalation.trigger
    );
    Ok(())
}

/// Run the `tick` subcommand: apply every deadline that elapsed while no
/// process was running.
pub async fn tick(engine: &Engine) -> anyhow::Result<()> {
    let summary = engine.orchestrator.tick().await?;
    println!(
        "{} gates timed out, {} escalations re-raised, {} defaults applied, {} leases expired",
        summary.gates_timed_out,
        summary.escalations_reraised,
        summary.defaults_applied,
        summary.leases_expired
    );
    if summary.failed_runs > 0 {
        println!("{} runs failed to tick; see the log", summary.failed_runs);
    }
    Ok(())
}
