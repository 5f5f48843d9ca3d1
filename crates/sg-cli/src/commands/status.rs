use sg_core::types::RunId;
use sg_engine::manifest::{ManifestStore, RunManifest};
use sg_engine::orchestrator::OrchestratorError;
use sg_telemetry::metrics::global_metrics;

use super::{print_report, stage_label, Engine};

/// Run the `status` subcommand: list every stored run, or show one in detail.
pub async fn run(
    engine: &Engine,
    run_id: Option<RunId>,
    json: bool,
    metrics: bool,
) -> anyhow::Result<()> {
    match run_id {
        Some(id) => show(engine, id, json).await?,
        None => list(engine, json).await?,
    }
    if metrics {
        println!();
        if json {
            println!(
                "{}",
                serde_json::to_string_pretty(&global_metrics().export_json())?
            );
        } else {
            print!("{}", global_metrics().export_prometheus());
        }
    }
    Ok(())
}

async fn list(engine: &Engine, json: bool) -> anyhow::Result<()> {
    let manifests = engine.store.list().await?;
    if json {
        let rows: Vec<serde_json::Value> = manifests.iter().map(summary_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if manifests.is_empty() {
        println!("No runs yet. Start one with: sg run <workflow>");
        return Ok(());
    }

    println!(
        "{:<36}  {:<11} {:<10} {:<15} {:>5}  STAGE",
        "RUN", "WORKFLOW", "MODE", "STATUS", "DONE"
    );
    println!("{}", "-".repeat(100));
    for m in &manifests {
        println!(
            "{:<36}  {:<11} {:<10} {:<15} {:>5}  {}",
            m.run_id,
            m.workflow_type,
            m.options.mode.to_string(),
            m.status().to_string(),
            m.completed_steps.len(),
            stage_label(&m.stage)
        );
    }
    Ok(())
}

async fn show(engine: &Engine, run_id: RunId, json: bool) -> anyhow::Result<()> {
    match engine.orchestrator.status(run_id).await {
        Ok(report) => print_report(&report, json),
        // Finished runs are not loaded into the engine; read them from disk.
        Err(OrchestratorError::UnknownRun(_)) => {
            let Some(manifest) = engine.store.load(run_id).await? else {
                anyhow::bail!("no run with id {run_id}");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            } else {
                print_finished(&manifest);
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_finished(m: &RunManifest) {
    println!(
        "run {}  ({}, {})  {}",
        m.run_id, m.workflow_type, m.options.mode, m.status()
    );
    println!("{}", "-".repeat(60));
    println!("Completed:   {}", m.completed_steps.join(", "));
    println!("Approvals:   {}", m.approvals.len());
    println!("Artifacts:   {}", m.accumulated.len());
    println!("Started:     {}", m.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Updated:     {}", m.updated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    for record in &m.approvals {
        println!(
            "  #{:<3} {:<28} {:<18} {}ms",
            record.seq,
            record.gate.to_string(),
            record.decision.to_string(),
            record.latency_ms
        );
    }
}

fn summary_json(m: &RunManifest) -> serde_json::Value {
    serde_json::json!({
        "run_id": m.run_id,
        "workflow_type": m.workflow_type,
        "mode": m.options.mode,
        "status": m.status(),
        "completed_steps": m.completed_steps,
        "updated_at": m.updated_at,
    })
}
