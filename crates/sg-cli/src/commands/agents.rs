use std::collections::BTreeSet;

use sg_core::types::{Artifact, RunId};
use sg_engine::coordinator::{ClaimOutcome, ClaimRequest};

use super::Engine;

/// Simulate `count` agents working a run's fan-out tasks.
///
/// Each round every agent asks for one available task; when more agents than
/// tasks ask, the coordinator's arbitration decides. Returns the number of
/// tasks completed. Stops when a round grants nothing, which happens once the
/// run moves on to a gate or blocks on a conflict.
pub async fn simulate(engine: &Engine, run_id: RunId, count: usize) -> anyhow::Result<usize> {
    let orchestrator = &engine.orchestrator;
    let coordinator = orchestrator.coordinator(run_id)?;

    let capabilities: BTreeSet<String> = coordinator
        .snapshot()
        .await
        .tasks
        .iter()
        .flat_map(|t| t.spec.capabilities.iter().cloned())
        .collect();
    let names: Vec<String> = (1..=count).map(|i| format!("agent-{i}")).collect();
    for name in &names {
        orchestrator
            .register_agent(run_id, name, capabilities.iter().cloned())
            .await?;
    }

    let mut completed = 0;
    loop {
        let available = coordinator.available_tasks().await;
        if available.is_empty() {
            break;
        }
        let requests: Vec<ClaimRequest> = names
            .iter()
            .enumerate()
            .map(|(i, name)| ClaimRequest::new(name.as_str(), available[i % available.len()].as_str()))
            .collect();

        let results = orchestrator.claim_batch(run_id, requests).await?;
        let grants: Vec<_> = results
            .into_iter()
            .filter_map(|(_, outcome)| match outcome {
                ClaimOutcome::Granted(grant) => Some(grant),
                ClaimOutcome::Rejected(_) => None,
            })
            .collect();
        if grants.is_empty() {
            break;
        }

        for grant in grants {
            let artifact = Artifact::new(
                format!("{}.out", grant.task),
                format!("{} completed by {}", grant.task, grant.agent),
            );
            orchestrator
                .complete_task(run_id, &grant.agent, &grant.task, vec![artifact])
                .await?;
            tracing::debug!(task = %grant.task, agent = %grant.agent, "simulated task done");
            completed += 1;
        }
    }
    Ok(completed)
}
