use sg_core::context::RunContext;
use sg_engine::risk;

use super::Engine;

/// Run the `workflows` subcommand.
pub fn run(engine: &Engine, verbose: bool) {
    let catalog = engine.orchestrator.catalog();
    let baseline = RunContext::default();

    for name in catalog.names() {
        let Ok(def) = catalog.get(name) else {
            continue;
        };
        println!(
            "{:<12} {:>2} phases {:>3} steps  {}",
            def.workflow_type,
            def.phases.len(),
            def.step_count(),
            def.description
        );
        if !verbose {
            continue;
        }
        for phase in &def.phases {
            println!("  {}. {}", phase.position, phase.name);
            for step in &phase.steps {
                let mut flags = Vec::new();
                if step.fans_out {
                    flags.push("fan-out");
                }
                if step.compliance_impact {
                    flags.push("compliance");
                }
                println!(
                    "     {:<5} {:<30} {:<12} {}",
                    step.id,
                    step.gate_name,
                    risk::classify(step, &baseline).to_string(),
                    flags.join(",")
                );
            }
        }
        println!();
    }
}
