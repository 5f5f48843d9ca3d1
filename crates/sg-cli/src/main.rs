mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sg_core::config::Config;
use sg_core::types::HumanResponse;
use uuid::Uuid;

use commands::run::RunArgs;

/// stepgate -- drive workflows through risk-aware approval gates.
#[derive(Parser)]
#[command(name = "sg", version, about)]
struct Cli {
    /// Config file (default: ~/.stepgate/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override `general.state_dir`.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Extra workflow definitions (TOML with `[[workflows]]` tables).
    #[arg(long, global = true)]
    workflows: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List runs, or show one run in detail (default when no subcommand is given).
    Status {
        run_id: Option<Uuid>,
        /// Print the report as JSON.
        #[arg(long)]
        json: bool,
        /// Print this invocation's metrics in Prometheus text format.
        #[arg(long)]
        metrics: bool,
    },

    /// Start a workflow run.
    Run {
        #[command(flatten)]
        args: RunArgs,
        /// Simulate this many agents working any fan-out tasks.
        #[arg(long, default_value_t = 0)]
        agents: usize,
    },

    /// Show how each step would be gated without starting a run.
    Plan {
        #[command(flatten)]
        args: RunArgs,
    },

    /// Approve or reject a run's pending gate.
    Respond {
        /// Run id, or the gate instance id from a notification.
        run_id: Uuid,
        /// `approve` or `reject`.
        response: HumanResponse,
        /// Simulate this many agents working any fan-out tasks.
        #[arg(long, default_value_t = 0)]
        agents: usize,
    },

    /// Abort a run.
    Abort {
        run_id: Uuid,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },

    /// Push a blocked run past its current step.
    Force {
        run_id: Uuid,
        #[arg(short, long)]
        note: String,
    },

    /// Ask again for approval on a rejected step.
    Reopen { run_id: Uuid },

    /// Re-generate the current step after a content failure.
    Retry { run_id: Uuid },

    /// Close a conflict by hand.
    Resolve {
        run_id: Uuid,
        conflict_id: Uuid,
        #[arg(short, long)]
        note: String,
    },

    /// Acknowledge an escalation, stopping its SLA clock.
    Ack { run_id: Uuid, escalation_id: Uuid },

    /// Apply elapsed gate deadlines, escalation SLAs and task leases.
    Tick,

    /// List known workflow definitions.
    Workflows {
        /// Show every step.
        #[arg(short, long)]
        verbose: bool,
    },

    /// Write the default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load config")?;

    if cli.json_logs {
        sg_telemetry::logging::init_logging_json("sg", &config.general.log_level);
    } else {
        sg_telemetry::logging::init_logging("sg", &config.general.log_level);
    }

    if let Some(Commands::InitConfig { force }) = &cli.command {
        let path = cli.config.clone().unwrap_or_else(Config::default_path);
        return commands::init_config::run(&path, *force);
    }

    let state_dir = cli
        .state_dir
        .clone()
        .unwrap_or_else(|| config.general.state_path());
    let engine = commands::Engine::open(&config, &state_dir, cli.workflows.as_deref()).await?;

    match cli.command {
        None => commands::status::run(&engine, None, false, false).await?,
        Some(Commands::Status {
            run_id,
            json,
            metrics,
        }) => commands::status::run(&engine, run_id, json, metrics).await?,
        Some(Commands::Run { args, agents }) => {
            commands::run::start(&engine, &config, &args, agents).await?
        }
        Some(Commands::Plan { args }) => commands::run::plan(&engine, &config, &args)?,
        Some(Commands::Respond {
            run_id,
            response,
            agents,
        }) => commands::control::respond(&engine, run_id, response, agents).await?,
        Some(Commands::Abort { run_id, reason }) => {
            commands::control::abort(&engine, run_id, &reason).await?
        }
        Some(Commands::Force { run_id, note }) => {
            commands::control::force(&engine, run_id, &note).await?
        }
        Some(Commands::Reopen { run_id }) => commands::control::reopen(&engine, run_id).await?,
        Some(Commands::Retry { run_id }) => commands::control::retry(&engine, run_id).await?,
        Some(Commands::Resolve {
            run_id,
            conflict_id,
            note,
        }) => commands::control::resolve(&engine, run_id, conflict_id, &note).await?,
        Some(Commands::Ack {
            run_id,
            escalation_id,
        }) => commands::control::acknowledge(&engine, run_id, escalation_id).await?,
        Some(Commands::Tick) => commands::control::tick(&engine).await?,
        Some(Commands::Workflows { verbose }) => commands::workflows::run(&engine, verbose),
        Some(Commands::InitConfig { .. }) => {}
    }

    Ok(())
}
