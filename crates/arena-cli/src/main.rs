//! `arena` command-line entry point.
//!
//! Provisions the target named by each task, resets it, optionally applies a
//! file of canonical actions, evaluates, and releases the target. Ctrl-C
//! interrupts the current task and still releases its target.
//!
//! Configuration comes from the environment; see `RuntimeConfig::from_env`.

use anyhow::Context;
use arena_core::{
    action, CanonicalAdapter, Environment, RunId, RuntimeConfig, Task, Tracer,
};
use arena_target::RoutingProvisioner;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "arena", version, about = "Run tasks against arena environments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Provision, reset, evaluate and release the targets of a task file.
    Run {
        /// Task file: one task object or an array of tasks
        task_file: PathBuf,
        /// JSON array of canonical actions applied as one step after reset
        #[arg(long)]
        actions: Option<PathBuf>,
    },
    /// Check a JSON array of canonical actions without provisioning anything.
    Validate {
        /// Actions file
        actions: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries results
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("arena=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { task_file, actions } => run(&task_file, actions.as_deref()).await,
        Commands::Validate { actions } => validate(&actions),
    }
}

fn load_actions(path: &Path) -> anyhow::Result<Vec<Value>> {
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("reading actions from {}", path.display()))?;
    serde_json::from_str(&body).with_context(|| format!("{} is not a JSON array", path.display()))
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let actions = load_actions(path)?;
    let mut invalid = 0;
    for (index, raw) in actions.iter().enumerate() {
        match action::validate(raw) {
            Ok(action) => println!("{index}: ok ({})", action.tag()),
            Err(e) => {
                invalid += 1;
                println!("{index}: {e}");
            }
        }
    }
    if invalid > 0 {
        anyhow::bail!("{invalid} of {} actions are invalid", actions.len());
    }
    Ok(())
}

async fn run(task_file: &Path, actions_file: Option<&Path>) -> anyhow::Result<()> {
    let tasks = Task::load_all(task_file)
        .with_context(|| format!("loading tasks from {}", task_file.display()))?;
    let actions = actions_file.map(load_actions).transpose()?;

    let config = RuntimeConfig::from_env();
    tracing::info!(
        remote = config.provisioner.remote.is_some(),
        ingest = config.tracer.ingest_url.is_some(),
        agent_resolution = ?config.agent_resolution,
        "Configuration loaded"
    );
    config.validate()?;

    let provisioner = Arc::new(RoutingProvisioner::from_config(config.provisioner.clone())?);
    let tracer = Tracer::from_config(&config.tracer)?;
    let run_id = RunId::new();
    let adapter = Arc::new(match config.agent_resolution {
        Some(resolution) => CanonicalAdapter::with_resolution(resolution),
        None => CanonicalAdapter::new(),
    });
    tracing::info!(run_id = %run_id, tasks = tasks.len(), "Starting run");

    for (index, task) in tasks.into_iter().enumerate() {
        let prompt = task.prompt.clone();
        let mut env = match Environment::builder(task, Arc::clone(&adapter))
            .provisioner(provisioner.clone())
            .tracer(tracer.clone(), run_id.clone())
            .connect_timeout(config.connect_timeout)
            .create()
            .await
        {
            Ok(env) => env,
            Err(e) => {
                tracing::error!(index, error = %e, "Environment creation failed");
                println!("{}", json!({"index": index, "prompt": prompt, "error": e.to_string()}));
                continue;
            }
        };

        let outcome = tokio::select! {
            result = smoke(&mut env, actions.as_deref()) => Some(result),
            _ = signal::ctrl_c() => None,
        };

        if let Err(e) = env.close().await {
            tracing::error!(index, error = %e, "Failed to release target");
        }

        match outcome {
            Some(Ok(summary)) => println!("{}", json!({"index": index, "prompt": prompt, "result": summary})),
            Some(Err(e)) => {
                println!("{}", json!({"index": index, "prompt": prompt, "error": e.to_string()}));
            }
            None => {
                tracing::info!("Interrupted, target released");
                return Ok(());
            }
        }
    }

    tracing::info!(run_id = %run_id, status = ?tracer.status(&run_id), "Run complete");
    Ok(())
}

async fn smoke(env: &mut Environment<CanonicalAdapter>, actions: Option<&[Value]>) -> arena_core::Result<Value> {
    let observation = env.reset().await?;
    let mut summary = json!({
        "env_id": env.id().to_string(),
        "reset": observation.summary(),
    });

    if let Some(actions) = actions {
        let step = env.step(Some(actions)).await?;
        summary["step"] = json!({
            "reward": step.reward,
            "terminated": step.terminated,
            "info": step.info,
            "observation": step.observation.summary(),
        });
    }

    summary["score"] = json!(env.evaluate(None).await?);
    Ok(summary)
}
