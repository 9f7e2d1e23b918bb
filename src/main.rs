//! `bioinfoflow` CLI — a thin harness over the engine library. Not part of
//! the tested core: it parses arguments, wires up a real container runtime,
//! and reports the run's final status.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use bioinfoflow::container::ProcessContainerRuntime;
use bioinfoflow::executor::{ExecuteOptions, WorkflowExecutor};
use bioinfoflow::model::Workflow;

#[derive(Parser)]
#[command(name = "bioinfoflow", version, about = "Run DAGs of containerized workflow steps")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow document.
    Run {
        workflow: PathBuf,
        /// Input override in `name=path` form, may be repeated.
        #[arg(long = "input", value_name = "NAME=PATH")]
        inputs: Vec<String>,
        #[arg(long, default_value_t = 1)]
        max_parallel: usize,
        #[arg(long)]
        no_time_limits: bool,
        #[arg(long, default_value = "1h")]
        default_time_limit: String,
        #[arg(long)]
        base_dir: Option<PathBuf>,
    },
    /// Parse and validate a workflow document without running it.
    Validate { workflow: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { workflow } => {
            let wf = Workflow::from_file(&workflow)
                .with_context(|| format!("failed to parse {}", workflow.display()))?;
            println!("workflow '{}' v{} is valid", wf.name, wf.version);
            Ok(())
        }
        Command::Run {
            workflow,
            inputs,
            max_parallel,
            no_time_limits,
            default_time_limit,
            base_dir,
        } => {
            let wf = Workflow::from_file(&workflow)
                .with_context(|| format!("failed to parse {}", workflow.display()))?;

            let cli_inputs = parse_input_overrides(&inputs)?;
            let base_dir = match base_dir {
                Some(dir) => dir,
                None => wf.config.resolved_base_dir()?,
            };

            let runtime = Arc::new(ProcessContainerRuntime::new());
            let executor = WorkflowExecutor::new(wf, base_dir, runtime)?;
            executor.save_workflow_copy(&workflow).ok();

            let options = ExecuteOptions {
                max_parallel,
                enable_time_limits: !no_time_limits,
                default_time_limit,
                cli_inputs,
            };

            let outcome = executor.execute(options).await?;
            println!("run {} finished: {:?}", outcome.run_id, outcome.status);
            println!("workspace: {}", outcome.dirs.run_dir.display());

            if outcome.status != bioinfoflow::workspace::RunStatus::Completed {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn parse_input_overrides(raw: &[String]) -> Result<HashMap<String, String>> {
    let mut map = HashMap::new();
    for entry in raw {
        let (name, path) = entry
            .split_once('=')
            .with_context(|| format!("invalid --input {entry:?}, expected name=path"))?;
        map.insert(name.to_string(), path.to_string());
    }
    Ok(map)
}
