//! Drives a single workflow run: sets up the workspace, stages inputs,
//! dispatches steps in dependency order (sequentially or with a bounded
//! worker pool), and journals state transitions as they happen.

use std::collections::HashMap as StdHashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use indexmap::IndexMap;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::container::{ContainerRuntime, EXIT_CODE_TIME_LIMIT};
use crate::error::{Error, Result};
use crate::io_manager::{InputManager, OutputManager};
use crate::model::Workflow;
use crate::path_resolver::PathResolver;
use crate::scheduler::Scheduler;
use crate::workspace::{generate_run_id, RunDirs, RunStatus, StatusJournal, StepOutputs, StepState, StepStatus};

/// Run-wide options, independent of any single step's declared resources.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub max_parallel: usize,
    pub enable_time_limits: bool,
    pub default_time_limit: String,
    pub cli_inputs: StdHashMap<String, String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            enable_time_limits: true,
            default_time_limit: "1h".to_string(),
            cli_inputs: StdHashMap::new(),
        }
    }
}

pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub dirs: RunDirs,
    pub states: IndexMap<String, StepState>,
}

/// Coordinates one execution of a [`Workflow`] against a [`ContainerRuntime`].
pub struct WorkflowExecutor {
    workflow: Workflow,
    runtime: Arc<dyn ContainerRuntime>,
    dirs: RunDirs,
    run_id: String,
    context: Arc<Mutex<PathResolver>>,
    journal: Arc<StatusJournal>,
    states: Arc<Mutex<IndexMap<String, StepState>>>,
    input_manager: Arc<Mutex<InputManager>>,
    output_manager: Arc<OutputManager>,
}

impl WorkflowExecutor {
    pub fn new(workflow: Workflow, base_dir: PathBuf, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let run_id = generate_run_id();
        let runs_dir = workflow.config.runs_dir(&base_dir);
        let dirs = RunDirs::new(&runs_dir, &workflow.name, &workflow.version, &run_id);
        dirs.create_all()?;

        let refs_dir = workflow.config.refs_dir(&base_dir);

        let context = json!({
            "run_dir": dirs.run_dir.to_string_lossy(),
            "config": {
                "base_dir": base_dir.to_string_lossy(),
                "refs": refs_dir.to_string_lossy(),
            },
            "resources": {},
            "steps": {},
        });

        let inputs_config: StdHashMap<String, String> = workflow
            .inputs
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect();
        let input_manager = InputManager::new(inputs_config, dirs.inputs_dir.clone())?;
        let output_manager = OutputManager::new(dirs.outputs_dir.clone(), dirs.tmp_dir.clone())?;

        let initial_states: IndexMap<String, StepState> = workflow
            .steps
            .keys()
            .map(|name| (name.clone(), StepState::pending()))
            .collect();

        let journal = StatusJournal::new(dirs.run_dir.clone());

        Ok(Self {
            run_id,
            journal: Arc::new(journal),
            context: Arc::new(Mutex::new(PathResolver::new(context))),
            states: Arc::new(Mutex::new(initial_states)),
            input_manager: Arc::new(Mutex::new(input_manager)),
            output_manager: Arc::new(output_manager),
            dirs,
            workflow,
            runtime,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dirs(&self) -> &RunDirs {
        &self.dirs
    }

    /// Persist a copy of the workflow document next to the run's journal.
    pub fn save_workflow_copy(&self, source_yaml_path: &std::path::Path) -> Result<()> {
        std::fs::copy(source_yaml_path, self.dirs.workflow_copy_path())?;
        Ok(())
    }

    pub async fn execute(&self, options: ExecuteOptions) -> Result<RunOutcome> {
        tracing::info!(
            "starting execution of workflow '{}' v{} (run_id={})",
            self.workflow.name,
            self.workflow.version,
            self.run_id
        );

        {
            let resolved_inputs = self
                .input_manager
                .lock()
                .await
                .process_inputs(&options.cli_inputs)?;
            let mut ctx = self.context.lock().await;
            ctx.update_context(json!({ "inputs": resolved_inputs }));
        }

        self.input_manager.lock().await.validate_inputs()?;

        self.journal.write(&*self.states.lock().await).await?;

        if options.max_parallel <= 1 {
            self.execute_sequential(&options).await?;
        } else {
            self.execute_parallel(&options).await?;
        }

        let states = self.states.lock().await.clone();
        let status = RunStatus::aggregate(&states);
        if status == RunStatus::Completed {
            self.output_manager.cleanup_temp_files()?;
        }
        self.journal.write(&states).await?;

        tracing::info!("workflow '{}' finished with status {:?}", self.workflow.name, status);

        Ok(RunOutcome {
            run_id: self.run_id.clone(),
            status,
            dirs: self.dirs.clone(),
            states,
        })
    }

    async fn execute_sequential(&self, options: &ExecuteOptions) -> Result<()> {
        let order = self.workflow.execution_order()?;
        tracing::info!("sequential execution order: {}", order.join(", "));

        for step_name in order {
            let ok = self.execute_step(&step_name, options).await?;
            if !ok {
                tracing::error!("step '{}' failed, aborting workflow", step_name);
                break;
            }
        }
        Ok(())
    }

    /// Cooperative worker pool bounded by `max_parallel`: dispatches every
    /// ready step, and on any failure stops dispatching *new* work but still
    /// awaits the steps already in flight so their states and logs land
    /// deterministically before the run is marked failed.
    async fn execute_parallel(&self, options: &ExecuteOptions) -> Result<()> {
        let dependencies = self.workflow.dependencies();
        let scheduler = Scheduler::new(&dependencies);

        let mut completed: HashSet<String> = HashSet::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut failed = false;
        let mut join_set: JoinSet<(String, Result<bool>)> = JoinSet::new();

        loop {
            if !failed {
                let ready = scheduler.ready(&completed);
                for step_name in ready {
                    if dispatched.contains(&step_name) {
                        continue;
                    }
                    if join_set.len() >= options.max_parallel {
                        break;
                    }
                    dispatched.insert(step_name.clone());
                    let this = self.clone_handles();
                    let opts = options.clone();
                    let name = step_name.clone();
                    join_set.spawn(async move {
                        let result = this.execute_step(&name, &opts).await;
                        (name, result)
                    });
                }
            }

            if join_set.is_empty() {
                if scheduler.is_complete(&completed) || failed {
                    break;
                }
                if dispatched.len() == completed.len() {
                    // Nothing in flight and nothing ready: would only happen
                    // with a cycle, which Workflow::validate already rejects.
                    return Err(Error::Internal(
                        "no steps ready but workflow incomplete".to_string(),
                    ));
                }
                continue;
            }

            if let Some(joined) = join_set.join_next().await {
                let (step_name, result) = joined.map_err(|e| Error::Internal(e.to_string()))?;
                match result {
                    Ok(true) => {
                        completed.insert(step_name);
                    }
                    Ok(false) => {
                        tracing::error!("step '{}' failed", step_name);
                        failed = true;
                    }
                    Err(e) => {
                        tracing::error!("step '{}' errored: {}", step_name, e);
                        failed = true;
                    }
                }
            }

            if failed && join_set.is_empty() {
                break;
            }
        }

        Ok(())
    }

    /// A lightweight clone of the shared state needed to run one step
    /// concurrently with its siblings.
    fn clone_handles(&self) -> StepRunner {
        StepRunner {
            workflow_steps: self.workflow.steps.clone(),
            runtime: Arc::clone(&self.runtime),
            dirs: self.dirs.clone(),
            context: Arc::clone(&self.context),
            journal: Arc::clone(&self.journal),
            states: Arc::clone(&self.states),
            output_manager: Arc::clone(&self.output_manager),
        }
    }

    async fn execute_step(&self, step_name: &str, options: &ExecuteOptions) -> Result<bool> {
        self.clone_handles().execute_step(step_name, options).await
    }
}

/// The subset of executor state a single step needs; cheap to clone (every
/// field is an `Arc`) so each worker-pool task gets its own handle.
#[derive(Clone)]
struct StepRunner {
    workflow_steps: IndexMap<String, crate::model::Step>,
    runtime: Arc<dyn ContainerRuntime>,
    dirs: RunDirs,
    context: Arc<Mutex<PathResolver>>,
    journal: Arc<StatusJournal>,
    states: Arc<Mutex<IndexMap<String, StepState>>>,
    output_manager: Arc<OutputManager>,
}

impl StepRunner {
    async fn execute_step(&self, step_name: &str, options: &ExecuteOptions) -> Result<bool> {
        let step = self
            .workflow_steps
            .get(step_name)
            .ok_or_else(|| Error::NotFound(format!("step '{step_name}'")))?
            .clone();

        tracing::info!("executing step '{}'", step_name);
        self.mark_running(step_name).await?;

        let resolved_command = {
            let mut ctx = self.context.lock().await;
            ctx.update_context(json!({
                "resources": step.resources,
                "step": { "name": step_name },
            }));
            ctx.resolve_variables(&step.command)
        };

        if let Err(e) = self.runtime.ensure_available(&step.container).await {
            self.mark_error(step_name, &e.to_string()).await?;
            return Ok(false);
        }

        let mut resources = step.resources.clone();
        if options.enable_time_limits {
            if resources.time_limit.is_none() {
                resources.time_limit = Some(options.default_time_limit.clone());
                tracing::info!(
                    "using default time limit for step '{}': {}",
                    step_name,
                    options.default_time_limit
                );
            }
        } else if resources.time_limit.is_some() {
            tracing::info!("time limits disabled, ignoring time limit for step '{}'", step_name);
            resources.time_limit = None;
        }

        self.output_manager.prepare_step_output(step_name)?;
        let log_file = self.dirs.logs_dir.join(format!("{step_name}.log"));

        let start = Utc::now();
        let exit_code = self
            .runtime
            .run(&step.container, &resolved_command, &resources, &self.dirs.run_dir, &log_file)
            .await;
        let end = Utc::now();
        let duration = (end - start).num_milliseconds() as f64 / 1000.0;

        let exit_code = match exit_code {
            Ok(code) => code,
            Err(e) => {
                self.mark_error(step_name, &e.to_string()).await?;
                return Ok(false);
            }
        };

        let outputs = self.output_manager.get_step_outputs(step_name);
        let outputs_json: Vec<String> = outputs.iter().map(|p| p.to_string_lossy().into_owned()).collect();

        let (status, success) = match exit_code {
            0 => (StepStatus::Completed, true),
            EXIT_CODE_TIME_LIMIT => (StepStatus::TerminatedTimeLimit, false),
            _ => (StepStatus::Failed, false),
        };

        {
            let mut states = self.states.lock().await;
            let state = states.get_mut(step_name).expect("step present in states");
            state.status = status;
            state.start_time = Some(start);
            state.end_time = Some(end);
            state.duration = Some(duration);
            state.exit_code = Some(exit_code);
            state.log_file = Some(log_file.to_string_lossy().into_owned());
            state.outputs = Some(StepOutputs { files: outputs_json.clone() });
            if status == StepStatus::TerminatedTimeLimit {
                state.time_limit = resources.time_limit.clone();
            }
            self.journal.write(&states).await?;
        }

        if success {
            let mut ctx = self.context.lock().await;
            ctx.update_context(json!({
                "steps": { step_name: { "outputs": { "files": outputs_json } } }
            }));
        } else if status == StepStatus::TerminatedTimeLimit {
            tracing::warn!(
                "step '{}' was terminated after {:.2} seconds due to time limit",
                step_name,
                duration
            );
        } else {
            tracing::error!("step '{}' failed with exit code {}", step_name, exit_code);
        }

        Ok(success)
    }

    async fn mark_running(&self, step_name: &str) -> Result<()> {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(step_name) {
            state.status = StepStatus::Running;
            state.start_time = Some(Utc::now());
        }
        self.journal.write(&states).await
    }

    async fn mark_error(&self, step_name: &str, message: &str) -> Result<()> {
        tracing::error!("error executing step '{}': {}", step_name, message);
        let mut states = self.states.lock().await;
        if let Some(state) = states.get_mut(step_name) {
            state.status = StepStatus::Error;
            state.error = Some(message.to_string());
            state.end_time = Some(Utc::now());
        }
        self.journal.write(&states).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::mock::MockContainerRuntime;

    fn workflow(yaml: &str) -> Workflow {
        Workflow::from_yaml_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn linear_three_step_workflow_completes() {
        let yaml = r#"
name: linear
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo a"
  b:
    container: "alpine"
    command: "echo b"
    after: ["a"]
  c:
    container: "alpine"
    command: "echo c"
    after: ["b"]
"#;
        let wf = workflow(yaml);
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockContainerRuntime::new().with_image_present("alpine"));
        runtime.expect_run("alpine").returns_exit_code(0).times(3).finish();

        let executor = WorkflowExecutor::new(wf, base.path().to_path_buf(), runtime).unwrap();
        let outcome = executor.execute(ExecuteOptions::default()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        for state in outcome.states.values() {
            assert_eq!(state.exit_code, Some(0));
        }
    }

    #[tokio::test]
    async fn failure_halts_dispatch_of_dependents() {
        let yaml = r#"
name: halting
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo a"
  b:
    container: "alpine"
    command: "false"
    after: ["a"]
  c:
    container: "alpine"
    command: "echo c"
    after: ["b"]
"#;
        let wf = workflow(yaml);
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockContainerRuntime::new().with_image_present("alpine"));
        runtime.expect_run("alpine").returns_exit_code(0).times(1).finish();
        runtime.expect_run("alpine").returns_exit_code(1).times(1).finish();

        let executor = WorkflowExecutor::new(wf, base.path().to_path_buf(), runtime).unwrap();
        let outcome = executor.execute(ExecuteOptions::default()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.states["a"].status, StepStatus::Completed);
        assert_eq!(outcome.states["b"].status, StepStatus::Failed);
        assert_eq!(outcome.states["c"].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn timeout_step_reports_terminated_time_limit() {
        let yaml = r#"
name: timeout
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "sleep 60"
    resources:
      time_limit: "2s"
"#;
        let wf = workflow(yaml);
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockContainerRuntime::new().with_image_present("alpine"));
        runtime
            .expect_run("alpine")
            .returns_exit_code(EXIT_CODE_TIME_LIMIT)
            .finish();

        let executor = WorkflowExecutor::new(wf, base.path().to_path_buf(), runtime).unwrap();
        let outcome = executor.execute(ExecuteOptions::default()).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.states["a"].status, StepStatus::TerminatedTimeLimit);
        assert_eq!(outcome.states["a"].exit_code, Some(EXIT_CODE_TIME_LIMIT));
    }

    #[tokio::test]
    async fn diamond_workflow_with_parallel_dispatch_completes() {
        let yaml = r#"
name: diamond
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "echo a"
  b:
    container: "alpine"
    command: "echo b"
    after: ["a"]
  c:
    container: "alpine"
    command: "echo c"
    after: ["a"]
  d:
    container: "alpine"
    command: "echo d"
    after: ["b", "c"]
"#;
        let wf = workflow(yaml);
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockContainerRuntime::new().with_image_present("alpine"));
        runtime.expect_run("alpine").returns_exit_code(0).times(4).finish();

        let executor = WorkflowExecutor::new(wf, base.path().to_path_buf(), runtime).unwrap();
        let mut options = ExecuteOptions::default();
        options.max_parallel = 2;
        let outcome = executor.execute(options).await.unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn default_time_limit_applies_when_step_has_none() {
        let yaml = r#"
name: defaulted
version: 1.0.0
steps:
  a:
    container: "alpine"
    command: "sleep 5"
"#;
        let wf = workflow(yaml);
        let base = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockContainerRuntime::new().with_image_present("alpine"));
        runtime
            .expect_run("alpine")
            .returns_exit_code(EXIT_CODE_TIME_LIMIT)
            .finish();

        let executor = WorkflowExecutor::new(wf, base.path().to_path_buf(), runtime).unwrap();
        let mut options = ExecuteOptions::default();
        options.default_time_limit = "500ms".to_string();
        let outcome = executor.execute(options).await.unwrap();
        assert_eq!(outcome.states["a"].status, StepStatus::TerminatedTimeLimit);
    }
}
