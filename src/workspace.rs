//! Per-run workspace: directory layout, run-id generation, and the atomic
//! status journal (`step_status.json` + `status.txt`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// The seven states in the workflow's status vocabulary. `RUNNING` and
/// `PENDING` are transient; the rest are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "TERMINATED_TIME_LIMIT")]
    TerminatedTimeLimit,
    #[serde(rename = "SKIPPED")]
    Skipped,
    #[serde(rename = "ERROR")]
    Error,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StepStatus::Failed | StepStatus::TerminatedTimeLimit | StepStatus::Error
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// The one-word, lowercase line written to `status.txt`.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    /// `FAILED` once any step is in a failure state; `COMPLETED` once every
    /// step is terminal and none failed; otherwise `RUNNING`.
    pub fn aggregate(states: &IndexMap<String, StepState>) -> RunStatus {
        if states.values().any(|s| s.status.is_failure()) {
            return RunStatus::Failed;
        }
        if states.values().all(|s| s.status.is_terminal()) {
            return RunStatus::Completed;
        }
        RunStatus::Running
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutputs {
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<StepOutputs>,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration: None,
            exit_code: None,
            error: None,
            time_limit: None,
            log_file: None,
            outputs: None,
        }
    }
}

/// The directory tree materialized for one run.
#[derive(Debug, Clone)]
pub struct RunDirs {
    pub run_dir: PathBuf,
    pub inputs_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

impl RunDirs {
    pub fn new(base_runs_dir: &Path, workflow_name: &str, version: &str, run_id: &str) -> Self {
        let run_dir = base_runs_dir.join(workflow_name).join(version).join(run_id);
        Self {
            inputs_dir: run_dir.join("inputs"),
            outputs_dir: run_dir.join("outputs"),
            logs_dir: run_dir.join("logs"),
            tmp_dir: run_dir.join("tmp"),
            run_dir,
        }
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [
            &self.run_dir,
            &self.inputs_dir,
            &self.outputs_dir,
            &self.logs_dir,
            &self.tmp_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn status_txt_path(&self) -> PathBuf {
        self.run_dir.join("status.txt")
    }

    pub fn step_status_json_path(&self) -> PathBuf {
        self.run_dir.join("step_status.json")
    }

    pub fn workflow_copy_path(&self) -> PathBuf {
        self.run_dir.join("workflow.yaml")
    }
}

/// `YYYYMMDD_HHMMSS_<8-hex>`. The reference implementation's docstring calls
/// the suffix "64 random bits" but its own code only ever draws 8 hex
/// characters (32 bits) from a UUID; the concrete `<8-hex>` grammar is what
/// this crate implements.
pub fn generate_run_id() -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix: u32 = rand::random();
    format!("{timestamp}_{suffix:08x}")
}

/// Writes `step_status.json` and `status.txt` atomically: serialize to a
/// buffer, write a temp file in the target directory, then rename into
/// place so a reader never observes a partially-written journal.
pub struct StatusJournal {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StatusJournal {
    pub fn new(run_dir: PathBuf) -> Self {
        Self {
            dir: run_dir,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn write(&self, states: &IndexMap<String, StepState>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let status = RunStatus::aggregate(states);

        let json = serde_json::to_vec_pretty(states)?;
        atomic_write(&self.dir.join("step_status.json"), &json)?;

        let mut txt = status.as_str().as_bytes().to_vec();
        txt.push(b'\n');
        atomic_write(&self.dir.join("status.txt"), &txt)?;

        Ok(())
    }

    pub fn read(&self) -> Result<HashMap<String, StepState>> {
        let path = self.dir.join("step_status.json");
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(contents)?;
    tmp.persist(path)
        .map_err(|e| crate::error::Error::Io(e.error))?;
    Ok(())
}
