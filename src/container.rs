//! The container runtime adapter: a trait abstracting image lookup/pull/run
//! over a container engine binary (`docker` by default), a process-backed
//! implementation, and a recording mock for tests that need no engine at
//! all.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::model::Resources;

/// Sentinel exit code used for a step that was killed after exceeding its
/// time limit, distinct from any ordinary command failure.
pub const EXIT_CODE_TIME_LIMIT: i32 = 124;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn pull(&self, image: &str) -> Result<()>;

    async fn ensure_available(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        self.pull(image).await
    }

    /// Run `command` inside `image`, with `run_dir` mounted at `/data` and
    /// the container's working directory set to `/data`. stdout/stderr are
    /// appended to `log_file`. Returns the container's exit code, or
    /// [`EXIT_CODE_TIME_LIMIT`] if `resources.time_limit` elapsed first.
    async fn run(
        &self,
        image: &str,
        command: &str,
        resources: &Resources,
        run_dir: &Path,
        log_file: &Path,
    ) -> Result<i32>;
}

/// Builds the `docker run` argv exactly as the reference container runner
/// does: `--rm`, resource flags, a single bind mount of `run_dir` at
/// `/data`, working directory `/data`, then `sh -c <command>` with every
/// occurrence of the host run directory rewritten to `/data` so a step's
/// command can refer to host-style paths produced by the path resolver.
pub fn build_argv(image: &str, command: &str, resources: &Resources, run_dir: &Path, cidfile: &Path) -> Vec<String> {
    let mut argv = vec!["run".to_string(), "--rm".to_string()];
    argv.push("--cpus".to_string());
    argv.push(resources.cpu.to_string());
    argv.push("--memory".to_string());
    argv.push(resources.memory.clone());
    argv.push("--cidfile".to_string());
    argv.push(cidfile.to_string_lossy().into_owned());
    argv.push("-v".to_string());
    argv.push(format!("{}:/data", run_dir.display()));
    argv.push("-w".to_string());
    argv.push("/data".to_string());
    argv.push(image.to_string());

    let modified_command = command.replace(&run_dir.to_string_lossy().into_owned(), "/data");
    argv.push("sh".to_string());
    argv.push("-c".to_string());
    argv.push(modified_command);
    argv
}

/// Drives a real container engine binary via `tokio::process::Command`.
pub struct ProcessContainerRuntime {
    program: String,
}

impl ProcessContainerRuntime {
    pub fn new() -> Self {
        Self {
            program: "docker".to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ProcessContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for ProcessContainerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let status = tokio::process::Command::new(&self.program)
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Container(format!("failed to invoke {}: {e}", self.program)))?;
        Ok(status.success())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        tracing::info!("pulling image: {}", image);
        let status = tokio::process::Command::new(&self.program)
            .args(["pull", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| Error::Container(format!("failed to invoke {}: {e}", self.program)))?;
        if !status.success() {
            return Err(Error::Container(format!("failed to pull image {image}")));
        }
        Ok(())
    }

    async fn run(
        &self,
        image: &str,
        command: &str,
        resources: &Resources,
        run_dir: &Path,
        log_file: &Path,
    ) -> Result<i32> {
        let cidfile = unique_cidfile_path(run_dir);
        let argv = build_argv(image, command, resources, run_dir, &cidfile);
        tracing::debug!("container command: {} {}", self.program, argv.join(" "));

        let log = std::fs::File::create(log_file)?;
        let log_err = log.try_clone()?;

        let mut child = tokio::process::Command::new(&self.program)
            .args(&argv)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| Error::Container(format!("failed to spawn {}: {e}", self.program)))?;

        let time_limit = resources.time_limit_seconds().map(Duration::from_secs);

        let exit_code = match time_limit {
            None => wait_exit_code(&mut child).await?,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => exit_code_from_status(status.map_err(Error::Io)?),
                Err(_) => {
                    tracing::warn!("container {} exceeded its time limit, killing", image);
                    kill_by_cidfile(&self.program, &cidfile).await;
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    append_timeout_marker(log_file, limit);
                    let _ = std::fs::remove_file(&cidfile);
                    return Ok(EXIT_CODE_TIME_LIMIT);
                }
            },
        };
        let _ = std::fs::remove_file(&cidfile);

        match exit_code {
            0 => tracing::info!("container {} completed successfully", image),
            2 => tracing::error!(
                "container {} failed with exit code 2 (often a shell syntax error)",
                image
            ),
            code => tracing::error!("container {} failed with exit code {}", image, code),
        }

        Ok(exit_code)
    }
}

async fn wait_exit_code(child: &mut tokio::process::Child) -> Result<i32> {
    let status = child.wait().await.map_err(Error::Io)?;
    Ok(exit_code_from_status(status))
}

fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

fn unique_cidfile_path(run_dir: &Path) -> PathBuf {
    let suffix: u32 = rand::random();
    run_dir.join(format!(".cid-{suffix:08x}"))
}

async fn kill_by_cidfile(program: &str, cidfile: &Path) {
    let Ok(id) = std::fs::read_to_string(cidfile) else {
        return;
    };
    let id = id.trim();
    if id.is_empty() {
        return;
    }
    let _ = tokio::process::Command::new(program)
        .args(["kill", id])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}

fn append_timeout_marker(log_file: &Path, limit: Duration) {
    use std::io::Write;
    if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(log_file) {
        let _ = writeln!(
            f,
            "\n\n### STEP TERMINATED DUE TO TIME LIMIT ###\nThe step was running for {:.2} seconds when it reached its time limit.",
            limit.as_secs_f64()
        );
    }
}

/// A call-recording, expectation-based [`ContainerRuntime`] double so the
/// executor and its tests never need a real container engine installed.
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    pub struct RecordedRun {
        pub image: String,
        pub command: String,
    }

    #[derive(Clone, Debug)]
    struct Expectation {
        image: String,
        exit_code: i32,
        times_called: usize,
        expected_times: Option<usize>,
    }

    #[derive(Clone, Default)]
    pub struct MockContainerRuntime {
        expectations: Arc<Mutex<Vec<Expectation>>>,
        calls: Arc<Mutex<Vec<RecordedRun>>>,
        images_present: Arc<Mutex<std::collections::HashSet<String>>>,
    }

    pub struct MockRunConfig {
        runtime: MockContainerRuntime,
        expectation: Expectation,
    }

    impl MockContainerRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_image_present(self, image: &str) -> Self {
            self.images_present.lock().unwrap().insert(image.to_string());
            self
        }

        pub fn expect_run(&self, image: &str) -> MockRunConfig {
            MockRunConfig {
                runtime: self.clone(),
                expectation: Expectation {
                    image: image.to_string(),
                    exit_code: 0,
                    times_called: 0,
                    expected_times: None,
                },
            }
        }

        pub fn call_history(&self) -> Vec<RecordedRun> {
            self.calls.lock().unwrap().clone()
        }

        pub fn verify_called(&self, image: &str, times: usize) -> bool {
            self.calls.lock().unwrap().iter().filter(|c| c.image == image).count() == times
        }
    }

    impl MockRunConfig {
        pub fn returns_exit_code(mut self, code: i32) -> Self {
            self.expectation.exit_code = code;
            self
        }

        pub fn times(mut self, n: usize) -> Self {
            self.expectation.expected_times = Some(n);
            self
        }

        pub fn finish(self) {
            self.runtime.expectations.lock().unwrap().push(self.expectation);
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockContainerRuntime {
        async fn image_exists(&self, image: &str) -> Result<bool> {
            Ok(self.images_present.lock().unwrap().contains(image))
        }

        async fn pull(&self, image: &str) -> Result<()> {
            self.images_present.lock().unwrap().insert(image.to_string());
            Ok(())
        }

        async fn run(
            &self,
            image: &str,
            command: &str,
            resources: &Resources,
            _run_dir: &Path,
            log_file: &Path,
        ) -> Result<i32> {
            self.calls.lock().unwrap().push(RecordedRun {
                image: image.to_string(),
                command: command.to_string(),
            });

            let mut expectations = self.expectations.lock().unwrap();
            for exp in expectations.iter_mut() {
                if exp.image != image {
                    continue;
                }
                if let Some(expected) = exp.expected_times {
                    if exp.times_called >= expected {
                        continue;
                    }
                }
                exp.times_called += 1;
                if let Some(parent) = log_file.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                std::fs::write(log_file, "")?;
                if exp.exit_code == EXIT_CODE_TIME_LIMIT {
                    if let Some(limit) = resources.time_limit_seconds() {
                        append_timeout_marker(log_file, Duration::from_secs(limit));
                    }
                }
                return Ok(exp.exit_code);
            }

            Err(Error::Container(format!(
                "no mock expectation set up for image '{image}'"
            )))
        }
    }
}
