//! Container-backed test execution.
//!
//! The runner materialises a per-run workspace on the host, assembles an
//! entry script that checks out the instance's base commit, applies the
//! patches in order, runs the instance's test script, and parses the test
//! log inside the container. The container engine itself is consumed through
//! the [`ContainerEngine`] trait; [`DockerCli`] shells out to the `docker`
//! binary.

mod apply;
mod runner;
mod workspace;

pub use apply::{apply_patch, prepare_directories_for_patch, AppliedPatch, GIT_APPLY_CMDS};
pub use runner::{run_evaluation, EvalOutcome, EvalRequest};
pub use workspace::{assemble_entryscript, collect_outputs, prepare_run, PreparedRun};

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// Marker the entry script prints when a patch fails to apply.
pub const APPLY_PATCH_FAIL: &str = ">>>>> Patch Apply Failed";

/// Error type for container operations
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Container engine failure: {0}")]
    Engine(String),

    #[error("Image '{image}' could not be pulled or found locally: {reason}")]
    ImageUnavailable { image: String, reason: String },

    #[error("Failed to apply {which} patch to repo")]
    ApplyFailed { which: String },

    #[error("Missing run script for instance '{0}'")]
    MissingScript(String),

    #[error("Output parse error: {0}")]
    OutputParse(#[from] serde_json::Error),
}

/// Resource limits for one container run.
#[derive(Debug, Clone)]
pub struct ContainerLimits {
    /// Memory limit (also used as the swap limit so swap is unusable).
    pub mem_limit: String,
    /// CPU quota in cores.
    pub cpus: u32,
    /// Wall-clock budget for the whole run.
    pub timeout: Duration,
}

impl Default for ContainerLimits {
    fn default() -> Self {
        Self {
            mem_limit: "8g".to_string(),
            cpus: 8,
            timeout: Duration::from_secs(480),
        }
    }
}

/// Result of waiting on a container.
#[derive(Debug, Clone, Copy)]
pub struct WaitOutcome {
    pub status_code: i64,
    pub oom_killed: bool,
    pub timed_out: bool,
}

/// Output of an in-container command execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub returncode: i64,
    /// stdout followed by stderr, lossily decoded.
    pub output: String,
}

/// The container engine operations the harness consumes.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Pull an image, optionally with a platform override. Callers fall back
    /// to a locally cached image when the pull fails.
    async fn pull(&self, image: &str, platform: Option<&str>) -> Result<(), RunnerError>;

    /// Whether the image exists locally.
    async fn image_exists(&self, image: &str) -> bool;

    /// Start a detached container running `bash -c <command>` with the given
    /// workspace bind-mounted at `/workspace`. Returns the container id.
    #[allow(clippy::too_many_arguments)]
    async fn run_detached(
        &self,
        image: &str,
        workspace_dir: &Path,
        command: &str,
        limits: &ContainerLimits,
        block_network: bool,
        platform: Option<&str>,
    ) -> Result<String, RunnerError>;

    /// Wait for a container to exit, up to `timeout`. On timeout the
    /// container is killed and force-removed.
    async fn wait(&self, container: &str, timeout: Duration) -> Result<WaitOutcome, RunnerError>;

    /// Execute a shell command inside a running container.
    async fn exec(
        &self,
        container: &str,
        command: &str,
        cwd: Option<&str>,
        user: Option<&str>,
    ) -> Result<ExecOutput, RunnerError>;

    /// Copy a host file into the container.
    async fn copy_in(&self, container: &str, src: &Path, dest: &str) -> Result<(), RunnerError>;

    /// Fetch the container's combined log stream.
    async fn logs(&self, container: &str) -> Result<String, RunnerError>;

    async fn kill(&self, container: &str) -> Result<(), RunnerError>;

    async fn remove(&self, container: &str, force: bool) -> Result<(), RunnerError>;
}

/// [`ContainerEngine`] implementation that shells out to the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    executable: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            executable: "docker".to_string(),
        }
    }
}

impl DockerCli {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    async fn run_command(&self, args: &[&str]) -> Result<ExecOutput, RunnerError> {
        let output = Command::new(&self.executable)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(ExecOutput {
            returncode: output.status.code().unwrap_or(-1) as i64,
            output: format!("{stdout}{stderr}"),
        })
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn pull(&self, image: &str, platform: Option<&str>) -> Result<(), RunnerError> {
        let mut args = vec!["pull"];
        if let Some(platform) = platform {
            args.extend_from_slice(&["--platform", platform]);
        }
        args.push(image);
        let result = self.run_command(&args).await?;
        if result.returncode != 0 {
            return Err(RunnerError::Engine(format!(
                "docker pull {image} failed: {}",
                result.output.trim()
            )));
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> bool {
        matches!(
            self.run_command(&["image", "inspect", image]).await,
            Ok(result) if result.returncode == 0
        )
    }

    async fn run_detached(
        &self,
        image: &str,
        workspace_dir: &Path,
        command: &str,
        limits: &ContainerLimits,
        block_network: bool,
        platform: Option<&str>,
    ) -> Result<String, RunnerError> {
        let workspace = workspace_dir.canonicalize()?;
        let volume = format!("{}:/workspace", workspace.display());
        let cpus = limits.cpus.to_string();

        let mut args = vec![
            "run",
            "-d",
            "--entrypoint",
            "/bin/bash",
            "-v",
            volume.as_str(),
            "--cpus",
            cpus.as_str(),
            "--memory",
            limits.mem_limit.as_str(),
            "--memory-swap",
            limits.mem_limit.as_str(),
        ];
        if block_network {
            args.extend_from_slice(&["--network", "none"]);
        }
        if let Some(platform) = platform {
            args.extend_from_slice(&["--platform", platform]);
        }
        args.push(image);
        args.extend_from_slice(&["-c", command]);

        let result = self.run_command(&args).await?;
        if result.returncode != 0 {
            return Err(RunnerError::Engine(format!(
                "docker run failed: {}",
                result.output.trim()
            )));
        }
        Ok(result
            .output
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    async fn wait(&self, container: &str, timeout: Duration) -> Result<WaitOutcome, RunnerError> {
        let wait_args = ["wait", container];
        let wait = self.run_command(&wait_args);
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => {
                let result = result?;
                let status_code: i64 = result.output.trim().parse().unwrap_or(1);
                let oom = self
                    .run_command(&["inspect", "-f", "{{.State.OOMKilled}}", container])
                    .await
                    .map(|r| r.output.trim() == "true")
                    .unwrap_or(false);
                Ok(WaitOutcome {
                    status_code,
                    oom_killed: oom || status_code == 137,
                    timed_out: false,
                })
            }
            Err(_) => {
                let _ = self.kill(container).await;
                let _ = self.remove(container, true).await;
                Ok(WaitOutcome {
                    status_code: 1,
                    oom_killed: false,
                    timed_out: true,
                })
            }
        }
    }

    async fn exec(
        &self,
        container: &str,
        command: &str,
        cwd: Option<&str>,
        user: Option<&str>,
    ) -> Result<ExecOutput, RunnerError> {
        let mut args = vec!["exec"];
        if let Some(cwd) = cwd {
            args.extend_from_slice(&["-w", cwd]);
        }
        if let Some(user) = user {
            args.extend_from_slice(&["-u", user]);
        }
        args.extend_from_slice(&[container, "/bin/bash", "-c", command]);
        self.run_command(&args).await
    }

    async fn copy_in(&self, container: &str, src: &Path, dest: &str) -> Result<(), RunnerError> {
        let src = src.to_string_lossy().to_string();
        let target = format!("{container}:{dest}");
        let result = self
            .run_command(&["cp", src.as_str(), target.as_str()])
            .await?;
        if result.returncode != 0 {
            return Err(RunnerError::Engine(format!(
                "docker cp into {container} failed: {}",
                result.output.trim()
            )));
        }
        Ok(())
    }

    async fn logs(&self, container: &str) -> Result<String, RunnerError> {
        Ok(self.run_command(&["logs", container]).await?.output)
    }

    async fn kill(&self, container: &str) -> Result<(), RunnerError> {
        self.run_command(&["kill", container]).await.map(|_| ())
    }

    async fn remove(&self, container: &str, force: bool) -> Result<(), RunnerError> {
        let args: &[&str] = if force {
            &["rm", "-f", container]
        } else {
            &["rm", container]
        };
        self.run_command(args).await.map(|_| ())
    }
}
