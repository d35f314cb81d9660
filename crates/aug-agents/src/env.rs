//! Execution environments for agent actions.
//!
//! The agent loop is parametric over a capability trait exposing
//! `execute(cmd) → {output, returncode}`; the container-backed
//! implementation holds a started instance container and forwards actions
//! through the engine's exec. There are no back-references from the
//! environment to the agent.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use harness::container::{ContainerEngine, ContainerLimits};
use harness::{BenchmarkKind, Instance};
use tracing::{debug, info};

/// Error type for environment execution
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("Command timed out after {seconds}s")]
    Timeout {
        seconds: u64,
        /// Whatever output was captured before the deadline.
        partial_output: String,
    },

    #[error("Container failure: {0}")]
    Container(String),
}

/// Output of one executed action.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub output: String,
    pub returncode: i64,
}

/// Capability trait the agent uses to run shell actions.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn execute(&self, command: &str) -> Result<ExecResult, EnvironmentError>;

    /// Variables this environment contributes to template rendering.
    fn template_vars(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// A live instance container the agent works inside.
pub struct ContainerEnv {
    engine: std::sync::Arc<dyn ContainerEngine>,
    container_id: String,
    cwd: String,
    timeout: Duration,
}

impl ContainerEnv {
    /// Start a long-lived container for an instance: pull (or reuse) the
    /// image and keep the container alive for repeated execs.
    pub async fn start(
        engine: std::sync::Arc<dyn ContainerEngine>,
        instance: &Instance,
        benchmark: BenchmarkKind,
        workspace_dir: &Path,
        timeout: Duration,
    ) -> Result<Self, EnvironmentError> {
        let image = instance.image(benchmark);
        if let Err(e) = engine.pull(&image, None).await {
            if !engine.image_exists(&image).await {
                return Err(EnvironmentError::Container(format!(
                    "image {image} unavailable: {e}"
                )));
            }
            info!(image = %image, "pull failed, using locally available image");
        }

        std::fs::create_dir_all(workspace_dir)
            .map_err(|e| EnvironmentError::Container(e.to_string()))?;
        let container_id = engine
            .run_detached(
                &image,
                workspace_dir,
                "sleep infinity",
                &ContainerLimits::default(),
                false,
                None,
            )
            .await
            .map_err(|e| EnvironmentError::Container(e.to_string()))?;
        debug!(instance = %instance.instance_id, container = %container_id, "environment container started");

        Ok(Self {
            engine,
            container_id,
            cwd: benchmark.workdir().to_string(),
            timeout,
        })
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    /// Apply a patch inside this environment with the strategy cascade.
    pub async fn apply_patch(
        &self,
        patch: &str,
    ) -> Result<harness::container::AppliedPatch, EnvironmentError> {
        harness::container::apply_patch(self.engine.as_ref(), &self.container_id, patch, &self.cwd)
            .await
            .map_err(|e| EnvironmentError::Container(e.to_string()))
    }

    /// Stop and remove the backing container.
    pub async fn shutdown(&self) {
        let _ = self.engine.kill(&self.container_id).await;
        let _ = self.engine.remove(&self.container_id, true).await;
    }
}

#[async_trait]
impl Environment for ContainerEnv {
    async fn execute(&self, command: &str) -> Result<ExecResult, EnvironmentError> {
        let exec = self
            .engine
            .exec(&self.container_id, command, Some(&self.cwd), None);
        match tokio::time::timeout(self.timeout, exec).await {
            Ok(Ok(result)) => Ok(ExecResult {
                output: result.output,
                returncode: result.returncode,
            }),
            Ok(Err(e)) => Err(EnvironmentError::Container(e.to_string())),
            Err(_) => Err(EnvironmentError::Timeout {
                seconds: self.timeout.as_secs(),
                partial_output: String::new(),
            }),
        }
    }

    fn template_vars(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("cwd".to_string(), self.cwd.clone());
        vars
    }
}
