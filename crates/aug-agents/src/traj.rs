//! Trajectory persistence.
//!
//! Every agent run leaves a JSON record behind: config snapshot, the full
//! message list, step count, cost, exit status, and the final submission.
//! Trajectories land under `traj/<phase>/<instance_id>/`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::agent::ExitStatus;
use crate::config::AgentConfig;
use crate::model::Message;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub instance_cost: f64,
    pub api_calls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryInfo {
    pub exit_status: String,
    pub submission: String,
    pub model_stats: ModelStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<AgentConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// On-disk trajectory record for one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub info: TrajectoryInfo,
    pub messages: Vec<Message>,
    pub trajectory_format: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Mutation targeted by an aug run, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_mutation_patch: Option<Value>,
}

impl Trajectory {
    pub fn new(
        exit_status: &ExitStatus,
        submission: &str,
        messages: Vec<Message>,
        api_calls: u32,
        instance_cost: f64,
    ) -> Self {
        Self {
            info: TrajectoryInfo {
                exit_status: exit_status.as_str().to_string(),
                submission: submission.to_string(),
                model_stats: ModelStats {
                    instance_cost,
                    api_calls,
                },
                config: None,
                model_name: None,
                error: None,
            },
            messages,
            trajectory_format: "patchproof-agent-1".to_string(),
            instance_id: None,
            target_mutation_patch: None,
        }
    }

    pub fn with_config(mut self, config: AgentConfig, model_name: String) -> Self {
        self.info.config = Some(config);
        self.info.model_name = Some(model_name);
        self
    }

    pub fn with_instance(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_string());
        self
    }

    pub fn with_target_mutation(mut self, target: Value) -> Self {
        self.target_mutation_patch = Some(target);
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.info.error = Some(error.to_string());
        self
    }
}

/// Write a trajectory record, creating parent directories.
pub fn save_trajectory(path: &Path, trajectory: &Trajectory) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating trajectory dir {}", parent.display()))?;
    }
    let text = serde_json::to_string_pretty(trajectory)?;
    std::fs::write(path, text)
        .with_context(|| format!("writing trajectory {}", path.display()))?;
    info!(path = %path.display(), "saved trajectory");
    Ok(())
}

/// Load a trajectory record (used to seed fix agents from a prior stage).
pub fn load_trajectory(path: &Path) -> Result<Trajectory> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading trajectory {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("traj/test_gen/inst-1/inst-1.traj.json");

        let traj = Trajectory::new(
            &ExitStatus::Submitted,
            "diff --git",
            vec![Message::new("system", "s"), Message::new("user", "u")],
            7,
            0.42,
        )
        .with_instance("inst-1")
        .with_config(AgentConfig::default(), "test-model".to_string());

        save_trajectory(&path, &traj).unwrap();
        let loaded = load_trajectory(&path).unwrap();
        assert_eq!(loaded.info.exit_status, "Submitted");
        assert_eq!(loaded.info.model_stats.api_calls, 7);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.instance_id.as_deref(), Some("inst-1"));
    }
}
