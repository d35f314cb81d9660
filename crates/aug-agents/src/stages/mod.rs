//! The three top-level stage orchestrators.
//!
//! Each stage decomposes into numbered phases with explicit skip points so a
//! run can resume mid-pipeline (`--start-from-phase`). Phases communicate
//! exclusively through the result store; worker passes run as subcommands of
//! the current executable, captured through a PTY so their progress rendering
//! survives.

pub mod stage1;
pub mod stage2;
pub mod stage3;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info};

use crate::pty::run_with_pty;

/// Wall-clock budget for one spawned phase driver.
const PHASE_DRIVER_TIMEOUT: Duration = Duration::from_secs(7200);

/// Whether `phase` runs given the resume point. Unknown names run (forward
/// compatibility); an unknown resume point means start from the beginning.
pub fn should_run_phase(phases: &[&str], phase: &str, start_from: Option<&str>) -> bool {
    let Some(start_from) = start_from else {
        return true;
    };
    let (Some(current), Some(start)) = (
        phases.iter().position(|p| *p == phase),
        phases.iter().position(|p| *p == start_from),
    ) else {
        return true;
    };
    current >= start
}

/// Spawns worker passes as subcommands of the current binary with PTY
/// capture, teeing output into `<output>/logs/<phase>_<ts>.log`.
pub struct PhaseExecutor {
    output_dir: PathBuf,
}

impl PhaseExecutor {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
        }
    }

    /// Run `aug-agents <args…>` as a phase driver. Returns whether the driver
    /// exited zero.
    pub fn run_phase(&self, phase: &str, args: &[String]) -> Result<bool> {
        let exe = std::env::current_exe().context("locating current executable")?;
        info!(phase, args = %args.join(" "), "spawning phase driver");

        let logs_dir = self.output_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        let log_path = logs_dir.join(format!("{phase}_{}.log", chrono::Utc::now().timestamp()));

        let mut command = Command::new(exe);
        command.args(args);
        let status = run_with_pty(command, &log_path, PHASE_DRIVER_TIMEOUT)
            .with_context(|| format!("running phase driver for {phase}"))?;

        if !status.success() {
            error!(phase, code = status.code(), "phase driver exited non-zero");
        }
        Ok(status.success())
    }
}

/// Final per-stage report, flushed as JSON even on failure.
#[derive(Debug, Default, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub phases_completed: Vec<String>,
    pub phases_failed: Vec<String>,
    pub successful_instances: Vec<String>,
    pub failed_instances: Vec<String>,
    pub notes: Vec<String>,
}

impl StageReport {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Default::default()
        }
    }

    pub fn save(&self, output_dir: &Path, name: &str) -> Result<()> {
        let path = output_dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), "stage report saved");
        Ok(())
    }
}

/// Give the filesystem a moment to settle between a driver's writes and the
/// next store read.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHASES: &[&str] = &[
        "test_gen",
        "hard_code_fix",
        "gold_eval",
        "coverage_fix",
        "coverage_eval",
    ];

    #[test]
    fn test_no_resume_runs_everything() {
        for phase in PHASES {
            assert!(should_run_phase(PHASES, phase, None));
        }
    }

    #[test]
    fn test_resume_skips_prefix() {
        assert!(!should_run_phase(PHASES, "test_gen", Some("hard_code_fix")));
        assert!(should_run_phase(PHASES, "hard_code_fix", Some("hard_code_fix")));
        assert!(should_run_phase(PHASES, "gold_eval", Some("hard_code_fix")));
    }

    #[test]
    fn test_unknown_names_run() {
        assert!(should_run_phase(PHASES, "brand_new_phase", Some("gold_eval")));
        assert!(should_run_phase(PHASES, "test_gen", Some("not_a_phase")));
    }

    #[test]
    fn test_report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = StageReport::new("stage1");
        report.phases_completed.push("test_gen".to_string());
        report.save(dir.path(), "stage1_report.json").unwrap();
        let text = std::fs::read_to_string(dir.path().join("stage1_report.json")).unwrap();
        assert!(text.contains("test_gen"));
    }
}
