//! Stage 1: test generation.
//!
//! Phases in order: `test_gen → hard_code_fix → gold_eval → coverage_fix →
//! coverage_eval`, each resumable and each with its own retry loop. A corrupt
//! store halts the stage: nothing downstream can be trusted once the tracker
//! returns nothing.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use harness::store::ResultStore;
use tracing::{info, warn};

use super::{settle, should_run_phase, PhaseExecutor, StageReport};

pub const STAGE1_PHASES: &[&str] = &[
    "test_gen",
    "hard_code_fix",
    "gold_eval",
    "coverage_fix",
    "coverage_eval",
];

/// Configuration for the stage 1 orchestrator.
#[derive(Debug, Clone)]
pub struct Stage1Config {
    pub output_dir: PathBuf,
    pub dataset: PathBuf,
    pub scripts_dir: PathBuf,
    pub agent_config: PathBuf,
    pub model: String,
    pub benchmark: String,
    pub workers: usize,
    pub eval_workers: usize,
    pub run_id: String,
    pub must_cover_file: Option<PathBuf>,
    pub max_test_gen_retries: u32,
    pub max_hard_code_fix_retries: u32,
    pub max_combined_retries: u32,
    pub enable_coverage_fix: bool,
    pub start_from_phase: Option<String>,
}

/// Tracks instance state through the pipeline by reading `preds.json`.
/// Queries return `None` when the document cannot be parsed, which is a
/// halting condition for the caller.
pub struct InstanceTracker {
    store: ResultStore,
    preds_path: PathBuf,
}

impl InstanceTracker {
    pub fn new(preds_path: &Path) -> Result<Self> {
        Ok(Self {
            store: ResultStore::new(preds_path)?,
            preds_path: preds_path.to_path_buf(),
        })
    }

    fn document_ok(&self) -> bool {
        // An existing but unparseable file means corruption.
        !self.preds_path.exists() || {
            let text = std::fs::read_to_string(&self.preds_path).unwrap_or_default();
            serde_json::from_str::<serde_json::Value>(&text).is_ok()
        }
    }

    pub fn exists(&self) -> bool {
        self.preds_path.exists()
    }

    pub fn failed_test_gen(&self) -> Option<Vec<String>> {
        self.document_ok().then(|| self.store.get_failed_test_gen())
    }

    pub fn gold_patch_failures(&self) -> Option<Vec<String>> {
        self.document_ok().then(|| self.store.get_gold_patch_failures())
    }

    pub fn low_coverage_instances(&self) -> Option<Vec<String>> {
        self.document_ok()
            .then(|| self.store.get_low_coverage_instances(1.0))
    }

    pub fn successful_instances(&self) -> Vec<String> {
        self.store.get_successful_instances()
    }

    pub fn all_instances(&self) -> Vec<String> {
        self.store.load().keys().cloned().collect()
    }
}

pub struct Stage1Orchestrator {
    config: Stage1Config,
    executor: PhaseExecutor,
    tracker: InstanceTracker,
}

impl Stage1Orchestrator {
    pub fn new(config: Stage1Config) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let tracker = InstanceTracker::new(&config.output_dir.join("preds.json"))?;
        let executor = PhaseExecutor::new(&config.output_dir);
        Ok(Self {
            config,
            executor,
            tracker,
        })
    }

    fn should_run(&self, phase: &str) -> bool {
        should_run_phase(STAGE1_PHASES, phase, self.config.start_from_phase.as_deref())
    }

    /// Drive the full stage. Returns `Ok(true)` when every in-scope phase
    /// completed with at least one successful instance.
    pub async fn run(&mut self) -> Result<bool> {
        info!(output = %self.config.output_dir.display(), model = %self.config.model, "starting stage 1");
        let mut report = StageReport::new("stage1");

        let outcome = self.run_phases(&mut report).await;

        report.successful_instances = self.tracker.successful_instances();
        report.failed_instances = self
            .tracker
            .gold_patch_failures()
            .unwrap_or_default();
        report.save(&self.config.output_dir, "stage1_report.json")?;

        outcome
    }

    async fn run_phases(&mut self, report: &mut StageReport) -> Result<bool> {
        for phase in STAGE1_PHASES {
            if !self.should_run(phase) {
                info!(phase, "skipping (resume point)");
                continue;
            }
            if !self.config.enable_coverage_fix
                && matches!(*phase, "coverage_fix" | "coverage_eval")
            {
                info!(phase, "skipping (coverage fix disabled)");
                continue;
            }

            let ok = match *phase {
                "test_gen" => self.phase_test_gen().await?,
                "hard_code_fix" => self.phase_hard_code_fix(None)?,
                "gold_eval" => self.phase_gold_eval().await?,
                "coverage_fix" => self.phase_coverage_fix()?,
                "coverage_eval" => self.phase_coverage_eval().await?,
                _ => unreachable!("unknown stage 1 phase"),
            };

            if ok {
                report.phases_completed.push(phase.to_string());
            } else {
                report.phases_failed.push(phase.to_string());
                warn!(phase, "stage 1 phase failed, stopping pipeline");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn test_gen_args(&self, instance_ids: &[String], iteration: u32) -> Vec<String> {
        let mut args = vec![
            "test-gen".to_string(),
            "--output".to_string(),
            self.config.output_dir.display().to_string(),
            "--dataset".to_string(),
            self.config.dataset.display().to_string(),
            "--scripts-dir".to_string(),
            self.config.scripts_dir.display().to_string(),
            "--agent-config".to_string(),
            self.config.agent_config.display().to_string(),
            "--model".to_string(),
            self.config.model.clone(),
            "--benchmark".to_string(),
            self.config.benchmark.clone(),
            "--workers".to_string(),
            self.config.workers.to_string(),
            "--iteration".to_string(),
            iteration.to_string(),
        ];
        if !instance_ids.is_empty() {
            args.push("--instance-ids".to_string());
            args.push(instance_ids.join(","));
        }
        args
    }

    fn fix_args(&self, fix_type: &str, instance_ids: Option<&[String]>) -> Vec<String> {
        let mut args = vec![
            "fix".to_string(),
            "--output".to_string(),
            self.config.output_dir.display().to_string(),
            "--scripts-dir".to_string(),
            self.config.scripts_dir.display().to_string(),
            "--agent-config".to_string(),
            self.config.agent_config.display().to_string(),
            "--model".to_string(),
            self.config.model.clone(),
            "--benchmark".to_string(),
            self.config.benchmark.clone(),
            "--workers".to_string(),
            self.config.workers.to_string(),
            "--fix-type".to_string(),
            fix_type.to_string(),
        ];
        if let Some(ids) = instance_ids {
            if !ids.is_empty() {
                args.push("--instance-ids".to_string());
                args.push(ids.join(","));
            }
        }
        args
    }

    fn eval_args(&self, coverage: bool, instance_ids: Option<&[String]>) -> Vec<String> {
        let mut args = vec![
            "eval".to_string(),
            "--output".to_string(),
            self.config.output_dir.display().to_string(),
            "--scripts-dir".to_string(),
            self.config.scripts_dir.display().to_string(),
            "--benchmark".to_string(),
            self.config.benchmark.clone(),
            "--workers".to_string(),
            self.config.eval_workers.to_string(),
            "--run-id".to_string(),
            self.config.run_id.clone(),
            "--mode".to_string(),
            "gold".to_string(),
            "--timeout".to_string(),
            "1800".to_string(),
            "--redo".to_string(),
        ];
        if coverage {
            args.push("--coverage".to_string());
            if let Some(must_cover) = &self.config.must_cover_file {
                args.push("--must-cover-file".to_string());
                args.push(must_cover.display().to_string());
            }
        }
        if let Some(ids) = instance_ids {
            if !ids.is_empty() {
                args.push("--instance-ids".to_string());
                args.push(ids.join(","));
            }
        }
        args
    }

    /// Phase 1: generate tests until every instance has one or retries are
    /// exhausted. The phase fails only when *all* instances remain empty.
    async fn phase_test_gen(&mut self) -> Result<bool> {
        if !self.tracker.exists() {
            info!("preds.json not found, generating tests for all instances");
            if !self
                .executor
                .run_phase("test_generation", &self.test_gen_args(&[], 0))?
            {
                return Ok(false);
            }
            settle().await;
        }

        for iteration in 1..=self.config.max_test_gen_retries {
            let Some(failed) = self.tracker.failed_test_gen() else {
                bail!("cannot load or parse preds.json, stopping test generation phase");
            };
            if failed.is_empty() {
                info!("all instances have successful test generation");
                return Ok(true);
            }
            info!(
                iteration,
                count = failed.len(),
                "retrying test generation for failed instances"
            );
            self.executor
                .run_phase("test_generation", &self.test_gen_args(&failed, iteration))?;
            settle().await;
        }

        let Some(failed) = self.tracker.failed_test_gen() else {
            bail!("cannot load or parse preds.json after retries");
        };
        let all = self.tracker.all_instances();
        if !failed.is_empty() && failed.len() == all.len() {
            warn!("all {} instances failed test generation", all.len());
            return Ok(false);
        }
        if !failed.is_empty() {
            warn!(
                failed = failed.len(),
                total = all.len(),
                "continuing with partially successful test generation"
            );
        }
        Ok(true)
    }

    /// Phase 2: one hard-code fix pass over all instances.
    fn phase_hard_code_fix(&mut self, instance_ids: Option<&[String]>) -> Result<bool> {
        self.executor
            .run_phase("hard_code_fix", &self.fix_args("Hard_Code_Fix", instance_ids))
    }

    /// Phase 3: gold validation, then hard-code-fix retries for the failing
    /// subset, then combined regenerate+fix cycles for persistent failures.
    /// Succeeds as long as at least one instance passes.
    async fn phase_gold_eval(&mut self) -> Result<bool> {
        if !self.executor.run_phase("gold_eval", &self.eval_args(false, None))? {
            return Ok(false);
        }
        settle().await;

        for iteration in 1..=self.config.max_hard_code_fix_retries {
            let Some(failed) = self.tracker.gold_patch_failures() else {
                bail!("cannot load or parse preds.json, stopping gold eval phase");
            };
            if failed.is_empty() {
                info!("all instances pass gold patch validation");
                return Ok(true);
            }
            info!(iteration, count = failed.len(), "re-fixing gold failures");
            if !self.phase_hard_code_fix(Some(&failed))? {
                return Ok(false);
            }
            settle().await;
            if !self
                .executor
                .run_phase("gold_eval", &self.eval_args(false, Some(&failed)))?
            {
                return Ok(false);
            }
            settle().await;
        }

        // Combined regenerate + fix + revalidate for persistent failures.
        for combined in 1..=self.config.max_combined_retries {
            let Some(failed) = self.tracker.gold_patch_failures() else {
                bail!("cannot load or parse preds.json");
            };
            if failed.is_empty() {
                return Ok(true);
            }
            info!(
                combined,
                count = failed.len(),
                "combined regenerate+fix cycle for persistent failures"
            );
            if !self
                .executor
                .run_phase("test_generation", &self.test_gen_args(&failed, combined))?
            {
                return Ok(false);
            }
            settle().await;
            if !self.phase_hard_code_fix(Some(&failed))? {
                return Ok(false);
            }
            settle().await;
            if !self
                .executor
                .run_phase("gold_eval", &self.eval_args(false, Some(&failed)))?
            {
                return Ok(false);
            }
            settle().await;
        }

        let Some(failed) = self.tracker.gold_patch_failures() else {
            bail!("cannot load or parse preds.json");
        };
        let all = self.tracker.all_instances();
        if !failed.is_empty() && failed.len() == all.len() {
            warn!("no instances passed gold patch validation");
            return Ok(false);
        }
        Ok(true)
    }

    /// Phase 4: coverage fix for low-coverage instances (agent work only).
    fn phase_coverage_fix(&mut self) -> Result<bool> {
        let Some(low) = self.tracker.low_coverage_instances() else {
            bail!("cannot load or parse preds.json, stopping coverage fix phase");
        };
        if low.is_empty() {
            info!("no instances need coverage fixing");
            return Ok(true);
        }
        info!(count = low.len(), "running coverage fix");
        self.executor
            .run_phase("coverage_fix", &self.fix_args("Coverage_Fix", Some(&low)))
    }

    /// Phase 5: rerun the evaluation with coverage tracing and refresh
    /// `meta.coverage_rate` / `meta.uncovered_lines`.
    async fn phase_coverage_eval(&mut self) -> Result<bool> {
        if !self
            .executor
            .run_phase("coverage_eval", &self.eval_args(true, None))?
        {
            return Ok(false);
        }
        settle().await;

        let Some(low) = self.tracker.low_coverage_instances() else {
            bail!("cannot load or parse preds.json");
        };
        if low.is_empty() {
            info!("all instances achieved full coverage");
        } else {
            info!(count = low.len(), "instances still below full coverage");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_tracker_corruption_is_detected() {
        let dir = tempdir().unwrap();
        let preds = dir.path().join("preds.json");
        std::fs::write(&preds, "{broken").unwrap();
        let tracker = InstanceTracker::new(&preds).unwrap();
        assert!(tracker.failed_test_gen().is_none());
        assert!(tracker.gold_patch_failures().is_none());
    }

    #[test]
    fn test_tracker_queries() {
        let dir = tempdir().unwrap();
        let preds = dir.path().join("preds.json");
        let store = ResultStore::new(&preds).unwrap();
        store
            .update_instance(
                "good",
                json!({"model_test_patch": "d", "meta": {"pass_gold_patch_status": "success", "coverage_rate": 0.5}}),
                true,
            )
            .unwrap();
        store
            .update_instance("empty", json!({"model_test_patch": ""}), true)
            .unwrap();

        let tracker = InstanceTracker::new(&preds).unwrap();
        assert_eq!(tracker.failed_test_gen().unwrap(), vec!["empty"]);
        assert_eq!(tracker.gold_patch_failures().unwrap(), vec!["empty"]);
        assert_eq!(tracker.low_coverage_instances().unwrap(), vec!["good"]);
        assert_eq!(tracker.all_instances().len(), 2);
    }
}
