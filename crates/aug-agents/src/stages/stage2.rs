//! Stage 2: mutation generation.
//!
//! For `required_mutations = N`, maintains `N` independent sets
//! (`set1/ … setN/`), each a mini-pipeline:
//! `mutation_gen → init_test → judge`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use harness::store::ResultStore;
use serde_json::Value;
use tracing::{info, warn};

use super::{settle, should_run_phase, PhaseExecutor, StageReport};

pub const STAGE2_PHASES: &[&str] = &["mutation_gen", "init_test", "judge"];

#[derive(Debug, Clone)]
pub struct Stage2Config {
    pub output_dir: PathBuf,
    /// Stage 1 preds document (instances with their final test patches).
    pub stage1_preds: PathBuf,
    pub scripts_dir: PathBuf,
    pub agent_config: PathBuf,
    pub model: String,
    pub judge_models: Vec<String>,
    pub judge_times: usize,
    pub benchmark: String,
    pub workers: usize,
    pub eval_workers: usize,
    pub run_id: String,
    pub required_mutations: u32,
    pub max_mutation_gen_iterations: u32,
    pub start_from_phase: Option<String>,
}

impl Stage2Config {
    pub fn set_dir(&self, set_index: u32) -> PathBuf {
        self.output_dir.join(format!("set{set_index}"))
    }
}

pub struct Stage2Orchestrator {
    config: Stage2Config,
    executor: PhaseExecutor,
}

impl Stage2Orchestrator {
    pub fn new(config: Stage2Config) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let executor = PhaseExecutor::new(&config.output_dir);
        Ok(Self { config, executor })
    }

    fn should_run(&self, phase: &str) -> bool {
        should_run_phase(STAGE2_PHASES, phase, self.config.start_from_phase.as_deref())
    }

    pub async fn run(&mut self) -> Result<bool> {
        info!(
            sets = self.config.required_mutations,
            "starting stage 2 (mutation generation)"
        );
        let mut report = StageReport::new("stage2");
        let outcome = self.run_phases(&mut report).await;
        report.save(&self.config.output_dir, "stage2_report.json")?;
        outcome
    }

    async fn run_phases(&mut self, report: &mut StageReport) -> Result<bool> {
        if self.should_run("mutation_gen") {
            if !self.phase_mutation_gen().await? {
                report.phases_failed.push("mutation_gen".to_string());
                return Ok(false);
            }
            report.phases_completed.push("mutation_gen".to_string());
        }

        if self.should_run("init_test") {
            if !self.phase_init_test().await? {
                report.phases_failed.push("init_test".to_string());
                return Ok(false);
            }
            report.phases_completed.push("init_test".to_string());
        }

        if self.should_run("judge") {
            if !self.phase_judge()? {
                report.phases_failed.push("judge".to_string());
                return Ok(false);
            }
            report.phases_completed.push("judge".to_string());
        }

        Ok(true)
    }

    /// Ids still missing a non-empty `model_patch` in a set's preds.
    fn missing_mutations(&self, set_index: u32) -> Result<Vec<String>> {
        let preds = self.config.set_dir(set_index).join("preds.json");
        if !preds.exists() {
            return Ok(Vec::new());
        }
        let store = ResultStore::new(&preds)?;
        Ok(store
            .load()
            .iter()
            .filter_map(|(id, record)| {
                let patch = record
                    .get("model_patch")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                patch.trim().is_empty().then(|| id.clone())
            })
            .collect())
    }

    fn mutation_args(&self, set_index: u32, instance_ids: &[String]) -> Vec<String> {
        let mut args = vec![
            "mutation".to_string(),
            "--output".to_string(),
            self.config.output_dir.display().to_string(),
            "--dataset".to_string(),
            self.config.stage1_preds.display().to_string(),
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
            "--set-index".to_string(),
            set_index.to_string(),
        ];
        if !instance_ids.is_empty() {
            args.push("--instance-ids".to_string());
            args.push(instance_ids.join(","));
        }
        args
    }

    /// Phase 1: per set, iterate until every instance carries a mutation or
    /// the iteration cap is reached. Non-fatal as long as any set produced
    /// mutations.
    async fn phase_mutation_gen(&mut self) -> Result<bool> {
        for set_index in 1..=self.config.required_mutations {
            let set_preds = self.config.set_dir(set_index).join("preds.json");

            if !set_preds.exists() {
                info!(set = set_index, "generating mutations for all instances");
                self.executor.run_phase(
                    &format!("mutation_gen_set{set_index}"),
                    &self.mutation_args(set_index, &[]),
                )?;
                settle().await;
            }

            for iteration in 1..=self.config.max_mutation_gen_iterations {
                let missing = self.missing_mutations(set_index)?;
                if missing.is_empty() {
                    break;
                }
                info!(
                    set = set_index,
                    iteration,
                    count = missing.len(),
                    "retrying mutation generation"
                );
                self.executor.run_phase(
                    &format!("mutation_gen_set{set_index}"),
                    &self.mutation_args(set_index, &missing),
                )?;
                settle().await;
            }

            let missing = self.missing_mutations(set_index)?;
            if !missing.is_empty() {
                warn!(
                    set = set_index,
                    count = missing.len(),
                    "instances without mutations after all iterations"
                );
            }
        }
        Ok(true)
    }

    /// Phase 2: run each set's mutations under the gold test patch.
    async fn phase_init_test(&mut self) -> Result<bool> {
        for set_index in 1..=self.config.required_mutations {
            let set_dir = self.config.set_dir(set_index);
            if !set_dir.join("preds.json").exists() {
                warn!(set = set_index, "set preds missing, skipping init test");
                continue;
            }
            let args = vec![
                "eval".to_string(),
                "--output".to_string(),
                set_dir.display().to_string(),
                "--scripts-dir".to_string(),
                self.config.scripts_dir.display().to_string(),
                "--benchmark".to_string(),
                self.config.benchmark.clone(),
                "--workers".to_string(),
                self.config.eval_workers.to_string(),
                "--run-id".to_string(),
                format!("{}_set{set_index}", self.config.run_id),
                "--mode".to_string(),
                "init-test".to_string(),
                "--redo".to_string(),
            ];
            if !self
                .executor
                .run_phase(&format!("init_test_set{set_index}"), &args)?
            {
                return Ok(false);
            }
            settle().await;
        }
        Ok(true)
    }

    /// Phase 3: judge each set's surviving mutations with majority voting.
    fn phase_judge(&mut self) -> Result<bool> {
        for set_index in 1..=self.config.required_mutations {
            let set_dir = self.config.set_dir(set_index);
            if !set_dir.join("preds.json").exists() {
                continue;
            }
            let mut args = vec![
                "judge".to_string(),
                "--output".to_string(),
                set_dir.display().to_string(),
                "--agent-config".to_string(),
                self.config.agent_config.display().to_string(),
                "--model".to_string(),
                self.config.model.clone(),
                "--benchmark".to_string(),
                self.config.benchmark.clone(),
                "--workers".to_string(),
                self.config.workers.to_string(),
                "--judge-times".to_string(),
                self.config.judge_times.to_string(),
            ];
            if !self.config.judge_models.is_empty() {
                args.push("--judge-models".to_string());
                args.push(self.config.judge_models.join(","));
            }
            if !self
                .executor
                .run_phase(&format!("judge_set{set_index}"), &args)?
            {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Validate that every expected set directory carries a preds document.
pub fn missing_sets(output_dir: &Path, required: u32) -> Vec<u32> {
    (1..=required)
        .filter(|i| !output_dir.join(format!("set{i}")).join("preds.json").exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_sets() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("set1")).unwrap();
        std::fs::write(dir.path().join("set1/preds.json"), "{}").unwrap();
        assert_eq!(missing_sets(dir.path(), 3), vec![2, 3]);
    }
}
