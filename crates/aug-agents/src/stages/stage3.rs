//! Stage 3: mutation augmentation.
//!
//! Phases: `merge → aug_no_equ → aug_equ`. The merge combines stage 1's
//! final record with every stage 2 set into `pred_mutation.json`; the aug
//! phases then iterate agent generation plus re-evaluation until each
//! instance's target bucket is empty or retries are exhausted (non-fatal:
//! the pipeline continues with whatever was achieved).

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::runs::aug::{effective_mutation_info, filter_needs_aug};

use super::{settle, should_run_phase, PhaseExecutor, StageReport};

pub const STAGE3_PHASES: &[&str] = &["merge", "aug_no_equ", "aug_equ"];

/// Per-phase aug configuration: stage names match the aug driver's.
const AUG_STAGE_NAMES: &[(&str, &str, &str)] = &[
    ("aug_no_equ", "no_equ_mutation_aug", "run_success_no_equ"),
    ("aug_equ", "equ_mutation_aug", "run_fail_equ"),
];

#[derive(Debug, Clone)]
pub struct Stage3Config {
    pub output_dir: PathBuf,
    pub stage1_preds: PathBuf,
    /// Stage 2 base directory containing `set1/ … setN/`.
    pub stage2_output_dir: PathBuf,
    pub scripts_dir: PathBuf,
    pub agent_config: PathBuf,
    pub model: String,
    pub benchmark: String,
    pub workers: usize,
    pub eval_workers: usize,
    pub run_id: String,
    pub required_mutations: u32,
    pub max_aug_retries: u32,
    pub start_from_phase: Option<String>,
}

impl Stage3Config {
    pub fn pred_mutation_path(&self) -> PathBuf {
        self.output_dir.join("pred_mutation.json")
    }

    fn aug_preds_path(&self, stage_name: &str, iteration: u32) -> PathBuf {
        self.output_dir
            .join(format!("preds_{stage_name}_{iteration}.json"))
    }
}

pub struct Stage3Orchestrator {
    config: Stage3Config,
    executor: PhaseExecutor,
}

impl Stage3Orchestrator {
    pub fn new(config: Stage3Config) -> Result<Self> {
        std::fs::create_dir_all(&config.output_dir)?;
        let executor = PhaseExecutor::new(&config.output_dir);
        Ok(Self { config, executor })
    }

    fn should_run(&self, phase: &str) -> bool {
        should_run_phase(STAGE3_PHASES, phase, self.config.start_from_phase.as_deref())
    }

    pub async fn run(&mut self) -> Result<bool> {
        info!("starting stage 3 (mutation augmentation)");
        let mut report = StageReport::new("stage3");
        let outcome = self.run_phases(&mut report).await;
        report.save(&self.config.output_dir, "stage3_report.json")?;
        outcome
    }

    async fn run_phases(&mut self, report: &mut StageReport) -> Result<bool> {
        if self.should_run("merge") {
            if !self.phase_merge().await? {
                report.phases_failed.push("merge".to_string());
                return Ok(false);
            }
            report.phases_completed.push("merge".to_string());
        } else if !self.config.pred_mutation_path().exists() {
            // Resuming past merge requires its artefact.
            bail!(
                "cannot start from an aug phase: {} does not exist",
                self.config.pred_mutation_path().display()
            );
        }

        for (phase, stage_name, use_key) in AUG_STAGE_NAMES {
            if !self.should_run(phase) {
                info!(phase, "skipping (resume point)");
                continue;
            }
            self.phase_aug(stage_name, use_key).await?;
            report.phases_completed.push(phase.to_string());
        }

        Ok(true)
    }

    /// Merge: evaluate every judged mutation against the current tests and
    /// materialise `pred_mutation.json` with `mutation_info` and
    /// `all_mutatation_patch`.
    async fn phase_merge(&mut self) -> Result<bool> {
        let set_paths: Vec<String> = (1..=self.config.required_mutations)
            .map(|i| {
                self.config
                    .stage2_output_dir
                    .join(format!("set{i}"))
                    .join("preds.json")
                    .display()
                    .to_string()
            })
            .filter(|p| Path::new(p).exists())
            .collect();
        if set_paths.is_empty() {
            warn!("no stage 2 set preds found, cannot merge");
            return Ok(false);
        }

        let args = vec![
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
            format!("{}_merge", self.config.run_id),
            "--mode".to_string(),
            "mutation".to_string(),
            "--dataset".to_string(),
            self.config.stage1_preds.display().to_string(),
            "--mutation-paths".to_string(),
            set_paths.join(","),
            "--preds-out".to_string(),
            self.config.pred_mutation_path().display().to_string(),
            "--redo".to_string(),
        ];
        let ok = self.executor.run_phase("merge", &args)?;
        settle().await;
        Ok(ok && self.config.pred_mutation_path().exists())
    }

    /// One aug phase: `required_mutations` iterations, each with up to
    /// `max_aug_retries` generate+evaluate loops over the not-yet-converged
    /// subset.
    async fn phase_aug(&mut self, stage_name: &str, use_key: &str) -> Result<()> {
        let mut input = self.config.pred_mutation_path();

        for iteration in 0..self.config.required_mutations {
            let remaining = count_needing_aug(&input, use_key)?;
            if remaining == 0 {
                info!(stage_name, iteration, "no instances need augmentation");
                break;
            }
            info!(stage_name, iteration, remaining, "aug iteration starting");

            for retry in 0..=self.config.max_aug_retries {
                let gen_args = self.aug_gen_args(stage_name, iteration, &input, retry > 0)?;
                self.executor
                    .run_phase(&format!("aug_gen_{stage_name}_{iteration}"), &gen_args)?;
                settle().await;

                let preds = self.config.aug_preds_path(stage_name, iteration);
                if !preds.exists() {
                    warn!(stage_name, iteration, "aug driver produced no preds");
                    continue;
                }
                let eval_args = self.aug_eval_args(stage_name, iteration, &preds);
                self.executor
                    .run_phase(&format!("aug_eval_{stage_name}_{iteration}"), &eval_args)?;
                settle().await;

                let still_failing = count_needing_aug(&preds, use_key)?;
                if still_failing == 0 {
                    break;
                }
                info!(
                    stage_name,
                    iteration,
                    retry,
                    still_failing,
                    "aug retry loop continuing"
                );
            }

            // The next iteration consumes this iteration's evaluated preds.
            let produced = self.config.aug_preds_path(stage_name, iteration);
            if produced.exists() {
                input = produced;
            }
        }
        Ok(())
    }

    fn aug_gen_args(
        &self,
        stage_name: &str,
        iteration: u32,
        input: &Path,
        is_retry: bool,
    ) -> Result<Vec<String>> {
        let mut args = vec![
            "aug".to_string(),
            "--output".to_string(),
            self.config.output_dir.display().to_string(),
            "--dataset".to_string(),
            input.display().to_string(),
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
            "--stage-name".to_string(),
            stage_name.to_string(),
            "--iteration".to_string(),
            iteration.to_string(),
        ];
        if is_retry {
            args.push("--redo-fail-instances".to_string());
        }
        Ok(args)
    }

    fn aug_eval_args(&self, stage_name: &str, iteration: u32, preds: &Path) -> Vec<String> {
        vec![
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
            format!("{}_{stage_name}_{iteration}", self.config.run_id),
            "--mode".to_string(),
            "aug".to_string(),
            "--dataset".to_string(),
            preds.display().to_string(),
            "--preds-out".to_string(),
            preds.display().to_string(),
            "--redo".to_string(),
        ]
    }
}

/// How many instances in a preds document still carry aug targets in the
/// given bucket.
fn count_needing_aug(preds_path: &Path, use_key: &str) -> Result<usize> {
    let text = match std::fs::read_to_string(preds_path) {
        Ok(text) => text,
        Err(_) => return Ok(0),
    };
    let document: Value = serde_json::from_str(&text)?;
    let records: Vec<Value> = match document {
        Value::Object(map) => map.into_values().collect(),
        Value::Array(items) => items,
        _ => return Ok(0),
    };
    Ok(filter_needs_aug(records, use_key).len())
}

/// Whether an instance has fully converged: both target buckets empty.
pub fn instance_done(record: &Value) -> bool {
    AUG_STAGE_NAMES.iter().all(|(_, _, use_key)| {
        effective_mutation_info(record)
            .and_then(|info| info.get(use_key))
            .and_then(Value::as_array)
            .map(|bucket| bucket.is_empty())
            .unwrap_or(true)
    })
}
