//! Container evaluation passes.
//!
//! Four modes share one flow (apply patches → run tests → parse → write back
//! through the store):
//!
//! - **Gold**: gold patch + model test patch; annotates
//!   `meta.pass_gold_patch_status` and the tail stage entry, optionally with
//!   coverage.
//! - **InitTest**: mutation patch + *gold* test patch; a mutation that still
//!   passes the suite is a viable candidate
//!   (`evaluation_info.pass_init_test_status`).
//! - **Mutation**: every judged mutation + the model test patch; classifies
//!   mutation keys into the `mutation_info` buckets and materialises
//!   `pred_mutation.json`.
//! - **Aug**: like Mutation, against the augmented tests; writes
//!   `mutation_aug_evaluation_info` so the aug loop can converge.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use harness::benchmark::build_test_command;
use harness::container::{run_evaluation, ContainerLimits, EvalOutcome, EvalRequest, RunnerError};
use harness::coverage::{
    compute_coverage, parse_workspace_coverage, CoverageOutcome, MustCoverKey, MustCoverMap,
};
use harness::logparse::{analyze_output_json, analyze_status_map, parser_for};
use harness::patch::remove_conflicting_chunks;
use harness::store::{EvaluationInfo, ResultStore, FAIL_STATUS, SUCCESS_STATUS};
use harness::Instance;
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::{instance_of, RunContext};

/// Which evaluation flavour to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Gold { coverage: bool },
    InitTest,
    Mutation,
    Aug,
}

/// Options shared by the evaluation passes.
#[derive(Debug, Clone)]
pub struct EvalOptions {
    pub mode: EvalMode,
    pub run_id: String,
    pub redo: bool,
    pub block_network: bool,
    pub mem_limit: String,
    pub timeout_secs: u64,
    pub platform: Option<String>,
    /// Precomputed must-cover map file (instance → file → record).
    pub must_cover_file: Option<PathBuf>,
    /// For Aug: which bucket and stage are being reworked.
    pub stage_name: Option<String>,
    pub iteration: u32,
}

/// Per-instance evaluation result before store write-back.
#[derive(Debug, Clone)]
struct InstanceEval {
    instance_id: String,
    failed: Vec<String>,
    error: Option<String>,
    timed_out: bool,
    log_dir: PathBuf,
    coverage: Option<CoverageOutcome>,
    /// Mutation-mode: per-mutation-key pass/fail/error.
    mutation_runs: BTreeMap<String, MutationRunOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MutationRunOutcome {
    Pass,
    Fail,
    Error,
}

fn save_dir_for(mode: EvalMode) -> &'static str {
    match mode {
        EvalMode::Gold { .. } => "eval_gold_patch",
        EvalMode::InitTest => "eval_init_test",
        EvalMode::Mutation => "eval_mutation",
        EvalMode::Aug => "eval_mutation_aug",
    }
}

fn load_must_cover(options: &EvalOptions) -> Result<BTreeMap<String, MustCoverMap>> {
    let Some(path) = &options.must_cover_file else {
        return Ok(BTreeMap::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading must-cover file {}", path.display()))?;
    Ok(serde_json::from_str(&text)?)
}

async fn evaluate_instance(
    ctx: &RunContext,
    record: &Value,
    options: &EvalOptions,
    eval_root: &Path,
    must_cover: &BTreeMap<String, MustCoverMap>,
) -> Result<InstanceEval> {
    let instance = instance_of(record).ok_or_else(|| anyhow::anyhow!("unparseable instance"))?;
    let instance_id = instance.instance_id.clone();
    let log_dir = eval_root.join(&instance_id);

    let mut eval = InstanceEval {
        instance_id: instance_id.clone(),
        failed: Vec::new(),
        error: None,
        timed_out: false,
        log_dir: log_dir.clone(),
        coverage: None,
        mutation_runs: BTreeMap::new(),
    };

    match options.mode {
        EvalMode::Gold { coverage } => {
            let model_test_patch = field(record, "model_test_patch");
            let gold = remove_conflicting_chunks(&instance.patch, &model_test_patch);
            let outcome = run_one(
                ctx,
                &instance,
                &log_dir.join("gold_patch"),
                "gold_with_model_test",
                vec![
                    ("patch.diff".to_string(), gold),
                    ("test_patch.diff".to_string(), model_test_patch.clone()),
                ],
                "model_test_patch",
                record,
                options,
            )
            .await;
            apply_outcome(&mut eval, &instance, "gold_with_model_test", outcome, options.timeout_secs);

            if coverage && eval.failed.is_empty() {
                let workspace = log_dir.join("gold_patch").join("workspace");
                let instance_must_cover = must_cover.get(&instance_id);
                eval.coverage = Some(compute_instance_coverage(
                    ctx.benchmark.workdir(),
                    &workspace,
                    instance_must_cover,
                ));
            }
        }
        EvalMode::InitTest => {
            let model_patch = field(record, "model_patch");
            let gold_tests = remove_conflicting_chunks(&instance.test_patch, &model_patch);
            let outcome = run_one(
                ctx,
                &instance,
                &log_dir.join("init_test"),
                "mutation_with_gold_test",
                vec![
                    ("patch.diff".to_string(), model_patch),
                    ("test_patch.diff".to_string(), gold_tests),
                ],
                "test_patch",
                record,
                options,
            )
            .await;
            apply_outcome(&mut eval, &instance, "mutation_with_gold_test", outcome, options.timeout_secs);
        }
        EvalMode::Mutation | EvalMode::Aug => {
            let model_test_patch = field(record, "model_test_patch");
            let mutations = record
                .get("all_mutatation_patch")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            for (mutation_key, mutation) in mutations {
                let model_patch = mutation
                    .get("model_patch")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let model_patch = remove_conflicting_chunks(&model_patch, &model_test_patch);
                let outcome = run_one(
                    ctx,
                    &instance,
                    &log_dir.join(&mutation_key),
                    "mutation_with_model_test",
                    vec![
                        ("patch.diff".to_string(), model_patch),
                        ("test_patch.diff".to_string(), model_test_patch.clone()),
                    ],
                    "model_test_patch",
                    record,
                    options,
                )
                .await;
                let run_outcome = match outcome {
                    Ok(outcome) => {
                        let (failed, _) = analyze(&outcome, &instance, "mutation_with_model_test");
                        if outcome.timed_out || outcome.output.is_none() {
                            MutationRunOutcome::Error
                        } else if failed.is_empty() {
                            MutationRunOutcome::Pass
                        } else {
                            MutationRunOutcome::Fail
                        }
                    }
                    Err(e) => {
                        warn!(instance = %instance_id, mutation = %mutation_key, error = %e, "mutation evaluation failed");
                        MutationRunOutcome::Error
                    }
                };
                eval.mutation_runs.insert(mutation_key, run_outcome);
            }
        }
    }

    Ok(eval)
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    ctx: &RunContext,
    instance: &Instance,
    log_dir: &Path,
    prefix: &str,
    patches: Vec<(String, String)>,
    directives_from: &str,
    record: &Value,
    options: &EvalOptions,
) -> Result<EvalOutcome, RunnerError> {
    std::fs::create_dir_all(log_dir)?;

    let directives_diff = field(record, directives_from);
    let mut directives = harness::patch::test_directives(
        instance.language,
        &instance.repo,
        &directives_diff,
    );
    if directives.is_empty() {
        // Fall back to the dataset's selected test files.
        directives = instance.selected_test_files_to_run.clone();
    }
    let test_command = build_test_command(instance, ctx.benchmark, &directives)
        .unwrap_or_else(|_| format!("bash /workspace/run_script.sh {}", directives.join(",")));
    // Coverage runs flip the run script into tracing mode.
    let test_command = if matches!(options.mode, EvalMode::Gold { coverage: true }) {
        format!("USE_COVERAGE=1 {test_command}")
    } else {
        test_command
    };

    let request = EvalRequest {
        instance: instance.clone(),
        benchmark: ctx.benchmark,
        patches,
        prefix: prefix.to_string(),
        log_dir: log_dir.to_path_buf(),
        scripts_dir: ctx.scripts_dir.clone(),
        test_command,
        limits: ContainerLimits {
            mem_limit: options.mem_limit.clone(),
            cpus: 8,
            timeout: std::time::Duration::from_secs(options.timeout_secs),
        },
        block_network: options.block_network,
        platform: options.platform.clone(),
        redo: options.redo,
    };
    run_evaluation(ctx.engine.as_ref(), &request).await
}

fn field(record: &Value, key: &str) -> String {
    record
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Derive the failed-test list for a run: the in-container parser's
/// `output.json` when present, else the host-side framework parser over the
/// collected stdout log, else a synthetic error entry.
fn analyze(outcome: &EvalOutcome, instance: &Instance, prefix: &str) -> (Vec<String>, BTreeMap<String, String>) {
    if let Some(output) = &outcome.output {
        return analyze_output_json(output);
    }

    let stdout_log = outcome.log_dir.join(format!("{prefix}_stdout.log"));
    let log_text = std::fs::read_to_string(&stdout_log).unwrap_or_default();
    if let Some(parser) = parser_for(instance.language, &instance.repo) {
        let status_map = parser.parse(&log_text);
        if !status_map.is_empty() {
            let failed = analyze_status_map(&status_map);
            let map = status_map
                .iter()
                .map(|(name, status)| (name.clone(), status.as_str().to_string()))
                .collect();
            return (failed, map);
        }
    }

    (
        vec!["RUN TEST ERROR - No output generated".to_string()],
        BTreeMap::new(),
    )
}

fn apply_outcome(
    eval: &mut InstanceEval,
    instance: &Instance,
    prefix: &str,
    outcome: Result<EvalOutcome, RunnerError>,
    timeout_secs: u64,
) {
    match outcome {
        Ok(outcome) if outcome.timed_out => {
            eval.timed_out = true;
            eval.failed = vec![format!("TIMEOUT - Container exceeded {timeout_secs}s limit")];
        }
        Ok(outcome) => {
            let (failed, _) = analyze(&outcome, instance, prefix);
            eval.failed = failed;
        }
        Err(e) => {
            eval.failed = vec![format!("RUN TEST ERROR - {e}")];
            eval.error = Some(e.to_string());
        }
    }
}

/// Gold-mode write-back: meta fields plus the tail stage entry's
/// `evaluation_info`.
fn write_back_gold(store: &ResultStore, eval: &InstanceEval, coverage_requested: bool) -> Result<()> {
    let pass = eval.failed.is_empty();
    let status = if pass { SUCCESS_STATUS } else { FAIL_STATUS };

    let (coverage_rate, uncovered): (Value, Value) = match &eval.coverage {
        Some(CoverageOutcome::Rate { rate, uncovered }) => (
            json!(rate),
            serde_json::to_value(uncovered).unwrap_or_else(|_| json!({})),
        ),
        Some(CoverageOutcome::Unknown) | None => (json!("unknown"), json!({})),
    };

    store.update_instance_nested(
        &eval.instance_id,
        vec![
            ("meta.pass_gold_patch_status".to_string(), json!(status)),
            ("meta.coverage_rate".to_string(), coverage_rate.clone()),
            ("meta.uncovered_lines".to_string(), uncovered.clone()),
        ],
    )?;

    let evaluation_info = serde_json::to_value(EvaluationInfo {
        status: "completed".to_string(),
        pass_gold_patch_status: Some(status.to_string()),
        pass_init_test_status: None,
        outputs: eval.log_dir.display().to_string(),
        error_info: Some(eval.error.clone().unwrap_or_default()),
        coverage_rate: Some(if coverage_requested {
            coverage_rate
        } else {
            json!("unknown")
        }),
        uncovered_lines: Some(uncovered),
        fail: Some(eval.failed.clone()),
    })?;

    // Attach to the tail stage entry exactly once; an empty history is left
    // alone (nothing to annotate).
    let has_stages = store
        .get_instance(&eval.instance_id)
        .and_then(|record| {
            record
                .get("stage")
                .and_then(Value::as_array)
                .map(|s| !s.is_empty())
        })
        .unwrap_or(false);
    if has_stages {
        store.update_instance_nested(
            &eval.instance_id,
            vec![("stage.-1.evaluation_info".to_string(), evaluation_info)],
        )?;
    }
    Ok(())
}

/// InitTest-mode write-back.
fn write_back_init_test(store: &ResultStore, eval: &InstanceEval) -> Result<()> {
    let pass = eval.failed.is_empty();
    let info = EvaluationInfo {
        status: if eval.error.is_some() {
            "uncompleted".to_string()
        } else {
            "completed".to_string()
        },
        pass_gold_patch_status: None,
        pass_init_test_status: Some(if pass { SUCCESS_STATUS } else { FAIL_STATUS }.to_string()),
        outputs: eval.log_dir.display().to_string(),
        error_info: None,
        coverage_rate: None,
        uncovered_lines: None,
        fail: None,
    };
    store.update_instance(
        &eval.instance_id,
        json!({ "evaluation_info": serde_json::to_value(info)? }),
        true,
    )?;
    Ok(())
}

/// Mutation/Aug-mode write-back: classify each mutation key into the five
/// buckets. Keys prefixed `equ` never count toward the non-equivalent
/// buckets.
fn mutation_info_for(record: &Value, runs: &BTreeMap<String, MutationRunOutcome>) -> Value {
    let mut info = json!({
        "run_success_equ": [],
        "run_fail_equ": [],
        "run_success_no_equ": [],
        "run_fail_no_equ": [],
        "run_error": [],
    });

    let patches = record
        .get("all_mutatation_patch")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for (key, outcome) in runs {
        let is_equ = patches
            .get(key)
            .and_then(|m| m.get("isequ"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let bucket = match (outcome, is_equ) {
            (MutationRunOutcome::Error, _) => "run_error",
            (MutationRunOutcome::Pass, true) => "run_success_equ",
            (MutationRunOutcome::Fail, true) => "run_fail_equ",
            (MutationRunOutcome::Pass, false) => {
                if key.starts_with("equ") {
                    continue;
                }
                "run_success_no_equ"
            }
            (MutationRunOutcome::Fail, false) => {
                if key.starts_with("equ") {
                    continue;
                }
                "run_fail_no_equ"
            }
        };
        if let Some(list) = info.get_mut(bucket).and_then(Value::as_array_mut) {
            list.push(Value::from(key.clone()));
        }
    }

    info
}

/// Run an evaluation pass sequentially writing back results. This is the
/// entry the subcommands call.
pub async fn run_with_writeback(
    ctx: &RunContext,
    preds_path: &Path,
    records: Vec<Value>,
    options: &EvalOptions,
) -> Result<EvalStats> {
    let eval_root = ctx
        .output_dir
        .join("eval_logs")
        .join(save_dir_for(options.mode))
        .join(&options.run_id);
    std::fs::create_dir_all(&eval_root)?;

    let must_cover = load_must_cover(options)?;
    let store = ResultStore::new(preds_path)?;

    let mut stats = EvalStats::default();
    let evals: Vec<(Value, Result<InstanceEval>)> =
        futures::stream::iter(records.into_iter().map(|record| {
            let ctx = ctx.clone();
            let options = options.clone();
            let eval_root = eval_root.clone();
            let must_cover = must_cover.clone();
            async move {
                let eval =
                    evaluate_instance(&ctx, &record, &options, &eval_root, &must_cover).await;
                (record, eval)
            }
        }))
        .buffer_unordered(ctx.workers.max(1))
        .collect()
        .await;

    for (record, eval) in evals {
        let instance_id = record
            .get("instance_id")
            .and_then(Value::as_str)
            .unwrap_or("<no id>")
            .to_string();
        let eval = match eval {
            Ok(eval) => eval,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "evaluation errored");
                stats.error += 1;
                continue;
            }
        };

        match options.mode {
            EvalMode::Gold { coverage } => {
                if eval.failed.is_empty() {
                    stats.pass += 1;
                } else if eval.error.is_some() || eval.timed_out {
                    stats.error += 1;
                } else {
                    stats.fail += 1;
                }
                write_back_gold(&store, &eval, coverage)?;
            }
            EvalMode::InitTest => {
                if eval.failed.is_empty() {
                    stats.pass += 1;
                } else {
                    stats.fail += 1;
                }
                write_back_init_test(&store, &eval)?;
            }
            EvalMode::Mutation => {
                let info = mutation_info_for(&record, &eval.mutation_runs);
                let mut out = record.clone();
                if let Value::Object(map) = &mut out {
                    map.remove("meta");
                    map.remove("stage");
                    map.insert("mutation_info".to_string(), info);
                }
                store.update_instance(&instance_id, out, false)?;
                stats.pass += 1;
            }
            EvalMode::Aug => {
                let info = mutation_info_for(&record, &eval.mutation_runs);
                let mut out = record.clone();
                if let Value::Object(map) = &mut out {
                    map.insert(
                        "mutation_aug_evaluation_info".to_string(),
                        json!({ "mutation_info": info }),
                    );
                }
                store.update_instance(&instance_id, out, false)?;
                stats.pass += 1;
            }
        }
    }

    info!(
        pass = stats.pass,
        fail = stats.fail,
        error = stats.error,
        mode = ?options.mode,
        "evaluation pass finished"
    );
    Ok(stats)
}

/// Compare the run's coverage artefacts against the precomputed must-cover
/// map.
fn compute_instance_coverage(
    workdir: &str,
    workspace: &Path,
    must_cover: Option<&MustCoverMap>,
) -> CoverageOutcome {
    let Some(must_cover) = must_cover else {
        return CoverageOutcome::Unknown;
    };

    let source_lookup = |path: &str| -> Option<String> {
        must_cover.get(path).map(|record| record.content.clone())
    };
    let report = match parse_workspace_coverage(workspace, workdir, &source_lookup) {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "coverage report parse failed");
            None
        }
    };
    compute_coverage(must_cover, report.as_ref(), MustCoverKey::SliceScope)
}

/// Aggregate pass/fail/error counts of one evaluation pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalStats {
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
}

/// Assemble the merge-phase input: stage 1 records joined with every set's
/// judged mutations.
///
/// A mutation is usable when its init test passed and the judge found it
/// relevant. The mutation key is the set directory name; `isequ` is the
/// negation of the judge's validity verdict. Finding the same key twice for
/// one instance is a caller error.
pub fn assemble_mutation_records(
    stage1_records: Vec<Value>,
    mutation_paths: &[PathBuf],
) -> Result<Vec<Value>> {
    let mut per_instance: BTreeMap<String, Map<String, Value>> = BTreeMap::new();

    for path in mutation_paths {
        let mutation_key = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "set".to_string());
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading mutation preds {}", path.display()))?;
        let document: Value = serde_json::from_str(&text)?;
        let Value::Object(map) = document else {
            anyhow::bail!("mutation preds {} is not an object", path.display());
        };

        for (instance_id, record) in map {
            let init_pass = record
                .get("evaluation_info")
                .and_then(|e| e.get("pass_init_test_status"))
                .and_then(Value::as_str)
                == Some(SUCCESS_STATUS);
            if !init_pass {
                continue;
            }
            let judge = record
                .get("judge_info")
                .with_context(|| format!("{instance_id} in {} has no judge_info; run the judge first", path.display()))?;
            if judge.get("isrele").and_then(Value::as_bool) == Some(false) {
                continue;
            }
            let isequ = !judge.get("isvalid").and_then(Value::as_bool).unwrap_or(true);

            let entry = per_instance.entry(instance_id.clone()).or_default();
            if entry.contains_key(&mutation_key) {
                anyhow::bail!("duplicate mutation key {mutation_key} for {instance_id}");
            }
            entry.insert(
                mutation_key.clone(),
                json!({
                    "mutation_key": mutation_key,
                    "model_patch": record.get("model_patch").cloned().unwrap_or(Value::from("")),
                    "mutation_thinking": record
                        .get("mutation_thinking")
                        .cloned()
                        .unwrap_or(Value::from("")),
                    "isequ": isequ,
                }),
            );
        }
    }

    Ok(stage1_records
        .into_iter()
        .filter_map(|mut record| {
            let id = record.get("instance_id").and_then(Value::as_str)?.to_string();
            let has_tests = record
                .get("model_test_patch")
                .and_then(Value::as_str)
                .map(|p| !p.trim().is_empty())
                .unwrap_or(false);
            let mutations = per_instance.get(&id)?;
            if !has_tests {
                return None;
            }
            if let Value::Object(map) = &mut record {
                map.insert(
                    "all_mutatation_patch".to_string(),
                    Value::Object(mutations.clone()),
                );
            }
            Some(record)
        })
        .collect())
}
