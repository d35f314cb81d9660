//! Mutation augmentation pass.
//!
//! The agent gets two live containers per instance (one with the gold patch
//! applied, one with the target mutation), both carrying the current test
//! patch. It must produce augmented tests that keep passing on gold while
//! flipping the target mutation's bucket. The previous tests are preserved
//! in `last_old_model_test_patch`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use harness::benchmark::build_test_command;
use harness::patch::{apply_header_lines, filter_blocks, filter_submission, remove_conflicting_chunks, test_directives, Keep};
use harness::store::ResultStore;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::agent::{DefaultAgent, ExitStatus};
use crate::env::{ContainerEnv, Environment};
use crate::traj::{save_trajectory, Trajectory};

use super::{instance_of, run_parallel, write_exit_statuses, RunContext};

const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Environment names presented to the agent.
const GOLD_ENV: &str = "Gold";
const MUTATED_ENV: &str = "Mutated";

/// Options for one aug pass.
#[derive(Debug, Clone)]
pub struct AugOptions {
    /// `no_equ_mutation_aug` or `equ_mutation_aug`.
    pub stage_name: String,
    pub iteration: u32,
}

impl AugOptions {
    /// The mutation bucket this stage reworks.
    pub fn use_key(&self) -> Result<&'static str> {
        match self.stage_name.as_str() {
            "no_equ_mutation_aug" => Ok("run_success_no_equ"),
            "equ_mutation_aug" => Ok("run_fail_equ"),
            other => anyhow::bail!("stage_name must be no_equ_mutation_aug or equ_mutation_aug, got '{other}'"),
        }
    }

    pub fn save_name(&self) -> String {
        format!("{}_{}", self.stage_name, self.iteration)
    }
}

/// The effective mutation_info of a record: a previous aug evaluation's view
/// wins over the merge-phase view.
pub fn effective_mutation_info(record: &Value) -> Option<&Value> {
    record
        .get("mutation_aug_evaluation_info")
        .and_then(|info| info.get("mutation_info"))
        .or_else(|| record.get("mutation_info"))
}

/// Records whose target bucket is non-empty.
pub fn filter_needs_aug(records: Vec<Value>, use_key: &str) -> Vec<Value> {
    records
        .into_iter()
        .filter(|record| {
            effective_mutation_info(record)
                .and_then(|info| info.get(use_key))
                .and_then(Value::as_array)
                .map(|bucket| !bucket.is_empty())
                .unwrap_or(false)
        })
        .collect()
}

/// Run an aug pass; results land in `preds_<stage>_<iteration>.json` under
/// the output directory.
pub async fn run(ctx: &RunContext, records: Vec<Value>, options: &AugOptions) -> Result<usize> {
    let use_key = options.use_key()?;
    let records = filter_needs_aug(records, use_key);
    let preds_out = ctx
        .output_dir
        .join(format!("preds_{}.json", options.save_name()));

    let statuses = run_parallel(records, ctx.workers, |record| {
        let ctx = ctx.clone();
        let options = options.clone();
        let preds_out = preds_out.clone();
        async move {
            let id = record
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            let status = match process_instance(&ctx, &record, &options, &preds_out).await {
                Ok(status) => status.as_str().to_string(),
                Err(e) => {
                    error!(instance = %id, error = %e, "aug pass failed");
                    format!("Error: {e}")
                }
            };
            (id, status)
        }
    })
    .await;

    write_exit_statuses(&ctx.output_dir, &options.save_name(), &statuses)?;
    Ok(statuses
        .values()
        .filter(|s| s.as_str() == "Submitted")
        .count())
}

async fn process_instance(
    ctx: &RunContext,
    record: &Value,
    options: &AugOptions,
    preds_out: &Path,
) -> Result<ExitStatus> {
    let instance = instance_of(record).ok_or_else(|| anyhow::anyhow!("unparseable instance"))?;
    let instance_id = instance.instance_id.clone();
    let use_key = options.use_key()?;
    let store = ResultStore::new(preds_out)?;
    if store.instance_exists(&instance_id) {
        store.update_instance(&instance_id, json!({"model_test_patch": ""}), true)?;
    }

    let model_test_patch = record
        .get("model_test_patch")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    // First key in the target bucket is this iteration's aug target.
    let target_key = effective_mutation_info(record)
        .and_then(|info| info.get(use_key))
        .and_then(Value::as_array)
        .and_then(|bucket| bucket.first())
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("no aug target in bucket {use_key}"))?
        .to_string();
    let mutation = record
        .get("all_mutatation_patch")
        .and_then(|m| m.get(&target_key))
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("mutation {target_key} missing from all_mutatation_patch"))?;
    let mutation_patch = mutation
        .get("model_patch")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let mutation_thinking = mutation
        .get("mutation_thinking")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let gold_patch = filter_blocks(&instance.patch, &[], Keep::Exclude);
    let gold_patch = remove_conflicting_chunks(&gold_patch, &model_test_patch);
    let mutation_patch = remove_conflicting_chunks(&mutation_patch, &model_test_patch);

    let workspace_root = ctx
        .output_dir
        .join("env_workspaces")
        .join(format!("{instance_id}_{}", options.save_name()));
    let gold_env = std::sync::Arc::new(
        ContainerEnv::start(
            ctx.engine.clone(),
            &instance,
            ctx.benchmark,
            &workspace_root.join("gold"),
            ACTION_TIMEOUT,
        )
        .await?,
    );
    let mutated_env = std::sync::Arc::new(
        ContainerEnv::start(
            ctx.engine.clone(),
            &instance,
            ctx.benchmark,
            &workspace_root.join("mutated"),
            ACTION_TIMEOUT,
        )
        .await?,
    );

    let shutdown = |gold: std::sync::Arc<ContainerEnv>, mutated: std::sync::Arc<ContainerEnv>| async move {
        gold.shutdown().await;
        mutated.shutdown().await;
    };

    // Tests first, then the code patch, in both containers.
    let tests_on_gold = gold_env.apply_patch(&model_test_patch).await?;
    let gold_applied = gold_env.apply_patch(&gold_patch).await?;
    let tests_on_mutated = mutated_env.apply_patch(&model_test_patch).await?;
    let mutation_applied = mutated_env.apply_patch(&mutation_patch).await?;
    if !tests_on_gold.succeeded()
        || !gold_applied.succeeded()
        || !tests_on_mutated.succeeded()
        || !mutation_applied.succeeded()
    {
        shutdown(gold_env, mutated_env).await;
        anyhow::bail!("failed to apply patch to repo");
    }

    let directives = test_directives(instance.language, &instance.repo, &model_test_patch);
    let test_command =
        build_test_command(&instance, ctx.benchmark, &directives).unwrap_or_default();

    let mut envs: BTreeMap<String, std::sync::Arc<dyn Environment>> = BTreeMap::new();
    envs.insert(GOLD_ENV.to_string(), gold_env.clone());
    envs.insert(MUTATED_ENV.to_string(), mutated_env.clone());
    let mut agent = DefaultAgent::with_envs(ctx.model()?, envs, ctx.config.agent.clone());

    let mut vars = BTreeMap::new();
    vars.insert("test_patch".to_string(), model_test_patch.clone());
    vars.insert("gold_patch".to_string(), gold_patch);
    vars.insert("mutation_patch".to_string(), mutation_patch);
    vars.insert("mutation_thinking".to_string(), mutation_thinking);
    vars.insert("test_command".to_string(), test_command);
    vars.insert("workdir".to_string(), ctx.benchmark.workdir().to_string());

    let (exit_status, submission) = agent.run(&instance.problem_statement, vars).await;
    shutdown(gold_env, mutated_env).await;

    let result = if exit_status == ExitStatus::Submitted {
        filter_submission(&submission, &apply_header_lines(&instance.patch))
    } else {
        String::new()
    };

    let traj_folder = ctx.output_dir.join("traj").join(options.save_name());
    let traj_path = traj_folder
        .join(&instance_id)
        .join(format!("{instance_id}.traj.json"));
    let trajectory = Trajectory::new(
        &exit_status,
        &submission,
        agent.messages.clone(),
        agent.model.n_calls(),
        agent.model.cost(),
    )
    .with_instance(&instance_id)
    .with_config(ctx.config.agent.clone(), agent.model.name())
    .with_target_mutation(mutation.clone());
    save_trajectory(&traj_path, &trajectory)?;

    // The augmented tests replace the current ones; the old value is kept.
    let mut out = record.clone();
    if let Value::Object(map) = &mut out {
        map.insert(
            "last_old_model_test_patch".to_string(),
            Value::from(model_test_patch),
        );
        map.insert("model_test_patch".to_string(), Value::from(result));
        map.insert(
            "aug_meta".to_string(),
            json!({
                "stage_name": options.stage_name,
                "iteration": options.iteration,
                "target_aug_key": target_key,
                "outputs": traj_folder.display().to_string(),
                "status": "completed",
            }),
        );
        map.remove("mutation_aug_evaluation_info");
    }
    store.update_instance(&instance_id, out, false)?;

    info!(instance = %instance_id, target = %target_key, status = exit_status.as_str(), "aug pass finished");
    Ok(exit_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_use_key_mapping() {
        assert_eq!(
            AugOptions {
                stage_name: "no_equ_mutation_aug".into(),
                iteration: 0
            }
            .use_key()
            .unwrap(),
            "run_success_no_equ"
        );
        assert_eq!(
            AugOptions {
                stage_name: "equ_mutation_aug".into(),
                iteration: 1
            }
            .use_key()
            .unwrap(),
            "run_fail_equ"
        );
        assert!(AugOptions {
            stage_name: "other".into(),
            iteration: 0
        }
        .use_key()
        .is_err());
    }

    #[test]
    fn test_filter_needs_aug_prefers_aug_eval_view() {
        let records = vec![
            // Merge view says needs aug, but the aug evaluation cleared it.
            json!({
                "instance_id": "done",
                "mutation_info": {"run_success_no_equ": ["m_1"]},
                "mutation_aug_evaluation_info": {"mutation_info": {"run_success_no_equ": []}},
            }),
            json!({
                "instance_id": "pending",
                "mutation_info": {"run_success_no_equ": ["m_2"]},
            }),
        ];
        let filtered = filter_needs_aug(records, "run_success_no_equ");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["instance_id"], "pending");
    }
}
