//! Test generation pass: drive the agent to produce a `model_test_patch` for
//! each selected instance.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use harness::benchmark::build_test_command;
use harness::patch::{filter_blocks, filter_submission, test_directives, Keep};
use harness::store::{ResultStore, StageEntry, UNKNOWN_STATUS};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::agent::{DefaultAgent, ExitStatus};
use crate::env::ContainerEnv;
use crate::traj::{save_trajectory, Trajectory};

use super::{instance_of, run_parallel, write_exit_statuses, RunContext};

/// Per-command timeout inside the agent's container.
const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Run test generation for the given instance records.
/// `iteration` numbers the generation round (`gen_0`, `gen_1`, …).
pub async fn run(ctx: &RunContext, records: Vec<Value>, iteration: u32) -> Result<usize> {
    let statuses = run_parallel(records, ctx.workers, |record| {
        let ctx = ctx.clone();
        async move {
            let id = record
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            let status = process_instance(&ctx, &record, iteration).await;
            let status = match status {
                Ok(status) => status.as_str().to_string(),
                Err(e) => {
                    error!(instance = %id, error = %e, "test generation failed");
                    format!("Error: {e}")
                }
            };
            (id, status)
        }
    })
    .await;

    write_exit_statuses(&ctx.output_dir, "test_gen", &statuses)?;
    Ok(statuses
        .values()
        .filter(|s| s.as_str() == "Submitted")
        .count())
}

async fn process_instance(
    ctx: &RunContext,
    record: &Value,
    iteration: u32,
) -> Result<ExitStatus> {
    let instance = instance_of(record).ok_or_else(|| anyhow::anyhow!("unparseable instance"))?;
    let instance_id = instance.instance_id.clone();
    let store = ResultStore::new(ctx.preds_path())?;

    // Clear any stale patch so a crash mid-run cannot leave inconsistent
    // state behind.
    if store.instance_exists(&instance_id) {
        store.update_instance(&instance_id, json!({"model_test_patch": ""}), true)?;
    }

    let traj_folder = ctx.output_dir.join("traj").join(format!("gen_{iteration}"));
    let traj_path = traj_folder
        .join(&instance_id)
        .join(format!("{instance_id}.traj.json"));
    let _ = std::fs::remove_file(&traj_path);

    let workspace = ctx
        .output_dir
        .join("env_workspaces")
        .join(&instance_id);
    let env = std::sync::Arc::new(
        ContainerEnv::start(
            ctx.engine.clone(),
            &instance,
            ctx.benchmark,
            &workspace,
            ACTION_TIMEOUT,
        )
        .await?,
    );

    let gold_patch = filter_blocks(&instance.patch, &[], Keep::Exclude);
    let gold_test_patch = filter_blocks(&instance.test_patch, &[], Keep::Exclude);

    let applied = env.apply_patch(&gold_patch).await?;
    if !applied.succeeded() {
        env.shutdown().await;
        anyhow::bail!("failed to apply gold patch to repo");
    }

    let directives = test_directives(instance.language, &instance.repo, &instance.test_patch);
    let test_command = build_test_command(&instance, ctx.benchmark, &directives)
        .unwrap_or_else(|_| String::new());

    let mut agent = DefaultAgent::new(ctx.model()?, env.clone(), ctx.config.agent.clone());
    let mut vars = BTreeMap::new();
    vars.insert("gold_patch".to_string(), gold_patch.clone());
    vars.insert("test_patch".to_string(), gold_test_patch);
    vars.insert("test_command".to_string(), test_command);
    vars.insert("workdir".to_string(), ctx.benchmark.workdir().to_string());

    let (exit_status, submission) = agent.run(&instance.problem_statement, vars).await;
    env.shutdown().await;

    let result = if exit_status == ExitStatus::Submitted {
        filter_submission(&submission, &applied.files)
    } else {
        String::new()
    };

    let trajectory = Trajectory::new(
        &exit_status,
        &submission,
        agent.messages.clone(),
        agent.model.n_calls(),
        agent.model.cost(),
    )
    .with_instance(&instance_id)
    .with_config(ctx.config.agent.clone(), agent.model.name());
    save_trajectory(&traj_path, &trajectory)?;

    record_result(&store, record, &instance_id, &result, iteration, &traj_folder)?;
    info!(instance = %instance_id, status = exit_status.as_str(), "test generation finished");
    Ok(exit_status)
}

/// Write the generation outcome: a fresh `patch_generation` stage entry, the
/// new patch value, and reset meta.
fn record_result(
    store: &ResultStore,
    record: &Value,
    instance_id: &str,
    result: &str,
    iteration: u32,
    traj_folder: &Path,
) -> Result<()> {
    let entry = StageEntry::new("patch_generation", iteration, traj_folder.display().to_string())
        .with_patch(result);
    let meta = json!({
        "hard_code_status": UNKNOWN_STATUS,
        "pass_gold_patch_status": UNKNOWN_STATUS,
        "coverage_rate": UNKNOWN_STATUS,
        "iteration": iteration,
    });

    match store.get_instance(instance_id) {
        Some(mut existing) => {
            // Append to the stage history, never rewrite it.
            let stages = existing
                .get_mut("stage")
                .and_then(Value::as_array_mut);
            match stages {
                Some(stages) => stages.push(serde_json::to_value(&entry)?),
                None => {
                    existing["stage"] = json!([serde_json::to_value(&entry)?]);
                }
            }
            existing["model_test_patch"] = Value::from(result);
            existing["meta"] = meta;
            store.update_instance(instance_id, existing, false)?;
        }
        None => {
            let mut fresh = record.clone();
            if let Value::Object(map) = &mut fresh {
                map.insert("model_test_patch".to_string(), Value::from(result));
                map.insert(
                    "model_patch".to_string(),
                    record.get("patch").cloned().unwrap_or(Value::from("")),
                );
                map.insert("stage".to_string(), json!([serde_json::to_value(&entry)?]));
                map.insert("meta".to_string(), meta);
            }
            store.update_instance(instance_id, fresh, true)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_record_result_appends_stage_history() {
        let dir = tempdir().unwrap();
        let store = ResultStore::new(dir.path().join("preds.json")).unwrap();
        let record = json!({"instance_id": "i", "patch": "diff --git a/x b/x"});

        record_result(&store, &record, "i", "diff --git a/t b/t", 0, Path::new("/traj/gen_0"))
            .unwrap();
        record_result(&store, &record, "i", "", 1, Path::new("/traj/gen_1")).unwrap();

        let saved = store.get_instance("i").unwrap();
        let stages = saved["stage"].as_array().unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0]["status"], "completed");
        assert_eq!(stages[1]["status"], "incomplete");
        assert_eq!(saved["model_test_patch"], "");
        assert_eq!(saved["meta"]["pass_gold_patch_status"], "unknown");
        // The gold patch is preserved as model_patch on creation.
        assert_eq!(saved["model_patch"], "diff --git a/x b/x");
    }
}
