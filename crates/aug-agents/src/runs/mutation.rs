//! Mutation generation pass.
//!
//! The agent is given the gold patch, the gold tests, and the instance's
//! test command, and asked for a semantically different `model_patch` that
//! still compiles and satisfies the existing suite. Results land in a
//! per-set preds document (`set1/preds.json`, `set2/preds.json`, …).

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use harness::benchmark::build_test_command;
use harness::patch::{apply_header_lines, filter_blocks, filter_submission, test_directives, Keep};
use harness::store::ResultStore;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::agent::{ExitStatus, MutationAgent};
use crate::env::ContainerEnv;
use crate::traj::{save_trajectory, Trajectory};

use super::{instance_of, run_parallel, write_exit_statuses, RunContext};

const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Run mutation generation into `set_dir` for the given instances.
pub async fn run(ctx: &RunContext, records: Vec<Value>, set_index: u32) -> Result<usize> {
    let statuses = run_parallel(records, ctx.workers, |record| {
        let ctx = ctx.clone();
        async move {
            let id = record
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            let status = match process_instance(&ctx, &record, set_index).await {
                Ok(status) => status.as_str().to_string(),
                Err(e) => {
                    error!(instance = %id, error = %e, "mutation generation failed");
                    format!("Error: {e}")
                }
            };
            (id, status)
        }
    })
    .await;

    write_exit_statuses(
        &ctx.output_dir,
        &format!("mutation_gen_set{set_index}"),
        &statuses,
    )?;
    Ok(statuses
        .values()
        .filter(|s| s.as_str() == "Submitted")
        .count())
}

async fn process_instance(
    ctx: &RunContext,
    record: &Value,
    set_index: u32,
) -> Result<ExitStatus> {
    let instance = instance_of(record).ok_or_else(|| anyhow::anyhow!("unparseable instance"))?;
    let instance_id = instance.instance_id.clone();

    let set_dir = ctx.output_dir.join(format!("set{set_index}"));
    let store = ResultStore::new(set_dir.join("preds.json"))?;
    if store.instance_exists(&instance_id) {
        store.update_instance(&instance_id, json!({"model_patch": ""}), true)?;
    }

    let workspace = ctx
        .output_dir
        .join("env_workspaces")
        .join(format!("{instance_id}_set{set_index}"));
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

    let directives = test_directives(instance.language, &instance.repo, &instance.test_patch);
    let test_command =
        build_test_command(&instance, ctx.benchmark, &directives).unwrap_or_default();

    let mut agent = MutationAgent::new(ctx.model()?, env.clone(), ctx.config.agent.clone());
    let mut vars = BTreeMap::new();
    vars.insert("gold_patch".to_string(), gold_patch);
    vars.insert("test_patch".to_string(), gold_test_patch);
    vars.insert("test_command".to_string(), test_command);
    vars.insert("workdir".to_string(), ctx.benchmark.workdir().to_string());

    let (exit_status, submission) = agent.run(&instance.problem_statement, vars).await;
    env.shutdown().await;

    // The mutation must not re-emit gold chunks; strip them by header.
    let gold_headers = apply_header_lines(&instance.patch);
    let (model_patch, thinking) = if exit_status == ExitStatus::Submitted {
        (
            filter_submission(&submission, &gold_headers),
            mutation_thinking(
                agent
                    .inner()
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == "assistant")
                    .map(|m| m.content.as_str()),
            ),
        )
    } else {
        (String::new(), String::new())
    };

    let traj_folder = ctx.output_dir.join("traj").join(format!("set{set_index}"));
    let traj_path = traj_folder
        .join(&instance_id)
        .join(format!("{instance_id}.traj.json"));
    let trajectory = Trajectory::new(
        &exit_status,
        &submission,
        agent.inner().messages.clone(),
        agent.inner().model.n_calls(),
        agent.inner().model.cost(),
    )
    .with_instance(&instance_id)
    .with_config(ctx.config.agent.clone(), agent.inner().model.name());
    save_trajectory(&traj_path, &trajectory)?;

    let mut out = record.clone();
    if let Value::Object(map) = &mut out {
        map.insert("model_patch".to_string(), Value::from(model_patch));
        map.insert("mutation_thinking".to_string(), Value::from(thinking));
        map.insert(
            "outputs".to_string(),
            Value::from(traj_folder.display().to_string()),
        );
    }
    store.update_instance(&instance_id, out, false)?;

    info!(instance = %instance_id, set = set_index, status = exit_status.as_str(), "mutation generation finished");
    Ok(exit_status)
}

/// The model's final reasoning: the text of the last assistant message before
/// its action block.
fn mutation_thinking(last_assistant: Option<&str>) -> String {
    let Some(content) = last_assistant else {
        return String::new();
    };
    content
        .split("```bash")
        .next()
        .unwrap_or("")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutation_thinking_strips_action() {
        let content = "I will swap the comparison operator.\n```bash\necho done\n```";
        assert_eq!(
            mutation_thinking(Some(content)),
            "I will swap the comparison operator."
        );
        assert_eq!(mutation_thinking(None), "");
    }
}
