//! Fix passes: rework an existing `model_test_patch` with an agent seeded
//! from the prior stage's trajectory.
//!
//! `Hard_Code_Fix` removes obvious hardcoding from freshly generated tests;
//! `Coverage_Fix` adds tests for the uncovered lines reported by the last
//! evaluation. Both append a new stage entry and replace the patch in place.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use harness::patch::{filter_blocks, filter_submission, apply_header_lines, Keep};
use harness::store::{ResultStore, StageEntry};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::agent::{DefaultAgent, ExitStatus};
use crate::env::ContainerEnv;
use crate::traj::{load_trajectory, save_trajectory, Trajectory};

use super::{instance_of, run_parallel, write_exit_statuses, RunContext};

const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// The two fix passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixKind {
    HardCode,
    Coverage,
}

impl FixKind {
    /// Stage entry name.
    pub fn stage_name(self) -> &'static str {
        match self {
            FixKind::HardCode => "Hard_Code_Fix",
            FixKind::Coverage => "Coverage_Fix",
        }
    }


    fn instruction(self) -> &'static str {
        match self {
            FixKind::HardCode => {
                "Review the tests you generated above. Remove any hardcoded absolute paths, \
                 timestamps, machine-specific values, or assertions on incidental log output, \
                 then submit the corrected test patch the same way as before."
            }
            FixKind::Coverage => {
                "The tests you generated above pass, but they do not execute all of the \
                 changed code. Add tests that exercise the uncovered lines listed below, keep \
                 the existing tests passing, and submit the augmented test patch the same way \
                 as before.\n\nUncovered lines per file:\n{{uncovered_lines}}"
            }
        }
    }
}

impl FromStr for FixKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Hard_Code_Fix" => Ok(FixKind::HardCode),
            "Coverage_Fix" => Ok(FixKind::Coverage),
            other => anyhow::bail!("unknown fix type '{other}'"),
        }
    }
}

/// Run a fix pass over the given preds records.
pub async fn run(ctx: &RunContext, records: Vec<Value>, kind: FixKind) -> Result<usize> {
    let statuses = run_parallel(records, ctx.workers, |record| {
        let ctx = ctx.clone();
        async move {
            let id = record
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            let status = match process_instance(&ctx, &record, kind).await {
                Ok(status) => status.as_str().to_string(),
                Err(e) => {
                    error!(instance = %id, error = %e, "fix pass failed");
                    format!("Error: {e}")
                }
            };
            (id, status)
        }
    })
    .await;

    let phase = match kind {
        FixKind::HardCode => "hard_code_fix",
        FixKind::Coverage => "coverage_fix",
    };
    write_exit_statuses(&ctx.output_dir, phase, &statuses)?;
    Ok(statuses
        .values()
        .filter(|s| s.as_str() == "Submitted")
        .count())
}

async fn process_instance(ctx: &RunContext, record: &Value, kind: FixKind) -> Result<ExitStatus> {
    let instance = instance_of(record).ok_or_else(|| anyhow::anyhow!("unparseable instance"))?;
    let instance_id = instance.instance_id.clone();
    let store = ResultStore::new(ctx.preds_path())?;

    let current_patch = record
        .get("model_test_patch")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if current_patch.trim().is_empty() {
        warn!(instance = %instance_id, "no test patch to fix, skipping");
        return Ok(ExitStatus::TaskFailed);
    }

    // Seed with the prior stage's conversation minus the trailing two turns
    // (the final action and its observation).
    let seed_path = seed_trajectory_path(ctx, &instance_id, kind);
    let seed = load_trajectory(&seed_path)
        .with_context(|| format!("loading seed trajectory for {instance_id}"))?;

    let workspace = ctx
        .output_dir
        .join("env_workspaces")
        .join(format!("{instance_id}_{}", kind.stage_name()));
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
    let applied = env.apply_patch(&gold_patch).await?;
    if !applied.succeeded() {
        env.shutdown().await;
        anyhow::bail!("failed to apply gold patch to repo");
    }
    let applied_test = env.apply_patch(&current_patch).await?;
    if !applied_test.succeeded() {
        env.shutdown().await;
        anyhow::bail!("failed to apply test patch to repo");
    }

    let mut agent = DefaultAgent::new(ctx.model()?, env.clone(), ctx.config.agent.clone());
    let mut vars = BTreeMap::new();
    vars.insert("gold_patch".to_string(), gold_patch);
    vars.insert("model_test_patch".to_string(), current_patch);
    if kind == FixKind::Coverage {
        vars.insert("uncovered_lines".to_string(), uncovered_lines_text(record));
    }

    agent.begin(&instance.problem_statement, vars);
    let mut seeded = seed.messages;
    if seeded.len() >= 2 {
        seeded.truncate(seeded.len() - 2);
    }
    if !seeded.is_empty() {
        agent.messages = seeded;
    }
    agent.add_message("user", agent.render(kind.instruction()));

    let (exit_status, submission) = run_seeded(&mut agent).await;
    env.shutdown().await;

    let traj_folder = ctx.output_dir.join("traj").join(kind.stage_name());
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
    .with_config(ctx.config.agent.clone(), agent.model.name());
    save_trajectory(&traj_path, &trajectory)?;

    // A successful fix replaces the patch; anything else keeps the old one.
    let gold_headers = apply_header_lines(&instance.patch);
    let fixed = if exit_status == ExitStatus::Submitted {
        filter_submission(&submission, &gold_headers)
    } else {
        String::new()
    };

    let entry = StageEntry::new(
        kind.stage_name(),
        record
            .get("meta")
            .and_then(|m| m.get("iteration"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        traj_folder.display().to_string(),
    )
    .with_patch(if fixed.trim().is_empty() {
        record
            .get("model_test_patch")
            .and_then(Value::as_str)
            .unwrap_or("")
    } else {
        &fixed
    });

    let mut existing = store
        .get_instance(&instance_id)
        .unwrap_or_else(|| json!({"instance_id": instance_id}));
    match existing.get_mut("stage").and_then(Value::as_array_mut) {
        Some(stages) => stages.push(serde_json::to_value(&entry)?),
        None => existing["stage"] = json!([serde_json::to_value(&entry)?]),
    }
    if !fixed.trim().is_empty() {
        existing["model_test_patch"] = Value::from(fixed);
        if let Some(meta) = existing.get_mut("meta") {
            meta["hard_code_status"] = Value::from("success");
        }
    }
    store.update_instance(&instance_id, existing, false)?;

    info!(instance = %instance_id, fix = kind.stage_name(), status = exit_status.as_str(), "fix pass finished");
    Ok(exit_status)
}

/// Locate the trajectory this fix is seeded from: the latest `gen_N` folder
/// for the hard-code fix, the `Hard_Code_Fix` folder for the coverage fix.
fn seed_trajectory_path(
    ctx: &RunContext,
    instance_id: &str,
    kind: FixKind,
) -> std::path::PathBuf {
    let traj_root = ctx.output_dir.join("traj");
    let folder = match kind {
        FixKind::Coverage => traj_root.join("Hard_Code_Fix"),
        FixKind::HardCode => {
            let mut latest: Option<(u32, std::path::PathBuf)> = None;
            if let Ok(entries) = std::fs::read_dir(&traj_root) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if let Some(n) = name.strip_prefix("gen_").and_then(|n| n.parse::<u32>().ok())
                    {
                        if latest.as_ref().map(|(best, _)| n > *best).unwrap_or(true)
                            && entry.path().join(instance_id).is_dir()
                        {
                            latest = Some((n, entry.path()));
                        }
                    }
                }
            }
            latest
                .map(|(_, path)| path)
                .unwrap_or_else(|| traj_root.join("gen_0"))
        }
    };
    folder
        .join(instance_id)
        .join(format!("{instance_id}.traj.json"))
}

async fn run_seeded(agent: &mut DefaultAgent) -> (ExitStatus, String) {
    loop {
        match agent.step().await {
            Ok(Some((status, output))) => return (status, output),
            Ok(None) => continue,
            Err(e) => return (ExitStatus::Error(e.to_string()), String::new()),
        }
    }
}

/// Render the file → uncovered-lines map of the last evaluation into prompt
/// text.
fn uncovered_lines_text(record: &Value) -> String {
    let uncovered = record
        .get("meta")
        .and_then(|m| m.get("uncovered_lines"))
        .and_then(Value::as_object);
    let Some(uncovered) = uncovered else {
        return "(no uncovered line data)".to_string();
    };

    let mut out = String::new();
    for (file, lines) in uncovered {
        out.push_str(&format!("{file}:\n"));
        for pair in lines.as_array().into_iter().flatten() {
            let line_no = pair.get(0).and_then(Value::as_u64).unwrap_or(0);
            let content = pair.get(1).and_then(Value::as_str).unwrap_or("");
            out.push_str(&format!("  {line_no}: {content}\n"));
        }
    }
    out
}
