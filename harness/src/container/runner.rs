//! The end-to-end container evaluation flow.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::benchmark::{BenchmarkKind, Instance};

use super::workspace::{
    assemble_entryscript, collect_outputs, load_instance_script, prepare_run,
    write_workspace_files,
};
use super::{ContainerEngine, ContainerLimits, RunnerError, APPLY_PATCH_FAIL};

/// One container evaluation: an instance, an ordered patch list, and the test
/// command to run after application.
#[derive(Debug, Clone)]
pub struct EvalRequest {
    pub instance: Instance,
    pub benchmark: BenchmarkKind,
    /// Patches in application order as `(file name, diff text)`; the test
    /// patch goes last.
    pub patches: Vec<(String, String)>,
    /// Log-directory prefix, e.g. `gold_with_model_test`.
    pub prefix: String,
    /// Per-instance log directory.
    pub log_dir: PathBuf,
    /// Directory holding `<instance_id>/run_script.sh` and `parser.py`.
    pub scripts_dir: PathBuf,
    /// Fully assembled test command (directives substituted).
    pub test_command: String,
    pub limits: ContainerLimits,
    pub block_network: bool,
    pub platform: Option<String>,
    /// Rerun even when a cached `output.json` exists.
    pub redo: bool,
}

/// Structured result of one evaluation run.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    /// Parsed `output.json`, when the in-container parser produced one.
    pub output: Option<Value>,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub status_code: i64,
    pub log_dir: PathBuf,
}

/// Run one evaluation inside the instance's container.
///
/// The workspace receives each patch as a `.diff` file, the per-instance
/// `run_script.sh` and `parser.py`, and an assembled `entryscript.sh`. A
/// non-zero container exit with an existing `output.json` is a legitimate
/// test failure, not an infrastructure error.
pub async fn run_evaluation(
    engine: &dyn ContainerEngine,
    request: &EvalRequest,
) -> Result<EvalOutcome, RunnerError> {
    let uid = &request.instance.instance_id;

    let prepared = prepare_run(&request.log_dir, &request.prefix, request.redo)?;
    if let Some(output) = prepared.existing_output {
        debug!(instance = %uid, prefix = %request.prefix, "using cached evaluation output");
        return Ok(EvalOutcome {
            output: Some(output),
            timed_out: false,
            oom_killed: false,
            status_code: 0,
            log_dir: request.log_dir.clone(),
        });
    }

    let run_script = load_instance_script(&request.scripts_dir, uid, "run_script.sh")?;
    let parser_script = load_instance_script(&request.scripts_dir, uid, "parser.py")?;

    let patch_files: Vec<String> = request.patches.iter().map(|(name, _)| name.clone()).collect();
    let entryscript = assemble_entryscript(
        &request.instance,
        request.benchmark,
        &patch_files,
        &request.test_command,
    );

    let mut files = BTreeMap::new();
    for (name, diff) in &request.patches {
        files.insert(name.clone(), diff.clone());
        // Snapshot each applied patch next to the logs.
        fs::write(
            request.log_dir.join(format!("{}_{name}", request.prefix)),
            diff,
        )?;
    }
    files.insert("run_script.sh".to_string(), run_script);
    files.insert("parser.py".to_string(), parser_script);
    files.insert("entryscript.sh".to_string(), entryscript.clone());
    write_workspace_files(&prepared.workspace_dir, &files)?;

    let image = request.instance.image(request.benchmark);
    if let Err(pull_err) = engine.pull(&image, request.platform.as_deref()).await {
        if engine.image_exists(&image).await {
            info!(instance = %uid, image = %image, "pull failed, using locally available image");
        } else {
            return Err(RunnerError::ImageUnavailable {
                image,
                reason: pull_err.to_string(),
            });
        }
    }

    let container = engine
        .run_detached(
            &image,
            &prepared.workspace_dir,
            "bash /workspace/entryscript.sh",
            &request.limits,
            request.block_network,
            request.platform.as_deref(),
        )
        .await?;

    let wait = engine.wait(&container, request.limits.timeout).await?;
    if wait.timed_out {
        warn!(instance = %uid, timeout = ?request.limits.timeout, "container run timed out");
        return Ok(EvalOutcome {
            output: None,
            timed_out: true,
            oom_killed: false,
            status_code: wait.status_code,
            log_dir: request.log_dir.clone(),
        });
    }
    if wait.status_code != 0 {
        info!(instance = %uid, status = wait.status_code, "entryscript exited non-zero");
    }

    // Keep the raw container stream for offset bookkeeping downstream.
    if let Ok(raw_log) = engine.logs(&container).await {
        let _ = fs::write(request.log_dir.join("raw_container.log"), &raw_log);
    }

    let output = collect_outputs(&prepared.workspace_dir, &request.log_dir, &request.prefix)?;
    fs::write(
        request
            .log_dir
            .join(format!("{}_entryscript.sh", request.prefix)),
        &entryscript,
    )?;
    let _ = engine.remove(&container, true).await;

    if output.is_none() {
        if let Some(which) = detect_apply_failure(&request.log_dir, &request.prefix, &request.patches)
        {
            return Err(RunnerError::ApplyFailed { which });
        }
    }

    Ok(EvalOutcome {
        output,
        timed_out: false,
        oom_killed: wait.oom_killed,
        status_code: wait.status_code,
        log_dir: request.log_dir.clone(),
    })
}

/// Classify an in-container apply failure from the collected logs: the entry
/// script prints `>>>>> Patch Apply Failed <file>` before aborting.
fn detect_apply_failure(
    log_dir: &std::path::Path,
    prefix: &str,
    patches: &[(String, String)],
) -> Option<String> {
    let mut combined = String::new();
    for name in ["stdout.log", "stderr.log"] {
        combined.push_str(
            &fs::read_to_string(log_dir.join(format!("{prefix}_{name}"))).unwrap_or_default(),
        );
    }
    combined.push_str(&fs::read_to_string(log_dir.join("raw_container.log")).unwrap_or_default());

    let marker_line = combined
        .lines()
        .find(|line| line.contains(APPLY_PATCH_FAIL))?;
    // Longest match wins: `patch.diff` is a substring of `test_patch.diff`.
    patches
        .iter()
        .map(|(name, _)| name.clone())
        .filter(|name| marker_line.contains(name.as_str()))
        .max_by_key(String::len)
        .or_else(|| Some("unknown".to_string()))
}
