//! Must-cover extraction pass.
//!
//! For each instance: check out the base commit in a live container, apply
//! the gold patch verbosely (capturing the apply log for hunk offsets), dump
//! the post-apply contents of every changed file, and run the must-cover
//! analysis. Results accumulate into a single JSON document consumed by the
//! coverage evaluation.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use harness::coverage::{compute_must_coverage, MustCoverMap};
use harness::patch::list_changed_files;
use harness::Instance;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::env::{ContainerEnv, Environment};

use super::{instance_of, run_parallel, RunContext};

const ACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Extract must-cover line sets for the given instances and merge them into
/// `output_file`.
pub async fn run(ctx: &RunContext, records: Vec<Value>, output_file: &Path) -> Result<usize> {
    let results = run_parallel(records, ctx.workers, |record| {
        let ctx = ctx.clone();
        async move {
            let id = record
                .get("instance_id")
                .and_then(Value::as_str)
                .unwrap_or("<no id>")
                .to_string();
            match extract_instance(&ctx, &record).await {
                Ok(map) => (id, serde_json::to_string(&map).unwrap_or_default()),
                Err(e) => {
                    error!(instance = %id, error = %e, "must-cover extraction failed");
                    (id, String::new())
                }
            }
        }
    })
    .await;

    // Merge into the accumulated document.
    let mut document: BTreeMap<String, MustCoverMap> = match std::fs::read_to_string(output_file) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => BTreeMap::new(),
    };
    let mut extracted = 0usize;
    for (id, payload) in results {
        if payload.is_empty() {
            continue;
        }
        let map: MustCoverMap = serde_json::from_str(&payload)?;
        document.insert(id, map);
        extracted += 1;
    }
    if let Some(parent) = output_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(output_file, serde_json::to_string_pretty(&document)?)
        .with_context(|| format!("writing must-cover file {}", output_file.display()))?;
    info!(count = extracted, path = %output_file.display(), "must-cover extraction finished");
    Ok(extracted)
}

async fn extract_instance(ctx: &RunContext, record: &Value) -> Result<MustCoverMap> {
    let instance = instance_of(record).ok_or_else(|| anyhow::anyhow!("unparseable instance"))?;
    let workspace = ctx
        .output_dir
        .join("env_workspaces")
        .join(format!("{}_must_cover", instance.instance_id));

    let env = ContainerEnv::start(
        ctx.engine.clone(),
        &instance,
        ctx.benchmark,
        &workspace,
        ACTION_TIMEOUT,
    )
    .await?;

    let result = extract_with_env(&env, &instance).await;
    env.shutdown().await;
    result
}

async fn extract_with_env(env: &ContainerEnv, instance: &Instance) -> Result<MustCoverMap> {
    let reset = env
        .execute(&format!(
            "git reset --hard {c} && git checkout {c}",
            c = instance.base_commit
        ))
        .await?;
    if reset.returncode != 0 {
        anyhow::bail!("git reset failed: {}", reset.output.trim());
    }

    let applied = env.apply_patch(&instance.patch).await?;
    if !applied.succeeded() {
        anyhow::bail!("failed to apply gold patch to repo");
    }

    let mut sources = BTreeMap::new();
    for file in list_changed_files(&instance.patch) {
        let output = env.execute(&format!("cat '{file}'")).await?;
        if output.returncode != 0 {
            warn!(file = %file, "changed file unreadable after apply, skipping");
            continue;
        }
        sources.insert(file, output.output);
    }

    Ok(compute_must_coverage(&instance.patch, &applied.log, &sources))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_document_shape() {
        // The output document is `{instance → {file → record}}`; verify the
        // serde round trip used by the merge.
        let mut map = MustCoverMap::new();
        map.insert(
            "src/a.py".to_string(),
            harness::coverage::FileMustCover {
                exe_slice_lines_scope: vec![3],
                exe_slice_lines: vec![3],
                exe_modified_lines: vec![3],
                content: "x = 1\n".to_string(),
                language: "python".to_string(),
            },
        );
        let mut document: BTreeMap<String, MustCoverMap> = BTreeMap::new();
        document.insert("inst-1".to_string(), map);

        let text = serde_json::to_string(&document).unwrap();
        let parsed: BTreeMap<String, MustCoverMap> = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["inst-1"]["src/a.py"].exe_modified_lines, vec![3]);
    }
}
