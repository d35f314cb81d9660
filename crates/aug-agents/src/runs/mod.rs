//! Batch worker passes: one module per agent or evaluation pass, invoked as
//! subcommands by the stage orchestrators.

pub mod aug;
pub mod eval;
pub mod fix;
pub mod judge;
pub mod must_cover;
pub mod mutation;
pub mod test_gen;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use harness::container::DockerCli;
use harness::{BenchmarkKind, ContainerEngine, Instance};
use serde_json::Value;
use tracing::{error, info};

use crate::config::RunConfig;
use crate::model::{HttpModel, Model};

/// Shared inputs of every batch pass.
#[derive(Clone)]
pub struct RunContext {
    pub output_dir: PathBuf,
    pub benchmark: BenchmarkKind,
    pub workers: usize,
    pub config: RunConfig,
    pub engine: Arc<dyn ContainerEngine>,
    /// Per-instance `run_script.sh` / `parser.py` directory.
    pub scripts_dir: PathBuf,
}

impl RunContext {
    pub fn new(
        output_dir: PathBuf,
        benchmark: BenchmarkKind,
        workers: usize,
        config: RunConfig,
        scripts_dir: PathBuf,
    ) -> Self {
        Self {
            output_dir,
            benchmark,
            workers,
            config,
            engine: Arc::new(DockerCli::default()),
            scripts_dir,
        }
    }

    pub fn preds_path(&self) -> PathBuf {
        self.output_dir.join("preds.json")
    }

    /// Build a fresh model client for one instance run.
    pub fn model(&self) -> Result<Arc<dyn Model>> {
        let model_config = self
            .config
            .model
            .clone()
            .context("run config has no model section")?;
        Ok(Arc::new(HttpModel::new(model_config)))
    }
}

/// Load instances from a dataset export: a JSON array, a JSON object keyed by
/// instance id, or JSONL.
pub fn load_instances(dataset_path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(dataset_path)
        .with_context(|| format!("reading dataset {}", dataset_path.display()))?;

    if dataset_path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
        return text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(Into::into))
            .collect();
    }

    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing dataset {}", dataset_path.display()))?;
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map.into_values().collect()),
        other => anyhow::bail!("dataset {} is not a list or map: {other}", dataset_path.display()),
    }
}

/// Restrict records to the selected instance ids (`--instance-ids` wins over
/// `--run-instance-file`; both empty selects everything).
pub fn select_instances(
    records: Vec<Value>,
    instance_ids: &[String],
    run_instance_file: Option<&Path>,
) -> Result<Vec<Value>> {
    let selected: Option<Vec<String>> = if !instance_ids.is_empty() {
        Some(instance_ids.to_vec())
    } else if let Some(path) = run_instance_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading instance list {}", path.display()))?;
        Some(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        )
    } else {
        None
    };

    match selected {
        Some(ids) => Ok(records
            .into_iter()
            .filter(|record| {
                record
                    .get("instance_id")
                    .and_then(Value::as_str)
                    .map(|id| ids.iter().any(|wanted| wanted == id))
                    .unwrap_or(false)
            })
            .collect()),
        None => Ok(records),
    }
}

/// Parse a typed [`Instance`] out of a record, logging failures.
pub fn instance_of(record: &Value) -> Option<Instance> {
    let instance = Instance::from_record(record);
    if instance.is_none() {
        error!(
            record = %record.get("instance_id").and_then(serde_json::Value::as_str).unwrap_or("<no id>"),
            "record is missing required instance fields"
        );
    }
    instance
}

/// Fan instance work out over a bounded worker pool and collect the per-id
/// exit statuses.
pub async fn run_parallel<F, Fut>(
    records: Vec<Value>,
    workers: usize,
    process: F,
) -> BTreeMap<String, String>
where
    F: Fn(Value) -> Fut,
    Fut: std::future::Future<Output = (String, String)>,
{
    info!(count = records.len(), workers, "dispatching instance work");
    stream::iter(records)
        .map(process)
        .buffer_unordered(workers.max(1))
        .collect::<Vec<(String, String)>>()
        .await
        .into_iter()
        .collect()
}

/// Persist the per-phase exit status ledger.
pub fn write_exit_statuses(
    output_dir: &Path,
    phase: &str,
    statuses: &BTreeMap<String, String>,
) -> Result<()> {
    let dir = output_dir.join("exit_statuses");
    std::fs::create_dir_all(&dir)?;
    let ts = chrono::Utc::now().timestamp();
    let path = dir.join(format!("{phase}_exit_statuses_{ts}.yaml"));
    std::fs::write(&path, serde_yaml::to_string(statuses)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_load_instances_object_form() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("preds.json");
        std::fs::write(&path, r#"{"a": {"instance_id": "a"}, "b": {"instance_id": "b"}}"#)
            .unwrap();
        let records = load_instances(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_load_instances_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dataset.jsonl");
        std::fs::write(&path, "{\"instance_id\": \"a\"}\n\n{\"instance_id\": \"b\"}\n").unwrap();
        let records = load_instances(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_select_instances_by_id() {
        let records = vec![json!({"instance_id": "a"}), json!({"instance_id": "b"})];
        let selected =
            select_instances(records, &["b".to_string()], None).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["instance_id"], "b");
    }

    #[test]
    fn test_select_instances_from_file() {
        let dir = tempdir().unwrap();
        let list = dir.path().join("ids.txt");
        std::fs::write(&list, "a\n\n").unwrap();
        let records = vec![json!({"instance_id": "a"}), json!({"instance_id": "b"})];
        let selected = select_instances(records, &[], Some(list.as_path())).unwrap();
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn test_run_parallel_collects_statuses() {
        let records = vec![json!({"instance_id": "a"}), json!({"instance_id": "b"})];
        let statuses = run_parallel(records, 2, |record| async move {
            let id = record["instance_id"].as_str().unwrap().to_string();
            (id, "Submitted".to_string())
        })
        .await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["a"], "Submitted");
    }
}
