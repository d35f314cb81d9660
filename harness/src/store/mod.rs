//! File-locked JSON result store shared by all pipeline stages.
//!
//! The store owns a single `preds.json` document keyed by instance id. Every
//! mutating call holds an advisory lock on a sibling `.preds.json.lock` file
//! for the whole read-modify-write window, and saves go through a temp file
//! plus atomic rename so readers never observe a partial document.

mod merge;
mod record;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::fs_std::FileExt;
use serde_json::{Map, Value};
use tracing::warn;

pub use merge::{deep_merge, set_nested};
pub use record::{
    CoverageRate, EvaluationInfo, StageEntry, StoreStatistics, FAIL_STATUS, SUCCESS_STATUS,
    UNKNOWN_STATUS,
};

/// How long a mutating call may wait on the advisory lock.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the lock.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for result store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not acquire file lock on {path} within {timeout:?}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Invalid update path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Result type for result store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// The per-run `preds.json` document: instance id → record.
pub type PredsDocument = Map<String, Value>;

/// File-locked result store over a single JSON document.
pub struct ResultStore {
    path: PathBuf,
    lock_path: PathBuf,
}

/// Guard that holds the advisory lock for one read-modify-write window.
struct LockGuard {
    _file: File,
}

impl ResultStore {
    /// Open a store at the given `preds.json` path, creating parent
    /// directories as needed.
    pub fn new(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "preds.json".to_string());
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(&parent)?;
        }
        let lock_path = parent.join(format!(".{file_name}.lock"));
        Ok(Self { path, lock_path })
    }

    /// Path of the underlying document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document without taking the lock (read-only callers accept a
    /// possibly stale snapshot). A missing file is an empty document; a
    /// corrupt file is logged and treated as empty.
    pub fn load(&self) -> PredsDocument {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(_) => return Map::new(),
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                warn!(path = %self.path.display(), found = other.to_string().chars().take(40).collect::<String>(), "preds document is not a JSON object");
                Map::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to parse preds document");
                Map::new()
            }
        }
    }

    /// Overwrite the whole document under the exclusive lock.
    pub fn save(&self, data: &PredsDocument) -> StoreResult<()> {
        let _guard = self.acquire_lock()?;
        self.save_locked(data)
    }

    /// Update a single instance record. With `merge` the updates are
    /// deep-merged into the existing record (object fields recurse, scalars
    /// and arrays replace); otherwise the record is replaced wholesale. A
    /// missing record is created either way.
    pub fn update_instance(&self, instance_id: &str, updates: Value, merge: bool) -> StoreResult<()> {
        let _guard = self.acquire_lock()?;
        let mut data = self.load();

        match data.get_mut(instance_id) {
            Some(existing) if merge => deep_merge(existing, updates),
            _ => {
                data.insert(instance_id.to_string(), updates);
            }
        }

        self.save_locked(&data)
    }

    /// Apply dot-separated nested updates to one instance record, e.g.
    /// `"meta.coverage_rate"` or `"stage.-1.evaluation_info"`. Numeric and
    /// negative path segments index into lists; missing intermediates are
    /// created (as a list when the next segment is an index). Indexing an
    /// absent list element is an error, never a silent append.
    pub fn update_instance_nested(
        &self,
        instance_id: &str,
        nested_updates: Vec<(String, Value)>,
    ) -> StoreResult<()> {
        let _guard = self.acquire_lock()?;
        let mut data = self.load();

        let record = data
            .entry(instance_id.to_string())
            .or_insert_with(|| serde_json::json!({ "instance_id": instance_id }));

        for (key, value) in nested_updates {
            if key.contains('.') {
                set_nested(record, &key, value)?;
            } else if let Value::Object(map) = record {
                map.insert(key, value);
            }
        }

        self.save_locked(&data)
    }

    /// Fetch a single instance record (stale snapshot).
    pub fn get_instance(&self, instance_id: &str) -> Option<Value> {
        self.load().get(instance_id).cloned()
    }

    /// Whether an instance record exists.
    pub fn instance_exists(&self, instance_id: &str) -> bool {
        self.load().contains_key(instance_id)
    }

    /// Delete an instance record. Returns `true` if it existed.
    pub fn delete_instance(&self, instance_id: &str) -> StoreResult<bool> {
        let _guard = self.acquire_lock()?;
        let mut data = self.load();
        let existed = data.remove(instance_id).is_some();
        if existed {
            self.save_locked(&data)?;
        }
        Ok(existed)
    }

    /// Instance ids whose `model_test_patch` is empty or whitespace-only.
    pub fn get_failed_test_gen(&self) -> Vec<String> {
        self.load()
            .iter()
            .filter_map(|(id, record)| {
                let patch = record
                    .get("model_test_patch")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                patch.trim().is_empty().then(|| id.clone())
            })
            .collect()
    }

    /// Instance ids where `meta.pass_gold_patch_status` is not `"success"`.
    pub fn get_gold_patch_failures(&self) -> Vec<String> {
        self.load()
            .iter()
            .filter_map(|(id, record)| {
                (pass_gold_patch_status(record) != Some(SUCCESS_STATUS.to_string()))
                    .then(|| id.clone())
            })
            .collect()
    }

    /// Instance ids that pass the gold patch but have a numeric coverage rate
    /// in `(0, threshold)`.
    pub fn get_low_coverage_instances(&self, threshold: f64) -> Vec<String> {
        self.load()
            .iter()
            .filter_map(|(id, record)| {
                if pass_gold_patch_status(record) != Some(SUCCESS_STATUS.to_string()) {
                    return None;
                }
                let rate = record
                    .get("meta")
                    .and_then(|m| m.get("coverage_rate"))
                    .and_then(Value::as_f64)?;
                (rate > 0.0 && rate < threshold).then(|| id.clone())
            })
            .collect()
    }

    /// Instance ids where the gold patch evaluation succeeded.
    pub fn get_successful_instances(&self) -> Vec<String> {
        self.load()
            .iter()
            .filter_map(|(id, record)| {
                (pass_gold_patch_status(record) == Some(SUCCESS_STATUS.to_string()))
                    .then(|| id.clone())
            })
            .collect()
    }

    /// Summary counts across the document.
    pub fn get_statistics(&self) -> StoreStatistics {
        StoreStatistics {
            total_instances: self.load().len(),
            failed_test_generation: self.get_failed_test_gen().len(),
            gold_patch_failures: self.get_gold_patch_failures().len(),
            low_coverage_instances: self.get_low_coverage_instances(1.0).len(),
            successful_instances: self.get_successful_instances().len(),
        }
    }

    fn save_locked(&self, data: &PredsDocument) -> StoreResult<()> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "preds.json".to_string());
        let parent = self.path.parent().map(Path::to_path_buf).unwrap_or_default();
        let tmp_path = parent.join(format!(".{file_name}.tmp"));

        let text = serde_json::to_string_pretty(&Value::Object(data.clone()))?;
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn acquire_lock(&self) -> StoreResult<LockGuard> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;

        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(_) => return Ok(LockGuard { _file: file }),
                Err(_) if start.elapsed() < LOCK_TIMEOUT => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(_) => {
                    return Err(StoreError::LockTimeout {
                        path: self.lock_path.clone(),
                        timeout: LOCK_TIMEOUT,
                    })
                }
            }
        }
    }
}

fn pass_gold_patch_status(record: &Value) -> Option<String> {
    record
        .get("meta")
        .and_then(|m| m.get("pass_gold_patch_status"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
