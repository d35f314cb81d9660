//! Typed builders for the record fragments the pipeline writes.
//!
//! Records themselves stay dynamic JSON (instances carry arbitrary dataset
//! fields that must ride along untouched); these types cover the fragments
//! this codebase constructs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status literal written when an evaluation passed.
pub const SUCCESS_STATUS: &str = "success";
/// Status literal written when an evaluation failed.
pub const FAIL_STATUS: &str = "fail";
/// Status literal for fields that have not been evaluated yet.
pub const UNKNOWN_STATUS: &str = "unknown";

/// One append-only entry of the per-instance stage history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: String,
    pub iteration: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_test_patch: Option<String>,
    pub outputs: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluation_info: Option<Value>,
}

impl StageEntry {
    pub fn new(stage: impl Into<String>, iteration: u32, outputs: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            iteration,
            model_test_patch: None,
            outputs: outputs.into(),
            status: "incomplete".to_string(),
            evaluation_info: None,
        }
    }

    pub fn with_patch(mut self, patch: impl Into<String>) -> Self {
        let patch = patch.into();
        self.status = if patch.trim().is_empty() {
            "incomplete".to_string()
        } else {
            "completed".to_string()
        };
        self.model_test_patch = Some(patch);
        self
    }
}

/// Evaluation outcome attached exactly once to the tail stage entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationInfo {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_gold_patch_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_init_test_status: Option<String>,
    pub outputs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_rate: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncovered_lines: Option<Value>,
    /// Failed-test list (or synthetic failure entries) from the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail: Option<Vec<String>>,
}

/// Coverage rate as stored in `meta`: either a number in `[0, 1]` or the
/// `"unknown"` sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoverageRate {
    Rate(f64),
    Unknown,
}

impl CoverageRate {
    pub fn to_value(self) -> Value {
        match self {
            CoverageRate::Rate(r) => Value::from(r),
            CoverageRate::Unknown => Value::from(UNKNOWN_STATUS),
        }
    }

    pub fn from_value(value: &Value) -> Self {
        match value.as_f64() {
            Some(r) => CoverageRate::Rate(r),
            None => CoverageRate::Unknown,
        }
    }

    pub fn as_rate(self) -> Option<f64> {
        match self {
            CoverageRate::Rate(r) => Some(r),
            CoverageRate::Unknown => None,
        }
    }
}

/// Summary counts across a preds document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total_instances: usize,
    pub failed_test_generation: usize,
    pub gold_patch_failures: usize,
    pub low_coverage_instances: usize,
    pub successful_instances: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stage_entry_status_follows_patch() {
        let entry = StageEntry::new("patch_generation", 0, "/traj/gen_0");
        assert_eq!(entry.status, "incomplete");

        let done = entry.clone().with_patch("diff --git a/x b/x\n");
        assert_eq!(done.status, "completed");

        let empty = entry.with_patch("   ");
        assert_eq!(empty.status, "incomplete");
    }

    #[test]
    fn test_stage_entry_omits_absent_fields() {
        let entry = StageEntry::new("Hard_Code_Fix", 1, "out");
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("model_test_patch").is_none());
        assert!(value.get("evaluation_info").is_none());
    }

    #[test]
    fn test_coverage_rate_round_trip() {
        assert_eq!(
            CoverageRate::from_value(&CoverageRate::Rate(0.75).to_value()),
            CoverageRate::Rate(0.75)
        );
        assert_eq!(
            CoverageRate::from_value(&CoverageRate::Unknown.to_value()),
            CoverageRate::Unknown
        );
        assert_eq!(CoverageRate::from_value(&json!("unknown")).as_rate(), None);
    }
}
