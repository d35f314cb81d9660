//! Benchmark instance modelling.
//!
//! An [`Instance`] is one immutable benchmark task: a repository snapshot, a
//! known-good fix, the reference tests, and enough metadata to run the
//! instance's test suite inside its container image. Two benchmark families
//! are supported, each with its own image naming and test command
//! conventions.

mod commands;
mod image;

pub use commands::{build_test_command, test_command_template};
pub use image::image_uri;

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for benchmark metadata handling
#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    #[error("Unknown benchmark '{0}' (expected swebench or swebenchpro)")]
    UnknownBenchmark(String),

    #[error("Unknown language '{0}'")]
    UnknownLanguage(String),

    #[error("No test command known for instance '{0}'")]
    MissingTestCommand(String),
}

/// The benchmark family an instance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchmarkKind {
    Swebench,
    Swebenchpro,
}

impl BenchmarkKind {
    /// Repository root inside the instance container.
    pub fn workdir(self) -> &'static str {
        match self {
            BenchmarkKind::Swebench => "/testbed",
            BenchmarkKind::Swebenchpro => "/app",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BenchmarkKind::Swebench => "swebench",
            BenchmarkKind::Swebenchpro => "swebenchpro",
        }
    }
}

impl FromStr for BenchmarkKind {
    type Err = BenchmarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "swebench" => Ok(BenchmarkKind::Swebench),
            "swebenchpro" => Ok(BenchmarkKind::Swebenchpro),
            other => Err(BenchmarkError::UnknownBenchmark(other.to_string())),
        }
    }
}

/// Source language of an instance's repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Go,
    Javascript,
    Typescript,
}

impl Language {
    /// Detect the language from a source file path. `.tsx` counts as
    /// TypeScript, `.jsx` as JavaScript.
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit('.').next()?;
        match ext {
            "py" => Some(Language::Python),
            "go" => Some(Language::Go),
            "js" | "jsx" | "mjs" | "cjs" => Some(Language::Javascript),
            "ts" | "tsx" => Some(Language::Typescript),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Go => "go",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
        }
    }
}

impl FromStr for Language {
    type Err = BenchmarkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" => Ok(Language::Python),
            "go" => Ok(Language::Go),
            "javascript" | "js" => Ok(Language::Javascript),
            "typescript" | "ts" => Ok(Language::Typescript),
            other => Err(BenchmarkError::UnknownLanguage(other.to_string())),
        }
    }
}

/// One immutable benchmark task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub repo: String,
    pub base_commit: String,
    /// The gold patch.
    #[serde(default)]
    pub patch: String,
    /// The gold test patch.
    #[serde(default)]
    pub test_patch: String,
    #[serde(default)]
    pub problem_statement: String,
    #[serde(default = "default_language")]
    pub language: Language,
    /// Explicit image override; when absent the benchmark's naming scheme
    /// applies.
    #[serde(default)]
    pub image_name: Option<String>,
    /// Repo version key used for per-version test command lookup (swebench).
    #[serde(default)]
    pub version: Option<String>,
    /// Test command template; `$@` is replaced with comma-joined directives
    /// (swebenchpro).
    #[serde(default)]
    pub test_command: Option<String>,
    /// Setup command run after checkout and patch application, before tests.
    #[serde(default)]
    pub before_repo_set_cmd: String,
    /// Test files selected for this instance by the dataset.
    #[serde(default)]
    pub selected_test_files_to_run: Vec<String>,
    /// `ENV` lines recorded from the instance image's dockerfiles, exported
    /// by the entry script.
    #[serde(default)]
    pub env_lines: Vec<String>,
}

fn default_language() -> Language {
    Language::Python
}

impl Instance {
    /// Parse an instance from its record in a preds document or dataset
    /// export. Unknown fields are ignored.
    pub fn from_record(record: &Value) -> Option<Self> {
        serde_json::from_value(record.clone()).ok()
    }

    /// The image to run this instance in.
    pub fn image(&self, benchmark: BenchmarkKind) -> String {
        match &self.image_name {
            Some(name) => name.clone(),
            None => image_uri(benchmark, &self.instance_id, &self.repo),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_language_from_path() {
        assert_eq!(Language::from_path("a/b/c.py"), Some(Language::Python));
        assert_eq!(Language::from_path("x_test.go"), Some(Language::Go));
        assert_eq!(Language::from_path("ui/App.tsx"), Some(Language::Typescript));
        assert_eq!(Language::from_path("lib/index.mjs"), Some(Language::Javascript));
        assert_eq!(Language::from_path("README.md"), None);
    }

    #[test]
    fn test_benchmark_parse() {
        assert_eq!(
            "swebench".parse::<BenchmarkKind>().unwrap(),
            BenchmarkKind::Swebench
        );
        assert!("other".parse::<BenchmarkKind>().is_err());
    }

    #[test]
    fn test_instance_from_record_ignores_extra_fields() {
        let record = json!({
            "instance_id": "django__django-11141",
            "repo": "django/django",
            "base_commit": "abc123",
            "patch": "diff --git",
            "model_test_patch": "unrelated",
            "meta": {"coverage_rate": 1.0}
        });
        let instance = Instance::from_record(&record).unwrap();
        assert_eq!(instance.instance_id, "django__django-11141");
        assert_eq!(instance.language, Language::Python);
        assert!(instance.image_name.is_none());
    }

    #[test]
    fn test_workdir_per_benchmark() {
        assert_eq!(BenchmarkKind::Swebench.workdir(), "/testbed");
        assert_eq!(BenchmarkKind::Swebenchpro.workdir(), "/app");
    }
}
