//! Framework-aware parsing of test logs into per-test statuses.
//!
//! Each parser consumes raw log text and returns `{test identifier → status}`
//! in whatever identifier form the framework prints (`path::node[param]` for
//! pytest, `method (module.Class)` for Django, `package::TestName` for Go).
//! Anything that is not `PASSED` or `SKIPPED` counts as a failure when
//! computing pass-all-tests.

mod django;
mod gotest;
mod pytest;
mod sympy;

use std::collections::BTreeMap;

use serde_json::Value;

pub use django::DjangoParser;
pub use gotest::GoTestParser;
pub use pytest::{MatplotlibParser, PytestLegacyParser, PytestOptionsParser, PytestParser, PytestV2Parser, SeabornParser};
pub use sympy::SympyParser;

use crate::benchmark::Language;

/// Canonical failure entry reported when a parser produced no statuses.
pub const EMPTY_STATUS_MAP_FAILURE: &str = "Return eval_status_map is empty";

/// Final status of one test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
            TestStatus::Skipped => "SKIPPED",
            TestStatus::Error => "ERROR",
        }
    }

    /// Parse a framework status token. Expected-failure markers fold into the
    /// four canonical statuses the way the evaluation treats them.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "PASSED" | "XPASSED" => Some(TestStatus::Passed),
            "FAILED" | "XFAILED" => Some(TestStatus::Failed),
            "SKIPPED" => Some(TestStatus::Skipped),
            "ERROR" => Some(TestStatus::Error),
            _ => None,
        }
    }
}

/// Map of test identifier to final status.
pub type StatusMap = BTreeMap<String, TestStatus>;

/// A framework-specific log parser.
pub trait LogParser: Send + Sync {
    fn parse(&self, log: &str) -> StatusMap;
}

/// Select the log parser for an instance. Python parsers are keyed by repo
/// id; Go uses the `go test` parser. JavaScript and TypeScript logs are
/// parsed inside the container (`parser.py` → `output.json`), so no host-side
/// parser exists for them.
pub fn parser_for(language: Language, repo: &str) -> Option<Box<dyn LogParser>> {
    match language {
        Language::Python => Some(python_parser_for(repo)),
        Language::Go => Some(Box::new(GoTestParser)),
        Language::Javascript | Language::Typescript => None,
    }
}

fn python_parser_for(repo: &str) -> Box<dyn LogParser> {
    match repo {
        "django/django" => Box::new(DjangoParser::default()),
        "sympy/sympy" => Box::new(SympyParser),
        "mwaskom/seaborn" => Box::new(SeabornParser),
        "matplotlib/matplotlib" => Box::new(MatplotlibParser::default()),
        "astropy/astropy" | "scikit-learn/scikit-learn" | "sphinx-doc/sphinx" => {
            Box::new(PytestV2Parser::default())
        }
        "pydicom/pydicom" | "psf/requests" | "pylint-dev/pylint" => Box::new(PytestOptionsParser),
        _ => Box::new(PytestParser),
    }
}

/// Failed-test list for a status map: every entry that is neither `PASSED`
/// nor `SKIPPED`. An empty map yields the canonical empty-map failure.
pub fn analyze_status_map(map: &StatusMap) -> Vec<String> {
    if map.is_empty() {
        return vec![EMPTY_STATUS_MAP_FAILURE.to_string()];
    }
    map.iter()
        .filter(|(_, status)| !matches!(status, TestStatus::Passed | TestStatus::Skipped))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Analyze the in-container parser's `output.json` document
/// (`{"tests": [{"name": …, "status": …}]}`) into a failed-test list and a
/// status map.
pub fn analyze_output_json(output: &Value) -> (Vec<String>, BTreeMap<String, String>) {
    let mut status_map = BTreeMap::new();

    if let Some(tests) = output.get("tests").and_then(Value::as_array) {
        for test in tests {
            let name = test.get("name").and_then(Value::as_str);
            let status = test.get("status").and_then(Value::as_str);
            if let (Some(name), Some(status)) = (name, status) {
                status_map.insert(name.to_string(), status.to_string());
            }
        }
    }

    if status_map.is_empty() {
        return (vec![EMPTY_STATUS_MAP_FAILURE.to_string()], status_map);
    }

    let failed = status_map
        .iter()
        .filter(|(_, status)| status.as_str() != "PASSED" && status.as_str() != "SKIPPED")
        .map(|(name, _)| name.clone())
        .collect();
    (failed, status_map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_analyze_empty_map() {
        assert_eq!(
            analyze_status_map(&StatusMap::new()),
            vec![EMPTY_STATUS_MAP_FAILURE]
        );
    }

    #[test]
    fn test_analyze_filters_passed_and_skipped() {
        let mut map = StatusMap::new();
        map.insert("t1".into(), TestStatus::Passed);
        map.insert("t2".into(), TestStatus::Failed);
        map.insert("t3".into(), TestStatus::Skipped);
        map.insert("t4".into(), TestStatus::Error);
        assert_eq!(analyze_status_map(&map), vec!["t2", "t4"]);
    }

    #[test]
    fn test_analyze_output_json() {
        let output = json!({"tests": [
            {"name": "a", "status": "PASSED"},
            {"name": "b", "status": "FAILED"},
            {"name": "c", "status": "SKIPPED"},
        ]});
        let (failed, map) = analyze_output_json(&output);
        assert_eq!(failed, vec!["b"]);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_analyze_output_json_empty() {
        let (failed, map) = analyze_output_json(&json!({"tests": []}));
        assert_eq!(failed, vec![EMPTY_STATUS_MAP_FAILURE]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_parser_selection() {
        assert!(parser_for(Language::Python, "anything/else").is_some());
        assert!(parser_for(Language::Go, "org/repo").is_some());
        assert!(parser_for(Language::Typescript, "org/repo").is_none());
    }

    #[test]
    fn test_status_tokens() {
        assert_eq!(TestStatus::from_token("XPASSED"), Some(TestStatus::Passed));
        assert_eq!(TestStatus::from_token("XFAILED"), Some(TestStatus::Failed));
        assert_eq!(TestStatus::from_token("bogus"), None);
    }
}
