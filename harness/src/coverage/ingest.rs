//! Coverage report ingestion for the four toolchains.
//!
//! Every adapter normalises its native format into
//! `{repo-relative file → (executed lines, missing lines)}`, stripping the
//! container's workspace prefix from absolute paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use line_index::LineIndex;
use regex::Regex;
use serde_json::Value;
use text_size::TextSize;

use crate::benchmark::Language;

use super::CoverageError;

/// Coverage for a single file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileCoverage {
    pub executed_lines: BTreeSet<usize>,
    pub missing_lines: BTreeSet<usize>,
}

/// A normalised coverage report.
#[derive(Debug, Clone)]
pub struct CoverageReport {
    pub language: Language,
    pub files: BTreeMap<String, FileCoverage>,
}

fn strip_prefix(path: &str, repo_prefix: &str) -> String {
    path.strip_prefix(repo_prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
        .to_string()
}

/// Python `coverage.json`: per-file `executed_lines` / `missing_lines`.
pub fn parse_python_coverage(text: &str, repo_prefix: &str) -> Result<CoverageReport, CoverageError> {
    let data: Value = serde_json::from_str(text)?;
    let mut files = BTreeMap::new();

    if let Some(file_map) = data.get("files").and_then(Value::as_object) {
        for (path, info) in file_map {
            let lines = |key: &str| -> BTreeSet<usize> {
                info.get(key)
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_u64)
                            .map(|n| n as usize)
                            .collect()
                    })
                    .unwrap_or_default()
            };
            files.insert(
                strip_prefix(path, repo_prefix),
                FileCoverage {
                    executed_lines: lines("executed_lines"),
                    missing_lines: lines("missing_lines"),
                },
            );
        }
    }

    Ok(CoverageReport {
        language: Language::Python,
        files,
    })
}

static GO_COVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+):(\d+)\.(\d+),(\d+)\.(\d+)\s+(\d+)\s+(\d+)$")
        .expect("GO_COVER_RE regex should compile")
});

/// Go coverprofile line protocol:
/// `file:startLine.startCol,endLine.endCol numStatements count`. A line is
/// executed iff any covering range has a positive count.
pub fn parse_go_coverage(text: &str, module_prefix: &str) -> CoverageReport {
    let mut executed: BTreeMap<String, BTreeMap<usize, bool>> = BTreeMap::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with("mode:") {
            continue;
        }
        let Some(caps) = GO_COVER_RE.captures(line) else {
            continue;
        };
        let file = &caps[1];
        let start_line: usize = caps[2].parse().unwrap_or(0);
        let end_line: usize = caps[4].parse().unwrap_or(start_line);
        let count: u64 = caps[7].parse().unwrap_or(0);

        let normalized = if !module_prefix.is_empty() && file.starts_with(module_prefix) {
            strip_prefix(file, module_prefix)
        } else {
            // Hosted module paths: drop the `host/org/repo` prefix.
            let parts: Vec<&str> = file.split('/').collect();
            if parts.len() > 3
                && matches!(parts[0], "github.com" | "gitlab.com" | "bitbucket.org")
            {
                parts[3..].join("/")
            } else {
                file.to_string()
            }
        };

        let file_lines = executed.entry(normalized).or_default();
        for line_num in start_line..=end_line {
            let entry = file_lines.entry(line_num).or_insert(false);
            *entry = *entry || count > 0;
        }
    }

    let files = executed
        .into_iter()
        .map(|(file, lines)| {
            let mut cov = FileCoverage::default();
            for (line, hit) in lines {
                if hit {
                    cov.executed_lines.insert(line);
                } else {
                    cov.missing_lines.insert(line);
                }
            }
            (file, cov)
        })
        .collect();

    CoverageReport {
        language: Language::Go,
        files,
    }
}

/// Istanbul `coverage-final.json`: statement spans with execution counts.
pub fn parse_istanbul_coverage(
    text: &str,
    repo_prefix: &str,
) -> Result<CoverageReport, CoverageError> {
    let data: Value = serde_json::from_str(text)?;
    let mut files = BTreeMap::new();

    if let Some(file_map) = data.as_object() {
        for (path, info) in file_map {
            let mut cov = FileCoverage::default();
            let statements = info.get("statementMap").and_then(Value::as_object);
            let counts = info.get("s").and_then(Value::as_object);

            if let (Some(statements), Some(counts)) = (statements, counts) {
                for (stmt_id, span) in statements {
                    let start = span
                        .get("start")
                        .and_then(|s| s.get("line"))
                        .and_then(Value::as_u64);
                    let Some(start) = start else { continue };
                    let end = span
                        .get("end")
                        .and_then(|s| s.get("line"))
                        .and_then(Value::as_u64)
                        .unwrap_or(start);
                    let count = counts.get(stmt_id).and_then(Value::as_u64).unwrap_or(0);

                    for line in start..=end.max(start) {
                        if count > 0 {
                            cov.executed_lines.insert(line as usize);
                        } else {
                            cov.missing_lines.insert(line as usize);
                        }
                    }
                }
            }

            cov.missing_lines = cov
                .missing_lines
                .difference(&cov.executed_lines)
                .copied()
                .collect();
            files.insert(strip_prefix(path, repo_prefix), cov);
        }
    }

    Ok(CoverageReport {
        language: Language::Javascript,
        files,
    })
}

/// V8 coverage: a directory of JSON documents mapping byte-offset ranges to
/// counts per script URL. Offsets convert to lines through the post-apply
/// source's line-start table; files whose source is unavailable are skipped
/// (estimating lines without the source produces garbage).
pub fn parse_v8_coverage(
    coverage_dir: &Path,
    repo_prefix: &str,
    source_for: &dyn Fn(&str) -> Option<String>,
) -> Result<CoverageReport, CoverageError> {
    let mut ranges: BTreeMap<String, Vec<(u64, u64, u64)>> = BTreeMap::new();

    let entries = fs::read_dir(coverage_dir)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(data) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        for script in data
            .get("result")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let url = script.get("url").and_then(Value::as_str).unwrap_or("");
            if url.is_empty() || url.starts_with("node:") {
                continue;
            }
            let file_path = url.strip_prefix("file://").unwrap_or(url);
            if file_path.contains("node_modules") {
                continue;
            }
            let normalized = strip_prefix(file_path, repo_prefix);

            let file_ranges = ranges.entry(normalized).or_default();
            for function in script
                .get("functions")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                for range in function
                    .get("ranges")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                {
                    let get = |key: &str| range.get(key).and_then(Value::as_u64).unwrap_or(0);
                    file_ranges.push((get("startOffset"), get("endOffset"), get("count")));
                }
            }
        }
    }

    let mut files = BTreeMap::new();
    for (file, file_ranges) in ranges {
        let Some(source) = source_for(&file) else {
            continue;
        };
        let index = LineIndex::new(&source);
        let len = source.len() as u32;
        let line_at = |offset: u64| -> usize {
            let clamped = (offset as u32).min(len);
            index.line_col(TextSize::new(clamped)).line as usize + 1
        };

        let mut cov = FileCoverage::default();
        for (start, end, count) in file_ranges {
            let start_line = line_at(start);
            let end_line = line_at(end).max(start_line);
            for line in start_line..=end_line {
                if count > 0 {
                    cov.executed_lines.insert(line);
                } else {
                    cov.missing_lines.insert(line);
                }
            }
        }
        cov.missing_lines = cov
            .missing_lines
            .difference(&cov.executed_lines)
            .copied()
            .collect();
        if !cov.executed_lines.is_empty() || !cov.missing_lines.is_empty() {
            files.insert(file, cov);
        }
    }

    Ok(CoverageReport {
        language: Language::Typescript,
        files,
    })
}

/// Locate and parse the coverage artefacts of one evaluation workspace
/// (`<workspace>/coverage/…`). Returns `None` when no report exists.
pub fn parse_workspace_coverage(
    workspace_dir: &Path,
    repo_prefix: &str,
    source_for: &dyn Fn(&str) -> Option<String>,
) -> Result<Option<CoverageReport>, CoverageError> {
    let coverage_dir = workspace_dir.join("coverage");
    if !coverage_dir.exists() {
        return Ok(None);
    }

    let python = coverage_dir.join("coverage.json");
    if python.exists() {
        let text = fs::read_to_string(&python)?;
        return Ok(Some(parse_python_coverage(&text, repo_prefix)?));
    }

    let go = coverage_dir.join("coverage.out");
    if go.exists() {
        let text = fs::read_to_string(&go)?;
        return Ok(Some(parse_go_coverage(&text, "")));
    }

    let istanbul = coverage_dir.join("coverage-final.json");
    if istanbul.exists() {
        let text = fs::read_to_string(&istanbul)?;
        return Ok(Some(parse_istanbul_coverage(&text, repo_prefix)?));
    }

    let v8 = coverage_dir.join("v8-coverage");
    if v8.is_dir() {
        return Ok(Some(parse_v8_coverage(&v8, repo_prefix, source_for)?));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_python_coverage() {
        let text = r#"{"files": {"/app/lib/module.py": {"executed_lines": [1, 2, 3], "missing_lines": [4, 5]}}}"#;
        let report = parse_python_coverage(text, "/app").unwrap();
        let cov = &report.files["lib/module.py"];
        assert_eq!(cov.executed_lines, [1, 2, 3].into_iter().collect());
        assert_eq!(cov.missing_lines, [4, 5].into_iter().collect());
    }

    #[test]
    fn test_go_coverage_any_positive_range_wins() {
        let text = "mode: set\ngithub.com/org/repo/pkg/file.go:28.84,29.61 1 0\ngithub.com/org/repo/pkg/file.go:29.61,31.3 1 1\n";
        let report = parse_go_coverage(text, "");
        let cov = &report.files["pkg/file.go"];
        // Line 29 is covered by both ranges: the positive count wins.
        assert!(cov.executed_lines.contains(&29));
        assert!(cov.missing_lines.contains(&28));
        assert!(cov.executed_lines.contains(&30));
        assert!(cov.executed_lines.contains(&31));
    }

    #[test]
    fn test_istanbul_coverage() {
        let text = r#"{"/app/src/file.js": {
            "statementMap": {
                "0": {"start": {"line": 1}, "end": {"line": 2}},
                "1": {"start": {"line": 4}, "end": {"line": 4}}
            },
            "s": {"0": 3, "1": 0}
        }}"#;
        let report = parse_istanbul_coverage(text, "/app").unwrap();
        let cov = &report.files["src/file.js"];
        assert_eq!(cov.executed_lines, [1, 2].into_iter().collect());
        assert_eq!(cov.missing_lines, [4].into_iter().collect());
    }

    #[test]
    fn test_v8_coverage_with_source() {
        let dir = tempdir().unwrap();
        let source = "line one\nline two\nline three\nline four\n";
        // Offsets: line 1 = 0..8, line 2 = 9..17, line 3 = 18..28.
        let doc = r#"{"result": [{
            "url": "file:///app/src/a.ts",
            "functions": [{"functionName": "f", "ranges": [
                {"startOffset": 0, "endOffset": 17, "count": 1},
                {"startOffset": 18, "endOffset": 27, "count": 0}
            ], "isBlockCoverage": true}]
        }]}"#;
        std::fs::write(dir.path().join("cov.json"), doc).unwrap();

        let lookup = |path: &str| -> Option<String> {
            (path == "src/a.ts").then(|| source.to_string())
        };
        let report = parse_v8_coverage(dir.path(), "/app", &lookup).unwrap();
        let cov = &report.files["src/a.ts"];
        assert_eq!(cov.executed_lines, [1, 2].into_iter().collect());
        assert_eq!(cov.missing_lines, [3].into_iter().collect());
    }

    #[test]
    fn test_v8_coverage_skips_files_without_source() {
        let dir = tempdir().unwrap();
        let doc = r#"{"result": [{"url": "/app/src/missing.ts", "functions": [
            {"functionName": "f", "ranges": [{"startOffset": 0, "endOffset": 5, "count": 1}]}
        ]}]}"#;
        std::fs::write(dir.path().join("cov.json"), doc).unwrap();
        let report = parse_v8_coverage(dir.path(), "/app", &|_| None).unwrap();
        assert!(report.files.is_empty());
    }

    #[test]
    fn test_workspace_detection_order() {
        let dir = tempdir().unwrap();
        let coverage = dir.path().join("coverage");
        std::fs::create_dir_all(&coverage).unwrap();
        std::fs::write(coverage.join("coverage.out"), "mode: set\n").unwrap();

        let report = parse_workspace_coverage(dir.path(), "/app", &|_| None)
            .unwrap()
            .unwrap();
        assert_eq!(report.language, Language::Go);
    }

    #[test]
    fn test_workspace_without_coverage() {
        let dir = tempdir().unwrap();
        assert!(parse_workspace_coverage(dir.path(), "/app", &|_| None)
            .unwrap()
            .is_none());
    }
}
