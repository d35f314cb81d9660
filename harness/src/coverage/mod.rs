//! The must-cover engine.
//!
//! Given a code patch and the post-apply sources of its changed files, the
//! engine computes per-file sets of executable lines a test suite has to
//! touch to exercise the change, then compares those sets against actual
//! coverage traces.

pub mod analysis;
mod ingest;
mod slice;

pub use analysis::{analyze_source, ScopeKind, SourceAnalysis};
pub use ingest::{
    parse_go_coverage, parse_istanbul_coverage, parse_python_coverage, parse_v8_coverage,
    parse_workspace_coverage, CoverageReport, FileCoverage,
};
pub use slice::{compute_patch_slices, slice_k, Direction};

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::benchmark::Language;
use crate::patch::{split_blocks, HunkOffset};

/// Numeric sentinel written into batch artefacts when coverage is unknown.
pub const UNKNOWN_COVERAGE_SENTINEL: f64 = 404.0;

/// Error type for coverage analysis
#[derive(Debug, thiserror::Error)]
pub enum CoverageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Tree-sitter error: {0}")]
    TreeSitter(String),
}

/// Must-cover record for one changed file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMustCover {
    pub exe_slice_lines_scope: Vec<usize>,
    pub exe_slice_lines: Vec<usize>,
    pub exe_modified_lines: Vec<usize>,
    /// Post-apply source, used to echo uncovered line content.
    pub content: String,
    pub language: String,
}

/// Per-file must-cover records for one instance.
pub type MustCoverMap = BTreeMap<String, FileMustCover>;

/// Which must-cover key a comparison runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MustCoverKey {
    #[default]
    SliceScope,
    Slice,
    Modified,
}

impl MustCoverKey {
    fn lines<'a>(&self, record: &'a FileMustCover) -> &'a [usize] {
        match self {
            MustCoverKey::SliceScope => &record.exe_slice_lines_scope,
            MustCoverKey::Slice => &record.exe_slice_lines,
            MustCoverKey::Modified => &record.exe_modified_lines,
        }
    }
}

/// Outcome of comparing must-cover lines against a coverage trace.
#[derive(Debug, Clone, PartialEq)]
pub enum CoverageOutcome {
    Rate {
        /// Mean per-file rate, rounded to three decimals.
        rate: f64,
        /// Uncovered `(line number, line content)` pairs per file.
        uncovered: BTreeMap<String, Vec<(usize, String)>>,
    },
    /// No coverage trace was available.
    Unknown,
}

impl CoverageOutcome {
    /// The numeric form used in batch artefacts (`404` for unknown).
    pub fn as_sentinel(&self) -> f64 {
        match self {
            CoverageOutcome::Rate { rate, .. } => *rate,
            CoverageOutcome::Unknown => UNKNOWN_COVERAGE_SENTINEL,
        }
    }
}

/// Extract `{file → added line numbers}` from a unified diff, remapped by the
/// apply log's per-hunk offsets so line numbers reflect the post-apply file.
pub fn added_lines(
    diff: &str,
    offsets: &HashMap<String, HashMap<u32, HunkOffset>>,
) -> BTreeMap<String, BTreeSet<usize>> {
    let mut result = BTreeMap::new();

    for block in split_blocks(diff) {
        let Some(path) = block.path else { continue };
        let file_offsets = offsets.get(&path);
        let mut added: BTreeSet<usize> = BTreeSet::new();

        let mut hunk_index: u32 = 0;
        let mut target_line: i64 = 0;
        let mut offset_num: i64 = 0;
        let mut in_hunk = false;

        for line in block.text.lines() {
            if line.starts_with("@@") {
                hunk_index += 1;
                let target_start = parse_hunk_target_start(line).unwrap_or(1);
                offset_num = file_offsets
                    .and_then(|hunks| hunks.get(&hunk_index))
                    .map(|h| h.applied_at_line - target_start)
                    .unwrap_or(0);
                target_line = target_start;
                in_hunk = true;
                continue;
            }
            if !in_hunk {
                continue;
            }
            if let Some(rest) = line.strip_prefix('+') {
                if !rest.starts_with("++") {
                    added.insert((target_line + offset_num).max(1) as usize);
                    target_line += 1;
                    continue;
                }
            }
            if line.starts_with('-') && !line.starts_with("---") {
                continue;
            }
            if line.starts_with('\\') {
                // "\ No newline at end of file"
                continue;
            }
            target_line += 1;
        }

        if !added.is_empty() {
            result.insert(path, added);
        }
    }

    result
}

fn parse_hunk_target_start(header: &str) -> Option<i64> {
    // @@ -a,b +c,d @@
    let plus = header.split('+').nth(1)?;
    let target = plus.split(|c: char| c == ',' || c == ' ').next()?;
    target.parse().ok()
}

/// Compute the must-cover record for one file given its post-apply source
/// and added lines.
pub fn compute_file_must_cover(
    path: &str,
    source: &str,
    added: &BTreeSet<usize>,
) -> Result<Option<FileMustCover>, CoverageError> {
    let Some(language) = Language::from_path(path) else {
        return Ok(None);
    };
    let tsx = path.ends_with(".tsx");

    let analysis = analysis::analyze_source(language, source, added, tsx)?;
    let (scoped, full) = compute_patch_slices(&analysis);

    let exe = &analysis.executable_lines;
    let exe_slice_lines: Vec<usize> = full.intersection(exe).copied().collect();
    let exe_slice_lines_scope: Vec<usize> = scoped.intersection(exe).copied().collect();
    let exe_modified_lines: Vec<usize> =
        analysis.modified_lines.intersection(exe).copied().collect();

    Ok(Some(FileMustCover {
        exe_slice_lines_scope,
        exe_slice_lines,
        exe_modified_lines,
        content: source.to_string(),
        language: language.as_str().to_string(),
    }))
}

/// Compute the full must-cover map for a patch: parse added lines (offset by
/// the apply log), then analyze every supported changed file whose post-apply
/// source is available.
pub fn compute_must_coverage(
    diff: &str,
    apply_log: &str,
    sources: &BTreeMap<String, String>,
) -> MustCoverMap {
    let offsets = crate::patch::parse_apply_log(apply_log);
    let added = added_lines(diff, &offsets);

    let mut must_cover = MustCoverMap::new();
    for (path, lines) in added {
        let Some(source) = sources.get(&path) else {
            continue;
        };
        match compute_file_must_cover(&path, source, &lines) {
            Ok(Some(record)) => {
                must_cover.insert(path, record);
            }
            Ok(None) => {
                warn!(file = %path, "unsupported file type, skipping must-cover analysis");
            }
            Err(e) => {
                warn!(file = %path, error = %e, "must-cover analysis failed");
            }
        }
    }
    must_cover
}

/// Compare a must-cover map against a coverage trace.
///
/// With an empty must-cover map the instance is trivially covered (1.0);
/// with no trace at all the result is [`CoverageOutcome::Unknown`]. The rate
/// is the mean of per-file rates over files with non-empty required sets, and
/// a full rate implies an empty uncovered map.
pub fn compute_coverage(
    must_cover: &MustCoverMap,
    report: Option<&CoverageReport>,
    key: MustCoverKey,
) -> CoverageOutcome {
    if must_cover.is_empty() {
        return CoverageOutcome::Rate {
            rate: 1.0,
            uncovered: BTreeMap::new(),
        };
    }

    let Some(report) = report.filter(|r| !r.files.is_empty()) else {
        return CoverageOutcome::Unknown;
    };

    let mut total = 0.0;
    let mut counted = 0usize;
    let mut uncovered: BTreeMap<String, Vec<(usize, String)>> = BTreeMap::new();

    for (file, record) in must_cover {
        let required: BTreeSet<usize> = key.lines(record).iter().copied().collect();
        if required.is_empty() {
            continue;
        }
        counted += 1;

        let executed = report
            .files
            .get(file)
            .map(|cov| cov.executed_lines.clone())
            .unwrap_or_default();
        let unhit: BTreeSet<usize> = required.difference(&executed).copied().collect();
        if unhit.is_empty() {
            total += 1.0;
            continue;
        }
        total += 1.0 - unhit.len() as f64 / required.len() as f64;

        let content_lines: Vec<&str> = record.content.lines().collect();
        let entries = uncovered.entry(file.clone()).or_default();
        for line in unhit {
            let text = content_lines
                .get(line.saturating_sub(1))
                .copied()
                .unwrap_or("")
                .to_string();
            entries.push((line, text));
        }
    }

    if counted == 0 {
        return CoverageOutcome::Rate {
            rate: 1.0,
            uncovered: BTreeMap::new(),
        };
    }
    if uncovered.is_empty() {
        return CoverageOutcome::Rate {
            rate: 1.0,
            uncovered,
        };
    }

    CoverageOutcome::Rate {
        rate: (total / counted as f64 * 1000.0).round() / 1000.0,
        uncovered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "diff --git a/src/app.py b/src/app.py\n--- a/src/app.py\n+++ b/src/app.py\n@@ -1,3 +1,5 @@\n import os\n+import sys\n def f():\n-    return 1\n+    x = 2\n+    return x\n";

    #[test]
    fn test_added_lines_without_offsets() {
        let added = added_lines(DIFF, &HashMap::new());
        assert_eq!(added["src/app.py"], [2, 4, 5].into_iter().collect());
    }

    #[test]
    fn test_added_lines_with_offset() {
        let log = "Checking patch src/app.py...\nHunk #1 succeeded at 11 (offset +10 lines).\n";
        let offsets = crate::patch::parse_apply_log(log);
        let added = added_lines(DIFF, &offsets);
        assert_eq!(added["src/app.py"], [12, 14, 15].into_iter().collect());
    }

    #[test]
    fn test_zero_offset_is_identity() {
        let log = "Checking patch src/app.py...\nHunk #1 succeeded at 1 (offset +0 lines).\n";
        let offsets = crate::patch::parse_apply_log(log);
        assert_eq!(added_lines(DIFF, &offsets), added_lines(DIFF, &HashMap::new()));
    }

    #[test]
    fn test_must_cover_subset_invariants() {
        let source = "import sys\ndef f():\n    x = 2\n    return x\n";
        let added: BTreeSet<usize> = [1, 3, 4].into_iter().collect();
        let record = compute_file_must_cover("src/app.py", source, &added)
            .unwrap()
            .unwrap();

        let exe: BTreeSet<usize> = [1, 2, 3, 4].into_iter().collect();
        for line in &record.exe_modified_lines {
            assert!(exe.contains(line));
        }
        for line in &record.exe_slice_lines {
            assert!(exe.contains(line));
        }
        for line in &record.exe_slice_lines_scope {
            assert!(exe.contains(line));
        }
    }

    #[test]
    fn test_unsupported_extension_skipped() {
        let record =
            compute_file_must_cover("README.md", "# hi\n", &[1].into_iter().collect()).unwrap();
        assert!(record.is_none());
    }

    fn must_cover_fixture() -> MustCoverMap {
        let mut map = MustCoverMap::new();
        map.insert(
            "src/app.py".to_string(),
            FileMustCover {
                exe_slice_lines_scope: vec![3, 4],
                exe_slice_lines: vec![3, 4],
                exe_modified_lines: vec![3],
                content: "import sys\ndef f():\n    x = 2\n    return x\n".to_string(),
                language: "python".to_string(),
            },
        );
        map
    }

    fn report_with(executed: &[usize]) -> CoverageReport {
        let mut files = BTreeMap::new();
        files.insert(
            "src/app.py".to_string(),
            FileCoverage {
                executed_lines: executed.iter().copied().collect(),
                missing_lines: BTreeSet::new(),
            },
        );
        CoverageReport {
            language: Language::Python,
            files,
        }
    }

    #[test]
    fn test_full_coverage() {
        let outcome = compute_coverage(
            &must_cover_fixture(),
            Some(&report_with(&[3, 4])),
            MustCoverKey::SliceScope,
        );
        match outcome {
            CoverageOutcome::Rate { rate, uncovered } => {
                assert_eq!(rate, 1.0);
                assert!(uncovered.is_empty());
            }
            CoverageOutcome::Unknown => panic!("expected a rate"),
        }
    }

    #[test]
    fn test_partial_coverage_reports_uncovered_content() {
        let outcome = compute_coverage(
            &must_cover_fixture(),
            Some(&report_with(&[3])),
            MustCoverKey::SliceScope,
        );
        match outcome {
            CoverageOutcome::Rate { rate, uncovered } => {
                assert_eq!(rate, 0.5);
                assert_eq!(uncovered["src/app.py"], vec![(4, "    return x".to_string())]);
            }
            CoverageOutcome::Unknown => panic!("expected a rate"),
        }
    }

    #[test]
    fn test_missing_report_is_unknown() {
        let outcome = compute_coverage(&must_cover_fixture(), None, MustCoverKey::SliceScope);
        assert_eq!(outcome, CoverageOutcome::Unknown);
        assert_eq!(outcome.as_sentinel(), UNKNOWN_COVERAGE_SENTINEL);
    }

    #[test]
    fn test_empty_must_cover_is_fully_covered() {
        let outcome = compute_coverage(&MustCoverMap::new(), None, MustCoverKey::SliceScope);
        assert_eq!(outcome.as_sentinel(), 1.0);
    }

    #[test]
    fn test_compute_must_coverage_end_to_end() {
        let mut sources = BTreeMap::new();
        sources.insert(
            "src/app.py".to_string(),
            "import os\nimport sys\ndef f():\n    x = 2\n    return x\n".to_string(),
        );
        let must_cover = compute_must_coverage(DIFF, "", &sources);
        let record = &must_cover["src/app.py"];
        // The import seed is filtered from the scoped slice; the body lines
        // survive in every key.
        assert!(record.exe_modified_lines.contains(&4));
        assert!(record.exe_slice_lines_scope.contains(&4));
        assert!(record.exe_slice_lines_scope.contains(&5));
    }
}
