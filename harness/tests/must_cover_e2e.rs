//! End-to-end must-cover flow: a gold patch, its apply log, and the
//! post-apply sources go in; a coverage verdict against a trace comes out.

use std::collections::BTreeMap;

use harness::coverage::{
    compute_coverage, compute_must_coverage, parse_python_coverage, CoverageOutcome, MustCoverKey,
};

const GOLD_PATCH: &str = "\
diff --git a/src/calc.py b/src/calc.py
--- a/src/calc.py
+++ b/src/calc.py
@@ -3,5 +3,8 @@
 def divide(a, b):
-    return a / b
+    if b == 0:
+        raise ValueError(\"division by zero\")
+    result = a / b
+    return result
";

const POST_APPLY_SOURCE: &str = "\
import math

def divide(a, b):
    if b == 0:
        raise ValueError(\"division by zero\")
    result = a / b
    return result
";

fn must_cover() -> harness::MustCoverMap {
    let mut sources = BTreeMap::new();
    sources.insert("src/calc.py".to_string(), POST_APPLY_SOURCE.to_string());
    compute_must_coverage(GOLD_PATCH, "", &sources)
}

#[test]
fn test_must_cover_targets_the_patched_body() {
    let must_cover = must_cover();
    let record = &must_cover["src/calc.py"];

    // The added body lines (4-7) are required; the import is not.
    assert!(record.exe_modified_lines.contains(&4));
    assert!(record.exe_modified_lines.contains(&6));
    assert!(!record.exe_slice_lines_scope.contains(&1));
    // Everything required is executable.
    for line in &record.exe_slice_lines_scope {
        assert!(*line >= 3);
    }
}

#[test]
fn test_full_trace_yields_full_coverage() {
    let must_cover = must_cover();
    let trace = r#"{"files": {"/testbed/src/calc.py": {
        "executed_lines": [1, 3, 4, 5, 6, 7],
        "missing_lines": []
    }}}"#;
    let report = parse_python_coverage(trace, "/testbed").unwrap();

    match compute_coverage(&must_cover, Some(&report), MustCoverKey::SliceScope) {
        CoverageOutcome::Rate { rate, uncovered } => {
            assert_eq!(rate, 1.0);
            assert!(uncovered.is_empty());
        }
        CoverageOutcome::Unknown => panic!("expected a rate"),
    }
}

#[test]
fn test_partial_trace_reports_the_missed_branch() {
    let must_cover = must_cover();
    // The error branch (lines 4-5) never ran.
    let trace = r#"{"files": {"/testbed/src/calc.py": {
        "executed_lines": [1, 3, 6, 7],
        "missing_lines": [4, 5]
    }}}"#;
    let report = parse_python_coverage(trace, "/testbed").unwrap();

    match compute_coverage(&must_cover, Some(&report), MustCoverKey::SliceScope) {
        CoverageOutcome::Rate { rate, uncovered } => {
            assert!(rate < 1.0);
            let missed = &uncovered["src/calc.py"];
            assert!(missed.iter().any(|(line, text)| *line == 4 && text.contains("b == 0")));
        }
        CoverageOutcome::Unknown => panic!("expected a rate"),
    }
}

#[test]
fn test_missing_trace_is_unknown() {
    let must_cover = must_cover();
    assert_eq!(
        compute_coverage(&must_cover, None, MustCoverKey::SliceScope),
        CoverageOutcome::Unknown
    );
}
