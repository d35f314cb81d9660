//! Pure unified-diff manipulation.
//!
//! No I/O happens here: callers hand in diff text and get diff text (or
//! extracted metadata) back. Handles both `diff --git` style patches and bare
//! unified diffs that start at a `---`/`+++` header, including creation and
//! deletion sides (`/dev/null`).

mod apply_log;
mod blocks;
mod directives;

pub use apply_log::{parse_apply_log, HunkOffset};
pub use blocks::{list_changed_files, split_blocks, DiffBlock};
pub use directives::test_directives;

use std::collections::HashSet;

/// Directories whose contents are never kept in a filtered diff.
const FILTER_DIRS: &[&str] = &["public", "dist", "build", "assets", "static"];

/// File names that are never kept in a filtered diff.
const FILTER_FILES: &[&str] = &[
    "yarn.lock",
    "package-lock.json",
    "go.sum",
    "go.work",
    "go.work.sum",
];

/// File extensions that are never kept in a filtered diff.
const FILTER_EXTS: &[&str] = &[".orig", ".out", ".min.js", ".rej", ".bak"];

/// Selection mode for [`filter_blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    /// Retain only blocks whose path is in the given set.
    Only,
    /// Retain only blocks whose path is *not* in the given set.
    Exclude,
}

/// Return the `diff --git` header lines of a patch, in order. The agent
/// drivers record these for the patches they applied so that a submission can
/// be stripped of any re-emitted chunks.
pub fn apply_header_lines(diff: &str) -> Vec<String> {
    diff.lines()
        .filter(|line| line.starts_with("diff --git"))
        .map(|line| line.trim().to_string())
        .collect()
}

/// Whether a diff block carries no applicable text hunk: git binary patches,
/// `Binary files … differ` markers, or blocks without a single `@@` hunk.
fn is_binary_block(block: &DiffBlock) -> bool {
    let text = &block.text;
    if text.contains("GIT binary patch") || text.contains("Binary files") {
        return true;
    }
    !text.lines().any(|line| line.starts_with("@@"))
}

/// Whether a path falls under one of the forbidden directories.
fn in_filtered_dir(path: &str) -> bool {
    path.split('/')
        .rev()
        .skip(1)
        .any(|component| FILTER_DIRS.contains(&component))
}

/// Whether a path is blacklisted by name or extension.
fn is_filtered_file(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    FILTER_FILES.contains(&name) || FILTER_EXTS.iter().any(|ext| name.ends_with(ext))
}

/// Filter a diff down to blocks selected by `files`/`keep`, additionally
/// dropping binary blocks, auto-generated artefacts, and files under
/// forbidden directories. Robust against patches that begin mid-file without
/// a `diff --git` header (pathless leading blocks are dropped).
pub fn filter_blocks(diff: &str, files: &[String], keep: Keep) -> String {
    let selection: HashSet<&str> = files.iter().map(String::as_str).collect();

    let kept: Vec<String> = split_blocks(diff)
        .into_iter()
        .filter(|block| {
            let path = match &block.path {
                Some(p) => p.as_str(),
                None => return false,
            };
            if is_binary_block(block) || in_filtered_dir(path) || is_filtered_file(path) {
                return false;
            }
            match keep {
                Keep::Only => selection.contains(path),
                Keep::Exclude => !selection.contains(path),
            }
        })
        .map(|block| block.text)
        .collect();

    join_blocks(kept)
}

/// Delete every block of `outer` whose target file also appears in
/// `co_tenant`. Used to keep test patches and code patches file-disjoint
/// before evaluation.
pub fn remove_conflicting_chunks(outer: &str, co_tenant: &str) -> String {
    let conflicting: HashSet<String> = split_blocks(co_tenant)
        .into_iter()
        .filter_map(|block| block.path)
        .collect();

    let kept: Vec<String> = split_blocks(outer)
        .into_iter()
        .filter(|block| match &block.path {
            Some(path) => !conflicting.contains(path),
            None => true,
        })
        .map(|block| block.text)
        .collect();

    join_blocks(kept)
}

/// Strip blocks of the given applied patches (by their `diff --git` header
/// lines) out of an agent submission, then drop noise blocks. The result is
/// the test-only part of the submission.
pub fn filter_submission(diff: &str, applied_headers: &[String]) -> String {
    let applied: HashSet<&str> = applied_headers.iter().map(String::as_str).collect();

    let kept: Vec<String> = split_blocks(diff)
        .into_iter()
        .filter(|block| {
            let path = match &block.path {
                Some(p) => p.as_str(),
                None => return false,
            };
            if is_binary_block(block) || in_filtered_dir(path) || is_filtered_file(path) {
                return false;
            }
            let header = block
                .text
                .lines()
                .next()
                .map(str::trim)
                .unwrap_or_default();
            !applied.contains(header)
        })
        .map(|block| block.text)
        .collect();

    join_blocks(kept)
}

fn join_blocks(blocks: Vec<String>) -> String {
    let mut out = String::new();
    for block in blocks {
        out.push_str(block.trim_end_matches('\n'));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(path: &str, body: &str) -> String {
        format!(
            "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n@@ -1,1 +1,2 @@\n line\n{body}\n"
        )
    }

    #[test]
    fn test_remove_conflicting_chunks_disjoint() {
        let outer = format!("{}{}", block("src/app.py", "+a"), block("tests/test_app.py", "+b"));
        let co_tenant = block("src/app.py", "+fix");

        let result = remove_conflicting_chunks(&outer, &co_tenant);
        let remaining = list_changed_files(&result);
        assert_eq!(remaining, vec!["tests/test_app.py"]);

        let co_files: Vec<String> = list_changed_files(&co_tenant);
        for f in remaining {
            assert!(!co_files.contains(&f));
        }
    }

    #[test]
    fn test_remove_conflicting_chunks_bare_style() {
        let outer = "--- a/src/lib.go\n+++ b/src/lib.go\n@@ -1,1 +1,2 @@\n x\n+y\n";
        let co_tenant = block("src/lib.go", "+z");
        assert_eq!(remove_conflicting_chunks(outer, &co_tenant), "");
    }

    #[test]
    fn test_remove_conflicting_chunks_dev_null_side() {
        // File creation: the --- side is /dev/null, identity comes from +++.
        let outer = "--- /dev/null\n+++ b/tests/new_test.py\n@@ -0,0 +1,1 @@\n+x\n";
        let co_tenant = "--- a/tests/new_test.py\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-x\n";
        assert_eq!(remove_conflicting_chunks(outer, co_tenant), "");
    }

    #[test]
    fn test_filter_blocks_keep_subset_law() {
        let diff = format!("{}{}", block("a.py", "+1"), block("b.py", "+2"));
        let filtered = filter_blocks(&diff, &["a.py".to_string()], Keep::Only);
        let files = list_changed_files(&filtered);
        assert_eq!(files, vec!["a.py"]);
    }

    #[test]
    fn test_filter_blocks_drops_binary() {
        let diff = "diff --git a/img.png b/img.png\nGIT binary patch\nliteral 10\n";
        assert_eq!(filter_blocks(diff, &[], Keep::Exclude), "");
    }

    #[test]
    fn test_filter_blocks_drops_hunkless() {
        let diff = "diff --git a/x b/x\nold mode 100644\nnew mode 100755\n";
        assert_eq!(filter_blocks(diff, &[], Keep::Exclude), "");
    }

    #[test]
    fn test_filter_blocks_drops_forbidden_dirs_and_files() {
        let diff = format!(
            "{}{}{}{}",
            block("dist/bundle.js", "+x"),
            block("package-lock.json", "+x"),
            block("src/app.min.js", "+x"),
            block("src/keep.js", "+x"),
        );
        let filtered = filter_blocks(&diff, &[], Keep::Exclude);
        assert_eq!(list_changed_files(&filtered), vec!["src/keep.js"]);
    }

    #[test]
    fn test_filter_blocks_mid_file_start() {
        let diff = "@@ -1,1 +1,1 @@\n-a\n+b\ndiff --git a/ok.py b/ok.py\n--- a/ok.py\n+++ b/ok.py\n@@ -1 +1,2 @@\n c\n+d\n";
        let filtered = filter_blocks(diff, &[], Keep::Exclude);
        assert_eq!(list_changed_files(&filtered), vec!["ok.py"]);
    }

    #[test]
    fn test_filter_submission_strips_applied_patch() {
        let gold = block("src/core.py", "+fix");
        let submission = format!("{}{}", gold, block("tests/test_core.py", "+assert"));
        let headers = apply_header_lines(&gold);

        let result = filter_submission(&submission, &headers);
        assert_eq!(list_changed_files(&result), vec!["tests/test_core.py"]);
    }

    #[test]
    fn test_apply_header_lines() {
        let diff = format!("{}{}", block("a.py", "+1"), block("b.py", "+2"));
        assert_eq!(
            apply_header_lines(&diff),
            vec!["diff --git a/a.py b/a.py", "diff --git a/b.py b/b.py"]
        );
    }

    #[test]
    fn test_empty_diff_round_trips() {
        assert_eq!(filter_blocks("", &[], Keep::Exclude), "");
        assert_eq!(remove_conflicting_chunks("", ""), "");
        assert!(list_changed_files("").is_empty());
    }
}
