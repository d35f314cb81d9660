//! Diff block splitting and path extraction.

/// One per-file block of a unified diff.
#[derive(Debug, Clone)]
pub struct DiffBlock {
    /// Target path, stripped of `a/`/`b/` prefixes. For `/dev/null` sides the
    /// non-null path wins. `None` for malformed blocks without any header.
    pub path: Option<String>,
    /// The block's full text, including its header lines.
    pub text: String,
}

/// Strip a `a/` or `b/` diff prefix from a path.
fn strip_diff_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

fn is_dev_null(path: &str) -> bool {
    path == "/dev/null" || path == "dev/null"
}

/// Resolve the target path from a `diff --git a/… b/…` header line.
fn path_from_git_header(line: &str) -> Option<String> {
    let rest = line.strip_prefix("diff --git ")?;
    let mut parts = rest.split_whitespace();
    let old = parts.next()?;
    let new = parts.next()?;
    let new = strip_diff_prefix(new);
    if is_dev_null(new) {
        Some(strip_diff_prefix(old).to_string())
    } else {
        Some(new.to_string())
    }
}

/// Resolve the target path from bare `--- `/`+++ ` header lines.
fn path_from_bare_headers(text: &str) -> Option<String> {
    let mut old = None;
    let mut new = None;
    for line in text.lines() {
        if let Some(p) = line.strip_prefix("--- ") {
            old.get_or_insert_with(|| p.split('\t').next().unwrap_or(p).trim().to_string());
        } else if let Some(p) = line.strip_prefix("+++ ") {
            new.get_or_insert_with(|| p.split('\t').next().unwrap_or(p).trim().to_string());
        }
        if old.is_some() && new.is_some() {
            break;
        }
    }
    let pick = |candidate: Option<String>, fallback: Option<String>| {
        candidate
            .filter(|p| !is_dev_null(p))
            .or(fallback)
            .map(|p| strip_diff_prefix(&p).to_string())
    };
    pick(new, old)
}

/// Split a diff into per-file blocks. A block starts at a `diff --git`
/// header, or at a `--- ` header for bare unified diffs. Text before the
/// first recognisable header becomes a pathless block.
pub fn split_blocks(diff: &str) -> Vec<DiffBlock> {
    let mut blocks: Vec<(Option<String>, String)> = Vec::new();
    let mut current: Option<(bool, String)> = None; // (git_style, text)

    let flush = |blocks: &mut Vec<(Option<String>, String)>, current: Option<(bool, String)>| {
        if let Some((git_style, text)) = current {
            if text.trim().is_empty() {
                return;
            }
            let path = if git_style {
                text.lines().next().and_then(path_from_git_header)
            } else {
                path_from_bare_headers(&text)
            };
            blocks.push((path, text));
        }
    };

    let lines: Vec<&str> = diff.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let starts_git = line.starts_with("diff --git ");
        // A bare `--- ` header is always followed by a `+++ ` line. It opens
        // a new block unless the current block is still inside its own header
        // section (a git-style block that has not reached its hunks yet).
        let starts_bare = line.starts_with("--- ")
            && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ "))
            && !matches!(
                &current,
                Some((_, text)) if !text.contains("+++ ") && !text.contains("@@")
            );

        if starts_git || starts_bare {
            flush(&mut blocks, current.take());
            current = Some((starts_git, String::new()));
        } else if current.is_none() {
            current = Some((false, String::new()));
        }

        if let Some((_, text)) = &mut current {
            text.push_str(line);
            text.push('\n');
        }
    }
    flush(&mut blocks, current);

    blocks
        .into_iter()
        .map(|(path, text)| {
            // A leading pathless chunk (diff starting mid-file) has no header
            // at all; keep its text but leave the path unresolved.
            let path = path.filter(|p| !p.is_empty());
            DiffBlock { path, text }
        })
        .collect()
}

/// Target path of every block in the diff, in order, without duplicates
/// removed. Blocks without a resolvable path are skipped.
pub fn list_changed_files(diff: &str) -> Vec<String> {
    split_blocks(diff)
        .into_iter()
        .filter_map(|block| block.path)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIT_DIFF: &str = "diff --git a/src/app.py b/src/app.py\nindex 111..222 100644\n--- a/src/app.py\n+++ b/src/app.py\n@@ -1,2 +1,3 @@\n import os\n+import sys\ndiff --git a/tests/test_app.py b/tests/test_app.py\nnew file mode 100644\n--- /dev/null\n+++ b/tests/test_app.py\n@@ -0,0 +1,2 @@\n+def test():\n+    pass\n";

    #[test]
    fn test_split_git_style() {
        let blocks = split_blocks(GIT_DIFF);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].path.as_deref(), Some("src/app.py"));
        assert_eq!(blocks[1].path.as_deref(), Some("tests/test_app.py"));
        assert!(blocks[0].text.starts_with("diff --git a/src/app.py"));
        assert!(blocks[1].text.ends_with("    pass\n"));
    }

    #[test]
    fn test_list_changed_files() {
        assert_eq!(
            list_changed_files(GIT_DIFF),
            vec!["src/app.py", "tests/test_app.py"]
        );
    }

    #[test]
    fn test_bare_unified_diff() {
        let diff = "--- a/pkg/mod.go\n+++ b/pkg/mod.go\n@@ -1 +1,2 @@\n x\n+y\n--- a/pkg/other.go\n+++ b/pkg/other.go\n@@ -1 +1 @@\n-a\n+b\n";
        let blocks = split_blocks(diff);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].path.as_deref(), Some("pkg/mod.go"));
        assert_eq!(blocks[1].path.as_deref(), Some("pkg/other.go"));
    }

    #[test]
    fn test_deletion_uses_non_null_side() {
        let diff = "diff --git a/gone.py b/gone.py\ndeleted file mode 100644\n--- a/gone.py\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-x\n";
        assert_eq!(list_changed_files(diff), vec!["gone.py"]);

        let bare = "--- a/gone.py\n+++ /dev/null\n@@ -1,1 +0,0 @@\n-x\n";
        assert_eq!(list_changed_files(bare), vec!["gone.py"]);
    }

    #[test]
    fn test_minus_lines_inside_hunk_do_not_split() {
        // A removed line starting with "---" inside a hunk must not open a
        // new block: real `---` headers are followed by `+++` in the block.
        let diff =
            "--- a/doc.md\n+++ b/doc.md\n@@ -1,3 +1,2 @@\n text\n--- not a header\n+replacement\n";
        let blocks = split_blocks(diff);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].path.as_deref(), Some("doc.md"));
    }

    #[test]
    fn test_mid_file_start_has_no_path() {
        let diff = "@@ -4,2 +4,3 @@\n a\n+b\n";
        let blocks = split_blocks(diff);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].path.is_none());
    }

    #[test]
    fn test_empty_input() {
        assert!(split_blocks("").is_empty());
        assert!(split_blocks("\n\n").is_empty());
    }
}
