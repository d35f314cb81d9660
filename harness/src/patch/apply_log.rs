//! Parsing of `git apply` / `patch` output into per-hunk line offsets.
//!
//! When a patch applies with fuzz the tool reports lines like
//! `Hunk #2 succeeded at 141 (offset +3 lines).`; downstream line-number
//! bookkeeping has to remap the diff-declared targets accordingly.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Hunk\s+#(\d+)\s+succeeded\s+at\s+(\d+)\s+\(offset\s+([+-]?\d+)\s+lines?\)")
        .expect("HUNK_RE regex should compile")
});

static CHECKING_PATCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Checking patch (.+?)\.\.\.").expect("CHECKING_PATCH_RE regex should compile")
});

/// Offset information for one applied hunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkOffset {
    pub hunk: u32,
    pub applied_at_line: i64,
    pub offset: i64,
}

/// Parse an apply log into `{file → {hunk index → offset}}`. Hunks that
/// applied cleanly (no offset note) simply do not appear.
pub fn parse_apply_log(log: &str) -> HashMap<String, HashMap<u32, HunkOffset>> {
    let mut result: HashMap<String, HashMap<u32, HunkOffset>> = HashMap::new();
    let mut current_file: Option<String> = None;

    for raw_line in log.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(caps) = CHECKING_PATCH_RE.captures(line) {
            let file = caps[1].to_string();
            result.entry(file.clone()).or_default();
            current_file = Some(file);
            continue;
        }

        if let (Some(caps), Some(file)) = (HUNK_RE.captures(line), current_file.as_ref()) {
            let hunk: u32 = caps[1].parse().unwrap_or(0);
            let applied_at_line: i64 = caps[2].parse().unwrap_or(0);
            let offset: i64 = caps[3].parse().unwrap_or(0);
            result.entry(file.clone()).or_default().insert(
                hunk,
                HunkOffset {
                    hunk,
                    applied_at_line,
                    offset,
                },
            );
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offsets() {
        let log = "Checking patch src/core/numbers.py...\nHunk #1 succeeded at 120 (offset +2 lines).\nHunk #3 succeeded at 300 (offset -1 line).\nChecking patch src/other.py...\n";
        let parsed = parse_apply_log(log);

        let numbers = &parsed["src/core/numbers.py"];
        assert_eq!(
            numbers[&1],
            HunkOffset {
                hunk: 1,
                applied_at_line: 120,
                offset: 2
            }
        );
        assert_eq!(numbers[&3].offset, -1);
        assert!(parsed["src/other.py"].is_empty());
    }

    #[test]
    fn test_zero_offset_lines_parse() {
        let log = "Checking patch a.go...\nHunk #1 succeeded at 10 (offset +0 lines).\n";
        let parsed = parse_apply_log(log);
        assert_eq!(parsed["a.go"][&1].offset, 0);
        assert_eq!(parsed["a.go"][&1].applied_at_line, 10);
    }

    #[test]
    fn test_hunk_line_without_file_is_ignored() {
        let log = "Hunk #1 succeeded at 5 (offset +1 lines).\n";
        assert!(parse_apply_log(log).is_empty());
    }

    #[test]
    fn test_empty_log() {
        assert!(parse_apply_log("").is_empty());
    }
}
