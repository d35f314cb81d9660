//! SymPy test runner log parser.

use std::sync::LazyLock;

use regex::Regex;

use super::{LogParser, StatusMap, TestStatus};

static TEST_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(test_\S+)\s+([a-zA-Z]+)").expect("TEST_LINE_RE regex should compile")
});

/// Parser for SymPy's single-letter test result codes (`ok`, `f`, `E`,
/// `skipped`, `xfail`). An `f` accompanied by `[OK]` is an expected failure
/// and counts as passed, as do `xfail`/`xfailed`.
pub struct SympyParser;

impl LogParser for SympyParser {
    fn parse(&self, log: &str) -> StatusMap {
        let mut map = StatusMap::new();

        for raw_line in log.lines() {
            let line = raw_line.trim();
            if !line.starts_with("test_") {
                continue;
            }
            let Some(caps) = TEST_LINE_RE.captures(line) else {
                continue;
            };
            let name = caps[1].to_string();
            let code = caps[2].to_lowercase();
            let expected_fail = line.to_lowercase().contains("[ok]");

            let status = match code.as_str() {
                "ok" => Some(TestStatus::Passed),
                "f" if expected_fail => Some(TestStatus::Passed),
                "f" => Some(TestStatus::Failed),
                "e" => Some(TestStatus::Error),
                "skipped" | "xfail" | "xfailed" => Some(TestStatus::Passed),
                _ => None,
            };
            if let Some(status) = status {
                map.insert(name, status);
            }
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        let log = "\
test_add ok
test_sub f
test_mul E
test_div skipped
test_pow xfail
";
        let map = SympyParser.parse(log);
        assert_eq!(map["test_add"], TestStatus::Passed);
        assert_eq!(map["test_sub"], TestStatus::Failed);
        assert_eq!(map["test_mul"], TestStatus::Error);
        assert_eq!(map["test_div"], TestStatus::Passed);
        assert_eq!(map["test_pow"], TestStatus::Passed);
    }

    #[test]
    fn test_expected_failure_marker() {
        let map = SympyParser.parse("test_known_issue f [OK]\n");
        assert_eq!(map["test_known_issue"], TestStatus::Passed);
    }

    #[test]
    fn test_non_test_lines_ignored() {
        let map = SympyParser.parse("random line\ncache: yes\n");
        assert!(map.is_empty());
    }
}
