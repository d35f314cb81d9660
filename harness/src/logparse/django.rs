//! Django test runner log parser.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

use super::{LogParser, StatusMap, TestStatus};

static TEST_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_]\w*\s\([\w.]+\)$").expect("TEST_NAME_RE regex should compile")
});

/// Multiline recovery patterns: a test name separated from its trailing `ok`
/// by framework chatter. Brittle by nature, so they sit behind a toggle.
static MULTILINE_OK_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?m)^(.*?)\s\.\.\.\sTesting\ against\ Django\ installed\ in\ ((?s:.*?))\ silenced\)\.\nok$",
        r"(?m)^(.*?)\s\.\.\.\sInternal\ Server\ Error:\ /(.*)/\nok$",
        r"(?m)^(.*?)\s\.\.\.\sSystem check identified no issues \(0 silenced\)\nok$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("MULTILINE_OK_RES regex should compile"))
    .collect()
});

const PASS_SUFFIXES: &[&str] = &[" ... ok", " ... OK", " ...  OK"];

/// One log line glues a migration banner onto the test name
/// (django__django-7188); everything before the first `...` has to go so the
/// verdict attaches to the real test.
const MIGRATION_BANNER_PREFIX: &str =
    "Applying sites.0002_alter_domain_unique...test_no_migrations";

/// Parser for Django's verbose test runner output.
pub struct DjangoParser {
    /// Enable the multiline `… ok` recovery regexes.
    pub multiline_ok_recovery: bool,
    /// Enable the migration-banner line rewrite.
    pub migration_banner_fixup: bool,
}

impl Default for DjangoParser {
    fn default() -> Self {
        Self {
            multiline_ok_recovery: true,
            migration_banner_fixup: true,
        }
    }
}

impl LogParser for DjangoParser {
    fn parse(&self, log: &str) -> StatusMap {
        let mut map = StatusMap::new();
        let mut prev_test: Option<String> = None;
        let mut previous_lines: VecDeque<String> = VecDeque::new();

        for raw_line in log.lines() {
            let line = raw_line.trim();

            if line.contains("--version is equivalent to version") {
                map.insert(
                    "--version is equivalent to version".to_string(),
                    TestStatus::Passed,
                );
            }

            if line.contains(" ... ") {
                prev_test = line.split(" ... ").next().map(str::to_string);
            }

            for suffix in PASS_SUFFIXES {
                if !line.ends_with(suffix) {
                    continue;
                }
                let effective = if self.migration_banner_fixup
                    && line.starts_with(MIGRATION_BANNER_PREFIX)
                {
                    line.splitn(2, "...").nth(1).unwrap_or(line).trim()
                } else {
                    line
                };
                if let Some(raw_test) = effective.strip_suffix(suffix) {
                    // The name may have arrived on an earlier line; backtrack
                    // until a `name (module)` form matches.
                    let mut test = raw_test.to_string();
                    if !TEST_NAME_RE.is_match(&test) {
                        for prev in previous_lines.iter().rev() {
                            if TEST_NAME_RE.is_match(prev) {
                                test = prev.clone();
                                break;
                            }
                        }
                    }
                    if test != raw_test {
                        map.insert(raw_test.to_string(), TestStatus::Passed);
                    }
                    map.insert(test, TestStatus::Passed);
                    break;
                }
            }

            previous_lines.push_back(line.to_string());

            if let Some(test) = line.split(" ... skipped").next() {
                if line.contains(" ... skipped") {
                    map.insert(test.to_string(), TestStatus::Skipped);
                }
            }

            if let Some(test) = line.strip_suffix(" ... FAIL") {
                map.insert(test.to_string(), TestStatus::Failed);
            }
            if line.starts_with("FAIL:") {
                if let Some(test) = line.split_whitespace().nth(1) {
                    map.insert(test.to_string(), TestStatus::Failed);
                }
            }

            if let Some(test) = line.strip_suffix(" ... ERROR") {
                map.insert(test.to_string(), TestStatus::Error);
            }
            if line.starts_with("ERROR:") {
                if let Some(test) = line.split_whitespace().nth(1) {
                    map.insert(test.to_string(), TestStatus::Error);
                }
            }

            if line.trim_start().starts_with("ok") {
                if let Some(test) = &prev_test {
                    map.insert(test.clone(), TestStatus::Passed);
                }
            }

            let fatal = line.contains("Fatal Python error")
                || line.contains("core dumped")
                || line.contains("Aborted");
            if fatal {
                if let Some(test) = &prev_test {
                    if !map.contains_key(test) {
                        map.insert(test.clone(), TestStatus::Error);
                    }
                }
            }
        }

        if self.multiline_ok_recovery {
            for re in MULTILINE_OK_RES.iter() {
                for caps in re.captures_iter(log) {
                    map.insert(caps[1].to_string(), TestStatus::Passed);
                }
            }
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_statuses() {
        let log = "\
test_add (migrations.test_operations.OperationTests) ... ok
test_sub (migrations.test_operations.OperationTests) ... skipped 'nope'
test_mul (migrations.test_operations.OperationTests) ... FAIL
test_div (migrations.test_operations.OperationTests) ... ERROR
";
        let map = DjangoParser::default().parse(log);
        assert_eq!(
            map["test_add (migrations.test_operations.OperationTests)"],
            TestStatus::Passed
        );
        assert_eq!(
            map["test_sub (migrations.test_operations.OperationTests)"],
            TestStatus::Skipped
        );
        assert_eq!(
            map["test_mul (migrations.test_operations.OperationTests)"],
            TestStatus::Failed
        );
        assert_eq!(
            map["test_div (migrations.test_operations.OperationTests)"],
            TestStatus::Error
        );
    }

    #[test]
    fn test_fail_and_error_headers() {
        let log = "FAIL: test_a (app.Tests)\nERROR: test_b (app.Tests)\n";
        let map = DjangoParser::default().parse(log);
        assert_eq!(map["test_a"], TestStatus::Failed);
        assert_eq!(map["test_b"], TestStatus::Error);
    }

    #[test]
    fn test_backtracked_name() {
        // Output interleaved between the name line and its verdict.
        let log = "\
test_late (app.Tests)
some interleaved output ... ok
";
        let map = DjangoParser::default().parse(log);
        assert_eq!(map["test_late (app.Tests)"], TestStatus::Passed);
    }

    #[test]
    fn test_fatal_error_marks_last_test() {
        let log = "test_crash (app.Tests) ... Fatal Python error: Segmentation fault\n";
        let map = DjangoParser::default().parse(log);
        assert_eq!(map["test_crash (app.Tests)"], TestStatus::Error);
    }

    #[test]
    fn test_migration_banner_fixup() {
        let log = "Applying sites.0002_alter_domain_unique...test_no_migrations (migrations.test_executor.ExecutorTests) ... ok\n";
        let map = DjangoParser::default().parse(log);
        assert_eq!(
            map["test_no_migrations (migrations.test_executor.ExecutorTests)"],
            TestStatus::Passed
        );

        // With the fixup disabled, the glued banner stays in the name.
        let strict = DjangoParser {
            migration_banner_fixup: false,
            ..DjangoParser::default()
        };
        let map = strict.parse(log);
        assert!(!map.contains_key("test_no_migrations (migrations.test_executor.ExecutorTests)"));
    }

    #[test]
    fn test_detached_ok_attaches_to_previous_test() {
        let log = "test_detached (app.Tests) ... \nsome log noise\nok\n";
        let map = DjangoParser::default().parse(log);
        assert_eq!(map["test_detached (app.Tests)"], TestStatus::Passed);
    }

    #[test]
    fn test_empty_log() {
        assert!(DjangoParser::default().parse("").is_empty());
    }
}
