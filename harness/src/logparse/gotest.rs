//! `go test` log parser.

use std::sync::LazyLock;

use regex::Regex;

use super::{LogParser, StatusMap, TestStatus};

static RESULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*--- (PASS|FAIL|SKIP): (\S+)").expect("RESULT_RE regex should compile")
});

static PACKAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:ok|FAIL)\s+(\S+)").expect("PACKAGE_RE regex should compile")
});

/// Parser for `go test -v` output. Test identifiers are `package::TestName`;
/// per-test verdicts arrive before the package trailer (`ok pkg 0.1s` /
/// `FAIL pkg 0.1s`), so results are buffered until their package is known.
pub struct GoTestParser;

impl LogParser for GoTestParser {
    fn parse(&self, log: &str) -> StatusMap {
        let mut map = StatusMap::new();
        let mut pending: Vec<(String, TestStatus)> = Vec::new();

        for line in log.lines() {
            if let Some(caps) = RESULT_RE.captures(line) {
                let status = match &caps[1] {
                    "PASS" => TestStatus::Passed,
                    "SKIP" => TestStatus::Skipped,
                    _ => TestStatus::Failed,
                };
                pending.push((caps[2].to_string(), status));
                continue;
            }

            if let Some(caps) = PACKAGE_RE.captures(line) {
                let package = &caps[1];
                for (test, status) in pending.drain(..) {
                    map.insert(format!("{package}::{test}"), status);
                }
            }
        }

        // Verdicts without a trailer (e.g. a build failure aborted the run)
        // keep their bare names.
        for (test, status) in pending {
            map.insert(test, status);
        }

        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
=== RUN   TestServer
--- PASS: TestServer (0.01s)
=== RUN   TestServerTLS
--- FAIL: TestServerTLS (0.20s)
=== RUN   TestSkipped
--- SKIP: TestSkipped (0.00s)
FAIL
FAIL\tgithub.com/org/repo/lib/srv\t0.42s
=== RUN   TestOther
--- PASS: TestOther (0.00s)
PASS
ok  \tgithub.com/org/repo/lib/util\t0.10s
";

    #[test]
    fn test_package_qualified_names() {
        let map = GoTestParser.parse(LOG);
        assert_eq!(
            map["github.com/org/repo/lib/srv::TestServer"],
            TestStatus::Passed
        );
        assert_eq!(
            map["github.com/org/repo/lib/srv::TestServerTLS"],
            TestStatus::Failed
        );
        assert_eq!(
            map["github.com/org/repo/lib/srv::TestSkipped"],
            TestStatus::Skipped
        );
        assert_eq!(
            map["github.com/org/repo/lib/util::TestOther"],
            TestStatus::Passed
        );
    }

    #[test]
    fn test_subtest_names_kept_verbatim() {
        let log = "--- FAIL: TestParse/empty_input (0.00s)\nFAIL\tpkg\t0.1s\n";
        let map = GoTestParser.parse(log);
        assert_eq!(map["pkg::TestParse/empty_input"], TestStatus::Failed);
    }

    #[test]
    fn test_missing_trailer_keeps_bare_name() {
        let map = GoTestParser.parse("--- PASS: TestOrphan (0.00s)\n");
        assert_eq!(map["TestOrphan"], TestStatus::Passed);
    }

    #[test]
    fn test_empty_log() {
        assert!(GoTestParser.parse("").is_empty());
    }
}
