//! Test directive extraction from a test diff.
//!
//! Directives are the arguments handed to an instance's test command: test
//! file paths for pytest-style runners, dotted module paths for Django, and
//! package directories for `go test`.

use std::collections::BTreeSet;

use crate::benchmark::Language;

use super::blocks::list_changed_files;

/// Extract test directives from the changed files of a test diff.
pub fn test_directives(language: Language, repo: &str, test_diff: &str) -> Vec<String> {
    let files = list_changed_files(test_diff);

    match language {
        Language::Python => {
            let mut directives: Vec<String> = files
                .into_iter()
                .filter(|f| f.ends_with(".py") && !f.ends_with("__init__.py"))
                .collect();

            // Django's runner takes dotted module paths relative to tests/.
            if repo == "django/django" {
                directives = directives
                    .into_iter()
                    .map(|d| {
                        d.trim_start_matches("tests/")
                            .trim_end_matches(".py")
                            .replace('/', ".")
                    })
                    .collect();
            }
            directives
        }
        Language::Go => {
            let packages: BTreeSet<String> = files
                .iter()
                .filter(|f| f.ends_with("_test.go"))
                .map(|f| match f.rsplit_once('/') {
                    Some((dir, _)) => format!("./{dir}"),
                    None => ".".to_string(),
                })
                .collect();
            packages.into_iter().collect()
        }
        Language::Javascript | Language::Typescript => files,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff_for(paths: &[&str]) -> String {
        paths
            .iter()
            .map(|p| format!("diff --git a/{p} b/{p}\n--- a/{p}\n+++ b/{p}\n@@ -1 +1,2 @@\n x\n+y\n"))
            .collect()
    }

    #[test]
    fn test_python_keeps_py_drops_init() {
        let diff = diff_for(&[
            "tests/test_models.py",
            "tests/__init__.py",
            "tests/fixtures/data.json",
        ]);
        assert_eq!(
            test_directives(Language::Python, "psf/requests", &diff),
            vec!["tests/test_models.py"]
        );
    }

    #[test]
    fn test_django_module_paths() {
        let diff = diff_for(&["tests/migrations/test_operations.py"]);
        assert_eq!(
            test_directives(Language::Python, "django/django", &diff),
            vec!["migrations.test_operations"]
        );
    }

    #[test]
    fn test_go_package_directories() {
        let diff = diff_for(&[
            "lib/srv/server_test.go",
            "lib/srv/helper_test.go",
            "lib/srv/server.go",
            "root_test.go",
        ]);
        assert_eq!(
            test_directives(Language::Go, "gravitational/teleport", &diff),
            vec![".", "./lib/srv"]
        );
    }

    #[test]
    fn test_javascript_passes_paths_through() {
        let diff = diff_for(&["test/topics.js"]);
        assert_eq!(
            test_directives(Language::Javascript, "NodeBB/NodeBB", &diff),
            vec!["test/topics.js"]
        );
    }

    #[test]
    fn test_empty_diff() {
        assert!(test_directives(Language::Python, "r", "").is_empty());
    }
}
