//! Test command assembly per benchmark family.

use super::{BenchmarkError, BenchmarkKind, Instance};

/// Built-in test commands for well-known swebench repositories. Instances can
/// always override via their own `test_command` field.
const SWEBENCH_TEST_COMMANDS: &[(&str, &str)] = &[
    (
        "django/django",
        "./tests/runtests.py --verbosity 2 --settings=test_sqlite --parallel 1",
    ),
    ("sympy/sympy", "bin/test -C --verbose"),
    ("pytest-dev/pytest", "pytest -rA"),
    ("matplotlib/matplotlib", "pytest -rA"),
    ("scikit-learn/scikit-learn", "pytest -rA"),
    ("astropy/astropy", "pytest -rA -vv"),
    ("sphinx-doc/sphinx", "tox --current-env -epy39 -v --"),
    ("mwaskom/seaborn", "pytest --no-header -rA"),
    ("psf/requests", "pytest -rA"),
    ("pallets/flask", "pytest -rA"),
    ("pydata/xarray", "pytest -rA"),
    ("pylint-dev/pylint", "pytest -rA"),
];

/// The raw command template for an instance, before directive substitution.
pub fn test_command_template(
    instance: &Instance,
    benchmark: BenchmarkKind,
) -> Result<String, BenchmarkError> {
    if let Some(cmd) = &instance.test_command {
        return Ok(cmd.clone());
    }
    match benchmark {
        BenchmarkKind::Swebench => SWEBENCH_TEST_COMMANDS
            .iter()
            .find(|(repo, _)| *repo == instance.repo)
            .map(|(_, cmd)| cmd.to_string())
            .ok_or_else(|| BenchmarkError::MissingTestCommand(instance.instance_id.clone())),
        BenchmarkKind::Swebenchpro => {
            Err(BenchmarkError::MissingTestCommand(instance.instance_id.clone()))
        }
    }
}

/// Build the complete test command with directives substituted in.
///
/// - swebench: directives join the command with spaces
///   (`pytest -rA test_a.py test_b.py`).
/// - swebenchpro: the template carries a `$@` placeholder that receives the
///   comma-joined directive list
///   (`npx mocha --reporter=json "$@"` → `… "t1.js,t2.js"`).
pub fn build_test_command(
    instance: &Instance,
    benchmark: BenchmarkKind,
    directives: &[String],
) -> Result<String, BenchmarkError> {
    let template = test_command_template(instance, benchmark)?;
    match benchmark {
        BenchmarkKind::Swebench => {
            if directives.is_empty() {
                Ok(template)
            } else {
                Ok(std::iter::once(template.as_str())
                    .chain(directives.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" "))
            }
        }
        BenchmarkKind::Swebenchpro => Ok(template.replace("$@", &directives.join(","))),
    }
}
