//! Workspace materialisation and output collection for container runs.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::benchmark::{BenchmarkKind, Instance};

use super::RunnerError;

/// A prepared per-run directory pair.
#[derive(Debug)]
pub struct PreparedRun {
    /// Cached `output.json` from a previous run, when present and not redone.
    pub existing_output: Option<Value>,
    /// Target path of the run's parsed output.
    pub output_path: PathBuf,
    /// Host directory bind-mounted at `/workspace`.
    pub workspace_dir: PathBuf,
}

/// Create the log and workspace directories for a run. When a previous
/// `{prefix}_output.json` exists and `redo` is false, its parsed contents are
/// returned so the container run can be skipped entirely.
pub fn prepare_run(log_dir: &Path, prefix: &str, redo: bool) -> Result<PreparedRun, RunnerError> {
    let output_path = log_dir.join(format!("{prefix}_output.json"));
    let workspace_dir = log_dir.join("workspace");
    fs::create_dir_all(&workspace_dir)?;

    let existing_output = if !redo && output_path.exists() {
        match fs::read_to_string(&output_path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(path = %output_path.display(), error = %e, "cached output unreadable, rerunning");
                    None
                }
            },
            Err(_) => None,
        }
    } else {
        None
    };

    Ok(PreparedRun {
        existing_output,
        output_path,
        workspace_dir,
    })
}

/// Assemble the entry script executed inside the container: export the
/// image's recorded ENV lines, reset the repo to the base commit, apply every
/// patch in order (test patch last), run the setup command, run the tests
/// with stdout/stderr split into log files, then parse them into
/// `output.json`.
pub fn assemble_entryscript(
    instance: &Instance,
    benchmark: BenchmarkKind,
    patch_files: &[String],
    test_command: &str,
) -> String {
    let env_exports: String = instance
        .env_lines
        .iter()
        .map(|line| {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("ENV ") {
                format!("export {rest}\n")
            } else {
                format!("{line}\n")
            }
        })
        .collect();

    let workdir = benchmark.workdir();
    let base_commit = &instance.base_commit;

    let mut script = String::new();
    script.push_str(&env_exports);
    script.push_str(&format!(
        "# apply patch\ncd {workdir}\ngit reset --hard {base_commit}\ngit checkout {base_commit}\n"
    ));
    for patch_file in patch_files {
        script.push_str(&format!(
            "git apply -v /workspace/{patch_file} || {{ echo \"{} {patch_file}\"; exit 1; }}\n",
            super::APPLY_PATCH_FAIL
        ));
    }
    let setup = instance.before_repo_set_cmd.trim();
    if !setup.is_empty() {
        // Only the final line of a multi-line setup recipe is live.
        if let Some(last) = setup.lines().last() {
            script.push_str(last);
            script.push('\n');
        }
    }
    script.push_str(&format!(
        "# run test and save stdout and stderr to separate files\n{test_command} > /workspace/stdout.log 2> /workspace/stderr.log\n"
    ));
    script.push_str(
        "# run parsing script\npython /workspace/parser.py /workspace/stdout.log /workspace/stderr.log /workspace/output.json\n",
    );
    script
}

/// Write the workspace files for a run.
pub fn write_workspace_files(
    workspace_dir: &Path,
    files: &BTreeMap<String, String>,
) -> Result<(), RunnerError> {
    for (name, content) in files {
        fs::write(workspace_dir.join(name), content)?;
    }
    Ok(())
}

/// Load a per-instance script (`run_script.sh` / `parser.py`) from the
/// scripts directory.
pub fn load_instance_script(
    scripts_dir: &Path,
    instance_id: &str,
    name: &str,
) -> Result<String, RunnerError> {
    let path = scripts_dir.join(instance_id).join(name);
    fs::read_to_string(&path)
        .map_err(|_| RunnerError::MissingScript(format!("{instance_id}/{name}")))
}

/// Copy the run's stdout/stderr logs and parsed output from the workspace
/// into the log directory under the run prefix. Returns the parsed
/// `output.json` when it exists.
pub fn collect_outputs(
    workspace_dir: &Path,
    log_dir: &Path,
    prefix: &str,
) -> Result<Option<Value>, RunnerError> {
    for name in ["stdout.log", "stderr.log"] {
        let content = fs::read_to_string(workspace_dir.join(name)).unwrap_or_default();
        fs::write(log_dir.join(format!("{prefix}_{name}")), content)?;
    }

    let output_path = workspace_dir.join("output.json");
    let text = match fs::read_to_string(&output_path) {
        Ok(text) => text,
        Err(_) => {
            warn!(
                workspace = %workspace_dir.display(),
                prefix, "output.json not found, check the stdout/stderr logs"
            );
            return Ok(None);
        }
    };
    let output: Value = serde_json::from_str(&text)?;
    fs::write(log_dir.join(format!("{prefix}_output.json")), &text)?;
    Ok(Some(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::Language;
    use tempfile::tempdir;

    fn instance() -> Instance {
        Instance {
            instance_id: "instance_org__repo-abc".to_string(),
            repo: "org/repo".to_string(),
            base_commit: "deadbeef".to_string(),
            patch: String::new(),
            test_patch: String::new(),
            problem_statement: String::new(),
            language: Language::Python,
            image_name: None,
            version: None,
            test_command: None,
            before_repo_set_cmd: "apt-get update\npip install -e .".to_string(),
            selected_test_files_to_run: vec![],
            env_lines: vec!["ENV PATH=/opt/bin:$PATH".to_string()],
        }
    }

    #[test]
    fn test_entryscript_shape() {
        let script = assemble_entryscript(
            &instance(),
            BenchmarkKind::Swebenchpro,
            &["patch.diff".to_string(), "test_patch.diff".to_string()],
            "bash /workspace/run_script.sh tests/a.py",
        );

        assert!(script.contains("export PATH=/opt/bin:$PATH"));
        assert!(script.contains("cd /app"));
        assert!(script.contains("git reset --hard deadbeef"));
        // Patch order is preserved, test patch applied last.
        let gold_pos = script.find("git apply -v /workspace/patch.diff").unwrap();
        let test_pos = script
            .find("git apply -v /workspace/test_patch.diff")
            .unwrap();
        assert!(gold_pos < test_pos);
        // Only the final setup line survives.
        assert!(!script.contains("apt-get update"));
        assert!(script.contains("pip install -e ."));
        assert!(script.contains("> /workspace/stdout.log 2> /workspace/stderr.log"));
        assert!(script.contains("python /workspace/parser.py"));
    }

    #[test]
    fn test_prepare_run_caches_output() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("instance");
        std::fs::create_dir_all(&log_dir).unwrap();
        std::fs::write(
            log_dir.join("gold_with_model_test_output.json"),
            r#"{"tests": []}"#,
        )
        .unwrap();

        let prepared = prepare_run(&log_dir, "gold_with_model_test", false).unwrap();
        assert!(prepared.existing_output.is_some());

        let redone = prepare_run(&log_dir, "gold_with_model_test", true).unwrap();
        assert!(redone.existing_output.is_none());
    }

    #[test]
    fn test_collect_outputs_round_trip() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().to_path_buf();
        let workspace = log_dir.join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::write(workspace.join("stdout.log"), "out").unwrap();
        std::fs::write(workspace.join("stderr.log"), "err").unwrap();
        std::fs::write(workspace.join("output.json"), r#"{"tests":[{"name":"t","status":"PASSED"}]}"#).unwrap();

        let output = collect_outputs(&workspace, &log_dir, "gold").unwrap().unwrap();
        assert_eq!(output["tests"][0]["name"], "t");
        assert_eq!(
            std::fs::read_to_string(log_dir.join("gold_stdout.log")).unwrap(),
            "out"
        );
    }

    #[test]
    fn test_collect_outputs_missing_json() {
        let dir = tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let result = collect_outputs(&workspace, dir.path(), "gold").unwrap();
        assert!(result.is_none());
    }
}
