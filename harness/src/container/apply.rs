//! Patch application inside a live container.
//!
//! Used by the agent flows, where the repo is already checked out in a
//! long-running container and a patch has to be applied before the agent
//! starts working. A strategy cascade deals with whitespace drift and fuzzy
//! contexts; the first strategy that succeeds wins.

use std::io::Write;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::patch::apply_header_lines;

use super::{ContainerEngine, RunnerError};

/// Apply strategies, tried in order.
pub const GIT_APPLY_CMDS: &[&str] = &[
    "git apply --verbose",
    "git apply --verbose --reject",
    "patch --batch --fuzz=5 -p1 -i",
];

static DIFF_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^diff --git a/([^ \n]+) b/([^ \n]+)").expect("DIFF_HEADER_RE regex should compile")
});

/// Pre-create parent directories for files the diff adds, so `git apply`
/// does not fail on missing paths.
pub async fn prepare_directories_for_patch(
    engine: &dyn ContainerEngine,
    container: &str,
    patch: &str,
    workdir: &str,
) -> Result<(), RunnerError> {
    for line in patch.lines() {
        let Some(caps) = DIFF_HEADER_RE.captures(line) else {
            continue;
        };
        let (old_path, new_path) = (&caps[1], &caps[2]);
        if old_path != "dev/null" && old_path != "/dev/null" {
            continue;
        }
        let Some((dir, _)) = new_path.rsplit_once('/') else {
            continue;
        };
        let result = engine
            .exec(container, &format!("mkdir -p '{dir}'"), Some(workdir), None)
            .await?;
        if result.returncode != 0 {
            warn!(container, dir, "mkdir for new patch file failed");
        }
    }
    Ok(())
}

/// Result of a live-container patch application.
#[derive(Debug, Clone, Default)]
pub struct AppliedPatch {
    /// The applied `diff --git` header lines; empty when every strategy
    /// failed.
    pub files: Vec<String>,
    /// The apply tool's combined output (hunk offsets live here).
    pub log: String,
}

impl AppliedPatch {
    pub fn succeeded(&self) -> bool {
        !self.files.is_empty()
    }
}

/// Copy `patch` into the container and apply it with the strategy cascade.
/// The staged diff file is removed whether or not a strategy succeeded.
pub async fn apply_patch(
    engine: &dyn ContainerEngine,
    container: &str,
    patch: &str,
    workdir: &str,
) -> Result<AppliedPatch, RunnerError> {
    if patch.trim().is_empty() {
        return Ok(AppliedPatch::default());
    }

    let patch_path = "patch.diff";
    let container_patch_path = format!("{}/{patch_path}", workdir.trim_end_matches('/'));

    // Stage through a temp file and `docker cp`: passing the diff on a
    // command line trips ARG_MAX on large patches.
    let mut tmp = tempfile::NamedTempFile::new()?;
    tmp.write_all(patch.as_bytes())?;
    engine
        .copy_in(container, tmp.path(), &container_patch_path)
        .await?;

    prepare_directories_for_patch(engine, container, patch, workdir).await?;

    for apply_cmd in GIT_APPLY_CMDS {
        let result = engine
            .exec(
                container,
                &format!("{apply_cmd} {patch_path}"),
                Some(workdir),
                None,
            )
            .await?;
        if result.returncode == 0 {
            debug!(container, strategy = apply_cmd, "patch applied");
            let _ = engine
                .exec(container, &format!("rm -f {patch_path}"), Some(workdir), None)
                .await;
            return Ok(AppliedPatch {
                files: apply_header_lines(patch),
                log: result.output,
            });
        }
        debug!(container, strategy = apply_cmd, output = %result.output.trim(), "apply strategy failed");
    }

    warn!(container, "all patch apply strategies failed");
    let _ = engine
        .exec(container, &format!("rm -f {patch_path}"), Some(workdir), None)
        .await;
    Ok(AppliedPatch::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerLimits, ExecOutput, WaitOutcome};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Engine stub whose `exec` fails the first N apply attempts.
    struct CascadeEngine {
        commands: Mutex<Vec<String>>,
        fail_applies: usize,
    }

    #[async_trait]
    impl ContainerEngine for CascadeEngine {
        async fn pull(&self, _: &str, _: Option<&str>) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn image_exists(&self, _: &str) -> bool {
            true
        }
        async fn run_detached(
            &self,
            _: &str,
            _: &Path,
            _: &str,
            _: &ContainerLimits,
            _: bool,
            _: Option<&str>,
        ) -> Result<String, RunnerError> {
            Ok("cid".into())
        }
        async fn wait(&self, _: &str, _: Duration) -> Result<WaitOutcome, RunnerError> {
            Ok(WaitOutcome {
                status_code: 0,
                oom_killed: false,
                timed_out: false,
            })
        }
        async fn exec(
            &self,
            _: &str,
            command: &str,
            _: Option<&str>,
            _: Option<&str>,
        ) -> Result<ExecOutput, RunnerError> {
            let mut commands = self.commands.lock().unwrap();
            commands.push(command.to_string());
            let apply_attempts = commands
                .iter()
                .filter(|c| c.contains("apply") || c.contains("patch --batch"))
                .count();
            let is_apply = command.contains("apply") || command.contains("patch --batch");
            let returncode = if is_apply && apply_attempts <= self.fail_applies {
                1
            } else {
                0
            };
            Ok(ExecOutput {
                returncode,
                output: String::new(),
            })
        }
        async fn copy_in(&self, _: &str, _: &Path, _: &str) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn logs(&self, _: &str) -> Result<String, RunnerError> {
            Ok(String::new())
        }
        async fn kill(&self, _: &str) -> Result<(), RunnerError> {
            Ok(())
        }
        async fn remove(&self, _: &str, _: bool) -> Result<(), RunnerError> {
            Ok(())
        }
    }

    const PATCH: &str = "diff --git a/src/new.py b/src/new.py\nnew file mode 100644\n--- /dev/null\n+++ b/src/new.py\n@@ -0,0 +1 @@\n+x\n";

    #[tokio::test]
    async fn test_first_strategy_wins() {
        let engine = CascadeEngine {
            commands: Mutex::new(vec![]),
            fail_applies: 0,
        };
        let applied = apply_patch(&engine, "cid", PATCH, "/app").await.unwrap();
        assert_eq!(applied.files, vec!["diff --git a/src/new.py b/src/new.py"]);

        let commands = engine.commands.lock().unwrap();
        assert_eq!(
            commands
                .iter()
                .filter(|c| c.starts_with("git apply") || c.starts_with("patch --batch"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_cascade_falls_through() {
        let engine = CascadeEngine {
            commands: Mutex::new(vec![]),
            fail_applies: 2,
        };
        let applied = apply_patch(&engine, "cid", PATCH, "/app").await.unwrap();
        assert!(applied.succeeded());

        let commands = engine.commands.lock().unwrap();
        assert!(commands.iter().any(|c| c.starts_with("patch --batch")));
    }

    #[tokio::test]
    async fn test_all_strategies_fail() {
        let engine = CascadeEngine {
            commands: Mutex::new(vec![]),
            fail_applies: 3,
        };
        let applied = apply_patch(&engine, "cid", PATCH, "/app").await.unwrap();
        assert!(!applied.succeeded());
        // The staged diff is cleaned up regardless.
        assert!(engine
            .commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with("rm -f patch.diff")));
    }

    #[tokio::test]
    async fn test_new_file_directories_precreated() {
        let engine = CascadeEngine {
            commands: Mutex::new(vec![]),
            fail_applies: 0,
        };
        apply_patch(&engine, "cid", PATCH, "/app").await.unwrap();
        assert!(engine
            .commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c == "mkdir -p 'src'"));
    }

    #[tokio::test]
    async fn test_empty_patch_is_noop() {
        let engine = CascadeEngine {
            commands: Mutex::new(vec![]),
            fail_applies: 0,
        };
        let applied = apply_patch(&engine, "cid", "  \n", "/app").await.unwrap();
        assert!(!applied.succeeded());
        assert!(engine.commands.lock().unwrap().is_empty());
    }
}
