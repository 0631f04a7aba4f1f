//! Patch application through `git apply`.
//!
//! `git apply` works both inside a repository and in a plain directory, so
//! the workspace root does not need to be under version control. Repository
//! discovery stops at the workspace root: a root nested inside a larger
//! repository is patched as a plain directory, with paths relative to it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::run_with_timeout;

const APPLY_TIMEOUT: Duration = Duration::from_secs(60);
const APPLY_OUTPUT_LIMIT_BYTES: usize = 64 * 1024;

/// Applies a unified diff to a workspace. Failures are returned as
/// diagnostics rather than errors so the pipeline can report them.
pub trait PatchApplier {
    /// Apply `patch` under `root`, or only check that it would apply when
    /// `dry_run` is set. Returns apply-time errors (empty on success).
    fn apply(&self, root: &Path, patch: &str, dry_run: bool) -> Vec<String>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: APPLY_TIMEOUT,
        }
    }

    /// Run `git apply` with the patch on stdin. `Ok(errors)` carries git's
    /// own diagnostics; `Err` means git could not be run at all.
    #[instrument(skip_all, fields(check_only, workdir = %self.workdir.display()))]
    pub fn apply(&self, patch: &str, check_only: bool) -> Result<Vec<String>> {
        let mut args = vec!["apply", "-v", "--whitespace=nowarn"];
        if check_only {
            args.push("--check");
        }
        args.push("-");

        let workdir = fs::canonicalize(&self.workdir)
            .with_context(|| format!("resolve workspace {}", self.workdir.display()))?;
        let mut cmd = Command::new("git");
        cmd.args(&args)
            .current_dir(&workdir)
            .env_remove("GIT_DIR")
            .env_remove("GIT_WORK_TREE");
        if let Some(parent) = workdir.parent() {
            cmd.env("GIT_CEILING_DIRECTORIES", parent);
        }
        let output = run_with_timeout(cmd, Some(patch.as_bytes()), self.timeout, APPLY_OUTPUT_LIMIT_BYTES)?;

        if output.timed_out {
            warn!("git apply timed out");
            return Ok(vec![format!("git {} timed out", args.join(" "))]);
        }
        let stderr = output.stderr_lossy();
        if output.status.success() {
            let skipped = skipped_patches(&stderr);
            if skipped.is_empty() {
                debug!("git apply succeeded");
            } else {
                warn!(skipped = skipped.len(), "git apply skipped files");
            }
            return Ok(skipped);
        }
        let mut errors: Vec<String> = stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("Checking patch"))
            .map(str::to_string)
            .collect();
        if errors.is_empty() {
            errors.push(format!(
                "git {} failed with status {:?}",
                args.join(" "),
                output.status.code()
            ));
        }
        warn!(error_count = errors.len(), "git apply rejected patch");
        Ok(errors)
    }
}

/// `git apply -v` exits zero when it skips a file it considers outside the
/// working area; each skip counts as an error.
fn skipped_patches(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("Skipped patch"))
        .map(str::to_string)
        .collect()
}

/// [`PatchApplier`] backed by the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct GitPatchApplier;

impl PatchApplier for GitPatchApplier {
    fn apply(&self, root: &Path, patch: &str, dry_run: bool) -> Vec<String> {
        match Git::new(root).apply(patch, dry_run) {
            Ok(errors) => errors,
            Err(err) => vec![format!("git apply could not run: {err:#}")],
        }
    }
}
