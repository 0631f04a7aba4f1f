//! Safe-apply pipeline: check -> back up -> apply -> verify -> roll back.
//!
//! Runs are strictly sequential. Verification stops at the first failing
//! command, which triggers a single restore attempt from the run's backup.
//! Backup and restore failures are logged with `best_effort = true` and never
//! change the reported outcome.
//!
//! Nothing here locks the workspace; concurrent runs over overlapping files
//! can race.

use std::time::Duration;

use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::core::patch::{parse_patch_stats, touched_paths};
use crate::core::safety::validate_patch_safety;
use crate::io::backup::{BackupManifest, create_backup, restore_backup};
use crate::io::command::{CommandRequest, CommandResult, CommandRunner, EXIT_SPAWN_FAILED};
use crate::io::config::{PipelineSettings, Policy};
use crate::io::git::PatchApplier;

/// Caller misuse that stops the pipeline before anything happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("writes are disabled by policy")]
    WriteDisabledByPolicy,
    #[error("no patch provided")]
    MissingPatch,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::WriteDisabledByPolicy => "WRITE_DISABLED_BY_POLICY",
            PipelineError::MissingPatch => "MISSING_PATCH",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    /// Unified diff text.
    pub patch: String,
    /// Verification command lines, run in order after a successful apply.
    pub commands: Vec<String>,
    pub run_id: Option<String>,
    pub dry_run: bool,
    /// Per-command timeout.
    pub timeout: Duration,
}

impl ApplyRequest {
    pub fn new(patch: impl Into<String>) -> Self {
        Self {
            patch: patch.into(),
            commands: Vec::new(),
            run_id: None,
            dry_run: false,
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub applied: bool,
    pub dry_run: bool,
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub errors: Vec<String>,
}

/// Terminal state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineState {
    /// Applied (or checked, for dry runs) and every command passed.
    Done,
    /// Rejected by the patch checks; nothing was written.
    Blocked,
    /// Apply or a command failed and no restore happened.
    Failed,
    /// A command failed and the backup was restored.
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub apply: ApplyOutcome,
    /// Commands actually executed, in order.
    pub commands: Vec<CommandResult>,
    pub success: bool,
    pub failed_at: Option<String>,
    pub run_id: String,
    pub backup: Option<BackupManifest>,
    pub rolled_back: bool,
    pub state: PipelineState,
}

/// Use the caller's id when it is non-blank, else generate
/// `<hex millis>-<6 lowercase alphanumerics>`.
pub fn resolve_run_id(requested: Option<&str>) -> String {
    match requested.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) => id.to_string(),
        None => generate_run_id(),
    }
}

fn generate_run_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("{:x}-{suffix}", Utc::now().timestamp_millis())
}

/// Run the pipeline for one patch.
///
/// Only the two precondition failures are errors; every other outcome is
/// described by the returned [`PipelineResult`].
#[instrument(skip_all, fields(dry_run = request.dry_run, commands = request.commands.len()))]
pub fn run_safe_apply<A, R>(
    policy: &Policy,
    settings: &PipelineSettings,
    request: &ApplyRequest,
    applier: &A,
    runner: &R,
) -> Result<PipelineResult, PipelineError>
where
    A: PatchApplier + ?Sized,
    R: CommandRunner + ?Sized,
{
    if !policy.allow_write {
        return Err(PipelineError::WriteDisabledByPolicy);
    }
    if request.patch.trim().is_empty() {
        return Err(PipelineError::MissingPatch);
    }

    let run_id = resolve_run_id(request.run_id.as_deref());
    let root = policy.workspace_root.as_path();
    let stats = parse_patch_stats(&request.patch);
    let mut result = PipelineResult {
        apply: ApplyOutcome {
            applied: false,
            dry_run: request.dry_run,
            files_changed: stats.files_changed,
            insertions: stats.insertions,
            deletions: stats.deletions,
            errors: Vec::new(),
        },
        commands: Vec::new(),
        success: false,
        failed_at: None,
        run_id,
        backup: None,
        rolled_back: false,
        state: PipelineState::Blocked,
    };

    let safety = validate_patch_safety(&request.patch, root, &policy.safety_options());
    let mut blockers = stats.errors.clone();
    blockers.extend(safety.errors);
    if !blockers.is_empty() {
        warn!(run_id = %result.run_id, errors = ?blockers, "patch blocked");
        result.apply.errors = blockers;
        return Ok(result);
    }

    let touched = touched_paths(&request.patch);
    if !request.dry_run && !touched.is_empty() {
        let backup_root = settings.backup_root(root);
        result.backup = match create_backup(root, &backup_root, &result.run_id, &touched) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                warn!(
                    best_effort = true,
                    run_id = %result.run_id,
                    error = %format!("{err:#}"),
                    "backup failed; continuing without rollback"
                );
                None
            }
        };
    }

    result.apply.errors = applier.apply(root, &request.patch, request.dry_run);
    if !result.apply.errors.is_empty() {
        warn!(run_id = %result.run_id, errors = ?result.apply.errors, "patch did not apply");
        result.state = PipelineState::Failed;
        return Ok(result);
    }
    result.apply.applied = !request.dry_run;

    if !request.dry_run {
        if policy.allow_exec {
            verify(policy, request, runner, &mut result);
        } else if !request.commands.is_empty() {
            info!(skipped = request.commands.len(), "execution disabled; verification skipped");
        }
    }

    result.success = result.failed_at.is_none();
    result.state = match (result.success, result.rolled_back) {
        (true, _) => PipelineState::Done,
        (false, true) => PipelineState::RolledBack,
        (false, false) => PipelineState::Failed,
    };
    info!(
        run_id = %result.run_id,
        success = result.success,
        rolled_back = result.rolled_back,
        "pipeline finished"
    );
    Ok(result)
}

fn verify<R: CommandRunner + ?Sized>(
    policy: &Policy,
    request: &ApplyRequest,
    runner: &R,
    result: &mut PipelineResult,
) {
    for line in &request.commands {
        let outcome = match CommandRequest::parse(line, request.timeout) {
            Ok(command) => runner.run(&command, policy),
            Err(err) => CommandResult::refused(line.clone(), EXIT_SPAWN_FAILED, format!("{err:#}")),
        };
        let passed = outcome.succeeded();
        result.commands.push(outcome);
        if passed {
            continue;
        }

        warn!(run_id = %result.run_id, command = %line, "verification failed");
        result.failed_at = Some(line.clone());
        if let Some(manifest) = &result.backup {
            match restore_backup(&policy.workspace_root, manifest) {
                Ok(_) => result.rolled_back = true,
                Err(err) => warn!(
                    best_effort = true,
                    run_id = %result.run_id,
                    error = %format!("{err:#}"),
                    "restore failed"
                ),
            }
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::path::Path;

    use crate::core::safety::DEFAULT_MAX_FILES_CHANGED;
    use crate::test_support::{ScriptedCommandRunner, TestWorkspace, diff_for};

    /// Writes the "patched" content directly so tests do not need git.
    struct FakeApplier {
        writes: Vec<(&'static str, &'static str)>,
        errors: Vec<String>,
        calls: RefCell<Vec<bool>>,
    }

    impl FakeApplier {
        fn writing(writes: Vec<(&'static str, &'static str)>) -> Self {
            Self {
                writes,
                errors: Vec::new(),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn failing(error: &str) -> Self {
            Self {
                writes: Vec::new(),
                errors: vec![error.to_string()],
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl PatchApplier for FakeApplier {
        fn apply(&self, root: &Path, _patch: &str, dry_run: bool) -> Vec<String> {
            self.calls.borrow_mut().push(dry_run);
            if !dry_run && self.errors.is_empty() {
                for (path, contents) in &self.writes {
                    std::fs::write(root.join(path), contents).expect("fake apply");
                }
            }
            self.errors.clone()
        }
    }

    fn request(patch: String, commands: &[&str]) -> ApplyRequest {
        ApplyRequest {
            commands: commands.iter().map(|c| c.to_string()).collect(),
            run_id: Some("run-test".to_string()),
            ..ApplyRequest::new(patch)
        }
    }

    #[test]
    fn preconditions_are_fatal() {
        let ws = TestWorkspace::new().expect("workspace");
        let runner = ScriptedCommandRunner::new(Vec::new());
        let applier = FakeApplier::writing(Vec::new());

        let read_only = Policy {
            allow_write: false,
            ..ws.policy()
        };
        let err = run_safe_apply(
            &read_only,
            &PipelineSettings::default(),
            &request(diff_for("a.txt", &["a"], &["b"]), &[]),
            &applier,
            &runner,
        )
        .expect_err("write disabled");
        assert_eq!(err.code(), "WRITE_DISABLED_BY_POLICY");

        let err = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &request("  \n".to_string(), &[]),
            &applier,
            &runner,
        )
        .expect_err("missing patch");
        assert_eq!(err, PipelineError::MissingPatch);
        assert!(applier.calls.borrow().is_empty());
    }

    #[test]
    fn second_failing_command_stops_and_rolls_back() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_file("a.txt", "a\n").expect("write");
        let applier = FakeApplier::writing(vec![("a.txt", "b\n")]);
        let runner = ScriptedCommandRunner::new(vec![0, 1, 0]);

        let result = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &request(diff_for("a.txt", &["a"], &["b"]), &["check one", "check two", "check three"]),
            &applier,
            &runner,
        )
        .expect("pipeline");

        assert_eq!(runner.calls(), vec!["check one", "check two"]);
        assert_eq!(result.commands.len(), 2);
        assert_eq!(result.failed_at.as_deref(), Some("check two"));
        assert!(!result.success);
        assert!(result.rolled_back);
        assert_eq!(result.state, PipelineState::RolledBack);
        assert!(result.backup.is_some());
        assert_eq!(ws.read_file("a.txt").expect("read"), "a\n");
    }

    #[test]
    fn passing_commands_keep_the_patch() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_file("a.txt", "a\n").expect("write");
        let applier = FakeApplier::writing(vec![("a.txt", "b\n")]);
        let runner = ScriptedCommandRunner::new(vec![0, 0]);

        let result = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &request(diff_for("a.txt", &["a"], &["b"]), &["one", "two"]),
            &applier,
            &runner,
        )
        .expect("pipeline");

        assert!(result.success);
        assert!(result.apply.applied);
        assert_eq!(result.apply.insertions, 1);
        assert_eq!(result.apply.deletions, 1);
        assert_eq!(result.state, PipelineState::Done);
        assert_eq!(result.run_id, "run-test");
        assert_eq!(ws.read_file("a.txt").expect("read"), "b\n");
        let backup = result.backup.expect("backup");
        assert!(backup.dir.ends_with(Path::new(".modeflow/backups/run-test")));
    }

    #[test]
    fn unsafe_patch_never_reaches_apply() {
        let ws = TestWorkspace::new().expect("workspace");
        let applier = FakeApplier::writing(Vec::new());
        let runner = ScriptedCommandRunner::new(Vec::new());

        let result = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &request(diff_for("../../etc/passwd", &["root"], &["owned"]), &["check"]),
            &applier,
            &runner,
        )
        .expect("pipeline");

        assert_eq!(result.state, PipelineState::Blocked);
        assert!(!result.success);
        assert!(result.backup.is_none());
        assert!(
            result
                .apply
                .errors
                .iter()
                .any(|e| e.contains("Unsafe path detected: ../../etc/passwd"))
        );
        assert!(applier.calls.borrow().is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn too_many_files_is_blocked() {
        let ws = TestWorkspace::new().expect("workspace");
        let patch: String = (0..=DEFAULT_MAX_FILES_CHANGED)
            .map(|i| diff_for(&format!("f{i}.txt"), &["a"], &["b"]))
            .collect();
        let result = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &request(patch, &[]),
            &FakeApplier::writing(Vec::new()),
            &ScriptedCommandRunner::new(Vec::new()),
        )
        .expect("pipeline");
        assert_eq!(result.state, PipelineState::Blocked);
    }

    #[test]
    fn dry_run_checks_without_backup_or_commands() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_file("a.txt", "a\n").expect("write");
        let applier = FakeApplier::writing(vec![("a.txt", "b\n")]);
        let runner = ScriptedCommandRunner::new(Vec::new());

        let result = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &ApplyRequest {
                dry_run: true,
                ..request(diff_for("a.txt", &["a"], &["b"]), &["check"])
            },
            &applier,
            &runner,
        )
        .expect("pipeline");

        assert!(result.success);
        assert!(!result.apply.applied);
        assert!(result.apply.dry_run);
        assert!(result.backup.is_none());
        assert_eq!(*applier.calls.borrow(), vec![true]);
        assert!(runner.calls().is_empty());
        assert_eq!(ws.read_file("a.txt").expect("read"), "a\n");
    }

    #[test]
    fn apply_errors_skip_verification() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_file("a.txt", "a\n").expect("write");
        let runner = ScriptedCommandRunner::new(Vec::new());

        let result = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &request(diff_for("a.txt", &["a"], &["b"]), &["check"]),
            &FakeApplier::failing("patch does not apply"),
            &runner,
        )
        .expect("pipeline");

        assert!(!result.success);
        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.apply.errors, vec!["patch does not apply"]);
        assert!(result.failed_at.is_none());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn exec_disabled_skips_commands() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_file("a.txt", "a\n").expect("write");
        let runner = ScriptedCommandRunner::new(vec![1]);
        let policy = Policy {
            allow_exec: false,
            ..ws.policy()
        };

        let result = run_safe_apply(
            &policy,
            &PipelineSettings::default(),
            &request(diff_for("a.txt", &["a"], &["b"]), &["check"]),
            &FakeApplier::writing(vec![("a.txt", "b\n")]),
            &runner,
        )
        .expect("pipeline");

        assert!(result.success);
        assert!(result.commands.is_empty());
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn unparseable_command_fails_like_a_nonzero_exit() {
        let ws = TestWorkspace::new().expect("workspace");
        ws.write_file("a.txt", "a\n").expect("write");
        let runner = ScriptedCommandRunner::new(Vec::new());

        let result = run_safe_apply(
            &ws.policy(),
            &PipelineSettings::default(),
            &request(diff_for("a.txt", &["a"], &["b"]), &["echo 'unterminated", "never"]),
            &FakeApplier::writing(vec![("a.txt", "b\n")]),
            &runner,
        )
        .expect("pipeline");

        assert_eq!(result.failed_at.as_deref(), Some("echo 'unterminated"));
        assert_eq!(result.commands[0].exit_code, EXIT_SPAWN_FAILED);
        assert!(result.rolled_back);
        assert!(runner.calls().is_empty());
        assert_eq!(ws.read_file("a.txt").expect("read"), "a\n");
    }

    #[test]
    fn run_ids_are_trimmed_or_generated() {
        assert_eq!(resolve_run_id(Some("  mine ")), "mine");
        let generated = resolve_run_id(Some("   "));
        let (stamp, suffix) = generated.split_once('-').expect("separator");
        assert!(u64::from_str_radix(stamp, 16).is_ok());
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(resolve_run_id(None), resolve_run_id(None));
    }
}
