//! Verification command execution under a [`Policy`].
//!
//! The [`CommandRunner`] trait decouples the apply pipeline from process
//! spawning. Runners never fail on a non-zero exit: refusals, spawn failures,
//! and timeouts all come back as a [`CommandResult`] with a non-zero code.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::io::config::Policy;
use crate::io::process::run_with_timeout;

/// Exit code reported when the policy refuses a command.
pub const EXIT_NOT_PERMITTED: i32 = 126;
/// Exit code reported when the executable could not be started.
pub const EXIT_SPAWN_FAILED: i32 = 127;
/// Exit code reported when the command exceeded its timeout.
pub const EXIT_TIMED_OUT: i32 = 124;

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub executable: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandRequest {
    /// Parse a verification command line into executable and arguments.
    pub fn parse(line: &str, timeout: Duration) -> Result<Self> {
        let mut words = parse_command_line(line)?;
        let executable = words.remove(0);
        Ok(Self {
            executable,
            args: words,
            timeout,
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn refused(command: impl Into<String>, exit_code: i32, reason: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            exit_code,
            stdout: String::new(),
            stderr: reason.into(),
            duration_ms: 0,
            timed_out: false,
        }
    }
}

pub trait CommandRunner {
    fn run(&self, request: &CommandRequest, policy: &Policy) -> CommandResult;
}

/// Runs commands as child processes inside the policy's workspace root.
#[derive(Debug, Clone)]
pub struct ProcessCommandRunner {
    pub output_limit_bytes: usize,
}

impl Default for ProcessCommandRunner {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl CommandRunner for ProcessCommandRunner {
    #[instrument(skip_all, fields(command = %request.display(), timeout_ms = request.timeout.as_millis() as u64))]
    fn run(&self, request: &CommandRequest, policy: &Policy) -> CommandResult {
        let display = request.display();
        if let Some(reason) = refusal(request, policy) {
            warn!(%reason, "command refused by policy");
            return CommandResult::refused(display, EXIT_NOT_PERMITTED, reason);
        }

        let mut cmd = Command::new(&request.executable);
        cmd.args(&request.args).current_dir(&policy.workspace_root);

        let output = match run_with_timeout(cmd, None, request.timeout, self.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "command could not be run");
                return CommandResult::refused(display, EXIT_SPAWN_FAILED, format!("{err:#}"));
            }
        };

        let exit_code = if output.timed_out {
            EXIT_TIMED_OUT
        } else {
            // Terminated by a signal: no code, still a failure.
            output.status.code().unwrap_or(-1)
        };
        info!(exit_code, timed_out = output.timed_out, "command finished");
        CommandResult {
            command: display,
            exit_code,
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            duration_ms: output.elapsed.as_millis() as u64,
            timed_out: output.timed_out,
        }
    }
}

fn refusal(request: &CommandRequest, policy: &Policy) -> Option<String> {
    if !policy.allow_exec {
        return Some("command execution disabled by policy".to_string());
    }
    if !policy.permits_command(&request.executable) {
        return Some(format!(
            "command '{}' is not in the allowed command list",
            request.executable
        ));
    }
    let is_git = Path::new(&request.executable)
        .file_stem()
        .is_some_and(|stem| stem == "git");
    if is_git && !policy.allow_git {
        return Some("git commands disabled by policy".to_string());
    }
    None
}

/// Split a command line into words.
///
/// Supports single quotes (literal), double quotes (with `\"` and `\\`
/// escapes), and backslash escapes outside quotes. No shell expansion.
pub fn parse_command_line(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => bail!("unterminated single quote in command: {line}"),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => bail!("unterminated double quote in command: {line}"),
                        },
                        Some(c) => current.push(c),
                        None => bail!("unterminated double quote in command: {line}"),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => bail!("trailing backslash in command: {line}"),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    if words.is_empty() {
        bail!("empty command");
    }
    Ok(words)
}
