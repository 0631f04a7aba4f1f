//! Workspace configuration stored under `.modeflow/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::runtime_policy::RuntimePolicy;
use crate::core::safety::{DEFAULT_MAX_FILES_CHANGED, DEFAULT_MAX_PATCH_BYTES, SafetyOptions};

pub const STATE_DIR: &str = ".modeflow";
pub const CONFIG_FILE: &str = "config.toml";

/// Configuration file (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that
/// permit writes and verification but not git commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub policy: Policy,
    pub pipeline: PipelineSettings,
    /// Lowest-priority layer for runtime policy resolution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_policy: Option<RuntimePolicy>,
}

/// Permissions and limits for a run. Read-only once loaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Policy {
    pub allow_write: bool,
    pub allow_exec: bool,
    pub allow_git: bool,
    /// Executables verification commands may use. Empty means unrestricted.
    pub allowed_commands: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_patch_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_files_changed: Option<usize>,
    /// Set by the caller; not read from the config file.
    #[serde(skip)]
    pub workspace_root: PathBuf,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_write: true,
            allow_exec: true,
            allow_git: false,
            allowed_commands: Vec::new(),
            max_patch_bytes: None,
            max_files_changed: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl Policy {
    /// Limits for the safety validator; unset limits fall back to the
    /// pipeline's own defaults.
    pub fn safety_options(&self) -> SafetyOptions {
        SafetyOptions {
            max_bytes: self.max_patch_bytes.unwrap_or(DEFAULT_MAX_PATCH_BYTES),
            max_files: self.max_files_changed.unwrap_or(DEFAULT_MAX_FILES_CHANGED),
        }
    }

    /// Allow-list check. Matching is exact: a bare entry such as `cargo`
    /// permits only the bare name, resolved through `PATH`, and an entry with
    /// a path permits only that path. `./cargo` or `/tmp/x/cargo` never
    /// match `cargo`.
    pub fn permits_command(&self, executable: &str) -> bool {
        self.allowed_commands.is_empty()
            || self.allowed_commands.iter().any(|allowed| allowed == executable)
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineSettings {
    /// Backup area, relative to the workspace root unless absolute.
    pub backup_dir: PathBuf,
    /// Per verification command timeout.
    pub command_timeout_secs: u64,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from(STATE_DIR).join("backups"),
            command_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl PipelineSettings {
    pub fn backup_root(&self, workspace_root: &Path) -> PathBuf {
        if self.backup_dir.is_absolute() {
            self.backup_dir.clone()
        } else {
            workspace_root.join(&self.backup_dir)
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.command_timeout_secs == 0 {
            return Err(anyhow!("pipeline.command_timeout_secs must be > 0"));
        }
        if self.pipeline.output_limit_bytes == 0 {
            return Err(anyhow!("pipeline.output_limit_bytes must be > 0"));
        }
        if self.pipeline.backup_dir.as_os_str().is_empty() {
            return Err(anyhow!("pipeline.backup_dir must not be empty"));
        }
        if self.policy.max_patch_bytes == Some(0) {
            return Err(anyhow!("policy.max_patch_bytes must be > 0"));
        }
        if self.policy.max_files_changed == Some(0) {
            return Err(anyhow!("policy.max_files_changed must be > 0"));
        }
        if self
            .policy
            .allowed_commands
            .iter()
            .any(|cmd| cmd.trim().is_empty())
        {
            return Err(anyhow!("policy.allowed_commands entries must be non-empty"));
        }
        Ok(())
    }
}

/// Canonical config path for a workspace root.
pub fn config_path(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
