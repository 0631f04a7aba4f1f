//! Per-run backups of files a patch is about to touch.
//!
//! Layout: `<backup_root>/<run_id>/manifest.json` plus a mirror of each backed
//! up file under `<backup_root>/<run_id>/files/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::safety::is_unsafe_path;

/// Metadata describing a completed backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupManifest {
    pub run_id: String,
    pub dir: PathBuf,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    /// Workspace-relative path.
    pub path: String,
    /// False when the patch creates the file; restore then removes it.
    pub existed: bool,
}

impl BackupManifest {
    fn files_dir(&self) -> PathBuf {
        self.dir.join("files")
    }
}

/// Copy the current content of `files` into a fresh backup directory.
#[instrument(skip_all, fields(run_id, file_count = files.len()))]
pub fn create_backup(
    workspace_root: &Path,
    backup_root: &Path,
    run_id: &str,
    files: &[String],
) -> Result<BackupManifest> {
    if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id == "." || run_id == ".." {
        bail!("run id '{run_id}' is not usable as a directory name");
    }
    let dir = backup_root.join(run_id);
    if dir.exists() {
        bail!("backup directory already exists: {}", dir.display());
    }
    let mut manifest = BackupManifest {
        run_id: run_id.to_string(),
        dir,
        entries: Vec::with_capacity(files.len()),
    };
    let files_dir = manifest.files_dir();
    fs::create_dir_all(&files_dir)
        .with_context(|| format!("create backup dir {}", files_dir.display()))?;

    for rel in files {
        if is_unsafe_path(rel) {
            bail!("refusing to back up unsafe path {rel}");
        }
        let source = workspace_root.join(rel);
        let existed = source.is_file();
        if existed {
            let target = files_dir.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create backup dir {}", parent.display()))?;
            }
            fs::copy(&source, &target)
                .with_context(|| format!("back up {} to {}", source.display(), target.display()))?;
        }
        debug!(path = %rel, existed, "backed up file");
        manifest.entries.push(BackupEntry {
            path: rel.clone(),
            existed,
        });
    }

    write_manifest(&manifest)?;
    info!(dir = %manifest.dir.display(), "backup created");
    Ok(manifest)
}

/// Restore every file recorded in `manifest`. Returns the number of entries
/// restored (copied back or removed).
#[instrument(skip_all, fields(run_id = %manifest.run_id))]
pub fn restore_backup(workspace_root: &Path, manifest: &BackupManifest) -> Result<usize> {
    let files_dir = manifest.files_dir();
    let mut restored = 0;
    for entry in &manifest.entries {
        let target = workspace_root.join(&entry.path);
        if entry.existed {
            let source = files_dir.join(&entry.path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::copy(&source, &target)
                .with_context(|| format!("restore {} from {}", target.display(), source.display()))?;
        } else if target.exists() {
            fs::remove_file(&target)
                .with_context(|| format!("remove created file {}", target.display()))?;
        }
        restored += 1;
    }
    info!(restored, "backup restored");
    Ok(restored)
}

/// Load a manifest written by [`create_backup`].
pub fn load_manifest(dir: &Path) -> Result<BackupManifest> {
    let path = dir.join("manifest.json");
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_manifest(manifest: &BackupManifest) -> Result<()> {
    let path = manifest.dir.join("manifest.json");
    let mut buf = serde_json::to_string_pretty(manifest).context("serialize backup manifest")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))
}
