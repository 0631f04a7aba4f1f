//! Size, file-count, and path checks applied before a patch may touch disk.
//!
//! Unlike flow normalization these checks are not fail-fast: every violation
//! is collected so the caller sees them all at once.

use std::path::{Component, Path, PathBuf};

use crate::core::patch::{parse_patch_stats, touched_paths};
use crate::core::types::SafetyReport;

pub const DEFAULT_MAX_PATCH_BYTES: usize = 2 * 1024 * 1024;
pub const DEFAULT_MAX_FILES_CHANGED: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyOptions {
    pub max_bytes: usize,
    pub max_files: usize,
}

impl Default for SafetyOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_PATCH_BYTES,
            max_files: DEFAULT_MAX_FILES_CHANGED,
        }
    }
}

pub fn validate_patch_safety(diff: &str, workspace_root: &Path, opts: &SafetyOptions) -> SafetyReport {
    let mut errors = Vec::new();

    let size = diff.len();
    if size > opts.max_bytes {
        errors.push(format!(
            "Patch exceeds max size: {size} bytes > {} bytes",
            opts.max_bytes
        ));
    }

    let stats = parse_patch_stats(diff);
    if stats.files_changed > opts.max_files {
        errors.push(format!(
            "Patch touches too many files: {} > {}",
            stats.files_changed, opts.max_files
        ));
    }

    for path in &touched_paths(diff) {
        if is_unsafe_path(path) || !stays_within(workspace_root, path) {
            errors.push(format!("Unsafe path detected: {path}"));
        }
    }

    SafetyReport {
        safe: errors.is_empty(),
        errors,
    }
}

/// Rooted paths and any `..` segment are rejected outright.
pub fn is_unsafe_path(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') || has_drive_prefix(path) {
        return true;
    }
    path.split(['/', '\\']).any(|segment| segment == "..")
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Lexically resolve `path` under `root` and confirm it does not leave it.
fn stays_within(root: &Path, path: &str) -> bool {
    let mut resolved = PathBuf::from(root);
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    resolved.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::diff_for;

    fn root() -> PathBuf {
        PathBuf::from("/workspace/project")
    }

    #[test]
    fn traversal_is_unsafe_regardless_of_limits() {
        let diff = diff_for("../../etc/passwd", &["root"], &["owned"]);
        let opts = SafetyOptions {
            max_bytes: usize::MAX,
            max_files: usize::MAX,
        };
        let report = validate_patch_safety(&diff, &root(), &opts);
        assert!(!report.safe);
        assert_eq!(report.errors, vec!["Unsafe path detected: ../../etc/passwd"]);
    }

    #[test]
    fn clean_patch_is_safe() {
        let diff = diff_for("src/lib.rs", &["a"], &["b"]);
        let report = validate_patch_safety(&diff, &root(), &SafetyOptions::default());
        assert!(report.safe, "{:?}", report.errors);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn collects_every_violation() {
        let diff = format!(
            "{}{}",
            diff_for("a/../../x", &["a"], &["b"]),
            diff_for("ok.txt", &["a"], &["b"])
        );
        let opts = SafetyOptions {
            max_bytes: 10,
            max_files: 1,
        };
        let report = validate_patch_safety(&diff, &root(), &opts);
        assert!(!report.safe);
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
        assert!(report.errors[0].contains("exceeds max size"));
        assert!(report.errors[1].contains("too many files"));
        assert!(report.errors[2].contains("Unsafe path detected: a/../../x"));
    }

    #[test]
    fn rename_source_outside_workspace_is_unsafe() {
        let diff = "diff --git a/../outside.txt b/inside.txt\n\
                    rename from ../outside.txt\n\
                    rename to inside.txt\n";
        let report = validate_patch_safety(diff, &root(), &SafetyOptions::default());
        assert!(!report.safe);
        assert_eq!(report.errors, vec!["Unsafe path detected: ../outside.txt"]);
    }

    #[test]
    fn classifies_paths() {
        assert!(is_unsafe_path("/etc/passwd"));
        assert!(is_unsafe_path("C:\\Windows"));
        assert!(is_unsafe_path("src\\..\\..\\x"));
        assert!(!is_unsafe_path("src/..hidden/file"));
        assert!(!is_unsafe_path("docs/readme.md"));
    }
}
