//! Unified diff statistics.
//!
//! Lines are classified explicitly rather than matched with multiline
//! patterns: `+++`/`---` lines are file markers only outside a hunk body.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::PatchStats;

pub const EMPTY_DIFF: &str = "Empty diff";
pub const MISSING_GIT_HEADER: &str = "Missing git diff header (expected 'diff --git')";
pub const MISSING_HUNK_HEADERS: &str = "Missing hunk headers (expected '@@ -a,b +c,d @@')";

static HUNK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -\d+(?:,\d+)? \+\d+(?:,\d+)? @@").expect("hunk header pattern is valid")
});

const GIT_HEADER: &str = "diff --git ";

/// Parse file and line statistics out of a unified git diff.
pub fn parse_patch_stats(diff: &str) -> PatchStats {
    if diff.trim().is_empty() {
        return PatchStats {
            valid: false,
            errors: vec![EMPTY_DIFF.to_string()],
            ..PatchStats::default()
        };
    }

    let mut stats = PatchStats::default();
    let mut saw_hunk = false;
    let mut in_hunk = false;

    for line in diff.lines() {
        if line.starts_with(GIT_HEADER) {
            in_hunk = false;
            if let Some((_, dst)) = header_paths(line) {
                push_unique(&mut stats.files, dst);
            }
            continue;
        }
        if HUNK_RE.is_match(line) {
            saw_hunk = true;
            in_hunk = true;
            continue;
        }
        match classify(line, in_hunk) {
            LineKind::Insertion => stats.insertions += 1,
            LineKind::Deletion => stats.deletions += 1,
            LineKind::Other => {}
        }
    }

    if !diff.contains("diff --git") {
        stats.errors.push(MISSING_GIT_HEADER.to_string());
    }
    if !saw_hunk {
        stats.errors.push(MISSING_HUNK_HEADERS.to_string());
    }

    stats.files_changed = stats.files.len();
    stats.valid = stats.errors.is_empty();
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Insertion,
    Deletion,
    Other,
}

fn classify(line: &str, in_hunk: bool) -> LineKind {
    if !in_hunk && (line.starts_with("+++") || line.starts_with("---")) {
        return LineKind::Other;
    }
    if line.starts_with('+') {
        LineKind::Insertion
    } else if line.starts_with('-') {
        LineKind::Deletion
    } else {
        LineKind::Other
    }
}

/// Every path a patch can create, modify, or remove, in first-seen order:
/// both sides of each `diff --git` header plus rename and copy endpoints.
/// `PatchStats::files` lists destinations only; backups need the sources too.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in diff.lines() {
        if line.starts_with(GIT_HEADER) {
            if let Some((src, dst)) = header_paths(line) {
                push_unique(&mut paths, src);
                push_unique(&mut paths, dst);
            }
        } else if let Some(value) = EXTENDED_PATH_HEADERS
            .iter()
            .find_map(|prefix| line.strip_prefix(prefix))
            && let Some(path) = extended_path(value)
        {
            push_unique(&mut paths, path);
        }
    }
    paths
}

const EXTENDED_PATH_HEADERS: [&str; 4] = ["rename from ", "rename to ", "copy from ", "copy to "];

fn push_unique(paths: &mut Vec<String>, path: String) {
    if !paths.contains(&path) {
        paths.push(path);
    }
}

/// `diff --git a/<src> b/<dst>` -> `(src, dst)`. Either side may be
/// C-quoted, which git does for non-ASCII and special characters.
fn header_paths(header: &str) -> Option<(String, String)> {
    let rest = header.strip_prefix(GIT_HEADER)?.trim_end();
    let (src, dst) = if let Some(quoted) = rest.strip_prefix('"') {
        let (src, tail) = unquote(quoted)?;
        let tail = tail.strip_prefix(' ')?;
        let dst = match tail.strip_prefix('"') {
            Some(quoted) => unquote(quoted)?.0,
            None => tail.to_string(),
        };
        (src, dst)
    } else if let Some((src, quoted)) = rest.split_once(" \"b/") {
        (src.to_string(), unquote(&format!("b/{quoted}"))?.0)
    } else {
        let (src, dst) = rest.split_once(" b/")?;
        (src.to_string(), format!("b/{dst}"))
    };
    let src = src.strip_prefix("a/")?;
    let dst = dst.strip_prefix("b/")?;
    if src.is_empty() || dst.is_empty() {
        return None;
    }
    Some((src.to_string(), dst.to_string()))
}

/// Path value of a `rename from`-style line; no `a/`/`b/` prefix there.
fn extended_path(value: &str) -> Option<String> {
    let value = value.trim_end();
    let path = match value.strip_prefix('"') {
        Some(quoted) => unquote(quoted)?.0,
        None => value.to_string(),
    };
    (!path.is_empty()).then_some(path)
}

/// Decode a C-style quoted string whose opening quote is already consumed.
/// Returns the decoded text and whatever follows the closing quote.
fn unquote(quoted: &str) -> Option<(String, &str)> {
    let bytes = quoted.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let decoded = String::from_utf8_lossy(&out).into_owned();
                return Some((decoded, &quoted[i + 1..]));
            }
            b'\\' => {
                let escaped = *bytes.get(i + 1)?;
                i += 2;
                let byte = match escaped {
                    b'a' => 0x07,
                    b'b' => 0x08,
                    b't' => b'\t',
                    b'n' => b'\n',
                    b'v' => 0x0b,
                    b'f' => 0x0c,
                    b'r' => b'\r',
                    b'0'..=b'3' => {
                        let digits = bytes.get(i - 1..i + 2)?;
                        i += 2;
                        let mut value = 0u8;
                        for digit in digits {
                            if !(b'0'..=b'7').contains(digit) {
                                return None;
                            }
                            value = value * 8 + (digit - b'0');
                        }
                        value
                    }
                    other => other,
                };
                out.push(byte);
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    None
}
