// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Path sanitization for attachment names and output-file requests.
//!
//! Attachment names must stay relative and must preserve directory structure
//! (engines like snakemake rely on nested layouts), so a flattening
//! sanitizer is not an option. Instead each component is cleaned and
//! traversal components are dropped outright.

use std::path::{Component, Path, PathBuf};

/// Sanitize a client-supplied relative path.
///
/// Non-ASCII characters are dropped, whitespace inside a component becomes
/// `_`, characters outside `[A-Za-z0-9_.-]` are removed, and components that
/// reduce to ``, `.` or `..` are discarded. The result is always a relative
/// path; it may be empty when nothing survives.
pub fn secure_filepath(filepath: &str) -> PathBuf {
    let ascii: String = filepath.chars().filter(char::is_ascii).collect();
    let mut nodes: Vec<String> = Vec::new();
    for part in ascii.split(['/', '\\']) {
        let joined = part.split_whitespace().collect::<Vec<_>>().join("_");
        let cleaned: String = joined
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            .collect();
        let trimmed = cleaned.trim_matches(|c| c == '.' || c == '_');
        if !trimmed.is_empty() && trimmed != "." && trimmed != ".." {
            nodes.push(trimmed.to_string());
        }
    }
    PathBuf::from(nodes.join("/"))
}

/// Validate a requested sub-path of a run directory.
///
/// Unlike [`secure_filepath`] this does not rewrite: a path that would be
/// altered by sanitization is refused, so clients cannot probe the mapping.
/// Returns the normalized relative path on success.
pub fn validate_subpath(subpath: &str) -> Option<PathBuf> {
    if subpath.is_empty() || subpath.contains('\\') || subpath.contains('\0') {
        return None;
    }
    let path = Path::new(subpath);
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => out.push(part),
            // `.` is harmless but rejected along with everything else that
            // is not a plain component: `..`, a root, or a prefix.
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        return None;
    }
    Some(out)
}
