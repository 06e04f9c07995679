//! Library search: glob expansion, symlink resolution and de-duplication
//!
//! Candidate locations are tried in a fixed order (bundled, override,
//! search variable, vendor defaults). Every match is canonicalized so that
//! the same physical library reached through different symlinks is only
//! probed once.

use crate::platform::{Platform, RuntimeLibrary};
use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Path fragments of vendor libraries that bundle conflicting symbols
/// under the same file names (e.g. NVIDIA PhysX ships its own `cudart`).
pub const CONFLICT_MARKERS: &[&str] = &["PhysX"];

/// Ordered set of places to look for one runtime library
#[derive(Debug, Clone, Default)]
pub struct SearchPlan {
    /// File name glob, e.g. `libcuda.so*`
    pub filename: String,
    /// Bundled directories next to the executable
    pub bundled: Vec<PathBuf>,
    /// Directory derived from the backend override variable
    pub env_override: Option<PathBuf>,
    /// Directories of the dynamic-library search variable
    pub search_paths: Vec<PathBuf>,
    /// Vendor install globs
    pub standard: Vec<String>,
}

impl SearchPlan {
    /// Build the plan for `library` from the platform strategy and environment.
    ///
    /// `bundled_subdirs` are globs relative to `install_dir` tried after the
    /// install dir itself, e.g. `cuda_v*` or `rocm`.
    pub fn for_library(
        platform: &dyn Platform,
        library: RuntimeLibrary,
        install_dir: &Path,
        bundled_subdirs: &[&str],
    ) -> Self {
        let mut bundled = vec![install_dir.to_path_buf()];
        bundled.extend(bundled_subdirs.iter().map(|sub| install_dir.join(sub)));
        Self {
            filename: platform.library_filename(library).to_string(),
            bundled,
            env_override: platform.env_override_dir(library),
            search_paths: platform.search_paths(),
            standard: platform
                .standard_locations(library)
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Glob patterns in search order
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .bundled
            .iter()
            .chain(self.env_override.iter())
            .chain(self.search_paths.iter())
            .map(|dir| dir.join(&self.filename).to_string_lossy().into_owned())
            .collect();
        patterns.extend(self.standard.iter().cloned());
        patterns
    }

    /// Expand every pattern into existing, de-duplicated library paths
    pub fn resolve(&self) -> Vec<PathBuf> {
        find_libraries(&self.patterns())
    }
}

/// Expand `patterns` in order, resolve symlinks to their final target and
/// drop duplicates, keeping first-seen order.
pub fn find_libraries(patterns: &[String]) -> Vec<PathBuf> {
    debug!(globs = ?patterns, "gpu library search");
    let mut found: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        if is_conflicting(pattern) {
            debug!(path = %pattern, "skipping conflicting library path");
            continue;
        }
        for matched in expand_glob(pattern) {
            let resolved = fs::canonicalize(&matched).unwrap_or(matched);
            if is_conflicting(&resolved.to_string_lossy()) {
                debug!(path = %resolved.display(), "skipping conflicting library path");
                continue;
            }
            if !found.contains(&resolved) {
                found.push(resolved);
            }
        }
    }
    debug!(paths = ?found, "discovered gpu libraries");
    found
}

fn is_conflicting(path: &str) -> bool {
    CONFLICT_MARKERS.iter().any(|marker| path.contains(marker))
}

/// Expand a glob where `*` and `?` may appear in any path component.
///
/// Matches within one directory are returned in lexical order; only paths
/// that exist are returned.
pub fn expand_glob(pattern: &str) -> Vec<PathBuf> {
    let mut current = vec![PathBuf::new()];
    for component in Path::new(pattern).components() {
        let Component::Normal(name) = component else {
            for base in &mut current {
                base.push(component.as_os_str());
            }
            continue;
        };
        let name = name.to_string_lossy();
        if !has_wildcard(&name) {
            for base in &mut current {
                base.push(name.as_ref());
            }
            continue;
        }

        let Some(matcher) = wildcard_regex(&name) else {
            return Vec::new();
        };
        let mut next = Vec::new();
        for base in &current {
            let dir = if base.as_os_str().is_empty() {
                Path::new(".")
            } else {
                base.as_path()
            };
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            let mut names: Vec<_> = entries
                .flatten()
                .map(|entry| entry.file_name())
                .filter(|n| matcher.is_match(&n.to_string_lossy()))
                .collect();
            names.sort();
            next.extend(names.into_iter().map(|n| base.join(n)));
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }
    current.retain(|p| p.exists());
    current
}

fn has_wildcard(segment: &str) -> bool {
    segment.contains('*') || segment.contains('?')
}

fn wildcard_regex(segment: &str) -> Option<Regex> {
    let mut expr = String::from(if cfg!(windows) { "(?i)^" } else { "^" });
    let mut literal = String::new();
    for ch in segment.chars() {
        match ch {
            '*' | '?' => {
                expr.push_str(&regex::escape(&literal));
                literal.clear();
                expr.push_str(if ch == '*' { ".*" } else { "." });
            }
            _ => literal.push(ch),
        }
    }
    expr.push_str(&regex::escape(&literal));
    expr.push('$');
    Regex::new(&expr).ok()
}

// ============================================================================
// Tests
// ============================================================================
