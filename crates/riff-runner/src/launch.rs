//! Start-up glue between device placement and the native engine
//!
//! Decides which engine build to load and which environment the process
//! needs before any runtime thread exists.

use crate::error::RunnerError;
use crate::native::engine_library_filename;
use riff_discover::Placement;
use riff_discover::platform::Platform;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where an engine library may live, most specific first
pub fn engine_candidates(placement: &Placement, install_dir: &Path) -> Vec<PathBuf> {
    let file = engine_library_filename();
    let mut dirs: Vec<PathBuf> = placement.library_dirs.clone();
    dirs.push(install_dir.join(placement.runner_name()));
    dirs.push(install_dir.to_path_buf());

    let mut candidates = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let path = dir.join(&file);
        if !candidates.contains(&path) {
            candidates.push(path);
        }
    }
    candidates
}

/// The engine library to load
///
/// An explicit path is used as given; otherwise the first existing candidate
/// wins.
pub fn find_engine_library(
    explicit: Option<&Path>,
    placement: &Placement,
    install_dir: &Path,
) -> Result<PathBuf, RunnerError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let candidates = engine_candidates(placement, install_dir);
    for path in &candidates {
        debug!(path = %path.display(), "looking for engine library");
        if path.is_file() {
            return Ok(path.clone());
        }
    }
    let searched: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
    Err(RunnerError::Load(format!(
        "no {} found for {} (searched {})",
        engine_library_filename().to_string_lossy(),
        placement.runner_name(),
        searched.join(", ")
    )))
}

/// Variables the process should export for the chosen placement
///
/// The device filter keeps the engine on the selected devices; the library
/// search variable is prefixed with the placement's dependency directories
/// so the engine's own dependencies resolve from the matching build.
pub fn placement_environment(
    placement: &Placement,
    platform: &dyn Platform,
    current_search: Option<OsString>,
) -> Vec<(String, OsString)> {
    let mut vars = Vec::new();
    if let Some((name, ids)) = placement.visible_devices_env() {
        vars.push((name.to_string(), OsString::from(ids)));
    }
    if !placement.library_dirs.is_empty() {
        let mut dirs = placement.library_dirs.clone();
        if let Some(existing) = current_search {
            dirs.extend(std::env::split_paths(&existing).filter(|p| !p.as_os_str().is_empty()));
        }
        if let Ok(joined) = std::env::join_paths(dirs) {
            vars.push((platform.search_var().to_string(), joined));
        }
    }
    vars
}
