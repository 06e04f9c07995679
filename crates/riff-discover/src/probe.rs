//! Device probe abstraction
//!
//! A [`DeviceProbe`] knows how to find and open one vendor runtime library.
//! An opened library is a [`GpuLibrary`]: a narrow, owned handle that can
//! count devices and query them, and that releases the native library when
//! dropped. Handles never leave the discovery crate.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::hardware::{Backend, DeviceInfo, Version};
use crate::search::SearchPlan;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A device as reported by a runtime library, before compatibility filtering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub total_memory: u64,
    pub free_memory: u64,
    pub compute: Version,
    pub driver: Option<Version>,
    /// Overhead measured by the backend itself, if it can. When set,
    /// `free_memory` already excludes it.
    pub os_overhead: Option<u64>,
}

/// One memory reading for a known device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    /// The backend already excluded OS/driver overhead from `free`
    pub overhead_accounted: bool,
}

impl MemoryReading {
    pub fn new(total: u64, free: u64) -> Self {
        Self {
            total,
            free,
            used: total.saturating_sub(free),
            overhead_accounted: false,
        }
    }

    /// A reading whose `free` already excludes OS/driver overhead
    pub fn accounted(total: u64, free: u64) -> Self {
        Self {
            overhead_accounted: true,
            ..Self::new(total, free)
        }
    }
}

/// An opened vendor runtime. Dropping it releases the native library.
pub trait GpuLibrary: Send {
    /// Number of devices the runtime reported at init
    fn device_count(&self) -> usize;

    /// Full query of one device
    fn query_device(&mut self, index: usize) -> DiscoveryResult<RawDevice>;

    /// Memory-only query of an already known device
    fn query_memory(&mut self, device: &DeviceInfo) -> DiscoveryResult<MemoryReading>;
}

/// Where to look for a library
#[derive(Debug, Clone, Default)]
pub struct ProbeRequest {
    /// Only try this library; no search is performed
    pub explicit_path: Option<PathBuf>,
    /// Directory holding bundled runtimes
    pub install_dir: PathBuf,
}

impl ProbeRequest {
    pub fn search(install_dir: impl Into<PathBuf>) -> Self {
        Self {
            explicit_path: None,
            install_dir: install_dir.into(),
        }
    }

    pub fn explicit(path: impl Into<PathBuf>, install_dir: impl Into<PathBuf>) -> Self {
        Self {
            explicit_path: Some(path.into()),
            install_dir: install_dir.into(),
        }
    }
}

/// Vendor-specific discovery logic for one runtime library
pub trait DeviceProbe: Send + Sync {
    /// Backend owning the devices this probe finds
    fn backend(&self) -> Backend;

    /// Short library name for logs, e.g. `"nvcuda"`
    fn name(&self) -> &'static str;

    /// Search plan used when no explicit path is given
    fn search_plan(&self, install_dir: &Path) -> SearchPlan;

    /// Resolved candidate libraries, in search order
    fn candidates(&self, request: &ProbeRequest) -> Vec<PathBuf> {
        self.search_plan(&request.install_dir).resolve()
    }

    /// Load and initialize one library
    fn open(&self, path: &Path) -> DiscoveryResult<Box<dyn GpuLibrary>>;

    /// Backend-defined floor below which a device is unusable
    fn minimum_memory(&self) -> u64;

    /// Engine build matched to `device`
    fn variant(&self, device: &RawDevice) -> String;

    /// Directories to prepend when the engine resolves its own dependencies
    fn dependency_paths(&self, variant: &str, library: &Path, install_dir: &Path) -> Vec<PathBuf>;

    /// Reason to ignore a device entirely (not even listed as unsupported)
    fn skip_reason(&self, _device: &RawDevice) -> Option<String> {
        None
    }
}

/// An opened library that reported at least one device
pub struct ProbeOutcome {
    pub device_count: usize,
    pub library: Box<dyn GpuLibrary>,
    pub library_path: PathBuf,
}

impl std::fmt::Debug for ProbeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeOutcome")
            .field("device_count", &self.device_count)
            .field("library_path", &self.library_path)
            .finish_non_exhaustive()
    }
}

/// Find the first library that initializes and reports a device.
///
/// Returns `Ok(None)` when no candidate library exists at all, which is an
/// absence rather than an error. Libraries built for another word size are
/// skipped silently. When candidates exist but none is usable, the last
/// failure is returned. Every library other than the winner is closed before
/// this returns.
pub fn probe(probe: &dyn DeviceProbe, request: &ProbeRequest) -> DiscoveryResult<Option<ProbeOutcome>> {
    let candidates = match &request.explicit_path {
        Some(path) => vec![path.clone()],
        None => probe.candidates(request),
    };
    if candidates.is_empty() {
        debug!(library = probe.name(), "no candidate libraries found");
        return Ok(None);
    }

    let mut last_err: Option<DiscoveryError> = None;
    for path in candidates {
        match probe.open(&path) {
            Ok(library) => {
                let device_count = library.device_count();
                if device_count == 0 {
                    let err = DiscoveryError::NoDevices {
                        backend: probe.backend(),
                        path: path.clone(),
                    };
                    info!("{err}");
                    last_err = Some(err);
                    continue;
                }
                debug!(library = %path.display(), count = device_count, "detected GPUs");
                return Ok(Some(ProbeOutcome {
                    device_count,
                    library,
                    library_path: path,
                }));
            }
            Err(e) if e.is_wrong_architecture() => {
                debug!(library = %path.display(), "skipping library built for another word size");
            }
            Err(e) => {
                debug!("{e}");
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(e),
        None => Ok(None),
    }
}

// ============================================================================
// Tests
// ============================================================================
