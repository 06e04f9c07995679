//! Configuration for hardware discovery
//!
//! Settings come from, in increasing priority: built-in defaults, an optional
//! settings file (any format the `config` crate understands), and `RIFF_*`
//! environment variables.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::hardware::{Backend, Version};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default minimum CUDA compute capability
pub const CUDA_COMPUTE_MIN: Version = Version::new(5, 0);

/// Default minimum ROCm (gfx) major generation
pub const ROCM_COMPUTE_MIN: Version = Version::new(9, 0);

/// Configuration for the discovery cache and its probes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Directory holding the bundled runtimes and engine builds.
    /// Defaults to `<exe dir>/lib/riff`.
    pub install_dir: PathBuf,

    /// Verbose discovery logging (`RIFF_DEBUG`)
    pub debug: bool,

    /// Bytes reserved on every GPU when the backend reports no OS overhead
    pub gpu_overhead: u64,

    /// Minimum CUDA compute capability, e.g. `"5.0"`
    pub cuda_compute_min: String,

    /// Minimum ROCm compute capability, e.g. `"9.0"`
    pub rocm_compute_min: String,

    /// Explicit CUDA library; when set, no search is performed
    pub cuda_library: Option<PathBuf>,

    /// Explicit ROCm library; when set, no search is performed
    pub rocm_library: Option<PathBuf>,

    /// Jetpack version marker (`JETSON_JETPACK`), e.g. `"6.0"`
    #[serde(skip)]
    pub jetpack: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            debug: false,
            gpu_overhead: 0,
            cuda_compute_min: CUDA_COMPUTE_MIN.to_string(),
            rocm_compute_min: ROCM_COMPUTE_MIN.to_string(),
            cuda_library: None,
            rocm_library: None,
            jetpack: None,
        }
    }
}

impl DiscoveryConfig {
    /// Load settings from an optional file layered under `RIFF_*` variables.
    pub fn load(file: Option<&Path>) -> DiscoveryResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix("RIFF").try_parsing(true));

        let settings = builder.build().map_err(|e| DiscoveryError::InvalidSetting {
            key: file.map(|p| p.display().to_string()).unwrap_or_else(|| "RIFF_*".into()),
            reason: e.to_string(),
        })?;
        let mut cfg: DiscoveryConfig =
            settings
                .try_deserialize()
                .map_err(|e| DiscoveryError::InvalidSetting {
                    key: "discovery".into(),
                    reason: e.to_string(),
                })?;

        cfg.jetpack = std::env::var("JETSON_JETPACK").ok().filter(|v| !v.is_empty());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Settings from the environment only
    pub fn from_env() -> DiscoveryResult<Self> {
        Self::load(None)
    }

    /// Set the install directory
    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = dir.into();
        self
    }

    /// Set the minimum compute capability for a GPU backend
    pub fn with_minimum_compute(mut self, backend: Backend, min: Version) -> Self {
        match backend {
            Backend::Cuda => self.cuda_compute_min = min.to_string(),
            Backend::Rocm => self.rocm_compute_min = min.to_string(),
            Backend::Cpu => {}
        }
        self
    }

    /// Set the per-GPU overhead reservation
    pub fn with_gpu_overhead(mut self, bytes: u64) -> Self {
        self.gpu_overhead = bytes;
        self
    }

    /// Check that every version setting parses
    pub fn validate(&self) -> DiscoveryResult<()> {
        self.cuda_compute_min.parse::<Version>()?;
        self.rocm_compute_min.parse::<Version>()?;
        Ok(())
    }

    /// Minimum compute capability accepted for `backend`.
    ///
    /// An unparsable setting logs an error and falls back to the default.
    pub fn minimum_compute(&self, backend: Backend) -> Version {
        let (raw, default) = match backend {
            Backend::Cuda => (&self.cuda_compute_min, CUDA_COMPUTE_MIN),
            Backend::Rocm => (&self.rocm_compute_min, ROCM_COMPUTE_MIN),
            Backend::Cpu => return Version::new(0, 0),
        };
        raw.parse().unwrap_or_else(|e: DiscoveryError| {
            tracing::error!(%backend, value = %raw, error = %e, "invalid minimum compute setting");
            default
        })
    }

    /// Explicit library override for `backend`, if configured
    pub fn explicit_library(&self, backend: Backend) -> Option<&Path> {
        match backend {
            Backend::Cuda => self.cuda_library.as_deref(),
            Backend::Rocm => self.rocm_library.as_deref(),
            Backend::Cpu => None,
        }
    }
}

fn default_install_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("lib").join("riff")))
        .unwrap_or_else(|| PathBuf::from("lib/riff"))
}

// ============================================================================
// Tests
// ============================================================================
