//! Device and snapshot records
//!
//! One [`DeviceInfo`] describes one compute unit, CPU or GPU. A
//! [`SystemSnapshot`] is the immutable aggregate handed to callers by
//! [`DiscoveryCache::snapshot`](crate::DiscoveryCache::snapshot).

use crate::error::DiscoveryError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Native runtime that owns a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Host CPU, always present
    Cpu,
    /// NVIDIA CUDA
    Cuda,
    /// AMD ROCm (HIP)
    Rocm,
}

impl Backend {
    /// Lowercase identifier used in directory names and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Cpu => "cpu",
            Backend::Cuda => "cuda",
            Backend::Rocm => "rocm",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cpu => write!(f, "CPU"),
            Backend::Cuda => write!(f, "CUDA"),
            Backend::Rocm => write!(f, "ROCm"),
        }
    }
}

/// A `major.minor` pair, used for compute capability and driver versions.
///
/// Ordering is lexicographic on `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for Version {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DiscoveryError::InvalidSetting {
            key: s.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = s.trim().splitn(2, '.');
        let major = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| invalid("empty version"))?
            .parse::<u32>()
            .map_err(|e| invalid(&e.to_string()))?;
        let minor = match parts.next() {
            Some(p) => p.parse::<u32>().map_err(|e| invalid(&e.to_string()))?,
            None => 0,
        };
        Ok(Self { major, minor })
    }
}

/// Information about one compute device
///
/// Versions are written flat (`computeMajor`, `computeMinor`, `driverMajor`,
/// `driverMinor`) and left out for the CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "DeviceRecord", into = "DeviceRecord")]
pub struct DeviceInfo {
    pub backend: Backend,
    /// Backend-local stable identifier (UUID for GPUs, `"0"` for the CPU)
    pub id: String,
    pub name: String,
    pub total_memory: u64,
    pub free_memory: u64,
    /// Free swap in bytes; only tracked for the CPU
    pub free_swap: u64,
    /// GPU architecture generation; `None` for the CPU
    pub compute: Option<Version>,
    /// Host driver version; `None` for the CPU or when the library cannot report it
    pub driver: Option<Version>,
    /// Floor below which the device is unusable for serving
    pub minimum_memory: u64,
    /// Bytes reserved by the OS/driver, subtracted from reported free memory
    pub os_overhead_bytes: u64,
    /// Build of the inference engine matched to this device
    pub variant: String,
    /// Directories to prepend when resolving the engine's shared-library dependencies
    pub dependency_paths: Vec<PathBuf>,
    /// Index within the owning runtime, used to re-query memory on refresh
    pub(crate) index: usize,
}

/// Serialized form of [`DeviceInfo`]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRecord {
    backend: Backend,
    id: String,
    name: String,
    total_memory: u64,
    free_memory: u64,
    #[serde(default)]
    free_swap: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compute_major: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compute_minor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    driver_major: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    driver_minor: Option<u32>,
    minimum_memory: u64,
    os_overhead_bytes: u64,
    variant: String,
    dependency_paths: Vec<PathBuf>,
}

fn join_version(major: Option<u32>, minor: Option<u32>) -> Option<Version> {
    major.map(|major| Version::new(major, minor.unwrap_or(0)))
}

impl From<DeviceInfo> for DeviceRecord {
    fn from(d: DeviceInfo) -> Self {
        Self {
            backend: d.backend,
            id: d.id,
            name: d.name,
            total_memory: d.total_memory,
            free_memory: d.free_memory,
            free_swap: d.free_swap,
            compute_major: d.compute.map(|v| v.major),
            compute_minor: d.compute.map(|v| v.minor),
            driver_major: d.driver.map(|v| v.major),
            driver_minor: d.driver.map(|v| v.minor),
            minimum_memory: d.minimum_memory,
            os_overhead_bytes: d.os_overhead_bytes,
            variant: d.variant,
            dependency_paths: d.dependency_paths,
        }
    }
}

impl From<DeviceRecord> for DeviceInfo {
    fn from(r: DeviceRecord) -> Self {
        Self {
            backend: r.backend,
            id: r.id,
            name: r.name,
            total_memory: r.total_memory,
            free_memory: r.free_memory,
            free_swap: r.free_swap,
            compute: join_version(r.compute_major, r.compute_minor),
            driver: join_version(r.driver_major, r.driver_minor),
            minimum_memory: r.minimum_memory,
            os_overhead_bytes: r.os_overhead_bytes,
            variant: r.variant,
            dependency_paths: r.dependency_paths,
            index: 0,
        }
    }
}

impl DeviceInfo {
    /// A device record with zeroed memory; fill it in with [`set_memory`](Self::set_memory).
    pub fn gpu(backend: Backend, index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            backend,
            id: id.into(),
            name: name.into(),
            total_memory: 0,
            free_memory: 0,
            free_swap: 0,
            compute: None,
            driver: None,
            minimum_memory: 0,
            os_overhead_bytes: 0,
            variant: String::new(),
            dependency_paths: Vec::new(),
            index,
        }
    }

    /// Backend-local index of the device
    pub fn index(&self) -> usize {
        self.index
    }

    /// Store memory figures, clamping free to total.
    pub fn set_memory(&mut self, total: u64, free: u64) {
        self.total_memory = total;
        self.free_memory = free.min(total);
    }

    /// Free memory minus the backend's minimum, saturating at zero
    pub fn usable_memory(&self) -> u64 {
        self.free_memory.saturating_sub(self.minimum_memory)
    }

    /// True for the host CPU entry
    pub fn is_cpu(&self) -> bool {
        self.backend == Backend::Cpu
    }
}

/// Immutable discovery result.
///
/// Serialized with the field names the launch step expects:
/// `cpu`, `gpus`, `unsupportedGpus`, `discoveryErrors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub cpu: DeviceInfo,
    pub gpus: Vec<DeviceInfo>,
    pub unsupported_gpus: Vec<DeviceInfo>,
    pub discovery_errors: Vec<String>,
}

impl SystemSnapshot {
    /// Accepted GPUs owned by `backend`
    pub fn gpus_for(&self, backend: Backend) -> impl Iterator<Item = &DeviceInfo> {
        self.gpus.iter().filter(move |g| g.backend == backend)
    }

    /// True when no GPU was accepted
    pub fn is_cpu_only(&self) -> bool {
        self.gpus.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
