//! Platform strategy for locating vendor runtime libraries
//!
//! Library file names, the dynamic-library search variable and the well-known
//! vendor install locations differ between Linux and Windows. Each platform is
//! one [`Platform`] implementation, selected once via [`current`].

use crate::hardware::Backend;
use std::ffi::OsString;
use std::path::PathBuf;

/// A vendor runtime library that can be probed for devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeLibrary {
    /// CUDA driver API (`libcuda` / `nvcuda`), reports the driver version
    CudaDriver,
    /// CUDA runtime API (`libcudart` / `cudart64_*`)
    CudaRuntime,
    /// ROCm HIP runtime (`libamdhip64` / `amdhip64`)
    Hip,
    /// NVIDIA management library (`libnvidia-ml` / `nvml`), memory figures only
    Nvml,
}

impl RuntimeLibrary {
    pub fn backend(&self) -> Backend {
        match self {
            RuntimeLibrary::CudaDriver | RuntimeLibrary::CudaRuntime | RuntimeLibrary::Nvml => Backend::Cuda,
            RuntimeLibrary::Hip => Backend::Rocm,
        }
    }
}

/// Per-platform search strategy
pub trait Platform: Send + Sync {
    /// Short platform name for logs
    fn name(&self) -> &'static str;

    /// Environment variable listing dynamic-library directories
    fn search_var(&self) -> &'static str;

    /// File name glob of `library` on this platform
    fn library_filename(&self, library: RuntimeLibrary) -> &'static str;

    /// Environment variable naming an explicit install root for `library`
    fn env_override_var(&self, library: RuntimeLibrary) -> &'static str;

    /// Sub-directory of the override root holding the library
    fn env_override_subdir(&self, library: RuntimeLibrary) -> &'static str;

    /// Well-known vendor install globs, searched last
    fn standard_locations(&self, library: RuntimeLibrary) -> &'static [&'static str];

    /// Absolute directories listed in [`search_var`](Self::search_var)
    fn search_paths(&self) -> Vec<PathBuf> {
        split_search_var(std::env::var_os(self.search_var()))
    }

    /// Library directory derived from the backend override variable, if set
    fn env_override_dir(&self, library: RuntimeLibrary) -> Option<PathBuf> {
        std::env::var_os(self.env_override_var(library))
            .filter(|v| !v.is_empty())
            .map(|root| PathBuf::from(root).join(self.env_override_subdir(library)))
    }
}

/// Split a search-path variable into absolute directories, dropping empty
/// and unresolvable entries.
pub fn split_search_var(value: Option<OsString>) -> Vec<PathBuf> {
    let Some(value) = value else {
        return Vec::new();
    };
    std::env::split_paths(&value)
        .filter(|p| !p.as_os_str().is_empty())
        .filter_map(|p| std::path::absolute(&p).ok())
        .collect()
}

/// Linux (and other Unix) strategy
#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl Platform for LinuxPlatform {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn search_var(&self) -> &'static str {
        "LD_LIBRARY_PATH"
    }

    fn library_filename(&self, library: RuntimeLibrary) -> &'static str {
        match library {
            RuntimeLibrary::CudaDriver => "libcuda.so*",
            RuntimeLibrary::CudaRuntime => "libcudart.so*",
            RuntimeLibrary::Hip => "libamdhip64.so*",
            RuntimeLibrary::Nvml => "libnvidia-ml.so*",
        }
    }

    fn env_override_var(&self, library: RuntimeLibrary) -> &'static str {
        match library.backend() {
            Backend::Rocm => "HIP_PATH",
            _ => "CUDA_PATH",
        }
    }

    fn env_override_subdir(&self, library: RuntimeLibrary) -> &'static str {
        match library.backend() {
            Backend::Rocm => "lib",
            _ => "lib64",
        }
    }

    fn standard_locations(&self, library: RuntimeLibrary) -> &'static [&'static str] {
        match library {
            RuntimeLibrary::CudaDriver => &[
                "/usr/local/cuda*/targets/*/lib/libcuda.so*",
                "/usr/lib/*-linux-gnu/nvidia/current/libcuda.so*",
                "/usr/lib/*-linux-gnu/libcuda.so*",
                "/usr/lib/wsl/lib/libcuda.so*",
                "/usr/lib/wsl/drivers/*/libcuda.so*",
                "/opt/cuda/lib*/libcuda.so*",
                "/usr/local/cuda/lib*/libcuda.so*",
                "/usr/lib*/libcuda.so*",
                "/usr/local/lib*/libcuda.so*",
            ],
            RuntimeLibrary::CudaRuntime => &[
                "/usr/local/cuda/lib64/libcudart.so*",
                "/usr/lib/*-linux-gnu/nvidia/current/libcudart.so*",
                "/usr/lib/*-linux-gnu/libcudart.so*",
                "/usr/lib/wsl/lib/libcudart.so*",
                "/usr/lib/wsl/drivers/*/libcudart.so*",
                "/opt/cuda/lib64/libcudart.so*",
                "/usr/local/cuda*/targets/aarch64-linux/lib/libcudart.so*",
                "/usr/local/cuda/lib*/libcudart.so*",
                "/usr/lib*/libcudart.so*",
                "/usr/local/lib*/libcudart.so*",
            ],
            RuntimeLibrary::Hip => &[
                "/opt/rocm/lib/libamdhip64.so*",
                "/usr/lib64/libamdhip64.so*",
                "/usr/lib/*-linux-gnu/libamdhip64.so*",
            ],
            RuntimeLibrary::Nvml => &[
                "/usr/lib/*-linux-gnu/nvidia/current/libnvidia-ml.so*",
                "/usr/lib/*-linux-gnu/libnvidia-ml.so*",
                "/usr/lib/wsl/lib/libnvidia-ml.so*",
                "/usr/lib/wsl/drivers/*/libnvidia-ml.so*",
                "/opt/cuda/lib*/libnvidia-ml.so*",
                "/usr/lib*/libnvidia-ml.so*",
                "/usr/local/lib*/libnvidia-ml.so*",
            ],
        }
    }
}

/// Windows strategy
#[derive(Debug, Default)]
pub struct WindowsPlatform;

impl Platform for WindowsPlatform {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn search_var(&self) -> &'static str {
        "PATH"
    }

    fn library_filename(&self, library: RuntimeLibrary) -> &'static str {
        match library {
            RuntimeLibrary::CudaDriver => "nvcuda.dll",
            RuntimeLibrary::CudaRuntime => "cudart64_*.dll",
            RuntimeLibrary::Hip => "amdhip64*.dll",
            RuntimeLibrary::Nvml => "nvml.dll",
        }
    }

    fn env_override_var(&self, library: RuntimeLibrary) -> &'static str {
        match library.backend() {
            Backend::Rocm => "HIP_PATH",
            _ => "CUDA_PATH",
        }
    }

    fn env_override_subdir(&self, _library: RuntimeLibrary) -> &'static str {
        "bin"
    }

    fn standard_locations(&self, library: RuntimeLibrary) -> &'static [&'static str] {
        match library {
            RuntimeLibrary::CudaDriver => &["c:\\windows\\system*\\nvcuda.dll"],
            RuntimeLibrary::CudaRuntime => &[
                "c:\\Program Files\\NVIDIA GPU Computing Toolkit\\CUDA\\v*\\bin\\cudart64_*.dll",
            ],
            RuntimeLibrary::Hip => &["c:\\Program Files\\AMD\\ROCm\\*\\bin\\amdhip64*.dll"],
            RuntimeLibrary::Nvml => &[
                "c:\\Windows\\System32\\nvml.dll",
                "c:\\Program Files\\NVIDIA Corporation\\NVSMI\\nvml.dll",
            ],
        }
    }
}

static LINUX: LinuxPlatform = LinuxPlatform;
static WINDOWS: WindowsPlatform = WindowsPlatform;

/// Strategy for the platform this process runs on
pub fn current() -> &'static dyn Platform {
    if cfg!(windows) { &WINDOWS } else { &LINUX }
}
