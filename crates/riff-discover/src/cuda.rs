//! NVIDIA CUDA probes
//!
//! Two libraries can report CUDA devices. The driver library (`libcuda` /
//! `nvcuda`) is preferred because it also reports the host driver version,
//! which the engine variant depends on. The runtime library (`libcudart`)
//! is the fallback for hosts where only the toolkit is on the search path.
//!
//! The driver probe can pair its library with NVML, which supplies memory
//! figures with the OS/driver overhead already taken out. The runtime probe
//! reports index ids that NVML orders differently, so it never uses NVML.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::ffi::{buffer_to_string, format_uuid, open_library, symbol};
use crate::format::{MEBIBYTE, human_bytes};
use crate::hardware::{Backend, DeviceInfo, Version};
use crate::nvml::Nvml;
use crate::platform::{self, RuntimeLibrary};
use crate::probe::{DeviceProbe, GpuLibrary, MemoryReading, RawDevice};
use crate::search::SearchPlan;
use libloading::Library;
use regex::Regex;
use std::ffi::{c_char, c_int, c_uint, c_void};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

/// Minimum free memory for a CUDA device to be worth loading onto
pub const CUDA_MINIMUM_MEMORY: u64 = 457 * MEBIBYTE;

const CUDA_SUCCESS: c_int = 0;
const CUDA_ERROR_INSUFFICIENT_DRIVER: c_int = 35;
const CUDA_ERROR_NO_DEVICE: c_int = 100;
const CUDA_ERROR_SYSTEM_DRIVER_MISMATCH: c_int = 803;
const CUDA_ERROR_UNKNOWN: c_int = 999;

const ATTR_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
const ATTR_COMPUTE_CAPABILITY_MINOR: c_int = 76;

const NAME_LEN: usize = 96;

/// Bundled runtime directories searched after the install dir itself
const BUNDLED_SUBDIRS: &[&str] = &["cuda_v*"];

static L4T_RELEASE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r" R(\d+) ").ok());

/// Host facts that influence the CUDA variant besides the device itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantHints {
    /// Running on 64-bit ARM Linux, where Jetson boards live
    pub arm64_linux: bool,
    /// `JETSON_JETPACK`, e.g. `"6.0"`
    pub jetpack: Option<String>,
    /// Contents of `/etc/nv_tegra_release`
    pub tegra_release: Option<String>,
}

impl VariantHints {
    /// Read hints from the running host
    pub fn detect(jetpack: Option<String>) -> Self {
        let arm64_linux = cfg!(all(target_os = "linux", target_arch = "aarch64"));
        let tegra_release = if arm64_linux && jetpack.is_none() {
            std::fs::read_to_string("/etc/nv_tegra_release").ok()
        } else {
            None
        };
        Self {
            arm64_linux,
            jetpack,
            tegra_release,
        }
    }

    fn jetson_variant(&self) -> Option<String> {
        if !self.arm64_linux {
            return None;
        }
        if let Some(jetpack) = &self.jetpack {
            let major = jetpack.split('.').next().unwrap_or_default();
            return Some(format!("jetpack{major}"));
        }
        let release = self.tegra_release.as_deref()?;
        let Some(caps) = L4T_RELEASE.as_ref().and_then(|re| re.captures(release)) else {
            info!("unexpected format for /etc/nv_tegra_release, set JETSON_JETPACK to select a version");
            return None;
        };
        match caps[1].parse::<u32>() {
            Ok(35) => Some("jetpack5".into()),
            Ok(36) => Some("jetpack6".into()),
            _ => {
                info!(nv_tegra_release = %release.trim(), "unsupported L4T version");
                None
            }
        }
    }
}

/// Engine build for a CUDA device.
///
/// Jetson boards get their Jetpack build. Otherwise devices older than
/// compute 6.0 or driven by a pre-12.1 driver use `v11`, everything else
/// `v12`. An unknown driver counts as old.
pub fn cuda_variant(compute: Version, driver: Option<Version>, hints: &VariantHints) -> String {
    if let Some(jetson) = hints.jetson_variant() {
        return jetson;
    }
    let old_driver = match driver {
        None => true,
        Some(d) => d.major < 12 || d == Version::new(12, 0),
    };
    if compute.major < 6 || old_driver {
        "v11".into()
    } else {
        "v12".into()
    }
}

fn cuda_dependency_paths(variant: &str, install_dir: &Path) -> Vec<PathBuf> {
    if variant.is_empty() {
        return Vec::new();
    }
    let dir = install_dir.join(format!("cuda_{variant}"));
    if dir.is_dir() { vec![dir] } else { Vec::new() }
}

fn decode_driver_version(raw: c_int) -> Version {
    let raw = raw.max(0) as u32;
    Version::new(raw / 1000, (raw % 1000) / 10)
}

// ============================================================================
// Driver API
// ============================================================================

type CuDevice = c_int;
type CuContext = *mut c_void;

#[derive(Clone, Copy)]
struct DriverApi {
    init: unsafe extern "C" fn(c_uint) -> c_int,
    driver_get_version: unsafe extern "C" fn(*mut c_int) -> c_int,
    device_get_count: unsafe extern "C" fn(*mut c_int) -> c_int,
    device_get: unsafe extern "C" fn(*mut CuDevice, c_int) -> c_int,
    device_get_attribute: unsafe extern "C" fn(*mut c_int, c_int, CuDevice) -> c_int,
    device_get_name: unsafe extern "C" fn(*mut c_char, c_int, CuDevice) -> c_int,
    device_get_uuid: unsafe extern "C" fn(*mut [u8; 16], CuDevice) -> c_int,
    device_total_mem: unsafe extern "C" fn(*mut usize, CuDevice) -> c_int,
    ctx_create: unsafe extern "C" fn(*mut CuContext, c_uint, CuDevice) -> c_int,
    ctx_destroy: unsafe extern "C" fn(CuContext) -> c_int,
    mem_get_info: unsafe extern "C" fn(*mut usize, *mut usize) -> c_int,
}

impl DriverApi {
    unsafe fn load(library: &Library, path: &Path) -> DiscoveryResult<Self> {
        let b = Backend::Cuda;
        unsafe {
            Ok(Self {
                init: symbol(library, b, path, b"cuInit\0")?,
                driver_get_version: symbol(library, b, path, b"cuDriverGetVersion\0")?,
                device_get_count: symbol(library, b, path, b"cuDeviceGetCount\0")?,
                device_get: symbol(library, b, path, b"cuDeviceGet\0")?,
                device_get_attribute: symbol(library, b, path, b"cuDeviceGetAttribute\0")?,
                device_get_name: symbol(library, b, path, b"cuDeviceGetName\0")?,
                device_get_uuid: symbol(library, b, path, b"cuDeviceGetUuid\0")?,
                device_total_mem: symbol(library, b, path, b"cuDeviceTotalMem_v2\0")?,
                ctx_create: symbol(library, b, path, b"cuCtxCreate_v2\0")?,
                ctx_destroy: symbol(library, b, path, b"cuCtxDestroy_v2\0")?,
                mem_get_info: symbol(library, b, path, b"cuMemGetInfo_v2\0")?,
            })
        }
    }
}

/// Opened `libcuda` / `nvcuda`
struct CudaDriverLibrary {
    api: DriverApi,
    path: PathBuf,
    device_count: usize,
    driver: Option<Version>,
    nvml: Option<Nvml>,
    // Dropped last; the function pointers above are only valid while it is loaded.
    _library: Library,
}

impl CudaDriverLibrary {
    fn open(path: &Path) -> DiscoveryResult<Self> {
        let library = unsafe { open_library(Backend::Cuda, path)? };
        let api = unsafe { DriverApi::load(&library, path)? };

        let ret = unsafe { (api.init)(0) };
        if ret != CUDA_SUCCESS {
            return Err(classify_init_error(ret, path));
        }

        let mut raw_version: c_int = 0;
        let driver = match unsafe { (api.driver_get_version)(&mut raw_version) } {
            CUDA_SUCCESS => {
                let v = decode_driver_version(raw_version);
                debug!(library = %path.display(), driver = %v, "CUDA driver version");
                Some(v)
            }
            ret => {
                debug!(library = %path.display(), code = ret, "unable to read CUDA driver version");
                None
            }
        };

        let mut count: c_int = 0;
        let ret = unsafe { (api.device_get_count)(&mut count) };
        if ret != CUDA_SUCCESS {
            return Err(DiscoveryError::Init {
                backend: Backend::Cuda,
                path: path.to_path_buf(),
                reason: format!("cuDeviceGetCount failed: {ret}"),
            });
        }

        Ok(Self {
            api,
            path: path.to_path_buf(),
            device_count: count.max(0) as usize,
            driver,
            nvml: None,
            _library: library,
        })
    }

    fn with_nvml(mut self, nvml: Option<Nvml>) -> Self {
        self.nvml = nvml;
        self
    }

    fn device(&self, index: usize) -> DiscoveryResult<CuDevice> {
        let mut device: CuDevice = 0;
        let ret = unsafe { (self.api.device_get)(&mut device, index as c_int) };
        check(ret, index, "cuDeviceGet")?;
        Ok(device)
    }

    /// Free and total memory; needs a context on the device.
    fn mem_info(&self, index: usize, device: CuDevice) -> DiscoveryResult<(u64, u64)> {
        let mut ctx: CuContext = std::ptr::null_mut();
        let ret = unsafe { (self.api.ctx_create)(&mut ctx, 0, device) };
        check(ret, index, "cuCtxCreate")?;

        let (mut free, mut total) = (0usize, 0usize);
        let ret = unsafe { (self.api.mem_get_info)(&mut free, &mut total) };
        let destroyed = unsafe { (self.api.ctx_destroy)(ctx) };
        if destroyed != CUDA_SUCCESS {
            warn!(index, code = destroyed, "failed to release CUDA context");
        }
        check(ret, index, "cuMemGetInfo")?;
        Ok((free as u64, total as u64))
    }
}

impl GpuLibrary for CudaDriverLibrary {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn query_device(&mut self, index: usize) -> DiscoveryResult<RawDevice> {
        let device = self.device(index)?;

        let (mut major, mut minor): (c_int, c_int) = (0, 0);
        unsafe {
            check(
                (self.api.device_get_attribute)(&mut major, ATTR_COMPUTE_CAPABILITY_MAJOR, device),
                index,
                "cuDeviceGetAttribute(major)",
            )?;
            check(
                (self.api.device_get_attribute)(&mut minor, ATTR_COMPUTE_CAPABILITY_MINOR, device),
                index,
                "cuDeviceGetAttribute(minor)",
            )?;
        }

        let mut uuid = [0u8; 16];
        let id = match unsafe { (self.api.device_get_uuid)(&mut uuid, device) } {
            CUDA_SUCCESS => format_uuid("GPU-", &uuid),
            _ => index.to_string(),
        };

        let mut name = [0 as c_char; NAME_LEN];
        let name = match unsafe { (self.api.device_get_name)(name.as_mut_ptr(), NAME_LEN as c_int, device) } {
            CUDA_SUCCESS => buffer_to_string(&name),
            _ => format!("CUDA device {index}"),
        };

        let mut total: usize = 0;
        let ret = unsafe { (self.api.device_total_mem)(&mut total, device) };
        check(ret, index, "cuDeviceTotalMem")?;

        let (free, ctx_total) = self.mem_info(index, device)?;
        debug!(
            library = %self.path.display(),
            index,
            %id,
            total = total,
            free = free,
            "CUDA device memory"
        );

        let raw = RawDevice {
            index,
            id,
            name,
            total_memory: (total as u64).max(ctx_total),
            free_memory: free,
            compute: Version::new(major.max(0) as u32, minor.max(0) as u32),
            driver: self.driver,
            os_overhead: None,
        };
        Ok(apply_management(raw, self.nvml.as_ref()))
    }

    fn query_memory(&mut self, device: &DeviceInfo) -> DiscoveryResult<MemoryReading> {
        if let Some(nvml) = &self.nvml {
            match nvml.memory(device.index(), &device.id) {
                Ok(mem) => return Ok(mem.reading()),
                Err(e) => warn!(gpu = %device.id, error = %e, "NVML memory query failed, using CUDA figures"),
            }
        }
        let handle = self.device(device.index())?;
        let (free, total) = self.mem_info(device.index(), handle)?;
        Ok(MemoryReading::new(total, free))
    }
}

/// Replace context-based figures with NVML's when it knows the device.
fn apply_management(mut raw: RawDevice, nvml: Option<&Nvml>) -> RawDevice {
    let Some(nvml) = nvml else {
        return raw;
    };
    match nvml.memory(raw.index, &raw.id) {
        Ok(mem) => {
            raw.total_memory = mem.total;
            raw.free_memory = mem.free;
            raw.os_overhead = Some(mem.overhead());
            info!(
                id = %raw.id,
                name = %raw.name,
                overhead = %human_bytes(mem.overhead()),
                "detected OS VRAM overhead"
            );
        }
        Err(e) => warn!(gpu = %raw.id, error = %e, "NVML memory query failed, using CUDA figures"),
    }
    raw
}

fn check(ret: c_int, index: usize, call: &str) -> DiscoveryResult<()> {
    if ret == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DiscoveryError::DeviceQuery {
            backend: Backend::Cuda,
            index,
            reason: format!("{call} failed: {ret}"),
        })
    }
}

fn classify_init_error(ret: c_int, path: &Path) -> DiscoveryError {
    let path = path.to_path_buf();
    match ret {
        CUDA_ERROR_INSUFFICIENT_DRIVER | CUDA_ERROR_SYSTEM_DRIVER_MISMATCH => {
            let err = DiscoveryError::DriverMismatch {
                backend: Backend::Cuda,
                path,
            };
            warn!("{err}");
            err
        }
        CUDA_ERROR_NO_DEVICE => DiscoveryError::NoDevices {
            backend: Backend::Cuda,
            path,
        },
        CUDA_ERROR_UNKNOWN => {
            let err = DiscoveryError::Init {
                backend: Backend::Cuda,
                path,
                reason: "unknown error initializing cuda driver library".into(),
            };
            warn!("{err}");
            err
        }
        other => DiscoveryError::Init {
            backend: Backend::Cuda,
            path,
            reason: format!("cuInit failed: {other}"),
        },
    }
}

/// Probe backed by the CUDA driver library
#[derive(Debug, Clone, Default)]
pub struct CudaDriverProbe {
    hints: VariantHints,
    /// Where to look for NVML first; `None` disables it
    nvml_dir: Option<PathBuf>,
}

impl CudaDriverProbe {
    pub fn new(hints: VariantHints) -> Self {
        Self { hints, nvml_dir: None }
    }

    /// Pair each opened driver library with NVML, searched from `install_dir`
    pub fn with_nvml(mut self, install_dir: impl Into<PathBuf>) -> Self {
        self.nvml_dir = Some(install_dir.into());
        self
    }
}

impl DeviceProbe for CudaDriverProbe {
    fn backend(&self) -> Backend {
        Backend::Cuda
    }

    fn name(&self) -> &'static str {
        "nvcuda"
    }

    fn search_plan(&self, install_dir: &Path) -> SearchPlan {
        SearchPlan::for_library(
            platform::current(),
            RuntimeLibrary::CudaDriver,
            install_dir,
            BUNDLED_SUBDIRS,
        )
    }

    fn open(&self, path: &Path) -> DiscoveryResult<Box<dyn GpuLibrary>> {
        let library = CudaDriverLibrary::open(path)?;
        let nvml = self.nvml_dir.as_deref().and_then(Nvml::find);
        Ok(Box::new(library.with_nvml(nvml)))
    }

    fn minimum_memory(&self) -> u64 {
        CUDA_MINIMUM_MEMORY
    }

    fn variant(&self, device: &RawDevice) -> String {
        cuda_variant(device.compute, device.driver, &self.hints)
    }

    fn dependency_paths(&self, variant: &str, _library: &Path, install_dir: &Path) -> Vec<PathBuf> {
        cuda_dependency_paths(variant, install_dir)
    }
}

// ============================================================================
// Runtime API
// ============================================================================

const CUDART_SUCCESS: c_int = 0;
const CUDART_ERROR_NO_DEVICE: c_int = 100;
const CUDART_ERROR_INSUFFICIENT_DRIVER: c_int = 35;

#[derive(Clone, Copy)]
struct RuntimeApi {
    get_device_count: unsafe extern "C" fn(*mut c_int) -> c_int,
    set_device: unsafe extern "C" fn(c_int) -> c_int,
    device_get_attribute: unsafe extern "C" fn(*mut c_int, c_int, c_int) -> c_int,
    mem_get_info: unsafe extern "C" fn(*mut usize, *mut usize) -> c_int,
    driver_get_version: unsafe extern "C" fn(*mut c_int) -> c_int,
}

impl RuntimeApi {
    unsafe fn load(library: &Library, path: &Path) -> DiscoveryResult<Self> {
        let b = Backend::Cuda;
        unsafe {
            Ok(Self {
                get_device_count: symbol(library, b, path, b"cudaGetDeviceCount\0")?,
                set_device: symbol(library, b, path, b"cudaSetDevice\0")?,
                device_get_attribute: symbol(library, b, path, b"cudaDeviceGetAttribute\0")?,
                mem_get_info: symbol(library, b, path, b"cudaMemGetInfo\0")?,
                driver_get_version: symbol(library, b, path, b"cudaDriverGetVersion\0")?,
            })
        }
    }
}

/// Opened `libcudart` / `cudart64_*`
struct CudaRuntimeLibrary {
    api: RuntimeApi,
    device_count: usize,
    driver: Option<Version>,
    _library: Library,
}

impl CudaRuntimeLibrary {
    fn open(path: &Path) -> DiscoveryResult<Self> {
        let library = unsafe { open_library(Backend::Cuda, path)? };
        let api = unsafe { RuntimeApi::load(&library, path)? };

        let mut count: c_int = 0;
        match unsafe { (api.get_device_count)(&mut count) } {
            CUDART_SUCCESS => {}
            CUDART_ERROR_NO_DEVICE => count = 0,
            CUDART_ERROR_INSUFFICIENT_DRIVER => {
                return Err(DiscoveryError::DriverMismatch {
                    backend: Backend::Cuda,
                    path: path.to_path_buf(),
                });
            }
            ret => {
                return Err(DiscoveryError::Init {
                    backend: Backend::Cuda,
                    path: path.to_path_buf(),
                    reason: format!("cudaGetDeviceCount failed: {ret}"),
                });
            }
        }

        let mut raw_version: c_int = 0;
        let driver = match unsafe { (api.driver_get_version)(&mut raw_version) } {
            CUDART_SUCCESS if raw_version > 0 => Some(decode_driver_version(raw_version)),
            _ => None,
        };

        Ok(Self {
            api,
            device_count: count.max(0) as usize,
            driver,
            _library: library,
        })
    }

    fn select(&self, index: usize) -> DiscoveryResult<()> {
        let ret = unsafe { (self.api.set_device)(index as c_int) };
        check(ret, index, "cudaSetDevice")
    }

    fn mem_info(&self, index: usize) -> DiscoveryResult<(u64, u64)> {
        let (mut free, mut total) = (0usize, 0usize);
        let ret = unsafe { (self.api.mem_get_info)(&mut free, &mut total) };
        check(ret, index, "cudaMemGetInfo")?;
        Ok((free as u64, total as u64))
    }
}

impl GpuLibrary for CudaRuntimeLibrary {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn query_device(&mut self, index: usize) -> DiscoveryResult<RawDevice> {
        self.select(index)?;
        let (mut major, mut minor): (c_int, c_int) = (0, 0);
        let device = index as c_int;
        unsafe {
            check(
                (self.api.device_get_attribute)(&mut major, ATTR_COMPUTE_CAPABILITY_MAJOR, device),
                index,
                "cudaDeviceGetAttribute(major)",
            )?;
            check(
                (self.api.device_get_attribute)(&mut minor, ATTR_COMPUTE_CAPABILITY_MINOR, device),
                index,
                "cudaDeviceGetAttribute(minor)",
            )?;
        }
        let (free, total) = self.mem_info(index)?;

        Ok(RawDevice {
            index,
            id: index.to_string(),
            name: format!("CUDA device {index}"),
            total_memory: total,
            free_memory: free,
            compute: Version::new(major.max(0) as u32, minor.max(0) as u32),
            driver: self.driver,
            os_overhead: None,
        })
    }

    fn query_memory(&mut self, device: &DeviceInfo) -> DiscoveryResult<MemoryReading> {
        self.select(device.index())?;
        let (free, total) = self.mem_info(device.index())?;
        Ok(MemoryReading::new(total, free))
    }
}

/// Probe backed by the CUDA runtime library
#[derive(Debug, Clone, Default)]
pub struct CudaRuntimeProbe {
    hints: VariantHints,
}

impl CudaRuntimeProbe {
    pub fn new(hints: VariantHints) -> Self {
        Self { hints }
    }
}

impl DeviceProbe for CudaRuntimeProbe {
    fn backend(&self) -> Backend {
        Backend::Cuda
    }

    fn name(&self) -> &'static str {
        "cudart"
    }

    fn search_plan(&self, install_dir: &Path) -> SearchPlan {
        SearchPlan::for_library(
            platform::current(),
            RuntimeLibrary::CudaRuntime,
            install_dir,
            BUNDLED_SUBDIRS,
        )
    }

    fn open(&self, path: &Path) -> DiscoveryResult<Box<dyn GpuLibrary>> {
        Ok(Box::new(CudaRuntimeLibrary::open(path)?))
    }

    fn minimum_memory(&self) -> u64 {
        CUDA_MINIMUM_MEMORY
    }

    fn variant(&self, device: &RawDevice) -> String {
        cuda_variant(device.compute, device.driver, &self.hints)
    }

    fn dependency_paths(&self, variant: &str, _library: &Path, install_dir: &Path) -> Vec<PathBuf> {
        cuda_dependency_paths(variant, install_dir)
    }
}

// ============================================================================
// Tests
// ============================================================================
