//! AMD ROCm probe over the HIP runtime

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::ffi::{buffer_to_string, open_library, symbol};
use crate::format::{GIBIBYTE, MEBIBYTE, human_bytes};
use crate::hardware::{Backend, DeviceInfo, Version};
use crate::platform::{self, RuntimeLibrary};
use crate::probe::{DeviceProbe, GpuLibrary, MemoryReading, RawDevice};
use crate::search::SearchPlan;
use libloading::Library;
use std::ffi::{c_char, c_int, c_uint};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Minimum free memory for a ROCm device to be worth loading onto
pub const ROCM_MINIMUM_MEMORY: u64 = 457 * MEBIBYTE;

/// Devices with less memory than this are integrated GPUs sharing system RAM
pub const IGPU_MEMORY_THRESHOLD: u64 = GIBIBYTE;

const HIP_SUCCESS: c_int = 0;
const HIP_ERROR_INSUFFICIENT_DRIVER: c_int = 35;
const HIP_ERROR_NO_DEVICE: c_int = 100;

const NAME_LEN: usize = 256;

const BUNDLED_SUBDIRS: &[&str] = &["rocm"];

/// Decode a HIP version integer (`major * 10^7 + minor * 10^5 + patch`)
fn decode_hip_version(raw: c_int) -> Version {
    let raw = raw.max(0) as u32;
    Version::new(raw / 10_000_000, (raw / 100_000) % 100)
}

#[derive(Clone, Copy)]
struct HipApi {
    init: unsafe extern "C" fn(c_uint) -> c_int,
    get_device_count: unsafe extern "C" fn(*mut c_int) -> c_int,
    device_get: unsafe extern "C" fn(*mut c_int, c_int) -> c_int,
    compute_capability: unsafe extern "C" fn(*mut c_int, *mut c_int, c_int) -> c_int,
    device_get_name: unsafe extern "C" fn(*mut c_char, c_int, c_int) -> c_int,
    device_total_mem: unsafe extern "C" fn(*mut usize, c_int) -> c_int,
    set_device: unsafe extern "C" fn(c_int) -> c_int,
    mem_get_info: unsafe extern "C" fn(*mut usize, *mut usize) -> c_int,
    driver_get_version: unsafe extern "C" fn(*mut c_int) -> c_int,
}

impl HipApi {
    unsafe fn load(library: &Library, path: &Path) -> DiscoveryResult<Self> {
        let b = Backend::Rocm;
        unsafe {
            Ok(Self {
                init: symbol(library, b, path, b"hipInit\0")?,
                get_device_count: symbol(library, b, path, b"hipGetDeviceCount\0")?,
                device_get: symbol(library, b, path, b"hipDeviceGet\0")?,
                compute_capability: symbol(library, b, path, b"hipDeviceComputeCapability\0")?,
                device_get_name: symbol(library, b, path, b"hipDeviceGetName\0")?,
                device_total_mem: symbol(library, b, path, b"hipDeviceTotalMem\0")?,
                set_device: symbol(library, b, path, b"hipSetDevice\0")?,
                mem_get_info: symbol(library, b, path, b"hipMemGetInfo\0")?,
                driver_get_version: symbol(library, b, path, b"hipDriverGetVersion\0")?,
            })
        }
    }
}

struct HipLibrary {
    api: HipApi,
    device_count: usize,
    driver: Option<Version>,
    _library: Library,
}

impl HipLibrary {
    fn open(path: &Path) -> DiscoveryResult<Self> {
        let library = unsafe { open_library(Backend::Rocm, path)? };
        let api = unsafe { HipApi::load(&library, path)? };

        match unsafe { (api.init)(0) } {
            HIP_SUCCESS => {}
            HIP_ERROR_INSUFFICIENT_DRIVER => {
                return Err(DiscoveryError::DriverMismatch {
                    backend: Backend::Rocm,
                    path: path.to_path_buf(),
                });
            }
            HIP_ERROR_NO_DEVICE => {
                return Err(DiscoveryError::NoDevices {
                    backend: Backend::Rocm,
                    path: path.to_path_buf(),
                });
            }
            ret => {
                return Err(DiscoveryError::Init {
                    backend: Backend::Rocm,
                    path: path.to_path_buf(),
                    reason: format!("hipInit failed: {ret}"),
                });
            }
        }

        let mut count: c_int = 0;
        match unsafe { (api.get_device_count)(&mut count) } {
            HIP_SUCCESS => {}
            HIP_ERROR_NO_DEVICE => count = 0,
            ret => {
                return Err(DiscoveryError::Init {
                    backend: Backend::Rocm,
                    path: path.to_path_buf(),
                    reason: format!("hipGetDeviceCount failed: {ret}"),
                });
            }
        }

        let mut raw_version: c_int = 0;
        let driver = match unsafe { (api.driver_get_version)(&mut raw_version) } {
            HIP_SUCCESS if raw_version > 0 => Some(decode_hip_version(raw_version)),
            _ => None,
        };
        debug!(library = %path.display(), count, driver = ?driver, "HIP runtime initialized");

        Ok(Self {
            api,
            device_count: count.max(0) as usize,
            driver,
            _library: library,
        })
    }

    fn mem_info(&self, index: usize) -> DiscoveryResult<(u64, u64)> {
        check(unsafe { (self.api.set_device)(index as c_int) }, index, "hipSetDevice")?;
        let (mut free, mut total) = (0usize, 0usize);
        check(
            unsafe { (self.api.mem_get_info)(&mut free, &mut total) },
            index,
            "hipMemGetInfo",
        )?;
        Ok((free as u64, total as u64))
    }
}

fn check(ret: c_int, index: usize, call: &str) -> DiscoveryResult<()> {
    if ret == HIP_SUCCESS {
        Ok(())
    } else {
        Err(DiscoveryError::DeviceQuery {
            backend: Backend::Rocm,
            index,
            reason: format!("{call} failed: {ret}"),
        })
    }
}

impl GpuLibrary for HipLibrary {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn query_device(&mut self, index: usize) -> DiscoveryResult<RawDevice> {
        let mut device: c_int = 0;
        check(
            unsafe { (self.api.device_get)(&mut device, index as c_int) },
            index,
            "hipDeviceGet",
        )?;

        let (mut major, mut minor): (c_int, c_int) = (0, 0);
        check(
            unsafe { (self.api.compute_capability)(&mut major, &mut minor, device) },
            index,
            "hipDeviceComputeCapability",
        )?;

        let mut name_buf = [0 as c_char; NAME_LEN];
        let name = match unsafe {
            (self.api.device_get_name)(name_buf.as_mut_ptr(), NAME_LEN as c_int, device)
        } {
            HIP_SUCCESS => buffer_to_string(&name_buf),
            _ => format!("ROCm device {index}"),
        };

        let mut total: usize = 0;
        check(
            unsafe { (self.api.device_total_mem)(&mut total, device) },
            index,
            "hipDeviceTotalMem",
        )?;
        let (free, _) = self.mem_info(index)?;

        Ok(RawDevice {
            index,
            id: index.to_string(),
            name,
            total_memory: total as u64,
            free_memory: free,
            compute: Version::new(major.max(0) as u32, minor.max(0) as u32),
            driver: self.driver,
            os_overhead: None,
        })
    }

    fn query_memory(&mut self, device: &DeviceInfo) -> DiscoveryResult<MemoryReading> {
        let (free, total) = self.mem_info(device.index())?;
        Ok(MemoryReading::new(total, free))
    }
}

/// Probe backed by the HIP runtime (`libamdhip64` / `amdhip64`)
#[derive(Debug, Clone, Copy, Default)]
pub struct HipProbe;

impl DeviceProbe for HipProbe {
    fn backend(&self) -> Backend {
        Backend::Rocm
    }

    fn name(&self) -> &'static str {
        "amdhip64"
    }

    fn search_plan(&self, install_dir: &Path) -> SearchPlan {
        SearchPlan::for_library(platform::current(), RuntimeLibrary::Hip, install_dir, BUNDLED_SUBDIRS)
    }

    fn open(&self, path: &Path) -> DiscoveryResult<Box<dyn GpuLibrary>> {
        Ok(Box::new(HipLibrary::open(path)?))
    }

    fn minimum_memory(&self) -> u64 {
        ROCM_MINIMUM_MEMORY
    }

    fn variant(&self, _device: &RawDevice) -> String {
        String::new()
    }

    fn dependency_paths(&self, _variant: &str, library: &Path, install_dir: &Path) -> Vec<PathBuf> {
        rocm_dependency_paths(library, install_dir)
    }

    fn skip_reason(&self, device: &RawDevice) -> Option<String> {
        (device.total_memory < IGPU_MEMORY_THRESHOLD).then(|| {
            format!(
                "integrated GPU with {} of memory",
                human_bytes(device.total_memory)
            )
        })
    }
}

fn rocm_dependency_paths(library: &Path, install_dir: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let bundled = install_dir.join("rocm");
    if bundled.is_dir() {
        paths.push(bundled);
    }
    if let Some(dir) = library.parent().filter(|d| !d.as_os_str().is_empty()) {
        if !paths.iter().any(|p| p == dir) {
            paths.push(dir.to_path_buf());
        }
    }
    paths
}

// ============================================================================
// Tests
// ============================================================================
