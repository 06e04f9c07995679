//! NVIDIA management library (NVML)
//!
//! Optional companion of the CUDA driver probe. NVML reports the memory the
//! driver and OS reserve on each device, and a free figure that already
//! excludes it, without creating a CUDA context. Devices are looked up by
//! UUID, so only probes that report `GPU-...` ids can use it.

use crate::error::{DiscoveryError, DiscoveryResult};
use crate::ffi::{open_library, symbol};
use crate::hardware::Backend;
use crate::platform::{self, RuntimeLibrary};
use crate::probe::MemoryReading;
use crate::search::SearchPlan;
use libloading::Library;
use std::ffi::{CString, c_char, c_int, c_uint, c_void};
use std::path::{Path, PathBuf};
use tracing::debug;

const NVML_SUCCESS: c_int = 0;

type NvmlDevice = *mut c_void;

/// `nvmlMemory_v2_t`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct RawMemoryV2 {
    version: c_uint,
    total: u64,
    reserved: u64,
    free: u64,
    used: u64,
}

/// `NVML_STRUCT_VERSION(Memory, 2)`
const MEMORY_V2_VERSION: c_uint = (size_of::<RawMemoryV2>() as c_uint) | (2 << 24);

/// Memory figures of one device as NVML reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmlMemory {
    pub total: u64,
    /// Reserved by the driver and OS
    pub reserved: u64,
    /// Free memory, already excluding `reserved`
    pub free: u64,
    pub used: u64,
}

impl NvmlMemory {
    /// OS/driver overhead recorded at bootstrap
    pub fn overhead(&self) -> u64 {
        self.reserved
    }

    /// Refresh reading; the overhead is already out of `free`
    pub fn reading(&self) -> MemoryReading {
        MemoryReading {
            total: self.total,
            free: self.free.min(self.total),
            used: self.used,
            overhead_accounted: true,
        }
    }
}

impl From<RawMemoryV2> for NvmlMemory {
    fn from(raw: RawMemoryV2) -> Self {
        Self {
            total: raw.total,
            reserved: raw.reserved,
            free: raw.free,
            used: raw.used,
        }
    }
}

#[derive(Clone, Copy)]
struct NvmlApi {
    init: unsafe extern "C" fn() -> c_int,
    shutdown: unsafe extern "C" fn() -> c_int,
    handle_by_uuid: unsafe extern "C" fn(*const c_char, *mut NvmlDevice) -> c_int,
    memory_info: unsafe extern "C" fn(NvmlDevice, *mut RawMemoryV2) -> c_int,
}

impl NvmlApi {
    unsafe fn load(library: &Library, path: &Path) -> DiscoveryResult<Self> {
        let b = Backend::Cuda;
        unsafe {
            Ok(Self {
                init: symbol(library, b, path, b"nvmlInit_v2\0")?,
                shutdown: symbol(library, b, path, b"nvmlShutdown\0")?,
                handle_by_uuid: symbol(library, b, path, b"nvmlDeviceGetHandleByUUID\0")?,
                memory_info: symbol(library, b, path, b"nvmlDeviceGetMemoryInfo_v2\0")?,
            })
        }
    }
}

/// An initialized NVML; shut down on drop
pub struct Nvml {
    api: NvmlApi,
    path: PathBuf,
    _library: Library,
}

impl std::fmt::Debug for Nvml {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nvml").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Nvml {
    pub fn open(path: &Path) -> DiscoveryResult<Self> {
        let library = unsafe { open_library(Backend::Cuda, path)? };
        let api = unsafe { NvmlApi::load(&library, path)? };
        let ret = unsafe { (api.init)() };
        if ret != NVML_SUCCESS {
            return Err(DiscoveryError::Init {
                backend: Backend::Cuda,
                path: path.to_path_buf(),
                reason: format!("nvmlInit_v2 failed: {ret}"),
            });
        }
        debug!(library = %path.display(), "NVML initialized");
        Ok(Self {
            api,
            path: path.to_path_buf(),
            _library: library,
        })
    }

    /// First management library along the search plan that initializes
    pub fn find(install_dir: &Path) -> Option<Self> {
        let plan = SearchPlan::for_library(platform::current(), RuntimeLibrary::Nvml, install_dir, &[]);
        for path in plan.resolve() {
            match Self::open(&path) {
                Ok(nvml) => return Some(nvml),
                Err(e) => debug!("{e}"),
            }
        }
        debug!("no usable NVML library, using CUDA memory figures");
        None
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Memory of the device with NVML UUID `uuid`
    pub fn memory(&self, index: usize, uuid: &str) -> DiscoveryResult<NvmlMemory> {
        let query_err = |reason: String| DiscoveryError::DeviceQuery {
            backend: Backend::Cuda,
            index,
            reason,
        };
        let c_uuid = CString::new(uuid).map_err(|e| query_err(format!("invalid device id {uuid:?}: {e}")))?;

        let mut device: NvmlDevice = std::ptr::null_mut();
        let ret = unsafe { (self.api.handle_by_uuid)(c_uuid.as_ptr(), &mut device) };
        if ret != NVML_SUCCESS {
            return Err(query_err(format!("nvmlDeviceGetHandleByUUID failed: {ret}")));
        }

        let mut raw = RawMemoryV2 {
            version: MEMORY_V2_VERSION,
            ..RawMemoryV2::default()
        };
        let ret = unsafe { (self.api.memory_info)(device, &mut raw) };
        if ret != NVML_SUCCESS {
            return Err(query_err(format!("nvmlDeviceGetMemoryInfo_v2 failed: {ret}")));
        }
        Ok(raw.into())
    }
}

impl Drop for Nvml {
    fn drop(&mut self) {
        let ret = unsafe { (self.api.shutdown)() };
        if ret != NVML_SUCCESS {
            debug!(code = ret, "nvmlShutdown failed");
        }
    }
}
