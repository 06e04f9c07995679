//! Scriptable [`DeviceProbe`] standing in for a vendor runtime library.
//!
//! Each fake library path maps to a list of devices. Memory readings can be
//! changed between snapshots through [`FakeProbe::set_free`], and the probe
//! counts how many libraries are currently open so tests can check that no
//! handle outlives a snapshot.

use riff_discover::{
    Backend, DeviceInfo, DeviceProbe, DiscoveryError, DiscoveryResult, GpuLibrary, MemoryReading,
    RawDevice, Version, search::SearchPlan,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub struct FakeDevice {
    pub id: String,
    pub compute: Version,
    pub total: u64,
    pub free: u64,
    /// Full query fails for this device
    pub broken: bool,
    /// Memory query fails for this device
    pub memory_error: bool,
    /// Overhead the library measures itself; its readings then exclude it
    pub overhead: Option<u64>,
}

impl FakeDevice {
    pub fn new(id: &str, compute: Version, total: u64, free: u64) -> Self {
        Self {
            id: id.to_string(),
            compute,
            total,
            free,
            broken: false,
            memory_error: false,
            overhead: None,
        }
    }

    pub fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    /// Report `overhead` at bootstrap and overhead-free readings afterwards
    pub fn measured_overhead(mut self, overhead: u64) -> Self {
        self.overhead = Some(overhead);
        self
    }
}

#[derive(Debug, Clone)]
pub enum FakeLibrarySpec {
    Devices(Vec<FakeDevice>),
    InitFails,
}

#[derive(Default)]
struct Shared {
    libraries: parking_lot::Mutex<HashMap<PathBuf, FakeLibrarySpec>>,
    open: AtomicUsize,
    opened_total: AtomicUsize,
}

/// Builder-style fake probe
#[derive(Clone)]
pub struct FakeProbe {
    backend: Backend,
    name: &'static str,
    candidates: Vec<PathBuf>,
    minimum_memory: u64,
    dependency_dir: Option<PathBuf>,
    shared: Arc<Shared>,
}

impl FakeProbe {
    pub fn new(backend: Backend, name: &'static str) -> Self {
        Self {
            backend,
            name,
            candidates: Vec::new(),
            minimum_memory: 0,
            dependency_dir: None,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Add a candidate library
    pub fn library(self, path: &str, spec: FakeLibrarySpec) -> Self {
        let path = PathBuf::from(path);
        self.shared.libraries.lock().insert(path.clone(), spec);
        let mut this = self;
        this.candidates.push(path);
        this
    }

    pub fn minimum_memory(mut self, bytes: u64) -> Self {
        self.minimum_memory = bytes;
        self
    }

    pub fn dependency_dir(mut self, dir: &str) -> Self {
        self.dependency_dir = Some(PathBuf::from(dir));
        self
    }

    pub fn into_arc(self) -> Arc<dyn DeviceProbe> {
        Arc::new(self)
    }

    /// Change the free memory a device reports from now on
    pub fn set_free(&self, id: &str, free: u64) {
        self.update(id, |d| d.free = free);
    }

    /// Make memory queries for a device fail from now on
    pub fn fail_memory(&self, id: &str) {
        self.update(id, |d| d.memory_error = true);
    }

    /// Make every library fail to initialize from now on
    pub fn break_libraries(&self) {
        for spec in self.shared.libraries.lock().values_mut() {
            *spec = FakeLibrarySpec::InitFails;
        }
    }

    fn update(&self, id: &str, f: impl Fn(&mut FakeDevice)) {
        for spec in self.shared.libraries.lock().values_mut() {
            if let FakeLibrarySpec::Devices(devices) = spec {
                devices.iter_mut().filter(|d| d.id == id).for_each(&f);
            }
        }
    }

    /// Libraries currently open
    pub fn open_count(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Libraries opened since creation
    pub fn opened_total(&self) -> usize {
        self.shared.opened_total.load(Ordering::SeqCst)
    }
}

struct FakeLibrary {
    backend: Backend,
    path: PathBuf,
    shared: Arc<Shared>,
    count: usize,
}

impl FakeLibrary {
    fn device(&self, index: usize) -> Option<FakeDevice> {
        match self.shared.libraries.lock().get(&self.path) {
            Some(FakeLibrarySpec::Devices(devices)) => devices.get(index).cloned(),
            _ => None,
        }
    }

    fn query_error(&self, index: usize) -> DiscoveryError {
        DiscoveryError::DeviceQuery {
            backend: self.backend,
            index,
            reason: "simulated failure".into(),
        }
    }
}

impl Drop for FakeLibrary {
    fn drop(&mut self) {
        self.shared.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl GpuLibrary for FakeLibrary {
    fn device_count(&self) -> usize {
        self.count
    }

    fn query_device(&mut self, index: usize) -> DiscoveryResult<RawDevice> {
        let d = self
            .device(index)
            .filter(|d| !d.broken)
            .ok_or_else(|| self.query_error(index))?;
        Ok(RawDevice {
            index,
            id: d.id.clone(),
            name: format!("Fake {}", d.id),
            total_memory: d.total,
            free_memory: d.free,
            compute: d.compute,
            driver: Some(Version::new(12, 4)),
            os_overhead: d.overhead,
        })
    }

    fn query_memory(&mut self, device: &DeviceInfo) -> DiscoveryResult<MemoryReading> {
        let d = self
            .device(device.index())
            .filter(|d| !d.memory_error)
            .ok_or_else(|| self.query_error(device.index()))?;
        Ok(match d.overhead {
            Some(_) => MemoryReading::accounted(d.total, d.free),
            None => MemoryReading::new(d.total, d.free),
        })
    }
}

impl DeviceProbe for FakeProbe {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn search_plan(&self, _install_dir: &Path) -> SearchPlan {
        SearchPlan::default()
    }

    fn candidates(&self, _request: &riff_discover::ProbeRequest) -> Vec<PathBuf> {
        self.candidates.clone()
    }

    fn open(&self, path: &Path) -> DiscoveryResult<Box<dyn GpuLibrary>> {
        let spec = self.shared.libraries.lock().get(path).cloned();
        match spec {
            Some(FakeLibrarySpec::Devices(devices)) => {
                self.shared.open.fetch_add(1, Ordering::SeqCst);
                self.shared.opened_total.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(FakeLibrary {
                    backend: self.backend,
                    path: path.to_path_buf(),
                    shared: Arc::clone(&self.shared),
                    count: devices.len(),
                }))
            }
            Some(FakeLibrarySpec::InitFails) => Err(DiscoveryError::Init {
                backend: self.backend,
                path: path.to_path_buf(),
                reason: "simulated init failure".into(),
            }),
            None => Err(DiscoveryError::LibraryLoad {
                backend: self.backend,
                path: path.to_path_buf(),
                reason: "cannot open shared object file: No such file or directory".into(),
            }),
        }
    }

    fn minimum_memory(&self) -> u64 {
        self.minimum_memory
    }

    fn variant(&self, device: &RawDevice) -> String {
        format!("v{}", device.compute.major)
    }

    fn dependency_paths(&self, _variant: &str, _library: &Path, _install_dir: &Path) -> Vec<PathBuf> {
        self.dependency_dir.iter().cloned().collect()
    }
}
