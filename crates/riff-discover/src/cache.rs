//! Discovery cache
//!
//! The first [`DiscoveryCache::snapshot`] call bootstraps: it builds the CPU
//! entry, runs every backend's probe chain and sorts the devices it finds
//! into accepted and unsupported. Later calls only refresh free memory of
//! the devices already known, by reopening exactly the library that found
//! them. Devices are never added or removed after bootstrap.
//!
//! All of this happens under one lock, so concurrent callers observe either
//! the state before or after a complete bootstrap or refresh.

use crate::config::DiscoveryConfig;
use crate::cpu::{self, detect_cpu};
use crate::cuda::{CudaDriverProbe, CudaRuntimeProbe, VariantHints};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::format::human_bytes;
use crate::hardware::{Backend, DeviceInfo, SystemSnapshot};
use crate::probe::{DeviceProbe, ProbeRequest, RawDevice, probe};
use crate::rocm::HipProbe;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Probes for one backend, tried in priority order until one finds devices
#[derive(Clone)]
pub struct BackendProbes {
    pub backend: Backend,
    pub probes: Vec<Arc<dyn DeviceProbe>>,
}

impl BackendProbes {
    pub fn new(backend: Backend, probes: Vec<Arc<dyn DeviceProbe>>) -> Self {
        Self { backend, probes }
    }

    /// CUDA driver library (with NVML when present) first, runtime library second
    pub fn cuda(hints: VariantHints, install_dir: &Path) -> Self {
        Self::new(
            Backend::Cuda,
            vec![
                Arc::new(CudaDriverProbe::new(hints.clone()).with_nvml(install_dir)),
                Arc::new(CudaRuntimeProbe::new(hints)),
            ],
        )
    }

    pub fn rocm() -> Self {
        Self::new(Backend::Rocm, vec![Arc::new(HipProbe)])
    }
}

impl std::fmt::Debug for BackendProbes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.probes.iter().map(|p| p.name()).collect();
        f.debug_struct("BackendProbes")
            .field("backend", &self.backend)
            .field("probes", &names)
            .finish()
    }
}

/// The library that produced a backend's accepted devices
struct LibraryRecord {
    backend: Backend,
    probe: Arc<dyn DeviceProbe>,
    path: PathBuf,
}

#[derive(Default)]
struct CacheState {
    bootstrapped: bool,
    cpu: Option<DeviceInfo>,
    gpus: Vec<DeviceInfo>,
    unsupported: Vec<DeviceInfo>,
    errors: Vec<DiscoveryError>,
    libraries: Vec<LibraryRecord>,
}

/// Process-wide record of discovered devices, shared by reference
pub struct DiscoveryCache {
    config: DiscoveryConfig,
    chains: Vec<BackendProbes>,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("config", &self.config)
            .field("chains", &self.chains)
            .field("bootstrapped", &self.state.lock().bootstrapped)
            .finish()
    }
}

impl DiscoveryCache {
    /// Cache with the built-in CUDA and ROCm probes
    pub fn new(config: DiscoveryConfig) -> Self {
        let hints = VariantHints::detect(config.jetpack.clone());
        let chains = vec![
            BackendProbes::cuda(hints, &config.install_dir),
            BackendProbes::rocm(),
        ];
        Self::with_probes(config, chains)
    }

    /// Cache with caller-supplied probe chains
    pub fn with_probes(config: DiscoveryConfig, chains: Vec<BackendProbes>) -> Self {
        Self {
            config,
            chains,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Bootstrap on first use, refresh afterwards, and return a copy.
    ///
    /// Blocks while native libraries are probed. Async callers should use
    /// [`snapshot_async`](Self::snapshot_async).
    pub fn snapshot(&self) -> SystemSnapshot {
        let mut state = self.state.lock();
        if state.bootstrapped {
            self.refresh(&mut state);
        } else {
            self.bootstrap(&mut state);
        }
        SystemSnapshot {
            cpu: state.cpu.clone().unwrap_or_else(detect_cpu),
            gpus: state.gpus.clone(),
            unsupported_gpus: state.unsupported.clone(),
            discovery_errors: state.errors.iter().map(|e| e.to_string()).collect(),
        }
    }

    /// [`snapshot`](Self::snapshot) on the blocking thread pool
    ///
    /// Fails only when the runtime drops the task before it ran, e.g. during
    /// shutdown. A panic inside discovery is resumed on the caller.
    pub async fn snapshot_async(self: &Arc<Self>) -> DiscoveryResult<SystemSnapshot> {
        let cache = Arc::clone(self);
        joined(tokio::task::spawn_blocking(move || cache.snapshot()).await)
    }

    /// Only the CPU entry, bootstrapping first if needed
    pub fn cpu_info(&self) -> DeviceInfo {
        let mut state = self.state.lock();
        if !state.bootstrapped {
            self.bootstrap(&mut state);
        }
        state.cpu.clone().unwrap_or_else(detect_cpu)
    }

    /// True once the first snapshot completed
    pub fn is_bootstrapped(&self) -> bool {
        self.state.lock().bootstrapped
    }

    fn bootstrap(&self, state: &mut CacheState) {
        info!("looking for compatible GPUs");
        state.cpu = Some(detect_cpu());

        for chain in &self.chains {
            self.bootstrap_backend(state, chain);
        }

        state.bootstrapped = true;
        if state.gpus.is_empty() {
            info!("no compatible GPUs were discovered");
        }
    }

    fn bootstrap_backend(&self, state: &mut CacheState, chain: &BackendProbes) {
        let request = ProbeRequest {
            explicit_path: self.config.explicit_library(chain.backend).map(Path::to_path_buf),
            install_dir: self.config.install_dir.clone(),
        };
        let minimum_compute = self.config.minimum_compute(chain.backend);

        for device_probe in &chain.probes {
            let mut outcome = match probe(device_probe.as_ref(), &request) {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(e) => {
                    state.errors.push(e);
                    continue;
                }
            };
            debug!(
                backend = %chain.backend,
                library = %outcome.library_path.display(),
                count = outcome.device_count,
                "enumerating devices"
            );

            let mut accepted = 0;
            for index in 0..outcome.device_count {
                let raw = match outcome.library.query_device(index) {
                    Ok(raw) => raw,
                    Err(e) => {
                        info!("{e}");
                        state.errors.push(e);
                        continue;
                    }
                };
                if let Some(reason) = device_probe.skip_reason(&raw) {
                    info!(backend = %chain.backend, index, name = %raw.name, "skipping device: {reason}");
                    continue;
                }

                let mut device = self.device_record(chain.backend, device_probe.as_ref(), &raw);
                if raw.compute < minimum_compute {
                    info!(
                        "[{index}] {} GPU is too old. Compute Capability detected: {}",
                        chain.backend, raw.compute
                    );
                    state.unsupported.push(device);
                    continue;
                }

                device.variant = device_probe.variant(&raw);
                device.dependency_paths = device_probe.dependency_paths(
                    &device.variant,
                    &outcome.library_path,
                    &self.config.install_dir,
                );
                info!(
                    id = %device.id,
                    library = chain.backend.as_str(),
                    variant = %device.variant,
                    compute = ?device.compute.map(|c| c.to_string()),
                    driver = ?device.driver.map(|d| d.to_string()),
                    name = %device.name,
                    total = %human_bytes(device.total_memory),
                    available = %human_bytes(device.free_memory),
                    "inference compute"
                );
                state.gpus.push(device);
                accepted += 1;
            }

            if accepted > 0 {
                state.libraries.push(LibraryRecord {
                    backend: chain.backend,
                    probe: Arc::clone(device_probe),
                    path: outcome.library_path.clone(),
                });
            }
            // The library is closed here; refresh reopens it by path.
            return;
        }
    }

    fn device_record(&self, backend: Backend, device_probe: &dyn DeviceProbe, raw: &RawDevice) -> DeviceInfo {
        let mut device = DeviceInfo::gpu(backend, raw.index, raw.id.clone(), raw.name.clone());
        device.compute = Some(raw.compute);
        device.driver = raw.driver;
        device.minimum_memory = device_probe.minimum_memory();

        let free = match raw.os_overhead {
            Some(measured) => {
                device.os_overhead_bytes = measured;
                raw.free_memory
            }
            None => {
                device.os_overhead_bytes = self.config.gpu_overhead;
                raw.free_memory.saturating_sub(self.config.gpu_overhead)
            }
        };
        device.set_memory(raw.total_memory, free);
        device
    }

    fn refresh(&self, state: &mut CacheState) {
        if let Some(cpu) = state.cpu.as_mut() {
            let mem = cpu::system_memory();
            if mem.total == 0 {
                warn!("error looking up system memory, keeping last values");
            } else {
                debug!(
                    before_free = %human_bytes(cpu.free_memory),
                    now_free = %human_bytes(mem.free),
                    "updating system memory data"
                );
                cpu::apply_memory(cpu, mem);
            }
        }

        let CacheState { gpus, libraries, .. } = state;
        for record in libraries.iter() {
            let request = ProbeRequest::explicit(&record.path, &self.config.install_dir);
            let mut outcome = match probe(record.probe.as_ref(), &request) {
                Ok(Some(outcome)) => outcome,
                Ok(None) => {
                    warn!(library = %record.path.display(), "library no longer loadable, keeping last memory values");
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "unable to refresh {} memory, keeping last values", record.backend);
                    continue;
                }
            };

            for device in gpus.iter_mut().filter(|d| d.backend == record.backend) {
                let reading = match outcome.library.query_memory(device) {
                    Ok(reading) => reading,
                    Err(e) => {
                        warn!(gpu = %device.id, error = %e, "error looking up GPU memory");
                        continue;
                    }
                };
                if reading.free == 0 {
                    warn!(gpu = %device.id, "GPU reported no free memory, keeping last value");
                    continue;
                }
                let free = if reading.overhead_accounted {
                    reading.free
                } else {
                    reading.free.saturating_sub(device.os_overhead_bytes)
                };
                debug!(
                    gpu = %device.id,
                    name = %device.name,
                    overhead = %human_bytes(device.os_overhead_bytes),
                    before = %human_bytes(device.free_memory),
                    now = %human_bytes(free),
                    used = %human_bytes(reading.used),
                    "updating {} memory data",
                    record.backend
                );
                let total = device.total_memory;
                device.set_memory(total, free);
            }
        }
    }
}

fn joined<T>(result: Result<T, tokio::task::JoinError>) -> DiscoveryResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => {
            warn!(error = %e, "discovery task was cancelled");
            Err(DiscoveryError::Interrupted(e.to_string()))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_chains() {
        let cache = DiscoveryCache::new(DiscoveryConfig::default());
        let backends: Vec<_> = cache.chains.iter().map(|c| c.backend).collect();
        assert_eq!(backends, vec![Backend::Cuda, Backend::Rocm]);
        let cuda: Vec<_> = cache.chains[0].probes.iter().map(|p| p.name()).collect();
        assert_eq!(cuda, vec!["nvcuda", "cudart"]);
        assert!(!cache.is_bootstrapped());
    }

    #[tokio::test]
    async fn test_cancelled_task_is_interrupted() {
        let task = tokio::spawn(std::future::pending::<SystemSnapshot>());
        task.abort();
        let err = joined(task.await).expect_err("cancelled");
        assert!(matches!(err, DiscoveryError::Interrupted(_)));
        assert!(err.to_string().starts_with("discovery did not complete"));
    }

    #[test]
    fn test_missing_explicit_library_is_recorded() {
        let config = DiscoveryConfig {
            cuda_library: Some(PathBuf::from("/nonexistent/libcuda.so.1")),
            rocm_library: Some(PathBuf::from("/nonexistent/libamdhip64.so")),
            ..DiscoveryConfig::default()
        };
        let cache = DiscoveryCache::new(config);
        let snapshot = cache.snapshot();
        assert!(snapshot.gpus.is_empty());
        assert!(snapshot.cpu.is_cpu());
        // one error per probe that tried the explicit path
        assert_eq!(snapshot.discovery_errors.len(), 3);
        assert!(cache.is_bootstrapped());
    }
}
