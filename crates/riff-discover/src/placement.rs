//! Device placement for the runner
//!
//! Turns a [`SystemSnapshot`] into the set of devices one runner process
//! should use, together with the engine variant and the directories its
//! native dependencies are resolved from.

use crate::format::human_bytes;
use crate::hardware::{Backend, DeviceInfo, SystemSnapshot};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Environment variable restricting a runtime to the selected devices
pub fn visible_devices_env(devices: &[DeviceInfo]) -> Option<(&'static str, String)> {
    let first = devices.first()?;
    let var = match first.backend {
        Backend::Cuda => "CUDA_VISIBLE_DEVICES",
        Backend::Rocm => "HIP_VISIBLE_DEVICES",
        Backend::Cpu => {
            debug!("no device filter required for CPU");
            return None;
        }
    };
    let ids: Vec<&str> = devices
        .iter()
        .filter(|d| {
            let same = d.backend == first.backend;
            if !same {
                debug!(id = %d.id, backend = %d.backend, "skipping device of another backend");
            }
            same
        })
        .map(|d| d.id.as_str())
        .collect();
    Some((var, ids.join(",")))
}

/// Devices chosen for one runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub backend: Backend,
    pub devices: Vec<DeviceInfo>,
    pub variant: String,
    /// Ordered, de-duplicated dependency directories of every selected device
    pub library_dirs: Vec<PathBuf>,
    /// Sum of usable memory (free minus each device's minimum)
    pub usable_memory: u64,
}

impl Placement {
    /// Pick the device group with the most usable memory, or the CPU.
    ///
    /// A group is every accepted GPU sharing one backend and one engine
    /// variant; devices that need different engine builds never share a
    /// runner. Ties go to the group discovered first.
    pub fn choose(snapshot: &SystemSnapshot) -> Self {
        let mut groups: Vec<(Backend, &str, u64)> = Vec::new();
        for gpu in &snapshot.gpus {
            let usable = gpu.usable_memory();
            match groups
                .iter_mut()
                .find(|(backend, variant, _)| *backend == gpu.backend && *variant == gpu.variant)
            {
                Some((_, _, total)) => *total += usable,
                None => groups.push((gpu.backend, gpu.variant.as_str(), usable)),
            }
        }
        let mut best: Option<(Backend, &str, u64)> = None;
        for group in groups.into_iter().filter(|(_, _, usable)| *usable > 0) {
            if best.is_none_or(|(_, _, b)| group.2 > b) {
                best = Some(group);
            }
        }

        let placement = match best {
            Some((backend, variant, usable)) => {
                let (devices, skipped): (Vec<DeviceInfo>, Vec<DeviceInfo>) = snapshot
                    .gpus
                    .iter()
                    .cloned()
                    .partition(|g| g.backend == backend && g.variant == variant);
                for gpu in &skipped {
                    debug!(id = %gpu.id, backend = %gpu.backend, variant = %gpu.variant, "device not in selected group");
                }
                Self::from_devices(backend, devices, usable)
            }
            None => {
                if !snapshot.gpus.is_empty() {
                    info!("no GPU has usable memory, falling back to CPU");
                }
                let cpu = snapshot.cpu.clone();
                let usable = cpu.free_memory;
                Self::from_devices(Backend::Cpu, vec![cpu], usable)
            }
        };
        info!(
            backend = %placement.backend,
            devices = placement.devices.len(),
            variant = %placement.variant,
            usable = %human_bytes(placement.usable_memory),
            "selected placement"
        );
        placement
    }

    fn from_devices(backend: Backend, devices: Vec<DeviceInfo>, usable_memory: u64) -> Self {
        let mut library_dirs: Vec<PathBuf> = Vec::new();
        for dir in devices.iter().flat_map(|d| d.dependency_paths.iter()) {
            if !library_dirs.contains(dir) {
                library_dirs.push(dir.clone());
            }
        }
        let variant = devices.first().map(|d| d.variant.clone()).unwrap_or_default();
        Self {
            backend,
            devices,
            variant,
            library_dirs,
            usable_memory,
        }
    }

    /// True when `bytes` fit in the usable memory
    pub fn fits(&self, bytes: u64) -> bool {
        bytes <= self.usable_memory
    }

    pub fn is_cpu(&self) -> bool {
        self.backend == Backend::Cpu
    }

    /// Visible-devices variable for the selected devices
    pub fn visible_devices_env(&self) -> Option<(&'static str, String)> {
        visible_devices_env(&self.devices)
    }

    /// Engine build directory name, e.g. `cuda_v12` or `cpu_avx2`
    pub fn runner_name(&self) -> String {
        match (self.backend, self.variant.as_str()) {
            (backend, "") => backend.as_str().to_string(),
            (backend, variant) => format!("{}_{variant}", backend.as_str()),
        }
    }
}
