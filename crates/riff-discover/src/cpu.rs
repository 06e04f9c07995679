//! Host CPU entry

use crate::format::human_bytes;
use crate::hardware::{Backend, DeviceInfo};
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, warn};

/// System memory figures in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SystemMemory {
    pub total: u64,
    pub free: u64,
    pub free_swap: u64,
}

/// Read system memory; zeros when the platform cannot report it
pub fn system_memory() -> SystemMemory {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();
    SystemMemory {
        total: sys.total_memory(),
        free: sys.available_memory(),
        free_swap: sys.free_swap(),
    }
}

/// Best CPU engine build supported by this host
pub fn cpu_variant() -> &'static str {
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") {
            return "avx2";
        }
        if std::arch::is_x86_feature_detected!("avx") {
            return "avx";
        }
    }
    ""
}

/// Build the CPU device record with fresh memory figures
pub fn detect_cpu() -> DeviceInfo {
    let sys = System::new_with_specifics(RefreshKind::new().with_cpu(CpuRefreshKind::new()));
    let name = sys
        .cpus()
        .first()
        .map(|c| c.brand().trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| "cpu".to_string());
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let mut cpu = DeviceInfo::gpu(Backend::Cpu, 0, "0", name);
    cpu.variant = cpu_variant().to_string();
    apply_memory(&mut cpu, system_memory());
    debug!(
        name = %cpu.name,
        threads,
        variant = %cpu.variant,
        "CPU details"
    );
    cpu
}

/// Store a memory reading on the CPU entry
pub fn apply_memory(cpu: &mut DeviceInfo, mem: SystemMemory) {
    if mem.total == 0 {
        warn!("error looking up system memory, keeping zeros");
    }
    cpu.set_memory(mem.total, mem.free);
    cpu.free_swap = mem.free_swap;
    debug!(
        total = %human_bytes(cpu.total_memory),
        free = %human_bytes(cpu.free_memory),
        free_swap = %human_bytes(cpu.free_swap),
        "system memory"
    );
}
