//! # riff-discover
//!
//! Hardware discovery for the riff inference host.
//!
//! Finds NVIDIA (CUDA) and AMD (ROCm) GPUs by loading the vendor runtime
//! libraries at run time, so the binary carries no link-time dependency on
//! either toolkit. The host CPU is always present as a fallback device.
//!
//! Discovery state lives in a [`DiscoveryCache`] owned by the caller. The
//! first snapshot enumerates devices; later snapshots only refresh free
//! memory. A [`Placement`] turns a snapshot into the device set, engine
//! variant and dependency directories handed to a runner.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use riff_discover::{DiscoveryCache, DiscoveryConfig, Placement};
//!
//! let cache = DiscoveryCache::new(DiscoveryConfig::from_env().unwrap_or_default());
//! let snapshot = cache.snapshot();
//! let placement = Placement::choose(&snapshot);
//! println!("running on {} ({})", placement.backend, placement.runner_name());
//! ```

pub mod cache;
pub mod config;
pub mod cpu;
pub mod cuda;
pub mod error;
mod ffi;
pub mod format;
pub mod hardware;
pub mod nvml;
pub mod placement;
pub mod platform;
pub mod probe;
pub mod rocm;
pub mod search;

pub use cache::{BackendProbes, DiscoveryCache};
pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult};
pub use hardware::{Backend, DeviceInfo, SystemSnapshot, Version};
pub use placement::{Placement, visible_devices_env};
pub use probe::{DeviceProbe, GpuLibrary, MemoryReading, ProbeOutcome, ProbeRequest, RawDevice};
