//! Integration tests for the discovery cache.
//!
//! Real vendor libraries are replaced by [`common::fake_probe::FakeProbe`],
//! which scripts what each candidate library reports.
//!
//! ```bash
//! cargo test -p riff-discover --test discovery
//! ```

mod common;

use common::fake_probe::{FakeDevice, FakeLibrarySpec, FakeProbe};
use riff_discover::format::{GIBIBYTE, MEBIBYTE};
use riff_discover::{
    Backend, BackendProbes, DiscoveryCache, DiscoveryConfig, Placement, SystemSnapshot, Version,
};
use std::collections::BTreeSet;
use std::sync::Arc;

fn config() -> DiscoveryConfig {
    DiscoveryConfig::default()
        .with_install_dir("/opt/riff/lib")
        .with_minimum_compute(Backend::Cuda, Version::new(6, 0))
}

fn cuda_chain(probes: Vec<&FakeProbe>) -> BackendProbes {
    BackendProbes::new(Backend::Cuda, probes.into_iter().map(|p| p.clone().into_arc()).collect())
}

fn ids(snapshot: &SystemSnapshot) -> (BTreeSet<String>, BTreeSet<String>) {
    (
        snapshot.gpus.iter().map(|g| g.id.clone()).collect(),
        snapshot.unsupported_gpus.iter().map(|g| g.id.clone()).collect(),
    )
}

fn mixed_cuda() -> FakeProbe {
    FakeProbe::new(Backend::Cuda, "fake-cuda")
        .minimum_memory(457 * MEBIBYTE)
        .dependency_dir("/opt/riff/lib/cuda_v12")
        .library(
            "/usr/lib/libcuda.so.1",
            FakeLibrarySpec::Devices(vec![
                FakeDevice::new("GPU-new", Version::new(8, 6), 24 * GIBIBYTE, 20 * GIBIBYTE),
                FakeDevice::new("GPU-old", Version::new(5, 2), 4 * GIBIBYTE, 3 * GIBIBYTE),
                FakeDevice::new("GPU-edge", Version::new(6, 0), 8 * GIBIBYTE, 6 * GIBIBYTE),
            ]),
        )
}

// ─────────────────────────────────────────────────────────────────────────────
// § 1  Membership and memory invariants
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn accepted_and_unsupported_follow_minimum_compute() {
    let probe = mixed_cuda();
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);
    let snapshot = cache.snapshot();

    let minimum = Version::new(6, 0);
    assert_eq!(snapshot.gpus.len(), 2);
    assert!(snapshot.gpus.iter().all(|g| g.compute.expect("gpu compute") >= minimum));
    assert_eq!(snapshot.unsupported_gpus.len(), 1);
    assert!(snapshot.unsupported_gpus.iter().all(|g| g.compute.expect("gpu compute") < minimum));
    for device in snapshot.gpus.iter().chain(&snapshot.unsupported_gpus).chain([&snapshot.cpu]) {
        assert!(device.free_memory <= device.total_memory, "{} free > total", device.id);
    }
}

#[test]
fn compute_five_with_minimum_six_is_unsupported() {
    let probe = FakeProbe::new(Backend::Cuda, "fake-cuda").library(
        "/usr/lib/libcuda.so.1",
        FakeLibrarySpec::Devices(vec![FakeDevice::new("GPU-maxwell", Version::new(5, 0), 4 * GIBIBYTE, 4 * GIBIBYTE)]),
    );
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);
    let snapshot = cache.snapshot();

    assert!(snapshot.gpus.is_empty());
    assert_eq!(snapshot.unsupported_gpus.len(), 1);
    assert_eq!(snapshot.unsupported_gpus[0].id, "GPU-maxwell");
    // no variant is assigned to rejected devices
    assert!(snapshot.unsupported_gpus[0].variant.is_empty());
    assert!(snapshot.unsupported_gpus[0].dependency_paths.is_empty());
}

#[test]
fn accepted_devices_carry_variant_and_dependency_paths() {
    let probe = mixed_cuda();
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);
    let snapshot = cache.snapshot();

    let gpu = snapshot.gpus.iter().find(|g| g.id == "GPU-new").expect("accepted gpu");
    assert_eq!(gpu.variant, "v8");
    assert_eq!(gpu.dependency_paths, vec![std::path::PathBuf::from("/opt/riff/lib/cuda_v12")]);
    assert_eq!(gpu.minimum_memory, 457 * MEBIBYTE);
    assert_eq!(gpu.driver, Some(Version::new(12, 4)));
}

#[test]
fn free_memory_is_clamped_to_total() {
    let probe = FakeProbe::new(Backend::Rocm, "fake-hip").library(
        "/opt/rocm/lib/libamdhip64.so",
        FakeLibrarySpec::Devices(vec![FakeDevice::new("0", Version::new(11, 0), 8 * GIBIBYTE, 9 * GIBIBYTE)]),
    );
    let chain = BackendProbes::new(Backend::Rocm, vec![probe.clone().into_arc()]);
    let cache = DiscoveryCache::with_probes(config(), vec![chain]);

    let snapshot = cache.snapshot();
    assert_eq!(snapshot.gpus[0].free_memory, 8 * GIBIBYTE);

    probe.set_free("0", 12 * GIBIBYTE);
    let snapshot = cache.snapshot();
    assert_eq!(snapshot.gpus[0].free_memory, 8 * GIBIBYTE);
}

// ─────────────────────────────────────────────────────────────────────────────
// § 2  Idempotence and refresh
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn repeated_snapshots_keep_membership() {
    let probe = mixed_cuda();
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);

    let first = cache.snapshot();
    probe.set_free("GPU-new", 10 * GIBIBYTE);
    let second = cache.snapshot();

    assert_eq!(ids(&first), ids(&second));
    let gpu = second.gpus.iter().find(|g| g.id == "GPU-new").expect("gpu");
    assert_eq!(gpu.free_memory, 10 * GIBIBYTE);
}

#[test]
fn refresh_keeps_last_values_on_failure() {
    let probe = mixed_cuda();
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);
    let first = cache.snapshot();

    // zero free is treated as a failed reading
    probe.set_free("GPU-new", 0);
    probe.fail_memory("GPU-edge");
    let second = cache.snapshot();
    for id in ["GPU-new", "GPU-edge"] {
        let before = first.gpus.iter().find(|g| g.id == id).expect("gpu");
        let after = second.gpus.iter().find(|g| g.id == id).expect("gpu");
        assert_eq!(before.free_memory, after.free_memory, "{id}");
    }

    // a library that no longer opens leaves every device in place
    probe.break_libraries();
    let third = cache.snapshot();
    assert_eq!(ids(&first), ids(&third));
    // refresh failures are logged, not accumulated
    assert_eq!(first.discovery_errors, third.discovery_errors);
}

#[test]
fn configured_overhead_is_subtracted() {
    let probe = FakeProbe::new(Backend::Cuda, "fake-cuda").library(
        "/usr/lib/libcuda.so.1",
        FakeLibrarySpec::Devices(vec![FakeDevice::new("GPU-a", Version::new(8, 9), 16 * GIBIBYTE, 10 * GIBIBYTE)]),
    );
    let cache = DiscoveryCache::with_probes(
        config().with_gpu_overhead(GIBIBYTE),
        vec![cuda_chain(vec![&probe])],
    );

    let snapshot = cache.snapshot();
    assert_eq!(snapshot.gpus[0].os_overhead_bytes, GIBIBYTE);
    assert_eq!(snapshot.gpus[0].free_memory, 9 * GIBIBYTE);

    probe.set_free("GPU-a", 12 * GIBIBYTE);
    let snapshot = cache.snapshot();
    assert_eq!(snapshot.gpus[0].free_memory, 11 * GIBIBYTE);
}

#[test]
fn measured_overhead_replaces_configured_overhead() {
    let probe = FakeProbe::new(Backend::Cuda, "fake-cuda").library(
        "/usr/lib/libcuda.so.1",
        FakeLibrarySpec::Devices(vec![
            FakeDevice::new("GPU-managed", Version::new(8, 9), 16 * GIBIBYTE, 10 * GIBIBYTE)
                .measured_overhead(300 * MEBIBYTE),
            FakeDevice::new("GPU-plain", Version::new(8, 9), 16 * GIBIBYTE, 10 * GIBIBYTE),
        ]),
    );
    let cache = DiscoveryCache::with_probes(
        config().with_gpu_overhead(GIBIBYTE),
        vec![cuda_chain(vec![&probe])],
    );
    let gpu = |s: &SystemSnapshot, id: &str| s.gpus.iter().find(|g| g.id == id).cloned().expect("gpu");

    // bootstrap: the measured figure is recorded and free is taken as reported
    let snapshot = cache.snapshot();
    let managed = gpu(&snapshot, "GPU-managed");
    assert_eq!(managed.os_overhead_bytes, 300 * MEBIBYTE);
    assert_eq!(managed.free_memory, 10 * GIBIBYTE);
    let plain = gpu(&snapshot, "GPU-plain");
    assert_eq!(plain.os_overhead_bytes, GIBIBYTE);
    assert_eq!(plain.free_memory, 9 * GIBIBYTE);

    // refresh: accounted readings are not reduced again
    probe.set_free("GPU-managed", 12 * GIBIBYTE);
    probe.set_free("GPU-plain", 12 * GIBIBYTE);
    let snapshot = cache.snapshot();
    assert_eq!(gpu(&snapshot, "GPU-managed").free_memory, 12 * GIBIBYTE);
    assert_eq!(gpu(&snapshot, "GPU-plain").free_memory, 11 * GIBIBYTE);
}

#[test]
fn no_library_handle_outlives_a_snapshot() {
    let probe = mixed_cuda();
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);

    cache.snapshot();
    assert_eq!(probe.open_count(), 0);
    cache.snapshot();
    assert_eq!(probe.open_count(), 0);
    // bootstrap and one refresh, each opening the recorded library once
    assert_eq!(probe.opened_total(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// § 3  Degraded discovery
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn no_vendor_libraries_is_not_an_error() {
    let cuda = FakeProbe::new(Backend::Cuda, "fake-cuda");
    let rocm = FakeProbe::new(Backend::Rocm, "fake-hip");
    let cache = DiscoveryCache::with_probes(
        config(),
        vec![
            cuda_chain(vec![&cuda]),
            BackendProbes::new(Backend::Rocm, vec![rocm.into_arc()]),
        ],
    );
    let snapshot = cache.snapshot();

    assert!(snapshot.cpu.is_cpu());
    assert!(snapshot.gpus.is_empty());
    assert!(snapshot.unsupported_gpus.is_empty());
    assert!(snapshot.discovery_errors.is_empty());
    assert!(cache.is_bootstrapped());
}

#[test]
fn every_backend_failing_leaves_cpu_and_errors() {
    let cuda = FakeProbe::new(Backend::Cuda, "fake-cuda")
        .library("/usr/lib/libcuda.so.1", FakeLibrarySpec::InitFails)
        .library("/usr/lib/libcuda.so.2", FakeLibrarySpec::Devices(vec![]));
    let rocm = FakeProbe::new(Backend::Rocm, "fake-hip")
        .library("/opt/rocm/lib/libamdhip64.so", FakeLibrarySpec::InitFails);
    let cache = DiscoveryCache::with_probes(
        config(),
        vec![
            cuda_chain(vec![&cuda]),
            BackendProbes::new(Backend::Rocm, vec![rocm.into_arc()]),
        ],
    );
    let snapshot = cache.snapshot();

    assert!(snapshot.cpu.is_cpu());
    assert_eq!(snapshot.cpu.id, "0");
    assert!(snapshot.gpus.is_empty());
    assert_eq!(snapshot.discovery_errors.len(), 2);
    assert!(snapshot.discovery_errors[0].contains("no CUDA devices detected"));
    assert!(snapshot.discovery_errors[1].contains("unable to initialize ROCm library"));

    let placement = Placement::choose(&snapshot);
    assert!(placement.is_cpu());
}

#[test]
fn chain_falls_back_to_next_probe() {
    let driver = FakeProbe::new(Backend::Cuda, "fake-nvcuda")
        .library("/usr/lib/libcuda.so.1", FakeLibrarySpec::InitFails);
    let runtime = FakeProbe::new(Backend::Cuda, "fake-cudart").library(
        "/usr/local/cuda/lib64/libcudart.so.12",
        FakeLibrarySpec::Devices(vec![FakeDevice::new("0", Version::new(7, 5), 8 * GIBIBYTE, 7 * GIBIBYTE)]),
    );
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&driver, &runtime])]);
    let snapshot = cache.snapshot();

    assert_eq!(snapshot.gpus.len(), 1);
    assert_eq!(snapshot.discovery_errors.len(), 1);

    // refresh goes straight to the library that found the devices
    runtime.set_free("0", 5 * GIBIBYTE);
    let snapshot = cache.snapshot();
    assert_eq!(snapshot.gpus[0].free_memory, 5 * GIBIBYTE);
    assert_eq!(driver.opened_total(), 0);
}

#[test]
fn device_query_failures_are_accumulated() {
    let probe = FakeProbe::new(Backend::Cuda, "fake-cuda").library(
        "/usr/lib/libcuda.so.1",
        FakeLibrarySpec::Devices(vec![
            FakeDevice::new("GPU-a", Version::new(8, 0), 16 * GIBIBYTE, 16 * GIBIBYTE).broken(),
            FakeDevice::new("GPU-b", Version::new(8, 0), 16 * GIBIBYTE, 16 * GIBIBYTE),
        ]),
    );
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);
    let snapshot = cache.snapshot();

    assert_eq!(snapshot.gpus.len(), 1);
    assert_eq!(snapshot.gpus[0].id, "GPU-b");
    assert_eq!(snapshot.discovery_errors.len(), 1);
    assert!(snapshot.discovery_errors[0].contains("device 0"));
}

#[test]
fn explicit_library_skips_search() {
    let probe = FakeProbe::new(Backend::Cuda, "fake-cuda")
        .library(
            "/usr/lib/libcuda.so.1",
            FakeLibrarySpec::Devices(vec![FakeDevice::new("GPU-a", Version::new(8, 0), GIBIBYTE, GIBIBYTE)]),
        )
        .library(
            "/opt/custom/libcuda.so",
            FakeLibrarySpec::Devices(vec![FakeDevice::new("GPU-b", Version::new(8, 0), GIBIBYTE, GIBIBYTE)]),
        );
    let config = DiscoveryConfig {
        cuda_library: Some("/opt/custom/libcuda.so".into()),
        ..config()
    };
    let cache = DiscoveryCache::with_probes(config, vec![cuda_chain(vec![&probe])]);
    let snapshot = cache.snapshot();

    assert_eq!(snapshot.gpus.len(), 1);
    assert_eq!(snapshot.gpus[0].id, "GPU-b");
}

// ─────────────────────────────────────────────────────────────────────────────
// § 4  Concurrency and serialization
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn async_snapshots_share_one_bootstrap() {
    let probe = mixed_cuda();
    let cache = Arc::new(DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.snapshot_async().await })
        })
        .collect();
    let mut snapshots = Vec::new();
    for task in tasks {
        snapshots.push(task.await.expect("snapshot task").expect("snapshot"));
    }

    for s in &snapshots {
        assert_eq!(ids(s), ids(&snapshots[0]));
    }
    // one bootstrap plus three refreshes
    assert_eq!(probe.opened_total(), 4);
    assert_eq!(probe.open_count(), 0);
}

#[test]
fn cpu_info_bootstraps_once() {
    let probe = mixed_cuda();
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);

    let cpu = cache.cpu_info();
    assert!(cpu.is_cpu());
    assert!(cache.is_bootstrapped());
    cache.cpu_info();
    assert_eq!(probe.opened_total(), 1);
}

#[test]
fn snapshot_serializes_with_launch_field_names() {
    let probe = mixed_cuda();
    let cache = DiscoveryCache::with_probes(config(), vec![cuda_chain(vec![&probe])]);
    let value = serde_json::to_value(cache.snapshot()).expect("serialize");

    for key in ["cpu", "gpus", "unsupportedGpus", "discoveryErrors"] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
    assert_eq!(value["gpus"][0]["backend"], "cuda");
    assert!(value["gpus"][0]["dependencyPaths"].is_array());
    assert_eq!(value["gpus"][0]["computeMajor"], 8);
    assert_eq!(value["gpus"][0]["computeMinor"], 6);
    assert_eq!(value["gpus"][0]["driverMajor"], 12);
    assert!(value["cpu"].get("computeMajor").is_none());
}
