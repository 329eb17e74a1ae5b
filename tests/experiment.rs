// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

use std::sync::atomic::{AtomicUsize, Ordering};
use thomson::{
    backend::{ComputeBackend, CpuBackend, DispatchShape, HostBuffer, SimdBackend},
    run_experiment, run_experiment_cpu, BackendError, ExperimentConfig, ThomsonError,
};

/// CPU backend counting every call made to it
#[derive(Default)]
struct CountingBackend {
    inner: CpuBackend,
    calls: AtomicUsize,
}

impl CountingBackend {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl ComputeBackend for CountingBackend {
    type Kernel = <CpuBackend as ComputeBackend>::Kernel;
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "counting"
    }

    fn compile(&self, source: &str, entry_point: &str) -> Result<Self::Kernel, BackendError> {
        self.count();
        self.inner.compile(source, entry_point)
    }

    fn upload(&self, host: &[f32]) -> Result<HostBuffer, BackendError> {
        self.count();
        self.inner.upload(host)
    }

    fn invoke(
        &self,
        kernel: &Self::Kernel,
        shape: DispatchShape,
        points: &HostBuffer,
        result: &mut HostBuffer,
        n: u32,
    ) -> Result<(), BackendError> {
        self.count();
        self.inner.invoke(kernel, shape, points, result, n)
    }

    fn download(&self, handle: &HostBuffer, host: &mut [f32]) -> Result<(), BackendError> {
        self.count();
        self.inner.download(handle, host)
    }
}

fn seeded(points: i64, iterations: i64, seed: u64) -> ExperimentConfig {
    ExperimentConfig {
        seed: Some(seed),
        ..ExperimentConfig::new(points, iterations)
    }
}

#[test]
fn test_history_length_and_minimum() {
    let result = run_experiment_cpu(12, 8).unwrap();
    assert_eq!(result.energies.len(), 8);
    let min = result.energies.iter().copied().fold(f64::INFINITY, f64::min);
    assert_eq!(result.min_energy, min);
    assert!(result.energies.iter().all(|e| e.is_finite() && *e > 0.0));
}

#[test]
fn test_fixed_seed_is_reproducible() {
    let config = seeded(16, 5, 42);
    let first = run_experiment(&CpuBackend::default(), &config).unwrap();
    let second = run_experiment(&CpuBackend::default(), &config).unwrap();
    assert_eq!(first, second);

    let other = run_experiment(&CpuBackend::default(), &seeded(16, 5, 43)).unwrap();
    assert_ne!(first.energies, other.energies);
}

#[test]
fn test_backends_agree() {
    let config = seeded(40, 6, 7);
    let cpu = run_experiment(&CpuBackend::default(), &config).unwrap();
    let simd = run_experiment(&SimdBackend::default(), &config).unwrap();
    assert_eq!(cpu.energies.len(), simd.energies.len());
    // Identical starting points; later iterations may drift apart by rounding only
    for (a, b) in cpu.energies.iter().zip(&simd.energies) {
        approx::assert_relative_eq!(*a, *b, max_relative = 1e-3);
    }
    approx::assert_relative_eq!(cpu.min_energy, simd.min_energy, max_relative = 1e-3);
}

#[test]
fn test_invalid_counts_touch_no_backend() {
    let backend = CountingBackend::default();
    for (points, iterations) in [(0, 5), (-1, 5), (3, -2)] {
        let result = run_experiment(&backend, &ExperimentConfig::new(points, iterations));
        assert!(matches!(result, Err(ThomsonError::InvalidInput(_))));
    }
    assert_eq!(backend.calls(), 0);
}

#[test]
fn test_backend_calls_per_iteration() {
    // compile and result allocation once, then upload, invoke and download per iteration
    let backend = CountingBackend::default();
    run_experiment(&backend, &seeded(5, 4, 1)).unwrap();
    assert_eq!(backend.calls(), 2 + 3 * 4);
}

#[test]
fn test_allocation_failure_is_fatal() {
    let backend = CpuBackend::default().with_buffer_limit(16);
    let result = run_experiment(&backend, &seeded(8, 2, 1));
    assert!(matches!(
        result,
        Err(ThomsonError::Backend(BackendError::Allocation { .. }))
    ));
}
