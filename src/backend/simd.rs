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

//! SIMD backend using the `wide` crate for vectorization.
//!
//! Work batches are distributed over rayon exactly as in the CPU backend, but
//! each lane vectorizes its inner loop over the other points.
//! The SIMD width is selected at compile time based on target architecture:
//! - x86_64: f32x8 (AVX2, 256-bit, 8 lanes)
//! - aarch64: f32x4 (NEON, 128-bit, 4 lanes)
//!
//! Points are transposed to a structure-of-arrays layout once per dispatch.

use super::cpu::{download_host, upload_host};
use super::{
    check_buffer_lengths, host_kernel, ComputeBackend, DispatchShape, HostBuffer,
    KERNEL_ENTRY_POINT,
};
use crate::{error::BackendError, DeviceFloat};
use rayon::prelude::*;

// Compile-time SIMD configuration based on target architecture
#[cfg(target_arch = "aarch64")]
mod simd_config {
    pub use wide::f32x4 as SimdFloat;
    pub const LANES: usize = 4;
    pub type SimdArray = [f32; 4];

    #[inline]
    pub fn simd_new(arr: SimdArray) -> SimdFloat {
        SimdFloat::new(arr)
    }

    #[inline]
    pub fn simd_to_array(v: SimdFloat) -> SimdArray {
        v.into()
    }
}

#[cfg(not(target_arch = "aarch64"))]
mod simd_config {
    pub use wide::f32x8 as SimdFloat;
    pub const LANES: usize = 8;
    pub type SimdArray = [f32; 8];

    #[inline]
    pub fn simd_new(arr: SimdArray) -> SimdFloat {
        SimdFloat::new(arr)
    }

    #[inline]
    pub fn simd_to_array(v: SimdFloat) -> SimdArray {
        v.into()
    }
}

use simd_config::{simd_new, simd_to_array, SimdArray, SimdFloat, LANES};

/// Point coordinates in structure-of-arrays layout
struct SoaPoints {
    x: Vec<f32>,
    y: Vec<f32>,
    z: Vec<f32>,
}

impl SoaPoints {
    fn from_flat(flat: &[f32], n: usize) -> Self {
        let mut soa = Self {
            x: Vec::with_capacity(n),
            y: Vec::with_capacity(n),
            z: Vec::with_capacity(n),
        };
        for p in flat[..3 * n].chunks_exact(3) {
            soa.x.push(p[0]);
            soa.y.push(p[1]);
            soa.z.push(p[2]);
        }
        soa
    }

    #[inline]
    fn load(coords: &[f32], j: usize) -> SimdFloat {
        let mut arr: SimdArray = [0.0f32; LANES];
        arr.copy_from_slice(&coords[j..j + LANES]);
        simd_new(arr)
    }

    /// Distance sum from point `i` to all points.
    ///
    /// The self term is included but contributes exactly zero.
    fn distance_sum(&self, i: usize) -> f32 {
        let n = self.x.len();
        let (xi, yi, zi) = (self.x[i], self.y[i], self.z[i]);
        let (sx, sy, sz) = (
            SimdFloat::splat(xi),
            SimdFloat::splat(yi),
            SimdFloat::splat(zi),
        );

        // Process LANES points at a time with full SIMD
        let mut acc = SimdFloat::ZERO;
        let mut j = 0;
        while j + LANES <= n {
            let dx = sx - Self::load(&self.x, j);
            let dy = sy - Self::load(&self.y, j);
            let dz = sz - Self::load(&self.z, j);
            acc = acc + (dx * dx + dy * dy + dz * dz).sqrt();
            j += LANES;
        }
        let mut total: f32 = simd_to_array(acc).iter().sum();

        // Handle remainder points (scalar)
        while j < n {
            let (dx, dy, dz) = (xi - self.x[j], yi - self.y[j], zi - self.z[j]);
            total += (dx * dx + dy * dy + dz * dz).sqrt();
            j += 1;
        }
        total
    }
}

/// Compiled SIMD kernel
#[derive(Clone, Debug)]
pub struct SimdKernel {
    entry_point: String,
}

/// SIMD backend for the pair-distance kernel.
///
/// Uses compile-time selected SIMD width: 8 lanes (AVX2) on x86_64,
/// 4 lanes (NEON) on aarch64.
#[derive(Clone, Debug)]
pub struct SimdBackend {
    max_workgroup_size: u32,
    max_buffer_len: Option<usize>,
}

impl Default for SimdBackend {
    fn default() -> Self {
        Self {
            max_workgroup_size: 1024,
            max_buffer_len: None,
        }
    }
}

impl SimdBackend {
    pub fn new() -> Self {
        #[cfg(target_arch = "aarch64")]
        let simd_type = "NEON (f32x4)";
        #[cfg(not(target_arch = "aarch64"))]
        let simd_type = "AVX2 (f32x8)";

        log::info!(
            "SIMD backend initialized ({}) with {} rayon threads",
            simd_type,
            rayon::current_num_threads()
        );
        Self::default()
    }

    /// Limit the size of uploaded buffers; larger uploads fail with an allocation error
    pub fn with_buffer_limit(mut self, max_buffer_len: usize) -> Self {
        self.max_buffer_len = Some(max_buffer_len);
        self
    }
}

impl ComputeBackend for SimdBackend {
    type Kernel = SimdKernel;
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "simd"
    }

    fn compile(&self, source: &str, entry_point: &str) -> Result<SimdKernel, BackendError> {
        host_kernel(source, entry_point)?;
        if entry_point != KERNEL_ENTRY_POINT {
            return Err(BackendError::Compile {
                entry_point: entry_point.to_string(),
                message: "no vectorized implementation for entry point".to_string(),
            });
        }
        Ok(SimdKernel {
            entry_point: entry_point.to_string(),
        })
    }

    fn upload(&self, host: &[DeviceFloat]) -> Result<HostBuffer, BackendError> {
        upload_host(host, self.max_buffer_len)
    }

    fn invoke(
        &self,
        kernel: &SimdKernel,
        shape: DispatchShape,
        points: &HostBuffer,
        result: &mut HostBuffer,
        n: u32,
    ) -> Result<(), BackendError> {
        shape.validate(self.max_workgroup_size)?;
        check_buffer_lengths(shape, points.len(), result.len(), n)?;
        log::trace!(
            "Dispatching '{}' on {} batches of {} lanes ({} wide)",
            kernel.entry_point,
            shape.workgroups(),
            shape.local,
            LANES
        );
        let n = n as usize;
        let local = shape.local as usize;
        let lanes = (shape.global as usize).min(result.len());
        let soa = SoaPoints::from_flat(points.as_slice(), n);
        result.0[..lanes]
            .par_chunks_mut(local)
            .enumerate()
            .for_each(|(group_id, slots)| {
                for (local_id, slot) in slots.iter_mut().enumerate() {
                    let i = group_id * local + local_id;
                    if i < n {
                        *slot = soa.distance_sum(i);
                    }
                }
            });
        Ok(())
    }

    fn download(&self, handle: &HostBuffer, host: &mut [DeviceFloat]) -> Result<(), BackendError> {
        download_host(handle, host)
    }

    fn max_workgroup_size(&self) -> u32 {
        self.max_workgroup_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CpuBackend, KERNEL_SOURCE};
    use crate::sampler;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    /// Run the kernel on `backend` and return the first `n` results
    fn dispatch<B: ComputeBackend>(backend: &B, flat: &[f32], n: usize, local: u32) -> Vec<f32> {
        let kernel = backend.compile(KERNEL_SOURCE, KERNEL_ENTRY_POINT).unwrap();
        let points = backend.upload(flat).unwrap();
        let mut result = backend.upload(&vec![0.0; n]).unwrap();
        let shape = DispatchShape::covering(n, local);
        backend
            .invoke(&kernel, shape, &points, &mut result, n as u32)
            .unwrap();
        let mut host = vec![0.0; n];
        backend.download(&result, &mut host).unwrap();
        host
    }

    #[test]
    fn test_simd_matches_cpu() {
        // Sizes around multiples of the SIMD width exercise the scalar remainder
        let mut rng = StdRng::seed_from_u64(11);
        for n in [1, 2, 3, LANES - 1, LANES, LANES + 1, 2 * LANES + 3, 100] {
            let config = sampler::generate(n, &mut rng);
            let simd = dispatch(&SimdBackend::default(), config.as_flat(), n, 16);
            let cpu = dispatch(&CpuBackend::default(), config.as_flat(), n, 16);
            for (a, b) in simd.iter().zip(&cpu) {
                assert_relative_eq!(*a, *b, max_relative = 1e-5);
            }
        }
    }

    #[test]
    fn test_unknown_entry_point() {
        let backend = SimdBackend::default();
        assert!(matches!(
            backend.compile(KERNEL_SOURCE, "energy_kernel"),
            Err(BackendError::Compile { .. })
        ));
    }
}
