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

//! Compute backend abstraction for the pair-distance kernel.
//!
//! A backend compiles kernel source, moves `f32` buffers to and from its own
//! memory space, and dispatches a grid of parallel lanes grouped in work batches.
//! Implementations:
//! - `CpuBackend`: one rayon task per work batch
//! - `SimdBackend`: as the CPU backend, with the inner loop vectorized using `wide`
//! - `GpuBackend`: wgpu compute shader (requires the `gpu` feature)

mod cpu;
#[cfg(feature = "gpu")]
mod gpu;
mod simd;

pub use cpu::{CpuBackend, HostBuffer};
#[cfg(feature = "gpu")]
pub use gpu::GpuBackend;
pub use simd::SimdBackend;

use crate::{error::BackendError, DeviceFloat};

/// WGSL source of the per-point distance sum kernel
pub const KERNEL_SOURCE: &str = include_str!("../../shaders/pair_distance_sum.wgsl");

/// Entry point of [`KERNEL_SOURCE`]
pub const KERNEL_ENTRY_POINT: &str = "pair_distance_sum";

/// Work batch size used when nothing else is requested
pub const DEFAULT_WORKGROUP_SIZE: u32 = 64;

/// Shape of a one-dimensional dispatch: `global` lanes in batches of `local`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchShape {
    /// Lanes per work batch
    pub local: u32,
    /// Total number of lanes
    pub global: u32,
}

impl DispatchShape {
    pub const fn new(local: u32, global: u32) -> Self {
        Self { local, global }
    }

    /// Smallest grid of `local`-sized batches with at least `n` lanes.
    ///
    /// Lanes past `n` are padding and must be no-ops in the kernel.
    pub fn covering(n: usize, local: u32) -> Self {
        let local = local.max(1);
        let workgroups = (n as u32).div_ceil(local).max(1);
        Self {
            local,
            global: workgroups * local,
        }
    }

    /// Two batches of n/2 lanes each, covering exactly n lanes without padding.
    ///
    /// Only valid for even `n`; for odd `n` the batch size does not divide the grid.
    pub fn reference(n: usize) -> Self {
        Self {
            local: (n as u32 / 2).max(1),
            global: n as u32,
        }
    }

    /// Number of work batches
    pub const fn workgroups(&self) -> u32 {
        if self.local == 0 {
            0
        } else {
            self.global / self.local
        }
    }

    /// Check the shape against a device's batch size limit
    pub fn validate(&self, max_local: u32) -> Result<(), BackendError> {
        let fail = |message: String| {
            Err(BackendError::Dispatch {
                local: self.local,
                global: self.global,
                message,
            })
        };
        if self.local == 0 || self.global == 0 {
            return fail("empty work batch or grid".into());
        }
        if self.global % self.local != 0 {
            return fail("batch size does not divide the grid".into());
        }
        if self.local > max_local {
            return fail(format!("batch size exceeds device limit of {max_local}"));
        }
        Ok(())
    }
}

/// A parallel compute device running the pair-distance kernel.
///
/// All buffers hold `f32` (see [`DeviceFloat`]). Calls are blocking: when
/// `download` returns, every lane of previous `invoke` calls has finished.
pub trait ComputeBackend: Send + Sync {
    /// Compiled, ready to dispatch kernel
    type Kernel: Send + Sync;
    /// Handle to a buffer living in the backend's memory space
    type Buffer: Send + Sync;

    /// Short human readable name used in logs
    fn name(&self) -> &str;

    /// Compile `source` and select `entry_point`
    fn compile(&self, source: &str, entry_point: &str) -> Result<Self::Kernel, BackendError>;

    /// Copy a host buffer to the device
    fn upload(&self, host: &[DeviceFloat]) -> Result<Self::Buffer, BackendError>;

    /// Run `kernel` over `shape` with the point buffer, the result buffer and the point count.
    ///
    /// Each lane `i < n` writes `result[i]`; all other lanes do nothing.
    fn invoke(
        &self,
        kernel: &Self::Kernel,
        shape: DispatchShape,
        points: &Self::Buffer,
        result: &mut Self::Buffer,
        n: u32,
    ) -> Result<(), BackendError>;

    /// Copy the first `host.len()` elements of a device buffer back to the host
    fn download(&self, handle: &Self::Buffer, host: &mut [DeviceFloat])
        -> Result<(), BackendError>;

    /// Largest allowed work batch
    fn max_workgroup_size(&self) -> u32 {
        256
    }
}

/// Signature of a host-side kernel lane: `(points, n, i) -> value`, `None` for padding lanes
pub(crate) type LaneFn = fn(&[DeviceFloat], usize, usize) -> Option<DeviceFloat>;

/// Kernels with a native host implementation, by entry point name
const HOST_KERNELS: &[(&str, LaneFn)] = &[(KERNEL_ENTRY_POINT, pair_distance_sum_lane as LaneFn)];

/// Resolve a host-side implementation for `entry_point`.
///
/// The entry point must be declared as a compute function in `source` and
/// have a native counterpart, mirroring what a shader compiler would reject.
pub(crate) fn host_kernel(source: &str, entry_point: &str) -> Result<LaneFn, BackendError> {
    let compile_error = |message: &str| BackendError::Compile {
        entry_point: entry_point.to_string(),
        message: message.to_string(),
    };
    if !source.contains("@compute") {
        return Err(compile_error("source declares no compute entry point"));
    }
    if !source.contains(&format!("fn {entry_point}(")) {
        return Err(compile_error("entry point not found in source"));
    }
    HOST_KERNELS
        .iter()
        .find(|(name, _)| *name == entry_point)
        .map(|(_, lane)| *lane)
        .ok_or_else(|| compile_error("no host implementation for entry point"))
}

/// One lane of the distance sum kernel: Σ_{j≠i} |p_i - p_j|.
///
/// Returns `None` when `i` is a padding lane (`i >= n`).
pub(crate) fn pair_distance_sum_lane(
    points: &[DeviceFloat],
    n: usize,
    i: usize,
) -> Option<DeviceFloat> {
    if i >= n {
        return None;
    }
    let (xi, yi, zi) = (points[3 * i], points[3 * i + 1], points[3 * i + 2]);
    let total = points[..3 * n]
        .chunks_exact(3)
        .enumerate()
        .filter(|(j, _)| *j != i)
        .map(|(_, p)| {
            let (dx, dy, dz) = (xi - p[0], yi - p[1], zi - p[2]);
            (dx * dx + dy * dy + dz * dz).sqrt()
        })
        .sum::<DeviceFloat>();
    Some(total)
}

/// Check that the grid has a lane for every point and buffers are large enough for `n` points
pub(crate) fn check_buffer_lengths(
    shape: DispatchShape,
    points_len: usize,
    result_len: usize,
    n: u32,
) -> Result<(), BackendError> {
    if shape.global < n {
        return Err(BackendError::Dispatch {
            local: shape.local,
            global: shape.global,
            message: format!("grid has fewer lanes than {n} points"),
        });
    }
    let n = n as usize;
    if points_len < 3 * n || result_len < n {
        return Err(BackendError::Dispatch {
            local: shape.local,
            global: shape.global,
            message: format!(
                "buffers too small for {n} points ({points_len} coordinates, {result_len} results)"
            ),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_shapes() {
        let shape = DispatchShape::covering(10, 4);
        assert_eq!(shape, DispatchShape::new(4, 12));
        assert_eq!(shape.workgroups(), 3);
        assert!(shape.validate(256).is_ok());

        assert_eq!(DispatchShape::covering(1, 64), DispatchShape::new(64, 64));
        assert_eq!(DispatchShape::covering(128, 64).global, 128);

        let reference = DispatchShape::reference(16);
        assert_eq!(reference, DispatchShape::new(8, 16));
        assert_eq!(reference.workgroups(), 2);
        assert!(reference.validate(256).is_ok());
    }

    #[test]
    fn test_invalid_dispatch_shapes() {
        let is_dispatch_error =
            |shape: DispatchShape| matches!(shape.validate(256), Err(BackendError::Dispatch { .. }));
        assert!(is_dispatch_error(DispatchShape::new(0, 16)));
        assert!(is_dispatch_error(DispatchShape::new(16, 0)));
        assert!(is_dispatch_error(DispatchShape::new(3, 16)));
        assert!(is_dispatch_error(DispatchShape::new(512, 1024)));
        // odd number of points with the reference sizing
        assert!(is_dispatch_error(DispatchShape::reference(5)));
    }

    #[test]
    fn test_grid_must_cover_all_points() {
        let shape = DispatchShape::new(4, 4);
        assert!(check_buffer_lengths(shape, 12, 4, 4).is_ok());
        assert!(matches!(
            check_buffer_lengths(shape, 24, 8, 8),
            Err(BackendError::Dispatch { .. })
        ));
    }

    #[test]
    fn test_host_kernel_lookup() {
        assert!(host_kernel(KERNEL_SOURCE, KERNEL_ENTRY_POINT).is_ok());
        assert!(matches!(
            host_kernel(KERNEL_SOURCE, "no_such_kernel"),
            Err(BackendError::Compile { .. })
        ));
        assert!(matches!(
            host_kernel("fn pair_distance_sum() {}", KERNEL_ENTRY_POINT),
            Err(BackendError::Compile { .. })
        ));
        // declared in source but without a host counterpart
        let source = "@compute @workgroup_size(1) fn other_kernel() {}";
        assert!(host_kernel(source, "other_kernel").is_err());
    }

    #[test]
    fn test_padding_lane_is_noop() {
        let points = [1.0, 0.0, 0.0, -1.0, 0.0, 0.0];
        assert_eq!(pair_distance_sum_lane(&points, 2, 0), Some(2.0));
        assert_eq!(pair_distance_sum_lane(&points, 2, 1), Some(2.0));
        assert_eq!(pair_distance_sum_lane(&points, 2, 2), None);
        assert_eq!(pair_distance_sum_lane(&points, 2, 1000), None);
    }
}
