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

//! CPU backend running work batches on the rayon thread pool.

use super::{check_buffer_lengths, host_kernel, ComputeBackend, DispatchShape, LaneFn};
use crate::{error::BackendError, DeviceFloat};
use rayon::prelude::*;

/// Buffer "on device" for the host backends; a plain vector in main memory.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostBuffer(pub(crate) Vec<DeviceFloat>);

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[DeviceFloat] {
        &self.0
    }
}

/// Copy `host` into a freshly allocated buffer, honouring an optional element limit
pub(super) fn upload_host(
    host: &[DeviceFloat],
    max_buffer_len: Option<usize>,
) -> Result<HostBuffer, BackendError> {
    let len = host.len();
    if let Some(max_len) = max_buffer_len.filter(|max_len| len > *max_len) {
        return Err(BackendError::Allocation {
            len,
            message: format!("exceeds buffer limit of {max_len} elements"),
        });
    }
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|err| BackendError::Allocation {
            len,
            message: err.to_string(),
        })?;
    data.extend_from_slice(host);
    Ok(HostBuffer(data))
}

pub(super) fn download_host(
    handle: &HostBuffer,
    host: &mut [DeviceFloat],
) -> Result<(), BackendError> {
    let src = handle.0.get(..host.len()).ok_or_else(|| {
        BackendError::Device(format!(
            "cannot read {} elements from buffer of {}",
            host.len(),
            handle.len()
        ))
    })?;
    host.copy_from_slice(src);
    Ok(())
}

/// Compiled host kernel
#[derive(Clone, Debug)]
pub struct CpuKernel {
    entry_point: String,
    lane: LaneFn,
}

/// CPU backend for the pair-distance kernel.
///
/// Each work batch becomes a rayon task and its lanes run sequentially
/// within that task. A lane writes only its own result slot.
#[derive(Clone, Debug)]
pub struct CpuBackend {
    /// Largest accepted work batch
    max_workgroup_size: u32,
    /// Optional cap on buffer length (elements), emulating device memory
    max_buffer_len: Option<usize>,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self {
            max_workgroup_size: 1024,
            max_buffer_len: None,
        }
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        log::info!(
            "CPU backend initialized with {} rayon threads",
            rayon::current_num_threads()
        );
        Self::default()
    }

    /// Limit the size of uploaded buffers; larger uploads fail with an allocation error
    pub fn with_buffer_limit(mut self, max_buffer_len: usize) -> Self {
        self.max_buffer_len = Some(max_buffer_len);
        self
    }

    /// Limit the number of lanes per work batch
    pub fn with_max_workgroup_size(mut self, max_workgroup_size: u32) -> Self {
        self.max_workgroup_size = max_workgroup_size.max(1);
        self
    }
}

impl ComputeBackend for CpuBackend {
    type Kernel = CpuKernel;
    type Buffer = HostBuffer;

    fn name(&self) -> &str {
        "cpu"
    }

    fn compile(&self, source: &str, entry_point: &str) -> Result<CpuKernel, BackendError> {
        let lane = host_kernel(source, entry_point)?;
        log::debug!("Resolved host kernel '{entry_point}'");
        Ok(CpuKernel {
            entry_point: entry_point.to_string(),
            lane,
        })
    }

    fn upload(&self, host: &[DeviceFloat]) -> Result<HostBuffer, BackendError> {
        upload_host(host, self.max_buffer_len)
    }

    fn invoke(
        &self,
        kernel: &CpuKernel,
        shape: DispatchShape,
        points: &HostBuffer,
        result: &mut HostBuffer,
        n: u32,
    ) -> Result<(), BackendError> {
        shape.validate(self.max_workgroup_size)?;
        check_buffer_lengths(shape, points.len(), result.len(), n)?;
        log::trace!(
            "Dispatching '{}' on {} batches of {} lanes",
            kernel.entry_point,
            shape.workgroups(),
            shape.local
        );
        let local = shape.local as usize;
        let lanes = (shape.global as usize).min(result.len());
        let (points, n) = (points.as_slice(), n as usize);
        result.0[..lanes]
            .par_chunks_mut(local)
            .enumerate()
            .for_each(|(group_id, slots)| {
                for (local_id, slot) in slots.iter_mut().enumerate() {
                    if let Some(value) = (kernel.lane)(points, n, group_id * local + local_id) {
                        *slot = value;
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
    use crate::backend::{KERNEL_ENTRY_POINT, KERNEL_SOURCE};
    use approx::assert_relative_eq;

    #[test]
    fn test_two_antipodal_points() {
        let backend = CpuBackend::default();
        let kernel = backend.compile(KERNEL_SOURCE, KERNEL_ENTRY_POINT).unwrap();
        let points = backend.upload(&[0.0, 0.0, 1.0, 0.0, 0.0, -1.0]).unwrap();
        let mut result = backend.upload(&[0.0; 2]).unwrap();
        backend
            .invoke(&kernel, DispatchShape::reference(2), &points, &mut result, 2)
            .unwrap();
        let mut host = [0.0; 2];
        backend.download(&result, &mut host).unwrap();
        assert_relative_eq!(host[0], 2.0);
        assert_relative_eq!(host[1], 2.0);
    }

    #[test]
    fn test_padding_lanes_leave_buffer_untouched() {
        // Result buffer is longer than n; slots past n must keep their sentinel
        const SENTINEL: f32 = -7.0;
        let backend = CpuBackend::default();
        let kernel = backend.compile(KERNEL_SOURCE, KERNEL_ENTRY_POINT).unwrap();
        let points = backend
            .upload(&[1.0, 0.0, 0.0, -1.0, 0.0, 0.0, 0.0, 1.0, 0.0])
            .unwrap();
        let mut result = backend.upload(&[SENTINEL; 8]).unwrap();
        backend
            .invoke(&kernel, DispatchShape::covering(3, 4), &points, &mut result, 3)
            .unwrap();
        let host = result.as_slice();
        assert_relative_eq!(host[0], 2.0 + 2f32.sqrt(), epsilon = 1e-6);
        assert_relative_eq!(host[2], 2.0 * 2f32.sqrt(), epsilon = 1e-6);
        assert!(host[3..].iter().all(|x| *x == SENTINEL));
    }

    #[test]
    fn test_dispatch_errors() {
        let backend = CpuBackend::default().with_max_workgroup_size(4);
        let kernel = backend.compile(KERNEL_SOURCE, KERNEL_ENTRY_POINT).unwrap();
        let points = backend.upload(&[0.0; 12]).unwrap();
        let mut result = backend.upload(&[0.0; 4]).unwrap();
        for shape in [DispatchShape::new(3, 4), DispatchShape::new(8, 8)] {
            let err = backend
                .invoke(&kernel, shape, &points, &mut result, 4)
                .unwrap_err();
            assert!(matches!(err, BackendError::Dispatch { .. }));
        }
        // result buffer shorter than n
        let mut short = backend.upload(&[0.0; 2]).unwrap();
        assert!(backend
            .invoke(&kernel, DispatchShape::new(4, 4), &points, &mut short, 4)
            .is_err());
    }

    #[test]
    fn test_allocation_limit() {
        let backend = CpuBackend::default().with_buffer_limit(6);
        assert!(backend.upload(&[0.0; 6]).is_ok());
        assert!(matches!(
            backend.upload(&[0.0; 7]),
            Err(BackendError::Allocation { len: 7, .. })
        ));
    }

    #[test]
    fn test_download_bounds() {
        let backend = CpuBackend::default();
        let buffer = backend.upload(&[1.0, 2.0, 3.0]).unwrap();
        let mut host = [0.0; 2];
        backend.download(&buffer, &mut host).unwrap();
        assert_eq!(host, [1.0, 2.0]);
        let mut too_long = [0.0; 4];
        assert!(matches!(
            backend.download(&buffer, &mut too_long),
            Err(BackendError::Device(_))
        ));
    }
}
