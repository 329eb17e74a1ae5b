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

//! GPU backend using wgpu compute shaders.

use super::{check_buffer_lengths, ComputeBackend, DispatchShape, DEFAULT_WORKGROUP_SIZE};
use crate::{error::BackendError, DeviceFloat};
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use wgpu::util::DeviceExt;

/// Name of the pipeline-overridable batch size constant in the shader
const WORKGROUP_SIZE_CONSTANT: &str = "workgroup_size";

/// GPU-compatible uniform parameters.
/// Padded to 16 bytes to satisfy uniform buffer layout rules.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct GpuParams {
    n: u32,
    _pad: [u32; 3],
}

/// Storage buffer of `f32` on the GPU
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    len: usize,
}

/// Compiled shader module with one pipeline per work batch size
pub struct GpuKernel {
    module: wgpu::ShaderModule,
    entry_point: String,
    pipelines: Mutex<HashMap<u32, wgpu::ComputePipeline>>,
}

/// GPU backend running the WGSL kernel through wgpu.
pub struct GpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    // Mutex for serializing GPU submissions (wgpu doesn't handle concurrent submissions well)
    submit_lock: Mutex<()>,
}

impl GpuBackend {
    /// Check if a GPU is available for compute.
    pub fn is_available() -> bool {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .is_some()
    }

    /// Acquire an adapter and device
    pub fn new() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| BackendError::Device("Failed to find a suitable GPU adapter".into()))?;

        log::info!("Using GPU adapter: {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Thomson GPU"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|err| BackendError::Device(err.to_string()))?;

        let storage_entry = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Pair Distance Bind Group Layout"),
            entries: &[
                // Points (input)
                storage_entry(0, true),
                // Distance sums (output)
                storage_entry(1, false),
                // Params
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Pair Distance Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            bind_group_layout,
            pipeline_layout,
            submit_lock: Mutex::new(()),
        })
    }

    /// Build a pipeline for `entry_point` with the given batch size, capturing validation errors
    fn create_pipeline(
        &self,
        module: &wgpu::ShaderModule,
        entry_point: &str,
        local: u32,
    ) -> Result<wgpu::ComputePipeline, BackendError> {
        let constants = HashMap::from([(WORKGROUP_SIZE_CONSTANT.to_string(), local as f64)]);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("Pair Distance Pipeline"),
                layout: Some(&self.pipeline_layout),
                module,
                entry_point: Some(entry_point),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    zero_initialize_workgroup_memory: true,
                },
                cache: None,
            });
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(BackendError::Compile {
                entry_point: entry_point.to_string(),
                message: err.to_string(),
            }),
            None => Ok(pipeline),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, BackendError> {
        self.submit_lock
            .lock()
            .map_err(|_| BackendError::Device("GPU submission lock poisoned".into()))
    }
}

impl ComputeBackend for GpuBackend {
    type Kernel = GpuKernel;
    type Buffer = GpuBuffer;

    fn name(&self) -> &str {
        "gpu"
    }

    fn compile(&self, source: &str, entry_point: &str) -> Result<GpuKernel, BackendError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("Pair Distance Shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Compile {
                entry_point: entry_point.to_string(),
                message: err.to_string(),
            });
        }
        // Building the default pipeline also verifies the entry point
        let pipeline = self.create_pipeline(&module, entry_point, DEFAULT_WORKGROUP_SIZE)?;
        log::debug!("Compiled GPU kernel '{entry_point}'");
        Ok(GpuKernel {
            module,
            entry_point: entry_point.to_string(),
            pipelines: Mutex::new(HashMap::from([(DEFAULT_WORKGROUP_SIZE, pipeline)])),
        })
    }

    fn upload(&self, host: &[DeviceFloat]) -> Result<GpuBuffer, BackendError> {
        let len = host.len();
        let size = std::mem::size_of_val(host) as u64;
        let max_size = self.device.limits().max_storage_buffer_binding_size as u64;
        if size > max_size {
            return Err(BackendError::Allocation {
                len,
                message: format!("{size} bytes exceeds storage buffer limit of {max_size}"),
            });
        }
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Storage"),
                contents: bytemuck::cast_slice(host),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::Allocation {
                len,
                message: err.to_string(),
            });
        }
        Ok(GpuBuffer { buffer, len })
    }

    fn invoke(
        &self,
        kernel: &GpuKernel,
        shape: DispatchShape,
        points: &GpuBuffer,
        result: &mut GpuBuffer,
        n: u32,
    ) -> Result<(), BackendError> {
        shape.validate(self.max_workgroup_size())?;
        let max_workgroups = self.device.limits().max_compute_workgroups_per_dimension;
        if shape.workgroups() > max_workgroups {
            return Err(BackendError::Dispatch {
                local: shape.local,
                global: shape.global,
                message: format!("more than {max_workgroups} work batches"),
            });
        }
        check_buffer_lengths(shape, points.len, result.len, n)?;

        // Acquire lock to serialize GPU submissions
        let _lock = self.lock()?;

        let mut pipelines = kernel
            .pipelines
            .lock()
            .map_err(|_| BackendError::Device("pipeline cache lock poisoned".into()))?;
        if !pipelines.contains_key(&shape.local) {
            let pipeline = self.create_pipeline(&kernel.module, &kernel.entry_point, shape.local)?;
            pipelines.insert(shape.local, pipeline);
        }
        let pipeline = &pipelines[&shape.local];

        let params = GpuParams { n, _pad: [0; 3] };
        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Params"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Pair Distance Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: points.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: result.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Compute Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Pair Distance Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(shape.workgroups(), 1, 1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        log::trace!(
            "Submitted '{}' on {} batches of {} lanes",
            kernel.entry_point,
            shape.workgroups(),
            shape.local
        );
        Ok(())
    }

    fn download(&self, handle: &GpuBuffer, host: &mut [DeviceFloat]) -> Result<(), BackendError> {
        if host.len() > handle.len {
            return Err(BackendError::Device(format!(
                "cannot read {} elements from buffer of {}",
                host.len(),
                handle.len
            )));
        }
        if host.is_empty() {
            return Ok(());
        }
        let size = std::mem::size_of_val(host) as u64;
        let _lock = self.lock()?;

        // Create staging buffer for readback
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(&handle.buffer, 0, &staging_buffer, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        // Block until the copy, and all earlier dispatches, have completed
        let slice = staging_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |status| {
            let _ = sender.send(status);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|err| BackendError::Device(err.to_string()))?
            .map_err(|err| BackendError::Device(err.to_string()))?;

        let data = slice.get_mapped_range();
        host.copy_from_slice(bytemuck::cast_slice(&data));
        drop(data);
        staging_buffer.unmap();
        Ok(())
    }

    fn max_workgroup_size(&self) -> u32 {
        let limits = self.device.limits();
        limits
            .max_compute_workgroup_size_x
            .min(limits.max_compute_invocations_per_workgroup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{KERNEL_ENTRY_POINT, KERNEL_SOURCE};
    use crate::{energy::reference_energies, sampler};
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_gpu_matches_reference() {
        if !GpuBackend::is_available() {
            eprintln!("No GPU adapter; skipping");
            return;
        }
        let backend = GpuBackend::new().unwrap();
        let kernel = backend.compile(KERNEL_SOURCE, KERNEL_ENTRY_POINT).unwrap();
        let config = sampler::generate(100, &mut StdRng::seed_from_u64(5));
        let points = backend.upload(config.as_flat()).unwrap();
        let mut result = backend.upload(&[0.0; 100]).unwrap();
        // 128 lanes for 100 points: the last 28 lanes are padding
        backend
            .invoke(&kernel, DispatchShape::covering(100, 64), &points, &mut result, 100)
            .unwrap();
        let mut host = vec![0.0; 100];
        backend.download(&result, &mut host).unwrap();
        for (gpu, reference) in host.iter().zip(reference_energies(&config)) {
            assert_relative_eq!(*gpu as f64, reference, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_gpu_compile_errors() {
        if !GpuBackend::is_available() {
            return;
        }
        let backend = GpuBackend::new().unwrap();
        assert!(matches!(
            backend.compile("this is not wgsl", KERNEL_ENTRY_POINT),
            Err(BackendError::Compile { .. })
        ));
        assert!(matches!(
            backend.compile(KERNEL_SOURCE, "missing_entry_point"),
            Err(BackendError::Compile { .. })
        ));
    }
}
