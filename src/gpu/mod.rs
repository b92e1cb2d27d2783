//! GPU compute path: device context, buffer pooling, staged readback.
//!
//! One [`GpuContext`] is created per extractor and shared by every
//! chunk; chunks never share live buffers, but retired buffers return
//! to a size-classed pool so steady-state chunking stops allocating.
//!
//! Author: Moroya Sakamoto

pub mod color;
pub mod extract;
pub mod shaders;

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// GPU path failures. `NoAdapter` selects the CPU engine; the rest are
/// per-chunk dispatch failures retried on the CPU.
#[derive(Debug, Error)]
pub enum GpuError {
    /// No suitable GPU adapter found.
    #[error("No GPU adapter available")]
    NoAdapter,

    /// Device creation failed.
    #[error("Failed to create GPU device: {0}")]
    DeviceCreation(String),

    /// A compute dispatch failed.
    #[error("GPU dispatch failed: {0}")]
    Dispatch(String),

    /// Buffer mapping for readback failed.
    #[error("Failed to map GPU buffer: {0}")]
    BufferMapping(String),
}

/// Shared device, queue, and buffer pool for the extraction pipeline.
#[derive(Debug)]
pub struct GpuContext {
    /// The wgpu device.
    pub device: wgpu::Device,
    /// The submission queue.
    pub queue: wgpu::Queue,
    pool: BufferPool,
}

impl GpuContext {
    /// Acquire an adapter and device. Fails with [`GpuError::NoAdapter`]
    /// when the platform has no usable GPU, which callers treat as
    /// "use the CPU engine".
    pub fn new() -> Result<GpuContext, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(GpuError::NoAdapter)?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("lumen-mesh device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: wgpu::MemoryHints::Performance,
            },
            None,
        ))
        .map_err(|e: wgpu::RequestDeviceError| GpuError::DeviceCreation(e.to_string()))?;

        log::debug!("gpu context ready: {:?}", adapter.get_info().name);

        Ok(GpuContext {
            device,
            queue,
            pool: BufferPool::new(),
        })
    }

    /// Take a pooled buffer of at least `size` bytes with `usage`, or
    /// create one. Returned buffers come back via [`GpuContext::recycle`].
    pub fn acquire_buffer(&self, size: u64, usage: wgpu::BufferUsages, label: &str) -> wgpu::Buffer {
        self.pool.acquire(&self.device, size, usage, label)
    }

    /// Return a buffer to the pool for reuse by a later chunk.
    pub fn recycle(&self, buffer: wgpu::Buffer) {
        self.pool.release(buffer);
    }
}

/// Size-classed free list of idle buffers.
///
/// Sizes round up to powers of two so chunks of slightly different
/// dimensions still share allocations. Buffers are keyed by usage too;
/// a storage buffer never comes back as a staging buffer.
#[derive(Debug, Default)]
struct BufferPool {
    free: Mutex<HashMap<(u64, u32), Vec<wgpu::Buffer>>>,
}

impl BufferPool {
    fn new() -> Self {
        BufferPool::default()
    }

    fn size_class(size: u64) -> u64 {
        size.max(256).next_power_of_two()
    }

    fn acquire(
        &self,
        device: &wgpu::Device,
        size: u64,
        usage: wgpu::BufferUsages,
        label: &str,
    ) -> wgpu::Buffer {
        let class = Self::size_class(size);
        let key = (class, usage.bits());

        if let Ok(mut free) = self.free.lock() {
            if let Some(buffer) = free.get_mut(&key).and_then(Vec::pop) {
                return buffer;
            }
        }

        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: class,
            usage,
            mapped_at_creation: false,
        })
    }

    fn release(&self, buffer: wgpu::Buffer) {
        let key = (buffer.size(), buffer.usage().bits());
        if let Ok(mut free) = self.free.lock() {
            let slot = free.entry(key).or_default();
            // Cap per-class retention; chunk pipelines touch few sizes
            if slot.len() < 8 {
                slot.push(buffer);
            }
        }
    }
}

/// GPU output vertex (32 bytes, cache-aligned).
///
/// Field order mirrors the WGSL `VertexOut { position: vec4, normal: vec4 }`
/// the mesh shaders write; the pads sit where the vec4 w components land.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct GpuVertex {
    pub px: f32,
    pub py: f32,
    pub pz: f32,
    pub _pad0: f32,
    pub nx: f32,
    pub ny: f32,
    pub nz: f32,
    pub _pad1: f32,
}

/// Create a bind group layout entry (compute, storage/uniform).
pub(crate) fn bgl_entry(binding: u32, ty: wgpu::BufferBindingType) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Create a compute pipeline from a bind group layout and shader module.
pub(crate) fn create_pipeline(
    device: &wgpu::Device,
    bgl: &wgpu::BindGroupLayout,
    shader: &wgpu::ShaderModule,
    label: &str,
) -> wgpu::ComputePipeline {
    let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[bgl],
        push_constant_ranges: &[],
    });

    device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(label),
        layout: Some(&layout),
        module: shader,
        entry_point: Some("main"),
        compilation_options: wgpu::PipelineCompilationOptions::default(),
        cache: None,
    })
}

fn map_staging(device: &wgpu::Device, staging: &wgpu::Buffer) -> Result<(), GpuError> {
    let slice = staging.slice(..);
    let (sender, receiver) = futures_channel::oneshot::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = sender.send(result);
    });
    device.poll(wgpu::Maintain::Wait);

    pollster::block_on(receiver)
        .map_err(|e| GpuError::BufferMapping(format!("Channel error: {}", e)))?
        .map_err(|e| GpuError::BufferMapping(format!("Map error: {:?}", e)))?;
    Ok(())
}

/// Read a single u32 from a staging buffer.
pub(crate) fn read_u32(device: &wgpu::Device, staging: &wgpu::Buffer) -> Result<u32, GpuError> {
    let out = read_pod_vec::<u32>(device, staging, 1)?;
    Ok(out[0])
}

/// Read `count` Pod elements from a staging buffer.
pub(crate) fn read_pod_vec<T: bytemuck::Pod>(
    device: &wgpu::Device,
    staging: &wgpu::Buffer,
    count: usize,
) -> Result<Vec<T>, GpuError> {
    map_staging(device, staging)?;

    let slice = staging.slice(..);
    let mapped = slice.get_mapped_range();
    let data: &[T] = bytemuck::cast_slice(&mapped);
    let result = data[..count].to_vec();
    drop(mapped);
    staging.unmap();

    Ok(result)
}
