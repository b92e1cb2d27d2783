//! GPU chunk extraction: the three-pass sample / classify / mesh
//! pipeline (Deep Fried Edition)
//!
//! Pass 1 samples the transpiled distance function at every grid point.
//! Pass 2 classifies cells and counts output vertices, accumulating the
//! grand total atomically. A CPU prefix sum turns the counts into
//! per-cell write offsets, and pass 3 writes vertices at those offsets,
//! so output order is deterministic regardless of GPU scheduling.
//!
//! Positions never cross the bus: cell coordinates are decoded from the
//! linear dispatch index and world positions recomputed algebraically
//! in the shader, the same arithmetic the CPU engines use.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;
use wgpu::util::DeviceExt;

use super::{bgl_entry, create_pipeline, read_pod_vec, read_u32, shaders, GpuContext, GpuError, GpuVertex};
use crate::engine::{Algorithm, BufferOverflow, CellWindow, OutputBudget};
use crate::grid::{DistanceField, GridSpec};
use crate::mesh::{MeshBuffer, Vertex};
use crate::scene::SceneProgram;

/// Threads per linear dispatch row; matches the generated shaders
/// (`32768` workgroups of 64 per row).
const DISPATCH_ROW: u32 = 32768 * 64;

/// A GPU chunk either failed at the device level (retry on CPU) or
/// overflowed its output budget (split the chunk).
#[derive(Debug, Error)]
pub enum GpuExtractError {
    /// Device-level failure.
    #[error(transparent)]
    Gpu(#[from] GpuError),
    /// Output budget exhausted.
    #[error(transparent)]
    Overflow(#[from] BufferOverflow),
}

/// Uniform block layout shared with every generated pass shader.
#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ChunkUniforms {
    nx: u32,
    ny: u32,
    nz: u32,
    time: f32,
    bounds_min: [f32; 4],
    bounds_max: [f32; 4],
    window_lo: [u32; 4],
    window_hi: [u32; 4],
    voxel_half: [f32; 4],
}

impl ChunkUniforms {
    fn new(spec: &GridSpec, window: &CellWindow, voxel_size: Option<f32>) -> Self {
        let cell = spec.cell_size();
        let half = match voxel_size {
            Some(v) => [v * 0.5; 3],
            None => [cell.x * 0.5, cell.y * 0.5, cell.z * 0.5],
        };
        ChunkUniforms {
            nx: spec.resolution[0],
            ny: spec.resolution[1],
            nz: spec.resolution[2],
            time: spec.time,
            bounds_min: [spec.min.x, spec.min.y, spec.min.z, 0.0],
            bounds_max: [spec.max.x, spec.max.y, spec.max.z, 0.0],
            window_lo: [window.lo[0], window.lo[1], window.lo[2], 0],
            window_hi: [window.hi[0], window.hi[1], window.hi[2], 0],
            voxel_half: [half[0], half[1], half[2], 0.0],
        }
    }
}

fn dispatch_linear(pass: &mut wgpu::ComputePass<'_>, threads: u32) {
    let groups = threads.div_ceil(64);
    let gx = groups.min(DISPATCH_ROW / 64);
    let gy = groups.div_ceil(DISPATCH_ROW / 64).max(1);
    pass.dispatch_workgroups(gx, gy, 1);
}

fn uniform_buffer(ctx: &GpuContext, uniforms: &ChunkUniforms) -> wgpu::Buffer {
    ctx.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("chunk uniforms"),
            contents: bytemuck::bytes_of(uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        })
}

/// Run pass 1 into a freshly acquired field buffer.
fn run_field_pass(
    ctx: &GpuContext,
    program: &SceneProgram,
    spec: &GridSpec,
    uniforms: &wgpu::Buffer,
) -> wgpu::Buffer {
    let point_count = spec.point_count() as u32;
    let field = ctx.acquire_buffer(
        point_count as u64 * 4,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        "field",
    );

    let shader = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("field sampler"),
        source: wgpu::ShaderSource::Wgsl(shaders::field_shader(program).into()),
    });
    let bgl = ctx
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("field bgl"),
            entries: &[
                bgl_entry(0, wgpu::BufferBindingType::Uniform),
                bgl_entry(1, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
    let pipeline = create_pipeline(&ctx.device, &bgl, &shader, "field pass");
    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("field bind group"),
        layout: &bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: uniforms.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: field.as_entire_binding() },
        ],
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("field pass") });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("field pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        dispatch_linear(&mut pass, point_count);
    }
    ctx.queue.submit(Some(encoder.finish()));

    field
}

/// Sample the distance field on the GPU and read it back.
///
/// Used by the dual contouring path, which runs its QEF solve on the
/// CPU over a GPU-sampled field.
pub(crate) fn sample_field_gpu(
    ctx: &GpuContext,
    program: &SceneProgram,
    spec: &GridSpec,
) -> Result<DistanceField, GpuExtractError> {
    let point_count = spec.point_count();
    let uniforms = uniform_buffer(ctx, &ChunkUniforms::new(spec, &CellWindow::full(spec.cell_counts()), None));
    let field = run_field_pass(ctx, program, spec, &uniforms);

    let staging = ctx.acquire_buffer(
        point_count as u64 * 4,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        "field staging",
    );
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("field readback") });
    encoder.copy_buffer_to_buffer(&field, 0, &staging, 0, point_count as u64 * 4);
    ctx.queue.submit(Some(encoder.finish()));

    let values = read_pod_vec::<f32>(&ctx.device, &staging, point_count)?;
    ctx.recycle(field);
    ctx.recycle(staging);

    Ok(DistanceField { spec: *spec, values })
}

/// Extract one chunk on the GPU with marching cubes or the cubes engine.
///
/// Dual contouring is not dispatched here; its GPU path samples the
/// field via [`sample_field_gpu`] and meshes on the CPU.
pub(crate) fn extract_chunk(
    ctx: &GpuContext,
    program: &SceneProgram,
    spec: &GridSpec,
    window: &CellWindow,
    algorithm: Algorithm,
    budget: &OutputBudget,
    voxel_size: Option<f32>,
) -> Result<MeshBuffer, GpuExtractError> {
    let cell_count = spec.cell_count() as u32;
    let uniforms = uniform_buffer(ctx, &ChunkUniforms::new(spec, window, voxel_size));

    // Pass 1: sample the field
    let field = run_field_pass(ctx, program, spec, &uniforms);

    // Pass 2: classify cells and count vertices
    let counts_buf = ctx.acquire_buffer(
        cell_count as u64 * 4,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        "cell counts",
    );
    let cases_buf = ctx.acquire_buffer(
        cell_count as u64 * 4,
        wgpu::BufferUsages::STORAGE,
        "cell cases",
    );
    let total_buf = ctx.acquire_buffer(
        4,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        "vertex total",
    );

    let classify = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("classify"),
        source: wgpu::ShaderSource::Wgsl(shaders::classify_shader(algorithm).into()),
    });
    let classify_bgl = ctx
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("classify bgl"),
            entries: &[
                bgl_entry(0, wgpu::BufferBindingType::Uniform),
                bgl_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                bgl_entry(2, wgpu::BufferBindingType::Storage { read_only: false }),
                bgl_entry(3, wgpu::BufferBindingType::Storage { read_only: false }),
                bgl_entry(4, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
    let classify_pipeline = create_pipeline(&ctx.device, &classify_bgl, &classify, "classify pass");
    let classify_bind = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("classify bind group"),
        layout: &classify_bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: uniforms.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: field.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: counts_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: cases_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 4, resource: total_buf.as_entire_binding() },
        ],
    });

    let counts_staging = ctx.acquire_buffer(
        cell_count as u64 * 4,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        "counts staging",
    );
    let total_staging = ctx.acquire_buffer(
        4,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        "total staging",
    );

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("classify pass") });
    // Pooled buffer may hold a previous total
    encoder.clear_buffer(&total_buf, 0, None);
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("classify pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&classify_pipeline);
        pass.set_bind_group(0, &classify_bind, &[]);
        dispatch_linear(&mut pass, cell_count);
    }
    encoder.copy_buffer_to_buffer(&counts_buf, 0, &counts_staging, 0, cell_count as u64 * 4);
    encoder.copy_buffer_to_buffer(&total_buf, 0, &total_staging, 0, 4);
    ctx.queue.submit(Some(encoder.finish()));

    let counts = read_pod_vec::<u32>(&ctx.device, &counts_staging, cell_count as usize)?;
    let total = read_u32(&ctx.device, &total_staging)?;
    ctx.recycle(counts_staging);
    ctx.recycle(total_staging);

    if total > budget.max_vertices {
        return Err(BufferOverflow { needed: total, capacity: budget.max_vertices }.into());
    }
    if total == 0 {
        for b in [field, counts_buf, cases_buf, total_buf] {
            ctx.recycle(b);
        }
        return Ok(MeshBuffer::new());
    }

    // CPU prefix sum: per-cell write offsets for pass 3
    let mut offsets = vec![0u32; cell_count as usize];
    let mut running = 0u32;
    for (off, &count) in offsets.iter_mut().zip(&counts) {
        *off = running;
        running += count;
    }

    let offsets_buf = ctx.acquire_buffer(
        cell_count as u64 * 4,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        "cell offsets",
    );
    ctx.queue.write_buffer(&offsets_buf, 0, bytemuck::cast_slice(&offsets));

    // Pass 3: mesh generation at the prefix-sum offsets
    let vertices_buf = ctx.acquire_buffer(
        total as u64 * std::mem::size_of::<GpuVertex>() as u64,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        "vertices",
    );

    let mesh_source = match algorithm {
        Algorithm::Cubes => shaders::cubes_shader(),
        _ => shaders::marching_cubes_shader(),
    };
    let mesh_shader = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("mesh pass"),
        source: wgpu::ShaderSource::Wgsl(mesh_source.into()),
    });
    let mesh_bgl = ctx
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("mesh bgl"),
            entries: &[
                bgl_entry(0, wgpu::BufferBindingType::Uniform),
                bgl_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                bgl_entry(2, wgpu::BufferBindingType::Storage { read_only: true }),
                bgl_entry(3, wgpu::BufferBindingType::Storage { read_only: true }),
                bgl_entry(4, wgpu::BufferBindingType::Storage { read_only: true }),
                bgl_entry(5, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
    let mesh_pipeline = create_pipeline(&ctx.device, &mesh_bgl, &mesh_shader, "mesh pass");
    let mesh_bind = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("mesh bind group"),
        layout: &mesh_bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: uniforms.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: field.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: counts_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: cases_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 4, resource: offsets_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 5, resource: vertices_buf.as_entire_binding() },
        ],
    });

    let vertices_staging = ctx.acquire_buffer(
        total as u64 * std::mem::size_of::<GpuVertex>() as u64,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        "vertices staging",
    );
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("mesh pass") });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("mesh pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&mesh_pipeline);
        pass.set_bind_group(0, &mesh_bind, &[]);
        dispatch_linear(&mut pass, cell_count);
    }
    encoder.copy_buffer_to_buffer(
        &vertices_buf,
        0,
        &vertices_staging,
        0,
        total as u64 * std::mem::size_of::<GpuVertex>() as u64,
    );
    ctx.queue.submit(Some(encoder.finish()));

    let raw = read_pod_vec::<GpuVertex>(&ctx.device, &vertices_staging, total as usize)?;
    for b in [field, counts_buf, cases_buf, total_buf, offsets_buf, vertices_buf, vertices_staging] {
        ctx.recycle(b);
    }

    let vertices: Vec<Vertex> = raw
        .iter()
        .map(|v| {
            Vertex::new(
                glam::Vec3::new(v.px, v.py, v.pz),
                glam::Vec3::new(v.nx, v.ny, v.nz),
            )
        })
        .collect();

    let indices = match algorithm {
        Algorithm::Cubes => cube_indices(&counts, &offsets),
        _ => (0..total).collect(),
    };
    if indices.len() as u32 > budget.max_indices {
        return Err(BufferOverflow {
            needed: indices.len() as u32,
            capacity: budget.max_indices,
        }
        .into());
    }

    log::trace!(
        "gpu chunk: {} cells, {} vertices, {} indices",
        cell_count,
        total,
        indices.len()
    );

    Ok(MeshBuffer { vertices, indices, colors: None })
}

/// Cubes emit 24 vertices per cell on the GPU; the 36 face indices per
/// cell are derived here from the same counts and offsets.
fn cube_indices(counts: &[u32], offsets: &[u32]) -> Vec<u32> {
    let mut indices = Vec::new();
    for (ci, &count) in counts.iter().enumerate() {
        if count == 0 {
            continue;
        }
        let base = offsets[ci];
        for f in 0..6u32 {
            let v = base + f * 4;
            indices.extend_from_slice(&[v, v + 1, v + 2, v, v + 2, v + 3]);
        }
    }
    indices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu;
    use crate::grid::ActiveMask;
    use glam::Vec3;

    fn gpu_or_skip() -> Option<GpuContext> {
        match GpuContext::new() {
            Ok(ctx) => Some(ctx),
            Err(GpuError::NoAdapter) => {
                eprintln!("Skipping GPU test: no GPU adapter available");
                None
            }
            Err(e) => panic!("GPU context creation failed: {}", e),
        }
    }

    fn sphere_program() -> SceneProgram {
        SceneProgram::build(r#"{"distance": {"sphere": {"radius": 1.0}}}"#).unwrap()
    }

    fn test_spec(res: u32) -> GridSpec {
        GridSpec {
            min: Vec3::splat(-2.0),
            max: Vec3::splat(2.0),
            resolution: [res; 3],
            time: 0.0,
        }
    }

    #[test]
    fn test_gpu_field_matches_cpu() {
        let Some(ctx) = gpu_or_skip() else { return };
        let program = sphere_program();
        let spec = test_spec(17);

        let gpu_field = sample_field_gpu(&ctx, &program, &spec).unwrap();
        let cpu_field = cpu::sample_field(&program.distance, &spec);

        for (i, (a, b)) in gpu_field.values.iter().zip(&cpu_field.values).enumerate() {
            assert!(
                (a - b).abs() < 1e-4,
                "field diverges at point {}: gpu {} cpu {}",
                i,
                a,
                b
            );
        }
    }

    #[test]
    fn test_gpu_marching_cubes_matches_cpu_counts() {
        let Some(ctx) = gpu_or_skip() else { return };
        let program = sphere_program();
        let spec = test_spec(17);
        let window = CellWindow::full(spec.cell_counts());

        let field = cpu::sample_field(&program.distance, &spec);
        let mask = ActiveMask::classify(&field);
        let budget = OutputBudget::for_active_cells(Algorithm::MarchingCubes, mask.active_count());

        let gpu_mesh = extract_chunk(
            &ctx, &program, &spec, &window, Algorithm::MarchingCubes, &budget, None,
        )
        .unwrap();
        let cpu_mesh = cpu::extract(&field, &mask, &window, Algorithm::MarchingCubes, &budget, None)
            .unwrap();

        // Same tables, same inside rule: identical topology
        assert_eq!(gpu_mesh.vertex_count(), cpu_mesh.vertex_count());
        assert_eq!(gpu_mesh.indices.len(), cpu_mesh.indices.len());
        for v in &gpu_mesh.vertices {
            assert!((v.position.length() - 1.0).abs() < 0.05);
        }
    }

    #[test]
    fn test_gpu_cubes_counts() {
        let Some(ctx) = gpu_or_skip() else { return };
        let program = sphere_program();
        let spec = test_spec(9);
        let window = CellWindow::full(spec.cell_counts());

        let field = cpu::sample_field(&program.distance, &spec);
        let mask = ActiveMask::classify(&field);
        let budget = OutputBudget::for_active_cells(Algorithm::Cubes, mask.active_count());

        let mesh = extract_chunk(&ctx, &program, &spec, &window, Algorithm::Cubes, &budget, None)
            .unwrap();
        assert_eq!(mesh.vertex_count(), mask.active_count() * 24);
        assert_eq!(mesh.indices.len(), mask.active_count() * 36);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_gpu_overflow_reported() {
        let Some(ctx) = gpu_or_skip() else { return };
        let program = sphere_program();
        let spec = test_spec(17);
        let window = CellWindow::full(spec.cell_counts());
        let budget = OutputBudget { max_vertices: 10, max_indices: 10 };

        let result = extract_chunk(
            &ctx, &program, &spec, &window, Algorithm::MarchingCubes, &budget, None,
        );
        assert!(matches!(result, Err(GpuExtractError::Overflow(_))));
    }
}
