//! GPU vertex color pass: shade welded mesh vertices in one dispatch.
//!
//! The shader is generated from the same color spec the CPU shader
//! reads, with every constant folded into the source, so GPU and CPU
//! colors match term for term. Positions and normals are uploaded as
//! vec4 arrays; only the colors come back.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;
use wgpu::util::DeviceExt;

use super::{bgl_entry, create_pipeline, read_pod_vec, shaders, GpuContext, GpuError};
use crate::mesh::MeshBuffer;
use crate::scene::{ColorSpec, SceneProgram};

#[repr(C)]
#[derive(Debug, Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct ColorUniforms {
    count: u32,
    time: f32,
    _pad0: f32,
    _pad1: f32,
}

/// Shade every vertex of `mesh` on the GPU.
///
/// Only called for scenes with a `color` section; flat gray fills never
/// need a dispatch.
pub(crate) fn shade_mesh_gpu(
    ctx: &GpuContext,
    program: &SceneProgram,
    spec: &ColorSpec,
    mesh: &MeshBuffer,
    time: f32,
) -> Result<Vec<Vec3>, GpuError> {
    let count = mesh.vertex_count() as u32;
    if count == 0 {
        return Ok(Vec::new());
    }

    let positions: Vec<[f32; 4]> = mesh
        .vertices
        .iter()
        .map(|v| [v.position.x, v.position.y, v.position.z, 1.0])
        .collect();
    let normals: Vec<[f32; 4]> = mesh
        .vertices
        .iter()
        .map(|v| [v.normal.x, v.normal.y, v.normal.z, 0.0])
        .collect();

    let uniforms = ctx
        .device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("color uniforms"),
            contents: bytemuck::bytes_of(&ColorUniforms {
                count,
                time,
                _pad0: 0.0,
                _pad1: 0.0,
            }),
            usage: wgpu::BufferUsages::UNIFORM,
        });

    let bytes = count as u64 * 16;
    let positions_buf = ctx.acquire_buffer(
        bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        "color positions",
    );
    let normals_buf = ctx.acquire_buffer(
        bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        "color normals",
    );
    let colors_buf = ctx.acquire_buffer(
        bytes,
        wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        "color output",
    );
    ctx.queue.write_buffer(&positions_buf, 0, bytemuck::cast_slice(&positions));
    ctx.queue.write_buffer(&normals_buf, 0, bytemuck::cast_slice(&normals));

    let shader = ctx.device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("color pass"),
        source: wgpu::ShaderSource::Wgsl(shaders::color_shader(program, spec).into()),
    });
    let bgl = ctx
        .device
        .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("color bgl"),
            entries: &[
                bgl_entry(0, wgpu::BufferBindingType::Uniform),
                bgl_entry(1, wgpu::BufferBindingType::Storage { read_only: true }),
                bgl_entry(2, wgpu::BufferBindingType::Storage { read_only: true }),
                bgl_entry(3, wgpu::BufferBindingType::Storage { read_only: false }),
            ],
        });
    let pipeline = create_pipeline(&ctx.device, &bgl, &shader, "color pass");
    let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some("color bind group"),
        layout: &bgl,
        entries: &[
            wgpu::BindGroupEntry { binding: 0, resource: uniforms.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 1, resource: positions_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 2, resource: normals_buf.as_entire_binding() },
            wgpu::BindGroupEntry { binding: 3, resource: colors_buf.as_entire_binding() },
        ],
    });

    let staging = ctx.acquire_buffer(
        bytes,
        wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        "color staging",
    );
    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("color pass") });
    {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("color pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        let groups = count.div_ceil(64);
        pass.dispatch_workgroups(groups.min(32768), groups.div_ceil(32768).max(1), 1);
    }
    encoder.copy_buffer_to_buffer(&colors_buf, 0, &staging, 0, bytes);
    ctx.queue.submit(Some(encoder.finish()));

    let raw = read_pod_vec::<[f32; 4]>(&ctx.device, &staging, count as usize)?;
    for b in [positions_buf, normals_buf, colors_buf, staging] {
        ctx.recycle(b);
    }

    Ok(raw.iter().map(|c| Vec3::new(c[0], c[1], c[2])).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Vertex;
    use crate::scene::color::shade_vertex;

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

    #[test]
    fn test_gpu_colors_match_cpu_shader() {
        let Some(ctx) = gpu_or_skip() else { return };
        let program = SceneProgram::build(
            r#"{"distance": {"material": {"id": 1, "child": {"sphere": {"radius": 1.0}}}},
                "materials": [{"id": 1, "base_color": [0.9, 0.2, 0.1]}],
                "color": {"rim": 0.2, "specular": 0.4}}"#,
        )
        .unwrap();
        let spec = program.color.unwrap();

        let mesh = MeshBuffer {
            vertices: vec![
                Vertex::new(Vec3::X, Vec3::X),
                Vertex::new(Vec3::Y, Vec3::Y),
                Vertex::new(-Vec3::Z, -Vec3::Z),
            ],
            indices: vec![0, 1, 2],
            colors: None,
        };

        let gpu = shade_mesh_gpu(&ctx, &program, &spec, &mesh, 0.0).unwrap();
        assert_eq!(gpu.len(), 3);
        for (v, c) in mesh.vertices.iter().zip(&gpu) {
            let cpu = shade_vertex(&program, v.position, v.normal, 0.0);
            assert!(
                (cpu - *c).length() < 1e-2,
                "gpu color {:?} diverges from cpu {:?} at {:?}",
                c,
                cpu,
                v.position
            );
        }
    }

    #[test]
    fn test_empty_mesh_no_dispatch() {
        let Some(ctx) = gpu_or_skip() else { return };
        let program = SceneProgram::build(
            r#"{"distance": {"sphere": {"radius": 1.0}}, "color": {}}"#,
        )
        .unwrap();
        let spec = program.color.unwrap();
        let colors = shade_mesh_gpu(&ctx, &program, &spec, &MeshBuffer::new(), 0.0).unwrap();
        assert!(colors.is_empty());
    }
}
