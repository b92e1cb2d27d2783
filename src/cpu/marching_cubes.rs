//! CPU Marching Cubes over a sampled distance field (Deep Fried Edition)
//!
//! Standard 256-case table extraction. Triangles are emitted as soup
//! (three fresh vertices per face) exactly like the GPU pass-3 shader;
//! the optional weld pass collapses shared edges afterward.
//!
//! # Deep Fried Optimizations
//! - **Z-Slab Parallelization**: each Z layer of the owned window builds
//!   its own sub-mesh, merged through the bounded allocator.
//! - **Grid-gradient normals**: normals come from central differences of
//!   the already-sampled field, zero extra SDF evaluations.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;
use rayon::prelude::*;

use crate::engine::{merge_bounded, BufferOverflow, CellWindow, OutputBudget};
use crate::grid::{is_inside, ActiveMask, DistanceField};
use crate::mesh::{MeshBuffer, Vertex};
use crate::tables::{CORNER_OFFSETS, EDGE_CONNECTIONS, EDGE_TABLE, TRI_TABLE};

/// Extract the iso-surface of `field` over the owned cell window.
pub fn extract(
    field: &DistanceField,
    mask: &ActiveMask,
    window: &CellWindow,
    budget: &OutputBudget,
) -> Result<MeshBuffer, BufferOverflow> {
    let sub_meshes: Vec<MeshBuffer> = (window.lo[2]..window.hi[2])
        .into_par_iter()
        .map(|z| {
            let mut slab = MeshBuffer::new();
            for y in window.lo[1]..window.hi[1] {
                for x in window.lo[0]..window.hi[0] {
                    if mask.is_active_at(x as usize, y as usize, z as usize) {
                        process_cell(field, x as usize, y as usize, z as usize, &mut slab);
                    }
                }
            }
            slab
        })
        .collect();

    merge_bounded(sub_meshes, budget)
}

/// Interpolate the zero crossing between two corner samples.
#[inline(always)]
fn interpolate(p0: Vec3, p1: Vec3, v0: f32, v1: f32) -> (Vec3, f32) {
    let t = (-v0 / (v1 - v0)).clamp(0.0, 1.0);
    (p0 + (p1 - p0) * t, t)
}

/// Normal at an edge crossing: endpoint grid gradients lerped by the
/// same `t` as the position, then normalized. The GPU shader applies
/// the identical rule, so CPU and GPU normals agree to float precision.
#[inline(always)]
fn crossing_normal(field: &DistanceField, g0: [usize; 3], g1: [usize; 3], t: f32) -> Vec3 {
    let n0 = field.gradient(g0[0], g0[1], g0[2]);
    let n1 = field.gradient(g1[0], g1[1], g1[2]);
    let n = n0.lerp(n1, t);
    let len_sq = n.length_squared();
    if len_sq < 1e-20 {
        return Vec3::Y;
    }
    n / len_sq.sqrt()
}

#[inline(always)]
fn process_cell(field: &DistanceField, x: usize, y: usize, z: usize, mesh: &mut MeshBuffer) {
    let mut corner_values = [0.0f32; 8];
    let mut corner_positions = [Vec3::ZERO; 8];
    let mut corner_grid = [[0usize; 3]; 8];

    for i in 0..8 {
        let gx = x + CORNER_OFFSETS[i][0];
        let gy = y + CORNER_OFFSETS[i][1];
        let gz = z + CORNER_OFFSETS[i][2];
        corner_values[i] = field.get(gx, gy, gz);
        corner_positions[i] = field.spec.position(gx, gy, gz);
        corner_grid[i] = [gx, gy, gz];
    }

    let mut cube_index = 0usize;
    for i in 0..8 {
        if is_inside(corner_values[i]) {
            cube_index |= 1 << i;
        }
    }

    if EDGE_TABLE[cube_index] == 0 {
        return;
    }

    let mut edge_vertices = [Vec3::ZERO; 12];
    let mut edge_normals = [Vec3::ZERO; 12];
    for i in 0..12 {
        if EDGE_TABLE[cube_index] & (1 << i) != 0 {
            let e0 = EDGE_CONNECTIONS[i][0];
            let e1 = EDGE_CONNECTIONS[i][1];
            let (pos, t) = interpolate(
                corner_positions[e0],
                corner_positions[e1],
                corner_values[e0],
                corner_values[e1],
            );
            edge_vertices[i] = pos;
            edge_normals[i] = crossing_normal(field, corner_grid[e0], corner_grid[e1], t);
        }
    }

    let mut i = 0;
    while TRI_TABLE[cube_index][i] != -1 {
        let e0 = TRI_TABLE[cube_index][i] as usize;
        let e1 = TRI_TABLE[cube_index][i + 1] as usize;
        let e2 = TRI_TABLE[cube_index][i + 2] as usize;

        let base_idx = mesh.vertices.len() as u32;
        mesh.vertices.push(Vertex::new(edge_vertices[e0], edge_normals[e0]));
        mesh.vertices.push(Vertex::new(edge_vertices[e1], edge_normals[e1]));
        mesh.vertices.push(Vertex::new(edge_vertices[e2], edge_normals[e2]));

        mesh.indices.push(base_idx);
        mesh.indices.push(base_idx + 1);
        mesh.indices.push(base_idx + 2);

        i += 3;
    }
}
