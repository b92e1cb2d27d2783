//! Cubes debug engine: one axis-aligned cube per active cell.
//!
//! No interpolation, no field lookups beyond the mask — this exists to
//! visualize exactly which cells the classifier marked active. Face
//! normals, 24 vertices and 36 indices per cube.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;
use rayon::prelude::*;

use crate::engine::{merge_bounded, BufferOverflow, CellWindow, OutputBudget};
use crate::grid::{ActiveMask, DistanceField};
use crate::mesh::{MeshBuffer, Vertex};

/// Cube faces: outward normal plus the four corner signs (CCW from outside).
const FACES: [([f32; 3], [[f32; 3]; 4]); 6] = [
    // +X
    ([1.0, 0.0, 0.0], [[1.0, -1.0, -1.0], [1.0, 1.0, -1.0], [1.0, 1.0, 1.0], [1.0, -1.0, 1.0]]),
    // -X
    ([-1.0, 0.0, 0.0], [[-1.0, -1.0, 1.0], [-1.0, 1.0, 1.0], [-1.0, 1.0, -1.0], [-1.0, -1.0, -1.0]]),
    // +Y
    ([0.0, 1.0, 0.0], [[-1.0, 1.0, -1.0], [-1.0, 1.0, 1.0], [1.0, 1.0, 1.0], [1.0, 1.0, -1.0]]),
    // -Y
    ([0.0, -1.0, 0.0], [[-1.0, -1.0, 1.0], [-1.0, -1.0, -1.0], [1.0, -1.0, -1.0], [1.0, -1.0, 1.0]]),
    // +Z
    ([0.0, 0.0, 1.0], [[-1.0, -1.0, 1.0], [1.0, -1.0, 1.0], [1.0, 1.0, 1.0], [-1.0, 1.0, 1.0]]),
    // -Z
    ([0.0, 0.0, -1.0], [[1.0, -1.0, -1.0], [-1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [1.0, 1.0, -1.0]]),
];

/// Emit a cube for every active cell in the owned window.
///
/// `voxel_size` sets the cube edge length; `None` fills the cell exactly.
pub fn extract(
    field: &DistanceField,
    mask: &ActiveMask,
    window: &CellWindow,
    budget: &OutputBudget,
    voxel_size: Option<f32>,
) -> Result<MeshBuffer, BufferOverflow> {
    let cell = field.spec.cell_size();
    let half = match voxel_size {
        Some(v) => Vec3::splat(v * 0.5),
        None => cell * 0.5,
    };

    let sub_meshes: Vec<MeshBuffer> = (window.lo[2]..window.hi[2])
        .into_par_iter()
        .map(|z| {
            let mut slab = MeshBuffer::new();
            for y in window.lo[1]..window.hi[1] {
                for x in window.lo[0]..window.hi[0] {
                    if !mask.is_active_at(x as usize, y as usize, z as usize) {
                        continue;
                    }
                    let center = field.spec.position(x as usize, y as usize, z as usize)
                        + cell * 0.5;
                    emit_cube(center, half, &mut slab);
                }
            }
            slab
        })
        .collect();

    merge_bounded(sub_meshes, budget)
}

fn emit_cube(center: Vec3, half: Vec3, mesh: &mut MeshBuffer) {
    for (normal, corners) in &FACES {
        let n = Vec3::from(*normal);
        let base = mesh.vertices.len() as u32;
        for c in corners {
            mesh.vertices.push(Vertex::new(center + Vec3::from(*c) * half, n));
        }
        mesh.indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Algorithm;
    use crate::grid::GridSpec;
    use crate::scene::SdfExpr;

    fn setup(res: u32) -> (DistanceField, ActiveMask) {
        let spec = GridSpec {
            min: Vec3::splat(-2.0),
            max: Vec3::splat(2.0),
            resolution: [res; 3],
            time: 0.0,
        };
        let field = crate::cpu::sample_field(&SdfExpr::Sphere { radius: 1.0 }, &spec);
        let mask = ActiveMask::classify(&field);
        (field, mask)
    }

    #[test]
    fn test_one_cube_per_active_cell() {
        let (field, mask) = setup(17);
        let window = CellWindow::full(field.spec.cell_counts());
        let budget = OutputBudget::for_active_cells(Algorithm::Cubes, mask.active_count());
        let mesh = extract(&field, &mask, &window, &budget, None).unwrap();

        assert_eq!(mesh.vertex_count(), mask.active_count() * 24);
        assert_eq!(mesh.indices.len(), mask.active_count() * 36);
        assert!(mesh.validate().is_ok());
    }

    #[test]
    fn test_voxel_size_override() {
        let (field, mask) = setup(9);
        let window = CellWindow::full(field.spec.cell_counts());
        let budget = OutputBudget::for_active_cells(Algorithm::Cubes, mask.active_count());
        let small = extract(&field, &mask, &window, &budget, Some(0.1)).unwrap();

        // Each cube spans exactly 0.1 along every axis
        for cube in small.vertices.chunks_exact(24) {
            let min = cube.iter().fold(Vec3::MAX, |m, v| m.min(v.position));
            let max = cube.iter().fold(Vec3::MIN, |m, v| m.max(v.position));
            let extent = max - min;
            assert!((extent - Vec3::splat(0.1)).length() < 1e-5, "extent {:?}", extent);
        }
    }

    #[test]
    fn test_faces_wind_outward() {
        let (field, mask) = setup(9);
        let window = CellWindow::full(field.spec.cell_counts());
        let budget = OutputBudget::for_active_cells(Algorithm::Cubes, mask.active_count());
        let mesh = extract(&field, &mask, &window, &budget, None).unwrap();

        for tri in mesh.indices.chunks_exact(3) {
            let a = mesh.vertices[tri[0] as usize];
            let b = mesh.vertices[tri[1] as usize];
            let c = mesh.vertices[tri[2] as usize];
            let face_normal = (b.position - a.position)
                .cross(c.position - a.position)
                .normalize_or_zero();
            assert!(
                face_normal.dot(a.normal) > 0.99,
                "winding disagrees with face normal"
            );
        }
    }
}
