//! Dual Contouring over a sampled distance field.
//!
//! One QEF-minimizing vertex per active cell, quads from sign-change
//! grid edges. Unlike Marching Cubes this preserves sharp features, at
//! the cost of one linear solve per cell.
//!
//! Hermite data comes from the field itself: crossings by linear
//! interpolation of corner samples, normals by interpolated grid
//! gradients — so the algorithm runs identically whether the field was
//! sampled on the CPU or read back from the GPU sampler.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;
use rayon::prelude::*;

use crate::engine::{BufferOverflow, BumpAlloc, CellWindow, OutputBudget};
use crate::grid::{is_inside, ActiveMask, DistanceField};
use crate::mesh::{MeshBuffer, Vertex};

/// Tikhonov regularization for the 3x3 QEF system.
const QEF_LAMBDA: f32 = 0.01;

/// Cube edges as corner-offset pairs, matching the cell corner layout.
const CELL_EDGES: [([usize; 3], [usize; 3]); 12] = [
    // Bottom face (z = 0)
    ([0, 0, 0], [1, 0, 0]),
    ([0, 1, 0], [1, 1, 0]),
    ([0, 0, 0], [0, 1, 0]),
    ([1, 0, 0], [1, 1, 0]),
    // Top face (z = 1)
    ([0, 0, 1], [1, 0, 1]),
    ([0, 1, 1], [1, 1, 1]),
    ([0, 0, 1], [0, 1, 1]),
    ([1, 0, 1], [1, 1, 1]),
    // Vertical edges
    ([0, 0, 0], [0, 0, 1]),
    ([1, 0, 0], [1, 0, 1]),
    ([0, 1, 0], [0, 1, 1]),
    ([1, 1, 0], [1, 1, 1]),
];

/// Extract a dual-contoured surface over the owned cell window.
///
/// Cell vertices are computed for active cells of the window dilated by
/// one (owned quads reference the ring of cells around them), but a
/// quad is emitted only by the chunk owning the edge's canonical cell,
/// so chunked extraction emits each face exactly once. Chunk grids
/// carry a two-cell apron so every dilated cell sees central-difference
/// gradients, matching the single-chunk result.
pub fn extract(
    field: &DistanceField,
    mask: &ActiveMask,
    window: &CellWindow,
    budget: &OutputBudget,
) -> Result<MeshBuffer, BufferOverflow> {
    let cells = field.spec.cell_counts();
    let cx = cells[0] as usize;
    let cy = cells[1] as usize;
    let cz = cells[2] as usize;
    let cell_count = field.spec.cell_count();

    // 1. QEF vertex per active cell of the dilated window (parallel)
    let vlo = [
        window.lo[0].saturating_sub(1) as usize,
        window.lo[1].saturating_sub(1) as usize,
        window.lo[2].saturating_sub(1) as usize,
    ];
    let vhi = [
        (window.hi[0] + 1).min(cells[0]) as usize,
        (window.hi[1] + 1).min(cells[1]) as usize,
        (window.hi[2] + 1).min(cells[2]) as usize,
    ];
    let cell_vertices: Vec<Option<(Vec3, Vec3)>> = (0..cell_count)
        .into_par_iter()
        .map(|ci| {
            if !mask.is_active(ci) {
                return None;
            }
            let x = ci % cx;
            let y = (ci / cx) % cy;
            let z = ci / (cx * cy);
            let dilated = (vlo[0]..vhi[0]).contains(&x)
                && (vlo[1]..vhi[1]).contains(&y)
                && (vlo[2]..vhi[2]).contains(&z);
            if !dilated {
                return None;
            }
            Some(cell_vertex(field, x, y, z))
        })
        .collect();

    // 2. Assign indices; vertex budget charged through the allocator
    let vert_alloc = BumpAlloc::new(budget.max_vertices);
    let mut vertex_index_map: Vec<u32> = vec![u32::MAX; cell_count];
    let mut vertices: Vec<Vertex> = Vec::new();

    for ci in 0..cell_count {
        if let Some((vpos, vnormal)) = cell_vertices[ci] {
            vertex_index_map[ci] = vert_alloc.reserve(1)?;
            vertices.push(Vertex::new(vpos, vnormal));
        }
    }

    // 3. Quads from sign-change edges owned by this window
    let idx_alloc = BumpAlloc::new(budget.max_indices);
    let mut indices: Vec<u32> = Vec::new();
    let cell_idx = |x: usize, y: usize, z: usize| -> usize { x + y * cx + z * cx * cy };

    let mut emit_quad = |cells4: [usize; 4], flip: bool| -> Result<(), BufferOverflow> {
        let v = [
            vertex_index_map[cells4[0]],
            vertex_index_map[cells4[1]],
            vertex_index_map[cells4[2]],
            vertex_index_map[cells4[3]],
        ];
        if v.iter().any(|&i| i == u32::MAX) {
            return Ok(());
        }
        idx_alloc.reserve(6)?;
        if flip {
            indices.extend_from_slice(&[v[0], v[1], v[2], v[0], v[2], v[3]]);
        } else {
            indices.extend_from_slice(&[v[0], v[2], v[1], v[0], v[3], v[2]]);
        }
        Ok(())
    };

    for z in 0..cz {
        for y in 0..cy {
            for x in 0..cx {
                if !window.contains(x, y, z) {
                    continue;
                }
                let d0 = field.get(x, y, z);

                // X-edge (x,y,z)->(x+1,y,z): quad over the 4 cells around
                // it; this window owns the edge via its canonical cell.
                if y > 0 && z > 0 {
                    let d1 = field.get(x + 1, y, z);
                    if is_inside(d0) != is_inside(d1) {
                        emit_quad(
                            [
                                cell_idx(x, y - 1, z - 1),
                                cell_idx(x, y, z - 1),
                                cell_idx(x, y, z),
                                cell_idx(x, y - 1, z),
                            ],
                            !is_inside(d0),
                        )?;
                    }
                }

                // Y-edge (x,y,z)->(x,y+1,z)
                if x > 0 && z > 0 {
                    let d1 = field.get(x, y + 1, z);
                    if is_inside(d0) != is_inside(d1) {
                        emit_quad(
                            [
                                cell_idx(x - 1, y, z - 1),
                                cell_idx(x, y, z - 1),
                                cell_idx(x, y, z),
                                cell_idx(x - 1, y, z),
                            ],
                            is_inside(d0),
                        )?;
                    }
                }

                // Z-edge (x,y,z)->(x,y,z+1)
                if x > 0 && y > 0 {
                    let d1 = field.get(x, y, z + 1);
                    if is_inside(d0) != is_inside(d1) {
                        emit_quad(
                            [
                                cell_idx(x - 1, y - 1, z),
                                cell_idx(x, y - 1, z),
                                cell_idx(x, y, z),
                                cell_idx(x - 1, y, z),
                            ],
                            !is_inside(d0),
                        )?;
                    }
                }
            }
        }
    }

    Ok(MeshBuffer {
        vertices,
        indices,
        colors: None,
    })
}

/// Hermite data and QEF vertex for one active cell.
#[inline(always)]
fn cell_vertex(field: &DistanceField, x: usize, y: usize, z: usize) -> (Vec3, Vec3) {
    let mut hermite: Vec<(Vec3, Vec3)> = Vec::with_capacity(12);

    for &(a, b) in &CELL_EDGES {
        let ga = [x + a[0], y + a[1], z + a[2]];
        let gb = [x + b[0], y + b[1], z + b[2]];
        let da = field.get(ga[0], ga[1], ga[2]);
        let db = field.get(gb[0], gb[1], gb[2]);
        if is_inside(da) == is_inside(db) {
            continue;
        }

        let t = (-da / (db - da)).clamp(0.0, 1.0);
        let pa = field.spec.position(ga[0], ga[1], ga[2]);
        let pb = field.spec.position(gb[0], gb[1], gb[2]);
        let crossing = pa.lerp(pb, t);

        let na = field.gradient(ga[0], ga[1], ga[2]);
        let nb = field.gradient(gb[0], gb[1], gb[2]);
        let n = na.lerp(nb, t).normalize_or_zero();

        hermite.push((crossing, n));
    }

    let cell_min = field.spec.position(x, y, z);
    let cell_max = field.spec.position(x + 1, y + 1, z + 1);
    let vertex = qef_solve(&hermite, cell_min, cell_max);

    let avg_normal = hermite
        .iter()
        .map(|(_, n)| *n)
        .sum::<Vec3>()
        .normalize_or_zero();

    (vertex, avg_normal)
}

/// Solve the Quadric Error Function: find the point minimizing
/// `sum((n_i . (p - x_i))^2)` over the Hermite pairs `(x_i, n_i)`.
///
/// Cramer's rule on the regularized AtA system, shifted to the mass
/// point for stability; falls back to the mass point when singular and
/// clamps the result to the cell.
#[inline(always)]
fn qef_solve(intersections: &[(Vec3, Vec3)], cell_min: Vec3, cell_max: Vec3) -> Vec3 {
    if intersections.is_empty() {
        return (cell_min + cell_max) * 0.5;
    }

    let mass_point =
        intersections.iter().map(|(p, _)| *p).sum::<Vec3>() / intersections.len() as f32;

    let mut ata = [[0.0f32; 3]; 3];
    let mut atb = [0.0f32; 3];

    for &(point, normal) in intersections {
        let n = [normal.x, normal.y, normal.z];
        let rhs = normal.dot(point - mass_point);
        for i in 0..3 {
            for j in 0..3 {
                ata[i][j] += n[i] * n[j];
            }
            atb[i] += n[i] * rhs;
        }
    }

    let vertex = match solve_3x3_regularized(&ata, &atb) {
        Some(v) => mass_point + Vec3::new(v[0], v[1], v[2]),
        None => mass_point,
    };

    vertex.clamp(cell_min, cell_max)
}

/// Solve a 3x3 linear system with Tikhonov regularization.
/// Returns `None` if still degenerate after regularization.
#[inline(always)]
fn solve_3x3_regularized(ata: &[[f32; 3]; 3], atb: &[f32; 3]) -> Option<[f32; 3]> {
    let a = [
        [ata[0][0] + QEF_LAMBDA, ata[0][1], ata[0][2]],
        [ata[1][0], ata[1][1] + QEF_LAMBDA, ata[1][2]],
        [ata[2][0], ata[2][1], ata[2][2] + QEF_LAMBDA],
    ];

    let det = a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
        - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
        + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]);

    if det.abs() < 1e-12 {
        return None;
    }

    let inv_det = 1.0 / det;

    let x = (atb[0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
        - a[0][1] * (atb[1] * a[2][2] - a[1][2] * atb[2])
        + a[0][2] * (atb[1] * a[2][1] - a[1][1] * atb[2]))
        * inv_det;

    let y = (a[0][0] * (atb[1] * a[2][2] - a[1][2] * atb[2])
        - atb[0] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
        + a[0][2] * (a[1][0] * atb[2] - atb[1] * a[2][0]))
        * inv_det;

    let z = (a[0][0] * (a[1][1] * atb[2] - atb[1] * a[2][1])
        - a[0][1] * (a[1][0] * atb[2] - atb[1] * a[2][0])
        + atb[0] * (a[1][0] * a[2][1] - a[1][1] * a[2][0]))
        * inv_det;

    if x.is_finite() && y.is_finite() && z.is_finite() {
        Some([x, y, z])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Algorithm;
    use crate::grid::GridSpec;
    use crate::scene::SdfExpr;

    fn setup(expr: &SdfExpr, res: u32) -> (DistanceField, ActiveMask) {
        let spec = GridSpec {
            min: Vec3::splat(-2.0),
            max: Vec3::splat(2.0),
            resolution: [res; 3],
            time: 0.0,
        };
        let field = crate::cpu::sample_field(expr, &spec);
        let mask = ActiveMask::classify(&field);
        (field, mask)
    }

    fn full_extract(field: &DistanceField, mask: &ActiveMask) -> MeshBuffer {
        let window = CellWindow::full(field.spec.cell_counts());
        let budget = OutputBudget::for_active_cells(Algorithm::DualContouring, mask.active_count());
        extract(field, mask, &window, &budget).unwrap()
    }

    #[test]
    fn test_dc_sphere_produces_mesh() {
        let (field, mask) = setup(&SdfExpr::Sphere { radius: 1.0 }, 17);
        let mesh = full_extract(&field, &mask);

        assert!(mesh.vertex_count() > 0);
        assert!(mesh.triangle_count() > 0);
        assert!(mesh.validate().is_ok());
        // One vertex per active cell, never more
        assert!(mesh.vertex_count() <= mask.active_count());
    }

    #[test]
    fn test_dc_vertices_near_surface() {
        let (field, mask) = setup(&SdfExpr::Sphere { radius: 1.0 }, 25);
        let mesh = full_extract(&field, &mask);

        let max_dist = mesh
            .vertices
            .iter()
            .map(|v| (v.position.length() - 1.0).abs())
            .fold(0.0f32, f32::max);
        // Cell size 4/24, vertices stay within roughly a cell diagonal
        assert!(max_dist < 0.5, "vertices should hug the surface: {}", max_dist);
    }

    #[test]
    fn test_dc_box_keeps_corners() {
        let (field, mask) = setup(&SdfExpr::Box3 { half_extents: [1.0, 1.0, 1.0] }, 21);
        let mesh = full_extract(&field, &mask);

        // Some cell vertex should land very near a box corner; MC would
        // round it off, the QEF should not.
        let corner = Vec3::splat(1.0);
        let closest = mesh
            .vertices
            .iter()
            .map(|v| (v.position.abs() - corner).length())
            .fold(f32::MAX, f32::min);
        assert!(closest < 0.15, "QEF should recover the corner: {}", closest);
    }

    #[test]
    fn test_dc_normals_outward() {
        let (field, mask) = setup(&SdfExpr::Sphere { radius: 1.0 }, 17);
        let mesh = full_extract(&field, &mask);

        let outward = mesh
            .vertices
            .iter()
            .filter(|v| v.normal.dot(v.position.normalize_or_zero()) > 0.0)
            .count();
        assert!(outward as f32 / mesh.vertex_count() as f32 > 0.9);
    }

    #[test]
    fn test_dc_overflow_reported() {
        let (field, mask) = setup(&SdfExpr::Sphere { radius: 1.0 }, 17);
        let window = CellWindow::full(field.spec.cell_counts());
        let budget = OutputBudget { max_vertices: 3, max_indices: 1000 };
        assert!(extract(&field, &mask, &window, &budget).is_err());
    }

    #[test]
    fn test_qef_three_planes_meet() {
        let intersections = vec![
            (Vec3::new(0.1, 0.0, 0.0), Vec3::X),
            (Vec3::new(0.0, 0.1, 0.0), Vec3::Y),
            (Vec3::new(0.0, 0.0, 0.1), Vec3::Z),
        ];
        let result = qef_solve(&intersections, Vec3::splat(-1.0), Vec3::splat(1.0));
        assert!(result.length() < 0.2, "QEF should find near-origin: {:?}", result);
    }

    #[test]
    fn test_qef_empty_falls_back_to_center() {
        let result = qef_solve(&[], Vec3::ZERO, Vec3::splat(2.0));
        assert_eq!(result, Vec3::splat(1.0));
    }
}
