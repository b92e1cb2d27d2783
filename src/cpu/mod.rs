//! CPU engine: parallel field sampling plus all three extraction
//! algorithms against the interpreted distance expression.
//!
//! Semantics are identical to the GPU path — same inside rule, same
//! tables, same interpolation, same grid-gradient normals — so a chunk
//! that falls back to the CPU is indistinguishable in the merged mesh.
//!
//! # Deep Fried Optimizations
//! - **Linear-index sampling**: one flat `par_iter` over the grid,
//!   positions derived algebraically (no position buffer).
//! - **Z-Slab extraction**: slabs build sub-meshes independently, merged
//!   through the ordered bounded allocator afterward.
//!
//! Author: Moroya Sakamoto

pub mod cubes;
pub mod dual_contouring;
pub mod marching_cubes;

use rayon::prelude::*;

use crate::engine::{Algorithm, BufferOverflow, CellWindow, OutputBudget};
use crate::grid::{ActiveMask, DistanceField, GridSpec};
use crate::mesh::MeshBuffer;
use crate::scene::SdfExpr;

/// Sample the distance expression over every grid point in parallel.
pub fn sample_field(expr: &SdfExpr, spec: &GridSpec) -> DistanceField {
    let values: Vec<f32> = (0..spec.point_count())
        .into_par_iter()
        .map(|i| expr.eval(spec.position_linear(i)))
        .collect();
    DistanceField { spec: *spec, values }
}

/// Run one extraction algorithm over a classified field.
///
/// `voxel_size` only applies to [`Algorithm::Cubes`]; `None` uses the
/// grid cell size.
pub fn extract(
    field: &DistanceField,
    mask: &ActiveMask,
    window: &CellWindow,
    algorithm: Algorithm,
    budget: &OutputBudget,
    voxel_size: Option<f32>,
) -> Result<MeshBuffer, BufferOverflow> {
    match algorithm {
        Algorithm::MarchingCubes => marching_cubes::extract(field, mask, window, budget),
        Algorithm::DualContouring => dual_contouring::extract(field, mask, window, budget),
        Algorithm::Cubes => cubes::extract(field, mask, window, budget, voxel_size),
    }
}
