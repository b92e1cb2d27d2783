//! Sampling grid model: grid specification, distance field, active-cell mask.
//!
//! Grid point positions are always derived algebraically from the point
//! index — no position buffer exists anywhere in the pipeline, on either
//! the CPU or GPU path. The only per-grid state that crosses to the GPU
//! is a small uniform block.
//!
//! Author: Moroya Sakamoto

use glam::Vec3;
use thiserror::Error;

/// Rejected grid specification.
#[derive(Debug, Error)]
#[error("invalid grid spec: {reason}")]
pub struct InvalidGridSpec {
    /// Human-readable reason the spec was rejected.
    pub reason: String,
}

/// Axis-aligned sampling grid over a world-space bounding box.
///
/// `resolution` counts grid *points* per axis; cells per axis are one
/// fewer. Point `(ix, iy, iz)` sits at `min + (max - min) * i / (n - 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    /// Minimum corner of the sampled box.
    pub min: Vec3,
    /// Maximum corner of the sampled box.
    pub max: Vec3,
    /// Grid points per axis (each >= 2).
    pub resolution: [u32; 3],
    /// Scene time forwarded to both samplers.
    pub time: f32,
}

impl GridSpec {
    /// Build a spec and validate it in one step.
    pub fn new(min: Vec3, max: Vec3, resolution: [u32; 3], time: f32) -> Result<Self, InvalidGridSpec> {
        let spec = GridSpec { min, max, resolution, time };
        spec.validate()?;
        Ok(spec)
    }

    /// Reject degenerate or non-finite grids before any device work happens.
    pub fn validate(&self) -> Result<(), InvalidGridSpec> {
        for (axis, &n) in self.resolution.iter().enumerate() {
            if n < 2 {
                return Err(InvalidGridSpec {
                    reason: format!("resolution[{}] = {} (minimum is 2 points per axis)", axis, n),
                });
            }
        }
        if !self.min.is_finite() || !self.max.is_finite() || !self.time.is_finite() {
            return Err(InvalidGridSpec {
                reason: "bounds and time must be finite".to_string(),
            });
        }
        if self.min.x >= self.max.x || self.min.y >= self.max.y || self.min.z >= self.max.z {
            return Err(InvalidGridSpec {
                reason: format!("bounds are inverted or degenerate: min {:?}, max {:?}", self.min, self.max),
            });
        }
        Ok(())
    }

    /// Total number of grid points.
    #[inline]
    pub fn point_count(&self) -> usize {
        self.resolution[0] as usize * self.resolution[1] as usize * self.resolution[2] as usize
    }

    /// Cells per axis (`resolution - 1`).
    #[inline]
    pub fn cell_counts(&self) -> [u32; 3] {
        [
            self.resolution[0] - 1,
            self.resolution[1] - 1,
            self.resolution[2] - 1,
        ]
    }

    /// Total number of cells.
    #[inline]
    pub fn cell_count(&self) -> usize {
        let c = self.cell_counts();
        c[0] as usize * c[1] as usize * c[2] as usize
    }

    /// World-space extent of a single cell.
    #[inline]
    pub fn cell_size(&self) -> Vec3 {
        (self.max - self.min)
            / Vec3::new(
                (self.resolution[0] - 1) as f32,
                (self.resolution[1] - 1) as f32,
                (self.resolution[2] - 1) as f32,
            )
    }

    /// Linear index of point `(x, y, z)`, X fastest.
    #[inline(always)]
    pub fn point_index(&self, x: usize, y: usize, z: usize) -> usize {
        x + y * self.resolution[0] as usize
            + z * self.resolution[0] as usize * self.resolution[1] as usize
    }

    /// Position of point `(x, y, z)`, derived algebraically.
    #[inline(always)]
    pub fn position(&self, x: usize, y: usize, z: usize) -> Vec3 {
        self.min + self.cell_size() * Vec3::new(x as f32, y as f32, z as f32)
    }

    /// Position of a point given its linear index.
    #[inline(always)]
    pub fn position_linear(&self, idx: usize) -> Vec3 {
        let nx = self.resolution[0] as usize;
        let ny = self.resolution[1] as usize;
        let x = idx % nx;
        let y = (idx / nx) % ny;
        let z = idx / (nx * ny);
        self.position(x, y, z)
    }
}

/// Inside test shared by the classifier and every engine.
///
/// An exact zero counts as inside, so a corner sitting on the surface
/// forms a sign change against any strictly positive neighbor.
#[inline(always)]
pub fn is_inside(d: f32) -> bool {
    d <= 0.0
}

/// Sampled signed distances for one grid, owned per chunk invocation.
#[derive(Debug, Clone)]
pub struct DistanceField {
    /// The grid this field was sampled over.
    pub spec: GridSpec,
    /// Exactly `spec.point_count()` values, X fastest.
    pub values: Vec<f32>,
}

impl DistanceField {
    /// Distance at grid point `(x, y, z)`.
    #[inline(always)]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
        self.values[self.spec.point_index(x, y, z)]
    }

    /// Field gradient at a grid point via central differences.
    ///
    /// Clamps neighbor lookups at the grid boundary (one-sided difference),
    /// the same rule the generated WGSL applies.
    #[inline(always)]
    pub fn gradient(&self, x: usize, y: usize, z: usize) -> Vec3 {
        let nx = self.spec.resolution[0] as usize;
        let ny = self.spec.resolution[1] as usize;
        let nz = self.spec.resolution[2] as usize;
        let cell = self.spec.cell_size();

        let xp = (x + 1).min(nx - 1);
        let xm = x.saturating_sub(1);
        let yp = (y + 1).min(ny - 1);
        let ym = y.saturating_sub(1);
        let zp = (z + 1).min(nz - 1);
        let zm = z.saturating_sub(1);

        Vec3::new(
            (self.get(xp, y, z) - self.get(xm, y, z)) / ((xp - xm) as f32 * cell.x),
            (self.get(x, yp, z) - self.get(x, ym, z)) / ((yp - ym) as f32 * cell.y),
            (self.get(x, y, zp) - self.get(x, y, zm)) / ((zp - zm) as f32 * cell.z),
        )
    }
}

/// Bitset over grid cells marking which ones intersect the surface.
///
/// A cell is active iff its 8 corner distances are not uniformly signed
/// under [`is_inside`]. Extraction is bounded strictly by this mask: no
/// engine emits geometry for an inactive cell.
#[derive(Debug, Clone)]
pub struct ActiveMask {
    bits: Vec<u64>,
    cells: [u32; 3],
    active: usize,
}

impl ActiveMask {
    /// Classify every cell of a sampled field. Pure and deterministic.
    pub fn classify(field: &DistanceField) -> ActiveMask {
        use rayon::prelude::*;

        let cells = field.spec.cell_counts();
        let cell_count = field.spec.cell_count();
        let cx = cells[0] as usize;
        let cy = cells[1] as usize;

        // Flags first (parallel), packed second; the packing loop is
        // branch-light and memory-bound anyway.
        let flags: Vec<bool> = (0..cell_count)
            .into_par_iter()
            .map(|ci| {
                let x = ci % cx;
                let y = (ci / cx) % cy;
                let z = ci / (cx * cy);
                let first = is_inside(field.get(x, y, z));
                for &[dx, dy, dz] in crate::tables::CORNER_OFFSETS.iter().skip(1) {
                    if is_inside(field.get(x + dx, y + dy, z + dz)) != first {
                        return true;
                    }
                }
                false
            })
            .collect();

        let mut bits = vec![0u64; (cell_count + 63) / 64];
        let mut active = 0usize;
        for (ci, &on) in flags.iter().enumerate() {
            if on {
                bits[ci / 64] |= 1 << (ci % 64);
                active += 1;
            }
        }

        ActiveMask { bits, cells, active }
    }

    /// Cells per axis this mask covers.
    #[inline]
    pub fn cell_counts(&self) -> [u32; 3] {
        self.cells
    }

    /// Number of active cells.
    #[inline]
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Whether the cell at linear index `ci` is active.
    #[inline(always)]
    pub fn is_active(&self, ci: usize) -> bool {
        self.bits[ci / 64] & (1 << (ci % 64)) != 0
    }

    /// Whether the cell at `(x, y, z)` is active.
    #[inline(always)]
    pub fn is_active_at(&self, x: usize, y: usize, z: usize) -> bool {
        let ci = x + y * self.cells[0] as usize + z * self.cells[0] as usize * self.cells[1] as usize;
        self.is_active(ci)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_spec(res: u32) -> GridSpec {
        GridSpec {
            min: Vec3::splat(-1.0),
            max: Vec3::splat(1.0),
            resolution: [res; 3],
            time: 0.0,
        }
    }

    #[test]
    fn test_validate_rejects_bad_resolution() {
        let mut spec = unit_spec(8);
        spec.resolution[1] = 1;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut spec = unit_spec(8);
        spec.max.x = -2.0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nan() {
        let mut spec = unit_spec(8);
        spec.min.z = f32::NAN;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_positions_span_bounds() {
        let spec = unit_spec(5);
        assert_eq!(spec.position(0, 0, 0), Vec3::splat(-1.0));
        assert_eq!(spec.position(4, 4, 4), Vec3::splat(1.0));
        assert_eq!(spec.position_linear(spec.point_count() - 1), Vec3::splat(1.0));
    }

    #[test]
    fn test_anisotropic_resolution() {
        let spec = GridSpec {
            min: Vec3::ZERO,
            max: Vec3::new(2.0, 1.0, 4.0),
            resolution: [5, 3, 9],
            time: 0.0,
        };
        assert!(spec.validate().is_ok());
        assert_eq!(spec.cell_counts(), [4, 2, 8]);
        assert_eq!(spec.cell_size(), Vec3::splat(0.5));
        assert_eq!(spec.position(4, 2, 8), Vec3::new(2.0, 1.0, 4.0));
    }

    #[test]
    fn test_zero_counts_as_inside() {
        assert!(is_inside(0.0));
        assert!(is_inside(-0.5));
        assert!(!is_inside(0.5));
    }

    #[test]
    fn test_classify_sphere_band() {
        // Plane z = 0 through the middle of the box: active cells form
        // exactly one Z-slab band.
        let spec = unit_spec(9);
        let values: Vec<f32> = (0..spec.point_count())
            .map(|i| spec.position_linear(i).z)
            .collect();
        let field = DistanceField { spec, values };
        let mask = ActiveMask::classify(&field);

        let cells = mask.cell_counts();
        // z = 0 lies on a grid point (resolution 9 over [-1,1]), and the
        // inside rule makes the zero row inside; the cells just above it
        // see a sign change.
        assert_eq!(mask.active_count(), (cells[0] * cells[1]) as usize);
    }

    #[test]
    fn test_classify_uniform_field_inactive() {
        let spec = unit_spec(6);
        let field = DistanceField {
            spec,
            values: vec![1.0; spec.point_count()],
        };
        let mask = ActiveMask::classify(&field);
        assert_eq!(mask.active_count(), 0);
    }

    #[test]
    fn test_classify_deterministic() {
        let spec = unit_spec(12);
        let values: Vec<f32> = (0..spec.point_count())
            .map(|i| spec.position_linear(i).length() - 0.7)
            .collect();
        let field = DistanceField { spec, values };
        let a = ActiveMask::classify(&field);
        let b = ActiveMask::classify(&field);
        assert_eq!(a.active_count(), b.active_count());
        for ci in 0..spec.cell_count() {
            assert_eq!(a.is_active(ci), b.is_active(ci));
        }
    }

    #[test]
    fn test_gradient_boundary_clamp() {
        let spec = unit_spec(4);
        let values: Vec<f32> = (0..spec.point_count())
            .map(|i| spec.position_linear(i).x)
            .collect();
        let field = DistanceField { spec, values };
        // d = x everywhere: gradient should be +X at interior and boundary alike
        let g = field.gradient(0, 0, 0);
        assert!((g.x - 1.0).abs() < 1e-5, "one-sided gradient: {:?}", g);
        let g = field.gradient(2, 2, 2);
        assert!((g.x - 1.0).abs() < 1e-5);
        assert!(g.y.abs() < 1e-5 && g.z.abs() < 1e-5);
    }
}
