//! Shared extraction-engine contract: algorithm selection, worst-case
//! output budgets, the bump allocator, and the owned-cell window.
//!
//! Every engine appends into pre-sized buffers through [`BumpAlloc`]; a
//! chunk that would exceed its budget fails with [`BufferOverflow`]
//! before any truncated geometry can escape.
//!
//! Author: Moroya Sakamoto

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::mesh::MeshBuffer;

/// Which extraction algorithm runs over the classified field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// 256-case table Marching Cubes with zero-crossing interpolation.
    MarchingCubes,
    /// QEF-based Dual Contouring, one vertex per active cell.
    DualContouring,
    /// One axis-aligned cube per active cell (debug visualization).
    Cubes,
}

impl Algorithm {
    /// Worst-case vertices and indices one active cell can emit.
    ///
    /// MC: 5 triangles as soup. DC: one vertex, up to 3 owned edges each
    /// producing a quad (6 indices). Cubes: 4 verts per face, 6 faces.
    #[inline]
    pub fn per_cell_bounds(&self) -> (u32, u32) {
        match self {
            Algorithm::MarchingCubes => (15, 15),
            Algorithm::DualContouring => (1, 18),
            Algorithm::Cubes => (24, 36),
        }
    }
}

/// Output capacity exhausted; the chunk must be split or the request fail.
#[derive(Debug, Clone, Copy, Error)]
#[error("output buffer overflow: needed {needed} vertices, capacity {capacity}")]
pub struct BufferOverflow {
    /// Vertices the engine needed to emit.
    pub needed: u32,
    /// Capacity the budget allowed.
    pub capacity: u32,
}

/// Hard output capacity for one chunk invocation, derived from the
/// active-cell count before any geometry is generated.
#[derive(Debug, Clone, Copy)]
pub struct OutputBudget {
    /// Maximum vertices the chunk may emit.
    pub max_vertices: u32,
    /// Maximum indices the chunk may emit.
    pub max_indices: u32,
}

impl OutputBudget {
    /// Exact worst-case budget for `active` cells under `algorithm`.
    pub fn for_active_cells(algorithm: Algorithm, active: usize) -> OutputBudget {
        let (v, i) = algorithm.per_cell_bounds();
        OutputBudget {
            max_vertices: (active as u32).saturating_mul(v),
            max_indices: (active as u32).saturating_mul(i),
        }
    }

    /// Clamp the vertex budget to an external byte ceiling.
    pub fn clamped_to_bytes(self, max_bytes: usize, bytes_per_vertex: usize) -> OutputBudget {
        let cap = (max_bytes / bytes_per_vertex.max(1)) as u32;
        OutputBudget {
            max_vertices: self.max_vertices.min(cap),
            max_indices: self.max_indices,
        }
    }
}

/// Ordered, thread-safe bump allocator over a fixed capacity.
///
/// The CPU realization of the GPU pass-2 atomic counter: concurrent
/// reservations never overlap, and exhaustion is an explicit error
/// rather than silent truncation.
#[derive(Debug)]
pub struct BumpAlloc {
    next: AtomicU32,
    capacity: u32,
}

impl BumpAlloc {
    /// Allocator over `capacity` slots.
    pub fn new(capacity: u32) -> Self {
        BumpAlloc {
            next: AtomicU32::new(0),
            capacity,
        }
    }

    /// Reserve `n` slots, returning the start offset.
    pub fn reserve(&self, n: u32) -> Result<u32, BufferOverflow> {
        let start = self.next.fetch_add(n, Ordering::Relaxed);
        if start.saturating_add(n) > self.capacity {
            return Err(BufferOverflow {
                needed: start.saturating_add(n),
                capacity: self.capacity,
            });
        }
        Ok(start)
    }

    /// Slots handed out so far.
    pub fn used(&self) -> u32 {
        self.next.load(Ordering::Relaxed).min(self.capacity)
    }
}

/// Half-open range of cells (local coordinates) an engine may emit for.
///
/// Chunked extraction samples a one-cell apron beyond this window so
/// gradients and dual-cell vertices match the single-chunk result, but
/// only windowed cells produce geometry — each global cell is owned by
/// exactly one chunk.
#[derive(Debug, Clone, Copy)]
pub struct CellWindow {
    /// Inclusive lower cell corner.
    pub lo: [u32; 3],
    /// Exclusive upper cell corner.
    pub hi: [u32; 3],
}

impl CellWindow {
    /// Window covering every cell of a grid with the given cell counts.
    pub fn full(cells: [u32; 3]) -> CellWindow {
        CellWindow { lo: [0; 3], hi: cells }
    }

    /// Whether the cell at `(x, y, z)` is owned.
    #[inline(always)]
    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        (x as u32) >= self.lo[0]
            && (x as u32) < self.hi[0]
            && (y as u32) >= self.lo[1]
            && (y as u32) < self.hi[1]
            && (z as u32) >= self.lo[2]
            && (z as u32) < self.hi[2]
    }

    /// Number of owned cells.
    pub fn cell_count(&self) -> usize {
        (self.hi[0] - self.lo[0]) as usize
            * (self.hi[1] - self.lo[1]) as usize
            * (self.hi[2] - self.lo[2]) as usize
    }
}

/// Merge slab sub-meshes in order while charging the vertex and index
/// counts against a budget-backed allocator.
///
/// The slabs were built concurrently; the merge is the ordered
/// reservation point, so the capacity check is exact and deterministic.
pub fn merge_bounded(
    sub_meshes: Vec<MeshBuffer>,
    budget: &OutputBudget,
) -> Result<MeshBuffer, BufferOverflow> {
    let verts = BumpAlloc::new(budget.max_vertices);
    let indices = BumpAlloc::new(budget.max_indices);

    for sub in &sub_meshes {
        verts.reserve(sub.vertices.len() as u32)?;
        indices.reserve(sub.indices.len() as u32)?;
    }

    Ok(MeshBuffer::merge(sub_meshes))
}
