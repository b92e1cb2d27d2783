//! Extraction pipeline: chunk planning, dispatch, merge, weld, colors.
//!
//! A request is split into chunks whose grids overlap neighbors by one
//! sample row; each chunk owns a disjoint window of cells and only
//! emits geometry for those, so the merged mesh is identical to a
//! single-chunk run up to float associativity. GPU chunks are
//! submitted sequentially against pooled buffers; CPU chunks run in
//! parallel. A chunk that fails on the GPU retries on the CPU; a chunk
//! that overflows its output budget is split and re-run.
//!
//! Author: Moroya Sakamoto

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use glam::Vec3;
use rayon::prelude::*;

use crate::cpu;
use crate::engine::{Algorithm, CellWindow, OutputBudget};
use crate::error::ExtractError;
use crate::gpu::extract::GpuExtractError;
use crate::gpu::{self, GpuContext};
use crate::grid::{ActiveMask, GridSpec};
use crate::mesh::{MeshBuffer, Vertex};
use crate::scene::{color::shade_vertex, ProgramCache, SceneProgram, DEFAULT_BASE_COLOR};

/// Cooperative cancellation flag, checked between chunks.
///
/// In-flight chunks run to completion and are discarded; a cancelled
/// request yields [`ExtractError::Cancelled`], never a partial mesh.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// One extraction request: grid, algorithm, and output options.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    /// Minimum corner of the sampled box.
    pub min: Vec3,
    /// Maximum corner of the sampled box.
    pub max: Vec3,
    /// Grid points per axis.
    pub resolution: [u32; 3],
    /// Extraction algorithm.
    pub algorithm: Algorithm,
    /// Run the color pass and attach per-vertex colors.
    pub include_colors: bool,
    /// Cube edge length for [`Algorithm::Cubes`]; `None` fills the cell.
    pub voxel_size: Option<f32>,
    /// Scene time forwarded to samplers and the color pass.
    pub time: f32,
}

/// Extractor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Approximate per-chunk memory ceiling (field + worst-case output).
    pub chunk_budget_bytes: usize,
    /// How many times an overflowing chunk may split before failing.
    pub max_split_retries: u32,
    /// Never touch the GPU, even when one is available.
    pub force_cpu: bool,
    /// Fail instead of falling back to the CPU engine.
    pub require_gpu: bool,
    /// Weld seam-duplicated vertices after the merge.
    pub weld: bool,
    /// Fixed per-axis cell ceiling, overriding the budget derivation.
    pub chunk_ceiling: Option<u32>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig {
            chunk_budget_bytes: 256 * 1024 * 1024,
            max_split_retries: 3,
            force_cpu: false,
            require_gpu: false,
            weld: true,
            chunk_ceiling: None,
        }
    }
}

/// One chunk of the plan: a local grid with a one-cell apron plus the
/// owned window inside it.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    spec: GridSpec,
    window: CellWindow,
    owned_lo: [u32; 3],
    owned_hi: [u32; 3],
}

/// Apron cells each chunk samples beyond its owned window.
///
/// One cell gives every owned corner a central-difference gradient. DC
/// quads also reference the ring of cells around the window, so those
/// cells need central gradients too: two cells.
fn apron_for(algorithm: Algorithm) -> u32 {
    match algorithm {
        Algorithm::DualContouring => 2,
        _ => 1,
    }
}

fn make_chunk(global: &GridSpec, owned_lo: [u32; 3], owned_hi: [u32; 3], apron: u32) -> Chunk {
    let cells = global.cell_counts();
    let mut lo_p = [0u32; 3];
    let mut hi_p = [0u32; 3];
    for a in 0..3 {
        // Apron clamps at the global boundary, where one-sided gradients
        // match the single-chunk run anyway.
        lo_p[a] = owned_lo[a].saturating_sub(apron);
        hi_p[a] = (owned_hi[a] + apron).min(cells[a]);
    }

    let min = global.position(lo_p[0] as usize, lo_p[1] as usize, lo_p[2] as usize);
    let max = global.position(hi_p[0] as usize, hi_p[1] as usize, hi_p[2] as usize);
    let spec = GridSpec {
        min,
        max,
        resolution: [
            hi_p[0] - lo_p[0] + 1,
            hi_p[1] - lo_p[1] + 1,
            hi_p[2] - lo_p[2] + 1,
        ],
        time: global.time,
    };
    let window = CellWindow {
        lo: [
            owned_lo[0] - lo_p[0],
            owned_lo[1] - lo_p[1],
            owned_lo[2] - lo_p[2],
        ],
        hi: [
            owned_hi[0] - lo_p[0],
            owned_hi[1] - lo_p[1],
            owned_hi[2] - lo_p[2],
        ],
    };

    Chunk { spec, window, owned_lo, owned_hi }
}

/// Split the cell region `[lo, hi)` into ceiling-sized chunks, X
/// fastest. Plan order is the merge order.
fn plan_region(
    global: &GridSpec,
    lo: [u32; 3],
    hi: [u32; 3],
    ceiling: u32,
    apron: u32,
) -> Vec<Chunk> {
    let ranges = |a: usize| -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        let mut start = lo[a];
        while start < hi[a] {
            let end = (start + ceiling).min(hi[a]);
            out.push((start, end));
            start = end;
        }
        out
    };

    let (xs, ys, zs) = (ranges(0), ranges(1), ranges(2));
    let mut chunks = Vec::with_capacity(xs.len() * ys.len() * zs.len());
    for &(z0, z1) in &zs {
        for &(y0, y1) in &ys {
            for &(x0, x1) in &xs {
                chunks.push(make_chunk(global, [x0, y0, z0], [x1, y1, z1], apron));
            }
        }
    }
    chunks
}

/// The extraction front door: program cache, lazy GPU context, chunked
/// dispatch with CPU fallback.
#[derive(Debug, Default)]
pub struct MeshExtractor {
    config: ExtractorConfig,
    cache: ProgramCache,
    gpu: OnceLock<Result<GpuContext, String>>,
}

impl MeshExtractor {
    /// Extractor with default configuration.
    pub fn new() -> Self {
        MeshExtractor::default()
    }

    /// Extractor with explicit configuration.
    pub fn with_config(config: ExtractorConfig) -> Self {
        MeshExtractor { config, ..Default::default() }
    }

    /// Extract a mesh from scene source text.
    pub fn extract(&self, source: &str, req: &ExtractRequest) -> Result<MeshBuffer, ExtractError> {
        self.extract_with_cancel(source, req, &CancelToken::new())
    }

    /// Extract with cooperative cancellation.
    pub fn extract_with_cancel(
        &self,
        source: &str,
        req: &ExtractRequest,
        cancel: &CancelToken,
    ) -> Result<MeshBuffer, ExtractError> {
        // Structural validation happens before any device work
        let spec = GridSpec::new(req.min, req.max, req.resolution, req.time)?;
        let program = self.cache.get_or_build(source)?;

        if self.config.require_gpu && self.gpu().is_none() {
            return Err(ExtractError::DeviceUnavailable(self.gpu_failure()));
        }

        let ceiling = self.derive_ceiling(req.algorithm);
        log::debug!(
            "extracting {:?} over {:?} cells, chunk ceiling {}",
            req.algorithm,
            spec.cell_counts(),
            ceiling
        );

        let mut mesh = self.extract_region(
            program.as_ref(),
            &spec,
            [0; 3],
            spec.cell_counts(),
            ceiling,
            self.config.max_split_retries,
            req,
            cancel,
        )?;

        if self.config.weld {
            mesh.weld();
        }
        if req.include_colors {
            self.color_pass(program.as_ref(), &mut mesh, req.time);
        }

        log::info!(
            "extraction complete: {} vertices, {} triangles",
            mesh.vertex_count(),
            mesh.triangle_count()
        );
        Ok(mesh)
    }

    /// Lazily acquired GPU context; `None` selects the CPU engine.
    fn gpu(&self) -> Option<&GpuContext> {
        if self.config.force_cpu {
            return None;
        }
        match self
            .gpu
            .get_or_init(|| GpuContext::new().map_err(|e| e.to_string()))
        {
            Ok(ctx) => Some(ctx),
            Err(reason) => {
                log::debug!("gpu unavailable ({}), using cpu engine", reason);
                None
            }
        }
    }

    fn gpu_failure(&self) -> String {
        if self.config.force_cpu {
            return "cpu forced by configuration".to_string();
        }
        match self.gpu.get() {
            Some(Err(reason)) => reason.clone(),
            _ => "no adapter".to_string(),
        }
    }

    /// Per-axis cell ceiling so that one chunk's field plus worst-case
    /// output stays inside the memory budget.
    fn derive_ceiling(&self, algorithm: Algorithm) -> u32 {
        if let Some(c) = self.config.chunk_ceiling {
            return c.max(1);
        }
        let (v, i) = algorithm.per_cell_bounds();
        let per_cell = 4 + v as usize * 32 + i as usize * 4;
        let c = (self.config.chunk_budget_bytes as f64 / per_cell as f64).cbrt() as u32;
        c.clamp(8, 256)
    }

    #[allow(clippy::too_many_arguments)]
    fn extract_region(
        &self,
        program: &SceneProgram,
        global: &GridSpec,
        lo: [u32; 3],
        hi: [u32; 3],
        ceiling: u32,
        retries: u32,
        req: &ExtractRequest,
        cancel: &CancelToken,
    ) -> Result<MeshBuffer, ExtractError> {
        let chunks = plan_region(global, lo, hi, ceiling, apron_for(req.algorithm));

        let run = |ci: usize, chunk: &Chunk| -> Result<MeshBuffer, ExtractError> {
            if cancel.is_cancelled() {
                return Err(ExtractError::Cancelled);
            }
            match self.run_chunk(ci, program, chunk, req) {
                Err(ExtractError::Overflow(o)) => {
                    if retries == 0 || ceiling < 2 {
                        return Err(ExtractError::Overflow(o));
                    }
                    log::warn!(
                        "chunk {} overflowed ({}), splitting with ceiling {}",
                        ci,
                        o,
                        ceiling / 2
                    );
                    self.extract_region(
                        program,
                        global,
                        chunk.owned_lo,
                        chunk.owned_hi,
                        ceiling / 2,
                        retries - 1,
                        req,
                        cancel,
                    )
                }
                other => other,
            }
        };

        // GPU chunks go through one queue sequentially; pure CPU plans
        // fan out across chunks.
        let sub_meshes: Vec<MeshBuffer> = if self.gpu().is_some() {
            let mut out = Vec::with_capacity(chunks.len());
            for (ci, chunk) in chunks.iter().enumerate() {
                out.push(run(ci, chunk)?);
            }
            out
        } else {
            chunks
                .par_iter()
                .enumerate()
                .map(|(ci, chunk)| run(ci, chunk))
                .collect::<Result<_, _>>()?
        };

        Ok(MeshBuffer::merge(sub_meshes))
    }

    fn run_chunk(
        &self,
        index: usize,
        program: &SceneProgram,
        chunk: &Chunk,
        req: &ExtractRequest,
    ) -> Result<MeshBuffer, ExtractError> {
        // Same budget on both engines so overflow behavior is identical.
        // DC allocates a vertex per active cell of the dilated window,
        // which can spill past the owned count; budget by the local grid.
        let budget_cells = match req.algorithm {
            Algorithm::DualContouring => chunk.spec.cell_count(),
            _ => chunk.window.cell_count(),
        };
        let budget = OutputBudget::for_active_cells(req.algorithm, budget_cells)
            .clamped_to_bytes(self.config.chunk_budget_bytes, std::mem::size_of::<Vertex>());

        if let Some(ctx) = self.gpu() {
            match req.algorithm {
                // DC meshes on the CPU over a GPU-sampled field
                Algorithm::DualContouring => {
                    match gpu::extract::sample_field_gpu(ctx, program, &chunk.spec) {
                        Ok(field) => {
                            let mask = ActiveMask::classify(&field);
                            return cpu::extract(
                                &field,
                                &mask,
                                &chunk.window,
                                req.algorithm,
                                &budget,
                                req.voxel_size,
                            )
                            .map_err(ExtractError::from);
                        }
                        Err(GpuExtractError::Overflow(o)) => return Err(o.into()),
                        Err(GpuExtractError::Gpu(e)) => {
                            if self.config.require_gpu {
                                return Err(ExtractError::ChunkDispatch { chunk: index, source: e });
                            }
                            log::warn!(
                                "gpu sampling for chunk {} failed ({}), retrying on cpu",
                                index,
                                e
                            );
                        }
                    }
                }
                _ => {
                    match gpu::extract::extract_chunk(
                        ctx,
                        program,
                        &chunk.spec,
                        &chunk.window,
                        req.algorithm,
                        &budget,
                        req.voxel_size,
                    ) {
                        Ok(mesh) => return Ok(mesh),
                        Err(GpuExtractError::Overflow(o)) => return Err(o.into()),
                        Err(GpuExtractError::Gpu(e)) => {
                            if self.config.require_gpu {
                                return Err(ExtractError::ChunkDispatch { chunk: index, source: e });
                            }
                            log::warn!("gpu chunk {} failed ({}), retrying on cpu", index, e);
                        }
                    }
                }
            }
        }

        let field = cpu::sample_field(&program.distance, &chunk.spec);
        let mask = ActiveMask::classify(&field);
        cpu::extract(
            &field,
            &mask,
            &chunk.window,
            req.algorithm,
            &budget,
            req.voxel_size,
        )
        .map_err(ExtractError::from)
    }

    /// Attach per-vertex colors. A scene without a `color` section gets
    /// the flat gray fill; shading never aborts an extraction.
    fn color_pass(&self, program: &SceneProgram, mesh: &mut MeshBuffer, time: f32) {
        let spec = match &program.color {
            Some(spec) => *spec,
            None => {
                mesh.colors = Some(vec![DEFAULT_BASE_COLOR; mesh.vertex_count()]);
                return;
            }
        };

        if let Some(ctx) = self.gpu() {
            match gpu::color::shade_mesh_gpu(ctx, program, &spec, mesh, time) {
                Ok(colors) => {
                    mesh.colors = Some(colors);
                    return;
                }
                Err(e) => log::warn!("gpu color pass failed ({}), using cpu shader", e),
            }
        }

        let colors = mesh
            .vertices
            .par_iter()
            .map(|v| shade_vertex(program, v.position, v.normal, time))
            .collect();
        mesh.colors = Some(colors);
    }
}
