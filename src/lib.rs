//! # lumen-mesh
//!
//! SDF scene programs to triangle meshes: GPU compute extraction with a
//! transparent CPU fallback.
//!
//! A scene arrives as a JSON document describing a signed distance
//! expression (plus optional materials and a color section). The
//! extractor samples it over a grid, classifies surface-crossing cells,
//! and runs Marching Cubes, Dual Contouring, or a debug cube engine over
//! the active set — on the GPU when an adapter exists, on the CPU
//! otherwise, with identical topology either way.
//!
//! ## Features
//!
//! - **Scene programs**: JSON documents with a reusable `library`,
//!   validated and cached by source hash
//! - **Three engines**: Marching Cubes, QEF Dual Contouring, debug Cubes
//! - **Chunked extraction**: large grids split with a one-cell apron,
//!   merged deterministically, welded seam-free
//! - **GPU compute**: three-pass wgpu pipeline (sample, classify, mesh)
//!   generated from the same expression tree the CPU interprets
//! - **Color pass**: material + stylized lighting per vertex, same math
//!   on both devices
//!
//! ## Example
//!
//! ```no_run
//! use lumen_mesh::prelude::*;
//!
//! let extractor = MeshExtractor::new();
//! let mesh = extractor.extract(
//!     r#"{"distance": {"sphere": {"radius": 1.0}}}"#,
//!     &ExtractRequest {
//!         min: glam::Vec3::splat(-1.5),
//!         max: glam::Vec3::splat(1.5),
//!         resolution: [64, 64, 64],
//!         algorithm: Algorithm::MarchingCubes,
//!         include_colors: false,
//!         voxel_size: None,
//!         time: 0.0,
//!     },
//! )?;
//! assert!(mesh.validate().is_ok());
//! # Ok::<(), lumen_mesh::ExtractError>(())
//! ```
//!
//! ## Author
//!
//! Moroya Sakamoto

#![warn(missing_docs)]

pub mod cpu;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod grid;
pub mod mesh;
pub mod pipeline;
pub(crate) mod tables;
pub mod scene;

pub use error::ExtractError;
pub use pipeline::{CancelToken, ExtractRequest, ExtractorConfig, MeshExtractor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude - commonly used types and functions
pub mod prelude {
    pub use crate::engine::{Algorithm, OutputBudget};
    pub use crate::error::ExtractError;
    pub use crate::grid::{ActiveMask, DistanceField, GridSpec};
    pub use crate::mesh::{MeshBuffer, MeshError, Vertex};
    pub use crate::pipeline::{CancelToken, ExtractRequest, ExtractorConfig, MeshExtractor};
    pub use crate::scene::{
        ColorSpec, Material, ProgramCache, SceneBuildError, SceneProgram, SdfExpr,
    };
}
