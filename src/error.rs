//! Top-level extraction errors.
//!
//! Structural errors (bad scene, bad grid) surface before any device
//! work happens and are never retried. Device-level chunk failures are
//! retried on the CPU unless the caller demanded the GPU; overflow is
//! retried by splitting the chunk until the retry budget runs out.
//!
//! Author: Moroya Sakamoto

use thiserror::Error;

use crate::engine::BufferOverflow;
use crate::gpu::GpuError;
use crate::grid::InvalidGridSpec;
use crate::scene::SceneBuildError;

/// Why an extraction request failed.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The scene source could not be built into a program.
    #[error(transparent)]
    Scene(#[from] SceneBuildError),

    /// The request's grid is degenerate.
    #[error(transparent)]
    Grid(#[from] InvalidGridSpec),

    /// The caller required the GPU and none could be acquired.
    #[error("GPU required but unavailable: {0}")]
    DeviceUnavailable(String),

    /// A chunk dispatch failed and CPU retry was ruled out.
    #[error("chunk {chunk} dispatch failed: {source}")]
    ChunkDispatch {
        /// Index of the failing chunk in plan order.
        chunk: usize,
        /// The underlying device failure.
        source: GpuError,
    },

    /// Output budget exhausted even after chunk splitting.
    #[error(transparent)]
    Overflow(#[from] BufferOverflow),

    /// The request was cancelled between chunks.
    #[error("extraction cancelled")]
    Cancelled,
}
