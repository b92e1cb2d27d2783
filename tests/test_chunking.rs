//! Integration tests: chunked extraction equivalence and determinism
//!
//! Chunked runs must produce the same surface as a single-chunk run,
//! with seams welded away and a stable merge order.
//!
//! Author: Moroya Sakamoto

mod common;

use common::*;
use lumen_mesh::prelude::*;

fn assert_same_surface(single: &MeshBuffer, chunked: &MeshBuffer) {
    assert_eq!(
        single.triangle_count(),
        chunked.triangle_count(),
        "chunking changed the triangle count"
    );
    for v in &chunked.vertices {
        let nearest = single
            .vertices
            .iter()
            .map(|u| (u.position - v.position).length())
            .fold(f32::MAX, f32::min);
        assert!(
            nearest < 1e-3,
            "chunked vertex {:?} has no single-chunk twin ({})",
            v.position,
            nearest
        );
    }
}

// ============================================================================
// Equivalence against the single-chunk run
// ============================================================================

#[test]
fn chunked_marching_cubes_matches_single_chunk() {
    let req = request(Algorithm::MarchingCubes);
    let single = cpu_extractor().extract(SPHERE_DOC, &req).unwrap();
    let chunked = chunked_extractor(8).extract(SPHERE_DOC, &req).unwrap();
    assert_same_surface(&single, &chunked);
}

#[test]
fn chunked_dual_contouring_matches_single_chunk() {
    let req = request(Algorithm::DualContouring);
    let single = cpu_extractor().extract(SPHERE_DOC, &req).unwrap();
    let chunked = chunked_extractor(8).extract(SPHERE_DOC, &req).unwrap();
    assert_same_surface(&single, &chunked);
}

#[test]
fn chunked_cubes_matches_single_chunk() {
    let req = request(Algorithm::Cubes);
    let single = cpu_extractor().extract(SPHERE_DOC, &req).unwrap();
    let chunked = chunked_extractor(8).extract(SPHERE_DOC, &req).unwrap();
    assert_eq!(single.triangle_count(), chunked.triangle_count());
}

#[test]
fn chunked_mesh_is_watertight() {
    // Seam-duplicated vertices must have welded into shared indices
    let mesh = chunked_extractor(6)
        .extract(SPHERE_DOC, &request(Algorithm::MarchingCubes))
        .unwrap();
    assert_watertight(&mesh);
}

#[test]
fn uneven_chunk_sizes_still_cover_the_grid() {
    // 32 cells per axis split by 7: chunks of 7,7,7,7,4
    let req = request(Algorithm::MarchingCubes);
    let single = cpu_extractor().extract(SPHERE_DOC, &req).unwrap();
    let chunked = chunked_extractor(7).extract(SPHERE_DOC, &req).unwrap();
    assert_same_surface(&single, &chunked);
}

// ============================================================================
// Determinism and cancellation
// ============================================================================

#[test]
fn repeated_runs_are_identical() {
    let extractor = chunked_extractor(8);
    let req = request(Algorithm::MarchingCubes);
    let a = extractor.extract(SPHERE_DOC, &req).unwrap();
    let b = extractor.extract(SPHERE_DOC, &req).unwrap();

    assert_eq!(a.indices, b.indices);
    assert_eq!(a.vertex_count(), b.vertex_count());
    for (x, y) in a.vertices.iter().zip(&b.vertices) {
        assert_eq!(x.position, y.position);
        assert_eq!(x.normal, y.normal);
    }
}

#[test]
fn cancelled_request_yields_no_partial_mesh() {
    let extractor = chunked_extractor(4);
    let cancel = CancelToken::new();
    cancel.cancel();
    let result =
        extractor.extract_with_cancel(SPHERE_DOC, &request(Algorithm::MarchingCubes), &cancel);
    assert!(matches!(result, Err(ExtractError::Cancelled)));
}

#[test]
fn token_is_shared_across_clones() {
    let a = CancelToken::new();
    let b = a.clone();
    b.cancel();
    assert!(a.is_cancelled());
}
