//! Common test helpers for lumen-mesh integration tests
//!
//! Author: Moroya Sakamoto

#![allow(dead_code)]

use std::collections::HashMap;

use lumen_mesh::prelude::*;

// ============================================================================
// Standard scene documents
// ============================================================================

/// Unit sphere at origin
pub const SPHERE_DOC: &str = r#"{"distance": {"sphere": {"radius": 1.0}}}"#;

/// Sphere with a box carved out, built through library references
pub const CSG_DOC: &str = r#"{
    "library": {
        "cutter": {"box": {"half_extents": [0.6, 0.6, 0.6]}}
    },
    "distance": {"subtract": [{"sphere": {"radius": 1.0}}, {"ref": "cutter"}]}
}"#;

/// Two-material smooth union with a full color section
pub const COLORED_DOC: &str = r#"{
    "distance": {"smooth_union": {"k": 0.3, "items": [
        {"material": {"id": 1, "child": {"sphere": {"radius": 0.8}}}},
        {"material": {"id": 2, "child": {"translate": {
            "offset": [0.6, 0.0, 0.0],
            "child": {"box": {"half_extents": [0.4, 0.4, 0.4]}}
        }}}}
    ]}},
    "materials": [
        {"id": 1, "base_color": [0.9, 0.2, 0.1]},
        {"id": 2, "base_color": [0.1, 0.4, 0.9]}
    ],
    "color": {"rim": 0.2, "specular": 0.3, "posterize_levels": 0}
}"#;

// ============================================================================
// Requests and extractors
// ============================================================================

/// Standard request: unit-shape bounds, moderate resolution
pub fn request(algorithm: Algorithm) -> ExtractRequest {
    ExtractRequest {
        min: glam::Vec3::splat(-1.5),
        max: glam::Vec3::splat(1.5),
        resolution: [33, 33, 33],
        algorithm,
        include_colors: false,
        voxel_size: None,
        time: 0.0,
    }
}

/// CPU-only extractor, single chunk at test resolutions
pub fn cpu_extractor() -> MeshExtractor {
    MeshExtractor::with_config(ExtractorConfig {
        force_cpu: true,
        ..Default::default()
    })
}

/// CPU-only extractor with a forced per-axis chunk ceiling
pub fn chunked_extractor(ceiling: u32) -> MeshExtractor {
    MeshExtractor::with_config(ExtractorConfig {
        force_cpu: true,
        chunk_ceiling: Some(ceiling),
        ..Default::default()
    })
}

// ============================================================================
// Mesh checks
// ============================================================================

/// Count how many triangles use each undirected edge.
pub fn edge_use_counts(mesh: &MeshBuffer) -> HashMap<(u32, u32), u32> {
    let mut counts = HashMap::new();
    for tri in mesh.indices.chunks_exact(3) {
        for &(a, b) in &[(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
            let key = (a.min(b), a.max(b));
            *counts.entry(key).or_insert(0) += 1;
        }
    }
    counts
}

/// Assert every edge is shared by exactly two triangles (closed surface).
pub fn assert_watertight(mesh: &MeshBuffer) {
    let counts = edge_use_counts(mesh);
    assert!(!counts.is_empty(), "mesh has no edges");
    for (edge, count) in counts {
        assert_eq!(
            count, 2,
            "edge {:?} used by {} triangles (expected 2)",
            edge, count
        );
    }
}
