//! Integration tests: end-to-end extraction through the public API
//!
//! Covers mesh structure, watertightness after welding, the color pass,
//! and request validation ordering.
//!
//! Author: Moroya Sakamoto

mod common;

use common::*;
use lumen_mesh::prelude::*;

// ============================================================================
// Marching cubes
// ============================================================================

#[test]
fn sphere_mesh_has_vertices_and_faces() {
    let mesh = cpu_extractor()
        .extract(SPHERE_DOC, &request(Algorithm::MarchingCubes))
        .unwrap();

    assert!(
        mesh.vertex_count() > 100,
        "sphere mesh should have many vertices, got {}",
        mesh.vertex_count()
    );
    assert!(mesh.triangle_count() > 100);
    assert!(mesh.validate().is_ok());
}

#[test]
fn sphere_mesh_is_watertight_after_weld() {
    let mesh = cpu_extractor()
        .extract(SPHERE_DOC, &request(Algorithm::MarchingCubes))
        .unwrap();
    assert_watertight(&mesh);
}

#[test]
fn sphere_vertices_lie_near_the_surface() {
    let mesh = cpu_extractor()
        .extract(SPHERE_DOC, &request(Algorithm::MarchingCubes))
        .unwrap();
    // Interpolated crossings land within a fraction of a cell of |p| = 1
    let cell = 3.0 / 32.0;
    for v in &mesh.vertices {
        let err = (v.position.length() - 1.0).abs();
        assert!(err < cell, "vertex {:?} is {} off the surface", v.position, err);
    }
}

#[test]
fn csg_subtraction_carves_the_box() {
    let mesh = cpu_extractor()
        .extract(CSG_DOC, &request(Algorithm::MarchingCubes))
        .unwrap();
    assert!(mesh.vertex_count() > 100);
    // No vertex may sit strictly inside the carved box
    for v in &mesh.vertices {
        let p = v.position.abs();
        let inside_cutter = p.x < 0.55 && p.y < 0.55 && p.z < 0.55;
        assert!(!inside_cutter, "vertex {:?} inside the subtracted box", v.position);
    }
}

// ============================================================================
// Other engines
// ============================================================================

#[test]
fn dual_contouring_tracks_the_surface() {
    let mesh = cpu_extractor()
        .extract(SPHERE_DOC, &request(Algorithm::DualContouring))
        .unwrap();
    assert!(mesh.vertex_count() > 50);
    assert!(mesh.validate().is_ok());
    for v in &mesh.vertices {
        assert!((v.position.length() - 1.0).abs() < 0.2);
    }
}

#[test]
fn cubes_engine_emits_whole_cubes() {
    let mesh = cpu_extractor()
        .extract(SPHERE_DOC, &request(Algorithm::Cubes))
        .unwrap();
    assert!(mesh.vertex_count() > 0);
    assert_eq!(mesh.indices.len() % 36, 0, "cubes come in 12-triangle units");
    assert!(mesh.validate().is_ok());
}

#[test]
fn cubes_respect_caller_voxel_size() {
    let mut req = request(Algorithm::Cubes);
    req.voxel_size = Some(0.02);
    let extractor = MeshExtractor::with_config(ExtractorConfig {
        force_cpu: true,
        weld: false,
        ..Default::default()
    });
    let mesh = extractor.extract(SPHERE_DOC, &req).unwrap();

    // Each cube spans exactly voxel_size along every axis
    for cube in mesh.vertices.chunks_exact(24) {
        let min = cube.iter().fold(glam::Vec3::MAX, |m, v| m.min(v.position));
        let max = cube.iter().fold(glam::Vec3::MIN, |m, v| m.max(v.position));
        let extent = max - min;
        assert!((extent.x - 0.02).abs() < 1e-5, "cube extent {:?}", extent);
        assert!((extent.y - 0.02).abs() < 1e-5);
        assert!((extent.z - 0.02).abs() < 1e-5);
    }
}

// ============================================================================
// Color pass
// ============================================================================

#[test]
fn colors_default_to_flat_gray() {
    let mut req = request(Algorithm::MarchingCubes);
    req.include_colors = true;
    let mesh = cpu_extractor().extract(SPHERE_DOC, &req).unwrap();
    let colors = mesh.colors.as_ref().expect("colors requested");
    assert_eq!(colors.len(), mesh.vertex_count());
    assert!(colors.iter().all(|c| *c == glam::Vec3::splat(0.8)));
}

#[test]
fn color_edit_changes_colors_not_geometry() {
    let extractor = cpu_extractor();
    let mut req = request(Algorithm::MarchingCubes);
    req.include_colors = true;

    let a = extractor.extract(COLORED_DOC, &req).unwrap();
    // Same distance expression, different lighting
    let edited = COLORED_DOC.replace(r#""rim": 0.2"#, r#""rim": 0.9"#);
    let b = extractor.extract(&edited, &req).unwrap();

    assert_eq!(a.vertex_count(), b.vertex_count());
    assert_eq!(a.indices, b.indices);
    for (x, y) in a.vertices.iter().zip(&b.vertices) {
        assert_eq!(x.position, y.position);
    }

    let ca = a.colors.as_ref().unwrap();
    let cb = b.colors.as_ref().unwrap();
    let changed = ca.iter().zip(cb).filter(|(x, y)| x != y).count();
    assert!(changed > 0, "rim change must alter at least some colors");
}

#[test]
fn materials_tint_their_regions() {
    let mut req = request(Algorithm::MarchingCubes);
    req.include_colors = true;
    let mesh = cpu_extractor().extract(COLORED_DOC, &req).unwrap();
    let colors = mesh.colors.as_ref().unwrap();

    // Far left of the union is pure material 1 (red-dominant), the box
    // side pure material 2 (blue-dominant)
    let mut red_side = 0;
    let mut blue_side = 0;
    for (v, c) in mesh.vertices.iter().zip(colors) {
        if v.position.x < -0.5 && c.x > c.z {
            red_side += 1;
        }
        if v.position.x > 0.8 && c.z > c.x {
            blue_side += 1;
        }
    }
    assert!(red_side > 0, "no red-tinted vertices on the sphere side");
    assert!(blue_side > 0, "no blue-tinted vertices on the box side");
}

// ============================================================================
// Validation ordering
// ============================================================================

#[test]
fn bad_scene_fails_before_extraction() {
    let err = cpu_extractor()
        .extract("{not json", &request(Algorithm::MarchingCubes))
        .unwrap_err();
    assert!(matches!(err, ExtractError::Scene(_)), "got {:?}", err);
}

#[test]
fn bad_grid_fails_before_extraction() {
    let mut req = request(Algorithm::MarchingCubes);
    req.max = req.min;
    let err = cpu_extractor().extract(SPHERE_DOC, &req).unwrap_err();
    assert!(matches!(err, ExtractError::Grid(_)), "got {:?}", err);
}

#[test]
fn empty_field_yields_empty_mesh() {
    // Sphere entirely outside the sampled box
    let mut req = request(Algorithm::MarchingCubes);
    req.min = glam::Vec3::splat(5.0);
    req.max = glam::Vec3::splat(8.0);
    let mesh = cpu_extractor().extract(SPHERE_DOC, &req).unwrap();
    assert!(mesh.is_empty());
    assert_eq!(mesh.triangle_count(), 0);
}
