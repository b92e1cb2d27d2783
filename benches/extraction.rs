//! Benchmarks for mesh extraction
//!
//! Author: Moroya Sakamoto

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use glam::Vec3;
use lumen_mesh::prelude::*;

const SPHERE_DOC: &str = r#"{"distance": {"sphere": {"radius": 1.0}}}"#;

const CSG_DOC: &str = r#"{
    "distance": {"smooth_subtract": {"k": 0.1, "items": [
        {"sphere": {"radius": 1.0}},
        {"box": {"half_extents": [0.6, 0.6, 0.6]}}
    ]}}
}"#;

fn req(resolution: u32, algorithm: Algorithm) -> ExtractRequest {
    ExtractRequest {
        min: Vec3::splat(-1.5),
        max: Vec3::splat(1.5),
        resolution: [resolution; 3],
        algorithm,
        include_colors: false,
        voxel_size: None,
        time: 0.0,
    }
}

fn cpu_extractor(ceiling: Option<u32>) -> MeshExtractor {
    MeshExtractor::with_config(ExtractorConfig {
        force_cpu: true,
        chunk_ceiling: ceiling,
        ..Default::default()
    })
}

fn bench_algorithms(c: &mut Criterion) {
    let _ = env_logger::try_init();
    let mut group = c.benchmark_group("algorithms");
    let extractor = cpu_extractor(None);

    for &resolution in &[33u32, 65] {
        let cells = (resolution as u64 - 1).pow(3);
        group.throughput(Throughput::Elements(cells));

        group.bench_with_input(
            BenchmarkId::new("marching_cubes", resolution),
            &resolution,
            |b, &r| {
                let request = req(r, Algorithm::MarchingCubes);
                b.iter(|| extractor.extract(black_box(SPHERE_DOC), &request).unwrap())
            },
        );
        group.bench_with_input(
            BenchmarkId::new("dual_contouring", resolution),
            &resolution,
            |b, &r| {
                let request = req(r, Algorithm::DualContouring);
                b.iter(|| extractor.extract(black_box(SPHERE_DOC), &request).unwrap())
            },
        );
    }

    group.finish();
}

fn bench_chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunking");
    group.sample_size(10);

    let request = req(65, Algorithm::MarchingCubes);
    group.bench_function("single_chunk", |b| {
        let extractor = cpu_extractor(None);
        b.iter(|| extractor.extract(black_box(SPHERE_DOC), &request).unwrap())
    });
    group.bench_function("chunked_16", |b| {
        let extractor = cpu_extractor(Some(16));
        b.iter(|| extractor.extract(black_box(SPHERE_DOC), &request).unwrap())
    });

    group.finish();
}

fn bench_scene_complexity(c: &mut Criterion) {
    let mut group = c.benchmark_group("scene_complexity");
    let extractor = cpu_extractor(None);
    let request = req(33, Algorithm::MarchingCubes);

    group.bench_function("sphere", |b| {
        b.iter(|| extractor.extract(black_box(SPHERE_DOC), &request).unwrap())
    });
    group.bench_function("smooth_csg", |b| {
        b.iter(|| extractor.extract(black_box(CSG_DOC), &request).unwrap())
    });

    group.finish();
}

fn bench_color_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("color_pass");
    let extractor = cpu_extractor(None);
    let colored = r#"{
        "distance": {"material": {"id": 1, "child": {"sphere": {"radius": 1.0}}}},
        "materials": [{"id": 1, "base_color": [0.9, 0.2, 0.1]}],
        "color": {"rim": 0.2, "specular": 0.3}
    }"#;

    let mut request = req(33, Algorithm::MarchingCubes);
    group.bench_function("geometry_only", |b| {
        b.iter(|| extractor.extract(black_box(colored), &request).unwrap())
    });
    request.include_colors = true;
    group.bench_function("with_colors", |b| {
        b.iter(|| extractor.extract(black_box(colored), &request).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_algorithms,
    bench_chunking,
    bench_scene_complexity,
    bench_color_pass
);
criterion_main!(benches);
