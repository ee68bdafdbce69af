use criterion::{Criterion, black_box, criterion_group, criterion_main};

use trilod::builder::VirtualGeometryBuilder;
use trilod::core::types::{Vec2, Vec3};
use trilod::mesh::MeshVertex;
use trilod::simplify::{MeshSimplifier, SimplifyTarget};

fn create_test_grid(n: u32) -> (Vec<MeshVertex>, Vec<u32>, Vec<u32>) {
    let mut vertices = Vec::new();
    for y in 0..=n {
        for x in 0..=n {
            let fx = x as f32 / n as f32;
            let fy = y as f32 / n as f32;
            vertices.push(MeshVertex::new(
                Vec3::new(fx * 100.0, fy * 100.0, (fx * 7.0).sin() * (fy * 5.0).cos()),
                Vec3::Z,
                Vec2::new(fx, fy),
            ));
        }
    }
    let mut indices = Vec::new();
    for y in 0..n {
        for x in 0..n {
            let i = y * (n + 1) + x;
            indices.extend_from_slice(&[i, i + 1, i + n + 1]);
            indices.extend_from_slice(&[i + 1, i + n + 2, i + n + 1]);
        }
    }
    let materials = vec![0; indices.len() / 3];
    (vertices, indices, materials)
}

fn bench_simplify_grid_32(c: &mut Criterion) {
    let (vertices, indices, materials) = create_test_grid(32);

    c.bench_function("simplify_grid_32", |b| {
        b.iter(|| {
            let mut simplifier = MeshSimplifier::new(
                black_box(&vertices),
                black_box(&indices),
                black_box(&materials),
                3,
                1,
            )
            .unwrap();
            simplifier.simplify(SimplifyTarget::Triangle, 256)
        });
    });
}

fn bench_build_grid_32(c: &mut Criterion) {
    let (vertices, indices, materials) = create_test_grid(32);

    c.bench_function("virtual_geometry_build_grid_32", |b| {
        b.iter(|| {
            VirtualGeometryBuilder::new()
                .build(
                    black_box(&vertices),
                    black_box(&indices),
                    black_box(&materials),
                )
                .unwrap()
        });
    });
}

fn bench_build_grid_64(c: &mut Criterion) {
    let (vertices, indices, materials) = create_test_grid(64);

    c.bench_function("virtual_geometry_build_grid_64", |b| {
        b.iter(|| {
            VirtualGeometryBuilder::new()
                .build(
                    black_box(&vertices),
                    black_box(&indices),
                    black_box(&materials),
                )
                .unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_simplify_grid_32,
    bench_build_grid_32,
    bench_build_grid_64
);
criterion_main!(benches);
