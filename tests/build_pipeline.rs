//! End-to-end pipeline checks over procedural meshes

use trilod::builder::VirtualGeometryBuilder;
use trilod::cluster::{MAX_CLUSTER_VERTICES, MAX_GROUP_CLUSTERS};
use trilod::core::types::{INVALID_INDEX, Vec2, Vec3};
use trilod::dag::DagBuilder;
use trilod::mesh::{MeshVertex, convert_for_processor, convert_from_processor};
use trilod::page::{
    MAX_CLUSTERS_PER_PAGE, MAX_PARTS_PER_PAGE, PAGE_HEADER_BYTES, cluster_byte_size,
};
use trilod::partition::GreedyBisect;
use trilod::streaming::{PageKey, StreamingManager};

fn create_test_grid(n: u32) -> (Vec<MeshVertex>, Vec<u32>, Vec<u32>) {
    let mut vertices = Vec::new();
    for y in 0..=n {
        for x in 0..=n {
            let fx = x as f32 / n as f32;
            let fy = y as f32 / n as f32;
            vertices.push(MeshVertex::new(
                Vec3::new(fx * 100.0, fy * 100.0, (fx * 9.0).sin() + (fy * 7.0).cos()),
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

fn create_test_sphere(rings: u32, segments: u32) -> (Vec<MeshVertex>, Vec<u32>, Vec<u32>) {
    let mut vertices = Vec::new();
    for r in 0..=rings {
        let theta = std::f32::consts::PI * r as f32 / rings as f32;
        for s in 0..=segments {
            let phi = 2.0 * std::f32::consts::PI * s as f32 / segments as f32;
            let normal = Vec3::new(
                theta.sin() * phi.cos(),
                theta.cos(),
                theta.sin() * phi.sin(),
            );
            vertices.push(MeshVertex::new(
                normal * 50.0,
                normal,
                Vec2::new(s as f32 / segments as f32, r as f32 / rings as f32),
            ));
        }
    }
    let mut indices = Vec::new();
    let mut materials = Vec::new();
    for r in 0..rings {
        for s in 0..segments {
            let i = r * (segments + 1) + s;
            let below = i + segments + 1;
            if r > 0 {
                indices.extend_from_slice(&[i, i + 1, below]);
                materials.push(if r < rings / 2 { 0 } else { 1 });
            }
            if r + 1 < rings {
                indices.extend_from_slice(&[i + 1, below + 1, below]);
                materials.push(if r < rings / 2 { 0 } else { 1 });
            }
        }
    }
    (vertices, indices, materials)
}

#[test]
fn test_quad_builds_single_cluster_and_root_group() {
    let v = |x: f32, y: f32| MeshVertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(x, y));
    let vertices = vec![v(0.0, 0.0), v(1.0, 0.0), v(1.0, 1.0), v(0.0, 1.0)];
    let indices = vec![0, 1, 2, 0, 2, 3];
    let materials = vec![0, 0];

    let geometry = VirtualGeometryBuilder::new()
        .build(&vertices, &indices, &materials)
        .unwrap();

    assert_eq!(geometry.clusters.len(), 1);
    assert_eq!(geometry.groups.len(), 1);
    assert_eq!(geometry.level_num, 0);
    assert_eq!(geometry.groups[0].level, geometry.level_num);
    assert!(geometry.groups[0].max_parent_error.is_infinite());
    assert_eq!(geometry.pages.len(), 1);
    assert!(geometry.pages[0].is_root);
    assert_eq!(geometry.min_triangle_count, 2);
    assert_eq!(geometry.max_triangle_count, 2);
}

#[test]
fn test_lod_error_monotone_over_dag() {
    let (vertices, indices, materials) = create_test_sphere(32, 48);
    let geometry = VirtualGeometryBuilder::new()
        .build(&vertices, &indices, &materials)
        .unwrap();

    assert!(geometry.level_num > 0, "sphere must reduce at least once");

    for cluster in &geometry.clusters {
        if cluster.generating_group_index == INVALID_INDEX {
            continue;
        }
        let children = &geometry.groups[cluster.generating_group_index as usize];
        for &child_index in &children.clusters {
            let child = &geometry.clusters[child_index as usize];
            assert!(
                cluster.lod_error >= child.lod_error,
                "parent error {} below child error {}",
                cluster.lod_error,
                child.lod_error
            );
        }
    }
}

#[test]
fn test_cluster_and_group_size_caps() {
    let (vertices, indices, materials) = create_test_sphere(32, 48);
    let geometry = VirtualGeometryBuilder::new()
        .build(&vertices, &indices, &materials)
        .unwrap();

    for cluster in &geometry.clusters {
        assert!(cluster.triangle_count() <= 128);
        assert!(cluster.vertices.len() <= MAX_CLUSTER_VERTICES as usize);
    }
    for group in &geometry.groups {
        assert!(group.clusters.len() as u32 <= MAX_GROUP_CLUSTERS);
        assert!(!group.clusters.is_empty());
    }
}

#[test]
fn test_page_caps_hold() {
    let (vertices, indices, materials) = create_test_sphere(48, 64);
    let geometry = VirtualGeometryBuilder::new()
        .build(&vertices, &indices, &materials)
        .unwrap();

    assert!(geometry.pages.len() > 1, "sphere should span several pages");

    for (page_index, page) in geometry.pages.iter().enumerate() {
        assert!(page.cluster_num <= MAX_CLUSTERS_PER_PAGE);
        assert!(page.part_num <= MAX_PARTS_PER_PAGE);
        assert!(page.data_byte_size <= page.capacity());

        // Recount the bytes from the clusters actually packed in
        let mut recomputed = PAGE_HEADER_BYTES;
        for local in 0..page.part_num {
            let part = &geometry.parts[(page.part_start + local) as usize];
            assert_eq!(part.page_index as usize, page_index);
            for &cluster_index in &part.clusters {
                recomputed += cluster_byte_size(&geometry.clusters[cluster_index as usize]);
            }
        }
        assert_eq!(recomputed, page.data_byte_size);
    }

    for (page, storage) in geometry.pages.iter().zip(&geometry.storages) {
        assert_eq!(storage.byte_size(), page.data_byte_size);
    }
}

#[test]
fn test_dag_cut_extremes() {
    let (vertices, indices, materials) = create_test_grid(32);
    let mut dag = DagBuilder::new(&GreedyBisect, 124, 128, 4, 32);
    dag.build(&vertices, &indices, &materials).unwrap();

    let finest = dag.find_dag_cut(0, 0.0);
    assert_eq!(finest.triangle_count, dag.max_triangle_count);
    assert_eq!(finest.triangle_count, 32 * 32 * 2);

    let coarsest = dag.find_dag_cut(u32::MAX, f32::MAX);
    assert_eq!(coarsest.triangle_count, dag.min_triangle_count);
    assert!(coarsest.clusters.len() <= finest.clusters.len());
}

#[test]
fn test_convert_round_trip() {
    let (vertices, indices, materials) = create_test_sphere(8, 12);
    let (processed, remapped) = convert_for_processor(&vertices, &indices).unwrap();
    let (flat_vertices, flat_indices) = convert_from_processor(&processed, &remapped);

    assert_eq!(flat_indices.len(), indices.len());
    for (corner, &index) in indices.iter().enumerate() {
        let original = &vertices[index as usize];
        let restored = &flat_vertices[flat_indices[corner] as usize];
        assert_eq!(original.pos, restored.pos);
        assert_eq!(original.uv, restored.uv);
    }
    let _ = materials;
}

#[test]
fn test_streaming_dependency_invariant() {
    let (vertices, indices, materials) = create_test_sphere(48, 64);
    let geometry = VirtualGeometryBuilder::new()
        .build(&vertices, &indices, &materials)
        .unwrap();
    let page_count = geometry.pages.len() as u32;

    let mut manager = StreamingManager::new(4, 8);
    let resource = manager
        .add_geometry(
            geometry.pages.clone(),
            geometry.fixups.clone(),
            geometry.page_dependencies.clone(),
        )
        .unwrap();
    manager.update(&[]);

    // Request everything repeatedly; admission trickles in under the
    // dependency gate and the 4-slot budget
    let raw = vec![1u32, resource, 0, page_count, 1];
    for _ in 0..16 {
        manager.update(&raw);

        for page in 0..page_count {
            let key = PageKey { resource, page };
            if !manager.is_resident(key) {
                continue;
            }
            for &dep in &geometry.page_dependencies[page as usize] {
                assert!(
                    manager.is_resident(PageKey {
                        resource,
                        page: dep
                    }),
                    "page {} resident without its dependency {}",
                    page,
                    dep
                );
            }
        }
    }
}
