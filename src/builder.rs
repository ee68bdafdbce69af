//! Offline build orchestration
//!
//! Runs the full pipeline over one input mesh: DAG construction,
//! cluster constraints, spatial sorting, page packing and the GPU
//! hierarchy, ending in the streaming lookup tables. The output owns
//! everything the runtime needs.

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::bvh::{HierarchyNode, build_cluster_bvh, build_hierarchy};
use crate::cluster::{Cluster, ClusterGroup, GroupPart, MAX_CLUSTER_VERTICES};
use crate::core::Error;
use crate::core::types::{INVALID_INDEX, Range, Result, Vec3};
use crate::dag::DagBuilder;
use crate::math::Aabb;
use crate::math::morton::encode_morton_3d;
use crate::mesh::MeshVertex;
use crate::page::{
    Page, PageFixups, PageStorage, build_fixups, build_page_dependencies, build_page_storages,
    build_pages, concat_storages,
};
use crate::partition::{GraphPartitioner, GreedyBisect};

/// Where a cluster landed after page packing
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PageCluster {
    pub part_index: u32,
    pub offset_in_part: u32,
}

/// Part range a group was packed into
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PageClusterGroup {
    pub part_start: u32,
    pub part_end: u32,
}

/// Hierarchy slot and LOD level of one packed part
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct PagePart {
    pub hierarchy_index: u32,
    pub level: u32,
}

/// Complete offline build artifact
#[derive(Debug, Default, Clone)]
pub struct VirtualGeometry {
    pub clusters: Vec<Cluster>,
    pub groups: Vec<ClusterGroup>,
    pub parts: Vec<GroupPart>,
    pub pages: Vec<Page>,
    pub num_root_pages: u32,
    pub storages: Vec<PageStorage>,
    pub fixups: PageFixups,
    /// Per page, the pages whose clusters it patches on arrival
    pub page_dependencies: Vec<Vec<u32>>,
    /// Flattened BVH, root at index 0
    pub hierarchy: Vec<HierarchyNode>,
    pub page_clusters: Vec<PageCluster>,
    pub page_groups: Vec<PageClusterGroup>,
    pub page_parts: Vec<PagePart>,
    pub bound: Aabb,
    pub level_num: u32,
    pub min_triangle_count: u32,
    pub max_triangle_count: u32,
    pub max_error: f32,
}

impl VirtualGeometry {
    /// Concatenate every page into whole-mesh buffers for a
    /// non-streaming render path
    pub fn mesh_cluster_storages(&self) -> crate::page::MeshClusterStorages {
        concat_storages(&self.storages)
    }

    pub fn summary(&self) -> BuildSummary {
        let mut levels: Vec<LevelSummary> = Vec::new();
        for cluster in &self.clusters {
            if cluster.level as usize >= levels.len() {
                levels.resize_with(cluster.level as usize + 1, LevelSummary::default);
            }
            let level = &mut levels[cluster.level as usize];
            level.level = cluster.level;
            level.clusters += 1;
            level.triangles += cluster.triangle_count();
            level.max_error = level.max_error.max(cluster.lod_error);
        }
        BuildSummary {
            clusters: self.clusters.len() as u32,
            groups: self.groups.len() as u32,
            parts: self.parts.len() as u32,
            pages: self.pages.len() as u32,
            root_pages: self.num_root_pages,
            hierarchy_nodes: self.hierarchy.len() as u32,
            level_num: self.level_num,
            min_triangle_count: self.min_triangle_count,
            max_triangle_count: self.max_triangle_count,
            max_error: self.max_error,
            levels,
        }
    }

    /// Write the build summary as JSON for offline inspection
    pub fn dump_summary(&self, path: &Path) -> Result<()> {
        let summary = self.summary();
        let json = serde_json::to_string_pretty(&summary)
            .map_err(|e| Error::Build(format!("summary serialization failed: {}", e)))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct LevelSummary {
    pub level: u32,
    pub clusters: u32,
    pub triangles: u32,
    pub max_error: f32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub clusters: u32,
    pub groups: u32,
    pub parts: u32,
    pub pages: u32,
    pub root_pages: u32,
    pub hierarchy_nodes: u32,
    pub level_num: u32,
    pub min_triangle_count: u32,
    pub max_triangle_count: u32,
    pub max_error: f32,
    pub levels: Vec<LevelSummary>,
}

/// Pipeline entry point; defaults mirror the production cluster sizes
pub struct VirtualGeometryBuilder<'a> {
    pub partitioner: &'a dyn GraphPartitioner,
    pub min_cluster_triangles: u32,
    pub max_cluster_triangles: u32,
    pub min_group_clusters: u32,
    pub max_group_clusters: u32,
}

impl Default for VirtualGeometryBuilder<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualGeometryBuilder<'static> {
    pub fn new() -> Self {
        Self {
            partitioner: &GreedyBisect,
            min_cluster_triangles: 124,
            max_cluster_triangles: 128,
            min_group_clusters: 4,
            max_group_clusters: 32,
        }
    }
}

impl<'a> VirtualGeometryBuilder<'a> {
    pub fn build(
        &self,
        vertices: &[MeshVertex],
        indices: &[u32],
        material_indices: &[u32],
    ) -> Result<VirtualGeometry> {
        let mut dag = DagBuilder::new(
            self.partitioner,
            self.min_cluster_triangles,
            self.max_cluster_triangles,
            self.min_group_clusters,
            self.max_group_clusters,
        );
        dag.build(vertices, indices, material_indices)?;

        let mut clusters = std::mem::take(&mut dag.clusters);
        let mut groups = std::mem::take(&mut dag.groups);
        let level_num = dag.level_num;

        constrain_clusters(&mut clusters, &mut groups)?;
        sort_cluster_groups(&mut clusters, &mut groups);
        for cluster in clusters.iter_mut() {
            cluster.build_reuse_batches();
        }

        let (pages, mut parts) = build_pages(&mut clusters, &mut groups, level_num)?;
        let num_root_pages = pages.iter().filter(|p| p.is_root).count() as u32;
        let fixups = build_fixups(&clusters, &groups, &parts, pages.len());
        let storages = build_page_storages(&clusters, &groups, &parts, &pages)?;

        let bvh = build_cluster_bvh(&parts);
        let hierarchy = build_hierarchy(&bvh, &mut parts, &groups);

        let page_dependencies = build_page_dependencies(&fixups);
        let page_clusters = clusters
            .iter()
            .map(|c| PageCluster {
                part_index: c.part_index,
                offset_in_part: c.offset_in_part,
            })
            .collect();
        let page_groups = groups
            .iter()
            .map(|g| PageClusterGroup {
                part_start: g.part_start,
                part_end: g.part_end,
            })
            .collect();
        let page_parts = parts
            .iter()
            .map(|p| PagePart {
                hierarchy_index: p.hierarchy_index,
                level: p.level,
            })
            .collect();

        let bound = Aabb::from_points(vertices.iter().map(|v| &v.pos));

        log::info!(
            "built virtual geometry: {} clusters, {} groups, {} pages ({} root), {} hierarchy nodes, {} levels",
            clusters.len(),
            groups.len(),
            pages.len(),
            num_root_pages,
            hierarchy.len(),
            level_num + 1
        );

        Ok(VirtualGeometry {
            clusters,
            groups,
            parts,
            pages,
            num_root_pages,
            storages,
            fixups,
            page_dependencies,
            hierarchy,
            page_clusters,
            page_groups,
            page_parts,
            bound,
            level_num,
            min_triangle_count: dag.min_triangle_count,
            max_triangle_count: dag.max_triangle_count,
            max_error: dag.max_error,
        })
    }
}

/// Split clusters until every one honors the vertex cap after material
/// range emission. A split half keeps the parent's DAG identity and
/// joins the parent's group and generating group.
fn constrain_clusters(clusters: &mut Vec<Cluster>, groups: &mut [ClusterGroup]) -> Result<()> {
    let mut i = 0;
    while i < clusters.len() {
        loop {
            let fits = clusters[i].vertices.len() <= MAX_CLUSTER_VERTICES as usize
                && clusters[i].build_material_range();
            if fits {
                break;
            }

            let source = clusters[i].clone();
            let half_indices = 3 * (source.indices.len() as u32 / 6);
            if half_indices == 0 {
                return Err(Error::Build(format!(
                    "cluster {} exceeds vertex cap but has a single triangle",
                    source.index
                )));
            }

            let mut first = Cluster::from_index_range(
                &source.vertices,
                &source.indices,
                &source.material_indices,
                Range::new(0, half_indices),
            );
            let mut second = Cluster::from_index_range(
                &source.vertices,
                &source.indices,
                &source.material_indices,
                Range::new(half_indices, source.indices.len() as u32 - half_indices),
            );
            first.copy_property(&source);
            second.copy_property(&source);
            first.index = source.index;
            second.index = clusters.len() as u32;

            groups[source.group_index as usize]
                .clusters
                .push(second.index);
            if source.generating_group_index != INVALID_INDEX {
                groups[source.generating_group_index as usize]
                    .generating_clusters
                    .push(second.index);
            }

            clusters[i] = first;
            clusters.push(second);
        }
        i += 1;
    }
    Ok(())
}

fn morton_code(bound: &Aabb, full_min: Vec3, full_extent: Vec3) -> u32 {
    let q = (1023.0 * (bound.center() - full_min) / full_extent)
        .clamp(Vec3::ZERO, Vec3::splat(1023.0));
    encode_morton_3d(q.x as u32, q.y as u32, q.z as u32)
}

/// Order groups coarsest level first, Morton code within a level, and
/// clusters within each group by Morton code. Keeps spatially close
/// data on the same page.
fn sort_cluster_groups(clusters: &mut [Cluster], groups: &mut [ClusterGroup]) {
    let mut full_bound = Aabb::empty();
    for group in groups.iter() {
        full_bound = full_bound.merged(&group.bound);
    }
    let full_extent = full_bound.size().max(Vec3::splat(f32::EPSILON));

    // Codes indexed by the pre-sort group index
    let codes: Vec<u32> = groups
        .iter()
        .map(|g| morton_code(&g.bound, full_bound.min, full_extent))
        .collect();

    groups.sort_by(|a, b| {
        b.level
            .cmp(&a.level)
            .then_with(|| codes[a.index as usize].cmp(&codes[b.index as usize]))
            .then_with(|| a.index.cmp(&b.index))
    });

    let mut remap = vec![INVALID_INDEX; groups.len()];
    for (new_index, group) in groups.iter_mut().enumerate() {
        remap[group.index as usize] = new_index as u32;
        group.index = new_index as u32;
    }

    for cluster in clusters.iter_mut() {
        if cluster.group_index != INVALID_INDEX {
            cluster.group_index = remap[cluster.group_index as usize];
        }
        if cluster.generating_group_index != INVALID_INDEX {
            cluster.generating_group_index = remap[cluster.generating_group_index as usize];
        }
    }

    for group in groups.iter_mut() {
        group.clusters.sort_by_key(|&cluster_index| {
            let cluster = &clusters[cluster_index as usize];
            (
                morton_code(&cluster.bound, full_bound.min, full_extent),
                cluster_index,
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec2;

    fn grid_mesh(n: u32) -> (Vec<MeshVertex>, Vec<u32>, Vec<u32>) {
        let mut vertices = Vec::new();
        for y in 0..=n {
            for x in 0..=n {
                let fx = x as f32 / n as f32;
                let fy = y as f32 / n as f32;
                vertices.push(MeshVertex::new(
                    Vec3::new(fx * 10.0, fy * 10.0, 0.0),
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

    #[test]
    fn test_build_produces_consistent_tables() {
        let (vertices, indices, materials) = grid_mesh(16);
        let geometry = VirtualGeometryBuilder::new()
            .build(&vertices, &indices, &materials)
            .unwrap();

        assert_eq!(geometry.page_clusters.len(), geometry.clusters.len());
        assert_eq!(geometry.page_groups.len(), geometry.groups.len());
        assert_eq!(geometry.page_parts.len(), geometry.parts.len());
        assert_eq!(geometry.storages.len(), geometry.pages.len());
        assert!(geometry.num_root_pages >= 1);
        assert!(!geometry.hierarchy.is_empty());

        // Every part got a hierarchy slot
        for part in &geometry.page_parts {
            assert_ne!(part.hierarchy_index, INVALID_INDEX);
        }
        // Group table mirrors the packed ranges
        for (group, table) in geometry.groups.iter().zip(&geometry.page_groups) {
            assert_eq!(group.part_start, table.part_start);
            assert_eq!(group.part_end, table.part_end);
        }
    }

    #[test]
    fn test_groups_sorted_coarsest_first() {
        let (vertices, indices, materials) = grid_mesh(24);
        let geometry = VirtualGeometryBuilder::new()
            .build(&vertices, &indices, &materials)
            .unwrap();

        for pair in geometry.groups.windows(2) {
            assert!(pair[0].level >= pair[1].level);
        }
        for (i, group) in geometry.groups.iter().enumerate() {
            assert_eq!(group.index, i as u32);
        }
    }

    #[test]
    fn test_vertex_cap_holds_after_build() {
        let (vertices, indices, materials) = grid_mesh(24);
        let geometry = VirtualGeometryBuilder::new()
            .build(&vertices, &indices, &materials)
            .unwrap();

        for cluster in &geometry.clusters {
            assert!(cluster.vertices.len() <= MAX_CLUSTER_VERTICES as usize);
            for range in &cluster.material_ranges {
                assert!(!range.batch_tri_counts.is_empty());
            }
        }
    }

    #[test]
    fn test_summary_counts_levels() {
        let (vertices, indices, materials) = grid_mesh(16);
        let geometry = VirtualGeometryBuilder::new()
            .build(&vertices, &indices, &materials)
            .unwrap();

        let summary = geometry.summary();
        assert_eq!(summary.clusters, geometry.clusters.len() as u32);
        assert_eq!(summary.level_num, geometry.level_num);
        let total: u32 = summary.levels.iter().map(|l| l.clusters).sum();
        assert_eq!(total, summary.clusters);
    }

    #[test]
    fn test_dump_summary_writes_json() {
        let (vertices, indices, materials) = grid_mesh(8);
        let geometry = VirtualGeometryBuilder::new()
            .build(&vertices, &indices, &materials)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        geometry.dump_summary(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: BuildSummary = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.clusters, geometry.clusters.len() as u32);
    }
}
