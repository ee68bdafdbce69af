//! Clusters, cluster groups and group parts
//!
//! A cluster is a small patch of triangles with its own vertex buffer;
//! a group collects the clusters that simplify together into the next
//! coarser LOD level; a part is the slice of a group that landed on one
//! page.

pub mod triangle_cluster;

pub use triangle_cluster::TriangleClusterBuilder;

use crate::core::types::{INVALID_INDEX, Range};
use crate::math::Aabb;
use crate::mesh::MeshVertex;
use std::collections::HashMap;

/// Triangle cap per cluster
pub const MAX_CLUSTER_TRIANGLES: u32 = 128;
/// Vertex cap per cluster after the reuse-window reorder
pub const MAX_CLUSTER_VERTICES: u32 = 256;
/// Cluster cap per group
pub const MAX_GROUP_CLUSTERS: u32 = 32;
/// Triangle and referenced-vertex cap per reuse batch
pub const MAX_REUSE_BATCH: u32 = 32;

/// Contiguous run of same-material triangles, pre-split into reuse
/// batches
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MaterialRange {
    pub start: u32,
    pub length: u32,
    pub material_index: u32,
    pub batch_tri_counts: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct Cluster {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub material_indices: Vec<u32>,
    pub material_ranges: Vec<MaterialRange>,
    pub bound: Aabb,
    /// Bound driving LOD selection; monotone over the DAG
    pub lod_bound: Aabb,
    pub lod_error: f32,
    pub edge_length: f32,
    pub index: u32,
    pub level: u32,
    pub group_index: u32,
    pub generating_group_index: u32,
    pub part_index: u32,
    pub offset_in_part: u32,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            material_indices: Vec::new(),
            material_ranges: Vec::new(),
            bound: Aabb::empty(),
            lod_bound: Aabb::empty(),
            lod_error: 0.0,
            edge_length: 0.0,
            index: INVALID_INDEX,
            level: 0,
            group_index: INVALID_INDEX,
            generating_group_index: INVALID_INDEX,
            part_index: INVALID_INDEX,
            offset_in_part: 0,
        }
    }
}

impl Cluster {
    pub fn triangle_count(&self) -> u32 {
        self.indices.len() as u32 / 3
    }

    /// Flat-mesh constructor
    pub fn from_mesh(
        vertices: Vec<MeshVertex>,
        indices: Vec<u32>,
        material_indices: Vec<u32>,
    ) -> Self {
        let mut cluster = Self {
            vertices,
            indices,
            material_indices,
            ..Default::default()
        };
        cluster.post_init();
        cluster
    }

    /// Extract a contiguous index range into a self-contained cluster
    pub fn from_index_range(
        vertices: &[MeshVertex],
        indices: &[u32],
        material_indices: &[u32],
        range: Range,
    ) -> Self {
        let num = range.len();
        debug_assert_eq!(num % 3, 0);

        let mut cluster = Cluster::default();
        cluster.vertices.reserve(num as usize);
        cluster.indices.reserve(num as usize);
        cluster.material_indices.reserve(num as usize / 3);

        let mut index_map: HashMap<u32, u32> = HashMap::new();
        for i in 0..num {
            let idx = range.begin + i;
            let index = indices[idx as usize];
            let new_index = *index_map.entry(index).or_insert_with(|| {
                cluster.vertices.push(vertices[index as usize]);
                (cluster.vertices.len() - 1) as u32
            });
            cluster.indices.push(new_index);
            if i % 3 == 0 {
                cluster
                    .material_indices
                    .push(material_indices[(idx / 3) as usize]);
            }
        }

        cluster.post_init();
        cluster
    }

    /// Extract a partitioned triangle range into a self-contained
    /// cluster; `tri_order[i]` maps the permuted position to the
    /// original triangle
    pub fn from_triangle_range(
        vertices: &[MeshVertex],
        triangles: &[[u32; 3]],
        tri_order: &[u32],
        material_indices: &[u32],
        range: Range,
    ) -> Self {
        let num = range.len();

        let mut cluster = Cluster::default();
        cluster.vertices.reserve(num as usize);
        cluster.indices.reserve(num as usize * 3);
        cluster.material_indices.reserve(num as usize);

        let mut index_map: HashMap<u32, u32> = HashMap::new();
        for idx in range.begin..=range.end {
            let tri_index = tri_order[idx as usize];
            for &index in &triangles[tri_index as usize] {
                let new_index = *index_map.entry(index).or_insert_with(|| {
                    cluster.vertices.push(vertices[index as usize]);
                    (cluster.vertices.len() - 1) as u32
                });
                cluster.indices.push(new_index);
            }
            cluster
                .material_indices
                .push(material_indices[tri_index as usize]);
        }

        cluster.post_init();
        cluster
    }

    /// Merge several clusters into one mesh, deduplicating vertices by
    /// content
    pub fn merge(clusters: &[Cluster]) -> Self {
        let mut merged = Cluster::default();

        let sum_indices: usize = clusters.iter().map(|c| c.indices.len()).sum();
        merged.indices.reserve(sum_indices);
        merged.material_indices.reserve(sum_indices / 3);

        let mut vertex_map: HashMap<[u32; 8], u32> = HashMap::new();
        for cluster in clusters {
            for (idx, &index) in cluster.indices.iter().enumerate() {
                let vertex = cluster.vertices[index as usize];
                let new_index = *vertex_map.entry(vertex.content_key()).or_insert_with(|| {
                    merged.vertices.push(vertex);
                    (merged.vertices.len() - 1) as u32
                });
                merged.indices.push(new_index);
                if idx % 3 == 0 {
                    merged
                        .material_indices
                        .push(cluster.material_indices[idx / 3]);
                }
            }
            merged.lod_error = merged.lod_error.max(cluster.lod_error);
            merged.edge_length = merged.edge_length.max(cluster.edge_length);
        }

        merged.post_init();
        merged
    }

    /// Carry DAG identity over to a split half
    pub fn copy_property(&mut self, other: &Cluster) {
        self.lod_bound = other.lod_bound;
        self.group_index = other.group_index;
        self.generating_group_index = other.generating_group_index;
        self.index = other.index;
        self.level = other.level;
        self.lod_error = other.lod_error;
        self.edge_length = other.edge_length;
    }

    fn post_init(&mut self) {
        self.init_bound();
        self.init_material();
    }

    fn init_bound(&mut self) {
        self.bound = Aabb::from_points(self.vertices.iter().map(|v| &v.pos));
        self.lod_bound = self.bound;

        debug_assert_eq!(self.indices.len() % 3, 0);
        let mut max_edge_sq = 0.0f32;
        for tri in self.indices.chunks_exact(3) {
            for i in 0..3 {
                let d = self.vertices[tri[i] as usize].pos
                    - self.vertices[tri[(i + 1) % 3] as usize].pos;
                max_edge_sq = max_edge_sq.max(d.length_squared());
            }
        }
        self.edge_length = max_edge_sq.sqrt();
    }

    /// Reorder triangles so same-material runs are contiguous
    fn init_material(&mut self) {
        let mut order: Vec<u32> = (0..self.material_indices.len() as u32).collect();
        order.sort_by_key(|&tri| (self.material_indices[tri as usize], tri));

        let old_indices = std::mem::take(&mut self.indices);
        let old_materials = self.material_indices.clone();
        self.indices = vec![0; old_indices.len()];
        for (i, &tri) in order.iter().enumerate() {
            self.material_indices[i] = old_materials[tri as usize];
            for k in 0..3 {
                self.indices[3 * i + k] = old_indices[3 * tri as usize + k];
            }
        }

        self.ensure_index_order();
    }

    /// Rotate each triangle so its smallest index leads; keeps winding
    fn ensure_index_order(&mut self) {
        for tri in self.indices.chunks_exact_mut(3) {
            if tri[1] < tri[0] && tri[1] < tri[2] {
                tri.rotate_left(1);
            } else if tri[2] < tri[0] && tri[2] < tri[1] {
                tri.rotate_right(1);
            }
        }
    }

    /// Build material ranges and reorder vertices into emission order
    ///
    /// Vertices are re-emitted whenever a triangle references one
    /// further back than the reuse window, so every batch of
    /// [`MAX_REUSE_BATCH`] triangles only touches the window's worth of
    /// vertices. Returns `false` when the re-emission pushes the vertex
    /// count past [`MAX_CLUSTER_VERTICES`]; the caller splits the
    /// cluster and retries.
    pub fn build_material_range(&mut self) -> bool {
        self.material_ranges.clear();

        if !self.material_indices.is_empty() {
            let mut last_material = self.material_indices[0];
            let mut run_begin = 0u32;
            for i in 1..=self.material_indices.len() as u32 {
                if i == self.material_indices.len() as u32
                    || self.material_indices[i as usize] != last_material
                {
                    self.material_ranges.push(MaterialRange {
                        start: run_begin,
                        length: i - run_begin,
                        material_index: last_material,
                        batch_tri_counts: vec![i - run_begin],
                    });
                    if i == self.material_indices.len() as u32 {
                        break;
                    }
                    last_material = self.material_indices[i as usize];
                    run_begin = i;
                }
            }
        }

        let mut old_to_new = vec![INVALID_INDEX; self.vertices.len()];
        let mut new_to_old: Vec<u32> = Vec::with_capacity(self.vertices.len());
        let mut optimized = vec![INVALID_INDEX; self.indices.len()];

        let mut emitted = 0u32;

        for range in &self.material_ranges {
            for local in 0..range.length {
                let tri_index = (range.start + local) as usize;
                let old: [u32; 3] = [
                    self.indices[3 * tri_index],
                    self.indices[3 * tri_index + 1],
                    self.indices[3 * tri_index + 2],
                ];

                // Corners that fell out of the reuse window are
                // re-emitted as fresh vertices
                let mut pending = emitted;
                for &o in &old {
                    if old_to_new[o as usize] == INVALID_INDEX {
                        pending += 1;
                    }
                }
                loop {
                    let mut expired = false;
                    for &o in &old {
                        let mapped = old_to_new[o as usize];
                        if mapped != INVALID_INDEX && pending - mapped >= MAX_REUSE_BATCH {
                            old_to_new[o as usize] = INVALID_INDEX;
                            pending += 1;
                            expired = true;
                        }
                    }
                    if !expired {
                        break;
                    }
                }

                for (k, &o) in old.iter().enumerate() {
                    if old_to_new[o as usize] == INVALID_INDEX {
                        if emitted == MAX_CLUSTER_VERTICES {
                            return false;
                        }
                        new_to_old.push(o);
                        old_to_new[o as usize] = emitted;
                        emitted += 1;
                    }
                    optimized[3 * tri_index + k] = old_to_new[o as usize];
                }
                debug_assert_eq!(emitted, pending);
            }
        }

        let old_vertices = std::mem::take(&mut self.vertices);
        self.vertices = new_to_old
            .iter()
            .map(|&o| old_vertices[o as usize])
            .collect();
        self.indices = optimized;
        self.ensure_index_order();
        true
    }

    /// Split each material range into batches touching at most
    /// [`MAX_REUSE_BATCH`] triangles and distinct vertices. A triangle
    /// that would overflow the vertex budget closes the batch and
    /// retries against a fresh one.
    pub fn build_reuse_batches(&mut self) {
        for range in &mut self.material_ranges {
            let mut vertex_used = vec![false; self.vertices.len()];
            let mut batch_vertices = 0u32;
            let mut batch_triangles = 0u32;

            range.batch_tri_counts.clear();

            let mut local = 0u32;
            while local < range.length {
                let tri_index = (range.start + local) as usize;
                let corners = [
                    self.indices[3 * tri_index],
                    self.indices[3 * tri_index + 1],
                    self.indices[3 * tri_index + 2],
                ];
                let new_vertices = corners
                    .iter()
                    .filter(|&&v| !vertex_used[v as usize])
                    .count() as u32;

                if batch_vertices + new_vertices > MAX_REUSE_BATCH {
                    range.batch_tri_counts.push(batch_triangles);
                    batch_vertices = 0;
                    batch_triangles = 0;
                    vertex_used.fill(false);
                    continue;
                }

                for &v in &corners {
                    vertex_used[v as usize] = true;
                }
                batch_vertices += new_vertices;
                batch_triangles += 1;
                local += 1;

                if batch_triangles == MAX_REUSE_BATCH {
                    range.batch_tri_counts.push(batch_triangles);
                    batch_vertices = 0;
                    batch_triangles = 0;
                    vertex_used.fill(false);
                }
            }

            if batch_triangles > 0 {
                range.batch_tri_counts.push(batch_triangles);
            }
        }
    }
}

/// Clusters that simplify together; owns the error bound its parents
/// must honor
#[derive(Clone, Debug)]
pub struct ClusterGroup {
    /// Cluster indices at this group's level
    pub clusters: Vec<u32>,
    /// Parent clusters produced by simplifying this group
    pub generating_clusters: Vec<u32>,
    pub bound: Aabb,
    pub parent_lod_bound: Aabb,
    pub level: u32,
    pub index: u32,
    pub max_parent_error: f32,
    pub edge_length: f32,
    pub page_start: u32,
    pub page_end: u32,
    pub part_start: u32,
    pub part_end: u32,
}

impl Default for ClusterGroup {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            generating_clusters: Vec::new(),
            bound: Aabb::empty(),
            parent_lod_bound: Aabb::empty(),
            level: 0,
            index: INVALID_INDEX,
            max_parent_error: 0.0,
            edge_length: 0.0,
            page_start: INVALID_INDEX,
            page_end: INVALID_INDEX,
            part_start: INVALID_INDEX,
            part_end: INVALID_INDEX,
        }
    }
}

/// Slice of one group packed onto one page
#[derive(Clone, Debug)]
pub struct GroupPart {
    /// Global cluster indices, in page order
    pub clusters: Vec<u32>,
    pub index: u32,
    pub group_index: u32,
    pub level: u32,
    pub lod_bound: Aabb,
    pub lod_error: f32,
    pub page_index: u32,
    pub cluster_start: u32,
    pub hierarchy_index: u32,
}

impl Default for GroupPart {
    fn default() -> Self {
        Self {
            clusters: Vec::new(),
            index: INVALID_INDEX,
            group_index: INVALID_INDEX,
            level: 0,
            lod_bound: Aabb::empty(),
            lod_error: 0.0,
            page_index: INVALID_INDEX,
            cluster_start: 0,
            hierarchy_index: INVALID_INDEX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Vec2, Vec3};

    fn vertex(x: f32, y: f32) -> MeshVertex {
        MeshVertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(x, y))
    }

    fn two_material_quad() -> Cluster {
        let vertices = vec![
            vertex(0.0, 0.0),
            vertex(1.0, 0.0),
            vertex(0.0, 1.0),
            vertex(1.0, 1.0),
        ];
        let indices = vec![0, 1, 2, 1, 3, 2];
        Cluster::from_mesh(vertices, indices, vec![1, 0])
    }

    #[test]
    fn test_material_sort_orders_runs() {
        let cluster = two_material_quad();
        // Triangle with material 0 now leads
        assert_eq!(cluster.material_indices, vec![0, 1]);
        assert_eq!(cluster.triangle_count(), 2);
    }

    #[test]
    fn test_ensure_index_order_keeps_winding() {
        let vertices = vec![vertex(0.0, 0.0), vertex(1.0, 0.0), vertex(0.0, 1.0)];
        let cluster = Cluster::from_mesh(vertices, vec![2, 0, 1], vec![0]);
        assert_eq!(cluster.indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_bound_and_edge_length() {
        let cluster = two_material_quad();
        assert_eq!(cluster.bound.min, Vec3::ZERO);
        assert_eq!(cluster.bound.max, Vec3::new(1.0, 1.0, 0.0));
        // Longest edge is the quad diagonal
        assert!((cluster.edge_length - 2.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_from_index_range_compacts_vertices() {
        let vertices = vec![
            vertex(0.0, 0.0),
            vertex(1.0, 0.0),
            vertex(0.0, 1.0),
            vertex(1.0, 1.0),
        ];
        let indices = vec![0, 1, 2, 1, 3, 2];
        let half = Cluster::from_index_range(&vertices, &indices, &[0, 0], Range::new(3, 3));
        assert_eq!(half.triangle_count(), 1);
        assert_eq!(half.vertices.len(), 3);
    }

    #[test]
    fn test_merge_dedups_by_content() {
        let a = two_material_quad();
        let b = two_material_quad();
        let merged = Cluster::merge(&[a, b]);
        // Identical content collapses to one vertex set
        assert_eq!(merged.vertices.len(), 4);
        assert_eq!(merged.triangle_count(), 4);
    }

    #[test]
    fn test_build_material_range_runs_and_batches() {
        let mut cluster = two_material_quad();
        assert!(cluster.build_material_range());
        assert_eq!(cluster.material_ranges.len(), 2);
        for range in &cluster.material_ranges {
            assert_eq!(range.batch_tri_counts.iter().sum::<u32>(), range.length);
        }
        // Reorder preserves triangle positions referenced by the ranges
        assert_eq!(cluster.indices.len(), 6);
        assert!(cluster.vertices.len() >= 4);
    }

    #[test]
    fn test_reuse_batches_cover_every_range() {
        let mut cluster = two_material_quad();
        assert!(cluster.build_material_range());
        cluster.build_reuse_batches();
        for range in &cluster.material_ranges {
            assert_eq!(range.batch_tri_counts.iter().sum::<u32>(), range.length);
            for &count in &range.batch_tri_counts {
                assert!(count > 0 && count <= MAX_REUSE_BATCH);
            }
        }
    }

    #[test]
    fn test_reuse_batches_split_long_runs() {
        // A strip of 80 triangles in one material needs several batches
        let mut vertices = Vec::new();
        for i in 0..82u32 {
            vertices.push(MeshVertex::new(
                Vec3::new(i as f32 * 0.5, (i % 2) as f32, 0.0),
                Vec3::Z,
                Vec2::ZERO,
            ));
        }
        let mut indices = Vec::new();
        for i in 0..80u32 {
            indices.extend_from_slice(&[i, i + 1, i + 2]);
        }
        let materials = vec![0; 80];
        let mut cluster = Cluster::from_mesh(vertices, indices, materials);
        assert!(cluster.build_material_range());
        cluster.build_reuse_batches();

        let range = &cluster.material_ranges[0];
        assert!(range.batch_tri_counts.len() >= 3);
        assert_eq!(range.batch_tri_counts.iter().sum::<u32>(), 80);
    }
}
