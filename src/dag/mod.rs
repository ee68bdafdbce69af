//! LOD DAG construction
//!
//! Level by level: partition the current clusters into groups, merge
//! each group into one mesh, simplify it, re-cluster the result into
//! parent clusters. Parents carry a monotone error bound so a runtime
//! cut through the DAG never mixes incompatible levels.

use crate::cluster::{
    Cluster, ClusterGroup, MAX_CLUSTER_TRIANGLES, MAX_GROUP_CLUSTERS, TriangleClusterBuilder,
};
use crate::core::types::{INVALID_INDEX, Result, div_round_up};
use crate::mesh::MeshVertex;
use crate::partition::{Graph, GraphBuilder, GraphPartitioner, Partitioner};
use crate::simplify::{EdgeHash, MeshSimplifier, SimplifyTarget};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A runtime-selectable set of clusters covering the whole mesh
#[derive(Clone, Debug, Default)]
pub struct DagCut {
    pub clusters: Vec<u32>,
    pub triangle_count: u32,
    pub error: f32,
}

#[derive(Clone, Copy, Debug)]
struct CutElement {
    cluster: u32,
    error: f32,
}

impl PartialEq for CutElement {
    fn eq(&self, other: &Self) -> bool {
        self.error == other.error && self.cluster == other.cluster
    }
}

impl Eq for CutElement {}

impl Ord for CutElement {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest error on top; ties resolve to the smallest index
        self.error
            .total_cmp(&other.error)
            .then_with(|| other.cluster.cmp(&self.cluster))
    }
}

impl PartialOrd for CutElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct DagBuilder<'a> {
    partitioner: &'a dyn GraphPartitioner,
    min_cluster_triangles: u32,
    max_cluster_triangles: u32,
    min_group_clusters: u32,
    max_group_clusters: u32,
    pub clusters: Vec<Cluster>,
    pub groups: Vec<ClusterGroup>,
    /// Level of the topmost clusters; the root group carries it too
    pub level_num: u32,
    /// Triangle count of the coarsest cut (root clusters)
    pub min_triangle_count: u32,
    /// Triangle count of the finest cut (leaf clusters)
    pub max_triangle_count: u32,
    pub max_error: f32,
}

impl<'a> DagBuilder<'a> {
    pub fn new(
        partitioner: &'a dyn GraphPartitioner,
        min_cluster_triangles: u32,
        max_cluster_triangles: u32,
        min_group_clusters: u32,
        max_group_clusters: u32,
    ) -> Self {
        let max_cluster_triangles = max_cluster_triangles.min(MAX_CLUSTER_TRIANGLES);
        let max_group_clusters = max_group_clusters.min(MAX_GROUP_CLUSTERS);
        Self {
            partitioner,
            min_cluster_triangles: min_cluster_triangles.min(max_cluster_triangles),
            max_cluster_triangles,
            min_group_clusters: min_group_clusters.min(max_group_clusters),
            max_group_clusters,
            clusters: Vec::new(),
            groups: Vec::new(),
            level_num: 0,
            min_triangle_count: 0,
            max_triangle_count: 0,
            max_error: 0.0,
        }
    }

    pub fn build(
        &mut self,
        vertices: &[MeshVertex],
        indices: &[u32],
        material_indices: &[u32],
    ) -> Result<()> {
        let cluster_builder = TriangleClusterBuilder::new(
            self.partitioner,
            self.min_cluster_triangles,
            self.max_cluster_triangles,
        );
        self.clusters = cluster_builder.build(vertices, indices, material_indices)?;
        for (i, cluster) in self.clusters.iter_mut().enumerate() {
            cluster.index = i as u32;
        }
        log::debug!("clustered mesh into {} leaf clusters", self.clusters.len());

        let mut level_begin = 0u32;
        let mut level_num = self.clusters.len() as u32;
        let mut current_level = 0u32;

        while level_num > 1 {
            let level_end = level_begin + level_num - 1;

            if level_num <= self.max_group_clusters {
                let new_level_begin = self.clusters.len() as u32;
                self.dag_reduce(level_begin, level_end, current_level)?;
                if self.clusters.len() as u32 > new_level_begin {
                    level_begin = new_level_begin;
                    level_num = self.clusters.len() as u32 - level_begin;
                    current_level += 1;
                    continue;
                }
                log::warn!(
                    "DAG reduction stalled at level {} with {} clusters",
                    current_level,
                    level_num
                );
                break;
            }

            let graph = self.build_clusters_adjacency(level_begin, level_end);
            let partition = Partitioner::new(self.partitioner).partition_strict(
                &graph,
                self.min_group_clusters,
                self.max_group_clusters,
            )?;

            // Reorder this level so each group is contiguous
            let mut new_order: Vec<Cluster> = Vec::with_capacity(level_num as usize);
            for &old_local in &partition.indices {
                new_order.push(std::mem::take(
                    &mut self.clusters[(level_begin + old_local) as usize],
                ));
            }
            for (i, cluster) in new_order.into_iter().enumerate() {
                self.clusters[level_begin as usize + i] = cluster;
            }

            let new_level_begin = self.clusters.len() as u32;
            let new_level_group_begin = self.groups.len() as u32;
            let mut reduced_all = true;
            for &range in &partition.ranges {
                let cluster_begin = level_begin + range.begin;
                let cluster_end = level_begin + range.end;
                if !self.dag_reduce(cluster_begin, cluster_end, current_level)? {
                    // Soft rollback of the whole level
                    self.clusters.truncate(new_level_begin as usize);
                    self.groups.truncate(new_level_group_begin as usize);
                    reduced_all = false;
                    break;
                }
            }

            if reduced_all && self.clusters.len() as u32 > new_level_begin {
                level_begin = new_level_begin;
                level_num = self.clusters.len() as u32 - level_begin;
                current_level += 1;
            } else {
                log::warn!(
                    "DAG build stopped at level {} with {} clusters unreduced",
                    current_level,
                    level_num
                );
                break;
            }
        }

        // Root group; infinite parent error keeps the coarsest cut
        // permanently selectable
        let mut root = ClusterGroup {
            level: current_level,
            index: self.groups.len() as u32,
            max_parent_error: f32::INFINITY,
            ..Default::default()
        };
        root.clusters.reserve(level_num as usize);
        for i in 0..level_num {
            let idx = level_begin + i;
            let cluster = &mut self.clusters[idx as usize];
            cluster.index = idx;
            cluster.group_index = root.index;
            root.clusters.push(idx);
            root.parent_lod_bound = root.parent_lod_bound.merged(&cluster.lod_bound);
            root.bound = root.bound.merged(&cluster.bound);
        }
        self.groups.push(root);

        self.clusters.sort_by_key(|c| c.index);
        self.level_num = current_level;
        self.collect_stats();
        log::info!(
            "built DAG: {} clusters, {} groups, {} levels, {}..{} triangles",
            self.clusters.len(),
            self.groups.len(),
            self.level_num + 1,
            self.min_triangle_count,
            self.max_triangle_count
        );
        Ok(())
    }

    fn collect_stats(&mut self) {
        self.min_triangle_count = 0;
        self.max_triangle_count = 0;
        self.max_error = 0.0;
        let root_index = self.groups.len() - 1;
        for (group_index, group) in self.groups.iter().enumerate() {
            for &cluster_index in &group.clusters {
                let cluster = &self.clusters[cluster_index as usize];
                if group_index == root_index {
                    self.min_triangle_count += cluster.triangle_count();
                }
                if cluster.generating_group_index == INVALID_INDEX {
                    self.max_triangle_count += cluster.triangle_count();
                }
                self.max_error = self.max_error.max(cluster.lod_error);
            }
        }
    }

    /// Merge, simplify and re-cluster one group of children
    ///
    /// Returns `Ok(false)` when no acceptable parent clustering was
    /// found; the caller rolls the level back.
    fn dag_reduce(&mut self, children_begin: u32, children_end: u32, level: u32) -> Result<bool> {
        let merged =
            Cluster::merge(&self.clusters[children_begin as usize..=children_end as usize]);

        let mut num_parent = div_round_up(
            merged.indices.len() as u32,
            6 * self.max_cluster_triangles,
        );
        let min_target_triangles = self.max_cluster_triangles * num_parent / 2;

        let mut simplifier = match MeshSimplifier::new(
            &merged.vertices,
            &merged.indices,
            &merged.material_indices,
            3,
            min_target_triangles,
        ) {
            Ok(simplifier) => simplifier,
            Err(err) => {
                log::warn!(
                    "simplifier rejected group of clusters {}..={}: {}",
                    children_begin,
                    children_end,
                    err
                );
                return Ok(false);
            }
        };

        let parent_begin = self.clusters.len() as u32;
        let mut simplify_error = 0.0f32;

        let mut partition_num = self.max_cluster_triangles - 2;
        while partition_num >= self.max_cluster_triangles / 2 {
            let target = partition_num * num_parent;
            if let Some(mesh) = simplifier.simplify(SimplifyTarget::Triangle, target) {
                if num_parent == 1 {
                    simplify_error = mesh.error;
                    self.clusters.push(Cluster::from_mesh(
                        mesh.vertices,
                        mesh.indices,
                        mesh.material_indices,
                    ));
                    break;
                }

                let builder = TriangleClusterBuilder::new(
                    self.partitioner,
                    self.min_cluster_triangles,
                    self.max_cluster_triangles,
                );
                match builder.build(&mesh.vertices, &mesh.indices, &mesh.material_indices) {
                    Ok(parents) if parents.len() as u32 <= num_parent => {
                        simplify_error = mesh.error;
                        self.clusters.extend(parents);
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        log::debug!("re-cluster attempt at {} triangles failed: {}", target, err);
                    }
                }
            }
            partition_num -= 2;
        }

        let parent_end = self.clusters.len() as u32;
        if parent_begin == parent_end {
            return Ok(false);
        }
        num_parent = parent_end - parent_begin;

        let mut group = ClusterGroup {
            level,
            index: self.groups.len() as u32,
            ..Default::default()
        };

        let mut max_parent_error = simplify_error;
        let mut max_parent_edge_length = 0.0f32;
        let num_children = children_end - children_begin + 1;
        group.clusters.reserve(num_children as usize);
        for i in 0..num_children {
            let child = &mut self.clusters[(children_begin + i) as usize];
            child.group_index = group.index;

            max_parent_edge_length = max_parent_edge_length.max(child.edge_length);
            max_parent_error = max_parent_error.max(child.lod_error);
            group.parent_lod_bound = group.parent_lod_bound.merged(&child.lod_bound);
            group.bound = group.bound.merged(&child.bound);
            // Groups reference clusters by identity, not position;
            // later reorders only permute positions
            group.clusters.push(child.index);
        }

        group.generating_clusters.reserve(num_parent as usize);
        for i in 0..num_parent {
            let idx = parent_begin + i;
            let parent = &mut self.clusters[idx as usize];
            parent.index = idx;
            parent.edge_length = max_parent_edge_length;
            parent.lod_error = max_parent_error;
            parent.lod_bound = group.parent_lod_bound;
            parent.level = level + 1;
            parent.generating_group_index = group.index;
            group.generating_clusters.push(idx);
        }

        group.edge_length = max_parent_edge_length;
        group.max_parent_error = max_parent_error;
        self.groups.push(group);
        Ok(true)
    }

    /// Count shared boundary edges between every pair of clusters in a
    /// level range
    fn mask_cluster_adjacency(&self, begin: u32, end: u32) -> Vec<HashMap<u32, u32>> {
        let num = (end - begin + 1) as usize;

        let mut vertex_ids: HashMap<[u32; 8], u32> = HashMap::new();
        let mut edge_hash: EdgeHash<u32> = EdgeHash::new();

        for local in 0..num {
            let cluster = &self.clusters[begin as usize + local];
            for tri in cluster.indices.chunks_exact(3) {
                let mut ids = [0u32; 3];
                for (k, &index) in tri.iter().enumerate() {
                    let key = cluster.vertices[index as usize].content_key();
                    let next = vertex_ids.len() as u32;
                    ids[k] = *vertex_ids.entry(key).or_insert(next);
                }
                for k in 0..3 {
                    edge_hash.add_edge(ids[k], ids[(k + 1) % 3], local as u32);
                }
            }
        }

        let mut adjacency: Vec<HashMap<u32, u32>> = vec![HashMap::new(); num];
        for (&(v0, v1), owners) in edge_hash.edges() {
            for &cluster in owners {
                edge_hash.for_each_tri(v1, v0, |other| {
                    if other != cluster {
                        *adjacency[cluster as usize].entry(other).or_insert(0) += 1;
                    }
                });
            }
        }
        adjacency
    }

    /// Cluster adjacency graph biased toward keeping siblings together
    fn build_clusters_adjacency(&self, begin: u32, end: u32) -> Graph {
        let adjacency = self.mask_cluster_adjacency(begin, end);
        let num = adjacency.len() as u32;

        let mut builder = GraphBuilder::new(num);
        for (local, neighbors) in adjacency.iter().enumerate() {
            let generating = self.clusters[begin as usize + local].generating_group_index;
            for (&other, &shared_edges) in neighbors {
                let sibling = generating != INVALID_INDEX
                    && generating
                        == self.clusters[(begin + other) as usize].generating_group_index;
                let mut cost = shared_edges * if sibling { 1 } else { 16 };
                cost += 4;
                builder.add_edge_cost(local as u32, other, cost as i32);
            }
        }
        builder.build()
    }

    /// Select the coarsest cut satisfying the triangle and error
    /// targets
    ///
    /// `target_triangles == 0` means unconstrained by count: descend
    /// until the error target holds or only leaves remain, so `(0, 0)`
    /// yields the finest cut. A huge error target yields the root cut.
    pub fn find_dag_cut(&self, target_triangles: u32, target_error: f32) -> DagCut {
        let mut in_heap = vec![false; self.clusters.len()];
        let mut heap: BinaryHeap<CutElement> = BinaryHeap::new();
        let mut triangle_count = 0u32;

        if let Some(root) = self.groups.last() {
            for &cluster_index in &root.clusters {
                let cluster = &self.clusters[cluster_index as usize];
                heap.push(CutElement {
                    cluster: cluster_index,
                    error: cluster.lod_error,
                });
                triangle_count += cluster.triangle_count();
                in_heap[cluster_index as usize] = true;
            }
        }

        let mut min_error = f32::MAX;
        let mut cur_error = 0.0f32;

        while let Some(&top) = heap.peek() {
            let cluster = &self.clusters[top.cluster as usize];
            cur_error = top.error;

            let target_hit = cur_error <= target_error
                || (target_triangles > 0 && triangle_count >= target_triangles);
            if target_hit && cur_error < min_error {
                break;
            }
            if cluster.generating_group_index == INVALID_INDEX {
                // Finest level reached
                break;
            }
            min_error = min_error.min(cur_error);

            heap.pop();
            triangle_count -= cluster.triangle_count();

            let group = &self.groups[cluster.generating_group_index as usize];
            for &child_index in &group.clusters {
                if in_heap[child_index as usize] {
                    continue;
                }
                let child = &self.clusters[child_index as usize];
                heap.push(CutElement {
                    cluster: child_index,
                    error: child.lod_error,
                });
                triangle_count += child.triangle_count();
                in_heap[child_index as usize] = true;
            }
        }

        let mut clusters: Vec<u32> = heap.into_iter().map(|e| e.cluster).collect();
        clusters.sort_unstable();
        DagCut {
            clusters,
            triangle_count,
            error: cur_error,
        }
    }

    /// Flatten a cut back into one mesh, for inspection and tests
    pub fn extract_cut_mesh(
        &self,
        cluster_indices: &[u32],
    ) -> (Vec<MeshVertex>, Vec<u32>, Vec<u32>) {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        let mut material_indices = Vec::new();
        for &cluster_index in cluster_indices {
            let cluster = &self.clusters[cluster_index as usize];
            let base = vertices.len() as u32;
            vertices.extend_from_slice(&cluster.vertices);
            indices.extend(cluster.indices.iter().map(|&i| base + i));
            material_indices.extend_from_slice(&cluster.material_indices);
        }
        (vertices, indices, material_indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Vec2, Vec3};
    use crate::partition::GreedyBisect;

    fn quad_mesh() -> (Vec<MeshVertex>, Vec<u32>, Vec<u32>) {
        let v = |x: f32, y: f32| MeshVertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(x, y));
        (
            vec![v(0.0, 0.0), v(1.0, 0.0), v(0.0, 1.0), v(1.0, 1.0)],
            vec![0, 1, 2, 1, 3, 2],
            vec![0, 0],
        )
    }

    #[test]
    fn test_quad_builds_single_root_cluster() {
        let (vertices, indices, materials) = quad_mesh();
        let mut dag = DagBuilder::new(&GreedyBisect, 124, 128, 4, 32);
        dag.build(&vertices, &indices, &materials).unwrap();

        // Nothing to reduce: the base group is the root group
        assert_eq!(dag.clusters.len(), 1);
        assert_eq!(dag.groups.len(), 1);
        assert_eq!(dag.level_num, 0);
        let root = dag.groups.last().unwrap();
        assert_eq!(root.level, 0);
        assert_eq!(root.clusters, vec![0]);
        assert!(root.max_parent_error.is_infinite());
        assert_eq!(dag.min_triangle_count, 2);
        assert_eq!(dag.max_triangle_count, 2);
    }

    #[test]
    fn test_cluster_indices_match_positions() {
        let (vertices, indices, materials) = quad_mesh();
        let mut dag = DagBuilder::new(&GreedyBisect, 124, 128, 4, 32);
        dag.build(&vertices, &indices, &materials).unwrap();
        for (i, cluster) in dag.clusters.iter().enumerate() {
            assert_eq!(cluster.index, i as u32);
        }
    }

    #[test]
    fn test_find_dag_cut_on_quad() {
        let (vertices, indices, materials) = quad_mesh();
        let mut dag = DagBuilder::new(&GreedyBisect, 124, 128, 4, 32);
        dag.build(&vertices, &indices, &materials).unwrap();

        let finest = dag.find_dag_cut(0, 0.0);
        assert_eq!(finest.clusters, vec![0]);
        assert_eq!(finest.triangle_count, 2);

        let coarsest = dag.find_dag_cut(u32::MAX, f32::MAX);
        assert_eq!(coarsest.clusters, vec![0]);
    }

    #[test]
    fn test_extract_cut_mesh_concatenates() {
        let (vertices, indices, materials) = quad_mesh();
        let mut dag = DagBuilder::new(&GreedyBisect, 124, 128, 4, 32);
        dag.build(&vertices, &indices, &materials).unwrap();

        let cut = dag.find_dag_cut(0, 0.0);
        let (v, i, m) = dag.extract_cut_mesh(&cut.clusters);
        assert_eq!(i.len(), 6);
        assert_eq!(m.len(), 2);
        assert!(i.iter().all(|&idx| (idx as usize) < v.len()));
    }
}
