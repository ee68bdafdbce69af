//! 4-ary BVH over cluster group parts
//!
//! The runtime walks a flat node array to pick which parts a view
//! needs; leaves point at parts, internal nodes merge their children's
//! LOD bounds and errors. Parts of the same LOD level get their own
//! subtree so a traversal can early-out per level.

use crate::cluster::{ClusterGroup, GroupPart};
use crate::core::types::INVALID_INDEX;
use crate::math::Aabb;
use bytemuck::{Pod, Zeroable};

pub const MAX_BVH_CHILDREN: usize = 4;

/// GPU-side hierarchy record
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
pub struct HierarchyNode {
    /// xyz = LOD bound center, w = max error
    pub lod_bound_center_error: [f32; 4],
    /// xyz = half extent, w = bounding radius
    pub lod_bound_half_extent_radius: [f32; 4],
    pub children: [u32; MAX_BVH_CHILDREN],
    /// Part for leaves, `INVALID_INDEX` for internal nodes
    pub part_index: u32,
    pub padding: [u32; 3],
}

const _: () = assert!(std::mem::size_of::<HierarchyNode>() == 64);

#[derive(Clone, Debug)]
struct BvhNode {
    lod_bound: Aabb,
    lod_error: f32,
    part_index: u32,
    children: Vec<u32>,
}

impl Default for BvhNode {
    fn default() -> Self {
        Self {
            lod_bound: Aabb::empty(),
            lod_error: 0.0,
            part_index: INVALID_INDEX,
            children: Vec::new(),
        }
    }
}

/// Intermediate pointer-form BVH; flattened by [`build_hierarchy`]
#[derive(Clone, Debug, Default)]
pub struct ClusterBvh {
    nodes: Vec<BvhNode>,
    root: u32,
}

/// Order node indices along the axis whose sorted halves have the
/// smallest summed surface area
fn sort_nodes_by_best_axis(nodes: &[BvhNode], indices: &mut [u32]) {
    let mut best_score = f32::MAX;
    let mut best_order: Vec<u32> = indices.to_vec();

    for axis in 0..3 {
        let mut sorted = indices.to_vec();
        sorted.sort_by(|&a, &b| {
            let ca = nodes[a as usize].lod_bound.center()[axis];
            let cb = nodes[b as usize].lod_bound.center()[axis];
            ca.total_cmp(&cb).then(a.cmp(&b))
        });

        let half = sorted.len() / 2;
        let mut bounds = [Aabb::empty(), Aabb::empty()];
        for (i, &index) in sorted.iter().enumerate() {
            let side = usize::from(i >= half);
            bounds[side] = bounds[side].merged(&nodes[index as usize].lod_bound);
        }
        let score = bounds[0].surface_area() + bounds[1].surface_area();
        if score < best_score {
            best_score = score;
            best_order = sorted;
        }
    }

    indices.copy_from_slice(&best_order);
}

/// Emit a subtree over `indices`, distributing nodes into power-of-4
/// buckets
fn build_top_down(nodes: &mut Vec<BvhNode>, indices: &mut [u32], sort: bool) -> u32 {
    let node_num = indices.len() as u32;
    if node_num == 1 {
        return indices[0];
    }

    let root_index = nodes.len() as u32;
    nodes.push(BvhNode::default());

    if node_num as usize <= MAX_BVH_CHILDREN {
        let mut bound = Aabb::empty();
        let mut error = 0.0f32;
        for &child in indices.iter() {
            bound = bound.merged(&nodes[child as usize].lod_bound);
            error = error.max(nodes[child as usize].lod_error);
        }
        let root = &mut nodes[root_index as usize];
        root.children = indices.to_vec();
        root.lod_bound = bound;
        root.lod_error = error;
        return root_index;
    }

    let branch = MAX_BVH_CHILDREN as u32;
    let mut max_node = branch;
    while max_node * branch <= node_num {
        max_node *= branch;
    }
    let min_per_child = max_node / branch;
    let max_add = max_node - min_per_child;
    let mut rest = node_num - max_node;

    let mut child_counts = [0u32; MAX_BVH_CHILDREN];
    for count in &mut child_counts {
        let add = rest.min(max_add);
        *count = min_per_child + add;
        rest -= add;
    }
    debug_assert_eq!(rest, 0);

    if sort {
        sort_nodes_by_best_axis(nodes, indices);
    }

    let mut children = Vec::with_capacity(MAX_BVH_CHILDREN);
    let mut offset = 0usize;
    let mut bound = Aabb::empty();
    let mut error = 0.0f32;
    for &count in &child_counts {
        let mut child_slice = indices[offset..offset + count as usize].to_vec();
        let child_index = build_top_down(nodes, &mut child_slice, true);
        bound = bound.merged(&nodes[child_index as usize].lod_bound);
        error = error.max(nodes[child_index as usize].lod_error);
        children.push(child_index);
        offset += count as usize;
    }

    let root = &mut nodes[root_index as usize];
    root.children = children;
    root.lod_bound = bound;
    root.lod_error = error;
    root_index
}

/// Build the part BVH, one subtree per LOD level joined under a common
/// root
pub fn build_cluster_bvh(parts: &[GroupPart]) -> ClusterBvh {
    let mut nodes: Vec<BvhNode> = parts
        .iter()
        .map(|part| BvhNode {
            lod_bound: part.lod_bound,
            lod_error: part.lod_error,
            part_index: part.index,
            children: Vec::new(),
        })
        .collect();

    if nodes.is_empty() {
        return ClusterBvh::default();
    }

    let root = if nodes.len() == 1 {
        let leaf = &nodes[0];
        let root = BvhNode {
            lod_bound: leaf.lod_bound,
            lod_error: leaf.lod_error,
            part_index: INVALID_INDEX,
            children: vec![0],
        };
        nodes.push(root);
        1
    } else {
        let max_level = parts.iter().map(|p| p.level).max().unwrap_or(0);
        let mut indices_by_level: Vec<Vec<u32>> = vec![Vec::new(); max_level as usize + 1];
        for (index, part) in parts.iter().enumerate() {
            indices_by_level[part.level as usize].push(index as u32);
        }

        let mut roots = Vec::new();
        for mut level_indices in indices_by_level {
            if level_indices.is_empty() {
                continue;
            }
            let level_root = build_top_down(&mut nodes, &mut level_indices, true);
            let node = &nodes[level_root as usize];
            if node.part_index != INVALID_INDEX || node.children.len() == MAX_BVH_CHILDREN {
                roots.push(level_root);
            } else {
                // Merge an underfull level root into the parent's fanout
                roots.extend(nodes[level_root as usize].children.iter().copied());
            }
        }
        build_top_down(&mut nodes, &mut roots, false)
    };

    ClusterBvh { nodes, root }
}

/// Flatten the BVH into GPU [`HierarchyNode`] records
///
/// Leaves take their bound and error from the owning group's parent
/// LOD data; each part learns its hierarchy slot for streaming fixups.
pub fn build_hierarchy(
    bvh: &ClusterBvh,
    parts: &mut [GroupPart],
    groups: &[ClusterGroup],
) -> Vec<HierarchyNode> {
    let mut hierarchy = Vec::with_capacity(bvh.nodes.len());
    if !bvh.nodes.is_empty() {
        emit_hierarchy(bvh, bvh.root, parts, groups, &mut hierarchy);
    }
    hierarchy
}

fn emit_hierarchy(
    bvh: &ClusterBvh,
    index: u32,
    parts: &mut [GroupPart],
    groups: &[ClusterGroup],
    out: &mut Vec<HierarchyNode>,
) -> u32 {
    let hierarchy_index = out.len() as u32;
    out.push(HierarchyNode {
        children: [INVALID_INDEX; MAX_BVH_CHILDREN],
        part_index: INVALID_INDEX,
        ..Default::default()
    });

    let node = &bvh.nodes[index as usize];
    let mut bound = Aabb::empty();
    let mut error = 0.0f32;
    let mut record = HierarchyNode {
        children: [INVALID_INDEX; MAX_BVH_CHILDREN],
        part_index: node.part_index,
        ..Default::default()
    };

    if node.part_index == INVALID_INDEX {
        for (slot, &child) in node.children.iter().take(MAX_BVH_CHILDREN).enumerate() {
            let child_index = emit_hierarchy(bvh, child, parts, groups, out);
            record.children[slot] = child_index;

            let child_record = &out[child_index as usize];
            let center = child_record.lod_bound_center_error;
            let extent = child_record.lod_bound_half_extent_radius;
            let child_bound = Aabb::from_center_half_extent(
                crate::core::types::Vec3::new(center[0], center[1], center[2]),
                crate::core::types::Vec3::new(extent[0], extent[1], extent[2]),
            );
            bound = bound.merged(&child_bound);
            error = error.max(center[3]);
        }
    } else {
        let part = &mut parts[node.part_index as usize];
        let group = &groups[part.group_index as usize];
        bound = group.parent_lod_bound;
        error = group.max_parent_error;
        part.hierarchy_index = hierarchy_index;
    }

    let center = bound.center();
    let half_extent = bound.half_extent();
    record.lod_bound_center_error = [center.x, center.y, center.z, error];
    record.lod_bound_half_extent_radius = [
        half_extent.x,
        half_extent.y,
        half_extent.z,
        half_extent.length(),
    ];
    out[hierarchy_index as usize] = record;
    hierarchy_index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Vec3;

    fn part(index: u32, level: u32, center: f32, error: f32) -> GroupPart {
        GroupPart {
            index,
            group_index: 0,
            level,
            lod_bound: Aabb::from_center_half_extent(Vec3::splat(center), Vec3::splat(0.5)),
            lod_error: error,
            ..Default::default()
        }
    }

    fn single_group() -> Vec<ClusterGroup> {
        vec![ClusterGroup {
            index: 0,
            parent_lod_bound: Aabb::from_center_half_extent(Vec3::ZERO, Vec3::ONE),
            max_parent_error: 0.25,
            ..Default::default()
        }]
    }

    #[test]
    fn test_single_part_gets_wrapper_root() {
        let mut parts = vec![part(0, 0, 0.0, 0.1)];
        let bvh = build_cluster_bvh(&parts);
        let groups = single_group();
        let hierarchy = build_hierarchy(&bvh, &mut parts, &groups);

        assert_eq!(hierarchy.len(), 2);
        assert_eq!(hierarchy[0].part_index, INVALID_INDEX);
        assert_eq!(hierarchy[0].children[0], 1);
        assert_eq!(hierarchy[1].part_index, 0);
        assert_eq!(parts[0].hierarchy_index, 1);
    }

    #[test]
    fn test_leaf_inherits_group_parent_bound() {
        let mut parts = vec![part(0, 0, 0.0, 0.1)];
        let bvh = build_cluster_bvh(&parts);
        let groups = single_group();
        let hierarchy = build_hierarchy(&bvh, &mut parts, &groups);

        let leaf = &hierarchy[1];
        assert_eq!(leaf.lod_bound_center_error[3], 0.25);
        assert_eq!(leaf.lod_bound_half_extent_radius[0], 1.0);
    }

    #[test]
    fn test_many_parts_bounded_fanout() {
        let mut parts: Vec<GroupPart> = (0..13)
            .map(|i| part(i, 0, i as f32, 0.01 * i as f32))
            .collect();
        let bvh = build_cluster_bvh(&parts);
        let groups = single_group();
        let hierarchy = build_hierarchy(&bvh, &mut parts, &groups);

        // Every part appears exactly once as a leaf
        let mut seen = vec![false; 13];
        for node in &hierarchy {
            if node.part_index != INVALID_INDEX {
                assert!(!seen[node.part_index as usize]);
                seen[node.part_index as usize] = true;
            } else {
                let fanout = node
                    .children
                    .iter()
                    .filter(|&&c| c != INVALID_INDEX)
                    .count();
                assert!(fanout >= 1 && fanout <= MAX_BVH_CHILDREN);
            }
        }
        assert!(seen.iter().all(|&s| s));

        // Root error dominates all leaf errors
        let root_error = hierarchy[0].lod_bound_center_error[3];
        assert!(root_error >= 0.25);
    }

    #[test]
    fn test_levels_get_own_subtrees() {
        let mut parts: Vec<GroupPart> = (0..8)
            .map(|i| part(i, u32::from(i >= 4), i as f32, 0.1))
            .collect();
        let bvh = build_cluster_bvh(&parts);
        let groups = single_group();
        let hierarchy = build_hierarchy(&bvh, &mut parts, &groups);

        // All parts reachable from the root
        let mut stack = vec![0u32];
        let mut leaves = 0;
        while let Some(index) = stack.pop() {
            let node = &hierarchy[index as usize];
            if node.part_index != INVALID_INDEX {
                leaves += 1;
            } else {
                for &child in &node.children {
                    if child != INVALID_INDEX {
                        stack.push(child);
                    }
                }
            }
        }
        assert_eq!(leaves, 8);
    }
}
