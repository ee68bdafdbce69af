//! Cross-page patch records
//!
//! When a page's residency changes, clusters on other pages need their
//! leaf flags flipped and hierarchy nodes need their part visibility
//! updated. Fixups are precomputed per page so the streaming manager
//! can apply them without touching build-time structures.

use std::collections::HashSet;

use bytemuck::{Pod, Zeroable};

use crate::cluster::{Cluster, ClusterGroup, GroupPart};
use crate::core::types::INVALID_INDEX;

/// Patches one cluster's leaf flag when a dependency page range
/// changes residency
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct ClusterFixup {
    pub fixup_page: u32,
    pub cluster_index_in_page: u32,
    pub dependency_page_start: u32,
    pub dependency_page_end: u32,
}

/// Patches one hierarchy part's visibility when its group's page range
/// changes residency
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Pod, Zeroable)]
pub struct HierarchyFixup {
    pub fixup_page: u32,
    pub part_index: u32,
    pub dependency_page_start: u32,
    pub dependency_page_end: u32,
}

/// Fixups indexed by the page whose residency change triggers them
#[derive(Debug, Default, Clone)]
pub struct PageFixups {
    pub cluster_fixups: Vec<Vec<ClusterFixup>>,
    pub hierarchy_fixups: Vec<Vec<HierarchyFixup>>,
}

/// A cluster produced by simplifying a group depends on the pages
/// holding that group; every page in the range carries the cluster
/// fixup. Parts of one group reference each other across pages, so
/// each part's page carries a hierarchy fixup for every sibling part.
pub fn build_fixups(
    clusters: &[Cluster],
    groups: &[ClusterGroup],
    parts: &[GroupPart],
    page_count: usize,
) -> PageFixups {
    let mut fixups = PageFixups {
        cluster_fixups: vec![Vec::new(); page_count],
        hierarchy_fixups: vec![Vec::new(); page_count],
    };
    let mut cluster_seen: Vec<HashSet<ClusterFixup>> = vec![HashSet::new(); page_count];
    let mut hierarchy_seen: Vec<HashSet<HierarchyFixup>> = vec![HashSet::new(); page_count];

    for part in parts {
        for &cluster_index in &part.clusters {
            let cluster = &clusters[cluster_index as usize];
            if cluster.generating_group_index == INVALID_INDEX {
                continue;
            }
            let generating = &groups[cluster.generating_group_index as usize];
            let fixup = ClusterFixup {
                fixup_page: part.page_index,
                cluster_index_in_page: part.cluster_start + cluster.offset_in_part,
                dependency_page_start: generating.page_start,
                dependency_page_end: generating.page_end,
            };
            for page in generating.page_start..=generating.page_end {
                if cluster_seen[page as usize].insert(fixup) {
                    fixups.cluster_fixups[page as usize].push(fixup);
                }
            }
        }
    }

    let mut group_parts: Vec<Vec<u32>> = vec![Vec::new(); groups.len()];
    for part in parts {
        group_parts[part.group_index as usize].push(part.index);
    }
    for part in parts {
        let group = &groups[part.group_index as usize];
        for &sibling_index in &group_parts[part.group_index as usize] {
            let sibling = &parts[sibling_index as usize];
            let fixup = HierarchyFixup {
                fixup_page: sibling.page_index,
                part_index: sibling.index,
                dependency_page_start: group.page_start,
                dependency_page_end: group.page_end,
            };
            let page = part.page_index as usize;
            if hierarchy_seen[page].insert(fixup) {
                fixups.hierarchy_fixups[page].push(fixup);
            }
        }
    }

    fixups
}

/// Pages whose resident clusters must be patched when `page` arrives,
/// in first-seen order. A page never lists itself.
pub fn build_page_dependencies(fixups: &PageFixups) -> Vec<Vec<u32>> {
    let mut dependencies = Vec::with_capacity(fixups.cluster_fixups.len());
    for (page_index, cluster_fixups) in fixups.cluster_fixups.iter().enumerate() {
        let mut pages: Vec<u32> = Vec::new();
        for fixup in cluster_fixups {
            if fixup.fixup_page != page_index as u32 && !pages.contains(&fixup.fixup_page) {
                pages.push(fixup.fixup_page);
            }
        }
        dependencies.push(pages);
    }
    dependencies
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(index: u32, group_index: u32, page_index: u32, clusters: Vec<u32>) -> GroupPart {
        GroupPart {
            clusters,
            index,
            group_index,
            page_index,
            cluster_start: 0,
            ..GroupPart::default()
        }
    }

    fn group(page_start: u32, page_end: u32) -> ClusterGroup {
        ClusterGroup {
            page_start,
            page_end,
            ..ClusterGroup::default()
        }
    }

    fn cluster(generating_group_index: u32, offset_in_part: u32) -> Cluster {
        let mut cluster = Cluster::default();
        cluster.generating_group_index = generating_group_index;
        cluster.offset_in_part = offset_in_part;
        cluster
    }

    #[test]
    fn test_cluster_fixup_spans_dependency_pages() {
        // Group 0 (children) on pages 1..=2, its parent cluster on page 0
        let groups = vec![group(1, 2), group(0, 0)];
        let clusters = vec![cluster(0, 0)];
        let parts = vec![part(0, 1, 0, vec![0])];

        let fixups = build_fixups(&clusters, &groups, &parts, 3);
        assert!(fixups.cluster_fixups[0].is_empty());
        assert_eq!(fixups.cluster_fixups[1].len(), 1);
        assert_eq!(fixups.cluster_fixups[2].len(), 1);
        let fixup = fixups.cluster_fixups[1][0];
        assert_eq!(fixup.fixup_page, 0);
        assert_eq!(fixup.cluster_index_in_page, 0);
        assert_eq!(fixup.dependency_page_start, 1);
        assert_eq!(fixup.dependency_page_end, 2);
    }

    #[test]
    fn test_leaf_clusters_need_no_fixup() {
        let groups = vec![group(0, 0)];
        let clusters = vec![cluster(INVALID_INDEX, 0)];
        let parts = vec![part(0, 0, 0, vec![0])];

        let fixups = build_fixups(&clusters, &groups, &parts, 1);
        assert!(fixups.cluster_fixups[0].is_empty());
    }

    #[test]
    fn test_hierarchy_fixups_link_sibling_parts() {
        // One group split over two pages: each page records fixups for
        // both parts
        let groups = vec![group(0, 1)];
        let clusters = vec![cluster(INVALID_INDEX, 0), cluster(INVALID_INDEX, 0)];
        let parts = vec![part(0, 0, 0, vec![0]), part(1, 0, 1, vec![1])];

        let fixups = build_fixups(&clusters, &groups, &parts, 2);
        for page in 0..2 {
            assert_eq!(fixups.hierarchy_fixups[page].len(), 2);
            let targets: Vec<u32> = fixups.hierarchy_fixups[page]
                .iter()
                .map(|f| f.part_index)
                .collect();
            assert_eq!(targets, vec![0, 1]);
        }
    }

    #[test]
    fn test_dependencies_skip_self_and_dedup() {
        let groups = vec![group(1, 1), group(0, 0)];
        // Two parent clusters on page 0, both depending on page 1
        let clusters = vec![cluster(0, 0), cluster(0, 1)];
        let parts = vec![part(0, 1, 0, vec![0, 1])];

        let fixups = build_fixups(&clusters, &groups, &parts, 2);
        let dependencies = build_page_dependencies(&fixups);
        assert!(dependencies[0].is_empty());
        assert_eq!(dependencies[1], vec![0]);
    }
}
