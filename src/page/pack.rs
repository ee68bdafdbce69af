//! Greedy group-major packing of clusters into streaming pages

use crate::cluster::{Cluster, ClusterGroup, GroupPart};
use crate::core::Error;
use crate::core::types::INVALID_INDEX;
use crate::core::types::Result;
use crate::page::{
    BYTES_PER_CLUSTER_BATCH, BYTES_PER_INDEX, BYTES_PER_MATERIAL_BATCH, BYTES_PER_VERTEX,
    MAX_CLUSTERS_PER_PAGE, MAX_PARTS_PER_PAGE, PAGE_HEADER_BYTES, ROOT_PAGE_CAPACITY,
    STREAMING_PAGE_CAPACITY,
};

/// A fixed-size slab of cluster data, the unit of streaming
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub part_start: u32,
    pub part_num: u32,
    pub cluster_num: u32,
    pub data_byte_size: u32,
    pub is_root: bool,
}

impl Page {
    fn open(is_root: bool) -> Self {
        Page {
            data_byte_size: PAGE_HEADER_BYTES,
            is_root,
            ..Page::default()
        }
    }

    pub fn capacity(&self) -> u32 {
        if self.is_root {
            ROOT_PAGE_CAPACITY
        } else {
            STREAMING_PAGE_CAPACITY
        }
    }
}

/// Encoded byte footprint of one cluster inside a page
pub fn cluster_byte_size(cluster: &Cluster) -> u32 {
    let mut size = 0;
    size += BYTES_PER_VERTEX * cluster.vertices.len() as u32;
    size += BYTES_PER_INDEX * cluster.indices.len() as u32;
    for range in &cluster.material_ranges {
        size += BYTES_PER_MATERIAL_BATCH * range.batch_tri_counts.len() as u32;
    }
    size + BYTES_PER_CLUSTER_BATCH
}

/// Walks the groups in order and fills pages greedily. A group spills
/// into a fresh part whenever it crosses a page boundary, so a part
/// never spans two pages. Stamps `part_index`/`offset_in_part` on the
/// clusters and the page/part ranges on the groups.
///
/// Groups must be sorted coarsest level first; the pages holding the
/// root level are flagged as root pages.
pub fn build_pages(
    clusters: &mut [Cluster],
    groups: &mut [ClusterGroup],
    level_num: u32,
) -> Result<(Vec<Page>, Vec<GroupPart>)> {
    let mut pages = vec![Page::open(true)];
    let mut parts: Vec<GroupPart> = Vec::with_capacity(groups.len());
    // INVALID while no part is open on the current page
    let mut current_part = INVALID_INDEX;

    for group_index in 0..groups.len() {
        let cluster_indices = groups[group_index].clusters.clone();
        for (local, &cluster_index) in cluster_indices.iter().enumerate() {
            let byte_size = cluster_byte_size(&clusters[cluster_index as usize]);

            let page = pages.last_mut().ok_or_else(|| Error::Build("no open page".into()))?;
            if byte_size + PAGE_HEADER_BYTES > page.capacity() {
                return Err(Error::Build(format!(
                    "cluster {} needs {} bytes, page capacity is {}",
                    cluster_index,
                    byte_size,
                    page.capacity()
                )));
            }

            if page.part_num + 1 > MAX_PARTS_PER_PAGE
                || page.cluster_num + 1 > MAX_CLUSTERS_PER_PAGE
                || page.data_byte_size + byte_size > page.capacity()
            {
                pages.push(Page::open(groups[group_index].level == level_num));
                current_part = INVALID_INDEX;
            }
            let page_index = pages.len() as u32 - 1;
            let page = &mut pages[page_index as usize];

            if page.part_num == 0 {
                page.part_start = parts.len() as u32;
            }

            if current_part == INVALID_INDEX
                || parts[current_part as usize].group_index != group_index as u32
            {
                let group = &groups[group_index];
                parts.push(GroupPart {
                    clusters: Vec::new(),
                    index: parts.len() as u32,
                    group_index: group_index as u32,
                    level: group.level,
                    lod_bound: group.parent_lod_bound,
                    lod_error: group.max_parent_error,
                    page_index,
                    cluster_start: page.cluster_num,
                    hierarchy_index: INVALID_INDEX,
                });
                current_part = parts.len() as u32 - 1;
                page.part_num += 1;
            }

            let part = &mut parts[current_part as usize];
            let cluster = &mut clusters[cluster_index as usize];
            cluster.part_index = part.index;
            cluster.offset_in_part = part.clusters.len() as u32;
            part.clusters.push(cluster_index);
            page.data_byte_size += byte_size;
            page.cluster_num += 1;

            let group = &mut groups[group_index];
            if local == 0 {
                group.page_start = page_index;
                group.part_start = part.index;
            }
            if local == cluster_indices.len() - 1 {
                group.page_end = page_index;
                group.part_end = part.index;
            }
        }
    }

    Ok((pages, parts))
}
