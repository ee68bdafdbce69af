//! GPU-ready page payloads
//!
//! Each page encodes four sections: interleaved vertices, local
//! triangle indices, material batch records and per-cluster batch
//! descriptors. A 16 byte header of section offsets leads the blob.

use bytemuck::{Pod, Zeroable};

use crate::cluster::{Cluster, ClusterGroup, GroupPart};
use crate::core::Error;
use crate::core::types::{Result, Vec4};
use crate::page::{INTS_PER_MATERIAL_BATCH, Page};

/// Per-cluster descriptor the GPU culling pass walks. Offsets address
/// the owning page's sections; cone fields are reserved.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ClusterBatch {
    pub leaf: u32,
    pub vertex_float_offset: u32,
    pub index_int_offset: u32,
    pub material_int_offset: u32,
    pub part_index: u32,
    pub triangle_num: u32,
    pub batch_num: u32,
    pub padding: u32,
    pub lod_bound_center_error: [f32; 4],
    pub lod_bound_half_extent_radius: [f32; 4],
    pub parent_bound_center_error: [f32; 4],
    pub parent_bound_half_extent_radius: [f32; 4],
    pub cone_center: [f32; 4],
    pub cone_direction: [f32; 4],
}

const _: () = assert!(std::mem::size_of::<ClusterBatch>() == 16 * 6 + 8 * 4);

/// One page's sections, ready to serialize
#[derive(Debug, Default, Clone)]
pub struct PageStorage {
    pub vertex_byte_offset: u32,
    pub index_byte_offset: u32,
    pub material_byte_offset: u32,
    pub batch_byte_offset: u32,
    /// pos.xyz normal.xyz uv, 8 floats per vertex
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    /// material index, first triangle, last triangle per batch
    pub materials: Vec<u32>,
    pub batches: Vec<ClusterBatch>,
}

impl PageStorage {
    pub fn byte_size(&self) -> u32 {
        let mut size = std::mem::size_of::<u32>() as u32 * 4;
        size += (std::mem::size_of::<f32>() * self.vertices.len()) as u32;
        size += (std::mem::size_of::<u32>() * self.indices.len()) as u32;
        size += (std::mem::size_of::<u32>() * self.materials.len()) as u32;
        size += (std::mem::size_of::<ClusterBatch>() * self.batches.len()) as u32;
        size
    }

    /// Serializes header and sections into the upload blob
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.byte_size() as usize);
        let header = [
            self.vertex_byte_offset,
            self.index_byte_offset,
            self.material_byte_offset,
            self.batch_byte_offset,
        ];
        bytes.extend_from_slice(bytemuck::cast_slice(&header));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.vertices));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.indices));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.materials));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.batches));
        bytes
    }
}

/// Every page's sections concatenated, with batch offsets rebased to
/// the combined buffers
#[derive(Debug, Default, Clone)]
pub struct MeshClusterStorages {
    pub vertices: Vec<f32>,
    pub indices: Vec<u32>,
    pub materials: Vec<u32>,
    pub batches: Vec<ClusterBatch>,
}

fn bound_vectors(bound: &crate::math::Aabb, error: f32) -> (Vec4, Vec4) {
    let center = bound.center();
    let half = bound.half_extent();
    (
        Vec4::new(center.x, center.y, center.z, error),
        Vec4::new(half.x, half.y, half.z, half.length()),
    )
}

/// Encodes every page's clusters into section buffers. Offsets are
/// page-relative; `pages[i].data_byte_size` must match the encoded
/// size exactly.
pub fn build_page_storages(
    clusters: &[Cluster],
    groups: &[ClusterGroup],
    parts: &[GroupPart],
    pages: &[Page],
) -> Result<Vec<PageStorage>> {
    let mut storages = Vec::with_capacity(pages.len());

    for page in pages {
        let mut storage = PageStorage::default();

        for local_part in 0..page.part_num {
            let part_index = page.part_start + local_part;
            let part = &parts[part_index as usize];

            for &cluster_index in &part.clusters {
                let cluster = &clusters[cluster_index as usize];
                let group = &groups[cluster.group_index as usize];

                let (lod_center_error, lod_half_radius) =
                    bound_vectors(&cluster.lod_bound, cluster.lod_error);
                let (parent_center_error, parent_half_radius) =
                    bound_vectors(&group.parent_lod_bound, group.max_parent_error);

                let mut batch = ClusterBatch {
                    leaf: 1,
                    vertex_float_offset: storage.vertices.len() as u32,
                    index_int_offset: storage.indices.len() as u32,
                    material_int_offset: storage.materials.len() as u32,
                    part_index,
                    triangle_num: cluster.triangle_count(),
                    batch_num: 0,
                    padding: 0,
                    lod_bound_center_error: lod_center_error.to_array(),
                    lod_bound_half_extent_radius: lod_half_radius.to_array(),
                    parent_bound_center_error: parent_center_error.to_array(),
                    parent_bound_half_extent_radius: parent_half_radius.to_array(),
                    cone_center: [0.0; 4],
                    cone_direction: [0.0; 4],
                };

                for vertex in &cluster.vertices {
                    storage.vertices.extend_from_slice(&[
                        vertex.pos.x,
                        vertex.pos.y,
                        vertex.pos.z,
                        vertex.normal.x,
                        vertex.normal.y,
                        vertex.normal.z,
                        vertex.uv.x,
                        vertex.uv.y,
                    ]);
                }
                storage.indices.extend_from_slice(&cluster.indices);

                storage
                    .materials
                    .reserve(INTS_PER_MATERIAL_BATCH as usize * cluster.material_ranges.len());
                for range in &cluster.material_ranges {
                    let mut batch_begin = range.start;
                    for &tri_count in &range.batch_tri_counts {
                        storage.materials.push(range.material_index);
                        storage.materials.push(batch_begin);
                        storage.materials.push(batch_begin + tri_count - 1);
                        batch_begin += tri_count;
                        batch.batch_num += 1;
                    }
                }

                storage.batches.push(batch);
            }
        }

        let mut offset = std::mem::size_of::<u32>() as u32 * 4;
        storage.vertex_byte_offset = offset;
        offset += (std::mem::size_of::<f32>() * storage.vertices.len()) as u32;
        storage.index_byte_offset = offset;
        offset += (std::mem::size_of::<u32>() * storage.indices.len()) as u32;
        storage.material_byte_offset = offset;
        offset += (std::mem::size_of::<u32>() * storage.materials.len()) as u32;
        storage.batch_byte_offset = offset;
        offset += (std::mem::size_of::<ClusterBatch>() * storage.batches.len()) as u32;

        if offset != page.data_byte_size {
            return Err(Error::Build(format!(
                "page encodes to {} bytes, packing reserved {}",
                offset, page.data_byte_size
            )));
        }

        storages.push(storage);
    }

    Ok(storages)
}

/// Flattens the page storages into whole-mesh buffers, rebasing each
/// batch's offsets from page-local to global
pub fn concat_storages(storages: &[PageStorage]) -> MeshClusterStorages {
    let mut combined = MeshClusterStorages::default();

    for storage in storages {
        let vertex_offset = combined.vertices.len() as u32;
        let index_offset = combined.indices.len() as u32;
        let material_offset = combined.materials.len() as u32;

        combined.vertices.extend_from_slice(&storage.vertices);
        combined.indices.extend_from_slice(&storage.indices);
        combined.materials.extend_from_slice(&storage.materials);

        for batch in &storage.batches {
            let mut rebased = *batch;
            rebased.vertex_float_offset += vertex_offset;
            rebased.index_int_offset += index_offset;
            rebased.material_int_offset += material_offset;
            combined.batches.push(rebased);
        }
    }

    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Vec2, Vec3};
    use crate::mesh::MeshVertex;
    use crate::page::pack::build_pages;

    fn quad_cluster() -> (Vec<Cluster>, Vec<ClusterGroup>) {
        let mut cluster = Cluster::default();
        cluster.index = 0;
        cluster.group_index = 0;
        for (x, y) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
            cluster.vertices.push(MeshVertex::new(
                Vec3::new(x, y, 0.0),
                Vec3::Z,
                Vec2::new(x, y),
            ));
        }
        cluster.indices = vec![0, 1, 2, 0, 2, 3];
        cluster.material_indices = vec![0, 0];
        cluster.material_ranges = vec![crate::cluster::MaterialRange {
            start: 0,
            length: 2,
            material_index: 0,
            batch_tri_counts: vec![2],
        }];
        cluster.lod_bound =
            crate::math::Aabb::new(Vec3::ZERO, Vec3::new(1.0, 1.0, 0.0));
        cluster.lod_error = 0.0;

        let mut group = ClusterGroup::default();
        group.index = 0;
        group.clusters = vec![0];
        group.level = 1;
        group.parent_lod_bound = cluster.lod_bound;
        group.max_parent_error = f32::INFINITY;

        (vec![cluster], vec![group])
    }

    #[test]
    fn test_storage_matches_reserved_bytes() {
        let (mut clusters, mut groups) = quad_cluster();
        let (pages, parts) = build_pages(&mut clusters, &mut groups, 1).unwrap();
        let storages = build_page_storages(&clusters, &groups, &parts, &pages).unwrap();

        assert_eq!(storages.len(), 1);
        assert_eq!(storages[0].byte_size(), pages[0].data_byte_size);
    }

    #[test]
    fn test_sections_and_offsets() {
        let (mut clusters, mut groups) = quad_cluster();
        let (pages, parts) = build_pages(&mut clusters, &mut groups, 1).unwrap();
        let storage = &build_page_storages(&clusters, &groups, &parts, &pages).unwrap()[0];

        assert_eq!(storage.vertices.len(), 4 * 8);
        assert_eq!(storage.indices, vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(storage.materials, vec![0, 0, 1]);
        assert_eq!(storage.batches.len(), 1);

        let batch = &storage.batches[0];
        assert_eq!(batch.leaf, 1);
        assert_eq!(batch.triangle_num, 2);
        assert_eq!(batch.batch_num, 1);
        assert_eq!(batch.vertex_float_offset, 0);
        assert!(batch.parent_bound_center_error[3].is_infinite());

        assert_eq!(storage.vertex_byte_offset, 16);
        assert_eq!(storage.index_byte_offset, 16 + 4 * 32);
    }

    #[test]
    fn test_encode_round_trip_header() {
        let (mut clusters, mut groups) = quad_cluster();
        let (pages, parts) = build_pages(&mut clusters, &mut groups, 1).unwrap();
        let storage = &build_page_storages(&clusters, &groups, &parts, &pages).unwrap()[0];

        let bytes = storage.encode();
        assert_eq!(bytes.len() as u32, pages[0].data_byte_size);
        let header: &[u32] = bytemuck::cast_slice(&bytes[0..16]);
        assert_eq!(header[0], storage.vertex_byte_offset);
        assert_eq!(header[3], storage.batch_byte_offset);
    }

    #[test]
    fn test_concat_rebases_offsets() {
        let (mut clusters, mut groups) = quad_cluster();
        let (pages, parts) = build_pages(&mut clusters, &mut groups, 1).unwrap();
        let storages = build_page_storages(&clusters, &groups, &parts, &pages).unwrap();

        let doubled = vec![storages[0].clone(), storages[0].clone()];
        let combined = concat_storages(&doubled);
        assert_eq!(combined.batches.len(), 2);
        assert_eq!(combined.batches[1].vertex_float_offset, 4 * 8);
        assert_eq!(combined.batches[1].index_int_offset, 6);
        assert_eq!(combined.batches[1].material_int_offset, 3);
    }
}
