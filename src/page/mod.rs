//! Page layout: packing, fixups and GPU storage encoding
//!
//! Pages are the streaming unit. Clusters pack group-major into pages
//! of bounded byte size; fixups record the cross-page patches the
//! streaming manager applies when residency changes.

pub mod fixup;
pub mod pack;
pub mod storage;

pub use fixup::{ClusterFixup, HierarchyFixup, PageFixups, build_fixups, build_page_dependencies};
pub use pack::{Page, build_pages, cluster_byte_size};
pub use storage::{
    ClusterBatch, MeshClusterStorages, PageStorage, build_page_storages, concat_storages,
};

/// Parts per page
pub const MAX_PARTS_PER_PAGE: u32 = 1 << 10;
/// Clusters per page
pub const MAX_CLUSTERS_PER_PAGE: u32 = 1 << 15;
/// Byte capacity of a root page
pub const ROOT_PAGE_CAPACITY: u32 = 10 * 1024;
/// Byte capacity of a streaming page
pub const STREAMING_PAGE_CAPACITY: u32 = 10 * 1024;

/// Four u32 section offsets lead every encoded page
pub const PAGE_HEADER_BYTES: u32 = 16;

pub const FLOATS_PER_VERTEX: u32 = 8;
pub const BYTES_PER_VERTEX: u32 = 4 * FLOATS_PER_VERTEX;
pub const BYTES_PER_INDEX: u32 = 4;
pub const INTS_PER_MATERIAL_BATCH: u32 = 3;
pub const BYTES_PER_MATERIAL_BATCH: u32 = 4 * INTS_PER_MATERIAL_BATCH;
pub const BYTES_PER_CLUSTER_BATCH: u32 = std::mem::size_of::<ClusterBatch>() as u32;
