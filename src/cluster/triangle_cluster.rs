//! Partition a triangle mesh into edge-connected clusters

use crate::cluster::Cluster;
use crate::core::Error;
use crate::core::types::Result;
use crate::partition::{GraphBuilder, GraphPartitioner, Partitioner};
use crate::simplify::EdgeHash;
use crate::mesh::MeshVertex;

/// Splits a mesh into clusters of bounded triangle count along the
/// triangle adjacency graph
pub struct TriangleClusterBuilder<'a> {
    partitioner: &'a dyn GraphPartitioner,
    min_triangles: u32,
    max_triangles: u32,
}

impl<'a> TriangleClusterBuilder<'a> {
    pub fn new(
        partitioner: &'a dyn GraphPartitioner,
        min_triangles: u32,
        max_triangles: u32,
    ) -> Self {
        Self {
            partitioner,
            min_triangles,
            max_triangles,
        }
    }

    pub fn build(
        &self,
        vertices: &[MeshVertex],
        indices: &[u32],
        material_indices: &[u32],
    ) -> Result<Vec<Cluster>> {
        if indices.is_empty() || indices.len() % 3 != 0 || vertices.is_empty() {
            return Err(Error::Build(format!(
                "cannot cluster {} indices over {} vertices",
                indices.len(),
                vertices.len()
            )));
        }

        let num_triangles = indices.len() as u32 / 3;
        let mut triangles: Vec<[u32; 3]> = Vec::with_capacity(num_triangles as usize);
        let mut edge_hash: EdgeHash<u32> = EdgeHash::new();

        for (tri_index, tri) in indices.chunks_exact(3).enumerate() {
            let corners = [tri[0], tri[1], tri[2]];
            for &corner in &corners {
                if corner as usize >= vertices.len() {
                    return Err(Error::Build(format!("index {} out of bounds", corner)));
                }
            }
            triangles.push(corners);
            for i in 0..3 {
                edge_hash.add_edge(corners[i], corners[(i + 1) % 3], tri_index as u32);
            }
        }

        // Two triangles are adjacent when one walks an edge the other
        // walks in reverse
        let mut builder = GraphBuilder::new(num_triangles);
        for (tri_index, corners) in triangles.iter().enumerate() {
            for i in 0..3 {
                let (v0, v1) = (corners[i], corners[(i + 1) % 3]);
                edge_hash.for_each_tri(v1, v0, |adjacent| {
                    if adjacent != tri_index as u32 {
                        builder.add_edge_cost(tri_index as u32, adjacent, 1);
                    }
                });
            }
        }
        let graph = builder.build();

        let partition = Partitioner::new(self.partitioner).partition_strict(
            &graph,
            self.min_triangles,
            self.max_triangles,
        )?;

        let clusters = partition
            .ranges
            .iter()
            .map(|&range| {
                Cluster::from_triangle_range(
                    vertices,
                    &triangles,
                    &partition.indices,
                    material_indices,
                    range,
                )
            })
            .collect();
        Ok(clusters)
    }
}
