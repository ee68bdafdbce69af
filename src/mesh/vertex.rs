//! Processor-side mesh vertex and conversion helpers

use crate::core::types::{Result, Vec2, Vec3};
use crate::core::Error;
use std::collections::HashMap;

/// Vertex attribute set carried through simplification and clustering
///
/// Position, normal and UV interleave to 8 floats, matching the page
/// vertex encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeshVertex {
    pub pos: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

impl MeshVertex {
    pub fn new(pos: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self { pos, normal, uv }
    }

    /// Bit-exact content key; identity for vertex deduplication
    pub fn content_key(&self) -> [u32; 8] {
        [
            self.pos.x.to_bits(),
            self.pos.y.to_bits(),
            self.pos.z.to_bits(),
            self.normal.x.to_bits(),
            self.normal.y.to_bits(),
            self.normal.z.to_bits(),
            self.uv.x.to_bits(),
            self.uv.y.to_bits(),
        ]
    }
}

/// Deduplicate bit-identical vertices and remap indices
///
/// Import paths produce duplicated vertices at attribute seams that are
/// byte-identical; collapsing them first keeps the position hash and the
/// adjacency graphs small.
pub fn convert_for_processor(
    vertices: &[MeshVertex],
    indices: &[u32],
) -> Result<(Vec<MeshVertex>, Vec<u32>)> {
    if indices.is_empty() || indices.len() % 3 != 0 {
        return Err(Error::InfeasibleConstraint(format!(
            "index count {} is not a non-empty multiple of 3",
            indices.len()
        )));
    }

    let mut unique: Vec<MeshVertex> = Vec::with_capacity(vertices.len());
    let mut remap: HashMap<[u32; 8], u32> = HashMap::with_capacity(vertices.len());
    let mut out_indices = Vec::with_capacity(indices.len());

    for &index in indices {
        let vertex = vertices.get(index as usize).ok_or_else(|| {
            Error::InfeasibleConstraint(format!("index {} out of bounds", index))
        })?;
        let new_index = *remap.entry(vertex.content_key()).or_insert_with(|| {
            unique.push(*vertex);
            (unique.len() - 1) as u32
        });
        out_indices.push(new_index);
    }

    Ok((unique, out_indices))
}

/// Flatten processor vertices back into per-corner form
///
/// Inverse of [`convert_for_processor`] up to vertex duplication: every
/// triangle corner gets its own vertex, in index order.
pub fn convert_from_processor(
    vertices: &[MeshVertex],
    indices: &[u32],
) -> (Vec<MeshVertex>, Vec<u32>) {
    let mut out_vertices = Vec::with_capacity(indices.len());
    let mut out_indices = Vec::with_capacity(indices.len());
    for &index in indices {
        out_indices.push(out_vertices.len() as u32);
        out_vertices.push(vertices[index as usize]);
    }
    (out_vertices, out_indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad() -> (Vec<MeshVertex>, Vec<u32>) {
        let v = |x: f32, y: f32| {
            MeshVertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(x, y))
        };
        // Second triangle repeats two corners as distinct array entries
        let vertices = vec![
            v(0.0, 0.0),
            v(1.0, 0.0),
            v(0.0, 1.0),
            v(1.0, 0.0),
            v(0.0, 1.0),
            v(1.0, 1.0),
        ];
        let indices = vec![0, 1, 2, 3, 5, 4];
        (vertices, indices)
    }

    #[test]
    fn test_dedup() {
        let (vertices, indices) = quad();
        let (unique, remapped) = convert_for_processor(&vertices, &indices).unwrap();
        assert_eq!(unique.len(), 4);
        assert_eq!(remapped, vec![0, 1, 2, 1, 3, 2]);
    }

    #[test]
    fn test_round_trip_positions() {
        let (vertices, indices) = quad();
        let (unique, remapped) = convert_for_processor(&vertices, &indices).unwrap();
        let (flat_vertices, flat_indices) = convert_from_processor(&unique, &remapped);

        assert_eq!(flat_indices.len(), indices.len());
        for (corner, &index) in indices.iter().enumerate() {
            assert_eq!(flat_vertices[corner].pos, vertices[index as usize].pos);
        }
    }

    #[test]
    fn test_rejects_bad_indices() {
        let (vertices, _) = quad();
        assert!(convert_for_processor(&vertices, &[0, 1]).is_err());
        assert!(convert_for_processor(&vertices, &[0, 1, 99]).is_err());
        assert!(convert_for_processor(&vertices, &[]).is_err());
    }
}
