//! Position and edge hash tables used by simplification and clustering

use crate::core::types::Vec3;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Quantized position key; bit-exact, no epsilon welding
pub type PosKey = [u32; 3];

/// Build the hash key for a position
pub fn pos_key(p: Vec3) -> PosKey {
    [p.x.to_bits(), p.y.to_bits(), p.z.to_bits()]
}

pub const FLAG_FREE: u32 = 0;
pub const FLAG_LOCKED: u32 = 1;

/// All vertex indices sharing one quantized position
#[derive(Clone, Debug, Default)]
pub struct PositionEntry {
    /// Vertex indices at this position
    pub vertices: HashSet<u32>,
    /// Adjacent triangle indices
    pub adjacency: HashSet<u32>,
    /// FLAG_FREE / FLAG_LOCKED
    pub flag: u32,
    /// Incremented whenever the entry is invalidated; stale heap
    /// candidates compare against it instead of being removed eagerly
    pub version: u32,
}

impl PositionEntry {
    pub fn is_locked(&self) -> bool {
        self.flag & FLAG_LOCKED != 0
    }
}

/// Position-keyed vertex/adjacency table
#[derive(Clone, Debug, Default)]
pub struct PositionHash {
    entries: HashMap<PosKey, PositionEntry>,
}

impl PositionHash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &PosKey) -> Option<&PositionEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &PosKey) -> Option<&mut PositionEntry> {
        self.entries.get_mut(key)
    }

    pub fn add_vertex(&mut self, key: PosKey, vertex: u32) {
        self.entries.entry(key).or_default().vertices.insert(vertex);
    }

    pub fn add_adjacency(&mut self, key: PosKey, triangle: u32) {
        self.entries.entry(key).or_default().adjacency.insert(triangle);
    }

    pub fn remove_adjacency(&mut self, key: &PosKey, triangle: u32) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.adjacency.remove(&triangle);
        }
    }

    /// OR a flag into the entry, creating it if missing
    pub fn set_flag(&mut self, key: PosKey, flag: u32) {
        self.entries.entry(key).or_default().flag |= flag;
    }

    pub fn is_locked(&self, key: &PosKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.is_locked())
    }

    pub fn version(&self, key: &PosKey) -> Option<u32> {
        self.entries.get(key).map(|e| e.version)
    }

    /// Remove an entry entirely, returning it
    pub fn remove(&mut self, key: &PosKey) -> Option<PositionEntry> {
        self.entries.remove(key)
    }

    pub fn insert(&mut self, key: PosKey, entry: PositionEntry) {
        self.entries.insert(key, entry);
    }

    pub fn keys(&self) -> impl Iterator<Item = &PosKey> {
        self.entries.keys()
    }
}

/// Directed edge hash: (from, to) -> set of triangle indices
///
/// Generic over the endpoint key so it serves both the simplifier
/// (position keys) and the cluster adjacency builders (vertex ids).
#[derive(Clone, Debug)]
pub struct EdgeHash<K: Hash + Eq + Copy> {
    edges: HashMap<(K, K), HashSet<u32>>,
}

impl<K: Hash + Eq + Copy> Default for EdgeHash<K> {
    fn default() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }
}

impl<K: Hash + Eq + Copy> EdgeHash<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, from: K, to: K, triangle: u32) {
        self.edges.entry((from, to)).or_default().insert(triangle);
    }

    pub fn remove_edge(&mut self, from: K, to: K, triangle: u32) {
        if let Some(tris) = self.edges.get_mut(&(from, to)) {
            tris.remove(&triangle);
            if tris.is_empty() {
                self.edges.remove(&(from, to));
            }
        }
    }

    pub fn has_connection(&self, from: K, to: K) -> bool {
        self.edges.contains_key(&(from, to))
    }

    pub fn for_each_tri(&self, from: K, to: K, mut f: impl FnMut(u32)) {
        if let Some(tris) = self.edges.get(&(from, to)) {
            for &tri in tris {
                f(tri);
            }
        }
    }

    pub fn edges(&self) -> impl Iterator<Item = (&(K, K), &HashSet<u32>)> {
        self.edges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_entry_lifecycle() {
        let mut hash = PositionHash::new();
        let key = pos_key(Vec3::new(1.0, 2.0, 3.0));

        hash.add_vertex(key, 0);
        hash.add_vertex(key, 5);
        hash.add_adjacency(key, 2);

        let entry = hash.get(&key).unwrap();
        assert_eq!(entry.vertices.len(), 2);
        assert!(entry.adjacency.contains(&2));
        assert!(!entry.is_locked());

        hash.set_flag(key, FLAG_LOCKED);
        assert!(hash.is_locked(&key));

        hash.remove_adjacency(&key, 2);
        assert!(hash.get(&key).unwrap().adjacency.is_empty());

        assert!(hash.remove(&key).is_some());
        assert!(hash.get(&key).is_none());
    }

    #[test]
    fn test_edge_hash_directed() {
        let mut hash: EdgeHash<u32> = EdgeHash::new();
        hash.add_edge(0, 1, 7);

        assert!(hash.has_connection(0, 1));
        assert!(!hash.has_connection(1, 0));

        let mut seen = Vec::new();
        hash.for_each_tri(0, 1, |t| seen.push(t));
        assert_eq!(seen, vec![7]);

        hash.remove_edge(0, 1, 7);
        assert!(!hash.has_connection(0, 1));
    }

    #[test]
    fn test_distinct_positions_distinct_keys() {
        let a = pos_key(Vec3::new(0.0, 0.0, 0.0));
        let b = pos_key(Vec3::new(0.0, 0.0, 1e-30));
        assert_ne!(a, b);
        assert_eq!(a, pos_key(Vec3::ZERO));
    }
}
