//! Edge-collapse mesh simplifier with a replayable collapse log
//!
//! Collapses are recorded as explicit index-retarget events so any
//! vertex/triangle count between the input size and the simplification
//! floor can be re-derived by redo/undo without re-simplifying.

use crate::core::Error;
use crate::core::types::{Result, Vec3};
use crate::math::Aabb;
use crate::mesh::MeshVertex;
use crate::simplify::hash::{EdgeHash, FLAG_LOCKED, PosKey, PositionEntry, PositionHash, pos_key};
use crate::simplify::quadric::{AttrQuadric, NUM_ATTRIBUTES};
use glam::DVec3;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

/// Collapses whose root error exceeds this (in world units, after
/// unscaling) are never performed
const MAX_ERROR_ALLOW: f32 = 100.0;

/// What `simplify` counts against its target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimplifyTarget {
    Vertex,
    Triangle,
}

/// One index slot rewrite inside a collapse
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexRetarget {
    pub triangle: u32,
    pub slot: u8,
    pub old_value: u32,
    pub new_value: u32,
}

/// One accepted edge collapse, replayable in either direction
#[derive(Clone, Debug)]
pub struct EdgeCollapse {
    pub retargets: Vec<IndexRetarget>,
    pub prev_triangle_count: u32,
    pub triangle_count: u32,
    pub prev_vertex_count: u32,
    pub vertex_count: u32,
    pub prev_error: f32,
    pub error: f32,
}

/// Output of one `simplify` call
#[derive(Clone, Debug, Default)]
pub struct SimplifiedMesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
    pub material_indices: Vec<u32>,
    pub error: f32,
}

/// Candidate contraction in the heap
#[derive(Clone, Debug)]
struct Contraction {
    key0: PosKey,
    key1: PosKey,
    version0: u32,
    version1: u32,
    cost: f32,
    vertex: MeshVertex,
}

impl PartialEq for Contraction {
    fn eq(&self, other: &Self) -> bool {
        self.cost == other.cost
    }
}

impl Eq for Contraction {}

impl Ord for Contraction {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lowest cost on top of the max-heap
        other.cost.total_cmp(&self.cost)
    }
}

impl PartialOrd for Contraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct MeshSimplifier {
    verts: Vec<MeshVertex>,
    tris: Vec<[u32; 3]>,
    tri_materials: Vec<u32>,
    positions: PositionHash,
    heap: BinaryHeap<Contraction>,
    collapses: Vec<EdgeCollapse>,
    applied: usize,
    min_vertices: u32,
    min_triangles: u32,
    initial_triangles: u32,
    initial_vertices: u32,
    cur_triangles: u32,
    cur_vertices: u32,
    cur_error: f32,
    position_scale: f32,
    attr_weights: [f32; NUM_ATTRIBUTES],
}

impl MeshSimplifier {
    /// Build the simplifier and run the full collapse pass down to the
    /// requested floors, recording the collapse log
    pub fn new(
        vertices: &[MeshVertex],
        indices: &[u32],
        material_indices: &[u32],
        min_vertices: u32,
        min_triangles: u32,
    ) -> Result<Self> {
        if indices.is_empty() || indices.len() % 3 != 0 {
            return Err(Error::InfeasibleConstraint(format!(
                "index count {} is not a non-empty multiple of 3",
                indices.len()
            )));
        }
        let triangle_count = indices.len() / 3;
        if material_indices.len() != triangle_count {
            return Err(Error::InfeasibleConstraint(format!(
                "{} material indices for {} triangles",
                material_indices.len(),
                triangle_count
            )));
        }

        let verts = vertices.to_vec();
        let tris: Vec<[u32; 3]> = indices
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();

        let mut simplifier = Self {
            verts,
            tris,
            tri_materials: material_indices.to_vec(),
            positions: PositionHash::new(),
            heap: BinaryHeap::new(),
            collapses: Vec::new(),
            applied: 0,
            min_vertices,
            min_triangles,
            initial_triangles: 0,
            initial_vertices: 0,
            cur_triangles: 0,
            cur_vertices: 0,
            cur_error: 0.0,
            position_scale: 1.0,
            attr_weights: [1.0; NUM_ATTRIBUTES],
        };

        simplifier.init_hashes()?;
        simplifier.init_weights();
        simplifier.seed_contractions();
        simplifier.run_collapses();
        Ok(simplifier)
    }

    fn key_of(&self, vertex: u32) -> PosKey {
        pos_key(self.verts[vertex as usize].pos)
    }

    fn tri_keys(&self, triangle: u32) -> [PosKey; 3] {
        let t = self.tris[triangle as usize];
        [self.key_of(t[0]), self.key_of(t[1]), self.key_of(t[2])]
    }

    fn tri_is_degenerate(keys: &[PosKey; 3]) -> bool {
        keys[0] == keys[1] || keys[1] == keys[2] || keys[0] == keys[2]
    }

    fn init_hashes(&mut self) -> Result<()> {
        for (i, v) in self.verts.iter().enumerate() {
            self.positions.add_vertex(pos_key(v.pos), i as u32);
        }

        let mut live = 0u32;
        let mut edges: EdgeHash<PosKey> = EdgeHash::new();
        for t in 0..self.tris.len() as u32 {
            let keys = self.tri_keys(t);
            if Self::tri_is_degenerate(&keys) {
                // Degenerate input triangles pin their positions in place
                for key in keys {
                    self.positions.set_flag(key, FLAG_LOCKED);
                }
                continue;
            }
            live += 1;
            for i in 0..3 {
                self.positions.add_adjacency(keys[i], t);
                edges.add_edge(keys[i], keys[(i + 1) % 3], t);
            }
        }

        // An edge walked in only one direction is a boundary or
        // non-manifold edge; both endpoints stay put
        let mut locked = Vec::new();
        for (&(from, to), _) in edges.edges() {
            if !edges.has_connection(to, from) {
                locked.push(from);
                locked.push(to);
            }
        }
        for key in locked {
            self.positions.set_flag(key, FLAG_LOCKED);
        }

        self.initial_triangles = live;
        self.initial_vertices = self.positions.len() as u32;
        self.cur_triangles = live;
        self.cur_vertices = self.initial_vertices;

        if self.min_triangles > self.cur_triangles || self.min_vertices > self.cur_vertices {
            return Err(Error::InfeasibleConstraint(format!(
                "floors ({} vertices, {} triangles) exceed input ({}, {})",
                self.min_vertices, self.min_triangles, self.cur_vertices, self.cur_triangles
            )));
        }
        Ok(())
    }

    fn init_weights(&mut self) {
        let mut total_area = 0.0f64;
        let mut live = 0u32;
        let mut uv_bound_min = glam::Vec2::splat(f32::MAX);
        let mut uv_bound_max = glam::Vec2::splat(f32::MIN);

        for t in 0..self.tris.len() as u32 {
            let keys = self.tri_keys(t);
            if Self::tri_is_degenerate(&keys) {
                continue;
            }
            let [i0, i1, i2] = self.tris[t as usize];
            let p0 = self.verts[i0 as usize].pos.as_dvec3();
            let p1 = self.verts[i1 as usize].pos.as_dvec3();
            let p2 = self.verts[i2 as usize].pos.as_dvec3();
            total_area += 0.5 * (p1 - p0).cross(p2 - p0).length();
            live += 1;
        }
        for v in &self.verts {
            uv_bound_min = uv_bound_min.min(v.uv);
            uv_bound_max = uv_bound_max.max(v.uv);
        }

        // Normalize mean triangle area toward 0.25 with a power-of-two
        // factor so error magnitudes are mesh-scale independent
        if live > 0 && total_area > 0.0 {
            let mean = total_area / live as f64;
            let scale = (0.25 / mean).sqrt();
            self.position_scale = scale.log2().round().exp2() as f32;
        }

        let uv_size = (uv_bound_max - uv_bound_min).max_element().max(1e-6);
        let uv_weight = 1.0 / (128.0 * uv_size);
        self.attr_weights = [1.0, 1.0, 1.0, uv_weight, uv_weight];
    }

    fn scaled(&self, p: Vec3) -> DVec3 {
        (p * self.position_scale).as_dvec3()
    }

    fn weighted_attrs(&self, v: &MeshVertex) -> [f64; NUM_ATTRIBUTES] {
        [
            (v.normal.x * self.attr_weights[0]) as f64,
            (v.normal.y * self.attr_weights[1]) as f64,
            (v.normal.z * self.attr_weights[2]) as f64,
            (v.uv.x * self.attr_weights[3]) as f64,
            (v.uv.y * self.attr_weights[4]) as f64,
        ]
    }

    fn vertex_from_attrs(
        &self,
        pos: Vec3,
        attrs: &[f64; NUM_ATTRIBUTES],
        fallback_normal: Vec3,
    ) -> MeshVertex {
        let normal = Vec3::new(
            attrs[0] as f32 / self.attr_weights[0],
            attrs[1] as f32 / self.attr_weights[1],
            attrs[2] as f32 / self.attr_weights[2],
        );
        let normal = normal.try_normalize().unwrap_or(fallback_normal);
        let uv = glam::Vec2::new(
            attrs[3] as f32 / self.attr_weights[3],
            attrs[4] as f32 / self.attr_weights[4],
        );
        MeshVertex { pos, normal, uv }
    }

    fn quadric_for(&self, triangles: impl IntoIterator<Item = u32>) -> AttrQuadric {
        let mut q = AttrQuadric::new();
        for t in triangles {
            let [i0, i1, i2] = self.tris[t as usize];
            let v0 = &self.verts[i0 as usize];
            let v1 = &self.verts[i1 as usize];
            let v2 = &self.verts[i2 as usize];
            q.add_triangle(
                self.scaled(v0.pos),
                self.scaled(v1.pos),
                self.scaled(v2.pos),
                &[
                    self.weighted_attrs(v0),
                    self.weighted_attrs(v1),
                    self.weighted_attrs(v2),
                ],
            );
        }
        q
    }

    /// Representative vertex for a position entry, deterministic
    fn representative(&self, entry: &PositionEntry) -> Option<MeshVertex> {
        let index = entry.vertices.iter().min()?;
        Some(self.verts[*index as usize])
    }

    fn compute_contraction(&self, key0: PosKey, key1: PosKey) -> Option<Contraction> {
        let e0 = self.positions.get(&key0)?;
        let e1 = self.positions.get(&key1)?;
        if e0.is_locked() && e1.is_locked() {
            return None;
        }

        let rep0 = self.representative(e0)?;
        let rep1 = self.representative(e1)?;

        let union: HashSet<u32> = e0.adjacency.union(&e1.adjacency).copied().collect();
        if union.is_empty() {
            return None;
        }
        let q = self.quadric_for(union.iter().copied());

        let uv_min = rep0.uv.min(rep1.uv);
        let uv_max = rep0.uv.max(rep1.uv);

        let vertex = if e0.is_locked() || e1.is_locked() {
            // The locked endpoint survives verbatim
            if e0.is_locked() { rep0 } else { rep1 }
        } else if let Some(opt) = q.optimal_volume().or_else(|| q.optimal()) {
            let pos = (opt / self.position_scale as f64).as_vec3();
            let attrs = q.attributes_at(opt);
            let mut v = self.vertex_from_attrs(pos, &attrs, rep0.normal);
            v.uv = v.uv.clamp(uv_min, uv_max);
            v
        } else {
            // Singular system: pick the best of the two endpoints and
            // the segment midpoint
            let mid = MeshVertex {
                pos: (rep0.pos + rep1.pos) * 0.5,
                normal: (rep0.normal + rep1.normal)
                    .try_normalize()
                    .unwrap_or(rep0.normal),
                uv: (rep0.uv + rep1.uv) * 0.5,
            };
            let mut best = rep0;
            let mut best_err = q.error(self.scaled(rep0.pos));
            for candidate in [rep1, mid] {
                let err = q.error(self.scaled(candidate.pos));
                if err < best_err {
                    best_err = err;
                    best = candidate;
                }
            }
            best
        };

        let cost = q.error(self.scaled(vertex.pos)) as f32;
        Some(Contraction {
            key0,
            key1,
            version0: e0.version,
            version1: e1.version,
            cost,
            vertex,
        })
    }

    fn seed_contractions(&mut self) {
        let mut pairs: HashSet<(PosKey, PosKey)> = HashSet::new();
        for t in 0..self.tris.len() as u32 {
            let keys = self.tri_keys(t);
            if Self::tri_is_degenerate(&keys) {
                continue;
            }
            for i in 0..3 {
                let (a, b) = (keys[i], keys[(i + 1) % 3]);
                let pair = if a < b { (a, b) } else { (b, a) };
                pairs.insert(pair);
            }
        }
        for (a, b) in pairs {
            if let Some(c) = self.compute_contraction(a, b) {
                self.heap.push(c);
            }
        }
    }

    fn adjacency_bound(&self, triangles: &HashSet<u32>) -> Aabb {
        let mut bound = Aabb::empty();
        for &t in triangles {
            for corner in self.tris[t as usize] {
                bound.expand(self.verts[corner as usize].pos);
            }
        }
        bound
    }

    fn collapse_is_safe(
        &self,
        c: &Contraction,
        adj0: &HashSet<u32>,
        adj1: &HashSet<u32>,
        shared: &HashSet<u32>,
    ) -> bool {
        let union: HashSet<u32> = adj0.union(adj1).copied().collect();

        // Degenerate long-range collapse guard
        let bound = self.adjacency_bound(&union);
        let offset = c.vertex.pos - bound.center();
        if offset.length_squared() > 4.0 * bound.size().length_squared() {
            return false;
        }

        // Link condition: positions adjacent to both endpoints must be
        // corners of a triangle shared by the endpoints
        let corner_keys = |tris: &HashSet<u32>| -> HashSet<PosKey> {
            let mut keys = HashSet::new();
            for &t in tris {
                for key in self.tri_keys(t) {
                    if key != c.key0 && key != c.key1 {
                        keys.insert(key);
                    }
                }
            }
            keys
        };
        let ring0 = corner_keys(adj0);
        let ring1 = corner_keys(adj1);
        let allowed = corner_keys(shared);
        for key in ring0.intersection(&ring1) {
            if !allowed.contains(key) {
                return false;
            }
        }

        // Triangle inversion check on every surviving triangle
        let new_pos = c.vertex.pos;
        for &t in union.difference(shared) {
            let corners = self.tris[t as usize];
            let mut before = [Vec3::ZERO; 3];
            let mut after = [Vec3::ZERO; 3];
            for (i, &corner) in corners.iter().enumerate() {
                let p = self.verts[corner as usize].pos;
                before[i] = p;
                let key = pos_key(p);
                after[i] = if key == c.key0 || key == c.key1 {
                    new_pos
                } else {
                    p
                };
            }
            let n_before = (before[1] - before[0]).cross(before[2] - before[0]);
            let n_after = (after[1] - after[0]).cross(after[2] - after[0]);
            if n_before.length_squared() > 0.0 && n_before.dot(n_after) <= 0.0 {
                return false;
            }
        }
        true
    }

    fn run_collapses(&mut self) {
        while let Some(c) = self.heap.pop() {
            if self.cur_vertices <= self.min_vertices
                || self.cur_triangles <= self.min_triangles
            {
                break;
            }

            // Version check rejects stale heap entries cheaply
            let (adj0, adj1, locked0, locked1) = {
                let Some(e0) = self.positions.get(&c.key0) else {
                    continue;
                };
                let Some(e1) = self.positions.get(&c.key1) else {
                    continue;
                };
                if e0.version != c.version0 || e1.version != c.version1 {
                    continue;
                }
                if e0.is_locked() && e1.is_locked() {
                    continue;
                }
                (
                    e0.adjacency.clone(),
                    e1.adjacency.clone(),
                    e0.is_locked(),
                    e1.is_locked(),
                )
            };
            debug_assert!(!(locked0 && locked1));

            let world_error = c.cost.max(0.0).sqrt() / self.position_scale;
            if world_error > MAX_ERROR_ALLOW {
                continue;
            }

            let shared: HashSet<u32> = adj0.intersection(&adj1).copied().collect();
            if self.cur_triangles - (shared.len() as u32) < self.min_triangles {
                continue;
            }

            if !self.collapse_is_safe(&c, &adj0, &adj1, &shared) {
                continue;
            }

            self.apply_collapse(c, &adj0, &adj1, &shared, world_error);
        }
    }

    fn apply_collapse(
        &mut self,
        c: Contraction,
        adj0: &HashSet<u32>,
        adj1: &HashSet<u32>,
        shared: &HashSet<u32>,
        world_error: f32,
    ) {
        let new_index = self.verts.len() as u32;
        let new_key = pos_key(c.vertex.pos);

        // Snapshot shared triangles' third-corner keys before retargeting
        let mut shared_corner_keys: Vec<(u32, PosKey)> = Vec::new();
        for &t in shared {
            for key in self.tri_keys(t) {
                if key != c.key0 && key != c.key1 {
                    shared_corner_keys.push((t, key));
                }
            }
        }

        self.verts.push(c.vertex);

        let union: HashSet<u32> = adj0.union(adj1).copied().collect();
        let mut affected: Vec<u32> = union.iter().copied().collect();
        affected.sort_unstable();

        let mut retargets = Vec::new();
        for t in affected {
            for slot in 0..3 {
                let old = self.tris[t as usize][slot];
                let key = pos_key(self.verts[old as usize].pos);
                if key == c.key0 || key == c.key1 {
                    retargets.push(IndexRetarget {
                        triangle: t,
                        slot: slot as u8,
                        old_value: old,
                        new_value: new_index,
                    });
                    self.tris[t as usize][slot] = new_index;
                }
            }
        }

        // Merge the two position entries (plus any pre-existing entry at
        // the merged position) into one fresh-versioned entry
        let removed0 = self.positions.remove(&c.key0);
        let removed1 = self.positions.remove(&c.key1);
        let base = self.positions.remove(&new_key);

        let mut entry = PositionEntry::default();
        entry.vertices.insert(new_index);
        for t in union.difference(shared) {
            entry.adjacency.insert(*t);
        }
        let mut version = 0;
        for merged in [&removed0, &removed1, &base].into_iter().flatten() {
            version = version.max(merged.version);
            entry.flag |= merged.flag;
        }
        if let Some(b) = &base {
            entry.vertices.extend(b.vertices.iter().copied());
            entry.adjacency.extend(b.adjacency.iter().copied());
        }
        entry.version = version + 1;
        self.positions.insert(new_key, entry);

        // Shared triangles are now degenerate; detach them from their
        // third corners and invalidate those corners' heap entries
        for (t, key) in shared_corner_keys {
            self.positions.remove_adjacency(&key, t);
            if let Some(e) = self.positions.get_mut(&key) {
                e.version += 1;
            }
        }

        let prev_triangles = self.cur_triangles;
        let prev_vertices = self.cur_vertices;
        let prev_error = self.cur_error;

        self.cur_triangles -= shared.len() as u32;
        self.cur_vertices = self.positions.len() as u32;
        self.cur_error = self.cur_error.max(world_error);

        self.collapses.push(EdgeCollapse {
            retargets,
            prev_triangle_count: prev_triangles,
            triangle_count: self.cur_triangles,
            prev_vertex_count: prev_vertices,
            vertex_count: self.cur_vertices,
            prev_error,
            error: self.cur_error,
        });
        self.applied = self.collapses.len();

        // Rebuild candidates around the merged position
        let adjacency: Vec<u32> = match self.positions.get(&new_key) {
            Some(e) => e.adjacency.iter().copied().collect(),
            None => Vec::new(),
        };
        let mut pushed: HashSet<PosKey> = HashSet::new();
        for t in adjacency {
            for key in self.tri_keys(t) {
                if key != new_key && pushed.insert(key) {
                    if let Some(contraction) = self.compute_contraction(new_key, key) {
                        self.heap.push(contraction);
                    }
                }
            }
        }
    }

    fn state_counts(&self, n: usize) -> (u32, u32, f32) {
        if n == 0 {
            (self.initial_triangles, self.initial_vertices, 0.0)
        } else {
            let c = &self.collapses[n - 1];
            (c.triangle_count, c.vertex_count, c.error)
        }
    }

    /// Replay the collapse log forward/backward to `n` applied collapses
    fn seek(&mut self, n: usize) {
        while self.applied > n {
            self.applied -= 1;
            let record = &self.collapses[self.applied];
            for r in record.retargets.iter().rev() {
                debug_assert_eq!(self.tris[r.triangle as usize][r.slot as usize], r.new_value);
                self.tris[r.triangle as usize][r.slot as usize] = r.old_value;
            }
        }
        while self.applied < n {
            let record = &self.collapses[self.applied];
            for r in &record.retargets {
                debug_assert_eq!(self.tris[r.triangle as usize][r.slot as usize], r.old_value);
                self.tris[r.triangle as usize][r.slot as usize] = r.new_value;
            }
            self.applied += 1;
        }
        let (tris, verts, error) = self.state_counts(n);
        self.cur_triangles = tris;
        self.cur_vertices = verts;
        self.cur_error = error;
    }

    /// Resample the mesh at the requested vertex or triangle count
    ///
    /// Returns `None` when the count is below what the collapse log can
    /// reach (the floor is best effort). Re-querying the same count
    /// yields identical output.
    pub fn simplify(&mut self, target: SimplifyTarget, count: u32) -> Option<SimplifiedMesh> {
        let metric = |counts: (u32, u32, f32)| match target {
            SimplifyTarget::Triangle => counts.0,
            SimplifyTarget::Vertex => counts.1,
        };

        let desired = (0..=self.collapses.len())
            .find(|&n| metric(self.state_counts(n)) <= count)?;
        self.seek(desired);
        Some(self.extract())
    }

    fn extract(&self) -> SimplifiedMesh {
        let mut out = SimplifiedMesh {
            error: self.cur_error,
            ..Default::default()
        };
        let mut remap: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();
        for t in 0..self.tris.len() as u32 {
            let keys = self.tri_keys(t);
            if Self::tri_is_degenerate(&keys) {
                continue;
            }
            for corner in self.tris[t as usize] {
                let next = out.vertices.len() as u32;
                let index = *remap.entry(corner).or_insert_with(|| {
                    out.vertices.push(self.verts[corner as usize]);
                    next
                });
                out.indices.push(index);
            }
            out.material_indices.push(self.tri_materials[t as usize]);
        }
        out
    }

    /// Triangle count of the unsimplified input (live triangles)
    pub fn max_triangles(&self) -> u32 {
        self.initial_triangles
    }

    /// Triangle count at the bottom of the collapse log
    pub fn min_reachable_triangles(&self) -> u32 {
        self.state_counts(self.collapses.len()).0
    }

    /// Number of recorded collapses
    pub fn collapse_count(&self) -> usize {
        self.collapses.len()
    }
}
