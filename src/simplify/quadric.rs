//! Attribute-aware quadric error metric and the small linear solvers behind it

use glam::DVec3;

/// Attribute channels carried through simplification: normal xyz, uv
pub const NUM_ATTRIBUTES: usize = 5;

/// Pivot threshold for the 4x4 gradient/constraint solves
const PIVOT_EPS: f64 = 1e-12;
/// Pivot threshold for the unconstrained 3x3 position solve
const SOLVE_EPS: f64 = 1e-3;
const REFINE_ITERATIONS: usize = 4;
const REFINE_TOLERANCE: f64 = 1e-4;

/// Doolittle LU factorization with partial pivoting, in place
fn lup_factorize<const N: usize>(a: &mut [[f64; N]; N], pivot: &mut [usize; N], eps: f64) -> bool {
    for (i, p) in pivot.iter_mut().enumerate() {
        *p = i;
    }
    for col in 0..N {
        let mut max_val = 0.0;
        let mut max_row = col;
        for row in col..N {
            let v = a[row][col].abs();
            if v > max_val {
                max_val = v;
                max_row = row;
            }
        }
        if max_val < eps {
            return false;
        }
        if max_row != col {
            a.swap(col, max_row);
            pivot.swap(col, max_row);
        }
        for row in col + 1..N {
            a[row][col] /= a[col][col];
            for k in col + 1..N {
                a[row][k] -= a[row][col] * a[col][k];
            }
        }
    }
    true
}

fn lup_substitute<const N: usize>(lu: &[[f64; N]; N], pivot: &[usize; N], b: &[f64; N]) -> [f64; N] {
    let mut x = [0.0; N];
    for i in 0..N {
        x[i] = b[pivot[i]];
        for k in 0..i {
            x[i] -= lu[i][k] * x[k];
        }
    }
    for i in (0..N).rev() {
        for k in i + 1..N {
            x[i] -= lu[i][k] * x[k];
        }
        x[i] /= lu[i][i];
    }
    x
}

/// Solve `a * x = b`, then run a few Newton refinement passes on the residual
pub fn lup_solve_iterate<const N: usize>(
    a: &[[f64; N]; N],
    b: &[f64; N],
    eps: f64,
) -> Option<[f64; N]> {
    let mut lu = *a;
    let mut pivot = [0usize; N];
    if !lup_factorize(&mut lu, &mut pivot, eps) {
        return None;
    }
    let mut x = lup_substitute(&lu, &pivot, b);
    for _ in 0..REFINE_ITERATIONS {
        let mut residual = [0.0; N];
        let mut mse = 0.0;
        for i in 0..N {
            let mut s = 0.0;
            for k in 0..N {
                s += a[i][k] * x[k];
            }
            residual[i] = b[i] - s;
            mse += residual[i] * residual[i];
        }
        if mse / (N as f64) < REFINE_TOLERANCE {
            break;
        }
        let dx = lup_substitute(&lu, &pivot, &residual);
        for i in 0..N {
            x[i] += dx[i];
        }
    }
    Some(x)
}

/// Quadric over position plus linearly varying attributes
///
/// Accumulates, per triangle, the area-weighted planar quadric and one
/// gradient plane per attribute channel. Attribute values must be
/// pre-scaled by their channel weight before accumulation; optimal
/// attributes come back in the same scaled space.
#[derive(Clone, Copy, Debug)]
pub struct AttrQuadric {
    /// n*n^T plus the per-channel g*g^T terms, symmetric
    a: [[f64; 3]; 3],
    b: DVec3,
    c: f64,
    /// Accumulated per-channel gradients and offsets
    gk: [DVec3; NUM_ATTRIBUTES],
    dk: [f64; NUM_ATTRIBUTES],
    /// Total area weight
    w: f64,
    /// Volume-preservation constraint accumulators
    vol_n: DVec3,
    vol_d: f64,
}

impl Default for AttrQuadric {
    fn default() -> Self {
        Self {
            a: [[0.0; 3]; 3],
            b: DVec3::ZERO,
            c: 0.0,
            gk: [DVec3::ZERO; NUM_ATTRIBUTES],
            dk: [0.0; NUM_ATTRIBUTES],
            w: 0.0,
            vol_n: DVec3::ZERO,
            vol_d: 0.0,
        }
    }
}

fn add_outer(a: &mut [[f64; 3]; 3], v: DVec3, scale: f64) {
    let v = [v.x, v.y, v.z];
    for i in 0..3 {
        for j in 0..3 {
            a[i][j] += scale * v[i] * v[j];
        }
    }
}

fn mat_mul(a: &[[f64; 3]; 3], v: DVec3) -> DVec3 {
    DVec3::new(
        a[0][0] * v.x + a[0][1] * v.y + a[0][2] * v.z,
        a[1][0] * v.x + a[1][1] * v.y + a[1][2] * v.z,
        a[2][0] * v.x + a[2][1] * v.y + a[2][2] * v.z,
    )
}

impl AttrQuadric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one triangle
    ///
    /// `attrs[corner][channel]` holds the weighted attribute values at
    /// each corner. Degenerate triangles contribute nothing.
    pub fn add_triangle(
        &mut self,
        p0: DVec3,
        p1: DVec3,
        p2: DVec3,
        attrs: &[[f64; NUM_ATTRIBUTES]; 3],
    ) {
        let raw_normal = (p1 - p0).cross(p2 - p0);
        let len = raw_normal.length();
        if len < 1e-30 {
            return;
        }
        let area = 0.5 * len;
        let n = raw_normal / len;
        let d = -n.dot(p0);

        add_outer(&mut self.a, n, area);
        self.b += area * d * n;
        self.c += area * d * d;

        self.vol_n += area * n;
        self.vol_d += area * d;
        self.w += area;

        // Per-channel gradient plane: value(v) = g . v + off over the
        // triangle plane, pinned by the three corners
        let system = [
            [p0.x, p0.y, p0.z, 1.0],
            [p1.x, p1.y, p1.z, 1.0],
            [p2.x, p2.y, p2.z, 1.0],
            [n.x, n.y, n.z, 0.0],
        ];
        for k in 0..NUM_ATTRIBUTES {
            let rhs = [attrs[0][k], attrs[1][k], attrs[2][k], 0.0];
            let (g, off) = match lup_solve_iterate(&system, &rhs, PIVOT_EPS) {
                Some(x) => (DVec3::new(x[0], x[1], x[2]), x[3]),
                None => (DVec3::ZERO, (rhs[0] + rhs[1] + rhs[2]) / 3.0),
            };

            add_outer(&mut self.a, g, area);
            self.b += area * off * g;
            self.c += area * off * off;
            self.gk[k] += area * g;
            self.dk[k] += area * off;
        }
    }

    pub fn add(&mut self, other: &AttrQuadric) {
        for i in 0..3 {
            for j in 0..3 {
                self.a[i][j] += other.a[i][j];
            }
        }
        self.b += other.b;
        self.c += other.c;
        for k in 0..NUM_ATTRIBUTES {
            self.gk[k] += other.gk[k];
            self.dk[k] += other.dk[k];
        }
        self.w += other.w;
        self.vol_n += other.vol_n;
        self.vol_d += other.vol_d;
    }

    pub fn weight(&self) -> f64 {
        self.w
    }

    /// Schur complement of the attribute block: the reduced system whose
    /// solution is the optimal position with attributes left free
    fn reduced(&self) -> ([[f64; 3]; 3], DVec3) {
        let mut m = self.a;
        let mut r = self.b;
        if self.w > 0.0 {
            let inv_w = 1.0 / self.w;
            for k in 0..NUM_ATTRIBUTES {
                add_outer(&mut m, self.gk[k], -inv_w);
                r -= inv_w * self.dk[k] * self.gk[k];
            }
        }
        (m, r)
    }

    /// Optimal position under the volume-preservation constraint
    pub fn optimal_volume(&self) -> Option<DVec3> {
        if self.w <= 0.0 {
            return None;
        }
        let (m, r) = self.reduced();
        let system = [
            [m[0][0], m[0][1], m[0][2], self.vol_n.x],
            [m[1][0], m[1][1], m[1][2], self.vol_n.y],
            [m[2][0], m[2][1], m[2][2], self.vol_n.z],
            [self.vol_n.x, self.vol_n.y, self.vol_n.z, 0.0],
        ];
        let rhs = [-r.x, -r.y, -r.z, -self.vol_d];
        let x = lup_solve_iterate(&system, &rhs, PIVOT_EPS)?;
        let v = DVec3::new(x[0], x[1], x[2]);
        v.is_finite().then_some(v)
    }

    /// Unconstrained optimal position
    pub fn optimal(&self) -> Option<DVec3> {
        if self.w <= 0.0 {
            return None;
        }
        let (m, r) = self.reduced();
        let rhs = [-r.x, -r.y, -r.z];
        let x = lup_solve_iterate(&m, &rhs, SOLVE_EPS)?;
        let v = DVec3::new(x[0], x[1], x[2]);
        v.is_finite().then_some(v)
    }

    /// Error at `pos` with every attribute channel at its optimum
    pub fn error(&self, pos: DVec3) -> f64 {
        let mut e = mat_mul(&self.a, pos).dot(pos) + 2.0 * self.b.dot(pos) + self.c;
        if self.w > 0.0 {
            let inv_w = 1.0 / self.w;
            for k in 0..NUM_ATTRIBUTES {
                let s = self.gk[k].dot(pos) + self.dk[k];
                e -= inv_w * s * s;
            }
        }
        e.max(0.0)
    }

    /// Optimal weighted attribute values at `pos`
    pub fn attributes_at(&self, pos: DVec3) -> [f64; NUM_ATTRIBUTES] {
        let mut out = [0.0; NUM_ATTRIBUTES];
        if self.w > 0.0 {
            let inv_w = 1.0 / self.w;
            for k in 0..NUM_ATTRIBUTES {
                out[k] = inv_w * (self.gk[k].dot(pos) + self.dk[k]);
            }
        }
        out
    }
}
