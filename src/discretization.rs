//! Reference-element discretization: tensor Gauss quadrature, HGRAD Lagrange
//! bases of order 1 and 2 on line/quad/hex topologies, geometry maps, and the
//! degree-of-freedom lattices the DOF manager numbers.
//!
//! Basis evaluators return per-element values and gradients at quadrature
//! points; everything downstream treats them as opaque tables.

use crate::error::AssemblyError;
use crate::fields::{Field2, Field3};
use crate::mesh::{CellTopo, MeshBlock};

/// Gauss-Legendre points and weights on [-1, 1].
pub fn gauss_legendre(n: usize) -> (Vec<f64>, Vec<f64>) {
    match n {
        1 => (vec![0.0], vec![2.0]),
        2 => {
            let p = 1.0 / 3.0f64.sqrt();
            (vec![-p, p], vec![1.0, 1.0])
        }
        3 => {
            let p = (3.0f64 / 5.0).sqrt();
            (vec![-p, 0.0, p], vec![5.0 / 9.0, 8.0 / 9.0, 5.0 / 9.0])
        }
        4 => {
            let a = 0.3399810435848563;
            let b = 0.8611363115940526;
            let wa = 0.6521451548625461;
            let wb = 0.3478548451374538;
            (vec![-b, -a, a, b], vec![wb, wa, wa, wb])
        }
        _ => panic!("unsupported Gauss rule size {n}"),
    }
}

fn shape_1d(order: usize, i: usize, x: f64) -> f64 {
    match (order, i) {
        (1, 0) => 0.5 * (1.0 - x),
        (1, 1) => 0.5 * (1.0 + x),
        (2, 0) => 0.5 * x * (x - 1.0),
        (2, 1) => 1.0 - x * x,
        (2, 2) => 0.5 * x * (x + 1.0),
        _ => panic!("unsupported basis order {order}"),
    }
}

fn dshape_1d(order: usize, i: usize, x: f64) -> f64 {
    match (order, i) {
        (1, 0) => -0.5,
        (1, 1) => 0.5,
        (2, 0) => x - 0.5,
        (2, 1) => -2.0 * x,
        (2, 2) => x + 0.5,
        _ => panic!("unsupported basis order {order}"),
    }
}

/// Tensor-product Lagrange basis on the reference cell [-1, 1]^dim.
#[derive(Debug, Clone, Copy)]
pub struct LagrangeBasis {
    pub topo: CellTopo,
    pub order: usize,
}

impl LagrangeBasis {
    pub fn new(topo: CellTopo, order: usize) -> Self {
        assert!((1..=2).contains(&order));
        Self { topo, order }
    }

    pub fn num_basis(&self) -> usize {
        (self.order + 1).pow(self.topo.dim() as u32)
    }

    fn local_index(&self, i: usize) -> [usize; 3] {
        let n = self.order + 1;
        [i % n, (i / n) % n, i / (n * n)]
    }

    /// Reference coordinates of lattice node `i` (x-fastest ordering).
    pub fn node_ref_coords(&self, i: usize) -> [f64; 3] {
        let idx = self.local_index(i);
        let mut xi = [0.0; 3];
        for axis in 0..self.topo.dim() {
            xi[axis] = -1.0 + 2.0 * idx[axis] as f64 / self.order as f64;
        }
        xi
    }

    pub fn eval(&self, xi: &[f64; 3], values: &mut [f64]) {
        let dim = self.topo.dim();
        for (i, v) in values.iter_mut().enumerate().take(self.num_basis()) {
            let idx = self.local_index(i);
            let mut phi = 1.0;
            for axis in 0..dim {
                phi *= shape_1d(self.order, idx[axis], xi[axis]);
            }
            *v = phi;
        }
    }

    /// Reference-space gradients; `grads[i]` holds the `dim` components.
    pub fn eval_grad(&self, xi: &[f64; 3], grads: &mut [[f64; 3]]) {
        let dim = self.topo.dim();
        for (i, g) in grads.iter_mut().enumerate().take(self.num_basis()) {
            let idx = self.local_index(i);
            for d in 0..dim {
                let mut comp = 1.0;
                for axis in 0..dim {
                    comp *= if axis == d {
                        dshape_1d(self.order, idx[axis], xi[axis])
                    } else {
                        shape_1d(self.order, idx[axis], xi[axis])
                    };
                }
                g[d] = comp;
            }
        }
    }

    /// Local lattice nodes lying on a side (axis = side/2, high = side%2).
    pub fn side_nodes(&self, side: usize) -> Vec<usize> {
        let axis = side / 2;
        let extreme = if side % 2 == 1 { self.order } else { 0 };
        (0..self.num_basis())
            .filter(|&i| self.local_index(i)[axis] == extreme)
            .collect()
    }
}

/// Precomputed reference tables for one basis on one block.
#[derive(Debug, Clone)]
pub struct BasisRefTables {
    pub order: usize,
    pub nb: usize,
    /// (basis, volume qp)
    pub vol_vals: Field2<f64>,
    /// (basis, volume qp, dim), reference gradients
    pub vol_grads: Field3<f64>,
    /// Per side: (basis, side qp)
    pub side_vals: Vec<Field2<f64>>,
    pub side_grads: Vec<Field3<f64>>,
}

fn tabulate(
    basis: &LagrangeBasis,
    vol_pts: &[[f64; 3]],
    side_pts: &[Vec<[f64; 3]>],
) -> BasisRefTables {
    let dim = basis.topo.dim();
    let nb = basis.num_basis();
    let nqp = vol_pts.len();

    let mut vol_vals = Field2::from_elem(nb, nqp, 0.0);
    let mut vol_grads = Field3::from_elem(nb, nqp, dim, 0.0);
    let mut vals = vec![0.0; nb];
    let mut grads = vec![[0.0; 3]; nb];
    for (k, pt) in vol_pts.iter().enumerate() {
        basis.eval(pt, &mut vals);
        basis.eval_grad(pt, &mut grads);
        for i in 0..nb {
            vol_vals[(i, k)] = vals[i];
            for d in 0..dim {
                vol_grads[(i, k, d)] = grads[i][d];
            }
        }
    }

    let mut side_vals = Vec::with_capacity(side_pts.len());
    let mut side_grads = Vec::with_capacity(side_pts.len());
    for pts in side_pts {
        let nqs = pts.len();
        let mut sv = Field2::from_elem(nb, nqs, 0.0);
        let mut sg = Field3::from_elem(nb, nqs, dim, 0.0);
        for (k, pt) in pts.iter().enumerate() {
            basis.eval(pt, &mut vals);
            basis.eval_grad(pt, &mut grads);
            for i in 0..nb {
                sv[(i, k)] = vals[i];
                for d in 0..dim {
                    sg[(i, k, d)] = grads[i][d];
                }
            }
        }
        side_vals.push(sv);
        side_grads.push(sg);
    }

    BasisRefTables {
        order: basis.order,
        nb,
        vol_vals,
        vol_grads,
        side_vals,
        side_grads,
    }
}

/// Reference integration data and basis tables for one element block.
#[derive(Debug, Clone)]
pub struct BlockDisc {
    pub topo: CellTopo,
    pub dim: usize,
    pub nqp: usize,
    pub nqp_side: usize,
    pub vol_pts: Vec<[f64; 3]>,
    pub vol_wts: Vec<f64>,
    /// Side quadrature points expressed in volume reference coordinates.
    pub side_pts: Vec<Vec<[f64; 3]>>,
    pub side_wts: Vec<Vec<f64>>,
    pub side_ref_normals: Vec<[f64; 3]>,
    /// Unique basis orders used on this block; variables index into this list.
    pub bases: Vec<BasisRefTables>,
    /// Order-1 geometry tables (corner multilinear map).
    pub geom: BasisRefTables,
}

impl BlockDisc {
    pub fn new(topo: CellTopo, orders: &[usize]) -> Self {
        let dim = topo.dim();
        let max_order = orders.iter().copied().max().unwrap_or(1);
        let n1 = max_order + 1;
        let (pts_1d, wts_1d) = gauss_legendre(n1);

        // Volume rule: tensor product over dim axes.
        let mut vol_pts = Vec::new();
        let mut vol_wts = Vec::new();
        let count = n1.pow(dim as u32);
        for k in 0..count {
            let mut pt = [0.0; 3];
            let mut w = 1.0;
            let mut rem = k;
            for axis in 0..dim {
                let i = rem % n1;
                rem /= n1;
                pt[axis] = pts_1d[i];
                w *= wts_1d[i];
            }
            vol_pts.push(pt);
            vol_wts.push(w);
        }

        // Side rules: tensor product over the in-plane axes, pinned on `axis`.
        let mut side_pts = Vec::new();
        let mut side_wts = Vec::new();
        let mut side_ref_normals = Vec::new();
        for side in 0..topo.num_sides() {
            let axis = side / 2;
            let high = side % 2 == 1;
            let free: Vec<usize> = (0..dim).filter(|&a| a != axis).collect();
            let count = n1.pow(free.len() as u32);
            let mut pts = Vec::new();
            let mut wts = Vec::new();
            for k in 0..count {
                let mut pt = [0.0; 3];
                pt[axis] = if high { 1.0 } else { -1.0 };
                let mut w = 1.0;
                let mut rem = k;
                for &a in &free {
                    let i = rem % n1;
                    rem /= n1;
                    pt[a] = pts_1d[i];
                    w *= wts_1d[i];
                }
                pts.push(pt);
                wts.push(w);
            }
            let mut normal = [0.0; 3];
            normal[axis] = if high { 1.0 } else { -1.0 };
            side_pts.push(pts);
            side_wts.push(wts);
            side_ref_normals.push(normal);
        }

        let bases = orders
            .iter()
            .map(|&order| tabulate(&LagrangeBasis::new(topo, order), &vol_pts, &side_pts))
            .collect();
        let geom = tabulate(&LagrangeBasis::new(topo, 1), &vol_pts, &side_pts);

        let nqp = vol_pts.len();
        let nqp_side = side_pts.first().map_or(0, |p| p.len());
        Self {
            topo,
            dim,
            nqp,
            nqp_side,
            vol_pts,
            vol_wts,
            side_pts,
            side_wts,
            side_ref_normals,
            bases,
            geom,
        }
    }

    pub fn basis_index(&self, order: usize) -> Option<usize> {
        self.bases.iter().position(|b| b.order == order)
    }
}

/// Reference tables for every block of a mesh.
#[derive(Debug, Clone)]
pub struct Discretization {
    pub blocks: Vec<BlockDisc>,
}

impl Discretization {
    /// `orders_per_block[b]` lists the unique basis orders block `b` uses.
    pub fn new(
        mesh: &crate::mesh::Mesh,
        orders_per_block: &[Vec<usize>],
    ) -> Result<Self, AssemblyError> {
        if !(1..=3).contains(&mesh.dim) {
            return Err(AssemblyError::UnsupportedDimension(mesh.dim));
        }
        let blocks = mesh
            .blocks
            .iter()
            .zip(orders_per_block)
            .map(|(block, orders)| BlockDisc::new(block.topo, orders))
            .collect();
        Ok(Self { blocks })
    }
}

// ---------------------------------------------------------------------------
// Geometry maps
// ---------------------------------------------------------------------------

/// Physical coordinates of a reference point given corner coordinates and the
/// geometry basis values at that point.
pub fn map_point(dim: usize, corners: &[f64], geom_vals: &[f64]) -> [f64; 3] {
    let ncorner = geom_vals.len();
    let mut x = [0.0; 3];
    for c in 0..ncorner {
        for d in 0..dim {
            x[d] += geom_vals[c] * corners[c * dim + d];
        }
    }
    x
}

/// Geometry Jacobian dx/dxi from corner coordinates and the geometry basis
/// reference gradients at one point (corner-major, `dim` per corner).
pub fn jacobian(dim: usize, corners: &[f64], geom_grads: &[f64]) -> [[f64; 3]; 3] {
    let ncorner = geom_grads.len() / dim;
    let mut j = [[0.0; 3]; 3];
    for c in 0..ncorner {
        for r in 0..dim {
            for s in 0..dim {
                j[r][s] += corners[c * dim + r] * geom_grads[c * dim + s];
            }
        }
    }
    j
}

pub fn det(dim: usize, j: &[[f64; 3]; 3]) -> f64 {
    match dim {
        1 => j[0][0],
        2 => j[0][0] * j[1][1] - j[0][1] * j[1][0],
        3 => {
            j[0][0] * (j[1][1] * j[2][2] - j[1][2] * j[2][1])
                - j[0][1] * (j[1][0] * j[2][2] - j[1][2] * j[2][0])
                + j[0][2] * (j[1][0] * j[2][1] - j[1][1] * j[2][0])
        }
        _ => unreachable!(),
    }
}

/// Solves J^T y = rhs, i.e. y = J^{-T} rhs, used to push reference gradients
/// and reference normals into physical space.
pub fn solve_transposed(dim: usize, j: &[[f64; 3]; 3], rhs: &[f64; 3]) -> [f64; 3] {
    let mut y = [0.0; 3];
    match dim {
        1 => {
            y[0] = rhs[0] / j[0][0];
        }
        2 => {
            let d = det(2, j);
            // inverse of J^T assembled explicitly
            y[0] = (j[1][1] * rhs[0] - j[1][0] * rhs[1]) / d;
            y[1] = (-j[0][1] * rhs[0] + j[0][0] * rhs[1]) / d;
        }
        3 => {
            let d = det(3, j);
            let inv = [
                [
                    j[1][1] * j[2][2] - j[1][2] * j[2][1],
                    j[0][2] * j[2][1] - j[0][1] * j[2][2],
                    j[0][1] * j[1][2] - j[0][2] * j[1][1],
                ],
                [
                    j[1][2] * j[2][0] - j[1][0] * j[2][2],
                    j[0][0] * j[2][2] - j[0][2] * j[2][0],
                    j[0][2] * j[1][0] - j[0][0] * j[1][2],
                ],
                [
                    j[1][0] * j[2][1] - j[1][1] * j[2][0],
                    j[0][1] * j[2][0] - j[0][0] * j[2][1],
                    j[0][0] * j[1][1] - j[0][1] * j[1][0],
                ],
            ];
            // inv is adj(J); J^{-T} rhs = adj(J)^T rhs / det
            for r in 0..3 {
                for c in 0..3 {
                    y[r] += inv[c][r] * rhs[c];
                }
                y[r] /= d;
            }
        }
        _ => unreachable!(),
    }
    y
}

/// Outward unit normal and surface measure scale for a side with reference
/// normal `n_ref`: dS = |det J| * |J^{-T} n_ref| d(ref side).
pub fn side_measure_normal(
    dim: usize,
    j: &[[f64; 3]; 3],
    n_ref: &[f64; 3],
) -> (f64, [f64; 3]) {
    let a = solve_transposed(dim, j, n_ref);
    let norm = (0..dim).map(|d| a[d] * a[d]).sum::<f64>().sqrt();
    let mut n = [0.0; 3];
    for d in 0..dim {
        n[d] = a[d] / norm;
    }
    (det(dim, j).abs() * norm, n)
}

// ---------------------------------------------------------------------------
// DOF lattices
// ---------------------------------------------------------------------------

/// Node lattice of one basis order over one structured block: the nodes a
/// variable of that order owns, per-element connectivity, and node positions
/// obtained through the geometry map (so displaced meshes stay consistent).
#[derive(Debug, Clone)]
pub struct DofLattice {
    pub order: usize,
    pub num_nodes: usize,
    pub nodes_per_elem: usize,
    /// Element-major connectivity in x-fastest lattice order.
    pub elem_nodes: Vec<usize>,
    /// Node-major coordinates, `dim` entries per node.
    pub node_coords: Vec<f64>,
}

impl DofLattice {
    pub fn build(block: &MeshBlock, order: usize) -> Self {
        let dim = block.dim();
        let div = block.divisions;
        let basis = LagrangeBasis::new(block.topo, order);
        let nodes_per_elem = basis.num_basis();

        let mut counts = [1usize; 3];
        for axis in 0..dim {
            counts[axis] = order * div[axis] + 1;
        }
        let num_nodes: usize = counts[..dim.max(1)].iter().product();

        let n1 = order + 1;
        let mut elem_nodes = Vec::with_capacity(block.num_elems * nodes_per_elem);
        let mut node_coords = vec![0.0; num_nodes * dim];
        let mut seen = vec![false; num_nodes];

        let mut elem_counts = [1usize; 3];
        elem_counts[..dim].copy_from_slice(&div[..dim]);

        let ncorner = block.topo.num_corners();
        let mut geom_vals = vec![0.0; ncorner];
        let geom_basis = LagrangeBasis::new(block.topo, 1);

        for e in 0..block.num_elems {
            let mut eidx = [0usize; 3];
            let mut rem = e;
            for axis in 0..3 {
                eidx[axis] = rem % elem_counts[axis];
                rem /= elem_counts[axis];
            }
            let corners = block.elem_corner_coords(e);
            for i in 0..nodes_per_elem {
                let mut lidx = [0usize; 3];
                let mut rem = i;
                for axis in 0..3 {
                    lidx[axis] = rem % n1;
                    rem /= n1;
                }
                let mut gidx = [0usize; 3];
                for axis in 0..dim {
                    gidx[axis] = order * eidx[axis] + lidx[axis];
                }
                let node = gidx[0] + counts[0] * (gidx[1] + counts[1] * gidx[2]);
                elem_nodes.push(node);
                if !seen[node] {
                    seen[node] = true;
                    let xi = basis.node_ref_coords(i);
                    geom_basis.eval(&xi, &mut geom_vals);
                    let x = map_point(dim, &corners, &geom_vals);
                    node_coords[node * dim..node * dim + dim].copy_from_slice(&x[..dim]);
                }
            }
        }

        Self {
            order,
            num_nodes,
            nodes_per_elem,
            elem_nodes,
            node_coords,
        }
    }

    pub fn elem_node(&self, elem: usize, i: usize) -> usize {
        self.elem_nodes[elem * self.nodes_per_elem + i]
    }

    pub fn node_coord(&self, node: usize, dim: usize) -> &[f64] {
        &self.node_coords[node * dim..(node + 1) * dim]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshBlock;

    #[test]
    fn gauss_rules_integrate_polynomials() {
        for n in 1..=4 {
            let (pts, wts) = gauss_legendre(n);
            // Exact for x^(2n-1): integral over [-1,1] is zero.
            let odd: f64 = pts
                .iter()
                .zip(&wts)
                .map(|(x, w)| w * x.powi(2 * n as i32 - 1))
                .sum();
            assert!(odd.abs() < 1e-14);
            let total: f64 = wts.iter().sum();
            assert!((total - 2.0).abs() < 1e-14);
        }
    }

    #[test]
    fn quadratic_basis_partition_of_unity() {
        let basis = LagrangeBasis::new(CellTopo::Quad, 2);
        let mut vals = vec![0.0; basis.num_basis()];
        basis.eval(&[0.3, -0.7, 0.0], &mut vals);
        let sum: f64 = vals.iter().sum();
        assert!((sum - 1.0).abs() < 1e-14);
    }

    #[test]
    fn basis_is_nodal() {
        let basis = LagrangeBasis::new(CellTopo::Hex, 2);
        let mut vals = vec![0.0; basis.num_basis()];
        for i in 0..basis.num_basis() {
            basis.eval(&basis.node_ref_coords(i), &mut vals);
            for (j, &v) in vals.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-13);
            }
        }
    }

    #[test]
    fn side_nodes_pick_the_face_lattice() {
        let basis = LagrangeBasis::new(CellTopo::Quad, 2);
        // side 3 is the y-high face: lattice rows with iy == 2.
        assert_eq!(basis.side_nodes(3), vec![6, 7, 8]);
    }

    #[test]
    fn jacobian_of_stretched_quad() {
        // Unit square stretched by (2, 3).
        let corners = [0.0, 0.0, 2.0, 0.0, 0.0, 3.0, 2.0, 3.0];
        let basis = LagrangeBasis::new(CellTopo::Quad, 1);
        let mut grads = vec![[0.0; 3]; 4];
        basis.eval_grad(&[0.2, -0.4, 0.0], &mut grads);
        let flat: Vec<f64> = grads.iter().flat_map(|g| g[..2].to_vec()).collect();
        let j = jacobian(2, &corners, &flat);
        assert!((j[0][0] - 1.0).abs() < 1e-14);
        assert!((j[1][1] - 1.5).abs() < 1e-14);
        assert!((det(2, &j) - 1.5).abs() < 1e-14);
        let (measure, n) = side_measure_normal(2, &j, &[1.0, 0.0, 0.0]);
        assert!((n[0] - 1.0).abs() < 1e-14);
        assert!((measure - 1.5).abs() < 1e-14);
    }

    #[test]
    fn lattice_counts_for_quadratic_grid() {
        let block =
            MeshBlock::structured("b", 2, [2, 2, 1], [0.0; 3], [1.0, 1.0, 1.0]).unwrap();
        let lattice = DofLattice::build(&block, 2);
        assert_eq!(lattice.num_nodes, 25);
        assert_eq!(lattice.nodes_per_elem, 9);
        // Center node of the first element sits at (0.25, 0.25).
        let center = lattice.elem_node(0, 4);
        let c = lattice.node_coord(center, 2);
        assert!((c[0] - 0.25).abs() < 1e-14 && (c[1] - 0.25).abs() < 1e-14);
    }
}
