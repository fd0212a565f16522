//! Per-block assembly scratch.
//!
//! One workset exists per element block and is shared by all of that block's
//! cells: reset at the start of each cell's contribution, written by the
//! physics modules, and read back by the assembler when extracting the local
//! residual and Jacobian. Basis tables carry the integration weights
//! pre-multiplied; the unweighted copies are used to interpolate solutions.

use crate::ad::{cst, Ad, SeedWhat};
use crate::discretization::{self, BlockDisc};
use crate::dofs::SideTag;
use crate::fields::{Field2, Field3, Field4};

#[derive(Debug)]
pub struct Workset {
    pub block: usize,
    pub dim: usize,
    pub capacity: usize,
    /// Elements active in the current batch.
    pub num_elems: usize,
    pub nqp: usize,
    pub nqp_side: usize,
    pub ndof: usize,

    pub time: f64,
    pub deltat: f64,
    pub alpha: f64,
    pub beta: f64,
    pub is_transient: bool,
    pub is_adjoint: bool,
    pub is_final_time: bool,
    pub seed: SeedWhat,
    pub seed_width: usize,
    pub num_active_params: usize,

    pub varlist: Vec<String>,
    pub usebasis: Vec<usize>,
    pub offsets: Vec<Vec<usize>>,

    pub param_varlist: Vec<String>,
    pub param_usebasis: Vec<usize>,
    pub param_offsets: Vec<Vec<usize>>,
    pub param_ndof: usize,

    // Volume integration tables for the current batch.
    pub ip: Field3<f64>,
    pub wts: Field2<f64>,
    pub h: Vec<f64>,
    pub basis: Vec<Field3<f64>>,
    pub basis_uw: Vec<Field3<f64>>,
    pub basis_grad: Vec<Field4<f64>>,
    pub basis_grad_uw: Vec<Field4<f64>>,

    // Side integration tables for the current side.
    pub current_side: usize,
    pub current_sideset: String,
    pub ip_side: Field3<f64>,
    pub wts_side: Field2<f64>,
    pub normals: Field3<f64>,
    pub basis_side: Vec<Field3<f64>>,
    pub basis_side_uw: Vec<Field3<f64>>,
    pub basis_grad_side: Vec<Field4<f64>>,
    pub basis_grad_side_uw: Vec<Field4<f64>>,

    // Gathered AD solution fields.
    pub local_soln: Field3<Ad>,
    pub local_soln_dot: Field3<Ad>,
    pub local_soln_grad: Field4<Ad>,
    pub local_soln_side: Field3<Ad>,
    pub local_soln_grad_side: Field4<Ad>,
    pub local_param: Field3<Ad>,
    pub local_param_grad: Field4<Ad>,
    pub local_param_side: Field3<Ad>,
    /// Mortar trace on the current side, one entry per (element, var, qp).
    pub local_aux_side: Field3<Ad>,

    /// Side tags of the current batch, (element, var, side).
    pub sideinfo: Field3<SideTag>,

    /// AD residual accumulator, (element, local dof).
    pub res: Field2<Ad>,
    /// Outward numerical flux on the current side, (element, var, qp).
    pub flux: Field3<Ad>,
}

impl Workset {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block: usize,
        capacity: usize,
        disc: &BlockDisc,
        varlist: Vec<String>,
        usebasis: Vec<usize>,
        offsets: Vec<Vec<usize>>,
        param_varlist: Vec<String>,
        param_usebasis: Vec<usize>,
        param_offsets: Vec<Vec<usize>>,
        num_sides: usize,
    ) -> Self {
        let dim = disc.dim;
        let nqp = disc.nqp;
        let nqp_side = disc.nqp_side;
        let num_vars = varlist.len();
        let num_pvars = param_varlist.len();
        let ndof: usize = offsets.iter().map(|o| o.len()).sum();
        let param_ndof: usize = param_offsets.iter().map(|o| o.len()).sum();

        let zero = cst(0.0);
        let basis_tables = |nq: usize| -> Vec<Field3<f64>> {
            disc.bases
                .iter()
                .map(|b| Field3::from_elem(capacity, b.nb, nq, 0.0))
                .collect()
        };
        let grad_tables = |nq: usize| -> Vec<Field4<f64>> {
            disc.bases
                .iter()
                .map(|b| Field4::from_elem(capacity, b.nb, nq, dim, 0.0))
                .collect()
        };

        Self {
            block,
            dim,
            capacity,
            num_elems: 0,
            nqp,
            nqp_side,
            ndof,
            time: 0.0,
            deltat: 1.0,
            alpha: 0.0,
            beta: 1.0,
            is_transient: false,
            is_adjoint: false,
            is_final_time: false,
            seed: SeedWhat::None,
            seed_width: 0,
            num_active_params: 0,
            varlist,
            usebasis,
            offsets,
            param_varlist,
            param_usebasis,
            param_offsets,
            param_ndof,
            ip: Field3::from_elem(capacity, nqp, dim, 0.0),
            wts: Field2::from_elem(capacity, nqp, 0.0),
            h: vec![0.0; capacity],
            basis: basis_tables(nqp),
            basis_uw: basis_tables(nqp),
            basis_grad: grad_tables(nqp),
            basis_grad_uw: grad_tables(nqp),
            current_side: 0,
            current_sideset: String::new(),
            ip_side: Field3::from_elem(capacity, nqp_side, dim, 0.0),
            wts_side: Field2::from_elem(capacity, nqp_side, 0.0),
            normals: Field3::from_elem(capacity, nqp_side, dim, 0.0),
            basis_side: basis_tables(nqp_side),
            basis_side_uw: basis_tables(nqp_side),
            basis_grad_side: grad_tables(nqp_side),
            basis_grad_side_uw: grad_tables(nqp_side),
            local_soln: Field3::from_elem(capacity, num_vars, nqp, zero.clone()),
            local_soln_dot: Field3::from_elem(capacity, num_vars, nqp, zero.clone()),
            local_soln_grad: Field4::from_elem(capacity, num_vars, nqp, dim, zero.clone()),
            local_soln_side: Field3::from_elem(capacity, num_vars, nqp_side, zero.clone()),
            local_soln_grad_side: Field4::from_elem(capacity, num_vars, nqp_side, dim, zero.clone()),
            local_param: Field3::from_elem(capacity, num_pvars.max(1), nqp, zero.clone()),
            local_param_grad: Field4::from_elem(capacity, num_pvars.max(1), nqp, dim, zero.clone()),
            local_param_side: Field3::from_elem(capacity, num_pvars.max(1), nqp_side, zero.clone()),
            local_aux_side: Field3::from_elem(capacity, num_vars, nqp_side, zero.clone()),
            sideinfo: Field3::from_elem(capacity, num_vars, num_sides, SideTag::default()),
            res: Field2::from_elem(capacity, ndof.max(param_ndof), zero.clone()),
            flux: Field3::from_elem(capacity, num_vars, nqp_side, zero),
        }
    }

    pub fn reset_residual(&mut self) {
        self.res.fill(cst(0.0));
    }

    pub fn reset_flux(&mut self) {
        self.flux.fill(cst(0.0));
    }

    /// Recomputes the volume integration tables for a batch of elements with
    /// the given corner coordinates, (element, corner, dim).
    pub fn update_volume(&mut self, nodes: &Field3<f64>, num_elems: usize, disc: &BlockDisc) {
        self.num_elems = num_elems;
        let dim = self.dim;
        let ncorner = disc.topo.num_corners();

        for e in 0..num_elems {
            let mut volume = 0.0;
            for k in 0..self.nqp {
                // Geometry map and Jacobian at this quadrature point.
                let mut corners = [0.0; 24];
                for c in 0..ncorner {
                    for d in 0..dim {
                        corners[c * dim + d] = nodes[(e, c, d)];
                    }
                }
                let mut geom_grads = [0.0; 24];
                let mut geom_vals = [0.0; 8];
                for c in 0..ncorner {
                    geom_vals[c] = disc.geom.vol_vals[(c, k)];
                    for d in 0..dim {
                        geom_grads[c * dim + d] = disc.geom.vol_grads[(c, k, d)];
                    }
                }
                let x = discretization::map_point(dim, &corners[..ncorner * dim], &geom_vals[..ncorner]);
                for d in 0..dim {
                    self.ip[(e, k, d)] = x[d];
                }
                let j = discretization::jacobian(dim, &corners[..ncorner * dim], &geom_grads[..ncorner * dim]);
                let detj = discretization::det(dim, &j).abs();
                let w = disc.vol_wts[k] * detj;
                self.wts[(e, k)] = w;
                volume += w;

                for (bi, tables) in disc.bases.iter().enumerate() {
                    for i in 0..tables.nb {
                        let v = tables.vol_vals[(i, k)];
                        self.basis_uw[bi][(e, i, k)] = v;
                        self.basis[bi][(e, i, k)] = v * w;
                        let mut ref_grad = [0.0; 3];
                        for d in 0..dim {
                            ref_grad[d] = tables.vol_grads[(i, k, d)];
                        }
                        let phys = discretization::solve_transposed(dim, &j, &ref_grad);
                        for d in 0..dim {
                            self.basis_grad_uw[bi][(e, i, k, d)] = phys[d];
                            self.basis_grad[bi][(e, i, k, d)] = phys[d] * w;
                        }
                    }
                }
            }
            self.h[e] = volume.powf(1.0 / dim as f64);
        }
    }

    /// Recomputes the side integration tables for one local side.
    pub fn update_side(
        &mut self,
        nodes: &Field3<f64>,
        num_elems: usize,
        disc: &BlockDisc,
        side: usize,
    ) {
        self.num_elems = num_elems;
        self.current_side = side;
        let dim = self.dim;
        let ncorner = disc.topo.num_corners();
        let n_ref = disc.side_ref_normals[side];
        let nqs = disc.side_pts[side].len();

        for e in 0..num_elems {
            let mut corners = [0.0; 24];
            for c in 0..ncorner {
                for d in 0..dim {
                    corners[c * dim + d] = nodes[(e, c, d)];
                }
            }
            for k in 0..nqs {
                let geom = &disc.geom;
                let mut geom_grads = [0.0; 24];
                let mut geom_vals = [0.0; 8];
                for c in 0..ncorner {
                    geom_vals[c] = geom.side_vals[side][(c, k)];
                    for d in 0..dim {
                        geom_grads[c * dim + d] = geom.side_grads[side][(c, k, d)];
                    }
                }
                let x = discretization::map_point(dim, &corners[..ncorner * dim], &geom_vals[..ncorner]);
                for d in 0..dim {
                    self.ip_side[(e, k, d)] = x[d];
                }
                let j = discretization::jacobian(dim, &corners[..ncorner * dim], &geom_grads[..ncorner * dim]);
                let (measure, normal) = discretization::side_measure_normal(dim, &j, &n_ref);
                let w = disc.side_wts[side][k] * measure;
                self.wts_side[(e, k)] = w;
                for d in 0..dim {
                    self.normals[(e, k, d)] = normal[d];
                }

                for (bi, tables) in disc.bases.iter().enumerate() {
                    for i in 0..tables.nb {
                        let v = tables.side_vals[side][(i, k)];
                        self.basis_side_uw[bi][(e, i, k)] = v;
                        self.basis_side[bi][(e, i, k)] = v * w;
                        let mut ref_grad = [0.0; 3];
                        for d in 0..dim {
                            ref_grad[d] = tables.side_grads[side][(i, k, d)];
                        }
                        let phys = discretization::solve_transposed(dim, &j, &ref_grad);
                        for d in 0..dim {
                            self.basis_grad_side_uw[bi][(e, i, k, d)] = phys[d];
                            self.basis_grad_side[bi][(e, i, k, d)] = phys[d] * w;
                        }
                    }
                }
            }
        }
    }

    /// Interpolates gathered local DOF values to the volume quadrature points.
    pub fn compute_vol_solution(&mut self, u: &Field2<Ad>, u_dot: Option<&Field2<Ad>>) {
        for e in 0..self.num_elems {
            for (v, offsets) in self.offsets.iter().enumerate() {
                let bi = self.usebasis[v];
                for k in 0..self.nqp {
                    let mut val = cst(0.0);
                    let mut val_dot = cst(0.0);
                    let mut grad = vec![cst(0.0); self.dim];
                    for (i, &slot) in offsets.iter().enumerate() {
                        let phi = self.basis_uw[bi][(e, i, k)];
                        val += u[(e, slot)].clone() * phi;
                        if let Some(u_dot) = u_dot {
                            val_dot += u_dot[(e, slot)].clone() * phi;
                        }
                        for (d, g) in grad.iter_mut().enumerate() {
                            *g += u[(e, slot)].clone() * self.basis_grad_uw[bi][(e, i, k, d)];
                        }
                    }
                    self.local_soln[(e, v, k)] = val;
                    if u_dot.is_some() {
                        self.local_soln_dot[(e, v, k)] = val_dot;
                    }
                    for (d, g) in grad.into_iter().enumerate() {
                        self.local_soln_grad[(e, v, k, d)] = g;
                    }
                }
            }
        }
    }

    /// Interpolates gathered local DOF values to the current side quadrature.
    pub fn compute_side_solution(&mut self, u: &Field2<Ad>) {
        let nqs = self.nqp_side;
        for e in 0..self.num_elems {
            for (v, offsets) in self.offsets.iter().enumerate() {
                let bi = self.usebasis[v];
                for k in 0..nqs {
                    let mut val = cst(0.0);
                    let mut grad = vec![cst(0.0); self.dim];
                    for (i, &slot) in offsets.iter().enumerate() {
                        let phi = self.basis_side_uw[bi][(e, i, k)];
                        val += u[(e, slot)].clone() * phi;
                        for (d, g) in grad.iter_mut().enumerate() {
                            *g += u[(e, slot)].clone() * self.basis_grad_side_uw[bi][(e, i, k, d)];
                        }
                    }
                    self.local_soln_side[(e, v, k)] = val;
                    for (d, g) in grad.into_iter().enumerate() {
                        self.local_soln_grad_side[(e, v, k, d)] = g;
                    }
                }
            }
        }
    }

    /// Interpolates discretized-parameter DOF values to the volume quadrature.
    pub fn compute_vol_params(&mut self, p: &Field2<Ad>) {
        for e in 0..self.num_elems {
            for (v, offsets) in self.param_offsets.iter().enumerate() {
                let bi = self.param_usebasis[v];
                for k in 0..self.nqp {
                    let mut val = cst(0.0);
                    let mut grad = vec![cst(0.0); self.dim];
                    for (i, &slot) in offsets.iter().enumerate() {
                        let phi = self.basis_uw[bi][(e, i, k)];
                        val += p[(e, slot)].clone() * phi;
                        for (d, g) in grad.iter_mut().enumerate() {
                            *g += p[(e, slot)].clone() * self.basis_grad_uw[bi][(e, i, k, d)];
                        }
                    }
                    self.local_param[(e, v, k)] = val;
                    for (d, g) in grad.into_iter().enumerate() {
                        self.local_param_grad[(e, v, k, d)] = g;
                    }
                }
            }
        }
    }

    /// Interpolates discretized-parameter DOF values to the current side.
    pub fn compute_side_params(&mut self, p: &Field2<Ad>) {
        for e in 0..self.num_elems {
            for (v, offsets) in self.param_offsets.iter().enumerate() {
                let bi = self.param_usebasis[v];
                for k in 0..self.nqp_side {
                    let mut val = cst(0.0);
                    for (i, &slot) in offsets.iter().enumerate() {
                        val += p[(e, slot)].clone() * self.basis_side_uw[bi][(e, i, k)];
                    }
                    self.local_param_side[(e, v, k)] = val;
                }
            }
        }
    }
}
