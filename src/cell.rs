//! Element batches.
//!
//! A `Cell` is a batch of contiguous elements of one block: node coordinates,
//! global ids, the local index table into the ghosted map, gathered solution
//! copies, and the per-batch residual/Jacobian extraction. A `BoundaryCell`
//! is the same but bound to one local side of one side set, carrying the
//! boundary residual. The index table is the inverse of the global-to-local
//! map restricted to overlapping-owned indices.

use crate::ad::{check_capacity, cst, partials, seeded, val, Ad, SeedWhat};
use crate::discretization::BlockDisc;
use crate::dofs::SideTag;
use crate::error::AssemblyError;
use crate::fields::{Field2, Field3};
use crate::functions::{FunctionManager, Location};
use crate::params::ParameterManager;
use crate::physics::Physics;
use crate::settings::{ObjectiveForm, RegularizationKind, ResponseType};
use crate::workset::Workset;

/// The five gather kinds (the mortar trace flows in separately).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherKind {
    Solution,
    SolutionDot,
    Adjoint,
    AdjointDot,
    Param,
}

/// What the assembler wants from one `compute_jac_res` invocation.
#[derive(Debug, Clone, Copy)]
pub struct JacResOptions {
    pub time: f64,
    pub deltat: f64,
    pub alpha: f64,
    pub beta: f64,
    pub is_transient: bool,
    pub is_adjoint: bool,
    pub is_final_time: bool,
    pub build_jacobian: bool,
    /// Seed active scalar parameters and extract dR/dtheta columns.
    pub seed_params: bool,
    /// Seed discretized-parameter DOFs and extract dR/dp.
    pub disc_sens: bool,
    pub num_active_params: usize,
    pub max_derivs: usize,
}

impl JacResOptions {
    pub fn steady_jacobian(max_derivs: usize) -> Self {
        Self {
            time: 0.0,
            deltat: 1.0,
            alpha: 0.0,
            beta: 1.0,
            is_transient: false,
            is_adjoint: false,
            is_final_time: false,
            build_jacobian: true,
            seed_params: false,
            disc_sens: false,
            num_active_params: 0,
            max_derivs,
        }
    }
}

/// Shared extraction buffers, one set per block.
#[derive(Debug)]
pub struct CellBuffers {
    /// (element, dof, column); one column for plain residuals, one per active
    /// parameter in a scalar-sensitivity pass.
    pub local_res: Field3<f64>,
    /// (element, dof i, dof j) = dR_i/du_j.
    pub local_j: Field3<f64>,
    /// Mass block, (element, dof i, dof j) = dR_i/du_dot_j.
    pub local_jdot: Field3<f64>,
    /// (element, dof i, param dof j) = dR_i/dp_j.
    pub local_drdp: Field3<f64>,
}

impl CellBuffers {
    pub fn new(capacity: usize, ndof: usize, res_cols: usize, param_ndof: usize) -> Self {
        Self {
            local_res: Field3::from_elem(capacity, ndof, res_cols.max(1), 0.0),
            local_j: Field3::from_elem(capacity, ndof, ndof, 0.0),
            local_jdot: Field3::from_elem(capacity, ndof, ndof, 0.0),
            local_drdp: Field3::from_elem(capacity, ndof, param_ndof.max(1), 0.0),
        }
    }

    pub fn zero(&mut self) {
        self.local_res.fill(0.0);
        self.local_j.fill(0.0);
        self.local_jdot.fill(0.0);
        self.local_drdp.fill(0.0);
    }
}

/// A sensor located inside one element of a cell, with the basis values of
/// the response variable at the sensor point.
#[derive(Debug, Clone)]
pub struct CellSensor {
    pub elem: usize,
    pub var: usize,
    pub value: f64,
    pub basis: Vec<f64>,
}

/// Objective description handed down to the cell quadrature.
#[derive(Debug, Clone)]
pub struct ObjectiveSpec {
    pub response_type: ResponseType,
    pub form: ObjectiveForm,
}

#[derive(Debug)]
pub struct Cell {
    pub block: usize,
    pub num_elems: usize,
    /// Element indices within the block.
    pub elem_ids: Vec<usize>,
    /// (element, corner, dim) coordinates; exclusively owned by the cell.
    pub nodes: Field3<f64>,
    /// Per-element global dof ids.
    pub gids: Vec<Vec<usize>>,
    /// Per-element local rows in the ghosted map.
    pub index: Vec<Vec<usize>>,
    pub param_gids: Vec<Vec<usize>>,
    pub param_index: Vec<Vec<usize>>,
    /// (element, var, side) tags.
    pub sideinfo: Field3<SideTag>,
    pub local_u: Field2<f64>,
    pub local_u_dot: Field2<f64>,
    pub local_phi: Field2<f64>,
    pub local_phi_dot: Field2<f64>,
    pub local_params: Field2<f64>,
    /// First previous adjoint, loaded in reverse-time stepping.
    pub adj_prev: Field2<f64>,
    pub sensors: Vec<CellSensor>,
    /// Subgrid model id when this batch's elements embed a finer scale.
    pub subgrid_model: Option<usize>,
    /// Per-macro-element usernum handles into the subgrid model.
    pub subgrid_usernums: Vec<usize>,
}

impl Cell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block: usize,
        elem_ids: Vec<usize>,
        nodes: Field3<f64>,
        gids: Vec<Vec<usize>>,
        index: Vec<Vec<usize>>,
        param_gids: Vec<Vec<usize>>,
        param_index: Vec<Vec<usize>>,
        sideinfo: Field3<SideTag>,
        ndof: usize,
        param_ndof: usize,
    ) -> Self {
        let ne = elem_ids.len();
        Self {
            block,
            num_elems: ne,
            elem_ids,
            nodes,
            gids,
            index,
            param_gids,
            param_index,
            sideinfo,
            local_u: Field2::from_elem(ne, ndof, 0.0),
            local_u_dot: Field2::from_elem(ne, ndof, 0.0),
            local_phi: Field2::from_elem(ne, ndof, 0.0),
            local_phi_dot: Field2::from_elem(ne, ndof, 0.0),
            local_params: Field2::from_elem(ne, param_ndof.max(1), 0.0),
            adj_prev: Field2::from_elem(ne, ndof, 0.0),
            sensors: Vec::new(),
            subgrid_model: None,
            subgrid_usernums: Vec::new(),
        }
    }

    /// Verifies the index tables and the AD capacity demanded by this batch.
    pub fn register(&self, ndof: usize, max_derivs: usize, num_active_params: usize) -> Result<(), AssemblyError> {
        for e in 0..self.num_elems {
            if self.gids[e].len() != ndof || self.index[e].len() != ndof {
                return Err(AssemblyError::IndexTableMismatch {
                    local: self.index[e].len(),
                    expected: ndof,
                });
            }
        }
        let param_ndof = self.local_params.ncols();
        check_capacity(ndof.max(num_active_params).max(param_ndof), max_derivs)
    }

    /// Copies entries of a global (ghosted) vector into the matching local
    /// storage through the index table.
    pub fn gather(
        &mut self,
        kind: GatherKind,
        x: &crate::linalg::DistMultiVector,
        col: usize,
    ) {
        let (index, target) = match kind {
            GatherKind::Solution => (&self.index, &mut self.local_u),
            GatherKind::SolutionDot => (&self.index, &mut self.local_u_dot),
            GatherKind::Adjoint => (&self.index, &mut self.local_phi),
            GatherKind::AdjointDot => (&self.index, &mut self.local_phi_dot),
            GatherKind::Param => (&self.param_index, &mut self.local_params),
        };
        for e in 0..self.num_elems {
            for (slot, &lid) in index[e].iter().enumerate() {
                target[(e, slot)] = x.values[(lid, col)];
            }
        }
    }

    /// The gather/scatter round-trip partner: sums local values back into a
    /// ghosted vector.
    pub fn scatter_add(
        &self,
        local: &Field2<f64>,
        x: &mut crate::linalg::DistMultiVector,
        col: usize,
    ) {
        for e in 0..self.num_elems {
            for (slot, &lid) in self.index[e].iter().enumerate() {
                x.values[(lid, col)] += local[(e, slot)];
            }
        }
    }

    fn copy_sideinfo_into(&self, wkset: &mut Workset) {
        let (_, nvars, nsides) = self.sideinfo.dims();
        for e in 0..self.num_elems {
            for v in 0..nvars {
                for s in 0..nsides {
                    wkset.sideinfo[(e, v, s)] = self.sideinfo[(e, v, s)];
                }
            }
        }
    }

    /// Evaluates the residual and requested derivative blocks for this batch.
    ///
    /// Seeding layout per pass: Jacobian seeds local DOFs in [0, ndof);
    /// scalar sensitivities seed active parameters in [0, n_active);
    /// discretized sensitivities seed local parameter DOFs in [0, param_ndof).
    /// The caller must have sacadoized the scalar parameters to match.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_jac_res(
        &self,
        wkset: &mut Workset,
        disc: &BlockDisc,
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        buffers: &mut CellBuffers,
        opts: &JacResOptions,
        multiscale: Option<&mut crate::multiscale::MultiscaleManager>,
    ) -> Result<(), AssemblyError> {
        let ndof = wkset.ndof;
        let param_ndof = wkset.param_ndof;
        let ne = self.num_elems;

        prepare_workset(wkset, opts);
        wkset.update_volume(&self.nodes, ne, disc);
        self.copy_sideinfo_into(wkset);
        buffers.zero();

        let (seed, width) = if opts.disc_sens {
            (SeedWhat::DiscParams, param_ndof)
        } else if opts.seed_params {
            (SeedWhat::ActiveParams, opts.num_active_params)
        } else if opts.build_jacobian {
            (SeedWhat::Solution, ndof)
        } else {
            (SeedWhat::None, 0)
        };
        check_capacity(width, opts.max_derivs)?;
        wkset.seed = seed;
        wkset.seed_width = width;

        // Pass A: residual plus the derivative block selected by the seeding.
        self.residual_pass(wkset, physics, functions, params, seed, width, opts)?;
        let mut multiscale = multiscale;
        if let Some(ms) = multiscale.as_deref_mut() {
            if self.subgrid_model.is_some() {
                ms.subgrid_contribution(self, wkset, physics, functions, params, opts, seed)?;
            }
        }

        for e in 0..ne {
            for i in 0..ndof {
                let r = &wkset.res[(e, i)];
                buffers.local_res[(e, i, 0)] = -val(r);
                match seed {
                    SeedWhat::Solution => {
                        let d = partials(r, width);
                        for j in 0..ndof {
                            buffers.local_j[(e, i, j)] = d[j];
                        }
                    }
                    SeedWhat::ActiveParams => {
                        let d = partials(r, width);
                        for p in 0..width {
                            buffers.local_res[(e, i, p)] = d[p];
                        }
                    }
                    SeedWhat::DiscParams => {
                        let d = partials(r, width);
                        for j in 0..param_ndof {
                            buffers.local_drdp[(e, i, j)] = d[j];
                        }
                    }
                    _ => {}
                }
            }
        }

        // Pass B: separate time-derivative seeding supplies the mass block.
        if opts.is_transient && opts.build_jacobian {
            wkset.seed = SeedWhat::SolutionDot;
            self.residual_pass(
                wkset,
                physics,
                functions,
                params,
                SeedWhat::SolutionDot,
                ndof,
                opts,
            )?;
            for e in 0..ne {
                for i in 0..ndof {
                    let d = partials(&wkset.res[(e, i)], ndof);
                    for j in 0..ndof {
                        buffers.local_jdot[(e, i, j)] = d[j];
                    }
                }
            }
        }

        Ok(())
    }

    /// One seeded residual evaluation: gathers AD locals, interpolates, and
    /// invokes the physics volume terms.
    #[allow(clippy::too_many_arguments)]
    fn residual_pass(
        &self,
        wkset: &mut Workset,
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        seed: SeedWhat,
        width: usize,
        _opts: &JacResOptions,
    ) -> Result<(), AssemblyError> {
        let ne = self.num_elems;
        let ndof = wkset.ndof;

        // The adjoint linearization state is still the forward solution; the
        // adjoint unknown only enters through the transposed solve.
        let u_ad = seed_local(&self.local_u, ne, ndof, matches!(seed, SeedWhat::Solution), width);
        let u_dot_ad = seed_local(
            &self.local_u_dot,
            ne,
            ndof,
            matches!(seed, SeedWhat::SolutionDot),
            width,
        );
        wkset.compute_vol_solution(&u_ad, Some(&u_dot_ad));

        if !wkset.param_varlist.is_empty() {
            let p_ad = seed_local(
                &self.local_params,
                ne,
                self.local_params.ncols(),
                matches!(seed, SeedWhat::DiscParams),
                width,
            );
            wkset.compute_vol_params(&p_ad);
        }

        wkset.reset_residual();
        if self.subgrid_model.is_none() {
            for module in physics {
                module.volume_residual(wkset, functions, params)?;
            }
        }
        Ok(())
    }

    /// Builds the adjoint residual in `buffers.local_res` column 0 from the
    /// extracted blocks: adjPrev - (J + alpha Jdot)^T phi. The objective term
    /// G_u is added afterwards by the assembler when an objective is active.
    pub fn build_adjoint_residual(&self, buffers: &mut CellBuffers, alpha: f64, ndof: usize) {
        for e in 0..self.num_elems {
            for i in 0..ndof {
                let mut jt_phi = 0.0;
                for j in 0..ndof {
                    jt_phi += (buffers.local_j[(e, j, i)] + alpha * buffers.local_jdot[(e, j, i)])
                        * self.local_phi[(e, j)];
                }
                buffers.local_res[(e, i, 0)] = self.adj_prev[(e, i)] - jt_phi;
            }
        }
    }

    /// alpha * Jdot^T phi, stored as the next (earlier-time) step's adjPrev.
    pub fn store_adj_prev(&mut self, buffers: &CellBuffers, alpha: f64, ndof: usize) {
        for e in 0..self.num_elems {
            for i in 0..ndof {
                let mut m_phi = 0.0;
                for j in 0..ndof {
                    m_phi += buffers.local_jdot[(e, j, i)] * self.local_phi[(e, j)];
                }
                self.adj_prev[(e, i)] = alpha * m_phi;
            }
        }
    }

    pub fn reset_adj_prev(&mut self) {
        self.adj_prev.fill(0.0);
    }

    /// Objective quadrature over this batch. Returns per-(element, qp) AD
    /// values carrying whatever seeding the current pass applied; the volume
    /// solution and parameter fields must already be interpolated.
    pub fn compute_objective(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
        spec: &ObjectiveSpec,
    ) -> Result<Field2<Ad>, AssemblyError> {
        let ne = self.num_elems;
        let nqp = wkset.nqp;
        let response = functions.evaluate("response", Location::VolumeIp, self.block, wkset, params)?;
        let target = functions.evaluate("target", Location::VolumeIp, self.block, wkset, params)?;
        let weight = functions.evaluate("weight", Location::VolumeIp, self.block, wkset, params)?;

        let mut obj = Field2::from_elem(ne, nqp, cst(0.0));
        if spec.response_type == ResponseType::Global {
            for e in 0..ne {
                for k in 0..nqp {
                    let w = wkset.wts[(e, k)];
                    obj[(e, k)] = match spec.form {
                        ObjectiveForm::Integral => response[(e, k)].clone() * w,
                        ObjectiveForm::Misfit => {
                            let diff = response[(e, k)].clone() - target[(e, k)].clone();
                            weight[(e, k)].clone() * diff.clone() * diff * w
                        }
                    };
                }
            }
        }
        Ok(obj)
    }

    /// Pointwise sensor misfit contributions, one AD value per sensor, from
    /// seeded local solution values.
    pub fn compute_sensor_objective(&self, u_ad: &Field2<Ad>, offsets: &[Vec<usize>]) -> Vec<Ad> {
        self.sensors
            .iter()
            .map(|s| {
                let mut u_at = cst(0.0);
                for (i, &slot) in offsets[s.var].iter().enumerate() {
                    u_at += u_ad[(s.elem, slot)].clone() * s.basis[i];
                }
                let diff = u_at - cst(s.value);
                diff.clone() * diff
            })
            .collect()
    }

    /// Domain regularization of the discretized parameter fields, one AD
    /// value per element so derivative slots map back to that element's
    /// parameter DOFs. The parameter interpolants must be seeded by the
    /// caller's pass.
    pub fn compute_domain_regularization(
        &self,
        wkset: &Workset,
        terms: &[(usize, RegularizationKind, f64)],
    ) -> Vec<Ad> {
        let eps = 1e-12;
        let mut totals = vec![cst(0.0); self.num_elems];
        for &(field, kind, constant) in terms {
            for (e, total) in totals.iter_mut().enumerate() {
                for k in 0..wkset.nqp {
                    let w = wkset.wts[(e, k)];
                    let p = wkset.local_param[(e, field, k)].clone();
                    let contrib = match kind {
                        RegularizationKind::L2 => p.clone() * p * 0.5,
                        RegularizationKind::L1 => {
                            use crate::ad::DualNum;
                            (p.clone() * p + cst(eps)).sqrt()
                        }
                        RegularizationKind::TotalVariation => {
                            use crate::ad::DualNum;
                            let mut g2 = cst(eps);
                            for d in 0..wkset.dim {
                                let gd = wkset.local_param_grad[(e, field, k, d)].clone();
                                g2 += gd.clone() * gd;
                            }
                            g2.sqrt()
                        }
                    };
                    *total += contrib * (constant * w);
                }
            }
        }
        totals
    }
}

/// A batch of (element, side) pairs of one side set, sharing a local side.
#[derive(Debug)]
pub struct BoundaryCell {
    pub block: usize,
    pub num_elems: usize,
    pub elem_ids: Vec<usize>,
    pub side: usize,
    pub sideset: String,
    pub nodes: Field3<f64>,
    pub gids: Vec<Vec<usize>>,
    pub index: Vec<Vec<usize>>,
    pub param_gids: Vec<Vec<usize>>,
    pub param_index: Vec<Vec<usize>>,
    pub sideinfo: Field3<SideTag>,
    pub local_u: Field2<f64>,
    pub local_u_dot: Field2<f64>,
    pub local_phi: Field2<f64>,
    pub local_phi_dot: Field2<f64>,
    pub local_params: Field2<f64>,
}

impl BoundaryCell {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block: usize,
        elem_ids: Vec<usize>,
        side: usize,
        sideset: String,
        nodes: Field3<f64>,
        gids: Vec<Vec<usize>>,
        index: Vec<Vec<usize>>,
        param_gids: Vec<Vec<usize>>,
        param_index: Vec<Vec<usize>>,
        sideinfo: Field3<SideTag>,
        ndof: usize,
        param_ndof: usize,
    ) -> Self {
        let ne = elem_ids.len();
        Self {
            block,
            num_elems: ne,
            elem_ids,
            side,
            sideset,
            nodes,
            gids,
            index,
            param_gids,
            param_index,
            sideinfo,
            local_u: Field2::from_elem(ne, ndof, 0.0),
            local_u_dot: Field2::from_elem(ne, ndof, 0.0),
            local_phi: Field2::from_elem(ne, ndof, 0.0),
            local_phi_dot: Field2::from_elem(ne, ndof, 0.0),
            local_params: Field2::from_elem(ne, param_ndof.max(1), 0.0),
        }
    }

    pub fn gather(
        &mut self,
        kind: GatherKind,
        x: &crate::linalg::DistMultiVector,
        col: usize,
    ) {
        let (index, target) = match kind {
            GatherKind::Solution => (&self.index, &mut self.local_u),
            GatherKind::SolutionDot => (&self.index, &mut self.local_u_dot),
            GatherKind::Adjoint => (&self.index, &mut self.local_phi),
            GatherKind::AdjointDot => (&self.index, &mut self.local_phi_dot),
            GatherKind::Param => (&self.param_index, &mut self.local_params),
        };
        for e in 0..self.num_elems {
            for (slot, &lid) in index[e].iter().enumerate() {
                target[(e, slot)] = x.values[(lid, col)];
            }
        }
    }

    /// Boundary residual and derivative blocks for this batch's side.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_jac_res(
        &self,
        wkset: &mut Workset,
        disc: &BlockDisc,
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        buffers: &mut CellBuffers,
        opts: &JacResOptions,
    ) -> Result<(), AssemblyError> {
        let ndof = wkset.ndof;
        let param_ndof = wkset.param_ndof;
        let ne = self.num_elems;

        prepare_workset(wkset, opts);
        // Volume update first: the Nitsche penalty needs the element size h.
        wkset.update_volume(&self.nodes, ne, disc);
        wkset.update_side(&self.nodes, ne, disc, self.side);
        wkset.current_sideset = self.sideset.clone();
        let (_, nvars, nsides) = self.sideinfo.dims();
        for e in 0..ne {
            for v in 0..nvars {
                for s in 0..nsides {
                    wkset.sideinfo[(e, v, s)] = self.sideinfo[(e, v, s)];
                }
            }
        }
        buffers.zero();

        let (seed, width) = if opts.disc_sens {
            (SeedWhat::DiscParams, param_ndof)
        } else if opts.seed_params {
            (SeedWhat::ActiveParams, opts.num_active_params)
        } else if opts.build_jacobian {
            (SeedWhat::Solution, ndof)
        } else {
            (SeedWhat::None, 0)
        };
        check_capacity(width, opts.max_derivs)?;
        wkset.seed = seed;
        wkset.seed_width = width;

        let u_ad = seed_local(&self.local_u, ne, ndof, matches!(seed, SeedWhat::Solution), width);
        wkset.compute_side_solution(&u_ad);
        if !wkset.param_varlist.is_empty() {
            let p_ad = seed_local(
                &self.local_params,
                ne,
                self.local_params.ncols(),
                matches!(seed, SeedWhat::DiscParams),
                width,
            );
            wkset.compute_side_params(&p_ad);
        }

        wkset.reset_residual();
        for module in physics {
            module.boundary_residual(wkset, functions, params)?;
        }

        for e in 0..ne {
            for i in 0..ndof {
                let r = &wkset.res[(e, i)];
                buffers.local_res[(e, i, 0)] = -val(r);
                match seed {
                    SeedWhat::Solution => {
                        let d = partials(r, width);
                        for j in 0..ndof {
                            buffers.local_j[(e, i, j)] = d[j];
                        }
                    }
                    SeedWhat::ActiveParams => {
                        let d = partials(r, width);
                        for p in 0..width {
                            buffers.local_res[(e, i, p)] = d[p];
                        }
                    }
                    SeedWhat::DiscParams => {
                        let d = partials(r, width);
                        for j in 0..param_ndof {
                            buffers.local_drdp[(e, i, j)] = d[j];
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Transposed-phi residual for the adjoint solve; boundary terms carry no
    /// mass block.
    pub fn build_adjoint_residual(&self, buffers: &mut CellBuffers, ndof: usize) {
        for e in 0..self.num_elems {
            for i in 0..ndof {
                let mut jt_phi = 0.0;
                for j in 0..ndof {
                    jt_phi += buffers.local_j[(e, j, i)] * self.local_phi[(e, j)];
                }
                buffers.local_res[(e, i, 0)] = -jt_phi;
            }
        }
    }

    /// Boundary-localized regularization over this side set, one AD value per
    /// element of the batch.
    pub fn compute_boundary_regularization(
        &self,
        wkset: &Workset,
        terms: &[(usize, RegularizationKind, f64)],
    ) -> Vec<Ad> {
        let eps = 1e-12;
        let mut totals = vec![cst(0.0); self.num_elems];
        for &(field, kind, constant) in terms {
            for (e, total) in totals.iter_mut().enumerate() {
                for k in 0..wkset.nqp_side {
                    let w = wkset.wts_side[(e, k)];
                    let p = wkset.local_param_side[(e, field, k)].clone();
                    let contrib = match kind {
                        RegularizationKind::L2 => p.clone() * p * 0.5,
                        RegularizationKind::L1 => {
                            use crate::ad::DualNum;
                            (p.clone() * p + cst(eps)).sqrt()
                        }
                        // Side-tangential variation is not tracked; fall back
                        // to the L2 form on the trace.
                        RegularizationKind::TotalVariation => p.clone() * p * 0.5,
                    };
                    *total += contrib * (constant * w);
                }
            }
        }
        totals
    }
}

fn prepare_workset(wkset: &mut Workset, opts: &JacResOptions) {
    wkset.time = opts.time;
    wkset.deltat = opts.deltat;
    wkset.alpha = opts.alpha;
    wkset.beta = opts.beta;
    wkset.is_transient = opts.is_transient;
    wkset.is_adjoint = opts.is_adjoint;
    wkset.is_final_time = opts.is_final_time;
    wkset.num_active_params = opts.num_active_params;
}

/// Lifts a plain local-dof field into AD values, seeding slot `j` of each
/// element row when requested.
pub fn seed_local(
    values: &Field2<f64>,
    ne: usize,
    ncols: usize,
    seed: bool,
    width: usize,
) -> Field2<Ad> {
    let mut out = Field2::from_elem(ne, ncols, cst(0.0));
    for e in 0..ne {
        for j in 0..ncols {
            out[(e, j)] = if seed {
                seeded(width, j, values[(e, j)])
            } else {
                cst(values[(e, j)])
            };
        }
    }
    out
}
