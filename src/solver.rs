//! The forward/adjoint/sensitivity solver driver: time stepping, the damped
//! Newton loop, the linear-solve cascade, and gradient assembly.

use log::{debug, info, warn};
use nalgebra::DVector;
use nalgebra_sparse::CsrMatrix;

use crate::assembly::AssemblyManager;
use crate::cell::{JacResOptions, ObjectiveSpec};
use crate::discretization::Discretization;
use crate::dofs::DofManager;
use crate::error::{LinearSolveError, NonlinearNonConvergence, SimError};
use crate::functions::{FunctionManager, Location};
use crate::linalg::{
    build_pattern, matrix::csr_from_pattern, matrix::csr_mul_vec, solve::csr_to_dense,
    solve::IdentityPreconditioner, dense_lu_solve, DistMultiVector, GhostedMatrix, GmresSolver,
    IluPreconditioner, JacobiPreconditioner,
};
use crate::mesh::Mesh;
use crate::multiscale::MultiscaleManager;
use crate::params::{scalar_lookup, ParameterManager};
use crate::physics::{create_physics, Physics};
use crate::postprocess::{self, ObjectiveValue};
use crate::settings::{
    ParameterUsage, PreconditionerKind, ResponseType, Settings, SolverKind,
};

/// Per-block time-indexed solution storage. The adjoint track stores values
/// in reverse time order; trajectories are append-only during a simulation
/// and random-access during adjoint/sensitivity traversal.
#[derive(Debug, Default)]
pub struct SolutionStorage {
    pub times: Vec<f64>,
    pub vectors: Vec<DistMultiVector>,
}

impl SolutionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, v: DistMultiVector, time: f64) {
        self.times.push(time);
        self.vectors.push(v);
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn last(&self) -> Option<&DistMultiVector> {
        self.vectors.last()
    }
}

pub struct Solver {
    pub settings: Settings,
    pub mesh: Mesh,
    pub assembler: AssemblyManager,
    pub functions: FunctionManager,
    pub params: ParameterManager,
    pub multiscale: Option<MultiscaleManager>,
    pub batch_id: usize,

    is_transient: bool,
    use_adjoint: bool,
    current_time: f64,
    is_final_time: bool,
    solvetimes: Vec<f64>,

    /// Owned Jacobian template carrying the assembled sparsity graph.
    j_template: CsrMatrix<f64>,
    /// Rectangular dR/dp template (param rows, solution columns).
    param_template: Option<CsrMatrix<f64>>,
}

impl Solver {
    pub fn new(settings: Settings) -> Result<Self, SimError> {
        settings.validate()?;
        let mesh = Mesh::from_settings(&settings.mesh)?;
        let dim = mesh.dim;
        let mut functions = FunctionManager::new();
        let mut params = ParameterManager::from_settings(&settings)?;

        // Physics modules declare variables; the union per block feeds the
        // DOF manager.
        let mut physics: Vec<Vec<Physics>> = Vec::new();
        let mut vars_per_block: Vec<Vec<(String, usize)>> = Vec::new();
        for b in 0..mesh.blocks.len() {
            let mut block_modules = Vec::new();
            let mut block_vars: Vec<(String, usize)> = Vec::new();
            for name in &settings.physics.modules {
                let module = create_physics(name, &settings, dim, b, &mut functions)?;
                for (var, order) in module.variables() {
                    if !block_vars.iter().any(|(v, _)| v == &var) {
                        block_vars.push((var, order));
                    }
                }
                block_modules.push(module);
            }
            physics.push(block_modules);
            vars_per_block.push(block_vars);
        }

        // Unique basis orders per block cover both solution variables and
        // discretized parameter fields.
        let mut orders_per_block: Vec<Vec<usize>> = Vec::new();
        for block_vars in &vars_per_block {
            let mut orders: Vec<usize> = block_vars.iter().map(|(_, o)| *o).collect();
            for d in &params.discretized {
                orders.push(d.order);
            }
            orders.sort_unstable();
            orders.dedup();
            orders_per_block.push(orders);
        }
        let disc = Discretization::new(&mesh, &orders_per_block)?;

        let resolve_basis = |b: usize, order: usize| -> usize {
            disc.blocks[b]
                .basis_index(order)
                .expect("order registered during discretization build")
        };
        let vars_with_basis: Vec<Vec<(String, usize, usize)>> = vars_per_block
            .iter()
            .enumerate()
            .map(|(b, vars)| {
                vars.iter()
                    .map(|(name, order)| (name.clone(), *order, resolve_basis(b, *order)))
                    .collect()
            })
            .collect();
        let dofs = DofManager::build(&mesh, &vars_with_basis, Some(&settings.physics))?;

        for (b, block_modules) in physics.iter_mut().enumerate() {
            let varlist: Vec<String> =
                dofs.blocks[b].vars.iter().map(|v| v.name.clone()).collect();
            for module in block_modules {
                module.set_vars(&varlist)?;
            }
        }

        // Discretized parameter numbering.
        if !params.discretized.is_empty() {
            let pvars: Vec<Vec<(String, usize, usize)>> = (0..mesh.blocks.len())
                .map(|b| {
                    params
                        .discretized
                        .iter()
                        .map(|d| (d.name.clone(), d.order, resolve_basis(b, d.order)))
                        .collect()
                })
                .collect();
            let pdofs = DofManager::build(&mesh, &pvars, None)?;
            params.init_discretized(pdofs);
        }

        // Weak Dirichlet boundary values become side-located coefficient
        // functions named after the variable and side set.
        for bc in &settings.physics.dirichlet {
            if bc.method == crate::settings::BcMethod::Weak {
                for b in 0..mesh.blocks.len() {
                    if mesh.blocks[b].has_side_set(&bc.side_set) {
                        functions.add_function(
                            &format!("dirichlet {} {}", bc.variable, bc.side_set),
                            &bc.expression,
                            Location::SideIp,
                            b,
                        )?;
                    }
                }
            }
        }

        // Objective response functions.
        if settings.postprocess.compute_objective {
            for b in 0..mesh.blocks.len() {
                functions.add_function(
                    "response",
                    &settings.postprocess.response,
                    Location::VolumeIp,
                    b,
                )?;
                functions.add_function(
                    "target",
                    &settings.postprocess.target,
                    Location::VolumeIp,
                    b,
                )?;
                functions.add_function(
                    "weight",
                    &settings.postprocess.weight,
                    Location::VolumeIp,
                    b,
                )?;
            }
        }

        let varlists: Vec<Vec<String>> = dofs
            .blocks
            .iter()
            .map(|b| b.vars.iter().map(|v| v.name.clone()).collect())
            .collect();
        functions.decompose(&varlists, &params)?;

        let mut assembler =
            AssemblyManager::new(&settings, &mesh, disc, dofs, physics, &params)?;
        if settings.postprocess.compute_objective {
            assembler.objective = Some(ObjectiveSpec {
                response_type: settings.postprocess.response_type,
                form: settings.postprocess.objective_form,
            });
        }
        if settings.postprocess.response_type == ResponseType::Pointwise {
            assembler.attach_sensors(
                &mesh,
                &settings.postprocess.sensors,
                &settings.postprocess.response,
                settings.mesh.workset_size.max(1),
            )?;
        }

        // Owned sparsity graphs, constructed once and reused per step.
        let j_pattern = build_pattern(
            &assembler.dofs.owned,
            &assembler.dofs.owned,
            assembler
                .cells
                .iter()
                .flatten()
                .flat_map(|c| c.gids.iter().map(|g| (g.as_slice(), g.as_slice()))),
        );
        let j_template = csr_from_pattern(j_pattern);

        let param_template = params.dofs.as_ref().map(|pdofs| {
            let pattern = build_pattern(
                &pdofs.owned,
                &assembler.dofs.owned,
                assembler.cells.iter().flatten().flat_map(|c| {
                    c.param_gids
                        .iter()
                        .zip(&c.gids)
                        .map(|(pg, g)| (pg.as_slice(), g.as_slice()))
                }),
            );
            csr_from_pattern(pattern)
        });

        let multiscale = if settings.multiscale.enabled {
            Some(MultiscaleManager::build(
                &settings,
                &mesh,
                &mut assembler,
            )?)
        } else {
            None
        };

        let is_transient = settings.solver.solver == SolverKind::Transient;
        Ok(Self {
            settings,
            mesh,
            assembler,
            functions,
            params,
            multiscale,
            batch_id: 0,
            is_transient,
            use_adjoint: false,
            current_time: 0.0,
            is_final_time: false,
            solvetimes: Vec::new(),
            j_template,
            param_template,
        })
    }

    // ------------------------------------------------------------------
    // Forward and adjoint models
    // ------------------------------------------------------------------

    /// Runs the forward problem; returns the trajectory and, when requested,
    /// the objective with its explicit parameter derivative.
    pub fn forward_model(&mut self) -> Result<(SolutionStorage, Option<ObjectiveValue>), SimError> {
        self.use_adjoint = false;
        self.params.sacadoize_params(false);
        self.solvetimes.clear();

        let initial = self.set_initial()?;
        let mut f_soln = SolutionStorage::new();
        let mut objective = None;

        if !self.is_transient {
            let mut u = initial;
            let mut u_dot = self.blank_state();
            let mut phi = self.blank_state();
            let mut phi_dot = self.blank_state();
            self.current_time = 0.0;
            self.solvetimes.push(0.0);
            self.nonlinear_solver(&mut u, &mut u_dot, &mut phi, &mut phi_dot, 0.0, 1.0)?;
            if self.settings.postprocess.compute_objective {
                objective = Some(self.compute_objective(&u, 0.0)?);
                self.params.sacadoize_params(false);
            }
            f_soln.store(u, 0.0);
        } else {
            objective = self.transient_solver(initial, &mut f_soln)?;
        }

        Ok((f_soln, objective))
    }

    /// Runs the adjoint problem against a stored forward trajectory and
    /// accumulates the objective gradient.
    pub fn adjoint_model(
        &mut self,
        f_soln: &SolutionStorage,
    ) -> Result<(SolutionStorage, Vec<f64>), SimError> {
        self.use_adjoint = true;
        self.params.sacadoize_params(false);
        self.assembler.reset_adj_prev();

        let mut a_soln = SolutionStorage::new();
        let mut gradient =
            vec![0.0; self.params.num_active_params + self.params.num_params(ParameterUsage::Discretized)];

        if !self.is_transient {
            let forward = f_soln.last().expect("forward solve stored");
            let mut u = forward.clone();
            let mut u_dot = self.blank_state();
            let mut phi = self.blank_state();
            let mut phi_dot = self.blank_state();
            self.current_time = 0.0;
            self.nonlinear_solver(&mut u, &mut u_dot, &mut phi, &mut phi_dot, 0.0, 1.0)?;
            self.compute_sensitivities(&u, &u_dot, &phi, &mut gradient, 0.0)?;
            a_soln.store(phi, 0.0);
        } else {
            let initial = self.blank_state();
            self.transient_adjoint(initial, f_soln, &mut a_soln, &mut gradient)?;
        }

        if self.batch_id == 0 {
            if let Some(path) = self.settings.postprocess.write_gradient.clone() {
                postprocess::write_gradient(std::path::Path::new(&path), &gradient)?;
            }
        }

        self.use_adjoint = false;
        Ok((a_soln, gradient))
    }

    // ------------------------------------------------------------------
    // Time stepping
    // ------------------------------------------------------------------

    fn bdf_alpha(&self, deltat: f64) -> f64 {
        match self.settings.solver.time_order {
            1 => 1.0 / deltat,
            2 => 3.0 / (2.0 * deltat),
            _ => unreachable!("validated at startup"),
        }
    }

    /// Forward transient march; stores u(t) at every step.
    fn transient_solver(
        &mut self,
        initial: DistMultiVector,
        out: &mut SolutionStorage,
    ) -> Result<Option<ObjectiveValue>, SimError> {
        let numsteps = self.settings.solver.num_steps;
        let deltat = self.settings.solver.final_time / numsteps as f64;
        let alpha = self.bdf_alpha(deltat);
        let time_order = self.settings.solver.time_order;

        let mut u = initial.clone();
        let mut u_dot = self.blank_state();
        let mut phi = self.blank_state();
        let mut phi_dot = self.blank_state();

        self.current_time = 0.0;
        self.is_final_time = false;
        self.solvetimes.push(0.0);
        out.store(initial, 0.0);

        let mut objective: Option<ObjectiveValue> = None;

        for timeiter in 0..numsteps {
            self.report_load_balance();
            self.current_time += deltat;
            info!(
                "beginning time step {timeiter} at t = {:.6e}",
                self.current_time
            );

            // Seed du/dt from the BDF stencil before the Newton loop; the
            // update keeps u_dot consistent as u changes.
            let prev = &out.vectors[timeiter];
            if time_order == 1 || timeiter == 0 {
                for i in 0..u.num_local() {
                    u_dot.values[(i, 0)] = alpha * (u.values[(i, 0)] - prev.values[(i, 0)]);
                }
            } else {
                let prev2 = &out.vectors[timeiter - 1];
                for i in 0..u.num_local() {
                    u_dot.values[(i, 0)] = alpha * u.values[(i, 0)]
                        - alpha * 4.0 / 3.0 * prev.values[(i, 0)]
                        + alpha / 3.0 * prev2.values[(i, 0)];
                }
            }

            if let Err(err) =
                self.nonlinear_solver(&mut u, &mut u_dot, &mut phi, &mut phi_dot, alpha, 1.0)
            {
                warn!("time step {timeiter} failed to converge: {err}");
            }

            self.solvetimes.push(self.current_time);
            out.store(u.clone(), self.current_time);

            if self.settings.solver.allow_remesh {
                self.remesh(&u)?;
            }

            if self.settings.postprocess.compute_objective {
                let step_obj = self.compute_objective(&u, self.current_time)?;
                self.params.sacadoize_params(false);
                objective = Some(match objective.take() {
                    None => step_obj,
                    Some(mut total) => {
                        total.value += step_obj.value;
                        for (g, s) in total.gradient.iter_mut().zip(&step_obj.gradient) {
                            *g += s;
                        }
                        total
                    }
                });
            }
        }

        Ok(objective)
    }

    /// Reverse-time adjoint march over a stored forward trajectory.
    fn transient_adjoint(
        &mut self,
        initial_phi: DistMultiVector,
        f_soln: &SolutionStorage,
        out: &mut SolutionStorage,
        gradient: &mut [f64],
    ) -> Result<(), SimError> {
        if self.settings.solver.time_order != 1 {
            return Err(crate::error::ConfigError::InvalidSetting {
                name: "solver.time_order".to_string(),
                reason: "the adjoint path supports the first-order stencil only".to_string(),
            }
            .into());
        }
        let numsteps = self.settings.solver.num_steps;
        let deltat = self.settings.solver.final_time / numsteps as f64;
        let alpha = self.bdf_alpha(deltat);
        let numivec = f_soln.len();

        let mut u = self.blank_state();
        let mut u_dot = self.blank_state();
        let mut phi = initial_phi;
        let mut phi_dot = self.blank_state();

        self.current_time = self.settings.solver.final_time;
        self.is_final_time = true;
        out.store(phi.clone(), self.current_time);

        for timeiter in 0..numsteps {
            self.report_load_balance();
            info!(
                "beginning adjoint step {timeiter} at t = {:.6e}",
                self.current_time
            );

            let fwd = &f_soln.vectors[numivec - timeiter - 1];
            let fwd_prev = &f_soln.vectors[numivec - timeiter - 2];
            for i in 0..u.num_local() {
                u.values[(i, 0)] = fwd.values[(i, 0)];
                u_dot.values[(i, 0)] = alpha * (fwd.values[(i, 0)] - fwd_prev.values[(i, 0)]);
            }
            phi_dot.put_scalar(0.0);

            if let Err(err) =
                self.nonlinear_solver(&mut u, &mut u_dot, &mut phi, &mut phi_dot, alpha, 1.0)
            {
                warn!("adjoint step {timeiter} failed to converge: {err}");
            }

            out.store(phi.clone(), self.current_time);

            // Gradient contribution at this state, then the adjoint history
            // for the next (earlier) step.
            self.compute_sensitivities(&u, &u_dot, &phi, gradient, alpha)?;
            self.params.sacadoize_params(false);
            self.store_adjoint_history(&u, &u_dot, &phi, &phi_dot, alpha)?;

            self.current_time -= deltat;
            self.is_final_time = false;
        }

        Ok(())
    }

    fn report_load_balance(&mut self) {
        if let Some(ms) = self.multiscale.as_mut() {
            let cost = ms.update();
            // Single rank: min and max coincide; the hook still reports.
            let (gmin, gmax) = (cost, cost);
            if gmin > 0.0 {
                info!("load balancing factor {}", gmax / gmin);
            }
        }
    }

    // ------------------------------------------------------------------
    // Nonlinear solve
    // ------------------------------------------------------------------

    /// Damped Newton iteration with an infinity-norm stopping criterion
    /// scaled by the initial residual.
    pub fn nonlinear_solver(
        &mut self,
        u: &mut DistMultiVector,
        u_dot: &mut DistMultiVector,
        phi: &mut DistMultiVector,
        phi_dot: &mut DistMultiVector,
        alpha: f64,
        beta: f64,
    ) -> Result<(), SimError> {
        let nl_tol = self.settings.solver.nl_tol;
        if self.settings.solver.use_strong_dbcs && !self.use_adjoint {
            self.set_dirichlet(u)?;
        }
        let maxiter = if self.use_adjoint {
            2
        } else {
            self.settings.solver.max_nl_iter
        };

        let mut nlerr_first = 10.0 * nl_tol;
        let mut nlerr_scaled = nlerr_first;
        let mut nlerr;
        let mut iter = 0;

        while nlerr_scaled > nl_tol && iter < maxiter {
            let (mut j, mut res) = self.assemble_system(u, u_dot, phi, phi_dot, alpha, beta)?;
            if self.settings.solver.use_strong_dbcs {
                self.assembler.apply_strong_dirichlet(&mut j, &mut res);
            }

            if iter == 0 {
                nlerr_first = res.norm_inf(0);
                nlerr = nlerr_first;
                nlerr_scaled = if nlerr_first > 1.0e-14 { 1.0 } else { 0.0 };
            } else {
                nlerr = res.norm_inf(0);
                nlerr_scaled = nlerr / nlerr_first;
            }
            info!(
                "nonlinear iteration {iter}: |r| = {nlerr:.6e}, scaled = {nlerr_scaled:.6e}"
            );

            if nlerr_scaled > nl_tol {
                let du_owned = self.linear_solver(&j, &res)?;
                let mut du = DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1);
                let mut du_owned_mv =
                    DistMultiVector::new(self.assembler.dofs.owned.clone(), 1);
                du_owned_mv.set_column_from(0, &du_owned);
                self.assembler
                    .dofs
                    .exporter
                    .import_insert(&du_owned_mv, &mut du);

                let step = if self.settings.solver.line_search && !self.use_adjoint {
                    self.parabolic_step(u, u_dot, phi, phi_dot, &du, alpha, beta, nlerr_first)?
                } else {
                    1.0
                };

                if self.use_adjoint {
                    phi.update(step, &du, 1.0);
                    phi_dot.update(step * alpha, &du, 1.0);
                } else {
                    u.update(step, &du, 1.0);
                    u_dot.update(step * alpha, &du, 1.0);
                }
            }
            iter += 1;
        }

        if nlerr_scaled > nl_tol {
            return Err(NonlinearNonConvergence {
                iterations: iter,
                scaled_residual: nlerr_scaled,
            }
            .into());
        }
        Ok(())
    }

    /// Assembles the owned Jacobian and residual at one state, without
    /// boundary-row replacement. Exposed for consistency verification.
    pub fn assemble_system(
        &mut self,
        u: &DistMultiVector,
        u_dot: &DistMultiVector,
        phi: &DistMultiVector,
        phi_dot: &DistMultiVector,
        alpha: f64,
        beta: f64,
    ) -> Result<(CsrMatrix<f64>, DistMultiVector), SimError> {
        let mut res_over = DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1);
        let mut j_over = GhostedMatrix::new();
        let opts = self.jac_res_options(alpha, beta, true, false, false);

        self.assembler.assemble_jac_res(
            u,
            u_dot,
            phi,
            phi_dot,
            &opts,
            &mut res_over,
            &mut j_over,
            &self.functions,
            &self.params,
            &mut self.multiscale,
            false,
        )?;

        let mut j = self.j_template.clone();
        j_over.export_add_into(&self.assembler.dofs.owned, &self.assembler.dofs.owned, &mut j);
        let mut res = DistMultiVector::new(self.assembler.dofs.owned.clone(), 1);
        self.assembler.dofs.exporter.export_add(&res_over, &mut res);
        Ok((j, res))
    }

    /// Residual-only assembly at one state, for finite-difference checks.
    pub fn assemble_residual(
        &mut self,
        u: &DistMultiVector,
        u_dot: &DistMultiVector,
        alpha: f64,
    ) -> Result<DistMultiVector, SimError> {
        let phi = self.blank_state();
        let mut res_over = DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1);
        let mut j_over = GhostedMatrix::new();
        let opts = self.jac_res_options(alpha, 1.0, false, false, false);
        self.assembler.assemble_jac_res(
            u,
            u_dot,
            &phi,
            &phi,
            &opts,
            &mut res_over,
            &mut j_over,
            &self.functions,
            &self.params,
            &mut self.multiscale,
            false,
        )?;
        let mut res = DistMultiVector::new(self.assembler.dofs.owned.clone(), 1);
        self.assembler.dofs.exporter.export_add(&res_over, &mut res);
        Ok(res)
    }

    /// Three-point parabolic line search over the residual norm at step
    /// lengths 0, 1/2 and 1.
    #[allow(clippy::too_many_arguments)]
    fn parabolic_step(
        &mut self,
        u: &DistMultiVector,
        u_dot: &DistMultiVector,
        phi: &DistMultiVector,
        phi_dot: &DistMultiVector,
        du: &DistMultiVector,
        alpha: f64,
        beta: f64,
        err0: f64,
    ) -> Result<f64, SimError> {
        let mut residual_at = |step: f64| -> Result<f64, SimError> {
            let mut u_trial = u.clone();
            let mut u_dot_trial = u_dot.clone();
            u_trial.update(step, du, 1.0);
            u_dot_trial.update(step * alpha, du, 1.0);
            let mut res_over = DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1);
            let mut j_over = GhostedMatrix::new();
            let opts = self.jac_res_options(alpha, beta, false, false, false);
            self.assembler.assemble_jac_res(
                &u_trial,
                &u_dot_trial,
                phi,
                phi_dot,
                &opts,
                &mut res_over,
                &mut j_over,
                &self.functions,
                &self.params,
                &mut self.multiscale,
                false,
            )?;
            let mut res = DistMultiVector::new(self.assembler.dofs.owned.clone(), 1);
            self.assembler.dofs.exporter.export_add(&res_over, &mut res);
            self.assembler.zero_dirichlet_rows(&mut res);
            Ok(res.norm_inf(0))
        };

        let err_half = residual_at(0.5)?;
        let err1 = residual_at(1.0)?;
        let denom = 2.0 * (2.0 * err0 - 4.0 * err_half + 2.0 * err1);
        let mut opt = if denom.abs() > 1e-300 {
            (3.0 * err0 + err1 - 4.0 * err_half) / denom
        } else {
            1.0
        };
        if opt > 1.0 {
            opt = 1.0;
        } else if opt < 0.0 {
            opt = 0.1;
        }
        debug!("line search step {opt:.4} (errors {err0:.3e} {err_half:.3e} {err1:.3e})");
        Ok(opt)
    }

    fn jac_res_options(
        &self,
        alpha: f64,
        beta: f64,
        build_jacobian: bool,
        seed_params: bool,
        disc_sens: bool,
    ) -> JacResOptions {
        JacResOptions {
            time: self.current_time,
            deltat: if alpha > 0.0 { 1.0 / alpha } else { 1.0 },
            alpha,
            beta,
            is_transient: self.is_transient,
            is_adjoint: self.use_adjoint,
            is_final_time: self.is_final_time,
            build_jacobian,
            seed_params,
            disc_sens,
            num_active_params: self.params.num_active_params,
            max_derivs: self.settings.solver.max_derivs,
        }
    }

    // ------------------------------------------------------------------
    // Linear solve
    // ------------------------------------------------------------------

    /// Krylov solve with the preconditioner re-setup cascade; falls back to a
    /// direct factorization when configured.
    pub fn linear_solver(
        &self,
        j: &CsrMatrix<f64>,
        res: &DistMultiVector,
    ) -> Result<DVector<f64>, LinearSolveError> {
        let b = res.column_owned(0);
        if self.settings.solver.use_direct {
            return dense_lu_solve(&csr_to_dense(j), &b);
        }

        let gmres = GmresSolver::new(
            self.settings.solver.lin_tol,
            self.settings.solver.lin_iter,
            self.settings.solver.krylov_space,
        );
        let mut x = DVector::zeros(b.len());

        match self.settings.solver.preconditioner.kind {
            PreconditionerKind::None => {
                gmres.solve(j, &IdentityPreconditioner, &b, &mut x)?;
                Ok(x)
            }
            PreconditionerKind::Jacobi => {
                let pc = JacobiPreconditioner::from_csr(j);
                gmres.solve(j, &pc, &b, &mut x)?;
                Ok(x)
            }
            PreconditionerKind::Ilu => {
                // Progressively stronger diagonal thresholding, then a point
                // Jacobi fallback, before giving up.
                let base = &self.settings.solver.preconditioner;
                let ladder = [
                    (base.drop_tol, 0.0),
                    (1e-5, 0.0),
                    (1e-5, 0.01),
                    (1e-2, 0.0),
                    (1e-2, 0.01),
                ];
                let mut attempts = 0;
                for &(athresh, rthresh) in &ladder {
                    attempts += 1;
                    let pc = match IluPreconditioner::factor(j, athresh, rthresh) {
                        Ok(pc) => pc,
                        Err(err) => {
                            warn!("ILU factorization failed ({err}); strengthening thresholds");
                            continue;
                        }
                    };
                    x.fill(0.0);
                    match gmres.solve(j, &pc, &b, &mut x) {
                        Ok(out) => {
                            debug!(
                                "linear solve converged in {} iterations (residual {:.3e})",
                                out.iterations, out.residual
                            );
                            return Ok(x);
                        }
                        Err(err) => {
                            warn!("linear solve failed ({err}); re-running preconditioner setup");
                        }
                    }
                }
                attempts += 1;
                let pc = JacobiPreconditioner::from_csr(j);
                x.fill(0.0);
                match gmres.solve(j, &pc, &b, &mut x) {
                    Ok(_) => Ok(x),
                    Err(_) => Err(LinearSolveError::CascadeExhausted { attempts }),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Objective and sensitivities
    // ------------------------------------------------------------------

    pub fn compute_objective(
        &mut self,
        u: &DistMultiVector,
        time: f64,
    ) -> Result<ObjectiveValue, SimError> {
        postprocess::compute_objective(
            &mut self.assembler,
            &self.functions,
            &mut self.params,
            &self.settings.postprocess,
            u,
            time,
        )
    }

    /// Accumulates both sensitivity pathways into `gradient` at one state:
    /// scalar parameters via -phi^T dR/dtheta, discretized parameters via
    /// -(dR/dp)^T phi, each plus the explicit objective derivative.
    pub fn compute_sensitivities(
        &mut self,
        u: &DistMultiVector,
        u_dot: &DistMultiVector,
        phi: &DistMultiVector,
        gradient: &mut [f64],
        alpha: f64,
    ) -> Result<(), SimError> {
        let obj_sens = if self.settings.postprocess.compute_objective {
            Some(self.compute_objective(u, self.current_time)?)
        } else {
            None
        };

        let num_active = self.params.num_active_params;
        let mut phi_owned = DistMultiVector::new(self.assembler.dofs.owned.clone(), 1);
        let phi_ghosted_col = phi.column_owned(0);
        // phi lives on the ghosted map; restrict to owned entries.
        for lid in 0..phi_owned.num_local() {
            let gid = self.assembler.dofs.owned.gid(lid);
            let glid = self.assembler.dofs.ghosted.lid(gid).unwrap();
            phi_owned.values[(lid, 0)] = phi_ghosted_col[glid];
        }

        if num_active > 0 {
            self.params.sacadoize_params(true);
            let was_adjoint = self.use_adjoint;
            self.use_adjoint = false;

            let mut res_over =
                DistMultiVector::new(self.assembler.dofs.ghosted.clone(), num_active);
            let mut j_over = GhostedMatrix::new();
            let opts = self.jac_res_options(alpha, 1.0, false, true, false);
            self.assembler.assemble_jac_res(
                u,
                u_dot,
                phi,
                phi,
                &opts,
                &mut res_over,
                &mut j_over,
                &self.functions,
                &self.params,
                &mut self.multiscale,
                false,
            )?;
            self.use_adjoint = was_adjoint;

            let mut res = DistMultiVector::new(self.assembler.dofs.owned.clone(), num_active);
            self.assembler.dofs.exporter.export_add(&res_over, &mut res);
            self.assembler.zero_dirichlet_rows(&mut res);

            for p in 0..num_active {
                let mut currsens = 0.0;
                for i in 0..phi_owned.num_local() {
                    currsens += phi_owned.values[(i, 0)] * res.values[(i, p)];
                }
                gradient[p] += -currsens
                    + obj_sens
                        .as_ref()
                        .map_or(0.0, |o| o.gradient.get(p).copied().unwrap_or(0.0));
            }
        }

        let num_disc = self.params.num_params(ParameterUsage::Discretized);
        if num_disc > 0 {
            self.params.sacadoize_params(false);
            let was_adjoint = self.use_adjoint;
            self.use_adjoint = false;

            let mut res_over = DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1);
            let mut j_over = GhostedMatrix::new();
            let opts = self.jac_res_options(alpha, 1.0, false, false, true);
            self.assembler.assemble_jac_res(
                u,
                u_dot,
                phi,
                phi,
                &opts,
                &mut res_over,
                &mut j_over,
                &self.functions,
                &self.params,
                &mut self.multiscale,
                false,
            )?;
            self.use_adjoint = was_adjoint;

            let param_owned = self
                .params
                .param_owned_map()
                .expect("discretized numbering");
            let mut j_p = self
                .param_template
                .as_ref()
                .expect("rectangular template built")
                .clone();
            j_over.export_add_into(&param_owned, &self.assembler.dofs.owned, &mut j_p);

            // Strong Dirichlet rows of R are identity rows; their parameter
            // derivative is zero.
            let mut phi_bc = phi_owned.column_owned(0);
            for &row in &self.assembler.dofs.dirichlet_rows {
                phi_bc[row] = 0.0;
            }
            let sens = csr_mul_vec(&j_p, &phi_bc);
            for p in 0..num_disc {
                gradient[num_active + p] += -sens[p]
                    + obj_sens
                        .as_ref()
                        .map_or(0.0, |o| o.gradient.get(num_active + p).copied().unwrap_or(0.0));
            }
        }

        Ok(())
    }

    /// Assembles the rectangular dR/dp at one state (discretized-parameter
    /// Jacobian), exposed for dot-product verification.
    pub fn assemble_param_jacobian(
        &mut self,
        u: &DistMultiVector,
        u_dot: &DistMultiVector,
        alpha: f64,
    ) -> Result<CsrMatrix<f64>, SimError> {
        self.params.sacadoize_params(false);
        let phi = self.blank_state();
        let mut res_over = DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1);
        let mut j_over = GhostedMatrix::new();
        let opts = self.jac_res_options(alpha, 1.0, false, false, true);
        self.assembler.assemble_jac_res(
            u,
            u_dot,
            &phi,
            &phi,
            &opts,
            &mut res_over,
            &mut j_over,
            &self.functions,
            &self.params,
            &mut self.multiscale,
            false,
        )?;
        let param_owned = self
            .params
            .param_owned_map()
            .expect("discretized numbering");
        let mut j_p = self
            .param_template
            .as_ref()
            .expect("rectangular template built")
            .clone();
        j_over.export_add_into(&param_owned, &self.assembler.dofs.owned, &mut j_p);
        Ok(j_p)
    }

    /// Stores alpha Jdot^T phi on every cell for the next reverse step.
    fn store_adjoint_history(
        &mut self,
        u: &DistMultiVector,
        u_dot: &DistMultiVector,
        phi: &DistMultiVector,
        phi_dot: &DistMultiVector,
        alpha: f64,
    ) -> Result<(), SimError> {
        let mut res_over = DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1);
        let mut j_over = GhostedMatrix::new();
        let opts = self.jac_res_options(alpha, 1.0, true, false, false);
        self.assembler.assemble_jac_res(
            u,
            u_dot,
            phi,
            phi_dot,
            &opts,
            &mut res_over,
            &mut j_over,
            &self.functions,
            &self.params,
            &mut self.multiscale,
            true,
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // State initialization and boundary data
    // ------------------------------------------------------------------

    pub fn blank_state(&self) -> DistMultiVector {
        DistMultiVector::new(self.assembler.dofs.ghosted.clone(), 1)
    }

    /// Imposes the prescribed strong-Dirichlet values on the current guess.
    fn set_dirichlet(&self, u: &mut DistMultiVector) -> Result<(), SimError> {
        let lookup = scalar_lookup(&self.params.groups);
        for node in &self.assembler.dofs.dirichlet_nodes {
            let ctx = crate::functions::parser::PointContext {
                x: node.coords[0],
                y: node.coords[1],
                z: node.coords[2],
                t: self.current_time,
                scalars: &lookup,
            };
            let value = node
                .expr
                .eval_pointwise(&ctx)
                .map_err(|reason| crate::error::ConfigError::BadExpression {
                    name: "dirichlet".to_string(),
                    reason,
                })?;
            let lid = self.assembler.dofs.ghosted.lid(node.gid).unwrap();
            u.values[(lid, 0)] = value;
        }
        Ok(())
    }

    /// Nodal interpolation of the per-variable initial-condition expressions.
    pub fn set_initial(&self) -> Result<DistMultiVector, SimError> {
        let mut u = self.blank_state();
        let lookup = scalar_lookup(&self.params.groups);
        for block in &self.assembler.dofs.blocks {
            for (v, var) in block.vars.iter().enumerate() {
                let Some(source) = self.settings.physics.initial.get(&var.name) else {
                    continue;
                };
                let expr = crate::functions::parser::parse(source).map_err(|reason| {
                    crate::error::ConfigError::BadExpression {
                        name: format!("initial {}", var.name),
                        reason,
                    }
                })?;
                let lattice = &block.lattices[v];
                let dim = self.mesh.dim;
                for node in 0..lattice.num_nodes {
                    let c = lattice.node_coord(node, dim);
                    let ctx = crate::functions::parser::PointContext {
                        x: c.first().copied().unwrap_or(0.0),
                        y: c.get(1).copied().unwrap_or(0.0),
                        z: c.get(2).copied().unwrap_or(0.0),
                        t: 0.0,
                        scalars: &lookup,
                    };
                    let value = expr.eval_pointwise(&ctx).map_err(|reason| {
                        crate::error::ConfigError::BadExpression {
                            name: format!("initial {}", var.name),
                            reason,
                        }
                    })?;
                    let gid = block.var_base[v] + node;
                    let lid = self.assembler.dofs.ghosted.lid(gid).unwrap();
                    u.values[(lid, 0)] = value;
                }
            }
        }
        Ok(u)
    }

    /// Solution-driven node displacement: variables named dx/dy/dz move the
    /// mesh corner nodes, and cell node arrays are rebuilt.
    fn remesh(&mut self, u: &DistMultiVector) -> Result<(), SimError> {
        let disp_names = ["dx", "dy", "dz"];
        let mut any_moved = false;
        for (b, block) in self.mesh.blocks.iter_mut().enumerate() {
            let dim = block.dim();
            let mut delta = vec![0.0; block.num_nodes * dim];
            let block_dofs = &self.assembler.dofs.blocks[b];
            let mut moved = false;
            for (d, name) in disp_names.iter().enumerate().take(dim) {
                let Some(v) = block_dofs.var_index(name) else {
                    continue;
                };
                if block_dofs.vars[v].order != 1 {
                    warn!("remesh ignores displacement variable {name} of order > 1");
                    continue;
                }
                let lattice = &block_dofs.lattices[v];
                for node in 0..lattice.num_nodes.min(block.num_nodes) {
                    let gid = block_dofs.var_base[v] + node;
                    let lid = self.assembler.dofs.ghosted.lid(gid).unwrap();
                    delta[node * dim + d] = u.values[(lid, 0)];
                }
                moved = true;
            }
            if moved {
                block.displace_nodes(&delta);
                any_moved = true;
            }
        }
        if any_moved {
            self.assembler.refresh_nodes(&self.mesh);
            info!("mesh nodes displaced from solution fields");
        }
        Ok(())
    }
}
