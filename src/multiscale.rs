//! Multiscale (mortar) coupling.
//!
//! Each macro element of a flagged block embeds an independent finer-scale FE
//! problem over the element's extent. The macro assembler sees the subgrid
//! only through the flux/Lagrange-multiplier interface: the macro trace is
//! exposed to the subgrid as the auxiliary variable lambda on every subgrid
//! side facing the macro boundary, and the subgrid returns the outward
//! numerical flux projected onto the macro basis. Sensitivities propagate
//! across scales by the chain rule d F/d lambda = dF/dlambda + (dF/du_sub)
//! (du_sub/dlambda), evaluated through the same AD pipeline.
//!
//! Subgrid models exclusively own their local mesh, numbering and solver
//! state; the macro side holds an integer model id and communicates through
//! copies of nodes and flux buffers. Destroying the manager tears subgrids
//! down in reverse registration order (vector drop order).

use log::{debug, info};
use nalgebra::{DMatrix, DVector};

use crate::ad::{cst, partials, seeded, val, with_partials, Ad, SeedWhat};
use crate::assembly::AssemblyManager;
use crate::cell::{Cell, JacResOptions};
use crate::discretization::{BlockDisc, DofLattice};
use crate::dofs::{SideTag, SIDE_MULTISCALE, SIDE_WEAK_DIRICHLET};
use crate::error::{
    AssemblyError, ConfigError, NonlinearNonConvergence, SimError, SubgridError,
};
use crate::fields::{Field2, Field3};
use crate::functions::FunctionManager;
use crate::linalg::solve::dense_lu_solve;
use crate::mesh::{Mesh, MeshBlock};
use crate::params::ParameterManager;
use crate::physics::Physics;
use crate::settings::Settings;
use crate::workset::Workset;

/// Time-indexed subgrid state storage; storing at an existing time replaces
/// the entry, so repeated macro Newton iterations do not grow the history.
#[derive(Debug, Default)]
struct SubgridStorage {
    times: Vec<f64>,
    states: Vec<DVector<f64>>,
}

impl SubgridStorage {
    fn store(&mut self, state: DVector<f64>, time: f64) {
        if let Some(i) = self.times.iter().position(|&t| (t - time).abs() < 1e-13) {
            self.states[i] = state;
        } else {
            self.times.push(time);
            self.states.push(state);
        }
    }

    /// The stored state with the largest time strictly before `time`.
    fn extract_previous(&self, time: f64) -> Option<(&DVector<f64>, f64)> {
        let mut best: Option<usize> = None;
        for (i, &t) in self.times.iter().enumerate() {
            if t < time - 1e-13 && best.map_or(true, |b| self.times[b] < t) {
                best = Some(i);
            }
        }
        best.map(|i| (&self.states[i], self.times[i]))
    }
}

/// One macro element's embedded fine-scale problem.
#[derive(Debug)]
struct SubgridInstance {
    ne: usize,
    ndof_per_elem: usize,
    total_dofs: usize,
    nodes: Field3<f64>,
    elem_gids: Vec<Vec<usize>>,
    sideinfo: Field3<SideTag>,
    /// Per side, per macro variable: (sub element, macro basis, side qp)
    /// mortar basis values; zero on elements away from that side.
    mortar: Vec<Vec<Field3<f64>>>,
    u: DVector<f64>,
    storage: SubgridStorage,
    /// Dense factorization reused for the sensitivity solves of the current
    /// macro iteration.
    factor: Option<nalgebra::LU<f64, nalgebra::Dyn, nalgebra::Dyn>>,
}

#[derive(Debug)]
pub struct SubgridModel {
    pub name: String,
    pub macro_block: usize,
    refine: usize,
    time_steps: usize,
    nl_tol: f64,
    max_nl_iter: usize,
    dim: usize,
    disc: BlockDisc,
    wkset: Workset,
    /// Macro element slot layout, copied at registration.
    macro_offsets: Vec<Vec<usize>>,
    macro_ndof: usize,
    instances: Vec<SubgridInstance>,
}

impl SubgridModel {
    /// Registers one macro element: builds the structured submesh over the
    /// macro extent, its numbering, side tags and mortar tables. Returns the
    /// usernum handle.
    fn add_macro(
        &mut self,
        macro_corners: &[f64],
        macro_orders: &[usize],
        mesh_topo: crate::mesh::CellTopo,
    ) -> Result<usize, SimError> {
        let dim = self.dim;
        let refine = self.refine;
        let mut lower = [0.0; 3];
        let mut upper = [0.0; 3];
        let ncorner = mesh_topo.num_corners();
        for d in 0..dim {
            lower[d] = macro_corners[d];
            upper[d] = macro_corners[(ncorner - 1) * dim + d];
        }
        let sub_block = MeshBlock::structured(
            &format!("{}-sub{}", self.name, self.instances.len()),
            dim,
            [refine, refine, refine],
            lower,
            upper,
        )?;

        let ne = sub_block.num_elems;
        let ncorner = sub_block.topo.num_corners();
        let mut nodes = Field3::from_elem(ne, ncorner, dim, 0.0);
        for e in 0..ne {
            let coords = sub_block.elem_corner_coords(e);
            for c in 0..ncorner {
                for d in 0..dim {
                    nodes[(e, c, d)] = coords[c * dim + d];
                }
            }
        }

        // Variable-major numbering over the subgrid lattices.
        let nvars = macro_orders.len();
        let mut lattices = Vec::with_capacity(nvars);
        let mut var_base = Vec::with_capacity(nvars);
        let mut next = 0usize;
        for &order in macro_orders {
            let lattice = DofLattice::build(&sub_block, order);
            var_base.push(next);
            next += lattice.num_nodes;
            lattices.push(lattice);
        }
        let total_dofs = next;
        let ndof_per_elem: usize = lattices.iter().map(|l| l.nodes_per_elem).sum();
        let mut elem_gids = Vec::with_capacity(ne);
        for e in 0..ne {
            let mut gids = Vec::with_capacity(ndof_per_elem);
            for (v, lattice) in lattices.iter().enumerate() {
                for i in 0..lattice.nodes_per_elem {
                    gids.push(var_base[v] + lattice.elem_node(e, i));
                }
            }
            elem_gids.push(gids);
        }

        // Every outer subgrid side faces the macro boundary: weak Dirichlet
        // against the mortar trace, with the -1 neighbor marker.
        let nsides = sub_block.topo.num_sides();
        let mut sideinfo = Field3::from_elem(ne, nvars, nsides, SideTag::default());
        for side_set in &sub_block.side_sets {
            for &(e, s) in &side_set.entries {
                for v in 0..nvars {
                    sideinfo[(e, v, s)] = SideTag {
                        kind: SIDE_WEAK_DIRICHLET,
                        bset: -1,
                        aux0: 0,
                        aux1: 0,
                    };
                }
            }
        }

        // Mortar tables: macro basis values at each subgrid side quadrature
        // point, expressed through the macro reference cell.
        let macro_basis: Vec<crate::discretization::LagrangeBasis> = macro_orders
            .iter()
            .map(|&o| crate::discretization::LagrangeBasis::new(mesh_topo, o))
            .collect();
        let mut mortar = Vec::with_capacity(nsides);
        let elem_counts = {
            let mut c = [1usize; 3];
            c[..dim].copy_from_slice(&sub_block.divisions[..dim]);
            c
        };
        for side in 0..nsides {
            let nqs = self.disc.side_pts[side].len();
            let mut per_var = Vec::with_capacity(nvars);
            for (v, basis) in macro_basis.iter().enumerate() {
                let nb = basis.num_basis();
                let mut table = Field3::from_elem(ne, nb, nqs, 0.0);
                let mut vals = vec![0.0; nb];
                for e in 0..ne {
                    if sideinfo[(e, v, side)].kind != SIDE_WEAK_DIRICHLET {
                        continue;
                    }
                    let mut eidx = [0usize; 3];
                    let mut rem = e;
                    for axis in 0..3 {
                        eidx[axis] = rem % elem_counts[axis];
                        rem /= elem_counts[axis];
                    }
                    for (k, pt) in self.disc.side_pts[side].iter().enumerate() {
                        let mut xi_mac = [0.0; 3];
                        for a in 0..dim {
                            let frac = (eidx[a] as f64 + (pt[a] + 1.0) / 2.0) / refine as f64;
                            xi_mac[a] = 2.0 * frac - 1.0;
                        }
                        basis.eval(&xi_mac, &mut vals);
                        for j in 0..nb {
                            table[(e, j, k)] = vals[j];
                        }
                    }
                }
                per_var.push(table);
            }
            mortar.push(per_var);
        }

        let usernum = self.instances.len();
        self.instances.push(SubgridInstance {
            ne,
            ndof_per_elem,
            total_dofs,
            nodes,
            elem_gids,
            sideinfo,
            mortar,
            u: DVector::zeros(total_dofs),
            storage: SubgridStorage::default(),
            factor: None,
        });
        Ok(usernum)
    }

    /// Element count times substeps, the migration cost hook.
    pub fn cost_estimate(&self) -> f64 {
        (self.instances.len() * self.time_steps) as f64
            * self
                .instances
                .first()
                .map_or(0.0, |i| i.ne as f64)
    }

    /// Localizes global AD dofs (already carrying globally consistent
    /// derivative content) to per-element rows.
    fn localize_ad(instance: &SubgridInstance, dofs: &[Ad]) -> Field2<Ad> {
        let mut out = Field2::from_elem(instance.ne, instance.ndof_per_elem, cst(0.0));
        for e in 0..instance.ne {
            for (slot, &gid) in instance.elem_gids[e].iter().enumerate() {
                out[(e, slot)] = dofs[gid].clone();
            }
        }
        out
    }

    /// Localizes plain global values, optionally seeding each element-local
    /// slot (the subgrid analogue of the cell-level DOF seeding).
    fn localize_values(
        instance: &SubgridInstance,
        values: &DVector<f64>,
        seed: bool,
        width: usize,
    ) -> Field2<Ad> {
        let mut out = Field2::from_elem(instance.ne, instance.ndof_per_elem, cst(0.0));
        for e in 0..instance.ne {
            for (slot, &gid) in instance.elem_gids[e].iter().enumerate() {
                out[(e, slot)] = if seed {
                    seeded(width, slot, values[gid])
                } else {
                    cst(values[gid])
                };
            }
        }
        out
    }

    /// One seeded subgrid residual evaluation over volume and sides, on
    /// pre-localized AD fields.
    #[allow(clippy::too_many_arguments)]
    fn residual_pass(
        &mut self,
        usernum: usize,
        u_loc: &Field2<Ad>,
        u_dot_loc: &Field2<Ad>,
        lambda: &[Ad],
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        time: f64,
        alpha: f64,
        is_transient: bool,
    ) -> Result<(), AssemblyError> {
        let instance = &self.instances[usernum];
        let ne = instance.ne;
        let wkset = &mut self.wkset;

        wkset.time = time;
        wkset.alpha = alpha;
        wkset.is_transient = is_transient;
        wkset.update_volume(&instance.nodes, ne, &self.disc);
        for e in 0..ne {
            for v in 0..wkset.varlist.len() {
                for s in 0..self.disc.topo.num_sides() {
                    wkset.sideinfo[(e, v, s)] = instance.sideinfo[(e, v, s)];
                }
            }
        }

        wkset.compute_vol_solution(u_loc, Some(u_dot_loc));
        wkset.reset_residual();
        for module in physics {
            module.volume_residual(wkset, functions, params)?;
        }

        let nvars = wkset.varlist.len();
        for side in 0..self.disc.topo.num_sides() {
            let any = (0..ne).any(|e| {
                (0..nvars).any(|v| instance.sideinfo[(e, v, side)].kind != 0)
            });
            if !any {
                continue;
            }
            wkset.update_side(&instance.nodes, ne, &self.disc, side);
            wkset.current_sideset = "interior".to_string();
            wkset.compute_side_solution(u_loc);

            // Mortar trace: lambda contracted with the macro basis.
            for e in 0..ne {
                for v in 0..nvars {
                    let table = &instance.mortar[side][v];
                    let (_, nb, nqs) = table.dims();
                    for k in 0..nqs {
                        let mut trace = cst(0.0);
                        for j in 0..nb {
                            let w = table[(e, j, k)];
                            if w != 0.0 {
                                trace += lambda[self.macro_offsets[v][j]].clone() * w;
                            }
                        }
                        wkset.local_aux_side[(e, v, k)] = trace;
                    }
                }
            }

            for module in physics {
                module.boundary_residual(wkset, functions, params)?;
            }
        }
        Ok(())
    }

    /// Scatters the workset residual into a global value vector and, when a
    /// local seeding was used, the dense Jacobian.
    fn extract_global(
        &self,
        usernum: usize,
        width: usize,
        r: &mut DVector<f64>,
        j: Option<&mut DMatrix<f64>>,
    ) {
        let instance = &self.instances[usernum];
        r.fill(0.0);
        let mut j = j;
        if let Some(j) = j.as_deref_mut() {
            j.fill(0.0);
        }
        for e in 0..instance.ne {
            for (i, &gi) in instance.elem_gids[e].iter().enumerate() {
                let value = &self.wkset.res[(e, i)];
                r[gi] += val(value);
                if let Some(j) = j.as_deref_mut() {
                    let d = partials(value, width);
                    for (jj, &gj) in instance.elem_gids[e].iter().enumerate() {
                        j[(gi, gj)] += d[jj];
                    }
                }
            }
        }
    }

    /// Extracts dR/dx for a global seeding (mortar trace or parameters):
    /// rows are subgrid dofs, columns the seeded slots.
    fn extract_sensitivity(&self, usernum: usize, width: usize, b: &mut DMatrix<f64>) {
        let instance = &self.instances[usernum];
        b.fill(0.0);
        for e in 0..instance.ne {
            for (i, &gi) in instance.elem_gids[e].iter().enumerate() {
                let d = partials(&self.wkset.res[(e, i)], width);
                for c in 0..width {
                    b[(gi, c)] += d[c];
                }
            }
        }
    }

    /// The subgrid nonlinear solve for a given trace, one BDF substep.
    #[allow(clippy::too_many_arguments)]
    fn sub_nonlinear_solver(
        &mut self,
        usernum: usize,
        lambda: &[f64],
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        time: f64,
        alpha: f64,
        is_transient: bool,
        u_prev: &DVector<f64>,
    ) -> Result<(), SubgridError> {
        let n = self.instances[usernum].total_dofs;
        let ndof = self.instances[usernum].ndof_per_elem;
        let lambda_ad: Vec<Ad> = lambda.iter().map(|&v| cst(v)).collect();

        let mut r = DVector::zeros(n);
        let mut j = DMatrix::zeros(n, n);
        let mut resnorm_initial = 0.0;
        let mut scaled = 10.0 * self.nl_tol;
        let mut iter = 0;

        while iter < self.max_nl_iter && scaled > self.nl_tol {
            let u = self.instances[usernum].u.clone();
            let u_dot: DVector<f64> = if is_transient {
                alpha * (&u - u_prev)
            } else {
                DVector::zeros(n)
            };

            // Stiffness pass: seed the element-local solution slots.
            let u_loc =
                Self::localize_values(&self.instances[usernum], &u, true, ndof);
            let u_dot_loc =
                Self::localize_values(&self.instances[usernum], &u_dot, false, ndof);
            self.residual_pass(
                usernum, &u_loc, &u_dot_loc, &lambda_ad, physics, functions, params, time,
                alpha, is_transient,
            )
            .map_err(|_| {
                SubgridError::Nonlinear(NonlinearNonConvergence {
                    iterations: iter,
                    scaled_residual: scaled,
                })
            })?;
            self.extract_global(usernum, ndof, &mut r, Some(&mut j));

            if is_transient {
                // Mass pass: separate du/dt seeding.
                let u_loc =
                    Self::localize_values(&self.instances[usernum], &u, false, ndof);
                let u_dot_loc =
                    Self::localize_values(&self.instances[usernum], &u_dot, true, ndof);
                self.residual_pass(
                    usernum, &u_loc, &u_dot_loc, &lambda_ad, physics, functions, params,
                    time, alpha, is_transient,
                )
                .map_err(|_| {
                    SubgridError::Nonlinear(NonlinearNonConvergence {
                        iterations: iter,
                        scaled_residual: scaled,
                    })
                })?;
                let mut m = DMatrix::zeros(n, n);
                let mut r_dummy = DVector::zeros(n);
                self.extract_global(usernum, ndof, &mut r_dummy, Some(&mut m));
                j += m * alpha;
            }

            let resnorm = r.amax();
            if iter == 0 {
                resnorm_initial = resnorm;
                scaled = if resnorm_initial > 0.0 { 1.0 } else { 0.0 };
            } else {
                scaled = resnorm / resnorm_initial;
            }
            debug!("subgrid nonlinear iteration {iter}: scaled residual {scaled:.3e}");

            if scaled > self.nl_tol {
                let du = dense_lu_solve(&j, &(-&r)).map_err(SubgridError::Linear)?;
                self.instances[usernum].u += du;
            }
            iter += 1;
        }

        // Keep the factorization for the sensitivity solves against the same
        // subgrid Jacobian.
        self.instances[usernum].factor = Some(j.lu());

        if scaled > self.nl_tol {
            return Err(SubgridError::Nonlinear(NonlinearNonConvergence {
                iterations: iter,
                scaled_residual: scaled,
            }));
        }
        Ok(())
    }

}

/// The manager owning every subgrid model and the macro-side coupling.
#[derive(Debug)]
pub struct MultiscaleManager {
    pub models: Vec<SubgridModel>,
}

impl MultiscaleManager {
    /// Builds one subgrid model per flagged macro block and assigns every
    /// macro element an instance.
    pub fn build(
        settings: &Settings,
        mesh: &Mesh,
        assembler: &mut AssemblyManager,
    ) -> Result<Self, SimError> {
        let ms = &settings.multiscale;
        let mut models = Vec::new();

        for block_name in &ms.blocks {
            let Some(b) = mesh.blocks.iter().position(|blk| &blk.name == block_name) else {
                return Err(ConfigError::InvalidSetting {
                    name: "multiscale.blocks".to_string(),
                    reason: format!("unknown block `{block_name}`"),
                }
                .into());
            };
            for bc in &settings.physics.dirichlet {
                if bc.method == crate::settings::BcMethod::Weak
                    && mesh.blocks[b].has_side_set(&bc.side_set)
                {
                    return Err(ConfigError::InvalidSetting {
                        name: "multiscale.blocks".to_string(),
                        reason: "multiscale blocks require strong macro Dirichlet data"
                            .to_string(),
                    }
                    .into());
                }
            }

            let block_dofs = &assembler.dofs.blocks[b];
            let macro_orders: Vec<usize> = block_dofs.vars.iter().map(|v| v.order).collect();
            let orders_unique = {
                let mut o = macro_orders.clone();
                o.sort_unstable();
                o.dedup();
                o
            };
            let disc = BlockDisc::new(mesh.blocks[b].topo, &orders_unique);

            // The subgrid workset mirrors the macro block's variable layout
            // over the subgrid element batch.
            let refine = ms.refine;
            let sub_ne = refine.pow(mesh.dim as u32);
            let varlist: Vec<String> = block_dofs.vars.iter().map(|v| v.name.clone()).collect();
            let usebasis: Vec<usize> = block_dofs
                .vars
                .iter()
                .map(|v| disc.basis_index(v.order).unwrap())
                .collect();
            let sub_basis: Vec<crate::discretization::LagrangeBasis> = block_dofs
                .vars
                .iter()
                .map(|v| crate::discretization::LagrangeBasis::new(mesh.blocks[b].topo, v.order))
                .collect();
            let mut offsets = Vec::new();
            let mut slot = 0usize;
            for basis in &sub_basis {
                offsets.push((slot..slot + basis.num_basis()).collect::<Vec<_>>());
                slot += basis.num_basis();
            }
            let wkset = Workset::new(
                b,
                sub_ne,
                &disc,
                varlist,
                usebasis,
                offsets,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                mesh.blocks[b].topo.num_sides(),
            );

            let mut model = SubgridModel {
                name: format!("subgrid-{block_name}"),
                macro_block: b,
                refine,
                time_steps: ms.time_steps.max(1),
                nl_tol: ms.sub_nl_tol,
                max_nl_iter: ms.sub_max_nl_iter,
                dim: mesh.dim,
                disc,
                wkset,
                macro_offsets: block_dofs.offsets.clone(),
                macro_ndof: block_dofs.ndof_per_elem,
                instances: Vec::new(),
            };

            let model_idx = models.len();
            let topo = mesh.blocks[b].topo;
            for cell in &mut assembler.cells[b] {
                let mut usernums = Vec::with_capacity(cell.num_elems);
                for e in 0..cell.num_elems {
                    let mut corners =
                        vec![0.0; topo.num_corners() * mesh.dim];
                    for c in 0..topo.num_corners() {
                        for d in 0..mesh.dim {
                            corners[c * mesh.dim + d] = cell.nodes[(e, c, d)];
                        }
                    }
                    let usernum = model.add_macro(&corners, &macro_orders, topo)?;
                    usernums.push(usernum);
                }
                cell.subgrid_model = Some(model_idx);
                cell.subgrid_usernums = usernums;
                // Every macro side of a coupled element becomes a multiscale
                // interior interface; the -1 boundary-set id is the neighbor
                // marker the flux path selects on.
                let (ne, nvars, nsides) = cell.sideinfo.dims();
                for e in 0..ne {
                    for v in 0..nvars {
                        for s in 0..nsides {
                            cell.sideinfo[(e, v, s)] = SideTag {
                                kind: SIDE_MULTISCALE,
                                bset: -1,
                                aux0: 0,
                                aux1: 0,
                            };
                        }
                    }
                }
            }
            // Macro boundary residuals are carried by the subgrid flux; the
            // macro side keeps only strong Dirichlet rows.
            assembler.boundary_cells[b].clear();

            info!(
                "multiscale block `{block_name}`: {} subgrid instances of {} elements",
                model.instances.len(),
                sub_ne
            );
            models.push(model);
        }

        Ok(Self { models })
    }

    /// Refreshes cost estimates; returns this rank's total cost. The min/max
    /// reduction and migration decision belong to the caller.
    pub fn update(&mut self) -> f64 {
        self.models.iter().map(|m| m.cost_estimate()).sum()
    }

    /// The macro-side entry point: packages the trace, runs the subgrid
    /// solver, and writes the projected flux into the macro workset residual.
    #[allow(clippy::too_many_arguments)]
    pub fn subgrid_contribution(
        &mut self,
        cell: &Cell,
        wkset: &mut Workset,
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        opts: &JacResOptions,
        seed: SeedWhat,
    ) -> Result<(), AssemblyError> {
        let model_idx = cell.subgrid_model.expect("cell carries a subgrid id");
        let model = &mut self.models[model_idx];

        // The mass block and discretized-parameter coupling stay on the
        // macro side; the subgrid contributes nothing to those passes.
        if matches!(seed, SeedWhat::SolutionDot | SeedWhat::DiscParams) {
            return Ok(());
        }

        let (_, nvars, nsides) = cell.sideinfo.dims();
        for e in 0..cell.num_elems {
            // Only elements whose sides carry the multiscale interior marker
            // (kind 4 with the -1 neighbor id) see a subgrid.
            let coupled = (0..nvars).any(|v| {
                (0..nsides).any(|s| {
                    let tag = cell.sideinfo[(e, v, s)];
                    tag.kind == SIDE_MULTISCALE && tag.bset == -1
                })
            });
            if !coupled {
                continue;
            }
            let usernum = cell.subgrid_usernums[e];
            let lambda: Vec<f64> = cell.local_u.row(e).to_vec();
            let macro_elem = cell.elem_ids[e];
            model
                .subgrid_solver(
                    usernum,
                    &lambda,
                    physics,
                    functions,
                    params,
                    opts,
                    seed,
                    wkset,
                    e,
                )
                .map_err(|source| AssemblyError::Subgrid {
                    macro_elem,
                    source,
                })?;
        }
        Ok(())
    }
}

impl SubgridModel {
    /// Runs the fine problem for the given trace and accumulates the mortar
    /// flux (with its requested sensitivities) into macro workset row `e`.
    #[allow(clippy::too_many_arguments)]
    fn subgrid_solver(
        &mut self,
        usernum: usize,
        lambda: &[f64],
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        opts: &JacResOptions,
        seed: SeedWhat,
        macro_wkset: &mut Workset,
        macro_e: usize,
    ) -> Result<(), SubgridError> {
        let n = self.instances[usernum].total_dofs;
        let time_steps = if opts.is_transient { self.time_steps } else { 1 };
        let macro_deltat = opts.deltat;
        let alpha_sub = if opts.is_transient {
            time_steps as f64 / macro_deltat
        } else {
            0.0
        };
        let fwt = 1.0 / time_steps as f64;

        // Sensitivity width of the requested chain rule.
        let width = match seed {
            SeedWhat::Solution => self.macro_ndof,
            SeedWhat::ActiveParams => params.num_active_params,
            _ => 0,
        };

        let mut prev_u = match self.instances[usernum]
            .storage
            .extract_previous(opts.time)
        {
            Some((state, _)) => state.clone(),
            None => DVector::zeros(n),
        };
        // du_prev/dx across substeps for the transient chain rule.
        let mut x_prev = DMatrix::zeros(n, width.max(1));

        let mut sgtime = opts.time - if opts.is_transient { macro_deltat } else { 0.0 };
        for _tstep in 0..time_steps {
            sgtime += if opts.is_transient {
                macro_deltat / time_steps as f64
            } else {
                0.0
            };

            self.sub_nonlinear_solver(
                usernum,
                lambda,
                physics,
                functions,
                params,
                sgtime,
                alpha_sub,
                opts.is_transient,
                &prev_u,
            )?;

            // Sensitivity of the subgrid state: one linear solve against the
            // factored subgrid Jacobian.
            let x = if width > 0 {
                let lambda_ad: Vec<Ad> = match seed {
                    SeedWhat::Solution => lambda
                        .iter()
                        .enumerate()
                        .map(|(j, &v)| seeded(width, j, v))
                        .collect(),
                    _ => lambda.iter().map(|&v| cst(v)).collect(),
                };
                let u = self.instances[usernum].u.clone();
                let u_dot: DVector<f64> = if opts.is_transient {
                    alpha_sub * (&u - &prev_u)
                } else {
                    DVector::zeros(n)
                };
                let u_loc =
                    Self::localize_values(&self.instances[usernum], &u, false, 0);
                let u_dot_loc =
                    Self::localize_values(&self.instances[usernum], &u_dot, false, 0);
                self.residual_pass(
                    usernum,
                    &u_loc,
                    &u_dot_loc,
                    &lambda_ad,
                    physics,
                    functions,
                    params,
                    sgtime,
                    alpha_sub,
                    opts.is_transient,
                )
                .map_err(|_| {
                    SubgridError::Nonlinear(NonlinearNonConvergence {
                        iterations: 0,
                        scaled_residual: f64::NAN,
                    })
                })?;
                let mut b = DMatrix::zeros(n, width);
                self.extract_sensitivity(usernum, width, &mut b);
                // J X = -dR/dx + alpha M X_prev; the mass term enters through
                // the BDF seeding of du/dt = alpha (u - u_prev).
                if opts.is_transient {
                    // dR/du_dot = M; chain of the previous substep state.
                    let m = self.mass_matrix(
                        usernum, &u, &u_dot, lambda, physics, functions, params, sgtime,
                        alpha_sub,
                    )?;
                    let xp = x_prev.columns(0, width).into_owned();
                    b -= (&m * &xp) * alpha_sub;
                }
                let factor = self.instances[usernum]
                    .factor
                    .as_ref()
                    .expect("factor cached by the nonlinear solve");
                let x = factor
                    .solve(&(-b))
                    .ok_or(SubgridError::Linear(
                        crate::error::LinearSolveError::SingularFactor { row: 0 },
                    ))?;
                x
            } else {
                DMatrix::zeros(n, 0)
            };

            // Flux pass: chain du_sub/dx into the same AD pipeline.
            self.update_flux(
                usernum,
                lambda,
                &x,
                width,
                seed,
                physics,
                functions,
                params,
                sgtime,
                alpha_sub,
                opts,
                macro_wkset,
                macro_e,
                fwt,
            )?;

            prev_u = self.instances[usernum].u.clone();
            if width > 0 {
                x_prev = x;
            }
        }

        if !opts.is_adjoint {
            let state = self.instances[usernum].u.clone();
            self.instances[usernum].storage.store(state, opts.time);
        }
        Ok(())
    }

    /// Assembles the subgrid mass matrix via the du/dt seeding.
    #[allow(clippy::too_many_arguments)]
    fn mass_matrix(
        &mut self,
        usernum: usize,
        u: &DVector<f64>,
        u_dot: &DVector<f64>,
        lambda: &[f64],
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        time: f64,
        alpha: f64,
    ) -> Result<DMatrix<f64>, SubgridError> {
        let n = self.instances[usernum].total_dofs;
        let ndof = self.instances[usernum].ndof_per_elem;
        let lambda_ad: Vec<Ad> = lambda.iter().map(|&v| cst(v)).collect();
        let u_loc = Self::localize_values(&self.instances[usernum], u, false, 0);
        let u_dot_loc = Self::localize_values(&self.instances[usernum], u_dot, true, ndof);
        self.residual_pass(
            usernum, &u_loc, &u_dot_loc, &lambda_ad, physics, functions, params, time, alpha,
            true,
        )
        .map_err(|_| {
            SubgridError::Nonlinear(NonlinearNonConvergence {
                iterations: 0,
                scaled_residual: f64::NAN,
            })
        })?;
        let mut m = DMatrix::zeros(n, n);
        let mut r = DVector::zeros(n);
        self.extract_global(usernum, ndof, &mut r, Some(&mut m));
        Ok(m)
    }

    /// Evaluates the outward flux on the macro-facing sides and projects it
    /// onto the macro basis through the mortar tables.
    #[allow(clippy::too_many_arguments)]
    fn update_flux(
        &mut self,
        usernum: usize,
        lambda: &[f64],
        x: &DMatrix<f64>,
        width: usize,
        seed: SeedWhat,
        physics: &[Physics],
        functions: &FunctionManager,
        params: &ParameterManager,
        time: f64,
        alpha: f64,
        opts: &JacResOptions,
        macro_wkset: &mut Workset,
        macro_e: usize,
        fwt: f64,
    ) -> Result<(), SubgridError> {
        let lambda_ad: Vec<Ad> = match seed {
            SeedWhat::Solution => lambda
                .iter()
                .enumerate()
                .map(|(j, &v)| seeded(width, j, v))
                .collect(),
            _ => lambda.iter().map(|&v| cst(v)).collect(),
        };
        let u = self.instances[usernum].u.clone();
        let u_ad: Vec<Ad> = if width > 0 {
            u.iter()
                .enumerate()
                .map(|(i, &v)| {
                    let row: Vec<f64> = (0..width).map(|c| x[(i, c)]).collect();
                    with_partials(v, &row)
                })
                .collect()
        } else {
            u.iter().map(|&v| cst(v)).collect()
        };

        let nvars = self.wkset.varlist.len();
        let nsides = self.disc.topo.num_sides();
        let ne = self.instances[usernum].ne;

        for side in 0..nsides {
            let any = (0..ne).any(|e| {
                (0..nvars).any(|v| self.instances[usernum].sideinfo[(e, v, side)].kind != 0)
            });
            if !any {
                continue;
            }

            {
                let instance = &self.instances[usernum];
                let wkset = &mut self.wkset;
                wkset.time = time;
                wkset.alpha = alpha;
                wkset.is_adjoint = opts.is_adjoint;
                wkset.update_volume(&instance.nodes, ne, &self.disc);
                wkset.update_side(&instance.nodes, ne, &self.disc, side);
                wkset.current_sideset = "interior".to_string();
                for e in 0..ne {
                    for v in 0..nvars {
                        for s in 0..nsides {
                            wkset.sideinfo[(e, v, s)] = instance.sideinfo[(e, v, s)];
                        }
                    }
                }
                let u_loc = Self::localize_ad(instance, &u_ad);
                wkset.compute_side_solution(&u_loc);
                for e in 0..ne {
                    for v in 0..nvars {
                        let table = &instance.mortar[side][v];
                        let (_, nb, nqs) = table.dims();
                        for k in 0..nqs {
                            let mut trace = cst(0.0);
                            for j in 0..nb {
                                let w = table[(e, j, k)];
                                if w != 0.0 {
                                    trace += lambda_ad[self.macro_offsets[v][j]].clone() * w;
                                }
                            }
                            wkset.local_aux_side[(e, v, k)] = trace;
                        }
                    }
                }
                wkset.reset_flux();
                for module in physics {
                    module
                        .compute_flux(wkset, functions, params)
                        .map_err(|_| {
                            SubgridError::Nonlinear(NonlinearNonConvergence {
                                iterations: 0,
                                scaled_residual: f64::NAN,
                            })
                        })?;
                }
            }

            // Projection onto the macro basis restricted to this side.
            let instance = &self.instances[usernum];
            for e in 0..ne {
                for v in 0..nvars {
                    if instance.sideinfo[(e, v, side)].kind == 0 {
                        continue;
                    }
                    let table = &instance.mortar[side][v];
                    let (_, nb, nqs) = table.dims();
                    for j in 0..nb {
                        let mut acc = cst(0.0);
                        for k in 0..nqs {
                            acc += self.wkset.flux[(e, v, k)].clone()
                                * (table[(e, j, k)] * self.wkset.wts_side[(e, k)] * fwt);
                        }
                        macro_wkset.res[(macro_e, self.macro_offsets[v][j])] += acc;
                    }
                }
            }
        }
        Ok(())
    }
}
