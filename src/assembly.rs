//! The assembly manager: traverses cells on each Newton step, invokes the
//! physics modules to fill AD residuals, and accumulates the global residual
//! and Jacobian in the ghosted layout. Strong Dirichlet rows are replaced
//! after the export to the owned layout.

use log::debug;
use nalgebra_sparse::CsrMatrix;

use crate::ad::{partials, SeedWhat};
use crate::cell::{
    seed_local, BoundaryCell, Cell, CellBuffers, CellSensor, GatherKind, JacResOptions,
    ObjectiveSpec,
};
use crate::discretization::{Discretization, LagrangeBasis};
use crate::dofs::DofManager;
use crate::error::{AssemblyError, ConsistencyError, SimError};
use crate::fields::Field3;
use crate::functions::FunctionManager;
use crate::linalg::{DistMultiVector, GhostedMatrix};
use crate::mesh::Mesh;
use crate::multiscale::MultiscaleManager;
use crate::params::ParameterManager;
use crate::physics::Physics;
use crate::settings::{ResponseType, SensorSetting, Settings};
use crate::workset::Workset;

#[derive(Debug)]
pub struct AssemblyManager {
    pub disc: Discretization,
    pub dofs: DofManager,
    pub cells: Vec<Vec<Cell>>,
    pub boundary_cells: Vec<Vec<BoundaryCell>>,
    pub worksets: Vec<Workset>,
    pub physics: Vec<Vec<Physics>>,
    pub buffers: Vec<CellBuffers>,
    pub objective: Option<ObjectiveSpec>,
}

impl AssemblyManager {
    /// Instantiates cells per block, binds each block's workset, and checks
    /// batch registration (index tables, AD capacity).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: &Settings,
        mesh: &Mesh,
        disc: Discretization,
        dofs: DofManager,
        physics: Vec<Vec<Physics>>,
        params: &ParameterManager,
    ) -> Result<Self, SimError> {
        let workset_size = settings.mesh.workset_size.max(1);
        let mut cells = Vec::new();
        let mut boundary_cells = Vec::new();
        let mut worksets = Vec::new();
        let mut buffers = Vec::new();

        for (b, mesh_block) in mesh.blocks.iter().enumerate() {
            let block_dofs = &dofs.blocks[b];
            let block_disc = &disc.blocks[b];
            let dim = mesh_block.dim();
            let ncorner = mesh_block.topo.num_corners();
            let ndof = block_dofs.ndof_per_elem;

            let (param_elem_gids, param_offsets, param_varlist, param_usebasis, param_ndof) =
                match params.dofs.as_ref() {
                    Some(pdofs) => {
                        let pb = &pdofs.blocks[b];
                        (
                            Some(&pb.elem_gids),
                            pb.offsets.clone(),
                            pb.vars.iter().map(|v| v.name.clone()).collect::<Vec<_>>(),
                            pb.vars.iter().map(|v| v.basis).collect::<Vec<_>>(),
                            pb.ndof_per_elem,
                        )
                    }
                    None => (None, Vec::new(), Vec::new(), Vec::new(), 0),
                };

            let make_nodes = |elems: &[usize]| -> Field3<f64> {
                let mut nodes = Field3::from_elem(elems.len(), ncorner, dim, 0.0);
                for (e, &elem) in elems.iter().enumerate() {
                    let coords = mesh_block.elem_corner_coords(elem);
                    for c in 0..ncorner {
                        for d in 0..dim {
                            nodes[(e, c, d)] = coords[c * dim + d];
                        }
                    }
                }
                nodes
            };
            let make_index = |gids: &[Vec<usize>]| -> Vec<Vec<usize>> {
                gids.iter()
                    .map(|row| {
                        row.iter()
                            .map(|&g| dofs.ghosted.lid(g).expect("ghosted map covers all gids"))
                            .collect()
                    })
                    .collect()
            };
            let make_param_index = |gids: &[Vec<usize>]| -> Vec<Vec<usize>> {
                match params.dofs.as_ref() {
                    Some(pdofs) => gids
                        .iter()
                        .map(|row| {
                            row.iter()
                                .map(|&g| pdofs.ghosted.lid(g).expect("param map covers all gids"))
                                .collect()
                        })
                        .collect(),
                    None => gids.iter().map(|_| Vec::new()).collect(),
                }
            };
            let make_sideinfo = |elems: &[usize]| -> Field3<crate::dofs::SideTag> {
                let (_, nvars, nsides) = block_dofs.side_info.dims();
                let mut out =
                    Field3::from_elem(elems.len(), nvars, nsides, crate::dofs::SideTag::default());
                for (e, &elem) in elems.iter().enumerate() {
                    for v in 0..nvars {
                        for s in 0..nsides {
                            out[(e, v, s)] = block_dofs.side_info[(elem, v, s)];
                        }
                    }
                }
                out
            };

            let mut block_cells = Vec::new();
            let all_elems: Vec<usize> = (0..mesh_block.num_elems).collect();
            for chunk in all_elems.chunks(workset_size) {
                let gids: Vec<Vec<usize>> = chunk
                    .iter()
                    .map(|&e| block_dofs.elem_gids[e].clone())
                    .collect();
                let pgids: Vec<Vec<usize>> = match param_elem_gids {
                    Some(pg) => chunk.iter().map(|&e| pg[e].clone()).collect(),
                    None => chunk.iter().map(|_| Vec::new()).collect(),
                };
                let index = make_index(&gids);
                let pindex = make_param_index(&pgids);
                let cell = Cell::new(
                    b,
                    chunk.to_vec(),
                    make_nodes(chunk),
                    gids,
                    index,
                    pgids,
                    pindex,
                    make_sideinfo(chunk),
                    ndof,
                    param_ndof,
                );
                cell.register(ndof, settings.solver.max_derivs, params.num_active_params)?;
                block_cells.push(cell);
            }

            let mut block_bcells = Vec::new();
            for side_set in &mesh_block.side_sets {
                // Group by local side so one batch shares its side tables.
                let nsides = mesh_block.topo.num_sides();
                for side in 0..nsides {
                    let elems: Vec<usize> = side_set
                        .entries
                        .iter()
                        .filter(|&&(_, s)| s == side)
                        .map(|&(e, _)| e)
                        .collect();
                    if elems.is_empty() {
                        continue;
                    }
                    for chunk in elems.chunks(workset_size) {
                        let gids: Vec<Vec<usize>> = chunk
                            .iter()
                            .map(|&e| block_dofs.elem_gids[e].clone())
                            .collect();
                        let pgids: Vec<Vec<usize>> = match param_elem_gids {
                            Some(pg) => chunk.iter().map(|&e| pg[e].clone()).collect(),
                            None => chunk.iter().map(|_| Vec::new()).collect(),
                        };
                        let index = make_index(&gids);
                        let pindex = make_param_index(&pgids);
                        block_bcells.push(BoundaryCell::new(
                            b,
                            chunk.to_vec(),
                            side,
                            side_set.name.clone(),
                            make_nodes(chunk),
                            gids,
                            index,
                            pgids,
                            pindex,
                            make_sideinfo(chunk),
                            ndof,
                            param_ndof,
                        ));
                    }
                }
            }

            let varlist: Vec<String> = block_dofs.vars.iter().map(|v| v.name.clone()).collect();
            let usebasis: Vec<usize> = block_dofs.vars.iter().map(|v| v.basis).collect();
            worksets.push(Workset::new(
                b,
                workset_size,
                block_disc,
                varlist,
                usebasis,
                block_dofs.offsets.clone(),
                param_varlist,
                param_usebasis,
                param_offsets,
                mesh_block.topo.num_sides(),
            ));
            buffers.push(CellBuffers::new(
                workset_size,
                ndof,
                params.num_active_params.max(1),
                param_ndof,
            ));
            cells.push(block_cells);
            boundary_cells.push(block_bcells);
        }

        Ok(Self {
            disc,
            dofs,
            cells,
            boundary_cells,
            worksets,
            physics,
            buffers,
            objective: None,
        })
    }

    /// Locates pointwise sensors in the structured blocks and stores their
    /// basis evaluations on the owning cells.
    pub fn attach_sensors(
        &mut self,
        mesh: &Mesh,
        sensors: &[SensorSetting],
        response_var: &str,
        workset_size: usize,
    ) -> Result<(), SimError> {
        for sensor in sensors {
            let mut placed = false;
            for (b, mesh_block) in mesh.blocks.iter().enumerate() {
                let dim = mesh_block.dim();
                let inside = (0..dim).all(|d| {
                    sensor.point[d] >= mesh_block.lower[d] - 1e-12
                        && sensor.point[d] <= mesh_block.upper[d] + 1e-12
                });
                if !inside {
                    continue;
                }
                let Some(var) = self.dofs.blocks[b].var_index(response_var) else {
                    continue;
                };
                let mut eidx = [0usize; 3];
                let mut xi = [0.0f64; 3];
                for d in 0..dim {
                    let n = mesh_block.divisions[d];
                    let h = (mesh_block.upper[d] - mesh_block.lower[d]) / n as f64;
                    let frac = (sensor.point[d] - mesh_block.lower[d]) / h;
                    let i = (frac.floor() as usize).min(n - 1);
                    eidx[d] = i;
                    xi[d] = 2.0 * (frac - i as f64) - 1.0;
                }
                let elem = eidx[0]
                    + mesh_block.divisions[0]
                        * (eidx[1] + mesh_block.divisions[1] * eidx[2]);
                let order = self.dofs.blocks[b].vars[var].order;
                let basis = LagrangeBasis::new(mesh_block.topo, order);
                let mut vals = vec![0.0; basis.num_basis()];
                basis.eval(&xi, &mut vals);

                let batch = elem / workset_size;
                let in_batch = elem % workset_size;
                self.cells[b][batch].sensors.push(CellSensor {
                    elem: in_batch,
                    var,
                    value: sensor.value,
                    basis: vals,
                });
                placed = true;
                break;
            }
            if !placed {
                return Err(ConsistencyError::BadParameter {
                    name: "postprocess.sensors".to_string(),
                    reason: format!("sensor at {:?} lies outside every block", sensor.point),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Gathers a global vector into every cell of a block.
    pub fn perform_gather(
        &mut self,
        block: usize,
        kind: GatherKind,
        x: &DistMultiVector,
        col: usize,
    ) {
        for cell in &mut self.cells[block] {
            cell.gather(kind, x, col);
        }
        for bcell in &mut self.boundary_cells[block] {
            bcell.gather(kind, x, col);
        }
    }

    /// One full traversal: residual into `res_over` (ghosted), Jacobian or
    /// sensitivity blocks into `j_over`.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble_jac_res(
        &mut self,
        u: &DistMultiVector,
        u_dot: &DistMultiVector,
        phi: &DistMultiVector,
        phi_dot: &DistMultiVector,
        opts: &JacResOptions,
        res_over: &mut DistMultiVector,
        j_over: &mut GhostedMatrix,
        functions: &FunctionManager,
        params: &ParameterManager,
        multiscale: &mut Option<MultiscaleManager>,
        store_adj_prev: bool,
    ) -> Result<(), AssemblyError> {
        let num_blocks = self.cells.len();
        for b in 0..num_blocks {
            let ndof = self.dofs.blocks[b].ndof_per_elem;

            for ci in 0..self.cells[b].len() {
                {
                    let cell = &mut self.cells[b][ci];
                    cell.gather(GatherKind::Solution, u, 0);
                    cell.gather(GatherKind::SolutionDot, u_dot, 0);
                    if opts.is_adjoint {
                        cell.gather(GatherKind::Adjoint, phi, 0);
                        cell.gather(GatherKind::AdjointDot, phi_dot, 0);
                    }
                    if let Some(psol) = params.psol.as_ref() {
                        cell.gather(GatherKind::Param, psol, 0);
                    }
                }
                let cell = &self.cells[b][ci];
                let wkset = &mut self.worksets[b];
                let buffers = &mut self.buffers[b];
                cell.compute_jac_res(
                    wkset,
                    &self.disc.blocks[b],
                    &self.physics[b],
                    functions,
                    params,
                    buffers,
                    opts,
                    multiscale.as_mut(),
                )?;

                if opts.is_adjoint && opts.build_jacobian {
                    cell.build_adjoint_residual(buffers, opts.alpha, ndof);
                    if self.objective.is_some() {
                        add_objective_du(cell, wkset, buffers, functions, params, self.objective.as_ref().unwrap())?;
                    }
                }

                scatter_cell(
                    &cell.gids,
                    &cell.param_gids,
                    cell.num_elems,
                    buffers,
                    opts,
                    ndof,
                    res_over,
                    j_over,
                );

                if store_adj_prev {
                    let buffers = &self.buffers[b];
                    self.cells[b][ci].store_adj_prev(buffers, opts.alpha, ndof);
                }
            }

            for bi in 0..self.boundary_cells[b].len() {
                {
                    let bcell = &mut self.boundary_cells[b][bi];
                    bcell.gather(GatherKind::Solution, u, 0);
                    bcell.gather(GatherKind::SolutionDot, u_dot, 0);
                    if opts.is_adjoint {
                        bcell.gather(GatherKind::Adjoint, phi, 0);
                        bcell.gather(GatherKind::AdjointDot, phi_dot, 0);
                    }
                    if let Some(psol) = params.psol.as_ref() {
                        bcell.gather(GatherKind::Param, psol, 0);
                    }
                }
                let bcell = &self.boundary_cells[b][bi];
                let wkset = &mut self.worksets[b];
                let buffers = &mut self.buffers[b];
                bcell.compute_jac_res(
                    wkset,
                    &self.disc.blocks[b],
                    &self.physics[b],
                    functions,
                    params,
                    buffers,
                    opts,
                )?;
                if opts.is_adjoint && opts.build_jacobian {
                    bcell.build_adjoint_residual(buffers, ndof);
                }
                scatter_cell(
                    &bcell.gids,
                    &bcell.param_gids,
                    bcell.num_elems,
                    buffers,
                    opts,
                    ndof,
                    res_over,
                    j_over,
                );
            }
        }
        debug!(
            "assembled residual (adjoint: {}, jacobian: {}, {} matrix entries)",
            opts.is_adjoint,
            opts.build_jacobian,
            j_over.nnz_inserted()
        );
        Ok(())
    }

    /// Replaces strong Dirichlet rows of the owned system: residual zeroed,
    /// Jacobian row replaced with the identity.
    pub fn apply_strong_dirichlet(&self, j: &mut CsrMatrix<f64>, res: &mut DistMultiVector) {
        for &row in &self.dofs.dirichlet_rows {
            let mut r = j.row_mut(row);
            let (cols, vals) = r.cols_and_values_mut();
            for (c, v) in cols.iter().zip(vals.iter_mut()) {
                *v = if *c == row { 1.0 } else { 0.0 };
            }
            for col in 0..res.ncols() {
                res.values[(row, col)] = 0.0;
            }
        }
    }

    /// Zeroes strong Dirichlet rows of an exported residual/sensitivity
    /// multivector (those rows carry no physics).
    pub fn zero_dirichlet_rows(&self, res: &mut DistMultiVector) {
        for &row in &self.dofs.dirichlet_rows {
            for col in 0..res.ncols() {
                res.values[(row, col)] = 0.0;
            }
        }
    }

    pub fn reset_adj_prev(&mut self) {
        for block_cells in &mut self.cells {
            for cell in block_cells {
                cell.reset_adj_prev();
            }
        }
    }

    /// Rebuilds every cell's node array from the (possibly displaced) mesh.
    pub fn refresh_nodes(&mut self, mesh: &Mesh) {
        for (b, mesh_block) in mesh.blocks.iter().enumerate() {
            let dim = mesh_block.dim();
            let ncorner = mesh_block.topo.num_corners();
            for cell in &mut self.cells[b] {
                for (e, &elem) in cell.elem_ids.iter().enumerate() {
                    let coords = mesh_block.elem_corner_coords(elem);
                    for c in 0..ncorner {
                        for d in 0..dim {
                            cell.nodes[(e, c, d)] = coords[c * dim + d];
                        }
                    }
                }
            }
            for bcell in &mut self.boundary_cells[b] {
                for (e, &elem) in bcell.elem_ids.iter().enumerate() {
                    let coords = mesh_block.elem_corner_coords(elem);
                    for c in 0..ncorner {
                        for d in 0..dim {
                            bcell.nodes[(e, c, d)] = coords[c * dim + d];
                        }
                    }
                }
            }
        }
    }
}

/// Adds the objective's solution derivative G_u to the adjoint residual.
fn add_objective_du(
    cell: &Cell,
    wkset: &mut Workset,
    buffers: &mut CellBuffers,
    functions: &FunctionManager,
    params: &ParameterManager,
    spec: &ObjectiveSpec,
) -> Result<(), AssemblyError> {
    let ne = cell.num_elems;
    let ndof = wkset.ndof;
    let u_ad = seed_local(&cell.local_u, ne, ndof, true, ndof);
    wkset.seed = SeedWhat::Solution;
    wkset.seed_width = ndof;
    wkset.compute_vol_solution(&u_ad, None);
    if !wkset.param_varlist.is_empty() {
        let p_ad = seed_local(&cell.local_params, ne, cell.local_params.ncols(), false, ndof);
        wkset.compute_vol_params(&p_ad);
    }

    match spec.response_type {
        ResponseType::Global => {
            let obj = cell.compute_objective(wkset, functions, params, spec)?;
            for e in 0..ne {
                for k in 0..wkset.nqp {
                    let d = partials(&obj[(e, k)], ndof);
                    for i in 0..ndof {
                        buffers.local_res[(e, i, 0)] += d[i];
                    }
                }
            }
        }
        ResponseType::Pointwise => {
            let contributions = cell.compute_sensor_objective(&u_ad, &wkset.offsets);
            for (s, value) in cell.sensors.iter().zip(contributions) {
                let d = partials(&value, ndof);
                for i in 0..ndof {
                    buffers.local_res[(s.elem, i, 0)] += d[i];
                }
            }
        }
    }
    Ok(())
}

/// Scatters one batch's extracted blocks into the ghosted residual and matrix
/// with a single batched insertion per row.
#[allow(clippy::too_many_arguments)]
fn scatter_cell(
    gids: &[Vec<usize>],
    param_gids: &[Vec<usize>],
    num_elems: usize,
    buffers: &CellBuffers,
    opts: &JacResOptions,
    ndof: usize,
    res_over: &mut DistMultiVector,
    j_over: &mut GhostedMatrix,
) {
    let res_cols = if opts.seed_params {
        opts.num_active_params
    } else {
        1
    };
    let mut vals = vec![0.0; ndof];

    for e in 0..num_elems {
        for i in 0..ndof {
            let row = gids[e][i];
            let lid = res_over
                .map()
                .lid(row)
                .expect("residual map covers assembled rows");
            for col in 0..res_cols {
                res_over.values[(lid, col)] += buffers.local_res[(e, i, col)];
            }
        }

        if opts.disc_sens {
            // Rectangular dR/dp scattered with parameter dofs as rows.
            let pdofs = param_gids[e].len();
            let mut pvals = vec![0.0; ndof];
            for j in 0..pdofs {
                for (i, v) in pvals.iter_mut().enumerate() {
                    *v = buffers.local_drdp[(e, i, j)];
                }
                j_over.sum_into_global(param_gids[e][j], &gids[e], &pvals);
            }
        } else if opts.build_jacobian && !opts.seed_params {
            for i in 0..ndof {
                let row = gids[e][i];
                for (j, v) in vals.iter_mut().enumerate() {
                    *v = if opts.is_adjoint {
                        // Transpose of the forward linearization.
                        buffers.local_j[(e, j, i)] + opts.alpha * buffers.local_jdot[(e, j, i)]
                    } else {
                        buffers.local_j[(e, i, j)] + opts.alpha * buffers.local_jdot[(e, i, j)]
                    };
                }
                j_over.sum_into_global(row, &gids[e], &vals);
            }
        }
    }
}
