//! Postprocessing: objective/response evaluation with explicit parameter
//! derivatives, error norms against reference solutions, and the plain-text
//! gradient/solution writers.

use std::io::Write;
use std::path::Path;

use log::info;

use crate::ad::{cst, partials, seeded, val, Ad, SeedWhat};
use crate::assembly::AssemblyManager;
use crate::cell::{GatherKind, ObjectiveSpec};
use crate::error::SimError;
use crate::fields::Field2;
use crate::functions::FunctionManager;
use crate::linalg::DistMultiVector;
use crate::params::ParameterManager;
use crate::settings::{ParameterUsage, PostprocessSettings, ResponseType};

/// An objective value with its explicit derivative with respect to all
/// optimization parameters (actives first, then discretized field DOFs).
#[derive(Debug, Clone)]
pub struct ObjectiveValue {
    pub value: f64,
    pub gradient: Vec<f64>,
}

/// Evaluates the objective functional at one state: response quadrature (or
/// sensor misfits), plus the configured regularization terms, with parameter
/// seeding supplying dJ/dtheta and dJ/dp.
pub fn compute_objective(
    assembler: &mut AssemblyManager,
    functions: &FunctionManager,
    params: &mut ParameterManager,
    cfg: &PostprocessSettings,
    u: &DistMultiVector,
    time: f64,
) -> Result<ObjectiveValue, SimError> {
    let spec = assembler.objective.clone().unwrap_or(ObjectiveSpec {
        response_type: cfg.response_type,
        form: cfg.objective_form,
    });
    let num_active = params.num_active_params;
    let num_disc = params.num_params(ParameterUsage::Discretized);
    let mut value = 0.0;
    let mut gradient = vec![0.0; num_active + num_disc];

    let num_blocks = assembler.cells.len();
    for b in 0..num_blocks {
        let param_ndof = params.param_ndof_per_elem(b);
        let width = num_active + param_ndof;
        params.sacadoize_with(true, width.max(1));

        let domain_terms: Vec<_> = params
            .regularization
            .iter()
            .filter(|t| t.side_set.is_none())
            .map(|t| (t.field, t.kind, t.constant))
            .collect();

        for ci in 0..assembler.cells[b].len() {
            {
                let cell = &mut assembler.cells[b][ci];
                cell.gather(GatherKind::Solution, u, 0);
                if let Some(psol) = params.psol.as_ref() {
                    cell.gather(GatherKind::Param, psol, 0);
                }
            }
            let cell = &assembler.cells[b][ci];
            let wkset = &mut assembler.worksets[b];
            wkset.time = time;
            wkset.seed = SeedWhat::ActiveParams;
            wkset.seed_width = width;
            wkset.update_volume(&cell.nodes, cell.num_elems, &assembler.disc.blocks[b]);

            let u_ad = plain_local(&cell.local_u, cell.num_elems, wkset.ndof);
            wkset.compute_vol_solution(&u_ad, None);
            if !wkset.param_varlist.is_empty() {
                let p_ad = seed_local_offset(
                    &cell.local_params,
                    cell.num_elems,
                    cell.local_params.ncols(),
                    width,
                    num_active,
                );
                wkset.compute_vol_params(&p_ad);
            }

            match spec.response_type {
                ResponseType::Global => {
                    let obj = cell.compute_objective(wkset, functions, params, &spec)?;
                    for e in 0..cell.num_elems {
                        for k in 0..wkset.nqp {
                            accumulate(
                                &obj[(e, k)],
                                width,
                                num_active,
                                &cell.param_gids[e],
                                &mut value,
                                &mut gradient,
                            );
                        }
                    }
                }
                ResponseType::Pointwise => {
                    let contributions = cell.compute_sensor_objective(&u_ad, &wkset.offsets);
                    for (s, contrib) in cell.sensors.iter().zip(&contributions) {
                        accumulate(
                            contrib,
                            width,
                            num_active,
                            &cell.param_gids[s.elem],
                            &mut value,
                            &mut gradient,
                        );
                    }
                }
            }

            if !domain_terms.is_empty() {
                let reg = cell.compute_domain_regularization(wkset, &domain_terms);
                for (e, contrib) in reg.iter().enumerate() {
                    accumulate(
                        contrib,
                        width,
                        num_active,
                        &cell.param_gids[e],
                        &mut value,
                        &mut gradient,
                    );
                }
            }
        }

        // Boundary-localized regularization runs over the matching side sets.
        let boundary_terms: Vec<_> = params
            .regularization
            .iter()
            .filter_map(|t| {
                t.side_set
                    .as_ref()
                    .map(|s| (s.clone(), (t.field, t.kind, t.constant)))
            })
            .collect();
        if !boundary_terms.is_empty() {
            for bi in 0..assembler.boundary_cells[b].len() {
                let sideset = assembler.boundary_cells[b][bi].sideset.clone();
                let terms: Vec<_> = boundary_terms
                    .iter()
                    .filter(|(s, _)| s == &sideset)
                    .map(|(_, t)| *t)
                    .collect();
                if terms.is_empty() {
                    continue;
                }
                {
                    let bcell = &mut assembler.boundary_cells[b][bi];
                    bcell.gather(GatherKind::Solution, u, 0);
                    if let Some(psol) = params.psol.as_ref() {
                        bcell.gather(GatherKind::Param, psol, 0);
                    }
                }
                let bcell = &assembler.boundary_cells[b][bi];
                let wkset = &mut assembler.worksets[b];
                wkset.time = time;
                wkset.update_volume(&bcell.nodes, bcell.num_elems, &assembler.disc.blocks[b]);
                wkset.update_side(
                    &bcell.nodes,
                    bcell.num_elems,
                    &assembler.disc.blocks[b],
                    bcell.side,
                );
                let p_ad = seed_local_offset(
                    &bcell.local_params,
                    bcell.num_elems,
                    bcell.local_params.ncols(),
                    width,
                    num_active,
                );
                wkset.compute_side_params(&p_ad);
                let reg = bcell.compute_boundary_regularization(wkset, &terms);
                for (e, contrib) in reg.iter().enumerate() {
                    accumulate(
                        contrib,
                        width,
                        num_active,
                        &bcell.param_gids[e],
                        &mut value,
                        &mut gradient,
                    );
                }
            }
        }
    }

    params.sacadoize_params(false);
    Ok(ObjectiveValue { value, gradient })
}

fn accumulate(
    contrib: &Ad,
    width: usize,
    num_active: usize,
    param_gids: &[usize],
    value: &mut f64,
    gradient: &mut [f64],
) {
    *value += val(contrib);
    if width == 0 {
        return;
    }
    let d = partials(contrib, width);
    for p in 0..num_active {
        gradient[p] += d[p];
    }
    for (j, &gid) in param_gids.iter().enumerate() {
        if num_active + j < width {
            gradient[num_active + gid] += d[num_active + j];
        }
    }
}

fn plain_local(values: &Field2<f64>, ne: usize, ncols: usize) -> Field2<Ad> {
    let mut out = Field2::from_elem(ne, ncols, cst(0.0));
    for e in 0..ne {
        for j in 0..ncols {
            out[(e, j)] = cst(values[(e, j)]);
        }
    }
    out
}

fn seed_local_offset(
    values: &Field2<f64>,
    ne: usize,
    ncols: usize,
    width: usize,
    offset: usize,
) -> Field2<Ad> {
    let mut out = Field2::from_elem(ne, ncols, cst(0.0));
    for e in 0..ne {
        for j in 0..ncols {
            out[(e, j)] = if offset + j < width {
                seeded(width, offset + j, values[(e, j)])
            } else {
                cst(values[(e, j)])
            };
        }
    }
    out
}

/// L2 and H1-seminorm errors of variable `var` against reference closures.
pub fn compute_error(
    assembler: &mut AssemblyManager,
    u: &DistMultiVector,
    var: &str,
    time: f64,
    exact: &dyn Fn(&[f64; 3], f64) -> f64,
    exact_grad: Option<&dyn Fn(&[f64; 3], f64) -> [f64; 3]>,
) -> (f64, f64) {
    let mut l2_sq = 0.0;
    let mut h1_sq = 0.0;
    let num_blocks = assembler.cells.len();
    for b in 0..num_blocks {
        let Some(v) = assembler.dofs.blocks[b].var_index(var) else {
            continue;
        };
        for ci in 0..assembler.cells[b].len() {
            assembler.cells[b][ci].gather(GatherKind::Solution, u, 0);
            let cell = &assembler.cells[b][ci];
            let wkset = &mut assembler.worksets[b];
            wkset.update_volume(&cell.nodes, cell.num_elems, &assembler.disc.blocks[b]);
            let u_ad = plain_local(&cell.local_u, cell.num_elems, wkset.ndof);
            wkset.compute_vol_solution(&u_ad, None);
            for e in 0..cell.num_elems {
                for k in 0..wkset.nqp {
                    let w = wkset.wts[(e, k)];
                    let mut x = [0.0; 3];
                    for d in 0..wkset.dim {
                        x[d] = wkset.ip[(e, k, d)];
                    }
                    let diff = val(&wkset.local_soln[(e, v, k)]) - exact(&x, time);
                    l2_sq += w * diff * diff;
                    if let Some(grad) = exact_grad {
                        let g = grad(&x, time);
                        for d in 0..wkset.dim {
                            let gdiff = val(&wkset.local_soln_grad[(e, v, k, d)]) - g[d];
                            h1_sq += w * gdiff * gdiff;
                        }
                    }
                }
            }
        }
    }
    (l2_sq.sqrt(), h1_sq.sqrt())
}

/// Writes the gradient as one line of space-separated values with 16-digit
/// precision.
pub fn write_gradient(path: &Path, gradient: &[f64]) -> Result<(), SimError> {
    let mut file = std::fs::File::create(path)?;
    for g in gradient {
        write!(file, "{g:.16e}  ")?;
    }
    writeln!(file)?;
    info!("wrote {} sensitivities to {}", gradient.len(), path.display());
    Ok(())
}

/// CSV export of the nodal solution values per block and variable.
pub fn write_solution(
    path: &Path,
    assembler: &AssemblyManager,
    u: &DistMultiVector,
    dim: usize,
) -> Result<(), SimError> {
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "block,variable,node,x,y,z,value")?;
    for (b, block) in assembler.dofs.blocks.iter().enumerate() {
        for (v, var) in block.vars.iter().enumerate() {
            let lattice = &block.lattices[v];
            for node in 0..lattice.num_nodes {
                let gid = block.var_base[v] + node;
                let lid = assembler.dofs.ghosted.lid(gid).unwrap();
                let c = lattice.node_coord(node, dim);
                writeln!(
                    file,
                    "{b},{},{node},{},{},{},{:.16e}",
                    var.name,
                    c.first().copied().unwrap_or(0.0),
                    c.get(1).copied().unwrap_or(0.0),
                    c.get(2).copied().unwrap_or(0.0),
                    u.values[(lid, 0)]
                )?;
            }
        }
    }
    Ok(())
}
