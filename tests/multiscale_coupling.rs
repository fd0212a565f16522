//! Mortar multiscale coupling: with the subgrid physics identical to the
//! macro physics and a single trivial subgrid element per macro element, the
//! macro system must coincide with the one assembled without the coupling.

mod common;

use common::*;
use msfem::settings::SolverKind;
use msfem::Solver;

fn laplace_settings(dim: usize, n: usize, multiscale: bool) -> msfem::Settings {
    let mut settings = base_settings(dim, n);
    strong_dirichlet_everywhere(&mut settings, "x");
    if multiscale {
        settings.multiscale.enabled = true;
        settings.multiscale.blocks = vec!["eblock".to_string()];
        settings.multiscale.refine = 1;
        settings.multiscale.time_steps = 1;
    }
    settings
}

fn nodal_values(solver: &Solver, u: &msfem::linalg::DistMultiVector) -> Vec<(f64, f64)> {
    let block = &solver.assembler.dofs.blocks[0];
    let lattice = &block.lattices[0];
    let dim = solver.mesh.dim;
    (0..lattice.num_nodes)
        .map(|node| {
            let x = lattice.node_coord(node, dim)[0];
            let lid = solver
                .assembler
                .dofs
                .ghosted
                .lid(block.var_base[0] + node)
                .unwrap();
            (x, u.values[(lid, 0)])
        })
        .collect()
}

/// 1-D: two macro elements, each with a single-element subgrid. The macro
/// Jacobian and residual coincide with the direct assembly entry for entry.
#[test]
fn trivial_subgrid_reproduces_direct_system_1d() {
    let mut direct = Solver::new(laplace_settings(1, 2, false)).unwrap();
    let mut mortar = Solver::new(laplace_settings(1, 2, true)).unwrap();

    // A common linear state.
    let mut u = direct.blank_state();
    let block = &direct.assembler.dofs.blocks[0];
    for node in 0..block.lattices[0].num_nodes {
        let x = block.lattices[0].node_coord(node, 1)[0];
        let lid = direct
            .assembler
            .dofs
            .ghosted
            .lid(block.var_base[0] + node)
            .unwrap();
        u.values[(lid, 0)] = x;
    }
    let u_dot = direct.blank_state();
    let phi = direct.blank_state();

    let (j_direct, r_direct) = direct
        .assemble_system(&u, &u_dot, &phi.clone(), &phi, 0.0, 1.0)
        .unwrap();
    let (j_mortar, r_mortar) = mortar
        .assemble_system(&u, &u_dot, &phi.clone(), &phi, 0.0, 1.0)
        .unwrap();

    let n = j_direct.nrows();
    for row in 0..n {
        assert!(
            (r_direct.values[(row, 0)] - r_mortar.values[(row, 0)]).abs() < 1e-12,
            "residual row {row}: direct {} vs mortar {}",
            r_direct.values[(row, 0)],
            r_mortar.values[(row, 0)]
        );
        for col in 0..n {
            let d = j_direct.get_entry(row, col).map_or(0.0, |e| e.into_value());
            let m = j_mortar.get_entry(row, col).map_or(0.0, |e| e.into_value());
            assert!(
                (d - m).abs() < 1e-12,
                "jacobian ({row},{col}): direct {d} vs mortar {m}"
            );
        }
    }
}

/// 2-D: the mortar solve reproduces the direct solution of the Laplace
/// problem with u = x to machine precision.
#[test]
fn trivial_subgrid_reproduces_direct_solution_2d() {
    let mut direct = Solver::new(laplace_settings(2, 2, false)).unwrap();
    let (d_soln, _) = direct.forward_model().unwrap();

    let mut mortar = Solver::new(laplace_settings(2, 2, true)).unwrap();
    let (m_soln, _) = mortar.forward_model().unwrap();

    let d_values = nodal_values(&direct, d_soln.last().unwrap());
    let m_values = nodal_values(&mortar, m_soln.last().unwrap());
    for ((x, d), (_, m)) in d_values.iter().zip(&m_values) {
        assert!(
            (d - m).abs() < 1e-12,
            "node at x = {x}: direct {d} vs mortar {m}"
        );
        assert!((d - x).abs() < 1e-12, "direct solution should equal x");
    }
}

/// The load-balancing hook reports element count times substeps.
#[test]
fn cost_estimate_counts_elements_and_substeps() {
    let mut settings = laplace_settings(2, 2, true);
    settings.multiscale.refine = 2;
    settings.multiscale.time_steps = 3;
    let solver = Solver::new(settings).unwrap();
    let ms = solver.multiscale.as_ref().unwrap();
    // Four macro elements, each with a 2x2 subgrid, three substeps.
    assert_eq!(ms.models.len(), 1);
    assert_eq!(ms.models[0].cost_estimate(), (4 * 3) as f64 * 4.0);
}

/// A refined subgrid still produces a solvable, consistent macro system for
/// a problem whose exact solution is linear.
#[test]
fn refined_subgrid_solves_linear_problem_exactly() {
    let mut settings = laplace_settings(1, 2, true);
    settings.multiscale.refine = 3;
    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    for (x, v) in nodal_values(&solver, f_soln.last().unwrap()) {
        assert!((v - x).abs() < 1e-8, "node at x = {x}: got {v}");
    }
}

/// Transient multiscale runs through the substepping machinery.
#[test]
fn transient_multiscale_smoke() {
    let mut settings = laplace_settings(1, 2, true);
    settings.solver.solver = SolverKind::Transient;
    settings.solver.num_steps = 3;
    settings.solver.final_time = 0.3;
    settings.multiscale.time_steps = 2;
    settings
        .physics
        .initial
        .insert("e".to_string(), "x".to_string());
    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    assert_eq!(f_soln.len(), 4);
    // Substepped subgrid solves stay bounded and finite.
    for (_, v) in nodal_values(&solver, f_soln.last().unwrap()) {
        assert!(v.is_finite() && v.abs() < 10.0);
    }
}
