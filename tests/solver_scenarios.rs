//! End-to-end forward, adjoint and sensitivity scenarios.

mod common;

use common::*;
use msfem::settings::{ObjectiveForm, ParameterUsage, PreconditionerKind, SolverKind};
use msfem::Solver;

/// Steady 2-D Laplace on the unit square with u = x imposed strongly on all
/// sides reproduces the linear exact solution at the nodes, a vanishing
/// misfit objective, and a zero gradient with respect to the diffusivity.
#[test]
fn steady_laplace_reproduces_linear_solution() {
    let mut settings = base_settings(2, 4);
    settings
        .functions
        .insert("thermal diffusion".to_string(), "kappa".to_string());
    settings.parameters.push(active_scalar("kappa", 1.0));
    strong_dirichlet_everywhere(&mut settings, "x");
    global_objective(&mut settings, ObjectiveForm::Misfit, "e", "x");

    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, objective) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap();

    let block = &solver.assembler.dofs.blocks[0];
    let lattice = &block.lattices[0];
    for node in 0..lattice.num_nodes {
        let x = lattice.node_coord(node, 2)[0];
        let lid = solver.assembler.dofs.ghosted.lid(block.var_base[0] + node).unwrap();
        assert!(
            (u.values[(lid, 0)] - x).abs() < 1e-12,
            "node {node}: u = {}, x = {x}",
            u.values[(lid, 0)]
        );
    }

    let objective = objective.unwrap();
    assert!(objective.value.abs() < 1e-20, "objective {}", objective.value);

    let (_a_soln, gradient) = solver.adjoint_model(&f_soln).unwrap();
    assert_eq!(gradient.len(), 1);
    assert!(gradient[0].abs() < 1e-10, "dJ/dkappa = {}", gradient[0]);
}

/// The same problem through the Krylov path: restarted GMRES with the ILU
/// preconditioner must agree with the direct factorization.
#[test]
fn gmres_with_ilu_matches_direct_solve() {
    let mut settings = base_settings(2, 6);
    settings.functions.insert("thermal source".to_string(), "1.0".to_string());
    strong_dirichlet_everywhere(&mut settings, "0.0");
    settings.solver.use_direct = false;
    settings.solver.preconditioner.kind = PreconditionerKind::Ilu;
    settings.solver.lin_tol = 1e-13;

    let mut krylov = Solver::new(settings.clone()).unwrap();
    let (k_soln, _) = krylov.forward_model().unwrap();

    settings.solver.use_direct = true;
    let mut direct = Solver::new(settings).unwrap();
    let (d_soln, _) = direct.forward_model().unwrap();

    let ku = k_soln.last().unwrap();
    let du = d_soln.last().unwrap();
    for i in 0..ku.num_local() {
        assert!(
            (ku.values[(i, 0)] - du.values[(i, 0)]).abs() < 1e-9,
            "dof {i}: krylov {} vs direct {}",
            ku.values[(i, 0)],
            du.values[(i, 0)]
        );
    }
}

/// Transient 1-D heat: u(0, x) = sin(pi x) with homogeneous Dirichlet data
/// decays to exp(-pi^2 t) sin(pi x); BDF-1 with dt = 0.01 must track the
/// final time within 5e-3.
#[test]
fn transient_heat_matches_separated_solution() {
    let mut settings = base_settings(1, 32);
    settings.solver.solver = SolverKind::Transient;
    settings.solver.num_steps = 100;
    settings.solver.final_time = 1.0;
    settings.solver.time_order = 1;
    settings
        .physics
        .initial
        .insert("e".to_string(), "sin(pi*x)".to_string());
    strong_dirichlet_everywhere(&mut settings, "0.0");

    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap();

    let decay = (-std::f64::consts::PI * std::f64::consts::PI).exp();
    let block = &solver.assembler.dofs.blocks[0];
    let lattice = &block.lattices[0];
    let mut max_err = 0.0f64;
    for node in 0..lattice.num_nodes {
        let x = lattice.node_coord(node, 1)[0];
        let exact = decay * (std::f64::consts::PI * x).sin();
        let lid = solver.assembler.dofs.ghosted.lid(block.var_base[0] + node).unwrap();
        max_err = max_err.max((u.values[(lid, 0)] - exact).abs());
    }
    assert!(max_err < 5e-3, "final-time error {max_err:.3e}");
}

/// The BDF-2 stencil on the same problem must do at least as well as BDF-1.
#[test]
fn bdf2_transient_heat_is_consistent() {
    let mut settings = base_settings(1, 32);
    settings.solver.solver = SolverKind::Transient;
    settings.solver.num_steps = 50;
    settings.solver.final_time = 1.0;
    settings.solver.time_order = 2;
    settings
        .physics
        .initial
        .insert("e".to_string(), "sin(pi*x)".to_string());
    strong_dirichlet_everywhere(&mut settings, "0.0");

    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap();

    let decay = (-std::f64::consts::PI * std::f64::consts::PI).exp();
    let block = &solver.assembler.dofs.blocks[0];
    let lattice = &block.lattices[0];
    let mut max_err = 0.0f64;
    for node in 0..lattice.num_nodes {
        let x = lattice.node_coord(node, 1)[0];
        let exact = decay * (std::f64::consts::PI * x).sin();
        let lid = solver.assembler.dofs.ghosted.lid(block.var_base[0] + node).unwrap();
        max_err = max_err.max((u.values[(lid, 0)] - exact).abs());
    }
    assert!(max_err < 5e-3, "BDF-2 final-time error {max_err:.3e}");
}

fn kappa_objective_settings(n: usize) -> msfem::Settings {
    let mut settings = base_settings(2, n);
    settings
        .functions
        .insert("thermal diffusion".to_string(), "kappa".to_string());
    settings.functions.insert("thermal source".to_string(), "1.0".to_string());
    settings.parameters.push(active_scalar("kappa", 1.0));
    strong_dirichlet_everywhere(&mut settings, "0.0");
    global_objective(&mut settings, ObjectiveForm::Integral, "e", "0.0");
    settings
}

/// Steady sensitivity to a scalar diffusivity: the adjoint gradient of
/// J = int u dV must agree with a central difference, and with the analytic
/// identity dJ/dkappa = -J(1)/kappa^2.
#[test]
fn adjoint_gradient_matches_central_difference() {
    let mut solver = Solver::new(kappa_objective_settings(6)).unwrap();
    let (f_soln, objective) = solver.forward_model().unwrap();
    let j0 = objective.unwrap().value;
    let (_a, gradient) = solver.adjoint_model(&f_soln).unwrap();

    // Central difference around kappa = 1.
    let h = 1e-5;
    let mut values = Vec::new();
    for &kappa in &[1.0 + h, 1.0 - h] {
        let mut pert = Solver::new(kappa_objective_settings(6)).unwrap();
        pert.params.update_params(&[kappa], ParameterUsage::Active);
        let (_, obj) = pert.forward_model().unwrap();
        values.push(obj.unwrap().value);
    }
    let fd = (values[0] - values[1]) / (2.0 * h);

    let rel = (gradient[0] - fd).abs() / fd.abs().max(1e-30);
    assert!(
        rel < 1e-7,
        "adjoint {} vs central difference {fd} (rel {rel:.3e})",
        gradient[0]
    );

    // u scales as 1/kappa, so dJ/dkappa at kappa = 1 equals -J.
    assert!(
        (gradient[0] + j0).abs() < 1e-9 * j0.abs().max(1e-30),
        "adjoint {} vs analytic {}",
        gradient[0],
        -j0
    );
}

/// Transient adjoint: the accumulated gradient over all time steps agrees
/// with a central difference through the whole transient solve.
#[test]
fn transient_adjoint_gradient_matches_central_difference() {
    let make = || {
        let mut settings = base_settings(1, 8);
        settings.solver.solver = SolverKind::Transient;
        settings.solver.num_steps = 5;
        settings.solver.final_time = 0.5;
        settings
            .functions
            .insert("thermal diffusion".to_string(), "kappa".to_string());
        settings.parameters.push(active_scalar("kappa", 1.0));
        settings
            .physics
            .initial
            .insert("e".to_string(), "sin(pi*x)".to_string());
        strong_dirichlet_everywhere(&mut settings, "0.0");
        global_objective(&mut settings, ObjectiveForm::Misfit, "e", "0.0");
        settings
    };

    let mut solver = Solver::new(make()).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let (_a, gradient) = solver.adjoint_model(&f_soln).unwrap();

    let h = 1e-5;
    let mut values = Vec::new();
    for &kappa in &[1.0 + h, 1.0 - h] {
        let mut pert = Solver::new(make()).unwrap();
        pert.params.update_params(&[kappa], ParameterUsage::Active);
        let (_, obj) = pert.forward_model().unwrap();
        values.push(obj.unwrap().value);
    }
    let fd = (values[0] - values[1]) / (2.0 * h);
    let rel = (gradient[0] - fd).abs() / fd.abs().max(1e-30);
    assert!(
        rel < 1e-6,
        "transient adjoint {} vs central difference {fd} (rel {rel:.3e})",
        gradient[0]
    );
}

/// The parabolic line search accepts the full Newton step on a problem where
/// one step is exact.
#[test]
fn line_search_converges_on_linear_problem() {
    let mut settings = base_settings(2, 3);
    settings.functions.insert("thermal source".to_string(), "1.0".to_string());
    strong_dirichlet_everywhere(&mut settings, "0.0");
    settings.solver.line_search = true;

    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap();
    assert!(u.norm_inf(0) > 0.0 && u.norm_inf(0) < 1.0);
}

/// Neumann data: -u'' = 0 on [0, 1] with u(0) = 0 and unit flux at the right
/// end gives u = x.
#[test]
fn neumann_flux_drives_linear_profile() {
    let mut settings = base_settings(1, 4);
    settings
        .physics
        .dirichlet
        .push(dirichlet("e", "left", msfem::settings::BcMethod::Strong, "0.0"));
    settings.physics.neumann.push(msfem::settings::FluxBcSetting {
        variable: "e".to_string(),
        side_set: "right".to_string(),
    });
    settings
        .functions
        .insert("thermal Neumann source".to_string(), "1.0".to_string());

    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap();
    let block = &solver.assembler.dofs.blocks[0];
    let lattice = &block.lattices[0];
    for node in 0..lattice.num_nodes {
        let x = lattice.node_coord(node, 1)[0];
        let lid = solver.assembler.dofs.ghosted.lid(block.var_base[0] + node).unwrap();
        assert!(
            (u.values[(lid, 0)] - x).abs() < 1e-11,
            "node at {x}: {}",
            u.values[(lid, 0)]
        );
    }
}

/// Robin data: u' + u - 1 = 0 at the right end with u(0) = 0 gives u = x/2.
#[test]
fn robin_side_balances_flux_and_trace() {
    let mut settings = base_settings(1, 4);
    settings
        .physics
        .dirichlet
        .push(dirichlet("e", "left", msfem::settings::BcMethod::Strong, "0.0"));
    settings.physics.robin.push(msfem::settings::FluxBcSetting {
        variable: "e".to_string(),
        side_set: "right".to_string(),
    });
    settings.functions.insert("robin alpha".to_string(), "1.0".to_string());
    settings
        .functions
        .insert("thermal Robin source".to_string(), "1.0".to_string());

    let mut solver = Solver::new(settings).unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap();
    let block = &solver.assembler.dofs.blocks[0];
    let lattice = &block.lattices[0];
    for node in 0..lattice.num_nodes {
        let x = lattice.node_coord(node, 1)[0];
        let lid = solver.assembler.dofs.ghosted.lid(block.var_base[0] + node).unwrap();
        assert!(
            (u.values[(lid, 0)] - 0.5 * x).abs() < 1e-11,
            "node at {x}: {}",
            u.values[(lid, 0)]
        );
    }
}

/// Pointwise responses: sensors holding the exact solution produce a zero
/// misfit, and perturbed references a positive one.
#[test]
fn pointwise_sensor_objective() {
    let make = |sensor_value: f64| {
        let mut settings = base_settings(2, 4);
        strong_dirichlet_everywhere(&mut settings, "x");
        settings.postprocess.compute_objective = true;
        settings.postprocess.response_type = msfem::settings::ResponseType::Pointwise;
        settings.postprocess.response = "e".to_string();
        settings.postprocess.sensors = vec![msfem::settings::SensorSetting {
            point: [0.375, 0.6, 0.0],
            value: sensor_value,
        }];
        settings
    };

    // u = x everywhere, so a sensor at x = 0.375 reads 0.375.
    let mut exact = Solver::new(make(0.375)).unwrap();
    let (_, obj) = exact.forward_model().unwrap();
    assert!(obj.unwrap().value.abs() < 1e-12);

    let mut off = Solver::new(make(0.5)).unwrap();
    let (_, obj) = off.forward_model().unwrap();
    let value = obj.unwrap().value;
    assert!((value - 0.125f64 * 0.125).abs() < 1e-10, "misfit {value}");
}

/// A solver capped at zero Newton iterations reports non-convergence.
#[test]
fn nonconvergence_is_reported() {
    let mut settings = base_settings(2, 2);
    settings.functions.insert("thermal source".to_string(), "1.0".to_string());
    strong_dirichlet_everywhere(&mut settings, "0.0");
    settings.solver.max_nl_iter = 0;
    let mut solver = Solver::new(settings).unwrap();
    assert!(matches!(
        solver.forward_model(),
        Err(msfem::SimError::NonlinearNonConvergence(_))
    ));
}
