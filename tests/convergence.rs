//! Weak-Dirichlet (Nitsche) consistency and convergence-order verification.

mod common;

use common::*;
use msfem::postprocess::compute_error;
use msfem::Solver;

/// Solves -div(kappa grad u) = f with weak Dirichlet data on every side.
fn weak_poisson(dim: usize, n: usize, order: usize, source: &str, g: &str) -> Solver {
    let mut settings = base_settings(dim, n);
    settings.physics.orders.insert("e".to_string(), order);
    settings.functions.insert("thermal source".to_string(), source.to_string());
    weak_dirichlet_everywhere(&mut settings, g);
    Solver::new(settings).unwrap()
}

/// A linear exact solution is reproduced through the Nitsche boundary terms
/// alone: the penalty and consistency terms vanish identically at u = x.
#[test]
fn weak_dirichlet_reproduces_linear_solution() {
    let mut solver = weak_poisson(2, 4, 1, "0.0", "x");
    let (f_soln, _) = solver.forward_model().unwrap();
    let (l2, _h1) = compute_error(
        &mut solver.assembler,
        f_soln.last().unwrap(),
        "e",
        0.0,
        &|x, _| x[0],
        None,
    );
    assert!(l2 < 1e-11, "L2 error {l2:.3e}");
}

/// Order-1 elements against the smooth exact solution u = x^2 + y^2: under
/// uniform refinement the L2 error contracts at second order and the H1
/// seminorm error at first order, so halving h halves the boundary mismatch
/// at the expected rate.
#[test]
fn weak_dirichlet_first_order_convergence_rates() {
    let exact = |x: &[f64; 3], _t: f64| x[0] * x[0] + x[1] * x[1];
    let exact_grad = |x: &[f64; 3], _t: f64| [2.0 * x[0], 2.0 * x[1], 0.0];

    let mut errors = Vec::new();
    for n in [4usize, 8] {
        let mut solver = weak_poisson(2, n, 1, "-4.0", "x*x + y*y");
        let (f_soln, _) = solver.forward_model().unwrap();
        let (l2, h1) = compute_error(
            &mut solver.assembler,
            f_soln.last().unwrap(),
            "e",
            0.0,
            &exact,
            Some(&exact_grad),
        );
        errors.push((l2, h1));
    }

    let l2_rate = (errors[0].0 / errors[1].0).log2();
    let h1_rate = (errors[0].1 / errors[1].1).log2();
    assert!(
        (1.6..=2.6).contains(&l2_rate),
        "L2 rate {l2_rate:.2} (errors {:?})",
        errors
    );
    assert!(
        (0.8..=1.6).contains(&h1_rate),
        "H1 rate {h1_rate:.2} (errors {:?})",
        errors
    );
}

/// Order-2 elements contain x^2 + y^2 exactly; the weak-Dirichlet solve
/// reproduces it to solver precision on any grid.
#[test]
fn weak_dirichlet_quadratic_basis_is_exact_for_quadratics() {
    for n in [2usize, 3] {
        let mut solver = weak_poisson(2, n, 2, "-4.0", "x*x + y*y");
        let (f_soln, _) = solver.forward_model().unwrap();
        let (l2, h1) = compute_error(
            &mut solver.assembler,
            f_soln.last().unwrap(),
            "e",
            0.0,
            &|x, _| x[0] * x[0] + x[1] * x[1],
            Some(&|x: &[f64; 3], _| [2.0 * x[0], 2.0 * x[1], 0.0]),
        );
        assert!(l2 < 1e-9, "n = {n}: L2 error {l2:.3e}");
        assert!(h1 < 1e-8, "n = {n}: H1 error {h1:.3e}");
    }
}

/// The cube analogue with u = x^2 + y^2 + z^2 and HGRAD-2 elements (the
/// interior weak-Dirichlet scenario).
#[test]
fn weak_dirichlet_thermal_cube_quadratic() {
    let mut solver = weak_poisson(3, 2, 2, "-6.0", "x*x + y*y + z*z");
    let (f_soln, _) = solver.forward_model().unwrap();
    let (l2, h1) = compute_error(
        &mut solver.assembler,
        f_soln.last().unwrap(),
        "e",
        0.0,
        &|x, _| x[0] * x[0] + x[1] * x[1] + x[2] * x[2],
        Some(&|x: &[f64; 3], _| [2.0 * x[0], 2.0 * x[1], 2.0 * x[2]]),
    );
    assert!(l2 < 1e-8, "L2 error {l2:.3e}");
    assert!(h1 < 1e-7, "H1 error {h1:.3e}");
}
