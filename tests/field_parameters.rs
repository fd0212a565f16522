//! Discretized (field) parameter pathway: rectangular dR/dp assembly, the
//! dot-product identity, directional derivatives against finite differences,
//! and the adjoint gradient of a misfit objective.

mod common;

use common::*;
use msfem::linalg::matrix::{csr_mul_vec, csr_tr_mul_vec};
use msfem::settings::{
    ObjectiveForm, ParameterSetting, ParameterUsage, RegularizationKind, RegularizationSetting,
};
use msfem::Solver;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn field_kappa_settings(n: usize) -> msfem::Settings {
    let mut settings = base_settings(1, n);
    settings
        .functions
        .insert("thermal diffusion".to_string(), "kappa_field".to_string());
    settings.functions.insert("thermal source".to_string(), "1.0".to_string());
    settings.parameters.push(ParameterSetting {
        name: "kappa_field".to_string(),
        usage: ParameterUsage::Discretized,
        value: vec![1.0],
        order: 1,
        ..ParameterSetting::default()
    });
    strong_dirichlet_everywhere(&mut settings, "0.0");
    global_objective(&mut settings, ObjectiveForm::Misfit, "e", "0.0");
    settings
}

#[test]
fn param_jacobian_passes_the_dot_product_test() {
    let mut solver = Solver::new(field_kappa_settings(8)).unwrap();
    solver
        .params
        .set_discretized_from_expr("kappa_field", "1.0 + 0.1*sin(pi*x)", 0.0)
        .unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap().clone();
    let u_dot = solver.blank_state();
    let j_p = solver.assemble_param_jacobian(&u, &u_dot, 0.0).unwrap();

    let n_u = j_p.ncols();
    let n_p = j_p.nrows();
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..5 {
        let v = DVector::from_fn(n_p, |_, _| rng.gen_range(-1.0..1.0));
        let w = DVector::from_fn(n_u, |_, _| rng.gen_range(-1.0..1.0));
        // J maps parameter perturbations to residual changes: J v = (dR/dp) v.
        let jv = csr_tr_mul_vec(&j_p, &v);
        let jtw = csr_mul_vec(&j_p, &w);
        let lhs = jv.dot(&w);
        let rhs = v.dot(&jtw);
        assert!(
            (lhs - rhs).abs() <= 1e-10 * lhs.abs().max(1.0),
            "<Jv, w> = {lhs:.15e} but <v, J^T w> = {rhs:.15e}"
        );
    }
}

#[test]
fn param_jacobian_matches_directional_finite_difference() {
    let mut solver = Solver::new(field_kappa_settings(8)).unwrap();
    solver
        .params
        .set_discretized_from_expr("kappa_field", "1.0 + 0.1*sin(pi*x)", 0.0)
        .unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let u = f_soln.last().unwrap().clone();
    let u_dot = solver.blank_state();
    let j_p = solver.assemble_param_jacobian(&u, &u_dot, 0.0).unwrap();

    let p0 = solver.params.get_params(ParameterUsage::Discretized);
    let mut rng = StdRng::seed_from_u64(5);
    let v: Vec<f64> = p0.iter().map(|_| rng.gen_range(-1.0..1.0)).collect();
    let h = 1e-6;

    let perturbed = |solver: &mut Solver, sign: f64| -> DVector<f64> {
        let p: Vec<f64> = p0.iter().zip(&v).map(|(p, dv)| p + sign * h * dv).collect();
        solver.params.update_params(&p, ParameterUsage::Discretized);
        let res = solver.assemble_residual(&u, &u_dot, 0.0).unwrap();
        res.column_owned(0)
    };
    let rp = perturbed(&mut solver, 1.0);
    let rm = perturbed(&mut solver, -1.0);
    solver.params.update_params(&p0, ParameterUsage::Discretized);

    // Assembled residuals carry -R; flip the sign of the difference.
    let fd = (rm - rp) / (2.0 * h);
    let v_vec = DVector::from_vec(v);
    let exact = csr_tr_mul_vec(&j_p, &v_vec);
    let err = (&fd - &exact).norm() / exact.norm().max(1e-30);
    assert!(err < 1e-5, "directional derivative mismatch {err:.3e}");
}

#[test]
fn adjoint_field_gradient_matches_finite_differences() {
    let mut solver = Solver::new(field_kappa_settings(8)).unwrap();
    solver
        .params
        .set_discretized_from_expr("kappa_field", "1.0 + 0.1*sin(pi*x)", 0.0)
        .unwrap();
    let (f_soln, _) = solver.forward_model().unwrap();
    let (_a, gradient) = solver.adjoint_model(&f_soln).unwrap();

    let p0 = solver.params.get_params(ParameterUsage::Discretized);
    let n_active = solver.params.num_active_params;
    assert_eq!(n_active, 0);
    assert_eq!(gradient.len(), p0.len());

    // Interior parameter dofs carry the interesting sensitivities.
    let h = 1e-6;
    for &dof in &[2usize, 4, 6] {
        let mut values = Vec::new();
        for sign in [1.0, -1.0] {
            let mut pert = Solver::new(field_kappa_settings(8)).unwrap();
            let mut p = p0.clone();
            p[dof] += sign * h;
            pert.params.update_params(&p, ParameterUsage::Discretized);
            let (_, obj) = pert.forward_model().unwrap();
            values.push(obj.unwrap().value);
        }
        let fd = (values[0] - values[1]) / (2.0 * h);
        let rel = (gradient[dof] - fd).abs() / fd.abs().max(1e-12);
        assert!(
            rel < 1e-4,
            "dof {dof}: adjoint {} vs fd {fd} (rel {rel:.3e})",
            gradient[dof]
        );
    }
}

#[test]
fn regularization_contributes_value_and_gradient() {
    let mut settings = field_kappa_settings(8);
    settings.parameters[0].regularization = Some(RegularizationSetting {
        kind: RegularizationKind::L2,
        constant: 2.0,
        side_set: None,
    });
    let mut solver = Solver::new(settings).unwrap();
    solver
        .params
        .set_discretized_from_expr("kappa_field", "1.0 + 0.1*sin(pi*x)", 0.0)
        .unwrap();

    let (f_soln, objective) = solver.forward_model().unwrap();
    let with_reg = objective.unwrap().value;

    let mut plain = Solver::new(field_kappa_settings(8)).unwrap();
    plain
        .params
        .set_discretized_from_expr("kappa_field", "1.0 + 0.1*sin(pi*x)", 0.0)
        .unwrap();
    let (_, obj_plain) = plain.forward_model().unwrap();
    let without_reg = obj_plain.unwrap().value;

    // (c/2) int kappa^2 over [0,1] with kappa = 1 + 0.1 sin(pi x).
    let expected = 2.0 * 0.5 * (1.0 + 0.4 / std::f64::consts::PI + 0.01 / 2.0);
    let reg_part = with_reg - without_reg;
    assert!(
        (reg_part - expected).abs() < 2e-3,
        "regularization term {reg_part} vs analytic {expected}"
    );

    // The regularization gradient shows up in the adjoint gradient as well.
    let (_a, gradient) = solver.adjoint_model(&f_soln).unwrap();
    assert!(gradient.iter().any(|g| g.abs() > 1e-3));
}
