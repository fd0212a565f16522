//! Assembly-level verification: gather/scatter round trips, AD Jacobians
//! against finite differences, strong Dirichlet row replacement, and the
//! derivative-capacity guard.

mod common;

use common::*;
use msfem::cell::GatherKind;
use msfem::error::{AssemblyError, SimError};
use msfem::linalg::DistMultiVector;
use msfem::settings::Settings;
use msfem::Solver;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn nonlinear_settings(dim: usize, n: usize) -> Settings {
    let mut settings = base_settings(dim, n);
    settings
        .functions
        .insert("thermal diffusion".to_string(), "1.0 + 0.5*e*e".to_string());
    settings.functions.insert("thermal source".to_string(), "1.0".to_string());
    weak_dirichlet_everywhere(&mut settings, "0.0");
    settings
}

#[test]
fn index_table_inverts_the_global_to_local_map() {
    let solver = Solver::new(nonlinear_settings(2, 3)).unwrap();
    for block_cells in &solver.assembler.cells {
        for cell in block_cells {
            for e in 0..cell.num_elems {
                for (slot, &gid) in cell.gids[e].iter().enumerate() {
                    assert_eq!(
                        cell.index[e][slot],
                        solver.assembler.dofs.ghosted.lid(gid).unwrap()
                    );
                }
            }
        }
    }
}

#[test]
fn scatter_reconstructs_gathered_vector_up_to_multiplicity() {
    let mut solver = Solver::new(nonlinear_settings(2, 3)).unwrap();
    let n = solver.assembler.dofs.ghosted.num_local();

    let mut x = solver.blank_state();
    for i in 0..n {
        x.values[(i, 0)] = (i as f64 + 1.0) * 0.37;
    }

    // Multiplicity of each dof over all (element, slot) pairs.
    let mut multiplicity = vec![0usize; n];
    for cell in solver.assembler.cells[0].iter() {
        for row in &cell.index {
            for &lid in row {
                multiplicity[lid] += 1;
            }
        }
    }

    solver.assembler.perform_gather(0, GatherKind::Solution, &x, 0);
    let mut scattered = DistMultiVector::new(solver.assembler.dofs.ghosted.clone(), 1);
    for cell in solver.assembler.cells[0].iter() {
        cell.scatter_add(&cell.local_u, &mut scattered, 0);
    }
    // Export to the owned layout sums shared contributions deterministically.
    let mut owned = DistMultiVector::new(solver.assembler.dofs.owned.clone(), 1);
    solver
        .assembler
        .dofs
        .exporter
        .export_add(&scattered, &mut owned);

    for lid in 0..n {
        let expected = multiplicity[lid] as f64 * x.values[(lid, 0)];
        assert!(
            (owned.values[(lid, 0)] - expected).abs() < 1e-12 * expected.abs().max(1.0),
            "dof {lid}: got {}, expected {}",
            owned.values[(lid, 0)],
            expected
        );
    }
}

fn jacobian_matches_finite_differences(dim: usize, n: usize) {
    let mut solver = Solver::new(nonlinear_settings(dim, n)).unwrap();
    let ndof = solver.assembler.dofs.total_dofs;
    let mut rng = StdRng::seed_from_u64(42 + dim as u64);

    let mut u = solver.blank_state();
    for i in 0..ndof {
        u.values[(i, 0)] = rng.gen_range(-0.5..0.5);
    }
    let u_dot = solver.blank_state();
    let phi = solver.blank_state();
    let phi_dot = solver.blank_state();

    let (j, _res) = solver
        .assemble_system(&u, &u_dot, &phi, &phi_dot, 0.0, 1.0)
        .unwrap();

    let h = 1e-6;
    let mut max_rel = 0.0f64;
    let j_scale = j.values().iter().fold(0.0f64, |m, v| m.max(v.abs()));
    for col in 0..ndof {
        let mut up = u.clone();
        let mut um = u.clone();
        up.values[(col, 0)] += h;
        um.values[(col, 0)] -= h;
        let rp = solver.assemble_residual(&up, &u_dot, 0.0).unwrap();
        let rm = solver.assemble_residual(&um, &u_dot, 0.0).unwrap();
        for row in 0..ndof {
            // The assembled residual is -R, so the FD of R flips the sign.
            let fd = -(rp.values[(row, 0)] - rm.values[(row, 0)]) / (2.0 * h);
            let exact = j.get_entry(row, col).map_or(0.0, |e| e.into_value());
            let denom = j_scale.max(1.0);
            max_rel = max_rel.max((fd - exact).abs() / denom);
        }
    }
    assert!(
        max_rel < 1e-6,
        "dim {dim}: worst relative Jacobian mismatch {max_rel:.3e}"
    );
}

#[test]
fn ad_jacobian_matches_fd_in_1d() {
    jacobian_matches_finite_differences(1, 4);
}

#[test]
fn ad_jacobian_matches_fd_in_2d() {
    jacobian_matches_finite_differences(2, 2);
}

#[test]
fn ad_jacobian_matches_fd_in_3d() {
    jacobian_matches_finite_differences(3, 1);
}

#[test]
fn ad_jacobian_matches_fd_with_quadratic_basis() {
    let mut settings = nonlinear_settings(2, 2);
    settings.physics.orders.insert("e".to_string(), 2);
    let mut solver = Solver::new(settings).unwrap();
    let ndof = solver.assembler.dofs.total_dofs;
    let mut rng = StdRng::seed_from_u64(7);

    let mut u = solver.blank_state();
    for i in 0..ndof {
        u.values[(i, 0)] = rng.gen_range(-0.5..0.5);
    }
    let u_dot = solver.blank_state();
    let phi = solver.blank_state();
    let (j, _) = solver
        .assemble_system(&u, &u_dot, &phi.clone(), &phi, 0.0, 1.0)
        .unwrap();

    let h = 1e-6;
    let j_scale = j.values().iter().fold(0.0f64, |m, v| m.max(v.abs()));
    for col in (0..ndof).step_by(3) {
        let mut up = u.clone();
        let mut um = u.clone();
        up.values[(col, 0)] += h;
        um.values[(col, 0)] -= h;
        let rp = solver.assemble_residual(&up, &u_dot, 0.0).unwrap();
        let rm = solver.assemble_residual(&um, &u_dot, 0.0).unwrap();
        for row in 0..ndof {
            let fd = -(rp.values[(row, 0)] - rm.values[(row, 0)]) / (2.0 * h);
            let exact = j.get_entry(row, col).map_or(0.0, |e| e.into_value());
            assert!(
                (fd - exact).abs() / j_scale.max(1.0) < 1e-6,
                "entry ({row},{col}): fd {fd:.6e} vs AD {exact:.6e}"
            );
        }
    }
}

#[test]
fn transient_mass_block_matches_fd_in_udot() {
    let mut settings = nonlinear_settings(1, 4);
    settings.solver.solver = msfem::settings::SolverKind::Transient;
    settings.solver.num_steps = 1;
    settings.solver.final_time = 0.1;
    let mut solver = Solver::new(settings).unwrap();
    let ndof = solver.assembler.dofs.total_dofs;
    let mut rng = StdRng::seed_from_u64(3);

    let mut u = solver.blank_state();
    let mut u_dot = solver.blank_state();
    for i in 0..ndof {
        u.values[(i, 0)] = rng.gen_range(-0.5..0.5);
        u_dot.values[(i, 0)] = rng.gen_range(-0.5..0.5);
    }
    let phi = solver.blank_state();
    let alpha = 10.0;

    // J(alpha) - J(0) = alpha * M.
    let (j_alpha, _) = solver
        .assemble_system(&u, &u_dot, &phi.clone(), &phi, alpha, 1.0)
        .unwrap();
    let (j_zero, _) = solver
        .assemble_system(&u, &u_dot, &phi.clone(), &phi, 0.0, 1.0)
        .unwrap();

    let h = 1e-6;
    for col in 0..ndof {
        let mut up = u_dot.clone();
        let mut um = u_dot.clone();
        up.values[(col, 0)] += h;
        um.values[(col, 0)] -= h;
        let rp = solver.assemble_residual(&u, &up, alpha).unwrap();
        let rm = solver.assemble_residual(&u, &um, alpha).unwrap();
        for row in 0..ndof {
            let fd_mass = -(rp.values[(row, 0)] - rm.values[(row, 0)]) / (2.0 * h);
            let m_entry = (j_alpha.get_entry(row, col).map_or(0.0, |e| e.into_value())
                - j_zero.get_entry(row, col).map_or(0.0, |e| e.into_value()))
                / alpha;
            assert!(
                (fd_mass - m_entry).abs() < 1e-6,
                "mass entry ({row},{col}): fd {fd_mass:.6e} vs AD {m_entry:.6e}"
            );
        }
    }
}

#[test]
fn strong_dirichlet_rows_become_identity() {
    let mut settings = base_settings(2, 2);
    strong_dirichlet_everywhere(&mut settings, "x");
    let mut solver = Solver::new(settings).unwrap();

    let u = solver.blank_state();
    let u_dot = solver.blank_state();
    let phi = solver.blank_state();
    let (mut j, mut res) = solver
        .assemble_system(&u, &u_dot, &phi.clone(), &phi, 0.0, 1.0)
        .unwrap();
    solver.assembler.apply_strong_dirichlet(&mut j, &mut res);

    let rows = solver.assembler.dofs.dirichlet_rows.clone();
    assert!(!rows.is_empty());
    for &row in &rows {
        assert_eq!(res.values[(row, 0)], 0.0);
        for (col, value) in j.row(row).col_indices().iter().zip(j.row(row).values()) {
            let expected = if *col == row { 1.0 } else { 0.0 };
            assert_eq!(*value, expected, "row {row}, col {col}");
        }
    }
}

#[test]
fn derivative_capacity_overflow_is_an_assembly_error() {
    let mut settings = nonlinear_settings(2, 2);
    settings.solver.max_derivs = 2; // quad elements need 4 slots
    let err = Solver::new(settings).err().expect("registration must fail");
    match err {
        SimError::Assembly(AssemblyError::DerivativeCountExceeded { needed, capacity }) => {
            assert_eq!(needed, 4);
            assert_eq!(capacity, 2);
        }
        other => panic!("expected a derivative-capacity error, got {other}"),
    }
}

#[test]
fn unknown_identifier_in_coefficient_is_rejected() {
    let mut settings = base_settings(2, 2);
    settings
        .functions
        .insert("thermal source".to_string(), "2*mystery".to_string());
    assert!(matches!(
        Solver::new(settings),
        Err(SimError::Consistency(_))
    ));
}

#[test]
fn unknown_physics_module_is_rejected() {
    let mut settings = base_settings(2, 2);
    settings.physics.modules = vec!["warpdrive".to_string()];
    assert!(matches!(Solver::new(settings), Err(SimError::Config(_))));
}
