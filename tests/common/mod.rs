//! Shared settings builders for the verification suites.
#![allow(dead_code)]

use msfem::settings::{
    BcMethod, BlockSettings, DirichletSetting, ObjectiveForm, ParameterSetting, ParameterUsage,
    ResponseType, Settings, SolverKind,
};

pub fn structured_block(n: usize) -> BlockSettings {
    BlockSettings {
        name: "eblock".to_string(),
        divisions: [n, n, n],
        lower: [0.0; 3],
        upper: [1.0, 1.0, 1.0],
    }
}

pub fn base_settings(dim: usize, n: usize) -> Settings {
    let mut settings = Settings::default();
    settings.mesh.dim = dim;
    settings.mesh.blocks.push(structured_block(n));
    settings.solver.solver = SolverKind::SteadyState;
    settings.solver.use_direct = true;
    settings.solver.nl_tol = 1e-12;
    settings
}

pub fn dirichlet(var: &str, side: &str, method: BcMethod, expr: &str) -> DirichletSetting {
    DirichletSetting {
        variable: var.to_string(),
        side_set: side.to_string(),
        method,
        expression: expr.to_string(),
    }
}

pub fn all_sides(dim: usize) -> Vec<&'static str> {
    match dim {
        1 => vec!["left", "right"],
        2 => vec!["left", "right", "bottom", "top"],
        _ => vec!["left", "right", "bottom", "top", "back", "front"],
    }
}

pub fn strong_dirichlet_everywhere(settings: &mut Settings, expr: &str) {
    for side in all_sides(settings.mesh.dim) {
        settings
            .physics
            .dirichlet
            .push(dirichlet("e", side, BcMethod::Strong, expr));
    }
}

pub fn weak_dirichlet_everywhere(settings: &mut Settings, expr: &str) {
    for side in all_sides(settings.mesh.dim) {
        settings
            .physics
            .dirichlet
            .push(dirichlet("e", side, BcMethod::Weak, expr));
    }
}

pub fn active_scalar(name: &str, value: f64) -> ParameterSetting {
    ParameterSetting {
        name: name.to_string(),
        usage: ParameterUsage::Active,
        value: vec![value],
        ..ParameterSetting::default()
    }
}

pub fn global_objective(settings: &mut Settings, form: ObjectiveForm, response: &str, target: &str) {
    settings.postprocess.compute_objective = true;
    settings.postprocess.compute_sensitivities = true;
    settings.postprocess.response_type = ResponseType::Global;
    settings.postprocess.objective_form = form;
    settings.postprocess.response = response.to_string();
    settings.postprocess.target = target.to_string();
    settings.postprocess.weight = "1.0".to_string();
}
