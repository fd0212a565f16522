//! The hierarchical settings tree consumed by the engine.
//!
//! File loading (YAML/XML) is an external collaborator; these are the typed
//! sublists the rest of the code consumes by name. Every struct derives
//! `Deserialize` with defaults so partial trees work the same way a partial
//! parameter list would.

use serde::Deserialize;
use std::collections::BTreeMap;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mesh: MeshSettings,
    pub solver: SolverSettings,
    pub physics: PhysicsSettings,
    /// Coefficient expressions, keyed by function name.
    pub functions: BTreeMap<String, String>,
    pub parameters: Vec<ParameterSetting>,
    pub postprocess: PostprocessSettings,
    pub multiscale: MultiscaleSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    pub dim: usize,
    pub blocks: Vec<BlockSettings>,
    /// Elements per cell batch.
    pub workset_size: usize,
    pub have_element_data: bool,
    pub have_nodal_data: bool,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            dim: 2,
            blocks: Vec::new(),
            workset_size: 64,
            have_element_data: false,
            have_nodal_data: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockSettings {
    pub name: String,
    /// Elements per axis; trailing entries ignored above `dim`.
    pub divisions: [usize; 3],
    pub lower: [f64; 3],
    pub upper: [f64; 3],
}

impl Default for BlockSettings {
    fn default() -> Self {
        Self {
            name: "eblock".to_string(),
            divisions: [1, 1, 1],
            lower: [0.0; 3],
            upper: [1.0, 1.0, 1.0],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolverKind {
    SteadyState,
    Transient,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub solver: SolverKind,
    pub num_steps: usize,
    pub final_time: f64,
    /// Backward-difference order, 1 or 2.
    pub time_order: usize,
    pub nl_tol: f64,
    pub max_nl_iter: usize,
    pub lin_tol: f64,
    pub lin_iter: usize,
    /// GMRES restart length.
    pub krylov_space: usize,
    pub use_strong_dbcs: bool,
    pub use_direct: bool,
    pub line_search: bool,
    pub allow_remesh: bool,
    /// Maximum derivative slots a single AD pass may request.
    pub max_derivs: usize,
    pub preconditioner: PreconditionerSettings,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            solver: SolverKind::SteadyState,
            num_steps: 1,
            final_time: 1.0,
            time_order: 1,
            nl_tol: 1e-9,
            max_nl_iter: 10,
            lin_tol: 1e-12,
            lin_iter: 400,
            krylov_space: 60,
            use_strong_dbcs: true,
            use_direct: false,
            line_search: false,
            allow_remesh: false,
            max_derivs: 128,
            preconditioner: PreconditionerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreconditionerKind {
    None,
    Jacobi,
    Ilu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SmootherKind {
    Chebyshev,
    Jacobi,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PreconditionerSettings {
    pub kind: PreconditionerKind,
    pub drop_tol: f64,
    pub fill_param: f64,
    pub smoother: SmootherKind,
    pub max_levels: usize,
    pub coarse_size: usize,
}

impl Default for PreconditionerSettings {
    fn default() -> Self {
        Self {
            kind: PreconditionerKind::Ilu,
            drop_tol: 0.0,
            fill_param: 1.0,
            smoother: SmootherKind::Chebyshev,
            max_levels: 5,
            coarse_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BcMethod {
    Strong,
    Weak,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirichletSetting {
    pub variable: String,
    pub side_set: String,
    pub method: BcMethod,
    /// Boundary value expression of x, y, z, t and scalar parameters.
    #[serde(default = "zero_expr")]
    pub expression: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FluxBcSetting {
    pub variable: String,
    pub side_set: String,
}

fn zero_expr() -> String {
    "0.0".to_string()
}

fn one_f64() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhysicsSettings {
    /// Active physics module names, applied to every block.
    pub modules: Vec<String>,
    pub form_param: f64,
    /// Polynomial order per variable name; defaults to 1.
    pub orders: BTreeMap<String, usize>,
    pub dirichlet: Vec<DirichletSetting>,
    pub neumann: Vec<FluxBcSetting>,
    pub robin: Vec<FluxBcSetting>,
    /// Initial condition expression per variable name.
    pub initial: BTreeMap<String, String>,
}

impl Default for PhysicsSettings {
    fn default() -> Self {
        Self {
            modules: vec!["thermal".to_string()],
            form_param: 1.0,
            orders: BTreeMap::new(),
            dirichlet: Vec::new(),
            neumann: Vec::new(),
            robin: Vec::new(),
            initial: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterUsage {
    Inactive,
    Active,
    Stochastic,
    Discrete,
    Discretized,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distribution {
    Uniform { min: f64, max: f64 },
    Normal { mean: f64, std_dev: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegularizationKind {
    L2,
    L1,
    TotalVariation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegularizationSetting {
    pub kind: RegularizationKind,
    pub constant: f64,
    /// Restrict the regularization quadrature to one side set.
    #[serde(default)]
    pub side_set: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParameterSetting {
    pub name: String,
    pub usage: ParameterUsage,
    /// Component values for scalar/vector parameters, or the uniform initial
    /// value of a discretized field.
    pub value: Vec<f64>,
    /// Basis order of a discretized parameter field.
    pub order: usize,
    pub bounds: Option<(f64, f64)>,
    pub distribution: Option<Distribution>,
    pub regularization: Option<RegularizationSetting>,
}

impl Default for ParameterSetting {
    fn default() -> Self {
        Self {
            name: String::new(),
            usage: ParameterUsage::Inactive,
            value: vec![0.0],
            order: 1,
            bounds: None,
            distribution: None,
            regularization: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseType {
    Global,
    Pointwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectiveForm {
    /// J = integral of the response over the domain.
    Integral,
    /// J = integral of weight * (response - target)^2.
    Misfit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSetting {
    pub point: [f64; 3],
    pub value: f64,
}

impl Default for SensorSetting {
    fn default() -> Self {
        Self {
            point: [0.0; 3],
            value: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostprocessSettings {
    pub response_type: ResponseType,
    pub objective_form: ObjectiveForm,
    pub compute_objective: bool,
    pub compute_sensitivities: bool,
    pub response: String,
    pub target: String,
    #[serde(default = "one_expr")]
    pub weight: String,
    pub sensors: Vec<SensorSetting>,
    pub write_solution: Option<String>,
    pub write_gradient: Option<String>,
}

fn one_expr() -> String {
    "1.0".to_string()
}

impl Default for PostprocessSettings {
    fn default() -> Self {
        Self {
            response_type: ResponseType::Global,
            objective_form: ObjectiveForm::Misfit,
            compute_objective: false,
            compute_sensitivities: false,
            response: "0.0".to_string(),
            target: "0.0".to_string(),
            weight: "1.0".to_string(),
            sensors: Vec::new(),
            write_solution: None,
            write_gradient: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiscaleSettings {
    pub enabled: bool,
    /// Macro blocks whose elements each embed a subgrid model.
    pub blocks: Vec<String>,
    /// Subgrid elements per macro element per axis.
    pub refine: usize,
    /// BDF substeps per macro time step.
    pub time_steps: usize,
    pub sub_nl_tol: f64,
    pub sub_max_nl_iter: usize,
    #[serde(default = "one_f64")]
    pub form_param: f64,
}

impl Default for MultiscaleSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            blocks: Vec::new(),
            refine: 1,
            time_steps: 1,
            sub_nl_tol: 1e-10,
            sub_max_nl_iter: 10,
            form_param: 1.0,
        }
    }
}

impl Settings {
    /// Startup validation; configuration and consistency problems are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3).contains(&self.mesh.dim) {
            return Err(ConfigError::InvalidSetting {
                name: "mesh.dim".to_string(),
                reason: format!("dimension {} is outside 1..=3", self.mesh.dim),
            });
        }
        if self.mesh.blocks.is_empty() {
            return Err(ConfigError::MissingSetting("mesh.blocks".to_string()));
        }
        for block in &self.mesh.blocks {
            for axis in 0..self.mesh.dim {
                if block.divisions[axis] == 0 {
                    return Err(ConfigError::InvalidSetting {
                        name: format!("mesh.blocks.{}.divisions", block.name),
                        reason: "zero elements along an axis".to_string(),
                    });
                }
                if block.upper[axis] <= block.lower[axis] {
                    return Err(ConfigError::InvalidSetting {
                        name: format!("mesh.blocks.{}.bounds", block.name),
                        reason: "upper bound must exceed lower bound".to_string(),
                    });
                }
            }
        }
        if !(1..=2).contains(&self.solver.time_order) {
            return Err(ConfigError::InvalidSetting {
                name: "solver.time_order".to_string(),
                reason: format!("time order {} is not 1 or 2", self.solver.time_order),
            });
        }
        if self.solver.solver == SolverKind::Transient && self.solver.num_steps == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "solver.num_steps".to_string(),
                reason: "transient solves need at least one step".to_string(),
            });
        }
        for (var, &order) in &self.physics.orders {
            if !(1..=2).contains(&order) {
                return Err(ConfigError::InvalidSetting {
                    name: format!("physics.orders.{var}"),
                    reason: format!("basis order {order} is not 1 or 2"),
                });
            }
        }
        if self.multiscale.enabled && self.multiscale.refine == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "multiscale.refine".to_string(),
                reason: "subgrid refinement must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// The basis order configured for `var`, defaulting to 1.
    pub fn variable_order(&self, var: &str) -> usize {
        self.physics.orders.get(var).copied().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_with_a_block() {
        let mut settings = Settings::default();
        settings.mesh.blocks.push(BlockSettings::default());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn rejects_degenerate_block() {
        let mut settings = Settings::default();
        settings.mesh.blocks.push(BlockSettings {
            divisions: [0, 1, 1],
            ..BlockSettings::default()
        });
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_time_order() {
        let mut settings = Settings::default();
        settings.mesh.blocks.push(BlockSettings::default());
        settings.solver.time_order = 3;
        assert!(settings.validate().is_err());
    }
}
