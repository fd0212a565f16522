//! Physics modules and their registry.
//!
//! A module is polymorphic over the capability set {set_vars,
//! volume_residual, boundary_residual, compute_flux}. The set of physics is
//! closed: modules are tagged variants dispatched with a match, so hot loops
//! pay no virtual-call cost, and the registry maps module names to
//! constructors. A module never allocates global state; failures propagate as
//! assembly error kinds.

pub mod thermal;

use crate::error::{AssemblyError, ConfigError, ConsistencyError};
use crate::functions::FunctionManager;
use crate::params::ParameterManager;
use crate::settings::Settings;
use crate::workset::Workset;

pub use thermal::Thermal;

pub trait PhysicsModule {
    fn label(&self) -> &str;

    /// Variables this module declares: (name, basis order).
    fn variables(&self) -> Vec<(String, usize)>;

    /// Records the index of each used variable within the block's variable
    /// list and detects optional couplings.
    fn set_vars(&mut self, varlist: &[String]) -> Result<(), ConsistencyError>;

    /// Accumulates the weak-form volume contribution into `wkset.res`.
    fn volume_residual(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError>;

    /// Accumulates boundary contributions for the workset's current side.
    fn boundary_residual(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError>;

    /// Produces the outward numerical flux on multiscale interfaces.
    fn compute_flux(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError>;
}

/// The closed set of physics modules as a tagged variant.
#[derive(Debug)]
pub enum Physics {
    Thermal(Thermal),
}

impl Physics {
    pub fn label(&self) -> &str {
        match self {
            Physics::Thermal(m) => m.label(),
        }
    }

    pub fn variables(&self) -> Vec<(String, usize)> {
        match self {
            Physics::Thermal(m) => m.variables(),
        }
    }

    pub fn set_vars(&mut self, varlist: &[String]) -> Result<(), ConsistencyError> {
        match self {
            Physics::Thermal(m) => m.set_vars(varlist),
        }
    }

    pub fn volume_residual(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError> {
        match self {
            Physics::Thermal(m) => m.volume_residual(wkset, functions, params),
        }
    }

    pub fn boundary_residual(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError> {
        match self {
            Physics::Thermal(m) => m.boundary_residual(wkset, functions, params),
        }
    }

    pub fn compute_flux(
        &self,
        wkset: &mut Workset,
        functions: &FunctionManager,
        params: &ParameterManager,
    ) -> Result<(), AssemblyError> {
        match self {
            Physics::Thermal(m) => m.compute_flux(wkset, functions, params),
        }
    }
}

/// The registry of module constructors, keyed by module name.
pub fn create_physics(
    name: &str,
    settings: &Settings,
    dim: usize,
    block: usize,
    functions: &mut FunctionManager,
) -> Result<Physics, ConfigError> {
    match name {
        "thermal" => Ok(Physics::Thermal(Thermal::new(
            settings, dim, block, functions,
        )?)),
        other => Err(ConfigError::UnknownPhysics(other.to_string())),
    }
}
