//! Error kinds for the simulation pipeline.
//!
//! Configuration and consistency errors are fatal at startup. Assembly errors
//! abort the current simulation. Linear and nonlinear non-convergence are
//! reported back to the driver, which decides whether to retry with a smaller
//! time step. Subgrid failures surface as assembly errors at the macro level.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    MissingSetting(String),
    #[error("unknown physics module `{0}`")]
    UnknownPhysics(String),
    #[error("cannot parse expression for `{name}`: {reason}")]
    BadExpression { name: String, reason: String },
    #[error("invalid setting `{name}`: {reason}")]
    InvalidSetting { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("variable `{0}` is declared but not used by any physics module")]
    UnusedVariable(String),
    #[error("unknown variable `{0}`")]
    UnknownVariable(String),
    #[error("boundary condition references unknown side set `{0}`")]
    UnknownSideSet(String),
    #[error("unknown identifier `{ident}` in expression `{name}`")]
    UnknownIdentifier { name: String, ident: String },
    #[error("parameter `{name}` is inconsistent: {reason}")]
    BadParameter { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("derivative capacity exceeded: pass needs {needed} slots but at most {capacity} are configured")]
    DerivativeCountExceeded { needed: usize, capacity: usize },
    #[error("local index table carries {local} entries but the element has {expected} degrees of freedom")]
    IndexTableMismatch { local: usize, expected: usize },
    #[error("coefficient function `{0}` has not been registered")]
    MissingCoefficient(String),
    #[error("spatial dimension {0} is not supported")]
    UnsupportedDimension(usize),
    #[error("inconsistent variable list: {0}")]
    InconsistentVariables(String),
    #[error("subgrid failure on macro element {macro_elem}: {source}")]
    Subgrid {
        macro_elem: usize,
        source: SubgridError,
    },
}

#[derive(Debug, Error)]
pub enum LinearSolveError {
    #[error("zero or near-zero pivot in row {row} during factorization")]
    SingularFactor { row: usize },
    #[error("linear iteration did not reach tolerance {tolerance:.3e} in {iterations} iterations (residual {residual:.3e})")]
    NotConverged {
        iterations: usize,
        residual: f64,
        tolerance: f64,
    },
    #[error("preconditioner re-setup cascade exhausted after {attempts} attempts")]
    CascadeExhausted { attempts: usize },
    #[error("linear operator produced a non-finite value")]
    NonFinite,
}

#[derive(Debug, Error)]
#[error("nonlinear solve stopped after {iterations} iterations with scaled residual {scaled_residual:.3e}")]
pub struct NonlinearNonConvergence {
    pub iterations: usize,
    pub scaled_residual: f64,
}

#[derive(Debug, Error)]
pub enum SubgridError {
    #[error("subgrid nonlinear solve failed: {0}")]
    Nonlinear(NonlinearNonConvergence),
    #[error("subgrid linear solve failed: {0}")]
    Linear(LinearSolveError),
}

/// Top-level error type returned by the solver drivers.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error(transparent)]
    LinearSolve(#[from] LinearSolveError),
    #[error(transparent)]
    NonlinearNonConvergence(#[from] NonlinearNonConvergence),
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}
