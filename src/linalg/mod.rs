//! Linear-algebra facade: distributed vectors and matrices over owned and
//! owned-and-ghosted index maps, the exporter/importer pair between them,
//! sparse graph construction, and the Krylov solve layer.

pub mod map;
pub mod matrix;
pub mod solve;
pub mod vector;

pub use map::{DofMap, Exporter};
pub use matrix::{build_pattern, GhostedMatrix};
pub use solve::{
    dense_lu_solve, GmresOutput, GmresSolver, IluPreconditioner, JacobiPreconditioner,
    LinearOperator,
};
pub use vector::DistMultiVector;
