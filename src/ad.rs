//! Forward-mode AD scalars with a bounded derivative count.
//!
//! Residual assembly runs on dual numbers whose derivative slots are assigned
//! per pass: local degrees of freedom for the Jacobian pass, time-derivative
//! seeds for the mass block, active scalar parameters for the sensitivity
//! pass, and local parameter DOFs for discretized-field sensitivities. Every
//! quantity that influences the residual must be seeded before the physics
//! modules run; unseeded inputs silently contribute zero derivatives.

use nalgebra::{Const, DVector, Dyn};
use num_dual::{Derivative, DualDVec64};

use crate::error::AssemblyError;

pub use num_dual::DualNum;

/// The AD scalar used throughout assembly.
pub type Ad = DualDVec64;

/// Lifts a plain value into an AD scalar with no derivative content.
#[inline]
pub fn cst(v: f64) -> Ad {
    Ad::from_re(v)
}

/// Seeds `v` as the independent variable occupying `slot` out of `width`
/// derivative slots.
#[inline]
pub fn seeded(width: usize, slot: usize, v: f64) -> Ad {
    debug_assert!(slot < width);
    Ad::new(v, Derivative::derivative_generic(Dyn(width), Const::<1>, slot))
}

/// Builds an AD scalar carrying an explicit derivative row, used when chaining
/// precomputed sensitivities (e.g. `d u_sub / d lambda`) into a new pass.
#[inline]
pub fn with_partials(v: f64, partials: &[f64]) -> Ad {
    Ad::new(v, Derivative::some(DVector::from_column_slice(partials)))
}

/// The value part of an AD scalar.
#[inline]
pub fn val(x: &Ad) -> f64 {
    x.re
}

/// All derivative slots of `x`, zero-filled up to `width` when the scalar
/// never saw a seeded input.
#[inline]
pub fn partials(x: &Ad, width: usize) -> DVector<f64> {
    x.eps.clone().unwrap_generic(Dyn(width), Const::<1>)
}

/// Checks a pass's derivative demand against the configured capacity.
pub fn check_capacity(needed: usize, capacity: usize) -> Result<(), AssemblyError> {
    if needed > capacity {
        Err(AssemblyError::DerivativeCountExceeded { needed, capacity })
    } else {
        Ok(())
    }
}

/// What a residual pass seeds. The assembler sets exactly one mode per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedWhat {
    /// No seeding: residual values only.
    None,
    /// Seed local solution DOFs; derivatives give the stiffness Jacobian.
    Solution,
    /// Seed local time-derivative DOFs; derivatives give the mass block.
    SolutionDot,
    /// Seed active scalar parameters; derivatives give dR/dtheta.
    ActiveParams,
    /// Seed local discretized-parameter DOFs; derivatives give dR/dp.
    DiscParams,
    /// Seed the mortar trace; derivatives give the flux sensitivity dF/dlambda.
    Aux,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeding_places_unit_partial_in_requested_slot() {
        let x = seeded(4, 2, 3.0);
        assert_eq!(val(&x), 3.0);
        let d = partials(&x, 4);
        assert_eq!(d.as_slice(), &[0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn product_rule_flows_through_slots() {
        let x = seeded(2, 0, 2.0);
        let y = seeded(2, 1, 5.0);
        let f = x.clone() * y.clone() + x.clone();
        assert_eq!(val(&f), 12.0);
        let d = partials(&f, 2);
        assert_eq!(d[0], 6.0); // y + 1
        assert_eq!(d[1], 2.0); // x
    }

    #[test]
    fn constants_report_zero_partials() {
        let c = cst(7.0);
        let d = partials(&c, 3);
        assert!(d.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn explicit_partials_chain() {
        let x = with_partials(1.5, &[0.5, -1.0]);
        let f = x.clone() * x;
        let d = partials(&f, 2);
        assert!((d[0] - 1.5).abs() < 1e-14);
        assert!((d[1] + 3.0).abs() < 1e-14);
    }

    #[test]
    fn capacity_check_rejects_oversized_pass() {
        assert!(check_capacity(8, 8).is_ok());
        assert!(matches!(
            check_capacity(9, 8),
            Err(AssemblyError::DerivativeCountExceeded { needed: 9, capacity: 8 })
        ));
    }
}
