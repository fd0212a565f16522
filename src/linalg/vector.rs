//! Distributed multivectors over an index map.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use super::map::DofMap;

/// A dense multivector whose rows follow a `DofMap`. A single column is the
/// common case; sensitivity passes carry one column per active parameter.
#[derive(Debug, Clone)]
pub struct DistMultiVector {
    map: Arc<DofMap>,
    pub values: DMatrix<f64>,
}

impl DistMultiVector {
    pub fn new(map: Arc<DofMap>, ncols: usize) -> Self {
        let n = map.num_local();
        Self {
            map,
            values: DMatrix::zeros(n, ncols),
        }
    }

    pub fn map(&self) -> &Arc<DofMap> {
        &self.map
    }

    pub fn num_local(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    pub fn put_scalar(&mut self, v: f64) {
        self.values.fill(v);
    }

    pub fn norm_inf(&self, col: usize) -> f64 {
        self.values
            .column(col)
            .iter()
            .fold(0.0f64, |m, v| m.max(v.abs()))
    }

    pub fn norm2(&self, col: usize) -> f64 {
        self.values.column(col).norm()
    }

    pub fn dot(&self, col: usize, other: &DistMultiVector, other_col: usize) -> f64 {
        self.values.column(col).dot(&other.values.column(other_col))
    }

    /// Tpetra-style update: `self = alpha * other + beta * self`.
    pub fn update(&mut self, alpha: f64, other: &DistMultiVector, beta: f64) {
        assert_eq!(self.values.nrows(), other.values.nrows());
        assert_eq!(self.values.ncols(), other.values.ncols());
        self.values
            .zip_apply(&other.values, |s, o| *s = alpha * o + beta * *s);
    }

    pub fn column_owned(&self, col: usize) -> DVector<f64> {
        DVector::from_column_slice(self.values.column(col).as_slice())
    }

    pub fn set_column_from(&mut self, col: usize, v: &DVector<f64>) {
        assert_eq!(v.len(), self.values.nrows());
        self.values.set_column(col, v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_matches_tpetra_semantics() {
        let map = Arc::new(DofMap::contiguous(3));
        let mut a = DistMultiVector::new(map.clone(), 1);
        let mut b = DistMultiVector::new(map, 1);
        a.put_scalar(2.0);
        b.put_scalar(5.0);
        // a = 3*b + 0.5*a
        a.update(3.0, &b, 0.5);
        assert_eq!(a.values[(0, 0)], 16.0);
        b.update(1.0, &a, 0.0);
        assert_eq!(b.values[(2, 0)], 16.0);
    }

    #[test]
    fn inf_norm_tracks_largest_entry() {
        let map = Arc::new(DofMap::contiguous(3));
        let mut v = DistMultiVector::new(map, 2);
        v.values[(1, 0)] = -7.0;
        v.values[(2, 1)] = 3.0;
        assert_eq!(v.norm_inf(0), 7.0);
        assert_eq!(v.norm_inf(1), 3.0);
    }
}
