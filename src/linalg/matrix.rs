//! Ghosted matrix accumulation and the export into an owned CSR matrix.
//!
//! Cells insert batched rows of global (row, col, value) contributions into a
//! `GhostedMatrix`. The exporter-equivalent `export_add_into` sums them into a
//! CSR matrix whose rows follow the owned row map, in sorted (row, col) order
//! so the additive combine is bitwise deterministic for a fixed partition.

use std::collections::BTreeSet;

use nalgebra::DVector;
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;

use super::map::DofMap;

/// Accumulates global-index triplets prior to export.
#[derive(Debug, Clone, Default)]
pub struct GhostedMatrix {
    triplets: Vec<(usize, usize, f64)>,
}

impl GhostedMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_all_to_scalar(&mut self, v: f64) {
        // Only zero is meaningful for a triplet store.
        debug_assert_eq!(v, 0.0);
        self.triplets.clear();
    }

    /// One batched insertion per row, mirroring `sumIntoGlobalValues`.
    pub fn sum_into_global(&mut self, row_gid: usize, cols: &[usize], vals: &[f64]) {
        debug_assert_eq!(cols.len(), vals.len());
        for (&c, &v) in cols.iter().zip(vals) {
            self.triplets.push((row_gid, c, v));
        }
    }

    pub fn nnz_inserted(&self) -> usize {
        self.triplets.len()
    }

    /// Sums the accumulated triplets into `csr` (zeroed first). Rows whose
    /// global id is not in `row_map` belong to another rank and are dropped;
    /// column ids are translated through `col_map`.
    pub fn export_add_into(
        &mut self,
        row_map: &DofMap,
        col_map: &DofMap,
        csr: &mut CsrMatrix<f64>,
    ) {
        for v in csr.values_mut() {
            *v = 0.0;
        }
        self.triplets
            .sort_unstable_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        for &(rg, cg, v) in &self.triplets {
            let (Some(r), Some(c)) = (row_map.lid(rg), col_map.lid(cg)) else {
                continue;
            };
            let mut row = csr.row_mut(r);
            let (cols, vals) = row.cols_and_values_mut();
            let pos = cols
                .binary_search(&c)
                .expect("matrix entry outside the assembled sparsity pattern");
            vals[pos] += v;
        }
    }
}

/// Builds the CSR sparsity pattern from per-element global id lists, storing
/// each entry exactly once (cf. the memory note in the element assembler this
/// follows). `rows` and `cols` yield the global row/col ids of each element.
pub fn build_pattern<'a>(
    row_map: &DofMap,
    col_map: &DofMap,
    elements: impl Iterator<Item = (&'a [usize], &'a [usize])>,
) -> SparsityPattern {
    let mut entries = BTreeSet::new();
    for (rows, cols) in elements {
        for &rg in rows {
            let Some(r) = row_map.lid(rg) else { continue };
            for &cg in cols {
                let Some(c) = col_map.lid(cg) else { continue };
                entries.insert((r, c));
            }
        }
    }

    let num_rows = row_map.num_local();
    let num_cols = col_map.num_local();
    let mut offsets = Vec::with_capacity(num_rows + 1);
    let mut column_indices = Vec::with_capacity(entries.len());
    offsets.push(0);
    for (r, c) in entries {
        while r + 1 > offsets.len() {
            offsets.push(column_indices.len());
        }
        column_indices.push(c);
    }
    while offsets.len() < num_rows + 1 {
        offsets.push(column_indices.len());
    }

    SparsityPattern::try_from_offsets_and_indices(num_rows, num_cols, offsets, column_indices)
        .expect("pattern data must be valid")
}

pub fn csr_from_pattern(pattern: SparsityPattern) -> CsrMatrix<f64> {
    let nnz = pattern.nnz();
    CsrMatrix::try_from_pattern_and_values(pattern, vec![0.0; nnz])
        .expect("CSR data must be valid by definition")
}

/// y = A x by plain row traversal.
pub fn csr_mul_vec(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(a.nrows());
    for (r, row) in a.row_iter().enumerate() {
        let mut acc = 0.0;
        for (&c, &v) in row.col_indices().iter().zip(row.values()) {
            acc += v * x[c];
        }
        y[r] = acc;
    }
    y
}

/// y = A^T x by scatter over rows.
pub fn csr_tr_mul_vec(a: &CsrMatrix<f64>, x: &DVector<f64>) -> DVector<f64> {
    let mut y = DVector::zeros(a.ncols());
    for (r, row) in a.row_iter().enumerate() {
        let xr = x[r];
        for (&c, &v) in row.col_indices().iter().zip(row.values()) {
            y[c] += v * xr;
        }
    }
    y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_and_export_round_trip() {
        let owned = DofMap::contiguous(3);
        let gids_a = [0usize, 1];
        let gids_b = [1usize, 2];
        let pattern = build_pattern(
            &owned,
            &owned,
            [
                (&gids_a[..], &gids_a[..]),
                (&gids_b[..], &gids_b[..]),
            ]
            .into_iter(),
        );
        assert_eq!(pattern.nnz(), 7); // 4 + 4 - overlap at (1,1)
        let mut csr = csr_from_pattern(pattern);

        let mut ghosted = GhostedMatrix::new();
        ghosted.sum_into_global(1, &[0, 1], &[2.0, 3.0]);
        ghosted.sum_into_global(1, &[1, 2], &[4.0, 5.0]);
        ghosted.export_add_into(&owned, &owned, &mut csr);

        assert_eq!(csr.get_entry(1, 1).unwrap().into_value(), 7.0);
        assert_eq!(csr.get_entry(1, 0).unwrap().into_value(), 2.0);
        assert_eq!(csr.get_entry(1, 2).unwrap().into_value(), 5.0);
        assert_eq!(csr.get_entry(0, 0).unwrap().into_value(), 0.0);
    }

    #[test]
    fn transpose_apply_agrees_with_dense() {
        let owned = DofMap::contiguous(2);
        let gids = [0usize, 1];
        let pattern = build_pattern(&owned, &owned, [(&gids[..], &gids[..])].into_iter());
        let mut csr = csr_from_pattern(pattern);
        let mut ghosted = GhostedMatrix::new();
        ghosted.sum_into_global(0, &[0, 1], &[1.0, 2.0]);
        ghosted.sum_into_global(1, &[0, 1], &[3.0, 4.0]);
        ghosted.export_add_into(&owned, &owned, &mut csr);

        let x = DVector::from_vec(vec![1.0, -1.0]);
        let y = csr_mul_vec(&csr, &x);
        assert_eq!(y.as_slice(), &[-1.0, -1.0]);
        let z = csr_tr_mul_vec(&csr, &x);
        assert_eq!(z.as_slice(), &[-2.0, -2.0]);
    }
}
