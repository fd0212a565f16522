//! The Krylov solve layer: restarted GMRES with pluggable preconditioning,
//! plus a direct dense-factorization path for small (subgrid) systems.

use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;

use crate::error::LinearSolveError;

pub trait LinearOperator {
    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>);
}

impl LinearOperator for CsrMatrix<f64> {
    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>) {
        for (r, row) in self.row_iter().enumerate() {
            let mut acc = 0.0;
            for (&c, &v) in row.col_indices().iter().zip(row.values()) {
                acc += v * x[c];
            }
            y[r] = acc;
        }
    }
}

impl LinearOperator for DMatrix<f64> {
    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>) {
        y.gemv(1.0, self, x, 0.0);
    }
}

/// Identity preconditioner.
pub struct IdentityPreconditioner;

impl LinearOperator for IdentityPreconditioner {
    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>) {
        y.copy_from(x);
    }
}

/// Diagonal (point Jacobi) preconditioner.
pub struct JacobiPreconditioner {
    inv_diag: DVector<f64>,
}

impl JacobiPreconditioner {
    pub fn from_csr(a: &CsrMatrix<f64>) -> Self {
        let mut inv_diag = DVector::from_element(a.nrows(), 1.0);
        for (r, row) in a.row_iter().enumerate() {
            for (&c, &v) in row.col_indices().iter().zip(row.values()) {
                if c == r && v.abs() > 1e-300 {
                    inv_diag[r] = 1.0 / v;
                }
            }
        }
        Self { inv_diag }
    }
}

impl LinearOperator for JacobiPreconditioner {
    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>) {
        for i in 0..x.len() {
            y[i] = self.inv_diag[i] * x[i];
        }
    }
}

/// Zero-fill incomplete LU factorization on the matrix's own sparsity
/// pattern. The absolute/relative thresholds shift the diagonal before
/// factorization; the solver's cascade retries with progressively stronger
/// thresholding when a factorization or solve goes bad.
pub struct IluPreconditioner {
    n: usize,
    offsets: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    diag_pos: Vec<usize>,
}

impl IluPreconditioner {
    pub fn factor(
        a: &CsrMatrix<f64>,
        absolute_threshold: f64,
        relative_threshold: f64,
    ) -> Result<Self, LinearSolveError> {
        let n = a.nrows();
        let (offsets_ref, cols_ref, vals_ref) = a.csr_data();
        let offsets = offsets_ref.to_vec();
        let cols = cols_ref.to_vec();
        let mut vals = vals_ref.to_vec();

        let mut diag_pos = vec![usize::MAX; n];
        for r in 0..n {
            for p in offsets[r]..offsets[r + 1] {
                if cols[p] == r {
                    diag_pos[r] = p;
                    vals[p] = vals[p] * (1.0 + relative_threshold)
                        + absolute_threshold * vals[p].signum();
                }
            }
            if diag_pos[r] == usize::MAX {
                return Err(LinearSolveError::SingularFactor { row: r });
            }
        }

        for i in 0..n {
            let row_start = offsets[i];
            let row_end = offsets[i + 1];
            for p in row_start..row_end {
                let k = cols[p];
                if k >= i {
                    break;
                }
                let pivot = vals[diag_pos[k]];
                if pivot.abs() < 1e-300 {
                    return Err(LinearSolveError::SingularFactor { row: k });
                }
                let lik = vals[p] / pivot;
                vals[p] = lik;
                // Subtract lik * row k from the remainder of row i, on
                // entries both rows share.
                let mut q = p + 1;
                for kp in diag_pos[k] + 1..offsets[k + 1] {
                    let kc = cols[kp];
                    while q < row_end && cols[q] < kc {
                        q += 1;
                    }
                    if q == row_end {
                        break;
                    }
                    if cols[q] == kc {
                        vals[q] -= lik * vals[kp];
                    }
                }
            }
            if vals[diag_pos[i]].abs() < 1e-300 {
                return Err(LinearSolveError::SingularFactor { row: i });
            }
        }

        Ok(Self {
            n,
            offsets,
            cols,
            vals,
            diag_pos,
        })
    }
}

impl LinearOperator for IluPreconditioner {
    fn apply(&self, y: &mut DVector<f64>, x: &DVector<f64>) {
        // Forward solve with unit lower factor.
        for i in 0..self.n {
            let mut acc = x[i];
            for p in self.offsets[i]..self.diag_pos[i] {
                acc -= self.vals[p] * y[self.cols[p]];
            }
            y[i] = acc;
        }
        // Backward solve with upper factor.
        for i in (0..self.n).rev() {
            let mut acc = y[i];
            for p in self.diag_pos[i] + 1..self.offsets[i + 1] {
                acc -= self.vals[p] * y[self.cols[p]];
            }
            y[i] = acc / self.vals[self.diag_pos[i]];
        }
    }
}

#[derive(Debug, Clone)]
pub struct GmresOutput {
    pub iterations: usize,
    pub residual: f64,
}

/// Restarted GMRES with left preconditioning.
#[derive(Debug, Clone)]
pub struct GmresSolver {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub restart: usize,
}

impl GmresSolver {
    pub fn new(tolerance: f64, max_iterations: usize, restart: usize) -> Self {
        Self {
            tolerance,
            max_iterations,
            restart: restart.max(1),
        }
    }

    pub fn solve(
        &self,
        op: &dyn LinearOperator,
        pc: &dyn LinearOperator,
        b: &DVector<f64>,
        x: &mut DVector<f64>,
    ) -> Result<GmresOutput, LinearSolveError> {
        let n = b.len();
        let m = self.restart.min(n.max(1));

        let b_norm = b.norm();
        if b_norm == 0.0 {
            x.fill(0.0);
            return Ok(GmresOutput {
                iterations: 0,
                residual: 0.0,
            });
        }

        let mut total_iters = 0usize;
        let mut scratch = DVector::zeros(n);
        let mut z = DVector::zeros(n);

        loop {
            // r = M (b - A x)
            op.apply(&mut scratch, x);
            scratch.zip_apply(b, |ax_i, b_i| *ax_i = b_i - *ax_i);
            pc.apply(&mut z, &scratch);
            let beta = z.norm();
            if !beta.is_finite() {
                return Err(LinearSolveError::NonFinite);
            }

            // Reference norm: preconditioned right-hand side.
            pc.apply(&mut scratch, b);
            let ref_norm = scratch.norm().max(1e-300);

            if beta / ref_norm <= self.tolerance {
                return Ok(GmresOutput {
                    iterations: total_iters,
                    residual: beta / ref_norm,
                });
            }
            if total_iters >= self.max_iterations {
                return Err(LinearSolveError::NotConverged {
                    iterations: total_iters,
                    residual: beta / ref_norm,
                    tolerance: self.tolerance,
                });
            }

            let mut basis: Vec<DVector<f64>> = Vec::with_capacity(m + 1);
            basis.push(&z / beta);
            let mut h = DMatrix::<f64>::zeros(m + 1, m);
            let mut cs = vec![0.0f64; m];
            let mut sn = vec![0.0f64; m];
            let mut g = DVector::<f64>::zeros(m + 1);
            g[0] = beta;

            let mut k_used = 0;
            for j in 0..m {
                if total_iters >= self.max_iterations {
                    break;
                }
                total_iters += 1;
                k_used = j + 1;

                op.apply(&mut scratch, &basis[j]);
                let mut w = DVector::zeros(n);
                pc.apply(&mut w, &scratch);

                // Modified Gram-Schmidt.
                for i in 0..=j {
                    let hij = w.dot(&basis[i]);
                    h[(i, j)] = hij;
                    w.axpy(-hij, &basis[i], 1.0);
                }
                let wnorm = w.norm();
                h[(j + 1, j)] = wnorm;
                if !wnorm.is_finite() {
                    return Err(LinearSolveError::NonFinite);
                }

                // Apply accumulated Givens rotations to the new column.
                for i in 0..j {
                    let t = cs[i] * h[(i, j)] + sn[i] * h[(i + 1, j)];
                    h[(i + 1, j)] = -sn[i] * h[(i, j)] + cs[i] * h[(i + 1, j)];
                    h[(i, j)] = t;
                }
                let denom = (h[(j, j)] * h[(j, j)] + wnorm * wnorm).sqrt();
                if denom > 0.0 {
                    cs[j] = h[(j, j)] / denom;
                    sn[j] = wnorm / denom;
                } else {
                    cs[j] = 1.0;
                    sn[j] = 0.0;
                }
                h[(j, j)] = cs[j] * h[(j, j)] + sn[j] * wnorm;
                h[(j + 1, j)] = 0.0;
                g[j + 1] = -sn[j] * g[j];
                g[j] = cs[j] * g[j];

                let happy = wnorm <= 1e-14 * beta;
                if !happy {
                    basis.push(&w / wnorm);
                }

                if g[j + 1].abs() / ref_norm <= self.tolerance || happy {
                    break;
                }
            }

            // Back-substitute the small triangular system and update x.
            let k = k_used;
            let mut y = DVector::<f64>::zeros(k);
            for i in (0..k).rev() {
                let mut acc = g[i];
                for l in i + 1..k {
                    acc -= h[(i, l)] * y[l];
                }
                y[i] = acc / h[(i, i)];
            }
            for i in 0..k {
                x.axpy(y[i], &basis[i], 1.0);
            }
        }
    }
}

/// Direct dense factorization path for small systems (the subgrid solver's
/// default, standing in for a sparse direct factorization).
pub fn dense_lu_solve(a: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, LinearSolveError> {
    a.clone()
        .lu()
        .solve(b)
        .ok_or(LinearSolveError::SingularFactor { row: 0 })
}

pub fn csr_to_dense(a: &CsrMatrix<f64>) -> DMatrix<f64> {
    let mut dense = DMatrix::zeros(a.nrows(), a.ncols());
    for (r, row) in a.row_iter().enumerate() {
        for (&c, &v) in row.col_indices().iter().zip(row.values()) {
            dense[(r, c)] = v;
        }
    }
    dense
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn laplacian_1d(n: usize) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        for i in 0..n {
            coo.push(i, i, 2.0);
            if i > 0 {
                coo.push(i, i - 1, -1.0);
            }
            if i + 1 < n {
                coo.push(i, i + 1, -1.0);
            }
        }
        CsrMatrix::from(&coo)
    }

    #[test]
    fn gmres_solves_laplacian_with_ilu() {
        let a = laplacian_1d(40);
        let x_exact = DVector::from_fn(40, |i, _| (i as f64 * 0.3).sin());
        let mut b = DVector::zeros(40);
        a.apply(&mut b, &x_exact);

        let pc = IluPreconditioner::factor(&a, 0.0, 0.0).unwrap();
        let solver = GmresSolver::new(1e-12, 500, 30);
        let mut x = DVector::zeros(40);
        let out = solver.solve(&a, &pc, &b, &mut x).unwrap();
        assert!((x - x_exact).norm() < 1e-9, "residual {}", out.residual);
    }

    #[test]
    fn gmres_with_jacobi_and_restart() {
        let a = laplacian_1d(25);
        let b = DVector::from_element(25, 1.0);
        let pc = JacobiPreconditioner::from_csr(&a);
        let solver = GmresSolver::new(1e-11, 2000, 10);
        let mut x = DVector::zeros(25);
        solver.solve(&a, &pc, &b, &mut x).unwrap();
        let mut r = DVector::zeros(25);
        a.apply(&mut r, &x);
        assert!((r - b).norm() < 1e-8);
    }

    #[test]
    fn ilu_on_triangular_pattern_is_exact() {
        // ILU(0) on a tridiagonal matrix reproduces the full LU, so one
        // preconditioner application solves the system.
        let a = laplacian_1d(10);
        let x_exact = DVector::from_fn(10, |i, _| 1.0 + i as f64);
        let mut b = DVector::zeros(10);
        a.apply(&mut b, &x_exact);
        let pc = IluPreconditioner::factor(&a, 0.0, 0.0).unwrap();
        let mut x = DVector::zeros(10);
        pc.apply(&mut x, &b);
        assert!((x - x_exact).norm() < 1e-10);
    }

    #[test]
    fn zero_rhs_short_circuits() {
        let a = laplacian_1d(5);
        let b = DVector::zeros(5);
        let solver = GmresSolver::new(1e-10, 50, 5);
        let mut x = DVector::from_element(5, 3.0);
        let out = solver.solve(&a, &IdentityPreconditioner, &b, &mut x).unwrap();
        assert_eq!(out.iterations, 0);
        assert!(x.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn max_iterations_reports_failure() {
        let a = laplacian_1d(30);
        let b = DVector::from_element(30, 1.0);
        let solver = GmresSolver::new(1e-14, 3, 2);
        let mut x = DVector::zeros(30);
        assert!(matches!(
            solver.solve(&a, &IdentityPreconditioner, &b, &mut x),
            Err(LinearSolveError::NotConverged { .. })
        ));
    }
}
