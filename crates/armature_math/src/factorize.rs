//! Dense factorizations with numerical-rank control.
//!
//! The solvers reuse these factorizations every control cycle, so both types
//! own their workspace and expose a `recompute` path that does not allocate.

use crate::fph;
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Failure of a factorization.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum FactorizeError {
    /// The matrix handed to the Cholesky factorization was not positive
    /// definite within working precision.
    #[error("matrix is not positive definite")]
    NotPositiveDefinite,
}

/// Column-pivoted Householder QR factorization `A·P = Q·R` with a
/// tolerance-controlled numerical rank.
///
/// Reflectors are stored compactly below the diagonal of the factored matrix
/// with an implicit unit leading coefficient, LAPACK style. Least-squares
/// solves return the minimum-norm solution when the rank is deficient, via a
/// second (unpivoted) factorization of the leading rows.
#[derive(Clone, Debug)]
pub struct PivotedQr {
    factors: DMatrix<fph>,
    tau: DVector<fph>,
    perm: Vec<usize>,
    rank: usize,
    zt: DMatrix<fph>,
    zt_tau: DVector<fph>,
    rhs: DVector<fph>,
    sol: DVector<fph>,
}

impl PivotedQr {
    /// Creates a factorization workspace for matrices of the given shape.
    pub fn new(nrows: usize, ncols: usize) -> Self {
        let kmax = nrows.min(ncols);
        Self {
            factors: DMatrix::zeros(nrows, ncols),
            tau: DVector::zeros(kmax),
            perm: (0..ncols).collect(),
            rank: 0,
            zt: DMatrix::zeros(ncols, kmax),
            zt_tau: DVector::zeros(kmax),
            rhs: DVector::zeros(nrows),
            sol: DVector::zeros(ncols),
        }
    }

    /// Factorizes the given matrix, allocating a fresh workspace.
    pub fn factorize(a: &DMatrix<fph>, tolerance: fph) -> Self {
        let mut qr = Self::new(a.nrows(), a.ncols());
        qr.recompute(a, tolerance);
        qr
    }

    /// Refactorizes a matrix of the shape this workspace was created for.
    ///
    /// The numerical rank is the number of diagonal entries of `R` exceeding
    /// `tolerance` times the largest column norm.
    ///
    /// # Panics
    /// If the shape of `a` does not match the workspace.
    pub fn recompute(&mut self, a: &DMatrix<fph>, tolerance: fph) {
        assert_eq!(
            a.shape(),
            self.factors.shape(),
            "matrix shape does not match the factorization workspace"
        );
        self.factors.copy_from(a);

        let (m, n) = self.factors.shape();
        let kmax = m.min(n);
        for (j, p) in self.perm.iter_mut().enumerate() {
            *p = j;
        }

        self.rank = kmax;
        let mut threshold = 0.0;
        for k in 0..kmax {
            let mut pivot = k;
            let mut pivot_norm = self.factors.view((k, k), (m - k, 1)).norm();
            for j in (k + 1)..n {
                let norm = self.factors.view((k, j), (m - k, 1)).norm();
                if norm > pivot_norm {
                    pivot = j;
                    pivot_norm = norm;
                }
            }
            if k == 0 {
                threshold = tolerance * pivot_norm;
            }
            if pivot_norm <= threshold || pivot_norm == 0.0 {
                self.rank = k;
                for t in self.tau.iter_mut().skip(k) {
                    *t = 0.0;
                }
                break;
            }
            if pivot != k {
                self.factors.swap_columns(k, pivot);
                self.perm.swap(k, pivot);
            }
            let tau = make_reflector(&mut self.factors, k, k, m);
            self.tau[k] = tau;
            apply_reflector_within(&mut self.factors, k, k, tau, m, n);
        }
    }

    /// The numerical rank determined during factorization.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Whether every column was numerically independent.
    pub fn is_full_column_rank(&self) -> bool {
        self.rank == self.factors.ncols()
    }

    /// The column permutation `P`, mapping factored column `k` to original
    /// column `perm[k]`.
    pub fn permutation(&self) -> &[usize] {
        &self.perm
    }

    /// Solves `A·x = b` in the least-squares sense, writing the minimum-norm
    /// solution into `x` when the numerical rank is deficient.
    ///
    /// # Panics
    /// If the lengths of `b` and `x` do not match the factored shape.
    pub fn solve_least_squares(&mut self, b: &DVector<fph>, x: &mut DVector<fph>) {
        let (m, n) = self.factors.shape();
        assert_eq!(b.len(), m, "right-hand side length does not match");
        assert_eq!(x.len(), n, "solution length does not match");

        let r = self.rank;
        if r == 0 {
            x.fill(0.0);
            return;
        }

        self.rhs.copy_from(b);
        apply_q_transpose(&self.factors, self.tau.as_slice(), r, &mut self.rhs);

        if r == n {
            for i in (0..n).rev() {
                let mut s = self.rhs[i];
                for j in (i + 1)..n {
                    s -= self.factors[(i, j)] * self.sol[j];
                }
                self.sol[i] = s / self.factors[(i, i)];
            }
        } else {
            // Minimum-norm completion: factor Zᵀ for the leading rows
            // Z = R[0..r, 0..n], then x = Q₂·R₂⁻ᵀ·y.
            for i in 0..r {
                for j in 0..n {
                    self.zt[(j, i)] = if j >= i { self.factors[(i, j)] } else { 0.0 };
                }
            }
            for k in 0..r {
                let tau = make_reflector(&mut self.zt, k, k, n);
                self.zt_tau[k] = tau;
                apply_reflector_within(&mut self.zt, k, k, tau, n, r);
            }
            for i in 0..r {
                let mut s = self.rhs[i];
                for j in 0..i {
                    s -= self.zt[(j, i)] * self.sol[j];
                }
                self.sol[i] = s / self.zt[(i, i)];
            }
            for i in r..n {
                self.sol[i] = 0.0;
            }
            for k in (0..r).rev() {
                let mut s = self.sol[k];
                for i in (k + 1)..n {
                    s += self.zt[(i, k)] * self.sol[i];
                }
                s *= self.zt_tau[k];
                self.sol[k] -= s;
                for i in (k + 1)..n {
                    self.sol[i] -= self.zt[(i, k)] * s;
                }
            }
        }

        for k in 0..n {
            x[self.perm[k]] = self.sol[k];
        }
    }

    /// The Moore-Penrose pseudo-inverse `A⁺` implied by the factorization.
    ///
    /// Allocates; intended for setup-time use, not for the solver hot path.
    pub fn pseudo_inverse(&mut self) -> DMatrix<fph> {
        let (m, n) = self.factors.shape();
        let mut inverse = DMatrix::zeros(n, m);
        let mut unit = DVector::zeros(m);
        let mut column = DVector::zeros(n);
        for j in 0..m {
            unit.fill(0.0);
            unit[j] = 1.0;
            self.solve_least_squares(&unit, &mut column);
            inverse.column_mut(j).copy_from(&column);
        }
        inverse
    }
}

/// Cholesky factorization `A = L·Lᵀ` of a symmetric positive-definite
/// matrix, reusing a caller-owned buffer between solves.
#[derive(Clone, Debug)]
pub struct Llt {
    factors: DMatrix<fph>,
}

impl Llt {
    /// Creates a factorization workspace for matrices of the given dimension.
    pub fn new(dim: usize) -> Self {
        Self {
            factors: DMatrix::zeros(dim, dim),
        }
    }

    /// Factorizes the lower triangle of the given symmetric matrix.
    ///
    /// # Panics
    /// If the shape of `a` does not match the workspace.
    pub fn recompute(&mut self, a: &DMatrix<fph>) -> Result<(), FactorizeError> {
        assert_eq!(
            a.shape(),
            self.factors.shape(),
            "matrix shape does not match the factorization workspace"
        );
        self.factors.copy_from(a);
        let n = self.factors.nrows();
        for j in 0..n {
            let mut d = self.factors[(j, j)];
            for k in 0..j {
                d -= self.factors[(j, k)].powi(2);
            }
            if d <= 0.0 {
                return Err(FactorizeError::NotPositiveDefinite);
            }
            let d = d.sqrt();
            self.factors[(j, j)] = d;
            for i in (j + 1)..n {
                let mut s = self.factors[(i, j)];
                for k in 0..j {
                    s -= self.factors[(i, k)] * self.factors[(j, k)];
                }
                self.factors[(i, j)] = s / d;
            }
        }
        Ok(())
    }

    /// Solves `A·x = b` in place using the current factorization.
    ///
    /// # Panics
    /// If the length of `b` does not match the factored dimension.
    pub fn solve_in_place(&self, b: &mut DVector<fph>) {
        let n = self.factors.nrows();
        assert_eq!(b.len(), n, "right-hand side length does not match");
        for i in 0..n {
            let mut s = b[i];
            for j in 0..i {
                s -= self.factors[(i, j)] * b[j];
            }
            b[i] = s / self.factors[(i, i)];
        }
        for i in (0..n).rev() {
            let mut s = b[i];
            for j in (i + 1)..n {
                s -= self.factors[(j, i)] * b[j];
            }
            b[i] = s / self.factors[(i, i)];
        }
    }
}

/// Generates a Householder reflector annihilating the subcolumn of `a` below
/// `(row, col)`, considering only the first `nrows` rows active. The
/// reflector is stored below the diagonal with an implicit unit leading
/// coefficient and the resulting diagonal value replaces `(row, col)`.
fn make_reflector(a: &mut DMatrix<fph>, row: usize, col: usize, nrows: usize) -> fph {
    let x0 = a[(row, col)];
    let norm = a.view((row, col), (nrows - row, 1)).norm();
    if norm == 0.0 {
        return 0.0;
    }
    let beta = if x0 >= 0.0 { -norm } else { norm };
    let tau = (beta - x0) / beta;
    let scale = 1.0 / (x0 - beta);
    for i in (row + 1)..nrows {
        a[(i, col)] *= scale;
    }
    a[(row, col)] = beta;
    tau
}

/// Applies the reflector stored at `(row.., col)` to the columns right of
/// `col`, within the active `nrows`×`ncols` block.
fn apply_reflector_within(
    a: &mut DMatrix<fph>,
    row: usize,
    col: usize,
    tau: fph,
    nrows: usize,
    ncols: usize,
) {
    if tau == 0.0 {
        return;
    }
    for j in (col + 1)..ncols {
        let mut w = a[(row, j)];
        for i in (row + 1)..nrows {
            w += a[(i, col)] * a[(i, j)];
        }
        w *= tau;
        a[(row, j)] -= w;
        for i in (row + 1)..nrows {
            a[(i, j)] -= a[(i, col)] * w;
        }
    }
}

/// Applies `Qᵀ` (the product of the first `rank` reflectors) to `b`.
fn apply_q_transpose(factors: &DMatrix<fph>, tau: &[fph], rank: usize, b: &mut DVector<fph>) {
    let m = factors.nrows();
    for k in 0..rank {
        let mut w = b[k];
        for i in (k + 1)..m {
            w += factors[(i, k)] * b[i];
        }
        w *= tau[k];
        b[k] -= w;
        for i in (k + 1)..m {
            b[i] -= factors[(i, k)] * w;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::dmatrix;

    const TOLERANCE: fph = 1e-10;

    fn solve(a: &DMatrix<fph>, b: &DVector<fph>) -> DVector<fph> {
        let mut qr = PivotedQr::factorize(a, TOLERANCE);
        let mut x = DVector::zeros(a.ncols());
        qr.solve_least_squares(b, &mut x);
        x
    }

    #[test]
    fn should_solve_square_system() {
        let a = dmatrix![
            2.0, 1.0, 0.0;
            1.0, 3.0, -1.0;
            0.0, -1.0, 4.0;
        ];
        let expected = DVector::from_vec(vec![1.0, -2.0, 3.0]);
        let b = &a * &expected;
        assert_abs_diff_eq!(solve(&a, &b), expected, epsilon = 1e-12);
    }

    #[test]
    fn should_report_full_rank_for_well_conditioned_matrix() {
        let a = dmatrix![
            2.0, 1.0;
            1.0, 3.0;
            0.5, -1.0;
        ];
        let qr = PivotedQr::factorize(&a, TOLERANCE);
        assert_eq!(qr.rank(), 2);
        assert!(qr.is_full_column_rank());
    }

    #[test]
    fn should_detect_rank_deficiency() {
        let a = dmatrix![
            1.0, 2.0, 3.0;
            2.0, 4.0, 6.0;
            -1.0, -2.0, -3.0;
        ];
        let qr = PivotedQr::factorize(&a, TOLERANCE);
        assert_eq!(qr.rank(), 1);
    }

    #[test]
    fn should_solve_overdetermined_consistent_system() {
        let a = dmatrix![
            1.0, 0.0;
            0.0, 1.0;
            1.0, 1.0;
        ];
        let expected = DVector::from_vec(vec![2.0, -1.0]);
        let b = &a * &expected;
        assert_abs_diff_eq!(solve(&a, &b), expected, epsilon = 1e-12);
    }

    #[test]
    fn should_solve_overdetermined_inconsistent_system_in_least_squares_sense() {
        // Fitting a constant to samples 1, 2, 3 gives their mean.
        let a = dmatrix![1.0; 1.0; 1.0];
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert_abs_diff_eq!(solve(&a, &b)[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn should_return_minimum_norm_solution_for_underdetermined_system() {
        let a = dmatrix![1.0, 1.0];
        let b = DVector::from_vec(vec![2.0]);
        let x = solve(&a, &b);
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn should_return_minimum_norm_solution_for_rank_deficient_square_system() {
        let a = dmatrix![
            1.0, 1.0;
            1.0, 1.0;
        ];
        let b = DVector::from_vec(vec![2.0, 2.0]);
        let x = solve(&a, &b);
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn should_reuse_workspace_across_recomputes() {
        let a = dmatrix![
            1.0, 0.0;
            0.0, 1.0;
        ];
        let mut qr = PivotedQr::factorize(&a, TOLERANCE);
        let b = DVector::from_vec(vec![3.0, 4.0]);
        let mut x = DVector::zeros(2);
        qr.solve_least_squares(&b, &mut x);
        assert_abs_diff_eq!(x, b, epsilon = 1e-13);

        let a2 = dmatrix![
            0.0, 2.0;
            2.0, 0.0;
        ];
        qr.recompute(&a2, TOLERANCE);
        qr.solve_least_squares(&b, &mut x);
        assert_abs_diff_eq!(x, DVector::from_vec(vec![2.0, 1.5]), epsilon = 1e-13);
    }

    #[test]
    fn should_produce_pseudo_inverse_matching_normal_equations() {
        let a = dmatrix![
            1.0, 0.0;
            0.0, 2.0;
            0.0, 0.0;
        ];
        let mut qr = PivotedQr::factorize(&a, TOLERANCE);
        let pinv = qr.pseudo_inverse();
        let expected = dmatrix![
            1.0, 0.0, 0.0;
            0.0, 0.5, 0.0;
        ];
        assert_abs_diff_eq!(pinv, expected, epsilon = 1e-12);
    }

    #[test]
    fn should_solve_with_llt() {
        let a = dmatrix![
            4.0, 1.0, 0.0;
            1.0, 5.0, 2.0;
            0.0, 2.0, 6.0;
        ];
        let expected = DVector::from_vec(vec![0.5, -1.0, 2.0]);
        let mut b = &a * &expected;
        let mut llt = Llt::new(3);
        llt.recompute(&a).unwrap();
        llt.solve_in_place(&mut b);
        assert_abs_diff_eq!(b, expected, epsilon = 1e-12);
    }

    #[test]
    fn should_reject_indefinite_matrix_in_llt() {
        let a = dmatrix![
            1.0, 2.0;
            2.0, 1.0;
        ];
        let mut llt = Llt::new(2);
        assert_eq!(llt.recompute(&a), Err(FactorizeError::NotPositiveDefinite));
    }

    #[test]
    fn should_reject_semidefinite_matrix_in_llt() {
        let a = dmatrix![
            1.0, 1.0;
            1.0, 1.0;
        ];
        let mut llt = Llt::new(2);
        assert_eq!(llt.recompute(&a), Err(FactorizeError::NotPositiveDefinite));
    }
}
