//! Linear algebra helpers for covariance square roots and SPD solves.
//!
//! Both the sigma point square root and the innovation covariance solves go through the same
//! factorization:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Cholesky of P + εI with ε on a bounded geometric ramp
//! 4) Give up and report `None`; the filter turns that into a numerical instability error.
//!
//! The ramp only absorbs round-off sized defects. A genuinely indefinite covariance is rejected.

use log::trace;
use nalgebra::linalg::{Cholesky, SymmetricEigen};
use nalgebra::{DMatrix, Dyn};

/// Bounds of the diagonal jitter ramp.
#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    /// First jitter tried after a plain factorization fails
    pub initial_jitter: f64,
    /// Largest jitter ever added to the diagonal
    pub max_jitter: f64,
    pub max_tries: usize,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            initial_jitter: 1e-12,
            max_jitter: 1e-6,
            max_tries: 6,
        }
    }
}

/// Cholesky factor of the symmetrized matrix, retrying with diagonal jitter.
fn factor(matrix: &DMatrix<f64>, opt: SolveOptions) -> Option<Cholesky<f64, Dyn>> {
    if !matrix.is_square() || !is_finite(matrix) {
        return None;
    }
    let p = symmetrize(matrix);
    if let Some(ch) = Cholesky::new(p.clone()) {
        return Some(ch);
    }
    let n = p.nrows();
    let mut jitter = opt.initial_jitter;
    for _ in 0..opt.max_tries {
        if jitter > opt.max_jitter {
            break;
        }
        if let Some(ch) = Cholesky::new(&p + DMatrix::<f64>::identity(n, n) * jitter) {
            trace!("Cholesky succeeded with diagonal jitter {:e}", jitter);
            return Some(ch);
        }
        jitter *= 10.0;
    }
    None
}

/// Lower triangular `L` with `matrix ≈ L Lᵀ`.
///
/// # Returns
/// `None` if the matrix is not square, holds non-finite entries, or is not positive definite
/// even after the jitter ramp of [`SolveOptions::default`].
pub fn matrix_square_root(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    factor(matrix, SolveOptions::default()).map(|ch| ch.l())
}

/// True when `matrix` factors under the default jitter ramp, so it can seed sigma points.
pub fn is_positive_definite(matrix: &DMatrix<f64>) -> bool {
    factor(matrix, SolveOptions::default()).is_some()
}

/// Solve `A X = B` for symmetric positive definite `A`.
pub fn chol_solve_spd(a: &DMatrix<f64>, b: &DMatrix<f64>, opt: SolveOptions) -> Option<DMatrix<f64>> {
    if a.nrows() != b.nrows() {
        return None;
    }
    factor(a, opt).map(|ch| ch.solve(b))
}

/// P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

pub fn is_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|v| v.is_finite())
}

/// True when `m` is square and `|m - mᵀ|` is within `tol` everywhere.
pub fn is_symmetric(m: &DMatrix<f64>, tol: f64) -> bool {
    m.is_square() && (m - m.transpose()).amax() <= tol
}

/// True when `m` is symmetric (within `tol`) and its smallest eigenvalue is no less than `-tol`.
pub fn is_positive_semidefinite(m: &DMatrix<f64>, tol: f64) -> bool {
    if !is_finite(m) || !is_symmetric(m, tol) {
        return false;
    }
    SymmetricEigen::new(symmetrize(m))
        .eigenvalues
        .iter()
        .all(|&lambda| lambda >= -tol)
}
