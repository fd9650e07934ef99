//! Dense linear-algebra helpers shared by the model and acquisition code.

use nalgebra::{DMatrix, DVector};

/// Diagonal jitter always added before factorizing a covariance matrix.
pub(crate) const BASE_JITTER: f64 = 1e-6;

/// Number of times the jitter is multiplied by ten before giving up.
const MAX_JITTER_TRIES: usize = 4;

/// Lower Cholesky factor of `matrix + jitter·I`, escalating the jitter
/// (`1e-6`, `1e-5`, … `1e-2`) until the factorization succeeds.
///
/// Returns `None` if every attempt fails or the input is not finite.
pub(crate) fn jittered_cholesky(matrix: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let n = matrix.nrows();
    let mut jitter = BASE_JITTER;
    for _ in 0..=MAX_JITTER_TRIES {
        let mut m = matrix.clone();
        for i in 0..n {
            m[(i, i)] += jitter;
        }
        if let Some(chol) = nalgebra::linalg::Cholesky::new(m) {
            return Some(chol.l());
        }
        jitter *= 10.0;
    }
    None
}

/// Lower factor used to draw correlated samples from a (possibly singular)
/// covariance. Falls back to the square root of the clamped diagonal when no
/// jitter level makes the matrix factorizable.
pub(crate) fn sampling_factor(cov: &DMatrix<f64>) -> DMatrix<f64> {
    jittered_cholesky(cov).unwrap_or_else(|| {
        let n = cov.nrows();
        DMatrix::from_fn(n, n, |i, j| {
            if i == j {
                let d = cov[(i, i)];
                if d.is_finite() { d.max(0.0).sqrt() } else { 0.0 }
            } else {
                0.0
            }
        })
    })
}

/// Replace `m` by `(m + mᵀ) / 2`.
pub(crate) fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

/// `μ + L z` for a lower factor `L`.
pub(crate) fn correlated_sample(mean: &DVector<f64>, factor: &DMatrix<f64>, z: &[f64]) -> Vec<f64> {
    let n = mean.len();
    (0..n)
        .map(|i| {
            let mut v = mean[i];
            for (j, zj) in z.iter().enumerate().take(i + 1) {
                v += factor[(i, j)] * zj;
            }
            v
        })
        .collect()
}

/// Sum of `ln |L_ii|` over the diagonal of a triangular factor.
pub(crate) fn log_abs_diag_sum(l: &DMatrix<f64>) -> f64 {
    (0..l.nrows()).map(|i| l[(i, i)].abs().ln()).sum()
}
