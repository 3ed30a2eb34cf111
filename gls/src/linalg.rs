use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, Inverse, UPLO};

/// Returns `L^-1` where `matrix = L L'`. Fails when `matrix` is not positive definite.
pub fn inverse_cholesky_factor(matrix: &Array2<f64>) -> Result<Array2<f64>> {
    let (n, m) = matrix.dim();
    if n != m {
        return Err(anyhow::anyhow!("matrix must be square, got {n}x{m}"));
    }
    if n == 0 {
        return Err(anyhow::anyhow!("matrix must not be empty"));
    }
    let lower = matrix
        .cholesky(UPLO::Lower)
        .context("Cholesky decomposition failed (matrix is not positive definite)")?;
    lower.inv().context("invert Cholesky factor")
}

pub fn whiten_vector(l_inv: &Array2<f64>, v: &Array1<f64>) -> Array1<f64> {
    l_inv.dot(v)
}

pub fn whiten_matrix(l_inv: &Array2<f64>, x: &Array2<f64>) -> Array2<f64> {
    l_inv.dot(x)
}
