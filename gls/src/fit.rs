use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use ndarray_linalg::Inverse;
use tracing::debug;

use crate::linalg::{inverse_cholesky_factor, whiten_matrix, whiten_vector};
use crate::stats::{one_sided_pvalue, t_pvalue_twosided};
use crate::types::{Coefficient, RegressionFit, RegressionInput};

pub trait RegressionEngine {
    fn fit(&self, input: &RegressionInput) -> Result<RegressionFit>;
}

/// Ordinary least squares on the raw observations.
#[derive(Debug, Clone, Default)]
pub struct OlsEngine;

impl RegressionEngine for OlsEngine {
    fn fit(&self, input: &RegressionInput) -> Result<RegressionFit> {
        fit_least_squares(&input.y, &input.x, &input.names, false)
    }
}

/// Generalized least squares with a known correlation matrix `Σ = L L'`.
///
/// Observations and design are premultiplied by `L^-1`, which turns the
/// correlated-residual problem into ordinary least squares.
#[derive(Debug, Clone)]
pub struct GlsEngine {
    chol_inv: Array2<f64>,
}

impl GlsEngine {
    pub fn from_correlation(corr: &Array2<f64>) -> Result<Self> {
        let chol_inv = inverse_cholesky_factor(corr)?;
        Ok(Self { chol_inv })
    }

    pub fn from_inverse_factor(chol_inv: Array2<f64>) -> Result<Self> {
        let (n, m) = chol_inv.dim();
        if n != m {
            return Err(anyhow::anyhow!(
                "inverse Cholesky factor must be square, got {n}x{m}"
            ));
        }
        Ok(Self { chol_inv })
    }

    pub fn inverse_factor(&self) -> &Array2<f64> {
        &self.chol_inv
    }

    pub fn dim(&self) -> usize {
        self.chol_inv.nrows()
    }
}

impl RegressionEngine for GlsEngine {
    fn fit(&self, input: &RegressionInput) -> Result<RegressionFit> {
        if input.y.len() != self.dim() {
            return Err(anyhow::anyhow!(
                "whitening factor dimension {} does not match {} observations",
                self.dim(),
                input.y.len()
            ));
        }
        let y = whiten_vector(&self.chol_inv, &input.y);
        let x = whiten_matrix(&self.chol_inv, &input.x);
        fit_least_squares(&y, &x, &input.names, true)
    }
}

fn fit_least_squares(
    y: &Array1<f64>,
    x: &Array2<f64>,
    names: &[String],
    whitened: bool,
) -> Result<RegressionFit> {
    let (n, p) = x.dim();
    if y.len() != n {
        return Err(anyhow::anyhow!(
            "design rows ({n}) must match observations ({})",
            y.len()
        ));
    }
    if names.len() != p {
        return Err(anyhow::anyhow!(
            "{} column names given for {p} design columns",
            names.len()
        ));
    }
    if n <= p {
        return Err(anyhow::anyhow!(
            "not enough observations ({n}) for {p} parameters"
        ));
    }

    let xt = x.t();
    let xtx = xt.dot(x);
    let xtx_inv = xtx.inv().context("X'X is singular")?;
    let beta = xtx_inv.dot(&xt.dot(y));

    let resid = y - &x.dot(&beta);
    let df_resid = (n - p) as f64;
    let sigma2 = resid.dot(&resid) / df_resid;
    debug!("least squares: n={n}, p={p}, sigma2={sigma2}, whitened={whitened}");

    let mut coefficients = Vec::with_capacity(p);
    for (i, name) in names.iter().enumerate() {
        let b = beta[i];
        let var = sigma2 * xtx_inv[(i, i)];
        let se = if var >= 0.0 { var.sqrt() } else { f64::NAN };
        let t = if se > 0.0 { b / se } else { f64::NAN };
        let pvalue_twosided = t_pvalue_twosided(t, df_resid)?;
        coefficients.push(Coefficient {
            name: name.clone(),
            beta: b,
            se,
            t,
            pvalue_twosided,
            pvalue_onesided: one_sided_pvalue(pvalue_twosided, b),
        });
    }

    Ok(RegressionFit {
        coefficients,
        n_obs: n,
        df_resid,
        sigma2,
        whitened,
    })
}
