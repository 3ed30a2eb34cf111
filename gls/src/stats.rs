use anyhow::{Context, Result};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Two-sided p-value of a t statistic with `df` degrees of freedom.
pub fn t_pvalue_twosided(t: f64, df: f64) -> Result<f64> {
    if !t.is_finite() {
        return Ok(f64::NAN);
    }
    let dist = StudentsT::new(0.0, 1.0, df).context("Student t distribution")?;
    Ok((2.0 * dist.sf(t.abs())).min(1.0))
}

/// Halves the two-sided p-value and reflects it by the sign of the estimate,
/// giving the upper-tail test of `beta > 0`.
pub fn one_sided_pvalue(pvalue_twosided: f64, beta: f64) -> f64 {
    if !pvalue_twosided.is_finite() {
        return f64::NAN;
    }
    if beta > 0.0 {
        pvalue_twosided / 2.0
    } else {
        1.0 - pvalue_twosided / 2.0
    }
}
