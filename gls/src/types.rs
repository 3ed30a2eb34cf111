use ndarray::{Array1, Array2};

#[derive(Debug, Clone)]
pub struct RegressionInput {
    pub y: Array1<f64>,
    pub x: Array2<f64>,
    pub names: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Coefficient {
    pub name: String,
    pub beta: f64,
    pub se: f64,
    pub t: f64,
    pub pvalue_twosided: f64,
    /// Upper-tail p-value: small when `beta` is large and positive.
    pub pvalue_onesided: f64,
}

#[derive(Debug, Clone)]
pub struct RegressionFit {
    pub coefficients: Vec<Coefficient>,
    pub n_obs: usize,
    pub df_resid: f64,
    pub sigma2: f64,
    pub whitened: bool,
}

impl RegressionFit {
    pub fn coefficient(&self, name: &str) -> Option<&Coefficient> {
        self.coefficients.iter().find(|c| c.name == name)
    }
}
