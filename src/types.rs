use std::fmt;
use std::str::FromStr;

use crate::error::PhenoplierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegressionModel {
    Gls,
    Ols,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupGeneAction {
    KeepFirst,
    KeepLast,
    RemoveAll,
    NoAction,
}

/// How the gene correlation matrix is turned into a whitening operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneCorrMode {
    /// Per-LV submatrix over the LV's selected genes.
    Sub,
    /// One factor over all usable genes, shared by every LV.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatrixDtype {
    Float64,
    Float32,
}

impl MatrixDtype {
    /// Shortest text that reads back to the same value at this precision.
    pub fn format_value(self, value: f64) -> String {
        match self {
            MatrixDtype::Float64 => format!("{value:?}"),
            MatrixDtype::Float32 => format!("{:?}", value as f32),
        }
    }
}

/// Rule for choosing the genes of one LV.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeneSelection {
    /// Genes whose absolute loading is within the top fraction (0, 1].
    TopPercentile(f64),
    /// Every gene with a nonzero loading.
    Nonzero,
}

/// One row of the regression output table.
#[derive(Debug, Clone, PartialEq)]
pub struct LvAssociation {
    pub lv: String,
    pub beta: f64,
    pub beta_se: f64,
    pub t: f64,
    pub pvalue: f64,
    pub pvalue_twosided: f64,
    pub n_genes: usize,
}

fn invalid(kind: &str, value: &str, allowed: &str) -> PhenoplierError {
    PhenoplierError::InvalidInput(format!(
        "invalid {kind} '{value}' (expected one of: {allowed})"
    ))
}

impl FromStr for RegressionModel {
    type Err = PhenoplierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gls" => Ok(RegressionModel::Gls),
            "ols" => Ok(RegressionModel::Ols),
            _ => Err(invalid("model", s, "gls, ols")),
        }
    }
}

impl FromStr for DupGeneAction {
    type Err = PhenoplierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep-first" => Ok(DupGeneAction::KeepFirst),
            "keep-last" => Ok(DupGeneAction::KeepLast),
            "remove-all" => Ok(DupGeneAction::RemoveAll),
            "no-action" => Ok(DupGeneAction::NoAction),
            _ => Err(invalid(
                "duplicated genes action",
                s,
                "keep-first, keep-last, remove-all, no-action",
            )),
        }
    }
}

impl FromStr for GeneCorrMode {
    type Err = PhenoplierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sub" => Ok(GeneCorrMode::Sub),
            "full" => Ok(GeneCorrMode::Full),
            _ => Err(invalid("gene correlation mode", s, "sub, full")),
        }
    }
}

impl FromStr for MatrixDtype {
    type Err = PhenoplierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float64" | "f64" => Ok(MatrixDtype::Float64),
            "float32" | "f32" => Ok(MatrixDtype::Float32),
            _ => Err(invalid("matrix dtype", s, "float64, float32")),
        }
    }
}

impl fmt::Display for DupGeneAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DupGeneAction::KeepFirst => "keep-first",
            DupGeneAction::KeepLast => "keep-last",
            DupGeneAction::RemoveAll => "remove-all",
            DupGeneAction::NoAction => "no-action",
        };
        f.write_str(s)
    }
}

impl fmt::Display for RegressionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegressionModel::Gls => f.write_str("gls"),
            RegressionModel::Ols => f.write_str("ols"),
        }
    }
}
