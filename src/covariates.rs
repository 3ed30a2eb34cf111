//! Gene-level regression covariates.

use std::fmt;
use std::str::FromStr;

use ndarray::Array2;

use crate::error::{PhenoplierError, Result};
use crate::metadata::CohortMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Covariate {
    GeneSize,
    GeneSizeLog,
    GeneDensity,
    GeneDensityLog,
    GeneNSnpsUsed,
    GeneNSnpsUsedLog,
    GeneNSnpsUsedDensity,
    GeneNSnpsUsedDensityLog,
}

pub const ALL_COVARIATES: [Covariate; 8] = [
    Covariate::GeneSize,
    Covariate::GeneSizeLog,
    Covariate::GeneDensity,
    Covariate::GeneDensityLog,
    Covariate::GeneNSnpsUsed,
    Covariate::GeneNSnpsUsedLog,
    Covariate::GeneNSnpsUsedDensity,
    Covariate::GeneNSnpsUsedDensityLog,
];

pub const DEFAULT_COVARIATES: [Covariate; 4] = [
    Covariate::GeneSize,
    Covariate::GeneSizeLog,
    Covariate::GeneDensity,
    Covariate::GeneDensityLog,
];

impl Covariate {
    pub fn name(self) -> &'static str {
        match self {
            Covariate::GeneSize => "gene_size",
            Covariate::GeneSizeLog => "gene_size_log",
            Covariate::GeneDensity => "gene_density",
            Covariate::GeneDensityLog => "gene_density_log",
            Covariate::GeneNSnpsUsed => "gene_n_snps_used",
            Covariate::GeneNSnpsUsedLog => "gene_n_snps_used_log",
            Covariate::GeneNSnpsUsedDensity => "gene_n_snps_used_density",
            Covariate::GeneNSnpsUsedDensityLog => "gene_n_snps_used_density_log",
        }
    }

    /// The raw covariate a `_log` covariate is computed from.
    pub fn base(self) -> Option<Covariate> {
        match self {
            Covariate::GeneSizeLog => Some(Covariate::GeneSize),
            Covariate::GeneDensityLog => Some(Covariate::GeneDensity),
            Covariate::GeneNSnpsUsedLog => Some(Covariate::GeneNSnpsUsed),
            Covariate::GeneNSnpsUsedDensityLog => Some(Covariate::GeneNSnpsUsedDensity),
            _ => None,
        }
    }

    pub fn is_density(self) -> bool {
        matches!(
            self,
            Covariate::GeneDensity
                | Covariate::GeneDensityLog
                | Covariate::GeneNSnpsUsedDensity
                | Covariate::GeneNSnpsUsedDensityLog
        )
    }

    /// Needs the cohort metadata table.
    pub fn is_snp_level(self) -> bool {
        matches!(
            self,
            Covariate::GeneNSnpsUsed
                | Covariate::GeneNSnpsUsedLog
                | Covariate::GeneNSnpsUsedDensity
                | Covariate::GeneNSnpsUsedDensityLog
        )
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Covariate {
    type Err = PhenoplierError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_COVARIATES
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| PhenoplierError::InvalidInput(format!("unknown covariate '{s}'")))
    }
}

/// Parses a space- or comma-separated covariate list. `all` and `default`
/// expand to their sets. The result is sorted by name and passes
/// [`check_log_bases`].
pub fn parse_covariates(selection: &str) -> Result<Vec<Covariate>> {
    let tokens: Vec<&str> = selection
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect();
    let mut selected: Vec<Covariate> = if tokens.contains(&"all") {
        ALL_COVARIATES.to_vec()
    } else if tokens.contains(&"default") {
        DEFAULT_COVARIATES.to_vec()
    } else {
        tokens
            .iter()
            .map(|t| t.parse())
            .collect::<Result<Vec<_>>>()?
    };
    selected.sort_by_key(|c| c.name());
    selected.dedup();
    check_log_bases(&selected)?;
    Ok(selected)
}

/// Every `_log` covariate must come with its base covariate.
pub fn check_log_bases(selected: &[Covariate]) -> Result<()> {
    for c in selected {
        if let Some(base) = c.base()
            && !selected.contains(&base)
        {
            return Err(PhenoplierError::InvalidInput(format!(
                "covariate {c} requires {base} to be selected too"
            )));
        }
    }
    Ok(())
}

/// Per-gene inputs of the covariates, aligned by position.
#[derive(Debug, Clone, Copy)]
pub struct CovariateSource<'a> {
    pub genes: &'a [String],
    /// Number of SNPs tested for the gene (`n`).
    pub n: Option<&'a [f64]>,
    /// Number of independent SNPs (`n_indep`).
    pub n_indep: Option<&'a [f64]>,
    pub cohort: Option<&'a CohortMetadata>,
}

fn raw_value(cov: Covariate, src: &CovariateSource<'_>, i: usize) -> Result<f64> {
    let missing = |what: &str| {
        PhenoplierError::MissingColumn(format!("covariate {cov} needs input column '{what}'"))
    };
    let cohort = || {
        src.cohort.ok_or_else(|| {
            PhenoplierError::InvalidInput(format!(
                "covariate {cov} needs the cohort metadata (--cohort-metadata)"
            ))
        })
    };
    let gene = &src.genes[i];
    Ok(match cov {
        Covariate::GeneSize => src.n_indep.ok_or_else(|| missing("n_indep"))?[i],
        Covariate::GeneDensity => {
            let n_indep = src.n_indep.ok_or_else(|| missing("n_indep"))?[i];
            let n = src.n.ok_or_else(|| missing("n"))?[i];
            n_indep / n
        }
        Covariate::GeneNSnpsUsed => cohort()?.n_snps_used_sum(gene).unwrap_or(f64::NAN),
        Covariate::GeneNSnpsUsedDensity => {
            let c = cohort()?;
            match (c.n_snps_used_sum(gene), c.unique_n_snps_used(gene)) {
                (Some(sum), Some(unique)) => sum / unique,
                _ => f64::NAN,
            }
        }
        other => {
            return Err(PhenoplierError::InvalidInput(format!(
                "{other} is not a raw covariate"
            )));
        }
    })
}

/// Covariate values (genes × selected). Log covariates use the natural log;
/// density logs are negated. Missing or undefined values are NaN.
pub fn compute_covariates(selected: &[Covariate], src: &CovariateSource<'_>) -> Result<Array2<f64>> {
    check_log_bases(selected)?;
    let n = src.genes.len();
    let mut out = Array2::<f64>::from_elem((n, selected.len()), f64::NAN);
    for (j, &cov) in selected.iter().enumerate() {
        let raw = cov.base().unwrap_or(cov);
        for i in 0..n {
            let v = raw_value(raw, src, i)?;
            out[(i, j)] = match cov.base() {
                None => v,
                Some(_) if cov.is_density() => -v.ln(),
                Some(_) => v.ln(),
            };
        }
    }
    out.mapv_inplace(|v| if v.is_finite() { v } else { f64::NAN });
    Ok(out)
}
