//! LV-trait association: one whitened regression per LV.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gls::{GlsEngine, OlsEngine, RegressionEngine, RegressionInput};
use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use tracing::{info, warn};

use crate::batch::LvSelection;
use crate::covariates::{Covariate, CovariateSource, compute_covariates};
use crate::df_utils::{f64_column, filter_missing, require_columns, string_column};
use crate::error::PhenoplierError;
use crate::io::{read_labeled_matrix, read_table, write_dataframe};
use crate::logging::Verbosity;
use crate::lv_model::LvModel;
use crate::matrix::LabeledMatrix;
use crate::metadata::CohortMetadata;
use crate::types::{DupGeneAction, GeneCorrMode, GeneSelection, LvAssociation, RegressionModel};
use crate::whiten::{LvWhitener, select_lv_genes};

pub const GENE_COLUMN: &str = "gene_name";
pub const PVALUE_COLUMN: &str = "pvalue";
const LV_TERM: &str = "lv";
const CONST_TERM: &str = "const";

#[derive(Debug, Clone)]
pub struct RegressionConfig {
    pub input_file: PathBuf,
    pub output_file: PathBuf,
    pub lv_model: PathBuf,
    pub model: RegressionModel,
    /// Labeled matrix file or per-LV artifact directory.
    pub gene_corr_file: Option<PathBuf>,
    pub gene_corr_mode: GeneCorrMode,
    pub dup_genes_action: DupGeneAction,
    pub covariates: Vec<Covariate>,
    pub cohort_metadata: Option<PathBuf>,
    pub lvs: LvSelection,
    pub selection: GeneSelection,
}

/// Row mask implementing a duplicated-gene policy.
pub fn dedup_mask(genes: &[String], action: DupGeneAction) -> Vec<bool> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for g in genes {
        *counts.entry(g.as_str()).or_default() += 1;
    }
    let mut seen: HashMap<&str, usize> = HashMap::new();
    genes
        .iter()
        .map(|g| {
            let total = counts[g.as_str()];
            let nth = seen.entry(g.as_str()).or_default();
            *nth += 1;
            match action {
                DupGeneAction::KeepFirst => *nth == 1,
                DupGeneAction::KeepLast => *nth == total,
                DupGeneAction::RemoveAll => total == 1,
                DupGeneAction::NoAction => true,
            }
        })
        .collect()
}

/// Gene-level trait data ready for fitting.
#[derive(Debug, Clone)]
pub struct TraitData {
    pub genes: Vec<String>,
    /// −log10(p-value).
    pub y: Array1<f64>,
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
}

impl TraitData {
    fn rows(&self) -> HashMap<&str, usize> {
        self.genes
            .iter()
            .enumerate()
            .map(|(i, g)| (g.as_str(), i))
            .collect()
    }
}

fn log_pvalue_stats(pvalues: &[f64]) {
    let observed: Vec<f64> = pvalues.iter().copied().filter(|p| !p.is_nan()).collect();
    let n_missing = pvalues.len() - observed.len();
    let min = observed.iter().copied().fold(f64::INFINITY, f64::min);
    let max = observed.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = observed.iter().sum::<f64>() / observed.len().max(1) as f64;
    info!(
        "p-values statistics: min={min:.1e} | mean={mean:.1e} | max={max:.1e} | # missing={n_missing} ({:.1}%)",
        100.0 * n_missing as f64 / pvalues.len().max(1) as f64
    );
    if min < 0.0 {
        warn!("Some p-values are smaller than 0.0");
    }
    if max > 1.0 {
        warn!("Some p-values are greater than 1.0");
    }
}

/// −log10 of the p-values, with exact zeros first replaced by a tenth of
/// the smallest nonzero p-value.
pub fn pvalues_to_statistic(pvalues: &[f64]) -> Vec<f64> {
    let min_nonzero = pvalues
        .iter()
        .copied()
        .filter(|p| *p > 0.0)
        .fold(f64::INFINITY, f64::min);
    pvalues
        .iter()
        .map(|&p| {
            let p = if p == 0.0 { min_nonzero / 10.0 } else { p };
            -p.log10()
        })
        .collect()
}

/// Reads and cleans the gene-level input: deduplication, uniqueness check,
/// missing p-values dropped, covariates attached.
pub fn prepare_trait_table(
    df: DataFrame,
    dup_action: DupGeneAction,
    covariates: &[Covariate],
    cohort: Option<&CohortMetadata>,
) -> Result<TraitData> {
    require_columns(&df, &[GENE_COLUMN, PVALUE_COLUMN], "input data")?;
    info!("Input file has {} genes", df.height());

    let names = string_column(&df, GENE_COLUMN)?;
    let keep = dedup_mask(&names, dup_action);
    let mask = BooleanChunked::from_slice("keep".into(), &keep);
    let df = df.filter(&mask)?;
    info!(
        "Removed duplicated genes symbols using '{dup_action}'. Data now has {} genes",
        df.height()
    );

    let names = string_column(&df, GENE_COLUMN)?;
    let unique: HashSet<&str> = names.iter().map(|s| s.as_str()).collect();
    if unique.len() != names.len() {
        return Err(PhenoplierError::InvalidInput(
            "Duplicated genes in input data; use a duplicated genes action to skip them".to_string(),
        )
        .into());
    }

    log_pvalue_stats(&f64_column(&df, PVALUE_COLUMN)?);
    let (df, removed) = filter_missing(df, PVALUE_COLUMN)?;
    if removed > 0 {
        info!("Dropped {removed} genes with missing p-values");
    }

    let genes = string_column(&df, GENE_COLUMN)?;
    let y = pvalues_to_statistic(&f64_column(&df, PVALUE_COLUMN)?);

    let n = optional_f64(&df, "n")?;
    let n_indep = optional_f64(&df, "n_indep")?;
    let source = CovariateSource {
        genes: &genes,
        n: n.as_deref(),
        n_indep: n_indep.as_deref(),
        cohort,
    };
    let covars = compute_covariates(covariates, &source)?;

    // Genes with an undefined covariate cannot enter the fit.
    let complete: Vec<usize> = (0..genes.len())
        .filter(|&i| covars.row(i).iter().all(|v| v.is_finite()) && y[i].is_finite())
        .collect();
    if complete.len() < genes.len() {
        warn!(
            "Dropped {} genes with undefined covariates or p-values",
            genes.len() - complete.len()
        );
    }

    Ok(TraitData {
        genes: complete.iter().map(|&i| genes[i].clone()).collect(),
        y: complete.iter().map(|&i| y[i]).collect(),
        covariates: covars.select(Axis(0), &complete),
        covariate_names: covariates.iter().map(|c| c.name().to_string()).collect(),
    })
}

fn optional_f64(df: &DataFrame, name: &str) -> Result<Option<Vec<f64>>> {
    if df.column(name).is_ok() {
        Ok(Some(f64_column(df, name)?))
    } else {
        Ok(None)
    }
}

fn standardize(values: &mut [f64], name: &str) -> Result<()> {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let sd = var.sqrt();
    if !(sd.is_finite() && sd > 0.0) {
        return Err(PhenoplierError::Numerical(format!(
            "column {name} is constant over the fitted genes"
        ))
        .into());
    }
    for v in values.iter_mut() {
        *v = (*v - mean) / sd;
    }
    Ok(())
}

/// Design `[const, lv, covariates...]` over `rows` of the trait data, with
/// every non-constant column standardized.
pub fn design_matrix(
    trait_data: &TraitData,
    rows: &[usize],
    loadings: &[f64],
) -> Result<RegressionInput> {
    let n = rows.len();
    let k = trait_data.covariate_names.len();
    let mut x = Array2::<f64>::ones((n, 2 + k));

    let mut lv = loadings.to_vec();
    standardize(&mut lv, LV_TERM)?;
    x.column_mut(1).assign(&Array1::from(lv));
    for (j, name) in trait_data.covariate_names.iter().enumerate() {
        let mut col: Vec<f64> = rows
            .iter()
            .map(|&r| trait_data.covariates[(r, j)])
            .collect();
        standardize(&mut col, name)?;
        x.column_mut(2 + j).assign(&Array1::from(col));
    }

    let mut names = vec![CONST_TERM.to_string(), LV_TERM.to_string()];
    names.extend(trait_data.covariate_names.iter().cloned());
    Ok(RegressionInput {
        y: rows.iter().map(|&r| trait_data.y[r]).collect(),
        x,
        names,
    })
}

/// Fits one LV over `genes` (all present in the trait data and LV model).
pub fn fit_lv(
    lv: &str,
    genes: &[String],
    trait_data: &TraitData,
    model: &LvModel,
    engine: &dyn RegressionEngine,
) -> Result<LvAssociation> {
    let index = trait_data.rows();
    let mut rows = Vec::with_capacity(genes.len());
    let mut loadings = Vec::with_capacity(genes.len());
    for g in genes {
        let (Some(&r), Some(l)) = (index.get(g.as_str()), model.loading(g, lv)) else {
            return Err(PhenoplierError::InvalidInput(format!(
                "gene {g} of {lv} is missing from the trait data or LV model"
            ))
            .into());
        };
        rows.push(r);
        loadings.push(l);
    }

    let input = design_matrix(trait_data, &rows, &loadings)
        .with_context(|| format!("design matrix of {lv}"))?;
    let fit = engine
        .fit(&input)
        .map_err(|e| PhenoplierError::Numerical(format!("fit of {lv}: {e:#}")))?;
    let coef = fit.coefficient(LV_TERM).ok_or_else(|| {
        PhenoplierError::Numerical(format!("fit of {lv} has no LV coefficient"))
    })?;
    Ok(LvAssociation {
        lv: lv.to_string(),
        beta: coef.beta,
        beta_se: coef.se,
        t: coef.t,
        pvalue: coef.pvalue_onesided,
        pvalue_twosided: coef.pvalue_twosided,
        n_genes: fit.n_obs,
    })
}

enum CorrSource {
    None,
    Matrix(LabeledMatrix),
    Artifacts(PathBuf),
}

fn load_corr_source(config: &RegressionConfig) -> Result<CorrSource> {
    match (config.model, &config.gene_corr_file) {
        (RegressionModel::Gls, None) => Err(PhenoplierError::InvalidInput(
            "the gls model needs a gene correlation file".to_string(),
        )
        .into()),
        (RegressionModel::Ols, Some(_)) => Err(PhenoplierError::InvalidInput(
            "a gene correlation file cannot be used with the ols model".to_string(),
        )
        .into()),
        (RegressionModel::Ols, None) => Ok(CorrSource::None),
        (RegressionModel::Gls, Some(path)) if path.is_dir() => {
            if config.gene_corr_mode == GeneCorrMode::Full {
                return Err(PhenoplierError::InvalidInput(
                    "full gene correlation mode needs a matrix file, not an artifact directory"
                        .to_string(),
                )
                .into());
            }
            info!("Using per-LV whitening artifacts in {}", path.display());
            Ok(CorrSource::Artifacts(path.clone()))
        }
        (RegressionModel::Gls, Some(path)) => {
            info!("Using gene correlation file: {}", path.display());
            Ok(CorrSource::Matrix(read_labeled_matrix(path)?))
        }
    }
}

/// Runs the regression for every selected LV and returns the rows sorted by
/// one-sided p-value.
pub fn regression(config: &RegressionConfig) -> Result<Vec<LvAssociation>> {
    let corr = load_corr_source(config)?;
    let needs_cohort = config.covariates.iter().any(|c| c.is_snp_level());
    let cohort = match (&config.cohort_metadata, needs_cohort) {
        (Some(path), true) => Some(CohortMetadata::from_path(path, config.dup_genes_action)?),
        (None, true) => {
            return Err(PhenoplierError::InvalidInput(
                "SNP-level covariates need the cohort metadata (--cohort-metadata)".to_string(),
            )
            .into());
        }
        _ => None,
    };
    if config.covariates.is_empty() {
        info!("Running {} without covariates", config.model);
    } else {
        let names: Vec<&str> = config.covariates.iter().map(|c| c.name()).collect();
        info!("Using covariates: {}", names.join(", "));
    }

    let df = read_table(&config.input_file)?;
    let trait_data = prepare_trait_table(
        df,
        config.dup_genes_action,
        &config.covariates,
        cohort.as_ref(),
    )?;

    let model = LvModel::from_table(&config.lv_model)?;
    info!("{} LVs (gene modules) were found in LV model", model.lvs().len());
    let lvs = config.lvs.resolve(model.lvs())?;
    info!("{} LVs selected", lvs.len());

    let common: Vec<String> = trait_data
        .genes
        .iter()
        .filter(|g| model.gene_position(g).is_some())
        .filter(|g| match &corr {
            CorrSource::Matrix(m) => m.contains(g),
            _ => true,
        })
        .cloned()
        .collect();
    info!("{} genes shared by the input data and the LV model", common.len());

    let full = match (&corr, config.gene_corr_mode) {
        (CorrSource::Matrix(m), GeneCorrMode::Full) => Some(LvWhitener::compute("full", m, &common)?),
        _ => None,
    };
    let common_set: HashSet<&str> = common.iter().map(|s| s.as_str()).collect();

    let mut results = Vec::with_capacity(lvs.len());
    for (idx, lv) in lvs.iter().enumerate() {
        let verbosity = Verbosity::for_iteration(idx);
        info!("Computing for {lv}");

        let (genes, engine): (Vec<String>, Box<dyn RegressionEngine>) = match (&corr, &full) {
            (_, Some(w)) => (
                common.clone(),
                Box::new(GlsEngine::from_inverse_factor(w.chol_inv.clone())?),
            ),
            (CorrSource::None, _) => {
                let genes = match config.gene_corr_mode {
                    GeneCorrMode::Full => common.clone(),
                    GeneCorrMode::Sub => select_lv_genes(&model, lv, &common, config.selection)?,
                };
                (genes, Box::new(OlsEngine))
            }
            (CorrSource::Matrix(m), None) => {
                let genes = select_lv_genes(&model, lv, &common, config.selection)?;
                let w = LvWhitener::compute(lv, m, &genes)?;
                (genes, Box::new(GlsEngine::from_inverse_factor(w.chol_inv)?))
            }
            (CorrSource::Artifacts(dir), None) => {
                let stored = LvWhitener::read(dir, lv)?;
                let genes: Vec<String> = stored
                    .genes()
                    .iter()
                    .filter(|g| common_set.contains(g.as_str()))
                    .cloned()
                    .collect();
                if genes.len() < stored.genes().len() {
                    verbosity.warn(&format!(
                        "{lv}: {} artifact genes are not in the input data; refactoring submatrix",
                        stored.genes().len() - genes.len()
                    ));
                }
                let w = stored.restrict(&genes)?;
                (genes, Box::new(GlsEngine::from_inverse_factor(w.chol_inv)?))
            }
        };
        verbosity.info(&format!("{lv}: fitting over {} genes", genes.len()));

        let row = fit_lv(lv, &genes, &trait_data, &model, engine.as_ref())?;
        verbosity.info(&format!(
            "{lv}: beta={:.4e} se={:.4e} p={:.4e}",
            row.beta, row.beta_se, row.pvalue
        ));
        results.push(row);
    }

    results.sort_by(|a, b| nan_last(a.pvalue).total_cmp(&nan_last(b.pvalue)));
    Ok(results)
}

fn nan_last(v: f64) -> f64 {
    if v.is_nan() { f64::INFINITY } else { v }
}

fn na(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

pub fn results_dataframe(results: &[LvAssociation]) -> Result<DataFrame> {
    Ok(df!(
        "lv" => results.iter().map(|r| r.lv.clone()).collect::<Vec<_>>(),
        "beta" => results.iter().map(|r| na(r.beta)).collect::<Vec<_>>(),
        "beta_se" => results.iter().map(|r| na(r.beta_se)).collect::<Vec<_>>(),
        "t" => results.iter().map(|r| na(r.t)).collect::<Vec<_>>(),
        "pvalue" => results.iter().map(|r| na(r.pvalue)).collect::<Vec<_>>(),
    )?)
}

fn check_output_file(path: &Path) -> Result<bool> {
    if path.exists() {
        info!("Skipping, output file exists: {}", path.display());
        return Ok(false);
    }
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if !parent.is_dir() {
        return Err(PhenoplierError::Resource(format!(
            "Parent directory of output file does not exist: {}",
            parent.display()
        ))
        .into());
    }
    Ok(true)
}

pub fn run_regression(config: &RegressionConfig) -> Result<()> {
    if !check_output_file(&config.output_file)? {
        return Ok(());
    }
    let results = regression(config)?;
    info!("Writing results to {}", config.output_file.display());
    write_dataframe(&results_dataframe(&results)?, &config.output_file)
}
