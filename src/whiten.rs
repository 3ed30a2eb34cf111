//! Per-LV correlation submatrices and their inverse Cholesky factors.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView1};
use tracing::info;

use crate::batch::LvSelection;
use crate::error::PhenoplierError;
use crate::io::{read_labeled_matrix, read_string_vector, write_labeled_matrix, write_vector};
use crate::logging::Verbosity;
use crate::lv_model::LvModel;
use crate::matrix::LabeledMatrix;
use crate::qc::check_fraction;
use crate::types::{GeneSelection, MatrixDtype};

pub const GENE_NAMES_FILE: &str = "gene_names.txt";
pub const ARTIFACT_METADATA_FILE: &str = "metadata.txt";

pub fn lv_corr_file(lv: &str) -> String {
    format!("{lv}_corr_mat.tsv")
}

pub fn lv_factor_file(lv: &str) -> String {
    format!("{lv}.tsv")
}

pub fn lv_genes_file(lv: &str) -> String {
    format!("{lv}_genes.txt")
}

/// Default artifact directory for a correlation matrix file: its path with
/// the extension replaced by `.per_lv`.
pub fn artifact_dir_for(corr_file: &Path) -> PathBuf {
    corr_file.with_extension("per_lv")
}

/// Value at quantile `q` of `values` with linear interpolation between ranks.
pub fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
}

/// Genes of `candidates` chosen by loading magnitude, in candidate order.
/// Genes with a zero loading are never selected. For `TopPercentile(p)` the
/// threshold is the `1 - p` quantile of the nonzero loading magnitudes only,
/// so `p` is a fraction of the genes active in the LV, not of all candidates.
pub fn select_lv_genes(
    model: &LvModel,
    lv: &str,
    candidates: &[String],
    selection: GeneSelection,
) -> Result<Vec<String>> {
    let loadings: ArrayView1<'_, f64> = model.loadings(lv).ok_or_else(|| {
        PhenoplierError::InvalidInput(format!("LV {lv} is not in the LV model"))
    })?;
    let scored: Vec<(&String, f64)> = candidates
        .iter()
        .filter_map(|g| model.gene_position(g).map(|i| (g, loadings[i].abs())))
        .filter(|(_, v)| *v > 0.0)
        .collect();

    let threshold = match selection {
        GeneSelection::Nonzero => 0.0,
        GeneSelection::TopPercentile(p) => {
            check_fraction(p, "LV percentile")?;
            let values: Vec<f64> = scored.iter().map(|(_, v)| *v).collect();
            quantile(&values, 1.0 - p).unwrap_or(0.0)
        }
    };
    Ok(scored
        .into_iter()
        .filter(|(_, v)| *v >= threshold)
        .map(|(g, _)| g.clone())
        .collect())
}

/// Correlation submatrix of one LV's genes and its inverse Cholesky factor.
#[derive(Debug, Clone)]
pub struct LvWhitener {
    pub lv: String,
    pub corr: LabeledMatrix,
    pub chol_inv: Array2<f64>,
}

impl LvWhitener {
    /// Slices `corr` to `genes` (in that order) and factors it. A submatrix
    /// that is not positive definite is a fatal numerical error.
    pub fn compute(lv: &str, corr: &LabeledMatrix, genes: &[String]) -> Result<Self> {
        let sub = corr.submatrix(genes)?;
        Self::from_submatrix(lv, sub)
    }

    fn from_submatrix(lv: &str, sub: LabeledMatrix) -> Result<Self> {
        if sub.is_empty() {
            return Err(PhenoplierError::InvalidInput(format!(
                "LV {lv} has no genes in the correlation matrix"
            ))
            .into());
        }
        let chol_inv = gls::inverse_cholesky_factor(sub.data()).map_err(|e| {
            PhenoplierError::Numerical(format!(
                "gene correlation submatrix of {lv} ({} genes): {e:#}",
                sub.len()
            ))
        })?;
        Ok(Self {
            lv: lv.to_string(),
            corr: sub,
            chol_inv,
        })
    }

    pub fn genes(&self) -> &[String] {
        self.corr.labels()
    }

    /// Whitener for a subset of this LV's genes, refactoring only when the
    /// gene set actually changes.
    pub fn restrict(&self, genes: &[String]) -> Result<Self> {
        if genes == self.genes() {
            return Ok(self.clone());
        }
        Self::compute(&self.lv, &self.corr, genes)
    }

    pub fn write(&self, dir: &Path, dtype: MatrixDtype) -> Result<()> {
        write_labeled_matrix(&self.corr, &dir.join(lv_corr_file(&self.lv)), dtype)?;
        let factor = LabeledMatrix::new(self.genes().to_vec(), self.chol_inv.clone())?;
        write_labeled_matrix(&factor, &dir.join(lv_factor_file(&self.lv)), dtype)?;
        write_vector(self.genes(), &dir.join(lv_genes_file(&self.lv)))
    }

    pub fn read(dir: &Path, lv: &str) -> Result<Self> {
        let corr_path = dir.join(lv_corr_file(lv));
        if !corr_path.exists() {
            return Err(PhenoplierError::Resource(format!(
                "no whitening artifact for {lv} in {}",
                dir.display()
            ))
            .into());
        }
        let corr = read_labeled_matrix(&corr_path)?;
        let factor = read_labeled_matrix(&dir.join(lv_factor_file(lv)))?;
        let genes = read_string_vector(&dir.join(lv_genes_file(lv)))?;
        if factor.labels() != corr.labels() || genes != corr.labels() {
            return Err(PhenoplierError::InvalidInput(format!(
                "whitening artifact files of {lv} in {} disagree on genes",
                dir.display()
            ))
            .into());
        }
        Ok(Self {
            lv: lv.to_string(),
            corr,
            chol_inv: factor.into_data(),
        })
    }
}

/// Reads the `[reference_panel, eqtl_model]` pair of an artifact directory.
pub fn read_artifact_metadata(dir: &Path) -> Result<(String, String)> {
    let values = read_string_vector(&dir.join(ARTIFACT_METADATA_FILE))?;
    match values.as_slice() {
        [panel, model] => Ok((panel.clone(), model.clone())),
        _ => Err(PhenoplierError::InvalidInput(format!(
            "artifact metadata in {} must have 2 entries, found {}",
            dir.display(),
            values.len()
        ))
        .into()),
    }
}

#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub gene_corr_file: PathBuf,
    pub lv_model: PathBuf,
    pub lvs: LvSelection,
    pub selection: GeneSelection,
    /// Defaults to the correlation file with a `.per_lv` extension.
    pub output_dir: Option<PathBuf>,
    pub reference_panel: String,
    pub eqtl_model: String,
    pub dtype: MatrixDtype,
}

pub fn run_generate(config: &GenerateConfig) -> Result<()> {
    let corr = read_labeled_matrix(&config.gene_corr_file)?;
    let model = LvModel::from_table(&config.lv_model)?;
    let lvs = config.lvs.resolve(model.lvs())?;

    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| artifact_dir_for(&config.gene_corr_file));
    fs::create_dir_all(&output_dir).with_context(|| format!("create {}", output_dir.display()))?;

    let in_model: HashSet<&str> = model.genes().iter().map(|s| s.as_str()).collect();
    let candidates: Vec<String> = corr
        .labels()
        .iter()
        .filter(|g| in_model.contains(g.as_str()))
        .cloned()
        .collect();
    info!(
        "{} genes shared by the correlation matrix and the LV model",
        candidates.len()
    );

    for (idx, lv) in lvs.iter().enumerate() {
        let verbosity = Verbosity::for_iteration(idx);
        let genes = select_lv_genes(&model, lv, &candidates, config.selection)?;
        let whitener = LvWhitener::compute(lv, &corr, &genes)?;
        whitener.write(&output_dir, config.dtype)?;
        verbosity.info(&format!("{lv}: whitening factor over {} genes", genes.len()));
    }

    let gene_names = output_dir.join(GENE_NAMES_FILE);
    if !gene_names.exists() {
        write_vector(corr.labels(), &gene_names)?;
    }
    let metadata = output_dir.join(ARTIFACT_METADATA_FILE);
    if !metadata.exists() {
        write_vector(
            &[config.reference_panel.clone(), config.eqtl_model.clone()],
            &metadata,
        )?;
    }
    info!("Wrote {} LV artifacts to {}", lvs.len(), output_dir.display());
    Ok(())
}
