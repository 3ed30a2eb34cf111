//! Genome-wide gene correlation matrix: block assembly and positive
//! definiteness repair.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, EigValsh, UPLO};
use tracing::{debug, info, warn};

use crate::chromosome::BY_CHR_DIR;
use crate::error::PhenoplierError;
use crate::gene::GeneCatalog;
use crate::io::{read_labeled_matrix, write_labeled_matrix};
use crate::matrix::{LabeledMatrix, block_diagonal, symmetrize};
use crate::qc::check_dir_exists;
use crate::types::MatrixDtype;

pub const GENOME_MATRIX_FILE: &str = "gene_corrs.tsv";
pub const GENOME_SYMBOLS_MATRIX_FILE: &str = "gene_corrs-symbols.tsv";
pub const DEFAULT_EXPECTED_CHROMOSOMES: usize = 22;

/// Smallest eigenvalue accepted as positive definite.
pub const PD_THRESHOLD: f64 = 1e-10;
/// Eigenvalues are clipped up to this value during repair.
pub const EIGENVALUE_FLOOR: f64 = 1e-5;
const MAX_MASKED_ITERATIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PosDefCheck {
    pub min_eigenvalue: f64,
    pub n_negative: usize,
}

impl PosDefCheck {
    pub fn is_pos_def(&self) -> bool {
        self.min_eigenvalue.is_finite() && self.min_eigenvalue >= PD_THRESHOLD
    }
}

pub fn check_pos_def(matrix: &Array2<f64>) -> Result<PosDefCheck> {
    if matrix.is_empty() {
        return Ok(PosDefCheck {
            min_eigenvalue: f64::INFINITY,
            n_negative: 0,
        });
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(PhenoplierError::Numerical("matrix has non-finite values".to_string()).into());
    }
    let eigvals = matrix
        .eigvalsh(UPLO::Lower)
        .map_err(|e| PhenoplierError::Numerical(format!("eigenvalues: {e}")))?;
    Ok(PosDefCheck {
        min_eigenvalue: eigvals.iter().copied().fold(f64::INFINITY, f64::min),
        n_negative: eigvals.iter().filter(|v| **v < 0.0).count(),
    })
}

/// Scales rows and columns so the diagonal is one, then pins it to exactly 1.0.
fn rescale_to_unit_diagonal(matrix: &mut Array2<f64>) -> Result<()> {
    let d: Array1<f64> = matrix.diag().mapv(|v| v.sqrt().recip());
    if d.iter().any(|v| !v.is_finite()) {
        return Err(PhenoplierError::Numerical(
            "cannot rescale a matrix with a non-positive diagonal".to_string(),
        )
        .into());
    }
    let n = matrix.nrows();
    for i in 0..n {
        for j in 0..n {
            matrix[(i, j)] *= d[i] * d[j];
        }
    }
    symmetrize(matrix);
    matrix.diag_mut().fill(1.0);
    Ok(())
}

/// Clips eigenvalues below `floor`, reconstructs and rescales to a unit diagonal.
fn clip_eigenvalues(matrix: &Array2<f64>, floor: f64) -> Result<Array2<f64>> {
    let (eigvals, eigvecs) = matrix
        .eigh(UPLO::Lower)
        .map_err(|e| PhenoplierError::Numerical(format!("eigendecomposition: {e}")))?;
    let clipped = eigvals.mapv(|v| if v.is_finite() && v > floor { v } else { floor });
    let mut out = eigvecs.dot(&Array2::from_diag(&clipped)).dot(&eigvecs.t());
    rescale_to_unit_diagonal(&mut out)?;
    Ok(out)
}

fn apply_zero_mask(matrix: &mut Array2<f64>, keep: &Array2<bool>) {
    for ((idx, v), k) in matrix.indexed_iter_mut().zip(keep.iter()) {
        if !k && idx.0 != idx.1 {
            *v = 0.0;
        }
    }
}

/// Nearest-correlation repair of a symmetric, unit-diagonal matrix.
///
/// Without a mask this is a single eigenvalue clip. With a mask (true =
/// entry may be nonzero) clipping and re-zeroing alternate until the result
/// is positive definite; if that stalls, the matrix is shrunk towards the
/// identity, which keeps both the zero pattern and the unit diagonal.
pub fn nearest_correlation(
    matrix: &Array2<f64>,
    mask: Option<&Array2<bool>>,
) -> Result<Array2<f64>> {
    let Some(keep) = mask else {
        return clip_eigenvalues(matrix, EIGENVALUE_FLOOR);
    };
    if keep.dim() != matrix.dim() {
        return Err(PhenoplierError::InvalidInput(format!(
            "mask shape {:?} does not match matrix shape {:?}",
            keep.dim(),
            matrix.dim()
        ))
        .into());
    }

    let mut x = matrix.clone();
    apply_zero_mask(&mut x, keep);
    for iteration in 0..MAX_MASKED_ITERATIONS {
        let check = check_pos_def(&x)?;
        if check.is_pos_def() {
            debug!("masked repair converged after {iteration} iterations");
            return Ok(x);
        }
        x = clip_eigenvalues(&x, EIGENVALUE_FLOOR)?;
        apply_zero_mask(&mut x, keep);
    }

    let lambda = check_pos_def(&x)?.min_eigenvalue;
    if lambda < EIGENVALUE_FLOOR {
        let alpha = (EIGENVALUE_FLOOR - lambda) / (1.0 - lambda);
        warn!("masked repair did not converge; shrinking towards identity by {alpha:.3e}");
        x.mapv_inplace(|v| v * (1.0 - alpha));
        x.diag_mut().fill(1.0);
    }
    Ok(x)
}

/// Returns the matrix unchanged when positive definite, otherwise its
/// repaired version. A repair that is still not positive definite is fatal.
pub fn ensure_pos_def(
    matrix: LabeledMatrix,
    mask: Option<&Array2<bool>>,
    name: &str,
) -> Result<LabeledMatrix> {
    let check = check_pos_def(matrix.data())?;
    if check.is_pos_def() {
        return Ok(matrix);
    }
    info!(
        "{name}: fixing non-positive definite matrix (min eigenvalue {:.3e}, {} negative)",
        check.min_eigenvalue, check.n_negative
    );
    let repaired = nearest_correlation(matrix.data(), mask)?;
    let after = check_pos_def(&repaired)?;
    if !after.is_pos_def() {
        return Err(PhenoplierError::Numerical(format!(
            "could not adjust {name} (min eigenvalue {:.3e})",
            after.min_eigenvalue
        ))
        .into());
    }
    matrix.with_data(repaired)
}

/// Orders a chromosome block by gene start position.
fn sort_block(block: &LabeledMatrix, catalog: &GeneCatalog) -> Result<LabeledMatrix> {
    let mut labels: Vec<String> = block.labels().to_vec();
    labels.sort_by_key(|id| {
        (
            catalog.by_id(id).map(|g| g.start).unwrap_or(u64::MAX),
            id.clone(),
        )
    });
    block.submatrix(&labels)
}

/// Stitches chromosome blocks into one block-diagonal genome matrix ordered
/// by chromosome then start position, repairing each block and the result.
pub fn assemble_genome(
    mut blocks: Vec<(u8, LabeledMatrix)>,
    catalog: &GeneCatalog,
) -> Result<LabeledMatrix> {
    blocks.sort_by_key(|(chr, _)| *chr);
    let mut repaired = Vec::with_capacity(blocks.len());
    for (chr, block) in blocks {
        let block = sort_block(&block, catalog)?;
        repaired.push(ensure_pos_def(block, None, &format!("chr{chr} gene correlations"))?);
    }
    let genome = block_diagonal(&repaired)?;
    if !genome.diagonal_is_one() {
        return Err(PhenoplierError::Numerical(
            "diagonal elements of the gene correlation matrix are not 1.0".to_string(),
        )
        .into());
    }
    ensure_pos_def(genome, None, "genome gene correlations")
}

/// Ensembl-id labels replaced by symbols; ids without a symbol are kept.
pub fn symbol_labels(matrix: &LabeledMatrix, catalog: &GeneCatalog) -> Vec<String> {
    matrix
        .labels()
        .iter()
        .map(|id| {
            catalog
                .id_to_symbol(id)
                .map(str::to_string)
                .unwrap_or_else(|| id.clone())
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    /// Directory holding `by_chr/`; outputs are written here too.
    pub output_dir: PathBuf,
    pub gene_info: PathBuf,
    pub expected_chromosomes: usize,
    pub dtype: MatrixDtype,
}

fn chromosome_of_file(name: &str) -> Option<u8> {
    name.strip_prefix("gene_corrs-chr")?
        .strip_suffix(".tsv")?
        .parse()
        .ok()
}

pub fn run_postprocess(config: &PostprocessConfig) -> Result<()> {
    let input_dir = config.output_dir.join(BY_CHR_DIR);
    check_dir_exists(&input_dir, "gene correlations input")?;

    let mut files: Vec<(u8, PathBuf)> = Vec::new();
    for entry in fs::read_dir(&input_dir).with_context(|| format!("list {}", input_dir.display()))? {
        let path = entry?.path();
        if let Some(chr) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(chromosome_of_file)
        {
            files.push((chr, path));
        }
    }
    files.sort_by_key(|(chr, _)| *chr);
    if files.len() != config.expected_chromosomes {
        return Err(PhenoplierError::Resource(format!(
            "expected {} gene correlation files, found {}",
            config.expected_chromosomes,
            files.len()
        ))
        .into());
    }

    let catalog = GeneCatalog::from_table(&config.gene_info)?;
    let mut blocks = Vec::with_capacity(files.len());
    for (chr, path) in files {
        info!("Processing {}", path.display());
        blocks.push((chr, read_labeled_matrix(&path)?));
    }
    let genome = assemble_genome(blocks, &catalog)?;
    info!("Genome gene correlation matrix: {} genes", genome.len());

    write_labeled_matrix(&genome, &config.output_dir.join(GENOME_MATRIX_FILE), config.dtype)?;
    let symbols = genome.relabel(symbol_labels(&genome, &catalog))?;
    let output = config.output_dir.join(GENOME_SYMBOLS_MATRIX_FILE);
    write_labeled_matrix(&symbols, &output, config.dtype)?;
    info!("Wrote {}", output.display());
    Ok(())
}
