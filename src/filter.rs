//! Distance filtering of the genome gene correlation matrix.

use std::path::PathBuf;

use anyhow::Result;
use ndarray::Array2;
use rayon::prelude::*;
use tracing::info;

use crate::assemble::{GENOME_SYMBOLS_MATRIX_FILE, ensure_pos_def};
use crate::chromosome::window_radius;
use crate::error::PhenoplierError;
use crate::gene::{Gene, GeneCatalog};
use crate::io::{read_labeled_matrix, write_labeled_matrix};
use crate::matrix::LabeledMatrix;
use crate::parallel::run_in_pool;
use crate::qc::check_positive;
use crate::types::MatrixDtype;

pub fn filtered_matrix_file(distance_mb: f64) -> String {
    format!("gene_corrs-symbols-within_distance_{distance_mb}mb.tsv")
}

/// `true` where the gene pair lies within `radius` bases of each other.
pub fn distance_mask(genes: &[&Gene], radius: f64, threads: Option<usize>) -> Result<Array2<bool>> {
    let n = genes.len();
    let rows: Vec<Vec<bool>> = run_in_pool(threads, "build distance mask pool", || {
        (0..n)
            .into_par_iter()
            .map(|i| {
                genes
                    .iter()
                    .map(|other| genes[i].within_distance(other, radius))
                    .collect()
            })
            .collect()
    })?;
    let flat: Vec<bool> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((n, n), flat)?)
}

/// Zeroes correlations between genes farther apart than half of
/// `distance_mb`, then restores positive definiteness without undoing the
/// zeros. Applying it twice at the same distance changes nothing.
pub fn filter_within_distance(
    matrix: &LabeledMatrix,
    catalog: &GeneCatalog,
    distance_mb: f64,
    threads: Option<usize>,
) -> Result<LabeledMatrix> {
    check_positive(distance_mb, "distance")?;
    let mut genes = Vec::with_capacity(matrix.len());
    for label in matrix.labels() {
        let gene = catalog.resolve(label).ok_or_else(|| {
            PhenoplierError::InvalidInput(format!("gene {label} not found in the gene catalog"))
        })?;
        genes.push(gene);
    }

    let keep = distance_mask(&genes, window_radius(distance_mb), threads)?;
    let mut data = matrix.data().clone();
    let mut n_zeroed = 0usize;
    for ((idx, v), k) in data.indexed_iter_mut().zip(keep.iter()) {
        if !k && idx.0 != idx.1 && *v != 0.0 {
            *v = 0.0;
            n_zeroed += 1;
        }
    }
    info!("{distance_mb} Mb window: zeroed {n_zeroed} entries");

    ensure_pos_def(
        matrix.with_data(data)?,
        Some(&keep),
        &format!("gene correlations within {distance_mb} Mb"),
    )
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Directory holding the genome matrix; filtered matrices go here too.
    pub output_dir: PathBuf,
    pub gene_info: PathBuf,
    pub distances_mb: Vec<f64>,
    pub threads: Option<usize>,
    pub dtype: MatrixDtype,
}

pub fn run_filter(config: &FilterConfig) -> Result<()> {
    let input = config.output_dir.join(GENOME_SYMBOLS_MATRIX_FILE);
    let matrix = read_labeled_matrix(&input)?;
    let catalog = GeneCatalog::from_table(&config.gene_info)?;
    info!("Filtering {} ({} genes)", input.display(), matrix.len());

    for &distance in &config.distances_mb {
        let filtered = filter_within_distance(&matrix, &catalog, distance, config.threads)?;
        let output = config.output_dir.join(filtered_matrix_file(distance));
        write_labeled_matrix(&filtered, &output, config.dtype)?;
        info!("Wrote {}", output.display());
    }
    Ok(())
}
