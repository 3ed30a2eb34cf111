//! Per-chromosome gene correlation matrices.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::Array2;
use ndarray_linalg::{EigValsh, UPLO};
use tracing::{debug, error, info, warn};

use crate::aggregate::{GeneTissueModel, SsmOptions, ssm_from_models, tissue_model};
use crate::correlation::{CorrelationContext, PairError};
use crate::df_utils::{require_columns, string_column};
use crate::error::PhenoplierError;
use crate::gene::{Gene, GeneCatalog, strip_version};
use crate::io::{read_string_vector, read_table, write_labeled_matrix};
use crate::matrix::LabeledMatrix;
use crate::parallel::{WorkerTask, check_worker_outcomes, resolve_workers, run_worker_processes};
use crate::qc::check_chromosome;
use crate::snp_cov::SnpCovarianceStore;
use crate::types::MatrixDtype;
use crate::weights::{PredictionModels, WeightSource};

pub const BY_CHR_DIR: &str = "by_chr";
pub const MIN_ALLOWED_CORRELATION: f64 = -0.05;
pub const MAX_ALLOWED_CORRELATION: f64 = 1.05;

pub fn chromosome_matrix_file(chromosome: u8) -> String {
    format!("gene_corrs-chr{chromosome}.tsv")
}

/// File locations shared by the commands that read prediction models and
/// SNP covariances for one cohort.
#[derive(Debug, Clone)]
pub struct CohortPaths {
    pub gene_info: PathBuf,
    pub models_dir: PathBuf,
    pub models_prefix: String,
    pub model_type: String,
    pub expected_model_files: Option<usize>,
    pub snp_cov_dir: PathBuf,
    /// One GWAS variant id per line; restricts the SNPs used.
    pub gwas_variants: Option<PathBuf>,
    /// Table with `gene_id` and `tissue` columns; derived from the models when absent.
    pub gene_tissues: Option<PathBuf>,
}

pub struct CohortInputs {
    pub catalog: GeneCatalog,
    pub models: PredictionModels,
    pub snp_cov: SnpCovarianceStore,
    pub snps_subset: Option<HashSet<String>>,
    pub gene_tissues: HashMap<String, Vec<String>>,
}

impl CohortInputs {
    pub fn load(paths: &CohortPaths, chromosomes: &[u8]) -> Result<Self> {
        let catalog = GeneCatalog::from_table(&paths.gene_info)?;
        let wanted: HashSet<String> = chromosomes
            .iter()
            .flat_map(|&c| catalog.chromosome_genes(c))
            .map(|g| g.ensembl_id.clone())
            .collect();

        let models = PredictionModels::from_sqlite_dir(
            &paths.models_dir,
            &paths.models_prefix,
            &paths.model_type,
            paths.expected_model_files,
            Some(&wanted),
        )?;
        let snp_cov = SnpCovarianceStore::open(&paths.snp_cov_dir, chromosomes)?;

        let snps_subset = match &paths.gwas_variants {
            Some(path) => {
                let ids: HashSet<String> = read_string_vector(path)
                    .with_context(|| format!("read GWAS variants {}", path.display()))?
                    .into_iter()
                    .collect();
                info!("Using {} GWAS variant ids", ids.len());
                Some(ids)
            }
            None => None,
        };

        let gene_tissues = match &paths.gene_tissues {
            Some(path) => read_gene_tissues(path)?,
            None => wanted
                .iter()
                .map(|id| (id.clone(), models.gene_tissues(id)))
                .filter(|(_, t)| !t.is_empty())
                .collect(),
        };

        Ok(Self {
            catalog,
            models,
            snp_cov,
            snps_subset,
            gene_tissues,
        })
    }

    pub fn context(&self) -> CorrelationContext<'_> {
        CorrelationContext::new(&self.models, &self.snp_cov, self.snps_subset.as_ref())
    }

    /// Genes of a chromosome with at least one tissue model, by start position.
    pub fn chromosome_genes(&self, chromosome: u8) -> Vec<Gene> {
        self.catalog
            .chromosome_genes(chromosome)
            .into_iter()
            .filter(|g| self.gene_tissues.contains_key(&g.ensembl_id))
            .cloned()
            .collect()
    }
}

fn read_gene_tissues(path: &Path) -> Result<HashMap<String, Vec<String>>> {
    let df = read_table(path)?;
    require_columns(&df, &["gene_id", "tissue"], "gene tissues table")?;
    let genes = string_column(&df, "gene_id")?;
    let tissues = string_column(&df, "tissue")?;
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (g, t) in genes.into_iter().zip(tissues) {
        out.entry(strip_version(&g).to_string()).or_default().push(t);
    }
    Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct ChromosomeConfig {
    pub chromosome: u8,
    pub ssm: SsmOptions,
    /// Record failing pairs as NaN instead of aborting.
    pub debug_mode: bool,
}

fn pair_failure(err: PairError, g1: &Gene, g2: &Gene) -> anyhow::Error {
    let message = format!("gene pair {}/{}: {err}", g1.ensembl_id, g2.ensembl_id);
    match err {
        PairError::MissingCovariance(_) => PhenoplierError::Resource(message).into(),
        _ => PhenoplierError::Numerical(message).into(),
    }
}

/// Debug mode only tolerates numerical failures of single pairs.
fn tolerated(err: &PairError, config: &ChromosomeConfig) -> bool {
    config.debug_mode && !matches!(err, PairError::MissingCovariance(_))
}

/// SSM correlations of every gene pair of one chromosome (self-pairs
/// included), genes sorted by start position. Pairs without signal are 0.0;
/// the diagonal is 1.0.
pub fn build_chromosome_matrix(
    ctx: &CorrelationContext<'_>,
    genes: &[Gene],
    gene_tissues: &HashMap<String, Vec<String>>,
    config: &ChromosomeConfig,
) -> Result<LabeledMatrix> {
    let mut genes: Vec<&Gene> = genes
        .iter()
        .filter(|g| g.chromosome == config.chromosome)
        .collect();
    genes.sort_by(|a, b| {
        a.start
            .cmp(&b.start)
            .then_with(|| a.ensembl_id.cmp(&b.ensembl_id))
    });
    let n = genes.len();
    info!(
        "chr{}: {n} genes, {} pairs",
        config.chromosome,
        n + n * n.saturating_sub(1) / 2
    );

    // Tissue subspaces once per gene. Err marks a gene whose preparation
    // failed in debug mode.
    let no_tissues: Vec<String> = Vec::new();
    let mut prepared: Vec<Result<Option<GeneTissueModel>, ()>> = Vec::with_capacity(n);
    for g in &genes {
        let tissues = gene_tissues.get(&g.ensembl_id).unwrap_or(&no_tissues);
        match tissue_model(ctx, g, tissues, config.ssm.condition_number) {
            Ok(m) => prepared.push(Ok(m)),
            Err(e) if tolerated(&e, config) => {
                error!("tissue model for {} failed: {e}", g.ensembl_id);
                prepared.push(Err(()));
            }
            Err(e) => return Err(pair_failure(e, g, g)),
        }
    }
    let without_signal = prepared.iter().filter(|p| matches!(p, Ok(None))).count();
    if without_signal > 0 {
        warn!(
            "chr{}: {without_signal} genes have no usable SNPs in any tissue",
            config.chromosome
        );
    }

    let mut data = Array2::<f64>::from_elem((n, n), f64::NAN);
    for i in 0..n {
        for j in i..n {
            let value = match (&prepared[i], &prepared[j]) {
                (Ok(Some(m1)), Ok(Some(m2))) => match ssm_from_models(ctx, m1, m2, &config.ssm) {
                    Ok(r) => r,
                    Err(e) if tolerated(&e, config) => {
                        error!(
                            "gene pair {}/{} failed: {e}",
                            genes[i].ensembl_id, genes[j].ensembl_id
                        );
                        f64::NAN
                    }
                    Err(e) => return Err(pair_failure(e, genes[i], genes[j])),
                },
                (Ok(_), Ok(_)) => 0.0,
                _ => f64::NAN,
            };
            data[(i, j)] = value;
            data[(j, i)] = value;
        }
        data[(i, i)] = 1.0;
    }

    let labels = genes.iter().map(|g| g.ensembl_id.clone()).collect();
    LabeledMatrix::new(labels, data)
}

/// Range checks on a freshly built chromosome matrix; also logs how many
/// eigenvalues are negative.
pub fn check_chromosome_matrix(matrix: &LabeledMatrix) -> Result<()> {
    if matrix.has_nan() {
        return Err(PhenoplierError::Numerical(
            "gene correlation matrix has NaN values".to_string(),
        )
        .into());
    }
    let data = matrix.data();
    let min = data.iter().copied().fold(f64::INFINITY, f64::min);
    let max = data.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if matrix.is_empty() {
        return Ok(());
    }
    if min < MIN_ALLOWED_CORRELATION {
        return Err(PhenoplierError::Numerical(format!(
            "minimum gene correlation is {min}, expected at least {MIN_ALLOWED_CORRELATION}"
        ))
        .into());
    }
    if max > MAX_ALLOWED_CORRELATION {
        return Err(PhenoplierError::Numerical(format!(
            "maximum gene correlation is {max}, expected at most {MAX_ALLOWED_CORRELATION}"
        ))
        .into());
    }
    info!("gene correlations range from {min:.4} to {max:.4}");

    let eigvals = data
        .eigvalsh(UPLO::Lower)
        .map_err(|e| PhenoplierError::Numerical(format!("eigenvalues: {e}")))?;
    let negative: Vec<f64> = eigvals.iter().copied().filter(|v| *v < 0.0).collect();
    info!("Number of negative eigenvalues: {}", negative.len());
    if !negative.is_empty() {
        debug!("negative eigenvalues: {negative:?}");
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CorrelateConfig {
    pub cohort: CohortPaths,
    pub chromosome: u8,
    pub output_dir: PathBuf,
    pub condition_number: f64,
    /// Full window in Mb; genes farther than half of it are not correlated.
    pub within_distance_mb: Option<f64>,
    pub debug_mode: bool,
    pub dtype: MatrixDtype,
}

pub fn window_radius(distance_mb: f64) -> f64 {
    distance_mb / 2.0 * 1e6
}

pub fn run_correlate(config: &CorrelateConfig) -> Result<()> {
    check_chromosome(config.chromosome)?;
    let by_chr = config.output_dir.join(BY_CHR_DIR);
    let output = by_chr.join(chromosome_matrix_file(config.chromosome));
    if output.exists() {
        info!("Output file exists, skipping: {}", output.display());
        return Ok(());
    }
    fs::create_dir_all(&by_chr).with_context(|| format!("create {}", by_chr.display()))?;

    let inputs = CohortInputs::load(&config.cohort, &[config.chromosome])?;
    if !inputs.catalog.chromosomes().contains(&config.chromosome) {
        return Err(PhenoplierError::InvalidInput(format!(
            "chromosome {} is missing in the genes information",
            config.chromosome
        ))
        .into());
    }
    let genes = inputs.chromosome_genes(config.chromosome);
    let chr_config = ChromosomeConfig {
        chromosome: config.chromosome,
        ssm: SsmOptions {
            condition_number: config.condition_number,
            within_distance: config.within_distance_mb.map(window_radius),
        },
        debug_mode: config.debug_mode,
    };
    let ctx = inputs.context();
    let matrix = build_chromosome_matrix(&ctx, &genes, &inputs.gene_tissues, &chr_config)?;
    if config.debug_mode {
        let n_nan = matrix.data().iter().filter(|v| v.is_nan()).count();
        if n_nan > 0 {
            warn!("{n_nan} cells are NaN after failed gene pairs");
        }
    } else {
        check_chromosome_matrix(&matrix)?;
    }

    write_labeled_matrix(&matrix, &output, config.dtype)?;
    info!("Wrote {}", output.display());
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CorrelateAllConfig {
    pub chromosomes: Vec<u8>,
    pub workers: usize,
    pub output_dir: PathBuf,
    /// Arguments forwarded to every `correlate` child, without `--chromosome`.
    pub forward_args: Vec<OsString>,
}

/// Runs `correlate` as one OS process per chromosome.
pub fn run_correlate_all(config: &CorrelateAllConfig) -> Result<()> {
    let by_chr = config.output_dir.join(BY_CHR_DIR);
    let mut tasks = Vec::new();
    for &chr in &config.chromosomes {
        check_chromosome(chr)?;
        if by_chr.join(chromosome_matrix_file(chr)).exists() {
            info!("chr{chr} already computed, skipping");
            continue;
        }
        let mut args: Vec<OsString> = vec![
            "correlate".into(),
            "--chromosome".into(),
            chr.to_string().into(),
        ];
        args.extend(config.forward_args.iter().cloned());
        tasks.push(WorkerTask {
            label: format!("chr{chr}"),
            args,
        });
    }
    if tasks.is_empty() {
        info!("All chromosomes already computed");
        return Ok(());
    }
    let workers = resolve_workers(config.workers, tasks.len());
    info!("Running {} chromosomes with {workers} workers", tasks.len());
    let outcomes = run_worker_processes(tasks, workers)?;
    check_worker_outcomes(&outcomes)
}
