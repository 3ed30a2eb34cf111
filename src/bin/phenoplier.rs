use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};

use phenoplier::aggregate::DEFAULT_CONDITION_NUMBER;
use phenoplier::assemble::{DEFAULT_EXPECTED_CHROMOSOMES, PostprocessConfig, run_postprocess};
use phenoplier::batch::LvSelection;
use phenoplier::chromosome::{
    CohortPaths, CorrelateAllConfig, CorrelateConfig, run_correlate, run_correlate_all,
};
use phenoplier::covariates::parse_covariates;
use phenoplier::error::exit_code;
use phenoplier::filter::{FilterConfig, run_filter};
use phenoplier::gene::GeneCatalog;
use phenoplier::logging::init_tracing;
use phenoplier::lv_model::LvModel;
use phenoplier::metadata::{MetadataConfig, run_metadata};
use phenoplier::regression::{RegressionConfig, run_regression};
use phenoplier::snp_cov::{CovConfig, run_cov};
use phenoplier::types::{DupGeneAction, GeneCorrMode, GeneSelection, MatrixDtype, RegressionModel};
use phenoplier::whiten::{GenerateConfig, run_generate};

#[derive(Parser)]
#[command(name = "phenoplier")]
#[command(about = "Gene correlation matrices and LV-trait GLS regression", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct ModelArgs {
    /// Directory with one `<prefix><tissue>.db` prediction model per tissue.
    #[arg(long, required = true)]
    models_dir: PathBuf,
    #[arg(long, default_value = "mashr_")]
    models_prefix: String,
    /// eQTL model name, e.g. MASHR or ELASTIC_NET.
    #[arg(long, default_value = "MASHR")]
    eqtl_model: String,
    #[arg(long)]
    expected_model_files: Option<usize>,
}

impl ModelArgs {
    fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--models-dir".into(),
            self.models_dir.clone().into(),
            "--models-prefix".into(),
            self.models_prefix.clone().into(),
            "--eqtl-model".into(),
            self.eqtl_model.clone().into(),
        ];
        if let Some(n) = self.expected_model_files {
            args.push("--expected-model-files".into());
            args.push(n.to_string().into());
        }
        args
    }
}

#[derive(Args, Clone)]
struct CohortArgs {
    #[arg(long, required = true)]
    gene_info: PathBuf,
    #[command(flatten)]
    models: ModelArgs,
    /// Directory written by `cov`.
    #[arg(long, required = true)]
    snp_cov_dir: PathBuf,
    #[arg(long)]
    gwas_variants: Option<PathBuf>,
    #[arg(long)]
    gene_tissues: Option<PathBuf>,
}

impl CohortArgs {
    fn paths(&self) -> CohortPaths {
        CohortPaths {
            gene_info: self.gene_info.clone(),
            models_dir: self.models.models_dir.clone(),
            models_prefix: self.models.models_prefix.clone(),
            model_type: self.models.eqtl_model.clone(),
            expected_model_files: self.models.expected_model_files,
            snp_cov_dir: self.snp_cov_dir.clone(),
            gwas_variants: self.gwas_variants.clone(),
            gene_tissues: self.gene_tissues.clone(),
        }
    }

    fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--gene-info".into(), self.gene_info.clone().into()];
        args.extend(self.models.to_args());
        args.push("--snp-cov-dir".into());
        args.push(self.snp_cov_dir.clone().into());
        if let Some(p) = &self.gwas_variants {
            args.push("--gwas-variants".into());
            args.push(p.clone().into());
        }
        if let Some(p) = &self.gene_tissues {
            args.push("--gene-tissues".into());
            args.push(p.clone().into());
        }
        args
    }
}

#[derive(Args, Clone)]
struct CorrelationArgs {
    #[arg(long, required = true)]
    output_dir: PathBuf,
    #[arg(long, default_value_t = DEFAULT_CONDITION_NUMBER)]
    condition_number: f64,
    /// Full window in Mb; gene pairs farther apart than half of it are set to zero.
    #[arg(long)]
    within_distance_mb: Option<f64>,
    /// Record failing gene pairs as NaN instead of aborting.
    #[arg(long)]
    debug: bool,
    #[arg(long, default_value = "float64")]
    dtype: MatrixDtype,
}

impl CorrelationArgs {
    fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--output-dir".into(),
            self.output_dir.clone().into(),
            "--condition-number".into(),
            self.condition_number.to_string().into(),
            "--dtype".into(),
            match self.dtype {
                MatrixDtype::Float64 => "float64".into(),
                MatrixDtype::Float32 => "float32".into(),
            },
        ];
        if let Some(d) = self.within_distance_mb {
            args.push("--within-distance-mb".into());
            args.push(d.to_string().into());
        }
        if self.debug {
            args.push("--debug".into());
        }
        args
    }
}

#[derive(Subcommand)]
enum Command {
    /// SNP covariance blocks of all model SNPs, one per chromosome.
    Cov {
        #[arg(long, required = true)]
        genotype_dir: PathBuf,
        #[command(flatten)]
        models: ModelArgs,
        /// Restrict to genes of this LV model (symbols resolved with --gene-info).
        #[arg(long, requires = "gene_info")]
        lv_model: Option<PathBuf>,
        #[arg(long)]
        gene_info: Option<PathBuf>,
        #[arg(long, required = true)]
        output_dir: PathBuf,
        #[arg(long, default_value = "float64")]
        dtype: MatrixDtype,
    },
    /// Per-gene tissue and SNP counts for SNP-level covariates.
    Metadata {
        #[command(flatten)]
        cohort: CohortArgs,
        #[arg(long, required = true, num_args = 1..)]
        chromosomes: Vec<u8>,
        #[arg(long, default_value_t = DEFAULT_CONDITION_NUMBER)]
        condition_number: f64,
        #[arg(long, required = true)]
        output_dir: PathBuf,
    },
    /// Gene correlation matrix of one chromosome.
    Correlate {
        #[arg(long, required = true)]
        chromosome: u8,
        #[command(flatten)]
        cohort: CohortArgs,
        #[command(flatten)]
        correlation: CorrelationArgs,
    },
    /// `correlate` for many chromosomes, one process each.
    CorrelateAll {
        #[arg(long, num_args = 1.., default_values_t = (1..=22).collect::<Vec<u8>>())]
        chromosomes: Vec<u8>,
        #[arg(long, default_value_t = 1)]
        workers: usize,
        #[command(flatten)]
        cohort: CohortArgs,
        #[command(flatten)]
        correlation: CorrelationArgs,
    },
    /// Genome-wide matrix from the chromosome matrices, repaired to be positive definite.
    Postprocess {
        #[arg(long, required = true)]
        output_dir: PathBuf,
        #[arg(long, required = true)]
        gene_info: PathBuf,
        #[arg(long, default_value_t = DEFAULT_EXPECTED_CHROMOSOMES)]
        expected_chromosomes: usize,
        #[arg(long, default_value = "float64")]
        dtype: MatrixDtype,
    },
    /// Distance-filtered copies of the genome matrix.
    Filter {
        #[arg(long, required = true)]
        output_dir: PathBuf,
        #[arg(long, required = true)]
        gene_info: PathBuf,
        #[arg(long, num_args = 1.., default_values_t = [10.0, 5.0, 2.0])]
        distances: Vec<f64>,
        #[arg(long)]
        threads: Option<usize>,
        #[arg(long, default_value = "float64")]
        dtype: MatrixDtype,
    },
    /// Per-LV correlation submatrices and whitening factors.
    Generate {
        #[arg(long, required = true)]
        gene_corr_file: PathBuf,
        #[arg(long, required = true)]
        lv_model: PathBuf,
        #[arg(long, num_args = 1..)]
        lv_list: Option<Vec<String>>,
        #[arg(long)]
        batch_id: Option<usize>,
        #[arg(long)]
        batch_n_splits: Option<usize>,
        #[arg(long)]
        lv_percentile: Option<f64>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
        #[arg(long, required = true)]
        reference_panel: String,
        #[arg(long, required = true)]
        eqtl_model: String,
        #[arg(long, default_value = "float64")]
        dtype: MatrixDtype,
    },
    /// LV-trait association for gene-level TWAS results.
    Regression {
        #[arg(long, short = 'i', required = true)]
        input_file: PathBuf,
        #[arg(long, short = 'o', required = true)]
        output_file: PathBuf,
        #[arg(long, required = true)]
        lv_model: PathBuf,
        #[arg(long, default_value = "gls")]
        model: RegressionModel,
        #[arg(long)]
        gene_corr_file: Option<PathBuf>,
        #[arg(long, default_value = "sub")]
        gene_corr_mode: GeneCorrMode,
        #[arg(long, default_value = "keep-first")]
        dup_genes_action: DupGeneAction,
        /// Space or comma separated; `all` and `default` are accepted.
        #[arg(long)]
        covars: Option<String>,
        #[arg(long)]
        cohort_metadata: Option<PathBuf>,
        #[arg(long, num_args = 1..)]
        lv_list: Option<Vec<String>>,
        #[arg(long)]
        batch_id: Option<usize>,
        #[arg(long)]
        batch_n_splits: Option<usize>,
        #[arg(long)]
        lv_percentile: Option<f64>,
    },
}

fn gene_selection(lv_percentile: Option<f64>) -> GeneSelection {
    lv_percentile.map_or(GeneSelection::Nonzero, GeneSelection::TopPercentile)
}

/// Ensembl ids of the LV model genes.
fn lv_model_genes(lv_model: &Path, gene_info: &Path) -> anyhow::Result<HashSet<String>> {
    let model = LvModel::from_table(lv_model)?;
    let catalog = GeneCatalog::from_table(gene_info)?;
    Ok(model
        .genes()
        .iter()
        .filter_map(|g| catalog.resolve(g).map(|gene| gene.ensembl_id.clone()))
        .collect())
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Cov {
            genotype_dir,
            models,
            lv_model,
            gene_info,
            output_dir,
            dtype,
        } => {
            let genes = match (lv_model, gene_info) {
                (Some(lv_model), Some(gene_info)) => Some(lv_model_genes(&lv_model, &gene_info)?),
                _ => None,
            };
            run_cov(&CovConfig {
                genotype_dir,
                models_dir: models.models_dir,
                models_prefix: models.models_prefix,
                model_type: models.eqtl_model,
                expected_model_files: models.expected_model_files,
                genes,
                output_dir,
                dtype,
            })
        }
        Command::Metadata {
            cohort,
            chromosomes,
            condition_number,
            output_dir,
        } => run_metadata(&MetadataConfig {
            cohort: cohort.paths(),
            chromosomes,
            condition_number,
            output_dir,
        }),
        Command::Correlate {
            chromosome,
            cohort,
            correlation,
        } => run_correlate(&CorrelateConfig {
            cohort: cohort.paths(),
            chromosome,
            output_dir: correlation.output_dir,
            condition_number: correlation.condition_number,
            within_distance_mb: correlation.within_distance_mb,
            debug_mode: correlation.debug,
            dtype: correlation.dtype,
        }),
        Command::CorrelateAll {
            chromosomes,
            workers,
            cohort,
            correlation,
        } => {
            let mut forward_args = cohort.to_args();
            forward_args.extend(correlation.to_args());
            run_correlate_all(&CorrelateAllConfig {
                chromosomes,
                workers,
                output_dir: correlation.output_dir,
                forward_args,
            })
        }
        Command::Postprocess {
            output_dir,
            gene_info,
            expected_chromosomes,
            dtype,
        } => run_postprocess(&PostprocessConfig {
            output_dir,
            gene_info,
            expected_chromosomes,
            dtype,
        }),
        Command::Filter {
            output_dir,
            gene_info,
            distances,
            threads,
            dtype,
        } => run_filter(&FilterConfig {
            output_dir,
            gene_info,
            distances_mb: distances,
            threads,
            dtype,
        }),
        Command::Generate {
            gene_corr_file,
            lv_model,
            lv_list,
            batch_id,
            batch_n_splits,
            lv_percentile,
            output_dir,
            reference_panel,
            eqtl_model,
            dtype,
        } => run_generate(&GenerateConfig {
            gene_corr_file,
            lv_model,
            lvs: LvSelection::from_args(lv_list, batch_id, batch_n_splits)?,
            selection: gene_selection(lv_percentile),
            output_dir,
            reference_panel,
            eqtl_model,
            dtype,
        }),
        Command::Regression {
            input_file,
            output_file,
            lv_model,
            model,
            gene_corr_file,
            gene_corr_mode,
            dup_genes_action,
            covars,
            cohort_metadata,
            lv_list,
            batch_id,
            batch_n_splits,
            lv_percentile,
        } => {
            let covariates = match covars {
                Some(selection) => parse_covariates(&selection)?,
                None => Vec::new(),
            };
            run_regression(&RegressionConfig {
                input_file,
                output_file,
                lv_model,
                model,
                gene_corr_file,
                gene_corr_mode,
                dup_genes_action,
                covariates,
                cohort_metadata,
                lvs: LvSelection::from_args(lv_list, batch_id, batch_n_splits)?,
                selection: gene_selection(lv_percentile),
            })
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        tracing::error!("{err:#}");
        std::process::exit(exit_code(&err));
    }
}
