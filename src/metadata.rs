//! Per-gene cohort metadata: tissue and SNP counts used by the SNP-level
//! regression covariates.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use polars::prelude::*;
use tracing::{info, warn};

use crate::aggregate::tissues_pc_variance;
use crate::chromosome::{CohortInputs, CohortPaths};
use crate::correlation::{CorrelationContext, PairError};
use crate::df_utils::{f64_column, require_columns, string_column};
use crate::error::PhenoplierError;
use crate::gene::Gene;
use crate::io::{read_table, write_dataframe};
use crate::qc::check_chromosome;
use crate::types::DupGeneAction;

pub const GENE_METADATA_FILE: &str = "gene_metadata.tsv";

#[derive(Debug, Clone, PartialEq)]
pub struct GeneMetadata {
    pub gene_id: String,
    pub gene_name: String,
    pub tissues: Vec<String>,
    pub n_snps_used_sum: usize,
    pub unique_n_snps_in_model: usize,
    pub unique_n_snps_used: usize,
    pub tissues_pc_variance: f64,
}

impl GeneMetadata {
    pub fn n_tissues(&self) -> usize {
        self.tissues.len()
    }
}

pub fn gene_metadata(
    ctx: &CorrelationContext<'_>,
    gene: &Gene,
    tissues: &[String],
    condition_number: f64,
) -> Result<GeneMetadata> {
    let numerical = |e: PairError| PhenoplierError::Numerical(format!("{}: {e}", gene.ensembl_id));
    let mut in_model: HashSet<&str> = HashSet::new();
    let mut used: HashSet<&str> = HashSet::new();
    let mut n_snps_used_sum = 0usize;
    for tissue in tissues {
        if let Some(w) = ctx.models.weights(&gene.ensembl_id, tissue) {
            in_model.extend(w.snps.iter().map(|s| s.as_str()));
        }
        let tissue_used = ctx.used_snps(gene, tissue).map_err(numerical)?;
        n_snps_used_sum += tissue_used.len();
        used.extend(tissue_used);
    }
    let pc_variance = tissues_pc_variance(ctx, gene, tissues, condition_number)
        .map_err(numerical)?
        .unwrap_or(0.0);
    Ok(GeneMetadata {
        gene_id: gene.ensembl_id.clone(),
        gene_name: gene.symbol.clone(),
        tissues: tissues.to_vec(),
        n_snps_used_sum,
        unique_n_snps_in_model: in_model.len(),
        unique_n_snps_used: used.len(),
        tissues_pc_variance: pc_variance,
    })
}

pub fn metadata_dataframe(rows: &[GeneMetadata]) -> Result<DataFrame> {
    Ok(df!(
        "gene_id" => rows.iter().map(|r| r.gene_id.clone()).collect::<Vec<_>>(),
        "gene_name" => rows.iter().map(|r| r.gene_name.clone()).collect::<Vec<_>>(),
        "tissue" => rows.iter().map(|r| r.tissues.join(",")).collect::<Vec<_>>(),
        "n_tissues" => rows.iter().map(|r| r.n_tissues() as i64).collect::<Vec<_>>(),
        "n_snps_used_sum" => rows.iter().map(|r| r.n_snps_used_sum as i64).collect::<Vec<_>>(),
        "unique_n_snps_in_model" => rows.iter().map(|r| r.unique_n_snps_in_model as i64).collect::<Vec<_>>(),
        "unique_n_snps_used" => rows.iter().map(|r| r.unique_n_snps_used as i64).collect::<Vec<_>>(),
        "tissues_pc_variance" => rows.iter().map(|r| r.tissues_pc_variance).collect::<Vec<_>>(),
    )?)
}

/// SNP counts per gene symbol, as read back for the regression covariates.
#[derive(Debug, Clone, Default)]
pub struct CohortMetadata {
    by_symbol: HashMap<String, (f64, f64)>,
}

impl CohortMetadata {
    /// Reads a metadata table (or the metadata file inside a directory).
    /// Duplicated symbols follow `dup_action`; with no action they are an error.
    pub fn from_path(path: &Path, dup_action: DupGeneAction) -> Result<Self> {
        let path = if path.is_dir() {
            path.join(GENE_METADATA_FILE)
        } else {
            path.to_path_buf()
        };
        let df = read_table(&path)?;
        require_columns(
            &df,
            &["gene_name", "n_snps_used_sum", "unique_n_snps_used"],
            "cohort metadata",
        )?;
        let names = string_column(&df, "gene_name")?;
        let used_sum = f64_column(&df, "n_snps_used_sum")?;
        let unique_used = f64_column(&df, "unique_n_snps_used")?;

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for n in &names {
            *counts.entry(n.as_str()).or_default() += 1;
        }
        let n_dups = counts.values().filter(|c| **c > 1).count();
        if n_dups > 0 && dup_action == DupGeneAction::NoAction {
            return Err(PhenoplierError::InvalidInput(format!(
                "{n_dups} duplicated gene names in cohort metadata; a duplicated genes action must be given"
            ))
            .into());
        }

        let mut by_symbol = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let value = (used_sum[i], unique_used[i]);
            let dup = counts[name.as_str()] > 1;
            match dup_action {
                DupGeneAction::RemoveAll if dup => {}
                DupGeneAction::KeepFirst => {
                    by_symbol.entry(name.clone()).or_insert(value);
                }
                _ => {
                    by_symbol.insert(name.clone(), value);
                }
            }
        }
        info!("Loaded cohort metadata for {} genes", by_symbol.len());
        Ok(Self { by_symbol })
    }

    pub fn from_rows(rows: &[GeneMetadata]) -> Self {
        Self {
            by_symbol: rows
                .iter()
                .map(|r| {
                    (
                        r.gene_name.clone(),
                        (r.n_snps_used_sum as f64, r.unique_n_snps_used as f64),
                    )
                })
                .collect(),
        }
    }

    pub fn n_snps_used_sum(&self, symbol: &str) -> Option<f64> {
        self.by_symbol.get(symbol).map(|v| v.0)
    }

    pub fn unique_n_snps_used(&self, symbol: &str) -> Option<f64> {
        self.by_symbol.get(symbol).map(|v| v.1)
    }
}

#[derive(Debug, Clone)]
pub struct MetadataConfig {
    pub cohort: CohortPaths,
    pub chromosomes: Vec<u8>,
    pub condition_number: f64,
    pub output_dir: PathBuf,
}

pub fn run_metadata(config: &MetadataConfig) -> Result<()> {
    for &chr in &config.chromosomes {
        check_chromosome(chr)?;
    }
    std::fs::create_dir_all(&config.output_dir)?;
    let inputs = CohortInputs::load(&config.cohort, &config.chromosomes)?;
    let ctx = inputs.context();

    let mut rows = Vec::new();
    for &chr in &config.chromosomes {
        let genes = inputs.chromosome_genes(chr);
        info!("chr{chr}: metadata for {} genes", genes.len());
        for gene in &genes {
            let tissues = inputs
                .gene_tissues
                .get(&gene.ensembl_id)
                .cloned()
                .unwrap_or_default();
            rows.push(gene_metadata(&ctx, gene, &tissues, config.condition_number)?);
        }
    }
    let without_snps = rows.iter().filter(|r| r.unique_n_snps_used == 0).count();
    if without_snps > 0 {
        warn!("{without_snps} genes have no SNPs in the covariance data");
    }

    let output = config.output_dir.join(GENE_METADATA_FILE);
    write_dataframe(&metadata_dataframe(&rows)?, &output)?;
    info!("Wrote {}", output.display());
    Ok(())
}
