//! SNP covariance store: per-chromosome SNP×SNP covariance blocks plus SNP
//! metadata, computed once per reference panel and eQTL model.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array2, Axis};
use polars::prelude::*;
use tracing::{info, warn};

use crate::df_utils::{f64_column, require_columns, string_column};
use crate::error::PhenoplierError;
use crate::io::{read_labeled_matrix, read_table, write_dataframe, write_labeled_matrix};
use crate::matrix::LabeledMatrix;
use crate::qc::check_dir_exists;
use crate::types::MatrixDtype;
use crate::weights::PredictionModels;

pub const SNP_METADATA_FILE: &str = "metadata.tsv";

pub fn chromosome_block_file(chromosome: u8) -> String {
    format!("chr{chromosome}.tsv")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnpInfo {
    pub id: String,
    pub chromosome: u8,
    pub position: u64,
    pub ref_allele: String,
    pub eff_allele: String,
}

/// Parses ids of the form `chr<C>_<position>_<ref>_<alt>[_<build>]`.
pub fn parse_variant_id(id: &str) -> Result<SnpInfo> {
    let bad = || PhenoplierError::InvalidInput(format!("malformed variant id '{id}'"));
    let mut parts = id.split('_');
    let chr = parts.next().ok_or_else(bad)?;
    let position = parts.next().ok_or_else(bad)?;
    let ref_allele = parts.next().ok_or_else(bad)?;
    let eff_allele = parts.next().ok_or_else(bad)?;
    let chromosome = chr
        .strip_prefix("chr")
        .and_then(|c| c.parse::<u8>().ok())
        .ok_or_else(bad)?;
    let position = position.parse::<u64>().map_err(|_| bad())?;
    Ok(SnpInfo {
        id: id.to_string(),
        chromosome,
        position,
        ref_allele: ref_allele.to_string(),
        eff_allele: eff_allele.to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct SnpCovarianceBlock {
    pub chromosome: u8,
    pub cov: LabeledMatrix,
}

impl SnpCovarianceBlock {
    pub fn position(&self, snp: &str) -> Option<usize> {
        self.cov.position(snp)
    }

    pub fn value(&self, i: usize, j: usize) -> f64 {
        self.cov.data()[(i, j)]
    }
}

/// Covariance blocks loaded from a store directory (or built in memory).
#[derive(Debug, Clone, Default)]
pub struct SnpCovarianceStore {
    dir: Option<PathBuf>,
    snps: HashMap<String, SnpInfo>,
    blocks: BTreeMap<u8, SnpCovarianceBlock>,
}

impl SnpCovarianceStore {
    /// Opens a store directory, reading the SNP metadata and the blocks of
    /// the requested chromosomes only.
    pub fn open(dir: &Path, chromosomes: &[u8]) -> Result<Self> {
        let metadata_path = dir.join(SNP_METADATA_FILE);
        if !metadata_path.exists() {
            return Err(PhenoplierError::Resource(format!(
                "SNP covariance metadata not found: {}",
                metadata_path.display()
            ))
            .into());
        }
        let df = read_table(&metadata_path)?;
        require_columns(&df, &["id", "chr", "position"], "SNP metadata")?;
        let ids = string_column(&df, "id")?;
        let chrs = f64_column(&df, "chr")?;
        let positions = f64_column(&df, "position")?;
        let refs = optional_strings(&df, "ref_allele")?;
        let effs = optional_strings(&df, "eff_allele")?;

        let mut snps = HashMap::with_capacity(ids.len());
        for (i, id) in ids.into_iter().enumerate() {
            snps.insert(
                id.clone(),
                SnpInfo {
                    id,
                    chromosome: chrs[i] as u8,
                    position: positions[i] as u64,
                    ref_allele: refs[i].clone(),
                    eff_allele: effs[i].clone(),
                },
            );
        }

        let mut store = SnpCovarianceStore {
            dir: Some(dir.to_path_buf()),
            snps,
            blocks: BTreeMap::new(),
        };
        for &chr in chromosomes {
            store.load_chromosome(chr)?;
        }
        Ok(store)
    }

    pub fn from_blocks(blocks: Vec<SnpCovarianceBlock>) -> Result<Self> {
        let mut store = SnpCovarianceStore::default();
        for block in blocks {
            for id in block.cov.labels() {
                if let Ok(info) = parse_variant_id(id) {
                    store.snps.insert(id.clone(), info);
                }
            }
            store.blocks.insert(block.chromosome, block);
        }
        Ok(store)
    }

    pub fn load_chromosome(&mut self, chromosome: u8) -> Result<()> {
        if self.blocks.contains_key(&chromosome) {
            return Ok(());
        }
        let Some(dir) = &self.dir else {
            return Err(PhenoplierError::Resource(format!(
                "no covariance block for chromosome {chromosome}"
            ))
            .into());
        };
        let path = dir.join(chromosome_block_file(chromosome));
        if !path.exists() {
            return Err(PhenoplierError::Resource(format!(
                "SNP covariance block not found: {}",
                path.display()
            ))
            .into());
        }
        let cov = read_labeled_matrix(&path)
            .with_context(|| format!("load SNP covariance for chromosome {chromosome}"))?;
        info!(
            "Loaded SNP covariance for chromosome {chromosome}: {} SNPs",
            cov.len()
        );
        self.blocks
            .insert(chromosome, SnpCovarianceBlock { chromosome, cov });
        Ok(())
    }

    pub fn block(&self, chromosome: u8) -> Option<&SnpCovarianceBlock> {
        self.blocks.get(&chromosome)
    }

    pub fn snp_info(&self, id: &str) -> Option<&SnpInfo> {
        self.snps.get(id)
    }

    pub fn n_snps(&self) -> usize {
        self.snps.len()
    }
}

fn optional_strings(df: &DataFrame, name: &str) -> Result<Vec<String>> {
    if df.column(name).is_ok() {
        string_column(df, name)
    } else {
        Ok(vec![String::new(); df.height()])
    }
}

/// Sample covariance of the columns of `genotypes` (samples × SNPs), n−1 denominator.
pub fn compute_covariance(genotypes: &Array2<f64>) -> Result<Array2<f64>> {
    let n = genotypes.nrows();
    if n < 2 {
        return Err(PhenoplierError::InvalidInput(format!(
            "at least two samples are needed for a covariance, got {n}"
        ))
        .into());
    }
    let mean = genotypes
        .mean_axis(Axis(0))
        .context("column means of genotypes")?;
    let centered = genotypes - &mean;
    Ok(centered.t().dot(&centered) / (n as f64 - 1.0))
}

#[derive(Debug, Clone)]
pub struct CovConfig {
    pub genotype_dir: PathBuf,
    pub models_dir: PathBuf,
    pub models_prefix: String,
    pub model_type: String,
    pub expected_model_files: Option<usize>,
    /// Restrict to SNPs of these genes (ensembl ids).
    pub genes: Option<HashSet<String>>,
    pub output_dir: PathBuf,
    pub dtype: MatrixDtype,
}

/// Finds the single genotype table for a chromosome (`*chr<N>.variants*`).
fn genotype_file(dir: &Path, chromosome: u8) -> Result<PathBuf> {
    let pattern = format!("chr{chromosome}.variants");
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
        let path = entry?.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.contains(&pattern))
        {
            found.push(path);
        }
    }
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(PhenoplierError::Resource(format!(
            "no genotype file for chromosome {chromosome} in {}",
            dir.display()
        ))
        .into()),
        n => Err(PhenoplierError::Resource(format!(
            "{n} genotype files match chromosome {chromosome} in {}",
            dir.display()
        ))
        .into()),
    }
}

/// Dosage matrix for `snps` (columns of the genotype table); missing
/// dosages are replaced by the SNP mean.
fn genotype_matrix(df: &DataFrame, snps: &[String]) -> Result<Array2<f64>> {
    let n = df.height();
    let mut data = Array2::<f64>::zeros((n, snps.len()));
    for (j, snp) in snps.iter().enumerate() {
        let values = f64_column(df, snp)?;
        let observed: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let mean = if observed.is_empty() {
            0.0
        } else {
            observed.iter().sum::<f64>() / observed.len() as f64
        };
        for (i, v) in values.into_iter().enumerate() {
            data[(i, j)] = if v.is_finite() { v } else { mean };
        }
    }
    Ok(data)
}

pub fn run_cov(config: &CovConfig) -> Result<()> {
    check_dir_exists(&config.genotype_dir, "reference panel")?;
    let models = PredictionModels::from_sqlite_dir(
        &config.models_dir,
        &config.models_prefix,
        &config.model_type,
        config.expected_model_files,
        config.genes.as_ref(),
    )?;

    let mut by_chr: BTreeMap<u8, Vec<SnpInfo>> = BTreeMap::new();
    let mut skipped = 0usize;
    for snp in models.all_snps() {
        match parse_variant_id(snp) {
            Ok(info) => by_chr.entry(info.chromosome).or_default().push(info),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!("{skipped} model SNP ids could not be parsed and were skipped");
    }

    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("create {}", config.output_dir.display()))?;

    let mut kept: Vec<SnpInfo> = Vec::new();
    for (chr, mut snps) in by_chr {
        snps.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        let path = genotype_file(&config.genotype_dir, chr)?;
        let df = read_table(&path)?;
        let available: HashSet<String> = df
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let n_models = snps.len();
        snps.retain(|s| available.contains(&s.id));
        info!(
            "chr{chr}: {} of {n_models} model SNPs have genotypes",
            snps.len()
        );
        if snps.is_empty() {
            continue;
        }

        let ids: Vec<String> = snps.iter().map(|s| s.id.clone()).collect();
        let cov = compute_covariance(&genotype_matrix(&df, &ids)?)?;
        if cov.iter().any(|v| !v.is_finite()) {
            return Err(PhenoplierError::Numerical(format!(
                "non-finite SNP covariance on chromosome {chr}"
            ))
            .into());
        }
        let block = LabeledMatrix::new(ids, cov)?;
        write_labeled_matrix(
            &block,
            &config.output_dir.join(chromosome_block_file(chr)),
            config.dtype,
        )?;
        kept.extend(snps);
    }

    let metadata = df!(
        "id" => kept.iter().map(|s| s.id.clone()).collect::<Vec<_>>(),
        "chr" => kept.iter().map(|s| s.chromosome as i64).collect::<Vec<_>>(),
        "position" => kept.iter().map(|s| s.position as i64).collect::<Vec<_>>(),
        "ref_allele" => kept.iter().map(|s| s.ref_allele.clone()).collect::<Vec<_>>(),
        "eff_allele" => kept.iter().map(|s| s.eff_allele.clone()).collect::<Vec<_>>(),
    )?;
    write_dataframe(&metadata, &config.output_dir.join(SNP_METADATA_FILE))?;
    info!(
        "Wrote covariance of {} SNPs to {}",
        kept.len(),
        config.output_dir.display()
    );
    Ok(())
}
