//! Gene identity and genomic position.
//!
//! A [`Gene`] is keyed by its ensembl id. Symbols are resolved to ids through
//! the [`GeneCatalog`] before a gene is looked up, so every value object is
//! canonical regardless of how the caller named it.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use polars::prelude::*;
use tracing::warn;

use crate::df_utils::{f64_column, require_columns, string_column};
use crate::error::PhenoplierError;
use crate::io::read_table;

#[derive(Debug, Clone, PartialEq)]
pub struct Gene {
    pub ensembl_id: String,
    pub symbol: String,
    pub chromosome: u8,
    pub band: String,
    pub start: u64,
    pub end: u64,
}

impl Gene {
    /// True when both genes are on the same chromosome and `other` overlaps
    /// this gene's span widened by `radius` bases on each side. Both ends of
    /// the widened span are inclusive.
    pub fn within_distance(&self, other: &Gene, radius: f64) -> bool {
        if self.chromosome != other.chromosome {
            return false;
        }
        let lo = self.start as f64 - radius;
        let hi = self.end as f64 + radius;
        other.start as f64 <= hi && other.end as f64 >= lo
    }
}

/// Strips the version suffix of an ensembl id (`ENSG00000000419.12`).
pub fn strip_version(gene_id: &str) -> &str {
    gene_id.split('.').next().unwrap_or(gene_id)
}

#[derive(Debug, Clone, Default)]
pub struct GeneCatalog {
    genes: HashMap<String, Gene>,
    symbol_to_id: HashMap<String, String>,
}

impl GeneCatalog {
    /// A symbol shared by several ids resolves to the first of them.
    pub fn from_genes(genes: Vec<Gene>) -> Result<Self> {
        let mut catalog = GeneCatalog::default();
        for gene in genes {
            catalog.insert(gene)?;
        }
        Ok(catalog)
    }

    fn insert(&mut self, gene: Gene) -> Result<()> {
        if self.genes.contains_key(&gene.ensembl_id) {
            return Err(PhenoplierError::InvalidInput(format!(
                "gene catalog has duplicate id {}",
                gene.ensembl_id
            ))
            .into());
        }
        match self.symbol_to_id.get(&gene.symbol) {
            Some(first) => warn!(
                "symbol {} maps to {} and {}; keeping {first}",
                gene.symbol, first, gene.ensembl_id
            ),
            None => {
                self.symbol_to_id
                    .insert(gene.symbol.clone(), gene.ensembl_id.clone());
            }
        }
        self.genes.insert(gene.ensembl_id.clone(), gene);
        Ok(())
    }

    /// Loads a gene info table with columns `id`, `name`, `chr`, `band`,
    /// `start_position` and `end_position`. Rows with missing positions are skipped.
    pub fn from_table(path: &Path) -> Result<Self> {
        let df = read_table(path).with_context(|| format!("read gene info {}", path.display()))?;
        Self::from_dataframe(&df)
    }

    pub fn from_dataframe(df: &DataFrame) -> Result<Self> {
        require_columns(
            df,
            &["id", "name", "chr", "start_position", "end_position"],
            "gene info table",
        )?;
        let ids = string_column(df, "id")?;
        let names = string_column(df, "name")?;
        let chrs = f64_column(df, "chr")?;
        let starts = f64_column(df, "start_position")?;
        let ends = f64_column(df, "end_position")?;
        let bands = if df.column("band").is_ok() {
            string_column(df, "band")?
        } else {
            vec![String::new(); df.height()]
        };

        let mut catalog = GeneCatalog::default();
        for i in 0..df.height() {
            if !(chrs[i].is_finite() && starts[i].is_finite() && ends[i].is_finite()) {
                continue;
            }
            catalog.insert(Gene {
                ensembl_id: strip_version(&ids[i]).to_string(),
                symbol: names[i].clone(),
                chromosome: chrs[i] as u8,
                band: bands[i].clone(),
                start: starts[i] as u64,
                end: ends[i] as u64,
            })?;
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.genes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genes.is_empty()
    }

    pub fn by_id(&self, ensembl_id: &str) -> Option<&Gene> {
        self.genes.get(strip_version(ensembl_id))
    }

    pub fn by_symbol(&self, symbol: &str) -> Option<&Gene> {
        self.symbol_to_id.get(symbol).and_then(|id| self.genes.get(id))
    }

    /// Resolves either an ensembl id or a symbol.
    pub fn resolve(&self, key: &str) -> Option<&Gene> {
        self.by_id(key).or_else(|| self.by_symbol(key))
    }

    pub fn id_to_symbol(&self, ensembl_id: &str) -> Option<&str> {
        self.by_id(ensembl_id).map(|g| g.symbol.as_str())
    }

    /// Genes of one chromosome ordered by start position (ties by id).
    pub fn chromosome_genes(&self, chromosome: u8) -> Vec<&Gene> {
        let mut genes: Vec<&Gene> = self
            .genes
            .values()
            .filter(|g| g.chromosome == chromosome)
            .collect();
        genes.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then_with(|| a.ensembl_id.cmp(&b.ensembl_id))
        });
        genes
    }

    pub fn chromosomes(&self) -> Vec<u8> {
        let mut chrs: Vec<u8> = self.genes.values().map(|g| g.chromosome).collect();
        chrs.sort_unstable();
        chrs.dedup();
        chrs
    }
}
