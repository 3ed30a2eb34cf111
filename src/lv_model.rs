//! Gene × LV loading matrix.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use ndarray::{Array2, ArrayView1};

use crate::df_utils::{f64_column, string_column};
use crate::error::PhenoplierError;
use crate::io::read_table;

#[derive(Debug, Clone)]
pub struct LvModel {
    genes: Vec<String>,
    gene_index: HashMap<String, usize>,
    lvs: Vec<String>,
    loadings: Array2<f64>,
}

impl LvModel {
    pub fn new(genes: Vec<String>, lvs: Vec<String>, loadings: Array2<f64>) -> Result<Self> {
        if loadings.dim() != (genes.len(), lvs.len()) {
            return Err(PhenoplierError::InvalidInput(format!(
                "LV loadings are {:?} but {} genes and {} LVs were given",
                loadings.dim(),
                genes.len(),
                lvs.len()
            ))
            .into());
        }
        let mut gene_index = HashMap::with_capacity(genes.len());
        for (i, g) in genes.iter().enumerate() {
            if gene_index.insert(g.clone(), i).is_some() {
                return Err(PhenoplierError::InvalidInput(format!(
                    "gene {g} appears twice in the LV model"
                ))
                .into());
            }
        }
        Ok(Self {
            genes,
            gene_index,
            lvs,
            loadings,
        })
    }

    /// Reads a table whose first column holds gene symbols and whose other
    /// columns are LVs.
    pub fn from_table(path: &Path) -> Result<Self> {
        let df = read_table(path).with_context(|| format!("read LV model {}", path.display()))?;
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (gene_col, lvs) = names.split_first().ok_or_else(|| {
            PhenoplierError::InvalidInput(format!("empty LV model {}", path.display()))
        })?;
        let genes = string_column(&df, gene_col)?;
        let mut loadings = Array2::<f64>::zeros((genes.len(), lvs.len()));
        for (j, lv) in lvs.iter().enumerate() {
            for (i, v) in f64_column(&df, lv)?.into_iter().enumerate() {
                loadings[(i, j)] = if v.is_finite() { v } else { 0.0 };
            }
        }
        Self::new(genes, lvs.to_vec(), loadings)
    }

    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    pub fn lvs(&self) -> &[String] {
        &self.lvs
    }

    pub fn gene_position(&self, gene: &str) -> Option<usize> {
        self.gene_index.get(gene).copied()
    }

    pub fn loadings(&self, lv: &str) -> Option<ArrayView1<'_, f64>> {
        let j = self.lvs.iter().position(|l| l == lv)?;
        Some(self.loadings.column(j))
    }

    pub fn loading(&self, gene: &str, lv: &str) -> Option<f64> {
        let i = self.gene_position(gene)?;
        self.loadings(lv).map(|col| col[i])
    }
}
