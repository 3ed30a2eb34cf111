//! Prediction-model accessor: (gene, tissue) → SNP weight vector.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::PhenoplierError;
use crate::gene::strip_version;
use crate::qc::check_equal_length;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnpWeights {
    pub snps: Vec<String>,
    pub weights: Vec<f64>,
}

impl SnpWeights {
    pub fn new(snps: Vec<String>, weights: Vec<f64>) -> Result<Self> {
        check_equal_length(snps.len(), weights.len(), "SNP ids", "weights")?;
        Ok(Self { snps, weights })
    }

    pub fn len(&self) -> usize {
        self.snps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.snps
            .iter()
            .map(|s| s.as_str())
            .zip(self.weights.iter().copied())
    }

    fn push(&mut self, snp: String, weight: f64) {
        self.snps.push(snp);
        self.weights.push(weight);
    }
}

/// Read access to per-tissue prediction models.
pub trait WeightSource: Sync {
    /// Name of the eQTL model family (e.g. MASHR).
    fn model_type(&self) -> &str;

    fn tissues(&self) -> &[String];

    fn weights(&self, gene_id: &str, tissue: &str) -> Option<&SnpWeights>;

    /// Tissues with a model for this gene, in tissue order.
    fn gene_tissues(&self, gene_id: &str) -> Vec<String> {
        self.tissues()
            .iter()
            .filter(|t| self.weights(gene_id, t).is_some())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PredictionModels {
    model_type: String,
    tissues: Vec<String>,
    // gene id → tissue → weights
    models: HashMap<String, HashMap<String, SnpWeights>>,
}

impl PredictionModels {
    pub fn new(model_type: impl Into<String>) -> Self {
        Self {
            model_type: model_type.into(),
            ..Default::default()
        }
    }

    pub fn insert(&mut self, gene_id: &str, tissue: &str, weights: SnpWeights) {
        if !self.tissues.iter().any(|t| t == tissue) {
            self.tissues.push(tissue.to_string());
        }
        self.models
            .entry(strip_version(gene_id).to_string())
            .or_default()
            .insert(tissue.to_string(), weights);
    }

    pub fn genes(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(|s| s.as_str())
    }

    pub fn n_models(&self) -> usize {
        self.models.values().map(|m| m.len()).sum()
    }

    /// Distinct SNP ids across every model.
    pub fn all_snps(&self) -> HashSet<&str> {
        self.models
            .values()
            .flat_map(|m| m.values())
            .flat_map(|w| w.snps.iter().map(|s| s.as_str()))
            .collect()
    }

    /// Loads every `<prefix><tissue>.db` file in `dir`. Each database holds a
    /// `weights(gene, varID, weight)` table. When `genes` is given, other genes
    /// are skipped.
    pub fn from_sqlite_dir(
        dir: &Path,
        prefix: &str,
        model_type: &str,
        expected_count: Option<usize>,
        genes: Option<&HashSet<String>>,
    ) -> Result<Self> {
        if !dir.is_dir() {
            return Err(PhenoplierError::Resource(format!(
                "prediction models directory not found: {}",
                dir.display()
            ))
            .into());
        }

        let mut files: BTreeMap<String, std::path::PathBuf> = BTreeMap::new();
        for entry in fs::read_dir(dir).with_context(|| format!("list {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(tissue) = stem.strip_prefix(prefix) {
                files.insert(tissue.to_string(), path.clone());
            }
        }

        if let Some(expected) = expected_count
            && files.len() != expected
        {
            return Err(PhenoplierError::Resource(format!(
                "expected {expected} prediction model files with prefix '{prefix}' in {}, found {}",
                dir.display(),
                files.len()
            ))
            .into());
        }
        if files.is_empty() {
            return Err(PhenoplierError::Resource(format!(
                "no prediction model files with prefix '{prefix}' in {}",
                dir.display()
            ))
            .into());
        }

        let mut models = PredictionModels::new(model_type);
        for (tissue, path) in &files {
            let n = models.load_sqlite(path, tissue, genes)?;
            debug!("{tissue}: {n} weights");
        }
        info!(
            "Loaded {} {} models over {} tissues",
            models.n_models(),
            model_type,
            models.tissues.len()
        );
        Ok(models)
    }

    fn load_sqlite(
        &mut self,
        path: &Path,
        tissue: &str,
        genes: Option<&HashSet<String>>,
    ) -> Result<usize> {
        let conn = Connection::open(path)
            .with_context(|| format!("open prediction model {}", path.display()))?;
        let mut stmt = conn
            .prepare("SELECT gene, varID, weight FROM weights")
            .with_context(|| format!("query weights in {}", path.display()))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;

        let mut by_gene: HashMap<String, SnpWeights> = HashMap::new();
        let mut n = 0usize;
        for row in rows {
            let (gene, snp, weight) = row?;
            let gene = strip_version(&gene).to_string();
            if let Some(keep) = genes
                && !keep.contains(&gene)
            {
                continue;
            }
            by_gene.entry(gene).or_default().push(snp, weight);
            n += 1;
        }

        if !self.tissues.iter().any(|t| t == tissue) {
            self.tissues.push(tissue.to_string());
        }
        for (gene, weights) in by_gene {
            self.models
                .entry(gene)
                .or_default()
                .insert(tissue.to_string(), weights);
        }
        Ok(n)
    }
}

impl WeightSource for PredictionModels {
    fn model_type(&self) -> &str {
        &self.model_type
    }

    fn tissues(&self) -> &[String] {
        &self.tissues
    }

    fn weights(&self, gene_id: &str, tissue: &str) -> Option<&SnpWeights> {
        self.models
            .get(strip_version(gene_id))
            .and_then(|m| m.get(tissue))
    }
}
