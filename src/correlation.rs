//! Predicted-expression correlation of one gene pair in one tissue pair.

use std::collections::HashSet;

use thiserror::Error;

use crate::gene::Gene;
use crate::snp_cov::{SnpCovarianceBlock, SnpCovarianceStore};
use crate::weights::WeightSource;

/// Failure of a single gene-pair computation. The chromosome builder decides
/// whether it aborts the chromosome or becomes a NaN cell.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PairError {
    #[error("non-finite {what} for {gene1}/{gene2}")]
    NonFinite {
        what: &'static str,
        gene1: String,
        gene2: String,
    },

    #[error("SVD failed for {gene}: {message}")]
    Svd { gene: String, message: String },

    #[error("no SNP covariance loaded for chromosome {0}")]
    MissingCovariance(u8),
}

/// Model SNPs of one gene in one tissue that are present in the covariance
/// block (and in the GWAS subset, when one is given).
#[derive(Debug, Clone, Default)]
struct UsableWeights {
    index: Vec<usize>,
    weights: Vec<f64>,
}

pub struct CorrelationContext<'a> {
    pub models: &'a dyn WeightSource,
    pub snp_cov: &'a SnpCovarianceStore,
    pub snps_subset: Option<&'a HashSet<String>>,
}

impl<'a> CorrelationContext<'a> {
    pub fn new(
        models: &'a dyn WeightSource,
        snp_cov: &'a SnpCovarianceStore,
        snps_subset: Option<&'a HashSet<String>>,
    ) -> Self {
        Self {
            models,
            snp_cov,
            snps_subset,
        }
    }

    fn block(&self, chromosome: u8) -> Result<&SnpCovarianceBlock, PairError> {
        self.snp_cov
            .block(chromosome)
            .ok_or(PairError::MissingCovariance(chromosome))
    }

    fn usable_weights(
        &self,
        block: &SnpCovarianceBlock,
        gene: &Gene,
        tissue: &str,
    ) -> Option<UsableWeights> {
        let model = self.models.weights(&gene.ensembl_id, tissue)?;
        let mut usable = UsableWeights::default();
        for (snp, w) in model.iter() {
            if let Some(subset) = self.snps_subset
                && !subset.contains(snp)
            {
                continue;
            }
            if let Some(pos) = block.position(snp) {
                usable.index.push(pos);
                usable.weights.push(w);
            }
        }
        (!usable.index.is_empty()).then_some(usable)
    }

    /// Model SNPs of `gene` in `tissue` that survive the covariance and
    /// GWAS-subset intersection.
    pub fn used_snps(&self, gene: &Gene, tissue: &str) -> Result<Vec<&'a str>, PairError> {
        let block = self.block(gene.chromosome)?;
        let Some(model) = self.models.weights(&gene.ensembl_id, tissue) else {
            return Ok(Vec::new());
        };
        Ok(model
            .snps
            .iter()
            .map(|s| s.as_str())
            .filter(|s| self.snps_subset.is_none_or(|subset| subset.contains(*s)))
            .filter(|s| block.position(s).is_some())
            .collect())
    }

    /// Variance of predicted expression, wᵗΣw. None when no usable SNPs.
    pub fn pred_expression_variance(
        &self,
        gene: &Gene,
        tissue: &str,
    ) -> Result<Option<f64>, PairError> {
        let block = self.block(gene.chromosome)?;
        let Some(w) = self.usable_weights(block, gene, tissue) else {
            return Ok(None);
        };
        let var = quadratic_form(block, &w, &w);
        check_finite(var, "variance", gene, gene)?;
        Ok(Some(var))
    }

    /// Covariance of predicted expression, w1ᵗΣ[S1,S2]w2. Genes on different
    /// chromosomes have covariance zero.
    pub fn pair_covariance(
        &self,
        gene1: &Gene,
        tissue1: &str,
        gene2: &Gene,
        tissue2: &str,
    ) -> Result<Option<f64>, PairError> {
        if gene1.chromosome != gene2.chromosome {
            return Ok(Some(0.0));
        }
        let block = self.block(gene1.chromosome)?;
        let (Some(w1), Some(w2)) = (
            self.usable_weights(block, gene1, tissue1),
            self.usable_weights(block, gene2, tissue2),
        ) else {
            return Ok(None);
        };
        let cov = quadratic_form(block, &w1, &w2);
        check_finite(cov, "covariance", gene1, gene2)?;
        Ok(Some(cov))
    }

    /// Correlation of predicted expression clamped to [-1, 1]. None when
    /// either gene has no usable SNPs in its tissue; 0.0 when either variance
    /// is zero or the genes are on different chromosomes.
    pub fn pair_correlation(
        &self,
        gene1: &Gene,
        tissue1: &str,
        gene2: &Gene,
        tissue2: &str,
    ) -> Result<Option<f64>, PairError> {
        if gene1.chromosome != gene2.chromosome {
            return Ok(Some(0.0));
        }
        let block = self.block(gene1.chromosome)?;
        let (Some(w1), Some(w2)) = (
            self.usable_weights(block, gene1, tissue1),
            self.usable_weights(block, gene2, tissue2),
        ) else {
            return Ok(None);
        };

        let var1 = quadratic_form(block, &w1, &w1);
        let var2 = quadratic_form(block, &w2, &w2);
        check_finite(var1, "variance", gene1, gene1)?;
        check_finite(var2, "variance", gene2, gene2)?;
        if var1 <= 0.0 || var2 <= 0.0 {
            return Ok(Some(0.0));
        }
        if gene1.ensembl_id == gene2.ensembl_id && tissue1 == tissue2 {
            return Ok(Some(1.0));
        }

        let cov = quadratic_form(block, &w1, &w2);
        let r = cov / (var1 * var2).sqrt();
        check_finite(r, "correlation", gene1, gene2)?;
        Ok(Some(r.clamp(-1.0, 1.0)))
    }
}

fn quadratic_form(block: &SnpCovarianceBlock, a: &UsableWeights, b: &UsableWeights) -> f64 {
    let mut total = 0.0;
    for (&i, &wi) in a.index.iter().zip(&a.weights) {
        let mut row = 0.0;
        for (&j, &wj) in b.index.iter().zip(&b.weights) {
            row += block.value(i, j) * wj;
        }
        total += wi * row;
    }
    total
}

fn check_finite(value: f64, what: &'static str, gene1: &Gene, gene2: &Gene) -> Result<(), PairError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(PairError::NonFinite {
            what,
            gene1: gene1.ensembl_id.clone(),
            gene2: gene2.ensembl_id.clone(),
        })
    }
}
