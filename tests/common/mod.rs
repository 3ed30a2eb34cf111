#![allow(dead_code)]

use std::fs;
use std::path::Path;

use ndarray::Array2;
use phenoplier::gene::{Gene, GeneCatalog};
use phenoplier::matrix::LabeledMatrix;
use phenoplier::snp_cov::{SnpCovarianceBlock, SnpCovarianceStore, compute_covariance};
use phenoplier::weights::{PredictionModels, SnpWeights};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

pub fn ar1(n: usize, rho: f64) -> Array2<f64> {
    Array2::from_shape_fn((n, n), |(i, j)| rho.powi((i as i32 - j as i32).abs()))
}

pub fn gene(id: &str, symbol: &str, chromosome: u8, start: u64, end: u64) -> Gene {
    Gene {
        ensembl_id: id.to_string(),
        symbol: symbol.to_string(),
        chromosome,
        band: String::new(),
        start,
        end,
    }
}

pub fn snp_id(chromosome: u8, idx: usize) -> String {
    format!("chr{chromosome}_{}_A_G_b38", 1000 + idx * 100)
}

/// Genotype dosages (samples × SNPs) in {0, 1, 2}.
pub fn genotypes(n_samples: usize, n_snps: usize, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_fn((n_samples, n_snps), |_| rng.gen_range(0..3) as f64)
}

pub fn snp_block(chromosome: u8, n_snps: usize, rng: &mut StdRng) -> SnpCovarianceBlock {
    let cov = compute_covariance(&genotypes(200, n_snps, rng)).expect("covariance");
    let ids = (0..n_snps).map(|i| snp_id(chromosome, i)).collect();
    SnpCovarianceBlock {
        chromosome,
        cov: LabeledMatrix::new(ids, cov).expect("labeled covariance"),
    }
}

pub fn random_weights(chromosome: u8, snps: std::ops::Range<usize>, rng: &mut StdRng) -> SnpWeights {
    let ids: Vec<String> = snps.clone().map(|i| snp_id(chromosome, i)).collect();
    let w: Vec<f64> = snps.map(|_| StandardNormal.sample(rng)).collect();
    SnpWeights::new(ids, w).expect("weights")
}

pub fn tissues() -> Vec<String> {
    vec!["Liver".to_string(), "Lung".to_string(), "Whole_Blood".to_string()]
}

/// Three genes on chromosome 1 (the first two overlapping in SNPs) and one
/// on chromosome 2, each with models in three tissues.
pub struct Cohort {
    pub genes: Vec<Gene>,
    pub models: PredictionModels,
    pub snp_cov: SnpCovarianceStore,
}

pub fn cohort(seed: u64) -> Cohort {
    let mut rng = StdRng::seed_from_u64(seed);
    let snp_cov = SnpCovarianceStore::from_blocks(vec![
        snp_block(1, 20, &mut rng),
        snp_block(2, 10, &mut rng),
    ])
    .expect("store");

    let genes = vec![
        gene("ENSG001", "GENE1", 1, 10_000, 20_000),
        gene("ENSG002", "GENE2", 1, 30_000, 40_000),
        gene("ENSG003", "GENE3", 1, 5_000_000, 5_010_000),
        gene("ENSG004", "GENE4", 2, 10_000, 20_000),
    ];
    let ranges = [(1, 0..8), (1, 4..12), (1, 12..20), (2, 0..10)];

    let mut models = PredictionModels::new("MASHR");
    for (g, (chr, range)) in genes.iter().zip(ranges) {
        for (k, t) in tissues().iter().enumerate() {
            // Tissues use shifted subsets so their models are not identical.
            let start = range.start + k.min(range.len() - 1) / 2;
            models.insert(&g.ensembl_id, t, random_weights(chr, start..range.end, &mut rng));
        }
    }
    Cohort {
        genes,
        models,
        snp_cov,
    }
}

pub fn catalog(genes: &[Gene]) -> GeneCatalog {
    GeneCatalog::from_genes(genes.to_vec()).expect("catalog")
}

pub fn write_gene_info(path: &Path, genes: &[Gene]) {
    let mut out = String::from("id\tname\tchr\tband\tstart_position\tend_position\n");
    for g in genes {
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            g.ensembl_id, g.symbol, g.chromosome, "p1", g.start, g.end
        ));
    }
    fs::write(path, out).expect("write gene info");
}
