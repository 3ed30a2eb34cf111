mod common;

use std::fs;
use std::path::{Path, PathBuf};

use common::{cohort, gene, genotypes, snp_id, write_gene_info};
use phenoplier::assemble::{
    GENOME_MATRIX_FILE, GENOME_SYMBOLS_MATRIX_FILE, PostprocessConfig, check_pos_def,
    run_postprocess,
};
use phenoplier::chromosome::{
    BY_CHR_DIR, CohortPaths, CorrelateConfig, chromosome_matrix_file, run_correlate,
};
use phenoplier::error::{FailureKind, exit_code, failure_kind};
use phenoplier::filter::{FilterConfig, filtered_matrix_file, run_filter};
use phenoplier::gene::GeneCatalog;
use phenoplier::io::read_labeled_matrix;
use phenoplier::metadata::{CohortMetadata, GENE_METADATA_FILE, MetadataConfig, run_metadata};
use phenoplier::snp_cov::{
    CovConfig, SNP_METADATA_FILE, SnpCovarianceStore, chromosome_block_file, compute_covariance,
    run_cov,
};
use phenoplier::types::{DupGeneAction, MatrixDtype};
use phenoplier::weights::{PredictionModels, WeightSource};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rusqlite::{Connection, params};
use tempfile::TempDir;

const PREFIX: &str = "mashr_";
const TISSUES: [&str; 2] = ["Liver", "Lung"];
const SNPS_PER_CHR: [(u8, usize); 2] = [(1, 20), (2, 10)];

struct Workspace {
    dir: TempDir,
    models_dir: PathBuf,
    genotype_dir: PathBuf,
    gene_info: PathBuf,
    genotypes: Vec<(u8, ndarray::Array2<f64>)>,
}

impl Workspace {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn cohort_paths(&self, snp_cov_dir: &Path) -> CohortPaths {
        CohortPaths {
            gene_info: self.gene_info.clone(),
            models_dir: self.models_dir.clone(),
            models_prefix: PREFIX.to_string(),
            model_type: "MASHR".to_string(),
            expected_model_files: Some(TISSUES.len()),
            snp_cov_dir: snp_cov_dir.to_path_buf(),
            gwas_variants: None,
            gene_tissues: None,
        }
    }

    fn cov_config(&self, output_dir: PathBuf) -> CovConfig {
        CovConfig {
            genotype_dir: self.genotype_dir.clone(),
            models_dir: self.models_dir.clone(),
            models_prefix: PREFIX.to_string(),
            model_type: "MASHR".to_string(),
            expected_model_files: Some(TISSUES.len()),
            genes: None,
            output_dir,
            dtype: MatrixDtype::Float64,
        }
    }
}

fn write_models(dir: &Path, models: &PredictionModels) {
    fs::create_dir_all(dir).expect("models dir");
    for tissue in TISSUES {
        let conn = Connection::open(dir.join(format!("{PREFIX}{tissue}.db"))).expect("open db");
        conn.execute_batch(
            "CREATE TABLE weights (gene TEXT, rsid TEXT, varID TEXT, ref_allele TEXT, eff_allele TEXT, weight REAL);",
        )
        .expect("create table");
        for gene in models.genes() {
            let Some(w) = models.weights(gene, tissue) else {
                continue;
            };
            for (snp, weight) in w.iter() {
                conn.execute(
                    "INSERT INTO weights (gene, rsid, varID, ref_allele, eff_allele, weight) VALUES (?1, ?2, ?3, 'A', 'G', ?4)",
                    params![format!("{gene}.7"), format!("rs_{snp}"), snp, weight],
                )
                .expect("insert weight");
            }
        }
    }
    // Files with other prefixes or extensions are ignored.
    fs::write(dir.join("elastic_Liver.db"), "").expect("write");
    fs::write(dir.join(format!("{PREFIX}Liver.txt")), "").expect("write");
}

fn write_genotypes(path: &Path, chromosome: u8, data: &ndarray::Array2<f64>) {
    let header: Vec<String> = (0..data.ncols()).map(|i| snp_id(chromosome, i)).collect();
    let mut out = format!("IID\t{}\n", header.join("\t"));
    for (s, row) in data.rows().into_iter().enumerate() {
        let values: Vec<String> = row.iter().map(|v| format!("{v}")).collect();
        out.push_str(&format!("sample{s}\t{}\n", values.join("\t")));
    }
    fs::write(path, out).expect("write genotypes");
}

fn workspace(seed: u64) -> Workspace {
    let c = cohort(seed);
    let dir = TempDir::new().expect("tempdir");
    let models_dir = dir.path().join("models");
    write_models(&models_dir, &c.models);

    let genotype_dir = dir.path().join("reference_panel");
    fs::create_dir_all(&genotype_dir).expect("genotype dir");
    let mut rng = StdRng::seed_from_u64(seed + 100);
    let mut all = Vec::new();
    for (chr, n_snps) in SNPS_PER_CHR {
        let data = genotypes(120, n_snps, &mut rng);
        write_genotypes(
            &genotype_dir.join(format!("panel.chr{chr}.variants.tsv")),
            chr,
            &data,
        );
        all.push((chr, data));
    }

    let gene_info = dir.path().join("genes_info.tsv");
    write_gene_info(&gene_info, &c.genes);
    Workspace {
        dir,
        models_dir,
        genotype_dir,
        gene_info,
        genotypes: all,
    }
}

#[test]
fn sqlite_models_are_loaded_per_tissue() {
    let ws = workspace(1);
    let models =
        PredictionModels::from_sqlite_dir(&ws.models_dir, PREFIX, "MASHR", Some(2), None)
            .expect("models");
    assert_eq!(models.tissues(), ["Liver", "Lung"]);
    assert_eq!(models.gene_tissues("ENSG001"), ["Liver", "Lung"]);
    let expected = cohort(1).models;
    assert_eq!(
        models.weights("ENSG002", "Lung"),
        expected.weights("ENSG002", "Lung")
    );

    let only: std::collections::HashSet<String> = ["ENSG004".to_string()].into_iter().collect();
    let subset =
        PredictionModels::from_sqlite_dir(&ws.models_dir, PREFIX, "MASHR", None, Some(&only))
            .expect("subset");
    assert_eq!(subset.genes().collect::<Vec<_>>(), ["ENSG004"]);

    let err = PredictionModels::from_sqlite_dir(&ws.models_dir, PREFIX, "MASHR", Some(49), None)
        .expect_err("count mismatch");
    assert_eq!(exit_code(&err), 4);
    let err =
        PredictionModels::from_sqlite_dir(&ws.path("nowhere"), PREFIX, "MASHR", None, None)
            .expect_err("missing dir");
    assert_eq!(failure_kind(&err), FailureKind::Environment);
}

#[test]
fn snp_covariance_store_round_trips() {
    let ws = workspace(2);
    let out = ws.path("snp_cov");
    run_cov(&ws.cov_config(out.clone())).expect("cov");
    for (chr, _) in SNPS_PER_CHR {
        assert!(out.join(chromosome_block_file(chr)).is_file());
    }
    assert!(out.join(SNP_METADATA_FILE).is_file());

    let store = SnpCovarianceStore::open(&out, &[1]).expect("open");
    assert_eq!(store.n_snps(), 30);
    assert!(store.block(2).is_none());
    let block = store.block(1).expect("chr1 block");
    assert_eq!(block.cov.len(), 20);
    let info = store.snp_info(&snp_id(1, 3)).expect("snp info");
    assert_eq!((info.chromosome, info.position), (1, 1300));
    assert_eq!(info.eff_allele, "G");

    let (_, chr1) = &ws.genotypes[0];
    let expected = compute_covariance(chr1).expect("covariance");
    for i in 0..20 {
        for j in 0..20 {
            assert!((block.value(i, j) - expected[(i, j)]).abs() < 1e-12);
        }
    }

    let mut missing = ws.cov_config(ws.path("other"));
    missing.genotype_dir = ws.path("no_panel");
    let err = run_cov(&missing).expect_err("missing panel");
    assert_eq!(exit_code(&err), 4);
}

#[test]
fn correlate_postprocess_and_filter() {
    let ws = workspace(3);
    let snp_cov = ws.path("snp_cov");
    run_cov(&ws.cov_config(snp_cov.clone())).expect("cov");

    let output_dir = ws.path("gene_corrs");
    let correlate = |chromosome| CorrelateConfig {
        cohort: ws.cohort_paths(&snp_cov),
        chromosome,
        output_dir: output_dir.clone(),
        condition_number: 30.0,
        within_distance_mb: None,
        debug_mode: false,
        dtype: MatrixDtype::Float64,
    };
    run_correlate(&correlate(1)).expect("chr1");
    let chr1_file = output_dir.join(BY_CHR_DIR).join(chromosome_matrix_file(1));
    let chr1 = read_labeled_matrix(&chr1_file).expect("chr1 matrix");
    assert_eq!(chr1.labels(), ["ENSG001", "ENSG002", "ENSG003"]);
    assert!(chr1.diagonal_is_one());
    assert!(chr1.get("ENSG001", "ENSG002").expect("pair") > 0.0);
    // A second run finds the file and leaves it alone.
    run_correlate(&correlate(1)).expect("skip");

    let postprocess = |expected_chromosomes| PostprocessConfig {
        output_dir: output_dir.clone(),
        gene_info: ws.gene_info.clone(),
        expected_chromosomes,
        dtype: MatrixDtype::Float64,
    };
    let err = run_postprocess(&postprocess(22)).expect_err("missing chromosomes");
    assert_eq!(exit_code(&err), 4);
    run_postprocess(&postprocess(1)).expect("postprocess");

    let genome = read_labeled_matrix(&output_dir.join(GENOME_MATRIX_FILE)).expect("genome");
    assert!(check_pos_def(genome.data()).expect("eigenvalues").is_pos_def());
    let symbols =
        read_labeled_matrix(&output_dir.join(GENOME_SYMBOLS_MATRIX_FILE)).expect("symbols");
    assert_eq!(symbols.labels(), ["GENE1", "GENE2", "GENE3"]);
    assert_eq!(symbols.data(), genome.data());

    run_filter(&FilterConfig {
        output_dir: output_dir.clone(),
        gene_info: ws.gene_info.clone(),
        distances_mb: vec![0.01, 1.0],
        threads: Some(2),
        dtype: MatrixDtype::Float64,
    })
    .expect("filter");
    let narrow =
        read_labeled_matrix(&output_dir.join(filtered_matrix_file(0.01))).expect("narrow");
    assert_eq!(narrow.get("GENE1", "GENE2"), Some(0.0));
    assert!(narrow.diagonal_is_one());
    let wide = read_labeled_matrix(&output_dir.join(filtered_matrix_file(1.0))).expect("wide");
    assert_eq!(wide.get("GENE1", "GENE2"), symbols.get("GENE1", "GENE2"));
    assert_eq!(wide.get("GENE1", "GENE3"), Some(0.0));
}

#[test]
fn correlate_rejects_unknown_chromosome() {
    let ws = workspace(4);
    let snp_cov = ws.path("snp_cov");
    run_cov(&ws.cov_config(snp_cov.clone())).expect("cov");
    let config = CorrelateConfig {
        cohort: ws.cohort_paths(&snp_cov),
        chromosome: 23,
        output_dir: ws.path("gene_corrs"),
        condition_number: 30.0,
        within_distance_mb: None,
        debug_mode: false,
        dtype: MatrixDtype::Float64,
    };
    let err = run_correlate(&config).expect_err("chromosome 23");
    assert_eq!(failure_kind(&err), FailureKind::Input);
}

#[test]
fn metadata_counts_snps_per_gene() {
    let ws = workspace(5);
    let snp_cov = ws.path("snp_cov");
    run_cov(&ws.cov_config(snp_cov.clone())).expect("cov");

    let out = ws.path("metadata");
    let mut config = MetadataConfig {
        cohort: ws.cohort_paths(&snp_cov),
        chromosomes: vec![1, 2],
        condition_number: 30.0,
        output_dir: out.clone(),
    };
    run_metadata(&config).expect("metadata");
    assert!(out.join(GENE_METADATA_FILE).is_file());

    // GENE1 has models over SNPs 0..8 in both tissues.
    let cohort_meta = CohortMetadata::from_path(&out, DupGeneAction::NoAction).expect("read");
    assert_eq!(cohort_meta.n_snps_used_sum("GENE1"), Some(16.0));
    assert_eq!(cohort_meta.unique_n_snps_used("GENE1"), Some(8.0));
    assert_eq!(cohort_meta.unique_n_snps_used("GENE4"), Some(10.0));

    let gwas = ws.path("gwas_variants.txt");
    let kept: Vec<String> = (0..6).map(|i| snp_id(1, i)).collect();
    fs::write(&gwas, kept.join("\n")).expect("write gwas variants");
    config.cohort.gwas_variants = Some(gwas);
    config.output_dir = ws.path("metadata_gwas");
    run_metadata(&config).expect("metadata with GWAS subset");
    let subset = CohortMetadata::from_path(&config.output_dir, DupGeneAction::NoAction)
        .expect("read");
    assert_eq!(subset.unique_n_snps_used("GENE1"), Some(6.0));
    assert_eq!(subset.n_snps_used_sum("GENE1"), Some(12.0));
    assert_eq!(subset.unique_n_snps_used("GENE4"), Some(0.0));
}

#[test]
fn worker_count_is_capped_by_tasks() {
    use phenoplier::parallel::resolve_workers;
    assert_eq!(resolve_workers(8, 3), 3);
    assert_eq!(resolve_workers(2, 3), 2);
    assert_eq!(resolve_workers(0, 3), 1);
    assert_eq!(resolve_workers(4, 0), 1);
}

#[test]
fn shared_symbols_resolve_to_the_first_id() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("genes.tsv");
    write_gene_info(
        &path,
        &[
            gene("ENSG010", "GENE1", 1, 10_000, 20_000),
            gene("ENSG011", "GENE1", 3, 50_000, 60_000),
            gene("ENSG012", "GENE2", 1, 30_000, 40_000),
        ],
    );

    let catalog = GeneCatalog::from_table(&path).expect("catalog");
    assert_eq!(catalog.len(), 3);
    assert_eq!(catalog.by_symbol("GENE1").expect("symbol").ensembl_id, "ENSG010");
    assert_eq!(catalog.by_id("ENSG011").expect("id").chromosome, 3);
    assert_eq!(catalog.id_to_symbol("ENSG011"), Some("GENE1"));
    assert_eq!(catalog.chromosomes(), vec![1, 3]);
}
