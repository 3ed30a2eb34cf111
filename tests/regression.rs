mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use common::ar1;
use ndarray::Array2;
use phenoplier::batch::{LvSelection, array_split};
use phenoplier::covariates::{
    Covariate, CovariateSource, compute_covariates, parse_covariates,
};
use phenoplier::error::{FailureKind, PhenoplierError, exit_code, failure_kind};
use phenoplier::io::{read_table, write_labeled_matrix};
use phenoplier::lv_model::LvModel;
use phenoplier::matrix::LabeledMatrix;
use phenoplier::metadata::{CohortMetadata, GeneMetadata};
use phenoplier::regression::{
    RegressionConfig, dedup_mask, pvalues_to_statistic, regression, run_regression,
};
use phenoplier::types::{
    DupGeneAction, GeneCorrMode, GeneSelection, LvAssociation, MatrixDtype, RegressionModel,
};
use phenoplier::whiten::{GenerateConfig, LvWhitener, run_generate, select_lv_genes};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const N_GENES: usize = 54;
const MISSING_PVALUES: [usize; 3] = [5, 17, 40];

fn symbol(i: usize) -> String {
    format!("G{i:02}")
}

fn lv_names(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("LV{i}")).collect()
}

struct Fixture {
    dir: TempDir,
    trait_file: PathBuf,
    lv_model: PathBuf,
    corr_file: PathBuf,
}

impl Fixture {
    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// 54 genes with three missing p-values, an LV model with `n_lvs` LVs and
/// an AR(1) gene correlation matrix. With `duplicate`, gene G00 appears a
/// second time with a very different p-value.
fn fixture(seed: u64, n_lvs: usize, duplicate: bool) -> Fixture {
    let mut rng = StdRng::seed_from_u64(seed);
    let dir = TempDir::new().expect("tempdir");

    let mut trait_table = String::from("gene_name\tpvalue\tn\tn_indep\n");
    for i in 0..N_GENES {
        let p = if MISSING_PVALUES.contains(&i) {
            "NA".to_string()
        } else if i == 0 {
            "0.000001".to_string()
        } else {
            format!("{}", rng.gen_range(1e-4..1.0))
        };
        let n_indep: u32 = rng.gen_range(1..50);
        let n = n_indep + rng.gen_range(1..100);
        trait_table.push_str(&format!("{}\t{p}\t{n}\t{n_indep}\n", symbol(i)));
    }
    if duplicate {
        trait_table.push_str(&format!("{}\t0.9\t40\t10\n", symbol(0)));
    }
    let trait_file = dir.path().join("trait.tsv");
    fs::write(&trait_file, trait_table).expect("write trait");

    let lvs = lv_names(n_lvs);
    let mut model = format!("gene\t{}\n", lvs.join("\t"));
    for i in 0..N_GENES {
        let row: Vec<String> = (0..n_lvs)
            .map(|_| {
                let v: f64 = if i == 0 {
                    1.0
                } else if rng.gen_bool(0.3) {
                    0.0
                } else {
                    rng.gen_range(0.01..2.0)
                };
                format!("{v}")
            })
            .collect();
        model.push_str(&format!("{}\t{}\n", symbol(i), row.join("\t")));
    }
    let lv_model = dir.path().join("lv_model.tsv");
    fs::write(&lv_model, model).expect("write lv model");

    let corr = LabeledMatrix::new((0..N_GENES).map(symbol).collect(), ar1(N_GENES, 0.3))
        .expect("corr");
    let corr_file = dir.path().join("gene_corrs.tsv");
    write_labeled_matrix(&corr, &corr_file, MatrixDtype::Float64).expect("write corr");

    Fixture {
        dir,
        trait_file,
        lv_model,
        corr_file,
    }
}

fn config(fx: &Fixture, model: RegressionModel) -> RegressionConfig {
    RegressionConfig {
        input_file: fx.trait_file.clone(),
        output_file: fx.path("out.tsv"),
        lv_model: fx.lv_model.clone(),
        model,
        gene_corr_file: match model {
            RegressionModel::Gls => Some(fx.corr_file.clone()),
            RegressionModel::Ols => None,
        },
        gene_corr_mode: GeneCorrMode::Sub,
        dup_genes_action: DupGeneAction::NoAction,
        covariates: parse_covariates("default").expect("covariates"),
        cohort_metadata: None,
        lvs: LvSelection::All,
        selection: GeneSelection::Nonzero,
    }
}

fn by_lv(mut rows: Vec<LvAssociation>) -> Vec<LvAssociation> {
    rows.sort_by(|a, b| a.lv.cmp(&b.lv));
    rows
}

fn expect_kind(result: anyhow::Result<impl std::fmt::Debug>, kind: FailureKind) {
    let err = result.expect_err("should fail");
    assert_eq!(failure_kind(&err), kind, "{err:#}");
}

#[test]
fn end_to_end_writes_one_row_per_lv() {
    let fx = fixture(1, 5, false);
    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.lvs = LvSelection::Explicit(lv_names(3));
    run_regression(&cfg).expect("regression");

    let df = read_table(&cfg.output_file).expect("read output");
    let columns: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(columns, ["lv", "beta", "beta_se", "t", "pvalue"]);
    assert_eq!(df.height(), 3);
    assert_eq!(df.column("pvalue").expect("pvalue").null_count(), 0);

    let rows = regression(&cfg).expect("regression");
    assert_eq!(rows.len(), 3);
    for r in &rows {
        assert!(r.n_genes <= N_GENES - MISSING_PVALUES.len());
        assert!(r.pvalue > 0.0 && r.pvalue < 1.0, "{r:?}");
        assert!(r.beta.is_finite() && r.beta_se > 0.0 && r.t.is_finite());
    }
    assert!(rows.windows(2).all(|w| w[0].pvalue <= w[1].pvalue));
}

#[test]
fn existing_output_is_not_recomputed() {
    let fx = fixture(2, 3, false);
    let cfg = config(&fx, RegressionModel::Gls);
    fs::write(&cfg.output_file, "sentinel").expect("write");
    run_regression(&cfg).expect("skips");
    assert_eq!(fs::read_to_string(&cfg.output_file).expect("read"), "sentinel");
}

#[test]
fn duplicate_policies_change_the_fit() {
    let fx = fixture(3, 3, true);
    let run = |action| {
        let mut cfg = config(&fx, RegressionModel::Gls);
        cfg.dup_genes_action = action;
        by_lv(regression(&cfg).expect("regression"))
    };
    let first = run(DupGeneAction::KeepFirst);
    let last = run(DupGeneAction::KeepLast);
    let removed = run(DupGeneAction::RemoveAll);

    assert_eq!(first, run(DupGeneAction::KeepFirst));
    for ((f, l), r) in first.iter().zip(&last).zip(&removed) {
        assert_eq!(f.n_genes, l.n_genes);
        assert_eq!(r.n_genes + 1, f.n_genes);
        assert_ne!(f.beta, l.beta);
    }

    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.dup_genes_action = DupGeneAction::NoAction;
    let err = regression(&cfg).expect_err("duplicates need an action");
    assert_eq!(exit_code(&err), 2);
}

#[test]
fn cli_keeps_the_first_duplicate_by_default() {
    let fx = fixture(3, 3, true);
    let cli_out = fx.path("cli.tsv");
    let status = Command::new(env!("CARGO_BIN_EXE_phenoplier"))
        .arg("regression")
        .arg("--input-file")
        .arg(&fx.trait_file)
        .arg("--output-file")
        .arg(&cli_out)
        .arg("--lv-model")
        .arg(&fx.lv_model)
        .arg("--gene-corr-file")
        .arg(&fx.corr_file)
        .status()
        .expect("run phenoplier");
    assert!(status.success(), "exit status {status}");

    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.dup_genes_action = DupGeneAction::KeepFirst;
    cfg.covariates = Vec::new();
    cfg.output_file = fx.path("lib.tsv");
    run_regression(&cfg).expect("regression");

    let cli = fs::read_to_string(&cli_out).expect("cli output");
    let lib = fs::read_to_string(&cfg.output_file).expect("library output");
    assert_eq!(cli, lib);
}

#[test]
fn dedup_mask_policies() {
    let genes: Vec<String> = ["A", "B", "A", "C", "A"].iter().map(|s| s.to_string()).collect();
    assert_eq!(
        dedup_mask(&genes, DupGeneAction::KeepFirst),
        [true, true, false, true, false]
    );
    assert_eq!(
        dedup_mask(&genes, DupGeneAction::KeepLast),
        [false, true, false, true, true]
    );
    assert_eq!(
        dedup_mask(&genes, DupGeneAction::RemoveAll),
        [false, true, false, true, false]
    );
    assert!(dedup_mask(&genes, DupGeneAction::NoAction).iter().all(|k| *k));
}

#[test]
fn zero_pvalues_use_a_tenth_of_the_smallest() {
    let y = pvalues_to_statistic(&[0.0, 0.1, 0.01]);
    assert!((y[0] - 3.0).abs() < 1e-12);
    assert!((y[1] - 1.0).abs() < 1e-12);
    assert!((y[2] - 2.0).abs() < 1e-12);
}

#[test]
fn batches_cover_the_full_run() {
    let fx = fixture(4, 7, false);
    let full = by_lv(regression(&config(&fx, RegressionModel::Gls)).expect("full"));
    assert_eq!(full.len(), 7);

    for n_splits in 1..=7 {
        let mut union = Vec::new();
        for id in 1..=n_splits {
            let mut cfg = config(&fx, RegressionModel::Gls);
            cfg.lvs = LvSelection::Batch { id, n_splits };
            union.extend(regression(&cfg).expect("batch"));
        }
        assert_eq!(by_lv(union), full, "n_splits = {n_splits}");
    }
}

#[test]
fn array_split_sizes() {
    let items: Vec<usize> = (0..7).collect();
    let chunks = array_split(&items, 3);
    assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]);
    let chunks = array_split(&items[..2], 3);
    assert_eq!(chunks.iter().map(Vec::len).collect::<Vec<_>>(), [1, 1, 0]);
}

#[test]
fn invalid_batches_are_rejected() {
    let lvs = lv_names(4);
    for (id, n_splits) in [(0, 2), (3, 2), (1, 5), (1, 0)] {
        let err = LvSelection::Batch { id, n_splits }
            .resolve(&lvs)
            .expect_err("invalid batch");
        assert!(matches!(err, phenoplier::error::PhenoplierError::InvalidInput(_)));
    }
    assert!(LvSelection::from_args(None, Some(1), None).is_err());
    assert!(LvSelection::from_args(Some(vec!["LV1".into()]), Some(1), Some(2)).is_err());
    assert_eq!(
        LvSelection::from_args(None, None, None).expect("all"),
        LvSelection::All
    );
    assert!(
        LvSelection::Explicit(vec!["LV99".into()])
            .resolve(&lvs)
            .is_err()
    );

    let fx = fixture(5, 3, false);
    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.lvs = LvSelection::Batch { id: 4, n_splits: 4 };
    expect_kind(regression(&cfg), FailureKind::Input);
}

#[test]
fn covariate_lists() {
    assert_eq!(
        parse_covariates("default").expect("default"),
        [
            Covariate::GeneDensity,
            Covariate::GeneDensityLog,
            Covariate::GeneSize,
            Covariate::GeneSizeLog
        ]
    );
    assert_eq!(parse_covariates("all").expect("all").len(), 8);
    assert_eq!(
        parse_covariates("gene_size_log, gene_size gene_size").expect("list"),
        [Covariate::GeneSize, Covariate::GeneSizeLog]
    );
    assert!(parse_covariates("gene_size_log").is_err());
    assert!(parse_covariates("gene_length").is_err());
    assert!(parse_covariates("").expect("none").is_empty());
}

#[test]
fn covariate_values() {
    let genes: Vec<String> = vec!["A".into(), "B".into(), "C".into()];
    let n = [10.0, 20.0, 5.0];
    let n_indep = [5.0, 4.0, 0.0];
    let rows = vec![GeneMetadata {
        gene_id: "ENSG1".into(),
        gene_name: "A".into(),
        tissues: vec!["Liver".into(), "Lung".into()],
        n_snps_used_sum: 12,
        unique_n_snps_in_model: 9,
        unique_n_snps_used: 8,
        tissues_pc_variance: 1.5,
    }];
    let cohort = CohortMetadata::from_rows(&rows);
    let src = CovariateSource {
        genes: &genes,
        n: Some(&n[..]),
        n_indep: Some(&n_indep[..]),
        cohort: Some(&cohort),
    };
    let selected = parse_covariates("all").expect("all");
    let values = compute_covariates(&selected, &src).expect("values");
    let col = |c: Covariate| selected.iter().position(|s| *s == c).expect("selected");

    assert_eq!(values[(0, col(Covariate::GeneSize))], 5.0);
    assert!((values[(0, col(Covariate::GeneSizeLog))] - 5f64.ln()).abs() < 1e-12);
    assert_eq!(values[(1, col(Covariate::GeneDensity))], 0.2);
    assert!((values[(1, col(Covariate::GeneDensityLog))] + 0.2f64.ln()).abs() < 1e-12);
    assert_eq!(values[(0, col(Covariate::GeneNSnpsUsed))], 12.0);
    assert_eq!(values[(0, col(Covariate::GeneNSnpsUsedDensity))], 1.5);
    assert!((values[(0, col(Covariate::GeneNSnpsUsedDensityLog))] + 1.5f64.ln()).abs() < 1e-12);
    // log(0) and genes missing from the cohort metadata are undefined.
    assert!(values[(2, col(Covariate::GeneSizeLog))].is_nan());
    assert!(values[(1, col(Covariate::GeneNSnpsUsed))].is_nan());

    let err = compute_covariates(&[Covariate::GeneSizeLog, Covariate::GeneDensity], &src)
        .expect_err("log covariate without its base");
    assert!(matches!(err, PhenoplierError::InvalidInput(_)), "{err}");

    let src = CovariateSource {
        n_indep: None,
        ..src
    };
    assert!(compute_covariates(&[Covariate::GeneSize], &src).is_err());
}

#[test]
fn snp_level_covariates_need_cohort_metadata() {
    let fx = fixture(6, 3, false);
    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.covariates = parse_covariates("gene_n_snps_used").expect("covariates");
    expect_kind(regression(&cfg), FailureKind::Input);

    let mut table = String::from("gene_id\tgene_name\tn_snps_used_sum\tunique_n_snps_used\n");
    for i in 0..N_GENES {
        table.push_str(&format!("ENSG{i}\t{}\t{}\t{}\n", symbol(i), 10 + i, 5 + i % 4));
    }
    let metadata = fx.path("gene_metadata.tsv");
    fs::write(&metadata, table).expect("write metadata");
    cfg.cohort_metadata = Some(fx.dir.path().to_path_buf());
    let rows = regression(&cfg).expect("with metadata");
    assert_eq!(rows.len(), 3);
}

#[test]
fn lv_gene_selection() {
    let genes: Vec<String> = ["A", "B", "C", "D", "E"].iter().map(|s| s.to_string()).collect();
    let loadings = Array2::from_shape_vec((5, 1), vec![0.0, 1.0, -2.0, 3.0, 4.0]).expect("shape");
    let model = LvModel::new(genes.clone(), vec!["LV1".into()], loadings).expect("model");

    let nonzero = select_lv_genes(&model, "LV1", &genes, GeneSelection::Nonzero).expect("nonzero");
    assert_eq!(nonzero, ["B", "C", "D", "E"]);
    // Median of the nonzero magnitudes is 2.5; counting A's zero would make it 2.
    let top = select_lv_genes(&model, "LV1", &genes, GeneSelection::TopPercentile(0.5))
        .expect("top");
    assert_eq!(top, ["D", "E"]);
    assert!(select_lv_genes(&model, "LV2", &genes, GeneSelection::Nonzero).is_err());
    assert!(select_lv_genes(&model, "LV1", &genes, GeneSelection::TopPercentile(0.0)).is_err());
}

#[test]
fn generated_artifacts_match_the_matrix() {
    let fx = fixture(7, 4, false);
    let artifacts = fx.path("gene_corrs.per_lv");
    run_generate(&GenerateConfig {
        gene_corr_file: fx.corr_file.clone(),
        lv_model: fx.lv_model.clone(),
        lvs: LvSelection::All,
        selection: GeneSelection::Nonzero,
        output_dir: None,
        reference_panel: "1000G".into(),
        eqtl_model: "MASHR".into(),
        dtype: MatrixDtype::Float64,
    })
    .expect("generate");
    assert!(artifacts.join("gene_names.txt").is_file());
    assert_eq!(
        phenoplier::whiten::read_artifact_metadata(&artifacts).expect("metadata"),
        ("1000G".to_string(), "MASHR".to_string())
    );
    let stored = LvWhitener::read(&artifacts, "LV1").expect("LV1 artifact");
    assert!(stored.genes().contains(&symbol(0)));

    let from_matrix = by_lv(regression(&config(&fx, RegressionModel::Gls)).expect("matrix"));
    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.gene_corr_file = Some(artifacts);
    let from_artifacts = by_lv(regression(&cfg).expect("artifacts"));

    assert_eq!(from_matrix.len(), from_artifacts.len());
    for (a, b) in from_matrix.iter().zip(&from_artifacts) {
        assert_eq!(a.lv, b.lv);
        assert_eq!(a.n_genes, b.n_genes);
        assert!((a.beta - b.beta).abs() < 1e-8, "{a:?} vs {b:?}");
        assert!((a.pvalue - b.pvalue).abs() < 1e-8, "{a:?} vs {b:?}");
    }
}

#[test]
fn full_mode_shares_one_factor() {
    let fx = fixture(8, 3, false);
    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.gene_corr_mode = GeneCorrMode::Full;
    let rows = regression(&cfg).expect("full mode");
    assert!(rows.iter().all(|r| r.n_genes == N_GENES - MISSING_PVALUES.len()));
}

#[test]
fn correlation_file_must_match_the_model() {
    let fx = fixture(9, 3, false);
    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.gene_corr_file = None;
    expect_kind(regression(&cfg), FailureKind::Input);

    let mut cfg = config(&fx, RegressionModel::Ols);
    cfg.gene_corr_file = Some(fx.corr_file.clone());
    expect_kind(regression(&cfg), FailureKind::Input);

    let ols = regression(&config(&fx, RegressionModel::Ols)).expect("ols");
    assert_eq!(ols.len(), 3);

    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.gene_corr_mode = GeneCorrMode::Full;
    cfg.gene_corr_file = Some(fx.dir.path().to_path_buf());
    expect_kind(regression(&cfg), FailureKind::Input);
}

fn write_indefinite_corr(path: &Path) {
    let mut data = Array2::<f64>::from_elem((N_GENES, N_GENES), -0.5);
    data.diag_mut().fill(1.0);
    let corr = LabeledMatrix::new((0..N_GENES).map(symbol).collect(), data).expect("corr");
    write_labeled_matrix(&corr, path, MatrixDtype::Float64).expect("write corr");
}

#[test]
fn failures_map_to_exit_codes() {
    let fx = fixture(10, 3, false);

    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.input_file = fx.path("missing.tsv");
    expect_kind(regression(&cfg), FailureKind::Environment);

    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.output_file = fx.path("no_such_dir/out.tsv");
    let err = run_regression(&cfg).expect_err("missing parent");
    assert_eq!(exit_code(&err), 4);

    let bad = fx.path("indefinite.tsv");
    write_indefinite_corr(&bad);
    let mut cfg = config(&fx, RegressionModel::Gls);
    cfg.gene_corr_file = Some(bad);
    let err = regression(&cfg).expect_err("not positive definite");
    assert_eq!(exit_code(&err), 3);

    fs::write(fx.path("no_pvalue.tsv"), "gene_name\tzscore\nG00\t1.0\n").expect("write");
    let mut cfg = config(&fx, RegressionModel::Ols);
    cfg.input_file = fx.path("no_pvalue.tsv");
    expect_kind(regression(&cfg), FailureKind::Input);
}
