//! Gene-gene predicted-expression correlations and LV-trait GLS regression.
//!
//! The correlation side turns per-tissue prediction-model weights and SNP
//! covariances into a genome-wide, positive definite gene correlation
//! matrix (`correlation` → `aggregate` → `chromosome` → `assemble` →
//! `filter`). The regression side slices that matrix per LV, whitens it
//! (`whiten`) and fits each LV against gene-level trait statistics
//! (`regression`, backed by the `gls` crate).

pub mod error;
pub mod logging;
pub mod types;

pub mod df_utils;
pub mod io;
pub mod matrix;
pub mod parallel;
pub mod qc;

pub mod gene;
pub mod snp_cov;
pub mod weights;

pub mod aggregate;
pub mod assemble;
pub mod chromosome;
pub mod correlation;
pub mod filter;
pub mod metadata;

pub mod batch;
pub mod covariates;
pub mod lv_model;
pub mod regression;
pub mod whiten;
