//! Multi-tissue aggregation: per-gene tissue subspaces and the SSM correlation
//! between two genes.

use ndarray::{Array1, Array2, Axis, s};
use ndarray_linalg::SVD;

use crate::correlation::{CorrelationContext, PairError};
use crate::gene::Gene;

pub const DEFAULT_CONDITION_NUMBER: f64 = 30.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TruncatedSvd {
    pub u: Array2<f64>,
    /// Kept singular values, descending.
    pub s: Array1<f64>,
    pub vt: Array2<f64>,
}

impl TruncatedSvd {
    pub fn rank(&self) -> usize {
        self.s.len()
    }
}

/// SVD of `matrix` keeping the components with `max(S) / S_i <= condition_number`.
///
/// Singular values come back sorted descending, so the kept components are a
/// prefix. Zero singular values are always dropped.
pub fn truncated_svd(
    matrix: &Array2<f64>,
    condition_number: f64,
) -> Result<TruncatedSvd, String> {
    if matrix.is_empty() {
        return Err("empty matrix".to_string());
    }
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err("matrix has non-finite values".to_string());
    }
    let (u, sv, vt) = matrix.svd(true, true).map_err(|e| e.to_string())?;
    let (Some(u), Some(vt)) = (u, vt) else {
        return Err("SVD returned no singular vectors".to_string());
    };
    let max_s = sv.iter().copied().fold(0.0_f64, f64::max);
    if max_s <= 0.0 {
        return Err("all singular values are zero".to_string());
    }
    let k = sv
        .iter()
        .take_while(|&&si| si > 0.0 && max_s / si <= condition_number)
        .count();
    Ok(TruncatedSvd {
        u: u.slice(s![.., ..k]).to_owned(),
        s: sv.slice(s![..k]).to_owned(),
        vt: vt.slice(s![..k, ..]).to_owned(),
    })
}

/// A gene's valid tissues together with the truncated SVD of their
/// correlation matrix.
#[derive(Debug, Clone)]
pub struct GeneTissueModel {
    pub gene: Gene,
    pub tissues: Vec<String>,
    pub svd: TruncatedSvd,
}

/// Tissues of `candidates` whose predicted-expression variance is defined
/// and positive.
pub fn valid_tissues(
    ctx: &CorrelationContext<'_>,
    gene: &Gene,
    candidates: &[String],
) -> Result<Vec<String>, PairError> {
    let mut tissues = Vec::with_capacity(candidates.len());
    for t in candidates {
        if let Some(var) = ctx.pred_expression_variance(gene, t)?
            && var > 0.0
        {
            tissues.push(t.clone());
        }
    }
    Ok(tissues)
}

/// Own-tissue correlation matrix of a gene over its valid tissues. None when
/// no tissue is valid.
pub fn tissue_correlations(
    ctx: &CorrelationContext<'_>,
    gene: &Gene,
    candidates: &[String],
) -> Result<Option<(Vec<String>, Array2<f64>)>, PairError> {
    let tissues = valid_tissues(ctx, gene, candidates)?;
    if tissues.is_empty() {
        return Ok(None);
    }
    let n = tissues.len();
    let mut m = Array2::<f64>::eye(n);
    for i in 0..n {
        for j in (i + 1)..n {
            let r = ctx
                .pair_correlation(gene, &tissues[i], gene, &tissues[j])?
                .unwrap_or(0.0);
            m[(i, j)] = r;
            m[(j, i)] = r;
        }
    }
    Ok(Some((tissues, m)))
}

/// Own-tissue covariance matrix of a gene over its valid tissues.
pub fn tissue_covariances(
    ctx: &CorrelationContext<'_>,
    gene: &Gene,
    candidates: &[String],
) -> Result<Option<(Vec<String>, Array2<f64>)>, PairError> {
    let tissues = valid_tissues(ctx, gene, candidates)?;
    if tissues.is_empty() {
        return Ok(None);
    }
    let n = tissues.len();
    let mut m = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in i..n {
            let c = ctx
                .pair_covariance(gene, &tissues[i], gene, &tissues[j])?
                .unwrap_or(0.0);
            m[(i, j)] = c;
            m[(j, i)] = c;
        }
    }
    Ok(Some((tissues, m)))
}

pub fn tissue_model(
    ctx: &CorrelationContext<'_>,
    gene: &Gene,
    candidates: &[String],
    condition_number: f64,
) -> Result<Option<GeneTissueModel>, PairError> {
    let Some((tissues, corr)) = tissue_correlations(ctx, gene, candidates)? else {
        return Ok(None);
    };
    let svd = truncated_svd(&corr, condition_number).map_err(|message| PairError::Svd {
        gene: gene.ensembl_id.clone(),
        message,
    })?;
    Ok(Some(GeneTissueModel {
        gene: gene.clone(),
        tissues,
        svd,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SsmOptions {
    pub condition_number: f64,
    /// Radius in bases around each gene; pairs farther apart get 0.0.
    pub within_distance: Option<f64>,
}

impl Default for SsmOptions {
    fn default() -> Self {
        Self {
            condition_number: DEFAULT_CONDITION_NUMBER,
            within_distance: None,
        }
    }
}

/// Zero without computing anything: different chromosomes, or outside the
/// distance window when one is set.
fn ssm_shortcut(gene1: &Gene, gene2: &Gene, opts: &SsmOptions) -> Option<f64> {
    if gene1.chromosome != gene2.chromosome {
        return Some(0.0);
    }
    if let Some(radius) = opts.within_distance
        && !gene1.within_distance(gene2, radius)
    {
        return Some(0.0);
    }
    None
}

/// SSM correlation from two prepared tissue models.
///
/// With V the kept right singular vectors and S the kept singular values of
/// each gene's tissue correlation, and C12 the cross-gene tissue correlations:
/// `‖S1^-½ V1ᵗ C12 V2 S2^-½‖²_F / √(k1·k2)`.
pub fn ssm_from_models(
    ctx: &CorrelationContext<'_>,
    m1: &GeneTissueModel,
    m2: &GeneTissueModel,
    opts: &SsmOptions,
) -> Result<f64, PairError> {
    if let Some(r) = ssm_shortcut(&m1.gene, &m2.gene, opts) {
        return Ok(r);
    }
    if m1.gene.ensembl_id == m2.gene.ensembl_id && m1.tissues == m2.tissues {
        return Ok(1.0);
    }

    let (n1, n2) = (m1.tissues.len(), m2.tissues.len());
    let mut cross = Array2::<f64>::zeros((n1, n2));
    for (i, t1) in m1.tissues.iter().enumerate() {
        for (j, t2) in m2.tissues.iter().enumerate() {
            cross[(i, j)] = ctx
                .pair_correlation(&m1.gene, t1, &m2.gene, t2)?
                .unwrap_or(0.0);
        }
    }

    let mut left = m1.svd.vt.dot(&cross).dot(&m2.svd.vt.t());
    let inv_sqrt1 = m1.svd.s.mapv(|v| v.sqrt().recip());
    let inv_sqrt2 = m2.svd.s.mapv(|v| v.sqrt().recip());
    for (mut row, &a) in left.axis_iter_mut(Axis(0)).zip(inv_sqrt1.iter()) {
        for (v, &b) in row.iter_mut().zip(inv_sqrt2.iter()) {
            *v *= a * b;
        }
    }

    let k = (m1.svd.rank() * m2.svd.rank()) as f64;
    let r = left.iter().map(|v| v * v).sum::<f64>() / k.sqrt();
    if !r.is_finite() {
        return Err(PairError::NonFinite {
            what: "SSM correlation",
            gene1: m1.gene.ensembl_id.clone(),
            gene2: m2.gene.ensembl_id.clone(),
        });
    }
    Ok(r.clamp(-1.0, 1.0))
}

/// SSM correlation between two genes given their candidate tissues. None
/// when either gene has no valid tissue after the SNP restrictions.
pub fn ssm_correlation(
    ctx: &CorrelationContext<'_>,
    gene1: &Gene,
    tissues1: &[String],
    gene2: &Gene,
    tissues2: &[String],
    opts: &SsmOptions,
) -> Result<Option<f64>, PairError> {
    if let Some(r) = ssm_shortcut(gene1, gene2, opts) {
        return Ok(Some(r));
    }
    let Some(m1) = tissue_model(ctx, gene1, tissues1, opts.condition_number)? else {
        return Ok(None);
    };
    let Some(m2) = tissue_model(ctx, gene2, tissues2, opts.condition_number)? else {
        return Ok(None);
    };
    ssm_from_models(ctx, &m1, &m2, opts).map(Some)
}

/// Sum of the kept singular values of a gene's tissue covariance matrix.
pub fn tissues_pc_variance(
    ctx: &CorrelationContext<'_>,
    gene: &Gene,
    candidates: &[String],
    condition_number: f64,
) -> Result<Option<f64>, PairError> {
    let Some((_, cov)) = tissue_covariances(ctx, gene, candidates)? else {
        return Ok(None);
    };
    let svd = truncated_svd(&cov, condition_number).map_err(|message| PairError::Svd {
        gene: gene.ensembl_id.clone(),
        message,
    })?;
    Ok(Some(svd.s.sum()))
}
