use std::collections::HashMap;

use anyhow::Result;
use ndarray::Array2;

use crate::error::PhenoplierError;

pub fn ensure_square(matrix: &Array2<f64>, name: &str) -> Result<()> {
    let (n, m) = matrix.dim();
    if n != m {
        return Err(PhenoplierError::InvalidInput(format!(
            "{name} must be square, got {n}x{m}"
        ))
        .into());
    }
    Ok(())
}

pub fn symmetrize(matrix: &mut Array2<f64>) {
    let n = matrix.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (matrix[(i, j)] + matrix[(j, i)]);
            matrix[(i, j)] = avg;
            matrix[(j, i)] = avg;
        }
    }
}

/// Square matrix whose rows and columns share one ordered label set.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledMatrix {
    labels: Vec<String>,
    index: HashMap<String, usize>,
    data: Array2<f64>,
}

impl LabeledMatrix {
    pub fn new(labels: Vec<String>, data: Array2<f64>) -> Result<Self> {
        ensure_square(&data, "labeled matrix")?;
        if labels.len() != data.nrows() {
            return Err(PhenoplierError::InvalidInput(format!(
                "{} labels given for a {}x{} matrix",
                labels.len(),
                data.nrows(),
                data.ncols()
            ))
            .into());
        }
        let mut index = HashMap::with_capacity(labels.len());
        for (i, label) in labels.iter().enumerate() {
            if index.insert(label.clone(), i).is_some() {
                return Err(PhenoplierError::InvalidInput(format!(
                    "duplicated matrix label {label}"
                ))
                .into());
            }
        }
        Ok(Self {
            labels,
            index,
            data,
        })
    }

    pub fn identity(labels: Vec<String>) -> Result<Self> {
        let n = labels.len();
        Self::new(labels, Array2::eye(n))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn into_data(self) -> Array2<f64> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.index.get(label).copied()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.index.contains_key(label)
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        Some(self.data[(self.position(a)?, self.position(b)?)])
    }

    pub fn with_data(&self, data: Array2<f64>) -> Result<Self> {
        Self::new(self.labels.clone(), data)
    }

    /// Same values under new labels, e.g. ensembl ids replaced by symbols.
    pub fn relabel(&self, labels: Vec<String>) -> Result<Self> {
        if labels.len() != self.len() {
            return Err(PhenoplierError::InvalidInput(format!(
                "{} new labels for a matrix of {} labels",
                labels.len(),
                self.len()
            ))
            .into());
        }
        Self::new(labels, self.data.clone())
    }

    /// Rows and columns for `labels`, in the order given.
    pub fn submatrix(&self, labels: &[String]) -> Result<Self> {
        let mut idx = Vec::with_capacity(labels.len());
        for label in labels {
            let pos = self.position(label).ok_or_else(|| {
                PhenoplierError::InvalidInput(format!("label {label} not present in matrix"))
            })?;
            idx.push(pos);
        }
        let data = Array2::from_shape_fn((idx.len(), idx.len()), |(i, j)| {
            self.data[(idx[i], idx[j])]
        });
        Self::new(labels.to_vec(), data)
    }

    pub fn diagonal_is_one(&self) -> bool {
        self.data.diag().iter().all(|v| *v == 1.0)
    }

    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|v| v.is_nan())
    }
}

/// Places the blocks along the diagonal; entries across blocks are zero.
pub fn block_diagonal(blocks: &[LabeledMatrix]) -> Result<LabeledMatrix> {
    let total: usize = blocks.iter().map(|b| b.len()).sum();
    let mut labels = Vec::with_capacity(total);
    let mut data = Array2::<f64>::zeros((total, total));
    let mut offset = 0usize;
    for block in blocks {
        let n = block.len();
        data.slice_mut(ndarray::s![offset..offset + n, offset..offset + n])
            .assign(block.data());
        labels.extend(block.labels().iter().cloned());
        offset += n;
    }
    LabeledMatrix::new(labels, data)
}
