//! LV selection: an explicit list or one contiguous batch.

use crate::error::{PhenoplierError, Result};

/// Splits `items` into `n` contiguous chunks whose sizes differ by at most
/// one; the first `len % n` chunks are the larger ones.
pub fn array_split<T: Clone>(items: &[T], n: usize) -> Vec<Vec<T>> {
    if n == 0 {
        return Vec::new();
    }
    let base = items.len() / n;
    let extra = items.len() % n;
    let mut out = Vec::with_capacity(n);
    let mut start = 0;
    for i in 0..n {
        let size = base + usize::from(i < extra);
        out.push(items[start..start + size].to_vec());
        start += size;
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LvSelection {
    All,
    Explicit(Vec<String>),
    /// 1-based batch of `n_splits`.
    Batch { id: usize, n_splits: usize },
}

impl LvSelection {
    pub fn from_args(
        lv_list: Option<Vec<String>>,
        batch_id: Option<usize>,
        batch_n_splits: Option<usize>,
    ) -> Result<Self> {
        match (lv_list, batch_id, batch_n_splits) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(PhenoplierError::InvalidInput(
                "an LV list and a batch selection cannot be combined".to_string(),
            )),
            (Some(list), None, None) => Ok(LvSelection::Explicit(list)),
            (None, Some(id), Some(n_splits)) => Ok(LvSelection::Batch { id, n_splits }),
            (None, Some(_), None) | (None, None, Some(_)) => Err(PhenoplierError::InvalidInput(
                "batch id and batch number of splits must be given together".to_string(),
            )),
            (None, None, None) => Ok(LvSelection::All),
        }
    }

    /// LVs to fit, in model order for batches and in the given order for
    /// explicit lists. An empty result is an error.
    pub fn resolve(&self, model_lvs: &[String]) -> Result<Vec<String>> {
        let selected = match self {
            LvSelection::All => model_lvs.to_vec(),
            LvSelection::Explicit(list) => {
                let mut seen = std::collections::HashSet::new();
                list.iter()
                    .filter(|lv| model_lvs.contains(lv) && seen.insert(lv.as_str()))
                    .cloned()
                    .collect()
            }
            LvSelection::Batch { id, n_splits } => {
                let (id, n_splits) = (*id, *n_splits);
                if n_splits == 0 || n_splits > model_lvs.len() {
                    return Err(PhenoplierError::InvalidInput(format!(
                        "batch number of splits must be between 1 and {}, got {n_splits}",
                        model_lvs.len()
                    )));
                }
                if id == 0 || id > n_splits {
                    return Err(PhenoplierError::InvalidInput(format!(
                        "batch id must be between 1 and {n_splits}, got {id}"
                    )));
                }
                array_split(model_lvs, n_splits).swap_remove(id - 1)
            }
        };
        if selected.is_empty() {
            return Err(PhenoplierError::InvalidInput(
                "no LVs selected after filtering".to_string(),
            ));
        }
        Ok(selected)
    }
}
