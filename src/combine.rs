//! Merge strategies for node overrides onto core data.
//!
//! A [`CombineRule`] is chosen once per program (see
//! [`ProgramOptions`](crate::types::ProgramOptions)) and shared by every node
//! built against that program's template.

use crate::types::{check_len, Result};
use serde::{Deserialize, Serialize};
use sprs::{CsVec, CsVecView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CombineRule {
    /// The override value supersedes the base value.
    #[default]
    Replace,
    /// The override value is summed onto the base value.
    Add,
}

impl CombineRule {
    /// Merge a single override value onto a base value.
    #[inline]
    pub fn apply(self, base: f64, over: f64) -> f64 {
        match self {
            Self::Replace => over,
            Self::Add => base + over,
        }
    }

    /// Scatter sparse `(indices, values)` onto a dense base in place.
    ///
    /// Indices must be `< base.len()`.
    pub(crate) fn scatter(self, base: &mut [f64], indices: &[usize], values: &[f64]) {
        for (&i, &v) in indices.iter().zip(values) {
            base[i] = self.apply(base[i], v);
        }
    }

    /// Dense merge: `base` is already dense, `over` is scattered onto it.
    ///
    /// No re-sparsification happens; `base` is the merged result.
    pub fn merge_dense(self, base: &mut [f64], over: CsVecView<'_, f64>) -> Result<()> {
        check_len("dense merge base", over.dim(), base.len())?;
        self.scatter(base, over.indices(), over.data());
        Ok(())
    }

    /// Sparse merge into a new sparse payload.
    ///
    /// The base is expanded into a dense scratch vector as wide as the
    /// larger operand, the override is scattered onto it, and the union of
    /// both index sets is re-extracted.  With `drop_zeros`, positions that
    /// merge to exactly zero are left out of the result.
    pub fn merge_sparse(
        self,
        base: CsVecView<'_, f64>,
        over: CsVecView<'_, f64>,
        drop_zeros: bool,
    ) -> CsVec<f64> {
        let dim = base.dim().max(over.dim());
        let mut scratch = vec![0.0; dim];
        for (i, &v) in base.iter() {
            scratch[i] = v;
        }
        self.scatter(&mut scratch, over.indices(), over.data());

        let (a, b) = (base.indices(), over.indices());
        let mut indices = Vec::with_capacity(a.len() + b.len());
        let mut data = Vec::with_capacity(a.len() + b.len());
        let (mut p, mut q) = (0, 0);
        loop {
            let i = match (a.get(p), b.get(q)) {
                (Some(&x), Some(&y)) if x == y => {
                    p += 1;
                    q += 1;
                    x
                }
                (Some(&x), Some(&y)) if x < y => {
                    p += 1;
                    x
                }
                (Some(_), Some(&y)) | (None, Some(&y)) => {
                    q += 1;
                    y
                }
                (Some(&x), None) => {
                    p += 1;
                    x
                }
                (None, None) => break,
            };
            let v = scratch[i];
            if drop_zeros && v == 0.0 {
                continue;
            }
            indices.push(i);
            data.push(v);
        }
        CsVec::new(dim, indices, data)
    }
}
