//! Row mappings describe a cardinality change of the primitive table.
//!
//! Every row of the new table either survives from an old row
//! (`Some(old_index)`) or is synthetic (`None`, freshly appended). The same
//! mapping is applied to parameters, optimizer moments and staged gradients,
//! so all per-row buffers stay aligned.

use serde::{Deserialize, Serialize};

use crate::primitives::ParamBuffer;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMapping {
    old_len: usize,
    sources: Vec<Option<usize>>,
}

impl RowMapping {
    pub fn identity(len: usize) -> Self {
        Self {
            old_len: len,
            sources: (0..len).map(Some).collect(),
        }
    }

    /// Keeps all `old_len` rows and appends `added` synthetic rows.
    pub fn append(old_len: usize, added: usize) -> Self {
        let mut sources: Vec<Option<usize>> = (0..old_len).map(Some).collect();
        sources.extend(std::iter::repeat(None).take(added));
        Self { old_len, sources }
    }

    /// Keeps the rows whose flag is `true`, preserving their relative order.
    pub fn retain(keep: &[bool]) -> Self {
        Self {
            old_len: keep.len(),
            sources: keep
                .iter()
                .enumerate()
                .filter_map(|(i, &k)| k.then_some(Some(i)))
                .collect(),
        }
    }

    pub fn from_sources(old_len: usize, sources: Vec<Option<usize>>) -> crate::Result<Self> {
        if let Some(bad) = sources.iter().flatten().find(|&&s| s >= old_len) {
            return Err(crate::Error::InvalidInput(format!(
                "row mapping source {bad} out of range for {old_len} rows"
            )));
        }
        Ok(Self { old_len, sources })
    }

    /// Composes `self` (old -> mid) with `next` (mid -> new) into old -> new.
    pub fn then(&self, next: &RowMapping) -> crate::Result<RowMapping> {
        if next.old_len != self.sources.len() {
            return Err(crate::Error::InvariantViolation(format!(
                "cannot compose mapping to {} rows with mapping from {} rows",
                self.sources.len(),
                next.old_len
            )));
        }
        Ok(RowMapping {
            old_len: self.old_len,
            sources: next
                .sources
                .iter()
                .map(|s| s.and_then(|mid| self.sources[mid]))
                .collect(),
        })
    }

    pub fn old_len(&self) -> usize {
        self.old_len
    }

    pub fn new_len(&self) -> usize {
        self.sources.len()
    }

    pub fn sources(&self) -> &[Option<usize>] {
        &self.sources
    }

    pub fn source(&self, new_index: usize) -> Option<usize> {
        self.sources[new_index]
    }

    /// Inverse view: for each old row, its new index or `None` if removed.
    pub fn old_to_new(&self) -> Vec<Option<usize>> {
        let mut out = vec![None; self.old_len];
        for (new, src) in self.sources.iter().enumerate() {
            if let Some(old) = src {
                out[*old] = Some(new);
            }
        }
        out
    }

    pub fn is_identity(&self) -> bool {
        self.old_len == self.sources.len()
            && self.sources.iter().enumerate().all(|(i, s)| *s == Some(i))
    }

    pub fn synthetic(&self) -> usize {
        self.sources.iter().filter(|s| s.is_none()).count()
    }

    pub fn removed(&self) -> usize {
        self.old_to_new().iter().filter(|s| s.is_none()).count()
    }

    /// Reindexes a per-row buffer; synthetic rows are zero-filled.
    pub fn apply(&self, buffer: &ParamBuffer) -> crate::Result<ParamBuffer> {
        self.apply_with(buffer, 0.0)
    }

    pub fn apply_with(&self, buffer: &ParamBuffer, fill: f32) -> crate::Result<ParamBuffer> {
        if buffer.rows() != self.old_len {
            return Err(crate::Error::InvariantViolation(format!(
                "buffer has {} rows but mapping expects {}",
                buffer.rows(),
                self.old_len
            )));
        }
        let width = buffer.width();
        let mut data = Vec::with_capacity(self.sources.len() * width);
        for src in &self.sources {
            match src {
                Some(old) => data.extend_from_slice(buffer.row(*old)),
                None => data.extend(std::iter::repeat(fill).take(width)),
            }
        }
        ParamBuffer::from_rows(self.sources.len(), width, data)
    }

    pub fn apply_vec<T: Clone>(&self, values: &[T], fill: T) -> crate::Result<Vec<T>> {
        if values.len() != self.old_len {
            return Err(crate::Error::InvariantViolation(format!(
                "column has {} rows but mapping expects {}",
                values.len(),
                self.old_len
            )));
        }
        Ok(self
            .sources
            .iter()
            .map(|s| match s {
                Some(old) => values[*old].clone(),
                None => fill.clone(),
            })
            .collect())
    }
}
