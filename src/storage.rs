//! Flat variable-size storage for node deltas.
//!
//! One value buffer and one parallel index buffer hold, back to back:
//!
//! ```text
//! | row 0 | row 1 | ... | row m-1 | col lower | col upper | objective | row lower | row upper |
//!  ^row_starts[0]                  ^sections[0]                                             ^sections[5]
//! ```
//!
//! The builder only appends, in two phases: matrix rows first, then the
//! scalar sections in storage order.  It records row ends and section
//! starts as it writes, and `finish` shrinks both buffers to the number of
//! entries actually written.

use crate::types::{check_len, Result, StagewiseError};
use rustc_hash::FxHasher;
use std::collections::TryReserveError;
use std::hash::{Hash, Hasher};

// ─────────────────────────────────────────────────────────────
//  Sections
// ─────────────────────────────────────────────────────────────

/// Scalar override sections, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Section {
    ColLower,
    ColUpper,
    Objective,
    RowLower,
    RowUpper,
}

impl Section {
    pub const ALL: [Section; 5] = [
        Section::ColLower,
        Section::ColUpper,
        Section::Objective,
        Section::RowLower,
        Section::RowUpper,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

const NUM_SECTIONS: usize = Section::ALL.len();

// ─────────────────────────────────────────────────────────────
//  Finished buffer
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DeltaBuffer {
    values: Vec<f64>,
    indices: Vec<usize>,
    /// Start of every matrix row plus the end of the last, length `rows + 1`.
    row_starts: Vec<usize>,
    /// Start of every section plus the end of the last.
    sections: [usize; NUM_SECTIONS + 1],
}

impl DeltaBuffer {
    /// Buffer with `num_rows` empty rows and empty sections.
    pub fn empty(num_rows: usize) -> Self {
        Self {
            values: Vec::new(),
            indices: Vec::new(),
            row_starts: vec![0; num_rows + 1],
            sections: [0; NUM_SECTIONS + 1],
        }
    }

    /// Total number of stored entries (matrix and scalar sections).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Allocated capacity, in entries.
    pub fn capacity(&self) -> usize {
        self.values.capacity().min(self.indices.capacity())
    }

    pub fn num_rows(&self) -> usize {
        self.row_starts.len() - 1
    }

    /// Number of stored matrix entries.
    pub fn matrix_len(&self) -> usize {
        self.row_starts[self.num_rows()]
    }

    /// Indices and values of matrix row `i`.
    pub fn row(&self, i: usize) -> (&[usize], &[f64]) {
        let r = self.row_starts[i]..self.row_starts[i + 1];
        (&self.indices[r.clone()], &self.values[r])
    }

    pub fn row_len(&self, i: usize) -> usize {
        self.row_starts[i + 1] - self.row_starts[i]
    }

    /// Indices and values of a scalar section.
    pub fn section(&self, section: Section) -> (&[usize], &[f64]) {
        let k = section.slot();
        let r = self.sections[k]..self.sections[k + 1];
        (&self.indices[r.clone()], &self.values[r])
    }

    /// Bitwise content comparison (so `-0.0` and NaN payloads are distinct).
    pub fn same_content(&self, other: &Self) -> bool {
        self.row_starts == other.row_starts
            && self.sections == other.sections
            && self.indices == other.indices
            && self
                .values
                .iter()
                .zip(&other.values)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }

    /// Content hash consistent with [`same_content`](Self::same_content).
    pub fn fingerprint(&self) -> u64 {
        let mut h = FxHasher::default();
        self.row_starts.hash(&mut h);
        self.sections.hash(&mut h);
        self.indices.hash(&mut h);
        for v in &self.values {
            v.to_bits().hash(&mut h);
        }
        h.finish()
    }
}

// ─────────────────────────────────────────────────────────────
//  Builder
// ─────────────────────────────────────────────────────────────

/// Append-only writer for the matrix rows of a [`DeltaBuffer`].
///
/// Rows are written with `push` then `end_row`, once per row.
/// [`into_sections`](Self::into_sections) checks that exactly the declared
/// rows were closed and hands over to the [`SectionWriter`], so no row can
/// be written once a section has started.
#[derive(Debug)]
pub struct DeltaBufferBuilder {
    values: Vec<f64>,
    indices: Vec<usize>,
    row_starts: Vec<usize>,
    num_rows: usize,
}

impl DeltaBufferBuilder {
    /// Reserve room for `entries` values up front.
    ///
    /// `entries` is an upper bound; the buffers are shrunk in `finish`.
    pub fn with_capacity(entries: usize, num_rows: usize) -> Result<Self> {
        let mut values = Vec::new();
        let mut indices = Vec::new();
        let mut row_starts = Vec::new();
        let alloc = |source: TryReserveError| StagewiseError::Allocation { requested: entries, source };
        values.try_reserve_exact(entries).map_err(alloc)?;
        indices.try_reserve_exact(entries).map_err(alloc)?;
        row_starts
            .try_reserve_exact(num_rows + 1)
            .map_err(|source| StagewiseError::Allocation { requested: num_rows + 1, source })?;
        row_starts.push(0);
        Ok(Self { values, indices, row_starts, num_rows })
    }

    #[inline]
    pub fn push(&mut self, index: usize, value: f64) {
        self.indices.push(index);
        self.values.push(value);
    }

    /// Close the current matrix row.
    pub fn end_row(&mut self) {
        self.row_starts.push(self.values.len());
    }

    /// Number of entries written so far.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Finish the matrix rows and start the scalar sections.
    ///
    /// Fails if the number of closed rows differs from the declared count
    /// or if entries were pushed after the last `end_row`.
    pub fn into_sections(self) -> Result<SectionWriter> {
        check_len("delta buffer rows", self.num_rows, self.row_starts.len() - 1)?;
        let matrix_len = self.row_starts[self.num_rows];
        if self.values.len() != matrix_len {
            return Err(StagewiseError::UnterminatedRow { entries: self.values.len() - matrix_len });
        }
        Ok(SectionWriter {
            values: self.values,
            indices: self.indices,
            row_starts: self.row_starts,
            sections: [matrix_len; NUM_SECTIONS + 1],
            next_section: 0,
        })
    }
}

/// Second phase of a [`DeltaBufferBuilder`]: scalar sections.
///
/// Each section is written whole, in [`Section::ALL`] order; sections that
/// are skipped are recorded as empty.
#[derive(Debug)]
pub struct SectionWriter {
    values: Vec<f64>,
    indices: Vec<usize>,
    row_starts: Vec<usize>,
    sections: [usize; NUM_SECTIONS + 1],
    next_section: usize,
}

impl SectionWriter {
    /// Append every entry of `section`.
    ///
    /// Fails with `SectionOrder` if `section` (or a later one) was already written.
    pub fn write_section<I>(&mut self, section: Section, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (usize, f64)>,
    {
        let k = section.slot();
        if k < self.next_section {
            return Err(StagewiseError::SectionOrder { section });
        }
        while self.next_section <= k {
            self.sections[self.next_section] = self.values.len();
            self.next_section += 1;
        }
        for (index, value) in entries {
            self.indices.push(index);
            self.values.push(value);
        }
        Ok(())
    }

    /// Number of entries written so far, matrix rows included.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Close all remaining sections and shrink to the written size.
    pub fn finish(mut self) -> DeltaBuffer {
        let end = self.values.len();
        while self.next_section <= NUM_SECTIONS {
            self.sections[self.next_section] = end;
            self.next_section += 1;
        }
        self.values.shrink_to_fit();
        self.indices.shrink_to_fit();
        self.row_starts.shrink_to_fit();
        DeltaBuffer {
            values: self.values,
            indices: self.indices,
            row_starts: self.row_starts,
            sections: self.sections,
        }
    }
}
