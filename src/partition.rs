//! Stage partitioning: external ↔ internal index maps.
//!
//! Rows and columns are renumbered so that every stage occupies a
//! contiguous internal range `[start(t), start(t) + count(t))`.  Within a
//! stage the original order is preserved.

use crate::types::{
    check_index, check_len, check_stage, Axis, Result, StageAssignment, StagewiseError,
};
use std::ops::Range;
use tracing::debug;

// ─────────────────────────────────────────────────────────────
//  Per-axis map
// ─────────────────────────────────────────────────────────────

/// Stage layout of one axis (rows or columns).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisPartition {
    pub axis: Axis,
    /// Number of entries per stage.
    pub counts: Vec<usize>,
    /// Prefix sums of `counts`, length `num_stages + 1`.
    pub starts: Vec<usize>,
    /// Stage of each external index.
    pub stage_of: Vec<usize>,
    /// external → internal
    pub to_internal: Vec<usize>,
    /// internal → external
    pub to_external: Vec<usize>,
}

impl AxisPartition {
    /// Two-pass counting placement.
    ///
    /// Pass 1 tallies per-stage counts and derives the stage starts; pass 2
    /// walks the original order and hands each index the next free slot of
    /// its stage.
    fn build(axis: Axis, stages: &[usize], num_stages: usize) -> Result<Self> {
        let n = stages.len();
        let mut counts = vec![0usize; num_stages];
        for (index, &stage) in stages.iter().enumerate() {
            if stage >= num_stages {
                return Err(StagewiseError::StageOutOfRange { axis, index, stage, num_stages });
            }
            counts[stage] += 1;
        }

        let mut starts = Vec::with_capacity(num_stages + 1);
        starts.push(0);
        for &c in &counts {
            let last = starts[starts.len() - 1];
            starts.push(last + c);
        }

        let mut next = starts[..num_stages].to_vec();
        let mut to_internal = vec![0usize; n];
        let mut to_external = vec![0usize; n];
        for (ext, &stage) in stages.iter().enumerate() {
            let int = next[stage];
            next[stage] += 1;
            to_internal[ext] = int;
            to_external[int] = ext;
        }

        Ok(Self {
            axis,
            counts,
            starts,
            stage_of: stages.to_vec(),
            to_internal,
            to_external,
        })
    }

    pub fn len(&self) -> usize {
        self.to_internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_internal.is_empty()
    }

    pub fn num_stages(&self) -> usize {
        self.counts.len()
    }

    /// Internal index range of stage `t`.
    pub fn range(&self, t: usize) -> Result<Range<usize>> {
        check_stage(t, self.num_stages())?;
        Ok(self.starts[t]..self.starts[t + 1])
    }

    pub fn count(&self, t: usize) -> Result<usize> {
        check_stage(t, self.num_stages())?;
        Ok(self.counts[t])
    }

    /// First internal index of stage `t`; `t == num_stages` gives the total.
    pub fn start(&self, t: usize) -> Result<usize> {
        self.starts.get(t).copied().ok_or(StagewiseError::StageMismatch {
            stage: t,
            num_stages: self.num_stages(),
        })
    }

    pub fn internal(&self, external: usize) -> Result<usize> {
        check_index(self.axis, external, self.len())?;
        Ok(self.to_internal[external])
    }

    pub fn external(&self, internal: usize) -> Result<usize> {
        check_index(self.axis, internal, self.len())?;
        Ok(self.to_external[internal])
    }

    /// Stage of external index `external`.
    pub fn stage(&self, external: usize) -> Result<usize> {
        check_index(self.axis, external, self.len())?;
        Ok(self.stage_of[external])
    }

    /// Stage owning internal index `int` (binary search over the starts).
    pub fn stage_of_internal(&self, int: usize) -> Result<usize> {
        check_index(self.axis, int, self.len())?;
        // Last stage whose start is <= int; empty stages share a start and are skipped.
        Ok(self.starts.partition_point(|&s| s <= int) - 1)
    }
}

// ─────────────────────────────────────────────────────────────
//  Stage partition
// ─────────────────────────────────────────────────────────────

/// Output of the stage partitioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePartition {
    num_stages: usize,
    rows: AxisPartition,
    cols: AxisPartition,
    /// Per stage: integer columns as stage-local positions, ascending.
    integer_cols: Vec<Vec<usize>>,
}

impl StagePartition {
    /// Partition `num_rows` rows and `num_cols` columns into stages.
    ///
    /// Fails with a configuration error if a stage value lies outside
    /// `[0, num_stages)`, an assignment array has the wrong length, or an
    /// integer column id does not exist.
    pub fn new(
        num_rows: usize,
        num_cols: usize,
        assignment: &StageAssignment,
        integer_cols: &[usize],
    ) -> Result<Self> {
        let num_stages = assignment.num_stages;
        check_len("row stage assignment", num_rows, assignment.row_stages.len())?;
        check_len("column stage assignment", num_cols, assignment.col_stages.len())?;

        let rows = AxisPartition::build(Axis::Row, &assignment.row_stages, num_stages)?;
        let cols = AxisPartition::build(Axis::Column, &assignment.col_stages, num_stages)?;

        let mut per_stage = vec![Vec::new(); num_stages];
        for &j in integer_cols {
            if j >= num_cols {
                return Err(StagewiseError::IndexOutOfRange {
                    axis: Axis::Column,
                    index: j,
                    count: num_cols,
                });
            }
            let t = cols.stage_of[j];
            per_stage[t].push(cols.to_internal[j] - cols.starts[t]);
        }
        for list in &mut per_stage {
            list.sort_unstable();
            list.dedup();
        }

        debug!(
            num_stages,
            num_rows,
            num_cols,
            row_counts = ?rows.counts,
            col_counts = ?cols.counts,
            "stage partition built"
        );

        Ok(Self { num_stages, rows, cols, integer_cols: per_stage })
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn num_cols(&self) -> usize {
        self.cols.len()
    }

    pub fn rows(&self) -> &AxisPartition {
        &self.rows
    }

    pub fn cols(&self) -> &AxisPartition {
        &self.cols
    }

    pub fn axis(&self, axis: Axis) -> &AxisPartition {
        match axis {
            Axis::Row => &self.rows,
            Axis::Column => &self.cols,
        }
    }

    // ── Stage sizes ────────────────────────────────────────

    pub fn row_count(&self, t: usize) -> Result<usize> {
        self.rows.count(t)
    }

    pub fn col_count(&self, t: usize) -> Result<usize> {
        self.cols.count(t)
    }

    pub fn row_start(&self, t: usize) -> Result<usize> {
        self.rows.start(t)
    }

    pub fn col_start(&self, t: usize) -> Result<usize> {
        self.cols.start(t)
    }

    // ── Index lookups ──────────────────────────────────────

    pub fn row_internal(&self, external: usize) -> Result<usize> {
        self.rows.internal(external)
    }

    pub fn row_external(&self, internal: usize) -> Result<usize> {
        self.rows.external(internal)
    }

    pub fn col_internal(&self, external: usize) -> Result<usize> {
        self.cols.internal(external)
    }

    pub fn col_external(&self, internal: usize) -> Result<usize> {
        self.cols.external(internal)
    }

    pub fn row_stage(&self, external: usize) -> Result<usize> {
        self.rows.stage(external)
    }

    pub fn col_stage(&self, external: usize) -> Result<usize> {
        self.cols.stage(external)
    }

    pub fn stage_of_internal_row(&self, internal: usize) -> Result<usize> {
        self.rows.stage_of_internal(internal)
    }

    pub fn stage_of_internal_col(&self, internal: usize) -> Result<usize> {
        self.cols.stage_of_internal(internal)
    }

    // ── Integrality ────────────────────────────────────────

    /// Integer columns of stage `t` in stage-local internal numbering.
    pub fn integer_cols(&self, t: usize) -> Result<&[usize]> {
        check_stage(t, self.num_stages)?;
        Ok(&self.integer_cols[t])
    }

    pub fn is_integer(&self, t: usize, local: usize) -> Result<bool> {
        Ok(self.integer_cols(t)?.binary_search(&local).is_ok())
    }
}
