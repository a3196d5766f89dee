//! Scenario-tree node data as a sparse override of its stage's core data.
//!
//! A [`NodeDelta`] is either the *core node* of a stage (it stands for the
//! template itself and is never combined) or a *scenario node* holding only
//! the entries that differ from the core node.  Scenario entries are stored
//! in a single [`DeltaBuffer`], already translated to internal numbering.

use crate::combine::CombineRule;
use crate::template::{section_axis, CoreTemplate};
use crate::storage::{DeltaBuffer, DeltaBufferBuilder, Section};
use crate::types::{check_index, check_len, check_stage, Axis, Result, StagewiseError, TemplateId};
use ndarray::Array1;
use rustc_hash::FxHashMap;
use sprs::{CsMat, CsVec, CsVecView};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{trace, warn};

// ─────────────────────────────────────────────────────────────
//  Override input  (external numbering)
// ─────────────────────────────────────────────────────────────

/// Node data differing from the core, keyed by external row / column ids.
///
/// Entries belonging to another stage are dropped when the node is built.
/// When the same position is written twice the last value wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOverrides {
    matrix: Vec<(usize, usize, f64)>,
    scalars: [Vec<(usize, f64)>; 5],
}

impl NodeOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matrix_entry(mut self, row: usize, col: usize, value: f64) -> Self {
        self.matrix.push((row, col, value));
        self
    }

    /// Override one scalar of `section` (row id for row sections, column id otherwise).
    pub fn set(mut self, section: Section, index: usize, value: f64) -> Self {
        self.scalars[section as usize].push((index, value));
        self
    }

    pub fn col_lower(self, col: usize, value: f64) -> Self {
        self.set(Section::ColLower, col, value)
    }

    pub fn col_upper(self, col: usize, value: f64) -> Self {
        self.set(Section::ColUpper, col, value)
    }

    pub fn objective(self, col: usize, value: f64) -> Self {
        self.set(Section::Objective, col, value)
    }

    pub fn row_lower(self, row: usize, value: f64) -> Self {
        self.set(Section::RowLower, row, value)
    }

    pub fn row_upper(self, row: usize, value: f64) -> Self {
        self.set(Section::RowUpper, row, value)
    }

    /// Upper bound on the number of stored entries.
    pub fn len(&self) -> usize {
        self.matrix.len() + self.scalars.iter().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─────────────────────────────────────────────────────────────
//  Node delta
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum NodeKind {
    Core,
    Scenario(DeltaBuffer),
}

/// One scenario-tree node's data relative to its anchor template.
///
/// The dense-row cache is filled lazily through a `RefCell`, so a node is
/// not `Sync`; concurrent first access needs external synchronisation.
#[derive(Debug)]
pub struct NodeDelta {
    template: TemplateId,
    stage: usize,
    rule: CombineRule,
    drop_zeros: bool,
    num_cols: usize,
    row_count: usize,
    col_count: usize,
    kind: NodeKind,
    dense_rows: RefCell<FxHashMap<usize, Rc<Array1<f64>>>>,
}

impl NodeDelta {
    fn with_kind(core: &CoreTemplate, stage: usize, kind: NodeKind) -> Result<Self> {
        Ok(Self {
            template: core.id(),
            stage,
            rule: core.combine_rule(),
            drop_zeros: core.options().drop_explicit_zeros,
            num_cols: core.num_cols(),
            row_count: core.row_count(stage)?,
            col_count: core.col_count(stage)?,
            kind,
            dense_rows: RefCell::new(FxHashMap::default()),
        })
    }

    /// The node standing for stage `stage` of `core` itself.
    pub fn core(core: &CoreTemplate, stage: usize) -> Result<Self> {
        Self::with_kind(core, stage, NodeKind::Core)
    }

    /// Build a scenario node from external-indexed overrides.
    ///
    /// Storage is reserved once for every input entry, filled with the
    /// entries owned by `stage`, and shrunk to what was written.  Bound
    /// overrides at or beyond the program's infinity are stored as `±inf`,
    /// matching the template.
    pub fn scenario(core: &CoreTemplate, stage: usize, overrides: &NodeOverrides) -> Result<Self> {
        check_stage(stage, core.num_stages())?;
        let part = core.partition();
        let (row_map, col_map) = (part.rows(), part.cols());
        let row_start = core.row_start(stage)?;
        let col_start = core.col_start(stage)?;
        let row_count = core.row_count(stage)?;
        let options = core.options();
        let estimate = overrides.len();

        let mut builder = DeltaBufferBuilder::with_capacity(estimate, row_count)?;
        let mut duplicates = 0usize;

        // ── Matrix rows ───────────────────────────────────
        let mut entries: Vec<(usize, usize, f64)> = Vec::with_capacity(overrides.matrix.len());
        for &(row, col, value) in &overrides.matrix {
            check_index(Axis::Row, row, core.num_rows())?;
            check_index(Axis::Column, col, core.num_cols())?;
            if row_map.stage_of[row] == stage {
                entries.push((row_map.to_internal[row] - row_start, col_map.to_internal[col], value));
            }
        }
        // Stable sort keeps insertion order among duplicates.
        entries.sort_by_key(|&(r, c, _)| (r, c));
        let mut next = 0;
        for local in 0..row_count {
            while next < entries.len() && entries[next].0 == local {
                let (_, col, mut value) = entries[next];
                while next + 1 < entries.len() && entries[next + 1].0 == local && entries[next + 1].1 == col {
                    next += 1;
                    value = entries[next].2;
                    duplicates += 1;
                }
                builder.push(col, value);
                next += 1;
            }
            builder.end_row();
        }

        // ── Scalar sections ───────────────────────────────
        let mut sections = builder.into_sections()?;
        let mut scratch: Vec<(usize, f64)> = Vec::new();
        let mut kept: Vec<(usize, f64)> = Vec::new();
        for section in Section::ALL {
            let bound = section != Section::Objective;
            let axis = section_axis(section);
            let (count, start) = match axis {
                Axis::Row => (core.num_rows(), row_start),
                Axis::Column => (core.num_cols(), col_start),
            };
            let map = part.axis(axis);
            scratch.clear();
            for &(ext, value) in &overrides.scalars[section as usize] {
                check_index(axis, ext, count)?;
                if map.stage_of[ext] == stage {
                    let value = if bound { options.normalize(value) } else { value };
                    scratch.push((map.to_internal[ext] - start, value));
                }
            }
            scratch.sort_by_key(|&(i, _)| i);
            kept.clear();
            let mut k = 0;
            while k < scratch.len() {
                let (index, mut value) = scratch[k];
                while k + 1 < scratch.len() && scratch[k + 1].0 == index {
                    k += 1;
                    value = scratch[k].1;
                    duplicates += 1;
                }
                kept.push((index, value));
                k += 1;
            }
            sections.write_section(section, kept.iter().copied())?;
        }

        let written = sections.len();
        let buffer = sections.finish();
        if duplicates > 0 {
            warn!(stage, duplicates, "duplicate override entries; last value kept");
        }
        trace!(
            template = %core.id(),
            stage,
            estimate,
            written,
            dropped = estimate - written - duplicates,
            "scenario node built"
        );
        Self::with_kind(core, stage, NodeKind::Scenario(buffer))
    }

    // ── Identity ───────────────────────────────────────────

    pub fn template(&self) -> TemplateId {
        self.template
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn is_core_node(&self) -> bool {
        matches!(self.kind, NodeKind::Core)
    }

    pub fn combine_rule(&self) -> CombineRule {
        self.rule
    }

    /// Stored delta entries (zero for a core node).
    pub fn storage_len(&self) -> usize {
        match &self.kind {
            NodeKind::Core => 0,
            NodeKind::Scenario(buffer) => buffer.len(),
        }
    }

    pub fn storage_capacity(&self) -> usize {
        match &self.kind {
            NodeKind::Core => 0,
            NodeKind::Scenario(buffer) => buffer.capacity(),
        }
    }

    pub(crate) fn buffer(&self) -> Option<&DeltaBuffer> {
        match &self.kind {
            NodeKind::Core => None,
            NodeKind::Scenario(buffer) => Some(buffer),
        }
    }

    fn check_anchor(&self, core: &CoreTemplate) -> Result<()> {
        if core.id() != self.template {
            return Err(StagewiseError::ForeignTemplate { expected: self.template, actual: core.id() });
        }
        Ok(())
    }

    fn check_row(&self, i: usize) -> Result<()> {
        check_index(Axis::Row, i, self.row_count)
    }

    // ── Scalar reconstruction ──────────────────────────────

    /// Fill `buffer` with the node's effective values of `section`.
    ///
    /// The template values are copied first; a scenario node then merges
    /// its overrides with the program's combine rule.  A core node returns
    /// the template unmodified.
    pub fn copy_section(&self, core: &CoreTemplate, section: Section, buffer: &mut [f64]) -> Result<()> {
        self.check_anchor(core)?;
        core.copy_section(self.stage, section, buffer)?;
        if let NodeKind::Scenario(delta) = &self.kind {
            let (indices, values) = delta.section(section);
            self.rule.scatter(buffer, indices, values);
        }
        Ok(())
    }

    pub fn copy_row_lower(&self, core: &CoreTemplate, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(core, Section::RowLower, buffer)
    }

    pub fn copy_row_upper(&self, core: &CoreTemplate, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(core, Section::RowUpper, buffer)
    }

    pub fn copy_col_lower(&self, core: &CoreTemplate, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(core, Section::ColLower, buffer)
    }

    pub fn copy_col_upper(&self, core: &CoreTemplate, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(core, Section::ColUpper, buffer)
    }

    pub fn copy_objective(&self, core: &CoreTemplate, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(core, Section::Objective, buffer)
    }

    /// The node's own overrides of `section`, stage-local indices.
    ///
    /// `None` for a core node, which has no overrides.
    pub fn section(&self, section: Section) -> Option<CsVecView<'_, f64>> {
        let dim = match section_axis(section) {
            Axis::Row => self.row_count,
            Axis::Column => self.col_count,
        };
        self.buffer().map(|delta| {
            let (indices, values) = delta.section(section);
            CsVecView::new(dim, indices, values)
        })
    }

    // ── Matrix rows ────────────────────────────────────────

    /// Stored entries of stage-local row `i` (the template row for a core node).
    pub fn row_entries<'a>(&'a self, core: &'a CoreTemplate, i: usize) -> Result<CsVecView<'a, f64>> {
        self.check_anchor(core)?;
        self.check_row(i)?;
        match &self.kind {
            NodeKind::Core => core.matrix_row(self.stage, i),
            NodeKind::Scenario(delta) => {
                let (indices, values) = delta.row(i);
                Ok(CsVecView::try_new(self.num_cols, indices, values).map_err(|(_, _, e)| e)?)
            }
        }
    }

    pub fn row_length(&self, core: &CoreTemplate, i: usize) -> Result<usize> {
        Ok(self.row_entries(core, i)?.nnz())
    }

    pub fn num_matrix_elements(&self, core: &CoreTemplate) -> Result<usize> {
        self.check_anchor(core)?;
        match &self.kind {
            NodeKind::Core => core.num_matrix_elements(self.stage),
            NodeKind::Scenario(delta) => Ok(delta.matrix_len()),
        }
    }

    /// Row `i` of this node's matrix slice as a dense array of total column width.
    ///
    /// Materialised on first access and cached for the node's lifetime.
    pub fn dense_row(&self, core: &CoreTemplate, i: usize) -> Result<Rc<Array1<f64>>> {
        self.check_anchor(core)?;
        if let Some(row) = self.dense_rows.borrow().get(&i) {
            return Ok(Rc::clone(row));
        }
        let entries = self.row_entries(core, i)?;
        let mut dense = Array1::zeros(self.num_cols);
        for (j, &v) in entries.iter() {
            dense[j] = v;
        }
        let dense = Rc::new(dense);
        self.dense_rows.borrow_mut().insert(i, Rc::clone(&dense));
        Ok(dense)
    }

    /// Number of rows currently held in the dense-row cache.
    pub fn cached_dense_rows(&self) -> usize {
        self.dense_rows.borrow().len()
    }

    fn scenario_row(&self, i: usize) -> Result<(&[usize], &[f64])> {
        match &self.kind {
            NodeKind::Core => Err(StagewiseError::CoreNodeCombine { stage: self.stage }),
            NodeKind::Scenario(delta) => {
                self.check_row(i)?;
                Ok(delta.row(i))
            }
        }
    }

    /// Merge this node's row `i` onto a sparse core row.
    ///
    /// Rejected for a core node.
    pub fn combine_with_core_row(&self, i: usize, core_row: CsVecView<'_, f64>) -> Result<CsVec<f64>> {
        let (indices, values) = self.scenario_row(i)?;
        let own = CsVecView::try_new(self.num_cols, indices, values).map_err(|(_, _, e)| e)?;
        Ok(self.rule.merge_sparse(core_row, own, self.drop_zeros))
    }

    /// Merge this node's row `i` onto a dense core row in place.
    ///
    /// Rejected for a core node.
    pub fn combine_with_dense_core_row(&self, i: usize, dense_core_row: &mut [f64]) -> Result<()> {
        let (indices, values) = self.scenario_row(i)?;
        check_len("dense core row", self.num_cols, dense_core_row.len())?;
        self.rule.scatter(dense_core_row, indices, values);
        Ok(())
    }

    /// Effective row `i` of this node: the core row merged with the node's row.
    pub fn effective_row(&self, core: &CoreTemplate, i: usize) -> Result<CsVec<f64>> {
        self.check_anchor(core)?;
        let core_row = core.matrix_row(self.stage, i)?;
        if self.is_core_node() {
            return Ok(core_row.to_owned());
        }
        self.combine_with_core_row(i, core_row)
    }

    /// Effective matrix slice of the node's stage (CSR, stage rows × all columns).
    pub fn stage_matrix(&self, core: &CoreTemplate) -> Result<CsMat<f64>> {
        self.check_anchor(core)?;
        if self.is_core_node() {
            return Ok(core.stage_matrix(self.stage)?.clone());
        }
        let mut indptr = Vec::with_capacity(self.row_count + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for i in 0..self.row_count {
            let row = self.effective_row(core, i)?;
            indices.extend_from_slice(row.indices());
            data.extend_from_slice(row.data());
            indptr.push(indices.len());
        }
        Ok(CsMat::try_new((self.row_count, self.num_cols), indptr, indices, data)
            .map_err(|(_, _, _, e)| e)?)
    }
}
