//! Core template: per-stage canonical problem data.
//!
//! Built once from a [`ProblemSnapshot`] and a stage assignment.  Each stage
//! keeps dense internal-order copies of its row bounds, column bounds and
//! objective, plus its slice of the constraint matrix in CSR form with
//! column ids renumbered to internal numbering.

use crate::combine::CombineRule;
use crate::partition::StagePartition;
use crate::storage::Section;
use crate::types::{
    check_len, Axis, ProblemSnapshot, ProgramOptions, Result, StageAssignment, StagewiseError,
    TemplateId,
};
use ndarray::Array1;
use sprs::{CsMat, CsVecView};
use tracing::debug;

// ─────────────────────────────────────────────────────────────
//  Stage data
// ─────────────────────────────────────────────────────────────

/// Canonical data of one stage, in internal (stage-contiguous) order.
#[derive(Debug, Clone)]
pub struct CoreStage {
    pub row_lower: Vec<f64>,
    pub row_upper: Vec<f64>,
    pub col_lower: Vec<f64>,
    pub col_upper: Vec<f64>,
    pub objective: Vec<f64>,
    /// Stage rows × all columns, CSR, internal column ids, sorted per row.
    pub matrix: CsMat<f64>,
}

impl CoreStage {
    pub fn dense(&self, section: Section) -> &[f64] {
        match section {
            Section::ColLower => &self.col_lower,
            Section::ColUpper => &self.col_upper,
            Section::Objective => &self.objective,
            Section::RowLower => &self.row_lower,
            Section::RowUpper => &self.row_upper,
        }
    }
}

/// Axis a scalar section is indexed by.
pub(crate) fn section_axis(section: Section) -> Axis {
    match section {
        Section::ColLower | Section::ColUpper | Section::Objective => Axis::Column,
        Section::RowLower | Section::RowUpper => Axis::Row,
    }
}

// ─────────────────────────────────────────────────────────────
//  Core template
// ─────────────────────────────────────────────────────────────

/// Stage-partitioned canonical data shared by every node of a program.
///
/// Immutable after construction; all accessors take `&self` and the type is
/// `Sync`, so any number of readers may reconstruct stage data at once.
#[derive(Debug, Clone)]
pub struct CoreTemplate {
    id: TemplateId,
    partition: StagePartition,
    options: ProgramOptions,
    stages: Vec<CoreStage>,
}

impl CoreTemplate {
    /// Partition the snapshot and build one core stage per stage.
    pub(crate) fn build(
        id: TemplateId,
        snapshot: &ProblemSnapshot,
        assignment: &StageAssignment,
        options: ProgramOptions,
    ) -> Result<Self> {
        snapshot.validate()?;
        let partition = StagePartition::new(
            snapshot.num_rows,
            snapshot.num_cols,
            assignment,
            &snapshot.integer_cols,
        )?;

        let converted;
        let csr = if snapshot.matrix.is_csr() {
            snapshot.matrix.view()
        } else {
            converted = snapshot.matrix.to_csr();
            converted.view()
        };

        let normalize = |values: &[f64], ext: usize| options.normalize(values[ext]);
        let num_cols = snapshot.num_cols;
        let mut stages = Vec::with_capacity(partition.num_stages());

        let (row_map, col_map) = (partition.rows(), partition.cols());
        for t in 0..partition.num_stages() {
            let rows = row_map.range(t)?;
            let cols = col_map.range(t)?;

            // ── 1. Matrix slice, columns remapped and sorted ──
            let mut indptr = Vec::with_capacity(rows.len() + 1);
            indptr.push(0usize);
            let mut entries: Vec<(usize, f64)> = Vec::new();
            let mut indices = Vec::new();
            let mut data = Vec::new();
            for int in rows.clone() {
                let ext = row_map.to_external[int];
                entries.clear();
                if let Some(row) = csr.outer_view(ext) {
                    entries.extend(row.iter().map(|(j, &v)| (col_map.to_internal[j], v)));
                }
                entries.sort_unstable_by_key(|&(j, _)| j);
                for &(j, v) in &entries {
                    indices.push(j);
                    data.push(v);
                }
                indptr.push(indices.len());
            }
            let matrix = CsMat::try_new((rows.len(), num_cols), indptr, indices, data)
                .map_err(|(_, _, _, e)| e)?;

            // ── 2. Dense bounds / objective in internal order ──
            let by_row = |values: &[f64]| -> Vec<f64> {
                rows.clone()
                    .map(|int| normalize(values, row_map.to_external[int]))
                    .collect()
            };
            let by_col = |values: &[f64]| -> Vec<f64> {
                cols.clone()
                    .map(|int| normalize(values, col_map.to_external[int]))
                    .collect()
            };

            let stage = CoreStage {
                row_lower: by_row(&snapshot.row_lower),
                row_upper: by_row(&snapshot.row_upper),
                col_lower: by_col(&snapshot.col_lower),
                col_upper: by_col(&snapshot.col_upper),
                objective: cols
                    .clone()
                    .map(|int| snapshot.objective[col_map.to_external[int]])
                    .collect(),
                matrix,
            };
            debug!(
                template = %id,
                stage = t,
                rows = stage.row_lower.len(),
                cols = stage.col_lower.len(),
                nnz = stage.matrix.nnz(),
                "core stage built"
            );
            stages.push(stage);
        }

        Ok(Self { id, partition, options, stages })
    }

    pub fn id(&self) -> TemplateId {
        self.id
    }

    pub fn partition(&self) -> &StagePartition {
        &self.partition
    }

    pub fn options(&self) -> &ProgramOptions {
        &self.options
    }

    pub fn combine_rule(&self) -> CombineRule {
        self.options.combine_rule
    }

    pub fn num_stages(&self) -> usize {
        self.partition.num_stages()
    }

    pub fn num_rows(&self) -> usize {
        self.partition.num_rows()
    }

    pub fn num_cols(&self) -> usize {
        self.partition.num_cols()
    }

    /// Core data of stage `t`.
    pub fn stage(&self, t: usize) -> Result<&CoreStage> {
        self.stages.get(t).ok_or(StagewiseError::StageMismatch {
            stage: t,
            num_stages: self.stages.len(),
        })
    }

    // ── Stage offsets ──────────────────────────────────────

    pub fn row_count(&self, t: usize) -> Result<usize> {
        self.partition.row_count(t)
    }

    pub fn col_count(&self, t: usize) -> Result<usize> {
        self.partition.col_count(t)
    }

    pub fn row_start(&self, t: usize) -> Result<usize> {
        self.partition.row_start(t)
    }

    pub fn col_start(&self, t: usize) -> Result<usize> {
        self.partition.col_start(t)
    }

    // ── Dense copies ───────────────────────────────────────

    /// Fill `buffer` with the stage-`t` template values of `section`.
    pub fn copy_section(&self, t: usize, section: Section, buffer: &mut [f64]) -> Result<()> {
        let src = self.stage(t)?.dense(section);
        check_len("copy buffer", src.len(), buffer.len())?;
        buffer.copy_from_slice(src);
        Ok(())
    }

    pub fn copy_row_lower(&self, t: usize, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(t, Section::RowLower, buffer)
    }

    pub fn copy_row_upper(&self, t: usize, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(t, Section::RowUpper, buffer)
    }

    pub fn copy_col_lower(&self, t: usize, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(t, Section::ColLower, buffer)
    }

    pub fn copy_col_upper(&self, t: usize, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(t, Section::ColUpper, buffer)
    }

    pub fn copy_objective(&self, t: usize, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(t, Section::Objective, buffer)
    }

    // ── Matrix ─────────────────────────────────────────────

    /// Stage-`t` matrix slice (CSR, stage rows × all columns).
    pub fn stage_matrix(&self, t: usize) -> Result<&CsMat<f64>> {
        Ok(&self.stage(t)?.matrix)
    }

    /// Stage-local row `i` of stage `t`, internal column ids.
    pub fn matrix_row(&self, t: usize, i: usize) -> Result<CsVecView<'_, f64>> {
        let matrix = &self.stage(t)?.matrix;
        matrix.outer_view(i).ok_or(StagewiseError::IndexOutOfRange {
            axis: Axis::Row,
            index: i,
            count: matrix.rows(),
        })
    }

    pub fn row_length(&self, t: usize, i: usize) -> Result<usize> {
        Ok(self.matrix_row(t, i)?.nnz())
    }

    pub fn num_matrix_elements(&self, t: usize) -> Result<usize> {
        Ok(self.stage(t)?.matrix.nnz())
    }

    /// Row `i` of stage `t` expanded to the full column width.
    pub fn core_dense_row(&self, t: usize, i: usize) -> Result<Array1<f64>> {
        let row = self.matrix_row(t, i)?;
        let mut dense = Array1::zeros(self.num_cols());
        for (j, &v) in row.iter() {
            dense[j] = v;
        }
        Ok(dense)
    }
}
