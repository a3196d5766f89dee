use crate::combine::CombineRule;
use crate::storage::Section;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, CsVecView};
use std::collections::TryReserveError;
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every public function returns `Result<T, StagewiseError>` instead of
/// panicking on caller input.  Variants are grouped into the three
/// failure classes reported by [`StagewiseError::kind`].
#[derive(Debug, thiserror::Error)]
pub enum StagewiseError {
    /// A row or column was assigned to a stage outside `[0, S)`.
    #[error("{axis} {index} assigned to stage {stage}, but the program has {num_stages} stages")]
    StageOutOfRange {
        axis: Axis,
        index: usize,
        stage: usize,
        num_stages: usize,
    },
    /// An input array disagrees with the declared row / column count.
    #[error("{what}: expected length {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    /// An external row / column id does not exist.
    #[error("{axis} index {index} out of range (count {count})")]
    IndexOutOfRange { axis: Axis, index: usize, count: usize },
    /// The constraint matrix shape disagrees with the snapshot counts.
    #[error("matrix shape {actual:?} does not match snapshot shape {expected:?}")]
    MatrixShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    /// A sparse payload could not be assembled.
    #[error("sparse structure error: {0}")]
    Structure(#[from] sprs::errors::StructureError),
    /// A node was requested for a stage its template does not have.
    #[error("stage {stage} does not exist in a template with {num_stages} stages")]
    StageMismatch { stage: usize, num_stages: usize },
    /// A node was used with a template other than the one it is anchored to.
    #[error("node is anchored to {expected}, but was used with {actual}")]
    ForeignTemplate {
        expected: TemplateId,
        actual: TemplateId,
    },
    /// Core nodes hold the template itself and are never merged.
    #[error("core node of stage {stage} cannot be combined")]
    CoreNodeCombine { stage: usize },
    /// Core nodes live as long as their template.
    #[error("core node of stage {stage} is owned by its template and cannot be released")]
    CoreNodeRelease { stage: usize },
    #[error("unknown or released node handle {0}")]
    UnknownNode(NodeId),
    #[error("unknown template handle {0}")]
    UnknownTemplate(TemplateId),
    /// A delta buffer section was opened after a later one.
    #[error("{section:?} section written out of order")]
    SectionOrder { section: Section },
    /// Matrix entries were pushed after the last closed row.
    #[error("{entries} matrix entries pushed after the last closed row")]
    UnterminatedRow { entries: usize },
    /// Storage reservation failed.
    #[error("failed to reserve storage for {requested} entries")]
    Allocation {
        requested: usize,
        #[source]
        source: TryReserveError,
    },
}

/// Failure class of a [`StagewiseError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad stage assignment or inconsistent input shapes.
    Configuration,
    /// A node used against the wrong template / stage, or a contract violation.
    Consistency,
    /// Storage could not be reserved.
    Allocation,
}

impl StagewiseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StageOutOfRange { .. }
            | Self::LengthMismatch { .. }
            | Self::IndexOutOfRange { .. }
            | Self::MatrixShape { .. }
            | Self::Structure(_) => ErrorKind::Configuration,
            Self::StageMismatch { .. }
            | Self::ForeignTemplate { .. }
            | Self::CoreNodeCombine { .. }
            | Self::CoreNodeRelease { .. }
            | Self::UnknownNode(_)
            | Self::UnknownTemplate(_)
            | Self::SectionOrder { .. }
            | Self::UnterminatedRow { .. } => ErrorKind::Consistency,
            Self::Allocation { .. } => ErrorKind::Allocation,
        }
    }
}

pub type Result<T> = std::result::Result<T, StagewiseError>;

/// Fail with `LengthMismatch` unless `actual == expected`.
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(StagewiseError::LengthMismatch { what, expected, actual })
    }
}

/// Fail with `IndexOutOfRange` unless `index < count`.
pub(crate) fn check_index(axis: Axis, index: usize, count: usize) -> Result<()> {
    if index < count {
        Ok(())
    } else {
        Err(StagewiseError::IndexOutOfRange { axis, index, count })
    }
}

/// Fail with `StageMismatch` unless `stage < num_stages`.
pub(crate) fn check_stage(stage: usize, num_stages: usize) -> Result<()> {
    if stage < num_stages {
        Ok(())
    } else {
        Err(StagewiseError::StageMismatch { stage, num_stages })
    }
}

// ─────────────────────────────────────────────────────────────
//  Constants
// ─────────────────────────────────────────────────────────────

/// Magnitude at or above which a bound is treated as infinite.
pub const DEFAULT_INFINITY: f64 = 1e30;

// ─────────────────────────────────────────────────────────────
//  Axis
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Row,
    Column,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Row => write!(f, "row"),
            Self::Column => write!(f, "column"),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Handles
// ─────────────────────────────────────────────────────────────

/// Handle of a [`CoreTemplate`](crate::template::CoreTemplate) inside a
/// [`ScenarioArena`](crate::arena::ScenarioArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateId(pub(crate) usize);

/// Handle of a [`NodeDelta`](crate::delta::NodeDelta) inside a
/// [`ScenarioArena`](crate::arena::ScenarioArena).
///
/// Slots of released nodes are reused; the generation tells a stale handle
/// from the node now living in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

impl TemplateId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl NodeId {
    /// Arena slot of the node.
    pub fn index(self) -> usize {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "template#{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}.{}", self.index, self.generation)
    }
}

// ─────────────────────────────────────────────────────────────
//  Program options
// ─────────────────────────────────────────────────────────────

/// Per-program settings, fixed when the core template is built.
///
/// Every node delta built against a template inherits its combine rule,
/// so two programs with different semantics can live in one arena.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramOptions {
    /// How node overrides merge onto core data.
    pub combine_rule: CombineRule,
    /// Bounds with `|v| >= infinity` are stored as `±f64::INFINITY`.
    pub infinity: f64,
    /// Drop explicit zeros when re-extracting merged sparse rows.
    pub drop_explicit_zeros: bool,
}

impl Default for ProgramOptions {
    fn default() -> Self {
        Self {
            combine_rule: CombineRule::Replace,
            infinity: DEFAULT_INFINITY,
            drop_explicit_zeros: true,
        }
    }
}

impl ProgramOptions {
    pub fn with_combine_rule(mut self, rule: CombineRule) -> Self {
        self.combine_rule = rule;
        self
    }

    /// Map solver-style "large" bounds onto IEEE infinities.
    pub fn normalize(&self, v: f64) -> f64 {
        if v >= self.infinity {
            f64::INFINITY
        } else if v <= -self.infinity {
            f64::NEG_INFINITY
        } else {
            v
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Stage assignment
// ─────────────────────────────────────────────────────────────

/// Caller-supplied stage of every row and column (values in `[0, num_stages)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAssignment {
    pub num_stages: usize,
    pub row_stages: Vec<usize>,
    pub col_stages: Vec<usize>,
}

impl StageAssignment {
    pub fn new(num_stages: usize, row_stages: Vec<usize>, col_stages: Vec<usize>) -> Self {
        Self { num_stages, row_stages, col_stages }
    }
}

// ─────────────────────────────────────────────────────────────
//  Problem snapshot  (input contract)
// ─────────────────────────────────────────────────────────────

/// Deterministic problem data the core template is built from.
///
/// The matrix may be stored CSR or CSC; it is converted to row-major
/// form during template construction.
#[derive(Debug, Clone)]
pub struct ProblemSnapshot {
    pub num_rows: usize,
    pub num_cols: usize,
    pub row_lower: Vec<f64>,
    pub row_upper: Vec<f64>,
    pub col_lower: Vec<f64>,
    pub col_upper: Vec<f64>,
    pub objective: Vec<f64>,
    pub matrix: CsMat<f64>,
    pub integer_cols: Vec<usize>,
}

impl ProblemSnapshot {
    /// Snapshot with free rows, non-negative columns and a zero objective.
    pub fn new(num_rows: usize, num_cols: usize, matrix: CsMat<f64>) -> Self {
        Self {
            num_rows,
            num_cols,
            row_lower: vec![f64::NEG_INFINITY; num_rows],
            row_upper: vec![f64::INFINITY; num_rows],
            col_lower: vec![0.0; num_cols],
            col_upper: vec![f64::INFINITY; num_cols],
            objective: vec![0.0; num_cols],
            matrix,
            integer_cols: Vec::new(),
        }
    }

    pub fn with_row_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.row_lower = lower;
        self.row_upper = upper;
        self
    }

    pub fn with_col_bounds(mut self, lower: Vec<f64>, upper: Vec<f64>) -> Self {
        self.col_lower = lower;
        self.col_upper = upper;
        self
    }

    pub fn with_objective(mut self, objective: Vec<f64>) -> Self {
        self.objective = objective;
        self
    }

    pub fn with_integer_cols(mut self, integer_cols: Vec<usize>) -> Self {
        self.integer_cols = integer_cols;
        self
    }

    /// Check every array against the declared counts.
    pub fn validate(&self) -> Result<()> {
        check_len("row lower bounds", self.num_rows, self.row_lower.len())?;
        check_len("row upper bounds", self.num_rows, self.row_upper.len())?;
        check_len("column lower bounds", self.num_cols, self.col_lower.len())?;
        check_len("column upper bounds", self.num_cols, self.col_upper.len())?;
        check_len("objective", self.num_cols, self.objective.len())?;
        let shape = (self.matrix.rows(), self.matrix.cols());
        if shape != (self.num_rows, self.num_cols) {
            return Err(StagewiseError::MatrixShape {
                expected: (self.num_rows, self.num_cols),
                actual: shape,
            });
        }
        if let Some(&j) = self.integer_cols.iter().find(|&&j| j >= self.num_cols) {
            return Err(StagewiseError::IndexOutOfRange {
                axis: Axis::Column,
                index: j,
                count: self.num_cols,
            });
        }
        Ok(())
    }
}

/// Expand a sparse input vector over `default` into a dense array of `len`.
pub fn scatter_sparse(values: CsVecView<'_, f64>, default: f64, len: usize) -> Result<Vec<f64>> {
    check_len("sparse vector dimension", len, values.dim())?;
    let mut dense = vec![default; len];
    for (i, &v) in values.iter() {
        dense[i] = v;
    }
    Ok(dense)
}
