//! **stagewise**: core/delta storage of scenario-tree node data for
//! multistage stochastic linear and mixed-integer programs.
//!
//! Each decision stage has one shared *core* copy of its bounds, objective
//! and matrix slice; every scenario-tree node stores only what differs from
//! its stage's core and reconstructs solver-ready arrays on demand.
//!
//! 1. **Partition** (`partition`): stage-contiguous internal numbering.
//! 2. **Core template** (`template`): per-stage dense bounds + CSR matrix slice.
//! 3. **Node delta** (`delta`): sparse per-node overrides in one flat buffer
//!    (`storage`), with a lazy dense-row cache.
//! 4. **Combine rule** (`combine`): Replace or Add merge of overrides.
//! 5. **Arena** (`arena`): owns templates and nodes, hands out handles.

pub mod types;
pub mod partition;
pub mod combine;
pub mod storage;
pub mod template;
pub mod delta;
pub mod arena;

pub use crate::arena::ScenarioArena;
pub use crate::combine::CombineRule;
pub use crate::template::{CoreStage, CoreTemplate};
pub use crate::delta::{NodeDelta, NodeOverrides};
pub use crate::partition::{AxisPartition, StagePartition};
pub use crate::storage::{DeltaBuffer, DeltaBufferBuilder, Section, SectionWriter};
pub use crate::types::{
    scatter_sparse, Axis, ErrorKind, NodeId, ProblemSnapshot, ProgramOptions, Result,
    StageAssignment, StagewiseError, TemplateId, DEFAULT_INFINITY,
};
