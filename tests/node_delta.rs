//! Node delta tests: override storage, reconstruction under both combine
//! rules, the dense-row cache, and contract violations.

use sprs::{CsMat, CsVec, TriMat};
use std::rc::Rc;
use stagewise::*;

// ─────────────────────────────────────────────────────────────
//  Helpers (same interleaved 5 × 4 problem as the template tests)
// ─────────────────────────────────────────────────────────────

fn interleaved_matrix() -> CsMat<f64> {
    let mut tri = TriMat::new((5, 4));
    for &(r, c, v) in &[
        (0, 0, 1.0),
        (0, 2, 2.0),
        (1, 1, 3.0),
        (1, 3, 4.0),
        (2, 2, 5.0),
        (3, 0, 6.0),
        (3, 3, 7.0),
        (4, 1, 8.0),
    ] {
        tri.add_triplet(r, c, v);
    }
    tri.to_csr()
}

fn arena_with(rule: CombineRule) -> (ScenarioArena, TemplateId) {
    let snapshot = ProblemSnapshot::new(5, 4, interleaved_matrix())
        .with_row_bounds(
            vec![10.0, 11.0, 12.0, 13.0, 14.0],
            vec![20.0, 21.0, 22.0, 23.0, 24.0],
        )
        .with_col_bounds(vec![0.0, 1.0, 2.0, 3.0], vec![f64::INFINITY; 4])
        .with_objective(vec![1.0, 2.0, 3.0, 4.0]);
    let assignment = StageAssignment::new(2, vec![1, 0, 1, 0, 0], vec![0, 1, 1, 0]);
    let mut arena = ScenarioArena::new();
    let id = arena
        .add_template(&snapshot, &assignment, ProgramOptions::default().with_combine_rule(rule))
        .unwrap();
    (arena, id)
}

/// Stage-1 overrides plus entries of stage 0 that must be dropped.
///
/// Stage 1 holds external rows 0, 2 (local 0, 1) and columns 1, 2
/// (internal 2, 3; local 0, 1).
fn stage_one_overrides() -> NodeOverrides {
    NodeOverrides::new()
        .row_lower(2, 50.0)
        .row_lower(1, 99.0) // stage 0
        .objective(1, 20.0)
        .col_upper(2, 7.0)
        .matrix_entry(0, 1, 9.0)
        .matrix_entry(2, 2, -5.0)
        .matrix_entry(3, 0, 1.0) // stage 0
}

fn copy(arena: &ScenarioArena, node: NodeId, section: Section, len: usize) -> Vec<f64> {
    let mut buf = vec![f64::NAN; len];
    arena.copy_section(node, section, &mut buf).unwrap();
    buf
}

// ─────────────────────────────────────────────────────────────
//  Storage
// ─────────────────────────────────────────────────────────────

#[test]
fn storage_keeps_only_stage_entries_and_fits_exactly() {
    let (mut arena, tid) = arena_with(CombineRule::Replace);
    let id = arena.add_scenario_node(tid, 1, &stage_one_overrides()).unwrap();
    let (node, core) = arena.resolve(id).unwrap();

    assert!(!node.is_core_node());
    assert_eq!(node.stage(), 1);
    assert_eq!(node.template(), tid);
    assert_eq!(node.storage_len(), 5);
    assert_eq!(node.storage_capacity(), node.storage_len());
    assert_eq!(node.num_matrix_elements(core).unwrap(), 2);
    assert_eq!(node.row_length(core, 0).unwrap(), 1);

    let row1 = node.row_entries(core, 1).unwrap();
    assert_eq!(row1.indices(), &[3]);
    assert_eq!(row1.data(), &[-5.0]);

    let lower = node.section(Section::RowLower).unwrap();
    assert_eq!(lower.dim(), 2);
    assert_eq!(lower.indices(), &[1]);
    assert_eq!(lower.data(), &[50.0]);
    assert_eq!(node.section(Section::RowUpper).unwrap().nnz(), 0);
}

#[test]
fn duplicate_entries_keep_last_value() {
    let (mut arena, tid) = arena_with(CombineRule::Replace);
    let overrides = NodeOverrides::new()
        .row_upper(0, 1.0)
        .row_upper(0, 2.0)
        .matrix_entry(0, 2, 3.0)
        .matrix_entry(0, 2, 4.0);
    let id = arena.add_scenario_node(tid, 1, &overrides).unwrap();
    let (node, core) = arena.resolve(id).unwrap();

    assert_eq!(node.storage_len(), 2);
    assert_eq!(node.row_entries(core, 0).unwrap().data(), &[4.0]);
    assert_eq!(copy(&arena, id, Section::RowUpper, 2), vec![2.0, 22.0]);
}

#[test]
fn empty_overrides_store_nothing() {
    let (mut arena, tid) = arena_with(CombineRule::Add);
    let id = arena.add_scenario_node(tid, 0, &NodeOverrides::new()).unwrap();
    let node = arena.node(id).unwrap();
    assert_eq!(node.storage_len(), 0);
    assert_eq!(copy(&arena, id, Section::RowLower, 3), vec![11.0, 13.0, 14.0]);
}

// ─────────────────────────────────────────────────────────────
//  Reconstruction
// ─────────────────────────────────────────────────────────────

#[test]
fn replace_reconstruction() {
    let (mut arena, tid) = arena_with(CombineRule::Replace);
    let id = arena.add_scenario_node(tid, 1, &stage_one_overrides()).unwrap();

    assert_eq!(copy(&arena, id, Section::RowLower, 2), vec![10.0, 50.0]);
    assert_eq!(copy(&arena, id, Section::RowUpper, 2), vec![20.0, 22.0]);
    assert_eq!(copy(&arena, id, Section::Objective, 2), vec![20.0, 3.0]);
    assert_eq!(copy(&arena, id, Section::ColLower, 2), vec![1.0, 2.0]);
    assert_eq!(copy(&arena, id, Section::ColUpper, 2), vec![f64::INFINITY, 7.0]);
}

#[test]
fn add_reconstruction() {
    let (mut arena, tid) = arena_with(CombineRule::Add);
    let id = arena.add_scenario_node(tid, 1, &stage_one_overrides()).unwrap();

    let mut buf = vec![0.0; 2];
    arena.copy_row_lower(id, &mut buf).unwrap();
    assert_eq!(buf, vec![10.0, 62.0]);
    arena.copy_objective(id, &mut buf).unwrap();
    assert_eq!(buf, vec![22.0, 3.0]);
    arena.copy_col_upper(id, &mut buf).unwrap();
    assert_eq!(buf[0], f64::INFINITY);
    assert_eq!(buf[1], f64::INFINITY);
}

#[test]
fn core_node_returns_template_under_either_rule() {
    for rule in [CombineRule::Replace, CombineRule::Add] {
        let (arena, tid) = arena_with(rule);
        let core_id = arena.core_node(tid, 0).unwrap();
        assert!(arena.node(core_id).unwrap().is_core_node());

        let mut expected = vec![0.0; 3];
        arena.template(tid).unwrap().copy_row_upper(0, &mut expected).unwrap();
        assert_eq!(copy(&arena, core_id, Section::RowUpper, 3), expected);

        let mut cols = vec![0.0; 2];
        arena.copy_col_lower(core_id, &mut cols).unwrap();
        assert_eq!(cols, vec![0.0, 3.0]);
        arena.copy_row_lower(core_id, &mut expected).unwrap();
        assert_eq!(expected, vec![11.0, 13.0, 14.0]);
        arena.copy_col_upper(core_id, &mut cols).unwrap();
        assert!(cols.iter().all(|v| *v == f64::INFINITY));
        arena.copy_objective(core_id, &mut cols).unwrap();
        assert_eq!(cols, vec![1.0, 4.0]);
    }
}

#[test]
fn effective_rows_and_stage_matrix() {
    let (mut arena, tid) = arena_with(CombineRule::Replace);
    let id = arena.add_scenario_node(tid, 1, &stage_one_overrides()).unwrap();

    let r0 = arena.effective_row(id, 0).unwrap();
    assert_eq!(r0.indices(), &[0, 2, 3]);
    assert_eq!(r0.data(), &[1.0, 9.0, 2.0]);
    let r1 = arena.effective_row(id, 1).unwrap();
    assert_eq!(r1.indices(), &[3]);
    assert_eq!(r1.data(), &[-5.0]);

    let m = arena.stage_matrix(id).unwrap();
    assert_eq!((m.rows(), m.cols()), (2, 4));
    assert_eq!(m.nnz(), 4);
    assert_eq!(m.get(0, 2), Some(&9.0));

    let core_id = arena.core_node(tid, 1).unwrap();
    let core_m = arena.stage_matrix(core_id).unwrap();
    assert_eq!(&core_m, arena.template(tid).unwrap().stage_matrix(1).unwrap());
}

#[test]
fn add_rule_cancels_matrix_entries() {
    let (mut arena, tid) = arena_with(CombineRule::Add);
    let id = arena.add_scenario_node(tid, 1, &stage_one_overrides()).unwrap();

    // core 5.0 + override -5.0
    assert_eq!(arena.effective_row(id, 1).unwrap().nnz(), 0);
    assert_eq!(arena.stage_matrix(id).unwrap().nnz(), 3);
}

// ─────────────────────────────────────────────────────────────
//  Dense-row cache
// ─────────────────────────────────────────────────────────────

#[test]
fn dense_row_is_cached() {
    let (mut arena, tid) = arena_with(CombineRule::Replace);
    let id = arena.add_scenario_node(tid, 1, &stage_one_overrides()).unwrap();
    let (node, core) = arena.resolve(id).unwrap();

    assert_eq!(node.cached_dense_rows(), 0);
    let first = node.dense_row(core, 0).unwrap();
    assert_eq!(first.to_vec(), vec![0.0, 0.0, 9.0, 0.0]);
    let again = node.dense_row(core, 0).unwrap();
    assert!(Rc::ptr_eq(&first, &again));
    assert_eq!(node.cached_dense_rows(), 1);

    assert!(node.dense_row(core, 2).is_err());
    assert_eq!(node.cached_dense_rows(), 1);
}

#[test]
fn core_node_dense_row_is_template_row() {
    let (arena, tid) = arena_with(CombineRule::Replace);
    let id = arena.core_node(tid, 0).unwrap();
    let dense = arena.dense_row(id, 0).unwrap();
    assert_eq!(dense.to_vec(), vec![0.0, 4.0, 3.0, 0.0]);
}

// ─────────────────────────────────────────────────────────────
//  Row combination
// ─────────────────────────────────────────────────────────────

#[test]
fn combine_with_sparse_and_dense_core_rows() {
    let (mut arena, tid) = arena_with(CombineRule::Add);
    let id = arena.add_scenario_node(tid, 1, &stage_one_overrides()).unwrap();
    let node = arena.node(id).unwrap();

    let core_row = CsVec::new(4, vec![2, 3], vec![1.0, 1.0]);
    let merged = node.combine_with_core_row(0, core_row.view()).unwrap();
    assert_eq!(merged.indices(), &[2, 3]);
    assert_eq!(merged.data(), &[10.0, 1.0]);

    let mut dense = vec![1.0; 4];
    node.combine_with_dense_core_row(1, &mut dense).unwrap();
    assert_eq!(dense, vec![1.0, 1.0, 1.0, -4.0]);

    let mut short = vec![0.0; 3];
    assert!(matches!(
        node.combine_with_dense_core_row(1, &mut short),
        Err(StagewiseError::LengthMismatch { .. })
    ));
}

#[test]
fn combining_a_core_node_is_rejected() {
    let (arena, tid) = arena_with(CombineRule::Replace);
    let node = arena.node(arena.core_node(tid, 1).unwrap()).unwrap();

    let row = CsVec::new(4, vec![0], vec![1.0]);
    let err = node.combine_with_core_row(0, row.view()).unwrap_err();
    assert!(matches!(err, StagewiseError::CoreNodeCombine { stage: 1 }));
    assert_eq!(err.kind(), ErrorKind::Consistency);

    let mut dense = vec![0.0; 4];
    assert!(node.combine_with_dense_core_row(0, &mut dense).is_err());
    assert_eq!(dense, vec![0.0; 4]);
}

// ─────────────────────────────────────────────────────────────
//  Consistency and input errors
// ─────────────────────────────────────────────────────────────

#[test]
fn stage_must_exist_in_template() {
    let (mut arena, tid) = arena_with(CombineRule::Replace);
    let err = arena.add_scenario_node(tid, 2, &NodeOverrides::new()).unwrap_err();
    assert!(matches!(err, StagewiseError::StageMismatch { stage: 2, num_stages: 2 }));
    assert!(arena.core_node(tid, 5).is_err());
}

#[test]
fn node_rejects_foreign_template() {
    let (mut arena, first) = arena_with(CombineRule::Replace);
    let snapshot = ProblemSnapshot::new(5, 4, interleaved_matrix());
    let assignment = StageAssignment::new(2, vec![1, 0, 1, 0, 0], vec![0, 1, 1, 0]);
    let second = arena
        .add_template(&snapshot, &assignment, ProgramOptions::default())
        .unwrap();

    let id = arena.add_scenario_node(first, 1, &stage_one_overrides()).unwrap();
    let node = arena.node(id).unwrap();
    let other = arena.template(second).unwrap();

    let mut buf = vec![0.0; 2];
    let err = node.copy_row_lower(other, &mut buf).unwrap_err();
    assert!(matches!(
        err,
        StagewiseError::ForeignTemplate { expected, actual } if expected == first && actual == second
    ));
    assert!(node.dense_row(other, 0).is_err());
}

#[test]
fn out_of_range_external_ids() {
    let (mut arena, tid) = arena_with(CombineRule::Replace);
    let err = arena
        .add_scenario_node(tid, 1, &NodeOverrides::new().row_lower(5, 1.0))
        .unwrap_err();
    assert!(matches!(err, StagewiseError::IndexOutOfRange { axis: Axis::Row, index: 5, count: 5 }));

    let err = arena
        .add_scenario_node(tid, 1, &NodeOverrides::new().matrix_entry(0, 4, 1.0))
        .unwrap_err();
    assert!(matches!(err, StagewiseError::IndexOutOfRange { axis: Axis::Column, index: 4, .. }));
}

#[test]
fn cached_dense_row_still_checks_anchor() {
    let (mut arena, first) = arena_with(CombineRule::Replace);
    let snapshot = ProblemSnapshot::new(5, 4, interleaved_matrix());
    let assignment = StageAssignment::new(2, vec![1, 0, 1, 0, 0], vec![0, 1, 1, 0]);
    let second = arena
        .add_template(&snapshot, &assignment, ProgramOptions::default())
        .unwrap();

    let id = arena.add_scenario_node(first, 1, &stage_one_overrides()).unwrap();
    let node = arena.node(id).unwrap();
    node.dense_row(arena.template(first).unwrap(), 0).unwrap();
    assert_eq!(node.cached_dense_rows(), 1);

    let err = node.dense_row(arena.template(second).unwrap(), 0).unwrap_err();
    assert!(matches!(err, StagewiseError::ForeignTemplate { .. }));
}

// ─────────────────────────────────────────────────────────────
//  Infinite bounds
// ─────────────────────────────────────────────────────────────

/// 4×4 identity, rows/cols 0–1 in stage 0 and 2–3 in stage 1, solver-style
/// `1e30` row upper bounds.
fn large_bound_arena() -> (ScenarioArena, TemplateId) {
    let mut tri = TriMat::new((4, 4));
    for i in 0..4 {
        tri.add_triplet(i, i, 1.0);
    }
    let snapshot = ProblemSnapshot::new(4, 4, tri.to_csr())
        .with_row_bounds(vec![0.0; 4], vec![1e30; 4]);
    let assignment = StageAssignment::new(2, vec![0, 0, 1, 1], vec![0, 0, 1, 1]);
    let mut arena = ScenarioArena::new();
    let tid = arena
        .add_template(&snapshot, &assignment, ProgramOptions::default())
        .unwrap();
    (arena, tid)
}

#[test]
fn bound_overrides_are_normalized_like_the_template() {
    let (mut arena, tid) = large_bound_arena();
    let overrides = NodeOverrides::new()
        .row_upper(3, 1e30)
        .row_lower(2, -1e30)
        .col_upper(3, 2e30)
        .objective(3, 1e30);
    let id = arena.add_scenario_node(tid, 1, &overrides).unwrap();

    let mut from_core = vec![0.0; 2];
    arena.template(tid).unwrap().copy_row_upper(1, &mut from_core).unwrap();
    assert_eq!(from_core, vec![f64::INFINITY; 2]);
    assert_eq!(copy(&arena, id, Section::RowUpper, 2), from_core);

    assert_eq!(copy(&arena, id, Section::RowLower, 2), vec![f64::NEG_INFINITY, 0.0]);
    assert_eq!(copy(&arena, id, Section::ColUpper, 2), vec![f64::INFINITY; 2]);
    // objective coefficients are not bounds
    assert_eq!(copy(&arena, id, Section::Objective, 2), vec![0.0, 1e30]);
}

#[test]
fn large_and_infinite_bound_overrides_intern_together() {
    let (mut arena, tid) = large_bound_arena();
    let a = arena
        .intern_scenario_node(tid, 1, &NodeOverrides::new().row_upper(3, 1e30))
        .unwrap();
    let b = arena
        .intern_scenario_node(tid, 1, &NodeOverrides::new().row_upper(3, f64::INFINITY))
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(arena.holders(a).unwrap(), 2);
}
