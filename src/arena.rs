//! Arena owning core templates and node deltas.
//!
//! Nodes refer to their template by [`TemplateId`] and tree positions refer
//! to nodes by [`NodeId`], so the template-outlives-node requirement is
//! checked on every access instead of assumed.  Scenario nodes are shared
//! through an explicit catalog: `intern_scenario_node` hands out the id of
//! an existing node with identical content, and every aliasing path goes
//! through `retain`, which bumps a visible holder count.  Storage is
//! dropped when `release` brings that count to zero, and the freed slot is
//! reused by the next node under a new generation.

use crate::template::CoreTemplate;
use crate::delta::{NodeDelta, NodeOverrides};
use crate::storage::Section;
use crate::types::{
    NodeId, ProblemSnapshot, ProgramOptions, Result, StageAssignment, StagewiseError, TemplateId,
};
use ndarray::Array1;
use rustc_hash::FxHashMap;
use sprs::{CsMat, CsVec};
use std::rc::Rc;
use tracing::debug;

#[derive(Debug)]
struct NodeSlot {
    node: NodeDelta,
    holders: usize,
    /// Catalog key; `None` for core nodes.
    fingerprint: Option<u64>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<NodeSlot>,
}

#[derive(Debug, Default)]
pub struct ScenarioArena {
    templates: Vec<CoreTemplate>,
    /// Per template, the core node of every stage.
    core_nodes: Vec<Vec<NodeId>>,
    slots: Vec<Slot>,
    /// Indices of released slots, reused last-in first-out.
    free: Vec<usize>,
    catalog: FxHashMap<u64, Vec<NodeId>>,
}

impl ScenarioArena {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────
    //  Templates
    // ─────────────────────────────────────────────────────────

    /// Build a core template and its per-stage core nodes.
    pub fn add_template(
        &mut self,
        snapshot: &ProblemSnapshot,
        assignment: &StageAssignment,
        options: ProgramOptions,
    ) -> Result<TemplateId> {
        let id = TemplateId(self.templates.len());
        let template = CoreTemplate::build(id, snapshot, assignment, options)?;

        let mut core_ids = Vec::with_capacity(template.num_stages());
        for t in 0..template.num_stages() {
            let node = NodeDelta::core(&template, t)?;
            core_ids.push(self.insert(node, None));
        }
        debug!(template = %id, stages = template.num_stages(), "template added");

        self.templates.push(template);
        self.core_nodes.push(core_ids);
        Ok(id)
    }

    pub fn template(&self, id: TemplateId) -> Result<&CoreTemplate> {
        self.templates.get(id.0).ok_or(StagewiseError::UnknownTemplate(id))
    }

    pub fn num_templates(&self) -> usize {
        self.templates.len()
    }

    /// Core node of `stage`, owned by the template.
    pub fn core_node(&self, template: TemplateId, stage: usize) -> Result<NodeId> {
        let ids = self
            .core_nodes
            .get(template.0)
            .ok_or(StagewiseError::UnknownTemplate(template))?;
        ids.get(stage).copied().ok_or(StagewiseError::StageMismatch {
            stage,
            num_stages: ids.len(),
        })
    }

    // ─────────────────────────────────────────────────────────
    //  Scenario nodes
    // ─────────────────────────────────────────────────────────

    /// Add a new scenario node with one holder.
    pub fn add_scenario_node(
        &mut self,
        template: TemplateId,
        stage: usize,
        overrides: &NodeOverrides,
    ) -> Result<NodeId> {
        let node = NodeDelta::scenario(self.template(template)?, stage, overrides)?;
        let key = fingerprint(&node);
        let id = self.insert(node, Some(key));
        self.catalog.entry(key).or_default().push(id);
        Ok(id)
    }

    /// Like [`add_scenario_node`](Self::add_scenario_node), but reuse a live
    /// node with identical content if there is one (retaining it).
    pub fn intern_scenario_node(
        &mut self,
        template: TemplateId,
        stage: usize,
        overrides: &NodeOverrides,
    ) -> Result<NodeId> {
        let node = NodeDelta::scenario(self.template(template)?, stage, overrides)?;
        let key = fingerprint(&node);
        if let Some(existing) = self.find_equal(key, &node) {
            self.retain(existing)?;
            debug!(node = %existing, "scenario node interned");
            return Ok(existing);
        }
        let id = self.insert(node, Some(key));
        self.catalog.entry(key).or_default().push(id);
        Ok(id)
    }

    fn find_equal(&self, key: u64, node: &NodeDelta) -> Option<NodeId> {
        let candidates = self.catalog.get(&key)?;
        candidates.iter().copied().find(|&id| {
            self.slot(id).is_ok_and(|slot| {
                let other = &slot.node;
                other.template() == node.template()
                    && other.stage() == node.stage()
                    && match (other.buffer(), node.buffer()) {
                        (Some(a), Some(b)) => a.same_content(b),
                        _ => false,
                    }
            })
        })
    }

    fn insert(&mut self, node: NodeDelta, fingerprint: Option<u64>) -> NodeId {
        let entry = Some(NodeSlot { node, holders: 1, fingerprint });
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.entry = entry;
                NodeId { index, generation: slot.generation }
            }
            None => {
                self.slots.push(Slot { generation: 0, entry });
                NodeId { index: self.slots.len() - 1, generation: 0 }
            }
        }
    }

    fn slot(&self, id: NodeId) -> Result<&NodeSlot> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(StagewiseError::UnknownNode(id))
    }

    fn slot_mut(&mut self, id: NodeId) -> Result<&mut NodeSlot> {
        self.slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(StagewiseError::UnknownNode(id))
    }

    pub fn node(&self, id: NodeId) -> Result<&NodeDelta> {
        Ok(&self.slot(id)?.node)
    }

    /// A node together with the template it is anchored to.
    pub fn resolve(&self, id: NodeId) -> Result<(&NodeDelta, &CoreTemplate)> {
        let node = self.node(id)?;
        Ok((node, self.template(node.template())?))
    }

    // ─────────────────────────────────────────────────────────
    //  Sharing
    // ─────────────────────────────────────────────────────────

    /// Record one more tree position holding `id`; returns the new count.
    ///
    /// Core nodes are owned by their template and always report one holder.
    pub fn retain(&mut self, id: NodeId) -> Result<usize> {
        let slot = self.slot_mut(id)?;
        if slot.node.is_core_node() {
            return Ok(slot.holders);
        }
        slot.holders += 1;
        Ok(slot.holders)
    }

    /// Drop one holder of `id`; returns `true` if the node was freed.
    pub fn release(&mut self, id: NodeId) -> Result<bool> {
        let slot = self.slot_mut(id)?;
        if slot.node.is_core_node() {
            return Err(StagewiseError::CoreNodeRelease { stage: slot.node.stage() });
        }
        slot.holders -= 1;
        if slot.holders > 0 {
            return Ok(false);
        }

        let fingerprint = slot.fingerprint;
        let freed = &mut self.slots[id.index];
        freed.entry = None;
        freed.generation = freed.generation.wrapping_add(1);
        self.free.push(id.index);
        if let Some(key) = fingerprint {
            if let Some(ids) = self.catalog.get_mut(&key) {
                ids.retain(|&other| other != id);
                if ids.is_empty() {
                    self.catalog.remove(&key);
                }
            }
        }
        debug!(node = %id, "scenario node released");
        Ok(true)
    }

    pub fn holders(&self, id: NodeId) -> Result<usize> {
        Ok(self.slot(id)?.holders)
    }

    /// Number of nodes (core and scenario) currently alive.
    pub fn live_nodes(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    /// Number of node slots allocated, live or free.
    pub fn node_slots(&self) -> usize {
        self.slots.len()
    }

    // ─────────────────────────────────────────────────────────
    //  Reconstruction by handle
    // ─────────────────────────────────────────────────────────

    pub fn copy_section(&self, id: NodeId, section: Section, buffer: &mut [f64]) -> Result<()> {
        let (node, core) = self.resolve(id)?;
        node.copy_section(core, section, buffer)
    }

    pub fn copy_row_lower(&self, id: NodeId, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(id, Section::RowLower, buffer)
    }

    pub fn copy_row_upper(&self, id: NodeId, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(id, Section::RowUpper, buffer)
    }

    pub fn copy_col_lower(&self, id: NodeId, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(id, Section::ColLower, buffer)
    }

    pub fn copy_col_upper(&self, id: NodeId, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(id, Section::ColUpper, buffer)
    }

    pub fn copy_objective(&self, id: NodeId, buffer: &mut [f64]) -> Result<()> {
        self.copy_section(id, Section::Objective, buffer)
    }

    pub fn dense_row(&self, id: NodeId, i: usize) -> Result<Rc<Array1<f64>>> {
        let (node, core) = self.resolve(id)?;
        node.dense_row(core, i)
    }

    pub fn effective_row(&self, id: NodeId, i: usize) -> Result<CsVec<f64>> {
        let (node, core) = self.resolve(id)?;
        node.effective_row(core, i)
    }

    pub fn stage_matrix(&self, id: NodeId) -> Result<CsMat<f64>> {
        let (node, core) = self.resolve(id)?;
        node.stage_matrix(core)
    }
}

fn fingerprint(node: &NodeDelta) -> u64 {
    node.buffer().map_or(0, |buffer| buffer.fingerprint())
}
