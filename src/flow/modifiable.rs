// This module implements the editable variant of the flow graph. Elements are keyed by a
// hierarchical Index (a lexicographically ordered sequence of components) instead of a flat
// position, so that new elements can always be placed strictly between two existing ones
// without renumbering the rest of the function. Localized edits (replace, remove, insert
// after) only touch the ordered map and mark the flat view as stale; reindex rebuilds a flat
// Flow with fresh side tables, and any query made through a stale view is rejected with a
// StaleFlow error rather than answered with outdated positions. Indices grow in dimension only
// when repeated insertions exhaust the gap between two neighbours.

//! Editable flow with hierarchical indices.

use crate::core::error::{CompileError, CompileResult};
use crate::flow::graph::{Flow, FlowElement, LabelId, LoopLabels};
use crate::flow::tree::{Function, NodeId};
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// Gap left between neighbouring indices of a fresh flow.
const INITIAL_STRIDE: u32 = 16;

/// Hierarchical position, ordered component by component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index(Vec<u32>);

impl Index {
    pub fn new(components: Vec<u32>) -> Self {
        Index(components)
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    pub fn dimensions(&self) -> usize {
        self.0.len()
    }

    /// An index strictly between `low` and `high`, or after `low` when `high` is absent.
    ///
    /// Missing components of `low` count as zero and missing components of `high`
    /// as unbounded, so a deeper index can always be found.
    pub fn between(low: &Index, high: Option<&Index>) -> Index {
        let mut result = Vec::new();
        let mut bounded = high.is_some();
        let mut dimension = 0;

        loop {
            let lo = low.0.get(dimension).copied().unwrap_or(0);
            let hi = match high {
                Some(high) if bounded => high.0.get(dimension).copied().unwrap_or(u32::MAX),
                _ => u32::MAX,
            };

            if hi > lo && hi - lo > 1 {
                let step = if bounded { (hi - lo) / 2 } else { INITIAL_STRIDE.min(hi - lo - 1) };
                result.push(lo + step);
                return Index(result);
            }

            result.push(lo);
            if hi > lo {
                // Everything below this prefix is already smaller than `high`.
                bounded = false;
            }
            dimension += 1;
        }
    }
}

/// Flow that supports localized edits.
#[derive(Debug, Clone)]
pub struct ModifiableFlow {
    elements: BTreeMap<Index, FlowElement>,
    loops: HashMap<NodeId, LoopLabels>,
    end: LabelId,
    label_count: u32,
    flat: Flow,
    stale: bool,
}

impl ModifiableFlow {
    pub fn new(function: &Function) -> CompileResult<Self> {
        let flow = Flow::new(function)?;
        let elements = flow
            .elements()
            .iter()
            .enumerate()
            .map(|(i, element)| (Index(vec![(i as u32 + 1) * INITIAL_STRIDE]), element.clone()))
            .collect();
        Ok(Self {
            elements,
            loops: flow.loops().clone(),
            end: flow.end(),
            label_count: flow.label_count(),
            flat: flow,
            stale: false,
        })
    }

    /// The flat view, valid only while no edit is pending.
    pub fn flow(&self) -> CompileResult<&Flow> {
        if self.stale {
            return Err(CompileError::StaleFlow);
        }
        Ok(&self.flat)
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn index_of(&self, node: NodeId) -> Option<&Index> {
        self.elements
            .iter()
            .find(|(_, element)| **element == FlowElement::Node(node))
            .map(|(index, _)| index)
    }

    /// Allocates a label that is unique within the flow.
    pub fn next_label(&mut self) -> LabelId {
        let label = LabelId(self.label_count);
        self.label_count += 1;
        label
    }

    fn locate(&self, node: NodeId) -> CompileResult<Index> {
        self.index_of(node)
            .cloned()
            .ok_or(CompileError::UnknownNode { node })
    }

    fn successor_of(&self, index: &Index) -> Option<Index> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.elements
            .range((Excluded(index.clone()), Unbounded))
            .next()
            .map(|(index, _)| index.clone())
    }

    /// Places elements in order strictly between `low` and `high`.
    fn place(&mut self, low: Index, high: Option<Index>, elements: Vec<FlowElement>) {
        let mut previous = low;
        for element in elements {
            let index = Index::between(&previous, high.as_ref());
            self.elements.insert(index.clone(), element);
            previous = index;
        }
        self.stale = true;
    }

    /// Replaces a node with a sequence of elements at the same place.
    pub fn replace(&mut self, node: NodeId, elements: Vec<FlowElement>) -> CompileResult<()> {
        let index = self.locate(node)?;
        let high = self.successor_of(&index);
        self.elements.remove(&index);
        // The removed index stays a valid lower bound for its replacements.
        let low = {
            use std::ops::Bound::{Excluded, Unbounded};
            self.elements
                .range((Unbounded, Excluded(index.clone())))
                .next_back()
                .map(|(index, _)| index.clone())
                .unwrap_or_else(|| Index(vec![0]))
        };
        self.place(low, high, elements);
        Ok(())
    }

    pub fn remove(&mut self, node: NodeId) -> CompileResult<()> {
        let index = self.locate(node)?;
        self.elements.remove(&index);
        self.stale = true;
        Ok(())
    }

    pub fn insert_after(&mut self, node: NodeId, elements: Vec<FlowElement>) -> CompileResult<()> {
        let index = self.locate(node)?;
        let high = self.successor_of(&index);
        self.place(index, high, elements);
        Ok(())
    }

    /// Rebuilds flat positions and side tables after edits.
    pub fn reindex(&mut self) -> CompileResult<()> {
        let elements = self.elements.values().cloned().collect();
        self.flat = Flow::from_elements(elements, self.loops.clone(), self.end, self.label_count)?;
        self.stale = false;
        log::trace!("reindexed modifiable flow with {} elements", self.flat.len());
        Ok(())
    }

    /// Elements in order with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (&Index, &FlowElement)> {
        self.elements.iter()
    }
}
