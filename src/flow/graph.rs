// This module implements the flow graph: the structured function tree flattened into one
// ordered sequence of elements. Every evaluated node gets a position after its children, and
// control constructs are expanded into synthetic labels and conditional or unconditional
// jumps. If/else-if/else chains branch on false to an intermediate label and leave through a
// shared end label. Loops record their start and end labels (plus a continue label placed
// before the action when a continue statement needs one), so break and continue become plain
// jumps. Short-circuit logic is expanded recursively with explicit success and failure labels
// and never materializes a boolean. A return jumps to the single end label of the function.
//
// Besides the element list, the flow keeps index side tables: node to position, label to
// position, label to incoming jump positions and loop node to its labels. Every branch chain
// and loop is also recorded as a region with its span and its own labels; the code generator
// uses regions to place scope transitions. All flow queries (reachability, repetition,
// execution order, executable positions) run on these tables without touching the tree.

//! Flow graph construction and queries.

use crate::core::error::{CompileError, CompileResult};
use crate::flow::tree::{Function, LogicalOperator, LoopControl, NodeId, NodeKind, Tree};
use hashbrown::{HashMap, HashSet};
use std::collections::VecDeque;

/// Synthetic jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

/// Condition of a conditional jump: jump when `node` evaluates to `when`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpCondition {
    pub node: NodeId,
    pub when: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump {
    pub label: LabelId,
    pub condition: Option<JumpCondition>,
    /// Jump to the function end created by a return.
    pub exit: bool,
}

impl Jump {
    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowElement {
    Node(NodeId),
    Label(LabelId),
    Jump(Jump),
}

/// Labels of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLabels {
    pub start: LabelId,
    pub end: LabelId,
    /// Label before the action, present when a continue targets it.
    pub next: Option<LabelId>,
}

impl LoopLabels {
    pub fn continue_target(&self) -> LabelId {
        self.next.unwrap_or(self.start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Branch,
    Loop,
}

/// Span of a branch chain or loop.
#[derive(Debug, Clone)]
pub struct Region {
    pub kind: RegionKind,
    pub node: NodeId,
    /// Position of the first element inside the region.
    pub start: usize,
    /// Position of the end label.
    pub end: usize,
    /// Labels owned by the region, all of them merge points.
    pub labels: Vec<LabelId>,
    pub parent: Option<RegionId>,
}

impl Region {
    pub fn contains(&self, position: usize) -> bool {
        self.start <= position && position <= self.end
    }
}

/// Linearized function.
#[derive(Debug, Clone)]
pub struct Flow {
    elements: Vec<FlowElement>,
    indices: HashMap<NodeId, usize>,
    labels: HashMap<LabelId, usize>,
    /// Positions of all jumps in ascending order.
    jumps: Vec<usize>,
    /// Incoming jump positions per label.
    paths: HashMap<LabelId, Vec<usize>>,
    loops: HashMap<NodeId, LoopLabels>,
    regions: Vec<Region>,
    label_regions: HashMap<LabelId, RegionId>,
    end: LabelId,
    label_count: u32,
}

struct Linearizer<'t> {
    tree: &'t Tree,
    elements: Vec<FlowElement>,
    loops: HashMap<NodeId, LoopLabels>,
    regions: Vec<Region>,
    open: Vec<RegionId>,
    label_regions: HashMap<LabelId, RegionId>,
    label_count: u32,
    end: LabelId,
}

impl<'t> Linearizer<'t> {
    fn new(tree: &'t Tree) -> Self {
        let mut linearizer = Self {
            tree,
            elements: Vec::new(),
            loops: HashMap::new(),
            regions: Vec::new(),
            open: Vec::new(),
            label_regions: HashMap::new(),
            label_count: 0,
            end: LabelId(0),
        };
        linearizer.end = linearizer.create_label();
        linearizer
    }

    fn create_label(&mut self) -> LabelId {
        let label = LabelId(self.label_count);
        self.label_count += 1;
        if let Some(&region) = self.open.last() {
            self.regions[region.0 as usize].labels.push(label);
            self.label_regions.insert(label, region);
        }
        label
    }

    fn label(&mut self, label: LabelId) {
        self.elements.push(FlowElement::Label(label));
    }

    fn jump(&mut self, label: LabelId, condition: Option<JumpCondition>) {
        self.elements.push(FlowElement::Jump(Jump {
            label,
            condition,
            exit: false,
        }));
    }

    fn node(&mut self, node: NodeId) {
        self.elements.push(FlowElement::Node(node));
    }

    fn open_region(&mut self, kind: RegionKind, node: NodeId) -> RegionId {
        let id = RegionId(self.regions.len() as u32);
        self.regions.push(Region {
            kind,
            node,
            start: self.elements.len(),
            end: self.elements.len(),
            labels: Vec::new(),
            parent: self.open.last().copied(),
        });
        self.open.push(id);
        id
    }

    /// Closes the region; its end label must be the last element.
    fn close_region(&mut self, region: RegionId) {
        self.regions[region.0 as usize].end = self.elements.len().saturating_sub(1);
        self.open.pop();
    }

    fn is_logical(&self, node: NodeId) -> bool {
        matches!(self.tree.kind(node), NodeKind::Logical { .. })
    }

    fn linearize(&mut self, node: NodeId) -> CompileResult<()> {
        match self.tree.kind(node).clone() {
            NodeKind::Block(children) => {
                for child in children {
                    self.linearize(child)?;
                }
                self.node(node);
            }
            NodeKind::If {
                condition,
                body,
                successors,
            } => self.linearize_if(node, condition, body, &successors)?,
            NodeKind::ElseIf { .. } | NodeKind::Else { .. } => {
                return Err(CompileError::UnsupportedNode {
                    node,
                    reason: "branch successor outside of an if chain",
                })
            }
            NodeKind::Loop {
                initialization,
                condition,
                action,
                body,
            } => self.linearize_loop(node, initialization, condition, action, body)?,
            NodeKind::LoopControl(control) => {
                let owner = self
                    .tree
                    .find_parent(node, |kind| matches!(kind, NodeKind::Loop { .. }))
                    .ok_or(CompileError::OrphanLoopControl { node })?;
                let labels = *self
                    .loops
                    .get(&owner)
                    .ok_or(CompileError::OrphanLoopControl { node })?;
                let target = match control {
                    LoopControl::Break => labels.end,
                    LoopControl::Continue => labels.continue_target(),
                };
                self.node(node);
                self.jump(target, None);
            }
            NodeKind::Return(value) => {
                if let Some(value) = value {
                    self.linearize(value)?;
                }
                self.node(node);
                self.elements.push(FlowElement::Jump(Jump {
                    label: self.end,
                    condition: None,
                    exit: true,
                }));
            }
            NodeKind::Logical { .. } => return Err(CompileError::WildLogicalOperator { node }),
            NodeKind::Assign { target, value } => {
                self.linearize(value)?;
                // The target is not evaluated, only its address operands are.
                if let NodeKind::Access { base, index, .. } = self.tree.kind(target).clone() {
                    self.linearize(base)?;
                    if let Some((index, _)) = index {
                        self.linearize(index)?;
                    }
                }
                self.node(node);
            }
            kind => {
                for child in kind.children() {
                    self.linearize(child)?;
                }
                self.node(node);
            }
        }
        Ok(())
    }

    fn linearize_if(
        &mut self,
        node: NodeId,
        condition: NodeId,
        body: NodeId,
        successors: &[NodeId],
    ) -> CompileResult<()> {
        let region = self.open_region(RegionKind::Branch, node);
        let end = self.create_label();

        let intermediate = self.create_label();
        self.linearize_condition(condition, intermediate)?;
        self.linearize(body)?;
        self.jump(end, None);
        self.label(intermediate);

        for &successor in successors {
            match self.tree.kind(successor).clone() {
                NodeKind::ElseIf { condition, body } => {
                    let intermediate = self.create_label();
                    self.linearize_condition(condition, intermediate)?;
                    self.linearize(body)?;
                    self.jump(end, None);
                    self.label(intermediate);
                }
                NodeKind::Else { body } => self.linearize(body)?,
                _ => {
                    return Err(CompileError::UnsupportedNode {
                        node: successor,
                        reason: "if successor must be an else-if or else",
                    })
                }
            }
        }

        self.label(end);
        self.close_region(region);
        Ok(())
    }

    fn linearize_loop(
        &mut self,
        node: NodeId,
        initialization: Option<NodeId>,
        condition: Option<NodeId>,
        action: Option<NodeId>,
        body: NodeId,
    ) -> CompileResult<()> {
        if let Some(initialization) = initialization {
            self.linearize(initialization)?;
        }

        let region = self.open_region(RegionKind::Loop, node);
        let start = self.create_label();
        let end = self.create_label();
        let next = if action.is_some() && self.has_continue(body, node) {
            Some(self.create_label())
        } else {
            None
        };
        self.loops.insert(node, LoopLabels { start, end, next });

        self.label(start);
        if let Some(condition) = condition {
            self.linearize_condition(condition, end)?;
        }
        self.linearize(body)?;
        if let Some(next) = next {
            self.label(next);
        }
        if let Some(action) = action {
            self.linearize(action)?;
        }
        self.jump(start, None);
        self.label(end);
        self.close_region(region);
        Ok(())
    }

    /// Whether a continue inside `node` targets `owner`.
    fn has_continue(&self, node: NodeId, owner: NodeId) -> bool {
        let kind = self.tree.kind(node);
        if let NodeKind::LoopControl(LoopControl::Continue) = kind {
            return self
                .tree
                .find_parent(node, |kind| matches!(kind, NodeKind::Loop { .. }))
                == Some(owner);
        }
        kind.children()
            .into_iter()
            .any(|child| self.has_continue(child, owner))
    }

    /// Evaluates a condition, jumping to `failure` when it does not hold.
    fn linearize_condition(&mut self, condition: NodeId, failure: LabelId) -> CompileResult<()> {
        if self.is_logical(condition) {
            let success = self.create_label();
            self.linearize_logical(condition, success, failure)?;
            self.label(success);
        } else {
            self.linearize(condition)?;
            self.jump(
                failure,
                Some(JumpCondition {
                    node: condition,
                    when: false,
                }),
            );
        }
        Ok(())
    }

    /// Expands short-circuit logic; falling through means success.
    fn linearize_logical(
        &mut self,
        node: NodeId,
        success: LabelId,
        failure: LabelId,
    ) -> CompileResult<()> {
        let NodeKind::Logical {
            operator,
            left,
            right,
        } = self.tree.kind(node).clone()
        else {
            return Err(CompileError::WildLogicalOperator { node });
        };

        match operator {
            LogicalOperator::And => {
                if self.is_logical(left) {
                    let intermediate = self.create_label();
                    self.linearize_logical(left, intermediate, failure)?;
                    self.label(intermediate);
                } else {
                    self.linearize(left)?;
                    self.jump(failure, Some(JumpCondition { node: left, when: false }));
                }
            }
            LogicalOperator::Or => {
                if self.is_logical(left) {
                    let intermediate = self.create_label();
                    self.linearize_logical(left, success, intermediate)?;
                    self.jump(success, None);
                    self.label(intermediate);
                } else {
                    self.linearize(left)?;
                    self.jump(success, Some(JumpCondition { node: left, when: true }));
                }
            }
        }

        if self.is_logical(right) {
            self.linearize_logical(right, success, failure)
        } else {
            self.linearize(right)?;
            self.jump(failure, Some(JumpCondition { node: right, when: false }));
            Ok(())
        }
    }
}

impl Flow {
    /// Linearizes the body of a function.
    pub fn new(function: &Function) -> CompileResult<Self> {
        let mut linearizer = Linearizer::new(&function.tree);
        linearizer.linearize(function.body)?;
        let end = linearizer.end;
        linearizer.label(end);

        let mut flow = Flow::from_elements(linearizer.elements, linearizer.loops, end, linearizer.label_count)?;
        flow.regions = linearizer.regions;
        flow.label_regions = linearizer.label_regions;
        log::debug!(
            "linearized {} into {} elements, {} regions",
            function.name,
            flow.len(),
            flow.regions.len()
        );
        Ok(flow)
    }

    /// Builds the index side tables over an element list.
    pub fn from_elements(
        elements: Vec<FlowElement>,
        loops: HashMap<NodeId, LoopLabels>,
        end: LabelId,
        label_count: u32,
    ) -> CompileResult<Self> {
        let mut indices = HashMap::new();
        let mut labels = HashMap::new();
        let mut jumps = Vec::new();
        let mut paths: HashMap<LabelId, Vec<usize>> = HashMap::new();

        for (position, element) in elements.iter().enumerate() {
            match element {
                FlowElement::Node(node) => {
                    indices.insert(*node, position);
                }
                FlowElement::Label(label) => {
                    labels.insert(*label, position);
                }
                FlowElement::Jump(jump) => {
                    jumps.push(position);
                    paths.entry(jump.label).or_default().push(position);
                }
            }
        }

        for &position in &jumps {
            if let FlowElement::Jump(jump) = &elements[position] {
                if !labels.contains_key(&jump.label) {
                    return Err(CompileError::UnregisteredLabel { label: jump.label.0 });
                }
            }
        }

        Ok(Self {
            elements,
            indices,
            labels,
            jumps,
            paths,
            loops,
            regions: Vec::new(),
            label_regions: HashMap::new(),
            end,
            label_count,
        })
    }

    pub fn elements(&self) -> &[FlowElement] {
        &self.elements
    }

    pub fn element(&self, position: usize) -> Option<&FlowElement> {
        self.elements.get(position)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Label every return jumps to.
    pub fn end(&self) -> LabelId {
        self.end
    }

    pub fn label_count(&self) -> u32 {
        self.label_count
    }

    pub fn position(&self, node: NodeId) -> CompileResult<usize> {
        self.indices
            .get(&node)
            .copied()
            .ok_or(CompileError::UnknownNode { node })
    }

    pub fn label_position(&self, label: LabelId) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Positions of the jumps targeting `label`.
    pub fn incoming(&self, label: LabelId) -> &[usize] {
        self.paths.get(&label).map_or(&[], Vec::as_slice)
    }

    pub fn loop_labels(&self, node: NodeId) -> Option<LoopLabels> {
        self.loops.get(&node).copied()
    }

    pub fn loops(&self) -> &HashMap<NodeId, LoopLabels> {
        &self.loops
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn region(&self, id: RegionId) -> &Region {
        &self.regions[id.0 as usize]
    }

    /// Region whose merge point the label is.
    pub fn region_of_label(&self, label: LabelId) -> Option<RegionId> {
        self.label_regions.get(&label).copied()
    }

    /// Regions beginning at `position`, outermost first.
    pub fn regions_starting_at(&self, position: usize) -> Vec<RegionId> {
        (0..self.regions.len() as u32)
            .map(RegionId)
            .filter(|&id| self.region(id).start == position)
            .collect()
    }

    /// Closest loop region enclosing the region.
    pub fn enclosing_loop(&self, region: RegionId) -> Option<RegionId> {
        let mut current = self.region(region).parent;
        while let Some(id) = current {
            if self.region(id).kind == RegionKind::Loop {
                return Some(id);
            }
            current = self.region(id).parent;
        }
        None
    }

    /// Successor positions of the element at `position`.
    fn successors(&self, position: usize) -> impl Iterator<Item = usize> {
        let (fall, target) = match &self.elements[position] {
            FlowElement::Jump(jump) => {
                let target = self.labels.get(&jump.label).copied();
                let fall = jump.is_conditional().then_some(position + 1);
                (fall, target)
            }
            _ => (Some(position + 1), None),
        };
        let len = self.elements.len();
        fall.filter(move |&p| p < len).into_iter().chain(target)
    }

    /// Breadth-first search from the successors of `from` towards `target`.
    fn search(&self, from: usize, target: usize, obstacles: &HashSet<usize>) -> bool {
        let mut visited = vec![false; self.elements.len()];
        let mut queue: VecDeque<usize> = self.successors(from).collect();

        while let Some(position) = queue.pop_front() {
            if position == target {
                return true;
            }
            if visited[position] || obstacles.contains(&position) {
                continue;
            }
            visited[position] = true;
            queue.extend(self.successors(position));
        }
        false
    }

    /// Whether execution at `from` can arrive at `node`.
    pub fn is_reachable(&self, node: NodeId, from: NodeId) -> CompileResult<bool> {
        let (target, start) = (self.position(node)?, self.position(from)?);
        Ok(target == start || self.search(start, target, &HashSet::new()))
    }

    /// Position based variant of [`Flow::is_reachable`].
    pub fn is_position_reachable(&self, target: usize, from: usize) -> bool {
        target == from || self.search(from, target, &HashSet::new())
    }

    /// Whether the node can execute more than once.
    pub fn is_repeated(&self, node: NodeId) -> CompileResult<bool> {
        let position = self.position(node)?;
        Ok(self.search(position, position, &HashSet::new()))
    }

    /// Whether `node` is reachable from `from` without passing any obstacle.
    pub fn is_reachable_without_executing(
        &self,
        node: NodeId,
        from: NodeId,
        obstacles: &[NodeId],
    ) -> CompileResult<bool> {
        let (target, start) = (self.position(node)?, self.position(from)?);
        if target == start {
            return Ok(true);
        }
        let obstacles = obstacles
            .iter()
            .map(|&obstacle| self.position(obstacle))
            .collect::<CompileResult<HashSet<_>>>()?;
        Ok(self.search(start, target, &obstacles))
    }

    /// Whether `node` has executed by the time `position` is reached.
    ///
    /// False when a jump placed before the node lands after it and can still
    /// arrive at `position`.
    pub fn is_executed_before(&self, node: NodeId, position: usize) -> CompileResult<bool> {
        let start = self.position(node)?;
        if start >= position {
            return Ok(false);
        }
        for &jump in self.jumps.iter().take_while(|&&jump| jump < start) {
            let Some(FlowElement::Jump(element)) = self.elements.get(jump) else {
                continue;
            };
            let Some(landing) = self.label_position(element.label) else {
                continue;
            };
            if landing > start && self.is_position_reachable(position, landing) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether no label between `node` and `position` can be entered by a jump.
    pub fn is_always_executed_before(&self, node: NodeId, position: usize) -> CompileResult<bool> {
        let start = self.position(node)?;
        if start >= position {
            return Ok(false);
        }
        Ok(!self.elements[start + 1..position.min(self.elements.len())]
            .iter()
            .any(|element| match element {
                FlowElement::Label(label) => !self.incoming(*label).is_empty(),
                _ => false,
            }))
    }

    /// Collects the `targets` executable from `start` before hitting an obstacle.
    ///
    /// Jumps are followed depth first; each jump is taken at most once, which
    /// keeps cycles finite.
    pub fn get_executable_positions(
        &self,
        start: usize,
        obstacles: &[usize],
        targets: &[usize],
    ) -> Vec<usize> {
        let mut pending: Vec<usize> = targets.to_vec();
        let mut reached = Vec::new();
        let mut denylist = HashSet::new();
        self.explore(start, obstacles, &mut pending, &mut reached, &mut denylist);
        reached.sort_unstable();
        reached.dedup();
        reached
    }

    fn explore(
        &self,
        mut start: usize,
        obstacles: &[usize],
        pending: &mut Vec<usize>,
        reached: &mut Vec<usize>,
        denylist: &mut HashSet<usize>,
    ) {
        loop {
            let obstacle = obstacles.iter().copied().filter(|&o| o >= start).min();
            let jump = self.jumps.iter().copied().find(|&j| j >= start);
            let (limit, is_jump) = match (obstacle, jump) {
                (Some(o), Some(j)) if j < o => (Some(j), true),
                (Some(o), _) => (Some(o), false),
                (None, Some(j)) => (Some(j), true),
                (None, None) => (None, false),
            };

            // Targets up to the limit execute; a jump itself executes too.
            pending.retain(|&target| {
                let executes = target >= start
                    && match limit {
                        Some(limit) => target < limit || (is_jump && target == limit),
                        None => true,
                    };
                if executes {
                    reached.push(target);
                }
                !executes
            });

            let Some(limit) = limit else { return };
            if pending.is_empty() || !is_jump || !denylist.insert(limit) {
                return;
            }

            let FlowElement::Jump(element) = &self.elements[limit] else {
                return;
            };
            let Some(landing) = self.label_position(element.label) else {
                return;
            };
            if element.is_conditional() {
                self.explore(landing, obstacles, pending, reached, denylist);
                if pending.is_empty() {
                    return;
                }
                start = limit + 1;
            } else {
                start = landing;
            }
        }
    }

    pub fn is_before(&self, node: NodeId, other: NodeId) -> CompileResult<bool> {
        Ok(self.position(node)? < self.position(other)?)
    }

    pub fn is_after(&self, node: NodeId, other: NodeId) -> CompileResult<bool> {
        Ok(self.position(node)? > self.position(other)?)
    }

    /// Whether `node` lies strictly between the two positions.
    pub fn is_between(&self, node: NodeId, from: usize, to: usize) -> CompileResult<bool> {
        let position = self.position(node)?;
        Ok(from < position && position < to)
    }

    /// Nodes strictly between two positions that satisfy the filter.
    pub fn between(&self, from: usize, to: usize, filter: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        let end = to.min(self.elements.len());
        if from + 1 >= end {
            return Vec::new();
        }
        self.elements[from + 1..end]
            .iter()
            .filter_map(|element| match element {
                FlowElement::Node(node) if filter(*node) => Some(*node),
                _ => None,
            })
            .collect()
    }
}
