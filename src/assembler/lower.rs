// This module lowers a linearized function into unbuilt assembler instructions. It walks the
// flow once. Every node becomes zero or more instructions whose parameters describe what the
// target can encode: two-operand arithmetic modifies its left operand on x86-64, three-operand
// arithmetic writes a fresh destination on AArch64. Variables are not tied to storage; a
// variable is bound to the Result holding its current value. Branch chains and loops open a
// scope whose active variables are the ones still referenced after the region starts (or
// anywhere in an enclosing loop). Every jump into a region is preceded by a merge that moves
// the current values of those variables to the locations they had on entry, and every label
// of the region restarts from those entry values. In debug mode each variable lives in its
// frame slot instead and every read and write goes through memory.

//! Lowering from flow elements to assembler instructions.

use crate::assembler::instruction::{
    ArithmeticOperator, Condition, InstructionKind, InstructionParameter, MoveKind, ParameterFlags,
    ScopeId, ShiftDirection,
};
use crate::assembler::unit::{move_source_types, register_kind, Unit};
use crate::core::error::{CompileError, CompileResult};
use crate::core::results::ResultId;
use crate::core::value::{Constant, Format, Handle, HandleKind, Size};
use crate::flow::graph::{Flow, FlowElement, Jump, JumpCondition, LabelId, RegionId};
use crate::flow::tree::{
    BinaryOperator, ComparisonOperator, Function, NodeId, NodeKind, VariableId,
};
use crate::target::Target;
use hashbrown::{HashMap, HashSet};

/// Region currently being lowered.
struct OpenRegion {
    region: RegionId,
    scope: ScopeId,
    actives: Vec<VariableId>,
    entry: HashMap<VariableId, ResultId>,
}

pub struct Lowering<'u, 'a, 'f> {
    unit: &'u mut Unit<'a>,
    function: &'f Function,
    flow: &'f Flow,
    values: HashMap<NodeId, ResultId>,
    /// Variable bindings, one map per open region over the function map.
    maps: Vec<HashMap<VariableId, ResultId>>,
    open: Vec<OpenRegion>,
    /// Positions reading or assigning each variable.
    references: HashMap<VariableId, Vec<usize>>,
    /// Comparison whose flags the next jump consumes.
    pending: Option<(NodeId, Condition)>,
    reachable: bool,
}

impl<'u, 'a, 'f> Lowering<'u, 'a, 'f> {
    pub fn new(unit: &'u mut Unit<'a>, function: &'f Function, flow: &'f Flow) -> Self {
        let mut references: HashMap<VariableId, Vec<usize>> = HashMap::new();
        for (position, element) in flow.elements().iter().enumerate() {
            let FlowElement::Node(node) = element else {
                continue;
            };
            let variable = match function.tree.kind(*node) {
                NodeKind::Variable(variable) => Some(*variable),
                NodeKind::Assign { target, .. } => match function.tree.kind(*target) {
                    NodeKind::Variable(variable) => Some(*variable),
                    _ => None,
                },
                _ => None,
            };
            if let Some(variable) = variable {
                references.entry(variable).or_default().push(position);
            }
        }

        Self {
            unit,
            function,
            flow,
            values: HashMap::new(),
            maps: vec![HashMap::new()],
            open: Vec::new(),
            references,
            pending: None,
            reachable: true,
        }
    }

    /// Appends the instructions of the whole function.
    pub fn lower(mut self) -> CompileResult<()> {
        self.lower_parameters()?;

        for position in 0..self.flow.len() {
            for region in self.flow.regions_starting_at(position) {
                self.open_region(region)?;
            }

            let Some(element) = self.flow.element(position).cloned() else {
                break;
            };
            match element {
                FlowElement::Node(node) => {
                    if self.reachable {
                        self.lower_node(node, position)?;
                    }
                }
                FlowElement::Label(label) => self.lower_label(label),
                FlowElement::Jump(jump) => self.lower_jump(jump)?,
            }

            while self
                .open
                .last()
                .is_some_and(|open| self.flow.region(open.region).end == position)
            {
                self.close_region();
            }
        }

        if self.reachable {
            self.unit.add(InstructionKind::Return { value: None }, None, Vec::new(), Vec::new());
        }
        log::debug!(
            "lowered {} into {} instructions",
            self.function.name,
            self.unit.instructions.len()
        );
        Ok(())
    }

    fn target(&self) -> Target {
        self.unit.target
    }

    fn value(&self, node: NodeId) -> CompileResult<ResultId> {
        self.values
            .get(&node)
            .copied()
            .ok_or_else(|| CompileError::codegen(format!("{node:?} has no value")))
    }

    fn format(&self, node: NodeId) -> CompileResult<Format> {
        self.function.tree.format(node).ok_or(CompileError::UnsupportedNode {
            node,
            reason: "node produces no value",
        })
    }

    fn variable_format(&self, variable: VariableId) -> CompileResult<Format> {
        self.function.tree.variable(variable).format().ok_or_else(|| {
            CompileError::codegen(format!("{variable:?} is a pack and has no single location"))
        })
    }

    fn lookup(&self, variable: VariableId) -> Option<ResultId> {
        self.maps.iter().rev().find_map(|map| map.get(&variable).copied())
    }

    fn bind(&mut self, variable: VariableId, value: ResultId) {
        if let Some(map) = self.maps.last_mut() {
            map.insert(variable, value);
        }
    }

    fn is_bound(&self, value: ResultId) -> bool {
        self.maps
            .iter()
            .flat_map(|map| map.values())
            .chain(self.open.iter().flat_map(|open| open.entry.values()))
            .any(|&bound| bound == value)
    }

    /// Stand-in for a variable that has no value in a register yet.
    fn placeholder(&mut self, variable: VariableId) -> CompileResult<ResultId> {
        let format = self.variable_format(variable)?;
        let slot = self.unit.frame.variable_slot(variable, format.size().bytes());
        Ok(self.unit.create_result(Handle::Stack(slot), format))
    }

    fn lower_parameters(&mut self) -> CompileResult<()> {
        let mut parameters = Vec::new();
        for variable in self.function.leaf_parameters() {
            let format = self.variable_format(variable)?;
            let result = self.unit.create_result(Handle::None, format);
            parameters.push((variable, result));
        }
        self.unit.add(
            InstructionKind::Initialize {
                parameters: parameters.clone(),
            },
            None,
            Vec::new(),
            Vec::new(),
        );

        for (variable, result) in parameters {
            if self.unit.debug {
                self.store_variable(variable, result)?;
            } else {
                self.bind(variable, result);
            }
        }
        Ok(())
    }

    /// Variables whose values must agree at the merge points of a region.
    fn actives(&self, region: RegionId) -> Vec<VariableId> {
        if self.unit.debug {
            return Vec::new();
        }
        let span = self.flow.region(region);
        let mut candidates: HashSet<VariableId> = self
            .maps
            .iter()
            .flat_map(|map| map.keys().copied())
            .collect();
        for (&variable, positions) in &self.references {
            let assigned = positions.iter().any(|&position| {
                span.contains(position)
                    && matches!(
                        self.flow.element(position),
                        Some(FlowElement::Node(node)) if matches!(self.function.tree.kind(*node), NodeKind::Assign { .. })
                    )
            });
            if assigned {
                candidates.insert(variable);
            }
        }

        let mut loops = Vec::new();
        let mut current = self.flow.enclosing_loop(region);
        while let Some(id) = current {
            loops.push(self.flow.region(id));
            current = self.flow.enclosing_loop(id);
        }

        let mut actives: Vec<VariableId> = candidates
            .into_iter()
            .filter(|variable| {
                self.references.get(variable).is_some_and(|positions| {
                    positions
                        .iter()
                        .any(|&position| position >= span.start || loops.iter().any(|l| l.contains(position)))
                })
            })
            .collect();
        actives.sort();
        actives
    }

    fn open_region(&mut self, region: RegionId) -> CompileResult<()> {
        let outer = self.open.last().map_or(ScopeId(0), |open| open.scope);
        let scope = self.unit.create_scope(outer);
        let actives = self.actives(region);

        let mut entry = HashMap::new();
        for &variable in &actives {
            let anchor = match self.lookup(variable) {
                Some(bound) => bound,
                None => self.placeholder(variable)?,
            };
            entry.insert(variable, anchor);
        }
        log::trace!(
            "{:?} region at {} keeps {} variables",
            self.flow.region(region).kind,
            self.flow.region(region).start,
            actives.len()
        );

        {
            let opened = self.unit.scope_mut(scope);
            opened.entry = entry.clone();
            opened.actives = actives.clone();
        }
        let anchors: Vec<ResultId> = actives.iter().filter_map(|variable| entry.get(variable).copied()).collect();
        self.unit.add(InstructionKind::EnterScope { scope }, None, Vec::new(), anchors);
        self.unit.scope = scope;

        self.maps.push(entry.clone());
        self.open.push(OpenRegion {
            region,
            scope,
            actives,
            entry,
        });
        Ok(())
    }

    fn close_region(&mut self) {
        let Some(closed) = self.open.pop() else {
            return;
        };
        let anchors: Vec<ResultId> = closed
            .actives
            .iter()
            .filter_map(|variable| closed.entry.get(variable).copied())
            .collect();
        self.unit.add(
            InstructionKind::ExitScope { scope: closed.scope },
            None,
            Vec::new(),
            anchors,
        );
        self.unit.scope = self.open.last().map_or(ScopeId(0), |open| open.scope);

        if let Some(inner) = self.maps.pop() {
            for (variable, value) in inner {
                self.bind(variable, value);
            }
        }
    }

    /// Moves the current values of a region's actives to their entry locations.
    fn merge_into(&mut self, region: RegionId) {
        let Some(open) = self.open.iter().find(|open| open.region == region) else {
            return;
        };
        if open.actives.is_empty() {
            return;
        }
        let scope = open.scope;
        let sources: Vec<(VariableId, ResultId)> = open
            .actives
            .iter()
            .filter_map(|&variable| {
                self.lookup(variable)
                    .or_else(|| open.entry.get(&variable).copied())
                    .map(|value| (variable, value))
            })
            .collect();
        let anchors: Vec<ResultId> = open.entry.values().copied().collect();
        self.unit.add(InstructionKind::MergeScope { scope, sources }, None, Vec::new(), anchors);
    }

    fn lower_label(&mut self, label: LabelId) {
        self.pending = None;
        let Some(region) = self.flow.region_of_label(label) else {
            // The function end label is only targeted by returns.
            return;
        };
        if self.reachable {
            self.merge_into(region);
        }
        let scope = self
            .open
            .iter()
            .find(|open| open.region == region)
            .map(|open| (open.scope, open.entry.clone()));
        match scope {
            Some((scope, entry)) => {
                self.unit.add(
                    InstructionKind::Label {
                        label,
                        region: Some(scope),
                    },
                    None,
                    Vec::new(),
                    Vec::new(),
                );
                if let Some(map) = self.maps.last_mut() {
                    *map = entry;
                }
            }
            None => {
                self.unit.add(InstructionKind::Label { label, region: None }, None, Vec::new(), Vec::new());
            }
        }
        self.reachable = true;
    }

    fn lower_jump(&mut self, jump: Jump) -> CompileResult<()> {
        if jump.exit {
            self.reachable = false;
            return Ok(());
        }
        if !self.reachable {
            return Ok(());
        }
        let condition = match jump.condition {
            Some(JumpCondition { node, when }) => Some(self.jump_condition(node, when)?),
            None => None,
        };
        if let Some(region) = self.flow.region_of_label(jump.label) {
            self.merge_into(region);
        }
        self.unit.add(
            InstructionKind::Jump {
                label: jump.label,
                condition,
            },
            None,
            Vec::new(),
            Vec::new(),
        );
        if condition.is_none() {
            self.reachable = false;
        }
        Ok(())
    }

    /// Condition under which a jump on `node == when` is taken.
    fn jump_condition(&mut self, node: NodeId, when: bool) -> CompileResult<Condition> {
        let condition = match self.pending.take() {
            Some((compared, condition)) if compared == node => condition,
            _ => {
                let value = self.value(node)?;
                let format = self.unit.results.format(value);
                let zero = self.unit.create_result(Handle::Constant(Constant::Integer(0)), format);
                let size = format.size();
                self.unit.add(
                    InstructionKind::Compare,
                    None,
                    vec![
                        InstructionParameter::source(value, size, vec![HandleKind::Register, HandleKind::Memory]),
                        InstructionParameter::source(zero, size, vec![HandleKind::Constant]),
                    ],
                    Vec::new(),
                );
                Condition {
                    operator: ComparisonOperator::NotEqual,
                    unsigned: false,
                }
            }
        };
        Ok(if when { condition } else { condition.negate() })
    }

    fn lower_node(&mut self, node: NodeId, position: usize) -> CompileResult<()> {
        match self.function.tree.kind(node).clone() {
            NodeKind::Block(_)
            | NodeKind::If { .. }
            | NodeKind::ElseIf { .. }
            | NodeKind::Else { .. }
            | NodeKind::Loop { .. }
            | NodeKind::LoopControl(_) => {}
            NodeKind::Logical { .. } => return Err(CompileError::WildLogicalOperator { node }),
            NodeKind::Constant(constant) => {
                let format = self.format(node)?;
                let result = self.unit.create_result(Handle::Constant(constant), format);
                self.values.insert(node, result);
            }
            NodeKind::Variable(variable) => {
                let result = self.read_variable(variable)?;
                self.values.insert(node, result);
            }
            NodeKind::Access { base, index, offset } => {
                let format = self.format(node)?;
                let address = self.address(base, index, offset, format)?;
                let result = self.unit.create_result(Handle::None, format);
                self.emit_move(result, vec![register_kind(format)], address, ParameterFlags::NONE);
                self.values.insert(node, result);
            }
            NodeKind::Assign { target, value } => self.lower_assign(node, target, value)?,
            NodeKind::Binary { operator, left, right } => self.lower_binary(node, operator, left, right)?,
            NodeKind::Comparison { operator, left, right } => {
                self.lower_comparison(node, position, operator, left, right)?
            }
            NodeKind::Negate(value) => self.lower_negate(node, value)?,
            NodeKind::Call { function, arguments } => {
                let arguments = arguments
                    .iter()
                    .map(|&argument| self.value(argument))
                    .collect::<CompileResult<Vec<_>>>()?;
                let result = match self.function.tree.format(node) {
                    Some(format) => Some(self.unit.create_result(Handle::None, format)),
                    None => None,
                };
                self.unit.add(InstructionKind::Call { function, arguments }, result, Vec::new(), Vec::new());
                if let Some(result) = result {
                    self.values.insert(node, result);
                }
            }
            NodeKind::Return(value) => {
                let value = value.map(|value| self.value(value)).transpose()?;
                self.unit.add(InstructionKind::Return { value }, None, Vec::new(), Vec::new());
            }
        }
        Ok(())
    }

    fn read_variable(&mut self, variable: VariableId) -> CompileResult<ResultId> {
        if self.unit.debug {
            return self.placeholder(variable);
        }
        match self.lookup(variable) {
            Some(bound) => Ok(bound),
            None => {
                let placeholder = self.placeholder(variable)?;
                self.bind(variable, placeholder);
                Ok(placeholder)
            }
        }
    }

    /// Memory Result addressing `base + index * stride + offset`.
    fn address(
        &mut self,
        base: NodeId,
        index: Option<(NodeId, u8)>,
        offset: i64,
        format: Format,
    ) -> CompileResult<ResultId> {
        let base = self.value(base)?;
        let handle = match index {
            Some((index, stride)) => Handle::ComplexMemory {
                base,
                index: self.value(index)?,
                stride,
                offset,
            },
            None => Handle::Memory { base, offset },
        };
        Ok(self.unit.create_result(handle, format))
    }

    fn emit_move(
        &mut self,
        destination: ResultId,
        types: Vec<HandleKind>,
        source: ResultId,
        flags: ParameterFlags,
    ) {
        let size = self.unit.results.format(destination).size();
        self.unit.add(
            InstructionKind::Move { kind: MoveKind::Copy },
            None,
            vec![
                InstructionParameter::destination(destination, size, types).with(flags),
                InstructionParameter::source(source, size, move_source_types()),
            ],
            Vec::new(),
        );
    }

    fn store_variable(&mut self, variable: VariableId, value: ResultId) -> CompileResult<()> {
        let slot = self.placeholder(variable)?;
        self.emit_move(slot, vec![HandleKind::Memory], value, ParameterFlags::NO_ATTACH);
        Ok(())
    }

    fn lower_assign(&mut self, node: NodeId, target: NodeId, value: NodeId) -> CompileResult<()> {
        let mut value = self.value(value)?;
        match self.function.tree.kind(target).clone() {
            NodeKind::Variable(variable) => {
                if self.unit.debug {
                    return self.store_variable(variable, value);
                }
                if self.is_bound(value) {
                    // Two variables never share a Result.
                    let format = self.unit.results.format(value);
                    let copy = self.unit.create_result(Handle::None, format);
                    self.emit_move(copy, vec![register_kind(format)], value, ParameterFlags::RELOCATE_TO_SOURCE);
                    value = copy;
                }
                self.bind(variable, value);
                self.unit
                    .add(InstructionKind::SetVariable { variable, value }, None, Vec::new(), Vec::new());
            }
            NodeKind::Access { base, index, offset } => {
                let format = self
                    .function
                    .tree
                    .format(target)
                    .unwrap_or_else(|| self.unit.results.format(value));
                let address = self.address(base, index, offset, format)?;
                self.emit_move(address, vec![HandleKind::Memory], value, ParameterFlags::NO_ATTACH);
            }
            _ => {
                return Err(CompileError::UnsupportedNode {
                    node,
                    reason: "assignment target must be a variable or a memory access",
                })
            }
        }
        Ok(())
    }

    fn lower_binary(
        &mut self,
        node: NodeId,
        operator: BinaryOperator,
        left: NodeId,
        right: NodeId,
    ) -> CompileResult<()> {
        let format = self.format(node)?;
        let mut left = self.value(left)?;
        let mut right = self.value(right)?;
        let result = self.unit.create_result(Handle::None, format);
        self.values.insert(node, result);

        let arithmetic = match operator {
            BinaryOperator::Add => Some(ArithmeticOperator::Add),
            BinaryOperator::Subtract => Some(ArithmeticOperator::Subtract),
            BinaryOperator::Multiply => Some(ArithmeticOperator::Multiply),
            BinaryOperator::And => Some(ArithmeticOperator::And),
            BinaryOperator::Or => Some(ArithmeticOperator::Or),
            BinaryOperator::Xor => Some(ArithmeticOperator::Xor),
            _ => None,
        };

        if let Some(arithmetic) = arithmetic {
            let commutative = arithmetic != ArithmeticOperator::Subtract;
            if commutative && self.unit.results.handle(left).is_constant() {
                std::mem::swap(&mut left, &mut right);
            }
            if format.is_decimal() {
                if matches!(
                    arithmetic,
                    ArithmeticOperator::And | ArithmeticOperator::Or | ArithmeticOperator::Xor
                ) {
                    return Err(CompileError::UnsupportedNode {
                        node,
                        reason: "bitwise operators need integer operands",
                    });
                }
                self.emit_decimal(InstructionKind::Arithmetic(arithmetic), result, left, right);
            } else {
                let bits = match (self.target(), arithmetic) {
                    (Target::X64, _) => Some(self.target().immediate_bits()),
                    (Target::Arm64, ArithmeticOperator::Add | ArithmeticOperator::Subtract) => {
                        Some(self.target().immediate_bits())
                    }
                    _ => None,
                };
                self.emit_integer(InstructionKind::Arithmetic(arithmetic), result, left, right, bits);
            }
            return Ok(());
        }

        match operator {
            BinaryOperator::Divide | BinaryOperator::Remainder => {
                let remainder = operator == BinaryOperator::Remainder;
                let kind = InstructionKind::Division {
                    remainder,
                    unsigned: format.is_unsigned(),
                };
                if format.is_decimal() {
                    if remainder {
                        return Err(CompileError::UnsupportedNode {
                            node,
                            reason: "remainder needs integer operands",
                        });
                    }
                    self.emit_decimal(kind, result, left, right);
                } else if self.target() == Target::Arm64 && remainder {
                    self.lower_arm64_remainder(result, left, right, format);
                } else {
                    self.emit_integer(kind, result, left, right, None);
                }
            }
            BinaryOperator::ShiftLeft | BinaryOperator::ShiftRight => {
                if format.is_decimal() {
                    return Err(CompileError::UnsupportedNode {
                        node,
                        reason: "shifts need integer operands",
                    });
                }
                let direction = if operator == BinaryOperator::ShiftLeft {
                    ShiftDirection::Left
                } else {
                    ShiftDirection::Right
                };
                let kind = InstructionKind::Shift {
                    direction,
                    unsigned: format.is_unsigned(),
                };
                self.emit_shift(kind, result, left, right);
            }
            _ => {}
        }
        Ok(())
    }

    /// Integer operation in the target's operand form.
    fn emit_integer(
        &mut self,
        kind: InstructionKind,
        result: ResultId,
        left: ResultId,
        right: ResultId,
        bits: Option<u32>,
    ) {
        let size = self.unit.results.format(result).size();
        let mut right_types = vec![HandleKind::Register];
        if bits.is_some() {
            right_types.push(HandleKind::Constant);
        }
        let mut right_parameter = InstructionParameter::source(right, size, right_types);
        if let Some(bits) = bits {
            right_parameter = right_parameter.limit(bits);
        }

        let parameters = if self.target().has_three_operands() {
            vec![
                InstructionParameter::destination(result, size, vec![HandleKind::Register]),
                InstructionParameter::source(left, size, vec![HandleKind::Register]),
                right_parameter,
            ]
        } else {
            right_parameter.types.push(HandleKind::Memory);
            vec![
                InstructionParameter::modify(left, size, vec![HandleKind::Register]),
                right_parameter,
            ]
        };
        self.unit.add(kind, Some(result), parameters, Vec::new());
    }

    fn emit_decimal(&mut self, kind: InstructionKind, result: ResultId, left: ResultId, right: ResultId) {
        let size = self.unit.results.format(result).size();
        let media = vec![HandleKind::MediaRegister];
        let parameters = if self.target().has_three_operands() {
            vec![
                InstructionParameter::destination(result, size, media.clone()),
                InstructionParameter::source(left, size, media.clone()),
                InstructionParameter::source(right, size, media),
            ]
        } else {
            vec![
                InstructionParameter::modify(left, size, media),
                InstructionParameter::source(right, size, vec![HandleKind::MediaRegister, HandleKind::Memory]),
            ]
        };
        self.unit.add(kind, Some(result), parameters, Vec::new());
    }

    fn emit_shift(&mut self, kind: InstructionKind, result: ResultId, value: ResultId, count: ResultId) {
        let size = self.unit.results.format(result).size();
        let parameters = if self.target().has_three_operands() {
            vec![
                InstructionParameter::destination(result, size, vec![HandleKind::Register]),
                InstructionParameter::source(value, size, vec![HandleKind::Register]),
                InstructionParameter::source(count, size, vec![HandleKind::Register, HandleKind::Constant]).limit(8),
            ]
        } else {
            vec![
                InstructionParameter::modify(value, size, vec![HandleKind::Register]),
                InstructionParameter::source(count, Size::Byte, vec![HandleKind::Constant, HandleKind::Register])
                    .limit(8),
            ]
        };
        self.unit.add(kind, Some(result), parameters, Vec::new());
    }

    /// `left % right` as `left - (left / right) * right`.
    fn lower_arm64_remainder(&mut self, result: ResultId, left: ResultId, right: ResultId, format: Format) {
        let quotient = self.unit.create_result(Handle::None, format);
        self.emit_integer(
            InstructionKind::Division {
                remainder: false,
                unsigned: format.is_unsigned(),
            },
            quotient,
            left,
            right,
            None,
        );
        let size = format.size();
        let registers = vec![HandleKind::Register];
        self.unit.add(
            InstructionKind::MultiplySubtract,
            Some(result),
            vec![
                InstructionParameter::destination(result, size, registers.clone()),
                InstructionParameter::source(quotient, size, registers.clone()),
                InstructionParameter::source(right, size, registers.clone()),
                InstructionParameter::source(left, size, registers),
            ],
            Vec::new(),
        );
    }

    fn lower_comparison(
        &mut self,
        node: NodeId,
        position: usize,
        operator: ComparisonOperator,
        left: NodeId,
        right: NodeId,
    ) -> CompileResult<()> {
        let operand_format = self.format(left)?;
        let left = self.value(left)?;
        let right = self.value(right)?;
        let size = operand_format.size();

        let parameters = if operand_format.is_decimal() {
            let right_types = if self.target().is_load_store() {
                vec![HandleKind::MediaRegister]
            } else {
                vec![HandleKind::MediaRegister, HandleKind::Memory]
            };
            vec![
                InstructionParameter::source(left, size, vec![HandleKind::MediaRegister]),
                InstructionParameter::source(right, size, right_types),
            ]
        } else {
            let mut right_types = vec![HandleKind::Register, HandleKind::Constant];
            let mut left_types = vec![HandleKind::Register];
            if !self.target().is_load_store() {
                right_types.push(HandleKind::Memory);
                left_types.push(HandleKind::Memory);
            }
            vec![
                InstructionParameter::source(left, size, left_types),
                InstructionParameter::source(right, size, right_types).limit(self.target().immediate_bits()),
            ]
        };
        self.unit.add(InstructionKind::Compare, None, parameters, Vec::new());

        let condition = Condition {
            operator,
            unsigned: operand_format.is_unsigned() || operand_format.is_decimal(),
        };
        let consumed = matches!(
            self.flow.element(position + 1),
            Some(FlowElement::Jump(Jump {
                condition: Some(JumpCondition { node: jumped, .. }),
                ..
            })) if *jumped == node
        );
        if consumed {
            self.pending = Some((node, condition));
            return Ok(());
        }

        let format = self.format(node)?;
        let result = self.unit.create_result(Handle::None, format);
        self.unit.add(
            InstructionKind::SetCondition { condition },
            Some(result),
            vec![InstructionParameter::destination(result, format.size(), vec![HandleKind::Register])],
            Vec::new(),
        );
        self.values.insert(node, result);
        Ok(())
    }

    fn lower_negate(&mut self, node: NodeId, value: NodeId) -> CompileResult<()> {
        let format = self.format(node)?;
        let value = self.value(value)?;
        let result = self.unit.create_result(Handle::None, format);
        self.values.insert(node, result);

        if format.is_decimal() {
            let zero = self
                .unit
                .create_result(Handle::Constant(Constant::Decimal(0.0)), format);
            self.emit_decimal(InstructionKind::Arithmetic(ArithmeticOperator::Subtract), result, zero, value);
            return Ok(());
        }

        let size = format.size();
        let parameters = if self.target().has_three_operands() {
            vec![
                InstructionParameter::destination(result, size, vec![HandleKind::Register]),
                InstructionParameter::source(value, size, vec![HandleKind::Register]),
            ]
        } else {
            vec![InstructionParameter::modify(value, size, vec![HandleKind::Register])]
        };
        self.unit.add(InstructionKind::Negate, Some(result), parameters, Vec::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::FunctionFrame;
    use crate::flow::tree::{Tree, Type};
    use bumpalo::Bump;

    fn lower(function: &Function, target: Target, debug: bool) -> Vec<InstructionKind> {
        let arena = Bump::new();
        let flow = Flow::new(function).unwrap();
        let mut unit = Unit::new(target, debug, FunctionFrame::new(&arena));
        Lowering::new(&mut unit, function, &flow).lower().unwrap();
        unit.instructions.iter().map(|instruction| instruction.kind.clone()).collect()
    }

    fn add_function() -> Function {
        let mut tree = Tree::new();
        let a = tree.add_variable("a", Type::Scalar(Format::I64));
        let b = tree.add_variable("b", Type::Scalar(Format::I64));
        let left = tree.read(a);
        let right = tree.read(b);
        let sum = tree.binary(BinaryOperator::Add, left, right);
        let ret = tree.return_value(Some(sum));
        let body = tree.block(vec![ret]);
        Function::new("add", tree, vec![a, b], Some(Format::I64), body)
    }

    #[test]
    fn test_straight_line_function() {
        let kinds = lower(&add_function(), Target::X64, false);
        assert!(matches!(kinds[0], InstructionKind::Initialize { ref parameters } if parameters.len() == 2));
        assert_eq!(kinds[1], InstructionKind::Arithmetic(ArithmeticOperator::Add));
        assert!(matches!(kinds[2], InstructionKind::Return { value: Some(_) }));
        assert_eq!(kinds.len(), 3);
    }

    #[test]
    fn test_debug_mode_goes_through_memory() {
        let kinds = lower(&add_function(), Target::X64, true);
        let moves = kinds
            .iter()
            .filter(|kind| matches!(kind, InstructionKind::Move { .. }))
            .count();
        // Both parameters are stored to their slots on entry.
        assert_eq!(moves, 2);
    }

    #[test]
    fn test_comparison_feeds_jump_directly() {
        let mut tree = Tree::new();
        let x = tree.add_variable("x", Type::Scalar(Format::I64));
        let read = tree.read(x);
        let zero = tree.constant(0, Format::I64);
        let condition = tree.compare(ComparisonOperator::Less, read, zero);
        let one = tree.constant(1, Format::I64);
        let assign = tree.assign(x, one);
        let then = tree.block(vec![assign]);
        let branch = tree.add(
            NodeKind::If {
                condition,
                body: then,
                successors: Vec::new(),
            },
            None,
        );
        let result = tree.read(x);
        let ret = tree.return_value(Some(result));
        let body = tree.block(vec![branch, ret]);
        let function = Function::new("clamp", tree, vec![x], Some(Format::I64), body);

        let kinds = lower(&function, Target::X64, false);
        assert!(!kinds.iter().any(|kind| matches!(kind, InstructionKind::SetCondition { .. })));
        let jump = kinds
            .iter()
            .find_map(|kind| match kind {
                InstructionKind::Jump { condition: Some(condition), .. } => Some(*condition),
                _ => None,
            })
            .unwrap();
        assert_eq!(jump.operator, ComparisonOperator::GreaterOrEqual);
        assert!(kinds.iter().any(|kind| matches!(kind, InstructionKind::EnterScope { .. })));
        assert!(kinds.iter().any(|kind| matches!(kind, InstructionKind::MergeScope { .. })));
        assert!(kinds.iter().any(|kind| matches!(kind, InstructionKind::ExitScope { .. })));
    }

    #[test]
    fn test_arm64_remainder_uses_multiply_subtract() {
        let mut tree = Tree::new();
        let a = tree.add_variable("a", Type::Scalar(Format::I32));
        let b = tree.add_variable("b", Type::Scalar(Format::I32));
        let left = tree.read(a);
        let right = tree.read(b);
        let rem = tree.binary(BinaryOperator::Remainder, left, right);
        let ret = tree.return_value(Some(rem));
        let body = tree.block(vec![ret]);
        let function = Function::new("rem", tree, vec![a, b], Some(Format::I32), body);

        let kinds = lower(&function, Target::Arm64, false);
        assert!(kinds.contains(&InstructionKind::Division {
            remainder: false,
            unsigned: false
        }));
        assert!(kinds.contains(&InstructionKind::MultiplySubtract));
    }
}
