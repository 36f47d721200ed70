//! Shared helpers for the integration tests: a deterministic random source, a small
//! interpreter for finalized machine instructions and a direct evaluator for function trees.
//! Calls are answered by `callee` on both sides, so compiled code and the tree agree on what
//! every external function returns.

#![allow(dead_code)]

use codeflow::assembler::{Condition, MachineInstruction, MachineOperand, Opcode};
use codeflow::core::{assign_all, AsmReg, Constant, Format, Operand, Size};
use codeflow::flow::tree::{BinaryOperator, ComparisonOperator, LogicalOperator, LoopControl, NodeKind, Type};
use codeflow::flow::{LabelId, NodeId, VariableId};
use codeflow::{Function, Target, Tree};
use hashbrown::HashMap;

/// Linear congruential generator, good enough for reproducible test inputs.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }

    pub fn range(&mut self, low: i64, high: i64) -> i64 {
        low + self.below((high - low + 1) as u64) as i64
    }
}

const FRAME_BASE: i64 = 1 << 20;
const STEP_LIMIT: usize = 1_000_000;
/// Left in every volatile register a call does not return in.
const CLOBBERED: i64 = 0x5eed_dead_beef;

/// Result of the external function `name` applied to its arguments.
pub fn callee(name: &str, arguments: &[i64]) -> i64 {
    let seed = name
        .bytes()
        .fold(17i64, |hash, byte| hash.wrapping_mul(31).wrapping_add(i64::from(byte)));
    let mixed = arguments.iter().enumerate().fold(seed, |hash, (index, &argument)| {
        hash.wrapping_mul(1_000_003)
            .wrapping_add(argument.wrapping_mul(index as i64 + 1))
    });
    mixed.rem_euclid(2001) - 1000
}

/// Executes integer code produced for `target` and returns the value left in the return
/// register.
pub fn execute(target: Target, code: &[MachineInstruction], arguments: &[i64]) -> i64 {
    let mut machine = Machine::new(target);
    machine.enter(arguments);
    machine.run(code)
}

pub struct Machine {
    target: Target,
    registers: HashMap<AsmReg, i64>,
    memory: HashMap<i64, i64>,
    flags: (i64, i64),
}

impl Machine {
    pub fn new(target: Target) -> Self {
        let file = target.register_file();
        let mut registers = HashMap::new();
        if let Some(fp) = file.base_pointer() {
            registers.insert(fp, FRAME_BASE);
        }
        if let Some(sp) = file.stack_pointer() {
            registers.insert(sp, FRAME_BASE - 4096);
        }
        Self {
            target,
            registers,
            memory: HashMap::new(),
            flags: (0, 0),
        }
    }

    pub fn enter(&mut self, arguments: &[i64]) {
        let formats = vec![Format::I64; arguments.len()];
        let mut assigner = self.target.assigner();
        for (assignment, &value) in assign_all(assigner.as_mut(), &formats).iter().zip(arguments) {
            let reg = assignment.reg.expect("integer arguments travel in registers");
            self.registers.insert(reg, value);
        }
    }

    pub fn register(&self, reg: AsmReg) -> i64 {
        *self.registers.get(&reg).unwrap_or_else(|| panic!("read of undefined register {reg:?}"))
    }

    fn address(&self, operand: &Operand) -> i64 {
        match operand {
            Operand::Memory(memory) => {
                let index = memory
                    .index
                    .map_or(0, |index| self.register(index) * i64::from(memory.stride));
                self.register(memory.base) + index + memory.offset
            }
            other => panic!("not an address: {other:?}"),
        }
    }

    fn read(&self, operand: &MachineOperand) -> i64 {
        let value = match &operand.value {
            Operand::Register(reg) => self.register(*reg),
            Operand::Constant(Constant::Integer(value)) => *value,
            Operand::Memory(_) => {
                let address = self.address(&operand.value);
                *self
                    .memory
                    .get(&address)
                    .unwrap_or_else(|| panic!("read of uninitialized memory at {address:#x}"))
            }
            Operand::Expression {
                multiplicand,
                multiplier,
                addition,
                constant,
            } => {
                self.register(*multiplicand) * multiplier + addition.map_or(0, |reg| self.register(reg)) + constant
            }
            other => panic!("unsupported operand {other:?}"),
        };
        truncate(value, operand.size())
    }

    fn write(&mut self, operand: &MachineOperand, value: i64) {
        let value = truncate(value, operand.size());
        match &operand.value {
            Operand::Register(reg) => {
                self.registers.insert(*reg, value);
            }
            Operand::Memory(_) => {
                let address = self.address(&operand.value);
                self.memory.insert(address, value);
            }
            other => panic!("cannot write {other:?}"),
        }
    }

    fn inputs(&self, instruction: &MachineInstruction) -> Vec<i64> {
        instruction
            .operands
            .iter()
            .filter(|operand| operand.reads() && !operand.is_hidden())
            .map(|operand| self.read(operand))
            .collect()
    }

    fn destination(instruction: &MachineInstruction) -> &MachineOperand {
        instruction
            .operands
            .iter()
            .find(|operand| operand.writes() && !operand.is_hidden())
            .expect("instruction has a destination")
    }

    /// Integer arguments of a call, in calling convention order.
    fn call_arguments(&self, instruction: &MachineInstruction, stack_arguments: u32) -> Vec<i64> {
        let in_registers = instruction
            .operands
            .iter()
            .filter(|operand| operand.reads() && operand.is_hidden())
            .count();
        let formats = vec![Format::I64; in_registers + stack_arguments as usize];
        let mut assigner = self.target.assigner();
        let sp = self.target.register_file().stack_pointer().expect("stack pointer");
        assign_all(assigner.as_mut(), &formats)
            .iter()
            .map(|assignment| match (assignment.reg, assignment.stack_off) {
                (Some(reg), _) => self.register(reg),
                (None, Some(offset)) => {
                    let address = self.register(sp) + i64::from(offset);
                    *self
                        .memory
                        .get(&address)
                        .unwrap_or_else(|| panic!("stack argument at {address:#x} was never written"))
                }
                (None, None) => panic!("argument without a location"),
            })
            .collect()
    }

    /// Runs an external function: the result lands in the return register and every other
    /// volatile register is garbage afterwards.
    fn call(&mut self, function: &str, arguments: &[i64]) -> i64 {
        let file = self.target.register_file();
        for register in file.registers() {
            if register.is_volatile() && !register.is_reserved() {
                self.registers.insert(register.reg, CLOBBERED ^ i64::from(register.reg.id));
            }
        }
        let value = callee(function, arguments);
        let result = file.return_register(false).expect("integer return register");
        self.registers.insert(result, value);
        self.flags = (CLOBBERED, 0);
        value
    }

    /// x86-64 division of the numerator register pair.
    fn divide_pair(&mut self, instruction: &MachineInstruction, unsigned: bool) {
        use codeflow::x64::{RAX, RDX};
        let size = instruction.operands[0].size();
        let bits = size.bytes() * 8;
        let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
        let low = u128::from(self.register(RAX) as u64 & mask);
        let high = u128::from(self.register(RDX) as u64 & mask);
        let numerator = (high << bits) | low;
        let divisor = self.inputs(instruction)[0];
        assert!(truncate(divisor, size) != 0, "division by zero");

        let (quotient, remainder) = if unsigned {
            let divisor = u128::from(divisor as u64 & mask);
            let quotient = numerator / divisor;
            assert!(quotient <= u128::from(mask), "quotient overflows the numerator register");
            (quotient as i64, (numerator % divisor) as i64)
        } else {
            let shift = 128 - 2 * bits;
            let numerator = ((numerator << shift) as i128) >> shift;
            let divisor = i128::from(truncate(divisor, size));
            let quotient = numerator / divisor;
            let limit = 1i128 << (bits - 1);
            assert!((-limit..limit).contains(&quotient), "quotient overflows the numerator register");
            (quotient as i64, (numerator % divisor) as i64)
        };
        self.registers.insert(RAX, truncate(quotient, size));
        self.registers.insert(RDX, truncate(remainder, size));
    }

    fn holds(&self, condition: Condition) -> bool {
        let (left, right) = self.flags;
        if condition.unsigned {
            let ordering = (left as u64).cmp(&(right as u64));
            let (left, right) = match ordering {
                std::cmp::Ordering::Less => (0, 1),
                std::cmp::Ordering::Equal => (0, 0),
                std::cmp::Ordering::Greater => (1, 0),
            };
            condition.operator.evaluate(left, right)
        } else {
            condition.operator.evaluate(left, right)
        }
    }

    pub fn run(&mut self, code: &[MachineInstruction]) -> i64 {
        let labels: HashMap<LabelId, usize> = code
            .iter()
            .enumerate()
            .filter_map(|(index, instruction)| match instruction.opcode {
                Opcode::Label(label) => Some((label, index)),
                _ => None,
            })
            .collect();
        let file = self.target.register_file();
        let result = file.return_register(false).expect("integer return register");

        let mut pc = 0;
        for _ in 0..STEP_LIMIT {
            let Some(instruction) = code.get(pc) else {
                panic!("fell off the end of the function");
            };
            pc += 1;
            match &instruction.opcode {
                Opcode::Label(_) => {}
                Opcode::Jump { label, condition } => {
                    if condition.map_or(true, |condition| self.holds(condition)) {
                        pc = labels[label];
                    }
                }
                Opcode::Compare => {
                    let inputs = self.inputs(instruction);
                    self.flags = (inputs[0], inputs[1]);
                }
                Opcode::SetCondition(condition) => {
                    let value = i64::from(self.holds(*condition));
                    self.write(Self::destination(instruction), value);
                }
                Opcode::Move => {
                    let value = self.read(&instruction.operands[1]);
                    self.write(&instruction.operands[0], value);
                }
                Opcode::Arithmetic(operator) => {
                    use codeflow::assembler::ArithmeticOperator::*;
                    let inputs = self.inputs(instruction);
                    let (a, b) = (inputs[0], inputs[1]);
                    let value = match operator {
                        Add => a.wrapping_add(b),
                        Subtract => a.wrapping_sub(b),
                        Multiply => a.wrapping_mul(b),
                        And => a & b,
                        Or => a | b,
                        Xor => a ^ b,
                    };
                    self.write(Self::destination(instruction), value);
                }
                Opcode::Shift { direction, unsigned } => {
                    let inputs = self.inputs(instruction);
                    let (value, count) = (inputs[0], (inputs[1] & 63) as u32);
                    let shifted = match (direction, unsigned) {
                        (codeflow::assembler::ShiftDirection::Left, _) => value.wrapping_shl(count),
                        (_, true) => ((value as u64) >> count) as i64,
                        (_, false) => value >> count,
                    };
                    self.write(Self::destination(instruction), shifted);
                }
                Opcode::Negate => {
                    let inputs = self.inputs(instruction);
                    self.write(Self::destination(instruction), inputs[0].wrapping_neg());
                }
                Opcode::Divide { remainder, unsigned } => {
                    if instruction.operands.iter().any(|operand| operand.is_hidden()) {
                        self.divide_pair(instruction, *unsigned);
                    } else {
                        let inputs = self.inputs(instruction);
                        assert!(inputs[1] != 0, "division by zero");
                        let value = match (remainder, unsigned) {
                            (false, false) => inputs[0].wrapping_div(inputs[1]),
                            (true, false) => inputs[0].wrapping_rem(inputs[1]),
                            (false, true) => ((inputs[0] as u64) / (inputs[1] as u64)) as i64,
                            (true, true) => ((inputs[0] as u64) % (inputs[1] as u64)) as i64,
                        };
                        self.write(Self::destination(instruction), value);
                    }
                }
                Opcode::ExtendNumerator => {
                    let value = self.read(&instruction.operands[1]);
                    self.write(&instruction.operands[0], if value < 0 { -1 } else { 0 });
                }
                Opcode::Call {
                    function,
                    stack_arguments,
                } => {
                    let arguments = self.call_arguments(instruction, *stack_arguments);
                    self.call(function.as_str(), &arguments);
                }
                Opcode::TailJump(function) => {
                    let arguments = self.call_arguments(instruction, 0);
                    return self.call(function.as_str(), &arguments);
                }
                Opcode::Epilogue => {}
                Opcode::MultiplySubtract => {
                    let inputs = self.inputs(instruction);
                    let value = inputs[2].wrapping_sub(inputs[0].wrapping_mul(inputs[1]));
                    self.write(Self::destination(instruction), value);
                }
                Opcode::StorePair => {
                    let size = i64::from(instruction.operands[0].size().bytes());
                    let base = self.address(&instruction.operands[2].value);
                    let (first, second) = (self.read(&instruction.operands[0]), self.read(&instruction.operands[1]));
                    self.memory.insert(base, first);
                    self.memory.insert(base + size, second);
                }
                Opcode::LoadPair => {
                    let size = i64::from(instruction.operands[0].size().bytes());
                    let base = self.address(&instruction.operands[2].value);
                    let first = self.memory[&base];
                    let second = self.memory[&(base + size)];
                    self.write(&instruction.operands[0], first);
                    self.write(&instruction.operands[1], second);
                }
                Opcode::Return => return self.register(result),
            }
        }
        panic!("step limit exceeded");
    }
}

fn truncate(value: i64, size: Size) -> i64 {
    match size {
        Size::Byte => value as i8 as i64,
        Size::Word => value as i16 as i64,
        Size::Dword => value as i32 as i64,
        Size::Qword => value,
    }
}

/// `s = 0; loop (i = 0, i < n, i += 1) { if i == skip { continue }; if i == stop { break }; s += i }`
pub fn break_continue_loop() -> Function {
    let mut tree = Tree::new();
    let n = tree.add_variable("n", Type::Scalar(Format::I64));
    let skip = tree.add_variable("skip", Type::Scalar(Format::I64));
    let stop = tree.add_variable("stop", Type::Scalar(Format::I64));
    let s = tree.add_variable("s", Type::Scalar(Format::I64));
    let i = tree.add_variable("i", Type::Scalar(Format::I64));

    let zero = tree.constant(0, Format::I64);
    let clear = tree.assign(s, zero);
    let zero = tree.constant(0, Format::I64);
    let initialization = tree.assign(i, zero);
    let (ri, rn) = (tree.read(i), tree.read(n));
    let condition = tree.compare(ComparisonOperator::Less, ri, rn);
    let ri = tree.read(i);
    let one = tree.constant(1, Format::I64);
    let next = tree.binary(BinaryOperator::Add, ri, one);
    let action = tree.assign(i, next);

    let (ri, rskip) = (tree.read(i), tree.read(skip));
    let skipping = tree.compare(ComparisonOperator::Equal, ri, rskip);
    let continuing = tree.add(NodeKind::LoopControl(LoopControl::Continue), None);
    let continue_body = tree.block(vec![continuing]);
    let skip_branch = tree.add(
        NodeKind::If {
            condition: skipping,
            body: continue_body,
            successors: Vec::new(),
        },
        None,
    );
    let (ri, rstop) = (tree.read(i), tree.read(stop));
    let stopping = tree.compare(ComparisonOperator::Equal, ri, rstop);
    let breaking = tree.add(NodeKind::LoopControl(LoopControl::Break), None);
    let break_body = tree.block(vec![breaking]);
    let stop_branch = tree.add(
        NodeKind::If {
            condition: stopping,
            body: break_body,
            successors: Vec::new(),
        },
        None,
    );
    let (rs, ri) = (tree.read(s), tree.read(i));
    let sum = tree.binary(BinaryOperator::Add, rs, ri);
    let accumulate = tree.assign(s, sum);
    let body = tree.block(vec![skip_branch, stop_branch, accumulate]);
    let looped = tree.add(
        NodeKind::Loop {
            initialization: Some(initialization),
            condition: Some(condition),
            action: Some(action),
            body,
        },
        None,
    );
    let rs = tree.read(s);
    let ret = tree.return_value(Some(rs));
    let function_body = tree.block(vec![clear, looped, ret]);
    Function::new("loop", tree, vec![n, skip, stop], Some(Format::I64), function_body)
}

pub enum Control {
    Next,
    Break,
    Continue,
    Return(Option<i64>),
}

/// Evaluates a function tree directly.
pub struct Reference<'t> {
    tree: &'t Tree,
    variables: HashMap<VariableId, i64>,
    steps: usize,
}

impl<'t> Reference<'t> {
    pub fn new(function: &'t Function, arguments: &[i64]) -> Self {
        Self {
            tree: &function.tree,
            variables: function.parameters.iter().copied().zip(arguments.iter().copied()).collect(),
            steps: 0,
        }
    }

    fn value(&mut self, node: NodeId) -> i64 {
        match self.tree.kind(node).clone() {
            NodeKind::Constant(Constant::Integer(value)) => value,
            NodeKind::Variable(variable) => *self
                .variables
                .get(&variable)
                .unwrap_or_else(|| panic!("{variable:?} read before it was assigned")),
            NodeKind::Binary { operator, left, right } => {
                let (left, right) = (self.value(left), self.value(right));
                binary(operator, left, right)
            }
            NodeKind::Comparison { operator, left, right } => {
                let (left, right) = (self.value(left), self.value(right));
                i64::from(operator.evaluate(left, right))
            }
            NodeKind::Logical { operator, left, right } => {
                let left = self.value(left) != 0;
                let result = match operator {
                    LogicalOperator::And => left && self.value(right) != 0,
                    LogicalOperator::Or => left || self.value(right) != 0,
                };
                i64::from(result)
            }
            NodeKind::Negate(value) => self.value(value).wrapping_neg(),
            NodeKind::Call { function, arguments } => {
                let arguments: Vec<i64> = arguments.into_iter().map(|argument| self.value(argument)).collect();
                callee(function.as_str(), &arguments)
            }
            kind => panic!("not an expression: {kind:?}"),
        }
    }

    pub fn run(&mut self, node: NodeId) -> Control {
        self.steps += 1;
        assert!(self.steps < STEP_LIMIT, "tree does not terminate");
        match self.tree.kind(node).clone() {
            NodeKind::Block(children) => {
                for child in children {
                    match self.run(child) {
                        Control::Next => {}
                        control => return control,
                    }
                }
                Control::Next
            }
            NodeKind::Assign { target, value } => {
                let value = self.value(value);
                let NodeKind::Variable(variable) = self.tree.kind(target) else {
                    panic!("only variable targets are interpreted");
                };
                self.variables.insert(*variable, value);
                Control::Next
            }
            NodeKind::If {
                condition,
                body,
                successors,
            } => {
                if self.value(condition) != 0 {
                    return self.run(body);
                }
                for successor in successors {
                    match self.tree.kind(successor).clone() {
                        NodeKind::ElseIf { condition, body } => {
                            if self.value(condition) != 0 {
                                return self.run(body);
                            }
                        }
                        NodeKind::Else { body } => return self.run(body),
                        kind => panic!("unexpected successor {kind:?}"),
                    }
                }
                Control::Next
            }
            NodeKind::Loop {
                initialization,
                condition,
                action,
                body,
            } => {
                if let Some(initialization) = initialization {
                    self.run(initialization);
                }
                loop {
                    if let Some(condition) = condition {
                        if self.value(condition) == 0 {
                            break;
                        }
                    }
                    match self.run(body) {
                        Control::Break => break,
                        Control::Return(value) => return Control::Return(value),
                        Control::Next | Control::Continue => {}
                    }
                    if let Some(action) = action {
                        self.run(action);
                    }
                }
                Control::Next
            }
            NodeKind::LoopControl(LoopControl::Break) => Control::Break,
            NodeKind::LoopControl(LoopControl::Continue) => Control::Continue,
            NodeKind::Return(value) => Control::Return(value.map(|value| self.value(value))),
            _ => {
                self.value(node);
                Control::Next
            }
        }
    }
}

/// Value the function returns when its tree is evaluated directly.
pub fn run_tree(function: &Function, arguments: &[i64]) -> Option<i64> {
    match Reference::new(function, arguments).run(function.body) {
        Control::Return(value) => value,
        _ => None,
    }
}

pub fn binary(operator: BinaryOperator, left: i64, right: i64) -> i64 {
    match operator {
        BinaryOperator::Add => left.wrapping_add(right),
        BinaryOperator::Subtract => left.wrapping_sub(right),
        BinaryOperator::Multiply => left.wrapping_mul(right),
        BinaryOperator::Divide => left.wrapping_div(right),
        BinaryOperator::Remainder => left.wrapping_rem(right),
        BinaryOperator::And => left & right,
        BinaryOperator::Or => left | right,
        BinaryOperator::Xor => left ^ right,
        BinaryOperator::ShiftLeft => left.wrapping_shl((right & 63) as u32),
        BinaryOperator::ShiftRight => left >> (right & 63),
    }
}
