// This module defines the finalized instruction list handed to the peephole optimizer and to
// whatever encodes the function afterwards. A MachineInstruction is an Opcode with concrete
// MachineOperands; each operand keeps the format it was built with, the parameter flags that
// say whether it is read, written or implicit, and the handle kinds its instruction accepts,
// so a rewrite can be re-validated without going back to the build-time instruction. The
// register and memory effects of every opcode, including implicit ones such as the registers
// a call clobbers, are answered here for the optimizer's data-flow checks.

//! Finalized machine instructions.

use crate::assembler::instruction::{ArithmeticOperator, Condition, ParameterFlags, ShiftDirection};
use crate::core::register_file::{AsmReg, RegisterFile};
use crate::core::value::{Format, HandleKind, MemoryOperand, Operand, Size, Symbol};
use crate::flow::graph::LabelId;
use crate::flow::tree::ComparisonOperator;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    Label(LabelId),
    Jump { label: LabelId, condition: Option<Condition> },
    /// Jump to a function in place of a call and return.
    TailJump(Symbol),
    Compare,
    SetCondition(Condition),
    Move,
    Arithmetic(ArithmeticOperator),
    Shift { direction: ShiftDirection, unsigned: bool },
    Divide { remainder: bool, unsigned: bool },
    /// `cqo` and its narrower forms: the numerator register sign-extended into the remainder
    /// register.
    ExtendNumerator,
    MultiplySubtract,
    Negate,
    Call { function: Symbol, stack_arguments: u32 },
    /// Restores the frame and returns.
    Return,
    /// Restores the frame without returning.
    Epilogue,
    StorePair,
    LoadPair,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineOperand {
    pub value: Operand,
    pub format: Format,
    pub flags: ParameterFlags,
    pub types: Vec<HandleKind>,
}

impl MachineOperand {
    pub fn new(value: Operand, format: Format, flags: ParameterFlags, types: Vec<HandleKind>) -> Self {
        Self {
            value,
            format,
            flags,
            types,
        }
    }

    pub fn reads(&self) -> bool {
        self.flags.contains(ParameterFlags::READS)
    }

    pub fn writes(&self) -> bool {
        self.flags.contains(ParameterFlags::WRITES)
    }

    pub fn is_hidden(&self) -> bool {
        self.flags.contains(ParameterFlags::HIDDEN)
    }

    pub fn size(&self) -> Size {
        self.format.size()
    }

    /// Whether the operand kind is one its instruction accepts.
    pub fn is_valid(&self) -> bool {
        self.types.contains(&self.value.kind())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineInstruction {
    pub opcode: Opcode,
    pub operands: Vec<MachineOperand>,
}

impl MachineInstruction {
    pub fn new(opcode: Opcode, operands: Vec<MachineOperand>) -> Self {
        Self { opcode, operands }
    }

    pub fn is_move(&self) -> bool {
        self.opcode == Opcode::Move && self.operands.len() == 2
    }

    pub fn is_label(&self) -> bool {
        matches!(self.opcode, Opcode::Label(_))
    }

    pub fn is_call(&self) -> bool {
        matches!(self.opcode, Opcode::Call { .. })
    }

    /// Control transfers and merge points.
    pub fn is_control(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Label(_) | Opcode::Jump { .. } | Opcode::TailJump(_) | Opcode::Return | Opcode::Epilogue
        )
    }

    /// Divisions and the numerator extension ahead of them.
    pub fn is_division_step(&self) -> bool {
        matches!(self.opcode, Opcode::Divide { .. } | Opcode::ExtendNumerator)
    }

    pub fn destination(&self) -> Option<&MachineOperand> {
        self.operands.iter().find(|operand| operand.writes())
    }

    /// Source of a move.
    pub fn source(&self) -> Option<&MachineOperand> {
        if self.is_move() {
            self.operands.get(1)
        } else {
            None
        }
    }

    /// Registers written through explicit or hidden operands.
    pub fn written_registers(&self) -> Vec<AsmReg> {
        self.operands
            .iter()
            .filter(|operand| operand.writes())
            .filter_map(|operand| operand.value.register())
            .collect()
    }

    /// Registers read as values or to form addresses.
    pub fn read_registers(&self) -> Vec<AsmReg> {
        let mut registers = Vec::new();
        for operand in &self.operands {
            if operand.reads() {
                registers.extend(operand.value.register());
            }
            registers.extend(operand.value.address_registers());
        }
        registers
    }

    pub fn reads_register(&self, reg: AsmReg) -> bool {
        self.read_registers().contains(&reg)
    }

    pub fn writes_register(&self, reg: AsmReg) -> bool {
        self.written_registers().contains(&reg)
    }

    pub fn mentions(&self, reg: AsmReg) -> bool {
        self.operands.iter().any(|operand| operand.value.mentions(reg))
    }

    /// Memory locations written by the instruction.
    pub fn written_memory(&self) -> Vec<&Operand> {
        self.operands
            .iter()
            .filter(|operand| operand.writes() && operand.value.is_memory())
            .map(|operand| &operand.value)
            .collect()
    }

    /// Memory locations read by the instruction.
    pub fn read_memory(&self) -> Vec<&Operand> {
        self.operands
            .iter()
            .filter(|operand| operand.reads() && operand.value.is_memory())
            .map(|operand| &operand.value)
            .collect()
    }

    pub fn writes_flags(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Compare
                | Opcode::Arithmetic(_)
                | Opcode::Shift { .. }
                | Opcode::Divide { .. }
                | Opcode::Negate
                | Opcode::Call { .. }
        )
    }

    pub fn reads_flags(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::SetCondition(_) | Opcode::Jump { condition: Some(_), .. }
        )
    }

    /// Human readable form used in logs and test failures.
    pub fn render(&self, registers: &RegisterFile) -> String {
        let mut text = match &self.opcode {
            Opcode::Label(label) => return format!(".L{}:", label.0),
            Opcode::Jump { label, condition } => match condition {
                Some(condition) => format!("j{} .L{}", condition_suffix(condition), label.0),
                None => format!("jmp .L{}", label.0),
            },
            Opcode::TailJump(function) => format!("jmp {function}"),
            Opcode::Compare => "cmp".to_string(),
            Opcode::SetCondition(condition) => format!("set{}", condition_suffix(condition)),
            Opcode::Move => "mov".to_string(),
            Opcode::Arithmetic(operator) => match operator {
                ArithmeticOperator::Add => "add",
                ArithmeticOperator::Subtract => "sub",
                ArithmeticOperator::Multiply => "mul",
                ArithmeticOperator::And => "and",
                ArithmeticOperator::Or => "or",
                ArithmeticOperator::Xor => "xor",
            }
            .to_string(),
            Opcode::Shift { direction, unsigned } => match (direction, unsigned) {
                (ShiftDirection::Left, _) => "shl",
                (ShiftDirection::Right, true) => "shr",
                (ShiftDirection::Right, false) => "sar",
            }
            .to_string(),
            Opcode::Divide { remainder, unsigned } => {
                let base = if *remainder { "rem" } else { "div" };
                if *unsigned {
                    format!("u{base}")
                } else {
                    base.to_string()
                }
            }
            Opcode::ExtendNumerator => {
                let size = self.operands.first().map_or(Size::Qword, MachineOperand::size);
                match size {
                    Size::Byte => "cbw",
                    Size::Word => "cwd",
                    Size::Dword => "cdq",
                    Size::Qword => "cqo",
                }
                .to_string()
            }
            Opcode::MultiplySubtract => "msub".to_string(),
            Opcode::Negate => "neg".to_string(),
            Opcode::Call { function, .. } => format!("call {function}"),
            Opcode::Return => "ret".to_string(),
            Opcode::Epilogue => "epilogue".to_string(),
            Opcode::StorePair => "stp".to_string(),
            Opcode::LoadPair => "ldp".to_string(),
        };

        let visible: Vec<String> = self
            .operands
            .iter()
            .filter(|operand| !operand.is_hidden())
            .map(|operand| render_operand(&operand.value, operand.size(), registers))
            .collect();
        if !visible.is_empty() {
            let _ = write!(text, " {}", visible.join(", "));
        }
        text
    }
}

fn condition_suffix(condition: &Condition) -> &'static str {
    match (condition.operator, condition.unsigned) {
        (ComparisonOperator::Equal, _) => "e",
        (ComparisonOperator::NotEqual, _) => "ne",
        (ComparisonOperator::Less, false) => "l",
        (ComparisonOperator::LessOrEqual, false) => "le",
        (ComparisonOperator::Greater, false) => "g",
        (ComparisonOperator::GreaterOrEqual, false) => "ge",
        (ComparisonOperator::Less, true) => "b",
        (ComparisonOperator::LessOrEqual, true) => "be",
        (ComparisonOperator::Greater, true) => "a",
        (ComparisonOperator::GreaterOrEqual, true) => "ae",
    }
}

fn register_name(reg: AsmReg, size: Size, registers: &RegisterFile) -> String {
    registers
        .get(reg)
        .map(|register| register.name(size).to_string())
        .unwrap_or_else(|| format!("r{}:{}", reg.bank, reg.id))
}

fn render_memory(memory: &MemoryOperand, registers: &RegisterFile) -> String {
    let mut text = format!("[{}", register_name(memory.base, Size::Qword, registers));
    if let Some(index) = memory.index {
        let _ = write!(text, " + {}*{}", register_name(index, Size::Qword, registers), memory.stride);
    }
    match memory.offset {
        0 => {}
        offset if offset < 0 => {
            let _ = write!(text, " - {}", -offset);
        }
        offset => {
            let _ = write!(text, " + {offset}");
        }
    }
    text.push(']');
    text
}

fn render_operand(operand: &Operand, size: Size, registers: &RegisterFile) -> String {
    match operand {
        Operand::None => "_".to_string(),
        Operand::Register(reg) | Operand::MediaRegister(reg) => register_name(*reg, size, registers),
        Operand::Constant(constant) => match constant {
            crate::core::value::Constant::Integer(value) => value.to_string(),
            crate::core::value::Constant::Decimal(value) => format!("{value:?}"),
        },
        Operand::Memory(memory) => render_memory(memory, registers),
        Operand::Data { symbol, offset, address } => {
            let prefix = if *address { "&" } else { "" };
            if *offset == 0 {
                format!("{prefix}[{symbol}]")
            } else {
                format!("{prefix}[{symbol} + {offset}]")
            }
        }
        Operand::Expression {
            multiplicand,
            multiplier,
            addition,
            constant,
        } => {
            let mut text = format!("[{}*{multiplier}", register_name(*multiplicand, Size::Qword, registers));
            if let Some(addition) = addition {
                let _ = write!(text, " + {}", register_name(*addition, Size::Qword, registers));
            }
            if *constant != 0 {
                let _ = write!(text, " + {constant}");
            }
            text.push(']');
            text
        }
        Operand::Modifier(crate::core::value::Modifier::ShiftLeft(amount)) => format!("lsl #{amount}"),
    }
}
