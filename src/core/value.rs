// This module defines the storage-independent value model shared by every phase of the back
// end. Format and Size describe the width and interpretation of a value, Constant holds
// integer and decimal literals, and Handle is the symbolic description of where a value
// currently lives: a standard or media register, a frame slot, base relative or indexed
// memory, a constant, a data section entry, an address expression or an operand modifier.
// Handles that refer to other values (memory bases, indices, expression terms) do so through
// ResultId so that relocating the referenced value is seen by every handle that uses it.
// Operand is the finalized, concrete counterpart of a Handle in which every nested value has
// been replaced by its physical register; it is what the emission layer encodes and what the
// peephole optimizer inspects. HandleKind classifies both forms for preference lists.

//! Handles, operands and formats.

use crate::core::register_file::AsmReg;
use crate::core::results::ResultId;
use crate::flow::tree::VariableId;
use std::fmt;
use std::sync::Arc;

/// Width of a value in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Size {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

impl Size {
    pub fn bytes(self) -> u32 {
        self as u32
    }

    pub fn bits(self) -> u32 {
        self.bytes() * 8
    }

    pub fn from_bytes(bytes: u32) -> Option<Size> {
        match bytes {
            1 => Some(Size::Byte),
            2 => Some(Size::Word),
            4 => Some(Size::Dword),
            8 => Some(Size::Qword),
            _ => None,
        }
    }
}

/// Interpretation of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    Decimal,
}

impl Format {
    pub fn size(self) -> Size {
        match self {
            Format::I8 | Format::U8 => Size::Byte,
            Format::I16 | Format::U16 => Size::Word,
            Format::I32 | Format::U32 => Size::Dword,
            Format::I64 | Format::U64 | Format::Decimal => Size::Qword,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Format::U8 | Format::U16 | Format::U32 | Format::U64)
    }

    pub fn is_decimal(self) -> bool {
        self == Format::Decimal
    }

    /// Integer format of the given size and signedness.
    pub fn integer(size: Size, unsigned: bool) -> Format {
        match (size, unsigned) {
            (Size::Byte, false) => Format::I8,
            (Size::Byte, true) => Format::U8,
            (Size::Word, false) => Format::I16,
            (Size::Word, true) => Format::U16,
            (Size::Dword, false) => Format::I32,
            (Size::Dword, true) => Format::U32,
            (Size::Qword, false) => Format::I64,
            (Size::Qword, true) => Format::U64,
        }
    }
}

/// Literal value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Integer(i64),
    Decimal(f64),
}

impl Constant {
    /// Number of bits needed to encode the constant as a signed immediate.
    pub fn bits(&self) -> u32 {
        match *self {
            Constant::Integer(value) => {
                if i8::try_from(value).is_ok() {
                    8
                } else if i16::try_from(value).is_ok() {
                    16
                } else if i32::try_from(value).is_ok() {
                    32
                } else {
                    64
                }
            }
            Constant::Decimal(_) => 64,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match *self {
            Constant::Integer(value) => Some(value),
            Constant::Decimal(_) => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            Constant::Integer(value) => value == 0,
            Constant::Decimal(value) => value.to_bits() == 0,
        }
    }

    /// Raw bit pattern, used to name constant pool entries.
    pub fn to_bits(&self) -> u64 {
        match *self {
            Constant::Integer(value) => value as u64,
            Constant::Decimal(value) => value.to_bits(),
        }
    }
}

/// Name of a function or data section entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(name: &str) -> Self {
        Symbol::new(name)
    }
}

/// Operand modifier, such as the shift applied to an AArch64 index register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modifier {
    ShiftLeft(u8),
}

/// What a frame slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Canonical memory location of a variable.
    Variable(VariableId),
    /// Spill slot for a value that is no variable's current value.
    Temporary,
    /// Parameter passed on the stack by the caller.
    Parameter,
    /// Outgoing argument area, addressed from the stack pointer.
    Outgoing,
}

/// Frame relative memory location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StackSlot {
    pub kind: SlotKind,
    pub offset: i32,
}

/// Symbolic location of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Handle {
    None,
    Register(AsmReg),
    MediaRegister(AsmReg),
    Constant(Constant),
    Stack(StackSlot),
    Memory {
        base: ResultId,
        offset: i64,
    },
    ComplexMemory {
        base: ResultId,
        index: ResultId,
        stride: u8,
        offset: i64,
    },
    DataSection {
        symbol: Symbol,
        offset: i64,
        address: bool,
    },
    Expression {
        multiplicand: ResultId,
        multiplier: i64,
        addition: Option<ResultId>,
        constant: i64,
    },
    Modifier(Modifier),
}

/// Kind of a handle or operand, used for preference lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    None,
    Register,
    MediaRegister,
    Memory,
    Constant,
    Expression,
    Modifier,
}

impl Handle {
    pub fn kind(&self) -> HandleKind {
        match self {
            Handle::None => HandleKind::None,
            Handle::Register(_) => HandleKind::Register,
            Handle::MediaRegister(_) => HandleKind::MediaRegister,
            Handle::Constant(_) => HandleKind::Constant,
            Handle::Stack(_)
            | Handle::Memory { .. }
            | Handle::ComplexMemory { .. }
            | Handle::DataSection { .. } => HandleKind::Memory,
            Handle::Expression { .. } => HandleKind::Expression,
            Handle::Modifier(_) => HandleKind::Modifier,
        }
    }

    /// Results this handle structurally depends on.
    pub fn dependencies(&self) -> Vec<ResultId> {
        match self {
            Handle::Memory { base, .. } => vec![*base],
            Handle::ComplexMemory { base, index, .. } => vec![*base, *index],
            Handle::Expression {
                multiplicand,
                addition,
                ..
            } => {
                let mut dependencies = vec![*multiplicand];
                dependencies.extend(addition.iter().copied());
                dependencies
            }
            _ => Vec::new(),
        }
    }

    /// Register of a standard or media register handle.
    pub fn register(&self) -> Option<AsmReg> {
        match self {
            Handle::Register(reg) | Handle::MediaRegister(reg) => Some(*reg),
            _ => None,
        }
    }

    pub fn is_register(&self) -> bool {
        self.register().is_some()
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Handle::Constant(_))
    }
}

/// Concrete memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryOperand {
    pub base: AsmReg,
    pub index: Option<AsmReg>,
    pub stride: u8,
    pub offset: i64,
}

impl MemoryOperand {
    pub fn new(base: AsmReg, offset: i64) -> Self {
        Self {
            base,
            index: None,
            stride: 1,
            offset,
        }
    }

    pub fn registers(&self) -> impl Iterator<Item = AsmReg> {
        std::iter::once(self.base).chain(self.index)
    }
}

/// Finalized operand ready for encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    None,
    Register(AsmReg),
    MediaRegister(AsmReg),
    Constant(Constant),
    Memory(MemoryOperand),
    Data {
        symbol: Symbol,
        offset: i64,
        address: bool,
    },
    Expression {
        multiplicand: AsmReg,
        multiplier: i64,
        addition: Option<AsmReg>,
        constant: i64,
    },
    Modifier(Modifier),
}

impl Operand {
    pub fn kind(&self) -> HandleKind {
        match self {
            Operand::None => HandleKind::None,
            Operand::Register(_) => HandleKind::Register,
            Operand::MediaRegister(_) => HandleKind::MediaRegister,
            Operand::Constant(_) => HandleKind::Constant,
            Operand::Memory(_) | Operand::Data { .. } => HandleKind::Memory,
            Operand::Expression { .. } => HandleKind::Expression,
            Operand::Modifier(_) => HandleKind::Modifier,
        }
    }

    pub fn register(&self) -> Option<AsmReg> {
        match self {
            Operand::Register(reg) | Operand::MediaRegister(reg) => Some(*reg),
            _ => None,
        }
    }

    pub fn is_memory(&self) -> bool {
        self.kind() == HandleKind::Memory
    }

    /// Registers read to compute an address or expression.
    pub fn address_registers(&self) -> Vec<AsmReg> {
        match self {
            Operand::Memory(memory) => memory.registers().collect(),
            Operand::Expression {
                multiplicand,
                addition,
                ..
            } => std::iter::once(*multiplicand).chain(*addition).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the operand mentions the register in any position.
    pub fn mentions(&self, reg: AsmReg) -> bool {
        self.register() == Some(reg) || self.address_registers().contains(&reg)
    }

    /// Replaces every mention of `from` with `to`.
    pub fn substitute(&mut self, from: AsmReg, to: AsmReg) {
        let swap = |reg: &mut AsmReg| {
            if *reg == from {
                *reg = to;
            }
        };
        match self {
            Operand::Register(reg) | Operand::MediaRegister(reg) => swap(reg),
            Operand::Memory(memory) => {
                swap(&mut memory.base);
                if let Some(index) = memory.index.as_mut() {
                    swap(index);
                }
            }
            Operand::Expression {
                multiplicand,
                addition,
                ..
            } => {
                swap(multiplicand);
                if let Some(addition) = addition.as_mut() {
                    swap(addition);
                }
            }
            _ => {}
        }
    }
}
