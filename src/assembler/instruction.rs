// This module defines build-time instructions. Lowering appends one Instruction per emitted
// operation with its kind, the Result it produces, its InstructionParameters and any extra
// dependencies that only need to be kept alive. A parameter names the Result it operates on,
// the width it needs, the handle kinds it accepts in order of preference, an optional
// immediate bit limit and a flag set describing its role: destination or source, whether it
// reads or writes, whether it may be overwritten without protection, and which bookkeeping
// side effects apply once the instruction is built (attaching registers, relocating values).
// Hidden parameters are implicit operands of the machine instruction, such as the dividend
// register of an x86-64 division or the argument registers of a call; they are kept so that
// liveness and the peephole optimizer see every register an instruction touches.

//! Build-time instructions and their parameters.

use crate::core::results::ResultId;
use crate::core::value::{Constant, HandleKind, Operand, Size, Symbol};
use crate::flow::graph::LabelId;
use crate::flow::tree::{ComparisonOperator, VariableId};
use std::ops::BitOr;

/// Stable identifier of an instruction, unaffected by insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(pub u32);

/// Identifier of a scope in the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    NotBuilt,
    Building,
    Built,
}

/// Role and side effects of an instruction parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ParameterFlags(u16);

impl ParameterFlags {
    pub const NONE: Self = Self(0);
    pub const DESTINATION: Self = Self(1);
    pub const SOURCE: Self = Self(1 << 1);
    pub const WRITES: Self = Self(1 << 2);
    pub const READS: Self = Self(1 << 3);
    /// The destination may be overwritten even if its value is still needed.
    pub const WRITE_ACCESS: Self = Self(1 << 4);
    /// The parameter was placed before the build and must stay where it is.
    pub const LOCKED: Self = Self(1 << 5);
    /// The instruction result takes over this destination's location.
    pub const ATTACH_TO_DESTINATION: Self = Self(1 << 6);
    /// The register keeps pointing at the parameter's own Result.
    pub const ATTACH_TO_SOURCE: Self = Self(1 << 7);
    /// The source Result moves to the destination's location.
    pub const RELOCATE_TO_DESTINATION: Self = Self(1 << 8);
    /// The destination Result adopts the source's location when the source dies here.
    pub const RELOCATE_TO_SOURCE: Self = Self(1 << 9);
    /// Implicit operand, not encoded explicitly.
    pub const HIDDEN: Self = Self(1 << 10);
    /// No register bookkeeping after the build.
    pub const NO_ATTACH: Self = Self(1 << 11);
    /// Address expressions are accepted as they are.
    pub const ALLOW_ADDRESS: Self = Self(1 << 12);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for ParameterFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstructionParameter {
    pub result: ResultId,
    /// Location captured when the instruction was built.
    pub operand: Operand,
    pub size: Size,
    /// Accepted handle kinds, most preferred first.
    pub types: Vec<HandleKind>,
    pub flags: ParameterFlags,
    /// Maximum signed width of an immediate.
    pub bit_limit: Option<u32>,
}

impl InstructionParameter {
    pub fn new(result: ResultId, size: Size, types: Vec<HandleKind>, flags: ParameterFlags) -> Self {
        Self {
            result,
            operand: Operand::None,
            size,
            types,
            flags,
            bit_limit: None,
        }
    }

    /// Pure write of a fresh value.
    pub fn destination(result: ResultId, size: Size, types: Vec<HandleKind>) -> Self {
        Self::new(
            result,
            size,
            types,
            ParameterFlags::DESTINATION
                | ParameterFlags::WRITES
                | ParameterFlags::WRITE_ACCESS
                | ParameterFlags::ATTACH_TO_DESTINATION,
        )
    }

    /// Operand that is read and overwritten with the instruction result.
    pub fn modify(result: ResultId, size: Size, types: Vec<HandleKind>) -> Self {
        Self::new(
            result,
            size,
            types,
            ParameterFlags::DESTINATION
                | ParameterFlags::SOURCE
                | ParameterFlags::READS
                | ParameterFlags::WRITES
                | ParameterFlags::ATTACH_TO_DESTINATION,
        )
    }

    pub fn source(result: ResultId, size: Size, types: Vec<HandleKind>) -> Self {
        Self::new(
            result,
            size,
            types,
            ParameterFlags::SOURCE | ParameterFlags::READS | ParameterFlags::ATTACH_TO_SOURCE,
        )
    }

    pub fn with(mut self, flags: ParameterFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    pub fn limit(mut self, bits: u32) -> Self {
        self.bit_limit = Some(bits);
        self
    }

    pub fn is_destination(&self) -> bool {
        self.flags.contains(ParameterFlags::DESTINATION)
    }

    pub fn is_source(&self) -> bool {
        self.flags.contains(ParameterFlags::SOURCE)
    }

    pub fn accepts(&self, kind: HandleKind) -> bool {
        self.types.contains(&kind)
    }

    /// Whether a constant can be used as an immediate of this parameter.
    pub fn fits(&self, constant: &Constant) -> bool {
        match constant {
            Constant::Decimal(_) => false,
            Constant::Integer(value) => self.bit_limit.map_or(true, |limit| signed_width(*value) <= limit),
        }
    }
}

/// Minimal two's complement width of a value.
fn signed_width(value: i64) -> u32 {
    let magnitude = if value < 0 { !value } else { value };
    65 - magnitude.leading_zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    /// The source keeps its location.
    Copy,
    /// The source now lives at the destination.
    Relocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOperator {
    Add,
    Subtract,
    Multiply,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftDirection {
    Left,
    Right,
}

/// Condition evaluated from the flags of the last comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Condition {
    pub operator: ComparisonOperator,
    pub unsigned: bool,
}

impl Condition {
    pub fn negate(self) -> Self {
        Self {
            operator: self.operator.negate(),
            unsigned: self.unsigned,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    /// Binds incoming parameters to their calling convention locations.
    Initialize { parameters: Vec<(VariableId, ResultId)> },
    Label { label: LabelId, region: Option<ScopeId> },
    Jump { label: LabelId, condition: Option<Condition> },
    Compare,
    SetCondition { condition: Condition },
    Move { kind: MoveKind },
    Arithmetic(ArithmeticOperator),
    Shift { direction: ShiftDirection, unsigned: bool },
    Division { remainder: bool, unsigned: bool },
    /// Sign-extends the x86-64 dividend into the high half of the numerator pair.
    ExtendNumerator,
    /// `destination = minuend - multiplicand * multiplier`.
    MultiplySubtract,
    Negate,
    Call { function: Symbol, arguments: Vec<ResultId> },
    Return { value: Option<ResultId> },
    SetVariable { variable: VariableId, value: ResultId },
    EnterScope { scope: ScopeId },
    /// Moves the current values of a region's actives into its snapshot.
    MergeScope { scope: ScopeId, sources: Vec<(VariableId, ResultId)> },
    ExitScope { scope: ScopeId },
}

impl InstructionKind {
    pub fn name(&self) -> &'static str {
        match self {
            InstructionKind::Initialize { .. } => "initialize",
            InstructionKind::Label { .. } => "label",
            InstructionKind::Jump { .. } => "jump",
            InstructionKind::Compare => "compare",
            InstructionKind::SetCondition { .. } => "set-condition",
            InstructionKind::Move { .. } => "move",
            InstructionKind::Arithmetic(_) => "arithmetic",
            InstructionKind::Shift { .. } => "shift",
            InstructionKind::Division { .. } => "division",
            InstructionKind::ExtendNumerator => "extend-numerator",
            InstructionKind::MultiplySubtract => "multiply-subtract",
            InstructionKind::Negate => "negate",
            InstructionKind::Call { .. } => "call",
            InstructionKind::Return { .. } => "return",
            InstructionKind::SetVariable { .. } => "set-variable",
            InstructionKind::EnterScope { .. } => "enter-scope",
            InstructionKind::MergeScope { .. } => "merge-scope",
            InstructionKind::ExitScope { .. } => "exit-scope",
        }
    }

    /// Results referenced by the kind itself.
    fn operands(&self) -> Vec<ResultId> {
        match self {
            InstructionKind::Initialize { parameters } => {
                parameters.iter().map(|&(_, result)| result).collect()
            }
            InstructionKind::Call { arguments, .. } => arguments.clone(),
            InstructionKind::Return { value } => value.iter().copied().collect(),
            InstructionKind::SetVariable { value, .. } => vec![*value],
            InstructionKind::MergeScope { sources, .. } => {
                sources.iter().map(|&(_, result)| result).collect()
            }
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: InstructionId,
    pub kind: InstructionKind,
    pub result: Option<ResultId>,
    pub parameters: Vec<InstructionParameter>,
    /// Results kept alive up to this instruction.
    pub dependencies: Vec<ResultId>,
    pub state: BuildState,
    pub scope: ScopeId,
    pub position: usize,
}

impl Instruction {
    pub fn new(id: InstructionId, kind: InstructionKind, scope: ScopeId) -> Self {
        Self {
            id,
            kind,
            result: None,
            parameters: Vec::new(),
            dependencies: Vec::new(),
            state: BuildState::NotBuilt,
            scope,
            position: 0,
        }
    }

    /// Every Result this instruction touches.
    pub fn uses(&self) -> Vec<ResultId> {
        let mut uses: Vec<ResultId> = self.parameters.iter().map(|p| p.result).collect();
        uses.extend(self.result);
        uses.extend(self.dependencies.iter().copied());
        uses.extend(self.kind.operands());
        uses
    }

    pub fn is_built(&self) -> bool {
        self.state == BuildState::Built
    }
}
