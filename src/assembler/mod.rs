// This module groups the instruction-level half of the back end. Lowering turns a linearized
// function into unbuilt instructions whose parameters say which locations each operand may
// take. The usage simulation leaves register hints on the Results. The build then walks the
// instructions in order, placing every operand, inserting the moves and spills it needs and
// keeping the register pool and scopes consistent at merge points. The finished list is
// converted into machine instructions for the peephole optimizer.

//! Instruction lowering, register usage simulation and instruction building.

pub mod build;
pub mod instruction;
pub mod lower;
pub mod machine;
pub mod memory;
pub mod oracle;
pub mod scope;
pub mod unit;

pub use instruction::{
    ArithmeticOperator, Condition, Instruction, InstructionId, InstructionKind, InstructionParameter,
    MoveKind, ParameterFlags, ScopeId, ShiftDirection,
};
pub use lower::Lowering;
pub use machine::{MachineInstruction, MachineOperand, Opcode};
pub use oracle::channel;
pub use scope::Scope;
pub use unit::Unit;
