// This module holds the infrastructure shared by every phase and both targets: the value
// model (sizes, formats, constants, handles and concrete operands), the Result table with
// its lifetimes, hints and connection sets, the register pool, the stack frame layout, the
// calling convention interface, the compilation session with its arena and statistics, and
// the error type. Nothing here knows about a particular instruction set; the x64 and arm64
// modules fill in register tables and calling conventions through these types.

//! Core back end infrastructure
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Compilation statistics
//!
//! ## Register Pool (`register_file`)
//! - Register table with volatile, reserved and return classifications
//! - Attached values, locks and written callee-saved tracking
//!
//! ## Value Model (`value`, `results`)
//! - Handles describing where a value lives
//! - Results with lifetimes, allocation hints and connection sets
//!
//! ## Frame and Calling Conventions (`frame`, `calling_convention`)
//! - Variable, spill, parameter and outgoing argument slots
//! - Argument and return value assignment

pub mod calling_convention;
pub mod error;
pub mod frame;
pub mod register_file;
pub mod results;
pub mod session;
pub mod value;

pub use calling_convention::{assign_all, ArgClass, CCAssigner, CCAssignment, CCInfo};
pub use error::{CompileError, CompileResult};
pub use frame::FunctionFrame;
pub use register_file::{AsmReg, RegBitSet, Register, RegisterFile, RegisterFlags};
pub use results::{Hint, Lifetime, ResultId, ResultTable};
pub use session::{CompilationSession, SessionStats};
pub use value::{Constant, Format, Handle, HandleKind, MemoryOperand, Operand, Size, SlotKind, StackSlot, Symbol};
