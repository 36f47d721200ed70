//! codeflow - linear code generation for an ahead-of-time compiler.
//!
//! codeflow takes a type-checked function tree, flattens its structured control flow into
//! an ordered sequence of nodes, labels and jumps, and emits machine instructions for
//! x86-64 (System V) or AArch64 (AAPCS64) in a single forward pass with on-the-fly register
//! allocation. A peephole pass cleans up the result.
//!
//! # Primary Usage
//!
//! ```ignore
//! use codeflow::{CompilationSession, CompileOptions, FunctionCompiler, Target};
//! use bumpalo::Bump;
//!
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let options = CompileOptions::default().with_target(Target::Arm64);
//! let compiled = FunctionCompiler::new(&session, options).compile(&function)?;
//! for line in compiled.listing(Target::Arm64) {
//!     println!("{line}");
//! }
//! ```
//!
//! # Architecture
//!
//! - [`flow`] - function trees, the linearized flow graph and its queries
//! - [`core`] - shared infrastructure (session, registers, values, frames)
//! - [`assembler`] - lowering, register usage simulation and instruction building
//! - [`optimizer`] - peephole optimization of finalized instructions
//! - [`x64`], [`arm64`] - register tables and calling conventions
//! - [`compiler`] - the per-function driver

pub mod arm64;
pub mod assembler;
pub mod compiler;
pub mod core;
pub mod flow;
pub mod optimizer;
pub mod target;
pub mod x64;

pub use assembler::{MachineInstruction, MachineOperand, Opcode};
pub use compiler::{CompileOptions, CompiledFunction, FunctionCompiler};
pub use core::{AsmReg, CompilationSession, CompileError, CompileResult, Format, SessionStats};
pub use flow::{Flow, Function, ModifiableFlow, Tree};
pub use optimizer::{OptimizationReport, Optimizer};
pub use target::Target;
