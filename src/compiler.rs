// This module drives the back end for one function. FunctionCompiler takes a type-checked
// function tree and runs the pipeline in order: linearize the tree into a flow graph, lower
// the flow into unbuilt instructions, run the register usage simulation, build every
// instruction with concrete operands, convert the result into machine instructions and run
// the peephole optimizer when enabled. The callee-saved registers the build wrote are saved
// in the frame before its size is fixed, and the session statistics are updated at the end.
// CompileOptions carries the target, debug mode and whether to optimize.

//! Per-function compilation driver.

use crate::assembler::lower::Lowering;
use crate::assembler::machine::MachineInstruction;
use crate::assembler::oracle::channel;
use crate::assembler::unit::Unit;
use crate::core::error::CompileResult;
use crate::core::frame::FunctionFrame;
use crate::core::register_file::AsmReg;
use crate::core::session::CompilationSession;
use crate::core::value::{Constant, Symbol};
use crate::flow::graph::Flow;
use crate::flow::tree::Function;
use crate::optimizer::Optimizer;
use crate::target::Target;
use log::debug;

/// Options for compiling a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub target: Target,
    /// Keep every variable in its stack slot.
    pub debug: bool,
    pub optimize: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            target: Target::X64,
            debug: false,
            optimize: true,
        }
    }
}

impl CompileOptions {
    pub fn with_target(mut self, target: Target) -> Self {
        self.target = target;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }
}

/// Output of compiling one function.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    pub name: Symbol,
    pub instructions: Vec<MachineInstruction>,
    /// Callee-saved registers the function writes and must preserve.
    pub non_volatile_registers: Vec<AsmReg>,
    pub frame_size: u32,
    /// Constants referenced through the data section.
    pub constants: Vec<(Symbol, Constant)>,
}

impl CompiledFunction {
    /// Instructions rendered one per line.
    pub fn listing(&self, target: Target) -> Vec<String> {
        let registers = target.register_file();
        self.instructions
            .iter()
            .map(|instruction| instruction.render(&registers))
            .collect()
    }
}

pub struct FunctionCompiler<'s, 'arena> {
    session: &'s CompilationSession<'arena>,
    options: CompileOptions,
}

impl<'s, 'arena> FunctionCompiler<'s, 'arena> {
    pub fn new(session: &'s CompilationSession<'arena>, options: CompileOptions) -> Self {
        Self { session, options }
    }

    pub fn options(&self) -> CompileOptions {
        self.options
    }

    pub fn compile(&self, function: &Function) -> CompileResult<CompiledFunction> {
        debug!(
            "compiling {} for {} (debug: {}, optimize: {})",
            function.name, self.options.target, self.options.debug, self.options.optimize
        );

        let flow = Flow::new(function)?;
        let mut unit = Unit::new(
            self.options.target,
            self.options.debug,
            FunctionFrame::new(self.session.arena()),
        );
        Lowering::new(&mut unit, function, &flow).lower()?;
        channel(&mut unit);
        unit.build_all()?;
        let mut instructions = unit.finish()?;

        if self.options.optimize {
            let report = Optimizer::new(self.options.target, &unit.registers).optimize(&mut instructions);
            self.session.record_optimization(report.removed, report.tail_calls);
        }

        let non_volatile_registers: Vec<AsmReg> = unit.registers.written_non_volatile().iter().collect();
        for &reg in &non_volatile_registers {
            unit.frame.add_saved_register(reg);
        }
        let frame_size = unit.frame.calculate_frame_size();

        self.session.record_spills(unit.spills);
        self.session
            .record_function_compiled(function.name.as_str(), instructions.len());
        debug!(
            "compiled {}: {} instructions, frame of {} bytes, {} callee-saved registers",
            function.name,
            instructions.len(),
            frame_size,
            non_volatile_registers.len()
        );

        Ok(CompiledFunction {
            name: function.name.clone(),
            instructions,
            non_volatile_registers,
            frame_size,
            constants: unit.constants.clone(),
        })
    }
}
