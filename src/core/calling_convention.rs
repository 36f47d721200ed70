// This module defines the target-independent side of calling conventions. CCAssignment
// describes one argument or return value (its register class, size and alignment) and
// receives either a register or an offset into the stack argument area. CCAssigner is the
// trait each target implements: arguments are assigned in order, standard and media values
// consume their own register sequences, and whatever does not fit is placed on the stack with
// 8-byte slots. CCInfo summarizes the registers a convention passes arguments in and the
// registers a callee must preserve; the register-usage simulator and the call builder use the
// same assigner so that hints and actual placement always agree.

//! Calling convention infrastructure shared by all targets.

use crate::core::register_file::{AsmReg, RegBitSet};
use crate::core::value::Format;

/// Register class an argument is passed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgClass {
    Standard,
    Media,
}

impl ArgClass {
    pub fn of(format: Format) -> Self {
        if format.is_decimal() {
            ArgClass::Media
        } else {
            ArgClass::Standard
        }
    }
}

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    pub class: ArgClass,
    /// Size of the argument in bytes.
    pub size: u32,
    /// Required alignment in bytes.
    pub align: u32,
    /// Assigned register (if any).
    pub reg: Option<AsmReg>,
    /// Offset in the stack argument area (if assigned to stack).
    pub stack_off: Option<i32>,
}

impl CCAssignment {
    pub fn new(class: ArgClass, size: u32, align: u32) -> Self {
        Self {
            class,
            size,
            align,
            reg: None,
            stack_off: None,
        }
    }

    /// Assignment request for a value of the given format.
    pub fn for_format(format: Format) -> Self {
        let size = format.size().bytes();
        Self::new(ArgClass::of(format), size, size)
    }
}

/// Information about a calling convention.
#[derive(Debug, Clone)]
pub struct CCInfo {
    /// Registers that must be preserved by callee.
    pub callee_saved_regs: RegBitSet,
    /// Registers used for argument passing.
    pub arg_regs: RegBitSet,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    fn get_ccinfo(&self) -> &CCInfo;

    /// Assign the next argument.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Assign a return value.
    fn assign_ret(&mut self, arg: &mut CCAssignment);

    /// Reset state for a new call or function.
    fn reset(&mut self);

    /// Total stack space needed for the arguments assigned so far.
    fn get_stack_size(&self) -> u32;
}

/// Align a value up to a power of two.
pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

/// Assigns every format in order and returns the assignments.
pub fn assign_all(assigner: &mut dyn CCAssigner, formats: &[Format]) -> Vec<CCAssignment> {
    assigner.reset();
    formats
        .iter()
        .map(|&format| {
            let mut assignment = CCAssignment::for_format(format);
            assigner.assign_arg(&mut assignment);
            assignment
        })
        .collect()
}
