// This module answers the data-flow questions the peephole passes ask about finalized
// instructions. Every instruction is summarized as the locations it reads and writes:
// registers, memory ranges and the condition flags. Calls additionally clobber every
// volatile register and may touch any memory that is not a frame slot of the current
// function; outgoing argument slots addressed from the stack pointer are read by them.
// Two memory operands may alias unless they are provably disjoint: the same base and index
// with non-overlapping ranges, two different frame registers, or two different data symbols.
// Any other base is unknown and aliases everything.

//! Read/write summaries and alias queries over machine instructions.

use crate::assembler::machine::{MachineInstruction, MachineOperand, Opcode};
use crate::core::register_file::{AsmReg, RegisterFile};
use crate::core::value::{MemoryOperand, Operand};

/// Memory range touched by an operand.
#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    pub operand: Operand,
    pub bytes: i64,
}

/// Bytes an operand covers; pair instructions cover two elements.
pub fn access_of(instruction: &MachineInstruction, operand: &MachineOperand) -> Access {
    let element = i64::from(operand.size().bytes());
    let bytes = match instruction.opcode {
        Opcode::StorePair | Opcode::LoadPair => element * 2,
        _ => element,
    };
    Access {
        operand: operand.value.clone(),
        bytes,
    }
}

pub struct Analysis<'r> {
    registers: &'r RegisterFile,
}

impl<'r> Analysis<'r> {
    pub fn new(registers: &'r RegisterFile) -> Self {
        Self { registers }
    }

    pub fn is_frame_register(&self, reg: AsmReg) -> bool {
        Some(reg) == self.registers.base_pointer() || Some(reg) == self.registers.stack_pointer()
    }

    /// Base register of a frame slot, if the operand is one.
    pub fn frame_base(&self, operand: &Operand) -> Option<AsmReg> {
        match operand {
            Operand::Memory(MemoryOperand {
                base, index: None, ..
            }) if self.is_frame_register(*base) => Some(*base),
            _ => None,
        }
    }

    pub fn is_outgoing(&self, operand: &Operand) -> bool {
        self.frame_base(operand).is_some() && self.frame_base(operand) == self.registers.stack_pointer()
    }

    pub fn is_return_register(&self, reg: AsmReg) -> bool {
        Some(reg) == self.registers.return_register(false) || Some(reg) == self.registers.return_register(true)
    }

    pub fn is_volatile(&self, reg: AsmReg) -> bool {
        self.registers.is_volatile(reg)
    }

    /// Whether two memory ranges may overlap.
    pub fn may_alias(&self, a: &Access, b: &Access) -> bool {
        match (&a.operand, &b.operand) {
            (Operand::Memory(left), Operand::Memory(right)) => {
                if left.base == right.base && left.index == right.index && left.stride == right.stride {
                    return overlaps(left.offset, a.bytes, right.offset, b.bytes);
                }
                let frames = self.is_frame_register(left.base)
                    && self.is_frame_register(right.base)
                    && left.index.is_none()
                    && right.index.is_none();
                // Different frame registers address disjoint parts of the frame.
                !(frames && left.base != right.base)
            }
            (
                Operand::Data {
                    symbol: left, offset: lo, ..
                },
                Operand::Data {
                    symbol: right,
                    offset: ro,
                    ..
                },
            ) => left == right && overlaps(*lo, a.bytes, *ro, b.bytes),
            (Operand::Data { .. }, Operand::Memory(memory)) | (Operand::Memory(memory), Operand::Data { .. }) => {
                !self.is_frame_register(memory.base)
            }
            _ => false,
        }
    }

    /// Memory the instruction reads, including what a call may read.
    pub fn reads_memory(&self, instruction: &MachineInstruction, access: &Access) -> bool {
        if instruction.is_call() || matches!(instruction.opcode, Opcode::TailJump(_)) {
            return match self.frame_base(&access.operand) {
                Some(_) => self.is_outgoing(&access.operand),
                None => true,
            };
        }
        instruction
            .operands
            .iter()
            .filter(|operand| operand.reads() && operand.value.is_memory())
            .any(|operand| self.may_alias(&access_of(instruction, operand), access))
    }

    /// Memory the instruction may write, including what a call may write.
    pub fn writes_memory(&self, instruction: &MachineInstruction, access: &Access) -> bool {
        if instruction.is_call() {
            return self.frame_base(&access.operand).is_none();
        }
        instruction
            .operands
            .iter()
            .filter(|operand| operand.writes() && operand.value.is_memory())
            .any(|operand| self.may_alias(&access_of(instruction, operand), access))
    }

    /// Whether the instruction writes exactly the range of `access` or more.
    pub fn covers(&self, instruction: &MachineInstruction, access: &Access) -> bool {
        instruction
            .operands
            .iter()
            .filter(|operand| operand.writes())
            .any(|operand| {
                let written = access_of(instruction, operand);
                match (&written.operand, &access.operand) {
                    (Operand::Memory(w), Operand::Memory(a)) => {
                        w.base == a.base
                            && w.index == a.index
                            && w.stride == a.stride
                            && w.offset <= a.offset
                            && a.offset + access.bytes <= w.offset + written.bytes
                    }
                    _ => false,
                }
            })
    }

    /// Registers the instruction writes, calls clobbering every volatile register.
    pub fn written_registers(&self, instruction: &MachineInstruction) -> Vec<AsmReg> {
        let mut written = instruction.written_registers();
        if instruction.is_call() {
            written.extend(
                self.registers
                    .registers()
                    .iter()
                    .filter(|register| register.is_volatile() && !register.is_reserved())
                    .map(|register| register.reg),
            );
        }
        written
    }

    /// Whether a write of the register replaces its whole previous value.
    pub fn kills(&self, instruction: &MachineInstruction, reg: AsmReg) -> bool {
        if instruction.is_call() {
            return self.is_volatile(reg);
        }
        instruction.operands.iter().any(|operand| {
            operand.writes()
                && operand.value.register() == Some(reg)
                && (reg.is_media() || operand.size().bytes() >= 4)
        })
    }

    /// Whether the register's current value is never read again.
    pub fn register_is_dead(&self, code: &[MachineInstruction], from: usize, reg: AsmReg) -> bool {
        for instruction in code.iter().skip(from) {
            match instruction.opcode {
                Opcode::Label(_) => continue,
                Opcode::Jump { .. } => return false,
                Opcode::Return => return !instruction.reads_register(reg) && !self.is_return_register(reg),
                Opcode::Epilogue if !self.is_volatile(reg) => return true,
                Opcode::TailJump(_) => return !instruction.reads_register(reg),
                _ => {}
            }
            if instruction.reads_register(reg) {
                return false;
            }
            if self.kills(instruction, reg) {
                return true;
            }
        }
        true
    }

    /// Whether a frame slot's current value is never read again.
    pub fn memory_is_dead(&self, code: &[MachineInstruction], from: usize, access: &Access) -> bool {
        if self.frame_base(&access.operand).is_none() {
            return false;
        }
        for instruction in code.iter().skip(from) {
            match instruction.opcode {
                Opcode::Label(_) => continue,
                Opcode::Jump { .. } | Opcode::TailJump(_) => return false,
                Opcode::Return | Opcode::Epilogue => return true,
                _ => {}
            }
            if self.reads_memory(instruction, access) {
                return false;
            }
            if self.covers(instruction, access) {
                return true;
            }
        }
        true
    }
}

fn overlaps(a: i64, a_bytes: i64, b: i64, b_bytes: i64) -> bool {
    a < b + b_bytes && b < a + a_bytes
}
