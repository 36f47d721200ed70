// This module manages the stack frame of the function being compiled. FunctionFrame lives in
// the session arena and records the callee-saved registers the body writes, the canonical
// memory slot of every variable that was ever spilled or lives in memory (debug mode), the
// temporary spill slots created when a register holding an anonymous value must be freed, and
// the size of the outgoing argument area needed by calls with stack arguments. Slots are
// addressed from the frame pointer: locals grow downwards from it, incoming stack parameters
// sit above the saved frame pointer and return address, and outgoing arguments are addressed
// from the stack pointer. The final frame size is aligned to 16 bytes as both supported ABIs
// require.

//! Stack frame layout.

use crate::core::register_file::AsmReg;
use crate::core::value::{SlotKind, StackSlot};
use crate::flow::tree::VariableId;
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Offset of the first incoming stack parameter from the frame pointer.
pub const PARAMETER_AREA_OFFSET: i32 = 16;

/// Function stack frame.
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Callee-saved registers that need to be preserved.
    pub saved_registers: BumpVec<'a, AsmReg>,
    /// Canonical slots of variables.
    pub variable_slots: BumpVec<'a, (VariableId, StackSlot)>,
    /// Temporary spill slots.
    pub spill_slots: BumpVec<'a, StackSlot>,
    /// Current local offset below the frame pointer.
    local_offset: i32,
    /// Bytes of outgoing stack arguments needed by the largest call.
    pub outgoing_size: u32,
    /// Total size of the stack frame.
    pub frame_size: u32,
}

impl<'a> FunctionFrame<'a> {
    pub fn new(arena: &'a Bump) -> Self {
        Self {
            saved_registers: BumpVec::new_in(arena),
            variable_slots: BumpVec::new_in(arena),
            spill_slots: BumpVec::new_in(arena),
            local_offset: 0,
            outgoing_size: 0,
            frame_size: 0,
        }
    }

    pub fn add_saved_register(&mut self, reg: AsmReg) {
        if !self.saved_registers.contains(&reg) {
            self.saved_registers.push(reg);
        }
    }

    fn allocate_local(&mut self, size: u32) -> i32 {
        let aligned_size = size.max(1).div_ceil(8) * 8;
        self.local_offset -= aligned_size as i32;
        self.local_offset
    }

    /// Canonical slot of a variable, allocated on first request.
    pub fn variable_slot(&mut self, variable: VariableId, size: u32) -> StackSlot {
        if let Some((_, slot)) = self.variable_slots.iter().find(|(owner, _)| *owner == variable) {
            return *slot;
        }
        let slot = StackSlot {
            kind: SlotKind::Variable(variable),
            offset: self.allocate_local(size),
        };
        self.variable_slots.push((variable, slot));
        slot
    }

    /// Fresh temporary spill slot.
    pub fn allocate_temporary(&mut self, size: u32) -> StackSlot {
        let slot = StackSlot {
            kind: SlotKind::Temporary,
            offset: self.allocate_local(size),
        };
        self.spill_slots.push(slot);
        slot
    }

    /// Slot of an incoming stack parameter at the given argument area offset.
    pub fn parameter_slot(&self, stack_offset: i32) -> StackSlot {
        StackSlot {
            kind: SlotKind::Parameter,
            offset: PARAMETER_AREA_OFFSET + stack_offset,
        }
    }

    /// Slot of an outgoing stack argument, relative to the stack pointer.
    pub fn outgoing_slot(&mut self, stack_offset: i32, size: u32) -> StackSlot {
        let end = stack_offset.max(0) as u32 + size.div_ceil(8) * 8;
        self.outgoing_size = self.outgoing_size.max(end);
        StackSlot {
            kind: SlotKind::Outgoing,
            offset: stack_offset,
        }
    }

    /// Bytes used by locals and spill slots.
    pub fn locals_size(&self) -> u32 {
        (-self.local_offset) as u32
    }

    /// Calculate the final frame size.
    pub fn calculate_frame_size(&mut self) -> u32 {
        // Frame layout:
        // fp + 16:  incoming stack parameters
        // fp + 8:   return address
        // fp:       saved frame pointer
        // fp - X:   variables and spill slots
        // below:    callee-saved registers, then outgoing arguments at sp
        let saved_size = self.saved_registers.len() as u32 * 8;
        let total_size = self.locals_size() + saved_size + self.outgoing_size;
        self.frame_size = total_size.div_ceil(16) * 16;
        self.frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_frame_slot_allocation() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena);

        let slot1 = frame.allocate_temporary(8);
        let slot2 = frame.allocate_temporary(4);
        let slot3 = frame.allocate_temporary(16);

        assert!(slot1.offset > slot2.offset);
        assert!(slot2.offset > slot3.offset);
        assert_eq!(slot2.offset % 8, 0);
        assert_eq!(frame.locals_size(), 32);
    }

    #[test]
    fn test_variable_slots_are_canonical() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena);

        let x = frame.variable_slot(VariableId(0), 8);
        let y = frame.variable_slot(VariableId(1), 4);
        assert_eq!(frame.variable_slot(VariableId(0), 8), x);
        assert_ne!(x.offset, y.offset);
        assert_eq!(x.kind, SlotKind::Variable(VariableId(0)));
    }

    #[test]
    fn test_frame_size_is_aligned() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena);

        frame.allocate_temporary(8);
        frame.add_saved_register(AsmReg::standard(3));
        frame.add_saved_register(AsmReg::standard(3));
        frame.outgoing_slot(0, 8);

        assert_eq!(frame.saved_registers.len(), 1);
        assert_eq!(frame.calculate_frame_size(), 32);
        assert_eq!(frame.parameter_slot(8).offset, 24);
    }
}
