// This module turns symbolic handles into concrete operands and keeps memory operands legal.
// Frame slots are addressed from the frame pointer, outgoing argument slots from the stack
// pointer. Memory handles name their base and index through Results, which must sit in
// registers by the time an operand is captured. When an address cannot be encoded directly
// on the target (an AArch64 index combined with an offset, an x86-64 stride that is not a
// power of two up to eight) the address is computed into a register first. Decimal constants
// have no immediate form on either target and are placed in a constant pool entry named
// after their bit pattern.

//! Operand finalization, address legalization and the constant pool.

use crate::assembler::instruction::{InstructionKind, InstructionParameter, MoveKind, ParameterFlags};
use crate::assembler::unit::{move_source_types, Unit};
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::AsmReg;
use crate::core::results::ResultId;
use crate::core::value::{
    Constant, Format, Handle, HandleKind, MemoryOperand, Operand, SlotKind, Size, Symbol,
};

impl<'a> Unit<'a> {
    fn frame_register(&self, kind: SlotKind) -> CompileResult<AsmReg> {
        let reg = match kind {
            SlotKind::Outgoing => self.registers.stack_pointer(),
            _ => self.registers.base_pointer(),
        };
        reg.ok_or_else(|| CompileError::codegen("target has no frame registers"))
    }

    /// Register a nested value lives in.
    fn register_of(&self, result: ResultId) -> CompileResult<AsmReg> {
        match self.results.handle(result) {
            Handle::Register(reg) => Ok(*reg),
            other => Err(CompileError::codegen(format!(
                "address component {result:?} is not in a register: {other:?}"
            ))),
        }
    }

    /// Concrete form of a handle.
    pub(crate) fn operand(&self, handle: &Handle) -> CompileResult<Operand> {
        Ok(match handle {
            Handle::None => Operand::None,
            Handle::Register(reg) => Operand::Register(*reg),
            Handle::MediaRegister(reg) => Operand::MediaRegister(*reg),
            Handle::Constant(constant) => Operand::Constant(*constant),
            Handle::Stack(slot) => Operand::Memory(MemoryOperand::new(
                self.frame_register(slot.kind)?,
                i64::from(slot.offset),
            )),
            Handle::Memory { base, offset } => {
                Operand::Memory(MemoryOperand::new(self.register_of(*base)?, *offset))
            }
            Handle::ComplexMemory {
                base,
                index,
                stride,
                offset,
            } => Operand::Memory(MemoryOperand {
                base: self.register_of(*base)?,
                index: Some(self.register_of(*index)?),
                stride: *stride,
                offset: *offset,
            }),
            Handle::DataSection {
                symbol,
                offset,
                address,
            } => Operand::Data {
                symbol: symbol.clone(),
                offset: *offset,
                address: *address,
            },
            Handle::Expression {
                multiplicand,
                multiplier,
                addition,
                constant,
            } => Operand::Expression {
                multiplicand: self.register_of(*multiplicand)?,
                multiplier: *multiplier,
                addition: addition.map(|id| self.register_of(id)).transpose()?,
                constant: *constant,
            },
            Handle::Modifier(modifier) => Operand::Modifier(*modifier),
        })
    }

    /// Data section handle of a pooled constant.
    pub(crate) fn pool_constant(&mut self, constant: Constant) -> Handle {
        let symbol = Symbol::new(&format!(".C{:016x}", constant.to_bits()));
        if !self.constants.iter().any(|(existing, _)| *existing == symbol) {
            log::trace!("pooling constant {constant:?} as {symbol}");
            self.constants.push((symbol.clone(), constant));
        }
        Handle::DataSection {
            symbol,
            offset: 0,
            address: false,
        }
    }

    /// Places a nested value in a standard register and locks it.
    fn pin_component(&mut self, component: ResultId) -> CompileResult<AsmReg> {
        let reg = match self.results.handle(component) {
            Handle::Register(reg) => *reg,
            _ => {
                let reg = self.allocate_standard(component)?;
                self.relocate(component, Handle::Register(reg))?;
                reg
            }
        };
        self.lock(reg);
        Ok(reg)
    }

    fn allocate_standard(&mut self, component: ResultId) -> CompileResult<AsmReg> {
        if self.results.format(component).is_decimal() {
            return Err(CompileError::IllegalConversion {
                from: HandleKind::MediaRegister,
                to: vec![HandleKind::Register],
            });
        }
        self.allocate(component, &[])
    }

    /// Makes every register an address or expression needs available and its form encodable.
    pub(crate) fn legalize_address(&mut self, result: ResultId, size: Size) -> CompileResult<()> {
        let handle = self.results.handle(result).clone();
        match handle {
            Handle::Memory { base, offset } => {
                self.pin_component(base)?;
                if !self.target.accepts_address(false, 1, offset, size) {
                    let expression = Handle::Expression {
                        multiplicand: base,
                        multiplier: 1,
                        addition: None,
                        constant: offset,
                    };
                    self.materialize_address(result, expression)?;
                }
            }
            Handle::ComplexMemory {
                base,
                index,
                stride,
                offset,
            } => {
                self.pin_component(base)?;
                self.pin_component(index)?;
                if !self.target.accepts_address(true, stride, offset, size) {
                    let expression = Handle::Expression {
                        multiplicand: index,
                        multiplier: i64::from(stride),
                        addition: Some(base),
                        constant: offset,
                    };
                    self.materialize_address(result, expression)?;
                }
            }
            Handle::Expression {
                multiplicand,
                addition,
                ..
            } => {
                self.pin_component(multiplicand)?;
                if let Some(addition) = addition {
                    self.pin_component(addition)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Computes an address into a register and rebases `result` on it.
    fn materialize_address(&mut self, result: ResultId, expression: Handle) -> CompileResult<()> {
        let address = self.results.create(expression, Format::U64);
        let base = self.results.create(Handle::None, Format::U64);
        let reg = self.allocate(base, &[])?;
        self.results.set_handle(base, Handle::Register(reg));
        log::trace!("materializing address of {result:?} in {reg:?}");
        self.insert_and_build(
            InstructionKind::Move {
                kind: MoveKind::Copy,
            },
            None,
            vec![
                InstructionParameter::destination(base, Size::Qword, vec![HandleKind::Register])
                    .with(ParameterFlags::LOCKED),
                InstructionParameter::source(address, Size::Qword, move_source_types())
                    .with(ParameterFlags::ALLOW_ADDRESS),
            ],
        )?;
        self.results.set_handle(result, Handle::Memory { base, offset: 0 });
        // The base is only read by the instruction being built.
        self.results.use_at(base, self.position);
        self.lock(reg);
        Ok(())
    }
}
