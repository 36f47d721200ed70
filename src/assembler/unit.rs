// This module implements Unit, the per-function state of the assembler. A Unit owns the
// register pool, the Result table, the stack frame, the scope chain and the instruction list
// of one function. Lowering appends instructions; reindex recomputes every position and every
// lifetime after an insertion; the build walks the list once, converting parameters and
// inserting the moves and spills it needs in front of the instruction being built. Register
// choice follows a fixed order: free volatile registers, free non-volatile registers, then
// registers whose value can be written back to its variable's slot, and finally any unlocked
// register whose value goes to a temporary slot. The finished list is turned into machine
// instructions by `finish`.

//! Per-function assembler state.

use crate::assembler::instruction::{
    BuildState, Instruction, InstructionId, InstructionKind, InstructionParameter, MoveKind,
    ParameterFlags, ScopeId,
};
use crate::assembler::machine::{MachineInstruction, MachineOperand, Opcode};
use crate::assembler::scope::Scope;
use crate::core::error::{CompileError, CompileResult};
use crate::core::frame::FunctionFrame;
use crate::core::register_file::{AsmReg, RegisterFile};
use crate::core::results::{Hint, ResultId, ResultTable};
use crate::core::value::{Constant, Format, Handle, HandleKind, Symbol};
use crate::flow::tree::VariableId;
use crate::target::Target;
use hashbrown::{HashMap, HashSet};

/// Handle kinds a move source may take.
pub(crate) fn move_source_types() -> Vec<HandleKind> {
    vec![
        HandleKind::Register,
        HandleKind::MediaRegister,
        HandleKind::Memory,
        HandleKind::Constant,
        HandleKind::Expression,
    ]
}

/// Register handle of the right bank.
pub(crate) fn register_handle(reg: AsmReg) -> Handle {
    if reg.is_media() {
        Handle::MediaRegister(reg)
    } else {
        Handle::Register(reg)
    }
}

/// Register kind holding values of a format.
pub(crate) fn register_kind(format: Format) -> HandleKind {
    if format.is_decimal() {
        HandleKind::MediaRegister
    } else {
        HandleKind::Register
    }
}

pub struct Unit<'a> {
    pub target: Target,
    pub debug: bool,
    pub registers: RegisterFile,
    pub results: ResultTable,
    pub frame: FunctionFrame<'a>,
    pub instructions: Vec<Instruction>,
    pub scopes: Vec<Scope>,
    /// Scope new instructions are created in, and during the build the scope being built.
    pub scope: ScopeId,
    /// Position of the instruction being built.
    pub position: usize,
    /// Constant pool entries.
    pub constants: Vec<(Symbol, Constant)>,
    /// Spill moves inserted so far.
    pub spills: usize,
    positions: HashMap<InstructionId, usize>,
    stack_arguments: HashMap<InstructionId, u32>,
    /// Registers locked by the builds in progress, innermost last.
    pub(crate) locks: Vec<AsmReg>,
    next_id: u32,
}

impl<'a> Unit<'a> {
    pub fn new(target: Target, debug: bool, frame: FunctionFrame<'a>) -> Self {
        Self {
            target,
            debug,
            registers: target.register_file(),
            results: ResultTable::new(),
            frame,
            instructions: Vec::new(),
            scopes: vec![Scope::new(ScopeId(0), None)],
            scope: ScopeId(0),
            position: 0,
            constants: Vec::new(),
            spills: 0,
            positions: HashMap::new(),
            stack_arguments: HashMap::new(),
            locks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn create_result(&mut self, handle: Handle, format: Format) -> ResultId {
        self.results.create(handle, format)
    }

    pub fn create_scope(&mut self, outer: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope::new(id, Some(outer)));
        id
    }

    pub fn scope_ref(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    /// Current value of a variable, searching outwards from the current scope.
    pub fn lookup(&self, variable: VariableId) -> Option<ResultId> {
        let mut current = Some(self.scope);
        while let Some(id) = current {
            let scope = self.scope_ref(id);
            if let Some(result) = scope.local(variable) {
                return Some(result);
            }
            current = scope.outer;
        }
        None
    }

    /// Variable whose current value is `result`.
    pub fn variable_of(&self, result: ResultId) -> Option<VariableId> {
        let mut seen = HashSet::new();
        let mut current = Some(self.scope);
        while let Some(id) = current {
            let scope = self.scope_ref(id);
            for (&variable, &value) in scope.bindings.iter().chain(scope.entry.iter()) {
                if seen.insert(variable) && self.results.is_connected(value, result) {
                    return Some(variable);
                }
            }
            current = scope.outer;
        }
        None
    }

    /// Appends an instruction at the end of the list.
    pub fn add(
        &mut self,
        kind: InstructionKind,
        result: Option<ResultId>,
        parameters: Vec<InstructionParameter>,
        dependencies: Vec<ResultId>,
    ) -> InstructionId {
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        let mut instruction = Instruction::new(id, kind, self.scope);
        instruction.result = result;
        instruction.parameters = parameters;
        instruction.dependencies = dependencies;
        instruction.position = self.instructions.len();
        self.positions.insert(id, instruction.position);
        self.instructions.push(instruction);
        id
    }

    /// Recomputes positions and lifetimes.
    pub fn reindex(&mut self) {
        self.positions.clear();
        self.results.reset_lifetimes();
        for (position, instruction) in self.instructions.iter_mut().enumerate() {
            instruction.position = position;
            self.positions.insert(instruction.id, position);
            for result in instruction.uses() {
                self.results.use_at(result, position);
            }
        }
    }

    pub fn position_of(&self, id: InstructionId) -> Option<usize> {
        self.positions.get(&id).copied()
    }

    pub(crate) fn current(&self) -> &Instruction {
        &self.instructions[self.position]
    }

    pub(crate) fn current_mut(&mut self) -> &mut Instruction {
        &mut self.instructions[self.position]
    }

    /// Whether the value dies at the instruction being built.
    pub(crate) fn is_expiring(&self, result: ResultId) -> bool {
        self.results.lifetime(result).is_expiring(self.position)
    }

    /// Hints whose anchor is not behind the build position.
    fn active_hints(&self, result: ResultId) -> Vec<Hint> {
        self.results
            .get(result)
            .hints
            .iter()
            .filter(|hint| {
                self.position_of(hint.anchor())
                    .is_some_and(|anchor| anchor >= self.position)
            })
            .cloned()
            .collect()
    }

    /// Register neither locked nor holding a live value.
    pub(crate) fn is_free(&self, reg: AsmReg) -> bool {
        self.registers.get(reg).is_some_and(|register| {
            !register.is_reserved() && register.is_available(&self.results, self.position)
        })
    }

    /// Chooses a register for `result`, honoring its hints.
    pub(crate) fn allocate(&mut self, result: ResultId, avoid: &[AsmReg]) -> CompileResult<AsmReg> {
        let media = self.results.format(result).is_decimal();
        let mut avoid = avoid.to_vec();
        let mut non_volatile = false;
        let mut specific = None;
        for hint in self.active_hints(result) {
            match hint {
                Hint::SpecificRegister { register, .. } => specific = specific.or(Some(register)),
                Hint::NonVolatile { .. } => non_volatile = true,
                Hint::AvoidRegisters { registers, .. } => avoid.extend(registers),
            }
        }

        if let Some(register) = specific {
            if register.is_media() == media && !avoid.contains(&register) && self.is_free(register) {
                return Ok(register);
            }
        }
        if non_volatile {
            let preserved = self.registers.class(media, false);
            if let Some(reg) = preserved
                .into_iter()
                .find(|reg| !avoid.contains(reg) && self.is_free(*reg))
            {
                return Ok(reg);
            }
        }
        self.get_next_register(media, &avoid)
    }

    /// Next register of a bank, releasing a value when none is free.
    pub fn get_next_register(&mut self, media: bool, avoid: &[AsmReg]) -> CompileResult<AsmReg> {
        let mut candidates = self.registers.class(media, true);
        candidates.extend(self.registers.class(media, false));
        candidates.retain(|reg| !avoid.contains(reg));

        if let Some(&reg) = candidates.iter().find(|&&reg| self.is_free(reg)) {
            return Ok(reg);
        }

        // Values that can go back to their variable's slot are cheapest to release.
        let releasable = candidates.iter().copied().find(|&reg| {
            !self.registers.is_locked(reg)
                && self
                    .registers
                    .get(reg)
                    .and_then(|register| register.holds(&self.results))
                    .is_some_and(|value| self.variable_of(value).is_some())
        });
        let victim = releasable.or_else(|| {
            candidates
                .iter()
                .copied()
                .find(|&reg| !self.registers.is_locked(reg))
        });

        match victim {
            Some(reg) => {
                self.release(reg)?;
                Ok(reg)
            }
            None => Err(CompileError::RegistersExhausted {
                class: if media { "media" } else { "standard" },
            }),
        }
    }

    /// Moves the value held by `reg` to memory and frees the register.
    pub fn release(&mut self, reg: AsmReg) -> CompileResult<()> {
        let held = self
            .registers
            .get(reg)
            .and_then(|register| register.holds(&self.results));
        let Some(value) = held.filter(|&value| self.results.lifetime(value).is_active(self.position)) else {
            self.registers.reset(reg);
            return Ok(());
        };

        let size = self.results.format(value).size().bytes();
        let slot = match self.variable_of(value) {
            Some(variable) => self.frame.variable_slot(variable, size),
            None => self.frame.allocate_temporary(size),
        };
        log::trace!("spilling {:?} from {:?} to frame offset {}", value, reg, slot.offset);
        self.relocate(value, Handle::Stack(slot))?;
        self.registers.reset(reg);
        self.spills += 1;
        Ok(())
    }

    /// Frees `reg` by moving its live value to another register, or to memory.
    pub(crate) fn evacuate(&mut self, reg: AsmReg, avoid: &[AsmReg]) -> CompileResult<()> {
        let held = self
            .registers
            .get(reg)
            .and_then(|register| register.holds(&self.results));
        let Some(value) = held.filter(|&value| self.results.lifetime(value).is_active(self.position)) else {
            self.registers.reset(reg);
            return Ok(());
        };

        let media = reg.is_media();
        let mut candidates = self.registers.class(media, true);
        candidates.extend(self.registers.class(media, false));
        let target = candidates
            .into_iter()
            .find(|&candidate| candidate != reg && !avoid.contains(&candidate) && self.is_free(candidate));
        match target {
            Some(target) => {
                self.relocate(value, register_handle(target))?;
                self.registers.reset(reg);
                Ok(())
            }
            None => self.release(reg),
        }
    }

    /// Inserts an instruction in front of the one being built and builds it.
    pub(crate) fn insert_and_build(
        &mut self,
        kind: InstructionKind,
        result: Option<ResultId>,
        parameters: Vec<InstructionParameter>,
    ) -> CompileResult<InstructionId> {
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        let mut instruction = Instruction::new(id, kind, self.scope);
        instruction.result = result;
        instruction.parameters = parameters;
        self.instructions.insert(self.position, instruction);
        self.reindex();
        self.build()?;
        self.position += 1;
        Ok(id)
    }

    /// Moves `value` to `handle`; the value lives there afterwards.
    pub(crate) fn relocate(&mut self, value: ResultId, handle: Handle) -> CompileResult<()> {
        let format = self.results.format(value);
        let kind = handle.kind();
        let destination = self.results.create(handle, format);
        let size = format.size();
        self.insert_and_build(
            InstructionKind::Move {
                kind: MoveKind::Relocate,
            },
            None,
            vec![
                InstructionParameter::destination(destination, size, vec![kind])
                    .with(ParameterFlags::LOCKED | ParameterFlags::NO_ATTACH),
                InstructionParameter::new(
                    value,
                    size,
                    move_source_types(),
                    ParameterFlags::SOURCE
                        | ParameterFlags::READS
                        | ParameterFlags::RELOCATE_TO_DESTINATION
                        | ParameterFlags::ALLOW_ADDRESS,
                ),
            ],
        )?;
        Ok(())
    }

    /// Copies `value` to `handle` and returns the Result living there.
    pub(crate) fn copy_to(&mut self, value: ResultId, handle: Handle) -> CompileResult<ResultId> {
        let format = self.results.format(value);
        let kind = handle.kind();
        let destination = self.results.create(handle, format);
        let size = format.size();
        self.insert_and_build(
            InstructionKind::Move {
                kind: MoveKind::Copy,
            },
            None,
            vec![
                InstructionParameter::destination(destination, size, vec![kind])
                    .with(ParameterFlags::LOCKED),
                InstructionParameter::source(value, size, move_source_types())
                    .with(ParameterFlags::ALLOW_ADDRESS),
            ],
        )?;
        Ok(destination)
    }

    pub(crate) fn lock(&mut self, reg: AsmReg) {
        self.registers.lock(reg);
        self.locks.push(reg);
    }

    /// Releases every lock taken since `mark`.
    pub(crate) fn unlock_to(&mut self, mark: usize) {
        while self.locks.len() > mark {
            if let Some(reg) = self.locks.pop() {
                self.registers.unlock(reg);
            }
        }
    }

    pub(crate) fn set_stack_arguments(&mut self, call: InstructionId, count: u32) {
        self.stack_arguments.insert(call, count);
    }

    /// Builds every instruction in order.
    pub fn build_all(&mut self) -> CompileResult<()> {
        self.reindex();
        self.scope = ScopeId(0);
        self.position = 0;
        while self.position < self.instructions.len() {
            if self.current().state == BuildState::NotBuilt {
                self.build()?;
            }
            self.position += 1;
        }
        log::debug!(
            "built {} instructions with {} spills",
            self.instructions.len(),
            self.spills
        );
        Ok(())
    }

    /// Converts the built list into machine instructions.
    pub fn finish(&self) -> CompileResult<Vec<MachineInstruction>> {
        let mut output = Vec::with_capacity(self.instructions.len());
        for instruction in &self.instructions {
            if !instruction.is_built() {
                return Err(CompileError::codegen(format!(
                    "{} instruction {:?} was never built",
                    instruction.kind.name(),
                    instruction.id
                )));
            }
            let opcode = match &instruction.kind {
                InstructionKind::Initialize { .. }
                | InstructionKind::SetVariable { .. }
                | InstructionKind::EnterScope { .. }
                | InstructionKind::MergeScope { .. }
                | InstructionKind::ExitScope { .. } => continue,
                InstructionKind::Label { label, .. } => Opcode::Label(*label),
                InstructionKind::Jump { label, condition } => Opcode::Jump {
                    label: *label,
                    condition: *condition,
                },
                InstructionKind::Compare => Opcode::Compare,
                InstructionKind::SetCondition { condition } => Opcode::SetCondition(*condition),
                InstructionKind::Move { .. } => Opcode::Move,
                InstructionKind::Arithmetic(operator) => Opcode::Arithmetic(*operator),
                InstructionKind::Shift { direction, unsigned } => Opcode::Shift {
                    direction: *direction,
                    unsigned: *unsigned,
                },
                InstructionKind::Division { remainder, unsigned } => Opcode::Divide {
                    remainder: *remainder,
                    unsigned: *unsigned,
                },
                InstructionKind::ExtendNumerator => Opcode::ExtendNumerator,
                InstructionKind::MultiplySubtract => Opcode::MultiplySubtract,
                InstructionKind::Negate => Opcode::Negate,
                InstructionKind::Call { function, .. } => Opcode::Call {
                    function: function.clone(),
                    stack_arguments: self.stack_arguments.get(&instruction.id).copied().unwrap_or(0),
                },
                InstructionKind::Return { .. } => Opcode::Return,
            };

            let operands = instruction
                .parameters
                .iter()
                .map(|parameter| {
                    let format = self.results.format(parameter.result);
                    let format = if format.size() == parameter.size {
                        format
                    } else {
                        Format::integer(parameter.size, format.is_unsigned())
                    };
                    MachineOperand::new(parameter.operand.clone(), format, parameter.flags, parameter.types.clone())
                })
                .collect();
            output.push(MachineInstruction::new(opcode, operands));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64;
    use bumpalo::Bump;

    fn unit(arena: &Bump) -> Unit<'_> {
        Unit::new(Target::X64, false, FunctionFrame::new(arena))
    }

    #[test]
    fn test_reindex_computes_lifetimes() {
        let arena = Bump::new();
        let mut unit = unit(&arena);
        let a = unit.create_result(Handle::Constant(Constant::Integer(1)), Format::I64);
        let b = unit.create_result(Handle::None, Format::I64);
        unit.add(InstructionKind::Compare, None, Vec::new(), vec![a]);
        let id = unit.add(InstructionKind::Negate, Some(b), Vec::new(), vec![a]);
        unit.add(InstructionKind::Compare, None, Vec::new(), vec![b]);
        unit.reindex();

        assert_eq!(unit.position_of(id), Some(1));
        assert_eq!(unit.results.lifetime(a).end, Some(1));
        assert_eq!(unit.results.lifetime(b).start, Some(1));
        assert_eq!(unit.results.lifetime(b).end, Some(2));
    }

    #[test]
    fn test_next_register_prefers_free_volatile() {
        let arena = Bump::new();
        let mut unit = unit(&arena);
        let value = unit.create_result(Handle::Register(x64::RAX), Format::I64);
        unit.add(InstructionKind::Compare, None, Vec::new(), vec![value]);
        unit.add(InstructionKind::Compare, None, Vec::new(), vec![value]);
        unit.reindex();
        unit.registers.attach(x64::RAX, value);

        assert_eq!(unit.get_next_register(false, &[]).unwrap(), x64::RCX);
        assert_eq!(unit.get_next_register(false, &[x64::RCX]).unwrap(), x64::RDX);
        assert_eq!(unit.get_next_register(true, &[]).unwrap(), AsmReg::media(0));
    }

    #[test]
    fn test_variable_lookup_walks_scopes() {
        let arena = Bump::new();
        let mut unit = unit(&arena);
        let x = VariableId(0);
        let outer = unit.create_result(Handle::None, Format::I64);
        let inner = unit.create_result(Handle::None, Format::I64);
        unit.scope_mut(ScopeId(0)).bindings.insert(x, outer);
        let nested = unit.create_scope(ScopeId(0));
        unit.scope = nested;

        assert_eq!(unit.lookup(x), Some(outer));
        assert_eq!(unit.variable_of(outer), Some(x));
        unit.scope_mut(nested).bindings.insert(x, inner);
        assert_eq!(unit.lookup(x), Some(inner));
        assert_eq!(unit.variable_of(outer), None);
    }
}
