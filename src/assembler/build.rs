// This module builds instructions. Building an instruction settles where every one of its
// parameters lives: sources are converted first, then destinations. A parameter whose handle
// kind is not in its preference list is moved into a register; decimal constants go to the
// constant pool; memory operands get their base and index into registers; a destination that
// would overwrite a value still needed later is redirected to a copy. Once every parameter is
// placed the concrete operands are captured and the flag side effects update the register
// bookkeeping. Instructions with fixed register requirements (calls, returns, x86-64 division
// and shifts) place their operands first and then go through the same conversion. Scope
// instructions move values into merge point locations and restore them at region labels.

//! Instruction builders.

use crate::assembler::instruction::{
    BuildState, InstructionKind, InstructionParameter, ParameterFlags, ScopeId,
};
use crate::assembler::unit::{register_handle, register_kind, Unit};
use crate::core::calling_convention::assign_all;
use crate::core::error::{CompileError, CompileResult};
use crate::core::register_file::AsmReg;
use crate::core::results::ResultId;
use crate::core::value::{Constant, Handle, HandleKind};
use crate::flow::tree::VariableId;
use crate::target::Target;

impl<'a> Unit<'a> {
    /// Builds the instruction at the current position.
    pub(crate) fn build(&mut self) -> CompileResult<()> {
        self.current_mut().state = BuildState::Building;
        let kind = self.current().kind.clone();
        log::trace!("building {} at {}", kind.name(), self.position);

        match kind {
            InstructionKind::Initialize { parameters } => self.build_initialize(&parameters)?,
            InstructionKind::Label { region, .. } => self.build_label(region),
            InstructionKind::EnterScope { scope } => self.build_enter_scope(scope)?,
            InstructionKind::MergeScope { scope, sources } => self.build_merge_scope(scope, &sources)?,
            InstructionKind::ExitScope { scope } => self.build_exit_scope(scope),
            InstructionKind::SetVariable { variable, value } => {
                let scope = self.scope;
                self.scope_mut(scope).bindings.insert(variable, value);
            }
            InstructionKind::Division { remainder, unsigned }
                if self.target == Target::X64 && !self.operates_on_decimals() =>
            {
                self.build_x64_division(remainder, unsigned)?
            }
            InstructionKind::Shift { .. } if self.target.shift_register().is_some() => self.build_x64_shift()?,
            InstructionKind::Call { arguments, .. } => self.build_call(&arguments)?,
            InstructionKind::Return { value } => self.build_return(value)?,
            _ => self.build_parameters()?,
        }

        self.current_mut().state = BuildState::Built;
        Ok(())
    }

    fn operates_on_decimals(&self) -> bool {
        self.current()
            .parameters
            .first()
            .is_some_and(|parameter| self.results.format(parameter.result).is_decimal())
    }

    /// Registers a handle occupies, including the ones its address needs.
    fn handle_registers(&self, result: ResultId) -> Vec<AsmReg> {
        let handle = self.results.handle(result);
        let mut registers: Vec<AsmReg> = handle.register().into_iter().collect();
        for dependency in handle.dependencies() {
            registers.extend(self.results.handle(dependency).register());
        }
        registers
    }

    /// Converts, captures and attaches every parameter of the current instruction.
    pub(crate) fn build_parameters(&mut self) -> CompileResult<()> {
        let mark = self.locks.len();
        let pinned: Vec<AsmReg> = self
            .current()
            .parameters
            .iter()
            .flat_map(|parameter| self.handle_registers(parameter.result))
            .collect();
        for reg in pinned {
            self.lock(reg);
        }

        let count = self.current().parameters.len();
        let (destinations, sources): (Vec<usize>, Vec<usize>) =
            (0..count).partition(|&index| self.current().parameters[index].is_destination());
        for index in sources.into_iter().chain(destinations) {
            let parameter = &self.current().parameters[index];
            if parameter.flags.contains(ParameterFlags::LOCKED) {
                continue;
            }
            if parameter.is_destination() {
                self.convert_destination(index)?;
            } else {
                self.convert_source(index)?;
            }
        }

        for index in 0..count {
            let handle = self.results.handle(self.current().parameters[index].result).clone();
            let operand = self.operand(&handle)?;
            self.current_mut().parameters[index].operand = operand;
        }
        self.attach_parameters();
        self.unlock_to(mark);
        Ok(())
    }

    /// Whether another explicit operand of the instruction is in memory.
    fn has_other_memory(&self, index: usize) -> bool {
        self.current()
            .parameters
            .iter()
            .enumerate()
            .any(|(other, parameter)| {
                other != index
                    && !parameter.flags.contains(ParameterFlags::HIDDEN)
                    && self.results.handle(parameter.result).kind() == HandleKind::Memory
            })
    }

    fn has_memory_destination(&self) -> bool {
        self.current().parameters.iter().any(|parameter| {
            parameter.is_destination() && self.results.handle(parameter.result).kind() == HandleKind::Memory
        })
    }

    fn is_acceptable(&self, index: usize, handle: &Handle) -> bool {
        let parameter = &self.current().parameters[index];
        let kind = handle.kind();
        if !parameter.accepts(kind) {
            return false;
        }
        match handle {
            Handle::Constant(constant) => {
                parameter.fits(constant)
                    && (!self.has_memory_destination() || self.target.accepts_store_immediate(constant))
            }
            Handle::Expression { .. } => parameter.flags.contains(ParameterFlags::ALLOW_ADDRESS),
            _ if kind == HandleKind::Memory => !self.has_other_memory(index),
            _ => true,
        }
    }

    /// A stack value read again later is worth loading when a register is free.
    fn should_upgrade(&self, parameter: &InstructionParameter, handle: &Handle) -> bool {
        let format = self.results.format(parameter.result);
        !matches!(self.current().kind, InstructionKind::Move { .. })
            && matches!(handle, Handle::Stack(_))
            && !self.is_expiring(parameter.result)
            && parameter.types.first() == Some(&register_kind(format))
            && self
                .registers
                .allocatable(format.is_decimal())
                .into_iter()
                .any(|reg| self.is_free(reg))
    }

    /// Moves the value of a parameter into a fresh register and locks it.
    fn place_in_register(&mut self, index: usize) -> CompileResult<()> {
        let parameter = self.current().parameters[index].clone();
        let format = self.results.format(parameter.result);
        let kind = register_kind(format);
        if !parameter.accepts(kind) {
            return Err(CompileError::IllegalConversion {
                from: self.results.handle(parameter.result).kind(),
                to: parameter.types,
            });
        }
        let reg = self.allocate(parameter.result, &[])?;
        self.relocate(parameter.result, register_handle(reg))?;
        self.lock(reg);
        Ok(())
    }

    fn convert_source(&mut self, index: usize) -> CompileResult<()> {
        let parameter = self.current().parameters[index].clone();
        let result = parameter.result;
        if let Handle::Constant(constant @ Constant::Decimal(_)) = *self.results.handle(result) {
            let pooled = self.pool_constant(constant);
            self.results.set_handle(result, pooled);
        }

        let handle = self.results.handle(result).clone();
        if matches!(handle, Handle::None) {
            return Err(CompileError::codegen(format!(
                "{result:?} is read by {} before it has a location",
                self.current().kind.name()
            )));
        }

        if !self.is_acceptable(index, &handle) {
            return self.place_in_register(index);
        }
        match handle.kind() {
            HandleKind::Memory | HandleKind::Expression => {
                if self.should_upgrade(&parameter, &handle) {
                    self.place_in_register(index)?;
                } else {
                    self.legalize_address(result, parameter.size)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Register of an expiring source that a destination may reuse.
    fn expiring_source_register(&self, index: usize, media: bool) -> Option<AsmReg> {
        self.current()
            .parameters
            .iter()
            .enumerate()
            .filter(|(other, parameter)| *other != index && parameter.is_source() && !parameter.is_destination())
            .filter(|(_, parameter)| self.is_expiring(parameter.result))
            .filter_map(|(_, parameter)| self.results.handle(parameter.result).register())
            .find(|reg| reg.is_media() == media)
    }

    fn convert_destination(&mut self, index: usize) -> CompileResult<()> {
        let parameter = self.current().parameters[index].clone();
        let result = parameter.result;
        let format = self.results.format(result);
        let wanted = register_kind(format);

        if parameter.flags.contains(ParameterFlags::RELOCATE_TO_SOURCE) {
            let source = self
                .current()
                .parameters
                .iter()
                .find(|other| other.is_source() && !other.is_destination())
                .map(|other| other.result);
            if let Some(source) = source {
                let handle = self.results.handle(source).clone();
                if handle.is_register() && self.is_expiring(source) && parameter.accepts(handle.kind()) {
                    self.results.set_handle(result, handle);
                    return Ok(());
                }
            }
        }

        let handle = self.results.handle(result).clone();
        if parameter.is_source() {
            let own = self.current().result;
            let protect = !parameter.flags.contains(ParameterFlags::WRITE_ACCESS)
                && !self.is_expiring(result)
                && !own.is_some_and(|own| self.results.is_connected(own, result));
            if !protect && !matches!(handle, Handle::None) && self.is_acceptable(index, &handle) {
                if matches!(handle.kind(), HandleKind::Memory | HandleKind::Expression) {
                    self.legalize_address(result, parameter.size)?;
                }
                return Ok(());
            }
            if !parameter.accepts(wanted) {
                return Err(CompileError::IllegalConversion {
                    from: handle.kind(),
                    to: parameter.types,
                });
            }
            let reg = self.allocate(own.unwrap_or(result), &[])?;
            let copy = self.copy_to(result, register_handle(reg))?;
            self.current_mut().parameters[index].result = copy;
            self.reindex();
            self.lock(reg);
            return Ok(());
        }

        match handle.kind() {
            HandleKind::None => {
                if !parameter.accepts(wanted) {
                    if parameter.accepts(HandleKind::Memory) {
                        let slot = self.frame.allocate_temporary(format.size().bytes());
                        self.results.set_handle(result, Handle::Stack(slot));
                        return Ok(());
                    }
                    return Err(CompileError::IllegalConversion {
                        from: HandleKind::None,
                        to: parameter.types,
                    });
                }
                let reg = self.allocate_destination(index, result, format.is_decimal())?;
                self.results.set_handle(result, register_handle(reg));
                self.lock(reg);
            }
            HandleKind::Memory | HandleKind::Expression => self.legalize_address(result, parameter.size)?,
            _ => {}
        }
        Ok(())
    }

    /// Register for a fresh destination: its hint, an expiring source, then any register.
    fn allocate_destination(&mut self, index: usize, result: ResultId, media: bool) -> CompileResult<AsmReg> {
        let reusable = self.expiring_source_register(index, media);
        let hinted = self.results.get(result).hints.iter().find_map(|hint| match hint {
            crate::core::results::Hint::SpecificRegister { register, until }
                if self.position_of(*until).is_some_and(|anchor| anchor >= self.position) =>
            {
                Some(*register)
            }
            _ => None,
        });
        if let Some(register) = hinted {
            if register.is_media() == media && (Some(register) == reusable || self.is_free(register)) {
                return Ok(register);
            }
        }
        match reusable {
            Some(reg) => Ok(reg),
            None => self.allocate(result, &[]),
        }
    }

    /// Runs the register bookkeeping requested by the parameter flags.
    fn attach_parameters(&mut self) {
        let instruction = self.current().clone();
        let own = instruction.result;
        let destination_handle = instruction
            .parameters
            .iter()
            .find(|parameter| parameter.is_destination())
            .map(|parameter| self.results.handle(parameter.result).clone());

        let (destinations, sources): (Vec<_>, Vec<_>) = instruction
            .parameters
            .iter()
            .partition(|parameter| parameter.is_destination());
        for parameter in sources.into_iter().chain(destinations) {
            let flags = parameter.flags;
            let handle = self.results.handle(parameter.result).clone();
            if parameter.is_destination() {
                if let Some(reg) = handle.register() {
                    self.registers.mark_written(reg);
                }
            }

            if flags.contains(ParameterFlags::RELOCATE_TO_DESTINATION) && !parameter.is_destination() {
                if let Some(target) = &destination_handle {
                    self.results.set_handle(parameter.result, target.clone());
                    if let Some(reg) = target.register() {
                        self.registers.attach(reg, parameter.result);
                    }
                }
                continue;
            }
            if flags.contains(ParameterFlags::NO_ATTACH) {
                continue;
            }
            let Some(reg) = handle.register() else {
                continue;
            };

            if parameter.is_destination() && flags.contains(ParameterFlags::ATTACH_TO_DESTINATION) {
                match own {
                    Some(own) if !self.results.is_connected(own, parameter.result) => {
                        self.results.set_handle(own, handle.clone());
                        self.registers.attach(reg, own);
                    }
                    _ => self.registers.attach(reg, parameter.result),
                }
            } else if flags.contains(ParameterFlags::ATTACH_TO_SOURCE) {
                self.registers.attach(reg, parameter.result);
            }
        }
    }

    fn build_initialize(&mut self, parameters: &[(VariableId, ResultId)]) -> CompileResult<()> {
        let formats: Vec<_> = parameters
            .iter()
            .map(|&(_, result)| self.results.format(result))
            .collect();
        let mut assigner = self.target.assigner();
        let assignments = assign_all(assigner.as_mut(), &formats);

        for (&(variable, result), assignment) in parameters.iter().zip(&assignments) {
            let handle = match (assignment.reg, assignment.stack_off) {
                (Some(reg), _) => {
                    self.registers.attach(reg, result);
                    register_handle(reg)
                }
                (None, Some(offset)) => Handle::Stack(self.frame.parameter_slot(offset)),
                (None, None) => {
                    return Err(CompileError::codegen(format!(
                        "parameter {variable:?} received no location"
                    )))
                }
            };
            log::trace!("parameter {variable:?} arrives in {handle:?}");
            self.results.set_handle(result, handle);
            self.scope_mut(ScopeId(0)).bindings.insert(variable, result);
        }
        Ok(())
    }

    fn build_label(&mut self, region: Option<ScopeId>) {
        self.registers.reset_all();
        let Some(scope) = region else {
            return;
        };
        self.scope = scope;
        let snapshot = self.scope_ref(scope).snapshot.clone();
        for (_, anchor, handle) in snapshot {
            if let Some(reg) = handle.register() {
                self.registers.attach(reg, anchor);
            }
            self.results.set_handle(anchor, handle);
        }
        self.scope_mut(scope).bindings.clear();
    }

    fn build_enter_scope(&mut self, scope: ScopeId) -> CompileResult<()> {
        let anchors: Vec<(VariableId, ResultId)> = {
            let entered = self.scope_ref(scope);
            entered
                .actives
                .iter()
                .filter_map(|variable| entered.entry.get(variable).map(|&anchor| (*variable, anchor)))
                .collect()
        };

        for &(_, anchor) in &anchors {
            let settled = matches!(
                self.results.handle(anchor),
                Handle::Register(_) | Handle::MediaRegister(_) | Handle::Stack(_)
            );
            if !settled {
                let reg = self.allocate(anchor, &[])?;
                self.relocate(anchor, register_handle(reg))?;
            }
        }

        let snapshot = anchors
            .iter()
            .map(|&(variable, anchor)| (variable, anchor, self.results.handle(anchor).clone()))
            .collect();
        self.scope_mut(scope).snapshot = snapshot;
        self.scope = scope;
        Ok(())
    }

    fn build_merge_scope(&mut self, scope: ScopeId, sources: &[(VariableId, ResultId)]) -> CompileResult<()> {
        let mut pending: Vec<(ResultId, ResultId, Handle)> = Vec::new();
        for &(variable, source) in sources {
            let Some((anchor, location)) = self
                .scope_ref(scope)
                .snapshot_of(variable)
                .map(|(anchor, location)| (anchor, location.clone()))
            else {
                continue;
            };
            if *self.results.handle(source) != location {
                pending.push((source, anchor, location));
            }
        }

        let mark = self.locks.len();
        while !pending.is_empty() {
            let ready = (0..pending.len()).find(|&candidate| {
                let location = &pending[candidate].2;
                !pending
                    .iter()
                    .enumerate()
                    .any(|(other, (value, _, _))| other != candidate && self.results.handle(*value) == location)
            });

            match ready {
                Some(index) => {
                    let (source, anchor, location) = pending.remove(index);
                    if let Some(reg) = location.register() {
                        self.clear_merge_location(scope, reg)?;
                    }
                    log::trace!("merging {source:?} into {location:?}");
                    let destination = self.copy_to(source, location.clone())?;
                    self.results.connect(anchor, destination);
                    // The source now lives at the merge location; its old register may be
                    // taken by the next move.
                    self.results.set_handle(source, location.clone());
                    if let Some(reg) = location.register() {
                        self.registers.attach(reg, source);
                        self.lock(reg);
                    }
                }
                None => {
                    // Every target is still read by another move: park one blocker elsewhere.
                    let location = pending[0].2.clone();
                    let Some(&(blocker, _, _)) = pending
                        .iter()
                        .find(|(value, _, _)| *self.results.handle(*value) == location)
                    else {
                        return Err(CompileError::codegen("merge cycle without a blocker"));
                    };
                    let media = self.results.format(blocker).is_decimal();
                    let reg = self.get_next_register(media, &[])?;
                    self.relocate(blocker, register_handle(reg))?;
                }
            }
        }
        self.unlock_to(mark);
        Ok(())
    }

    /// Moves an unrelated live value out of a snapshot register.
    fn clear_merge_location(&mut self, scope: ScopeId, reg: AsmReg) -> CompileResult<()> {
        let held = self
            .registers
            .get(reg)
            .and_then(|register| register.holds(&self.results));
        let Some(value) = held else {
            return Ok(());
        };
        let snapshot = &self.scope_ref(scope).snapshot;
        // Only the anchor that belongs at this register may be overwritten in place.
        let is_anchor = snapshot.iter().any(|(_, anchor, handle)| {
            handle.register() == Some(reg) && self.results.is_connected(*anchor, value)
        });
        if is_anchor {
            return Ok(());
        }
        let locations: Vec<AsmReg> = snapshot.iter().filter_map(|(_, _, handle)| handle.register()).collect();
        self.evacuate(reg, &locations)
    }

    fn build_exit_scope(&mut self, scope: ScopeId) {
        let exited = self.scope_ref(scope);
        let Some(outer) = exited.outer else {
            return;
        };
        let mut values: Vec<(VariableId, ResultId)> = exited.entry.iter().map(|(&v, &r)| (v, r)).collect();
        values.extend(exited.bindings.iter().map(|(&v, &r)| (v, r)));

        for (variable, result) in values {
            self.scope_mut(outer).bindings.insert(variable, result);
            if let Some(reg) = self.results.handle(result).register() {
                self.registers.attach(reg, result);
            }
        }
        self.scope = outer;
    }

    /// x86-64 division: the dividend spans the numerator and remainder registers. The high
    /// half is zeroed for unsigned division and sign-extended otherwise.
    fn build_x64_division(&mut self, remainder: bool, unsigned: bool) -> CompileResult<()> {
        let [numerator, remainder_register] = match self.target.division_registers() {
            [numerator, remainder_register] => [*numerator, *remainder_register],
            _ => return Err(CompileError::codegen("target has no division registers")),
        };
        let fixed = [numerator, remainder_register];
        let mark = self.locks.len();

        let divisor = self.current().parameters[1].result;
        let misplaced = match self.results.handle(divisor) {
            Handle::Register(reg) => fixed.contains(reg),
            Handle::Constant(_) | Handle::None => true,
            _ => false,
        };
        if misplaced {
            let reg = self.allocate(divisor, &fixed)?;
            self.relocate(divisor, Handle::Register(reg))?;
        }
        for reg in self.handle_registers(divisor) {
            self.lock(reg);
        }

        let dividend = self.current().parameters[0].result;
        let in_place = *self.results.handle(dividend) == Handle::Register(numerator) && self.is_expiring(dividend);
        if !in_place {
            self.evacuate(numerator, &fixed)?;
            let copy = self.copy_to(dividend, Handle::Register(numerator))?;
            self.current_mut().parameters[0].result = copy;
            self.reindex();
        }
        self.lock(numerator);
        self.evacuate(remainder_register, &fixed)?;
        self.lock(remainder_register);

        let implicit = ParameterFlags::HIDDEN | ParameterFlags::LOCKED | ParameterFlags::NO_ATTACH;
        let low = self.current().parameters[0].result;
        let format = self.results.format(low);
        let size = format.size();
        let high = if unsigned {
            let zero = self.results.create(Handle::Constant(Constant::Integer(0)), format);
            self.copy_to(zero, Handle::Register(remainder_register))?
        } else {
            let high = self.results.create(Handle::Register(remainder_register), format);
            self.insert_and_build(
                InstructionKind::ExtendNumerator,
                None,
                vec![
                    InstructionParameter::destination(high, size, vec![HandleKind::Register]).with(implicit),
                    InstructionParameter::source(low, size, vec![HandleKind::Register]).with(implicit),
                ],
            )?;
            high
        };
        log::trace!("numerator pair prepared, unsigned: {unsigned}");
        {
            let instruction = self.current_mut();
            let first = &mut instruction.parameters[0];
            first.flags = first.flags | implicit;
            instruction
                .parameters
                .push(InstructionParameter::modify(high, size, vec![HandleKind::Register]).with(implicit));
        }
        self.reindex();
        self.build_parameters()?;

        self.registers.reset(numerator);
        self.registers.reset(remainder_register);
        if let Some(result) = self.current().result {
            let reg = if remainder { remainder_register } else { numerator };
            self.results.set_handle(result, Handle::Register(reg));
            self.registers.attach(reg, result);
        }
        self.unlock_to(mark);
        Ok(())
    }

    /// x86-64 variable shifts take their count in the shift register.
    fn build_x64_shift(&mut self) -> CompileResult<()> {
        let Some(shift) = self.target.shift_register() else {
            return self.build_parameters();
        };
        let mark = self.locks.len();

        let value = self.current().parameters[0].result;
        if *self.results.handle(value) == Handle::Register(shift) {
            let reg = self.allocate(value, &[shift])?;
            self.relocate(value, Handle::Register(reg))?;
        }

        let count = self.current().parameters[1].result;
        if !self.results.handle(count).is_constant() {
            if *self.results.handle(count) != Handle::Register(shift) {
                self.evacuate(shift, &[shift])?;
                let copy = self.copy_to(count, Handle::Register(shift))?;
                self.current_mut().parameters[1].result = copy;
                self.reindex();
            }
            let second = &mut self.current_mut().parameters[1];
            second.flags = second.flags | ParameterFlags::LOCKED;
        }
        self.lock(shift);
        self.build_parameters()?;
        self.unlock_to(mark);
        Ok(())
    }

    fn build_call(&mut self, arguments: &[ResultId]) -> CompileResult<()> {
        let mark = self.locks.len();
        let formats: Vec<_> = arguments.iter().map(|&argument| self.results.format(argument)).collect();
        let mut assigner = self.target.assigner();
        let assignments = assign_all(assigner.as_mut(), &formats);
        let targets: Vec<AsmReg> = assignments.iter().filter_map(|assignment| assignment.reg).collect();

        // Values needed after the call leave the volatile registers.
        let volatile: Vec<AsmReg> = self
            .registers
            .registers()
            .iter()
            .filter(|register| register.is_volatile() && !register.is_reserved())
            .map(|register| register.reg)
            .collect();
        for reg in volatile {
            let held = self
                .registers
                .get(reg)
                .and_then(|register| register.holds(&self.results));
            let Some(value) = held else {
                continue;
            };
            if !self.results.lifetime(value).is_active(self.position + 1) {
                continue;
            }
            let preserved = self
                .registers
                .class(reg.is_media(), false)
                .into_iter()
                .find(|&candidate| self.is_free(candidate));
            match preserved {
                Some(target) => {
                    log::trace!("moving {value:?} across the call into {target:?}");
                    self.relocate(value, register_handle(target))?;
                    self.registers.reset(reg);
                }
                None => self.release(reg)?,
            }
        }
        for &reg in &targets {
            self.lock(reg);
        }

        let mut stack_arguments = 0;
        for (&argument, assignment) in arguments.iter().zip(&assignments) {
            let Some(offset) = assignment.stack_off else {
                continue;
            };
            let size = self.results.format(argument).size();
            let slot = self.frame.outgoing_slot(offset, size.bytes());
            self.copy_to(argument, Handle::Stack(slot))?;
            stack_arguments += 1;
        }

        // Parallel copy into the argument registers.
        let mut pending: Vec<(ResultId, AsmReg)> = arguments
            .iter()
            .zip(&assignments)
            .filter_map(|(&argument, assignment)| assignment.reg.map(|reg| (argument, reg)))
            .collect();
        let mut copies = Vec::new();
        while !pending.is_empty() {
            let ready = (0..pending.len()).find(|&candidate| {
                let target = pending[candidate].1;
                !pending.iter().enumerate().any(|(other, (value, _))| {
                    other != candidate && self.results.handle(*value).register() == Some(target)
                })
            });
            match ready {
                Some(index) => {
                    let (argument, target) = pending.remove(index);
                    copies.push(self.copy_to(argument, register_handle(target))?);
                }
                None => {
                    let target = pending[0].1;
                    let Some(&(blocker, _)) = pending
                        .iter()
                        .find(|(value, _)| self.results.handle(*value).register() == Some(target))
                    else {
                        return Err(CompileError::codegen("argument cycle without a blocker"));
                    };
                    let reg = self.get_next_register(target.is_media(), &targets)?;
                    self.relocate(blocker, register_handle(reg))?;
                }
            }
        }

        let hidden: Vec<InstructionParameter> = copies
            .iter()
            .map(|&copy| {
                let format = self.results.format(copy);
                InstructionParameter::source(copy, format.size(), vec![register_kind(format)])
                    .with(ParameterFlags::HIDDEN | ParameterFlags::LOCKED | ParameterFlags::NO_ATTACH)
            })
            .collect();
        self.current_mut().parameters.extend(hidden);
        let id = self.current().id;
        self.set_stack_arguments(id, stack_arguments);
        self.reindex();
        self.build_parameters()?;
        self.unlock_to(mark);

        self.registers.reset_volatile();
        if let Some(result) = self.current().result {
            let media = self.results.format(result).is_decimal();
            let reg = self
                .registers
                .return_register(media)
                .ok_or_else(|| CompileError::codegen("target has no return register"))?;
            self.results.set_handle(result, register_handle(reg));
            self.registers.attach(reg, result);
        }
        Ok(())
    }

    fn build_return(&mut self, value: Option<ResultId>) -> CompileResult<()> {
        let mark = self.locks.len();
        if let Some(value) = value {
            let media = self.results.format(value).is_decimal();
            let reg = self
                .registers
                .return_register(media)
                .ok_or_else(|| CompileError::codegen("target has no return register"))?;
            self.lock(reg);
            let copy = self.copy_to(value, register_handle(reg))?;
            let format = self.results.format(value);
            let parameter = InstructionParameter::source(copy, format.size(), vec![register_kind(format)])
                .with(ParameterFlags::HIDDEN | ParameterFlags::LOCKED | ParameterFlags::NO_ATTACH);
            self.current_mut().parameters.push(parameter);
            self.reindex();
        }
        self.build_parameters()?;
        self.unlock_to(mark);
        Ok(())
    }
}
