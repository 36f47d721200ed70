// This module simulates register usage before the build and leaves hints on Results. A value
// returned by the function is asked to be produced directly in the return register, and a
// call argument in its argument register, as long as no other call clobbers that register
// in between. Values that stay live across a call are steered to callee-saved registers so
// the call does not force a spill, and on x86-64 values live across a division keep out of
// the two registers the division overwrites. Every hint is anchored to the instruction it
// serves so the allocator stops honoring it once the build has passed that instruction.

//! Register usage simulation.

use crate::assembler::instruction::{InstructionId, InstructionKind};
use crate::assembler::unit::Unit;
use crate::core::calling_convention::assign_all;
use crate::core::results::{Hint, ResultId};
use crate::target::Target;

/// Attaches allocation hints to the Results of an unbuilt unit.
pub fn channel(unit: &mut Unit<'_>) {
    unit.reindex();

    let calls: Vec<usize> = unit
        .instructions
        .iter()
        .filter(|instruction| matches!(instruction.kind, InstructionKind::Call { .. }))
        .map(|instruction| instruction.position)
        .collect();
    let divisions: Vec<usize> = unit
        .instructions
        .iter()
        .filter(|instruction| {
            matches!(instruction.kind, InstructionKind::Division { .. })
                && instruction
                    .parameters
                    .first()
                    .is_some_and(|parameter| !unit.results.format(parameter.result).is_decimal())
        })
        .map(|instruction| instruction.position)
        .collect();
    let call_between = |from: usize, to: usize| calls.iter().any(|&call| from < call && call < to);

    let mut hints: Vec<(ResultId, Hint)> = Vec::new();
    for instruction in &unit.instructions {
        match &instruction.kind {
            InstructionKind::Return { value: Some(value) } => {
                let media = unit.results.format(*value).is_decimal();
                let start = unit.results.lifetime(*value).start.unwrap_or(instruction.position);
                if let Some(register) = unit.registers.return_register(media) {
                    if !call_between(start, instruction.position) {
                        hints.push((
                            *value,
                            Hint::SpecificRegister {
                                register,
                                until: instruction.id,
                            },
                        ));
                    }
                }
            }
            InstructionKind::Call { arguments, .. } => {
                let formats: Vec<_> = arguments.iter().map(|&argument| unit.results.format(argument)).collect();
                let mut assigner = unit.target.assigner();
                let assignments = assign_all(assigner.as_mut(), &formats);
                for (&argument, assignment) in arguments.iter().zip(&assignments) {
                    let Some(register) = assignment.reg else {
                        continue;
                    };
                    let start = unit.results.lifetime(argument).start.unwrap_or(instruction.position);
                    if !call_between(start, instruction.position) {
                        hints.push((
                            argument,
                            Hint::SpecificRegister {
                                register,
                                until: instruction.id,
                            },
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    let ids: Vec<InstructionId> = unit.instructions.iter().map(|instruction| instruction.id).collect();
    let roots: Vec<ResultId> = unit.results.roots().collect();
    for result in roots {
        let lifetime = unit.results.lifetime(result);
        let Some(end) = lifetime.end else {
            continue;
        };
        let until = ids[end];
        if calls.iter().any(|&call| lifetime.is_only_active(call)) {
            hints.push((result, Hint::NonVolatile { until }));
        }
        if unit.target == Target::X64 && divisions.iter().any(|&division| lifetime.is_only_active(division)) {
            hints.push((
                result,
                Hint::AvoidRegisters {
                    registers: unit.target.division_registers().to_vec(),
                    until,
                },
            ));
        }
    }

    log::trace!("register usage simulation left {} hints", hints.len());
    for (result, hint) in hints {
        unit.results.add_hint(result, hint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::instruction::{ArithmeticOperator, InstructionParameter};
    use crate::core::frame::FunctionFrame;
    use crate::core::value::{Format, Handle, HandleKind, Size, Symbol};
    use crate::x64;
    use bumpalo::Bump;

    #[test]
    fn test_return_and_argument_hints() {
        let arena = Bump::new();
        let mut unit = Unit::new(Target::X64, false, FunctionFrame::new(&arena));
        let value = unit.create_result(Handle::None, Format::I64);
        let returned = unit.create_result(Handle::None, Format::I64);
        unit.add(InstructionKind::Negate, Some(value), Vec::new(), Vec::new());
        unit.add(
            InstructionKind::Call {
                function: Symbol::new("g"),
                arguments: vec![value],
            },
            Some(returned),
            Vec::new(),
            Vec::new(),
        );
        unit.add(InstructionKind::Return { value: Some(returned) }, None, Vec::new(), Vec::new());
        channel(&mut unit);

        assert!(matches!(
            &unit.results.get(value).hints[..],
            [Hint::SpecificRegister { register, .. }] if *register == x64::RDI
        ));
        assert!(matches!(
            &unit.results.get(returned).hints[..],
            [Hint::SpecificRegister { register, .. }] if *register == x64::RAX
        ));
    }

    #[test]
    fn test_values_across_calls_prefer_callee_saved() {
        let arena = Bump::new();
        let mut unit = Unit::new(Target::X64, false, FunctionFrame::new(&arena));
        let kept = unit.create_result(Handle::None, Format::I64);
        let sum = unit.create_result(Handle::None, Format::I64);
        unit.add(InstructionKind::Negate, Some(kept), Vec::new(), Vec::new());
        unit.add(
            InstructionKind::Call {
                function: Symbol::new("g"),
                arguments: Vec::new(),
            },
            None,
            Vec::new(),
            Vec::new(),
        );
        unit.add(
            InstructionKind::Arithmetic(ArithmeticOperator::Add),
            Some(sum),
            vec![InstructionParameter::modify(kept, Size::Qword, vec![HandleKind::Register])],
            Vec::new(),
        );
        channel(&mut unit);

        assert!(unit
            .results
            .get(kept)
            .hints
            .iter()
            .any(|hint| matches!(hint, Hint::NonVolatile { .. })));
        assert!(unit.results.get(sum).hints.is_empty());
    }
}
