// Randomized equivalence check for the peephole optimizer. Straight-line AArch64 sequences of
// three-operand arithmetic and register moves over x0..x5 are generated from a fixed seed,
// optimized, and both versions are run on the test interpreter with the same inputs. Whatever
// the optimizer inlines or drops, the value returned in x0 must not change.

//! Optimizer equivalence on random code.

mod common;

use codeflow::arm64;
use codeflow::assembler::{ArithmeticOperator, MachineInstruction, MachineOperand, Opcode, ParameterFlags};
use codeflow::core::{AsmReg, HandleKind, Operand};
use codeflow::{Format, Optimizer, Target};
use common::{execute, Lcg};

const DESTINATION: ParameterFlags = ParameterFlags::DESTINATION.union(ParameterFlags::WRITES);
const SOURCE: ParameterFlags = ParameterFlags::SOURCE.union(ParameterFlags::READS);

fn reg(index: u64, flags: ParameterFlags) -> MachineOperand {
    MachineOperand::new(
        Operand::Register(AsmReg::standard(index as u8)),
        Format::I64,
        flags,
        vec![HandleKind::Register],
    )
}

fn random_code(random: &mut Lcg) -> Vec<MachineInstruction> {
    let len = 1 + random.below(12);
    let mut code: Vec<MachineInstruction> = (0..len)
        .map(|_| {
            let destination = reg(random.below(6), DESTINATION);
            if random.below(2) == 0 {
                MachineInstruction::new(Opcode::Move, vec![destination, reg(random.below(6), SOURCE)])
            } else {
                let operator = match random.below(3) {
                    0 => ArithmeticOperator::Add,
                    1 => ArithmeticOperator::Subtract,
                    _ => ArithmeticOperator::Xor,
                };
                MachineInstruction::new(
                    Opcode::Arithmetic(operator),
                    vec![destination, reg(random.below(6), SOURCE), reg(random.below(6), SOURCE)],
                )
            }
        })
        .collect();
    code.push(MachineInstruction::new(
        Opcode::Return,
        vec![reg(0, SOURCE | ParameterFlags::HIDDEN)],
    ));
    code
}

#[test]
fn test_optimized_code_computes_the_same_value() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registers = arm64::register_file();
    let optimizer = Optimizer::new(Target::Arm64, &registers);
    let mut random = Lcg::new(0xc0de);
    let mut removed = 0;
    for _ in 0..500 {
        let original = random_code(&mut random);
        let mut optimized = original.clone();
        removed += optimizer.optimize(&mut optimized).removed;
        assert!(optimized.len() <= original.len());

        let arguments: Vec<i64> = (0..6).map(|_| random.range(-1 << 20, 1 << 20)).collect();
        let render = |code: &[MachineInstruction]| -> Vec<String> {
            code.iter().map(|instruction| instruction.render(&registers)).collect()
        };
        assert_eq!(
            execute(Target::Arm64, &optimized, &arguments),
            execute(Target::Arm64, &original, &arguments),
            "{:?} became {:?}",
            render(&original),
            render(&optimized)
        );
    }
    // Random code is full of dead and self moves.
    assert!(removed > 0);
}
