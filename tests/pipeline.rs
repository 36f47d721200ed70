// End to end tests of the compilation pipeline. Each test builds a function tree, compiles it
// through FunctionCompiler and inspects the finalized instructions: the shape of simple
// functions on both targets, the layout of a counted loop, the treatment of a call whose result
// is discarded, and that optimized and unoptimized output compute the same values when run on
// the test interpreter.

//! Pipeline scenarios.

mod common;

use bumpalo::Bump;
use codeflow::flow::tree::{BinaryOperator, ComparisonOperator, NodeKind, Type};
use codeflow::flow::{FlowElement, Jump, JumpCondition};
use codeflow::{CompilationSession, CompileOptions, Flow, Format, Function, FunctionCompiler, Opcode, Target, Tree};
use common::{execute, Lcg};

fn compile(function: &Function, options: CompileOptions) -> codeflow::CompiledFunction {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    FunctionCompiler::new(&session, options)
        .compile(function)
        .expect("function compiles")
}

fn count(compiled: &codeflow::CompiledFunction, predicate: impl Fn(&Opcode) -> bool) -> usize {
    compiled
        .instructions
        .iter()
        .filter(|instruction| predicate(&instruction.opcode))
        .count()
}

/// `f(a, b) { return a + b }`
fn add_function() -> Function {
    let mut tree = Tree::new();
    let a = tree.add_variable("a", Type::Scalar(Format::I64));
    let b = tree.add_variable("b", Type::Scalar(Format::I64));
    let left = tree.read(a);
    let right = tree.read(b);
    let sum = tree.binary(BinaryOperator::Add, left, right);
    let ret = tree.return_value(Some(sum));
    let body = tree.block(vec![ret]);
    Function::new("f", tree, vec![a, b], Some(Format::I64), body)
}

/// `f(n) { x = 0; loop (i = 0, i < 10, i += 1) { x += i }; return x + n }`
fn counting_loop() -> (Function, codeflow::flow::NodeId, Vec<codeflow::flow::NodeId>) {
    let mut tree = Tree::new();
    let n = tree.add_variable("n", Type::Scalar(Format::I64));
    let x = tree.add_variable("x", Type::Scalar(Format::I64));
    let i = tree.add_variable("i", Type::Scalar(Format::I64));

    let zero = tree.constant(0, Format::I64);
    let clear = tree.assign(x, zero);

    let start = tree.constant(0, Format::I64);
    let initialization = tree.assign(i, start);
    let read_i = tree.read(i);
    let ten = tree.constant(10, Format::I64);
    let condition = tree.compare(ComparisonOperator::Less, read_i, ten);
    let step_i = tree.read(i);
    let one = tree.constant(1, Format::I64);
    let next = tree.binary(BinaryOperator::Add, step_i, one);
    let action = tree.assign(i, next);

    let read_x = tree.read(x);
    let body_i = tree.read(i);
    let accumulated = tree.binary(BinaryOperator::Add, read_x, body_i);
    let accumulate = tree.assign(x, accumulated);
    let body = tree.block(vec![accumulate]);
    let looped = tree.add(
        NodeKind::Loop {
            initialization: Some(initialization),
            condition: Some(condition),
            action: Some(action),
            body,
        },
        None,
    );

    let result_x = tree.read(x);
    let read_n = tree.read(n);
    let total = tree.binary(BinaryOperator::Add, result_x, read_n);
    let ret = tree.return_value(Some(total));
    let function_body = tree.block(vec![clear, looped, ret]);
    let function = Function::new("count", tree, vec![n], Some(Format::I64), function_body);
    (function, looped, vec![read_x, body_i, accumulated, accumulate])
}

#[test]
fn test_add_on_arm64_is_one_add_and_one_return() {
    let compiled = compile(&add_function(), CompileOptions::default().with_target(Target::Arm64));
    assert_eq!(count(&compiled, |opcode| matches!(opcode, Opcode::Arithmetic(_))), 1);
    assert_eq!(count(&compiled, |opcode| *opcode == Opcode::Return), 1);
    assert_eq!(compiled.instructions.len(), 2, "{:?}", compiled.listing(Target::Arm64));
    assert_eq!(execute(Target::Arm64, &compiled.instructions, &[40, 2]), 42);
}

#[test]
fn test_add_on_x64() {
    let compiled = compile(&add_function(), CompileOptions::default());
    assert_eq!(count(&compiled, |opcode| matches!(opcode, Opcode::Arithmetic(_))), 1);
    assert_eq!(compiled.instructions.last().map(|i| &i.opcode), Some(&Opcode::Return));
    assert_eq!(execute(Target::X64, &compiled.instructions, &[-7, 3]), -4);
}

#[test]
fn test_counting_loop_layout() {
    let (function, looped, body_nodes) = counting_loop();
    let flow = Flow::new(&function).expect("loop linearizes");
    let labels = flow.loop_labels(looped).expect("loop has labels");

    let start = flow.label_position(labels.start).expect("start label placed");
    let end = flow.label_position(labels.end).expect("end label placed");
    assert!(start < end);

    // The exit test comes right after the start label and before the body.
    let exits: Vec<usize> = flow
        .incoming(labels.end)
        .iter()
        .copied()
        .filter(|&position| {
            matches!(
                flow.element(position),
                Some(FlowElement::Jump(Jump {
                    condition: Some(JumpCondition { when: false, .. }),
                    ..
                }))
            )
        })
        .collect();
    assert_eq!(exits.len(), 1);
    let first_body = flow.position(body_nodes[0]).expect("body placed");
    assert!(start < exits[0] && exits[0] < first_body);

    // The back jump closes the loop after the action.
    let back: Vec<usize> = flow
        .incoming(labels.start)
        .iter()
        .copied()
        .filter(|&position| matches!(flow.element(position), Some(FlowElement::Jump(Jump { condition: None, .. }))))
        .collect();
    assert_eq!(back.len(), 1);
    assert_eq!(back[0] + 1, end);

    for node in body_nodes {
        assert!(flow.is_repeated(node).expect("node placed"));
    }
}

#[test]
fn test_counting_loop_runs_on_both_targets() {
    let (function, _, _) = counting_loop();
    for target in [Target::X64, Target::Arm64] {
        for debug in [false, true] {
            for optimize in [false, true] {
                let options = CompileOptions::default()
                    .with_target(target)
                    .with_debug(debug)
                    .with_optimize(optimize);
                let compiled = compile(&function, options);
                let backward = compiled.instructions.iter().enumerate().any(|(at, instruction)| {
                    let Opcode::Jump { label, .. } = instruction.opcode else {
                        return false;
                    };
                    compiled.instructions[..at]
                        .iter()
                        .any(|earlier| earlier.opcode == Opcode::Label(label))
                });
                assert!(backward, "{target} debug={debug}: {:?}", compiled.listing(target));
                assert_eq!(execute(target, &compiled.instructions, &[100]), 145);
            }
        }
    }
}

#[test]
fn test_discarded_call_result_is_not_a_tail_call() {
    let mut tree = Tree::new();
    let call = tree.call("g", Vec::new(), Some(Format::I64));
    let five = tree.constant(5, Format::I64);
    let ret = tree.return_value(Some(five));
    let body = tree.block(vec![call, ret]);
    let function = Function::new("h", tree, Vec::new(), Some(Format::I64), body);

    for target in [Target::X64, Target::Arm64] {
        let compiled = compile(&function, CompileOptions::default().with_target(target));
        let listing = compiled.listing(target);
        assert_eq!(count(&compiled, |opcode| matches!(opcode, Opcode::TailJump(_))), 0, "{listing:?}");
        assert_eq!(count(&compiled, |opcode| matches!(opcode, Opcode::Call { .. })), 1, "{listing:?}");
        assert_eq!(count(&compiled, |opcode| *opcode == Opcode::Move), 1, "{listing:?}");
        assert_eq!(compiled.instructions.last().map(|i| &i.opcode), Some(&Opcode::Return));
    }
}

#[test]
fn test_forwarded_call_becomes_tail_jump() {
    let mut tree = Tree::new();
    let a = tree.add_variable("a", Type::Scalar(Format::I64));
    let read = tree.read(a);
    let call = tree.call("g", vec![read], Some(Format::I64));
    let ret = tree.return_value(Some(call));
    let body = tree.block(vec![ret]);
    let function = Function::new("forward", tree, vec![a], Some(Format::I64), body);

    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let compiled = FunctionCompiler::new(&session, CompileOptions::default())
        .compile(&function)
        .expect("function compiles");
    assert_eq!(compiled.listing(Target::X64), vec!["epilogue", "jmp g"]);
    assert_eq!(session.stats().tail_calls, 1);
}

#[test]
fn test_stack_arguments_block_tail_calls() {
    let mut tree = Tree::new();
    let arguments: Vec<_> = (0..8).map(|i| tree.constant(i, Format::I64)).collect();
    let call = tree.call("wide", arguments, Some(Format::I64));
    let ret = tree.return_value(Some(call));
    let body = tree.block(vec![ret]);
    let function = Function::new("caller", tree, Vec::new(), Some(Format::I64), body);

    let compiled = compile(&function, CompileOptions::default());
    let call = compiled
        .instructions
        .iter()
        .find_map(|instruction| match &instruction.opcode {
            Opcode::Call { stack_arguments, .. } => Some(*stack_arguments),
            _ => None,
        })
        .expect("call is kept");
    assert_eq!(call, 2);
    assert_eq!(count(&compiled, |opcode| matches!(opcode, Opcode::TailJump(_))), 0);
}

#[test]
fn test_division_and_remainder() {
    let mut tree = Tree::new();
    let a = tree.add_variable("a", Type::Scalar(Format::I64));
    let b = tree.add_variable("b", Type::Scalar(Format::I64));
    let (ra, rb) = (tree.read(a), tree.read(b));
    let quotient = tree.binary(BinaryOperator::Divide, ra, rb);
    let (ra, rb) = (tree.read(a), tree.read(b));
    let remainder = tree.binary(BinaryOperator::Remainder, ra, rb);
    let scaled = tree.constant(1000, Format::I64);
    let high = tree.binary(BinaryOperator::Multiply, quotient, scaled);
    let combined = tree.binary(BinaryOperator::Add, high, remainder);
    let ret = tree.return_value(Some(combined));
    let body = tree.block(vec![ret]);
    let function = Function::new("divmod", tree, vec![a, b], Some(Format::I64), body);

    let mut random = Lcg::new(17);
    for target in [Target::X64, Target::Arm64] {
        let compiled = compile(&function, CompileOptions::default().with_target(target));
        for _ in 0..20 {
            let a = random.range(-10_000, 10_000);
            let b = random.range(1, 97);
            assert_eq!(
                execute(target, &compiled.instructions, &[a, b]),
                a / b * 1000 + a % b,
                "{target}: {a} {b} {:?}",
                compiled.listing(target)
            );
        }
    }
}

#[test]
fn test_shifts() {
    let mut tree = Tree::new();
    let a = tree.add_variable("a", Type::Scalar(Format::I64));
    let c = tree.add_variable("c", Type::Scalar(Format::I64));
    let (ra, rc) = (tree.read(a), tree.read(c));
    let left = tree.binary(BinaryOperator::ShiftLeft, ra, rc);
    let three = tree.constant(3, Format::I64);
    let right = tree.binary(BinaryOperator::ShiftRight, left, three);
    let ret = tree.return_value(Some(right));
    let body = tree.block(vec![ret]);
    let function = Function::new("shifts", tree, vec![a, c], Some(Format::I64), body);

    for target in [Target::X64, Target::Arm64] {
        let compiled = compile(&function, CompileOptions::default().with_target(target));
        assert_eq!(execute(target, &compiled.instructions, &[5, 6]), (5 << 6) >> 3);
        assert_eq!(execute(target, &compiled.instructions, &[-9, 4]), (-9 << 4) >> 3);
    }
}
