// Allocation safety under pressure and at merge points. The compiled code is run on the test
// interpreter and its result is compared with the value computed in Rust: more live values than
// the register pool holds force spills, and loops with break, continue and inner branches force
// the scopes to agree on where each variable lives whenever control flow joins.

//! Register allocation scenarios.

mod common;

use bumpalo::Bump;
use codeflow::flow::tree::{BinaryOperator, ComparisonOperator, NodeKind, Type};
use codeflow::{CompilationSession, CompileOptions, Format, Function, FunctionCompiler, Target, Tree};
use common::{break_continue_loop, execute, Lcg};

const VALUES: i64 = 32;

/// `v_k = a * k + b` for 32 values, all kept alive until they are summed.
fn pressure() -> Function {
    let mut tree = Tree::new();
    let a = tree.add_variable("a", Type::Scalar(Format::I64));
    let b = tree.add_variable("b", Type::Scalar(Format::I64));

    let mut statements = Vec::new();
    let mut values = Vec::new();
    for k in 0..VALUES {
        let v = tree.add_variable(&format!("v{k}"), Type::Scalar(Format::I64));
        let ra = tree.read(a);
        let factor = tree.constant(k, Format::I64);
        let product = tree.binary(BinaryOperator::Multiply, ra, factor);
        let rb = tree.read(b);
        let value = tree.binary(BinaryOperator::Add, product, rb);
        statements.push(tree.assign(v, value));
        values.push(v);
    }

    let s = tree.add_variable("s", Type::Scalar(Format::I64));
    let zero = tree.constant(0, Format::I64);
    statements.push(tree.assign(s, zero));
    for v in values {
        let (rs, rv) = (tree.read(s), tree.read(v));
        let sum = tree.binary(BinaryOperator::Add, rs, rv);
        statements.push(tree.assign(s, sum));
    }
    let rs = tree.read(s);
    statements.push(tree.return_value(Some(rs)));
    let body = tree.block(statements);
    Function::new("pressure", tree, vec![a, b], Some(Format::I64), body)
}

/// `s = 0; loop (i = 0, i < n, i += 1) { if i & 1 == 0 { s += i } else { s -= 1 } }; return s`
fn alternating() -> Function {
    let mut tree = Tree::new();
    let n = tree.add_variable("n", Type::Scalar(Format::I64));
    let s = tree.add_variable("s", Type::Scalar(Format::I64));
    let i = tree.add_variable("i", Type::Scalar(Format::I64));

    let zero = tree.constant(0, Format::I64);
    let clear = tree.assign(s, zero);
    let zero = tree.constant(0, Format::I64);
    let initialization = tree.assign(i, zero);
    let (ri, rn) = (tree.read(i), tree.read(n));
    let condition = tree.compare(ComparisonOperator::Less, ri, rn);
    let ri = tree.read(i);
    let one = tree.constant(1, Format::I64);
    let next = tree.binary(BinaryOperator::Add, ri, one);
    let action = tree.assign(i, next);

    let ri = tree.read(i);
    let one = tree.constant(1, Format::I64);
    let low = tree.binary(BinaryOperator::And, ri, one);
    let zero = tree.constant(0, Format::I64);
    let even = tree.compare(ComparisonOperator::Equal, low, zero);
    let (rs, ri) = (tree.read(s), tree.read(i));
    let added = tree.binary(BinaryOperator::Add, rs, ri);
    let add = tree.assign(s, added);
    let add_body = tree.block(vec![add]);
    let rs = tree.read(s);
    let one = tree.constant(1, Format::I64);
    let lowered = tree.binary(BinaryOperator::Subtract, rs, one);
    let subtract = tree.assign(s, lowered);
    let subtract_body = tree.block(vec![subtract]);
    let otherwise = tree.add(NodeKind::Else { body: subtract_body }, None);
    let branch = tree.add(
        NodeKind::If {
            condition: even,
            body: add_body,
            successors: vec![otherwise],
        },
        None,
    );
    let body = tree.block(vec![branch]);
    let looped = tree.add(
        NodeKind::Loop {
            initialization: Some(initialization),
            condition: Some(condition),
            action: Some(action),
            body,
        },
        None,
    );
    let rs = tree.read(s);
    let ret = tree.return_value(Some(rs));
    let function_body = tree.block(vec![clear, looped, ret]);
    Function::new("alternating", tree, vec![n], Some(Format::I64), function_body)
}

fn all_options() -> Vec<CompileOptions> {
    let mut options = Vec::new();
    for target in [Target::X64, Target::Arm64] {
        for debug in [false, true] {
            for optimize in [false, true] {
                options.push(
                    CompileOptions::default()
                        .with_target(target)
                        .with_debug(debug)
                        .with_optimize(optimize),
                );
            }
        }
    }
    options
}

#[test]
fn test_register_pressure_spills_and_stays_correct() {
    let _ = env_logger::builder().is_test(true).try_init();
    let function = pressure();
    let mut random = Lcg::new(7);
    for options in all_options() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let compiled = FunctionCompiler::new(&session, options)
            .compile(&function)
            .expect("function compiles");
        // Debug mode keeps variables in their slots, so only the register mode spills.
        if !options.debug {
            assert!(session.stats().spills_generated > 0, "{options:?}");
        }
        for _ in 0..5 {
            let (a, b) = (random.range(-1000, 1000), random.range(-1000, 1000));
            let expected = a * (VALUES * (VALUES - 1) / 2) + VALUES * b;
            assert_eq!(
                execute(options.target, &compiled.instructions, &[a, b]),
                expected,
                "{options:?}: {:?}",
                compiled.listing(options.target)
            );
        }
    }
}

fn expected_break_continue(n: i64, skip: i64, stop: i64) -> i64 {
    let mut s = 0;
    for i in 0..n {
        if i == skip {
            continue;
        }
        if i == stop {
            break;
        }
        s += i;
    }
    s
}

#[test]
fn test_break_and_continue_merge_consistently() {
    let _ = env_logger::builder().is_test(true).try_init();
    let function = break_continue_loop();
    for options in all_options() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let compiled = FunctionCompiler::new(&session, options)
            .compile(&function)
            .expect("function compiles");
        for n in [0, 1, 4, 9] {
            for skip in [0, 2, 7] {
                for stop in [3, 6, 50] {
                    assert_eq!(
                        execute(options.target, &compiled.instructions, &[n, skip, stop]),
                        expected_break_continue(n, skip, stop),
                        "{options:?} n={n} skip={skip} stop={stop}: {:?}",
                        compiled.listing(options.target)
                    );
                }
            }
        }
    }
}

#[test]
fn test_branch_inside_loop() {
    let function = alternating();
    for options in all_options() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let compiled = FunctionCompiler::new(&session, options)
            .compile(&function)
            .expect("function compiles");
        for n in 0..12 {
            let expected: i64 = (0..n).map(|i| if i % 2 == 0 { i } else { -1 }).sum();
            assert_eq!(
                execute(options.target, &compiled.instructions, &[n]),
                expected,
                "{options:?} n={n}"
            );
        }
    }
}
