// Lifetime soundness of lowered functions. After lowering and reindexing, every connection set
// must be active exactly from its first to its last use: start never exceeds end, each use lies
// inside the interval, and the interval is no wider than the uses require. The functions cover
// straight-line code, branch chains and loops with break and continue, in normal and debug mode.

//! Lifetime soundness.

mod common;

use bumpalo::Bump;
use codeflow::assembler::{Lowering, Unit};
use codeflow::core::{FunctionFrame, ResultId};
use codeflow::flow::tree::{BinaryOperator, ComparisonOperator, NodeKind, Type};
use codeflow::{Flow, Format, Function, Target, Tree};
use common::break_continue_loop;
use hashbrown::HashMap;

fn branchy() -> Function {
    let mut tree = Tree::new();
    let a = tree.add_variable("a", Type::Scalar(Format::I64));
    let b = tree.add_variable("b", Type::Scalar(Format::I64));
    let r = tree.add_variable("r", Type::Scalar(Format::I64));

    let (ra, rb) = (tree.read(a), tree.read(b));
    let less = tree.compare(ComparisonOperator::Less, ra, rb);
    let ra = tree.read(a);
    let first = tree.assign(r, ra);
    let first_body = tree.block(vec![first]);

    let (ra, rb) = (tree.read(a), tree.read(b));
    let equal = tree.compare(ComparisonOperator::Equal, ra, rb);
    let hundred = tree.constant(100, Format::I64);
    let second = tree.assign(r, hundred);
    let second_body = tree.block(vec![second]);
    let else_if = tree.add(
        NodeKind::ElseIf {
            condition: equal,
            body: second_body,
        },
        None,
    );

    let (rb, ra) = (tree.read(b), tree.read(a));
    let difference = tree.binary(BinaryOperator::Subtract, rb, ra);
    let third = tree.assign(r, difference);
    let third_body = tree.block(vec![third]);
    let otherwise = tree.add(NodeKind::Else { body: third_body }, None);

    let branch = tree.add(
        NodeKind::If {
            condition: less,
            body: first_body,
            successors: vec![else_if, otherwise],
        },
        None,
    );
    let (rr, ra) = (tree.read(r), tree.read(a));
    let total = tree.binary(BinaryOperator::Add, rr, ra);
    let ret = tree.return_value(Some(total));
    let body = tree.block(vec![branch, ret]);
    Function::new("branchy", tree, vec![a, b], Some(Format::I64), body)
}

fn straight() -> Function {
    let mut tree = Tree::new();
    let a = tree.add_variable("a", Type::Scalar(Format::I64));
    let b = tree.add_variable("b", Type::Scalar(Format::I64));
    let (ra, rb) = (tree.read(a), tree.read(b));
    let product = tree.binary(BinaryOperator::Multiply, ra, rb);
    let ra = tree.read(a);
    let sum = tree.binary(BinaryOperator::Add, product, ra);
    let ret = tree.return_value(Some(sum));
    let body = tree.block(vec![ret]);
    Function::new("straight", tree, vec![a, b], Some(Format::I64), body)
}

fn check(function: &Function, target: Target, debug: bool) {
    let arena = Bump::new();
    let flow = Flow::new(function).expect("function linearizes");
    let mut unit = Unit::new(target, debug, FunctionFrame::new(&arena));
    Lowering::new(&mut unit, function, &flow).lower().expect("function lowers");
    unit.reindex();

    let mut expected: HashMap<ResultId, (usize, usize)> = HashMap::new();
    for (position, instruction) in unit.instructions.iter().enumerate() {
        let mut pending = instruction.uses();
        while let Some(result) = pending.pop() {
            let root = unit.results.root(result);
            let span = expected.entry(root).or_insert((position, position));
            span.0 = span.0.min(position);
            span.1 = span.1.max(position);
            pending.extend(unit.results.handle(result).dependencies());
        }
    }

    for root in unit.results.roots() {
        let lifetime = unit.results.lifetime(root);
        match expected.get(&root) {
            Some(&(first, last)) => {
                let (start, end) = (lifetime.start.expect("used"), lifetime.end.expect("used"));
                assert!(start <= end, "{} {root:?}: {lifetime:?}", function.name);
                assert_eq!((start, end), (first, last), "{} {root:?}", function.name);
                for position in first..=last {
                    assert!(lifetime.is_active(position));
                }
                assert!(!lifetime.is_active(last + 1));
            }
            None => assert!(lifetime.start.is_none() && lifetime.end.is_none(), "{root:?} was never used"),
        }
    }
}

#[test]
fn test_lifetimes_cover_exactly_their_uses() {
    let _ = env_logger::builder().is_test(true).try_init();
    for function in [straight(), branchy(), break_continue_loop()] {
        for target in [Target::X64, Target::Arm64] {
            for debug in [false, true] {
                check(&function, target, debug);
            }
        }
    }
}
