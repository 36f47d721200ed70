// This module defines the error types of the code generation back end using the thiserror
// crate. CompileError covers every fatal condition of a function compilation: structural
// violations found while linearizing the tree (logical operators outside conditions, loop
// control without a loop, unregistered jump targets, stale flow positions, unsupported
// nodes), register pool exhaustion, illegal handle conversions requested by an instruction
// and general code generation inconsistencies. Each variant carries the context needed to
// locate the problem. CompileResult<T> is the convenience alias used across the crate.
// Non-fatal outcomes, such as a rejected peephole rewrite, are not errors and never use
// this type.

//! Error types for the code generation back end.
//!
//! Using thiserror for idiomatic error handling.

use crate::core::value::HandleKind;
use crate::flow::tree::NodeId;
use thiserror::Error;

/// Main error type for function compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Logical operator {node:?} appears outside of a condition")]
    WildLogicalOperator { node: NodeId },

    #[error("Loop control {node:?} has no enclosing loop")]
    OrphanLoopControl { node: NodeId },

    #[error("Jump targets unregistered label {label}")]
    UnregisteredLabel { label: u32 },

    #[error("Node {node:?} is not part of the flow")]
    UnknownNode { node: NodeId },

    #[error("Flow positions are stale, reindex before querying")]
    StaleFlow,

    #[error("Unsupported node {node:?}: {reason}")]
    UnsupportedNode { node: NodeId, reason: &'static str },

    #[error("All {class} registers were locked")]
    RegistersExhausted { class: &'static str },

    #[error("Could not convert a {from:?} handle into any of {to:?}")]
    IllegalConversion { from: HandleKind, to: Vec<HandleKind> },

    #[error("Code generation failed: {reason}")]
    CodeGeneration { reason: String },
}

impl CompileError {
    pub(crate) fn codegen(reason: impl Into<String>) -> Self {
        CompileError::CodeGeneration {
            reason: reason.into(),
        }
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
