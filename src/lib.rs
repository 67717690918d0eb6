//! SyntaxFlow: a query compiler and stack-based virtual machine for rule matching over program IR.
//!
//! A rule author writes a small declarative query (search a symbol, filter by opcode or string,
//! follow use-def chains, bind results to named variables, raise an alert). The query AST is
//! compiled into a linear instruction sequence which a [`Frame`] executes against values supplied
//! by an external analysis engine through the [`ValueOperator`] contract.
//!
//! # Architecture
//! - Value contract and the flattened [`Values`] set
//! - Query AST (produced by an external parser) and the [`QueryCompiler`]
//! - Instruction set ([`Instruction`])
//! - Execution engine ([`Frame`]) with operand, condition and iterator stacks
//! - Recursive search, condition evaluation and evidence trees
//! - Variable-flow graph recording why each variable holds what it holds
//! - Injectable native call registry for `<name(...)>` extensions

mod ast;
mod compiler;
mod condition;
mod config;
mod context;
mod evidence;
mod flow;
mod frame;
mod functions;
mod ir;
mod iter;
pub mod memory;
mod pattern;
mod query;
mod result;
mod search;
mod value;

pub use ast::*;
pub use compiler::*;
pub use condition::*;
pub use config::*;
pub use context::*;
pub use evidence::*;
pub use flow::*;
pub use frame::*;
pub use functions::*;
pub use ir::*;
pub use iter::*;
pub use pattern::*;
pub use query::*;
pub use result::*;
pub use search::*;
pub use value::*;

use thiserror::Error;

/// Unified error type for SyntaxFlow operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyntaxFlowError {
    /// The query is malformed from the rule author's point of view.
    #[error("Syntax error: {0}")]
    Syntax(String),
    /// An engine or compiler invariant was violated.
    #[error("Critical: {0}")]
    Critical(String),
    /// A `check` failed while fail-fast was enabled.
    #[error("Abort: {0}")]
    Abort(String),
    /// A value operation reported by the analysis engine.
    #[error("Value error: {0}")]
    Value(String),
    /// Malformed recursive configuration handed to a traversal.
    #[error("Config error: {0}")]
    Config(String),
    #[error("Native call not found: {0}")]
    NativeCallNotFound(String),
    #[error("no analysis step")]
    NoAnalysisStep,
}

impl SyntaxFlowError {
    /// Critical errors signal a bug in the engine or compiler, never a rule mistake.
    pub fn is_critical(&self) -> bool {
        matches!(self, SyntaxFlowError::Critical(_))
    }

    /// Errors that terminate the current run instead of being recorded in the result.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyntaxFlowError::Critical(_) | SyntaxFlowError::Abort(_) | SyntaxFlowError::Config(_)
        )
    }
}

pub(crate) fn critical(msg: impl Into<String>) -> SyntaxFlowError {
    SyntaxFlowError::Critical(msg.into())
}
