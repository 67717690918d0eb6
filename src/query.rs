//! Query module: wraps compiled queries and provides the main execution API.
//!
//! This module provides the CompiledQuery type and the SyntaxFlowEngine that owns the native
//! call registry shared by every query it compiles.

use crate::ast::Query;
use crate::compiler::QueryCompiler;
use crate::config::FrameConfig;
use crate::flow::VarFlowGraph;
use crate::frame::{Frame, OpTiming};
use crate::functions::NativeCallRegistry;
use crate::ir::Instruction;
use crate::result::QueryResult;
use crate::value::Values;
use crate::SyntaxFlowError;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Everything one successful run produced.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub result: QueryResult,
    pub graph: VarFlowGraph,
    /// Empty unless diagnostics were enabled.
    pub timings: Vec<OpTiming>,
}

/// A compiled query, ready for execution. Cheap to clone and to run from several threads.
#[derive(Clone)]
pub struct CompiledQuery {
    program: Arc<Vec<Instruction>>,
    registry: Arc<NativeCallRegistry>,
}

impl CompiledQuery {
    pub fn new(query: &Query, registry: Arc<NativeCallRegistry>) -> Result<Self, SyntaxFlowError> {
        let program = QueryCompiler::compile(query)?;
        Ok(Self { program: Arc::new(program), registry })
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.program
    }

    /// A fresh frame over this program, for callers that want to inspect partial state after a
    /// fatal error.
    pub fn frame(&self, config: FrameConfig) -> Frame {
        Frame::new(Arc::clone(&self.program), config, Arc::clone(&self.registry))
    }

    /// Execute the query against `input`.
    pub fn execute(&self, input: Values, config: FrameConfig) -> Result<QueryOutcome, SyntaxFlowError> {
        let mut frame = self.frame(config);
        frame.run(input)?;
        let (result, graph, timings) = frame.into_parts();
        Ok(QueryOutcome { result, graph, timings })
    }

    /// The program, one instruction per line.
    pub fn listing(&self) -> String {
        self.program.iter().enumerate().map(|(i, inst)| format!("{:4}: {}\n", i, inst)).collect()
    }
}

impl fmt::Debug for CompiledQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledQuery").field("instructions", &self.program.len()).finish()
    }
}

/// Compiles queries against one native call registry.
#[derive(Debug, Clone)]
pub struct SyntaxFlowEngine {
    registry: Arc<NativeCallRegistry>,
}

impl Default for SyntaxFlowEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntaxFlowEngine {
    /// An engine with the built-in native calls registered.
    pub fn new() -> Self {
        Self::with_registry(Arc::new(NativeCallRegistry::with_builtins()))
    }

    pub fn with_registry(registry: Arc<NativeCallRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<NativeCallRegistry> {
        &self.registry
    }

    pub fn compile(&self, query: &Query) -> Result<CompiledQuery, SyntaxFlowError> {
        CompiledQuery::new(query, Arc::clone(&self.registry))
    }

    /// Compile and run in one go.
    pub fn execute(&self, query: &Query, input: Values, config: FrameConfig) -> Result<QueryOutcome, SyntaxFlowError> {
        self.compile(query)?.execute(input, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ChainBuilder;
    use crate::functions::NativeCallOutput;
    use crate::memory::MemoryProgram;
    use crate::value::{ConstValue, IrOpcode};

    #[test]
    fn test_compiled_query_execute() {
        let prog = MemoryProgram::new();
        prog.add("aaa", IrOpcode::Const);
        prog.add("bbb", IrOpcode::Const);
        let engine = SyntaxFlowEngine::new();
        let query = engine.compile(&Query::new().chain(ChainBuilder::search("aaa").bind("target"))).unwrap();
        assert_eq!(query.instructions().len(), 2);
        let outcome = query.execute(prog.values(), FrameConfig::default()).unwrap();
        assert_eq!(outcome.result.symbol("target").unwrap().names(), vec!["aaa"]);
        assert!(outcome.timings.is_empty());
    }

    #[test]
    fn test_compile_error_surfaces() {
        let engine = SyntaxFlowEngine::new();
        let err = engine.compile(&Query::new().chain(ChainBuilder::search("/(/"))).unwrap_err();
        assert!(matches!(err, SyntaxFlowError::Syntax(_)));
    }

    #[test]
    fn test_injected_registry() {
        let registry = Arc::new(NativeCallRegistry::new());
        registry.register_fn("tag", |_, _, _| Ok(NativeCallOutput::single(ConstValue::string("tagged"))));
        let engine = SyntaxFlowEngine::with_registry(registry);
        let prog = MemoryProgram::new();
        prog.add("a", IrOpcode::Const);
        let query = Query::new().chain(ChainBuilder::search("a").native("tag", &[]).bind("t"));
        let outcome = engine.execute(&query, prog.values(), FrameConfig::default()).unwrap();
        assert_eq!(outcome.result.symbol("t").unwrap().names(), vec!["tagged"]);
        // builtins are not there unless asked for
        assert!(!engine.registry().contains("name"));
    }

    #[test]
    fn test_listing_and_reuse() {
        let prog = MemoryProgram::new();
        prog.add("a", IrOpcode::Const);
        let query = SyntaxFlowEngine::new().compile(&Query::new().chain(ChainBuilder::search("a").bind("x"))).unwrap();
        assert_eq!(query.listing(), "   0: search-exact a [name]\n   1: update-ref $x\n");
        let first = query.execute(prog.values(), FrameConfig::default()).unwrap();
        let second = query.execute(prog.values(), FrameConfig::default()).unwrap();
        assert_eq!(first.result.symbol("x"), second.result.symbol("x"));
    }
}
