//! Config module: run-time options recognised by a [`Frame`](crate::Frame).
//!
//! This module provides the FrameConfig type and a builder for it.

use crate::value::Values;
use crate::SyntaxFlowError;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Invoked whenever a named binding is produced.
pub type ResultCapturedFn = Arc<dyn Fn(&str, &Values) -> Result<(), SyntaxFlowError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FrameConfig {
    /// Disable the implicit key-match fallback of searches.
    pub strict_match: bool,
    /// Abort on the first failing `check`.
    pub fail_fast: bool,
    /// Variables seeded into the symbol table before execution.
    pub initial_context: IndexMap<String, Values>,
    pub on_result_captured: Option<ResultCapturedFn>,
    /// Time value operations per opcode.
    pub diagnostics: bool,
}

impl FrameConfig {
    pub fn builder() -> FrameConfigBuilder {
        FrameConfigBuilder::default()
    }
}

impl fmt::Debug for FrameConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameConfig")
            .field("strict_match", &self.strict_match)
            .field("fail_fast", &self.fail_fast)
            .field("initial_context", &self.initial_context.keys().collect::<Vec<_>>())
            .field("on_result_captured", &self.on_result_captured.is_some())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

#[derive(Default)]
pub struct FrameConfigBuilder {
    config: FrameConfig,
}

impl FrameConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict_match(mut self, strict: bool) -> Self {
        self.config.strict_match = strict;
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    /// Seed a variable. Later calls with the same name win.
    pub fn variable(mut self, name: impl Into<String>, values: Values) -> Self {
        self.config.initial_context.insert(name.into(), values);
        self
    }

    pub fn on_result_captured<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &Values) -> Result<(), SyntaxFlowError> + Send + Sync + 'static,
    {
        self.config.on_result_captured = Some(Arc::new(f));
        self
    }

    pub fn diagnostics(mut self, enabled: bool) -> Self {
        self.config.diagnostics = enabled;
        self
    }

    pub fn build(self) -> FrameConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProgram;
    use crate::value::IrOpcode;

    #[test]
    fn test_builder_sets_options() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Const);
        let config = FrameConfig::builder()
            .strict_match(true)
            .fail_fast(true)
            .variable("a", Values::single(a))
            .diagnostics(true)
            .on_result_captured(|_, _| Ok(()))
            .build();
        assert!(config.strict_match);
        assert!(config.fail_fast);
        assert!(config.diagnostics);
        assert!(config.on_result_captured.is_some());
        assert_eq!(config.initial_context["a"].names(), vec!["a"]);
    }

    #[test]
    fn test_builder_overwrite_variable() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Const);
        let b = prog.add("b", IrOpcode::Const);
        let config = FrameConfig::builder().variable("x", Values::single(a)).variable("x", Values::single(b)).build();
        // Last one wins
        assert_eq!(config.initial_context["x"].names(), vec!["b"]);
        assert!(format!("{:?}", config).contains("strict_match: false"));
    }
}
