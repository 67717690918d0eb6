//! Context module: operand stack, condition stack and open condition blocks of one run.
//!
//! The three advance together, so they live behind one type. A `?{...}` block is opened with
//! [`ExecContext::enter_condition`] and must be closed with [`ExecContext::exit_condition`], which
//! verifies the block left exactly one condition entry behind.

use crate::condition::ConditionEntry;
use crate::value::Values;
use crate::{critical, SyntaxFlowError};

#[derive(Debug, Default)]
pub struct ExecContext {
    stack: Vec<Values>,
    conditions: Vec<ConditionEntry>,
    /// Condition-stack depth at the time each open block was entered.
    scopes: Vec<usize>,
}

impl ExecContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, values: Values) {
        self.stack.push(values);
    }

    pub fn pop(&mut self) -> Result<Values, SyntaxFlowError> {
        self.stack.pop().ok_or_else(|| critical("pop from empty operand stack"))
    }

    pub fn peek(&self) -> Result<&Values, SyntaxFlowError> {
        self.stack.last().ok_or_else(|| critical("peek on empty operand stack"))
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn push_condition(&mut self, entry: ConditionEntry) {
        self.conditions.push(entry);
    }

    pub fn pop_condition(&mut self) -> Result<ConditionEntry, SyntaxFlowError> {
        self.conditions.pop().ok_or_else(|| critical("pop from empty condition stack"))
    }

    pub fn condition_len(&self) -> usize {
        self.conditions.len()
    }

    pub fn enter_condition(&mut self) {
        self.scopes.push(self.conditions.len());
    }

    pub fn exit_condition(&mut self) -> Result<(), SyntaxFlowError> {
        let base = self.scopes.pop().ok_or_else(|| critical("filter exit without a matching enter"))?;
        if self.conditions.len() != base + 1 {
            return Err(critical(format!(
                "filter block left {} condition entries, expected 1",
                self.conditions.len() as isize - base as isize
            )));
        }
        Ok(())
    }

    pub fn in_condition(&self) -> bool {
        !self.scopes.is_empty()
    }

    pub fn condition_depth(&self) -> usize {
        self.scopes.len()
    }

    /// End-of-run check: no block may still be open and no flags may be left over.
    pub fn finish(&self) -> Result<(), SyntaxFlowError> {
        if !self.scopes.is_empty() {
            return Err(critical(format!("{} condition block(s) still open at end of run", self.scopes.len())));
        }
        if !self.conditions.is_empty() {
            return Err(critical(format!("{} unconsumed condition entries at end of run", self.conditions.len())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{ConditionFilter, ConditionKind, EvidenceNode};

    fn entry() -> ConditionEntry {
        ConditionEntry {
            flags: vec![],
            evidence: EvidenceNode::leaf(ConditionKind::OpcodeCondition, ConditionFilter::default(), &Values::new(), &[]),
        }
    }

    #[test]
    fn test_pop_empty_is_critical() {
        let mut ctx = ExecContext::new();
        assert!(ctx.pop().unwrap_err().is_critical());
        assert!(ctx.peek().unwrap_err().is_critical());
        assert!(ctx.pop_condition().unwrap_err().is_critical());
    }

    #[test]
    fn test_push_pop_order() {
        let mut ctx = ExecContext::new();
        ctx.push(Values::new());
        ctx.push(Values::new());
        assert_eq!(ctx.stack_len(), 2);
        ctx.pop().unwrap();
        ctx.pop().unwrap();
        assert!(ctx.pop().is_err());
    }

    #[test]
    fn test_condition_scope_balance() {
        let mut ctx = ExecContext::new();
        ctx.enter_condition();
        assert!(ctx.in_condition());
        ctx.push_condition(entry());
        ctx.exit_condition().unwrap();
        assert!(!ctx.in_condition());
        ctx.pop_condition().unwrap();
        ctx.finish().unwrap();
    }

    #[test]
    fn test_condition_scope_imbalance_is_critical() {
        let mut ctx = ExecContext::new();
        ctx.enter_condition();
        ctx.push_condition(entry());
        ctx.push_condition(entry());
        assert!(ctx.exit_condition().unwrap_err().is_critical());
        assert!(ctx.exit_condition().unwrap_err().is_critical());
    }

    #[test]
    fn test_finish_detects_open_block() {
        let mut ctx = ExecContext::new();
        ctx.enter_condition();
        ctx.enter_condition();
        assert_eq!(ctx.condition_depth(), 2);
        assert!(ctx.finish().unwrap_err().is_critical());
    }
}
