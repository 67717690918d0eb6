//! Frame module: executes a compiled instruction sequence against a set of values.
//!
//! Dispatch tries three groups in order (conditions and logic, value navigation, stack and
//! symbol bookkeeping). Fatal errors stop the run and leave the partial state on the frame;
//! recoverable ones are appended to the result and execution continues.

use crate::condition::{self, ConditionEntry};
use crate::config::FrameConfig;
use crate::context::ExecContext;
use crate::evidence::{ConditionFilter, ConditionKind, EvidenceNode};
use crate::flow::{StepType, VarFlowGraph};
use crate::functions::{NativeCallParams, NativeCallRegistry};
use crate::ir::{FileFilterMode, Instruction, RecursiveConfigItem};
use crate::iter::ValueIter;
use crate::pattern::{compile_regex, MatchMode};
use crate::result::{CheckRecord, QueryResult};
use crate::search::recursive_search;
use crate::value::{ConstValue, Literal, Provenance, TraversalContext, ValueRef, Values};
use crate::{critical, SyntaxFlowError};
use indexmap::IndexMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// Name `Pop { bind_anonymous: true }` binds to.
pub const ANONYMOUS_SYMBOL: &str = "_";

/// Time spent in one value-navigation instruction, collected when diagnostics are enabled.
#[derive(Debug, Clone, Serialize)]
pub struct OpTiming {
    pub pc: usize,
    pub instruction: String,
    pub elapsed: Duration,
    pub produced: usize,
}

pub struct Frame {
    program: Arc<Vec<Instruction>>,
    config: FrameConfig,
    registry: Arc<NativeCallRegistry>,
    ctx: ExecContext,
    iters: Vec<ValueIter>,
    result: QueryResult,
    graph: VarFlowGraph,
    pc: usize,
    timings: Vec<OpTiming>,
}

impl Frame {
    pub fn new(program: Arc<Vec<Instruction>>, config: FrameConfig, registry: Arc<NativeCallRegistry>) -> Self {
        Self {
            program,
            config,
            registry,
            ctx: ExecContext::new(),
            iters: Vec::new(),
            result: QueryResult::new(),
            graph: VarFlowGraph::new(),
            pc: 0,
            timings: Vec::new(),
        }
    }

    /// Run the program from the start with `input` as the root values.
    #[instrument(level = "debug", skip_all, fields(instructions = self.program.len(), input = input.len()))]
    pub fn run(&mut self, input: Values) -> Result<(), SyntaxFlowError> {
        self.seed_symbols();
        self.ctx.push(input);
        self.pc = 0;
        let program = Arc::clone(&self.program);
        while let Some(inst) = program.get(self.pc) {
            trace!(pc = self.pc, %inst, "dispatch");
            self.pc += 1;
            if let Err(e) = self.execute(inst) {
                if e.is_critical() {
                    warn!(pc = self.pc - 1, %inst, error = %e, "critical error, run aborted");
                } else {
                    debug!(pc = self.pc - 1, %inst, error = %e, "run aborted");
                }
                return Err(e);
            }
        }
        self.ctx.finish()?;
        if !self.iters.is_empty() {
            return Err(critical(format!("{} iterator(s) still open at end of run", self.iters.len())));
        }
        debug!(
            symbols = self.result.symbol_table().len(),
            errors = self.result.errors().len(),
            steps = self.graph.steps().len(),
            "run finished"
        );
        Ok(())
    }

    pub(crate) fn seed_symbols(&mut self) {
        for (name, values) in &self.config.initial_context {
            self.result.set_symbol(name, values.clone());
        }
    }

    fn execute(&mut self, inst: &Instruction) -> Result<(), SyntaxFlowError> {
        if self.exec_condition(inst)? {
            return Ok(());
        }
        let started = self.config.diagnostics.then(Instant::now);
        if self.exec_navigation(inst)? {
            if let Some(started) = started {
                let produced = self.ctx.peek().map(|v| v.len()).unwrap_or(0);
                self.timings.push(OpTiming { pc: self.pc - 1, instruction: inst.to_string(), elapsed: started.elapsed(), produced });
            }
            return Ok(());
        }
        if self.exec_stack(inst)? {
            return Ok(());
        }
        Err(critical(format!("undefined opcode: {}", inst)))
    }

    // === Conditions and logic ===

    fn exec_condition(&mut self, inst: &Instruction) -> Result<bool, SyntaxFlowError> {
        match inst {
            Instruction::FilterEnter => self.ctx.enter_condition(),
            Instruction::FilterExit => self.ctx.exit_condition()?,
            Instruction::CompareOpcode(opcodes) => {
                let values = self.ctx.pop()?;
                self.ctx.push_condition(condition::eval_opcode(&values, opcodes));
            }
            Instruction::CompareString { mode, conditions } => {
                let values = self.ctx.pop()?;
                let entry = condition::eval_strings(&values, *mode, conditions).map_err(into_critical)?;
                self.ctx.push_condition(entry);
            }
            Instruction::CompareName(cond) => {
                let values = self.ctx.pop()?;
                let entry = condition::eval_name(&values, cond).map_err(into_critical)?;
                self.ctx.push_condition(entry);
            }
            Instruction::VersionIn(ranges) => {
                let values = self.ctx.pop()?;
                self.ctx.push_condition(condition::eval_version(&values, ranges));
            }
            Instruction::Compare(op) => {
                let literal = self.ctx.pop()?;
                let literal = literal
                    .get(0)
                    .and_then(|v| v.const_literal())
                    .ok_or_else(|| critical("compare: right-hand side is not a literal"))?;
                let values = self.ctx.pop()?;
                self.ctx.push_condition(condition::eval_relational(&values, *op, &literal));
            }
            Instruction::LogicAnd => {
                let rhs = self.ctx.pop_condition()?;
                let lhs = self.ctx.pop_condition()?;
                self.ctx.push_condition(condition::logic_and(lhs, rhs)?);
            }
            Instruction::LogicOr => {
                let rhs = self.ctx.pop_condition()?;
                let lhs = self.ctx.pop_condition()?;
                self.ctx.push_condition(condition::logic_or(lhs, rhs)?);
            }
            Instruction::LogicNot => {
                let entry = self.ctx.pop_condition()?;
                self.ctx.push_condition(condition::logic_not(entry));
            }
            Instruction::Condition => {
                let entry = self.ctx.pop_condition()?;
                let values = self.ctx.pop()?;
                if entry.flags.len() != values.len() {
                    return Err(critical(format!(
                        "condition: {} flags for {} values",
                        entry.flags.len(),
                        values.len()
                    )));
                }
                let kept = values.filter_by_flags(&entry.flags);
                if !self.ctx.in_condition() {
                    self.graph.create_step(StepType::ConditionFilter, inst.to_string(), Some(entry.evidence), kept.len(), false);
                } else if let Some(iter) = self.iters.last_mut() {
                    // nested filter inside a sub-query; folded into the sub-query's evidence
                    iter.attach_evidence(entry.evidence)?;
                }
                self.ctx.push(kept);
            }
            Instruction::IterStart => {
                let values = self.ctx.pop()?;
                self.iters.push(ValueIter::spawn(values));
            }
            Instruction::IterNext { exit } => {
                let iter = self.iters.last_mut().ok_or_else(|| critical("iter-next without an iterator"))?;
                match iter.next_value() {
                    Some(value) => self.ctx.push(Values::single(value)),
                    None => self.jump(*exit)?,
                }
            }
            Instruction::IterCollect => {
                let produced = self.ctx.pop()?;
                let iter = self.iters.last_mut().ok_or_else(|| critical("iter-collect without an iterator"))?;
                iter.record(!produced.is_empty())?;
            }
            Instruction::IterEnd { description } => {
                let iter = self.iters.pop().ok_or_else(|| critical("iter-end without an iterator"))?;
                let (values, flags, nested) = iter.finish();
                let filter = ConditionFilter { conditions: vec![description.clone()], ..Default::default() };
                let evidence = EvidenceNode::leaf(ConditionKind::FilterCondition, filter, &values, &flags).with_nested(nested);
                self.ctx.push_condition(ConditionEntry { flags, evidence });
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    // === Value navigation ===

    fn exec_navigation(&mut self, inst: &Instruction) -> Result<bool, SyntaxFlowError> {
        if !inst.is_navigation() {
            return Ok(false);
        }
        let label = inst.to_string();
        match inst {
            Instruction::SearchExact { name, mode } => {
                let values = self.ctx.pop()?;
                let mode = self.effective_mode(*mode);
                let hits = self.search(&values, &label, |v| v.exact_match(mode, name));
                if hits.is_empty() && mode.has_name() {
                    self.record_error(format!("{}: no value matched {:?}", label, name));
                }
                self.step(StepType::Search, &label, hits.len());
                self.ctx.push(hits);
            }
            Instruction::SearchGlob { pattern, mode } => {
                let values = self.ctx.pop()?;
                let mode = self.effective_mode(*mode);
                let hits = self.search(&values, &label, |v| v.glob_match(mode, pattern));
                self.step(StepType::Search, &label, hits.len());
                self.ctx.push(hits);
            }
            Instruction::SearchRegexp { pattern, mode } => {
                let values = self.ctx.pop()?;
                let mode = self.effective_mode(*mode);
                let re = compile_regex(pattern)?;
                let hits = self.search(&values, &label, |v| v.regexp_match(mode, &re));
                self.step(StepType::Search, &label, hits.len());
                self.ctx.push(hits);
            }
            Instruction::RecursiveSearchExact { name, mode } => {
                let values = self.ctx.pop()?;
                let mode = self.effective_mode(*mode);
                let hits = self.recursive(&values, &label, |v| Ok(v.exact_match(mode, name)))?;
                self.step(StepType::Search, &label, hits.len());
                self.ctx.push(hits);
            }
            Instruction::RecursiveSearchGlob { pattern, mode } => {
                let values = self.ctx.pop()?;
                let mode = self.effective_mode(*mode);
                let hits = self.recursive(&values, &label, |v| Ok(v.glob_match(mode, pattern)))?;
                self.step(StepType::Search, &label, hits.len());
                self.ctx.push(hits);
            }
            Instruction::RecursiveSearchRegexp { pattern, mode } => {
                let values = self.ctx.pop()?;
                let mode = self.effective_mode(*mode);
                let re = compile_regex(pattern)?;
                let hits = self.recursive(&values, &label, |v| Ok(v.regexp_match(mode, &re)))?;
                self.step(StepType::Search, &label, hits.len());
                self.ctx.push(hits);
            }
            Instruction::GetCall => {
                let values = self.ctx.pop()?;
                let out = self.map_each(&values, &label, |v| v.get_called())?;
                self.step(StepType::Transform, &label, out.len());
                self.ctx.push(out);
            }
            Instruction::GetCallArgs { index, is_all } => {
                let values = self.ctx.peek()?.clone();
                let out = self.map_each(&values, &label, |v| v.get_call_actual_params(*index, *is_all))?;
                self.step(StepType::Transform, &label, out.len());
                self.ctx.push(out);
            }
            Instruction::GetAllCallArgs => {
                let values = self.ctx.pop()?;
                let out = self.map_each(&values, &label, |v| v.get_all_call_actual_params())?;
                self.step(StepType::Transform, &label, out.len());
                self.ctx.push(out);
            }
            Instruction::GetFields => {
                let values = self.ctx.pop()?;
                let out = self.map_each(&values, &label, |v| v.get_fields())?;
                self.step(StepType::Transform, &label, out.len());
                self.ctx.push(out);
            }
            Instruction::ListIndex(index) => {
                let values = self.ctx.pop()?;
                let out = values.get(*index).cloned().map(Values::single).unwrap_or_default();
                self.step(StepType::Transform, &label, out.len());
                self.ctx.push(out);
            }
            Instruction::GetUsers(items) => self.data_flow(items, &label, |v, ctx| v.get_syntax_flow_use(ctx))?,
            Instruction::GetDefs(items) => self.data_flow(items, &label, |v, ctx| v.get_syntax_flow_def(ctx))?,
            Instruction::GetBottomUsers(items) => {
                self.data_flow(items, &label, |v, ctx| v.get_syntax_flow_bottom_use(ctx))?
            }
            Instruction::GetTopDefs(items) => self.data_flow(items, &label, |v, ctx| v.get_syntax_flow_top_def(ctx))?,
            Instruction::NativeCall { name, params } => self.native_call(name, params, &label)?,
            Instruction::FileFilterRegexp { path, params, rules } => {
                self.file_filter(FileFilterMode::Regexp, path, params, rules, &label)?
            }
            Instruction::FileFilterJsonPath { path, params, rules } => {
                self.file_filter(FileFilterMode::JsonPath, path, params, rules, &label)?
            }
            Instruction::FileFilterXPath { path, params, rules } => {
                self.file_filter(FileFilterMode::XPath, path, params, rules, &label)?
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn recursive(
        &mut self,
        values: &Values,
        label: &str,
        is_hit: impl FnMut(&ValueRef) -> Result<bool, SyntaxFlowError>,
    ) -> Result<Values, SyntaxFlowError> {
        let (hits, errors) = recursive_search(values, label, is_hit)?;
        for e in errors {
            self.record_error(e);
        }
        Ok(hits)
    }

    fn effective_mode(&self, mode: MatchMode) -> MatchMode {
        if self.config.strict_match {
            mode
        } else {
            mode | MatchMode::KEY
        }
    }

    fn search(&self, values: &Values, label: &str, matches: impl Fn(&ValueRef) -> bool) -> Values {
        let hits: Values = values.iter().filter(|v| matches(*v)).cloned().collect();
        for hit in hits.iter() {
            hit.append_predecessor(Provenance { predecessor: None, label: label.to_string() });
        }
        hits
    }

    /// Apply `op` to every element, linking results back to the element they came from.
    fn map_each(
        &mut self,
        values: &Values,
        label: &str,
        op: impl Fn(&ValueRef) -> Result<Values, SyntaxFlowError>,
    ) -> Result<Values, SyntaxFlowError> {
        let (out, errors) = collect_each(values, label, op)?;
        for e in errors {
            self.record_error(e);
        }
        Ok(out)
    }

    fn data_flow(
        &mut self,
        items: &[RecursiveConfigItem],
        label: &str,
        op: impl Fn(&ValueRef, &TraversalContext<'_>) -> Result<Values, SyntaxFlowError>,
    ) -> Result<(), SyntaxFlowError> {
        let values = self.ctx.pop()?;
        let traversal = TraversalContext { config_items: items, result: &self.result, frame_config: &self.config };
        let (out, errors) = collect_each(&values, label, |v| op(v, &traversal))?;
        for e in errors {
            self.record_error(e);
        }
        self.step(StepType::DataFlow, label, out.len());
        self.ctx.push(out);
        Ok(())
    }

    fn native_call(&mut self, name: &str, params: &[(String, String)], label: &str) -> Result<(), SyntaxFlowError> {
        let values = self.ctx.pop()?;
        let call = match self.registry.lookup(name) {
            Ok(call) => call,
            Err(e) => {
                self.record_error(e.to_string());
                self.ctx.push(Values::new());
                return Ok(());
            }
        };
        let params = NativeCallParams::new(params);
        let mut out = Values::new();
        for value in values.iter() {
            match call.call(value, self, &params) {
                Ok(output) if output.handled => {
                    for produced in output.values.iter() {
                        produced.append_predecessor(Provenance { predecessor: Some(Arc::clone(value)), label: label.to_string() });
                    }
                    out.extend(&output.values);
                }
                Ok(_) => out.push(Arc::clone(value)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => self.record_error(format!("{}: {}", label, e)),
            }
        }
        self.step(StepType::Transform, label, out.len());
        self.ctx.push(out);
        Ok(())
    }

    fn file_filter(
        &mut self,
        mode: FileFilterMode,
        path: &str,
        params: &[(String, String)],
        rules: &[String],
        label: &str,
    ) -> Result<(), SyntaxFlowError> {
        let values = self.ctx.pop()?;
        let params: IndexMap<String, String> = params.iter().cloned().collect();
        let out = self.map_each(&values, label, |v| v.file_filter(path, mode, &params, rules))?;
        self.step(StepType::Search, label, out.len());
        self.ctx.push(out);
        Ok(())
    }

    // === Stack and symbol bookkeeping ===

    fn exec_stack(&mut self, inst: &Instruction) -> Result<bool, SyntaxFlowError> {
        match inst {
            Instruction::Duplicate => {
                let top = self.ctx.peek()?.clone();
                self.ctx.push(top);
            }
            Instruction::Pop { bind_anonymous } => {
                let values = self.ctx.pop()?;
                if *bind_anonymous {
                    self.result.set_symbol(ANONYMOUS_SYMBOL, values);
                }
            }
            Instruction::NewRef(name) => {
                let values = match self.result.symbol(name) {
                    Some(values) => values.clone(),
                    None => {
                        self.result.set_symbol(name, Values::new());
                        Values::new()
                    }
                };
                self.graph.set_source(name);
                self.ctx.push(values);
            }
            Instruction::UpdateRef(name) => {
                let values = self.ctx.pop()?;
                self.bind(name, values)?;
            }
            Instruction::PushString(s) => self.push_literal(Literal::String(s.clone())),
            Instruction::PushNumber(n) => self.push_literal(Literal::Number(*n)),
            Instruction::PushBool(b) => self.push_literal(Literal::Bool(*b)),
            Instruction::MergeRef(name) => self.combine_ref(name, inst, |top, other| top.merge(other))?,
            Instruction::RemoveRef(name) => self.combine_ref(name, inst, |top, other| top.remove(other))?,
            Instruction::IntersectionRef(name) => self.combine_ref(name, inst, |top, other| top.intersect(other))?,
            Instruction::Check { var, then_msg, else_msg } => self.check(var, then_msg, else_msg)?,
            Instruction::Alert { var, extra } => match self.result.symbol(var).filter(|v| !v.is_empty()).cloned() {
                Some(values) => self.result.set_alert(var, values, extra),
                None => self.record_error(format!("alert ${}: symbol is undefined or empty", var)),
            },
            Instruction::AddDescription(items) => self.result.add_description(items),
            Instruction::Jump(target) => self.jump(*target)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn bind(&mut self, name: &str, values: Values) -> Result<(), SyntaxFlowError> {
        match self.graph.commit_flow(name) {
            Ok(_) => {}
            Err(SyntaxFlowError::NoAnalysisStep) => debug!(name, "binding without analysis steps"),
            Err(e) => return Err(e),
        }
        if let Some(callback) = self.config.on_result_captured.clone() {
            if let Err(e) = callback(name, &values) {
                if e.is_fatal() {
                    return Err(e);
                }
                self.record_error(format!("result callback for ${}: {}", name, e));
            }
        }
        self.result.set_symbol(name, values);
        Ok(())
    }

    fn push_literal(&mut self, literal: Literal) {
        let value: ValueRef = Arc::new(ConstValue::new(literal));
        self.ctx.push(Values::single(value));
    }

    fn combine_ref(
        &mut self,
        name: &str,
        inst: &Instruction,
        op: impl Fn(&Values, &Values) -> Values,
    ) -> Result<(), SyntaxFlowError> {
        let top = self.ctx.pop()?;
        let other = self.result.symbol(name).cloned().unwrap_or_default();
        let out = op(&top, &other);
        self.step(StepType::Normal, &inst.to_string(), out.len());
        self.ctx.push(out);
        Ok(())
    }

    fn check(&mut self, var: &str, then_msg: &Option<String>, else_msg: &Option<String>) -> Result<(), SyntaxFlowError> {
        let passed = self.result.symbol(var).map(|v| !v.is_empty()).unwrap_or(false);
        if passed {
            self.result.push_check(CheckRecord { var: var.to_string(), passed, message: then_msg.clone() });
            return Ok(());
        }
        let message = else_msg.clone().unwrap_or_else(|| format!("check ${} failed", var));
        self.result.push_check(CheckRecord { var: var.to_string(), passed, message: Some(message.clone()) });
        self.record_error(message.clone());
        if self.config.fail_fast {
            return Err(SyntaxFlowError::Abort(message));
        }
        Ok(())
    }

    fn jump(&mut self, target: usize) -> Result<(), SyntaxFlowError> {
        if target > self.program.len() {
            return Err(critical(format!("jump target {} out of range", target)));
        }
        self.pc = target;
        Ok(())
    }

    fn step(&mut self, step_type: StepType, label: &str, produced: usize) {
        self.graph.create_step(step_type, label.to_string(), None, produced, self.ctx.in_condition());
    }

    fn record_error(&mut self, message: String) {
        warn!(error = %message, "recoverable error");
        self.result.push_error(message);
    }

    // === Accessors ===

    pub fn traversal_context<'a>(&'a self, items: &'a [RecursiveConfigItem]) -> TraversalContext<'a> {
        TraversalContext { config_items: items, result: &self.result, frame_config: &self.config }
    }

    pub fn symbol(&self, name: &str) -> Option<&Values> {
        self.result.symbol(name)
    }

    pub fn result(&self) -> &QueryResult {
        &self.result
    }

    pub fn graph(&self) -> &VarFlowGraph {
        &self.graph
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn timings(&self) -> &[OpTiming] {
        &self.timings
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn stack_len(&self) -> usize {
        self.ctx.stack_len()
    }

    pub fn into_parts(self) -> (QueryResult, VarFlowGraph, Vec<OpTiming>) {
        (self.result, self.graph, self.timings)
    }
}

/// Collect `op` over every element. Recoverable failures come back as messages; `Config` and
/// other fatal errors propagate.
fn collect_each(
    values: &Values,
    label: &str,
    op: impl Fn(&ValueRef) -> Result<Values, SyntaxFlowError>,
) -> Result<(Values, Vec<String>), SyntaxFlowError> {
    let mut out = Values::new();
    let mut errors = Vec::new();
    for value in values.iter() {
        match op(value) {
            Ok(produced) => {
                for p in produced.iter() {
                    p.append_predecessor(Provenance { predecessor: Some(Arc::clone(value)), label: label.to_string() });
                }
                out.extend(&produced);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => errors.push(format!("{}: {}", label, e)),
        }
    }
    Ok((out, errors))
}

/// Conditions were validated at compile time, so a failure here is an engine fault.
fn into_critical(e: SyntaxFlowError) -> SyntaxFlowError {
    match e {
        SyntaxFlowError::Critical(_) => e,
        other => critical(other.to_string()),
    }
}
