//! Value module: the contract every IR value from the analysis engine satisfies.
//!
//! This module provides the [`ValueOperator`] trait, the flattened [`Values`] identity set that
//! every opcode consumes and produces, and [`ConstValue`] for literals created inside a query.

use crate::config::FrameConfig;
use crate::ir::{FileFilterMode, RecursiveConfigItem};
use crate::pattern::{GlobPattern, MatchMode};
use crate::result::QueryResult;
use crate::SyntaxFlowError;
use indexmap::IndexMap;
use regex::Regex;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

/// Stable identity of an IR value.
pub type ValueId = i64;

/// Shared handle to a value owned by the analysis engine.
pub type ValueRef = Arc<dyn ValueOperator>;

/// Opcode of the IR instruction behind a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IrOpcode {
    Const,
    Call,
    Phi,
    Param,
    Return,
    Function,
    Make,
    BinOp,
    UnOp,
    Undefined,
}

impl IrOpcode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IrOpcode::Const => "const",
            IrOpcode::Call => "call",
            IrOpcode::Phi => "phi",
            IrOpcode::Param => "param",
            IrOpcode::Return => "return",
            IrOpcode::Function => "function",
            IrOpcode::Make => "make",
            IrOpcode::BinOp => "binop",
            IrOpcode::UnOp => "unop",
            IrOpcode::Undefined => "undefined",
        }
    }
}

impl FromStr for IrOpcode {
    type Err = SyntaxFlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "const" | "constant" => Ok(IrOpcode::Const),
            "call" => Ok(IrOpcode::Call),
            "phi" => Ok(IrOpcode::Phi),
            "param" | "formal_param" => Ok(IrOpcode::Param),
            "return" => Ok(IrOpcode::Return),
            "function" | "func" => Ok(IrOpcode::Function),
            "make" => Ok(IrOpcode::Make),
            "binop" => Ok(IrOpcode::BinOp),
            "unop" => Ok(IrOpcode::UnOp),
            "undefined" => Ok(IrOpcode::Undefined),
            other => Err(SyntaxFlowError::Syntax(format!("unknown opcode name: {}", other))),
        }
    }
}

impl fmt::Display for IrOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A constant literal, either written in a query or exposed by an IR constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    String(String),
    Number(f64),
    Bool(bool),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => f.write_str(s),
            Literal::Number(n) => write!(f, "{}", n),
            Literal::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Provenance edge appended to a value when an opcode produced it.
#[derive(Debug, Clone)]
pub struct Provenance {
    /// The value it was reached from, if any.
    pub predecessor: Option<ValueRef>,
    /// Textual analysis-context label, usually the rendered instruction.
    pub label: String,
}

/// Everything a bounded traversal needs besides the value itself.
pub struct TraversalContext<'a> {
    pub config_items: &'a [RecursiveConfigItem],
    pub result: &'a QueryResult,
    pub frame_config: &'a FrameConfig,
}

impl TraversalContext<'_> {
    /// Look up a configuration item by its key name.
    pub fn item(&self, key: &str) -> Option<&str> {
        self.config_items.iter().find(|i| i.key.as_str() == key).map(|i| i.value.as_str())
    }
}

/// Capability set of one IR value (or a list-shaped group of values).
///
/// Identity is unconditional: every implementation returns a stable [`ValueId`], and all set
/// algebra in the engine relies on it.
pub trait ValueOperator: Send + Sync + fmt::Debug {
    fn id(&self) -> ValueId;

    /// Symbol name, e.g. `aaa` for a variable or `exec` for a function.
    fn name(&self) -> String;

    /// Member key when the value is a field of an object.
    fn key(&self) -> Option<String> {
        None
    }

    /// Human readable rendering.
    fn text(&self) -> String;

    fn ir_opcode(&self) -> IrOpcode;

    fn const_literal(&self) -> Option<Literal> {
        None
    }

    fn is_list(&self) -> bool {
        false
    }

    fn list_elements(&self) -> Vec<ValueRef> {
        Vec::new()
    }

    fn exact_match(&self, mode: MatchMode, want: &str) -> bool {
        (mode.has_name() && self.name() == want) || (mode.has_key() && self.key().as_deref() == Some(want))
    }

    fn glob_match(&self, mode: MatchMode, pattern: &GlobPattern) -> bool {
        (mode.has_name() && pattern.matches(&self.name()))
            || (mode.has_key() && self.key().map(|k| pattern.matches(&k)).unwrap_or(false))
    }

    fn regexp_match(&self, mode: MatchMode, re: &Regex) -> bool {
        (mode.has_name() && re.is_match(&self.name()))
            || (mode.has_key() && self.key().map(|k| re.is_match(&k)).unwrap_or(false))
    }

    /// Call sites that call this value.
    fn get_called(&self) -> Result<Values, SyntaxFlowError>;

    fn get_fields(&self) -> Result<Values, SyntaxFlowError>;

    /// Actual argument `index` of a call; with `contain_rest` every following argument too.
    fn get_call_actual_params(&self, index: usize, contain_rest: bool) -> Result<Values, SyntaxFlowError>;

    fn get_all_call_actual_params(&self) -> Result<Values, SyntaxFlowError>;

    fn get_syntax_flow_use(&self, ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError>;

    fn get_syntax_flow_def(&self, ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError>;

    fn get_syntax_flow_top_def(&self, ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError>;

    fn get_syntax_flow_bottom_use(&self, ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError>;

    fn file_filter(
        &self,
        _path: &str,
        _mode: FileFilterMode,
        _params: &IndexMap<String, String>,
        _rules: &[String],
    ) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn append_predecessor(&self, provenance: Provenance);
}

/// Ordered identity set of values. Nested list values are flattened on insertion.
#[derive(Clone, Default)]
pub struct Values {
    items: IndexMap<ValueId, ValueRef>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(value: ValueRef) -> Self {
        let mut values = Self::new();
        values.push(value);
        values
    }

    pub fn from_vec(values: Vec<ValueRef>) -> Self {
        let mut out = Self::new();
        for v in values {
            out.push(v);
        }
        out
    }

    /// Insert a value, flattening list-shaped values.
    pub fn push(&mut self, value: ValueRef) {
        let mut seen_lists = HashSet::new();
        self.push_flat(value, &mut seen_lists);
    }

    fn push_flat(&mut self, value: ValueRef, seen_lists: &mut HashSet<ValueId>) {
        if value.is_list() {
            if !seen_lists.insert(value.id()) {
                return;
            }
            for element in value.list_elements() {
                self.push_flat(element, seen_lists);
            }
            return;
        }
        self.items.entry(value.id()).or_insert(value);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ValueRef> {
        self.items.get_index(index).map(|(_, v)| v)
    }

    pub fn contains(&self, id: ValueId) -> bool {
        self.items.contains_key(&id)
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ValueRef> {
        self.items.values()
    }

    pub fn ids(&self) -> Vec<ValueId> {
        self.items.keys().copied().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.iter().map(|v| v.name()).collect()
    }

    /// Union by identity, keeping `self`'s order first.
    pub fn merge(&self, other: &Values) -> Values {
        let mut out = self.clone();
        out.extend(other);
        out
    }

    pub fn extend(&mut self, other: &Values) {
        for (id, v) in &other.items {
            self.items.entry(*id).or_insert_with(|| Arc::clone(v));
        }
    }

    /// Elements of `self` whose identity is not in `other`.
    pub fn remove(&self, other: &Values) -> Values {
        self.retain_by(|id| !other.contains(id))
    }

    pub fn intersect(&self, other: &Values) -> Values {
        self.retain_by(|id| other.contains(id))
    }

    fn retain_by(&self, keep: impl Fn(ValueId) -> bool) -> Values {
        let items = self.items.iter().filter(|(id, _)| keep(**id)).map(|(id, v)| (*id, Arc::clone(v))).collect();
        Values { items }
    }

    /// Keep the elements whose flag is true, preserving order. Lengths must already agree.
    pub(crate) fn filter_by_flags(&self, flags: &[bool]) -> Values {
        let items = self
            .items
            .iter()
            .zip(flags)
            .filter(|(_, keep)| **keep)
            .map(|((id, v), _)| (*id, Arc::clone(v)))
            .collect();
        Values { items }
    }

    /// Split into (matched, unmatched) by flag.
    pub(crate) fn partition_by_flags(&self, flags: &[bool]) -> (Values, Values) {
        let negated: Vec<bool> = flags.iter().map(|f| !f).collect();
        (self.filter_by_flags(flags), self.filter_by_flags(&negated))
    }
}

impl fmt::Debug for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.values().map(|v| v.name())).finish()
    }
}

impl fmt::Display for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v.text())?;
        }
        write!(f, "]")
    }
}

impl PartialEq for Values {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len() && self.items.keys().zip(other.items.keys()).all(|(a, b)| a == b)
    }
}

impl FromIterator<ValueRef> for Values {
    fn from_iter<I: IntoIterator<Item = ValueRef>>(iter: I) -> Self {
        let mut out = Values::new();
        for v in iter {
            out.push(v);
        }
        out
    }
}

#[derive(Serialize)]
struct ValueSummary {
    id: ValueId,
    name: String,
    text: String,
}

impl Serialize for Values {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for v in self.iter() {
            seq.serialize_element(&ValueSummary { id: v.id(), name: v.name(), text: v.text() })?;
        }
        seq.end()
    }
}

/// A literal created by the query itself (`"abc"`, `1`, `true`) or by a native call.
///
/// Identity is derived from the literal so equal constants collapse in a [`Values`] set. The
/// derived ids are negative and never collide with engine-assigned ones.
#[derive(Debug, Clone)]
pub struct ConstValue {
    id: ValueId,
    literal: Literal,
}

impl ConstValue {
    pub fn new(literal: Literal) -> Self {
        let mut hasher = DefaultHasher::new();
        match &literal {
            Literal::String(s) => (0u8, s).hash(&mut hasher),
            Literal::Number(n) => (1u8, n.to_bits()).hash(&mut hasher),
            Literal::Bool(b) => (2u8, b).hash(&mut hasher),
        }
        let id = -((hasher.finish() >> 1) as i64) - 1;
        Self { id, literal }
    }

    pub fn string(s: impl Into<String>) -> ValueRef {
        Arc::new(Self::new(Literal::String(s.into())))
    }

    pub fn literal(&self) -> &Literal {
        &self.literal
    }
}

impl ValueOperator for ConstValue {
    fn id(&self) -> ValueId {
        self.id
    }

    fn name(&self) -> String {
        self.literal.to_string()
    }

    fn text(&self) -> String {
        match &self.literal {
            Literal::String(s) => format!("{:?}", s),
            other => other.to_string(),
        }
    }

    fn ir_opcode(&self) -> IrOpcode {
        IrOpcode::Const
    }

    fn const_literal(&self) -> Option<Literal> {
        Some(self.literal.clone())
    }

    fn get_called(&self) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn get_fields(&self) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn get_call_actual_params(&self, _index: usize, _contain_rest: bool) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn get_all_call_actual_params(&self) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn get_syntax_flow_use(&self, _ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn get_syntax_flow_def(&self, _ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn get_syntax_flow_top_def(&self, _ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn get_syntax_flow_bottom_use(&self, _ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        Ok(Values::new())
    }

    fn append_predecessor(&self, _provenance: Provenance) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProgram;

    #[test]
    fn test_values_dedup_by_identity() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Const);
        let b = prog.add("b", IrOpcode::Const);
        let values = Values::from_vec(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(values.names(), vec!["a", "b"]);
    }

    #[test]
    fn test_values_flatten_nested_lists() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Const);
        let b = prog.add("b", IrOpcode::Const);
        let c = prog.add("c", IrOpcode::Const);
        let inner = prog.add_list(vec![b.clone(), c.clone()]);
        let outer = prog.add_list(vec![a.clone(), inner.clone()]);
        let values = Values::single(outer);
        assert_eq!(values.names(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_values_self_referencing_list_terminates() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Const);
        let list = prog.add_list(vec![a.clone()]);
        prog.push_list_element(&list, list.clone());
        let values = Values::single(list);
        assert_eq!(values.names(), vec!["a"]);
    }

    #[test]
    fn test_set_algebra() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Const);
        let b = prog.add("b", IrOpcode::Const);
        let c = prog.add("c", IrOpcode::Const);
        let ab = Values::from_vec(vec![a.clone(), b.clone()]);
        let bc = Values::from_vec(vec![b.clone(), c.clone()]);
        assert_eq!(ab.merge(&bc).names(), vec!["a", "b", "c"]);
        assert_eq!(ab.remove(&bc).names(), vec!["a"]);
        assert_eq!(ab.intersect(&bc).names(), vec!["b"]);
    }

    #[test]
    fn test_filter_by_flags_is_stable() {
        let prog = MemoryProgram::new();
        let vals: Vec<ValueRef> = (0..5).map(|i| prog.add(&format!("v{}", i), IrOpcode::Const)).collect();
        let values = Values::from_vec(vals);
        let kept = values.filter_by_flags(&[true, false, true, false, true]);
        assert_eq!(kept.names(), vec!["v0", "v2", "v4"]);
        let (matched, unmatched) = values.partition_by_flags(&[false, true, false, true, false]);
        assert_eq!(matched.names(), vec!["v1", "v3"]);
        assert_eq!(unmatched.names(), vec!["v0", "v2", "v4"]);
    }

    #[test]
    fn test_const_value_identity() {
        let a = ConstValue::new(Literal::String("x".into()));
        let b = ConstValue::new(Literal::String("x".into()));
        let c = ConstValue::new(Literal::Number(1.0));
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert!(a.id() < 0);
    }

    #[test]
    fn test_default_match_primitives() {
        let prog = MemoryProgram::new();
        let obj = prog.add("obj", IrOpcode::Make);
        let field = prog.add_field(&obj, "password", "secret", IrOpcode::Const);
        assert!(field.exact_match(MatchMode::NAME, "secret"));
        assert!(!field.exact_match(MatchMode::NAME, "password"));
        assert!(field.exact_match(MatchMode::KEY, "password"));
        assert!(field.glob_match(MatchMode::BOTH, &GlobPattern::new("pass*")));
        assert!(field.regexp_match(MatchMode::NAME, &Regex::new("^sec").unwrap()));
    }

    #[test]
    fn test_opcode_from_str() {
        assert_eq!("const".parse::<IrOpcode>().unwrap(), IrOpcode::Const);
        assert!("bogus".parse::<IrOpcode>().is_err());
    }

    #[test]
    fn test_values_serialize() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Const);
        let json = serde_json::to_value(Values::single(a.clone())).unwrap();
        assert_eq!(json[0]["name"], "a");
        assert_eq!(json[0]["id"], a.id());
    }
}
