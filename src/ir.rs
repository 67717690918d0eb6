//! Intermediate Representation (IR) for the query engine.
//!
//! This module defines the bytecode instructions a compiled query is made of. Every instruction
//! transforms whatever [`Values`](crate::Values) sit on top of the operand stack.

use crate::pattern::{GlobPattern, MatchMode};
use crate::value::IrOpcode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of an instruction inside a compiled program.
pub type Label = usize;

/// Key of a recursive-traversal configuration item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecursiveConfigKey {
    Depth,
    DepthMin,
    DepthMax,
    Include,
    Exclude,
    Until,
    Hook,
}

impl RecursiveConfigKey {
    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "depth" => Some(Self::Depth),
            "depth_min" => Some(Self::DepthMin),
            "depth_max" => Some(Self::DepthMax),
            "include" => Some(Self::Include),
            "exclude" => Some(Self::Exclude),
            "until" => Some(Self::Until),
            "hook" => Some(Self::Hook),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Depth => "depth",
            Self::DepthMin => "depth_min",
            Self::DepthMax => "depth_max",
            Self::Include => "include",
            Self::Exclude => "exclude",
            Self::Until => "until",
            Self::Hook => "hook",
        }
    }

    /// Whether the value of this key is a nested rule rather than a number.
    pub fn is_sub_rule(&self) -> bool {
        matches!(self, Self::Include | Self::Exclude | Self::Until | Self::Hook)
    }
}

/// One `key: value` item from a `-{...}->` block, kept verbatim for the analysis engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursiveConfigItem {
    pub key: RecursiveConfigKey,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringMatchMode {
    /// Every condition must match.
    Have,
    /// At least one condition must match.
    Any,
}

impl StringMatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StringMatchMode::Have => "have",
            StringMatchMode::Any => "any",
        }
    }
}

/// How one string condition compares against a value's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StringCondition {
    /// Substring containment.
    Exact(String),
    Glob(GlobPattern),
    Regexp(String),
}

impl StringCondition {
    pub fn as_str(&self) -> &str {
        match self {
            StringCondition::Exact(s) => s,
            StringCondition::Glob(g) => g.as_str(),
            StringCondition::Regexp(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Gt,
    GtEq,
    Lt,
    LtEq,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileFilterMode {
    Regexp,
    JsonPath,
    XPath,
}

impl FileFilterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFilterMode::Regexp => "regexp",
            FileFilterMode::JsonPath => "jsonpath",
            FileFilterMode::XPath => "xpath",
        }
    }
}

/// One bound of a version interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBound {
    pub version: String,
    pub inclusive: bool,
}

/// `[low, high)` style interval; a missing bound is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    pub low: Option<VersionBound>,
    pub high: Option<VersionBound>,
}

/// A single instruction in the query bytecode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // === Stack and symbol bookkeeping ===
    /// Push a copy of the top of the stack.
    Duplicate,
    /// Pop the top of the stack, optionally binding it to `$_`.
    Pop { bind_anonymous: bool },
    /// Push the named symbol, creating an empty entry on first use.
    NewRef(String),
    /// Pop the top of the stack and store it under the name.
    UpdateRef(String),
    PushString(String),
    PushNumber(f64),
    PushBool(bool),
    /// Union of the top of the stack with a symbol.
    MergeRef(String),
    /// Top of the stack without the symbol's values.
    RemoveRef(String),
    IntersectionRef(String),
    Check { var: String, then_msg: Option<String>, else_msg: Option<String> },
    Alert { var: String, extra: Vec<(String, String)> },
    AddDescription(Vec<(String, String)>),

    // === Value navigation ===
    SearchExact { name: String, mode: MatchMode },
    SearchGlob { pattern: GlobPattern, mode: MatchMode },
    SearchRegexp { pattern: String, mode: MatchMode },
    RecursiveSearchExact { name: String, mode: MatchMode },
    RecursiveSearchGlob { pattern: GlobPattern, mode: MatchMode },
    RecursiveSearchRegexp { pattern: String, mode: MatchMode },
    GetCall,
    /// Peeks the call values and pushes argument `index`.
    GetCallArgs { index: usize, is_all: bool },
    GetAllCallArgs,
    GetFields,
    ListIndex(usize),
    GetUsers(Vec<RecursiveConfigItem>),
    GetDefs(Vec<RecursiveConfigItem>),
    GetBottomUsers(Vec<RecursiveConfigItem>),
    GetTopDefs(Vec<RecursiveConfigItem>),
    NativeCall { name: String, params: Vec<(String, String)> },
    FileFilterRegexp { path: String, params: Vec<(String, String)>, rules: Vec<String> },
    FileFilterJsonPath { path: String, params: Vec<(String, String)>, rules: Vec<String> },
    FileFilterXPath { path: String, params: Vec<(String, String)>, rules: Vec<String> },

    // === Conditions and logic ===
    /// Open a `?{...}` block.
    FilterEnter,
    /// Close a `?{...}` block.
    FilterExit,
    CompareOpcode(Vec<IrOpcode>),
    CompareString { mode: StringMatchMode, conditions: Vec<StringCondition> },
    /// Bare glob or regexp name test inside a filter.
    CompareName(StringCondition),
    VersionIn(Vec<VersionRange>),
    /// Pops a literal, then the values, and compares each value against the literal.
    Compare(BinaryOp),
    LogicAnd,
    LogicOr,
    LogicNot,
    /// Pop flags and values, keep the flagged values.
    Condition,
    /// Pop values and start enumerating them lazily.
    IterStart,
    /// Push the next element, or jump to `exit` when exhausted.
    IterNext { exit: Label },
    /// Pop the sub-query result and record whether it was non-empty.
    IterCollect,
    /// Pop the iterator and push its flags as a condition.
    IterEnd { description: String },
    Jump(Label),
}

impl Instruction {
    /// Whether the instruction navigates values (searches, calls, fields, data flow, native calls,
    /// file filters).
    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            Instruction::SearchExact { .. }
                | Instruction::SearchGlob { .. }
                | Instruction::SearchRegexp { .. }
                | Instruction::RecursiveSearchExact { .. }
                | Instruction::RecursiveSearchGlob { .. }
                | Instruction::RecursiveSearchRegexp { .. }
                | Instruction::GetCall
                | Instruction::GetCallArgs { .. }
                | Instruction::GetAllCallArgs
                | Instruction::GetFields
                | Instruction::ListIndex(_)
                | Instruction::GetUsers(_)
                | Instruction::GetDefs(_)
                | Instruction::GetBottomUsers(_)
                | Instruction::GetTopDefs(_)
                | Instruction::NativeCall { .. }
                | Instruction::FileFilterRegexp { .. }
                | Instruction::FileFilterJsonPath { .. }
                | Instruction::FileFilterXPath { .. }
        )
    }
}

fn fmt_items(f: &mut fmt::Formatter<'_>, items: &[RecursiveConfigItem]) -> fmt::Result {
    if items.is_empty() {
        return Ok(());
    }
    write!(f, " {{")?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, " {}: {}", item.key.as_str(), item.value)?;
    }
    write!(f, " }}")
}

fn fmt_pairs(f: &mut fmt::Formatter<'_>, pairs: &[(String, String)]) -> fmt::Result {
    let rendered: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    write!(f, "({})", rendered.join(", "))
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Duplicate => write!(f, "duplicate"),
            Instruction::Pop { bind_anonymous } => {
                if *bind_anonymous {
                    write!(f, "pop -> $_")
                } else {
                    write!(f, "pop")
                }
            }
            Instruction::NewRef(name) => write!(f, "new-ref ${}", name),
            Instruction::UpdateRef(name) => write!(f, "update-ref ${}", name),
            Instruction::PushString(s) => write!(f, "push-string {:?}", s),
            Instruction::PushNumber(n) => write!(f, "push-number {}", n),
            Instruction::PushBool(b) => write!(f, "push-bool {}", b),
            Instruction::MergeRef(name) => write!(f, "merge-ref ${}", name),
            Instruction::RemoveRef(name) => write!(f, "remove-ref ${}", name),
            Instruction::IntersectionRef(name) => write!(f, "intersection-ref ${}", name),
            Instruction::Check { var, .. } => write!(f, "check ${}", var),
            Instruction::Alert { var, .. } => write!(f, "alert ${}", var),
            Instruction::AddDescription(items) => {
                write!(f, "desc")?;
                fmt_pairs(f, items)
            }
            Instruction::SearchExact { name, mode } => write!(f, "search-exact {} [{}]", name, mode),
            Instruction::SearchGlob { pattern, mode } => write!(f, "search-glob {} [{}]", pattern, mode),
            Instruction::SearchRegexp { pattern, mode } => write!(f, "search-regexp /{}/ [{}]", pattern, mode),
            Instruction::RecursiveSearchExact { name, mode } => write!(f, "recursive-search-exact {} [{}]", name, mode),
            Instruction::RecursiveSearchGlob { pattern, mode } => {
                write!(f, "recursive-search-glob {} [{}]", pattern, mode)
            }
            Instruction::RecursiveSearchRegexp { pattern, mode } => {
                write!(f, "recursive-search-regexp /{}/ [{}]", pattern, mode)
            }
            Instruction::GetCall => write!(f, "get-call"),
            Instruction::GetCallArgs { index, is_all } => {
                write!(f, "get-call-args {}{}", index, if *is_all { "..." } else { "" })
            }
            Instruction::GetAllCallArgs => write!(f, "get-all-call-args"),
            Instruction::GetFields => write!(f, "get-fields"),
            Instruction::ListIndex(i) => write!(f, "list-index {}", i),
            Instruction::GetUsers(items) => {
                write!(f, "get-users")?;
                fmt_items(f, items)
            }
            Instruction::GetDefs(items) => {
                write!(f, "get-defs")?;
                fmt_items(f, items)
            }
            Instruction::GetBottomUsers(items) => {
                write!(f, "get-bottom-users")?;
                fmt_items(f, items)
            }
            Instruction::GetTopDefs(items) => {
                write!(f, "get-top-defs")?;
                fmt_items(f, items)
            }
            Instruction::NativeCall { name, params } => {
                write!(f, "native-call <{}>", name)?;
                fmt_pairs(f, params)
            }
            Instruction::FileFilterRegexp { path, .. } => write!(f, "file-filter-regexp {}", path),
            Instruction::FileFilterJsonPath { path, .. } => write!(f, "file-filter-jsonpath {}", path),
            Instruction::FileFilterXPath { path, .. } => write!(f, "file-filter-xpath {}", path),
            Instruction::FilterEnter => write!(f, "filter-enter"),
            Instruction::FilterExit => write!(f, "filter-exit"),
            Instruction::CompareOpcode(ops) => {
                let names: Vec<&str> = ops.iter().map(|o| o.as_str()).collect();
                write!(f, "compare-opcode {}", names.join(","))
            }
            Instruction::CompareString { mode, conditions } => {
                let names: Vec<&str> = conditions.iter().map(|c| c.as_str()).collect();
                write!(f, "compare-string {} {}", mode.as_str(), names.join(","))
            }
            Instruction::CompareName(cond) => write!(f, "compare-name {}", cond.as_str()),
            Instruction::VersionIn(ranges) => write!(f, "version-in ({} ranges)", ranges.len()),
            Instruction::Compare(op) => write!(f, "compare {}", op.as_str()),
            Instruction::LogicAnd => write!(f, "logic-and"),
            Instruction::LogicOr => write!(f, "logic-or"),
            Instruction::LogicNot => write!(f, "logic-not"),
            Instruction::Condition => write!(f, "condition"),
            Instruction::IterStart => write!(f, "iter-start"),
            Instruction::IterNext { exit } => write!(f, "iter-next -> {}", exit),
            Instruction::IterCollect => write!(f, "iter-collect"),
            Instruction::IterEnd { description } => write!(f, "iter-end {}", description),
            Instruction::Jump(target) => write!(f, "jump {}", target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_key_roundtrip_names() {
        for key in ["depth", "depth_min", "depth_max", "include", "exclude", "until", "hook"] {
            assert_eq!(RecursiveConfigKey::parse(key).unwrap().as_str(), key);
        }
        assert!(RecursiveConfigKey::parse("deep").is_none());
        assert!(RecursiveConfigKey::Until.is_sub_rule());
        assert!(!RecursiveConfigKey::Depth.is_sub_rule());
    }

    #[test]
    fn test_instruction_display() {
        let inst = Instruction::SearchExact { name: "aaa".into(), mode: MatchMode::NAME };
        assert_eq!(inst.to_string(), "search-exact aaa [name]");
        let inst = Instruction::GetBottomUsers(vec![RecursiveConfigItem {
            key: RecursiveConfigKey::Depth,
            value: "1".into(),
        }]);
        assert_eq!(inst.to_string(), "get-bottom-users { depth: 1 }");
        assert_eq!(Instruction::UpdateRef("target".into()).to_string(), "update-ref $target");
    }

    #[test]
    fn test_navigation_group() {
        assert!(Instruction::GetCall.is_navigation());
        assert!(Instruction::GetTopDefs(vec![]).is_navigation());
        assert!(Instruction::NativeCall { name: "show".into(), params: vec![] }.is_navigation());
        assert!(!Instruction::Duplicate.is_navigation());
        assert!(!Instruction::UpdateRef("x".into()).is_navigation());
        assert!(!Instruction::FilterEnter.is_navigation());
    }

    #[test]
    fn test_instruction_serialization() {
        let inst = Instruction::CompareOpcode(vec![IrOpcode::Const, IrOpcode::Call]);
        let json = serde_json::to_string(&inst).unwrap();
        let back: Instruction = serde_json::from_str(&json).unwrap();
        assert_eq!(inst, back);
    }
}
