//! Condition module: element-wise evaluation of filter comparisons.
//!
//! Every comparison turns a [`Values`] set into one flag per element plus an evidence leaf.

use crate::evidence::{ConditionFilter, ConditionKind, EvidenceNode};
use crate::ir::{BinaryOp, StringCondition, StringMatchMode, VersionBound, VersionRange};
use crate::pattern::compile_regex;
use crate::value::{IrOpcode, Literal, ValueRef, Values};
use crate::{critical, SyntaxFlowError};
use std::cmp::Ordering;

/// Flags for one condition together with the evidence that produced them.
#[derive(Debug, Clone)]
pub struct ConditionEntry {
    pub flags: Vec<bool>,
    pub evidence: EvidenceNode,
}

pub fn eval_opcode(values: &Values, opcodes: &[IrOpcode]) -> ConditionEntry {
    let flags: Vec<bool> = values.iter().map(|v| opcodes.contains(&v.ir_opcode())).collect();
    let filter = ConditionFilter { conditions: opcodes.iter().map(|o| o.to_string()).collect(), ..Default::default() };
    let evidence = EvidenceNode::leaf(ConditionKind::OpcodeCondition, filter, values, &flags);
    ConditionEntry { flags, evidence }
}

pub fn eval_strings(
    values: &Values,
    mode: StringMatchMode,
    conditions: &[StringCondition],
) -> Result<ConditionEntry, SyntaxFlowError> {
    let matchers = conditions.iter().map(TextMatcher::new).collect::<Result<Vec<_>, _>>()?;
    let flags: Vec<bool> = values
        .iter()
        .map(|v| {
            let text = v.text();
            match mode {
                StringMatchMode::Have => matchers.iter().all(|m| m.matches(&text)),
                StringMatchMode::Any => matchers.iter().any(|m| m.matches(&text)),
            }
        })
        .collect();
    let filter = ConditionFilter {
        conditions: conditions.iter().map(|c| c.as_str().to_string()).collect(),
        match_mode: Some(mode.as_str().to_string()),
        op: None,
    };
    let evidence = EvidenceNode::leaf(ConditionKind::StringCondition, filter, values, &flags);
    Ok(ConditionEntry { flags, evidence })
}

/// Bare name test inside a filter: glob or regexp against the value's name.
pub fn eval_name(values: &Values, condition: &StringCondition) -> Result<ConditionEntry, SyntaxFlowError> {
    let (kind, flags) = match condition {
        StringCondition::Glob(g) => (ConditionKind::GlobCondition, values.iter().map(|v| g.matches(&v.name())).collect::<Vec<_>>()),
        StringCondition::Regexp(re) => {
            let re = compile_regex(re)?;
            (ConditionKind::RegexCondition, values.iter().map(|v| re.is_match(&v.name())).collect())
        }
        StringCondition::Exact(name) => (ConditionKind::GlobCondition, values.iter().map(|v| v.name() == *name).collect()),
    };
    let filter = ConditionFilter { conditions: vec![condition.as_str().to_string()], ..Default::default() };
    let evidence = EvidenceNode::leaf(kind, filter, values, &flags);
    Ok(ConditionEntry { flags, evidence })
}

pub fn eval_version(values: &Values, ranges: &[VersionRange]) -> ConditionEntry {
    let flags: Vec<bool> = values
        .iter()
        .map(|v| {
            let version = version_text(v);
            ranges.iter().any(|r| version_in_range(&version, r))
        })
        .collect();
    let filter = ConditionFilter { conditions: ranges.iter().map(render_range).collect(), ..Default::default() };
    let evidence = EvidenceNode::leaf(ConditionKind::VersionCondition, filter, values, &flags);
    ConditionEntry { flags, evidence }
}

pub fn eval_relational(values: &Values, op: BinaryOp, rhs: &Literal) -> ConditionEntry {
    let flags: Vec<bool> = values
        .iter()
        .map(|v| {
            let lhs = v.const_literal().unwrap_or_else(|| Literal::String(v.text()));
            compare_literals(&lhs, op, rhs)
        })
        .collect();
    let filter = ConditionFilter { conditions: vec![rhs.to_string()], match_mode: None, op: Some(op) };
    let evidence = EvidenceNode::leaf(ConditionKind::RelationalCondition, filter, values, &flags);
    ConditionEntry { flags, evidence }
}

pub fn logic_and(lhs: ConditionEntry, rhs: ConditionEntry) -> Result<ConditionEntry, SyntaxFlowError> {
    combine(lhs, rhs, "and", |a, b| a && b, EvidenceNode::and)
}

pub fn logic_or(lhs: ConditionEntry, rhs: ConditionEntry) -> Result<ConditionEntry, SyntaxFlowError> {
    combine(lhs, rhs, "or", |a, b| a || b, EvidenceNode::or)
}

pub fn logic_not(mut entry: ConditionEntry) -> ConditionEntry {
    for flag in entry.flags.iter_mut() {
        *flag = !*flag;
    }
    ConditionEntry { flags: entry.flags, evidence: EvidenceNode::not(entry.evidence) }
}

fn combine(
    lhs: ConditionEntry,
    rhs: ConditionEntry,
    name: &str,
    op: impl Fn(bool, bool) -> bool,
    gate: impl Fn(EvidenceNode, EvidenceNode) -> EvidenceNode,
) -> Result<ConditionEntry, SyntaxFlowError> {
    if lhs.flags.len() != rhs.flags.len() {
        return Err(critical(format!(
            "logic {}: condition length mismatch ({} vs {})",
            name,
            lhs.flags.len(),
            rhs.flags.len()
        )));
    }
    let flags = lhs.flags.iter().zip(&rhs.flags).map(|(a, b)| op(*a, *b)).collect();
    Ok(ConditionEntry { flags, evidence: gate(lhs.evidence, rhs.evidence) })
}

enum TextMatcher<'a> {
    Contains(&'a str),
    Glob(&'a crate::pattern::GlobPattern),
    Regexp(regex::Regex),
}

impl<'a> TextMatcher<'a> {
    fn new(condition: &'a StringCondition) -> Result<Self, SyntaxFlowError> {
        Ok(match condition {
            StringCondition::Exact(s) => TextMatcher::Contains(s),
            StringCondition::Glob(g) => TextMatcher::Glob(g),
            StringCondition::Regexp(re) => TextMatcher::Regexp(compile_regex(re)?),
        })
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            TextMatcher::Contains(s) => text.contains(s),
            TextMatcher::Glob(g) => g.matches(text),
            TextMatcher::Regexp(re) => re.is_match(text),
        }
    }
}

/// Constant comparison: numeric when both sides parse as numbers, booleans by equality only,
/// otherwise lexicographic on the string form.
pub fn compare_literals(lhs: &Literal, op: BinaryOp, rhs: &Literal) -> bool {
    if let (Literal::Bool(a), Literal::Bool(b)) = (lhs, rhs) {
        return match op {
            BinaryOp::Eq => a == b,
            BinaryOp::NotEq => a != b,
            _ => false,
        };
    }
    let ordering = match (as_number(lhs), as_number(rhs)) {
        (Some(a), Some(b)) => match a.partial_cmp(&b) {
            Some(ord) => ord,
            None => return op == BinaryOp::NotEq,
        },
        _ => lhs.to_string().cmp(&rhs.to_string()),
    };
    apply_ordering(ordering, op)
}

fn as_number(lit: &Literal) -> Option<f64> {
    match lit {
        Literal::Number(n) => Some(*n),
        Literal::String(s) => s.trim().trim_matches('"').parse::<f64>().ok(),
        Literal::Bool(_) => None,
    }
}

fn apply_ordering(ordering: Ordering, op: BinaryOp) -> bool {
    match op {
        BinaryOp::Eq => ordering == Ordering::Equal,
        BinaryOp::NotEq => ordering != Ordering::Equal,
        BinaryOp::Gt => ordering == Ordering::Greater,
        BinaryOp::GtEq => ordering != Ordering::Less,
        BinaryOp::Lt => ordering == Ordering::Less,
        BinaryOp::LtEq => ordering != Ordering::Greater,
    }
}

fn version_text(v: &ValueRef) -> String {
    match v.const_literal() {
        Some(lit) => lit.to_string(),
        None => v.text().trim_matches(|c| c == '"' || c == '\'').to_string(),
    }
}

/// Compare dotted versions segment by segment; numeric segments compare numerically and
/// missing segments count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let split = |s: &str| -> Vec<String> {
        s.trim().trim_start_matches(['v', 'V']).split(['.', '-', '_']).map(str::to_string).collect()
    };
    let (left, right) = (split(a), split(b));
    for i in 0..left.len().max(right.len()) {
        let l = left.get(i).map(String::as_str).unwrap_or("0");
        let r = right.get(i).map(String::as_str).unwrap_or("0");
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub fn version_in_range(version: &str, range: &VersionRange) -> bool {
    if let Some(low) = &range.low {
        match compare_versions(version, &low.version) {
            Ordering::Less => return false,
            Ordering::Equal if !low.inclusive => return false,
            _ => {}
        }
    }
    if let Some(high) = &range.high {
        match compare_versions(version, &high.version) {
            Ordering::Greater => return false,
            Ordering::Equal if !high.inclusive => return false,
            _ => {}
        }
    }
    true
}

/// Parse `[1.0,2.0)`, `(,1.5]`, `[2.0,]` or a single exact version such as `1.2.3`.
pub fn parse_version_range(text: &str) -> Result<VersionRange, SyntaxFlowError> {
    let text = text.trim();
    let syntax = || SyntaxFlowError::Syntax(format!("invalid version range: {}", text));
    let open = text.chars().next().ok_or_else(syntax)?;
    if open != '[' && open != '(' {
        if text.contains(',') {
            return Err(syntax());
        }
        let bound = VersionBound { version: text.to_string(), inclusive: true };
        return Ok(VersionRange { low: Some(bound.clone()), high: Some(bound) });
    }
    let close = text.chars().last().ok_or_else(syntax)?;
    if text.len() < 2 || (close != ']' && close != ')') {
        return Err(syntax());
    }
    let inner = &text[1..text.len() - 1];
    let (low, high) = inner.split_once(',').ok_or_else(syntax)?;
    let bound = |v: &str, inclusive: bool| {
        let v = v.trim();
        if v.is_empty() {
            None
        } else {
            Some(VersionBound { version: v.to_string(), inclusive })
        }
    };
    Ok(VersionRange { low: bound(low, open == '['), high: bound(high, close == ']') })
}

fn render_range(range: &VersionRange) -> String {
    let low = range.low.as_ref().map(|b| (b.version.as_str(), b.inclusive)).unwrap_or(("", false));
    let high = range.high.as_ref().map(|b| (b.version.as_str(), b.inclusive)).unwrap_or(("", false));
    format!(
        "{}{},{}{}",
        if low.1 { '[' } else { '(' },
        low.0,
        high.0,
        if high.1 { ']' } else { ')' }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::LogicOp;
    use crate::memory::MemoryProgram;
    use crate::pattern::GlobPattern;
    use proptest::prelude::*;

    fn entry(flags: Vec<bool>) -> ConditionEntry {
        let evidence = EvidenceNode::leaf(ConditionKind::StringCondition, ConditionFilter::default(), &Values::new(), &[]);
        ConditionEntry { flags, evidence }
    }

    #[test]
    fn test_compare_numbers_vs_strings() {
        let n = |x: f64| Literal::Number(x);
        let s = |x: &str| Literal::String(x.to_string());
        assert!(compare_literals(&n(10.0), BinaryOp::Gt, &n(9.0)));
        // numeric, not lexicographic
        assert!(compare_literals(&s("10"), BinaryOp::Gt, &s("9")));
        assert!(compare_literals(&s("abc"), BinaryOp::Lt, &s("abd")));
        // lexicographic when one side is not a number
        assert!(compare_literals(&s("10"), BinaryOp::Lt, &s("9a")));
        assert!(compare_literals(&s("1.0"), BinaryOp::Eq, &n(1.0)));
        assert!(compare_literals(&s("x"), BinaryOp::NotEq, &s("y")));
    }

    #[test]
    fn test_compare_bools() {
        assert!(compare_literals(&Literal::Bool(true), BinaryOp::Eq, &Literal::Bool(true)));
        assert!(compare_literals(&Literal::Bool(true), BinaryOp::NotEq, &Literal::Bool(false)));
        assert!(!compare_literals(&Literal::Bool(true), BinaryOp::Gt, &Literal::Bool(false)));
    }

    #[test]
    fn test_version_compare_and_ranges() {
        assert_eq!(compare_versions("1.2.10", "1.2.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("v2.0", "1.9.9"), Ordering::Greater);
        let range = parse_version_range("[1.2.0,1.2.25)").unwrap();
        assert!(version_in_range("1.2.0", &range));
        assert!(version_in_range("1.2.24", &range));
        assert!(!version_in_range("1.2.25", &range));
        assert!(!version_in_range("1.1.9", &range));
        let open_low = parse_version_range("(,1.5]").unwrap();
        assert!(version_in_range("0.1", &open_low));
        assert!(version_in_range("1.5", &open_low));
        let exact = parse_version_range("2.0.1").unwrap();
        assert!(version_in_range("2.0.1", &exact));
        assert!(!version_in_range("2.0.2", &exact));
        assert!(parse_version_range("[1.0").is_err());
        assert!(parse_version_range("1.0,2.0").is_err());
    }

    #[test]
    fn test_eval_strings_have_and_any() {
        let prog = MemoryProgram::new();
        let a = prog.add_with_text("a", "hello world", IrOpcode::Const);
        let b = prog.add_with_text("b", "hello", IrOpcode::Const);
        let values = Values::from_vec(vec![a, b]);
        let conds = vec![StringCondition::Exact("hello".into()), StringCondition::Glob(GlobPattern::new("*world"))];
        let have = eval_strings(&values, StringMatchMode::Have, &conds).unwrap();
        assert_eq!(have.flags, vec![true, false]);
        let any = eval_strings(&values, StringMatchMode::Any, &conds).unwrap();
        assert_eq!(any.flags, vec![true, true]);
        let leaf = have.evidence.as_leaf().unwrap();
        assert_eq!(leaf.kind, ConditionKind::StringCondition);
        assert_eq!(leaf.filter.match_mode.as_deref(), Some("have"));
    }

    #[test]
    fn test_eval_name_kinds() {
        let prog = MemoryProgram::new();
        let values = Values::from_vec(vec![prog.add("getName", IrOpcode::Function), prog.add("setName", IrOpcode::Function)]);
        let glob = eval_name(&values, &StringCondition::Glob(GlobPattern::new("get*"))).unwrap();
        assert_eq!(glob.flags, vec![true, false]);
        assert_eq!(glob.evidence.as_leaf().unwrap().kind, ConditionKind::GlobCondition);
        let re = eval_name(&values, &StringCondition::Regexp("^set".into())).unwrap();
        assert_eq!(re.flags, vec![false, true]);
        assert_eq!(re.evidence.as_leaf().unwrap().kind, ConditionKind::RegexCondition);
    }

    #[test]
    fn test_logic_length_mismatch_is_critical() {
        let err = logic_and(entry(vec![true]), entry(vec![true, false])).unwrap_err();
        assert!(err.is_critical());
        let err = logic_or(entry(vec![]), entry(vec![false])).unwrap_err();
        assert!(err.is_critical());
    }

    #[test]
    fn test_logic_gate_evidence() {
        let combined = logic_and(entry(vec![true, false]), entry(vec![true, true])).unwrap();
        assert_eq!(combined.flags, vec![true, false]);
        let gate = combined.evidence.as_gate().unwrap();
        assert_eq!(gate.logic_op(), LogicOp::And);
        assert_eq!(gate.children().len(), 2);
    }

    proptest! {
        #[test]
        fn prop_and_or_commutative(pairs in proptest::collection::vec((any::<bool>(), any::<bool>()), 0..32)) {
            let (a, b): (Vec<bool>, Vec<bool>) = pairs.into_iter().unzip();
            let ab = logic_and(entry(a.clone()), entry(b.clone())).unwrap().flags;
            let ba = logic_and(entry(b.clone()), entry(a.clone())).unwrap().flags;
            prop_assert_eq!(ab, ba);
            let ab = logic_or(entry(a.clone()), entry(b.clone())).unwrap().flags;
            let ba = logic_or(entry(b), entry(a)).unwrap().flags;
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn prop_and_or_associative(triples in proptest::collection::vec((any::<bool>(), any::<bool>(), any::<bool>()), 0..32)) {
            let a: Vec<bool> = triples.iter().map(|t| t.0).collect();
            let b: Vec<bool> = triples.iter().map(|t| t.1).collect();
            let c: Vec<bool> = triples.iter().map(|t| t.2).collect();
            let left = logic_and(logic_and(entry(a.clone()), entry(b.clone())).unwrap(), entry(c.clone())).unwrap().flags;
            let right = logic_and(entry(a.clone()), logic_and(entry(b.clone()), entry(c.clone())).unwrap()).unwrap().flags;
            prop_assert_eq!(left, right);
            let left = logic_or(logic_or(entry(a.clone()), entry(b.clone())).unwrap(), entry(c.clone())).unwrap().flags;
            let right = logic_or(entry(a), logic_or(entry(b), entry(c)).unwrap()).unwrap().flags;
            prop_assert_eq!(left, right);
        }

        #[test]
        fn prop_not_is_involutive(flags in proptest::collection::vec(any::<bool>(), 0..32)) {
            let twice = logic_not(logic_not(entry(flags.clone())));
            prop_assert_eq!(twice.flags, flags);
        }
    }
}
