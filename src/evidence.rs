//! Evidence module: provenance trees explaining why a filter kept or dropped values.
//!
//! Leaves record one comparison with its matched/unmatched partitions; gates combine them the
//! same way the condition flags were combined.

use crate::ir::BinaryOp;
use crate::value::Values;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConditionKind {
    StringCondition,
    OpcodeCondition,
    VersionCondition,
    RelationalCondition,
    RegexCondition,
    GlobCondition,
    /// Nested sub-query truthiness.
    FilterCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LogicOp {
    And,
    Or,
    Not,
}

/// What a leaf compared against.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConditionFilter {
    pub conditions: Vec<String>,
    /// `have` / `any` for string conditions.
    pub match_mode: Option<String>,
    pub op: Option<BinaryOp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConditionLeaf {
    pub kind: ConditionKind,
    pub filter: ConditionFilter,
    pub matched: Values,
    pub unmatched: Values,
    /// Evidence of the filters a sub-query ran, in element order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<EvidenceNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogicGate {
    op: LogicOp,
    children: Vec<EvidenceNode>,
}

impl LogicGate {
    pub fn logic_op(&self) -> LogicOp {
        self.op
    }

    pub fn children(&self) -> &[EvidenceNode] {
        &self.children
    }
}

#[derive(Debug, Clone, Serialize)]
pub enum EvidenceNode {
    Leaf(ConditionLeaf),
    Gate(LogicGate),
}

impl EvidenceNode {
    pub fn leaf(kind: ConditionKind, filter: ConditionFilter, values: &Values, flags: &[bool]) -> EvidenceNode {
        let (matched, unmatched) = values.partition_by_flags(flags);
        EvidenceNode::Leaf(ConditionLeaf { kind, filter, matched, unmatched, nested: Vec::new() })
    }

    /// Attach nested evidence to a leaf. Gates are returned unchanged.
    pub fn with_nested(mut self, nested: Vec<EvidenceNode>) -> EvidenceNode {
        if let EvidenceNode::Leaf(leaf) = &mut self {
            leaf.nested = nested;
        }
        self
    }

    pub fn and(lhs: EvidenceNode, rhs: EvidenceNode) -> EvidenceNode {
        EvidenceNode::Gate(LogicGate { op: LogicOp::And, children: vec![lhs, rhs] })
    }

    pub fn or(lhs: EvidenceNode, rhs: EvidenceNode) -> EvidenceNode {
        EvidenceNode::Gate(LogicGate { op: LogicOp::Or, children: vec![lhs, rhs] })
    }

    pub fn not(inner: EvidenceNode) -> EvidenceNode {
        EvidenceNode::Gate(LogicGate { op: LogicOp::Not, children: vec![inner] })
    }

    pub fn as_leaf(&self) -> Option<&ConditionLeaf> {
        match self {
            EvidenceNode::Leaf(leaf) => Some(leaf),
            EvidenceNode::Gate(_) => None,
        }
    }

    pub fn as_gate(&self) -> Option<&LogicGate> {
        match self {
            EvidenceNode::Gate(gate) => Some(gate),
            EvidenceNode::Leaf(_) => None,
        }
    }

    /// Number of leaves below this node, nested sub-query evidence included.
    pub fn leaf_count(&self) -> usize {
        match self {
            EvidenceNode::Leaf(leaf) => 1 + leaf.nested.iter().map(|n| n.leaf_count()).sum::<usize>(),
            EvidenceNode::Gate(gate) => gate.children.iter().map(|c| c.leaf_count()).sum(),
        }
    }

    /// Whether a leaf of `kind` is reachable from this node.
    pub fn contains_kind(&self, kind: ConditionKind) -> bool {
        match self {
            EvidenceNode::Leaf(leaf) => leaf.kind == kind || leaf.nested.iter().any(|n| n.contains_kind(kind)),
            EvidenceNode::Gate(gate) => gate.children.iter().any(|c| c.contains_kind(kind)),
        }
    }
}
