//! Flow module: the variable-flow graph recording how named variables were derived.
//!
//! Node 0 is the implicit "unbound source". Steps accumulate between commits; `as $name`
//! commits them as an edge from the current source to the variable's node.

use crate::evidence::EvidenceNode;
use crate::SyntaxFlowError;
use serde::Serialize;
use std::collections::HashMap;

pub type NodeId = usize;
pub type StepId = usize;
pub type EdgeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepType {
    Search,
    DataFlow,
    Transform,
    ConditionFilter,
    Normal,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowStep {
    pub id: StepId,
    pub step_type: StepType,
    pub instruction: String,
    pub evidence: Option<EvidenceNode>,
    /// Number of values the step produced.
    pub value_count: usize,
    /// Created inside a `?{...}` block and therefore folded into evidence.
    pub in_condition: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowNode {
    pub id: NodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowEdge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub steps: Vec<StepId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VarFlowGraph {
    nodes: Vec<FlowNode>,
    edges: Vec<FlowEdge>,
    steps: Vec<FlowStep>,
    #[serde(skip)]
    node_index: HashMap<String, NodeId>,
    #[serde(skip)]
    pending: Vec<StepId>,
    #[serde(skip)]
    source: Option<NodeId>,
}

impl Default for VarFlowGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl VarFlowGraph {
    pub const SOURCE_NODE: NodeId = 0;

    pub fn new() -> Self {
        Self {
            nodes: vec![FlowNode { id: Self::SOURCE_NODE, name: String::new() }],
            edges: Vec::new(),
            steps: Vec::new(),
            node_index: HashMap::new(),
            pending: Vec::new(),
            source: None,
        }
    }

    /// Record a step. Steps created inside a condition block stay out of the pending buffer.
    pub fn create_step(
        &mut self,
        step_type: StepType,
        instruction: String,
        evidence: Option<EvidenceNode>,
        value_count: usize,
        in_condition: bool,
    ) -> StepId {
        let id = self.steps.len();
        self.steps.push(FlowStep { id, step_type, instruction, evidence, value_count, in_condition });
        if !in_condition {
            self.pending.push(id);
        }
        id
    }

    /// Commit the pending steps as an edge into `name`'s node.
    pub fn commit_flow(&mut self, name: &str) -> Result<EdgeId, SyntaxFlowError> {
        if self.pending.is_empty() && self.source.is_none() {
            return Err(SyntaxFlowError::NoAnalysisStep);
        }
        let to = self.node(name);
        let from = self.source.take().unwrap_or(Self::SOURCE_NODE);
        let id = self.edges.len();
        self.edges.push(FlowEdge { id, from, to, steps: std::mem::take(&mut self.pending) });
        Ok(id)
    }

    /// Make `name` the source of the next commit (a variable was read).
    pub fn set_source(&mut self, name: &str) {
        let id = self.node(name);
        self.source = Some(id);
    }

    fn node(&mut self, name: &str) -> NodeId {
        if let Some(id) = self.node_index.get(name) {
            return *id;
        }
        let id = self.nodes.len();
        self.nodes.push(FlowNode { id, name: name.to_string() });
        self.node_index.insert(name.to_string(), id);
        id
    }

    pub fn nodes(&self) -> &[FlowNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[FlowEdge] {
        &self.edges
    }

    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> Option<&FlowStep> {
        self.steps.get(id)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_index.get(name).copied()
    }

    pub fn pending_steps(&self) -> &[StepId] {
        &self.pending
    }

    /// Edges ending at the variable's node.
    pub fn edges_into(&self, name: &str) -> Vec<&FlowEdge> {
        match self.node_id(name) {
            Some(id) => self.edges.iter().filter(|e| e.to == id).collect(),
            None => Vec::new(),
        }
    }
}
