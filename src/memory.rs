//! Memory module: a small in-memory IR graph implementing [`ValueOperator`].
//!
//! Real deployments plug an SSA engine in behind the value contract. This graph stands in for it
//! in tests, benchmarks and embedders that want to run queries over hand-built facts.

use crate::ir::FileFilterMode;
use crate::pattern::compile_regex;
use crate::value::{ConstValue, IrOpcode, Literal, Provenance, TraversalContext, ValueId, ValueOperator, ValueRef, Values};
use crate::SyntaxFlowError;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Default)]
struct Node {
    name: String,
    text: String,
    key: Option<String>,
    opcode: Option<IrOpcode>,
    literal: Option<Literal>,
    root: bool,
    list: Option<Vec<ValueId>>,
    called: Vec<ValueId>,
    fields: Vec<ValueId>,
    args: Vec<ValueId>,
    users: Vec<ValueId>,
    defs: Vec<ValueId>,
    predecessors: Vec<(Option<ValueId>, String)>,
}

#[derive(Debug, Default)]
struct Graph {
    nodes: IndexMap<ValueId, Node>,
    files: HashMap<String, String>,
}

/// Owner of an in-memory value graph. Cloning shares the graph.
#[derive(Clone, Default)]
pub struct MemoryProgram {
    graph: Arc<RwLock<Graph>>,
}

impl fmt::Debug for MemoryProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProgram").field("nodes", &self.graph.read().nodes.len()).finish()
    }
}

impl MemoryProgram {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, node: Node) -> ValueRef {
        let mut graph = self.graph.write();
        let id = graph.nodes.len() as ValueId + 1;
        graph.nodes.insert(id, node);
        self.handle(id)
    }

    fn handle(&self, id: ValueId) -> ValueRef {
        Arc::new(MemoryValue { id, graph: Arc::clone(&self.graph) })
    }

    /// Add a top-level value whose text is its name.
    pub fn add(&self, name: &str, opcode: IrOpcode) -> ValueRef {
        self.add_with_text(name, name, opcode)
    }

    pub fn add_with_text(&self, name: &str, text: &str, opcode: IrOpcode) -> ValueRef {
        self.insert(Node { name: name.into(), text: text.into(), opcode: Some(opcode), root: true, ..Default::default() })
    }

    /// Add a constant; its name and text are the rendered literal.
    pub fn add_const(&self, literal: Literal) -> ValueRef {
        let text = match &literal {
            Literal::String(s) => format!("{:?}", s),
            other => other.to_string(),
        };
        self.insert(Node {
            name: literal.to_string(),
            text,
            opcode: Some(IrOpcode::Const),
            literal: Some(literal),
            root: true,
            ..Default::default()
        })
    }

    /// Add a member `key` of `object` whose value is named `name`.
    pub fn add_field(&self, object: &ValueRef, key: &str, name: &str, opcode: IrOpcode) -> ValueRef {
        let field = self.insert(Node {
            name: name.into(),
            text: format!("{}.{}", object.name(), key),
            key: Some(key.into()),
            opcode: Some(opcode),
            ..Default::default()
        });
        self.with_node(object, |n| n.fields.push(field.id()));
        field
    }

    /// Add a list-shaped value; `Values` flattens it into its elements.
    pub fn add_list(&self, elements: Vec<ValueRef>) -> ValueRef {
        let ids = elements.iter().map(|e| e.id()).collect();
        self.insert(Node { name: "list".into(), text: "list".into(), list: Some(ids), ..Default::default() })
    }

    pub fn push_list_element(&self, list: &ValueRef, element: ValueRef) {
        self.with_node(list, |n| n.list.get_or_insert_with(Vec::new).push(element.id()));
    }

    /// Record that `call` is a call site of `callee`.
    pub fn link_called(&self, callee: &ValueRef, call: &ValueRef) {
        self.with_node(callee, |n| n.called.push(call.id()));
    }

    /// Append an actual argument to `call`.
    pub fn add_arg(&self, call: &ValueRef, arg: &ValueRef) {
        self.with_node(call, |n| n.args.push(arg.id()));
    }

    /// Record a def-use edge: `user` uses the value defined by `def`.
    pub fn link_use(&self, def: &ValueRef, user: &ValueRef) {
        self.with_node(def, |n| n.users.push(user.id()));
        self.with_node(user, |n| n.defs.push(def.id()));
    }

    /// Register file content reachable through file filters.
    pub fn add_file(&self, path: &str, content: &str) {
        self.graph.write().files.insert(path.into(), content.into());
    }

    /// All top-level values in insertion order.
    pub fn values(&self) -> Values {
        let ids: Vec<ValueId> = self.graph.read().nodes.iter().filter(|(_, n)| n.root).map(|(id, _)| *id).collect();
        ids.into_iter().map(|id| self.handle(id)).collect()
    }

    /// Provenance edges recorded on `value` as (predecessor id, label).
    pub fn predecessors(&self, value: &ValueRef) -> Vec<(Option<ValueId>, String)> {
        self.graph.read().nodes.get(&value.id()).map(|n| n.predecessors.clone()).unwrap_or_default()
    }

    fn with_node(&self, value: &ValueRef, f: impl FnOnce(&mut Node)) {
        if let Some(node) = self.graph.write().nodes.get_mut(&value.id()) {
            f(node);
        }
    }
}

struct MemoryValue {
    id: ValueId,
    graph: Arc<RwLock<Graph>>,
}

impl fmt::Debug for MemoryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryValue").field("id", &self.id).field("name", &self.name()).finish()
    }
}

impl MemoryValue {
    fn read<T>(&self, f: impl FnOnce(&Node) -> T) -> Option<T> {
        self.graph.read().nodes.get(&self.id).map(f)
    }

    fn resolve(&self, ids: Vec<ValueId>) -> Values {
        ids.into_iter().map(|id| Arc::new(MemoryValue { id, graph: Arc::clone(&self.graph) }) as ValueRef).collect()
    }

    fn edges(&self, pick: impl FnOnce(&Node) -> Vec<ValueId>) -> Values {
        self.resolve(self.read(pick).unwrap_or_default())
    }

    /// Follow `pick` edges until nodes without further edges, or until the depth bound.
    fn transitive(&self, ctx: &TraversalContext<'_>, pick: fn(&Node) -> &Vec<ValueId>) -> Result<Values, SyntaxFlowError> {
        let max_depth = depth_item(ctx, "depth")?.or(depth_item(ctx, "depth_max")?);
        let min_depth = depth_item(ctx, "depth_min")?.unwrap_or(0);
        let graph = self.graph.read();
        let mut visited: HashSet<ValueId> = HashSet::from([self.id]);
        let mut frontier = vec![self.id];
        let mut found = Vec::new();
        let mut depth = 0usize;
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for id in frontier {
                let edges: &[ValueId] = graph.nodes.get(&id).map(|n| pick(n).as_slice()).unwrap_or(&[]);
                let at_limit = max_depth.map(|m| depth >= m).unwrap_or(false);
                if edges.is_empty() || at_limit {
                    if depth >= min_depth {
                        found.push(id);
                    }
                    continue;
                }
                for e in edges {
                    if visited.insert(*e) {
                        next.push(*e);
                    }
                }
            }
            frontier = next;
            depth += 1;
        }
        drop(graph);
        trace!(start = self.id, depth, found = found.len(), "transitive traversal");
        Ok(self.resolve(found))
    }
}

fn depth_item(ctx: &TraversalContext<'_>, key: &str) -> Result<Option<usize>, SyntaxFlowError> {
    match ctx.item(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| SyntaxFlowError::Config(format!("{} must be a non-negative integer, got {:?}", key, raw))),
    }
}

impl ValueOperator for MemoryValue {
    fn id(&self) -> ValueId {
        self.id
    }

    fn name(&self) -> String {
        self.read(|n| n.name.clone()).unwrap_or_default()
    }

    fn key(&self) -> Option<String> {
        self.read(|n| n.key.clone()).flatten()
    }

    fn text(&self) -> String {
        self.read(|n| n.text.clone()).unwrap_or_default()
    }

    fn ir_opcode(&self) -> IrOpcode {
        self.read(|n| n.opcode.clone()).flatten().unwrap_or(IrOpcode::Undefined)
    }

    fn const_literal(&self) -> Option<Literal> {
        self.read(|n| n.literal.clone()).flatten()
    }

    fn is_list(&self) -> bool {
        self.read(|n| n.list.is_some()).unwrap_or(false)
    }

    fn list_elements(&self) -> Vec<ValueRef> {
        let ids = self.read(|n| n.list.clone().unwrap_or_default()).unwrap_or_default();
        ids.into_iter().map(|id| Arc::new(MemoryValue { id, graph: Arc::clone(&self.graph) }) as ValueRef).collect()
    }

    fn get_called(&self) -> Result<Values, SyntaxFlowError> {
        Ok(self.edges(|n| n.called.clone()))
    }

    fn get_fields(&self) -> Result<Values, SyntaxFlowError> {
        Ok(self.edges(|n| n.fields.clone()))
    }

    fn get_call_actual_params(&self, index: usize, contain_rest: bool) -> Result<Values, SyntaxFlowError> {
        Ok(self.edges(|n| {
            if contain_rest {
                n.args.iter().skip(index).copied().collect()
            } else {
                n.args.get(index).copied().into_iter().collect()
            }
        }))
    }

    fn get_all_call_actual_params(&self) -> Result<Values, SyntaxFlowError> {
        Ok(self.edges(|n| n.args.clone()))
    }

    fn get_syntax_flow_use(&self, _ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        Ok(self.edges(|n| n.users.clone()))
    }

    fn get_syntax_flow_def(&self, _ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        Ok(self.edges(|n| n.defs.clone()))
    }

    fn get_syntax_flow_top_def(&self, ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        self.transitive(ctx, |n| &n.defs)
    }

    fn get_syntax_flow_bottom_use(&self, ctx: &TraversalContext<'_>) -> Result<Values, SyntaxFlowError> {
        self.transitive(ctx, |n| &n.users)
    }

    fn file_filter(
        &self,
        path: &str,
        mode: FileFilterMode,
        _params: &IndexMap<String, String>,
        rules: &[String],
    ) -> Result<Values, SyntaxFlowError> {
        let content = match self.graph.read().files.get(path) {
            Some(content) => content.clone(),
            None => return Ok(Values::new()),
        };
        match mode {
            FileFilterMode::Regexp => {
                let mut out = Values::new();
                for rule in rules {
                    let re = compile_regex(rule)?;
                    for m in re.find_iter(&content) {
                        out.push(ConstValue::string(m.as_str()));
                    }
                }
                Ok(out)
            }
            other => Err(SyntaxFlowError::Value(format!("{} file filter is not supported in memory", other.as_str()))),
        }
    }

    fn append_predecessor(&self, provenance: Provenance) {
        let predecessor = provenance.predecessor.map(|p| p.id());
        if let Some(node) = self.graph.write().nodes.get_mut(&self.id) {
            node.predecessors.push((predecessor, provenance.label));
        }
    }
}
