//! Search module: cycle-safe, frontier-by-frontier expansion over called targets and fields.

use crate::value::{Provenance, ValueId, ValueRef, Values};
use crate::SyntaxFlowError;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Expand `start` generation by generation.
///
/// For every unvisited neighbour (called targets, then fields) `is_hit` decides whether it is a
/// terminal hit (collected, not expanded) or an intermediate value (expanded next generation).
/// Each hit gets a provenance edge to the value it was reached from. Starting values are marked
/// visited but never tested themselves.
///
/// A parent whose neighbours cannot be read is skipped and reported in the returned messages;
/// only fatal errors abort the search.
pub fn recursive_search<F>(start: &Values, label: &str, mut is_hit: F) -> Result<(Values, Vec<String>), SyntaxFlowError>
where
    F: FnMut(&ValueRef) -> Result<bool, SyntaxFlowError>,
{
    let mut visited: HashSet<ValueId> = start.ids().into_iter().collect();
    let mut frontier: Vec<ValueRef> = start.iter().cloned().collect();
    let mut hits = Values::new();
    let mut errors = Vec::new();
    let mut generation = 0usize;

    while !frontier.is_empty() {
        let mut next = Vec::new();
        for parent in &frontier {
            let neighbours = match neighbours(parent) {
                Ok(neighbours) => neighbours,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    errors.push(format!("{}: {}", label, e));
                    continue;
                }
            };
            for neighbour in neighbours.iter() {
                if !visited.insert(neighbour.id()) {
                    continue;
                }
                match is_hit(neighbour) {
                    Ok(true) => {
                        neighbour.append_predecessor(Provenance {
                            predecessor: Some(Arc::clone(parent)),
                            label: label.to_string(),
                        });
                        hits.push(Arc::clone(neighbour));
                    }
                    Ok(false) => next.push(Arc::clone(neighbour)),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => errors.push(format!("{}: {}", label, e)),
                }
            }
        }
        generation += 1;
        trace!(generation, frontier = next.len(), hits = hits.len(), errors = errors.len(), "recursive search generation");
        frontier = next;
    }
    Ok((hits, errors))
}

fn neighbours(parent: &ValueRef) -> Result<Values, SyntaxFlowError> {
    Ok(parent.get_called()?.merge(&parent.get_fields()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProgram;
    use crate::value::{IrOpcode, TraversalContext, ValueOperator};

    #[test]
    fn test_finds_nested_field() {
        let prog = MemoryProgram::new();
        let root = prog.add("root", IrOpcode::Make);
        let mid = prog.add_field(&root, "inner", "inner", IrOpcode::Make);
        let target = prog.add_field(&mid, "target", "target", IrOpcode::Const);
        let hits = recursive_search(&Values::single(root), "test", |v| Ok(v.name() == "target")).unwrap().0;
        assert_eq!(hits.ids(), vec![target.id()]);
        let preds = prog.predecessors(&target);
        assert_eq!(preds, vec![(Some(mid.id()), "test".to_string())]);
    }

    #[test]
    fn test_hits_are_not_expanded() {
        let prog = MemoryProgram::new();
        let root = prog.add("root", IrOpcode::Make);
        let hit = prog.add_field(&root, "x", "x", IrOpcode::Make);
        prog.add_field(&hit, "x2", "x", IrOpcode::Const);
        let hits = recursive_search(&Values::single(root), "test", |v| Ok(v.name() == "x")).unwrap().0;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits.ids(), vec![hit.id()]);
    }

    #[test]
    fn test_cycles_visit_each_identity_once() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Function);
        let b = prog.add("b", IrOpcode::Function);
        let c = prog.add("c", IrOpcode::Function);
        prog.link_called(&a, &b);
        prog.link_called(&b, &c);
        prog.link_called(&c, &a);
        prog.link_called(&c, &b);
        let mut seen = Vec::new();
        let hits = recursive_search(&Values::single(a.clone()), "test", |v| {
            seen.push(v.id());
            Ok(false)
        })
        .unwrap()
        .0;
        assert!(hits.is_empty());
        let mut dedup = seen.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(seen.len(), dedup.len());
        assert_eq!(seen, vec![b.id(), c.id()]);
    }

    #[derive(Debug)]
    struct Broken;

    impl ValueOperator for Broken {
        fn id(&self) -> ValueId {
            9999
        }

        fn name(&self) -> String {
            "broken".into()
        }

        fn text(&self) -> String {
            "broken".into()
        }

        fn ir_opcode(&self) -> IrOpcode {
            IrOpcode::Function
        }

        fn get_called(&self) -> Result<Values, SyntaxFlowError> {
            Err(SyntaxFlowError::Value("engine hiccup".into()))
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

    #[test]
    fn test_unreadable_parent_is_skipped() {
        let prog = MemoryProgram::new();
        let root = prog.add("root", IrOpcode::Make);
        let target = prog.add_field(&root, "target", "target", IrOpcode::Const);
        let broken: ValueRef = Arc::new(Broken);
        let start = Values::from_vec(vec![broken, root]);
        let (hits, errors) = recursive_search(&start, "test", |v| Ok(v.name() == "target")).unwrap();
        assert_eq!(hits.ids(), vec![target.id()]);
        assert_eq!(errors, vec!["test: Value error: engine hiccup".to_string()]);
    }

    #[test]
    fn test_fatal_handler_error_propagates() {
        let prog = MemoryProgram::new();
        let a = prog.add("a", IrOpcode::Function);
        let b = prog.add("b", IrOpcode::Function);
        prog.link_called(&a, &b);
        let err = recursive_search(&Values::single(a), "test", |_| Err(SyntaxFlowError::Config("depth".into())));
        assert_eq!(err.unwrap_err(), SyntaxFlowError::Config("depth".into()));
    }
}
