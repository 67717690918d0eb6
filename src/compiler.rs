//! Compiler module: compiles a query AST into a linear instruction sequence.
//!
//! This module provides the QueryCompiler. The root values sit on the operand stack when a
//! program starts; every statement that searches from them except the last duplicates them first.

use crate::ast::{ArgPosition, CallArg, Chain, ChainElement, ChainHead, ConditionExpr, NavigationKind, Query, Statement};
use crate::condition::parse_version_range;
use crate::ir::{FileFilterMode, Instruction, Label, RecursiveConfigItem, RecursiveConfigKey, StringCondition};
use crate::pattern::{MatchMode, NamePattern};
use crate::value::{IrOpcode, Literal};
use crate::{critical, SyntaxFlowError};
use tracing::debug;

/// What happens to a chain's final values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainEnd {
    /// Drop them; top-level chains bind `$_` on the way out.
    Discard { bind_anonymous: bool },
    /// Leave them on the stack for the enclosing construct.
    Keep,
}

#[derive(Debug, Default)]
pub struct QueryCompiler {
    code: Vec<Instruction>,
}

impl QueryCompiler {
    pub fn compile(query: &Query) -> Result<Vec<Instruction>, SyntaxFlowError> {
        let mut compiler = QueryCompiler::default();
        let root_users = query.statements.iter().filter(|s| consumes_root(s)).count();
        let mut seen = 0usize;
        for statement in &query.statements {
            if consumes_root(statement) {
                seen += 1;
                if seen < root_users {
                    compiler.emit(Instruction::Duplicate);
                }
            }
            compiler.statement(statement)?;
        }
        debug!(statements = query.statements.len(), instructions = compiler.code.len(), "query compiled");
        Ok(compiler.code)
    }

    fn emit(&mut self, inst: Instruction) -> Label {
        self.code.push(inst);
        self.code.len() - 1
    }

    fn here(&self) -> Label {
        self.code.len()
    }

    fn statement(&mut self, statement: &Statement) -> Result<(), SyntaxFlowError> {
        match statement {
            Statement::Chain(chain) => self.chain(chain, ChainEnd::Discard { bind_anonymous: true }),
            Statement::Check { var, then_msg, else_msg } => {
                require_name("check variable", var)?;
                self.emit(Instruction::Check { var: var.clone(), then_msg: then_msg.clone(), else_msg: else_msg.clone() });
                Ok(())
            }
            Statement::Alert { var, extra } => {
                require_name("alert variable", var)?;
                self.emit(Instruction::Alert { var: var.clone(), extra: extra.clone() });
                Ok(())
            }
            Statement::Desc(items) => {
                self.emit(Instruction::AddDescription(items.clone()));
                Ok(())
            }
            Statement::FileFilter { path, mode, params, rules, binding } => {
                require_name("file filter path", path)?;
                if rules.is_empty() {
                    return Err(critical("file filter without rules"));
                }
                let (path, params, rules) = (path.clone(), params.clone(), rules.clone());
                let inst = match mode {
                    FileFilterMode::Regexp => {
                        for rule in &rules {
                            regex::Regex::new(rule)
                                .map_err(|e| SyntaxFlowError::Syntax(format!("invalid file filter regexp {:?}: {}", rule, e)))?;
                        }
                        Instruction::FileFilterRegexp { path, params, rules }
                    }
                    FileFilterMode::JsonPath => Instruction::FileFilterJsonPath { path, params, rules },
                    FileFilterMode::XPath => Instruction::FileFilterXPath { path, params, rules },
                };
                self.emit(inst);
                match binding {
                    Some(name) => {
                        require_name("binding", name)?;
                        self.emit(Instruction::UpdateRef(name.clone()));
                    }
                    None => {
                        self.emit(Instruction::Pop { bind_anonymous: true });
                    }
                }
                Ok(())
            }
        }
    }

    fn chain(&mut self, chain: &Chain, end: ChainEnd) -> Result<(), SyntaxFlowError> {
        match &chain.head {
            ChainHead::Search(raw) => self.search(raw, MatchMode::NAME, false)?,
            ChainHead::Variable(name) => {
                require_name("variable", name)?;
                self.emit(Instruction::NewRef(name.clone()));
            }
        }
        self.elements(&chain.elements, end)
    }

    fn elements(&mut self, elements: &[ChainElement], end: ChainEnd) -> Result<(), SyntaxFlowError> {
        for (i, element) in elements.iter().enumerate() {
            let last = i + 1 == elements.len();
            match element {
                ChainElement::Bind(name) => {
                    require_name("binding", name)?;
                    if !last || end == ChainEnd::Keep {
                        self.emit(Instruction::Duplicate);
                    }
                    self.emit(Instruction::UpdateRef(name.clone()));
                }
                other => self.element(other)?,
            }
        }
        let bound_at_end = matches!(elements.last(), Some(ChainElement::Bind(_)));
        if let ChainEnd::Discard { bind_anonymous } = end {
            if !bound_at_end {
                self.emit(Instruction::Pop { bind_anonymous });
            }
        }
        Ok(())
    }

    fn element(&mut self, element: &ChainElement) -> Result<(), SyntaxFlowError> {
        match element {
            ChainElement::Member(name) => {
                self.emit(Instruction::GetFields);
                self.search(name, MatchMode::KEY, false)?;
            }
            ChainElement::Recursive(name) => self.search(name, MatchMode::NAME, true)?,
            ChainElement::Search(name) => self.search(name, MatchMode::NAME, false)?,
            ChainElement::Call(args) => {
                self.emit(Instruction::GetCall);
                for arg in args {
                    self.call_arg(arg)?;
                }
            }
            ChainElement::Fields => {
                self.emit(Instruction::GetFields);
            }
            ChainElement::Index(i) => {
                self.emit(Instruction::ListIndex(*i));
            }
            ChainElement::Navigate { kind, config } => {
                let items = match config {
                    Some(config) => config_items(config)?,
                    None => Vec::new(),
                };
                self.emit(match kind {
                    NavigationKind::Users => Instruction::GetUsers(items),
                    NavigationKind::Defs => Instruction::GetDefs(items),
                    NavigationKind::BottomUsers => Instruction::GetBottomUsers(items),
                    NavigationKind::TopDefs => Instruction::GetTopDefs(items),
                });
            }
            ChainElement::Filter(cond) => self.filter_block(|c| c.condition(cond))?,
            ChainElement::NativeCall { name, params } => {
                require_name("native call", name)?;
                self.emit(Instruction::NativeCall { name: name.clone(), params: params.clone() });
            }
            ChainElement::Merge(name) => {
                require_name("merge variable", name)?;
                self.emit(Instruction::MergeRef(name.clone()));
            }
            ChainElement::Remove(name) => {
                require_name("remove variable", name)?;
                self.emit(Instruction::RemoveRef(name.clone()));
            }
            ChainElement::Intersect(name) => {
                require_name("intersect variable", name)?;
                self.emit(Instruction::IntersectionRef(name.clone()));
            }
            ChainElement::Bind(_) => return Err(critical("binding outside of an element list")),
        }
        Ok(())
    }

    fn search(&mut self, raw: &str, mode: MatchMode, recursive: bool) -> Result<(), SyntaxFlowError> {
        require_name("search name", raw)?;
        let inst = match (NamePattern::classify(raw)?, recursive) {
            (NamePattern::Exact(name), false) => Instruction::SearchExact { name, mode },
            (NamePattern::Glob(pattern), false) => Instruction::SearchGlob { pattern, mode },
            (NamePattern::Regexp(pattern), false) => Instruction::SearchRegexp { pattern, mode },
            (NamePattern::Exact(name), true) => Instruction::RecursiveSearchExact { name, mode },
            (NamePattern::Glob(pattern), true) => Instruction::RecursiveSearchGlob { pattern, mode },
            (NamePattern::Regexp(pattern), true) => Instruction::RecursiveSearchRegexp { pattern, mode },
        };
        self.emit(inst);
        Ok(())
    }

    /// The call values stay on the stack; each argument chain starts from a copy.
    fn call_arg(&mut self, arg: &CallArg) -> Result<(), SyntaxFlowError> {
        match arg.position {
            ArgPosition::Index { index, rest } => {
                self.emit(Instruction::GetCallArgs { index, is_all: rest });
            }
            ArgPosition::All => {
                self.emit(Instruction::Duplicate);
                self.emit(Instruction::GetAllCallArgs);
            }
        }
        self.elements(&arg.elements, ChainEnd::Discard { bind_anonymous: false })
    }

    /// Emit a `?{...}` block around `body`, which must leave exactly one condition entry.
    fn filter_block(&mut self, body: impl FnOnce(&mut Self) -> Result<(), SyntaxFlowError>) -> Result<(), SyntaxFlowError> {
        self.emit(Instruction::FilterEnter);
        body(self)?;
        self.emit(Instruction::FilterExit);
        self.emit(Instruction::Condition);
        Ok(())
    }

    fn condition(&mut self, cond: &ConditionExpr) -> Result<(), SyntaxFlowError> {
        match cond {
            ConditionExpr::Opcode(names) => {
                if names.is_empty() {
                    return Err(critical("opcode condition without opcodes"));
                }
                let opcodes = names.iter().map(|n| n.parse::<IrOpcode>()).collect::<Result<Vec<_>, _>>()?;
                self.emit(Instruction::Duplicate);
                self.emit(Instruction::CompareOpcode(opcodes));
            }
            ConditionExpr::Strings { mode, patterns } => {
                if patterns.is_empty() {
                    return Err(critical("string condition without patterns"));
                }
                let conditions = patterns.iter().map(|p| string_condition(p)).collect::<Result<Vec<_>, _>>()?;
                self.emit(Instruction::Duplicate);
                self.emit(Instruction::CompareString { mode: *mode, conditions });
            }
            ConditionExpr::VersionIn(ranges) => {
                if ranges.is_empty() {
                    return Err(critical("version condition without ranges"));
                }
                let ranges = ranges.iter().map(|r| parse_version_range(r)).collect::<Result<Vec<_>, _>>()?;
                self.emit(Instruction::Duplicate);
                self.emit(Instruction::VersionIn(ranges));
            }
            ConditionExpr::Compare { op, literal } => {
                self.emit(Instruction::Duplicate);
                self.emit(match literal {
                    Literal::String(s) => Instruction::PushString(s.clone()),
                    Literal::Number(n) => Instruction::PushNumber(*n),
                    Literal::Bool(b) => Instruction::PushBool(*b),
                });
                self.emit(Instruction::Compare(*op));
            }
            ConditionExpr::Name(raw) => {
                require_name("condition name", raw)?;
                let cond = match NamePattern::classify(raw)? {
                    NamePattern::Exact(name) => StringCondition::Exact(name),
                    NamePattern::Glob(g) => StringCondition::Glob(g),
                    NamePattern::Regexp(re) => StringCondition::Regexp(re),
                };
                self.emit(Instruction::Duplicate);
                self.emit(Instruction::CompareName(cond));
            }
            ConditionExpr::Query(elements) => self.sub_query(elements)?,
            ConditionExpr::And(lhs, rhs) => {
                self.condition(lhs)?;
                self.condition(rhs)?;
                self.emit(Instruction::LogicAnd);
            }
            ConditionExpr::Or(lhs, rhs) => {
                self.condition(lhs)?;
                self.condition(rhs)?;
                self.emit(Instruction::LogicOr);
            }
            ConditionExpr::Not(inner) => {
                self.condition(inner)?;
                self.emit(Instruction::LogicNot);
            }
        }
        Ok(())
    }

    /// Run `elements` once per filtered value; a value passes when the run produced anything.
    fn sub_query(&mut self, elements: &[ChainElement]) -> Result<(), SyntaxFlowError> {
        if elements.is_empty() {
            return Err(critical("empty sub-query condition"));
        }
        self.emit(Instruction::Duplicate);
        self.emit(Instruction::IterStart);
        let head = self.emit(Instruction::IterNext { exit: 0 });
        self.elements(elements, ChainEnd::Keep)?;
        self.emit(Instruction::IterCollect);
        self.emit(Instruction::Jump(head));
        let exit = self.here();
        self.code[head] = Instruction::IterNext { exit };
        self.emit(Instruction::IterEnd { description: describe(elements) });
        Ok(())
    }
}

fn consumes_root(statement: &Statement) -> bool {
    match statement {
        Statement::Chain(chain) => matches!(chain.head, ChainHead::Search(_)),
        Statement::FileFilter { .. } => true,
        Statement::Check { .. } | Statement::Alert { .. } | Statement::Desc(_) => false,
    }
}

fn require_name(what: &str, name: &str) -> Result<(), SyntaxFlowError> {
    if name.is_empty() {
        return Err(critical(format!("empty {}", what)));
    }
    Ok(())
}

fn string_condition(raw: &str) -> Result<StringCondition, SyntaxFlowError> {
    Ok(match NamePattern::classify(raw)? {
        NamePattern::Exact(s) => StringCondition::Exact(s),
        NamePattern::Glob(g) => StringCondition::Glob(g),
        NamePattern::Regexp(re) => StringCondition::Regexp(re),
    })
}

/// Validate a `{key: value}` block. Values are passed through untouched.
fn config_items(config: &[(String, String)]) -> Result<Vec<RecursiveConfigItem>, SyntaxFlowError> {
    config
        .iter()
        .map(|(key, value)| {
            let key = RecursiveConfigKey::parse(key)
                .ok_or_else(|| SyntaxFlowError::Syntax(format!("unknown recursive config key: {}", key)))?;
            if key.is_sub_rule() {
                if value.trim().is_empty() {
                    return Err(SyntaxFlowError::Syntax(format!("{} needs a rule", key.as_str())));
                }
            } else if value.trim().parse::<u32>().is_err() {
                return Err(SyntaxFlowError::Syntax(format!(
                    "{} must be a non-negative integer, got {:?}",
                    key.as_str(),
                    value
                )));
            }
            Ok(RecursiveConfigItem { key, value: value.clone() })
        })
        .collect()
}

fn describe(elements: &[ChainElement]) -> String {
    elements
        .iter()
        .map(|e| match e {
            ChainElement::Member(n) => format!(".{}", n),
            ChainElement::Recursive(n) => format!("...{}", n),
            ChainElement::Search(n) => format!(" {}", n),
            ChainElement::Call(_) => "()".to_string(),
            ChainElement::Fields => ".*".to_string(),
            ChainElement::Index(i) => format!("[{}]", i),
            ChainElement::Navigate { kind, .. } => match kind {
                NavigationKind::Users => " ->".to_string(),
                NavigationKind::Defs => " #>".to_string(),
                NavigationKind::BottomUsers => " -->".to_string(),
                NavigationKind::TopDefs => " #->".to_string(),
            },
            ChainElement::Filter(_) => "?{...}".to_string(),
            ChainElement::Bind(n) => format!(" as ${}", n),
            ChainElement::NativeCall { name, .. } => format!("<{}>", name),
            ChainElement::Merge(n) => format!(" + ${}", n),
            ChainElement::Remove(n) => format!(" - ${}", n),
            ChainElement::Intersect(n) => format!(" & ${}", n),
        })
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::ChainBuilder;
    use crate::ir::BinaryOp;

    fn compile(query: Query) -> Vec<Instruction> {
        QueryCompiler::compile(&query).unwrap()
    }

    #[test]
    fn test_compile_search_and_bind() {
        let code = compile(Query::new().chain(ChainBuilder::search("aaa").bind("target")));
        assert_eq!(
            code,
            vec![
                Instruction::SearchExact { name: "aaa".into(), mode: MatchMode::NAME },
                Instruction::UpdateRef("target".into()),
            ]
        );
    }

    #[test]
    fn test_compile_unbound_chain_binds_anonymous() {
        let code = compile(Query::new().chain(ChainBuilder::search("a*").call()));
        assert!(matches!(code[0], Instruction::SearchGlob { .. }));
        assert_eq!(code[1], Instruction::GetCall);
        assert_eq!(code[2], Instruction::Pop { bind_anonymous: true });
    }

    #[test]
    fn test_compile_mid_chain_bind_duplicates() {
        let code = compile(Query::new().chain(ChainBuilder::search("a").bind("x").member("b").bind("y")));
        assert_eq!(
            code,
            vec![
                Instruction::SearchExact { name: "a".into(), mode: MatchMode::NAME },
                Instruction::Duplicate,
                Instruction::UpdateRef("x".into()),
                Instruction::GetFields,
                Instruction::SearchExact { name: "b".into(), mode: MatchMode::KEY },
                Instruction::UpdateRef("y".into()),
            ]
        );
    }

    #[test]
    fn test_compile_root_discipline() {
        let query = Query::new()
            .chain(ChainBuilder::search("a").bind("x"))
            .chain(ChainBuilder::variable("x").bind("y"))
            .chain(ChainBuilder::search("b").bind("z"))
            .check("z", None, None);
        let code = compile(query);
        assert_eq!(code[0], Instruction::Duplicate);
        assert_eq!(code[1], Instruction::SearchExact { name: "a".into(), mode: MatchMode::NAME });
        assert_eq!(code[3], Instruction::NewRef("x".into()));
        // the last root search consumes the root itself
        assert_eq!(code[5], Instruction::SearchExact { name: "b".into(), mode: MatchMode::NAME });
        assert!(matches!(code[7], Instruction::Check { .. }));
    }

    #[test]
    fn test_compile_recursive_and_regexp() {
        let code = compile(Query::new().chain(ChainBuilder::search("/^get/").recursive("exec").bind("x")));
        assert_eq!(code[0], Instruction::SearchRegexp { pattern: "^get".into(), mode: MatchMode::NAME });
        assert_eq!(code[1], Instruction::RecursiveSearchExact { name: "exec".into(), mode: MatchMode::NAME });
    }

    #[test]
    fn test_compile_bottom_users_config_verbatim() {
        let code = compile(Query::new().chain(
            ChainBuilder::search("a").navigate_with(NavigationKind::BottomUsers, &[("depth", "1")]).search_next("*").bind("b"),
        ));
        assert_eq!(
            code[1],
            Instruction::GetBottomUsers(vec![RecursiveConfigItem { key: RecursiveConfigKey::Depth, value: "1".into() }])
        );
    }

    #[test]
    fn test_compile_config_errors() {
        let bad_key = Query::new().chain(ChainBuilder::search("a").navigate_with(NavigationKind::Users, &[("deep", "1")]));
        assert!(matches!(QueryCompiler::compile(&bad_key), Err(SyntaxFlowError::Syntax(_))));
        let bad_depth = Query::new().chain(ChainBuilder::search("a").navigate_with(NavigationKind::TopDefs, &[("depth", "-1")]));
        assert!(matches!(QueryCompiler::compile(&bad_depth), Err(SyntaxFlowError::Syntax(_))));
        let rule = Query::new().chain(ChainBuilder::search("a").navigate_with(NavigationKind::Defs, &[("until", "* as $x")]));
        assert!(QueryCompiler::compile(&rule).is_ok());
    }

    #[test]
    fn test_compile_filter_block() {
        let cond = ConditionExpr::have(&["hello"]).and(ConditionExpr::opcode(&["const"]));
        let code = compile(Query::new().chain(ChainBuilder::variable("a").filter(cond)));
        let rendered: Vec<String> = code.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "new-ref $a",
                "filter-enter",
                "duplicate",
                "compare-string have hello",
                "duplicate",
                "compare-opcode const",
                "logic-and",
                "filter-exit",
                "condition",
                "pop -> $_",
            ]
        );
    }

    #[test]
    fn test_compile_relational_condition() {
        let cond = ConditionExpr::Compare { op: BinaryOp::GtEq, literal: Literal::Number(2.0) };
        let code = compile(Query::new().chain(ChainBuilder::variable("a").filter(cond).bind("b")));
        assert_eq!(code[3], Instruction::PushNumber(2.0));
        assert_eq!(code[4], Instruction::Compare(BinaryOp::GtEq));
    }

    #[test]
    fn test_compile_sub_query_loop_is_patched() {
        let cond = ConditionExpr::Query(vec![ChainElement::Member("foo".into())]);
        let code = compile(Query::new().chain(ChainBuilder::variable("a").filter(cond).bind("b")));
        let next = code.iter().position(|i| matches!(i, Instruction::IterNext { .. })).unwrap();
        let exit = match code[next] {
            Instruction::IterNext { exit } => exit,
            _ => unreachable!(),
        };
        assert!(matches!(code[exit], Instruction::IterEnd { .. }));
        assert_eq!(code[exit - 1], Instruction::Jump(next));
        assert_eq!(code[exit - 2], Instruction::IterCollect);
    }

    #[test]
    fn test_compile_call_args() {
        let chain = ChainBuilder::search("exec").call_with(vec![
            CallArg::index(0, vec![ChainElement::Bind("cmd".into())]),
            CallArg::all(vec![ChainElement::Search("*".into())]),
        ]);
        let code = compile(Query::new().chain(chain.bind("call")));
        let rendered: Vec<String> = code.iter().map(|i| i.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "search-exact exec [name]",
                "get-call",
                "get-call-args 0",
                "update-ref $cmd",
                "duplicate",
                "get-all-call-args",
                "search-glob * [name]",
                "pop",
                "update-ref $call",
            ]
        );
    }

    #[test]
    fn test_compile_user_errors_vs_faults() {
        let bad_opcode = Query::new().chain(ChainBuilder::variable("a").filter(ConditionExpr::opcode(&["nonsense"])));
        assert!(matches!(QueryCompiler::compile(&bad_opcode), Err(SyntaxFlowError::Syntax(_))));
        let bad_regexp = Query::new().chain(ChainBuilder::search("/a(/"));
        assert!(matches!(QueryCompiler::compile(&bad_regexp), Err(SyntaxFlowError::Syntax(_))));
        let empty = Query::new().chain(ChainBuilder::variable("a").filter(ConditionExpr::Opcode(vec![])));
        assert!(QueryCompiler::compile(&empty).unwrap_err().is_critical());
        let unnamed = Query::new().chain(ChainBuilder::search(""));
        assert!(QueryCompiler::compile(&unnamed).unwrap_err().is_critical());
    }

    #[test]
    fn test_compile_statements() {
        let query = Query::new()
            .desc(&[("title", "demo")])
            .statement(Statement::FileFilter {
                path: "app.properties".into(),
                mode: FileFilterMode::Regexp,
                params: vec![],
                rules: vec!["password=\\w+".into()],
                binding: Some("secret".into()),
            })
            .check("secret", Some("found"), None)
            .alert("secret");
        let code = compile(query);
        assert!(matches!(code[0], Instruction::AddDescription(_)));
        assert!(matches!(code[1], Instruction::FileFilterRegexp { .. }));
        assert_eq!(code[2], Instruction::UpdateRef("secret".into()));
        assert!(matches!(code[3], Instruction::Check { .. }));
        assert!(matches!(code[4], Instruction::Alert { .. }));
    }
}
