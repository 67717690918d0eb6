//! Query AST module: the parsed representation of SyntaxFlow queries.
//!
//! Parsing query text is the job of an external front end; it hands the compiler a [`Query`].
//! Names are kept as raw text (`aaa`, `a*`, `/re/`) so the compiler can classify them by shape.

use crate::ir::{BinaryOp, FileFilterMode, StringMatchMode};
use crate::value::Literal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// A value chain such as `a.b() as $c`.
    Chain(Chain),
    /// `check $var then "..." else "..."`
    Check { var: String, then_msg: Option<String>, else_msg: Option<String> },
    /// `alert $var for { key: value }`
    Alert { var: String, extra: Vec<(String, String)> },
    /// `desc(title: "...", level: high)`
    Desc(Vec<(String, String)>),
    /// `${path}.re(...)`, `${path}.jsonpath(...)`, `${path}.xpath(...)`
    FileFilter {
        path: String,
        mode: FileFilterMode,
        params: Vec<(String, String)>,
        rules: Vec<String>,
        binding: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub head: ChainHead,
    pub elements: Vec<ChainElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainHead {
    /// Search the input values by name.
    Search(String),
    /// Read a bound variable.
    Variable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NavigationKind {
    /// `->`
    Users,
    /// `#>`
    Defs,
    /// `-->`
    BottomUsers,
    /// `#->`
    TopDefs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChainElement {
    /// `.name`
    Member(String),
    /// `...name`
    Recursive(String),
    /// A plain name search on the current values, e.g. the `*` in `a --> *`.
    Search(String),
    /// `()` with optional argument sub-chains.
    Call(Vec<CallArg>),
    /// Enumerate every field.
    Fields,
    /// `[i]`
    Index(usize),
    Navigate { kind: NavigationKind, config: Option<Vec<(String, String)>> },
    /// `?{...}`
    Filter(ConditionExpr),
    /// `as $name`
    Bind(String),
    /// `<name(k=v)>`
    NativeCall { name: String, params: Vec<(String, String)> },
    /// `+ $name`
    Merge(String),
    /// `- $name`
    Remove(String),
    /// `& $name`
    Intersect(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgPosition {
    /// Argument `index`; with `rest` every following argument as well.
    Index { index: usize, rest: bool },
    /// Every argument.
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallArg {
    pub position: ArgPosition,
    pub elements: Vec<ChainElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionExpr {
    /// `opcode: const, call`
    Opcode(Vec<String>),
    /// `have: "a", "b"` / `any: "a", "b"`
    Strings { mode: StringMatchMode, patterns: Vec<String> },
    /// `version in [1.0, 2.0)`
    VersionIn(Vec<String>),
    /// `== "literal"`
    Compare { op: BinaryOp, literal: Literal },
    /// A bare glob or regexp name, e.g. `?{ get* }`.
    Name(String),
    /// A nested sub-query that must produce something, e.g. `?{ .foo }`.
    Query(Vec<ChainElement>),
    And(Box<ConditionExpr>, Box<ConditionExpr>),
    Or(Box<ConditionExpr>, Box<ConditionExpr>),
    Not(Box<ConditionExpr>),
}

impl ConditionExpr {
    pub fn and(self, rhs: ConditionExpr) -> ConditionExpr {
        ConditionExpr::And(Box::new(self), Box::new(rhs))
    }

    pub fn or(self, rhs: ConditionExpr) -> ConditionExpr {
        ConditionExpr::Or(Box::new(self), Box::new(rhs))
    }

    pub fn negate(self) -> ConditionExpr {
        ConditionExpr::Not(Box::new(self))
    }

    pub fn opcode(names: &[&str]) -> ConditionExpr {
        ConditionExpr::Opcode(names.iter().map(|s| s.to_string()).collect())
    }

    pub fn have(patterns: &[&str]) -> ConditionExpr {
        ConditionExpr::Strings { mode: StringMatchMode::Have, patterns: patterns.iter().map(|s| s.to_string()).collect() }
    }

    pub fn any(patterns: &[&str]) -> ConditionExpr {
        ConditionExpr::Strings { mode: StringMatchMode::Any, patterns: patterns.iter().map(|s| s.to_string()).collect() }
    }
}

/// Fluent construction of a [`Chain`], mostly for tests and embedders without a parser.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    chain: Chain,
}

impl ChainBuilder {
    pub fn search(name: &str) -> Self {
        Self { chain: Chain { head: ChainHead::Search(name.to_string()), elements: Vec::new() } }
    }

    pub fn variable(name: &str) -> Self {
        Self { chain: Chain { head: ChainHead::Variable(name.to_string()), elements: Vec::new() } }
    }

    pub fn then(mut self, element: ChainElement) -> Self {
        self.chain.elements.push(element);
        self
    }

    pub fn member(self, name: &str) -> Self {
        self.then(ChainElement::Member(name.to_string()))
    }

    pub fn recursive(self, name: &str) -> Self {
        self.then(ChainElement::Recursive(name.to_string()))
    }

    pub fn search_next(self, name: &str) -> Self {
        self.then(ChainElement::Search(name.to_string()))
    }

    pub fn call(self) -> Self {
        self.then(ChainElement::Call(Vec::new()))
    }

    pub fn call_with(self, args: Vec<CallArg>) -> Self {
        self.then(ChainElement::Call(args))
    }

    pub fn navigate(self, kind: NavigationKind) -> Self {
        self.then(ChainElement::Navigate { kind, config: None })
    }

    pub fn navigate_with(self, kind: NavigationKind, config: &[(&str, &str)]) -> Self {
        let config = config.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.then(ChainElement::Navigate { kind, config: Some(config) })
    }

    pub fn filter(self, cond: ConditionExpr) -> Self {
        self.then(ChainElement::Filter(cond))
    }

    pub fn bind(self, name: &str) -> Self {
        self.then(ChainElement::Bind(name.to_string()))
    }

    pub fn native(self, name: &str, params: &[(&str, &str)]) -> Self {
        let params = params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.then(ChainElement::NativeCall { name: name.to_string(), params })
    }

    pub fn build(self) -> Chain {
        self.chain
    }

    pub fn statement(self) -> Statement {
        Statement::Chain(self.chain)
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn statement(mut self, statement: Statement) -> Self {
        self.statements.push(statement);
        self
    }

    pub fn chain(self, chain: ChainBuilder) -> Self {
        self.statement(chain.statement())
    }

    pub fn check(self, var: &str, then_msg: Option<&str>, else_msg: Option<&str>) -> Self {
        self.statement(Statement::Check {
            var: var.to_string(),
            then_msg: then_msg.map(str::to_string),
            else_msg: else_msg.map(str::to_string),
        })
    }

    pub fn alert(self, var: &str) -> Self {
        self.statement(Statement::Alert { var: var.to_string(), extra: Vec::new() })
    }

    pub fn desc(self, items: &[(&str, &str)]) -> Self {
        self.statement(Statement::Desc(items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()))
    }
}

impl CallArg {
    pub fn index(index: usize, elements: Vec<ChainElement>) -> Self {
        Self { position: ArgPosition::Index { index, rest: false }, elements }
    }

    pub fn all(elements: Vec<ChainElement>) -> Self {
        Self { position: ArgPosition::All, elements }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_produces_chain() {
        let query = Query::new().chain(ChainBuilder::search("aaa").member("b").bind("x"));
        assert_eq!(query.statements.len(), 1);
        match &query.statements[0] {
            Statement::Chain(chain) => {
                assert_eq!(chain.head, ChainHead::Search("aaa".into()));
                assert_eq!(
                    chain.elements,
                    vec![ChainElement::Member("b".into()), ChainElement::Bind("x".into())]
                );
            }
            other => panic!("unexpected statement {:?}", other),
        }
    }

    #[test]
    fn test_condition_combinators() {
        let cond = ConditionExpr::have(&["hello"]).and(ConditionExpr::opcode(&["const"])).negate();
        assert!(matches!(cond, ConditionExpr::Not(_)));
    }

    #[test]
    fn test_query_serialization() {
        let query = Query::new().chain(ChainBuilder::search("a").filter(ConditionExpr::opcode(&["const"])));
        let json = serde_json::to_string(&query).unwrap();
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(query, back);
    }
}
