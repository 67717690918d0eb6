//! Functions module: native calls extending the fixed opcode set (`<name(k=v)>`).
//!
//! This module provides the NativeCall trait, an injectable registry, and the built-in calls.

use crate::frame::Frame;
use crate::value::{ConstValue, ValueRef, Values};
use crate::SyntaxFlowError;
use indexmap::IndexMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Named parameters of a native call, in source order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeCallParams {
    params: IndexMap<String, String>,
}

impl NativeCallParams {
    pub fn new(params: &[(String, String)]) -> Self {
        Self { params: params.iter().cloned().collect() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str())
    }

    pub fn require(&self, key: &str) -> Result<&str, SyntaxFlowError> {
        self.get(key).ok_or_else(|| SyntaxFlowError::Value(format!("missing native call parameter: {}", key)))
    }

    pub fn get_usize(&self, key: &str) -> Result<Option<usize>, SyntaxFlowError> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| SyntaxFlowError::Value(format!("native call parameter {} is not an index: {}", key, raw))),
        }
    }

    pub fn as_map(&self) -> &IndexMap<String, String> {
        &self.params
    }
}

/// What a native call made of one element.
#[derive(Debug, Clone, Default)]
pub struct NativeCallOutput {
    /// When false the element passes through unchanged.
    pub handled: bool,
    pub values: Values,
}

impl NativeCallOutput {
    pub fn pass() -> Self {
        Self::default()
    }

    pub fn values(values: Values) -> Self {
        Self { handled: true, values }
    }

    pub fn single(value: ValueRef) -> Self {
        Self::values(Values::single(value))
    }
}

pub trait NativeCall: Send + Sync {
    fn call(&self, value: &ValueRef, frame: &mut Frame, params: &NativeCallParams) -> Result<NativeCallOutput, SyntaxFlowError>;
}

impl<F> NativeCall for F
where
    F: Fn(&ValueRef, &mut Frame, &NativeCallParams) -> Result<NativeCallOutput, SyntaxFlowError> + Send + Sync,
{
    fn call(&self, value: &ValueRef, frame: &mut Frame, params: &NativeCallParams) -> Result<NativeCallOutput, SyntaxFlowError> {
        self(value, frame, params)
    }
}

pub type NativeCallFn = Arc<dyn NativeCall>;

/// Name to native call table, safe for concurrent lookup while registering.
#[derive(Default)]
pub struct NativeCallRegistry {
    calls: RwLock<HashMap<String, NativeCallFn>>,
}

impl NativeCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let reg = Self::new();
        register_builtins(&reg);
        reg
    }

    /// Last writer wins.
    pub fn register<F>(&self, name: impl Into<String>, call: F)
    where
        F: NativeCall + 'static,
    {
        self.calls.write().insert(name.into(), Arc::new(call));
    }

    /// Register a closure; spelled out so closure signatures infer.
    pub fn register_fn<F>(&self, name: impl Into<String>, call: F)
    where
        F: Fn(&ValueRef, &mut Frame, &NativeCallParams) -> Result<NativeCallOutput, SyntaxFlowError> + Send + Sync + 'static,
    {
        self.register(name, call);
    }

    pub fn lookup(&self, name: &str) -> Result<NativeCallFn, SyntaxFlowError> {
        self.calls.read().get(name).cloned().ok_or_else(|| SyntaxFlowError::NativeCallNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.calls.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.calls.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for NativeCallRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCallRegistry").field("calls", &self.names()).finish()
    }
}

macro_rules! builtin_native_calls {
    ($( $name:ident: $call_name:expr, ($value:ident, $frame:ident, $params:ident) => $body:block ),* $(,)?) => {
        $(
            pub struct $name;
            impl NativeCall for $name {
                fn call(&self, $value: &ValueRef, $frame: &mut Frame, $params: &NativeCallParams) -> Result<NativeCallOutput, SyntaxFlowError> $body
            }
        )*
        pub fn register_builtins(reg: &NativeCallRegistry) {
            $(reg.register($call_name, $name);)*
        }
    };
}

builtin_native_calls! {
    ShowCall: "show", (value, _frame, _params) => {
        info!(id = value.id(), name = %value.name(), text = %value.text(), "show");
        Ok(NativeCallOutput::pass())
    },
    NameCall: "name", (value, _frame, _params) => {
        Ok(NativeCallOutput::single(ConstValue::string(value.name())))
    },
    StringCall: "string", (value, _frame, _params) => {
        Ok(NativeCallOutput::single(ConstValue::string(value.text())))
    },
    OpcodeCall: "opcode", (value, _frame, _params) => {
        Ok(NativeCallOutput::single(ConstValue::string(value.ir_opcode().as_str())))
    },
    GetCallCall: "getCall", (value, _frame, _params) => {
        Ok(NativeCallOutput::values(value.get_called()?))
    },
    GetFieldsCall: "getFields", (value, _frame, _params) => {
        Ok(NativeCallOutput::values(value.get_fields()?))
    },
    GetUsersCall: "getUsers", (value, frame, _params) => {
        let ctx = frame.traversal_context(&[]);
        Ok(NativeCallOutput::values(value.get_syntax_flow_use(&ctx)?))
    },
    GetDefsCall: "getDefs", (value, frame, _params) => {
        let ctx = frame.traversal_context(&[]);
        Ok(NativeCallOutput::values(value.get_syntax_flow_def(&ctx)?))
    },
    GetArgCall: "getArg", (value, _frame, params) => {
        let index = params.get_usize("index")?.unwrap_or(0);
        Ok(NativeCallOutput::values(value.get_call_actual_params(index, false)?))
    },
    InVarCall: "inVar", (value, frame, params) => {
        let name = params.require("name")?;
        let keep = frame.symbol(name).map(|v| v.contains(value.id())).unwrap_or(false);
        if keep {
            Ok(NativeCallOutput::pass())
        } else {
            Ok(NativeCallOutput::values(Values::new()))
        }
    },
}
