//! Result module: what a query run leaves behind for report exporters.

use crate::value::Values;
use indexmap::IndexMap;
use serde::Serialize;

/// Outcome of one `check` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckRecord {
    pub var: String,
    pub passed: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryResult {
    symbol_table: IndexMap<String, Values>,
    alert_symbol_table: IndexMap<String, Values>,
    alert_info: IndexMap<String, IndexMap<String, String>>,
    errors: Vec<String>,
    checks: Vec<CheckRecord>,
    description: IndexMap<String, String>,
}

impl QueryResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(&self, name: &str) -> Option<&Values> {
        self.symbol_table.get(name)
    }

    pub fn symbol_table(&self) -> &IndexMap<String, Values> {
        &self.symbol_table
    }

    pub fn alert_symbol_table(&self) -> &IndexMap<String, Values> {
        &self.alert_symbol_table
    }

    /// Extra `for {...}` items of an alert.
    pub fn alert_info(&self, name: &str) -> Option<&IndexMap<String, String>> {
        self.alert_info.get(name)
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn checks(&self) -> &[CheckRecord] {
        &self.checks
    }

    pub fn description(&self) -> &IndexMap<String, String> {
        &self.description
    }

    pub(crate) fn set_symbol(&mut self, name: &str, values: Values) {
        self.symbol_table.insert(name.to_string(), values);
    }

    pub(crate) fn set_alert(&mut self, name: &str, values: Values, extra: &[(String, String)]) {
        self.alert_symbol_table.insert(name.to_string(), values);
        if !extra.is_empty() {
            self.alert_info.insert(name.to_string(), extra.iter().cloned().collect());
        }
    }

    pub(crate) fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub(crate) fn push_check(&mut self, record: CheckRecord) {
        self.checks.push(record);
    }

    pub(crate) fn add_description(&mut self, items: &[(String, String)]) {
        for (k, v) in items {
            self.description.insert(k.clone(), v.clone());
        }
    }

    /// Fold another result into this one. Symbols are unioned by identity, the rest appended.
    pub fn merge(&mut self, other: &QueryResult) {
        for (name, values) in &other.symbol_table {
            self.symbol_table.entry(name.clone()).or_default().extend(values);
        }
        for (name, values) in &other.alert_symbol_table {
            self.alert_symbol_table.entry(name.clone()).or_default().extend(values);
        }
        for (name, info) in &other.alert_info {
            self.alert_info.entry(name.clone()).or_default().extend(info.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.errors.extend(other.errors.iter().cloned());
        self.checks.extend(other.checks.iter().cloned());
        self.add_description(&other.description.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Vec<_>>());
    }

    pub fn has_alerts(&self) -> bool {
        self.alert_symbol_table.values().any(|v| !v.is_empty())
    }
}
