use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::process::table::CanonicalTable;

/// A column every reconciled table must carry, and the literal used when a
/// source file lacks it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultColumn {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// How a family's drifting headers map onto its canonical shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRules {
    /// legacy name → canonical name
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
    /// appended, in this order, when missing after renaming
    #[serde(default)]
    pub defaults: Vec<DefaultColumn>,
    #[serde(default)]
    pub deprecated: Vec<String>,
}

/// What [`reconcile`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub renamed: Vec<(String, String)>,
    pub filled: Vec<String>,
    pub dropped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.renamed.is_empty() && self.filled.is_empty() && self.dropped.is_empty()
    }
}

impl SchemaRules {
    /// Register `legacy → canonical`; a later alias for the same legacy name wins.
    pub fn alias(mut self, legacy: &str, canonical: &str) -> Self {
        self.aliases
            .insert(legacy.to_string(), canonical.to_string());
        self
    }

    pub fn default_column(mut self, name: &str, value: &str) -> Self {
        self.defaults.push(DefaultColumn {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn deprecate(mut self, name: &str) -> Self {
        self.deprecated.push(name.to_string());
        self
    }

    /// Canonical name for `column`, or `column` itself.
    pub fn canonical<'a>(&'a self, column: &'a str) -> &'a str {
        self.aliases.get(column).map(String::as_str).unwrap_or(column)
    }
}

/// Rename aliased columns, then append missing defaults, then drop deprecated
/// columns. Renaming runs first so a default is never added for a column a
/// rename is about to supply.
///
/// A legacy column whose canonical name is already present is left untouched.
pub fn reconcile(table: &mut CanonicalTable, rules: &SchemaRules) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    let legacy: Vec<String> = table
        .headers
        .iter()
        .filter(|h| rules.aliases.contains_key(h.as_str()))
        .cloned()
        .collect();
    for from in legacy {
        let to = rules.canonical(&from).to_string();
        if to == from {
            continue;
        }
        if table.has_column(&to) {
            debug!(legacy = %from, canonical = %to, "canonical column already present, keeping both");
            continue;
        }
        table.rename_column(&from, &to);
        report.renamed.push((from, to));
    }

    for default in &rules.defaults {
        if !table.has_column(&default.name) {
            table.add_column(&default.name, &default.value);
            report.filled.push(default.name.clone());
        }
    }

    for name in &rules.deprecated {
        if table.drop_column(name) {
            report.dropped.push(name.clone());
        }
    }

    report
}

/// [`reconcile`] applied to a bare header.
pub fn standardize_headers(headers: &[String], rules: &SchemaRules) -> Vec<String> {
    let mut table = CanonicalTable::new(headers.to_vec());
    reconcile(&mut table, rules);
    table.headers
}
