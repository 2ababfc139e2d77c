//! Column/value maps used for entity data and command parameters.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A set of named column values.
///
/// Rows carry entity data snapshots, the context (columns to write) and the
/// scope (columns to match) of storage commands. Columns are kept sorted so
/// iteration order is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column assignment.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column name.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Get a value by column name, treating NULL as absent.
    pub fn get_present(&self, column: &str) -> Option<&Value> {
        self.values.get(column).filter(|v| !v.is_null())
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// Set a column value, returning the previous one.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.values.insert(column.into(), value.into())
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.values.remove(column)
    }

    /// Overwrite columns with the values of `other`.
    pub fn merge(&mut self, other: &Row) {
        for (column, value) in &other.values {
            self.values.insert(column.clone(), value.clone());
        }
    }

    /// Columns of `self` whose value differs from (or is missing in) `baseline`.
    pub fn changes_from(&self, baseline: &Row) -> Row {
        let values = self
            .values
            .iter()
            .filter(|(column, value)| baseline.get(column) != Some(*value))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        Row { values }
    }

    /// Keep only the listed columns.
    pub fn project(&self, columns: &[String]) -> Row {
        let values = self
            .values
            .iter()
            .filter(|(column, _)| columns.iter().any(|c| c == *column))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect();
        Row { values }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let values = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Row { values }
    }
}

impl IntoIterator for Row {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changes_from_reports_new_and_modified_columns() {
        let baseline = Row::new().with("id", 1_i64).with("name", "old");
        let current = Row::new()
            .with("id", 1_i64)
            .with("name", "new")
            .with("email", "a@b.c");

        let changes = current.changes_from(&baseline);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes.get("name"), Some(&Value::from("new")));
        assert!(changes.contains("email"));
        assert!(!changes.contains("id"));
    }

    #[test]
    fn get_present_skips_null() {
        let row = Row::new().with("id", Value::Null).with("name", "x");
        assert!(row.get("id").is_some());
        assert!(row.get_present("id").is_none());
        assert!(row.get_present("name").is_some());
    }

    #[test]
    fn project_and_merge() {
        let mut row: Row = [("a", 1_i64), ("b", 2_i64), ("c", 3_i64)]
            .into_iter()
            .collect();
        let projected = row.project(&["a".to_string(), "c".to_string()]);
        assert_eq!(projected.columns().collect::<Vec<_>>(), vec!["a", "c"]);

        row.merge(&Row::new().with("b", 20_i64).with("d", 4_i64));
        assert_eq!(row.get("b"), Some(&Value::BigInt(20)));
        assert_eq!(row.len(), 4);
    }
}
