//! Statement result types.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

/// A single row: column name to value.
pub type Row = BTreeMap<String, Value>;

/// Result of a statement execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueryResult {
    /// Rows returned by a read.
    Rows(ResultSet),
    /// Number of rows affected by a write.
    Modified { rows_affected: usize },
}

impl QueryResult {
    /// Create a modified result.
    pub fn modified(rows: usize) -> Self {
        QueryResult::Modified { rows_affected: rows }
    }

    /// Rows of a read, if this is one.
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Modified { .. } => None,
        }
    }

    /// Rows affected by a write, if this is one.
    pub fn rows_affected(&self) -> Option<usize> {
        match self {
            QueryResult::Rows(_) => None,
            QueryResult::Modified { rows_affected } => Some(*rows_affected),
        }
    }
}

/// A set of rows returned by a read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    /// Column names in order.
    pub columns: Vec<String>,
    /// Rows as maps of column name to value.
    pub rows: Vec<Row>,
}

impl ResultSet {
    /// Create a new empty result set.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Add a row.
    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get a row by index.
    pub fn get(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    /// Iterate over rows.
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}
