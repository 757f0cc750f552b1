//! Uniform tabular result shape

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::query::{DqlError, DqlResult, Value};

/// One series: a name, its tags, and value tuples aligned to the columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub values: Vec<Vec<Value>>,
}

impl Row {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            columns,
            values: Vec::new(),
        }
    }

    pub fn with_values(mut self, values: Vec<Vec<Value>>) -> Self {
        self.values = values;
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Every tuple must be as wide as the column list
    pub fn check_shape(&self) -> DqlResult<()> {
        for (i, tuple) in self.values.iter().enumerate() {
            if tuple.len() != self.columns.len() {
                return Err(DqlError::query(format!(
                    "series `{}' value {} has {} fields, expected {}",
                    self.name,
                    i,
                    tuple.len(),
                    self.columns.len()
                )));
            }
        }
        Ok(())
    }
}

/// Result of one resolved statement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub series: Vec<Row>,
    /// Wall time spent, e.g. `12.3ms`
    #[serde(default)]
    pub cost: String,
    /// Translated query, returned in explain mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hits: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_after: Option<Vec<serde_json::Value>>,
}

impl QueryResult {
    pub fn from_series(series: Vec<Row>) -> Self {
        Self {
            series,
            ..Default::default()
        }
    }
}
