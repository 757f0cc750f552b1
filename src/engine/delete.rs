//! Delete statements
//!
//! ```text
//! delete(dql='cpu:(usage) {host = "a"} [1d]')   re-run a query as a delete
//! delete(measurement='cpu')                      drop a measurement
//! delete(index='logging')                        empty a namespace index
//! ```

use serde_json::Value as Json;

use crate::query::ast::{DeleteTarget, Namespace, Stmt};
use crate::query::search::{self, SearchLimits};
use crate::query::{influxql, AstResult, DqlError, DqlResult};

/// Backend operation a delete statement turns into
#[derive(Debug, Clone, PartialEq)]
pub enum DeletePlan {
    /// Statement for the workspace's time-series database
    Statement(String),
    /// Delete-by-query against one index
    ByQuery { index: String, body: Json },
}

impl DeletePlan {
    /// Text reported as the raw query of the result
    pub fn raw_query(&self) -> String {
        match self {
            DeletePlan::Statement(text) => format!("delete by query: {}", text),
            DeletePlan::ByQuery { body, .. } => format!("delete by query: {}", body),
        }
    }
}

/// Plan a `delete(dql=...)` from its compiled inner query
pub fn plan_query_delete(
    inner: &AstResult,
    workspace: &str,
    limits: &SearchLimits,
    now_ms: i64,
) -> DqlResult<DeletePlan> {
    let Stmt::Query(q) = &inner.stmt else {
        return Err(DqlError::NotImplemented(format!(
            "delete of a {} statement",
            inner.stmt.kind()
        )));
    };
    match inner.namespace {
        Namespace::Metric => Ok(DeletePlan::Statement(influxql::translate_delete(q)?)),
        ns if ns.is_document() => {
            let index = ns
                .index_name(workspace)
                .ok_or_else(|| DqlError::InvalidNamespace(ns.code().to_string()))?;
            let body = search::translate_delete(q, ns, limits, now_ms)?;
            Ok(DeletePlan::ByQuery { index, body })
        }
        other => Err(DqlError::NotImplemented(format!("delete on namespace {}", other))),
    }
}

/// Plan deletes that need no inner query
pub fn plan_direct_delete(target: &DeleteTarget, workspace: &str) -> DqlResult<DeletePlan> {
    match target {
        DeleteTarget::Dql(text) => Err(DqlError::query(format!(
            "delete of `{}' needs its inner query compiled first",
            text
        ))),
        DeleteTarget::Measurement(name) => Ok(DeletePlan::Statement(influxql::drop_measurement(name))),
        DeleteTarget::Index(code) => {
            let ns = Namespace::from_code(code)?;
            let index = ns
                .index_name(workspace)
                .ok_or_else(|| DqlError::InvalidNamespace(code.clone()))?;
            Ok(DeletePlan::ByQuery {
                index,
                body: search::match_all_delete(),
            })
        }
    }
}
