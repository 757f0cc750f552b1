//! Backend Collaborators
//!
//! The engine talks to three external services through these traits:
//! - a time-series store answering InfluxQL statements
//! - a search cluster answering JSON query bodies
//! - a function service executing `F::` calls
//!
//! HTTP implementations live in [`http`]; tests use in-memory doubles.

pub mod http;
#[cfg(test)]
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;

use crate::engine::Row;
use crate::query::DqlError;

pub use http::{
    Credentials, HttpFunctionService, HttpSearchClient, HttpTimeSeriesClient,
    HttpTimeSeriesConnector,
};

/// Errors raised by backend clients
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend request timed out: {0}")]
    Timeout(String),

    #[error("backend returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("backend rejected the query: {0}")]
    Rejected(String),

    #[error("unknown workspace `{0}'")]
    UnknownWorkspace(String),

    #[error("unknown time-series instance `{0}'")]
    UnknownInstance(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BackendError::Timeout(e.to_string())
        } else if e.is_connect() {
            BackendError::Unavailable(e.to_string())
        } else if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }
}

impl From<BackendError> for DqlError {
    fn from(e: BackendError) -> Self {
        DqlError::Query(e.to_string())
    }
}

/// One statement for the time-series store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TsQuery {
    pub statement: String,
    pub database: String,
    pub retention_policy: String,
    pub precision: String,
}

/// Executes statements against one time-series instance
#[async_trait]
pub trait TimeSeriesClient: Send + Sync {
    async fn query(&self, query: &TsQuery) -> Result<Vec<Row>, BackendError>;
}

/// Opens clients for named time-series instances
pub trait TimeSeriesConnector: Send + Sync {
    fn connect(&self, instance: &str) -> Result<Arc<dyn TimeSeriesClient>, BackendError>;
}

/// One index known to the search cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    /// Creation time in unix ms
    pub created_ms: i64,
}

/// Search cluster operations the engine needs
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Run a search body against one or more indices
    async fn search(&self, indices: &[String], body: &Json) -> Result<Json, BackendError>;

    /// Field mappings of an index
    async fn mapping(&self, index: &str) -> Result<Json, BackendError>;

    /// Delete every document matching the body's query
    async fn delete_by_query(&self, index: &str, body: &Json) -> Result<Json, BackendError>;

    /// Every index in the cluster
    async fn list_indices(&self) -> Result<Vec<IndexInfo>, BackendError>;
}

/// Request forwarded to the function service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FuncRequest {
    pub function: String,
    pub workspace: String,
    pub kwargs: serde_json::Map<String, Json>,
    pub args: Vec<Json>,
}

/// Executes `F::` function calls
#[async_trait]
pub trait FunctionService: Send + Sync {
    async fn call(&self, request: &FuncRequest) -> Result<Vec<Row>, BackendError>;
}

/// Where a workspace's metric data lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub workspace: String,
    pub database: String,
    pub instance: String,
    pub retention_policy: String,
}

/// Maps workspace identifiers to their storage
pub trait WorkspaceDirectory: Send + Sync {
    fn lookup(&self, workspace: &str) -> Result<WorkspaceInfo, BackendError>;
}

/// Directory backed by a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    workspaces: HashMap<String, WorkspaceInfo>,
    /// Used for workspaces missing from the table, when set
    fallback_instance: Option<String>,
    default_retention_policy: String,
}

impl StaticDirectory {
    pub fn new(
        workspaces: impl IntoIterator<Item = WorkspaceInfo>,
        fallback_instance: Option<String>,
        default_retention_policy: impl Into<String>,
    ) -> Self {
        Self {
            workspaces: workspaces
                .into_iter()
                .map(|w| (w.workspace.clone(), w))
                .collect(),
            fallback_instance,
            default_retention_policy: default_retention_policy.into(),
        }
    }
}

impl WorkspaceDirectory for StaticDirectory {
    fn lookup(&self, workspace: &str) -> Result<WorkspaceInfo, BackendError> {
        if let Some(info) = self.workspaces.get(workspace) {
            return Ok(info.clone());
        }
        match &self.fallback_instance {
            Some(instance) => Ok(WorkspaceInfo {
                workspace: workspace.to_string(),
                database: workspace.to_string(),
                instance: instance.clone(),
                retention_policy: self.default_retention_policy.clone(),
            }),
            None => Err(BackendError::UnknownWorkspace(workspace.to_string())),
        }
    }
}

/// Every collaborator a worker needs
#[derive(Clone)]
pub struct Backends {
    pub directory: Arc<dyn WorkspaceDirectory>,
    pub timeseries: Arc<dyn TimeSeriesConnector>,
    pub search: Arc<dyn SearchClient>,
    pub functions: Arc<dyn FunctionService>,
}
