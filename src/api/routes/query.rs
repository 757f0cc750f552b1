//! Query Routes
//!
//! - POST /api/v1/query - Run a query batch
//! - POST /api/v1/query/backup - Run a query batch against backup logs
//! - POST /api/v1/query/debug - Pass a native query to its backend

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::api::dto::{DebugResponse, QueryResponse};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::engine::{DebugRequest, QueryRequest};

fn validate(req: &QueryRequest) -> ApiResult<()> {
    if req.workspace.is_empty() {
        return Err(ApiError::Validation("workspace is required".to_string()));
    }
    if req.queries.is_empty() {
        return Err(ApiError::Validation("queries cannot be empty".to_string()));
    }
    if let Some(i) = req.queries.iter().position(|q| q.query.trim().is_empty()) {
        return Err(ApiError::Validation(format!("query #{} is empty", i)));
    }
    Ok(())
}

/// POST /api/v1/query
pub async fn execute_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    validate(&req)?;
    let content = state.pool.query(req).await?;
    Ok(Json(QueryResponse { content }))
}

/// POST /api/v1/query/backup
pub async fn execute_backup_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    validate(&req)?;
    let content = state.pool.backup_query(req).await?;
    Ok(Json(QueryResponse { content }))
}

/// POST /api/v1/query/debug
pub async fn execute_debug_query(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DebugRequest>,
) -> ApiResult<Json<DebugResponse>> {
    if req.workspace.is_empty() || req.query.is_empty() {
        return Err(ApiError::Validation(
            "workspace and query are required".to_string(),
        ));
    }
    let content = state.pool.debug(req).await?;
    Ok(Json(DebugResponse { content }))
}
