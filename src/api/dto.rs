//! Data Transfer Objects
//!
//! Response types for the API endpoints. Request bodies reuse the engine's
//! [`QueryRequest`](crate::engine::QueryRequest) and
//! [`DebugRequest`](crate::engine::DebugRequest).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::engine::QueryResult;

// ============================================
// QUERY DTOs
// ============================================

/// Answer to a query batch, one result per compiled statement
#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub content: Vec<QueryResult>,
}

/// Raw backend answer to a debug query
#[derive(Debug, Serialize, Deserialize)]
pub struct DebugResponse {
    pub content: Json,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy", "degraded" or "unhealthy"
    pub status: String,
    /// "ok" while every worker slot is supervised
    pub workers: String,
    pub completed_requests: u64,
    pub worker_crashes: u64,
    /// Last index warm-up, unix ms; absent when warm-up is off or has not run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_refreshed_at: Option<i64>,
    pub uptime_seconds: u64,
    pub version: String,
}
