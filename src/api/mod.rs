//! DQL Engine REST API
//!
//! HTTP front door for the query engine, built with Axum.
//!
//! # Endpoints
//!
//! ## Query
//! - `POST /api/v1/query` - Run a query batch
//! - `POST /api/v1/query/backup` - Run a query batch, logging reads the backup index
//! - `POST /api/v1/query/debug` - Pass a native query straight to its backend
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use dql_engine::api::{serve, AppState};
//! use dql_engine::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!     let state = AppState::from_config(&config)?;
//!     serve(state, &config.api).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ApiConfig;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState, config: &ApiConfig) -> Router {
    let api_routes = Router::new()
        .route("/query", post(routes::query::execute_query))
        .route("/query/backup", post(routes::query::execute_backup_query))
        .route("/query/debug", post(routes::query::execute_debug_query))
        .layer(DefaultBodyLimit::max(config.max_body_size));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let shared_state = Arc::new(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(shared_state)
}

/// Start the API server
pub async fn serve(state: AppState, config: &ApiConfig) -> Result<(), ApiError> {
    let router = build_router(state, config);

    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("DQL engine listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("DQL engine shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackends;
    use crate::engine::{Executor, ExecutorFactory, PoolConfig, Row, WorkerPool};
    use crate::query::{Compiler, Value};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value as Json};
    use tower::util::ServiceExt;

    fn create_test_app() -> (Router, MockBackends) {
        let mocks = MockBackends::new();
        let backends = mocks.backends.clone();
        let factory: ExecutorFactory =
            Arc::new(move || Executor::new(backends.clone(), Compiler::default(), None, "ms"));
        let config = PoolConfig {
            workers: 2,
            query_timeout_secs: 5,
            restart_backoff_ms: 0,
            ..Default::default()
        };
        let pool = Arc::new(WorkerPool::start(config, factory));
        let router = build_router(AppState::new(pool), &ApiConfig::default());
        (router, mocks)
    }

    fn post_json(uri: &str, body: Json) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Json {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let (app, _mocks) = create_test_app();
        for uri in ["/health/live", "/health/ready", "/health"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_full_health_body() {
        let (app, _mocks) = create_test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["worker_crashes"], 0);
        assert!(body.get("index_refreshed_at").is_none());
    }

    #[tokio::test]
    async fn test_query_returns_content() {
        let (app, mocks) = create_test_app();
        mocks.timeseries.reply(
            "FROM \"cpu\"",
            vec![Row::new("cpu", vec!["time".into(), "usage".into()])
                .with_values(vec![vec![Value::Int(1), Value::Float(0.5)]])],
        );

        let response = app
            .oneshot(post_json(
                "/api/v1/query",
                json!({"workspace": "ws1", "queries": [{"query": "cpu:(usage)"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let series = &body["content"][0]["series"][0];
        assert_eq!(series["name"], "cpu");
        assert_eq!(series["columns"], json!(["time", "usage"]));
        assert_eq!(series["values"], json!([[1, 0.5]]));
    }

    #[tokio::test]
    async fn test_parse_error_is_bad_request() {
        let (app, _mocks) = create_test_app();
        let response = app
            .oneshot(post_json(
                "/api/v1/query",
                json!({"workspace": "ws1", "queries": [{"query": "cpu:("}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "dql.ParseError");
        assert!(body["request_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_missing_workspace_rejected() {
        let (app, _mocks) = create_test_app();
        let response = app
            .oneshot(post_json(
                "/api/v1/query",
                json!({"queries": [{"query": "cpu:(usage)"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let (app, _mocks) = create_test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/query")
                    .header("Content-Type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backup_and_debug_routes() {
        let (app, mocks) = create_test_app();
        mocks.search.reply("ws1_logging", json!({"took": 2}));

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/query/backup",
                json!({"workspace": "ws1", "queries": [{"query": "L::nginx:(message)"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                "/api/v1/query/debug",
                json!({"workspace": "ws1", "namespace": "L", "query": "{\"size\": 0}"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["content"], json!({"took": 2}));

        let searches = mocks.search.searches.lock().unwrap();
        assert_eq!(searches[0].0, vec!["ws1_backup_log".to_string()]);
        assert_eq!(searches[1].0, vec!["ws1_logging".to_string()]);
    }
}
