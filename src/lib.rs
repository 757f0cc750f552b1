//! # DQL Engine
//!
//! Compiles a small domain query language into backend-native queries,
//! runs them through a supervised worker pool and normalizes the answers
//! into one tabular result shape.
//!
//! ## Features
//!
//! - **One language, two backends**: InfluxQL statements for metrics, JSON
//!   search bodies for objects, logs, events, traces, RUM and security data
//! - **Composite queries**: lambda filter/link, outer functions, deletes and
//!   calls to an external function service
//! - **Uniform results**: aggregation trees flattened, columns renamed,
//!   fills and time buckets reconciled
//! - **Crash isolation**: every worker runs under a restarting supervisor
//!
//! ## Modules
//!
//! - [`query`]: parser, parameters, namespace resolution and translators
//! - [`engine`]: execution, normalization, rewriting and the worker pool
//! - [`backend`]: backend client traits and their HTTP implementations
//! - [`warmup`]: periodically refreshed search index cache
//! - [`api`]: REST API server with Axum
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dql_engine::query::{Compiler, QuerySpec};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let compiler = Compiler::default();
//!     let now_ms = chrono::Utc::now().timestamp_millis();
//!     for ast in compiler.compile(&QuerySpec::new("cpu:(avg(usage)) [1h::5m] BY host"), now_ms)? {
//!         println!("{} => {}", ast.namespace, ast.query_text());
//!     }
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod backend;
pub mod config;
pub mod engine;
pub mod query;
pub mod warmup;

// Re-export top-level types for convenience
pub use query::{AstResult, Compiler, DqlError, DqlResult, Namespace, QuerySpec, Stmt};

pub use engine::{DebugRequest, Executor, PoolConfig, QueryRequest, QueryResult, Row, WorkerPool};

pub use backend::{BackendError, Backends};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{Config, ConfigError, LoggingConfig};

pub use warmup::{IndexCache, WarmupConfig};
