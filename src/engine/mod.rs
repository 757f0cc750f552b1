//! DQL Execution Engine
//!
//! Runs resolved statements against the backends and shapes every answer
//! into the uniform [`QueryResult`]:
//!
//! - **Exec**: per-worker executor with its own connection cache
//! - **Normalize**: search responses into tabular rows
//! - **Rewrite**: column renaming, fills and bucket reconciliation
//! - **Lambda / Outer / Func / Delete**: composite statements
//! - **Worker**: supervised pool with main, debug and backup queues

pub mod delete;
pub mod exec;
pub mod func;
pub mod lambda;
pub mod normalize;
pub mod outer;
pub mod result;
pub mod rewrite;
pub mod worker;

pub use exec::{ExecContext, Executor};
pub use result::{QueryResult, Row};
pub use worker::{DebugRequest, ExecutorFactory, PoolConfig, QueryRequest, WorkerPool};
